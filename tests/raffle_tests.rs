use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokenraffle::{
    DrawOutcome, EngineConfig, JoinReceipt, JoinRequest, ManualClock, MemoryJournal, NewRaffle,
    Processor, RaffleError, RaffleId, RaffleInstruction, RaffleStatus, Response, SeedSource,
    TokenCatalog, UserId,
};

const T0: i64 = 1_700_000_000;
const HOUR: i64 = 3600;

/// Hands out the same seed every time and counts how often it was asked
struct FixedSeeds {
    seed: [u8; 32],
    calls: AtomicUsize,
}

impl SeedSource for FixedSeeds {
    fn generate(&self) -> [u8; 32] {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seed
    }
}

// Setup an engine with an in-memory journal, a fixed seed and a manual clock
fn setup() -> (Arc<Processor>, Arc<ManualClock>, Arc<FixedSeeds>) {
    let clock = Arc::new(ManualClock::new(T0));
    let seeds = Arc::new(FixedSeeds {
        seed: [3u8; 32],
        calls: AtomicUsize::new(0),
    });
    let processor = Processor::open(
        EngineConfig::default(),
        TokenCatalog::standard(),
        Arc::new(MemoryJournal::new()),
        seeds.clone(),
        clock.clone(),
    )
    .unwrap();
    (Arc::new(processor), clock, seeds)
}

fn create_raffle(processor: &Processor, entry_cost: u64, max_entries: Option<u64>) -> RaffleId {
    processor
        .create_raffle(NewRaffle {
            title: "Console".to_string(),
            entry_cost,
            max_entries,
            opens_at: None,
            draw_at: T0 + HOUR,
        })
        .unwrap()
        .raffle_id
}

fn join(
    processor: &Processor,
    raffle_id: RaffleId,
    user_id: UserId,
    tokens: &[(&str, u64)],
    entry_count: u64,
    key: &str,
) -> Result<JoinReceipt, RaffleError> {
    processor.join_raffle(&JoinRequest {
        raffle_id,
        user_id,
        tokens: tokens
            .iter()
            .map(|(token, qty)| (token.to_string(), *qty))
            .collect(),
        entry_count,
        idempotency_key: key.to_string(),
    })
}

fn sequences(receipt: &JoinReceipt) -> Vec<u64> {
    receipt.entries.iter().map(|e| e.sequence).collect()
}

#[tokio::test]
async fn test_two_sequential_joins_spend_wallet() {
    let (processor, _, _) = setup();
    let raffle_id = create_raffle(&processor, 5, None);
    processor.credit(1, "comum", 10).unwrap();

    let first = join(&processor, raffle_id, 1, &[("comum", 5)], 1, "k1").unwrap();
    let second = join(&processor, raffle_id, 1, &[("comum", 5)], 1, "k2").unwrap();

    assert_eq!(sequences(&first), vec![0]);
    assert_eq!(sequences(&second), vec![1]);
    assert!(processor.wallet(1).is_empty());
    assert_eq!(processor.raffle_state(raffle_id).unwrap().entry_count, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_joins_on_last_token() {
    let (processor, _, _) = setup();
    let raffle_id = create_raffle(&processor, 1, None);
    processor.credit(1, "comum", 1).unwrap();

    let handles: Vec<_> = ["a", "b"]
        .into_iter()
        .map(|key| {
            let processor = Arc::clone(&processor);
            tokio::task::spawn_blocking(move || {
                join(&processor, raffle_id, 1, &[("comum", 1)], 1, key)
            })
        })
        .collect();

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(RaffleError::InsufficientBalance { .. }))));
    assert_eq!(processor.wallet(1).get("comum"), None);
    assert_eq!(processor.participants(raffle_id).unwrap().len(), 1);
}

#[tokio::test]
async fn test_second_draw_is_already_drawn() {
    let (processor, _, _) = setup();
    let raffle_id = create_raffle(&processor, 1, None);
    for user_id in 1..=3 {
        processor.credit(user_id, "comum", 1).unwrap();
        join(&processor, raffle_id, user_id, &[("comum", 1)], 1, "only").unwrap();
    }

    let first = processor.draw_raffle(raffle_id).unwrap();
    let DrawOutcome::Winner { winner_user_id, .. } = first else {
        panic!("expected a winner, got {first:?}");
    };

    let second = processor.draw_raffle(raffle_id);
    assert_eq!(second, Err(RaffleError::AlreadyDrawn(raffle_id)));

    let state = processor.raffle_state(raffle_id).unwrap();
    assert_eq!(state.status, RaffleStatus::Closed);
    assert_eq!(state.winner, Some(winner_user_id));
    assert_eq!(
        processor.draw_result(raffle_id).unwrap().unwrap().winner,
        Some(winner_user_id)
    );
}

#[tokio::test]
async fn test_replayed_join_returns_original_entries() {
    let (processor, _, _) = setup();
    let raffle_id = create_raffle(&processor, 5, None);
    processor.credit(7, "raro", 3).unwrap();

    let original = join(&processor, raffle_id, 7, &[("raro", 2)], 2, "retry-me").unwrap();
    let replay = join(&processor, raffle_id, 7, &[("raro", 2)], 2, "retry-me").unwrap();

    assert_eq!(original, replay);
    assert_eq!(sequences(&original), vec![0, 1]);
    assert_eq!(processor.wallet(7).get("raro"), Some(&1));
    assert_eq!(processor.quantity(7, "raro"), 1);
    assert_eq!(processor.participants(raffle_id).unwrap().len(), 2);
}

#[tokio::test]
async fn test_replay_after_close_still_returns_receipt() {
    let (processor, _, _) = setup();
    let raffle_id = create_raffle(&processor, 1, None);
    processor.credit(7, "comum", 1).unwrap();
    let original = join(&processor, raffle_id, 7, &[("comum", 1)], 1, "late-retry").unwrap();
    processor.draw_raffle(raffle_id).unwrap();

    let replay = join(&processor, raffle_id, 7, &[("comum", 1)], 1, "late-retry").unwrap();
    assert_eq!(original, replay);
}

#[tokio::test]
async fn test_payment_must_match_entry_cost() {
    let (processor, _, _) = setup();
    let raffle_id = create_raffle(&processor, 5, None);
    processor.credit(1, "comum", 20).unwrap();

    let under = join(&processor, raffle_id, 1, &[("comum", 4)], 1, "under");
    assert_eq!(
        under,
        Err(RaffleError::InsufficientPayment {
            offered: 4,
            required: 5
        })
    );
    let over = join(&processor, raffle_id, 1, &[("comum", 11)], 2, "over");
    assert!(matches!(over, Err(RaffleError::InsufficientPayment { .. })));
    assert_eq!(processor.wallet(1).get("comum"), Some(&20));
}

#[tokio::test]
async fn test_failed_multi_token_debit_is_compensated() {
    let (processor, _, _) = setup();
    let raffle_id = create_raffle(&processor, 10, None);
    processor.credit(1, "comum", 5).unwrap();

    // 5 comum + 1 raro = 10, but the wallet holds no raro
    let result = join(&processor, raffle_id, 1, &[("comum", 5), ("raro", 1)], 1, "k");
    assert!(matches!(
        result,
        Err(RaffleError::InsufficientBalance { ref token_id, .. }) if token_id == "raro"
    ));
    assert_eq!(processor.wallet(1), BTreeMap::from([("comum".to_string(), 5)]));
    assert!(processor.participants(raffle_id).unwrap().is_empty());
}

#[tokio::test]
async fn test_no_entries_after_draw_time_or_fence() {
    let (processor, clock, _) = setup();
    let fenced = create_raffle(&processor, 1, None);
    let expired = create_raffle(&processor, 1, None);
    processor.credit(1, "comum", 2).unwrap();

    processor.draw_raffle(fenced).unwrap();
    assert_eq!(
        join(&processor, fenced, 1, &[("comum", 1)], 1, "after-fence"),
        Err(RaffleError::RaffleNotActive(fenced))
    );

    clock.advance(HOUR);
    assert_eq!(
        join(&processor, expired, 1, &[("comum", 1)], 1, "after-close"),
        Err(RaffleError::RaffleNotActive(expired))
    );
    assert_eq!(processor.wallet(1).get("comum"), Some(&2));
}

#[tokio::test]
async fn test_draw_without_entries_has_no_winner() {
    let (processor, _, seeds) = setup();
    let raffle_id = create_raffle(&processor, 1, None);

    let outcome = processor.draw_raffle(raffle_id).unwrap();
    assert_eq!(outcome, DrawOutcome::NoWinner { no_winner: true });
    assert_eq!(serde_json::to_value(&outcome).unwrap(), serde_json::json!({ "noWinner": true }));

    let state = processor.raffle_state(raffle_id).unwrap();
    assert_eq!(state.status, RaffleStatus::Closed);
    assert_eq!(state.winner, None);
    assert_eq!(seeds.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_entry_cap_rejects_and_refunds() {
    let (processor, _, _) = setup();
    let raffle_id = create_raffle(&processor, 1, Some(3));
    processor.credit(1, "comum", 5).unwrap();

    join(&processor, raffle_id, 1, &[("comum", 2)], 2, "first").unwrap();
    let result = join(&processor, raffle_id, 1, &[("comum", 2)], 2, "second");
    assert!(matches!(result, Err(RaffleError::Validation(_))));
    assert_eq!(processor.wallet(1).get("comum"), Some(&3));

    let last = join(&processor, raffle_id, 1, &[("comum", 1)], 1, "third").unwrap();
    assert_eq!(sequences(&last), vec![2]);
}

#[tokio::test]
async fn test_scheduled_raffle_opens_on_activation() {
    let (processor, _, _) = setup();
    let raffle = processor
        .create_raffle(NewRaffle {
            title: "Coming soon".to_string(),
            entry_cost: 1,
            max_entries: None,
            opens_at: Some(T0 + 60),
            draw_at: T0 + HOUR,
        })
        .unwrap();
    assert_eq!(raffle.status, RaffleStatus::Scheduled);
    processor.credit(1, "comum", 1).unwrap();

    assert_eq!(
        join(&processor, raffle.raffle_id, 1, &[("comum", 1)], 1, "early"),
        Err(RaffleError::RaffleNotActive(raffle.raffle_id))
    );
    assert_eq!(
        processor.draw_raffle(raffle.raffle_id),
        Err(RaffleError::RaffleNotActive(raffle.raffle_id))
    );

    processor.activate_raffle(raffle.raffle_id).unwrap();
    join(&processor, raffle.raffle_id, 1, &[("comum", 1)], 1, "early").unwrap();
    assert_eq!(processor.list_active().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_joins_get_contiguous_sequences() {
    let (processor, _, _) = setup();
    let raffle_id = create_raffle(&processor, 1, None);
    let users: Vec<UserId> = (1..=8).collect();
    for user_id in &users {
        processor.credit(*user_id, "comum", 10).unwrap();
    }

    let handles: Vec<_> = users
        .iter()
        .map(|user_id| {
            let processor = Arc::clone(&processor);
            let user_id = *user_id;
            tokio::task::spawn_blocking(move || {
                (0..10)
                    .map(|i| {
                        join(&processor, raffle_id, user_id, &[("comum", 1)], 1, &format!("{user_id}-{i}"))
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    for handle in handles {
        for result in handle.await.unwrap() {
            result.unwrap();
        }
    }

    let entries = processor.participants(raffle_id).unwrap();
    let seen: HashSet<u64> = entries.iter().map(|e| e.sequence).collect();
    assert_eq!(entries.len(), 80);
    assert_eq!(seen, (0..80).collect::<HashSet<u64>>());
    for (index, entry) in entries.iter().enumerate() {
        assert_eq!(entry.sequence, index as u64);
    }
    for user_id in &users {
        assert!(processor.wallet(*user_id).is_empty());
        assert_eq!(processor.user_raffles(*user_id)[0].entries, 10);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_debits_never_overdraw() {
    let (processor, _, _) = setup();
    processor.credit(1, "epico", 50).unwrap();

    let handles: Vec<_> = (0..100)
        .map(|_| {
            let processor = Arc::clone(&processor);
            tokio::task::spawn_blocking(move || processor.debit(1, "epico", 1))
        })
        .collect();
    let mut succeeded = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(RaffleError::InsufficientBalance { available, .. }) => assert_eq!(available, 0),
            Err(err) => panic!("unexpected error {err}"),
        }
    }
    assert_eq!(succeeded, 50);
    assert!(processor.wallet(1).is_empty());
    assert_eq!(processor.quantity(1, "epico"), 0);
}

#[tokio::test]
async fn test_draw_is_reproducible_and_audited() {
    let (first, _, _) = setup();
    let (second, _, _) = setup();
    for processor in [&first, &second] {
        let raffle_id = create_raffle(processor, 1, None);
        for user_id in [11, 22, 33, 44, 55] {
            processor.credit(user_id, "comum", 1).unwrap();
            join(processor, raffle_id, user_id, &[("comum", 1)], 1, "k").unwrap();
        }
        processor.draw_raffle(raffle_id).unwrap();
        assert!(processor.audit_draw(raffle_id).unwrap());
    }

    let a = first.draw_result(1).unwrap().unwrap();
    let b = second.draw_result(1).unwrap().unwrap();
    assert_eq!(a.winner, b.winner);
    assert_eq!(a.winning_sequence, b.winning_sequence);
    // 0x0303030303030303 mod 5
    assert_eq!(a.winning_sequence, Some(0x0303_0303_0303_0303u64 % 5));
}

#[tokio::test]
async fn test_draw_result_is_broadcast() {
    let (processor, _, _) = setup();
    let mut events = processor.subscribe();
    let raffle_id = create_raffle(&processor, 1, None);
    processor.credit(9, "comum", 1).unwrap();
    join(&processor, raffle_id, 9, &[("comum", 1)], 1, "k").unwrap();

    processor.draw_raffle(raffle_id).unwrap();
    let event = events.recv().await.unwrap();
    assert_eq!(event.raffle_id, raffle_id);
    assert_eq!(event.winner, Some(9));
}

#[tokio::test]
async fn test_packed_instructions_drive_the_engine() {
    let (processor, _, _) = setup();
    let raffle_id = create_raffle(&processor, 5, None);

    let credit = RaffleInstruction::Credit {
        user_id: 4,
        token_id: "raro".to_string(),
        qty: 1,
    };
    let response = processor.process_packed(&credit.pack().unwrap()).unwrap();
    assert_eq!(
        borsh::from_slice::<Response>(&response).unwrap(),
        Response::Credited { balance: 1 }
    );

    let joined = processor
        .process(RaffleInstruction::JoinRaffle(JoinRequest {
            raffle_id,
            user_id: 4,
            tokens: BTreeMap::from([("raro".to_string(), 1)]),
            entry_count: 1,
            idempotency_key: "checkout-1".to_string(),
        }))
        .unwrap();
    assert!(matches!(joined, Response::Joined(ref r) if r.entries.len() == 1));

    let drawn = processor
        .process(RaffleInstruction::DrawRaffle { raffle_id })
        .unwrap();
    let Response::Drawn(outcome) = drawn else {
        panic!("expected a draw outcome");
    };
    let json = serde_json::to_value(&outcome).unwrap();
    assert_eq!(json["winnerUserId"], 4);
    assert_eq!(json["seed"].as_str().unwrap().len(), 64);

    assert!(matches!(
        RaffleInstruction::unpack(&[0xff, 0x01]),
        Err(RaffleError::Validation(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_parallel_draws_select_one_winner() {
    let (processor, _, seeds) = setup();
    let raffle_id = create_raffle(&processor, 1, None);
    for user_id in 1..=6 {
        processor.credit(user_id, "comum", 1).unwrap();
        join(&processor, raffle_id, user_id, &[("comum", 1)], 1, "k").unwrap();
    }

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let processor = Arc::clone(&processor);
            tokio::task::spawn_blocking(move || processor.draw_raffle(raffle_id))
        })
        .collect();
    let mut winners = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(outcome) => winners.push(outcome),
            Err(err) => assert_eq!(err, RaffleError::AlreadyDrawn(raffle_id)),
        }
    }

    assert_eq!(winners.len(), 1);
    assert_eq!(seeds.calls.load(Ordering::SeqCst), 1);
    let DrawOutcome::Winner { winner_user_id, .. } = &winners[0] else {
        panic!("expected a winner");
    };
    assert_eq!(
        processor.raffle_state(raffle_id).unwrap().winner,
        Some(*winner_user_id)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_joins_racing_the_fence() {
    let (processor, _, _) = setup();
    let raffle_id = create_raffle(&processor, 1, None);
    let users: Vec<UserId> = (1..=40).collect();
    for user_id in &users {
        processor.credit(*user_id, "comum", 1).unwrap();
    }

    let joins: Vec<_> = users
        .iter()
        .map(|user_id| {
            let processor = Arc::clone(&processor);
            let user_id = *user_id;
            tokio::task::spawn_blocking(move || {
                (user_id, join(&processor, raffle_id, user_id, &[("comum", 1)], 1, "race"))
            })
        })
        .collect();
    let draw = {
        let processor = Arc::clone(&processor);
        tokio::task::spawn_blocking(move || processor.draw_raffle(raffle_id))
    };

    draw.await.unwrap().unwrap();
    let frozen = processor.draw_result(raffle_id).unwrap().unwrap().entry_count;
    let mut accepted = 0;
    for handle in joins {
        let (user_id, result) = handle.await.unwrap();
        match result {
            Ok(receipt) => {
                accepted += 1;
                assert!(receipt.entries.iter().all(|e| e.sequence < frozen));
                assert!(processor.wallet(user_id).is_empty());
            }
            Err(err) => {
                assert_eq!(err, RaffleError::RaffleNotActive(raffle_id));
                assert_eq!(processor.wallet(user_id).get("comum"), Some(&1));
            }
        }
    }
    assert_eq!(accepted, frozen);
    assert_eq!(processor.participants(raffle_id).unwrap().len() as u64, frozen);
}
