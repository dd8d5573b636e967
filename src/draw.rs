// Token Raffle - Draw engine
//
// The winner is a pure function of the recorded seed and the frozen,
// sequence-ordered entry list. The seed is journaled before it is used, so a
// draw interrupted after seeding resumes with the same seed.
use std::sync::Arc;

use arrayref::array_ref;
use log::{debug, info};
use rand::{rngs::OsRng, RngCore};
use tokio::sync::broadcast;

use crate::error::RaffleError;
use crate::registry::RaffleRegistry;
use crate::state::{DrawResult, Entry, RaffleId, Seed, UnixTimestamp};
use crate::utils::{seed_to_hex, Clock};

/// Where draw randomness comes from
pub trait SeedSource: Send + Sync {
    fn generate(&self) -> Seed;
}

/// Operating-system randomness
#[derive(Debug, Default, Clone, Copy)]
pub struct OsSeedSource;

impl SeedSource for OsSeedSource {
    fn generate(&self) -> Seed {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        seed
    }
}

/// Winning index for a seed over `total_entries` entries.
/// The seed's first 8 bytes, little-endian, mod the entry count.
pub fn winning_index(seed: &Seed, total_entries: u64) -> Option<u64> {
    if total_entries == 0 {
        return None;
    }
    let random_value = u64::from_le_bytes(*array_ref![seed, 0, 8]);
    Some(random_value % total_entries)
}

/// Compute the draw result over a frozen entry list
pub fn resolve(
    raffle_id: RaffleId,
    entries: &[Entry],
    seed: &Seed,
    drawn_at: UnixTimestamp,
) -> Result<DrawResult, RaffleError> {
    let total = entries.len() as u64;
    let Some(index) = winning_index(seed, total) else {
        return Ok(DrawResult::no_winner(raffle_id, drawn_at));
    };
    let winning_entry = &entries[index as usize];
    if winning_entry.sequence != index {
        return Err(RaffleError::validation(format!(
            "entry list of raffle {raffle_id} is not sequence ordered at {index}"
        )));
    }
    Ok(DrawResult {
        raffle_id,
        winner: Some(winning_entry.user_id),
        winning_sequence: Some(index),
        seed: Some(*seed),
        entry_count: total,
        drawn_at,
    })
}

pub struct DrawEngine {
    registry: Arc<RaffleRegistry>,
    seeds: Arc<dyn SeedSource>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<DrawResult>,
}

impl DrawEngine {
    pub fn new(
        registry: Arc<RaffleRegistry>,
        seeds: Arc<dyn SeedSource>,
        clock: Arc<dyn Clock>,
        event_capacity: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            registry,
            seeds,
            clock,
            events,
        }
    }

    /// Select and persist the winner of a raffle in Drawing. Safe to re-run
    /// after a crash: a stored seed is reused, never replaced.
    pub fn select_winner(&self, raffle_id: RaffleId) -> Result<DrawResult, RaffleError> {
        let result = self.registry.draw_session(raffle_id, |session| {
            let now = self.clock.now();
            if session.entries().is_empty() {
                info!("Raffle {} has no entries; closing without a winner", raffle_id);
                let result = DrawResult::no_winner(raffle_id, now);
                session.commit(result.clone())?;
                return Ok(result);
            }

            let seed = match session.stored_seed() {
                Some(seed) => {
                    info!("Resuming draw of raffle {} with its recorded seed", raffle_id);
                    seed
                }
                None => {
                    let seed = self.seeds.generate();
                    session.record_seed(seed)?;
                    seed
                }
            };

            let result = resolve(session.raffle_id(), session.entries(), &seed, now)?;
            session.commit(result.clone())?;
            info!(
                "Draw executed for raffle {}: entry {} of {} wins (user {:?}, seed {})",
                raffle_id,
                result.winning_sequence.unwrap_or_default(),
                result.entry_count,
                result.winner,
                seed_to_hex(&seed)
            );
            Ok(result)
        })?;

        if self.events.send(result.clone()).is_err() {
            debug!("No subscribers for draw result of raffle {}", raffle_id);
        }
        Ok(result)
    }

    /// Recompute a committed draw from its seed and entries
    pub fn audit(&self, raffle_id: RaffleId) -> Result<bool, RaffleError> {
        let recorded = self
            .registry
            .draw_result(raffle_id)?
            .ok_or_else(|| RaffleError::NotFound(format!("draw result for raffle {raffle_id}")))?;
        let entries = self.registry.participants(raffle_id)?;
        let Some(seed) = recorded.seed else {
            return Ok(entries.is_empty() && recorded.winner.is_none());
        };
        let replayed = resolve(raffle_id, &entries, &seed, recorded.drawn_at)?;
        Ok(replayed == recorded)
    }

    /// Draw results as they are committed
    pub fn subscribe(&self) -> broadcast::Receiver<DrawResult> {
        self.events.subscribe()
    }
}
