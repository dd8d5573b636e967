// Token Raffle - Entry recorder
//
// Turns a wallet debit into raffle entries. The debit and the sequence
// reservation commit together or not at all: a failed reservation re-credits
// every debit before the caller sees the error. A refund that cannot be
// written stays pending on the key and is settled before the key runs again.
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use borsh::{BorshDeserialize, BorshSerialize};
use log::{error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::RaffleError;
use crate::journal::Record;
use crate::ledger::WalletLedger;
use crate::registry::RaffleRegistry;
use crate::state::{Entry, JoinTag, RaffleId, TokenCatalog, TokenId, UnixTimestamp, UserId};
use crate::utils::lock_with_retry;

#[derive(BorshSerialize, BorshDeserialize, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub raffle_id: RaffleId,
    pub user_id: UserId,
    /// Tokens offered as payment, by token id
    pub tokens: BTreeMap<TokenId, u64>,
    pub entry_count: u64,
    pub idempotency_key: String,
}

impl JoinRequest {
    fn tag(&self) -> JoinTag {
        JoinTag {
            raffle_id: self.raffle_id,
            user_id: self.user_id,
            idempotency_key: self.idempotency_key.clone(),
        }
    }

    fn validate(&self) -> Result<(), RaffleError> {
        if self.idempotency_key.trim().is_empty() {
            return Err(RaffleError::validation("idempotency key is required"));
        }
        if self.entry_count == 0 {
            return Err(RaffleError::validation("entry count must be greater than zero"));
        }
        if self.tokens.is_empty() {
            return Err(RaffleError::validation("no tokens offered"));
        }
        Ok(())
    }
}

#[derive(BorshSerialize, BorshDeserialize, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JoinReceipt {
    pub raffle_id: RaffleId,
    pub user_id: UserId,
    pub entries: Vec<Entry>,
}

/// Where a join under one idempotency key stands
#[derive(Debug, Default)]
enum JoinState {
    #[default]
    Fresh,
    Completed(JoinReceipt),
    /// Debits a failed attempt could not give back; settled before the key runs again
    RefundPending(Vec<(TokenId, u64)>),
}

type JoinCell = Arc<Mutex<JoinState>>;

/// A failed attempt and whatever it still owes the wallet
struct JoinFailure {
    error: RaffleError,
    owed: Vec<(TokenId, u64)>,
}

impl From<RaffleError> for JoinFailure {
    fn from(error: RaffleError) -> Self {
        Self {
            error,
            owed: Vec::new(),
        }
    }
}

pub struct EntryRecorder {
    ledger: Arc<WalletLedger>,
    registry: Arc<RaffleRegistry>,
    catalog: Arc<TokenCatalog>,
    /// Join state by (raffle, user, idempotency key)
    joins: RwLock<HashMap<JoinTag, JoinCell>>,
    lock_timeout: Duration,
    retry_attempts: u32,
}

impl EntryRecorder {
    pub fn new(
        ledger: Arc<WalletLedger>,
        registry: Arc<RaffleRegistry>,
        catalog: Arc<TokenCatalog>,
        lock_timeout: Duration,
        retry_attempts: u32,
    ) -> Self {
        Self {
            ledger,
            registry,
            catalog,
            joins: RwLock::new(HashMap::new()),
            lock_timeout,
            retry_attempts,
        }
    }

    pub fn join_raffle(&self, request: &JoinRequest, now: UnixTimestamp) -> Result<JoinReceipt, RaffleError> {
        request.validate()?;
        let tag = request.tag();

        // Same-key calls queue here; only the first one executes
        let cell = self.join_cell(&tag);
        let mut state = lock_with_retry(
            &cell,
            self.lock_timeout,
            self.retry_attempts,
            &format!("join {}", tag.idempotency_key),
        )?;
        let owed = match &*state {
            JoinState::Completed(receipt) => {
                info!(
                    "Replaying join {} for user {} in raffle {}",
                    tag.idempotency_key, tag.user_id, tag.raffle_id
                );
                return Ok(receipt.clone());
            }
            JoinState::RefundPending(owed) => owed.clone(),
            JoinState::Fresh => Vec::new(),
        };
        if !owed.is_empty() {
            let still_owed = self.compensate(&tag, &owed);
            if !still_owed.is_empty() {
                *state = JoinState::RefundPending(still_owed);
                return Err(RaffleError::RaceConditionRetry(format!(
                    "refunding join {}",
                    tag.idempotency_key
                )));
            }
            info!(
                "Settled pending refund of join {} for user {}",
                tag.idempotency_key, tag.user_id
            );
            *state = JoinState::Fresh;
        }

        match self.execute(request, &tag, now) {
            Ok(receipt) => {
                *state = JoinState::Completed(receipt.clone());
                Ok(receipt)
            }
            Err(failure) if failure.owed.is_empty() => {
                drop(state);
                self.release_cell(&tag, &cell);
                Err(failure.error)
            }
            Err(failure) => {
                warn!(
                    "Join {} for user {} failed ({}) with refunds outstanding",
                    tag.idempotency_key, tag.user_id, failure.error
                );
                *state = JoinState::RefundPending(failure.owed);
                Err(RaffleError::RaceConditionRetry(format!(
                    "compensating join {}",
                    tag.idempotency_key
                )))
            }
        }
    }

    fn execute(
        &self,
        request: &JoinRequest,
        tag: &JoinTag,
        now: UnixTimestamp,
    ) -> Result<JoinReceipt, JoinFailure> {
        let raffle = self.registry.ensure_open(request.raffle_id, now)?;
        let required = raffle
            .entry_cost
            .checked_mul(request.entry_count)
            .ok_or_else(|| RaffleError::validation("entry count too large"))?;
        let offered = self.catalog.value_of(&request.tokens)?;
        if offered != required {
            return Err(RaffleError::InsufficientPayment { offered, required }.into());
        }

        let debited = self.debit_all(tag, &request.tokens)?;
        let entries = match self
            .registry
            .reserve_entries(tag, request.entry_count, &request.tokens, now)
        {
            Ok(entries) => entries,
            Err(error) => {
                warn!(
                    "Reservation failed for join {} in raffle {}: {}; compensating",
                    tag.idempotency_key, tag.raffle_id, error
                );
                return Err(JoinFailure {
                    owed: self.compensate(tag, &debited),
                    error,
                });
            }
        };

        info!(
            "User {} exchanged tokens worth {} for {} entries in raffle {} (sequences {}..={})",
            tag.user_id,
            offered,
            entries.len(),
            tag.raffle_id,
            entries.first().map(|e| e.sequence).unwrap_or_default(),
            entries.last().map(|e| e.sequence).unwrap_or_default()
        );
        Ok(JoinReceipt {
            raffle_id: request.raffle_id,
            user_id: request.user_id,
            entries,
        })
    }

    /// Debit every offered token or none of them
    fn debit_all(
        &self,
        tag: &JoinTag,
        tokens: &BTreeMap<TokenId, u64>,
    ) -> Result<Vec<(TokenId, u64)>, JoinFailure> {
        let mut debited = Vec::with_capacity(tokens.len());
        for (token_id, qty) in tokens {
            match self
                .ledger
                .debit_tagged(tag.user_id, token_id, *qty, Some(tag.clone()))
            {
                Ok(_) => debited.push((token_id.clone(), *qty)),
                Err(error) => {
                    return Err(JoinFailure {
                        owed: self.compensate(tag, &debited),
                        error,
                    })
                }
            }
        }
        Ok(debited)
    }

    /// Re-credit debits of an attempt that will not complete. Returns what
    /// could not be refunded.
    fn compensate(&self, tag: &JoinTag, debited: &[(TokenId, u64)]) -> Vec<(TokenId, u64)> {
        let mut owed = Vec::new();
        for (token_id, qty) in debited {
            let mut refunded = false;
            for attempt in 1..=self.retry_attempts.max(1) {
                match self
                    .ledger
                    .credit_tagged(tag.user_id, token_id, *qty, Some(tag.clone()))
                {
                    Ok(_) => {
                        refunded = true;
                        break;
                    }
                    Err(err) => warn!(
                        "Compensation credit attempt {} for join {} failed: {}",
                        attempt, tag.idempotency_key, err
                    ),
                }
            }
            if !refunded {
                error!(
                    "Could not compensate {} x {} for user {} (join {})",
                    qty, token_id, tag.user_id, tag.idempotency_key
                );
                owed.push((token_id.clone(), *qty));
            }
        }
        owed
    }

    /// Rebuild the receipt cache from a journaled reservation
    pub(crate) fn apply(&self, record: &Record) {
        if let Record::EntriesReserved {
            tag,
            first_sequence,
            count,
            ..
        } = record
        {
            let entries = (*first_sequence..first_sequence + count)
                .map(|sequence| Entry {
                    raffle_id: tag.raffle_id,
                    user_id: tag.user_id,
                    sequence,
                })
                .collect();
            let receipt = JoinReceipt {
                raffle_id: tag.raffle_id,
                user_id: tag.user_id,
                entries,
            };
            *self.join_cell(tag).lock() = JoinState::Completed(receipt);
        }
    }

    /// Re-credit join debits that no refund or reservation accounts for
    /// (crash mid-join, or a refund still pending at shutdown)
    pub(crate) fn reconcile(&self, records: &[Record]) -> Result<usize, RaffleError> {
        let orphans = orphaned_debits(records);
        for (tag, token_id, qty) in &orphans {
            warn!(
                "Join {} for user {} in raffle {} left {} x {} unaccounted; re-crediting",
                tag.idempotency_key, tag.user_id, tag.raffle_id, qty, token_id
            );
            self.ledger
                .credit_tagged(tag.user_id, token_id, *qty, Some(tag.clone()))?;
        }
        Ok(orphans.len())
    }

    fn join_cell(&self, tag: &JoinTag) -> JoinCell {
        if let Some(cell) = self.joins.read().get(tag) {
            return Arc::clone(cell);
        }
        Arc::clone(self.joins.write().entry(tag.clone()).or_default())
    }

    /// Forget a key whose attempt left nothing behind, unless another caller
    /// is queued on it. Clones are only taken under the map lock.
    fn release_cell(&self, tag: &JoinTag, cell: &JoinCell) {
        let mut joins = self.joins.write();
        let idle = joins
            .get(tag)
            .map_or(false, |current| Arc::ptr_eq(current, cell) && Arc::strong_count(current) == 2);
        if idle {
            joins.remove(tag);
        }
    }
}

/// Per join and token: debits not matched by a refund or by the payment of
/// the attempt that reserved entries
fn orphaned_debits(records: &[Record]) -> Vec<(JoinTag, TokenId, u64)> {
    let mut net: BTreeMap<(JoinTag, TokenId), i128> = BTreeMap::new();
    for record in records {
        match record {
            Record::Debit {
                token_id,
                qty,
                join: Some(tag),
                ..
            } => *net.entry((tag.clone(), token_id.clone())).or_default() += *qty as i128,
            Record::Credit {
                token_id,
                qty,
                compensates: Some(tag),
                ..
            } => *net.entry((tag.clone(), token_id.clone())).or_default() -= *qty as i128,
            Record::EntriesReserved { tag, paid, .. } => {
                for (token_id, qty) in paid {
                    *net.entry((tag.clone(), token_id.clone())).or_default() -= *qty as i128;
                }
            }
            _ => {}
        }
    }
    net.into_iter()
        .filter(|(_, amount)| *amount > 0)
        .map(|((tag, token_id), amount)| (tag, token_id, amount as u64))
        .collect()
}
