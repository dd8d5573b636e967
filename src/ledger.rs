// Token Raffle - Wallet ledger
//
// Balances live in one mutex per (user, token). The index lock is only
// written when a key is first seen, so traffic on different keys never
// contends. Each mutation is journaled while the key's mutex is held.
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::{Mutex, RwLock};

use crate::error::RaffleError;
use crate::journal::{persist, Journal, Record};
use crate::state::{JoinTag, TokenCatalog, TokenId, UserId};
use crate::utils::lock_with_retry;

type WalletKey = (UserId, TokenId);

pub struct WalletLedger {
    slots: RwLock<HashMap<WalletKey, Arc<Mutex<u64>>>>,
    catalog: Arc<TokenCatalog>,
    journal: Arc<dyn Journal>,
    lock_timeout: Duration,
    retry_attempts: u32,
}

impl WalletLedger {
    pub fn new(
        catalog: Arc<TokenCatalog>,
        journal: Arc<dyn Journal>,
        lock_timeout: Duration,
        retry_attempts: u32,
    ) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            catalog,
            journal,
            lock_timeout,
            retry_attempts,
        }
    }

    /// Add `qty` units. Called by the payment webhook once a purchase settles.
    pub fn credit(&self, user_id: UserId, token_id: &str, qty: u64) -> Result<u64, RaffleError> {
        self.credit_tagged(user_id, token_id, qty, None)
    }

    /// Atomic check-and-subtract; never partially applies
    pub fn debit(&self, user_id: UserId, token_id: &str, qty: u64) -> Result<u64, RaffleError> {
        self.debit_tagged(user_id, token_id, qty, None)
    }

    pub(crate) fn credit_tagged(
        &self,
        user_id: UserId,
        token_id: &str,
        qty: u64,
        compensates: Option<JoinTag>,
    ) -> Result<u64, RaffleError> {
        self.check_args(token_id, qty)?;
        let slot = self.slot_or_insert(user_id, token_id);
        let mut balance = self.lock_slot(&slot, user_id, token_id)?;
        let updated = balance
            .checked_add(qty)
            .ok_or_else(|| RaffleError::validation("balance would overflow"))?;

        persist(
            self.journal.as_ref(),
            &Record::Credit {
                user_id,
                token_id: token_id.to_string(),
                qty,
                compensates,
            },
        )?;
        *balance = updated;
        debug!("Credited {} x {} to user {} (now {})", qty, token_id, user_id, updated);
        Ok(updated)
    }

    pub(crate) fn debit_tagged(
        &self,
        user_id: UserId,
        token_id: &str,
        qty: u64,
        join: Option<JoinTag>,
    ) -> Result<u64, RaffleError> {
        self.check_args(token_id, qty)?;
        let insufficient = |available| RaffleError::InsufficientBalance {
            user_id,
            token_id: token_id.to_string(),
            requested: qty,
            available,
        };
        let slot = self.slot(user_id, token_id).ok_or_else(|| insufficient(0))?;
        let mut balance = self.lock_slot(&slot, user_id, token_id)?;
        if *balance < qty {
            warn!(
                "Insufficient funds: user {} needed {} x {}, had {}",
                user_id,
                qty,
                token_id,
                *balance
            );
            return Err(insufficient(*balance));
        }

        persist(
            self.journal.as_ref(),
            &Record::Debit {
                user_id,
                token_id: token_id.to_string(),
                qty,
                join,
            },
        )?;
        *balance -= qty;
        debug!("Debited {} x {} from user {} (now {})", qty, token_id, user_id, *balance);
        Ok(*balance)
    }

    /// Point-in-time snapshot of the user's non-zero holdings
    pub fn balance(&self, user_id: UserId) -> BTreeMap<TokenId, u64> {
        let slots: Vec<(TokenId, Arc<Mutex<u64>>)> = self
            .slots
            .read()
            .iter()
            .filter(|((owner, _), _)| *owner == user_id)
            .map(|((_, token_id), slot)| (token_id.clone(), Arc::clone(slot)))
            .collect();

        slots
            .into_iter()
            .map(|(token_id, slot)| (token_id, *slot.lock()))
            .filter(|(_, qty)| *qty > 0)
            .collect()
    }

    /// Point read of one token
    pub fn quantity(&self, user_id: UserId, token_id: &str) -> u64 {
        self.slot(user_id, token_id)
            .map(|slot| *slot.lock())
            .unwrap_or(0)
    }

    /// Replay a journaled credit or debit without re-journaling it
    pub(crate) fn apply(&self, record: &Record) -> Result<(), RaffleError> {
        match record {
            Record::Credit {
                user_id,
                token_id,
                qty,
                ..
            } => {
                let slot = self.slot_or_insert(*user_id, token_id);
                let mut balance = slot.lock();
                *balance = balance
                    .checked_add(*qty)
                    .ok_or_else(|| RaffleError::validation("replayed balance overflows"))?;
            }
            Record::Debit {
                user_id,
                token_id,
                qty,
                ..
            } => {
                let slot = self.slot_or_insert(*user_id, token_id);
                let mut balance = slot.lock();
                *balance = balance.checked_sub(*qty).ok_or_else(|| {
                    RaffleError::validation(format!(
                        "replayed debit of {qty} x {token_id} for user {user_id} exceeds balance"
                    ))
                })?;
            }
            _ => {}
        }
        Ok(())
    }

    fn check_args(&self, token_id: &str, qty: u64) -> Result<(), RaffleError> {
        if qty == 0 {
            return Err(RaffleError::validation("quantity must be positive"));
        }
        if !self.catalog.contains(token_id) {
            return Err(RaffleError::NotFound(format!("token {token_id}")));
        }
        Ok(())
    }

    fn slot(&self, user_id: UserId, token_id: &str) -> Option<Arc<Mutex<u64>>> {
        self.slots
            .read()
            .get(&(user_id, token_id.to_string()))
            .cloned()
    }

    fn slot_or_insert(&self, user_id: UserId, token_id: &str) -> Arc<Mutex<u64>> {
        if let Some(slot) = self.slot(user_id, token_id) {
            return slot;
        }
        let mut slots = self.slots.write();
        Arc::clone(
            slots
                .entry((user_id, token_id.to_string()))
                .or_insert_with(|| Arc::new(Mutex::new(0))),
        )
    }

    fn lock_slot<'a>(
        &self,
        slot: &'a Mutex<u64>,
        user_id: UserId,
        token_id: &str,
    ) -> Result<parking_lot::MutexGuard<'a, u64>, RaffleError> {
        lock_with_retry(
            slot,
            self.lock_timeout,
            self.retry_attempts,
            &format!("wallet {user_id}/{token_id}"),
        )
    }
}
