// Token Raffle - Raffle registry
//
// Owns the lifecycle state machine. Each raffle sits behind its own mutex;
// sequence reservation, the Active -> Drawing fence and the draw commit all
// take that mutex, so a join either reserves before the fence or is turned
// away after it.
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use borsh::{BorshDeserialize, BorshSerialize};
use log::info;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::RaffleError;
use crate::journal::{persist, Journal, Record};
use crate::state::{
    DrawResult, Entry, JoinTag, NewRaffle, Raffle, RaffleId, RaffleStatus, Seed, TokenId,
    UnixTimestamp, UserId,
};
use crate::utils::lock_with_retry;

struct RaffleSlot {
    raffle: Raffle,
    /// Index == sequence number
    entries: Vec<Entry>,
    result: Option<DrawResult>,
}

impl RaffleSlot {
    fn set_status(&mut self, status: RaffleStatus, at: UnixTimestamp) {
        self.raffle.status = status;
        if status == RaffleStatus::Drawing {
            self.raffle.drawing_since = Some(at);
        }
    }

    fn push_entries(&mut self, tag: &JoinTag, first_sequence: u64, count: u64) {
        self.entries.extend((first_sequence..first_sequence + count).map(|sequence| Entry {
            raffle_id: tag.raffle_id,
            user_id: tag.user_id,
            sequence,
        }));
        self.raffle.entry_count = self.entries.len() as u64;
    }

    fn close(&mut self, result: DrawResult) {
        self.raffle.status = RaffleStatus::Closed;
        self.raffle.winner = result.winner;
        if result.seed.is_some() {
            self.raffle.draw_seed = result.seed;
        }
        self.result = Some(result);
    }
}

/// Per-user participation summary
#[derive(BorshSerialize, BorshDeserialize, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserRaffle {
    pub raffle_id: RaffleId,
    pub title: String,
    pub status: RaffleStatus,
    pub entries: u64,
    pub value_contributed: u64,
    pub draw_at: UnixTimestamp,
    pub winner: Option<UserId>,
}

pub struct RaffleRegistry {
    raffles: RwLock<BTreeMap<RaffleId, Arc<Mutex<RaffleSlot>>>>,
    /// Sequential raffle ids start at 1
    next_raffle_id: Mutex<RaffleId>,
    journal: Arc<dyn Journal>,
    lock_timeout: Duration,
    retry_attempts: u32,
}

impl RaffleRegistry {
    pub fn new(journal: Arc<dyn Journal>, lock_timeout: Duration, retry_attempts: u32) -> Self {
        Self {
            raffles: RwLock::new(BTreeMap::new()),
            next_raffle_id: Mutex::new(1),
            journal,
            lock_timeout,
            retry_attempts,
        }
    }

    pub fn create_raffle(&self, params: NewRaffle, now: UnixTimestamp) -> Result<Raffle, RaffleError> {
        if params.title.trim().is_empty() {
            return Err(RaffleError::validation("title must not be empty"));
        }
        if params.entry_cost == 0 {
            return Err(RaffleError::validation("entry cost must be greater than zero"));
        }
        if params.max_entries == Some(0) {
            return Err(RaffleError::validation("max entries must be greater than zero"));
        }
        if params.draw_at <= now {
            return Err(RaffleError::validation("draw time must be in the future"));
        }
        if matches!(params.opens_at, Some(opens_at) if opens_at >= params.draw_at) {
            return Err(RaffleError::validation("raffle must open before it is drawn"));
        }

        let mut next_id = self.next_raffle_id.lock();
        let raffle = Raffle::new(*next_id, params, now);
        persist(self.journal.as_ref(), &Record::RaffleCreated(raffle.clone()))?;
        self.insert(raffle.clone());
        *next_id += 1;

        info!(
            "Raffle {} created: status={:?}, entry_cost={}, draw_at={}",
            raffle.id,
            raffle.status,
            raffle.entry_cost,
            raffle.draw_at
        );
        Ok(raffle)
    }

    /// Scheduled -> Active. Already active raffles are left alone.
    pub fn activate(&self, raffle_id: RaffleId, now: UnixTimestamp) -> Result<Raffle, RaffleError> {
        let slot = self.slot(raffle_id)?;
        let mut slot = self.lock(&slot, raffle_id)?;
        match slot.raffle.status {
            RaffleStatus::Scheduled => {
                self.transition(&mut slot, RaffleStatus::Active, now)?;
                Ok(slot.raffle.clone())
            }
            RaffleStatus::Active => Ok(slot.raffle.clone()),
            status => Err(RaffleError::validation(format!(
                "raffle {raffle_id} is {status:?} and cannot be activated"
            ))),
        }
    }

    /// Snapshot of a raffle that is accepting entries at `now`
    pub fn ensure_open(&self, raffle_id: RaffleId, now: UnixTimestamp) -> Result<Raffle, RaffleError> {
        let raffle = self.raffle(raffle_id)?;
        if !raffle.is_open(now) {
            return Err(RaffleError::RaffleNotActive(raffle_id));
        }
        Ok(raffle)
    }

    /// Reserve `count` contiguous sequence numbers and record the entries.
    /// Re-checks the raffle state under the raffle lock; this is the fence.
    pub fn reserve_entries(
        &self,
        tag: &JoinTag,
        count: u64,
        paid: &BTreeMap<TokenId, u64>,
        now: UnixTimestamp,
    ) -> Result<Vec<Entry>, RaffleError> {
        if count == 0 {
            return Err(RaffleError::validation("entry count must be greater than zero"));
        }
        let slot = self.slot(tag.raffle_id)?;
        let mut slot = self.lock(&slot, tag.raffle_id)?;
        if !slot.raffle.is_open(now) {
            return Err(RaffleError::RaffleNotActive(tag.raffle_id));
        }
        if let Some(remaining) = slot.raffle.remaining_entries() {
            if count > remaining {
                return Err(RaffleError::validation(format!(
                    "raffle {} has only {} entries left",
                    tag.raffle_id, remaining
                )));
            }
        }

        let first_sequence = slot.entries.len() as u64;
        persist(
            self.journal.as_ref(),
            &Record::EntriesReserved {
                tag: tag.clone(),
                first_sequence,
                count,
                paid: paid.clone(),
            },
        )?;
        slot.push_entries(tag, first_sequence, count);
        Ok(slot.entries[first_sequence as usize..].to_vec())
    }

    /// Active -> Drawing, freezing the entry list. Returns whether this call
    /// made the transition; a raffle already in Drawing is not an error.
    pub fn begin_drawing(&self, raffle_id: RaffleId, now: UnixTimestamp) -> Result<bool, RaffleError> {
        let slot = self.slot(raffle_id)?;
        let mut slot = self.lock(&slot, raffle_id)?;
        match slot.raffle.status {
            RaffleStatus::Active => {
                self.transition(&mut slot, RaffleStatus::Drawing, now)?;
                info!(
                    "Raffle {} frozen with {} entries",
                    raffle_id,
                    slot.entries.len()
                );
                Ok(true)
            }
            RaffleStatus::Drawing => Ok(false),
            RaffleStatus::Closed => Err(RaffleError::AlreadyDrawn(raffle_id)),
            RaffleStatus::Scheduled => Err(RaffleError::RaffleNotActive(raffle_id)),
        }
    }

    /// Run `f` with exclusive access to a raffle in Drawing
    pub(crate) fn draw_session<R, F>(&self, raffle_id: RaffleId, f: F) -> Result<R, RaffleError>
    where
        F: FnOnce(&mut DrawSession<'_>) -> Result<R, RaffleError>,
    {
        let slot = self.slot(raffle_id)?;
        let mut slot = self.lock(&slot, raffle_id)?;
        if slot.result.is_some() || slot.raffle.status == RaffleStatus::Closed {
            return Err(RaffleError::AlreadyDrawn(raffle_id));
        }
        if slot.raffle.status != RaffleStatus::Drawing {
            return Err(RaffleError::RaffleNotActive(raffle_id));
        }
        let mut session = DrawSession {
            slot: &mut *slot,
            journal: self.journal.as_ref(),
        };
        f(&mut session)
    }

    pub fn raffle(&self, raffle_id: RaffleId) -> Result<Raffle, RaffleError> {
        let slot = self.slot(raffle_id)?;
        let raffle = slot.lock().raffle.clone();
        Ok(raffle)
    }

    pub fn draw_result(&self, raffle_id: RaffleId) -> Result<Option<DrawResult>, RaffleError> {
        let slot = self.slot(raffle_id)?;
        let result = slot.lock().result.clone();
        Ok(result)
    }

    /// Entries in sequence order
    pub fn participants(&self, raffle_id: RaffleId) -> Result<Vec<Entry>, RaffleError> {
        let slot = self.slot(raffle_id)?;
        let entries = slot.lock().entries.clone();
        Ok(entries)
    }

    pub fn list_active(&self) -> Vec<Raffle> {
        self.snapshot()
            .into_iter()
            .filter(|raffle| raffle.status == RaffleStatus::Active)
            .collect()
    }

    pub fn user_raffles(&self, user_id: UserId) -> Vec<UserRaffle> {
        let slots: Vec<Arc<Mutex<RaffleSlot>>> = self.raffles.read().values().cloned().collect();
        slots
            .iter()
            .filter_map(|slot| {
                let slot = slot.lock();
                let entries = slot.entries.iter().filter(|e| e.user_id == user_id).count() as u64;
                (entries > 0).then(|| UserRaffle {
                    raffle_id: slot.raffle.id,
                    title: slot.raffle.title.clone(),
                    status: slot.raffle.status,
                    entries,
                    value_contributed: entries.saturating_mul(slot.raffle.entry_cost),
                    draw_at: slot.raffle.draw_at,
                    winner: slot.raffle.winner,
                })
            })
            .collect()
    }

    /// Scheduled raffles whose opening time has come
    pub fn due_for_opening(&self, now: UnixTimestamp) -> Vec<RaffleId> {
        self.snapshot()
            .into_iter()
            .filter(|r| r.status == RaffleStatus::Scheduled)
            .filter(|r| matches!(r.opens_at, Some(opens_at) if opens_at <= now))
            .map(|r| r.id)
            .collect()
    }

    /// Active raffles past their draw time
    pub fn due_for_draw(&self, now: UnixTimestamp) -> Vec<RaffleId> {
        self.snapshot()
            .into_iter()
            .filter(|r| r.status == RaffleStatus::Active && r.has_ended(now))
            .map(|r| r.id)
            .collect()
    }

    /// Raffles that entered Drawing more than `timeout_secs` ago
    pub fn stuck_drawings(&self, now: UnixTimestamp, timeout_secs: i64) -> Vec<RaffleId> {
        self.snapshot()
            .into_iter()
            .filter(|r| r.status == RaffleStatus::Drawing)
            .filter(|r| matches!(r.drawing_since, Some(since) if now - since >= timeout_secs))
            .map(|r| r.id)
            .collect()
    }

    /// Replay a journaled raffle record without re-journaling it
    pub(crate) fn apply(&self, record: &Record) -> Result<(), RaffleError> {
        match record {
            Record::RaffleCreated(raffle) => {
                let mut next_id = self.next_raffle_id.lock();
                *next_id = (*next_id).max(raffle.id + 1);
                self.insert(raffle.clone());
            }
            Record::StatusChanged {
                raffle_id,
                status,
                at,
            } => {
                let slot = self.slot(*raffle_id)?;
                slot.lock().set_status(*status, *at);
            }
            Record::EntriesReserved {
                tag,
                first_sequence,
                count,
                ..
            } => {
                let slot = self.slot(tag.raffle_id)?;
                let mut slot = slot.lock();
                if *first_sequence != slot.entries.len() as u64 {
                    return Err(RaffleError::validation(format!(
                        "journal gap in raffle {}: expected sequence {}, found {}",
                        tag.raffle_id,
                        slot.entries.len(),
                        first_sequence
                    )));
                }
                slot.push_entries(tag, *first_sequence, *count);
            }
            Record::SeedRecorded { raffle_id, seed } => {
                let slot = self.slot(*raffle_id)?;
                slot.lock().raffle.draw_seed = Some(*seed);
            }
            Record::DrawCommitted(result) => {
                let slot = self.slot(result.raffle_id)?;
                slot.lock().close(result.clone());
            }
            _ => {}
        }
        Ok(())
    }

    fn transition(
        &self,
        slot: &mut RaffleSlot,
        next: RaffleStatus,
        now: UnixTimestamp,
    ) -> Result<(), RaffleError> {
        let current = slot.raffle.status;
        if !current.can_transition_to(next) {
            return Err(RaffleError::validation(format!(
                "raffle {} cannot move from {:?} to {:?}",
                slot.raffle.id, current, next
            )));
        }
        persist(
            self.journal.as_ref(),
            &Record::StatusChanged {
                raffle_id: slot.raffle.id,
                status: next,
                at: now,
            },
        )?;
        slot.set_status(next, now);
        info!("Raffle {} moved {:?} -> {:?}", slot.raffle.id, current, next);
        Ok(())
    }

    fn insert(&self, raffle: Raffle) {
        let slot = RaffleSlot {
            raffle,
            entries: Vec::new(),
            result: None,
        };
        self.raffles
            .write()
            .insert(slot.raffle.id, Arc::new(Mutex::new(slot)));
    }

    fn snapshot(&self) -> Vec<Raffle> {
        let slots: Vec<Arc<Mutex<RaffleSlot>>> = self.raffles.read().values().cloned().collect();
        slots.iter().map(|slot| slot.lock().raffle.clone()).collect()
    }

    fn slot(&self, raffle_id: RaffleId) -> Result<Arc<Mutex<RaffleSlot>>, RaffleError> {
        self.raffles
            .read()
            .get(&raffle_id)
            .cloned()
            .ok_or_else(|| RaffleError::NotFound(format!("raffle {raffle_id}")))
    }

    fn lock<'a>(
        &self,
        slot: &'a Mutex<RaffleSlot>,
        raffle_id: RaffleId,
    ) -> Result<parking_lot::MutexGuard<'a, RaffleSlot>, RaffleError> {
        lock_with_retry(
            slot,
            self.lock_timeout,
            self.retry_attempts,
            &format!("raffle {raffle_id}"),
        )
    }
}

/// Exclusive view of a raffle in Drawing, handed to the draw engine
pub(crate) struct DrawSession<'a> {
    slot: &'a mut RaffleSlot,
    journal: &'a dyn Journal,
}

impl DrawSession<'_> {
    pub fn raffle_id(&self) -> RaffleId {
        self.slot.raffle.id
    }

    /// Frozen entries in sequence order
    pub fn entries(&self) -> &[Entry] {
        &self.slot.entries
    }

    pub fn stored_seed(&self) -> Option<Seed> {
        self.slot.raffle.draw_seed
    }

    /// Persist the seed before it is used. Only ever called once per raffle.
    pub fn record_seed(&mut self, seed: Seed) -> Result<(), RaffleError> {
        if self.slot.raffle.draw_seed.is_some() {
            return Err(RaffleError::validation(format!(
                "raffle {} already has a recorded seed",
                self.slot.raffle.id
            )));
        }
        persist(
            self.journal,
            &Record::SeedRecorded {
                raffle_id: self.slot.raffle.id,
                seed,
            },
        )?;
        self.slot.raffle.draw_seed = Some(seed);
        Ok(())
    }

    /// Persist the result and close the raffle in one journal record
    pub fn commit(&mut self, result: DrawResult) -> Result<(), RaffleError> {
        persist(self.journal, &Record::DrawCommitted(result.clone()))?;
        self.slot.close(result);
        Ok(())
    }
}
