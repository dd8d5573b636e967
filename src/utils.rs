// Token Raffle - Utility Functions
use std::fmt::Write;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use log::{debug, warn};
use parking_lot::{Mutex, MutexGuard};

use crate::error::RaffleError;
use crate::state::{Seed, UnixTimestamp};

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> UnixTimestamp;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> UnixTimestamp {
        chrono::Utc::now().timestamp()
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: UnixTimestamp) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: UnixTimestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: i64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> UnixTimestamp {
        self.now.load(Ordering::SeqCst)
    }
}

/// Bounded lock acquisition. Each attempt waits up to `timeout`; once
/// `attempts` are used up the caller gets `RaceConditionRetry`.
pub fn lock_with_retry<'a, T>(
    lock: &'a Mutex<T>,
    timeout: Duration,
    attempts: u32,
    what: &str,
) -> Result<MutexGuard<'a, T>, RaffleError> {
    for attempt in 1..=attempts.max(1) {
        if let Some(guard) = lock.try_lock_for(timeout) {
            return Ok(guard);
        }
        debug!("Lock contention on {} (attempt {})", what, attempt);
    }
    warn!("Giving up on {} after {} attempts", what, attempts.max(1));
    Err(RaffleError::RaceConditionRetry(what.to_string()))
}

/// Hex rendering of a seed for audit output
pub fn seed_to_hex(seed: &Seed) -> String {
    let mut out = String::with_capacity(seed.len() * 2);
    for byte in seed {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}
