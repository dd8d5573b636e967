// Token Raffle - Errors
use std::path::PathBuf;

use thiserror::Error;

use crate::state::{RaffleId, TokenId, UserId};

/// Errors that may be returned by the raffle engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RaffleError {
    /// Malformed input rejected at the boundary
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The wallet does not hold enough of a token
    #[error("Insufficient balance of token {token_id} for user {user_id}: requested {requested}, available {available}")]
    InsufficientBalance {
        user_id: UserId,
        token_id: TokenId,
        requested: u64,
        available: u64,
    },

    /// Offered tokens are not worth exactly the price of the requested entries
    #[error("Offered tokens are worth {offered}, entries cost {required}")]
    InsufficientPayment { offered: u64, required: u64 },

    /// Raffle is not accepting entries (or cannot be drawn yet)
    #[error("Raffle {0} is not active")]
    RaffleNotActive(RaffleId),

    /// Raffle already has a draw result
    #[error("Raffle {0} has already been drawn")]
    AlreadyDrawn(RaffleId),

    /// Contention or persistence trouble; outcome unknown, retry with the same idempotency key
    #[error("Could not complete {0}, retry with the same idempotency key")]
    RaceConditionRetry(String),

    /// Unknown raffle, token or wallet
    #[error("{0} not found")]
    NotFound(String),
}

impl RaffleError {
    /// Stable numeric code for the wire
    pub fn code(&self) -> u32 {
        match self {
            RaffleError::Validation(_) => 1,
            RaffleError::InsufficientBalance { .. } => 2,
            RaffleError::InsufficientPayment { .. } => 3,
            RaffleError::RaffleNotActive(_) => 4,
            RaffleError::AlreadyDrawn(_) => 5,
            RaffleError::RaceConditionRetry(_) => 6,
            RaffleError::NotFound(_) => 7,
        }
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        RaffleError::Validation(msg.into())
    }
}

/// Failures of the durable record store. Never returned from the public API.
#[derive(Error, Debug)]
pub enum JournalError {
    #[error("io error on journal {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encode error: {0}")]
    Encode(#[from] std::io::Error),
    #[error("journal record too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("journal unavailable: {0}")]
    Unavailable(String),
}
