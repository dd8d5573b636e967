// Token Raffle
// Timed prize raffles paid for with virtual tokens: a wallet ledger, an entry
// recorder and a seeded, replayable draw.

// Core modules
pub mod config;
pub mod error;
pub mod journal;
pub mod state;
pub mod utils;

// Raffle modules
pub mod draw;
pub mod entry;
pub mod instruction;
pub mod ledger;
pub mod processor;
pub mod registry;
pub mod sweep;

pub use config::EngineConfig;
pub use draw::{DrawEngine, OsSeedSource, SeedSource};
pub use entry::{EntryRecorder, JoinReceipt, JoinRequest};
pub use error::{JournalError, RaffleError};
pub use instruction::{DrawOutcome, RaffleInstruction, RaffleView, Response};
pub use journal::{FileJournal, Journal, MemoryJournal, Record};
pub use ledger::WalletLedger;
pub use processor::Processor;
pub use registry::{RaffleRegistry, UserRaffle};
pub use state::{
    DrawResult, Entry, NewRaffle, Raffle, RaffleId, RaffleStatus, Rarity, TokenCatalog, TokenId,
    TokenType, UserId,
};
pub use sweep::{RecoverySweep, SweepReport};
pub use utils::{Clock, ManualClock, SystemClock};
