// Token Raffle - Durable record journal
//
// Every mutation is appended here before it is applied in memory. Replaying
// the records in order rebuilds the ledger, the registry and the idempotency
// cache.
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use borsh::{BorshDeserialize, BorshSerialize};
use log::{error, warn};
use parking_lot::Mutex;

use crate::error::{JournalError, RaffleError};
use crate::state::{
    DrawResult, JoinTag, Raffle, RaffleId, RaffleStatus, Seed, TokenId, UnixTimestamp, UserId,
};

const FRAME_HEADER_LEN: usize = 4;

#[derive(BorshSerialize, BorshDeserialize, Clone, Debug, PartialEq, Eq)]
pub enum Record {
    RaffleCreated(Raffle),
    StatusChanged {
        raffle_id: RaffleId,
        status: RaffleStatus,
        at: UnixTimestamp,
    },
    Credit {
        user_id: UserId,
        token_id: TokenId,
        qty: u64,
        /// Set when the credit undoes a join debit
        compensates: Option<JoinTag>,
    },
    Debit {
        user_id: UserId,
        token_id: TokenId,
        qty: u64,
        join: Option<JoinTag>,
    },
    EntriesReserved {
        tag: JoinTag,
        first_sequence: u64,
        count: u64,
        /// Tokens the reserving attempt paid with
        paid: BTreeMap<TokenId, u64>,
    },
    SeedRecorded {
        raffle_id: RaffleId,
        seed: Seed,
    },
    /// Draw result and the Drawing -> Closed transition, as one record
    DrawCommitted(DrawResult),
}

impl Record {
    pub fn kind(&self) -> &'static str {
        match self {
            Record::RaffleCreated(_) => "raffle-created",
            Record::StatusChanged { .. } => "status-changed",
            Record::Credit { .. } => "credit",
            Record::Debit { .. } => "debit",
            Record::EntriesReserved { .. } => "entries-reserved",
            Record::SeedRecorded { .. } => "seed-recorded",
            Record::DrawCommitted(_) => "draw-committed",
        }
    }
}

/// Append-only record store
pub trait Journal: Send + Sync {
    /// Durably append one record. Returns only once the record would survive a crash.
    fn append(&self, record: &Record) -> Result<(), JournalError>;

    /// All records in append order
    fn load(&self) -> Result<Vec<Record>, JournalError>;
}

/// Append to the journal, turning failures into the public error kind
pub(crate) fn persist(journal: &dyn Journal, record: &Record) -> Result<(), RaffleError> {
    journal.append(record).map_err(|err| {
        error!("Journal append failed for {} record: {}", record.kind(), err);
        RaffleError::RaceConditionRetry(format!("persisting {}", record.kind()))
    })
}

/// In-process journal
#[derive(Debug, Default)]
pub struct MemoryJournal {
    records: Mutex<Vec<Record>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<Record>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }
}

impl Journal for MemoryJournal {
    fn append(&self, record: &Record) -> Result<(), JournalError> {
        self.records.lock().push(record.clone());
        Ok(())
    }

    fn load(&self) -> Result<Vec<Record>, JournalError> {
        Ok(self.records.lock().clone())
    }
}

/// Journal backed by a file of length-prefixed borsh frames
pub struct FileJournal {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileJournal {
    /// Open or create the journal, discarding a torn trailing frame
    pub fn open(path: impl AsRef<Path>) -> Result<Self, JournalError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| JournalError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|source| JournalError::Io {
                path: path.clone(),
                source,
            })?;

        let bytes = fs::read(&path).map_err(|source| JournalError::Io {
            path: path.clone(),
            source,
        })?;
        let (_, valid_len) = decode_frames(&bytes)?;
        if valid_len < bytes.len() {
            warn!(
                "Journal {} has a torn trailing frame; truncating {} bytes",
                path.display(),
                bytes.len() - valid_len
            );
            file.set_len(valid_len as u64)
                .map_err(|source| JournalError::Io {
                    path: path.clone(),
                    source,
                })?;
        }

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Journal for FileJournal {
    fn append(&self, record: &Record) -> Result<(), JournalError> {
        let body = borsh::to_vec(record)?;
        let len = u32::try_from(body.len()).map_err(|_| JournalError::FrameTooLarge(body.len()))?;
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&body);

        let mut file = self.file.lock();
        let io_err = |source| JournalError::Io {
            path: self.path.clone(),
            source,
        };
        file.write_all(&frame).map_err(io_err)?;
        file.sync_data().map_err(io_err)?;
        Ok(())
    }

    fn load(&self) -> Result<Vec<Record>, JournalError> {
        // Hold the writer lock so no frame is half-written while reading
        let _guard = self.file.lock();
        let bytes = fs::read(&self.path).map_err(|source| JournalError::Io {
            path: self.path.clone(),
            source,
        })?;
        let (records, _) = decode_frames(&bytes)?;
        Ok(records)
    }
}

/// Decode complete frames; returns the records and the byte length they span
fn decode_frames(bytes: &[u8]) -> Result<(Vec<Record>, usize), JournalError> {
    let mut records = Vec::new();
    let mut offset = 0;
    while bytes.len() - offset >= FRAME_HEADER_LEN {
        let mut header = [0u8; FRAME_HEADER_LEN];
        header.copy_from_slice(&bytes[offset..offset + FRAME_HEADER_LEN]);
        let len = u32::from_le_bytes(header) as usize;
        let start = offset + FRAME_HEADER_LEN;
        if bytes.len() - start < len {
            break;
        }
        let record = Record::try_from_slice(&bytes[start..start + len]).map_err(|err| {
            JournalError::Unavailable(format!("corrupt frame at offset {offset}: {err}"))
        })?;
        records.push(record);
        offset = start + len;
    }
    Ok((records, offset))
}
