// Token Raffle - Instructions and responses
use std::collections::BTreeMap;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use crate::entry::{JoinReceipt, JoinRequest};
use crate::error::RaffleError;
use crate::registry::UserRaffle;
use crate::state::{
    DrawResult, Entry, NewRaffle, Raffle, RaffleId, RaffleStatus, TokenId, UnixTimestamp, UserId,
};
use crate::utils::seed_to_hex;

#[derive(BorshSerialize, BorshDeserialize, Clone, Debug, PartialEq, Eq)]
pub enum RaffleInstruction {
    /// Exchange tokens for entries
    JoinRaffle(JoinRequest),
    /// Read-only projection of a wallet
    Wallet { user_id: UserId },
    /// Freeze entries (if still active) and draw the winner
    DrawRaffle { raffle_id: RaffleId },
    RaffleState { raffle_id: RaffleId },
    /// Settled purchase, issued by the payment webhook
    Credit {
        user_id: UserId,
        token_id: TokenId,
        qty: u64,
    },
    CreateRaffle(NewRaffle),
    ActivateRaffle { raffle_id: RaffleId },
    ListActive,
    Participants { raffle_id: RaffleId },
    UserRaffles { user_id: UserId },
    AuditDraw { raffle_id: RaffleId },
}

impl RaffleInstruction {
    /// Unpacks a byte buffer into a RaffleInstruction
    pub fn unpack(input: &[u8]) -> Result<Self, RaffleError> {
        Self::try_from_slice(input)
            .map_err(|err| RaffleError::validation(format!("invalid instruction data: {err}")))
    }

    /// Packs a RaffleInstruction into a byte buffer
    pub fn pack(&self) -> Result<Vec<u8>, RaffleError> {
        borsh::to_vec(self)
            .map_err(|err| RaffleError::validation(format!("cannot encode instruction: {err}")))
    }

    pub fn name(&self) -> &'static str {
        match self {
            RaffleInstruction::JoinRaffle(_) => "Join Raffle",
            RaffleInstruction::Wallet { .. } => "Wallet",
            RaffleInstruction::DrawRaffle { .. } => "Draw Raffle",
            RaffleInstruction::RaffleState { .. } => "Raffle State",
            RaffleInstruction::Credit { .. } => "Credit",
            RaffleInstruction::CreateRaffle(_) => "Create Raffle",
            RaffleInstruction::ActivateRaffle { .. } => "Activate Raffle",
            RaffleInstruction::ListActive => "List Active Raffles",
            RaffleInstruction::Participants { .. } => "Participants",
            RaffleInstruction::UserRaffles { .. } => "User Raffles",
            RaffleInstruction::AuditDraw { .. } => "Audit Draw",
        }
    }
}

/// Public state of a raffle
#[derive(BorshSerialize, BorshDeserialize, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RaffleView {
    pub raffle_id: RaffleId,
    pub title: String,
    pub status: RaffleStatus,
    pub entry_count: u64,
    pub entry_cost: u64,
    pub max_entries: Option<u64>,
    pub draw_at: UnixTimestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner: Option<UserId>,
}

impl From<&Raffle> for RaffleView {
    fn from(raffle: &Raffle) -> Self {
        Self {
            raffle_id: raffle.id,
            title: raffle.title.clone(),
            status: raffle.status,
            entry_count: raffle.entry_count,
            entry_cost: raffle.entry_cost,
            max_entries: raffle.max_entries,
            draw_at: raffle.draw_at,
            winner: raffle.winner,
        }
    }
}

/// `{winnerUserId, seed}` or `{noWinner: true}` on the wire
#[derive(BorshSerialize, BorshDeserialize, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(untagged)]
pub enum DrawOutcome {
    #[serde(rename_all = "camelCase")]
    Winner {
        winner_user_id: UserId,
        winning_sequence: u64,
        seed: String,
    },
    #[serde(rename_all = "camelCase")]
    NoWinner { no_winner: bool },
}

impl From<&DrawResult> for DrawOutcome {
    fn from(result: &DrawResult) -> Self {
        match (result.winner, result.winning_sequence, result.seed.as_ref()) {
            (Some(winner_user_id), Some(winning_sequence), Some(seed)) => DrawOutcome::Winner {
                winner_user_id,
                winning_sequence,
                seed: seed_to_hex(seed),
            },
            _ => DrawOutcome::NoWinner { no_winner: true },
        }
    }
}

#[derive(BorshSerialize, BorshDeserialize, Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Joined(JoinReceipt),
    Wallet(BTreeMap<TokenId, u64>),
    Drawn(DrawOutcome),
    State(RaffleView),
    Credited { balance: u64 },
    Raffle(RaffleView),
    Raffles(Vec<RaffleView>),
    Participants(Vec<Entry>),
    UserRaffles(Vec<UserRaffle>),
    Audit { matches: bool },
}
