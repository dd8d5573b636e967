// Token Raffle - State
use std::collections::{BTreeMap, HashMap};

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use crate::error::RaffleError;

pub type UserId = u64;
pub type TokenId = String;
pub type RaffleId = u64;
pub type UnixTimestamp = i64;

/// Recorded randomness behind a draw
pub type Seed = [u8; 32];

/// Rarity tiers of the token catalog
#[derive(BorshSerialize, BorshDeserialize, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Rarity {
    Comum,
    Raro,
    Epico,
    Lendario,
}

/// A typed virtual collectible used as entry currency
#[derive(BorshSerialize, BorshDeserialize, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenType {
    pub id: TokenId,
    pub name: String,
    pub rarity: Rarity,
    /// How much entry value one unit of this token is worth
    pub entry_value: u64,
}

impl TokenType {
    pub fn new(id: &str, name: &str, rarity: Rarity, entry_value: u64) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            rarity,
            entry_value,
        }
    }
}

/// Immutable reference data: every token type the engine accepts
#[derive(Clone, Debug, Default)]
pub struct TokenCatalog {
    tokens: HashMap<TokenId, TokenType>,
}

impl TokenCatalog {
    pub fn new(tokens: impl IntoIterator<Item = TokenType>) -> Self {
        Self {
            tokens: tokens.into_iter().map(|t| (t.id.clone(), t)).collect(),
        }
    }

    /// The four storefront tiers
    pub fn standard() -> Self {
        Self::new([
            TokenType::new("comum", "Comum", Rarity::Comum, 1),
            TokenType::new("raro", "Raro", Rarity::Raro, 5),
            TokenType::new("epico", "Épico", Rarity::Epico, 10),
            TokenType::new("lendario", "Lendário", Rarity::Lendario, 50),
        ])
    }

    pub fn get(&self, token_id: &str) -> Option<&TokenType> {
        self.tokens.get(token_id)
    }

    pub fn contains(&self, token_id: &str) -> bool {
        self.tokens.contains_key(token_id)
    }

    /// Total entry value of an offer
    pub fn value_of(&self, offer: &BTreeMap<TokenId, u64>) -> Result<u64, RaffleError> {
        let mut total: u64 = 0;
        for (token_id, qty) in offer {
            if *qty == 0 {
                return Err(RaffleError::validation(format!(
                    "quantity of token {token_id} must be positive"
                )));
            }
            let token = self
                .get(token_id)
                .ok_or_else(|| RaffleError::validation(format!("unknown token {token_id}")))?;
            let value = qty
                .checked_mul(token.entry_value)
                .and_then(|v| total.checked_add(v))
                .ok_or_else(|| RaffleError::validation("offer value overflows"))?;
            total = value;
        }
        Ok(total)
    }
}

/// Status of a raffle. Transitions only ever move one step forward.
#[derive(BorshSerialize, BorshDeserialize, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RaffleStatus {
    /// Created, not yet open for entries
    Scheduled,
    /// Open for entries
    Active,
    /// Entries frozen, winner being selected
    Drawing,
    /// Draw result persisted (with or without a winner)
    Closed,
}

impl RaffleStatus {
    pub fn can_transition_to(self, next: RaffleStatus) -> bool {
        u8::from(next) == u8::from(self) + 1
    }
}

impl From<RaffleStatus> for u8 {
    fn from(status: RaffleStatus) -> Self {
        match status {
            RaffleStatus::Scheduled => 0,
            RaffleStatus::Active => 1,
            RaffleStatus::Drawing => 2,
            RaffleStatus::Closed => 3,
        }
    }
}

/// Admin request to create a raffle
#[derive(BorshSerialize, BorshDeserialize, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NewRaffle {
    pub title: String,
    /// Entry value required per entry
    pub entry_cost: u64,
    pub max_entries: Option<u64>,
    /// When entries open; `None` opens immediately
    pub opens_at: Option<UnixTimestamp>,
    pub draw_at: UnixTimestamp,
}

/// Raffle record
#[derive(BorshSerialize, BorshDeserialize, Clone, Debug, PartialEq, Eq)]
pub struct Raffle {
    pub id: RaffleId,
    pub title: String,
    pub entry_cost: u64,
    pub max_entries: Option<u64>,
    pub status: RaffleStatus,
    pub opens_at: Option<UnixTimestamp>,
    pub draw_at: UnixTimestamp,
    /// Set once, before the winner is computed
    pub draw_seed: Option<Seed>,
    /// Set once, at close
    pub winner: Option<UserId>,
    pub entry_count: u64,
    /// When the raffle entered Drawing
    pub drawing_since: Option<UnixTimestamp>,
    pub created_at: UnixTimestamp,
}

impl Raffle {
    pub fn new(id: RaffleId, params: NewRaffle, now: UnixTimestamp) -> Self {
        let status = match params.opens_at {
            Some(opens_at) if opens_at > now => RaffleStatus::Scheduled,
            _ => RaffleStatus::Active,
        };
        Self {
            id,
            title: params.title,
            entry_cost: params.entry_cost,
            max_entries: params.max_entries,
            status,
            opens_at: params.opens_at,
            draw_at: params.draw_at,
            draw_seed: None,
            winner: None,
            entry_count: 0,
            drawing_since: None,
            created_at: now,
        }
    }

    /// Accepting entries at `now`
    pub fn is_open(&self, now: UnixTimestamp) -> bool {
        self.status == RaffleStatus::Active && now < self.draw_at
    }

    /// Draw time has passed
    pub fn has_ended(&self, now: UnixTimestamp) -> bool {
        now >= self.draw_at
    }

    pub fn remaining_entries(&self) -> Option<u64> {
        self.max_entries
            .map(|max| max.saturating_sub(self.entry_count))
    }
}

/// One paid, equally weighted slot in a raffle
#[derive(BorshSerialize, BorshDeserialize, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub raffle_id: RaffleId,
    pub user_id: UserId,
    pub sequence: u64,
}

/// Outcome of a draw. At most one per raffle, immutable once written.
#[derive(BorshSerialize, BorshDeserialize, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DrawResult {
    pub raffle_id: RaffleId,
    pub winner: Option<UserId>,
    pub winning_sequence: Option<u64>,
    pub seed: Option<Seed>,
    /// Size of the frozen entry list the draw ran over
    pub entry_count: u64,
    pub drawn_at: UnixTimestamp,
}

impl DrawResult {
    pub fn no_winner(raffle_id: RaffleId, drawn_at: UnixTimestamp) -> Self {
        Self {
            raffle_id,
            winner: None,
            winning_sequence: None,
            seed: None,
            entry_count: 0,
            drawn_at,
        }
    }
}

/// Ties a debit or compensating credit to the join that issued it
#[derive(BorshSerialize, BorshDeserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JoinTag {
    pub raffle_id: RaffleId,
    pub user_id: UserId,
    pub idempotency_key: String,
}
