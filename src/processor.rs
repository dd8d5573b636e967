// Token Raffle - Processor
use std::collections::BTreeMap;
use std::sync::Arc;

use log::{error, info, warn};
use tokio::sync::broadcast;

use crate::config::EngineConfig;
use crate::draw::{DrawEngine, OsSeedSource, SeedSource};
use crate::entry::{EntryRecorder, JoinReceipt, JoinRequest};
use crate::error::RaffleError;
use crate::instruction::{DrawOutcome, RaffleInstruction, RaffleView, Response};
use crate::journal::{FileJournal, Journal, MemoryJournal};
use crate::ledger::WalletLedger;
use crate::registry::{RaffleRegistry, UserRaffle};
use crate::state::{DrawResult, Entry, NewRaffle, RaffleId, TokenCatalog, TokenId, UserId};
use crate::sweep::RecoverySweep;
use crate::utils::{Clock, SystemClock};

pub struct Processor {
    config: EngineConfig,
    ledger: Arc<WalletLedger>,
    registry: Arc<RaffleRegistry>,
    recorder: EntryRecorder,
    draw: Arc<DrawEngine>,
    clock: Arc<dyn Clock>,
}

impl Processor {
    /// Production wiring: file journal when configured, OS randomness, wall clock
    pub fn bootstrap(config: EngineConfig, catalog: TokenCatalog) -> Result<Self, RaffleError> {
        config.validate()?;
        let journal: Arc<dyn Journal> = match &config.journal_path {
            Some(path) => {
                let journal = FileJournal::open(path).map_err(|err| {
                    error!("Cannot open journal {}: {}", path.display(), err);
                    RaffleError::RaceConditionRetry("opening journal".to_string())
                })?;
                info!("Journal opened at {}", journal.path().display());
                Arc::new(journal)
            }
            None => {
                warn!("No journal path configured; state will not survive a restart");
                Arc::new(MemoryJournal::new())
            }
        };
        Self::open(
            config,
            catalog,
            journal,
            Arc::new(OsSeedSource),
            Arc::new(SystemClock),
        )
    }

    /// Build the engine and replay the journal into it
    pub fn open(
        config: EngineConfig,
        catalog: TokenCatalog,
        journal: Arc<dyn Journal>,
        seeds: Arc<dyn SeedSource>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RaffleError> {
        let catalog = Arc::new(catalog);
        let ledger = Arc::new(WalletLedger::new(
            Arc::clone(&catalog),
            Arc::clone(&journal),
            config.lock_timeout,
            config.retry_attempts,
        ));
        let registry = Arc::new(RaffleRegistry::new(
            Arc::clone(&journal),
            config.lock_timeout,
            config.retry_attempts,
        ));
        let recorder = EntryRecorder::new(
            Arc::clone(&ledger),
            Arc::clone(&registry),
            catalog,
            config.lock_timeout,
            config.retry_attempts,
        );
        let draw = Arc::new(DrawEngine::new(
            Arc::clone(&registry),
            seeds,
            Arc::clone(&clock),
            config.event_capacity,
        ));

        let records = journal.load().map_err(|err| {
            error!("Cannot load journal: {}", err);
            RaffleError::RaceConditionRetry("loading journal".to_string())
        })?;
        for record in &records {
            registry.apply(record)?;
            ledger.apply(record)?;
            recorder.apply(record);
        }
        let compensated = recorder.reconcile(&records)?;
        if !records.is_empty() {
            info!(
                "Replayed {} journal records ({} interrupted joins compensated)",
                records.len(),
                compensated
            );
        }

        Ok(Self {
            config,
            ledger,
            registry,
            recorder,
            draw,
            clock,
        })
    }

    pub fn process(&self, instruction: RaffleInstruction) -> Result<Response, RaffleError> {
        info!("Instruction: {}", instruction.name());
        match instruction {
            RaffleInstruction::JoinRaffle(request) => self.join_raffle(&request).map(Response::Joined),
            RaffleInstruction::Wallet { user_id } => Ok(Response::Wallet(self.wallet(user_id))),
            RaffleInstruction::DrawRaffle { raffle_id } => self.draw_raffle(raffle_id).map(Response::Drawn),
            RaffleInstruction::RaffleState { raffle_id } => self.raffle_state(raffle_id).map(Response::State),
            RaffleInstruction::Credit {
                user_id,
                token_id,
                qty,
            } => self
                .credit(user_id, &token_id, qty)
                .map(|balance| Response::Credited { balance }),
            RaffleInstruction::CreateRaffle(params) => self
                .create_raffle(params)
                .map(Response::Raffle),
            RaffleInstruction::ActivateRaffle { raffle_id } => self
                .activate_raffle(raffle_id)
                .map(Response::Raffle),
            RaffleInstruction::ListActive => Ok(Response::Raffles(self.list_active())),
            RaffleInstruction::Participants { raffle_id } => self
                .participants(raffle_id)
                .map(Response::Participants),
            RaffleInstruction::UserRaffles { user_id } => {
                Ok(Response::UserRaffles(self.user_raffles(user_id)))
            }
            RaffleInstruction::AuditDraw { raffle_id } => self
                .audit_draw(raffle_id)
                .map(|matches| Response::Audit { matches }),
        }
    }

    /// Decode, run and encode one instruction
    pub fn process_packed(&self, instruction_data: &[u8]) -> Result<Vec<u8>, RaffleError> {
        let instruction = RaffleInstruction::unpack(instruction_data)?;
        let response = self.process(instruction)?;
        borsh::to_vec(&response)
            .map_err(|err| RaffleError::validation(format!("cannot encode response: {err}")))
    }

    pub fn join_raffle(&self, request: &JoinRequest) -> Result<JoinReceipt, RaffleError> {
        self.recorder.join_raffle(request, self.clock.now())
    }

    pub fn wallet(&self, user_id: UserId) -> BTreeMap<TokenId, u64> {
        self.ledger.balance(user_id)
    }

    pub fn quantity(&self, user_id: UserId, token_id: &str) -> u64 {
        self.ledger.quantity(user_id, token_id)
    }

    pub fn credit(&self, user_id: UserId, token_id: &str, qty: u64) -> Result<u64, RaffleError> {
        self.ledger.credit(user_id, token_id, qty)
    }

    pub fn debit(&self, user_id: UserId, token_id: &str, qty: u64) -> Result<u64, RaffleError> {
        self.ledger.debit(user_id, token_id, qty)
    }

    /// Admin draw: freezes an active raffle ahead of its draw time if needed
    pub fn draw_raffle(&self, raffle_id: RaffleId) -> Result<DrawOutcome, RaffleError> {
        self.registry.begin_drawing(raffle_id, self.clock.now())?;
        let result = self.draw.select_winner(raffle_id)?;
        Ok(DrawOutcome::from(&result))
    }

    pub fn raffle_state(&self, raffle_id: RaffleId) -> Result<RaffleView, RaffleError> {
        self.registry
            .raffle(raffle_id)
            .map(|raffle| RaffleView::from(&raffle))
    }

    pub fn draw_result(&self, raffle_id: RaffleId) -> Result<Option<DrawResult>, RaffleError> {
        self.registry.draw_result(raffle_id)
    }

    pub fn create_raffle(&self, params: NewRaffle) -> Result<RaffleView, RaffleError> {
        self.registry
            .create_raffle(params, self.clock.now())
            .map(|raffle| RaffleView::from(&raffle))
    }

    pub fn activate_raffle(&self, raffle_id: RaffleId) -> Result<RaffleView, RaffleError> {
        self.registry
            .activate(raffle_id, self.clock.now())
            .map(|raffle| RaffleView::from(&raffle))
    }

    pub fn list_active(&self) -> Vec<RaffleView> {
        self.registry
            .list_active()
            .iter()
            .map(RaffleView::from)
            .collect()
    }

    pub fn participants(&self, raffle_id: RaffleId) -> Result<Vec<Entry>, RaffleError> {
        self.registry.participants(raffle_id)
    }

    pub fn user_raffles(&self, user_id: UserId) -> Vec<UserRaffle> {
        self.registry.user_raffles(user_id)
    }

    pub fn audit_draw(&self, raffle_id: RaffleId) -> Result<bool, RaffleError> {
        self.draw.audit(raffle_id)
    }

    /// Draw results for external notification delivery
    pub fn subscribe(&self) -> broadcast::Receiver<DrawResult> {
        self.draw.subscribe()
    }

    /// Background sweep over this engine's raffles
    pub fn recovery_sweep(&self) -> RecoverySweep {
        RecoverySweep::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.draw),
            Arc::clone(&self.clock),
            self.config.draw_timeout_secs,
            self.config.sweep_interval,
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
