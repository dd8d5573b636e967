// Token Raffle - Recovery sweep
//
// Periodic pass that opens scheduled raffles, draws raffles whose time has
// come, and resumes draws left in Drawing by a crash.
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::draw::DrawEngine;
use crate::error::RaffleError;
use crate::registry::RaffleRegistry;
use crate::state::RaffleId;
use crate::utils::Clock;

/// What one sweep pass did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub opened: Vec<RaffleId>,
    pub drawn: Vec<RaffleId>,
    pub resumed: Vec<RaffleId>,
    pub failed: Vec<(RaffleId, RaffleError)>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.opened.is_empty()
            && self.drawn.is_empty()
            && self.resumed.is_empty()
            && self.failed.is_empty()
    }
}

pub struct RecoverySweep {
    registry: Arc<RaffleRegistry>,
    draw: Arc<DrawEngine>,
    clock: Arc<dyn Clock>,
    draw_timeout_secs: i64,
    interval: Duration,
}

impl RecoverySweep {
    pub fn new(
        registry: Arc<RaffleRegistry>,
        draw: Arc<DrawEngine>,
        clock: Arc<dyn Clock>,
        draw_timeout_secs: i64,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            draw,
            clock,
            draw_timeout_secs,
            interval,
        }
    }

    pub fn sweep_once(&self) -> SweepReport {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        for raffle_id in self.registry.due_for_opening(now) {
            match self.registry.activate(raffle_id, now) {
                Ok(_) => report.opened.push(raffle_id),
                Err(err) => report.failed.push((raffle_id, err)),
            }
        }

        for raffle_id in self.registry.due_for_draw(now) {
            match self.registry.begin_drawing(raffle_id, now) {
                // Someone else froze it first; the stuck check covers it if they died
                Ok(false) => continue,
                Ok(true) => {}
                Err(RaffleError::AlreadyDrawn(_)) => continue,
                Err(err) => {
                    report.failed.push((raffle_id, err));
                    continue;
                }
            }
            info!("Sweep: automatically drawing raffle {}", raffle_id);
            match self.draw.select_winner(raffle_id) {
                Ok(_) => report.drawn.push(raffle_id),
                Err(RaffleError::AlreadyDrawn(_)) => {}
                Err(err) => report.failed.push((raffle_id, err)),
            }
        }

        for raffle_id in self.registry.stuck_drawings(now, self.draw_timeout_secs) {
            warn!("Sweep: raffle {} stuck in Drawing; resuming draw", raffle_id);
            match self.draw.select_winner(raffle_id) {
                Ok(_) => report.resumed.push(raffle_id),
                Err(RaffleError::AlreadyDrawn(_)) => {}
                Err(err) => report.failed.push((raffle_id, err)),
            }
        }

        for (raffle_id, err) in &report.failed {
            error!("Sweep: raffle {} failed: {}", raffle_id, err);
        }
        report
    }

    /// Sweep every interval until `shutdown` flips to true or its sender drops
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            let ticked = tokio::select! {
                _ = ticker.tick() => true,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    false
                }
            };
            if !ticked {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }

            let sweep = Arc::clone(&self);
            match tokio::task::spawn_blocking(move || sweep.sweep_once()).await {
                Ok(report) if !report.is_empty() => info!(
                    "Sweep: opened {:?}, drew {:?}, resumed {:?}, {} failures",
                    report.opened,
                    report.drawn,
                    report.resumed,
                    report.failed.len()
                ),
                Ok(_) => {}
                Err(err) => error!("Sweep task panicked: {}", err),
            }
        }
        info!("Sweep stopping");
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(Arc::new(self).run(shutdown))
    }
}
