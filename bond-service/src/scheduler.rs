//! Settlement Scheduler
//!
//! Background runner with two timers: maturity settlement and operator
//! reports. Runs never overlap inside one process; across processes the
//! store's own exclusivity applies.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bond_core::{LedgerResult, SettlementOutcome};
use bond_store::LedgerStore;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::config::SchedulerConfig;
use crate::service::LedgerService;

pub struct SettlementScheduler<S: LedgerStore + 'static> {
    service: LedgerService<S>,
    config: SchedulerConfig,
    running: Arc<AtomicBool>,
}

impl<S: LedgerStore + 'static> SettlementScheduler<S> {
    pub fn new(service: LedgerService<S>, config: SchedulerConfig) -> Self {
        Self {
            service,
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// One settlement run; `Skipped` if a run is already in progress here
    pub async fn run_once(&self) -> LedgerResult<SettlementOutcome> {
        Self::settle_guarded(&self.service, &self.running).await
    }

    async fn settle_guarded(service: &LedgerService<S>, running: &AtomicBool) -> LedgerResult<SettlementOutcome> {
        if running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Settlement run already in progress");
            return Ok(SettlementOutcome::Skipped);
        }
        let result = {
            let _run = RunGuard(running);
            service.settle().await
        };

        match &result {
            Ok(SettlementOutcome::Completed(report)) => info!(
                run = %report.run_id.short(),
                tokens = report.tokens_matured,
                holdings = report.holdings_settled,
                retired = report.bonds_retired.len(),
                payout = report.total_payout,
                "Settlement run completed"
            ),
            Ok(SettlementOutcome::Skipped) => debug!("Settlement lock held elsewhere"),
            Err(e) => error!(error = %e, "Settlement run failed"),
        }
        result
    }

    /// Spawn the timer loop
    pub fn start(self) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let first = if self.config.run_on_start {
            Instant::now()
        } else {
            Instant::now() + self.config.settlement_interval()
        };
        let first_report = if self.config.run_on_start {
            Instant::now()
        } else {
            Instant::now() + self.config.report_interval()
        };
        let settlement_every = non_zero(self.config.settlement_interval());
        let report_every = non_zero(self.config.report_interval());

        let service = self.service;
        let running = self.running;

        let join = tokio::spawn(async move {
            let mut settlement_timer = interval_at(first, settlement_every);
            settlement_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut report_timer = interval_at(first_report, report_every);
            report_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

            info!(
                settlement_secs = settlement_every.as_secs(),
                report_secs = report_every.as_secs(),
                "Settlement scheduler started"
            );

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Settlement scheduler received shutdown signal");
                        break;
                    }
                    _ = settlement_timer.tick() => {
                        // errors are logged and reported inside
                        let _ = Self::settle_guarded(&service, &running).await;
                    }
                    _ = report_timer.tick() => {
                        if let Err(e) = service.publish_reports().await {
                            error!(error = %e, "Report publication failed");
                        }
                    }
                }
            }

            info!("Settlement scheduler stopped");
        });

        SchedulerHandle { shutdown_tx, join }
    }
}

/// Clears the in-progress flag even when the run future is dropped
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn non_zero(d: Duration) -> Duration {
    if d.is_zero() {
        Duration::from_secs(1)
    } else {
        d
    }
}

/// Handle to a running scheduler
pub struct SchedulerHandle {
    shutdown_tx: mpsc::Sender<()>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop the loop and wait for the in-flight run to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.join.await {
            error!(error = %e, "Settlement scheduler task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}
