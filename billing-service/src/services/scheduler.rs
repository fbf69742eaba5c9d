//! Periodic billing passes.

use crate::config::SchedulerConfig;
use crate::models::BillingRunType;
use crate::services::billing::BillingEngine;
use crate::services::metrics::record_error;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub struct BillingScheduler {
    engine: Arc<BillingEngine>,
    poll_interval: Duration,
}

impl BillingScheduler {
    pub fn new(engine: Arc<BillingEngine>, config: &SchedulerConfig) -> Self {
        Self {
            engine,
            poll_interval: config.poll_interval.max(Duration::from_millis(10)),
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Tick until `shutdown` is cancelled. A pass in flight finishes first.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            worker_id = %self.engine.worker_id(),
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Billing scheduler started"
        );

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Billing scheduler shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match self.engine.run_pass(None, BillingRunType::Scheduled).await {
                        Ok(runs) if !runs.is_empty() => {
                            info!(runs = runs.len(), "Scheduled billing pass complete");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!(error = %e, "Scheduled billing pass failed");
                            record_error("pass_failed", "scheduler");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BillingConfig;
    use crate::providers::ProviderRegistry;
    use crate::services::memory::MemoryStore;

    #[tokio::test]
    async fn test_stops_on_cancel() {
        let config = BillingConfig::for_memory();
        let engine = Arc::new(BillingEngine::new(
            Arc::new(MemoryStore::new()),
            Arc::new(ProviderRegistry::new()),
            &config,
        ));
        let scheduler = BillingScheduler::new(
            engine,
            &SchedulerConfig {
                poll_interval: Duration::from_millis(20),
                ..config.scheduler.clone()
            },
        );

        let shutdown = CancellationToken::new();
        let handle = scheduler.spawn(shutdown.clone());
        tokio::time::sleep(Duration::from_millis(60)).await;
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();
    }
}
