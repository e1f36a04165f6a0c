use std::time::Duration;

use common::types::Domain;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::error::CycleError;
use crate::reconcile::Reconciler;

/// Alternates posts and followers cycles with a fixed pause between them
/// until `shutdown` fires.
pub struct Driver {
    reconciler: Reconciler,
    delay: Duration,
}

impl Driver {
    pub fn new(reconciler: Reconciler, delay: Duration) -> Self {
        Self { reconciler, delay }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!("Starting reconcile loop, pausing {:?} between cycles", self.delay);

        while self.run_pass(&shutdown).await {}

        tracing::info!("Reconcile loop stopped");
    }

    /// One cycle per domain. Returns `false` once shutdown was requested.
    pub async fn run_pass(&self, shutdown: &CancellationToken) -> bool {
        for domain in Domain::ALL {
            if shutdown.is_cancelled() {
                return false;
            }

            self.run_cycle(domain, shutdown).await;

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return false,
                _ = sleep(self.delay) => {}
            }
        }
        true
    }

    async fn run_cycle(&self, domain: Domain, shutdown: &CancellationToken) {
        tracing::debug!("[reconcile] Begin {}", domain);

        match self.reconciler.run_cycle(domain, shutdown).await {
            Ok(report) => tracing::info!(
                %domain,
                fetched = report.fetched,
                new = report.new,
                acted = report.acted,
                persisted = report.persisted,
                failed = report.failed,
                retried = report.retried,
                parked = report.parked,
                "cycle complete"
            ),
            Err(CycleError::Cancelled(_)) => tracing::debug!("[reconcile] {} cancelled", domain),
            Err(e) => tracing::error!("[reconcile] Error: {}. Moving on...", e),
        }

        tracing::debug!("[reconcile] Done {}", domain);
    }
}
