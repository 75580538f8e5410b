//! Periodic refresh of both test sets.

use crate::reconcile::Reconciler;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

/// Runs [`Reconciler::refresh_all`] on a fixed period, as a backstop for
/// missed webhook deliveries.
pub struct RefreshScheduler {
    reconciler: Arc<Reconciler>,
    period: Duration,
}

impl RefreshScheduler {
    pub fn new(reconciler: Arc<Reconciler>, period: Duration) -> Self {
        Self { reconciler, period }
    }

    /// Start the loop in the background. The first run happens one period
    /// from now. Abort the returned handle to stop it.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        info!(period_secs = self.period.as_secs(), "Periodic refresh enabled");
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.period, self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.run_once().await;
            }
        })
    }

    async fn run_once(&self) {
        debug!("Periodic refresh cycle");
        let outcome = self.reconciler.refresh_all().await;
        for (set, e) in outcome.errors() {
            warn!(kind = %set, error = %e, "Periodic refresh failed");
        }
    }
}
