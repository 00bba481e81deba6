//! Global running environment limit.

use tracing::{debug, info, warn};

use super::{ensure_active, Manager, METRICS_PREFIX};
use crate::context::OpContext;
use crate::error::{LifecycleError, StepContext};
use crate::models::DestroyReason;

impl Manager {
    /// Destroy the oldest running environments until at most the configured
    /// limit remain. Individual failures are logged; cancellation of `op`
    /// stops the cleanup.
    pub(super) async fn enforce_global_limit(&self, op: &OpContext) -> Result<(), LifecycleError> {
        if self.config.global_limit == 0 {
            return Ok(());
        }
        let limit = usize::try_from(self.config.global_limit).unwrap_or(usize::MAX);
        let running = self
            .data
            .get_running_environments()
            .await
            .step("error getting running environments")?;
        if running.len() <= limit {
            debug!(running = running.len(), limit, "Within global environment limit");
            return Ok(());
        }

        let excess = running.len() - limit;
        warn!(running = running.len(), limit, excess, "Global environment limit exceeded, destroying oldest");
        self.metrics
            .increment(&format!("{METRICS_PREFIX}global_limit_exceeded"), &[]);
        for env in running.into_iter().take(excess) {
            info!(env = %env.name, created = %env.created, "Destroying environment over global limit");
            if let Err(e) = self
                .delete(&op.fork(), env.revision_data(), DestroyReason::EnvironmentLimitExceeded)
                .await
            {
                warn!(env = %env.name, error = %e, "Error destroying environment over global limit");
            }
            ensure_active(op)?;
        }
        Ok(())
    }
}
