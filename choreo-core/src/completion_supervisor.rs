//! The Completion Supervisor (§4.4 step 10, §9 "Run completion detection"):
//! the only writer of a run's terminal status. It never guesses from a
//! single signal — it re-reads `counter_value` and `pending_approvals`
//! itself, so a late-arriving pub/sub event or a direct call from the
//! Coordinator both converge on the same decision.

use crate::artifact::{ArtifactStore, RunStatus};
use crate::error::CoordinatorError;
use crate::events::UiEvent;
use crate::hotstore::HotStore;
use crate::ids::RunId;
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

pub struct CompletionSupervisor<H: HotStore, A: ArtifactStore> {
    hot: Arc<H>,
    artifact: Arc<A>,
}

impl<H: HotStore, A: ArtifactStore> CompletionSupervisor<H, A> {
    pub fn new(hot: Arc<H>, artifact: Arc<A>) -> Self {
        Self { hot, artifact }
    }

    /// Re-checks whether `run_id` is actually done — counter at zero and no
    /// human approval outstanding — and if so, marks it `COMPLETED`, tears
    /// down its hot-store state, and notifies observers. A false read (the
    /// counter having moved back off zero in the meantime is impossible
    /// under the protocol, but a pending approval is not) is a no-op, not
    /// an error.
    pub async fn evaluate(&self, run_id: RunId) -> Result<(), CoordinatorError> {
        let counter = self.hot.counter_value(run_id).await.map_err(CoordinatorError::HotStore)?;
        if counter != 0 {
            return Ok(());
        }
        let pending = self
            .hot
            .pending_approvals(run_id)
            .await
            .map_err(CoordinatorError::HotStore)?;
        if !pending.is_empty() {
            return Ok(());
        }

        let username = self
            .hot
            .load_ir(run_id)
            .await
            .map_err(CoordinatorError::HotStore)?
            .and_then(|ir| ir.metadata)
            .and_then(|m| m.get("username").and_then(|v| v.as_str()).map(str::to_string));

        self.artifact
            .update_run_status(run_id, RunStatus::Completed)
            .await
            .map_err(CoordinatorError::ArtifactStore)?;

        self.hot
            .delete_run_state(run_id)
            .await
            .map_err(CoordinatorError::HotStore)?;

        if let Some(username) = username {
            let _ = self.hot.publish_ui_event(
                &username,
                &UiEvent::WorkflowCompleted {
                    run_id,
                    timestamp: Utc::now(),
                },
            );
        }

        info!(%run_id, "run completed");
        Ok(())
    }
}
