//! Convergence waits for provider tasks and instance states.
//!
//! Both waits are built on `cirrus_reconcile::wait_for`. Provider call
//! errors during polling count as "not yet", so a transient API failure
//! only consumes an attempt.

use cirrus_id::{InstanceId, TaskId};
use cirrus_reconcile::{wait_for, Backoff, PollOutcome, WaitContext};
use tracing::{debug, info};

use crate::error::Result;
use crate::provider::{CloudApi, TaskResult};
use crate::registry::NodeRegistry;
use crate::types::NodeStatus;

/// Provider state of a running instance.
pub const INSTANCE_RUNNING: &str = "RUNNING";

/// Waits for asynchronous provider operations to converge.
pub struct TaskWaiter<'a> {
    api: &'a dyn CloudApi,
    backoff: Backoff,
}

impl<'a> TaskWaiter<'a> {
    pub fn new(api: &'a dyn CloudApi, backoff: Backoff) -> Self {
        Self { api, backoff }
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Wait for one task to resolve.
    ///
    /// `Running` keeps polling, `Failed` is terminal, `Success` and any
    /// unrecognized value count as done.
    pub async fn wait_task(&self, task_id: TaskId, operation: &str) -> Result<()> {
        let api = self.api;
        let context = WaitContext::new(operation, api.region())
            .with_resources([task_id])
            .with_target("SUCCESS");

        wait_for(&self.backoff, context, move || async move {
            match api.describe_task_result(task_id).await {
                Ok(TaskResult::Running) => PollOutcome::Pending,
                Ok(TaskResult::Success) => PollOutcome::Done(()),
                Ok(TaskResult::Failed) => PollOutcome::Failed(format!("task {task_id} failed")),
                Ok(TaskResult::Other(value)) => {
                    debug!(task_id = %task_id, result = %value, "Treating unrecognized task result as done");
                    PollOutcome::Done(())
                }
                Err(err) => {
                    debug!(task_id = %task_id, error = %err, "Task result query failed");
                    PollOutcome::Pending
                }
            }
        })
        .await?;

        debug!(task_id = %task_id, operation, "Task converged");
        Ok(())
    }

    /// Wait for several tasks, one after another.
    pub async fn wait_tasks(&self, task_ids: &[TaskId], operation: &str) -> Result<()> {
        for task_id in task_ids {
            self.wait_task(*task_id, operation).await?;
        }
        Ok(())
    }

    /// Wait until every instance reports `target`.
    ///
    /// Observed states are recorded in the registry as they are seen; the
    /// wait completes only when all `ids` are at `target` in one response.
    pub async fn wait_instances(
        &self,
        ids: &[InstanceId],
        target: &str,
        registry: &NodeRegistry,
    ) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        info!(
            instances = ?ids.iter().map(InstanceId::as_str).collect::<Vec<_>>(),
            target,
            "Waiting for instances to reach target state"
        );

        let api = self.api;
        let context = WaitContext::new("instance-status", api.region())
            .with_resources(ids)
            .with_target(target);

        wait_for(&self.backoff, context, move || async move {
            let statuses = match api.describe_instance_status(ids).await {
                Ok(statuses) if !statuses.is_empty() => statuses,
                Ok(_) => return PollOutcome::Pending,
                Err(err) => {
                    debug!(error = %err, "Instance status query failed");
                    return PollOutcome::Pending;
                }
            };

            for status in &statuses {
                registry.update(&status.instance_id, |node| {
                    node.status = NodeStatus::from_provider(&status.state);
                });
            }

            let converged = ids.iter().all(|id| {
                statuses
                    .iter()
                    .any(|s| &s.instance_id == id && s.state.eq_ignore_ascii_case(target))
            });

            if converged {
                PollOutcome::Done(())
            } else {
                PollOutcome::Pending
            }
        })
        .await?;

        info!(count = ids.len(), target, "Instances reached target state");
        Ok(())
    }
}
