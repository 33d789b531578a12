//! Parent/child flow hooks.
//!
//! Flows are tracked outside this crate. The queue only reports terminal
//! failures of jobs that declare a parent, together with the parent's
//! failure policy, so the flow owner can fail, continue or detach the parent.

use async_trait::async_trait;

use crate::error::QueueError;

use super::job::{Job, ParentRef};

/// Receives terminal failures of jobs that belong to a flow.
#[async_trait]
pub trait FlowCollaborator: Send + Sync + std::fmt::Debug {
    /// Called once after `child` failed for good.
    async fn child_failed(
        &self,
        child: &Job,
        parent: &ParentRef,
        reason: &str,
    ) -> Result<(), QueueError>;
}

/// Collaborator for queues without flows.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopFlow;

#[async_trait]
impl FlowCollaborator for NoopFlow {
    async fn child_failed(
        &self,
        child: &Job,
        parent: &ParentRef,
        _reason: &str,
    ) -> Result<(), QueueError> {
        tracing::debug!(
            job_id = %child.id,
            parent_id = %parent.id,
            policy = ?parent.on_failure,
            "no flow collaborator registered, ignoring child failure"
        );
        Ok(())
    }
}
