//! Scoped cancellation for batch invocations.

use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A child of the worker's cancellation token that lives exactly as long as
/// one batch invocation. Dropping the scope cancels the child, so nothing
/// derived from it outlives the invocation, whichever way it exits.
pub struct TerminationScope {
    label: String,
    token: CancellationToken,
}

impl TerminationScope {
    pub fn enter(parent: &CancellationToken, label: impl Into<String>) -> Self {
        let label = label.into();
        debug!("Entering termination scope {}", label);
        Self {
            label,
            token: parent.child_token(),
        }
    }

    /// True once the parent asked the invocation to stop.
    pub fn is_terminating(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for TerminationScope {
    fn drop(&mut self) {
        self.token.cancel();
        debug!("Released termination scope {}", self.label);
    }
}
