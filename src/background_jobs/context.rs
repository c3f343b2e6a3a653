use crate::engine::EngineContext;
use crate::ops_store::OpsStore;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Context provided to jobs during execution.
#[derive(Clone)]
pub struct JobContext {
    /// Token to check for cancellation/shutdown requests.
    pub cancellation_token: CancellationToken,

    /// Stores, queue and settings shared with the queue workers.
    pub engine: EngineContext,
}

impl JobContext {
    pub fn new(cancellation_token: CancellationToken, engine: EngineContext) -> Self {
        Self {
            cancellation_token,
            engine,
        }
    }

    /// Same context with a different cancellation token.
    pub fn with_token(&self, cancellation_token: CancellationToken) -> Self {
        Self {
            cancellation_token,
            engine: self.engine.clone(),
        }
    }

    pub fn ops_store(&self) -> &Arc<dyn OpsStore> {
        &self.engine.ops_store
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}
