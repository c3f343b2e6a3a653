//! Petition signature counting engine.
//!
//! This library exposes the internal modules for the binary and for
//! integration tests.

pub mod background_jobs;
pub mod config;
pub mod engine;
pub mod error;
pub mod job_queue;
pub mod metrics;
pub mod ops_store;
pub mod petition_store;
pub mod sqlite_persistence;

pub use engine::{EngineContext, EngineDispatcher, EngineJob};
pub use error::{EngineError, EngineResult};
pub use job_queue::{JobQueue, SqliteJobQueue};
pub use ops_store::{OpsStore, SqliteOpsStore};
pub use petition_store::{PetitionStore, SqlitePetitionStore};
