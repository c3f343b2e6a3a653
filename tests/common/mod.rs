//! Common test infrastructure
//!
//! Tests should only import from this module, not from internal submodules.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{TestEngine, CARDIFF_CENTRAL};
//!
//! #[test]
//! fn test_counting() {
//!     let t = TestEngine::in_memory();
//!     let petition_id = t.open_petition("Act");
//!     t.add_validated_signatures(petition_id, CARDIFF_CENTRAL, 10, chrono::Utc::now());
//! }
//! ```

mod constants;
mod fixtures;

pub use constants::*;
pub use fixtures::{count_interval, TestEngine};
