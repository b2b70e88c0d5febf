//! Common test infrastructure
//!
//! Scripted collaborators and an engine harness shared by the end-to-end
//! tests. Tests should only import from this module.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::TestEngine;
//!
//! #[tokio::test]
//! async fn test_add_job() {
//!     let harness = TestEngine::online();
//!     let job = harness.add(serde_json::json!({"site": "north"})).await.unwrap();
//!     assert!(harness.engine.get_job(&job.id).unwrap().is_some());
//! }
//! ```

mod harness;
mod mocks;

// Public API - this is what tests import
pub use harness::{wait_until, TestEngine};
#[allow(unused_imports)]
pub use mocks::{MockExecutionClient, MockRemoteReader, MockResponse};
