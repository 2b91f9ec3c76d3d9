//! # Parley Test Utilities
//!
//! Shared test utilities for the Parley SDK:
//! - In-memory SDK harness (store + lock manager, no database needed)
//! - Agent seeding helpers
//! - Event recording subscriber
//! - Tracing initialization for tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use parley_test_utils::TestHarness;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let harness = TestHarness::with_agents(&["alice", "bob"]).await;
//!
//!     harness.sdk.send_one_way("alice", &["bob"], &serde_json::json!({})).await?;
//!
//!     harness.assert_no_outstanding_locks();
//! }
//! ```

pub mod events;
pub mod harness;

pub use events::*;
pub use harness::*;

/// Initialize tracing for a test binary. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
