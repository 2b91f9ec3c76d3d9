//! In-memory SDK harness.

use parley::lock::memory::MemoryLockManager;
use parley::store::memory::MemStore;
use parley::{Config, Parley, Storage};
use std::collections::HashMap;
use std::sync::Arc;

/// Default organization external id used by the harness.
pub const TEST_ORG: &str = "test-org";

/// A Parley instance over in-memory backends, plus handles for assertions.
pub struct TestHarness {
    pub sdk: Parley,
    pub store: Arc<MemStore>,
    pub locks: Arc<MemoryLockManager>,
}

impl TestHarness {
    /// Harness with test-friendly defaults: short lock window, the standard
    /// 100 ms sync-reply grace.
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    /// Harness with an explicit configuration.
    pub async fn with_config(config: Config) -> Self {
        let store = Arc::new(MemStore::new());
        let locks = Arc::new(MemoryLockManager::new());
        let sdk = Parley::new(
            Arc::clone(&store) as Arc<dyn parley::Storage>,
            Arc::clone(&locks) as Arc<dyn parley::lock::LockManager>,
            config,
        );
        Self { sdk, store, locks }
    }

    /// Harness pre-seeded with [`TEST_ORG`] and the given agents (external
    /// id doubles as display name).
    pub async fn with_agents(agents: &[&str]) -> Self {
        let harness = Self::new().await;
        harness.seed_agents(agents).await;
        harness
    }

    /// Register [`TEST_ORG`] (if missing) and the given agents under it.
    #[allow(clippy::expect_used)]
    pub async fn seed_agents(&self, agents: &[&str]) {
        if self
            .store
            .organization_by_external_id(TEST_ORG)
            .await
            .expect("store lookup should not fail")
            .is_none()
        {
            self.sdk
                .register_organization(TEST_ORG, "Test Organization")
                .await
                .expect("organization registration should succeed");
        }
        for agent in agents {
            self.sdk
                .register_agent(TEST_ORG, agent, agent)
                .await
                .expect("agent registration should succeed");
        }
    }

    /// Lock symmetry assertion: no lock outlives its operation.
    #[allow(clippy::panic)]
    pub fn assert_no_outstanding_locks(&self) {
        let held = self.locks.held();
        if held != 0 {
            panic!("expected zero outstanding locks, found {held}");
        }
    }
}

/// Configuration with timings tuned for fast, deterministic tests.
#[allow(clippy::expect_used)]
pub fn test_config() -> Config {
    let vars = HashMap::from([
        ("PARLEY_INSTANCE_ID".to_string(), "parley-test".to_string()),
        ("PARLEY_LOCK_WAIT_MS".to_string(), "1000".to_string()),
        ("PARLEY_SYNC_REPLY_GRACE_MS".to_string(), "100".to_string()),
    ]);
    Config::from_vars(&vars).expect("test config should be valid")
}
