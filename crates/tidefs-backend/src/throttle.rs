//! Global parallelism gates for backend traffic.
//!
//! Two semaphores cap concurrent requests: one for small actions (HEAD,
//! DELETE, metadata PUTs) and one for bulk actions (multipart parts, large
//! ranged GETs). Both are bucket-tunable from the mount configuration.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Permit counts for the two gates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Concurrent small actions (HEAD, DELETE, small PUT).
    pub small_permits: usize,
    /// Concurrent bulk actions (multipart parts, readahead GETs).
    pub bulk_permits: usize,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            small_permits: 32,
            bulk_permits: 16,
        }
    }
}

/// The two shared gates, cloned into every worker.
#[derive(Debug, Clone)]
pub struct ThrottleGates {
    small: Arc<Semaphore>,
    bulk: Arc<Semaphore>,
}

impl ThrottleGates {
    /// Builds gates from a configuration.
    pub fn new(config: ThrottleConfig) -> Self {
        debug!(
            "throttle gates: small={} bulk={}",
            config.small_permits, config.bulk_permits
        );
        Self {
            small: Arc::new(Semaphore::new(config.small_permits.max(1))),
            bulk: Arc::new(Semaphore::new(config.bulk_permits.max(1))),
        }
    }

    /// Waits for a small-action permit.
    pub async fn acquire_small(&self) -> OwnedSemaphorePermit {
        // the semaphore is never closed
        self.small
            .clone()
            .acquire_owned()
            .await
            .expect("throttle semaphore closed")
    }

    /// Waits for a bulk-action permit.
    pub async fn acquire_bulk(&self) -> OwnedSemaphorePermit {
        self.bulk
            .clone()
            .acquire_owned()
            .await
            .expect("throttle semaphore closed")
    }

    /// Currently available small permits.
    pub fn small_available(&self) -> usize {
        self.small.available_permits()
    }

    /// Currently available bulk permits.
    pub fn bulk_available(&self) -> usize {
        self.bulk.available_permits()
    }
}

impl Default for ThrottleGates {
    fn default() -> Self {
        Self::new(ThrottleConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_positive_permits() {
        let config = ThrottleConfig::default();
        assert!(config.small_permits > 0);
        assert!(config.bulk_permits > 0);
    }

    #[tokio::test]
    async fn permits_are_returned_on_drop() {
        let gates = ThrottleGates::new(ThrottleConfig {
            small_permits: 2,
            bulk_permits: 1,
        });

        let p1 = gates.acquire_small().await;
        let p2 = gates.acquire_small().await;
        assert_eq!(gates.small_available(), 0);

        drop(p1);
        assert_eq!(gates.small_available(), 1);
        drop(p2);
        assert_eq!(gates.small_available(), 2);
    }

    #[tokio::test]
    async fn gates_are_independent() {
        let gates = ThrottleGates::new(ThrottleConfig {
            small_permits: 1,
            bulk_permits: 1,
        });

        let _small = gates.acquire_small().await;
        // bulk gate is unaffected by the held small permit
        let _bulk = gates.acquire_bulk().await;
        assert_eq!(gates.small_available(), 0);
        assert_eq!(gates.bulk_available(), 0);
    }

    #[tokio::test]
    async fn bulk_waiters_block_until_release() {
        let gates = ThrottleGates::new(ThrottleConfig {
            small_permits: 1,
            bulk_permits: 1,
        });

        let held = gates.acquire_bulk().await;
        let gates2 = gates.clone();
        let waiter = tokio::spawn(async move {
            let _p = gates2.acquire_bulk().await;
        });

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(held);
        waiter.await.unwrap();
    }

    #[test]
    fn zero_permit_config_is_clamped_to_one() {
        let gates = ThrottleGates::new(ThrottleConfig {
            small_permits: 0,
            bulk_permits: 0,
        });
        assert_eq!(gates.small_available(), 1);
        assert_eq!(gates.bulk_available(), 1);
    }
}
