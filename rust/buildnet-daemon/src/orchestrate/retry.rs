//! Bundle execution with retry
//!
//! Explicit retry policy: up to `max_attempts` tries with a linear
//! `base_delay × attempt` back-off, implemented as a loop.

use super::executor::BundleExecutor;
use super::{BuildOptions, BundleOutcome, MicroBundle};
use crate::clock::Clock;
use crate::registry::Resource;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Retry configuration
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Back-off before the next try after `attempt` failures
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1_000),
        }
    }
}

/// Run one bundle on its assigned worker, retrying per policy
///
/// A try counts as successful only when the worker reports success with
/// artifacts; a final success without artifacts is accepted and left to
/// the verify phase to warn about.
pub async fn execute_bundle_with_retry(
    executor: Arc<dyn BundleExecutor>,
    bundle: &MicroBundle,
    worker: &Resource,
    options: &BuildOptions,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
) -> BundleOutcome {
    let attempts = policy.max_attempts.max(1);
    let mut last = BundleOutcome {
        bundle_id: bundle.id.clone(),
        worker_id: worker.id.clone(),
        success: false,
        artifacts: Vec::new(),
        error: Some("bundle was never dispatched".to_string()),
        error_code: Some("EXECUTION_ERROR".to_string()),
        attempts: 0,
    };

    for attempt in 1..=attempts {
        match executor.execute(bundle, worker, options).await {
            Ok(mut outcome) => {
                outcome.attempts = attempt;
                if outcome.success && !outcome.artifacts.is_empty() {
                    return outcome;
                }
                last = outcome;
            }
            Err(e) => {
                last = BundleOutcome {
                    bundle_id: bundle.id.clone(),
                    worker_id: worker.id.clone(),
                    success: false,
                    artifacts: Vec::new(),
                    error: Some(e.to_string()),
                    error_code: Some("EXECUTION_ERROR".to_string()),
                    attempts: attempt,
                };
            }
        }
        if attempt < attempts {
            debug!(
                bundle = %bundle.id,
                attempt,
                "Bundle attempt unsuccessful, backing off"
            );
            clock.sleep(policy.delay_for(attempt)).await;
        }
    }
    last
}

#[cfg(test)]
mod tests {
    use super::super::executor::SimulatedExecutor;
    use super::super::score::prepare_bundles;
    use super::*;
    use crate::clock::ManualClock;
    use crate::registry::{ResourceStatus, ResourceType};
    use buildnet_config::BuildSection;
    use std::collections::BTreeMap;

    fn worker() -> Resource {
        Resource {
            id: "w1".to_string(),
            name: "w1".to_string(),
            resource_type: ResourceType::Worker,
            address: "10.0.0.1:9000".to_string(),
            cpu_cores: 8,
            memory_gb: 16,
            capabilities: BTreeMap::new(),
            labels: BTreeMap::new(),
            status: ResourceStatus::Online,
            last_heartbeat: None,
            registered_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried_to_success() {
        let executor = Arc::new(SimulatedExecutor::new());
        executor.fail_times("core:main", 2);
        let bundles = prepare_bundles(&["core".to_string()], &BuildSection::default());
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
        };

        let outcome = execute_bundle_with_retry(
            executor,
            &bundles[0],
            &worker(),
            &BuildOptions::default(),
            policy,
            Arc::new(ManualClock::default()),
        )
        .await;
        assert!(outcome.success);
        assert_eq!(outcome.attempts, 3);
        assert!(!outcome.artifacts.is_empty());
    }

    #[tokio::test]
    async fn exhausted_retries_report_the_failure() {
        let executor = Arc::new(SimulatedExecutor::new());
        executor.fail_times("core:main", 10);
        let bundles = prepare_bundles(&["core".to_string()], &BuildSection::default());
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(10),
        };

        let outcome = execute_bundle_with_retry(
            executor,
            &bundles[0],
            &worker(),
            &BuildOptions::default(),
            policy,
            Arc::new(ManualClock::default()),
        )
        .await;
        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.error_code.as_deref(), Some("BUILD_ERROR"));
    }

    #[test]
    fn backoff_grows_linearly() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
    }
}
