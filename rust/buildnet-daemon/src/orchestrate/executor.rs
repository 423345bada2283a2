//! Bundle execution seam
//!
//! Concrete bundler adapters (esbuild, rspack, ...) plug in behind the
//! `BundleExecutor` trait as external processes. The simulated executor is
//! the default wiring and the test substrate.

use super::{BuildOptions, BundleOutcome, MicroBundle};
use crate::error::DaemonResult;
use crate::registry::Resource;
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;

/// One attempt at building a bundle on a worker
#[async_trait]
pub trait BundleExecutor: Send + Sync {
    async fn execute(
        &self,
        bundle: &MicroBundle,
        worker: &Resource,
        options: &BuildOptions,
    ) -> DaemonResult<BundleOutcome>;
}

/// In-process executor that fabricates artifacts
///
/// Failures can be scripted per bundle id for retry and aggregation tests.
#[derive(Default)]
pub struct SimulatedExecutor {
    latency: Duration,
    failures: DashMap<String, u32>,
    executions: parking_lot::Mutex<Vec<(String, String)>>,
}

impl SimulatedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Default::default()
        }
    }

    /// Make the next `count` attempts for `bundle_id` fail
    pub fn fail_times(&self, bundle_id: &str, count: u32) {
        self.failures.insert(bundle_id.to_string(), count);
    }

    /// Every `(bundle_id, worker_id)` dispatch seen so far
    pub fn executions(&self) -> Vec<(String, String)> {
        self.executions.lock().clone()
    }
}

#[async_trait]
impl BundleExecutor for SimulatedExecutor {
    async fn execute(
        &self,
        bundle: &MicroBundle,
        worker: &Resource,
        _options: &BuildOptions,
    ) -> DaemonResult<BundleOutcome> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.executions
            .lock()
            .push((bundle.id.clone(), worker.id.clone()));

        if let Some(mut remaining) = self.failures.get_mut(&bundle.id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(BundleOutcome {
                    bundle_id: bundle.id.clone(),
                    worker_id: worker.id.clone(),
                    success: false,
                    artifacts: Vec::new(),
                    error: Some(format!("simulated failure for {}", bundle.id)),
                    error_code: Some("BUILD_ERROR".to_string()),
                    attempts: 0,
                });
            }
        }

        Ok(BundleOutcome {
            bundle_id: bundle.id.clone(),
            worker_id: worker.id.clone(),
            success: true,
            artifacts: vec![format!(
                "dist/{}/{}.js",
                bundle.package,
                bundle.id.replace(':', "-")
            )],
            error: None,
            error_code: None,
            attempts: 0,
        })
    }
}
