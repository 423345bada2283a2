// rust/buildnet-state/src/lib.rs
// State backend contract: abstract KV with TTL, named leases, and pub/sub

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod memory;
pub mod persistent;

pub use memory::MemoryBackend;
pub use persistent::SledBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Backend error types
#[derive(Debug, Error, Clone)]
pub enum BackendError {
    /// The backend is unreachable or failed the operation
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// A stored value could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Opaque token proving ownership of a named lease
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseToken {
    /// Name of the leased resource
    pub resource: String,
    /// Unique holder id for this acquisition
    pub token: Uuid,
}

/// Receiving half of a pub/sub subscription
///
/// Messages published after the subscription was created are delivered in
/// publish order. A lagging subscriber may lose the oldest messages.
pub struct Subscription {
    rx: tokio::sync::broadcast::Receiver<Value>,
}

impl Subscription {
    pub(crate) fn new(rx: tokio::sync::broadcast::Receiver<Value>) -> Self {
        Self { rx }
    }

    /// Wait for the next message on the channel
    ///
    /// Returns `None` once the channel is closed. Lagged messages are
    /// skipped rather than surfaced as errors.
    pub async fn recv(&mut self) -> Option<Value> {
        loop {
            match self.rx.recv().await {
                Ok(value) => return Some(value),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Poll for a message without waiting
    pub fn try_recv(&mut self) -> Option<Value> {
        loop {
            match self.rx.try_recv() {
                Ok(value) => return Some(value),
                Err(tokio::sync::broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

/// Abstract key/value store with TTL, named leases, and pub/sub.
///
/// The contract is logically single-key-strongly-consistent: a `get` after a
/// local `set` never returns a stale value. No cross-key transactions are
/// offered; callers must never require multi-key atomicity. TTL expiration
/// may be lazy: an expired key is reported absent on next access.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Read a value, or `None` if absent or expired
    async fn get(&self, key: &str) -> BackendResult<Option<Value>>;

    /// Write a value, optionally expiring after `ttl`
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> BackendResult<()>;

    /// Delete a key; returns whether it existed
    async fn delete(&self, key: &str) -> BackendResult<bool>;

    /// List keys with the given prefix, in lexicographic order
    async fn keys(&self, prefix: &str) -> BackendResult<Vec<String>>;

    /// Atomically write `value` only if `key` is absent; returns acceptance
    async fn set_if_absent(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> BackendResult<bool>;

    /// Acquire a named lease for mutual exclusion, or `None` if held
    async fn acquire_lease(
        &self,
        resource: &str,
        ttl: Duration,
    ) -> BackendResult<Option<LeaseToken>>;

    /// Extend a held lease; returns false if the token no longer holds it
    async fn renew_lease(&self, token: &LeaseToken, ttl: Duration) -> BackendResult<bool>;

    /// Release a held lease (no-op if the token no longer holds it)
    async fn release_lease(&self, token: &LeaseToken) -> BackendResult<()>;

    /// Publish a message to a channel
    async fn publish(&self, channel: &str, message: Value) -> BackendResult<()>;

    /// Subscribe to a channel; messages published afterwards are delivered
    async fn subscribe(&self, channel: &str) -> BackendResult<Subscription>;
}
