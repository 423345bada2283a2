//! In-memory state backend
//!
//! Reference implementation of the backend contract. Default wiring for a
//! single-process daemon and the substrate for tests.

use crate::{BackendError, BackendResult, LeaseToken, StateBackend, Subscription};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// Capacity of each pub/sub channel before slow subscribers lag
const CHANNEL_CAPACITY: usize = 256;

struct StoredValue {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredValue {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

struct LeaseRecord {
    token: Uuid,
    expires_at: DateTime<Utc>,
}

/// In-memory backend: TTL-aware ordered map, lease table, broadcast pub/sub
#[derive(Default)]
pub struct MemoryBackend {
    entries: RwLock<BTreeMap<String, StoredValue>>,
    leases: RwLock<HashMap<String, LeaseRecord>>,
    channels: RwLock<HashMap<String, broadcast::Sender<Value>>>,
}

impl MemoryBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }

    fn expiry_from(ttl: Option<Duration>) -> BackendResult<Option<DateTime<Utc>>> {
        match ttl {
            None => Ok(None),
            Some(ttl) => {
                let delta = chrono::Duration::from_std(ttl)
                    .map_err(|e| BackendError::Serialization(format!("Invalid TTL: {}", e)))?;
                Ok(Some(Utc::now() + delta))
            }
        }
    }

    async fn sender_for(&self, channel: &str) -> broadcast::Sender<Value> {
        let mut channels = self.channels.write().await;
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl StateBackend for MemoryBackend {
    async fn get(&self, key: &str) -> BackendResult<Option<Value>> {
        let now = Utc::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                None => return Ok(None),
                Some(stored) if !stored.is_expired(now) => {
                    return Ok(Some(stored.value.clone()));
                }
                Some(_) => {}
            }
        }
        // Lazy TTL: drop the expired entry on access
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|s| s.is_expired(now)) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> BackendResult<()> {
        let expires_at = Self::expiry_from(ttl)?;
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), StoredValue { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> BackendResult<bool> {
        let mut entries = self.entries.write().await;
        Ok(entries.remove(key).is_some())
    }

    async fn keys(&self, prefix: &str) -> BackendResult<Vec<String>> {
        let now = Utc::now();
        let entries = self.entries.read().await;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, v)| !v.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> BackendResult<bool> {
        let now = Utc::now();
        let expires_at = Self::expiry_from(ttl)?;
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|s| !s.is_expired(now)) {
            return Ok(false);
        }
        entries.insert(key.to_string(), StoredValue { value, expires_at });
        Ok(true)
    }

    async fn acquire_lease(
        &self,
        resource: &str,
        ttl: Duration,
    ) -> BackendResult<Option<LeaseToken>> {
        let now = Utc::now();
        let delta = chrono::Duration::from_std(ttl)
            .map_err(|e| BackendError::Serialization(format!("Invalid TTL: {}", e)))?;
        let mut leases = self.leases.write().await;
        if leases.get(resource).is_some_and(|l| l.expires_at > now) {
            return Ok(None);
        }
        let token = Uuid::new_v4();
        leases.insert(
            resource.to_string(),
            LeaseRecord {
                token,
                expires_at: now + delta,
            },
        );
        Ok(Some(LeaseToken {
            resource: resource.to_string(),
            token,
        }))
    }

    async fn renew_lease(&self, token: &LeaseToken, ttl: Duration) -> BackendResult<bool> {
        let now = Utc::now();
        let delta = chrono::Duration::from_std(ttl)
            .map_err(|e| BackendError::Serialization(format!("Invalid TTL: {}", e)))?;
        let mut leases = self.leases.write().await;
        match leases.get_mut(&token.resource) {
            Some(lease) if lease.token == token.token && lease.expires_at > now => {
                lease.expires_at = now + delta;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lease(&self, token: &LeaseToken) -> BackendResult<()> {
        let mut leases = self.leases.write().await;
        if leases
            .get(&token.resource)
            .is_some_and(|l| l.token == token.token)
        {
            leases.remove(&token.resource);
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, message: Value) -> BackendResult<()> {
        let sender = self.sender_for(channel).await;
        // A publish with no subscribers is not an error
        let _ = sender.send(message);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> BackendResult<Subscription> {
        let sender = self.sender_for(channel).await;
        Ok(Subscription::new(sender.subscribe()))
    }
}
