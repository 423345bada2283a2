//! Sled-backed persistent state backend
//!
//! Same contract as the memory backend with durable storage: one sled tree
//! for values, one for leases, flush on every write. Pub/sub stays
//! process-local; cross-process channels belong to an external backend.

use crate::{BackendError, BackendResult, LeaseToken, StateBackend, Subscription};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

impl Envelope {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LeaseEnvelope {
    token: Uuid,
    expires_at: DateTime<Utc>,
}

/// Persistent backend over a sled database
pub struct SledBackend {
    values: sled::Tree,
    leases: sled::Tree,
    channels: RwLock<HashMap<String, broadcast::Sender<Value>>>,
}

fn db_err(e: impl std::fmt::Display) -> BackendError {
    BackendError::Unavailable(format!("Database error: {}", e))
}

fn codec_err(e: impl std::fmt::Display) -> BackendError {
    BackendError::Serialization(format!("Serialization error: {}", e))
}

impl SledBackend {
    /// Open (or create) a backend at the given directory
    pub fn open<P: AsRef<Path>>(path: P) -> BackendResult<Self> {
        let db = sled::open(path).map_err(db_err)?;
        let values = db.open_tree("values").map_err(db_err)?;
        let leases = db.open_tree("leases").map_err(db_err)?;
        Ok(Self {
            values,
            leases,
            channels: RwLock::new(HashMap::new()),
        })
    }

    fn expiry_from(ttl: Option<Duration>) -> BackendResult<Option<DateTime<Utc>>> {
        match ttl {
            None => Ok(None),
            Some(ttl) => {
                let delta = chrono::Duration::from_std(ttl)
                    .map_err(|e| codec_err(format!("Invalid TTL: {}", e)))?;
                Ok(Some(Utc::now() + delta))
            }
        }
    }

    fn read_envelope(&self, key: &str) -> BackendResult<Option<Envelope>> {
        match self.values.get(key.as_bytes()).map_err(db_err)? {
            None => Ok(None),
            Some(bytes) => {
                let envelope: Envelope = serde_json::from_slice(&bytes).map_err(codec_err)?;
                Ok(Some(envelope))
            }
        }
    }

    fn flush(&self) -> BackendResult<()> {
        self.values.flush().map_err(db_err)?;
        Ok(())
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
impl StateBackend for SledBackend {
    async fn get(&self, key: &str) -> BackendResult<Option<Value>> {
        let now = Utc::now();
        match self.read_envelope(key)? {
            None => Ok(None),
            Some(envelope) if envelope.is_expired(now) => {
                // Lazy TTL: drop the expired entry on access
                self.values.remove(key.as_bytes()).map_err(db_err)?;
                Ok(None)
            }
            Some(envelope) => Ok(Some(envelope.value)),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> BackendResult<()> {
        let envelope = Envelope {
            value,
            expires_at: Self::expiry_from(ttl)?,
        };
        let bytes = serde_json::to_vec(&envelope).map_err(codec_err)?;
        self.values.insert(key.as_bytes(), bytes).map_err(db_err)?;
        self.flush()
    }

    async fn delete(&self, key: &str) -> BackendResult<bool> {
        let existed = self.values.remove(key.as_bytes()).map_err(db_err)?.is_some();
        self.flush()?;
        Ok(existed)
    }

    async fn keys(&self, prefix: &str) -> BackendResult<Vec<String>> {
        let now = Utc::now();
        let mut keys = Vec::new();
        for item in self.values.scan_prefix(prefix.as_bytes()) {
            let (key, bytes) = item.map_err(db_err)?;
            let envelope: Envelope = serde_json::from_slice(&bytes).map_err(codec_err)?;
            if envelope.is_expired(now) {
                continue;
            }
            let key = String::from_utf8(key.to_vec())
                .map_err(|e| codec_err(format!("Non-UTF8 key: {}", e)))?;
            keys.push(key);
        }
        Ok(keys)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> BackendResult<bool> {
        let now = Utc::now();
        let envelope = Envelope {
            value,
            expires_at: Self::expiry_from(ttl)?,
        };
        let bytes = serde_json::to_vec(&envelope).map_err(codec_err)?;
        let current = self.values.get(key.as_bytes()).map_err(db_err)?;
        if let Some(existing) = &current {
            let existing: Envelope = serde_json::from_slice(existing).map_err(codec_err)?;
            if !existing.is_expired(now) {
                return Ok(false);
            }
        }
        let swapped = self
            .values
            .compare_and_swap(key.as_bytes(), current, Some(bytes))
            .map_err(db_err)?
            .is_ok();
        if swapped {
            self.flush()?;
        }
        Ok(swapped)
    }

    async fn acquire_lease(
        &self,
        resource: &str,
        ttl: Duration,
    ) -> BackendResult<Option<LeaseToken>> {
        let now = Utc::now();
        let delta = chrono::Duration::from_std(ttl)
            .map_err(|e| codec_err(format!("Invalid TTL: {}", e)))?;
        let current = self.leases.get(resource.as_bytes()).map_err(db_err)?;
        if let Some(existing) = &current {
            let existing: LeaseEnvelope = serde_json::from_slice(existing).map_err(codec_err)?;
            if existing.expires_at > now {
                return Ok(None);
            }
        }
        let token = Uuid::new_v4();
        let envelope = LeaseEnvelope {
            token,
            expires_at: now + delta,
        };
        let bytes = serde_json::to_vec(&envelope).map_err(codec_err)?;
        let swapped = self
            .leases
            .compare_and_swap(resource.as_bytes(), current, Some(bytes))
            .map_err(db_err)?
            .is_ok();
        if !swapped {
            return Ok(None);
        }
        self.leases.flush().map_err(db_err)?;
        Ok(Some(LeaseToken {
            resource: resource.to_string(),
            token,
        }))
    }

    async fn renew_lease(&self, token: &LeaseToken, ttl: Duration) -> BackendResult<bool> {
        let now = Utc::now();
        let delta = chrono::Duration::from_std(ttl)
            .map_err(|e| codec_err(format!("Invalid TTL: {}", e)))?;
        let current = self.leases.get(token.resource.as_bytes()).map_err(db_err)?;
        let Some(existing_bytes) = current else {
            return Ok(false);
        };
        let existing: LeaseEnvelope =
            serde_json::from_slice(&existing_bytes).map_err(codec_err)?;
        if existing.token != token.token || existing.expires_at <= now {
            return Ok(false);
        }
        let renewed = LeaseEnvelope {
            token: token.token,
            expires_at: now + delta,
        };
        let bytes = serde_json::to_vec(&renewed).map_err(codec_err)?;
        let swapped = self
            .leases
            .compare_and_swap(
                token.resource.as_bytes(),
                Some(existing_bytes),
                Some(bytes),
            )
            .map_err(db_err)?
            .is_ok();
        Ok(swapped)
    }

    async fn release_lease(&self, token: &LeaseToken) -> BackendResult<()> {
        let current = self.leases.get(token.resource.as_bytes()).map_err(db_err)?;
        if let Some(existing_bytes) = current {
            let existing: LeaseEnvelope =
                serde_json::from_slice(&existing_bytes).map_err(codec_err)?;
            if existing.token == token.token {
                let _ = self
                    .leases
                    .compare_and_swap(
                        token.resource.as_bytes(),
                        Some(existing_bytes),
                        None::<&[u8]>,
                    )
                    .map_err(db_err)?;
                self.leases.flush().map_err(db_err)?;
            }
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, message: Value) -> BackendResult<()> {
        let sender = self.sender_for(channel).await;
        let _ = sender.send(message);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> BackendResult<Subscription> {
        let sender = self.sender_for(channel).await;
        Ok(Subscription::new(sender.subscribe()))
    }
}
