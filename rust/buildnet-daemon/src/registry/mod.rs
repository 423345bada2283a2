//! Resource registry
//!
//! Live catalog of workers and other resources: hot add/remove, drain,
//! heartbeat-driven health transitions. The registry exclusively owns
//! resource records; everything else holds ids. Every mutation records
//! through the ledger before it is published on the bus.

use crate::clock::Clock;
use crate::error::{DaemonError, DaemonResult};
use crate::events::EventBus;
use buildnet_config::WorkerSection;
use buildnet_ledger::{Actor, Ledger};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

/// Kind of capacity a resource provides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Worker,
    Storage,
    Cache,
}

/// Health state of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    Online,
    Draining,
    Offline,
    Unhealthy,
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceStatus::Online => write!(f, "online"),
            ResourceStatus::Draining => write!(f, "draining"),
            ResourceStatus::Offline => write!(f, "offline"),
            ResourceStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// One addressable capacity unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    pub address: String,
    pub cpu_cores: u32,
    pub memory_gb: u32,
    #[serde(default)]
    pub capabilities: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub status: ResourceStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
}

/// Input for `add`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Explicit id; generated when absent
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    pub address: String,
    #[serde(default)]
    pub cpu_cores: u32,
    #[serde(default)]
    pub memory_gb: u32,
    #[serde(default)]
    pub capabilities: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Partial update for `update`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceUpdate {
    pub name: Option<String>,
    pub address: Option<String>,
    pub cpu_cores: Option<u32>,
    pub memory_gb: Option<u32>,
    pub capabilities: Option<BTreeMap<String, String>>,
    pub labels: Option<BTreeMap<String, String>>,
}

/// Aggregate counters for dashboards
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total: usize,
    pub by_type: BTreeMap<String, usize>,
    pub by_status: BTreeMap<String, usize>,
    pub online_cpu_cores: u64,
    pub online_memory_gb: u64,
}

/// Registry of resources with health scanning
pub struct ResourceRegistry {
    resources: RwLock<HashMap<String, Resource>>,
    /// resource id -> claiming session ids
    claims: RwLock<HashMap<String, BTreeSet<String>>>,
    ledger: Arc<Ledger>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    config: WorkerSection,
}

impl ResourceRegistry {
    pub fn new(
        ledger: Arc<Ledger>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        config: WorkerSection,
    ) -> Self {
        Self {
            resources: RwLock::new(HashMap::new()),
            claims: RwLock::new(HashMap::new()),
            ledger,
            bus,
            clock,
            config,
        }
    }

    fn state_of(resource: &Resource) -> DaemonResult<serde_json::Value> {
        serde_json::to_value(resource)
            .map_err(|e| DaemonError::Internal(format!("Resource serialization error: {}", e)))
    }

    /// Register a resource
    pub async fn add(&self, spec: ResourceSpec, actor: &Actor) -> DaemonResult<Resource> {
        let resource = Resource {
            id: spec.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            name: spec.name,
            resource_type: spec.resource_type,
            address: spec.address,
            cpu_cores: spec.cpu_cores,
            memory_gb: spec.memory_gb,
            capabilities: spec.capabilities,
            labels: spec.labels,
            status: ResourceStatus::Online,
            last_heartbeat: None,
            registered_at: self.clock.now(),
        };

        let mut resources = self.resources.write().await;
        if resources.contains_key(&resource.id) {
            return Err(DaemonError::ConflictingState(format!(
                "resource {} already registered",
                resource.id
            )));
        }
        self.ledger
            .record_change(
                "resource",
                &resource.id,
                None,
                Some(Self::state_of(&resource)?),
                actor,
                "resource added",
                None,
            )
            .await?;
        resources.insert(resource.id.clone(), resource.clone());
        drop(resources);

        info!(id = %resource.id, name = %resource.name, "Resource added");
        self.bus.emit(
            "resource:added",
            json!({"resource_id": resource.id, "type": resource.resource_type}),
        );
        Ok(resource)
    }

    /// Look up a resource by id
    pub async fn get(&self, id: &str) -> Option<Resource> {
        let resources = self.resources.read().await;
        resources.get(id).cloned()
    }

    /// All resources, ordered by id
    pub async fn list(&self) -> Vec<Resource> {
        let resources = self.resources.read().await;
        let mut all: Vec<Resource> = resources.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Apply a partial update
    pub async fn update(
        &self,
        id: &str,
        fields: ResourceUpdate,
        actor: &Actor,
    ) -> DaemonResult<Resource> {
        let mut resources = self.resources.write().await;
        let resource = resources.get_mut(id).ok_or_else(|| DaemonError::NotFound {
            entity: "resource",
            id: id.to_string(),
        })?;

        let previous = Self::state_of(resource)?;
        if let Some(name) = fields.name {
            resource.name = name;
        }
        if let Some(address) = fields.address {
            resource.address = address;
        }
        if let Some(cpu_cores) = fields.cpu_cores {
            resource.cpu_cores = cpu_cores;
        }
        if let Some(memory_gb) = fields.memory_gb {
            resource.memory_gb = memory_gb;
        }
        if let Some(capabilities) = fields.capabilities {
            resource.capabilities = capabilities;
        }
        if let Some(labels) = fields.labels {
            resource.labels = labels;
        }
        let updated = resource.clone();
        self.ledger
            .record_change(
                "resource",
                id,
                Some(previous),
                Some(Self::state_of(&updated)?),
                actor,
                "resource updated",
                None,
            )
            .await?;
        drop(resources);

        self.bus
            .emit("resource:updated", json!({"resource_id": id}));
        Ok(updated)
    }

    /// Remove a resource
    ///
    /// Fails with ConflictingState while claims exist, unless `force`.
    /// Forced removal publishes `resource:forced_removal` so the session
    /// manager can release stale claims.
    pub async fn remove(&self, id: &str, actor: &Actor, force: bool) -> DaemonResult<()> {
        let claimed_by: Vec<String> = {
            let claims = self.claims.read().await;
            claims
                .get(id)
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default()
        };
        if !claimed_by.is_empty() && !force {
            return Err(DaemonError::ConflictingState(format!(
                "resource {} has {} active claims",
                id,
                claimed_by.len()
            )));
        }

        let mut resources = self.resources.write().await;
        let resource = resources.get(id).cloned().ok_or_else(|| DaemonError::NotFound {
            entity: "resource",
            id: id.to_string(),
        })?;
        self.ledger
            .record_change(
                "resource",
                id,
                Some(Self::state_of(&resource)?),
                None,
                actor,
                if force { "resource removed (forced)" } else { "resource removed" },
                None,
            )
            .await?;
        resources.remove(id);
        drop(resources);

        let mut claims = self.claims.write().await;
        claims.remove(id);
        drop(claims);

        if force && !claimed_by.is_empty() {
            warn!(id, sessions = claimed_by.len(), "Forced removal with active claims");
            self.bus.emit(
                "resource:forced_removal",
                json!({"resource_id": id, "sessions": claimed_by}),
            );
        }
        self.bus.emit("resource:removed", json!({"resource_id": id}));
        Ok(())
    }

    async fn transition(
        &self,
        id: &str,
        to: ResourceStatus,
        actor: &Actor,
        reason: &str,
        topic: &str,
    ) -> DaemonResult<Resource> {
        let mut resources = self.resources.write().await;
        let resource = resources.get_mut(id).ok_or_else(|| DaemonError::NotFound {
            entity: "resource",
            id: id.to_string(),
        })?;
        let previous = Self::state_of(resource)?;
        resource.status = to;
        let updated = resource.clone();
        self.ledger
            .record_change(
                "resource",
                id,
                Some(previous),
                Some(Self::state_of(&updated)?),
                actor,
                reason,
                None,
            )
            .await?;
        drop(resources);

        self.bus
            .emit(topic, json!({"resource_id": id, "status": to}));
        Ok(updated)
    }

    /// Stop assigning new work to a resource; existing claims finish
    pub async fn drain(&self, id: &str, actor: &Actor) -> DaemonResult<Resource> {
        self.transition(id, ResourceStatus::Draining, actor, "resource draining", "resource:draining")
            .await
    }

    /// Bring a drained resource back online
    pub async fn resume(&self, id: &str, actor: &Actor) -> DaemonResult<Resource> {
        self.transition(id, ResourceStatus::Online, actor, "resource resumed", "resource:resumed")
            .await
    }

    /// Workers eligible for new assignments: `type=worker AND status=online`
    pub async fn get_available_workers(&self) -> Vec<Resource> {
        let resources = self.resources.read().await;
        let mut workers: Vec<Resource> = resources
            .values()
            .filter(|r| {
                r.resource_type == ResourceType::Worker && r.status == ResourceStatus::Online
            })
            .cloned()
            .collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        workers
    }

    /// Aggregate counters
    pub async fn get_stats(&self) -> RegistryStats {
        let resources = self.resources.read().await;
        let mut by_type: BTreeMap<String, usize> = BTreeMap::new();
        let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
        let mut online_cpu_cores = 0u64;
        let mut online_memory_gb = 0u64;
        for resource in resources.values() {
            *by_type
                .entry(format!("{:?}", resource.resource_type).to_lowercase())
                .or_insert(0) += 1;
            *by_status.entry(resource.status.to_string()).or_insert(0) += 1;
            if resource.status == ResourceStatus::Online {
                online_cpu_cores += u64::from(resource.cpu_cores);
                online_memory_gb += u64::from(resource.memory_gb);
            }
        }
        RegistryStats {
            total: resources.len(),
            by_type,
            by_status,
            online_cpu_cores,
            online_memory_gb,
        }
    }

    /// Record a liveness message from a worker
    ///
    /// A heartbeat while unhealthy (within the grace window) revives the
    /// resource to online.
    pub async fn record_heartbeat(&self, id: &str) -> DaemonResult<()> {
        let revive = {
            let mut resources = self.resources.write().await;
            let Some(resource) = resources.get_mut(id) else {
                return Ok(()); // Unknown workers can heartbeat before registration
            };
            resource.last_heartbeat = Some(self.clock.now());
            resource.status == ResourceStatus::Unhealthy
        };
        if revive {
            self.transition(
                id,
                ResourceStatus::Online,
                &Actor::system(),
                "heartbeat recovered",
                "resource:recovered",
            )
            .await?;
        }
        Ok(())
    }

    /// One pass of the missed-heartbeat detector
    ///
    /// Online workers silent past `missed_threshold × heartbeat_interval`
    /// become unhealthy; anything silent past `hard_eject` goes offline.
    pub async fn run_health_scan_once(&self) -> DaemonResult<()> {
        let now = self.clock.now();
        let unhealthy_after =
            chrono::Duration::seconds(
                (self.config.heartbeat_interval_secs * u64::from(self.config.missed_threshold))
                    as i64,
            );
        let eject_after = chrono::Duration::seconds(self.config.hard_eject_secs as i64);

        let candidates: Vec<(String, ResourceStatus, chrono::Duration)> = {
            let resources = self.resources.read().await;
            resources
                .values()
                .filter(|r| r.resource_type == ResourceType::Worker)
                .map(|r| {
                    let baseline = r.last_heartbeat.unwrap_or(r.registered_at);
                    (r.id.clone(), r.status, now - baseline)
                })
                .collect()
        };

        for (id, status, silence) in candidates {
            if status != ResourceStatus::Offline && silence >= eject_after {
                warn!(id = %id, "Worker silent past hard-eject window");
                self.transition(
                    &id,
                    ResourceStatus::Offline,
                    &Actor::system(),
                    "heartbeat hard eject",
                    "resource:offline",
                )
                .await?;
            } else if status == ResourceStatus::Online && silence >= unhealthy_after {
                self.transition(
                    &id,
                    ResourceStatus::Unhealthy,
                    &Actor::system(),
                    "heartbeat missed",
                    "resource:unhealthy",
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Attach a session claim; accepted only while the resource is online
    pub async fn claim(&self, resource_id: &str, session_id: &str) -> DaemonResult<bool> {
        let resources = self.resources.read().await;
        let resource = resources
            .get(resource_id)
            .ok_or_else(|| DaemonError::NotFound {
                entity: "resource",
                id: resource_id.to_string(),
            })?;
        if resource.status != ResourceStatus::Online {
            return Ok(false);
        }
        drop(resources);

        let mut claims = self.claims.write().await;
        claims
            .entry(resource_id.to_string())
            .or_default()
            .insert(session_id.to_string());
        Ok(true)
    }

    /// Release a session claim
    pub async fn release(&self, resource_id: &str, session_id: &str) {
        let mut claims = self.claims.write().await;
        if let Some(holders) = claims.get_mut(resource_id) {
            holders.remove(session_id);
            if holders.is_empty() {
                claims.remove(resource_id);
            }
        }
    }

    /// Number of active claims on a resource
    pub async fn claim_count(&self, resource_id: &str) -> usize {
        let claims = self.claims.read().await;
        claims.get(resource_id).map(BTreeSet::len).unwrap_or(0)
    }
}
