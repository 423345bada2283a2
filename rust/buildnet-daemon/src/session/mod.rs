//! Session manager
//!
//! Tracks live sessions, their permissions, one in-flight activity per
//! session, and resource claims. The manager exclusively owns session
//! records; every mutation records through the ledger with permissions
//! sanitized to flat strings.

pub mod model;

pub use model::{
    resolve_permissions, Activity, ActivityLogLine, ActivitySpec, ConnectionType, PermissionSet,
    Session, SessionParams,
};

use crate::clock::Clock;
use crate::error::{DaemonError, DaemonResult};
use crate::events::EventBus;
use crate::registry::ResourceRegistry;
use buildnet_config::SessionSection;
use buildnet_ledger::{Actor, ActorKind, Ledger};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// Manager of live sessions
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Session>>,
    ledger: Arc<Ledger>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    registry: Arc<ResourceRegistry>,
    config: SessionSection,
}

impl SessionManager {
    pub fn new(
        ledger: Arc<Ledger>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        registry: Arc<ResourceRegistry>,
        config: SessionSection,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ledger,
            bus,
            clock,
            registry,
            config,
        }
    }

    fn not_found(id: &str) -> DaemonError {
        DaemonError::NotFound {
            entity: "session",
            id: id.to_string(),
        }
    }

    /// Create a session, resolving permissions from kind and scopes
    pub async fn create(&self, params: SessionParams) -> DaemonResult<Session> {
        let mut sessions = self.sessions.write().await;
        let active_for_actor = sessions
            .values()
            .filter(|s| s.actor.id == params.actor.id)
            .count();
        if active_for_actor >= self.config.max_sessions_per_actor {
            return Err(DaemonError::SessionQuotaExceeded {
                actor_id: params.actor.id.clone(),
                max: self.config.max_sessions_per_actor,
            });
        }

        let now = self.clock.now();
        let session = Session {
            session_id: Uuid::new_v4().to_string(),
            actor_type: params.actor.kind,
            permissions: resolve_permissions(params.actor.kind, &params.scopes),
            actor: params.actor,
            connected_at: now,
            last_activity: now,
            connection_type: params.connection_type,
            client_info: params.client_info,
            scopes: params.scopes,
            current_activity: None,
            activity_history: Vec::new(),
            claimed_resources: Vec::new(),
        };
        self.ledger
            .record_change(
                "session",
                &session.session_id,
                None,
                Some(session.audit_state()),
                &session.actor,
                "session created",
                None,
            )
            .await?;
        sessions.insert(session.session_id.clone(), session.clone());
        drop(sessions);

        info!(session_id = %session.session_id, actor = %session.actor.id, "Session created");
        self.bus.emit(
            "session:created",
            json!({"session_id": session.session_id, "actor_id": session.actor.id}),
        );
        Ok(session)
    }

    /// End a session, releasing claims and closing any running activity
    pub async fn end(&self, id: &str, reason: Option<&str>) -> DaemonResult<()> {
        let mut sessions = self.sessions.write().await;
        let mut session = sessions.get(id).cloned().ok_or_else(|| Self::not_found(id))?;

        if session.current_activity.is_some() {
            self.close_current_activity(&mut session, "session ended")
                .await?;
        }
        for resource_id in &session.claimed_resources {
            self.registry.release(resource_id, id).await;
        }

        let reason = reason.unwrap_or("session ended");
        self.ledger
            .record_change(
                "session",
                id,
                Some(session.audit_state()),
                None,
                &session.actor,
                reason,
                None,
            )
            .await?;
        sessions.remove(id);
        drop(sessions);

        info!(session_id = %id, reason, "Session ended");
        self.bus
            .emit("session:ended", json!({"session_id": id, "reason": reason}));
        Ok(())
    }

    /// Look up a session
    pub async fn get(&self, id: &str) -> Option<Session> {
        let sessions = self.sessions.read().await;
        sessions.get(id).cloned()
    }

    /// All live sessions, ordered by connect time
    pub async fn list_active(&self) -> Vec<Session> {
        let sessions = self.sessions.read().await;
        let mut all: Vec<Session> = sessions.values().cloned().collect();
        all.sort_by_key(|s| s.connected_at);
        all
    }

    /// Sessions belonging to one actor
    pub async fn by_actor(&self, actor_id: &str) -> Vec<Session> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .filter(|s| s.actor.id == actor_id)
            .cloned()
            .collect()
    }

    /// Sessions of one actor kind
    pub async fn by_type(&self, kind: ActorKind) -> Vec<Session> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .filter(|s| s.actor_type == kind)
            .cloned()
            .collect()
    }

    /// Refresh a session's last-activity stamp
    pub async fn touch(&self, id: &str) -> DaemonResult<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        let previous = session.audit_state();
        session.last_activity = self.clock.now();
        let actor = session.actor.clone();
        let current = session.audit_state();
        self.ledger
            .record_change("session", id, Some(previous), Some(current), &actor, "session touched", None)
            .await?;
        Ok(())
    }

    async fn close_current_activity(
        &self,
        session: &mut Session,
        reason: &str,
    ) -> DaemonResult<()> {
        let Some(mut activity) = session.current_activity.take() else {
            return Ok(());
        };
        activity.ended_at = Some(self.clock.now());
        self.ledger
            .record_change(
                "activity",
                &activity.activity_id,
                Some(activity.audit_state()),
                None,
                &session.actor,
                reason,
                None,
            )
            .await?;
        session.activity_history.push(activity);
        // Bounded ring: drop oldest
        while session.activity_history.len() > self.config.activity_history_limit {
            session.activity_history.remove(0);
        }
        Ok(())
    }

    /// Start an activity; any running activity is implicitly ended first
    pub async fn start_activity(&self, id: &str, spec: ActivitySpec) -> DaemonResult<Activity> {
        let mut sessions = self.sessions.write().await;
        let mut session = sessions.get(id).cloned().ok_or_else(|| Self::not_found(id))?;

        self.close_current_activity(&mut session, "superseded by new activity")
            .await?;

        let activity = Activity {
            activity_id: Uuid::new_v4().to_string(),
            activity_type: spec.activity_type,
            started_at: self.clock.now(),
            ended_at: None,
            progress: spec.progress,
            logs: Vec::new(),
            artifacts: Vec::new(),
        };
        self.ledger
            .record_change(
                "activity",
                &activity.activity_id,
                None,
                Some(activity.audit_state()),
                &session.actor,
                "activity started",
                None,
            )
            .await?;
        session.current_activity = Some(activity.clone());
        session.last_activity = self.clock.now();
        sessions.insert(id.to_string(), session);
        drop(sessions);

        debug!(session_id = %id, activity_id = %activity.activity_id, "Activity started");
        self.bus.emit(
            "activity:started",
            json!({"session_id": id, "activity_id": activity.activity_id}),
        );
        Ok(activity)
    }

    /// Merge keys into the running activity's progress map
    pub async fn update_activity_progress(
        &self,
        id: &str,
        delta: BTreeMap<String, Value>,
    ) -> DaemonResult<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        let actor = session.actor.clone();
        let activity = session
            .current_activity
            .as_mut()
            .ok_or_else(|| DaemonError::ConflictingState(format!("session {} has no activity", id)))?;

        let previous = activity.audit_state();
        activity.progress.extend(delta);
        let current = activity.audit_state();
        let activity_id = activity.activity_id.clone();
        session.last_activity = self.clock.now();
        self.ledger
            .record_change(
                "activity",
                &activity_id,
                Some(previous),
                Some(current),
                &actor,
                "activity progress",
                None,
            )
            .await?;
        Ok(())
    }

    /// Append a log line to the running activity's bounded ring
    pub async fn add_activity_log(
        &self,
        id: &str,
        level: &str,
        message: &str,
    ) -> DaemonResult<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        let actor = session.actor.clone();
        let limit = self.config.activity_log_limit;
        let now = self.clock.now();
        let activity = session
            .current_activity
            .as_mut()
            .ok_or_else(|| DaemonError::ConflictingState(format!("session {} has no activity", id)))?;

        let previous = activity.audit_state();
        activity.logs.push(ActivityLogLine {
            level: level.to_string(),
            message: message.to_string(),
            timestamp: now,
        });
        while activity.logs.len() > limit {
            activity.logs.remove(0);
        }
        let current = activity.audit_state();
        let activity_id = activity.activity_id.clone();
        self.ledger
            .record_change(
                "activity",
                &activity_id,
                Some(previous),
                Some(current),
                &actor,
                "activity log",
                None,
            )
            .await?;
        Ok(())
    }

    /// End the running activity explicitly
    pub async fn end_activity(&self, id: &str) -> DaemonResult<()> {
        let mut sessions = self.sessions.write().await;
        let mut session = sessions.get(id).cloned().ok_or_else(|| Self::not_found(id))?;
        self.close_current_activity(&mut session, "activity ended")
            .await?;
        session.last_activity = self.clock.now();
        sessions.insert(id.to_string(), session);
        Ok(())
    }

    /// Claim a resource for a session
    ///
    /// Accepted only when the session holds `resources:claim` (or a
    /// wildcard) and the resource is online.
    pub async fn claim_resource(&self, id: &str, resource_id: &str) -> DaemonResult<bool> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        if !session.allows("resources", "claim") {
            return Ok(false);
        }
        if !self.registry.claim(resource_id, id).await? {
            return Ok(false);
        }

        let previous = session.audit_state();
        if !session.claimed_resources.iter().any(|r| r == resource_id) {
            session.claimed_resources.push(resource_id.to_string());
        }
        session.last_activity = self.clock.now();
        let actor = session.actor.clone();
        let current = session.audit_state();
        self.ledger
            .record_change(
                "session",
                id,
                Some(previous),
                Some(current),
                &actor,
                "resource claimed",
                None,
            )
            .await?;
        drop(sessions);

        self.bus.emit(
            "session:resource_claimed",
            json!({"session_id": id, "resource_id": resource_id}),
        );
        Ok(true)
    }

    /// Release a claimed resource
    pub async fn release_resource(&self, id: &str, resource_id: &str) -> DaemonResult<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        self.registry.release(resource_id, id).await;

        let previous = session.audit_state();
        session.claimed_resources.retain(|r| r != resource_id);
        session.last_activity = self.clock.now();
        let actor = session.actor.clone();
        let current = session.audit_state();
        self.ledger
            .record_change(
                "session",
                id,
                Some(previous),
                Some(current),
                &actor,
                "resource released",
                None,
            )
            .await?;
        Ok(())
    }

    /// Drop every claim on a resource (forced-removal compensation)
    pub async fn release_claims_for_resource(&self, resource_id: &str) -> DaemonResult<()> {
        let holders: Vec<String> = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .filter(|s| s.claimed_resources.iter().any(|r| r == resource_id))
                .map(|s| s.session_id.clone())
                .collect()
        };
        for session_id in holders {
            self.release_resource(&session_id, resource_id).await?;
        }
        Ok(())
    }

    /// One pass of the idle-session scanner
    ///
    /// Sessions idle past `session_timeout` end with reason `timeout`.
    /// Returns the number of sessions ended.
    pub async fn run_timeout_scan_once(&self) -> DaemonResult<usize> {
        let now = self.clock.now();
        let timeout = chrono::Duration::seconds(self.config.session_timeout_secs as i64);
        let expired: Vec<String> = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .filter(|s| now - s.last_activity >= timeout)
                .map(|s| s.session_id.clone())
                .collect()
        };
        let count = expired.len();
        for id in expired {
            self.end(&id, Some("timeout")).await?;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::registry::{ResourceSpec, ResourceType};
    use buildnet_config::WorkerSection;
    use buildnet_ledger::LedgerConfig;
    use buildnet_state::MemoryBackend;
    use std::time::Duration;

    struct Fixture {
        manager: SessionManager,
        clock: Arc<ManualClock>,
        registry: Arc<ResourceRegistry>,
    }

    async fn fixture() -> Fixture {
        let backend = Arc::new(MemoryBackend::new());
        let ledger = Arc::new(
            Ledger::open(backend, LedgerConfig::default()).await.unwrap(),
        );
        let bus = EventBus::new();
        let clock = Arc::new(ManualClock::default());
        let registry = Arc::new(ResourceRegistry::new(
            ledger.clone(),
            bus.clone(),
            clock.clone(),
            WorkerSection::default(),
        ));
        let manager = SessionManager::new(
            ledger,
            bus,
            clock.clone(),
            registry.clone(),
            SessionSection {
                max_sessions_per_actor: 2,
                activity_history_limit: 3,
                activity_log_limit: 5,
                ..Default::default()
            },
        );
        Fixture {
            manager,
            clock,
            registry,
        }
    }

    fn agent_params() -> SessionParams {
        SessionParams {
            actor: Actor::new("agent-1", "Agent One", ActorKind::Agent),
            connection_type: ConnectionType::Api,
            scopes: Vec::new(),
            client_info: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn quota_caps_sessions_per_actor() {
        let fx = fixture().await;
        fx.manager.create(agent_params()).await.unwrap();
        fx.manager.create(agent_params()).await.unwrap();
        let err = fx.manager.create(agent_params()).await.unwrap_err();
        assert_eq!(err.code(), "SESSION_QUOTA_EXCEEDED");
    }

    #[tokio::test]
    async fn starting_an_activity_supersedes_the_running_one() {
        let fx = fixture().await;
        let session = fx.manager.create(agent_params()).await.unwrap();
        let id = &session.session_id;

        let first = fx
            .manager
            .start_activity(
                id,
                ActivitySpec {
                    activity_type: "build".to_string(),
                    progress: BTreeMap::new(),
                },
            )
            .await
            .unwrap();
        let second = fx
            .manager
            .start_activity(
                id,
                ActivitySpec {
                    activity_type: "deploy".to_string(),
                    progress: BTreeMap::new(),
                },
            )
            .await
            .unwrap();

        let session = fx.manager.get(id).await.unwrap();
        let current = session.current_activity.as_ref().unwrap();
        assert_eq!(current.activity_id, second.activity_id);
        assert_eq!(session.activity_history.len(), 1);
        assert_eq!(session.activity_history[0].activity_id, first.activity_id);
        assert!(session.activity_history[0].ended_at.is_some());
    }

    #[tokio::test]
    async fn activity_history_ring_is_bounded() {
        let fx = fixture().await;
        let session = fx.manager.create(agent_params()).await.unwrap();
        let id = &session.session_id;
        for i in 0..6 {
            fx.manager
                .start_activity(
                    id,
                    ActivitySpec {
                        activity_type: format!("job-{}", i),
                        progress: BTreeMap::new(),
                    },
                )
                .await
                .unwrap();
        }
        let session = fx.manager.get(id).await.unwrap();
        // Six started, one still current, ring capped at three
        assert_eq!(session.activity_history.len(), 3);
        assert_eq!(session.activity_history[0].activity_type, "job-2");
    }

    #[tokio::test]
    async fn log_ring_is_bounded() {
        let fx = fixture().await;
        let session = fx.manager.create(agent_params()).await.unwrap();
        let id = &session.session_id;
        fx.manager
            .start_activity(
                id,
                ActivitySpec {
                    activity_type: "build".to_string(),
                    progress: BTreeMap::new(),
                },
            )
            .await
            .unwrap();
        for i in 0..8 {
            fx.manager
                .add_activity_log(id, "info", &format!("line {}", i))
                .await
                .unwrap();
        }
        let session = fx.manager.get(id).await.unwrap();
        let logs = &session.current_activity.as_ref().unwrap().logs;
        assert_eq!(logs.len(), 5);
        assert_eq!(logs[0].message, "line 3");
    }

    #[tokio::test]
    async fn claims_round_trip_through_the_registry() {
        let fx = fixture().await;
        fx.registry
            .add(
                ResourceSpec {
                    id: Some("w1".to_string()),
                    name: "w1".to_string(),
                    resource_type: ResourceType::Worker,
                    address: "10.0.0.1:9000".to_string(),
                    cpu_cores: 4,
                    memory_gb: 8,
                    capabilities: BTreeMap::new(),
                    labels: BTreeMap::new(),
                },
                &Actor::system(),
            )
            .await
            .unwrap();

        let session = fx.manager.create(agent_params()).await.unwrap();
        let id = &session.session_id;
        assert!(fx.manager.claim_resource(id, "w1").await.unwrap());
        assert_eq!(fx.registry.claim_count("w1").await, 1);

        fx.manager.release_resource(id, "w1").await.unwrap();
        assert_eq!(fx.registry.claim_count("w1").await, 0);
        let session = fx.manager.get(id).await.unwrap();
        assert!(session.claimed_resources.is_empty());
    }

    #[tokio::test]
    async fn user_without_claim_permission_is_refused() {
        let fx = fixture().await;
        let session = fx
            .manager
            .create(SessionParams {
                actor: Actor::new("u1", "User", ActorKind::User),
                connection_type: ConnectionType::Web,
                scopes: vec!["read".to_string()],
                client_info: BTreeMap::new(),
            })
            .await
            .unwrap();
        assert!(!fx
            .manager
            .claim_resource(&session.session_id, "w1")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn idle_sessions_time_out_on_scan() {
        let fx = fixture().await;
        let session = fx.manager.create(agent_params()).await.unwrap();
        fx.clock.advance(Duration::from_secs(3_601));
        let ended = fx.manager.run_timeout_scan_once().await.unwrap();
        assert_eq!(ended, 1);
        assert!(fx.manager.get(&session.session_id).await.is_none());
    }

    #[tokio::test]
    async fn touch_defers_timeout() {
        let fx = fixture().await;
        let session = fx.manager.create(agent_params()).await.unwrap();
        fx.clock.advance(Duration::from_secs(3_000));
        fx.manager.touch(&session.session_id).await.unwrap();
        fx.clock.advance(Duration::from_secs(800));
        let ended = fx.manager.run_timeout_scan_once().await.unwrap();
        assert_eq!(ended, 0);
        assert!(fx.manager.get(&session.session_id).await.is_some());
    }
}
