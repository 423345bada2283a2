//! Session, activity, and permission model

use buildnet_ledger::{Actor, ActorKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// How a session is connected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Cli,
    Web,
    Api,
    Grpc,
    Websocket,
}

/// One line in an activity's bounded log ring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityLogLine {
    pub level: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// One unit of in-flight work owned by a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub activity_id: String,
    pub activity_type: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Opaque progress map, merged on update
    #[serde(default)]
    pub progress: BTreeMap<String, Value>,
    /// Bounded ring; oldest lines dropped
    #[serde(default)]
    pub logs: Vec<ActivityLogLine>,
    #[serde(default)]
    pub artifacts: Vec<String>,
}

impl Activity {
    /// Ledger-facing state; the log ring is summarized to a count so audit
    /// payloads stay small
    pub fn audit_state(&self) -> Value {
        serde_json::json!({
            "activity_id": self.activity_id,
            "activity_type": self.activity_type,
            "started_at": self.started_at,
            "ended_at": self.ended_at,
            "progress": self.progress,
            "log_count": self.logs.len(),
            "artifacts": self.artifacts,
        })
    }
}

/// Input for starting an activity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivitySpec {
    pub activity_type: String,
    #[serde(default)]
    pub progress: BTreeMap<String, Value>,
}

/// Resource-pattern → allowed actions
pub type PermissionSet = BTreeMap<String, BTreeSet<String>>;

/// One live connection from an actor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub actor: Actor,
    pub actor_type: ActorKind,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub connection_type: ConnectionType,
    #[serde(default)]
    pub client_info: BTreeMap<String, String>,
    pub permissions: PermissionSet,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub current_activity: Option<Activity>,
    /// Completed activities, bounded ring
    #[serde(default)]
    pub activity_history: Vec<Activity>,
    /// Ordered set of claimed resource ids
    #[serde(default)]
    pub claimed_resources: Vec<String>,
}

impl Session {
    /// Does this session allow `action` on `resource`?
    pub fn allows(&self, resource: &str, action: &str) -> bool {
        self.permissions.iter().any(|(pattern, actions)| {
            (pattern == "*" || pattern == resource)
                && (actions.contains("*") || actions.contains(action))
        })
    }

    /// Ledger-facing state with permissions flattened to scalar strings
    pub fn audit_state(&self) -> Value {
        let permissions: Vec<String> = self
            .permissions
            .iter()
            .map(|(pattern, actions)| {
                let actions: Vec<&str> = actions.iter().map(String::as_str).collect();
                format!("{}:{}", pattern, actions.join(","))
            })
            .collect();
        serde_json::json!({
            "session_id": self.session_id,
            "actor_id": self.actor.id,
            "actor_type": self.actor_type,
            "connected_at": self.connected_at,
            "last_activity": self.last_activity,
            "connection_type": self.connection_type,
            "permissions": permissions,
            "scopes": self.scopes,
            "current_activity": self.current_activity.as_ref().map(|a| a.activity_id.clone()),
            "claimed_resources": self.claimed_resources,
        })
    }
}

/// Input for `create`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionParams {
    pub actor: Actor,
    pub connection_type: ConnectionType,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub client_info: BTreeMap<String, String>,
}

fn grant(permissions: &mut PermissionSet, resource: &str, actions: &[&str]) {
    permissions
        .entry(resource.to_string())
        .or_default()
        .extend(actions.iter().map(|a| a.to_string()));
}

/// Resolve the default permission table for an actor kind and scopes
pub fn resolve_permissions(kind: ActorKind, scopes: &[String]) -> PermissionSet {
    let mut permissions = PermissionSet::new();
    match kind {
        ActorKind::System => grant(&mut permissions, "*", &["*"]),
        ActorKind::Service => {
            grant(&mut permissions, "builds", &["read", "write", "execute"]);
            grant(&mut permissions, "resources", &["read"]);
            grant(&mut permissions, "sessions", &["read"]);
        }
        ActorKind::Agent => {
            grant(&mut permissions, "builds", &["read", "write", "execute"]);
            grant(&mut permissions, "resources", &["read", "claim"]);
            grant(&mut permissions, "sessions", &["read"]);
        }
        ActorKind::User => {
            let has = |s: &str| scopes.iter().any(|scope| scope == s);
            if has("admin") {
                grant(&mut permissions, "*", &["*"]);
            } else if has("write") {
                grant(&mut permissions, "builds", &["read", "write", "execute"]);
                grant(&mut permissions, "resources", &["read", "write"]);
                grant(&mut permissions, "sessions", &["read"]);
            } else {
                grant(&mut permissions, "builds", &["read"]);
                grant(&mut permissions, "resources", &["read"]);
                grant(&mut permissions, "sessions", &["read"]);
            }
        }
    }
    permissions
}
