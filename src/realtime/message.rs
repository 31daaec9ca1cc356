//! Inbound realtime messages, normalized at the boundary.
//!
//! The backend speaks three dialects:
//!
//! - event-specific broadcasts: `{"type":"task_updated","project_id":"P1","task":{...}}`
//! - a nested envelope: `{"type":"invalidate","payload":{"resource":"task","id":"T1","action":"UPDATE","project_id":"P1"}}`
//! - a flat envelope: `{"type":"invalidate","resource":"task","id":"T1","action":"DELETE","projectId":"P1"}`
//!
//! [`parse`] turns any of them into one [`RealtimeEvent`]; nothing past this
//! module looks at raw JSON.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::resource::{CrudAction, ResourceKind};

#[derive(Debug, Error, PartialEq)]
pub enum MessageError {
    #[error("invalid JSON: {0}")]
    Json(String),
    #[error("message has no type")]
    MissingType,
    #[error("invalidation without a known resource kind")]
    UnknownResource,
}

/// A resource change the cache must react to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invalidation {
    pub resource: ResourceKind,
    pub id: Option<String>,
    pub action: Option<CrudAction>,
    pub project_id: Option<String>,
}

impl Invalidation {
    /// Membership and role changes alter what the user may see.
    pub fn is_access_change(&self) -> bool {
        self.resource == ResourceKind::Member
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealtimeEvent {
    Invalidate(Invalidation),
    /// Heartbeat reply or subscription acknowledgement.
    Control(String),
    /// Server-side error frame (e.g. subscription refused).
    Error {
        code: Option<String>,
        message: String,
    },
    /// Well-formed but not something the client handles.
    Ignored(String),
}

const CONTROL_TYPES: &[&str] = &["pong", "ping", "subscribed", "unsubscribed", "ack", "connected", "welcome"];
const ENVELOPE_TYPES: &[&str] = &["invalidate", "invalidation", "cache_invalidate", "db_change", "change"];

/// Parse one text frame.
pub fn parse(text: &str) -> Result<RealtimeEvent, MessageError> {
    let value: Value = serde_json::from_str(text).map_err(|e| MessageError::Json(e.to_string()))?;
    let Value::Object(obj) = value else {
        return Err(MessageError::MissingType);
    };
    let kind = str_field(&obj, &["type", "event"])
        .ok_or(MessageError::MissingType)?
        .to_ascii_lowercase();

    if CONTROL_TYPES.contains(&kind.as_str()) {
        return Ok(RealtimeEvent::Control(kind));
    }
    if kind == "error" {
        return Ok(RealtimeEvent::Error {
            code: str_field(&obj, &["code"]).map(str::to_string),
            message: str_field(&obj, &["message", "error", "reason"])
                .unwrap_or_default()
                .to_string(),
        });
    }
    if ENVELOPE_TYPES.contains(&kind.as_str()) {
        return parse_envelope(&obj).map(RealtimeEvent::Invalidate);
    }

    match event_shape(&kind) {
        Some((resource, action)) => Ok(RealtimeEvent::Invalidate(from_event(&obj, resource, action))),
        None => Ok(RealtimeEvent::Ignored(kind)),
    }
}

fn parse_envelope(obj: &Map<String, Value>) -> Result<Invalidation, MessageError> {
    // Nested payload wins; the outer object fills whatever it lacks.
    let nested = obj.get("payload").or_else(|| obj.get("data")).and_then(Value::as_object);
    let lookup = |names: &[&str]| -> Option<String> {
        nested
            .and_then(|n| str_field(n, names))
            .or_else(|| str_field(obj, names))
            .map(str::to_string)
    };

    let resource = lookup(&["resource", "resource_type", "resourceType", "table", "entity"])
        .and_then(|r| ResourceKind::parse(&r))
        .ok_or(MessageError::UnknownResource)?;

    Ok(Invalidation {
        resource,
        id: lookup(&["id", "resource_id", "resourceId", "entity_id", "entityId"]),
        action: lookup(&["action", "operation", "op"]).and_then(|a| CrudAction::parse(&a)),
        project_id: lookup(&["project_id", "projectId"]),
    })
}

/// Map an event-specific type to a resource kind and action.
fn event_shape(kind: &str) -> Option<(ResourceKind, Option<CrudAction>)> {
    match kind {
        "role_changed" | "member_role_changed" => {
            return Some((ResourceKind::Member, Some(CrudAction::Updated)))
        }
        "member_added" | "member_joined" => return Some((ResourceKind::Member, Some(CrudAction::Created))),
        "member_removed" | "member_left" => return Some((ResourceKind::Member, Some(CrudAction::Deleted))),
        "new_message" | "chat_message" => return Some((ResourceKind::Message, Some(CrudAction::Created))),
        _ => {}
    }

    let (resource, action) = kind.rsplit_once('_')?;
    let resource = ResourceKind::parse(resource)?;
    let action = CrudAction::parse(action);
    // `task_moved`, `sprint_started` and friends are updates in all but name.
    Some((resource, action.or(Some(CrudAction::Updated))))
}

fn from_event(obj: &Map<String, Value>, resource: ResourceKind, action: Option<CrudAction>) -> Invalidation {
    let name = resource.as_str();
    let embedded = obj
        .get(name)
        .or_else(|| obj.get("payload"))
        .or_else(|| obj.get("data"))
        .and_then(Value::as_object);

    let snake_id = format!("{name}_id");
    let camel_id = format!("{name}Id");
    let id = str_field(obj, &[snake_id.as_str(), camel_id.as_str(), "id"])
        .or_else(|| embedded.and_then(|e| str_field(e, &["id"])))
        .map(str::to_string);

    let project_id = str_field(obj, &["project_id", "projectId"])
        .or_else(|| embedded.and_then(|e| str_field(e, &["project_id", "projectId"])))
        .map(str::to_string);

    // A project event is its own scope.
    let project_id = match (resource, project_id) {
        (ResourceKind::Project, None) => id.clone(),
        (_, p) => p,
    };

    Invalidation {
        resource,
        id,
        action,
        project_id,
    }
}

/// First present field among `names`, accepting strings and numbers.
fn str_field<'a>(obj: &'a Map<String, Value>, names: &[&str]) -> Option<&'a str> {
    names.iter().find_map(|n| match obj.get(*n) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.as_str()),
        _ => None,
    })
}

/// `{"type":"subscribe","project_id":..}`
pub fn subscribe_frame(project_id: &str) -> String {
    serde_json::json!({"type": "subscribe", "project_id": project_id}).to_string()
}

/// `{"type":"ping"}`
pub fn heartbeat_frame() -> String {
    serde_json::json!({"type": "ping"}).to_string()
}
