//! Structured cache keys: resource kind + scope.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::api::routes;
use crate::resource::ResourceKind;

/// Key of one cache entry.
///
/// List keys are scoped by project (or by user for the project list);
/// detail keys by resource id. Message lists additionally live in a per-user
/// namespace, which is why message invalidation matches by project through a
/// predicate rather than by exact key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryKey {
    Projects { user_id: String },
    Project { project_id: String },
    Sprints { project_id: String },
    Sprint { sprint_id: String },
    Tasks { project_id: String },
    Task { task_id: String },
    Messages { user_id: String, project_id: String },
    Members { project_id: String },
    Invites { project_id: String },
}

impl QueryKey {
    pub fn resource_kind(&self) -> ResourceKind {
        match self {
            QueryKey::Projects { .. } | QueryKey::Project { .. } => ResourceKind::Project,
            QueryKey::Sprints { .. } | QueryKey::Sprint { .. } => ResourceKind::Sprint,
            QueryKey::Tasks { .. } | QueryKey::Task { .. } => ResourceKind::Task,
            QueryKey::Messages { .. } => ResourceKind::Message,
            QueryKey::Members { .. } => ResourceKind::Member,
            QueryKey::Invites { .. } => ResourceKind::Invite,
        }
    }

    /// List-level entry (holds an array of resources).
    pub fn is_list(&self) -> bool {
        matches!(
            self,
            QueryKey::Projects { .. }
                | QueryKey::Sprints { .. }
                | QueryKey::Tasks { .. }
                | QueryKey::Messages { .. }
                | QueryKey::Members { .. }
                | QueryKey::Invites { .. }
        )
    }

    /// Project this entry is scoped to, if any.
    pub fn project_scope(&self) -> Option<&str> {
        match self {
            QueryKey::Project { project_id }
            | QueryKey::Sprints { project_id }
            | QueryKey::Tasks { project_id }
            | QueryKey::Messages { project_id, .. }
            | QueryKey::Members { project_id }
            | QueryKey::Invites { project_id } => Some(project_id),
            _ => None,
        }
    }

    /// Resource id of a detail entry.
    pub fn detail_id(&self) -> Option<&str> {
        match self {
            QueryKey::Project { project_id } => Some(project_id),
            QueryKey::Sprint { sprint_id } => Some(sprint_id),
            QueryKey::Task { task_id } => Some(task_id),
            _ => None,
        }
    }

    /// Whether this entry is tagged with `project_id`, whatever user
    /// namespace it lives in.
    pub fn is_scoped_to(&self, project_id: &str) -> bool {
        self.project_scope() == Some(project_id)
    }

    /// REST path that produces this entry.
    pub fn path(&self) -> String {
        match self {
            QueryKey::Projects { .. } => routes::projects(),
            QueryKey::Project { project_id } => routes::project(project_id),
            QueryKey::Sprints { project_id } => routes::sprints(project_id),
            QueryKey::Sprint { sprint_id } => routes::sprint(sprint_id),
            QueryKey::Tasks { project_id } => routes::tasks(project_id),
            QueryKey::Task { task_id } => routes::task(task_id),
            QueryKey::Messages { project_id, .. } => routes::messages(project_id),
            QueryKey::Members { project_id } => routes::members(project_id),
            QueryKey::Invites { project_id } => routes::invites(project_id),
        }
    }

    /// List key for `kind` within a project. `None` for kinds without a
    /// project-scoped list.
    pub fn list_for(kind: ResourceKind, project_id: &str) -> Option<QueryKey> {
        let project_id = project_id.to_string();
        match kind {
            ResourceKind::Sprint => Some(QueryKey::Sprints { project_id }),
            ResourceKind::Task => Some(QueryKey::Tasks { project_id }),
            ResourceKind::Member => Some(QueryKey::Members { project_id }),
            ResourceKind::Invite => Some(QueryKey::Invites { project_id }),
            ResourceKind::Project | ResourceKind::Message => None,
        }
    }

    /// Detail key for `kind` and `id`, for kinds that have detail entries.
    pub fn detail_for(kind: ResourceKind, id: &str) -> Option<QueryKey> {
        let id = id.to_string();
        match kind {
            ResourceKind::Project => Some(QueryKey::Project { project_id: id }),
            ResourceKind::Sprint => Some(QueryKey::Sprint { sprint_id: id }),
            ResourceKind::Task => Some(QueryKey::Task { task_id: id }),
            _ => None,
        }
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryKey::Projects { user_id } => write!(f, "projects[user={user_id}]"),
            QueryKey::Messages {
                user_id,
                project_id,
            } => write!(f, "messages[user={user_id},project={project_id}]"),
            other => write!(f, "{}:{}", other.resource_kind().as_str(), other.path()),
        }
    }
}
