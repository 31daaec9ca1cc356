//! Domain vocabulary shared by the cache, the REST helpers and the realtime
//! channel: which kind of resource changed and how.

use serde::{Deserialize, Serialize};

/// The kind of backend resource a cache entry or event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Project,
    Sprint,
    Task,
    Message,
    Member,
    Invite,
}

impl ResourceKind {
    /// Parse the resource name used on the wire. Accepts singular and plural
    /// spellings in any case.
    pub fn parse(raw: &str) -> Option<Self> {
        let lower = raw.trim().to_ascii_lowercase();
        let singular = lower.strip_suffix('s').unwrap_or(&lower);
        match singular {
            "project" => Some(ResourceKind::Project),
            "sprint" => Some(ResourceKind::Sprint),
            "task" => Some(ResourceKind::Task),
            "message" => Some(ResourceKind::Message),
            "member" | "project_member" | "role" => Some(ResourceKind::Member),
            "invite" | "invitation" => Some(ResourceKind::Invite),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Project => "project",
            ResourceKind::Sprint => "sprint",
            ResourceKind::Task => "task",
            ResourceKind::Message => "message",
            ResourceKind::Member => "member",
            ResourceKind::Invite => "invite",
        }
    }
}

/// The mutation performed on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrudAction {
    Created,
    Updated,
    Deleted,
}

impl CrudAction {
    /// Accepts `INSERT`/`UPDATE`/`DELETE` (database trigger spelling) as well
    /// as `created`/`updated`/`deleted`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "insert" | "create" | "created" | "add" | "added" => Some(CrudAction::Created),
            "update" | "updated" => Some(CrudAction::Updated),
            "delete" | "deleted" | "remove" | "removed" => Some(CrudAction::Deleted),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_kind_parse_spellings() {
        assert_eq!(ResourceKind::parse("task"), Some(ResourceKind::Task));
        assert_eq!(ResourceKind::parse("Tasks"), Some(ResourceKind::Task));
        assert_eq!(ResourceKind::parse("MESSAGES"), Some(ResourceKind::Message));
        assert_eq!(ResourceKind::parse("project_member"), Some(ResourceKind::Member));
        assert_eq!(ResourceKind::parse("widget"), None);
    }

    #[test]
    fn test_crud_action_parse_trigger_spelling() {
        assert_eq!(CrudAction::parse("INSERT"), Some(CrudAction::Created));
        assert_eq!(CrudAction::parse("UPDATE"), Some(CrudAction::Updated));
        assert_eq!(CrudAction::parse("DELETE"), Some(CrudAction::Deleted));
        assert_eq!(CrudAction::parse("deleted"), Some(CrudAction::Deleted));
        assert_eq!(CrudAction::parse("truncate"), None);
    }

    #[test]
    fn test_resource_kind_snake_case_serde() {
        assert_eq!(
            serde_json::to_string(&ResourceKind::Sprint).unwrap(),
            "\"sprint\""
        );
        let parsed: CrudAction = serde_json::from_str("\"deleted\"").unwrap();
        assert_eq!(parsed, CrudAction::Deleted);
    }
}
