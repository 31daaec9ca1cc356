//! What a resource change does to the cache.
//!
//! | change | effect |
//! |---|---|
//! | delete | detail entry removed, item dropped from its lists |
//! | create | lists marked stale, active ones refetched |
//! | update | lists and the detail marked stale, active ones refetched |
//! | member / role | member lists and project lists refetched immediately |
//! | message | every message entry of the project, any user namespace, marked stale; active ones refetched |

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use super::message::Invalidation;
use crate::cache::{QueryCache, QueryKey};
use crate::resource::{CrudAction, ResourceKind};

/// Keys touched by one invalidation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InvalidationOutcome {
    pub removed: Vec<QueryKey>,
    pub pruned: Vec<QueryKey>,
    pub stale: Vec<QueryKey>,
    pub refetched: usize,
}

pub async fn apply(cache: &Arc<QueryCache>, inv: &Invalidation) -> InvalidationOutcome {
    let outcome = match (inv.resource, inv.action) {
        (ResourceKind::Message, _) => apply_messages(cache, inv).await,
        (ResourceKind::Member, _) => apply_access_change(cache, inv).await,
        (_, Some(CrudAction::Deleted)) => apply_delete(cache, inv),
        (_, Some(CrudAction::Created)) => {
            let stale = cache.invalidate_where(|k| is_list_of(k, inv));
            let refetched = cache.refetch_active(&stale).await;
            InvalidationOutcome {
                stale,
                refetched,
                ..Default::default()
            }
        }
        // Updates and changes without a recognizable action
        (_, _) => {
            let mut stale = cache.invalidate_where(|k| is_list_of(k, inv));
            if let Some(detail) = detail_key(inv) {
                if cache.invalidate(&detail) {
                    stale.push(detail);
                }
            }
            let refetched = cache.refetch_active(&stale).await;
            InvalidationOutcome {
                stale,
                refetched,
                ..Default::default()
            }
        }
    };

    debug!(
        resource = inv.resource.as_str(),
        action = ?inv.action,
        project_id = ?inv.project_id,
        removed = outcome.removed.len(),
        pruned = outcome.pruned.len(),
        stale = outcome.stale.len(),
        refetched = outcome.refetched,
        "Applied invalidation"
    );
    outcome
}

fn apply_delete(cache: &QueryCache, inv: &Invalidation) -> InvalidationOutcome {
    let mut outcome = InvalidationOutcome::default();

    if let Some(detail) = detail_key(inv) {
        if cache.remove(&detail) {
            outcome.removed.push(detail);
        }
    }

    // A deleted project takes everything scoped to it along.
    if inv.resource == ResourceKind::Project {
        if let Some(id) = inv.id.as_deref() {
            outcome.removed.extend(cache.remove_where(|k| k.is_scoped_to(id)));
        }
    }

    let Some(id) = inv.id.as_deref() else {
        // Nothing to prune by: fall back to marking the lists stale.
        outcome.stale = cache.invalidate_where(|k| is_list_of(k, inv));
        return outcome;
    };

    for key in cache.keys().into_iter().filter(|k| is_list_of(k, inv)) {
        let mut dropped = false;
        cache.update(&key, |data| dropped = remove_item(data, id));
        if dropped {
            outcome.pruned.push(key);
        }
    }
    outcome
}

async fn apply_access_change(cache: &Arc<QueryCache>, inv: &Invalidation) -> InvalidationOutcome {
    let mut stale = cache.invalidate_where(|k| is_list_of(k, inv));
    stale.extend(cache.invalidate_where(|k| matches!(k, QueryKey::Projects { .. })));
    let refetched = stale.len();
    cache.refetch_now(&stale).await;
    InvalidationOutcome {
        stale,
        refetched,
        ..Default::default()
    }
}

async fn apply_messages(cache: &Arc<QueryCache>, inv: &Invalidation) -> InvalidationOutcome {
    let stale = cache.invalidate_where(|k| {
        k.resource_kind() == ResourceKind::Message
            && inv.project_id.as_deref().is_none_or(|p| k.is_scoped_to(p))
    });
    let refetched = cache.refetch_active(&stale).await;
    InvalidationOutcome {
        stale,
        refetched,
        ..Default::default()
    }
}

/// List entries of the changed kind within the event's project. Project lists
/// are per user rather than per project, so every one of them matches.
fn is_list_of(key: &QueryKey, inv: &Invalidation) -> bool {
    if !key.is_list() || key.resource_kind() != inv.resource {
        return false;
    }
    match (inv.resource, inv.project_id.as_deref()) {
        (ResourceKind::Project, _) | (_, None) => true,
        (_, Some(project_id)) => key.is_scoped_to(project_id),
    }
}

fn detail_key(inv: &Invalidation) -> Option<QueryKey> {
    inv.id
        .as_deref()
        .and_then(|id| QueryKey::detail_for(inv.resource, id))
}

/// Drop the item with `id` from list data. Accepts a bare array or an object
/// wrapping one under `data`/`items`.
fn remove_item(data: &mut Value, id: &str) -> bool {
    let list = match data {
        Value::Array(items) => items,
        Value::Object(obj) => {
            let field = if obj.get("data").is_some_and(Value::is_array) {
                "data"
            } else {
                "items"
            };
            match obj.get_mut(field) {
                Some(Value::Array(items)) => items,
                _ => return false,
            }
        }
        _ => return false,
    };
    let before = list.len();
    list.retain(|item| !id_matches(item, id));
    list.len() != before
}

fn id_matches(item: &Value, id: &str) -> bool {
    match item.get("id") {
        Some(Value::String(s)) => s == id,
        Some(Value::Number(n)) => n.to_string() == id,
        _ => false,
    }
}
