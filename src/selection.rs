//! The currently selected project, persisted per user.

use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::storage::{selected_project_key, Storage, StorageError};

pub struct SelectedProject {
    storage: Arc<dyn Storage>,
    current: RwLock<Option<String>>,
}

impl SelectedProject {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            current: RwLock::new(None),
        }
    }

    pub fn get(&self) -> Option<String> {
        self.current.read().ok().and_then(|c| c.clone())
    }

    pub fn is_selected(&self, project_id: &str) -> bool {
        self.get().as_deref() == Some(project_id)
    }

    /// Load `user_id`'s persisted selection into memory.
    pub fn load(&self, user_id: &str) -> Option<String> {
        let stored = self.storage.get(&selected_project_key(user_id));
        self.set_current(stored.clone());
        stored
    }

    /// Select `project_id` for `user_id` and persist it.
    pub fn select(&self, user_id: &str, project_id: &str) -> Result<(), StorageError> {
        self.storage
            .set(&selected_project_key(user_id), project_id)?;
        self.set_current(Some(project_id.to_string()));
        debug!(user_id, project_id, "Selected project");
        Ok(())
    }

    /// Drop the selection in memory and, when a user is known, on disk.
    pub fn clear(&self, user_id: Option<&str>) -> Result<(), StorageError> {
        self.set_current(None);
        if let Some(user_id) = user_id {
            self.storage.remove(&selected_project_key(user_id))?;
        }
        Ok(())
    }

    fn set_current(&self, value: Option<String>) {
        if let Ok(mut current) = self.current.write() {
            *current = value;
        }
    }
}
