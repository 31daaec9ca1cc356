//! Thin typed helpers over the REST endpoints.
//!
//! The cache layer only cares about resource kind and id; these structs keep
//! every other field in `extra` so nothing the backend sends is lost.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::client::ApiClient;
use super::routes;
use crate::auth::RefreshResponse;
use crate::error::ClientResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, alias = "sprintId")]
    pub sprint_id: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(default)]
    pub body: String,
    #[serde(default, alias = "authorId", alias = "user_id")]
    pub author_id: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewMessage<'a> {
    pub body: &'a str,
}

impl ApiClient {
    /// `POST /auth/login`. Unauthenticated route: no bearer, no refresh.
    pub async fn login(&self, email: &str, password: &str) -> ClientResult<RefreshResponse> {
        self.post(routes::LOGIN_PATH, &LoginRequest { email, password })
            .await
    }

    /// `POST /auth/logout`. Best effort; the local logout does not depend on it.
    pub async fn logout_remote(&self) -> ClientResult<()> {
        self.request_json(reqwest::Method::POST, routes::LOGOUT_PATH, None)
            .await
            .map(|_| ())
    }

    pub async fn list_projects(&self) -> ClientResult<Vec<Project>> {
        self.get(&routes::projects()).await
    }

    pub async fn list_tasks(&self, project_id: &str) -> ClientResult<Vec<Task>> {
        self.get(&routes::tasks(project_id)).await
    }

    pub async fn get_task(&self, task_id: &str) -> ClientResult<Task> {
        self.get(&routes::task(task_id)).await
    }

    pub async fn list_messages(&self, project_id: &str) -> ClientResult<Vec<Message>> {
        self.get(&routes::messages(project_id)).await
    }

    pub async fn send_message(&self, project_id: &str, body: &str) -> ClientResult<Message> {
        self.post(&routes::messages(project_id), &NewMessage { body })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_keeps_unknown_fields() {
        let task: Task = serde_json::from_value(serde_json::json!({
            "id": "T1",
            "title": "Write docs",
            "sprintId": "S1",
            "points": 3
        }))
        .unwrap();
        assert_eq!(task.sprint_id.as_deref(), Some("S1"));
        assert_eq!(task.extra["points"], 3);
    }

    #[test]
    fn test_message_author_spellings() {
        let m: Message =
            serde_json::from_value(serde_json::json!({"id": "M1", "body": "hi", "authorId": "u1"}))
                .unwrap();
        assert_eq!(m.author_id.as_deref(), Some("u1"));
    }
}
