//! Backend route table.

/// `POST /auth/login`: email/password login, returns `{token, userID}`.
pub const LOGIN_PATH: &str = "/auth/login";
/// `POST /auth/register`
pub const REGISTER_PATH: &str = "/auth/register";
/// `POST /auth/refresh`: no body, cookie-authenticated.
pub const REFRESH_PATH: &str = "/auth/refresh";
/// `POST /auth/logout`: clears the refresh cookie server-side.
pub const LOGOUT_PATH: &str = "/auth/logout";

/// Routes that must never carry a bearer token nor trigger refresh logic.
const UNAUTHENTICATED_PREFIXES: &[&str] = &[
    LOGIN_PATH,
    REGISTER_PATH,
    REFRESH_PATH,
    LOGOUT_PATH,
    "/auth/oauth/",
    "/auth/validate-email",
    "/auth/forgot-password",
    "/auth/reset-password",
    "/invites/validate",
];

/// Whether `path` (with or without query string) is an unauthenticated route.
pub fn is_unauthenticated_route(path: &str) -> bool {
    let path = path.split('?').next().unwrap_or(path);
    UNAUTHENTICATED_PREFIXES.iter().any(|prefix| {
        path == *prefix
            || path
                .strip_prefix(prefix)
                .is_some_and(|rest| prefix.ends_with('/') || rest.starts_with('/'))
    })
}

pub fn projects() -> String {
    "/projects".to_string()
}

pub fn project(project_id: &str) -> String {
    format!("/projects/{project_id}")
}

pub fn sprints(project_id: &str) -> String {
    format!("/projects/{project_id}/sprints")
}

pub fn sprint(sprint_id: &str) -> String {
    format!("/sprints/{sprint_id}")
}

pub fn tasks(project_id: &str) -> String {
    format!("/projects/{project_id}/tasks")
}

pub fn task(task_id: &str) -> String {
    format!("/tasks/{task_id}")
}

pub fn messages(project_id: &str) -> String {
    format!("/projects/{project_id}/messages")
}

pub fn members(project_id: &str) -> String {
    format!("/projects/{project_id}/members")
}

pub fn invites(project_id: &str) -> String {
    format!("/projects/{project_id}/invites")
}
