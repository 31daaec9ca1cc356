//! REST access to the backend

pub mod client;
pub mod resources;
pub mod routes;

pub use client::{build_http_client, ApiClient};
pub use resources::{Message, Project, Task};
