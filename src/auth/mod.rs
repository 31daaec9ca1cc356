//! Authentication: token lifecycle and refresh coordination
//!
//! Provides:
//! - JWT claim inspection (`jwt` submodule)
//! - Token storage with claim-derived expiry (`token` submodule)
//! - The refresh endpoint client and its retry policy (`refresh` submodule)
//! - Single-flight refresh coordination (`coordinator` submodule)
//! - OAuth callback fragment parsing (`oauth` submodule)

pub mod coordinator;
pub mod jwt;
pub mod oauth;
pub mod refresh;
pub mod token;

pub use coordinator::SessionCoordinator;
pub use refresh::{RefreshClient, RefreshError, RefreshPolicy, RefreshResponse};
pub use token::TokenStore;
