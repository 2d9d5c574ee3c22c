//! Dataverse MCP Library
//!
//! Model Context Protocol server for the Microsoft Dataverse Web API.
//! Service-principal OAuth, OData query construction, and record CRUD
//! exposed as MCP tools.

pub mod auth;
pub mod config;
pub mod dataverse;
pub mod mcp;

pub use auth::{AuthError, TokenCache};
pub use config::{Config, ConfigError, Credentials};
pub use dataverse::{DataverseClient, DataverseError, EntitySetMap, QuerySpec};
