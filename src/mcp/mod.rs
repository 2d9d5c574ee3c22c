//! MCP server implementation for Dataverse
//!
//! Protocol framing plus the tool surface over the Dataverse client

pub mod protocol;
mod server;

pub use protocol::*;
pub use server::{DataverseMcpServer, ToolResult};
