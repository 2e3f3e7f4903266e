//! MCP control surface: four job tools over JSON-RPC stdio.

pub mod server;
pub mod stdio;
pub mod tools;

pub use server::{JsonRpcRequest, McpServer};
pub use stdio::run_stdio;
