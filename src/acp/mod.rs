//! ACP dispatcher: the tool surface agents use to work annotations.
//!
//! Speaks line-framed JSON-RPC on stdin/stdout and translates every tool
//! call into HTTP requests against the broker surface, so the store remains
//! the single source of truth.

mod client;
mod handlers;
mod server;
mod tools;

pub use client::ApiClient;
pub use handlers::handle_tool_call;
pub use server::{AcpServer, JsonRpcRequest, JsonRpcResponse};
pub use tools::{catalog, Tool};
