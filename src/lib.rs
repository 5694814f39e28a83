//! # Agentation
//!
//! A local annotation broker. Browser clients post structured UI feedback
//! ("annotations") into page sessions over HTTP; AI coding agents consume,
//! acknowledge, and resolve that feedback through an MCP-style tool
//! protocol (ACP) on stdio; both sides observe the same mutation stream
//! over Server-Sent Events with replay on reconnect.
//!
//! ## Architecture
//!
//! ```text
//! Browser → HTTP surface (axum) → Store (SQLite | memory)
//!                 ↓ publish                ↑ single source of truth
//!            Event Bus → SSE subscribers, webhook worker
//! Agent → ACP dispatcher (stdio) → HTTP surface (loopback)
//! ```
//!
//! Every mutation is appended to the event log with a process-wide
//! monotonic sequence number before the response is returned, so SSE
//! clients can always resume with `Last-Event-ID` and see an ordered,
//! gap-free stream.

/// ACP dispatcher: stdio tool protocol for agents.
pub mod acp;
/// Event bus: sequencing, persistence, fan-out, retention.
pub mod bus;
/// Configuration management.
pub mod config;
/// Error types and result aliases.
pub mod error;
/// HTTP surface: REST, SSE, CORS, bearer auth.
pub mod http;
/// Data model and store backings.
pub mod store;
/// Outbound webhook delivery.
pub mod webhook;

pub use config::Config;
pub use error::{AppError, AppResult};
