//! Wire protocol for the agent gateway.
//!
//! Defines the JSON frames exchanged between the gateway and its clients
//! (chat UI, CLI, dashboard). This crate has no knowledge of sockets,
//! agents, or models — it only describes the shape of one frame and how
//! it round-trips through JSON. The transport crate binds this to an
//! actual duplex connection.

mod frame;

pub use frame::{Channel, ErrorCode, Frame, StreamType};

/// Sentinel session id used for frames with no single originating session
/// (broadcasts of audit/token events). Standardized per the gateway's
/// broadcast convention rather than omitting the field.
pub const SENTINEL_SESSION_ID: &str = "00000000-0000-0000-0000-000000000000";
