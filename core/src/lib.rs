//! Agent gateway core: the agent runtime and its supporting control plane —
//! Model Router, Swarm Manager, Scheduler, Approval/Input Gate, and the
//! transport-agnostic half of the Transport & Session Layer.
//!
//! Skill loading, the memory store, the file-system sandbox, permission
//! management, and any dashboard UI are external collaborators; this crate
//! talks to them only through the narrow interfaces in [`tools`].

pub mod approval;
pub mod audit;
pub mod error;
pub mod message;
pub mod model;
pub mod router;
pub mod runtime;
pub mod scheduler;
pub mod soul;
pub mod state;
pub mod swarm;
pub mod token_meter;
pub mod tools;
pub mod transport;

pub use error::{ErrorKind, GatewayError};
pub use message::Message;
pub use state::{ToolCall, ToolResult};
