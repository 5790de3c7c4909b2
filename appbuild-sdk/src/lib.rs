//! Client SDK for the app-building agent's streaming protocol.
//!
//! Decodes the agent's server-sent event stream into typed [`AgentEvent`]s,
//! files them into per-application conversation logs, and groups each log
//! into display phases.

pub mod client;
pub mod conversation;
pub mod debug;
pub mod event;
pub mod phase;
pub mod sse;
pub mod trace;

pub use conversation::{ConversationStore, CorrelationError};
pub use event::{AgentEvent, AgentStatus, MessageKind, SchemaError};
pub use phase::{ChatState, PhaseView, group_phases};
pub use sse::{SseDecoder, StreamEnd, StreamError, StreamHandler};
pub use trace::{TraceId, extract_application_id};
