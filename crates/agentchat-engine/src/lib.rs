//! Streaming session engine for chatting with a remote agent.
//!
//! A `SessionController` turns one user message into one streaming exchange:
//! it opens a stream through an `AgentTransport` (with retries), consumes the
//! cumulative events in the background, and keeps a transcript plus a tool
//! call ledger that a presentation loop can poll through a `SessionView`.
//!
//! Concrete transports live under `vendors::*`.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use agentchat_engine::prelude::*;
//! use agentchat_engine::vendors::data_stream::DataStreamTransport;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), SessionError> {
//! let transport = Arc::new(DataStreamTransport::from_env()?);
//! let controller = SessionController::new(transport, EngineConfig::from_env())?;
//! controller.start("agent-uuid")?;
//!
//! let exchange = controller.send_message("list the failing pods").await?;
//! let outcome = exchange.wait().await?;
//!
//! for message in controller.snapshot().messages {
//!     println!("{}: {}", message.sender_name, message.content);
//! }
//! println!("{outcome:?} {:?}", controller.stats());
//! # Ok(())
//! # }
//! ```

/// Cumulative-to-incremental text reassembly.
pub mod assembler;
/// Engine configuration and environment overrides.
pub mod config;
mod consumer;
/// Controller, exchange handles and session views.
pub mod controller;
/// Public error types.
pub mod errors;
/// Normalized stream events and transcript entries.
pub mod event;
/// Persisted conversation history.
pub mod history;
/// Logging setup.
pub mod observability;
/// Common imports for typical usage.
pub mod prelude;
/// Controllers keyed by agent id.
pub mod registry;
/// Stream-open retry policy.
pub mod retry;
mod session;
#[cfg(test)]
mod test_support;
/// Client for the tool execution sidecar.
pub mod tools_api;
/// Tool call lifecycle tracking.
pub mod tracker;
/// Ordered, id-keyed conversation transcript.
pub mod transcript;
/// Transport contract used by vendor integrations.
pub mod transport;
/// Vendor-specific transports.
pub mod vendors;

pub use assembler::DeltaAssembler;
pub use config::EngineConfig;
pub use controller::{ExchangeHandle, ExchangeOutcome, SessionController, SessionView};
pub use errors::{HistoryError, ProtocolError, SessionError, ToolApiError, TransportError};
pub use event::{
    DisplayMessage, DisplayMessageType, StreamEvent, StreamEventKind, ToolInvocation, WireEvent,
};
pub use history::{HistoryStore, SessionRecord};
pub use observability::init_observability;
pub use registry::SessionRegistry;
pub use retry::{RetryPolicy, open_with_retry};
pub use session::SessionSnapshot;
pub use tools_api::{ToolExecutionRequest, ToolRunOutput, ToolRunnerClient, ToolRunnerConfig};
pub use tracker::{
    ErrorClassifier, ToolCallStats, ToolExecution, ToolStatus, ToolTracker, ToolTransition,
    default_error_classifier,
};
pub use transcript::{TranscriptStore, Upsert};
pub use transport::{AgentTransport, EventStream, OpenStreamRequest};
