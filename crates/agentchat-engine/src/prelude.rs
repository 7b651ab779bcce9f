//! Common imports for typical engine usage.
pub use crate::{
    AgentTransport, DisplayMessage, DisplayMessageType, EngineConfig, EventStream,
    ExchangeHandle, ExchangeOutcome, OpenStreamRequest, RetryPolicy, SessionController,
    SessionError, SessionRegistry, SessionSnapshot, SessionView, StreamEvent, StreamEventKind,
    ToolCallStats, ToolStatus,
};
