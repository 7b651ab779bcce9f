//! Concrete `AgentTransport` implementations.
pub mod data_stream;
