//! HTTP transport for agents that answer with a line-oriented data stream.
//!
//! Each response line is `<part>:<json>`; text parts are accumulated into
//! cumulative content events, tool call and result parts become tool events,
//! and a finish part with a reason ends the exchange.
mod adapter;
mod config;
mod decoder;

pub use adapter::DataStreamTransport;
pub use config::DataStreamConfig;
