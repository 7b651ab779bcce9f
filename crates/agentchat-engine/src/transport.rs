use tokio::sync::mpsc;

use crate::errors::TransportError;
use crate::event::StreamEvent;

/// Parameters for one streaming exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenStreamRequest {
    pub agent_id: String,
    pub text: String,
    /// Sticky session id from an earlier exchange, if any.
    pub session_id: Option<String>,
}

/// Receiving side of one exchange. Ends when the transport closes it.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<StreamEvent>,
}

impl EventStream {
    pub fn new(rx: mpsc::Receiver<StreamEvent>) -> Self {
        Self { rx }
    }

    /// Creates a bounded channel and wraps its receiving half.
    pub fn channel(capacity: usize) -> (mpsc::Sender<StreamEvent>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self::new(rx))
    }

    /// Waits for the next event. `None` once the transport closed the stream.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }
}

/// Establishes streaming exchanges with a remote agent.
///
/// Implementations hand back the receiving side of a channel and keep
/// producing into it from their own task. They must stop producing once the
/// receiver is dropped.
#[async_trait::async_trait]
pub trait AgentTransport: Send + Sync {
    async fn open_stream(&self, request: OpenStreamRequest)
    -> Result<EventStream, TransportError>;
}
