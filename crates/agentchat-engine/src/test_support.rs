use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::mpsc;

use crate::errors::TransportError;
use crate::event::StreamEvent;
use crate::transport::{AgentTransport, EventStream, OpenStreamRequest};

/// Transport fake that replays queued failures, then queued streams.
///
/// When nothing is queued, `open_stream` hands out a stream that is already
/// closed.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    failures: Mutex<VecDeque<TransportError>>,
    streams: Mutex<VecDeque<EventStream>>,
    held: Mutex<Vec<mpsc::Sender<StreamEvent>>>,
    requests: Mutex<Vec<OpenStreamRequest>>,
    attempts: AtomicU32,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn failing(failures: Vec<TransportError>) -> Self {
        let transport = Self::new();
        transport
            .failures
            .lock()
            .expect("failures lock")
            .extend(failures);
        transport
    }

    /// Queues a stream that delivers `events` and then closes.
    pub(crate) fn push_events(&self, events: Vec<StreamEvent>) {
        let (tx, stream) = EventStream::channel(events.len() + 1);
        for event in events {
            tx.try_send(event).expect("scripted event fits channel");
        }
        self.push_stream(stream);
    }

    /// Queues a stream that delivers `events` and then stays open.
    pub(crate) fn push_events_then_hang(&self, events: Vec<StreamEvent>) {
        let (tx, stream) = EventStream::channel(events.len() + 1);
        for event in events {
            tx.try_send(event).expect("scripted event fits channel");
        }
        self.held.lock().expect("held lock").push(tx);
        self.push_stream(stream);
    }

    /// Queues a stream fed by the returned sender.
    pub(crate) fn push_manual(&self) -> mpsc::Sender<StreamEvent> {
        let (tx, stream) = EventStream::channel(64);
        self.push_stream(stream);
        tx
    }

    pub(crate) fn push_stream(&self, stream: EventStream) {
        self.streams.lock().expect("streams lock").push_back(stream);
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn requests(&self) -> Vec<OpenStreamRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

#[async_trait::async_trait]
impl AgentTransport for ScriptedTransport {
    async fn open_stream(
        &self,
        request: OpenStreamRequest,
    ) -> Result<EventStream, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().expect("requests lock").push(request);
        if let Some(err) = self.failures.lock().expect("failures lock").pop_front() {
            return Err(err);
        }
        let queued = self.streams.lock().expect("streams lock").pop_front();
        Ok(queued.unwrap_or_else(|| EventStream::channel(1).1))
    }
}
