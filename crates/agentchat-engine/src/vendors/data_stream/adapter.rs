use futures::StreamExt as _;
use reqwest::header::AUTHORIZATION;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::errors::{SessionError, TransportError};
use crate::event::StreamEvent;
use crate::transport::{AgentTransport, EventStream, OpenStreamRequest};

use super::config::DataStreamConfig;
use super::decoder::{LineDecoder, PartMapper};

const DATA_STREAM_HEADER: &str = "x-vercel-ai-data-stream";

#[derive(Debug, Serialize)]
struct StreamRequestBody<'a> {
    message: &'a str,
    agent_uuid: &'a str,
    session_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_email: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    org: Option<&'a str>,
}

/// Agent transport speaking the line-oriented data-stream protocol over HTTP.
pub struct DataStreamTransport {
    client: reqwest::Client,
    config: DataStreamConfig,
}

impl DataStreamTransport {
    pub fn new(config: DataStreamConfig) -> Result<Self, SessionError> {
        if config.api_key.trim().is_empty() {
            return Err(SessionError::Config(
                "data stream api_key must not be empty".into(),
            ));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| SessionError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Creates a transport using `AGENTCHAT_API_KEY` and friends.
    pub fn from_env() -> Result<Self, SessionError> {
        Self::new(DataStreamConfig::from_env()?)
    }

    pub fn config(&self) -> &DataStreamConfig {
        &self.config
    }
}

#[async_trait::async_trait]
impl AgentTransport for DataStreamTransport {
    async fn open_stream(
        &self,
        request: OpenStreamRequest,
    ) -> Result<EventStream, TransportError> {
        let session_id = request
            .session_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let body = StreamRequestBody {
            message: &request.text,
            agent_uuid: &request.agent_id,
            session_id: &session_id,
            user_email: self.config.user_email.as_deref(),
            org: self.config.org.as_deref(),
        };
        debug!(agent_id = %request.agent_id, session_id = %session_id, "opening data stream");

        let response = self
            .client
            .post(self.config.stream_url())
            .header(AUTHORIZATION, format!("UserKey {}", self.config.api_key))
            .header(DATA_STREAM_HEADER, "v1")
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::connect(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(status_error(status.as_u16(), &body));
        }

        let (tx, stream) = EventStream::channel(self.config.buffer_capacity);
        let mapper = PartMapper::new(uuid::Uuid::new_v4(), session_id);
        tokio::spawn(pump(Box::pin(response.bytes_stream()), mapper, tx));
        Ok(stream)
    }
}

pub(crate) fn status_error(status: u16, body: &str) -> TransportError {
    let message = match status {
        401 => "authentication failed - check your API key".to_string(),
        403 => "access forbidden - insufficient permissions".to_string(),
        404 => "endpoint not found".to_string(),
        429 => "rate limit exceeded".to_string(),
        500 => "server error".to_string(),
        502..=504 => "service temporarily unavailable".to_string(),
        _ => format!("request failed with status {status}: {}", body.trim()),
    };
    TransportError::status(status, message)
}

/// Reads the response body until the stream finishes, the body ends or the
/// receiver goes away.
///
/// A read failure closes the channel like a dropped connection, so the
/// consumer finalizes whatever arrived instead of reporting an agent error.
async fn pump<S, E>(mut bytes: S, mut mapper: PartMapper, tx: mpsc::Sender<StreamEvent>)
where
    S: futures::Stream<Item = Result<bytes::Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut decoder = LineDecoder::default();
    loop {
        let chunk = tokio::select! {
            biased;
            _ = tx.closed() => {
                debug!("event receiver dropped; stopping data stream reader");
                return;
            }
            chunk = bytes.next() => chunk,
        };
        match chunk {
            Some(Ok(chunk)) => {
                for line in decoder.push_chunk(&chunk) {
                    if !forward(&line, &mut mapper, &tx).await {
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                warn!(error = %e, "data stream read failed; closing stream");
                return;
            }
            None => {
                if let Some(line) = decoder.finish() {
                    forward(&line, &mut mapper, &tx).await;
                }
                return;
            }
        }
    }
}

/// Maps and sends one line. Returns false once reading should stop.
async fn forward(line: &str, mapper: &mut PartMapper, tx: &mpsc::Sender<StreamEvent>) -> bool {
    match mapper.map_line(line) {
        Ok(Some(event)) => {
            if tx.send(event).await.is_err() {
                return false;
            }
        }
        Ok(None) => {}
        Err(err) => warn!(error = %err, "skipping data stream line"),
    }
    !mapper.is_finished()
}
