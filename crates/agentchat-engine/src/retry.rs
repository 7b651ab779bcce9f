use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::SessionError;
use crate::transport::{AgentTransport, EventStream, OpenStreamRequest};

/// Bounded retry policy for stream establishment.
///
/// The default is three attempts with a fixed two second pause between
/// them; a `backoff_factor` above 1.0 turns it exponential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Pause before the first retry.
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    /// Multiplier per retry step.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Upper bound for computed pauses.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_delay_ms() -> u64 {
    2_000
}

const fn default_backoff_factor() -> f64 {
    1.0
}

const fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(default_max_attempts(), default_delay_ms())
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            delay_ms: 0,
            backoff_factor: default_backoff_factor(),
            max_delay_ms: default_max_delay_ms(),
        }
    }

    pub const fn fixed(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            delay_ms,
            backoff_factor: default_backoff_factor(),
            max_delay_ms: default_max_delay_ms(),
        }
    }

    pub fn exponential(max_attempts: u32, delay_ms: u64, backoff_factor: f64) -> Self {
        let factor = if backoff_factor < 1.0 {
            default_backoff_factor()
        } else {
            backoff_factor
        };
        Self {
            max_attempts,
            delay_ms,
            backoff_factor: factor,
            max_delay_ms: default_max_delay_ms(),
        }
    }

    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms.max(1);
        self
    }

    /// Whether another attempt is allowed after `attempts_done` failures.
    pub fn can_retry(&self, attempts_done: u32) -> bool {
        attempts_done < self.max_attempts.max(1)
    }

    /// Pause after `attempts_done` failed attempts (1-based).
    pub fn delay_after(&self, attempts_done: u32) -> Duration {
        if attempts_done == 0 || self.delay_ms == 0 {
            return Duration::ZERO;
        }
        let exp = self.backoff_factor.powi(attempts_done.saturating_sub(1) as i32);
        let base = (self.delay_ms as f64 * exp).round() as u64;
        Duration::from_millis(base.min(self.max_delay_ms.max(1)))
    }
}

/// Opens a stream, retrying transient failures under `policy`.
///
/// Permanent transport failures stop immediately. Cancellation is observed
/// during every attempt and every pause.
pub async fn open_with_retry(
    transport: &dyn AgentTransport,
    request: &OpenStreamRequest,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<EventStream, SessionError> {
    let mut attempts = 0_u32;
    loop {
        attempts += 1;
        debug!(agent_id = %request.agent_id, attempt = attempts, "opening agent stream");
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
            result = transport.open_stream(request.clone()) => result,
        };
        let err = match result {
            Ok(stream) => return Ok(stream),
            Err(err) => err,
        };

        if !err.is_retryable() || !policy.can_retry(attempts) {
            warn!(
                agent_id = %request.agent_id,
                attempts,
                retryable = err.is_retryable(),
                error = %err,
                "giving up on agent stream"
            );
            return Err(SessionError::Transport {
                attempts,
                source: err,
            });
        }

        let delay = policy.delay_after(attempts);
        warn!(
            agent_id = %request.agent_id,
            attempt = attempts,
            max_attempts = policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "agent stream failed to open, retrying"
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
