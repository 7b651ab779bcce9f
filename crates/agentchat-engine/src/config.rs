use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::errors::SessionError;
use crate::retry::RetryPolicy;

/// Runtime settings for a session controller.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    /// Hard deadline for one exchange.
    pub call_timeout: Duration,
    /// Stream establishment retries.
    pub retry: RetryPolicy,
    /// Refresh cadence for presentation loops.
    pub tick_interval: Duration,
    /// How long finished tool records stay visible.
    pub tool_grace: Duration,
    /// How often finished tool records are swept.
    pub sweep_interval: Duration,
    /// Bounded buffer between transports and the consumer.
    pub stream_buffer_capacity: usize,
    /// Sender name stamped on the local user's messages.
    pub user_name: String,
    /// Sender name used when the agent does not send one.
    pub agent_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
            tick_interval: Duration::from_millis(100),
            tool_grace: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            stream_buffer_capacity: 128,
            user_name: "You".to_string(),
            agent_name: "Agent".to_string(),
        }
    }
}

impl EngineConfig {
    /// Reads `AGENTCHAT_*` overrides from the process environment.
    ///
    /// Unparseable values are logged and replaced by the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let retry = RetryPolicy::exponential(
            parse_or(&lookup, "AGENTCHAT_RETRY_ATTEMPTS", defaults.retry.max_attempts),
            parse_or(&lookup, "AGENTCHAT_RETRY_DELAY_MS", defaults.retry.delay_ms),
            parse_or(&lookup, "AGENTCHAT_RETRY_BACKOFF", defaults.retry.backoff_factor),
        );
        let call_timeout = Duration::from_secs(parse_or(
            &lookup,
            "AGENTCHAT_CALL_TIMEOUT_SECS",
            defaults.call_timeout.as_secs(),
        ));
        let tick_interval = Duration::from_millis(parse_or(
            &lookup,
            "AGENTCHAT_TICK_MS",
            defaults.tick_interval.as_millis() as u64,
        ));
        let tool_grace = Duration::from_secs(parse_or(
            &lookup,
            "AGENTCHAT_TOOL_GRACE_SECS",
            defaults.tool_grace.as_secs(),
        ));
        let user_name = lookup("AGENTCHAT_USER_NAME")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| defaults.user_name.clone());
        Self {
            call_timeout,
            retry,
            tick_interval,
            tool_grace,
            user_name,
            ..defaults
        }
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn tool_grace(mut self, grace: Duration) -> Self {
        self.tool_grace = grace;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn stream_buffer_capacity(mut self, capacity: usize) -> Self {
        self.stream_buffer_capacity = capacity;
        self
    }

    pub fn user_name(mut self, name: impl Into<String>) -> Self {
        self.user_name = name.into();
        self
    }

    pub fn agent_name(mut self, name: impl Into<String>) -> Self {
        self.agent_name = name.into();
        self
    }

    pub(crate) fn validate(&self) -> Result<(), SessionError> {
        if self.call_timeout.is_zero() {
            return Err(SessionError::Config(
                "call_timeout must be greater than 0".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(SessionError::Config(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.stream_buffer_capacity == 0 {
            return Err(SessionError::Config(
                "stream_buffer_capacity must be greater than 0".into(),
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(SessionError::Config(
                "sweep_interval must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

pub(crate) fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, "ignoring unparseable setting");
                default
            }
        },
        _ => default,
    }
}
