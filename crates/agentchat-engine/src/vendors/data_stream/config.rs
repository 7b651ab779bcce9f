use std::time::Duration;

use crate::errors::SessionError;

/// Configuration for the data-stream agent endpoint.
#[derive(Clone, Debug)]
pub struct DataStreamConfig {
    /// Key sent as `Authorization: UserKey <key>`.
    pub api_key: String,
    /// API root, e.g. `https://api.kubiya.ai/api/v1`.
    pub base_url: String,
    /// Path of the streaming endpoint below `base_url`.
    pub stream_path: String,
    pub user_email: Option<String>,
    pub org: Option<String>,
    /// Timeout for establishing the connection. The stream itself is bounded
    /// by the engine's call timeout.
    pub connect_timeout: Duration,
    /// Capacity of the channel between the reader task and the consumer.
    pub buffer_capacity: usize,
}

impl DataStreamConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: "https://api.kubiya.ai/api/v1".to_string(),
            stream_path: "/hb/v4/stream".to_string(),
            user_email: None,
            org: None,
            connect_timeout: Duration::from_secs(30),
            buffer_capacity: 128,
        }
    }

    /// Builds a config from `AGENTCHAT_API_KEY` and the optional
    /// `AGENTCHAT_BASE_URL`, `AGENTCHAT_STREAM_PATH`, `AGENTCHAT_USER_EMAIL`
    /// and `AGENTCHAT_ORG`.
    pub fn from_env() -> Result<Self, SessionError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, SessionError> {
        let present = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let api_key = present("AGENTCHAT_API_KEY").ok_or_else(|| {
            SessionError::Config("missing AGENTCHAT_API_KEY for the agent endpoint".into())
        })?;
        let mut config = Self::new(api_key);
        if let Some(base_url) = present("AGENTCHAT_BASE_URL") {
            config.base_url = base_url;
        }
        if let Some(path) = present("AGENTCHAT_STREAM_PATH") {
            config.stream_path = path;
        }
        config.user_email = present("AGENTCHAT_USER_EMAIL");
        config.org = present("AGENTCHAT_ORG");
        Ok(config)
    }

    /// Overrides the API base URL (for proxies or test servers).
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn stream_path(mut self, path: impl Into<String>) -> Self {
        self.stream_path = path.into();
        self
    }

    pub fn user_email(mut self, email: impl Into<String>) -> Self {
        self.user_email = Some(email.into());
        self
    }

    pub fn org(mut self, org: impl Into<String>) -> Self {
        self.org = Some(org.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity.max(1);
        self
    }

    pub(crate) fn stream_url(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.stream_path.trim_start_matches('/')
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn missing_key_is_config_error() {
        let err = DataStreamConfig::from_lookup(lookup(&[("AGENTCHAT_API_KEY", "  ")]))
            .expect_err("config error");
        assert!(matches!(err, SessionError::Config(_)));
    }

    #[test]
    fn env_overrides_are_applied() {
        let config = DataStreamConfig::from_lookup(lookup(&[
            ("AGENTCHAT_API_KEY", "k"),
            ("AGENTCHAT_BASE_URL", "http://localhost:9000/api/"),
            ("AGENTCHAT_ORG", "acme"),
        ]))
        .expect("config");
        assert_eq!(config.api_key, "k");
        assert_eq!(config.org.as_deref(), Some("acme"));
        assert_eq!(config.user_email, None);
        assert_eq!(
            config.stream_url(),
            "http://localhost:9000/api/hb/v4/stream"
        );
    }
}
