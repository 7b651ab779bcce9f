use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::errors::ToolApiError;

/// Configuration for the local tool runner sidecar.
#[derive(Clone, Debug)]
pub struct ToolRunnerConfig {
    /// Base URL of the sidecar.
    pub base_url: String,
    /// HTTP timeout per request.
    pub timeout: Duration,
    /// Pause between status polls for async executions.
    pub poll_interval: Duration,
}

impl Default for ToolRunnerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5001".to_string(),
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl ToolRunnerConfig {
    /// Reads `AGENTCHAT_TOOL_RUNNER_URL`, falling back to the default.
    pub fn from_env() -> Self {
        match std::env::var("AGENTCHAT_TOOL_RUNNER_URL") {
            Ok(url) if !url.trim().is_empty() => Self::default().base_url(url),
            _ => Self::default(),
        }
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

/// Body of `POST /tool/execute`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ToolExecutionRequest {
    pub tool_name: String,
    pub source_url: String,
    pub arg_map: BTreeMap<String, String>,
    pub env_vars: BTreeMap<String, String>,
    #[serde(rename = "async")]
    pub run_async: bool,
}

impl ToolExecutionRequest {
    pub fn new(tool_name: impl Into<String>, source_url: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            source_url: source_url.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.arg_map.insert(key.into(), value.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    pub fn run_async(mut self, run_async: bool) -> Self {
        self.run_async = run_async;
        self
    }
}

#[derive(Debug, Deserialize)]
struct ExecuteResponse {
    status: String,
    #[serde(default)]
    execution_id: Option<String>,
    #[serde(default)]
    output: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    output: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Result of a finished tool execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolRunOutput {
    pub execution_id: Option<String>,
    pub output: String,
}

/// HTTP client for the tool runner sidecar.
pub struct ToolRunnerClient {
    client: reqwest::Client,
    config: ToolRunnerConfig,
}

impl ToolRunnerClient {
    pub fn new(config: ToolRunnerConfig) -> Result<Self, ToolApiError> {
        if config.base_url.trim().is_empty() {
            return Err(ToolApiError::Config("tool runner base_url must not be empty".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ToolApiError::Config(format!("failed to build tool runner client: {e}")))?;
        Ok(Self { client, config })
    }

    pub fn from_env() -> Result<Self, ToolApiError> {
        Self::new(ToolRunnerConfig::from_env())
    }

    /// Runs a tool and waits for its output.
    ///
    /// Async executions are polled until they finish; `cancel` is observed
    /// between polls.
    pub async fn execute(
        &self,
        request: &ToolExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<ToolRunOutput, ToolApiError> {
        info!(tool = %request.tool_name, run_async = request.run_async, "executing tool");
        let send = self
            .client
            .post(self.config.url("/tool/execute"))
            .json(request)
            .send();
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ToolApiError::Cancelled),
            response = send => response.map_err(|e| ToolApiError::Transport(e.to_string()))?,
        };
        let body: ExecuteResponse = read_json(response).await?;

        match body.status.as_str() {
            "completed" => Ok(ToolRunOutput {
                execution_id: body.execution_id,
                output: body.output.unwrap_or_default(),
            }),
            "async" => {
                let execution_id = body.execution_id.filter(|id| !id.is_empty()).ok_or_else(|| {
                    ToolApiError::Protocol("async execution without execution_id".into())
                })?;
                self.wait_for(&execution_id, cancel).await
            }
            "error" | "failed" => Err(ToolApiError::Failed(
                body.error.unwrap_or_else(|| "tool execution failed".into()),
            )),
            other => match body.error.filter(|e| !e.is_empty()) {
                Some(error) => Err(ToolApiError::Failed(error)),
                None => Err(ToolApiError::Protocol(format!(
                    "unexpected execution status: {other}"
                ))),
            },
        }
    }

    async fn wait_for(
        &self,
        execution_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ToolRunOutput, ToolApiError> {
        let url = self.config.url(&format!("/tool/status/{execution_id}"));
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ToolApiError::Cancelled),
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ToolApiError::Cancelled),
                response = self.client.get(&url).send() => {
                    response.map_err(|e| ToolApiError::Transport(e.to_string()))?
                }
            };
            let status: StatusResponse = read_json(response).await?;
            debug!(execution_id, status = %status.status, "tool status");
            match status.status.as_str() {
                "completed" => {
                    return Ok(ToolRunOutput {
                        execution_id: Some(execution_id.to_string()),
                        output: status.output.unwrap_or_default(),
                    });
                }
                "failed" | "error" => {
                    return Err(ToolApiError::Failed(
                        status
                            .error
                            .filter(|e| !e.is_empty())
                            .unwrap_or_else(|| "tool execution failed".into()),
                    ));
                }
                _ => {}
            }
        }
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ToolApiError> {
    let status = response.status();
    if !status.is_success() {
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        return Err(ToolApiError::Status {
            status: status.as_u16(),
            message,
        });
    }
    response
        .json::<T>()
        .await
        .map_err(|e| ToolApiError::Protocol(e.to_string()))
}
