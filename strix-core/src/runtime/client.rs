//! HTTP client for the in-container tool server
//!
//! Protocol: loopback-bound server inside the sandbox exposing `GET /health`,
//! `POST /register_agent`, and `POST /execute`. Every request carries the
//! per-scan bearer token. Transient transport failures are retried with
//! jittered backoff; a tool call that outlives the execution timeout is
//! abandoned with a timeout error.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::gateway::{build_backoff, RetryConfig};
use crate::{Error, Result};

use super::Sandbox;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REGISTER_TIMEOUT: Duration = Duration::from_secs(30);
const TRANSPORT_RETRIES: usize = 3;

#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
}

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    worker_id: String,
}

#[derive(Debug, Deserialize)]
struct ToolServerError {
    #[serde(default)]
    kind: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ExecuteResponse {
    ok: bool,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<ToolServerError>,
}

/// Client half of the sandbox protocol
#[derive(Debug, Clone)]
pub struct SandboxClient {
    http: reqwest::Client,
    execution_timeout: Duration,
}

impl SandboxClient {
    pub fn new(execution_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .no_proxy()
            .build()?;
        Ok(Self {
            http,
            execution_timeout,
        })
    }

    /// One health probe; true when the worker answers `{status: "ok"}`.
    pub async fn health(&self, sandbox: &Sandbox) -> bool {
        let response = self
            .http
            .get(format!("{}/health", sandbox.url))
            .bearer_auth(&sandbox.token)
            .timeout(Duration::from_secs(5))
            .send()
            .await;

        match response {
            Ok(response) => match response.json::<HealthResponse>().await {
                Ok(health) => health.status == "ok",
                Err(_) => false,
            },
            Err(error) => {
                debug!(%error, "Sandbox health probe failed");
                false
            }
        }
    }

    /// Fork a dedicated worker for an agent so tool state (browser session,
    /// shell) stays isolated per agent.
    pub async fn register_agent(&self, sandbox: &Sandbox, agent_id: &str) -> Result<String> {
        let response = self
            .http
            .post(format!("{}/register_agent", sandbox.url))
            .bearer_auth(&sandbox.token)
            .json(&json!({ "agent_id": agent_id }))
            .timeout(REGISTER_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::SandboxUnavailable(format!("register_agent failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::SandboxUnavailable(format!(
                "register_agent returned {}",
                response.status()
            )));
        }

        let registered: RegisterResponse = response.json().await?;
        debug!(agent_id, worker_id = %registered.worker_id, "Registered agent worker");
        Ok(registered.worker_id)
    }

    /// Execute one tool call in the agent's worker.
    ///
    /// Worker-reported errors come back as [`Error::Tool`] so the engine can
    /// feed them to the model. Transport failures retry up to three times
    /// with jittered backoff; the execution timeout is not retried.
    pub async fn execute(
        &self,
        sandbox: &Sandbox,
        agent_id: &str,
        tool: &str,
        args: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<serde_json::Value> {
        use backon::BackoffBuilder;
        let retry = RetryConfig {
            max_retries: TRANSPORT_RETRIES,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            jitter: true,
        };
        let mut delays = build_backoff(&retry).build();

        loop {
            match self.execute_once(sandbox, agent_id, tool, args).await {
                Err(Error::Http(transport)) => match delays.next() {
                    Some(delay) => {
                        warn!(%transport, tool, ?delay, "Sandbox transport error, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        return Err(Error::SandboxUnavailable(format!(
                            "tool server unreachable after {TRANSPORT_RETRIES} retries: {transport}"
                        )))
                    }
                },
                other => return other,
            }
        }
    }

    async fn execute_once(
        &self,
        sandbox: &Sandbox,
        agent_id: &str,
        tool: &str,
        args: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let sent = self
            .http
            .post(format!("{}/execute", sandbox.url))
            .bearer_auth(&sandbox.token)
            .json(&json!({
                "agent_id": agent_id,
                "tool": tool,
                "args": args,
            }))
            .timeout(self.execution_timeout)
            .send()
            .await;

        let response = match sent {
            Ok(response) => response,
            Err(error) if error.is_timeout() => {
                return Err(Error::SandboxTimeout(self.execution_timeout.as_secs()));
            }
            Err(error) => return Err(Error::Http(error)),
        };

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(Error::SandboxUnavailable(
                "invalid or missing sandbox token".to_string(),
            ));
        }

        let parsed: ExecuteResponse = response
            .json()
            .await
            .map_err(|e| Error::SandboxUnavailable(format!("malformed tool server reply: {e}")))?;

        match (parsed.ok, parsed.result, parsed.error) {
            (true, result, _) => Ok(result.unwrap_or(serde_json::Value::Null)),
            (false, _, Some(error)) => {
                let kind = if error.kind.is_empty() {
                    "tool_error"
                } else {
                    &error.kind
                };
                Err(Error::Tool(format!("{kind}: {}", error.message)))
            }
            (false, _, None) => Err(Error::Tool("tool server returned ok=false".to_string())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn sandbox(url: &str) -> Sandbox {
        Sandbox {
            container_id: "deadbeef".to_string(),
            scan_id: "scan-test".to_string(),
            url: url.to_string(),
            token: super::super::mint_token(),
            port: 1,
        }
    }

    #[tokio::test]
    async fn test_health_false_when_unreachable() {
        let client = SandboxClient::new(Duration::from_secs(1)).unwrap();
        // Port 9 (discard) is not listening
        assert!(!client.health(&sandbox("http://127.0.0.1:9")).await);
    }

    #[tokio::test]
    async fn test_register_agent_unreachable_is_sandbox_unavailable() {
        let client = SandboxClient::new(Duration::from_secs(1)).unwrap();
        let error = client
            .register_agent(&sandbox("http://127.0.0.1:9"), "agent_1")
            .await
            .unwrap_err();
        assert!(matches!(error, Error::SandboxUnavailable(_)));
    }

    #[test]
    fn test_execute_response_parsing() {
        let ok: ExecuteResponse =
            serde_json::from_str(r#"{"ok": true, "result": {"stdout": "hi"}}"#).unwrap();
        assert!(ok.ok);
        assert!(ok.result.is_some());

        let err: ExecuteResponse = serde_json::from_str(
            r#"{"ok": false, "error": {"kind": "timeout", "message": "too slow"}}"#,
        )
        .unwrap();
        assert!(!err.ok);
        assert_eq!(err.error.unwrap().kind, "timeout");
    }
}
