//! Scale-In Guard: a thin client against a host-agent HTTP endpoint for
//! task-termination protection (spec.md §4.3).
//!
//! Grounded in the teacher's `fc-router::config_sync::ConfigSyncService`
//! reqwest client and its manual attempt-counted retry loop, adapted from
//! a GET-and-poll shape to a single retrying `PUT`. The status/error
//! taxonomy and request body shape are carried from the Python original's
//! `_ecs_scalein_protection_manager.py`.

pub mod error;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

pub use error::{GuardError, Result};

/// Tuning for the HTTP-backed guard (spec.md §4.3).
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Base URI of the host agent, e.g. the ECS task metadata endpoint.
    pub agent_uri: String,
    pub expires_in_minutes: Option<u32>,
    /// Whether `RequestError` propagates out of `acquire`/`release`.
    pub raise_for_req_error: bool,
    /// Whether `AgentError` propagates out of `acquire`/`release`.
    pub raise_for_agent_error: bool,
    pub request_timeout: Duration,
    pub retries: u32,
    pub backoff_factor: f64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            agent_uri: String::new(),
            expires_in_minutes: Some(60),
            raise_for_req_error: true,
            raise_for_agent_error: true,
            request_timeout: Duration::from_secs(15),
            retries: 3,
            backoff_factor: 0.5,
        }
    }
}

const RETRYABLE_STATUSES: [u16; 4] = [500, 502, 503, 504];

/// Acquire/release task-termination protection around processing of one
/// message. Implementations must be idempotent: acquiring twice, or
/// releasing without a prior acquire, are both valid.
#[async_trait]
pub trait ScaleInGuard: Send + Sync {
    async fn acquire(&self) -> Result<()>;
    async fn release(&self) -> Result<()>;
}

/// A no-op stand-in with the same shape, substituted by the Consumer when
/// the guard is disabled at construction (spec.md §4.3).
pub struct NoopScaleInGuard;

#[async_trait]
impl ScaleInGuard for NoopScaleInGuard {
    async fn acquire(&self) -> Result<()> {
        Ok(())
    }

    async fn release(&self) -> Result<()> {
        Ok(())
    }
}

pub struct HttpScaleInGuard {
    config: GuardConfig,
    client: reqwest::Client,
    uri: String,
}

impl HttpScaleInGuard {
    pub fn new(config: GuardConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .expect("failed to build scale-in guard HTTP client");
        let uri = format!(
            "{}/task-protection/v1/state",
            config.agent_uri.trim_end_matches('/')
        );
        Self {
            config,
            client,
            uri,
        }
    }

    async fn set_state(&self, protection_enabled: bool) -> Result<Value> {
        let mut body = serde_json::Map::new();
        body.insert(
            "ProtectionEnabled".to_string(),
            Value::Bool(protection_enabled),
        );
        if protection_enabled {
            if let Some(minutes) = self.config.expires_in_minutes {
                body.insert("ExpiresInMinutes".to_string(), Value::from(minutes));
            }
        }

        let mut last_error = String::new();

        for attempt in 0..=self.config.retries {
            match self.client.put(&self.uri).json(&body).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let data: Value = response
                            .json()
                            .await
                            .map_err(|e| GuardError::Request(e.to_string()))?;

                        if let Some(failure) = data.get("failure") {
                            return Err(GuardError::Agent(format!("failure={failure}")));
                        }
                        if let Some(error) = data.get("error") {
                            return Err(GuardError::Agent(format!("error={error}")));
                        }
                        return Ok(data);
                    }

                    last_error = format!("status {}", status.as_u16());
                    if !RETRYABLE_STATUSES.contains(&status.as_u16()) || attempt == self.config.retries {
                        return Err(GuardError::Request(last_error));
                    }
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt == self.config.retries {
                        return Err(GuardError::Request(last_error));
                    }
                }
            }

            let delay = Duration::from_secs_f64(self.config.backoff_factor * 2f64.powi(attempt as i32));
            debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying scale-in guard request");
            tokio::time::sleep(delay).await;
        }

        Err(GuardError::Request(last_error))
    }

    async fn set_state_wrapped(&self, protection_enabled: bool) -> Result<()> {
        match self.set_state(protection_enabled).await {
            Ok(data) => {
                debug!(protection_enabled, response = %data, "set scale-in protection state");
                Ok(())
            }
            Err(e @ GuardError::Request(_)) => {
                warn!(error = %e, "scale-in guard request failed");
                if self.config.raise_for_req_error {
                    Err(e)
                } else {
                    Ok(())
                }
            }
            Err(e @ GuardError::Agent(_)) => {
                warn!(error = %e, "scale-in guard agent reported an error");
                if self.config.raise_for_agent_error {
                    Err(e)
                } else {
                    Ok(())
                }
            }
        }
    }
}

#[async_trait]
impl ScaleInGuard for HttpScaleInGuard {
    async fn acquire(&self) -> Result<()> {
        info!(uri = %self.uri, "acquiring scale-in protection");
        self.set_state_wrapped(true).await
    }

    async fn release(&self) -> Result<()> {
        info!(uri = %self.uri, "releasing scale-in protection");
        self.set_state_wrapped(false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(uri: String) -> GuardConfig {
        GuardConfig {
            agent_uri: uri,
            expires_in_minutes: Some(60),
            raise_for_req_error: true,
            raise_for_agent_error: true,
            request_timeout: Duration::from_secs(5),
            retries: 2,
            backoff_factor: 0.01,
        }
    }

    #[tokio::test]
    async fn acquire_sends_protection_enabled_with_expiry() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/task-protection/v1/state"))
            .and(body_json(serde_json::json!({
                "ProtectionEnabled": true,
                "ExpiresInMinutes": 60
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&server)
            .await;

        let guard = HttpScaleInGuard::new(config_for(server.uri()));
        guard.acquire().await.unwrap();
    }

    #[tokio::test]
    async fn release_sends_protection_disabled_without_expiry() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/task-protection/v1/state"))
            .and(body_json(serde_json::json!({"ProtectionEnabled": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let guard = HttpScaleInGuard::new(config_for(server.uri()));
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn retries_on_5xx_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/task-protection/v1/state"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/task-protection/v1/state"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let guard = HttpScaleInGuard::new(config_for(server.uri()));
        guard.acquire().await.unwrap();
    }

    #[tokio::test]
    async fn agent_error_field_surfaces_as_agent_error() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/task-protection/v1/state"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"error": "boom"})))
            .mount(&server)
            .await;

        let guard = HttpScaleInGuard::new(config_for(server.uri()));
        let err = guard.acquire().await.unwrap_err();
        assert!(matches!(err, GuardError::Agent(_)));
    }

    #[tokio::test]
    async fn agent_error_is_swallowed_when_flag_disabled() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/task-protection/v1/state"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"failure": "nope"})))
            .mount(&server)
            .await;

        let mut config = config_for(server.uri());
        config.raise_for_agent_error = false;
        let guard = HttpScaleInGuard::new(config);
        guard.acquire().await.unwrap();
    }

    #[tokio::test]
    async fn request_error_is_swallowed_when_flag_disabled() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/task-protection/v1/state"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let mut config = config_for(server.uri());
        config.raise_for_req_error = false;
        let guard = HttpScaleInGuard::new(config);
        guard.acquire().await.unwrap();
    }

    #[tokio::test]
    async fn noop_guard_always_succeeds() {
        let guard = NoopScaleInGuard;
        guard.acquire().await.unwrap();
        guard.release().await.unwrap();
    }
}
