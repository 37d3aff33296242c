//! Typed HTTP client for the control plane.

use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;

use lookout_wire::{KillRequest, LogEntry, RawSession};

use crate::config::MonitorConfig;
use crate::error::{MonitorError, Result};

#[derive(Clone)]
pub struct ControlPlaneClient {
    base_url: String,
    bearer_token: Option<String>,
    http: Client,
    action_timeout: Duration,
}

impl ControlPlaneClient {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            bearer_token: config.bearer_token.clone(),
            http: Client::builder()
                .timeout(config.action_timeout)
                .build()
                .expect("failed to build reqwest client"),
            action_timeout: config.action_timeout,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// GET returning the response on 2xx, `Transport` otherwise. Reads never
    /// produce `Action` errors; a failing control plane is a transport
    /// problem for the pipeline to absorb.
    async fn get(&self, path: &str) -> Result<Response> {
        let response = self
            .authorize(self.http.get(self.endpoint(path)))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(MonitorError::Transport(format!(
                "GET {path} failed ({})",
                response.status()
            )));
        }
        Ok(response)
    }

    /// POST for mutations: non-2xx is an `Action` rejection carried back to
    /// the dispatch caller, a timeout is `ActionTimeout`.
    async fn post(&self, path: &str, body: &Value) -> Result<()> {
        let response = self
            .authorize(self.http.post(self.endpoint(path)))
            .json(body)
            .send()
            .await
            .map_err(|err| self.action_error(err))?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(MonitorError::Action {
                status: status.as_u16(),
                message: preview(&message),
            });
        }
        Ok(())
    }

    fn action_error(&self, err: reqwest::Error) -> MonitorError {
        if err.is_timeout() {
            MonitorError::ActionTimeout(self.action_timeout)
        } else {
            MonitorError::Transport(err.to_string())
        }
    }

    pub async fn list_sessions(&self) -> Result<Vec<RawSession>> {
        Ok(self.get("/sessions").await?.json().await?)
    }

    pub async fn get_session(&self, id: &str) -> Result<RawSession> {
        Ok(self.get(&format!("/sessions/{id}")).await?.json().await?)
    }

    pub async fn logs(&self, id: &str, limit: usize) -> Result<Vec<LogEntry>> {
        Ok(self
            .get(&format!("/sessions/{id}/logs?limit={limit}"))
            .await?
            .json()
            .await?)
    }

    /// Metrics are provider-defined; hand the payload through untyped.
    pub async fn metrics(&self, id: &str) -> Result<Value> {
        Ok(self
            .get(&format!("/sessions/{id}/metrics"))
            .await?
            .json()
            .await?)
    }

    pub async fn kill(&self, id: &str, reason: Option<String>) -> Result<()> {
        let body = match reason {
            Some(reason) => KillRequest { reason },
            None => KillRequest::default(),
        };
        self.post(
            &format!("/sessions/{id}/kill"),
            &serde_json::to_value(body).expect("kill request serializes"),
        )
        .await
    }

    pub async fn respawn(&self, id: &str, config: Value) -> Result<()> {
        self.post(&format!("/sessions/{id}/respawn"), &config).await
    }

}

fn preview(body: &str) -> String {
    const MAX: usize = 320;
    if body.chars().count() > MAX {
        let truncated: String = body.chars().take(MAX).collect();
        format!("{truncated}...")
    } else {
        body.to_string()
    }
}
