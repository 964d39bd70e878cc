//! Client for the inference server, reached through the local tunnel port.
//!
//! Two endpoints: `GET /health` and `POST /query {prompt}` answering
//! `{response}` or `{error}`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{HpcError, Result};
use crate::tunnel::marker::LISTEN_HOST;

#[derive(Debug, Serialize)]
struct QueryRequest<'a> {
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct QueryReply {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InferenceClient {
    http: reqwest::Client,
    base_url: String,
}

impl InferenceClient {
    /// Client for `http://127.0.0.1:<local_port>`.
    pub fn new(local_port: u16, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(InferenceClient {
            http,
            base_url: format!("http://{}:{}", LISTEN_HOST, local_port),
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// True when `/health` answers 2xx.
    pub async fn health(&self) -> Result<bool> {
        let response = self
            .http
            .get(format!("{}/health", self.base_url))
            .send()
            .await?;
        Ok(response.status().is_success())
    }

    /// Poll `/health` every `interval` until it answers 2xx. The server may
    /// still be loading its model after the tunnel is up.
    pub async fn wait_healthy(
        &self,
        interval: Duration,
        limit: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            match self.health().await {
                Ok(true) => return Ok(()),
                Ok(false) => tracing::debug!("inference server not healthy yet"),
                Err(e) => tracing::debug!(error = %e, "health check failed"),
            }
            if tokio::time::Instant::now() + interval > deadline {
                return Err(HpcError::timeout("inference server health", limit));
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => {
                    return Err(HpcError::Cancelled("health wait cancelled".into()));
                }
            }
        }
    }

    /// Send one prompt and return the model's answer.
    pub async fn query(&self, prompt: &str) -> Result<String> {
        let response = self
            .http
            .post(format!("{}/query", self.base_url))
            .json(&QueryRequest { prompt })
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;

        let reply: QueryReply = serde_json::from_str(&body).map_err(|_| {
            HpcError::Inference(format!("HTTP {}: {}", status.as_u16(), body.trim()))
        })?;
        match (reply.response, reply.error) {
            (_, Some(error)) => Err(HpcError::Inference(error)),
            (Some(answer), None) if status.is_success() => Ok(answer),
            _ => Err(HpcError::Inference(format!(
                "HTTP {} without a response field",
                status.as_u16()
            ))),
        }
    }
}
