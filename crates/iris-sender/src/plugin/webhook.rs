//! HTTP webhook plugin
//!
//! POSTs the rendered message as JSON. Status handling:
//! - 2xx: delivered
//! - 408, 429, 5xx: transient
//! - any other status: permanent
//! - connection refused before sending: transient
//! - timeout or connection lost mid-request: ambiguous

use super::Plugin;
use async_trait::async_trait;
use iris_core::{ChannelError, Message, Mode};
use reqwest::StatusCode;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Webhook delivery for one mode
#[derive(Debug, Clone)]
pub struct WebhookPlugin {
    mode: Mode,
    url: String,
    token: Option<String>,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    message_id: String,
    incident_id: Option<String>,
    batch_id: Option<String>,
    application: &'a str,
    target: &'a str,
    mode: &'a str,
    destination: &'a str,
    priority: &'a str,
    subject: &'a str,
    body: &'a str,
}

impl WebhookPlugin {
    /// Create for a mode and endpoint
    ///
    /// # Errors
    /// Returns the client build error
    pub fn new(
        mode: Mode,
        url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            mode,
            url: url.into(),
            token: None,
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }

    /// With bearer token
    #[must_use]
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    fn payload<'a>(&'a self, message: &'a Message, destination: &'a str) -> WebhookPayload<'a> {
        WebhookPayload {
            message_id: message.id.to_string(),
            incident_id: message.incident_id().map(|id| id.to_string()),
            batch_id: message.batch.as_ref().map(|b| b.id.to_string()),
            application: &message.application,
            target: &message.target,
            mode: self.mode.as_str(),
            destination,
            priority: message.priority.as_str(),
            subject: &message.subject,
            body: &message.body,
        }
    }
}

fn classify_status(status: StatusCode, body: &str) -> Result<(), ChannelError> {
    if status.is_success() {
        return Ok(());
    }
    let detail = format!("webhook returned {status}: {body}");
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        Err(ChannelError::Transient(detail))
    } else {
        Err(ChannelError::Permanent(detail))
    }
}

fn classify_error(error: &reqwest::Error) -> ChannelError {
    if error.is_connect() {
        ChannelError::Transient(format!("connect failed: {error}"))
    } else if error.is_builder() {
        ChannelError::Permanent(format!("invalid request: {error}"))
    } else {
        ChannelError::Ambiguous(error.to_string())
    }
}

#[async_trait]
impl Plugin for WebhookPlugin {
    fn mode(&self) -> &Mode {
        &self.mode
    }

    async fn send(&self, message: &Message) -> Result<(), ChannelError> {
        let destination = message
            .contact()
            .map(|c| c.destination.as_str())
            .ok_or_else(|| ChannelError::Permanent("message has no contact".into()))?;

        debug!(mode = %self.mode, message_id = %message.id, "posting webhook");
        let mut request = self
            .client
            .post(&self.url)
            .json(&self.payload(message, destination));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| classify_error(&e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        warn!(mode = %self.mode, status = %status, "webhook rejected message");
        classify_status(status, &body)
    }
}
