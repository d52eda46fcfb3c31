//! Outbound run notifications.
//!
//! Notifications are fire-and-forget: callers go through
//! [`notify_best_effort`], which logs and drops delivery failures.

use crate::config::NotifyConfig;
use crate::error::TuneError;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, warn};

/// Longest failure trace sent in one message; the tail is kept.
const MAX_TRACE_CHARS: usize = 3500;

/// A chat sink for short text messages.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, text: &str) -> Result<(), TuneError>;
}

/// Send a notification, logging instead of failing.
pub async fn notify_best_effort(notifier: &dyn Notifier, text: &str) {
    if let Err(e) = notifier.send(text).await {
        warn!(error = %e, "Notification not delivered");
    }
}

pub fn started_message(base_name: &str) -> String {
    format!(":pray: {base_name} training started")
}

pub fn finished_message(base_name: &str) -> String {
    format!(":joy: {base_name} training finished")
}

/// Failure message with the trace in a code block.
pub fn failure_message(trace: &str) -> String {
    let skip = trace.chars().count().saturating_sub(MAX_TRACE_CHARS);
    let trace: String = trace.chars().skip(skip).collect();
    format!(":scream: training failed\n```\n{trace}\n```")
}

/// Render an error and its `source()` chain, one cause per line.
pub fn format_error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str("\nCaused by: ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

/// Posts `{"text": ...}` to a Slack incoming webhook.
pub struct SlackWebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl SlackWebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, TuneError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for SlackWebhookNotifier {
    async fn send(&self, text: &str) -> Result<(), TuneError> {
        let resp = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await
            .map_err(|e| TuneError::notify(format!("webhook request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TuneError::notify(format!("HTTP {status}: {body}")));
        }
        Ok(())
    }
}

/// Writes notifications to the log only.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, text: &str) -> Result<(), TuneError> {
        info!(text = %text, "Notification");
        Ok(())
    }
}

/// Slack when a webhook URL is configured, the log otherwise.
pub fn notifier_from_config(config: &NotifyConfig) -> Result<Box<dyn Notifier>, TuneError> {
    match config.slack_webhook_url.as_deref().filter(|u| !u.is_empty()) {
        Some(url) => Ok(Box::new(SlackWebhookNotifier::new(url)?)),
        None => Ok(Box::new(LogNotifier)),
    }
}
