use std::time::Duration;

use anyhow::Context;
use hearth_core::{JobAction, JobStatus};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct JobNotification {
    pub job_id: Uuid,
    pub server_id: Uuid,
    pub server_name: String,
    pub action: JobAction,
    pub outcome: JobStatus,
    pub error: Option<String>,
    pub channel: String,
    pub user: Option<String>,
}

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &JobNotification) -> anyhow::Result<()>;
}

pub struct NoopNotifier;

#[async_trait::async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, event: &JobNotification) -> anyhow::Result<()> {
        tracing::debug!(job_id = %event.job_id, "no notifier configured");
        Ok(())
    }
}

/// POSTs each notification as JSON.
pub struct WebhookNotifier {
    http: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent("hearth-control")
            .timeout(Duration::from_secs(10))
            .build()
            .context("build webhook http client")?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &JobNotification) -> anyhow::Result<()> {
        self.http
            .post(&self.url)
            .json(event)
            .send()
            .await
            .context("send job notification")?
            .error_for_status()
            .context("notification webhook returned non-2xx")?;
        Ok(())
    }
}
