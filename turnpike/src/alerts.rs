//! Alert transport: SMTP and webhook sinks behind a common `Notify`
//! interface.
//!
//! Delivery is best-effort. The budget evaluator records the outcome in
//! `budget_alert_events` (`success=false` plus the error text on failure)
//! and request processing is never blocked on a sink.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config::AlertsConfig;
use crate::db::models::budgets::AlertLevel;
use crate::types::TenantId;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// What a sink gets to work with.
#[derive(Debug, Clone, Serialize)]
pub struct AlertPayload {
    pub tenant_id: TenantId,
    pub tenant_name: String,
    pub level: AlertLevel,
    pub used_cents: i64,
    pub limit_cents: i64,
    pub window_start: DateTime<Utc>,
}

impl AlertPayload {
    fn subject(&self) -> String {
        match self.level {
            AlertLevel::Warning => format!("Budget warning for tenant {}", self.tenant_name),
            AlertLevel::Exceeded => format!("Budget exceeded for tenant {}", self.tenant_name),
        }
    }

    fn body_text(&self) -> String {
        format!(
            "Tenant {} has used {:.2} of its {:.2} USD budget for the window starting {}.",
            self.tenant_name,
            self.used_cents as f64 / 100.0,
            self.limit_cents as f64 / 100.0,
            self.window_start.to_rfc3339(),
        )
    }
}

#[async_trait]
pub trait Notify: Send + Sync {
    fn name(&self) -> &'static str;
    async fn notify(&self, payload: &AlertPayload) -> anyhow::Result<()>;
}

/// POSTs the payload as JSON, with an optional static auth header.
pub struct WebhookSink {
    http: reqwest::Client,
    url: String,
    auth_header: Option<String>,
    auth_value: Option<String>,
}

impl WebhookSink {
    pub fn new(http: reqwest::Client, url: String, auth_header: Option<String>, auth_value: Option<String>) -> Self {
        Self {
            http,
            url,
            auth_header,
            auth_value,
        }
    }
}

#[async_trait]
impl Notify for WebhookSink {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn notify(&self, payload: &AlertPayload) -> anyhow::Result<()> {
        let mut request = self.http.post(&self.url).timeout(WEBHOOK_TIMEOUT).json(payload);
        if let (Some(header), Some(value)) = (&self.auth_header, &self.auth_value) {
            request = request.header(header, value);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            anyhow::bail!("webhook returned status {}", response.status());
        }
        Ok(())
    }
}

/// Plain-text email through a relay.
pub struct SmtpSink {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
}

impl SmtpSink {
    pub fn from_config(config: &crate::config::SmtpConfig) -> anyhow::Result<Self> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)?.port(config.port);
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }
        Ok(Self {
            transport: builder.build(),
            from: config.from.parse()?,
            to: config
                .to
                .iter()
                .map(|addr| addr.parse())
                .collect::<Result<Vec<Mailbox>, _>>()?,
        })
    }
}

#[async_trait]
impl Notify for SmtpSink {
    fn name(&self) -> &'static str {
        "smtp"
    }

    async fn notify(&self, payload: &AlertPayload) -> anyhow::Result<()> {
        for recipient in &self.to {
            let message = Message::builder()
                .from(self.from.clone())
                .to(recipient.clone())
                .subject(payload.subject())
                .body(payload.body_text())?;
            self.transport.send(message).await?;
        }
        Ok(())
    }
}

/// Fans one alert out to every configured sink.
pub struct AlertDispatcher {
    sinks: Vec<Arc<dyn Notify>>,
}

impl AlertDispatcher {
    pub fn new(sinks: Vec<Arc<dyn Notify>>) -> Self {
        Self { sinks }
    }

    pub fn from_config(config: &AlertsConfig, http: reqwest::Client) -> Self {
        let mut sinks: Vec<Arc<dyn Notify>> = Vec::new();
        if let Some(webhook) = &config.webhook {
            sinks.push(Arc::new(WebhookSink::new(
                http,
                webhook.url.clone(),
                webhook.auth_header.clone(),
                webhook.auth_value.clone(),
            )));
        }
        if let Some(smtp) = &config.smtp {
            match SmtpSink::from_config(smtp) {
                Ok(sink) => sinks.push(Arc::new(sink)),
                Err(e) => tracing::error!("smtp alert sink misconfigured, skipping: {e:#}"),
            }
        }
        Self::new(sinks)
    }

    /// Deliver to all sinks; the error string aggregates every failure for
    /// the event row.
    pub async fn dispatch(&self, payload: &AlertPayload) -> Result<(), String> {
        let mut failures = Vec::new();
        for sink in &self.sinks {
            if let Err(e) = sink.notify(payload).await {
                tracing::warn!(sink = sink.name(), "alert delivery failed: {e:#}");
                failures.push(format!("{}: {e:#}", sink.name()));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures.join("; "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn payload(level: AlertLevel) -> AlertPayload {
        AlertPayload {
            tenant_id: uuid::Uuid::new_v4(),
            tenant_name: "acme".to_string(),
            level,
            used_cents: 820,
            limit_cents: 1000,
            window_start: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_webhook_sink_posts_payload_with_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/alerts"))
            .and(header("x-alert-token", "s3cret"))
            .and(body_partial_json(serde_json::json!({
                "tenant_name": "acme",
                "level": "warning",
                "used_cents": 820,
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let sink = WebhookSink::new(
            reqwest::Client::new(),
            format!("{}/alerts", server.uri()),
            Some("x-alert-token".to_string()),
            Some("s3cret".to_string()),
        );
        sink.notify(&payload(AlertLevel::Warning)).await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatch_aggregates_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dispatcher = AlertDispatcher::new(vec![Arc::new(WebhookSink::new(
            reqwest::Client::new(),
            server.uri(),
            None,
            None,
        ))]);
        let err = dispatcher.dispatch(&payload(AlertLevel::Exceeded)).await.unwrap_err();
        assert!(err.contains("webhook"));
    }

    #[tokio::test]
    async fn test_dispatch_with_no_sinks_succeeds() {
        let dispatcher = AlertDispatcher::new(Vec::new());
        assert!(dispatcher.dispatch(&payload(AlertLevel::Warning)).await.is_ok());
    }
}
