//! Outbound delivery of codes and notices.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Serialize;

use crate::config::Config;
use crate::types::UserId;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn send_email(&self, to: &str, subject: &str, html: &str) -> anyhow::Result<()>;

    async fn send_sms(&self, to: &str, message: &str) -> anyhow::Result<()>;

    async fn send_notification(
        &self,
        user_id: UserId,
        kind: &str,
        title: &str,
        message: &str,
    ) -> anyhow::Result<()>;
}

#[derive(Serialize)]
#[serde(tag = "channel", rename_all = "snake_case")]
enum WebhookPayload<'a> {
    Sms {
        to: &'a str,
        message: &'a str,
    },
    Notification {
        user_id: String,
        kind: &'a str,
        title: &'a str,
        message: &'a str,
    },
}

/// E-mail over SMTP; SMS and in-app notices over an HTTP webhook.
///
/// Channels without a configured backend log the attempt (never the body).
pub struct SmtpDispatcher {
    mailer: Option<AsyncSmtpTransport<Tokio1Executor>>,
    from_address: String,
    http: reqwest::Client,
    webhook_url: Option<String>,
}

impl SmtpDispatcher {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let smtp = &config.smtp;
        let mailer = match &smtp.host {
            None => None,
            Some(host) => Some(match (&smtp.username, &smtp.password) {
                (Some(username), Some(password)) => {
                    AsyncSmtpTransport::<Tokio1Executor>::relay(host)?
                        .port(smtp.port)
                        .credentials(Credentials::new(username.clone(), password.clone()))
                        .build()
                }
                _ => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
                    .port(smtp.port)
                    .build(),
            }),
        };

        Ok(Self {
            mailer,
            from_address: smtp.from_address.clone(),
            http: reqwest::Client::new(),
            webhook_url: config.notify_webhook_url.clone(),
        })
    }

    async fn post(&self, payload: &WebhookPayload<'_>) -> anyhow::Result<bool> {
        let Some(url) = &self.webhook_url else {
            return Ok(false);
        };
        self.http
            .post(url)
            .json(payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(true)
    }
}

#[async_trait]
impl NotificationDispatcher for SmtpDispatcher {
    async fn send_email(&self, to: &str, subject: &str, html: &str) -> anyhow::Result<()> {
        let Some(mailer) = &self.mailer else {
            tracing::info!(channel = "email", "SMTP not configured; e-mail not delivered");
            return Ok(());
        };
        let email = Message::builder()
            .from(self.from_address.parse()?)
            .to(to.parse()?)
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(html.to_string())?;
        mailer.send(email).await?;
        tracing::debug!(channel = "email", "e-mail dispatched");
        Ok(())
    }

    async fn send_sms(&self, to: &str, message: &str) -> anyhow::Result<()> {
        if !self.post(&WebhookPayload::Sms { to, message }).await? {
            tracing::info!(channel = "sms", "webhook not configured; SMS not delivered");
        }
        Ok(())
    }

    async fn send_notification(
        &self,
        user_id: UserId,
        kind: &str,
        title: &str,
        message: &str,
    ) -> anyhow::Result<()> {
        let payload = WebhookPayload::Notification {
            user_id: user_id.to_string(),
            kind,
            title,
            message,
        };
        if !self.post(&payload).await? {
            tracing::info!(%user_id, kind, "webhook not configured; notification not delivered");
        }
        Ok(())
    }
}
