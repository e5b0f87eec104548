//! SMTP notifier via lettre.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};

use crate::error::NotifyError;
use crate::notify::{Notifier, SUBJECT, body, deliver_with_retry};

// ── Configuration ───────────────────────────────────────────────────

/// SMTP settings and the delivery retry contract.
#[derive(Debug, Clone)]
pub struct NotifierConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    pub attempts: u32,
    pub backoff: Duration,
}

// ── Notifier ────────────────────────────────────────────────────────

pub struct SmtpNotifier {
    config: NotifierConfig,
}

impl SmtpNotifier {
    pub fn new(config: NotifierConfig) -> Self {
        Self { config }
    }

    /// Send one message over a fresh SMTP connection (blocking).
    fn send_blocking(config: &NotifierConfig, email: &Message) -> Result<(), NotifyError> {
        let creds = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );

        let transport = SmtpTransport::relay(&config.smtp_host)
            .map_err(|e| NotifyError::Send(format!("SMTP relay error: {e}")))?
            .port(config.smtp_port)
            .credentials(creds)
            .build();

        transport
            .send(email)
            .map_err(|e| NotifyError::Send(e.to_string()))?;
        Ok(())
    }
}

/// Build the notification message, attaching the file when given.
pub fn build_message(
    from: &str,
    recipient: &str,
    succeeded: bool,
    attachment: Option<(String, Vec<u8>)>,
) -> Result<Message, NotifyError> {
    let builder = Message::builder()
        .from(from.parse().map_err(|e| NotifyError::InvalidAddress {
            address: from.to_string(),
            reason: format!("{e}"),
        })?)
        .to(recipient.parse().map_err(|e| NotifyError::InvalidAddress {
            address: recipient.to_string(),
            reason: format!("{e}"),
        })?)
        .subject(SUBJECT);

    let text = body(succeeded);
    let built = match attachment {
        Some((filename, bytes)) => {
            let content_type = ContentType::parse("text/csv")
                .map_err(|e| NotifyError::Build(format!("content type: {e}")))?;
            builder.multipart(
                MultiPart::mixed()
                    .singlepart(SinglePart::plain(text))
                    .singlepart(Attachment::new(filename).body(bytes, content_type)),
            )
        }
        None => builder.body(text),
    };
    built.map_err(|e| NotifyError::Build(e.to_string()))
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn notify(
        &self,
        recipient: &str,
        succeeded: bool,
        attachment: Option<&Path>,
    ) -> Result<(), NotifyError> {
        // Failure notifications never carry the file.
        let attachment = match attachment.filter(|_| succeeded) {
            Some(path) => {
                let bytes = tokio::fs::read(path).await.map_err(|source| NotifyError::Attachment {
                    path: path.display().to_string(),
                    source,
                })?;
                let filename = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "output.csv".to_string());
                Some((filename, bytes))
            }
            None => None,
        };

        let email = build_message(&self.config.from_address, recipient, succeeded, attachment)?;

        deliver_with_retry(self.config.attempts, self.config.backoff, || {
            let config = self.config.clone();
            let email = email.clone();
            async move {
                tokio::task::spawn_blocking(move || Self::send_blocking(&config, &email))
                    .await
                    .map_err(|e| NotifyError::Send(format!("send task failed: {e}")))?
            }
        })
        .await?;

        tracing::info!(recipient, succeeded, "Notification sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_message_carries_the_attachment() {
        let email = build_message(
            "bot@example.com",
            "user@example.com",
            true,
            Some(("output_x.csv".into(), b"Identity,JP Keyword\n".to_vec())),
        )
        .unwrap();
        let raw = String::from_utf8(email.formatted()).unwrap();
        assert!(raw.contains("output_x.csv"));
        assert!(raw.contains("multipart/mixed"));
    }

    #[test]
    fn failure_message_is_plain() {
        let email = build_message("bot@example.com", "user@example.com", false, None).unwrap();
        let raw = String::from_utf8(email.formatted()).unwrap();
        assert!(!raw.contains("multipart/mixed"));
        assert!(raw.contains("Subject: Harvest results"));
    }

    #[test]
    fn invalid_recipient_is_rejected() {
        let err = build_message("bot@example.com", "not-an-address", true, None).unwrap_err();
        assert!(matches!(err, NotifyError::InvalidAddress { .. }));
    }
}
