use std::{
    fmt::Display,
    sync::{Arc, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use mail_builder::MessageBuilder;
use mail_send::{SmtpClient, SmtpClientBuilder};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::models::SmtpSettings;

#[cfg(test)]
pub mod mock;

/// Upper bound on a single delivery, connect included. Applies unless the
/// caller's cancellation signal fires first.
pub const SEND_DEADLINE: Duration = Duration::from_secs(30);

const TEST_BODY: &str =
    "This is a test email from TinyList.\n\nIf you are reading this, your SMTP settings work.";

#[derive(Debug, Error)]
pub enum MailError {
    #[error("SMTP transport is not configured")]
    NotConfigured,
    #[error("send timed out after {}s", SEND_DEADLINE.as_secs())]
    Timeout,
    #[error("send cancelled")]
    Cancelled,
    #[error("smtp error: {0}")]
    Transport(#[from] mail_send::Error),
}

/// Everything needed to put one campaign message on the wire. Subject and
/// bodies arrive with placeholders already substituted.
#[derive(Debug)]
pub struct CampaignEmail<'a> {
    pub recipient: &'a str,
    pub name: &'a str,
    pub subject: &'a str,
    pub body_text: &'a str,
    pub body_html: Option<&'a str>,
    pub unsubscribe_url: &'a str,
}

/// The seam between the delivery engine and the SMTP relay.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Replaces the transport configuration atomically. In-flight sends keep
    /// the configuration they captured at call time.
    fn configure(&self, settings: SmtpSettings);

    fn is_configured(&self) -> bool;

    /// Blocking single send of a fixed self-test body.
    async fn send_test(&self, recipient: &str) -> Result<(), MailError>;

    async fn send_verification(
        &self,
        recipient: &str,
        name: &str,
        verify_url: &str,
    ) -> Result<(), MailError>;

    /// Sends one campaign message, racing the delivery against `cancel` and
    /// the internal deadline.
    async fn send_campaign(
        &self,
        cancel: &CancellationToken,
        email: CampaignEmail<'_>,
    ) -> Result<(), MailError>;
}

pub struct SmtpMailer {
    settings: RwLock<Option<Arc<SmtpSettings>>>,
}

impl SmtpMailer {
    pub fn new() -> Self {
        Self {
            settings: RwLock::new(None),
        }
    }

    fn current(&self) -> Result<Arc<SmtpSettings>, MailError> {
        self.settings
            .read()
            .expect("smtp settings lock poisoned")
            .clone()
            .filter(|settings| settings.is_configured())
            .ok_or(MailError::NotConfigured)
    }

    async fn deliver(settings: &SmtpSettings, message: MessageBuilder<'_>) -> Result<(), MailError> {
        // Implicit TLS only on the dedicated smtps port; any other port with
        // tls enabled negotiates STARTTLS after the greeting.
        let builder = SmtpClientBuilder::new(settings.host.as_str(), settings.port)
            .implicit_tls(settings.tls && settings.port == 465)
            .timeout(SEND_DEADLINE);
        let builder = if settings.username.is_empty() {
            builder
        } else {
            builder.credentials((settings.username.as_str(), settings.password.as_str()))
        };

        if settings.tls {
            let mut client = builder.connect().await?;
            let result = client.send(message).await;
            Self::quit(client, &settings.host).await;
            result?;
        } else {
            let mut client = builder.connect_plain().await?;
            let result = client.send(message).await;
            Self::quit(client, &settings.host).await;
            result?;
        }

        Ok(())
    }

    async fn quit<T, D>(client: SmtpClient<T>, hostname: D)
    where
        D: Display,
        T: AsyncRead + AsyncWrite + Unpin,
    {
        client
            .quit()
            .await
            .inspect_err(|err| {
                warn!("failed to close SMTP connection with {hostname}: {err}");
            })
            .ok();
    }
}

impl Default for SmtpMailer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    fn configure(&self, settings: SmtpSettings) {
        *self.settings.write().expect("smtp settings lock poisoned") = Some(Arc::new(settings));
    }

    fn is_configured(&self) -> bool {
        self.settings
            .read()
            .expect("smtp settings lock poisoned")
            .as_ref()
            .is_some_and(|settings| settings.is_configured())
    }

    async fn send_test(&self, recipient: &str) -> Result<(), MailError> {
        let settings = self.current()?;

        let message = MessageBuilder::new()
            .from((settings.from_name.as_str(), settings.from_email.as_str()))
            .to(recipient)
            .subject("TinyList SMTP test")
            .text_body(TEST_BODY);

        Self::deliver(&settings, message).await
    }

    async fn send_verification(
        &self,
        recipient: &str,
        name: &str,
        verify_url: &str,
    ) -> Result<(), MailError> {
        let settings = self.current()?;

        let body = verification_body(name, verify_url);
        let message = MessageBuilder::new()
            .from((settings.from_name.as_str(), settings.from_email.as_str()))
            .to((name, recipient))
            .subject("Please confirm your subscription")
            .text_body(body.as_str());

        Self::deliver(&settings, message).await
    }

    async fn send_campaign(
        &self,
        cancel: &CancellationToken,
        email: CampaignEmail<'_>,
    ) -> Result<(), MailError> {
        let settings = self.current()?;

        let text = with_unsubscribe_footer(email.body_text, email.unsubscribe_url);
        let html = email
            .body_html
            .map(|html| with_unsubscribe_link(html, email.unsubscribe_url));

        let mut message = MessageBuilder::new()
            .from((settings.from_name.as_str(), settings.from_email.as_str()))
            .to((email.name, email.recipient))
            .subject(email.subject)
            .text_body(text.as_str());
        if let Some(html) = html.as_deref() {
            message = message.html_body(html);
        }

        tokio::select! {
            _ = cancel.cancelled() => Err(MailError::Cancelled),
            _ = tokio::time::sleep(SEND_DEADLINE) => Err(MailError::Timeout),
            result = Self::deliver(&settings, message) => result,
        }
    }
}

pub(crate) fn verification_body(name: &str, verify_url: &str) -> String {
    let greeting = if name.is_empty() {
        "Hi".to_string()
    } else {
        format!("Hi {name}")
    };

    format!(
        "{greeting},\n\nPlease confirm your subscription by visiting:\n\n{verify_url}\n\n\
         If you did not sign up, you can safely ignore this email."
    )
}

pub(crate) fn with_unsubscribe_footer(body_text: &str, unsubscribe_url: &str) -> String {
    format!("{body_text}\n\n---\nTo unsubscribe, visit: {unsubscribe_url}")
}

/// Inserts an unsubscribe link immediately before the last `</body>` tag
/// (matched case-insensitively), or appends it when there is none.
pub(crate) fn with_unsubscribe_link(body_html: &str, unsubscribe_url: &str) -> String {
    let link = format!("<p><a href=\"{unsubscribe_url}\">Unsubscribe</a></p>");

    match rfind_ascii_ci(body_html, "</body>") {
        Some(idx) => {
            let mut out = String::with_capacity(body_html.len() + link.len());
            out.push_str(&body_html[..idx]);
            out.push_str(&link);
            out.push_str(&body_html[idx..]);
            out
        }
        None => format!("{body_html}{link}"),
    }
}

fn rfind_ascii_ci(haystack: &str, needle: &str) -> Option<usize> {
    let haystack = haystack.as_bytes();
    let needle = needle.as_bytes();
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }

    (0..=haystack.len() - needle.len())
        .rev()
        .find(|&i| haystack[i..i + needle.len()].eq_ignore_ascii_case(needle))
}
