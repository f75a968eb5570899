//! A scriptable in-memory transport for tests.

use std::{sync::Mutex, time::Duration};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    mailer::{CampaignEmail, MailError, Mailer, with_unsubscribe_footer, with_unsubscribe_link},
    models::SmtpSettings,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentKind {
    Test,
    Verification,
    Campaign,
}

#[derive(Debug, Clone)]
pub struct SentEmail {
    pub kind: SentKind,
    pub recipient: String,
    pub subject: String,
    pub body_text: String,
    pub body_html: Option<String>,
    /// The capability URL carried by the message: the verify URL for
    /// verification mail, the unsubscribe URL for campaign mail.
    pub link: Option<String>,
}

#[derive(Default)]
struct MockState {
    settings: Option<SmtpSettings>,
    sent: Vec<SentEmail>,
    attempts: Vec<String>,
    fail_recipients: Vec<String>,
    send_delay: Option<Duration>,
}

#[derive(Default)]
pub struct MockMailer {
    state: Mutex<MockState>,
}

impl MockMailer {
    /// A mock that starts out configured, which is what most tests want.
    pub fn new() -> Self {
        let mailer = Self::default();
        mailer.configure(SmtpSettings {
            host: "smtp.test".into(),
            port: 2525,
            from_email: "news@test".into(),
            from_name: "TinyList".into(),
            ..Default::default()
        });
        mailer
    }

    pub fn unconfigured() -> Self {
        Self::default()
    }

    /// Every campaign send to this recipient fails permanently.
    pub fn fail_for(&self, recipient: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_recipients
            .push(recipient.to_string());
    }

    pub fn set_send_delay(&self, delay: Duration) {
        self.state.lock().unwrap().send_delay = Some(delay);
    }

    pub fn sent(&self) -> Vec<SentEmail> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn sent_campaign_mail(&self) -> Vec<SentEmail> {
        self.sent()
            .into_iter()
            .filter(|email| email.kind == SentKind::Campaign)
            .collect()
    }

    pub fn sent_verification_mail(&self) -> Vec<SentEmail> {
        self.sent()
            .into_iter()
            .filter(|email| email.kind == SentKind::Verification)
            .collect()
    }

    /// How many campaign send attempts were made for this recipient,
    /// failures included.
    pub fn attempts_for(&self, recipient: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .attempts
            .iter()
            .filter(|attempted| *attempted == recipient)
            .count()
    }

    fn record(&self, email: SentEmail) {
        self.state.lock().unwrap().sent.push(email);
    }

    fn check_configured(&self) -> Result<(), MailError> {
        if self.is_configured() {
            Ok(())
        } else {
            Err(MailError::NotConfigured)
        }
    }
}

#[async_trait]
impl Mailer for MockMailer {
    fn configure(&self, settings: SmtpSettings) {
        self.state.lock().unwrap().settings = Some(settings);
    }

    fn is_configured(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .settings
            .as_ref()
            .is_some_and(|settings| settings.is_configured())
    }

    async fn send_test(&self, recipient: &str) -> Result<(), MailError> {
        self.check_configured()?;
        self.record(SentEmail {
            kind: SentKind::Test,
            recipient: recipient.to_string(),
            subject: "TinyList SMTP test".to_string(),
            body_text: String::new(),
            body_html: None,
            link: None,
        });
        Ok(())
    }

    async fn send_verification(
        &self,
        recipient: &str,
        name: &str,
        verify_url: &str,
    ) -> Result<(), MailError> {
        self.check_configured()?;
        self.record(SentEmail {
            kind: SentKind::Verification,
            recipient: recipient.to_string(),
            subject: "Please confirm your subscription".to_string(),
            body_text: crate::mailer::verification_body(name, verify_url),
            body_html: None,
            link: Some(verify_url.to_string()),
        });
        Ok(())
    }

    async fn send_campaign(
        &self,
        cancel: &CancellationToken,
        email: CampaignEmail<'_>,
    ) -> Result<(), MailError> {
        self.check_configured()?;

        let (delay, failing) = {
            let mut state = self.state.lock().unwrap();
            state.attempts.push(email.recipient.to_string());
            (
                state.send_delay,
                state
                    .fail_recipients
                    .iter()
                    .any(|recipient| recipient == email.recipient),
            )
        };

        if let Some(delay) = delay {
            tokio::select! {
                _ = cancel.cancelled() => return Err(MailError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if cancel.is_cancelled() {
            return Err(MailError::Cancelled);
        }

        if failing {
            return Err(MailError::Transport(mail_send::Error::UnparseableReply));
        }

        // record what would have gone on the wire, footer included
        self.record(SentEmail {
            kind: SentKind::Campaign,
            recipient: email.recipient.to_string(),
            subject: email.subject.to_string(),
            body_text: with_unsubscribe_footer(email.body_text, email.unsubscribe_url),
            body_html: email
                .body_html
                .map(|html| with_unsubscribe_link(html, email.unsubscribe_url)),
            link: Some(email.unsubscribe_url.to_string()),
        });

        Ok(())
    }
}
