//! The campaign delivery engine: drives a campaign from `draft` through
//! `sending` to a terminal status, one background task per campaign.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use sqlx::SqlitePool;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    mailer::{CampaignEmail, MailError, Mailer},
    models::{
        Campaign, CampaignLogRepository, CampaignRepository, CampaignStatus, JournalKind,
        JournalRepository, LogOutcome, Subscriber, SubscriberRepository,
    },
};

#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Maximum recipient sends per second within one campaign.
    pub rate_limit: u32,
    /// Retries per recipient after the first attempt.
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Recipients between counter flushes to the store.
    pub batch_size: u32,
    /// Base for unsubscribe capability URLs.
    pub public_url: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendCampaignError {
    #[error("campaign is already sending")]
    AlreadySending,
    #[error("campaign is not in draft status")]
    WrongStatus,
    #[error("no verified subscribers to send to")]
    NoRecipients,
    #[error("campaign not found")]
    NotFound,
    #[error("store error: {0}")]
    Store(String),
}

/// One active campaign in the sending registry. Membership is the ground
/// truth for `is_sending`; the token cancels the loop and every wait inside
/// it.
struct SenderInner {
    campaigns: CampaignRepository,
    subscribers: SubscriberRepository,
    logs: CampaignLogRepository,
    journal: JournalRepository,
    mailer: Arc<dyn Mailer>,
    config: SenderConfig,
    active: Mutex<HashMap<i64, CancellationToken>>,
}

#[derive(Clone)]
pub struct CampaignSender {
    inner: Arc<SenderInner>,
}

/// Removes a campaign from the registry when its send is over, including on
/// panic or an early error return.
struct ActiveGuard {
    inner: Arc<SenderInner>,
    campaign_id: i64,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if let Ok(mut active) = self.inner.active.lock() {
            active.remove(&self.campaign_id);
        }
    }
}

enum Attempt {
    Sent,
    Failed(String),
    Cancelled,
}

impl CampaignSender {
    pub fn new(pool: SqlitePool, mailer: Arc<dyn Mailer>, config: SenderConfig) -> Self {
        Self {
            inner: Arc::new(SenderInner {
                campaigns: CampaignRepository::new(pool.clone()),
                subscribers: SubscriberRepository::new(pool.clone()),
                logs: CampaignLogRepository::new(pool.clone()),
                journal: JournalRepository::new(pool),
                mailer,
                config,
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Starts sending a draft campaign. Returns once the campaign has been
    /// registered and moved to `sending`; the recipient loop runs in a
    /// background task.
    pub async fn send(&self, campaign_id: i64) -> Result<(), SendCampaignError> {
        let cancel = CancellationToken::new();
        {
            let mut active = self.inner.active.lock().expect("sending registry poisoned");
            if active.contains_key(&campaign_id) {
                return Err(SendCampaignError::AlreadySending);
            }
            active.insert(campaign_id, cancel.clone());
        }
        let guard = ActiveGuard {
            inner: self.inner.clone(),
            campaign_id,
        };

        let campaign = self
            .inner
            .campaigns
            .find_by_id(campaign_id)
            .await
            .map_err(|err| SendCampaignError::Store(err.to_string()))?
            .ok_or(SendCampaignError::NotFound)?;

        if campaign.status != CampaignStatus::Draft {
            self.inner
                .record(
                    campaign_id,
                    JournalKind::Error,
                    &format!("Cannot send campaign in status {:?}", campaign.status),
                )
                .await;
            return Err(SendCampaignError::WrongStatus);
        }

        let recipients = self
            .inner
            .subscribers
            .all_verified()
            .await
            .map_err(|err| SendCampaignError::Store(err.to_string()))?;

        if recipients.is_empty() {
            // the campaign stays in draft; nothing was started
            self.inner
                .record(
                    campaign_id,
                    JournalKind::Error,
                    "No verified subscribers to send to",
                )
                .await;
            return Err(SendCampaignError::NoRecipients);
        }

        let total = recipients.len() as i64;
        self.inner
            .record(
                campaign_id,
                JournalKind::Info,
                &format!("Started sending to {total} subscribers"),
            )
            .await;

        self.inner
            .campaigns
            .update_status(campaign_id, CampaignStatus::Sending)
            .await
            .map_err(|err| SendCampaignError::Store(err.to_string()))?;
        if let Err(err) = self
            .inner
            .campaigns
            .update_counters(campaign_id, total, 0, 0)
            .await
        {
            error!(campaign_id, "failed to initialize campaign counters: {err}");
        }

        info!(campaign_id, recipients = total, "campaign send started");

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let _guard = guard;
            inner.run(campaign, recipients, cancel).await;
        });

        Ok(())
    }

    /// Signals cancellation. Idempotent: a campaign that is not currently
    /// sending reports `false`.
    pub fn cancel(&self, campaign_id: i64) -> bool {
        let active = self.inner.active.lock().expect("sending registry poisoned");
        match active.get(&campaign_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_sending(&self, campaign_id: i64) -> bool {
        self.inner
            .active
            .lock()
            .expect("sending registry poisoned")
            .contains_key(&campaign_id)
    }
}

impl SenderInner {
    async fn run(&self, campaign: Campaign, recipients: Vec<Subscriber>, cancel: CancellationToken) {
        let total = recipients.len() as i64;
        let batch_size = i64::from(self.config.batch_size.max(1));
        let period = Duration::from_secs_f64(1.0 / f64::from(self.config.rate_limit.max(1)));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut sent: i64 = 0;
        let mut failed: i64 = 0;
        let mut cancelled = false;

        for subscriber in &recipients {
            // rate-limit gate; one send per tick, cancellation wins the race
            tokio::select! {
                _ = cancel.cancelled() => cancelled = true,
                _ = ticker.tick() => {}
            }

            if !cancelled {
                match self.attempt(&campaign, subscriber, &cancel).await {
                    Attempt::Sent => {
                        self.append_log(campaign.id, subscriber.id, LogOutcome::Sent, None)
                            .await;
                        sent += 1;
                    }
                    Attempt::Failed(cause) => {
                        self.append_log(
                            campaign.id,
                            subscriber.id,
                            LogOutcome::Failed,
                            Some(&cause),
                        )
                        .await;
                        failed += 1;
                    }
                    Attempt::Cancelled => cancelled = true,
                }
            }

            if cancelled {
                let remaining = total - sent - failed;
                self.record(
                    campaign.id,
                    JournalKind::Warning,
                    &format!("Cancelled: {sent} sent, {failed} failed, {remaining} remaining"),
                )
                .await;
                break;
            }

            if (sent + failed) % batch_size == 0 {
                self.flush_counters(campaign.id, total, sent, failed).await;
            }
        }

        self.flush_counters(campaign.id, total, sent, failed).await;

        let status = if cancelled {
            CampaignStatus::Cancelled
        } else if failed > 0 && sent == 0 {
            CampaignStatus::Failed
        } else {
            CampaignStatus::Sent
        };

        if let Err(err) = self.campaigns.update_status(campaign.id, status).await {
            error!(
                campaign_id = campaign.id,
                "failed to persist terminal campaign status: {err}"
            );
        }

        match status {
            // the warning emitted at the cancellation point is the record
            CampaignStatus::Cancelled => {}
            _ if failed == 0 => {
                self.record(
                    campaign.id,
                    JournalKind::Success,
                    &format!("Completed: {sent} emails sent successfully"),
                )
                .await;
            }
            _ if sent == 0 => {
                self.record(
                    campaign.id,
                    JournalKind::Error,
                    &format!("Failed: all {failed} emails failed to send"),
                )
                .await;
            }
            _ => {
                self.record(
                    campaign.id,
                    JournalKind::Warning,
                    &format!("Completed with errors: {sent} sent, {failed} failed"),
                )
                .await;
            }
        }

        info!(
            campaign_id = campaign.id,
            sent, failed, ?status, "campaign send finished"
        );
    }

    /// Delivers to one recipient, retrying transport failures. Cancellation
    /// is checked before each retry and inside each send.
    async fn attempt(
        &self,
        campaign: &Campaign,
        subscriber: &Subscriber,
        cancel: &CancellationToken,
    ) -> Attempt {
        let subject = substitute(&campaign.subject, &subscriber.name, &subscriber.email);
        let body_text = substitute(&campaign.body_text, &subscriber.name, &subscriber.email);
        let body_html = campaign
            .body_html
            .as_deref()
            .map(|html| substitute(html, &subscriber.name, &subscriber.email));
        let unsubscribe_url = format!(
            "{}/api/unsubscribe/{}",
            self.config.public_url.trim_end_matches('/'),
            subscriber.unsubscribe_token
        );

        let mut last_error = String::new();
        for attempt in 0..=self.config.max_retries {
            let email = CampaignEmail {
                recipient: &subscriber.email,
                name: &subscriber.name,
                subject: &subject,
                body_text: &body_text,
                body_html: body_html.as_deref(),
                unsubscribe_url: &unsubscribe_url,
            };

            match self.mailer.send_campaign(cancel, email).await {
                Ok(()) => return Attempt::Sent,
                Err(MailError::Cancelled) => return Attempt::Cancelled,
                Err(err) => {
                    warn!(
                        campaign_id = campaign.id,
                        recipient = subscriber.email,
                        attempt,
                        "campaign send attempt failed: {err}"
                    );
                    last_error = err.to_string();
                }
            }

            if cancel.is_cancelled() {
                return Attempt::Cancelled;
            }
            // no back-off after the final failure
            if attempt < self.config.max_retries {
                tokio::select! {
                    _ = cancel.cancelled() => return Attempt::Cancelled,
                    _ = tokio::time::sleep(self.config.retry_delay) => {}
                }
            }
        }

        Attempt::Failed(last_error)
    }

    /// Journal writes are best-effort; a failed append never fails the
    /// campaign.
    async fn record(&self, campaign_id: i64, kind: JournalKind, message: &str) {
        if let Err(err) = self.journal.append(campaign_id, kind, message).await {
            error!(campaign_id, "failed to append journal entry: {err}");
        }
    }

    async fn append_log(
        &self,
        campaign_id: i64,
        subscriber_id: i64,
        outcome: LogOutcome,
        cause: Option<&str>,
    ) {
        if let Err(err) = self
            .logs
            .append(campaign_id, subscriber_id, outcome, cause)
            .await
        {
            error!(campaign_id, subscriber_id, "failed to append log row: {err}");
        }
    }

    async fn flush_counters(&self, campaign_id: i64, total: i64, sent: i64, failed: i64) {
        if let Err(err) = self
            .campaigns
            .update_counters(campaign_id, total, sent, failed)
            .await
        {
            error!(campaign_id, "failed to flush campaign counters: {err}");
        }
    }
}

/// Replaces every `{{name}}` and `{{email}}` occurrence left to right in a
/// single pass; substituted values are never re-scanned.
pub(crate) fn substitute(template: &str, name: &str, email: &str) -> String {
    const NAME: &str = "{{name}}";
    const EMAIL: &str = "{{email}}";

    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    loop {
        let next = match (rest.find(NAME), rest.find(EMAIL)) {
            (None, None) => break,
            (Some(i), None) => (i, NAME, name),
            (None, Some(j)) => (j, EMAIL, email),
            (Some(i), Some(j)) => {
                if i < j {
                    (i, NAME, name)
                } else {
                    (j, EMAIL, email)
                }
            }
        };

        let (idx, token, value) = next;
        out.push_str(&rest[..idx]);
        out.push_str(value);
        rest = &rest[idx + token.len()..];
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mailer::mock::MockMailer,
        models::{NewCampaign, NewSubscriber, SubscriberStatus},
    };

    #[test]
    fn substitute_replaces_every_occurrence() {
        let out = substitute("Hi {{name}}, {{name}} <{{email}}>", "Al", "a@x.io");
        assert_eq!(out, "Hi Al, Al <a@x.io>");
    }

    #[test]
    fn substitute_is_not_recursive() {
        // a substituted value must not be scanned for further placeholders
        let out = substitute("{{name}} {{email}}", "{{email}}", "a@x.io");
        assert_eq!(out, "{{email}} a@x.io");
    }

    #[test]
    fn substitute_leaves_unknown_tokens_alone() {
        let out = substitute("{{nope}} {{email}}", "Al", "a@x.io");
        assert_eq!(out, "{{nope}} a@x.io");
    }

    fn test_config(rate_limit: u32, max_retries: u32, batch_size: u32) -> SenderConfig {
        SenderConfig {
            rate_limit,
            max_retries,
            retry_delay: Duration::from_millis(10),
            batch_size,
            public_url: "http://localhost:8080".to_string(),
        }
    }

    async fn verified_subscriber(pool: &SqlitePool, email: &str, name: &str) -> Subscriber {
        let repo = SubscriberRepository::new(pool.clone());
        let created = repo
            .create(&NewSubscriber {
                email: email.to_string(),
                name: name.to_string(),
                verify_token: format!("verify-{email}"),
                unsubscribe_token: format!("unsub-{email}"),
            })
            .await
            .unwrap();
        repo.update_status(created.id, SubscriberStatus::Verified)
            .await
            .unwrap();
        created
    }

    async fn draft_campaign(pool: &SqlitePool) -> Campaign {
        CampaignRepository::new(pool.clone())
            .create(&NewCampaign {
                subject: "Hi {{name}}".to_string(),
                body_text: "You are {{email}}".to_string(),
                body_html: None,
            })
            .await
            .unwrap()
    }

    async fn wait_for_terminal(pool: &SqlitePool, campaign_id: i64) -> Campaign {
        let repo = CampaignRepository::new(pool.clone());
        for _ in 0..500 {
            let campaign = repo.find_by_id(campaign_id).await.unwrap().unwrap();
            if campaign.status.is_terminal() {
                return campaign;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("campaign {campaign_id} did not reach a terminal status");
    }

    #[sqlx::test]
    async fn happy_path_sends_to_all_verified(pool: SqlitePool) {
        verified_subscriber(&pool, "a@x.io", "Al").await;
        verified_subscriber(&pool, "b@x.io", "Bo").await;
        let campaign = draft_campaign(&pool).await;

        let mailer = Arc::new(MockMailer::new());
        let sender = CampaignSender::new(pool.clone(), mailer.clone(), test_config(100, 0, 1));

        sender.send(campaign.id).await.unwrap();
        assert!(sender.is_sending(campaign.id));

        let done = wait_for_terminal(&pool, campaign.id).await;
        assert_eq!(done.status, CampaignStatus::Sent);
        assert_eq!((done.total_count, done.sent_count, done.failed_count), (2, 2, 0));
        assert!(done.started_at.is_some());
        assert!(done.completed_at.is_some());
        assert!(!sender.is_sending(campaign.id));

        let mail = mailer.sent_campaign_mail();
        assert_eq!(mail.len(), 2);
        assert_eq!(mail[0].subject, "Hi Al");
        assert!(mail[0].body_text.contains("You are a@x.io"));
        assert!(
            mail[0].body_text.contains(
                "To unsubscribe, visit: http://localhost:8080/api/unsubscribe/unsub-a@x.io"
            )
        );

        let logs = CampaignLogRepository::new(pool.clone())
            .list_for_campaign(campaign.id)
            .await
            .unwrap();
        assert_eq!(logs.len(), 2);
        assert!(logs.iter().all(|row| row.outcome == LogOutcome::Sent));

        let journal = JournalRepository::new(pool)
            .list_for_campaign(campaign.id)
            .await
            .unwrap();
        assert_eq!(journal.first().unwrap().kind, JournalKind::Info);
        assert_eq!(
            journal.first().unwrap().message,
            "Started sending to 2 subscribers"
        );
        assert_eq!(journal.last().unwrap().kind, JournalKind::Success);
        assert_eq!(
            journal.last().unwrap().message,
            "Completed: 2 emails sent successfully"
        );
    }

    #[sqlx::test]
    async fn mixed_outcome_is_sent_with_warning(pool: SqlitePool) {
        verified_subscriber(&pool, "b1@x.io", "B1").await;
        verified_subscriber(&pool, "b2@x.io", "B2").await;
        verified_subscriber(&pool, "b3@x.io", "B3").await;
        let campaign = draft_campaign(&pool).await;

        let mailer = Arc::new(MockMailer::new());
        mailer.fail_for("b2@x.io");
        let sender = CampaignSender::new(pool.clone(), mailer.clone(), test_config(100, 0, 1));

        sender.send(campaign.id).await.unwrap();
        let done = wait_for_terminal(&pool, campaign.id).await;

        assert_eq!(done.status, CampaignStatus::Sent);
        assert_eq!((done.sent_count, done.failed_count), (2, 1));

        let logs = CampaignLogRepository::new(pool.clone())
            .list_for_campaign(campaign.id)
            .await
            .unwrap();
        assert_eq!(logs.len(), 3);
        let failed_row = logs
            .iter()
            .find(|row| row.outcome == LogOutcome::Failed)
            .unwrap();
        assert!(failed_row.error.is_some());

        let journal = JournalRepository::new(pool)
            .list_for_campaign(campaign.id)
            .await
            .unwrap();
        assert_eq!(journal.last().unwrap().kind, JournalKind::Warning);
        assert_eq!(
            journal.last().unwrap().message,
            "Completed with errors: 2 sent, 1 failed"
        );
    }

    #[sqlx::test]
    async fn all_failures_is_failed(pool: SqlitePool) {
        verified_subscriber(&pool, "a@x.io", "Al").await;
        verified_subscriber(&pool, "b@x.io", "Bo").await;
        let campaign = draft_campaign(&pool).await;

        let mailer = Arc::new(MockMailer::new());
        mailer.fail_for("a@x.io");
        mailer.fail_for("b@x.io");
        let sender = CampaignSender::new(pool.clone(), mailer.clone(), test_config(100, 0, 1));

        sender.send(campaign.id).await.unwrap();
        let done = wait_for_terminal(&pool, campaign.id).await;

        assert_eq!(done.status, CampaignStatus::Failed);
        assert_eq!((done.sent_count, done.failed_count), (0, 2));

        let journal = JournalRepository::new(pool)
            .list_for_campaign(campaign.id)
            .await
            .unwrap();
        assert_eq!(journal.last().unwrap().kind, JournalKind::Error);
        assert_eq!(
            journal.last().unwrap().message,
            "Failed: all 2 emails failed to send"
        );
    }

    #[sqlx::test]
    async fn transport_failures_are_retried(pool: SqlitePool) {
        verified_subscriber(&pool, "a@x.io", "Al").await;
        let campaign = draft_campaign(&pool).await;

        let mailer = Arc::new(MockMailer::new());
        mailer.fail_for("a@x.io");
        let sender = CampaignSender::new(pool.clone(), mailer.clone(), test_config(100, 2, 1));

        sender.send(campaign.id).await.unwrap();
        wait_for_terminal(&pool, campaign.id).await;

        // first attempt plus two retries
        assert_eq!(mailer.attempts_for("a@x.io"), 3);
    }

    #[sqlx::test]
    async fn empty_recipient_set_keeps_draft(pool: SqlitePool) {
        let campaign = draft_campaign(&pool).await;

        let sender = CampaignSender::new(
            pool.clone(),
            Arc::new(MockMailer::new()),
            test_config(100, 0, 1),
        );

        let err = sender.send(campaign.id).await.unwrap_err();
        assert_eq!(err, SendCampaignError::NoRecipients);
        assert!(!sender.is_sending(campaign.id));

        let campaign = CampaignRepository::new(pool.clone())
            .find_by_id(campaign.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(campaign.status, CampaignStatus::Draft);

        let journal = JournalRepository::new(pool)
            .list_for_campaign(campaign.id)
            .await
            .unwrap();
        assert_eq!(journal.last().unwrap().kind, JournalKind::Error);
    }

    #[sqlx::test]
    async fn non_draft_campaign_is_rejected(pool: SqlitePool) {
        verified_subscriber(&pool, "a@x.io", "Al").await;
        let campaign = draft_campaign(&pool).await;
        CampaignRepository::new(pool.clone())
            .update_status(campaign.id, CampaignStatus::Sent)
            .await
            .unwrap();

        let sender = CampaignSender::new(
            pool.clone(),
            Arc::new(MockMailer::new()),
            test_config(100, 0, 1),
        );

        let err = sender.send(campaign.id).await.unwrap_err();
        assert_eq!(err, SendCampaignError::WrongStatus);
        assert!(!sender.is_sending(campaign.id));
    }

    #[sqlx::test]
    async fn second_send_is_rejected_while_active(pool: SqlitePool) {
        for i in 0..3 {
            verified_subscriber(&pool, &format!("s{i}@x.io"), "S").await;
        }
        let campaign = draft_campaign(&pool).await;

        let mailer = Arc::new(MockMailer::new());
        mailer.set_send_delay(Duration::from_millis(100));
        let sender = CampaignSender::new(pool.clone(), mailer, test_config(100, 0, 1));

        sender.send(campaign.id).await.unwrap();
        let err = sender.send(campaign.id).await.unwrap_err();
        assert_eq!(err, SendCampaignError::AlreadySending);

        wait_for_terminal(&pool, campaign.id).await;
    }

    #[sqlx::test]
    async fn cancel_stops_the_loop(pool: SqlitePool) {
        for i in 0..10 {
            verified_subscriber(&pool, &format!("s{i}@x.io"), "S").await;
        }
        let campaign = draft_campaign(&pool).await;

        let mailer = Arc::new(MockMailer::new());
        let sender = CampaignSender::new(pool.clone(), mailer.clone(), test_config(2, 0, 1));

        sender.send(campaign.id).await.unwrap();

        // wait until at least one message went out, then cancel
        for _ in 0..500 {
            if !mailer.sent_campaign_mail().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(sender.cancel(campaign.id));

        let done = wait_for_terminal(&pool, campaign.id).await;
        assert_eq!(done.status, CampaignStatus::Cancelled);
        assert!(done.sent_count < 10);
        assert!(!sender.is_sending(campaign.id));

        // cancelling again is a no-op
        assert!(!sender.cancel(campaign.id));

        // skipped recipients produced no log rows
        let logs = CampaignLogRepository::new(pool.clone())
            .list_for_campaign(campaign.id)
            .await
            .unwrap();
        assert_eq!(logs.len() as i64, done.sent_count + done.failed_count);

        let journal = JournalRepository::new(pool)
            .list_for_campaign(campaign.id)
            .await
            .unwrap();
        let warning = journal
            .iter()
            .find(|entry| entry.kind == JournalKind::Warning)
            .unwrap();
        assert!(warning.message.starts_with("Cancelled: "));
        assert!(warning.message.ends_with("remaining"));
    }

    #[sqlx::test]
    async fn cancel_unknown_campaign_is_not_sending(pool: SqlitePool) {
        let sender = CampaignSender::new(
            pool,
            Arc::new(MockMailer::new()),
            test_config(100, 0, 1),
        );

        assert!(!sender.cancel(42));
        assert!(!sender.is_sending(42));
    }
}
