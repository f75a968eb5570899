//! Double opt-in enrollment: a subscriber signs up with an email address and
//! proves control of the mailbox by following a verification capability URL.

use std::sync::Arc;

use base64ct::{Base64UrlUnpadded, Encoding};
use rand::RngCore;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::warn;

use crate::{
    mailer::Mailer,
    models::{self, NewSubscriber, Subscriber, SubscriberRepository, SubscriberStatus},
};

#[derive(Debug, Error)]
pub enum EnrollmentError {
    #[error("unknown token")]
    UnknownToken,
    #[error("subscriber has unsubscribed")]
    Gone,
    #[error(transparent)]
    Store(models::Error),
}

impl From<models::Error> for EnrollmentError {
    fn from(err: models::Error) -> Self {
        match err {
            models::Error::NotFound(_) => EnrollmentError::UnknownToken,
            other => EnrollmentError::Store(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    Verified,
    AlreadyVerified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsubscribeOutcome {
    Unsubscribed,
    AlreadyUnsubscribed,
}

#[derive(Clone)]
pub struct Enrollment {
    subscribers: SubscriberRepository,
    mailer: Arc<dyn Mailer>,
    public_url: String,
}

impl Enrollment {
    pub fn new(pool: SqlitePool, mailer: Arc<dyn Mailer>, public_url: String) -> Self {
        Self {
            subscribers: SubscriberRepository::new(pool),
            mailer,
            public_url: public_url.trim_end_matches('/').to_string(),
        }
    }

    /// Public sign-up. Whether the address is new or already on the list,
    /// the caller gets the same `Ok(())`, so the endpoint response never
    /// discloses existence. The verification email is best-effort.
    pub async fn subscribe(&self, email: &str, name: &str) -> Result<(), EnrollmentError> {
        let email = normalize_email(email);
        let name = name.trim().to_string();

        if self
            .subscribers
            .find_by_email(&email)
            .await
            .map_err(EnrollmentError::Store)?
            .is_some()
        {
            return Ok(());
        }

        let new_subscriber = NewSubscriber {
            email,
            name,
            verify_token: mint_token(),
            unsubscribe_token: mint_token(),
        };
        let subscriber = match self.subscribers.create(&new_subscriber).await {
            Ok(subscriber) => subscriber,
            // lost the race against a concurrent sign-up for the same address;
            // fold into the same opaque success
            Err(models::Error::Conflict) => return Ok(()),
            Err(err) => return Err(EnrollmentError::Store(err)),
        };

        self.send_verification(&subscriber).await;

        Ok(())
    }

    /// Best-effort verification mail; failures are logged, never surfaced.
    pub async fn send_verification(&self, subscriber: &Subscriber) {
        let Some(token) = subscriber.verify_token.as_deref() else {
            warn!(
                email = subscriber.email,
                "subscriber has no verify token, skipping verification mail"
            );
            return;
        };

        let verify_url = format!("{}/api/verify/{token}", self.public_url);
        if let Err(err) = self
            .mailer
            .send_verification(&subscriber.email, &subscriber.name, &verify_url)
            .await
        {
            warn!(
                email = subscriber.email,
                "failed to send verification email: {err}"
            );
        }
    }

    pub async fn verify(&self, token: &str) -> Result<VerifyOutcome, EnrollmentError> {
        let subscriber = self
            .subscribers
            .find_by_verify_token(token)
            .await
            .map_err(EnrollmentError::Store)?
            .ok_or(EnrollmentError::UnknownToken)?;

        match subscriber.status {
            SubscriberStatus::Verified => Ok(VerifyOutcome::AlreadyVerified),
            SubscriberStatus::Unsubscribed => Err(EnrollmentError::Gone),
            SubscriberStatus::Pending => {
                self.subscribers
                    .update_status(subscriber.id, SubscriberStatus::Verified)
                    .await?;
                Ok(VerifyOutcome::Verified)
            }
        }
    }

    pub async fn unsubscribe(&self, token: &str) -> Result<UnsubscribeOutcome, EnrollmentError> {
        let subscriber = self
            .subscribers
            .find_by_unsubscribe_token(token)
            .await
            .map_err(EnrollmentError::Store)?
            .ok_or(EnrollmentError::UnknownToken)?;

        if subscriber.status == SubscriberStatus::Unsubscribed {
            return Ok(UnsubscribeOutcome::AlreadyUnsubscribed);
        }

        self.subscribers
            .update_status(subscriber.id, SubscriberStatus::Unsubscribed)
            .await?;

        Ok(UnsubscribeOutcome::Unsubscribed)
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// 256 bits of randomness, URL-safe. The token is the whole capability.
pub fn mint_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    Base64UrlUnpadded::encode_string(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailer::mock::MockMailer;

    fn enrollment(pool: SqlitePool, mailer: Arc<MockMailer>) -> Enrollment {
        Enrollment::new(pool, mailer, "http://localhost:8080/".to_string())
    }

    #[test]
    fn tokens_are_url_safe_and_unique() {
        let first = mint_token();
        let second = mint_token();

        assert_ne!(first, second);
        assert_eq!(first.len(), 43);
        assert!(
            first
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
    }

    #[test]
    fn emails_are_normalized() {
        assert_eq!(normalize_email("  Al@X.Io "), "al@x.io");
    }

    #[sqlx::test]
    async fn subscribe_creates_pending_and_sends_verification(pool: SqlitePool) {
        let mailer = Arc::new(MockMailer::new());
        let enrollment = enrollment(pool.clone(), mailer.clone());

        enrollment.subscribe("A@x.io", "Al").await.unwrap();

        let subscriber = SubscriberRepository::new(pool)
            .find_by_email("a@x.io")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(subscriber.status, SubscriberStatus::Pending);
        assert!(subscriber.verify_token.is_some());

        let mail = mailer.sent_verification_mail();
        assert_eq!(mail.len(), 1);
        assert_eq!(mail[0].recipient, "a@x.io");
        let link = mail[0].link.as_deref().unwrap();
        assert!(link.starts_with("http://localhost:8080/api/verify/"));
    }

    #[sqlx::test]
    async fn duplicate_subscribe_is_silent_and_does_not_resend(pool: SqlitePool) {
        let mailer = Arc::new(MockMailer::new());
        let enrollment = enrollment(pool.clone(), mailer.clone());

        enrollment.subscribe("c@x.io", "C").await.unwrap();
        enrollment.subscribe("C@X.IO", "C Again").await.unwrap();

        let (rows, total) = SubscriberRepository::new(pool)
            .list(&Default::default())
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(rows[0].name, "C");
        assert_eq!(mailer.sent_verification_mail().len(), 1);
    }

    #[sqlx::test]
    async fn subscribe_succeeds_when_mailer_is_down(pool: SqlitePool) {
        let mailer = Arc::new(MockMailer::unconfigured());
        let enrollment = enrollment(pool.clone(), mailer);

        enrollment.subscribe("a@x.io", "Al").await.unwrap();

        assert!(
            SubscriberRepository::new(pool)
                .find_by_email("a@x.io")
                .await
                .unwrap()
                .is_some()
        );
    }

    #[sqlx::test]
    async fn verify_is_idempotent_and_keeps_verified_at(pool: SqlitePool) {
        let mailer = Arc::new(MockMailer::new());
        let enrollment = enrollment(pool.clone(), mailer);
        let repo = SubscriberRepository::new(pool);

        enrollment.subscribe("a@x.io", "Al").await.unwrap();
        let token = repo
            .find_by_email("a@x.io")
            .await
            .unwrap()
            .unwrap()
            .verify_token
            .unwrap();

        assert_eq!(
            enrollment.verify(&token).await.unwrap(),
            VerifyOutcome::Verified
        );
        let verified_at = repo
            .find_by_email("a@x.io")
            .await
            .unwrap()
            .unwrap()
            .verified_at;

        assert_eq!(
            enrollment.verify(&token).await.unwrap(),
            VerifyOutcome::AlreadyVerified
        );
        let after = repo
            .find_by_email("a@x.io")
            .await
            .unwrap()
            .unwrap()
            .verified_at;
        assert_eq!(after, verified_at);
    }

    #[sqlx::test]
    async fn verify_rejects_unknown_and_unsubscribed(pool: SqlitePool) {
        let mailer = Arc::new(MockMailer::new());
        let enrollment = enrollment(pool.clone(), mailer);
        let repo = SubscriberRepository::new(pool);

        assert!(matches!(
            enrollment.verify("no-such-token").await.unwrap_err(),
            EnrollmentError::UnknownToken
        ));

        enrollment.subscribe("a@x.io", "Al").await.unwrap();
        let subscriber = repo.find_by_email("a@x.io").await.unwrap().unwrap();
        repo.update_status(subscriber.id, SubscriberStatus::Unsubscribed)
            .await
            .unwrap();

        assert!(matches!(
            enrollment
                .verify(subscriber.verify_token.as_deref().unwrap())
                .await
                .unwrap_err(),
            EnrollmentError::Gone
        ));
    }

    #[sqlx::test]
    async fn unsubscribe_is_idempotent(pool: SqlitePool) {
        let mailer = Arc::new(MockMailer::new());
        let enrollment = enrollment(pool.clone(), mailer);
        let repo = SubscriberRepository::new(pool);

        enrollment.subscribe("a@x.io", "Al").await.unwrap();
        let token = repo
            .find_by_email("a@x.io")
            .await
            .unwrap()
            .unwrap()
            .unsubscribe_token;

        assert_eq!(
            enrollment.unsubscribe(&token).await.unwrap(),
            UnsubscribeOutcome::Unsubscribed
        );
        assert_eq!(
            enrollment.unsubscribe(&token).await.unwrap(),
            UnsubscribeOutcome::AlreadyUnsubscribed
        );

        let subscriber = repo.find_by_email("a@x.io").await.unwrap().unwrap();
        assert_eq!(subscriber.status, SubscriberStatus::Unsubscribed);
    }
}
