use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SubscriberStatus {
    Pending,
    Verified,
    Unsubscribed,
}

impl FromStr for SubscriberStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SubscriberStatus::Pending),
            "verified" => Ok(SubscriberStatus::Verified),
            "unsubscribed" => Ok(SubscriberStatus::Unsubscribed),
            other => Err(format!("unknown subscriber status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Subscriber {
    #[serde(skip_serializing)]
    pub id: i64,
    #[serde(rename = "id")]
    pub public_id: Uuid,
    pub email: String,
    pub name: String,
    pub status: SubscriberStatus,
    #[serde(skip_serializing)]
    pub verify_token: Option<String>,
    #[serde(skip_serializing)]
    pub unsubscribe_token: String,
    pub created_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Input for an insert. Status always starts out `pending`; ids and
/// timestamps are filled in by the repository.
#[derive(Debug)]
pub struct NewSubscriber {
    pub email: String,
    pub name: String,
    pub verify_token: String,
    pub unsubscribe_token: String,
}

#[derive(Debug, Default)]
pub struct SubscriberFilter {
    pub status: Option<SubscriberStatus>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

impl SubscriberFilter {
    pub fn page(&self) -> i64 {
        self.page.unwrap_or(1).max(1)
    }

    pub fn per_page(&self) -> i64 {
        self.per_page.unwrap_or(50).clamp(1, 100)
    }
}

#[derive(Debug, Clone)]
pub struct SubscriberRepository {
    pool: SqlitePool,
}

const COLUMNS: &str = "id, public_id, email, name, status, verify_token, \
                       unsubscribe_token, created_at, verified_at, updated_at";

impl SubscriberRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, subscriber: &NewSubscriber) -> Result<Subscriber, Error> {
        let now = Utc::now();

        Ok(sqlx::query_as::<_, Subscriber>(&format!(
            "INSERT INTO subscribers \
                 (public_id, email, name, status, verify_token, unsubscribe_token, created_at, updated_at) \
             VALUES (?, ?, ?, 'pending', ?, ?, ?, ?) \
             RETURNING {COLUMNS}"
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(&subscriber.email)
        .bind(&subscriber.name)
        .bind(&subscriber.verify_token)
        .bind(&subscriber.unsubscribe_token)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?)
    }

    pub async fn find_by_public_id(&self, public_id: Uuid) -> Result<Option<Subscriber>, Error> {
        Ok(sqlx::query_as::<_, Subscriber>(&format!(
            "SELECT {COLUMNS} FROM subscribers WHERE public_id = ?"
        ))
        .bind(public_id.to_string())
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Case-insensitive lookup; the `email` column collates NOCASE.
    pub async fn find_by_email(&self, email: &str) -> Result<Option<Subscriber>, Error> {
        Ok(sqlx::query_as::<_, Subscriber>(&format!(
            "SELECT {COLUMNS} FROM subscribers WHERE email = ?"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn find_by_verify_token(&self, token: &str) -> Result<Option<Subscriber>, Error> {
        Ok(sqlx::query_as::<_, Subscriber>(&format!(
            "SELECT {COLUMNS} FROM subscribers WHERE verify_token = ?"
        ))
        .bind(token)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn find_by_unsubscribe_token(&self, token: &str) -> Result<Option<Subscriber>, Error> {
        Ok(sqlx::query_as::<_, Subscriber>(&format!(
            "SELECT {COLUMNS} FROM subscribers WHERE unsubscribe_token = ?"
        ))
        .bind(token)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Returns one page of subscribers (newest first) plus the total number
    /// of rows matching the filter before paging.
    pub async fn list(&self, filter: &SubscriberFilter) -> Result<(Vec<Subscriber>, i64), Error> {
        let per_page = filter.per_page();
        let offset = (filter.page() - 1) * per_page;

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM subscribers WHERE (? IS NULL OR status = ?)",
        )
        .bind(filter.status)
        .bind(filter.status)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query_as::<_, Subscriber>(&format!(
            "SELECT {COLUMNS} FROM subscribers \
             WHERE (? IS NULL OR status = ?) \
             ORDER BY created_at DESC, id DESC \
             LIMIT ? OFFSET ?"
        ))
        .bind(filter.status)
        .bind(filter.status)
        .bind(per_page)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok((rows, total))
    }

    /// Sets `updated_at`, and stamps `verified_at` on the first transition to
    /// `verified` only.
    pub async fn update_status(&self, id: i64, status: SubscriberStatus) -> Result<(), Error> {
        let now = Utc::now();

        let result = sqlx::query(
            "UPDATE subscribers \
             SET status = ?, \
                 updated_at = ?, \
                 verified_at = CASE \
                     WHEN ? = 'verified' AND verified_at IS NULL THEN ? \
                     ELSE verified_at \
                 END \
             WHERE id = ?",
        )
        .bind(status)
        .bind(now)
        .bind(status)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound("subscriber"));
        }

        Ok(())
    }

    /// Hard delete; campaign log rows cascade.
    pub async fn delete(&self, id: i64) -> Result<(), Error> {
        let result = sqlx::query("DELETE FROM subscribers WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound("subscriber"));
        }

        Ok(())
    }

    /// The recipient snapshot for a campaign send. Oldest first so partial
    /// sends are deterministic.
    pub async fn all_verified(&self) -> Result<Vec<Subscriber>, Error> {
        Ok(sqlx::query_as::<_, Subscriber>(&format!(
            "SELECT {COLUMNS} FROM subscribers \
             WHERE status = 'verified' \
             ORDER BY created_at ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn count_by_status(&self, status: SubscriberStatus) -> Result<i64, Error> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM subscribers WHERE status = ?")
                .bind(status)
                .fetch_one(&self.pool)
                .await?,
        )
    }

    pub async fn count(&self) -> Result<i64, Error> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM subscribers")
            .fetch_one(&self.pool)
            .await?)
    }
}
