use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Draft,
    Sending,
    Sent,
    Failed,
    Cancelled,
}

impl CampaignStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CampaignStatus::Sent | CampaignStatus::Failed | CampaignStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Campaign {
    #[serde(skip_serializing)]
    pub id: i64,
    #[serde(rename = "id")]
    pub public_id: Uuid,
    pub subject: String,
    pub body_text: String,
    pub body_html: Option<String>,
    pub status: CampaignStatus,
    pub total_count: i64,
    pub sent_count: i64,
    pub failed_count: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct NewCampaign {
    pub subject: String,
    pub body_text: String,
    pub body_html: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CampaignRepository {
    pool: SqlitePool,
}

const COLUMNS: &str = "id, public_id, subject, body_text, body_html, status, \
                       total_count, sent_count, failed_count, created_at, started_at, completed_at";

impl CampaignRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, campaign: &NewCampaign) -> Result<Campaign, Error> {
        Ok(sqlx::query_as::<_, Campaign>(&format!(
            "INSERT INTO campaigns (public_id, subject, body_text, body_html, status, created_at) \
             VALUES (?, ?, ?, ?, 'draft', ?) \
             RETURNING {COLUMNS}"
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(&campaign.subject)
        .bind(&campaign.body_text)
        .bind(&campaign.body_html)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?)
    }

    pub async fn find_by_public_id(&self, public_id: Uuid) -> Result<Option<Campaign>, Error> {
        Ok(sqlx::query_as::<_, Campaign>(&format!(
            "SELECT {COLUMNS} FROM campaigns WHERE public_id = ?"
        ))
        .bind(public_id.to_string())
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<Campaign>, Error> {
        Ok(sqlx::query_as::<_, Campaign>(&format!(
            "SELECT {COLUMNS} FROM campaigns WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn list(&self) -> Result<Vec<Campaign>, Error> {
        Ok(sqlx::query_as::<_, Campaign>(&format!(
            "SELECT {COLUMNS} FROM campaigns ORDER BY created_at DESC, id DESC"
        ))
        .fetch_all(&self.pool)
        .await?)
    }

    /// Content edits; callers must only edit drafts.
    pub async fn update_fields(
        &self,
        id: i64,
        subject: &str,
        body_text: &str,
        body_html: Option<&str>,
    ) -> Result<(), Error> {
        let result = sqlx::query(
            "UPDATE campaigns SET subject = ?, body_text = ?, body_html = ? WHERE id = ?",
        )
        .bind(subject)
        .bind(body_text)
        .bind(body_html)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound("campaign"));
        }

        Ok(())
    }

    /// Stamps `started_at` on the first entry to `sending` and
    /// `completed_at` on entry to any terminal status.
    pub async fn update_status(&self, id: i64, status: CampaignStatus) -> Result<(), Error> {
        let now = Utc::now();

        let result = sqlx::query(
            "UPDATE campaigns \
             SET status = ?, \
                 started_at = CASE \
                     WHEN ? = 'sending' AND started_at IS NULL THEN ? \
                     ELSE started_at \
                 END, \
                 completed_at = CASE \
                     WHEN ? IN ('sent', 'failed', 'cancelled') THEN ? \
                     ELSE completed_at \
                 END \
             WHERE id = ?",
        )
        .bind(status)
        .bind(status)
        .bind(now)
        .bind(status)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound("campaign"));
        }

        Ok(())
    }

    pub async fn update_counters(
        &self,
        id: i64,
        total: i64,
        sent: i64,
        failed: i64,
    ) -> Result<(), Error> {
        let result = sqlx::query(
            "UPDATE campaigns SET total_count = ?, sent_count = ?, failed_count = ? WHERE id = ?",
        )
        .bind(total)
        .bind(sent)
        .bind(failed)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound("campaign"));
        }

        Ok(())
    }

    /// Hard delete; log and journal rows cascade.
    pub async fn delete(&self, id: i64) -> Result<(), Error> {
        let result = sqlx::query("DELETE FROM campaigns WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound("campaign"));
        }

        Ok(())
    }

    pub async fn count(&self) -> Result<i64, Error> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM campaigns")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn count_with_status(&self, status: CampaignStatus) -> Result<i64, Error> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM campaigns WHERE status = ?")
                .bind(status)
                .fetch_one(&self.pool)
                .await?,
        )
    }

    pub async fn total_emails_sent(&self) -> Result<i64, Error> {
        Ok(
            sqlx::query_scalar("SELECT COALESCE(SUM(sent_count), 0) FROM campaigns")
                .fetch_one(&self.pool)
                .await?,
        )
    }
}
