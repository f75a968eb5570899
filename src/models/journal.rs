use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::models::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JournalKind {
    Info,
    Warning,
    Error,
    Success,
}

/// Append-only, human-readable lifecycle event for one campaign.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct JournalEntry {
    #[serde(skip_serializing)]
    pub id: i64,
    #[serde(skip_serializing)]
    pub campaign_id: i64,
    #[serde(rename = "event_type")]
    pub kind: JournalKind,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct JournalRepository {
    pool: SqlitePool,
}

impl JournalRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn append(
        &self,
        campaign_id: i64,
        kind: JournalKind,
        message: &str,
    ) -> Result<(), Error> {
        sqlx::query(
            "INSERT INTO campaign_journal (campaign_id, kind, message, created_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(campaign_id)
        .bind(kind)
        .bind(message)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Oldest first, the order events happened.
    pub async fn list_for_campaign(&self, campaign_id: i64) -> Result<Vec<JournalEntry>, Error> {
        Ok(sqlx::query_as::<_, JournalEntry>(
            "SELECT id, campaign_id, kind, message, created_at \
             FROM campaign_journal WHERE campaign_id = ? ORDER BY id ASC",
        )
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CampaignRepository, NewCampaign};

    #[sqlx::test]
    async fn entries_are_listed_oldest_first(pool: SqlitePool) {
        let campaign = CampaignRepository::new(pool.clone())
            .create(&NewCampaign {
                subject: "s".into(),
                body_text: "b".into(),
                body_html: None,
            })
            .await
            .unwrap();
        let repo = JournalRepository::new(pool);

        repo.append(campaign.id, JournalKind::Info, "first")
            .await
            .unwrap();
        repo.append(campaign.id, JournalKind::Success, "second")
            .await
            .unwrap();

        let entries = repo.list_for_campaign(campaign.id).await.unwrap();
        let messages: Vec<_> = entries.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, ["first", "second"]);
        assert_eq!(entries[0].kind, JournalKind::Info);
    }
}
