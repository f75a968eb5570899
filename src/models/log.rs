use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::models::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LogOutcome {
    Sent,
    Failed,
}

/// One row per (campaign, subscriber): the final outcome of the delivery
/// attempt loop for that recipient.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CampaignLog {
    pub id: i64,
    pub campaign_id: i64,
    pub subscriber_id: i64,
    pub outcome: LogOutcome,
    pub error: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CampaignLogRepository {
    pool: SqlitePool,
}

impl CampaignLogRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn append(
        &self,
        campaign_id: i64,
        subscriber_id: i64,
        outcome: LogOutcome,
        error: Option<&str>,
    ) -> Result<(), Error> {
        sqlx::query(
            "INSERT INTO campaign_logs (campaign_id, subscriber_id, outcome, error, attempted_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(campaign_id)
        .bind(subscriber_id)
        .bind(outcome)
        .bind(error)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn list_for_campaign(&self, campaign_id: i64) -> Result<Vec<CampaignLog>, Error> {
        Ok(sqlx::query_as::<_, CampaignLog>(
            "SELECT id, campaign_id, subscriber_id, outcome, error, attempted_at \
             FROM campaign_logs WHERE campaign_id = ? ORDER BY id ASC",
        )
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CampaignRepository, NewCampaign, NewSubscriber, SubscriberRepository};

    async fn fixture(pool: &SqlitePool) -> (i64, i64) {
        let campaign = CampaignRepository::new(pool.clone())
            .create(&NewCampaign {
                subject: "s".into(),
                body_text: "b".into(),
                body_html: None,
            })
            .await
            .unwrap();
        let subscriber = SubscriberRepository::new(pool.clone())
            .create(&NewSubscriber {
                email: "a@x.io".into(),
                name: "Al".into(),
                verify_token: "v".into(),
                unsubscribe_token: "u".into(),
            })
            .await
            .unwrap();
        (campaign.id, subscriber.id)
    }

    #[sqlx::test]
    async fn one_row_per_campaign_subscriber_pair(pool: SqlitePool) {
        let (campaign_id, subscriber_id) = fixture(&pool).await;
        let repo = CampaignLogRepository::new(pool);

        repo.append(campaign_id, subscriber_id, LogOutcome::Sent, None)
            .await
            .unwrap();
        let err = repo
            .append(campaign_id, subscriber_id, LogOutcome::Failed, Some("dup"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Conflict));
    }

    #[sqlx::test]
    async fn rows_cascade_with_campaign(pool: SqlitePool) {
        let (campaign_id, subscriber_id) = fixture(&pool).await;
        let repo = CampaignLogRepository::new(pool.clone());

        repo.append(campaign_id, subscriber_id, LogOutcome::Failed, Some("boom"))
            .await
            .unwrap();
        CampaignRepository::new(pool)
            .delete(campaign_id)
            .await
            .unwrap();

        assert!(repo.list_for_campaign(campaign_id).await.unwrap().is_empty());
    }
}
