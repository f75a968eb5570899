use axum::{Json, extract::State};
use serde::Serialize;

use crate::{
    api::{auth::AdminUser, error::ApiResult},
    models::{CampaignRepository, CampaignStatus, SubscriberRepository, SubscriberStatus},
};

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub subscribers: SubscriberStats,
    pub campaigns: CampaignStats,
    /// Sum of sent counters across all campaigns.
    pub emails_sent: i64,
}

#[derive(Debug, Serialize)]
pub struct SubscriberStats {
    pub total: i64,
    pub pending: i64,
    pub verified: i64,
    pub unsubscribed: i64,
}

#[derive(Debug, Serialize)]
pub struct CampaignStats {
    pub total: i64,
    pub sent: i64,
}

pub async fn stats(
    _admin: AdminUser,
    State(subscribers): State<SubscriberRepository>,
    State(campaigns): State<CampaignRepository>,
) -> ApiResult<StatsResponse> {
    Ok(Json(StatsResponse {
        subscribers: SubscriberStats {
            total: subscribers.count().await?,
            pending: subscribers.count_by_status(SubscriberStatus::Pending).await?,
            verified: subscribers
                .count_by_status(SubscriberStatus::Verified)
                .await?,
            unsubscribed: subscribers
                .count_by_status(SubscriberStatus::Unsubscribed)
                .await?,
        },
        campaigns: CampaignStats {
            total: campaigns.count().await?,
            sent: campaigns.count_with_status(CampaignStatus::Sent).await?,
        },
        emails_sent: campaigns.total_emails_sent().await?,
    }))
}
