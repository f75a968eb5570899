use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    api::{
        auth::AdminUser,
        error::{ApiError, ApiResult},
        public::MessageResponse,
        validation::ValidatedJson,
    },
    delivery::{CampaignSender, SendCampaignError},
    models::{
        Campaign, CampaignRepository, CampaignStatus, JournalEntry, JournalRepository, NewCampaign,
    },
};

#[derive(Debug, Deserialize, Validate)]
pub struct CampaignPayload {
    #[garde(custom(subject_limits))]
    pub subject: String,
    #[garde(custom(not_blank))]
    pub body_text: String,
    #[garde(inner(custom(not_blank)))]
    pub body_html: Option<String>,
}

fn subject_limits(value: &str, _: &()) -> garde::Result {
    let length = value.trim().chars().count();
    if length == 0 {
        Err(garde::Error::new("must not be blank"))
    } else if length > 500 {
        Err(garde::Error::new("must be at most 500 characters"))
    } else {
        Ok(())
    }
}

fn not_blank(value: &str, _: &()) -> garde::Result {
    if value.trim().is_empty() {
        Err(garde::Error::new("must not be blank"))
    } else {
        Ok(())
    }
}

impl CampaignPayload {
    fn into_fields(self) -> NewCampaign {
        NewCampaign {
            subject: self.subject.trim().to_string(),
            body_text: self.body_text.trim().to_string(),
            body_html: self
                .body_html
                .map(|html| html.trim().to_string())
                .filter(|html| !html.is_empty()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CampaignActionResponse {
    pub message: &'static str,
    pub id: Uuid,
}

pub async fn list(
    _admin: AdminUser,
    State(repo): State<CampaignRepository>,
) -> ApiResult<Vec<Campaign>> {
    Ok(Json(repo.list().await?))
}

pub async fn create(
    _admin: AdminUser,
    State(repo): State<CampaignRepository>,
    ValidatedJson(payload): ValidatedJson<CampaignPayload>,
) -> Result<(StatusCode, Json<Campaign>), ApiError> {
    let campaign = repo.create(&payload.into_fields()).await?;

    Ok((StatusCode::CREATED, Json(campaign)))
}

pub async fn get(
    _admin: AdminUser,
    State(repo): State<CampaignRepository>,
    Path(id): Path<Uuid>,
) -> ApiResult<Campaign> {
    Ok(Json(find(&repo, id).await?))
}

pub async fn update(
    _admin: AdminUser,
    State(repo): State<CampaignRepository>,
    Path(id): Path<Uuid>,
    ValidatedJson(payload): ValidatedJson<CampaignPayload>,
) -> ApiResult<Campaign> {
    let campaign = find(&repo, id).await?;
    require_draft(&campaign, "edited")?;

    let fields = payload.into_fields();
    repo.update_fields(
        campaign.id,
        &fields.subject,
        &fields.body_text,
        fields.body_html.as_deref(),
    )
    .await?;

    Ok(Json(find(&repo, id).await?))
}

pub async fn remove(
    _admin: AdminUser,
    State(repo): State<CampaignRepository>,
    Path(id): Path<Uuid>,
) -> ApiResult<MessageResponse> {
    let campaign = find(&repo, id).await?;
    require_draft(&campaign, "deleted")?;

    repo.delete(campaign.id).await?;

    Ok(Json(MessageResponse {
        message: "Campaign deleted.",
    }))
}

/// Kicks off the background send; 202 because completion comes later.
pub async fn send(
    _admin: AdminUser,
    State(repo): State<CampaignRepository>,
    State(sender): State<CampaignSender>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<CampaignActionResponse>), ApiError> {
    let campaign = find(&repo, id).await?;

    match sender.send(campaign.id).await {
        Ok(()) => Ok((
            StatusCode::ACCEPTED,
            Json(CampaignActionResponse {
                message: "Campaign send started.",
                id: campaign.public_id,
            }),
        )),
        Err(SendCampaignError::AlreadySending) => Err(ApiError::BadRequest(
            "campaign is already sending".to_string(),
        )),
        Err(SendCampaignError::WrongStatus) => Err(ApiError::BadRequest(
            "only draft campaigns can be sent".to_string(),
        )),
        Err(SendCampaignError::NoRecipients) => Err(ApiError::BadRequest(
            "no verified subscribers to send to".to_string(),
        )),
        Err(SendCampaignError::NotFound) => Err(ApiError::NotFound),
        Err(SendCampaignError::Store(cause)) => Err(ApiError::Internal(cause)),
    }
}

pub async fn cancel(
    _admin: AdminUser,
    State(repo): State<CampaignRepository>,
    State(sender): State<CampaignSender>,
    Path(id): Path<Uuid>,
) -> ApiResult<CampaignActionResponse> {
    let campaign = find(&repo, id).await?;

    if !sender.cancel(campaign.id) {
        return Err(ApiError::BadRequest(
            "campaign is not sending".to_string(),
        ));
    }

    Ok(Json(CampaignActionResponse {
        message: "Campaign cancellation requested.",
        id: campaign.public_id,
    }))
}

pub async fn journal(
    _admin: AdminUser,
    State(repo): State<CampaignRepository>,
    State(journal): State<JournalRepository>,
    Path(id): Path<Uuid>,
) -> ApiResult<Vec<JournalEntry>> {
    let campaign = find(&repo, id).await?;

    Ok(Json(journal.list_for_campaign(campaign.id).await?))
}

async fn find(repo: &CampaignRepository, id: Uuid) -> Result<Campaign, ApiError> {
    repo.find_by_public_id(id)
        .await?
        .ok_or(ApiError::NotFound)
}

fn require_draft(campaign: &Campaign, action: &str) -> Result<(), ApiError> {
    if campaign.status != CampaignStatus::Draft {
        return Err(ApiError::BadRequest(format!(
            "only draft campaigns can be {action}"
        )));
    }
    Ok(())
}
