use std::{fmt::Display, str::FromStr, sync::Arc};

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use garde::Validate;
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::{
    api::{
        auth::AdminUser,
        error::{ApiError, ApiResult},
        public::MessageResponse,
        validation::{ValidatedJson, ValidatedQuery},
    },
    enrollment::{self, Enrollment},
    mailer::Mailer,
    models::{NewSubscriber, Subscriber, SubscriberFilter, SubscriberRepository, SubscriberStatus},
};

#[derive(Debug, Deserialize, Validate)]
pub struct ListQuery {
    #[serde(default, deserialize_with = "empty_string_as_none")]
    #[garde(skip)]
    pub status: Option<SubscriberStatus>,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    #[garde(skip)]
    pub page: Option<i64>,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    #[garde(skip)]
    pub per_page: Option<i64>,
}

/// Treats `?page=` the same as an absent parameter; anything non-empty must
/// parse, so an illegal status value is a 400.
fn empty_string_as_none<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    let value = Option::<String>::deserialize(deserializer)?;
    match value.as_deref() {
        None | Some("") => Ok(None),
        Some(raw) => raw.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Serialize)]
pub struct SubscriberPage {
    pub data: Vec<Subscriber>,
    pub page: i64,
    pub per_page: i64,
    pub total: i64,
    pub total_pages: i64,
}

pub async fn list(
    _admin: AdminUser,
    State(repo): State<SubscriberRepository>,
    ValidatedQuery(query): ValidatedQuery<ListQuery>,
) -> ApiResult<SubscriberPage> {
    let filter = SubscriberFilter {
        status: query.status,
        page: query.page,
        per_page: query.per_page,
    };

    let (data, total) = repo.list(&filter).await?;
    let per_page = filter.per_page();

    Ok(Json(SubscriberPage {
        data,
        page: filter.page(),
        per_page,
        total,
        total_pages: (total + per_page - 1) / per_page,
    }))
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateSubscriberRequest {
    #[garde(email, length(max = 254))]
    pub email: String,
    #[garde(inner(length(max = 255)))]
    pub name: Option<String>,
}

pub async fn create(
    _admin: AdminUser,
    State(repo): State<SubscriberRepository>,
    ValidatedJson(request): ValidatedJson<CreateSubscriberRequest>,
) -> Result<(StatusCode, Json<Subscriber>), ApiError> {
    let new_subscriber = NewSubscriber {
        email: enrollment::normalize_email(&request.email),
        name: request.name.as_deref().unwrap_or("").trim().to_string(),
        verify_token: enrollment::mint_token(),
        unsubscribe_token: enrollment::mint_token(),
    };

    let subscriber = repo.create(&new_subscriber).await.map_err(|err| match err {
        crate::models::Error::Conflict => {
            ApiError::Conflict("a subscriber with this email already exists".to_string())
        }
        other => other.into(),
    })?;

    Ok((StatusCode::CREATED, Json(subscriber)))
}

pub async fn get(
    _admin: AdminUser,
    State(repo): State<SubscriberRepository>,
    Path(id): Path<Uuid>,
) -> ApiResult<Subscriber> {
    let subscriber = repo
        .find_by_public_id(id)
        .await?
        .ok_or(ApiError::NotFound)?;

    Ok(Json(subscriber))
}

pub async fn remove(
    _admin: AdminUser,
    State(repo): State<SubscriberRepository>,
    Path(id): Path<Uuid>,
) -> ApiResult<MessageResponse> {
    let subscriber = repo
        .find_by_public_id(id)
        .await?
        .ok_or(ApiError::NotFound)?;
    repo.delete(subscriber.id).await?;

    Ok(Json(MessageResponse {
        message: "Subscriber deleted.",
    }))
}

pub async fn send_verification(
    _admin: AdminUser,
    State(repo): State<SubscriberRepository>,
    State(mailer): State<Arc<dyn Mailer>>,
    State(enrollment): State<Enrollment>,
    Path(id): Path<Uuid>,
) -> ApiResult<MessageResponse> {
    let subscriber = repo
        .find_by_public_id(id)
        .await?
        .ok_or(ApiError::NotFound)?;

    if subscriber.status != SubscriberStatus::Pending {
        return Err(ApiError::BadRequest(
            "subscriber is not pending verification".to_string(),
        ));
    }
    if !mailer.is_configured() {
        return Err(ApiError::BadRequest(
            "SMTP transport is not configured".to_string(),
        ));
    }

    enrollment.send_verification(&subscriber).await;

    Ok(Json(MessageResponse {
        message: "Verification email sent.",
    }))
}
