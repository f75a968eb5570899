use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::Html,
};
use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::{
    api::{
        error::{ApiError, ApiResult},
        validation::ValidatedJson,
    },
    enrollment::{Enrollment, EnrollmentError, UnsubscribeOutcome, VerifyOutcome},
};

#[derive(Debug, Deserialize, Validate)]
pub struct SubscribeRequest {
    #[garde(email, length(max = 254))]
    pub email: String,
    #[garde(inner(length(max = 255)))]
    pub name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: &'static str,
}

/// Public sign-up. The response is identical whether the address is new or
/// already subscribed.
pub async fn subscribe(
    State(enrollment): State<Enrollment>,
    ValidatedJson(request): ValidatedJson<SubscribeRequest>,
) -> ApiResult<MessageResponse> {
    enrollment
        .subscribe(&request.email, request.name.as_deref().unwrap_or(""))
        .await
        .map_err(store_error)?;

    Ok(Json(MessageResponse {
        message: "Please check your email to verify your subscription.",
    }))
}

/// Capability-URL verification. The whole exchange is HTML so the emailed
/// link is self-contained.
pub async fn verify(
    State(enrollment): State<Enrollment>,
    Path(token): Path<String>,
) -> (StatusCode, Html<String>) {
    match enrollment.verify(&token).await {
        Ok(VerifyOutcome::Verified) => (
            StatusCode::OK,
            page(
                "Subscription confirmed",
                "Your subscription is confirmed. Welcome aboard!",
            ),
        ),
        Ok(VerifyOutcome::AlreadyVerified) => (
            StatusCode::OK,
            page(
                "Already verified",
                "This subscription was already verified. Nothing left to do.",
            ),
        ),
        Err(EnrollmentError::UnknownToken) => (
            StatusCode::NOT_FOUND,
            page(
                "Unknown link",
                "This verification link is not valid. It may have been removed.",
            ),
        ),
        Err(EnrollmentError::Gone) => (
            StatusCode::BAD_REQUEST,
            page(
                "Unsubscribed",
                "This address has been unsubscribed and can no longer be verified.",
            ),
        ),
        Err(EnrollmentError::Store(err)) => {
            tracing::error!("verification failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                page("Something went wrong", "Please try again later."),
            )
        }
    }
}

pub async fn unsubscribe(
    State(enrollment): State<Enrollment>,
    Path(token): Path<String>,
) -> ApiResult<MessageResponse> {
    let message = match enrollment.unsubscribe(&token).await {
        Ok(UnsubscribeOutcome::Unsubscribed) => "You have been unsubscribed successfully.",
        Ok(UnsubscribeOutcome::AlreadyUnsubscribed) => "You have already been unsubscribed.",
        Err(EnrollmentError::UnknownToken) => return Err(ApiError::NotFound),
        Err(err) => return Err(store_error(err)),
    };

    Ok(Json(MessageResponse { message }))
}

fn store_error(err: EnrollmentError) -> ApiError {
    match err {
        EnrollmentError::Store(err) => ApiError::Store(err),
        // verify/unsubscribe map these before getting here
        EnrollmentError::UnknownToken => ApiError::NotFound,
        EnrollmentError::Gone => ApiError::BadRequest("subscriber has unsubscribed".to_string()),
    }
}

fn page(title: &str, body: &str) -> Html<String> {
    Html(format!(
        "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>{title} - TinyList</title></head>\n\
         <body>\n<h1>{title}</h1>\n<p>{body}</p>\n</body>\n</html>\n"
    ))
}
