use std::sync::Arc;

use axum::{Json, extract::State};
use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::{
    api::{
        auth::AdminUser,
        error::{ApiError, ApiResult},
        public::MessageResponse,
        validation::ValidatedJson,
    },
    mailer::Mailer,
    models::{SettingsRepository, SmtpSettings},
};

const PASSWORD_MASK: &str = "***";

/// Same shape for GET and PUT. On the way out the password is masked; on the
/// way in an empty or masked password means "keep the existing one".
#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct SmtpSettingsPayload {
    #[garde(skip)]
    pub host: String,
    #[garde(skip)]
    pub port: u16,
    #[serde(default)]
    #[garde(skip)]
    pub username: String,
    #[serde(default)]
    #[garde(skip)]
    pub password: String,
    #[garde(skip)]
    pub from_email: String,
    #[serde(default)]
    #[garde(skip)]
    pub from_name: String,
    #[serde(default)]
    #[garde(skip)]
    pub tls: bool,
}

impl SmtpSettingsPayload {
    fn masked(settings: SmtpSettings) -> Self {
        Self {
            host: settings.host,
            port: settings.port,
            username: settings.username,
            password: if settings.password.is_empty() {
                String::new()
            } else {
                PASSWORD_MASK.to_string()
            },
            from_email: settings.from_email,
            from_name: settings.from_name,
            tls: settings.tls,
        }
    }
}

pub async fn get_smtp(
    _admin: AdminUser,
    State(repo): State<SettingsRepository>,
) -> ApiResult<SmtpSettingsPayload> {
    let settings = SmtpSettings::load(&repo).await?;

    Ok(Json(SmtpSettingsPayload::masked(settings)))
}

pub async fn update_smtp(
    _admin: AdminUser,
    State(repo): State<SettingsRepository>,
    State(mailer): State<Arc<dyn Mailer>>,
    ValidatedJson(payload): ValidatedJson<SmtpSettingsPayload>,
) -> ApiResult<SmtpSettingsPayload> {
    let current = SmtpSettings::load(&repo).await?;

    let password = if payload.password.is_empty() || payload.password == PASSWORD_MASK {
        current.password
    } else {
        payload.password
    };

    let settings = SmtpSettings {
        host: payload.host,
        port: payload.port,
        username: payload.username,
        password,
        from_email: payload.from_email,
        from_name: payload.from_name,
        tls: payload.tls,
    };

    settings.persist(&repo).await?;
    mailer.configure(settings.clone());

    Ok(Json(SmtpSettingsPayload::masked(settings)))
}

#[derive(Debug, Deserialize, Validate)]
pub struct SmtpTestRequest {
    #[garde(email)]
    pub email: String,
}

pub async fn test_smtp(
    _admin: AdminUser,
    State(mailer): State<Arc<dyn Mailer>>,
    ValidatedJson(request): ValidatedJson<SmtpTestRequest>,
) -> ApiResult<MessageResponse> {
    if !mailer.is_configured() {
        return Err(ApiError::BadRequest(
            "SMTP transport is not configured".to_string(),
        ));
    }

    mailer
        .send_test(&request.email)
        .await
        .map_err(|err| ApiError::BadRequest(format!("test send failed: {err}")))?;

    Ok(Json(MessageResponse {
        message: "Test email sent successfully.",
    }))
}
