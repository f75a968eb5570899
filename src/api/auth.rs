use axum::{
    extract::{FromRef, FromRequestParts},
    http::{header, request::Parts},
};
use base64ct::{Base64, Encoding};
use subtle::ConstantTimeEq;

use crate::{api::error::ApiError, config::AuthSettings};

/// Proof that the request carried the configured admin credentials. Every
/// handler under `/api/private` takes this extractor.
pub struct AdminUser;

impl<S> FromRequestParts<S> for AdminUser
where
    S: Send + Sync,
    AuthSettings: FromRef<S>,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let auth = AuthSettings::from_ref(state);

        let header_value = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or(ApiError::Unauthorized)?;
        let encoded = header_value
            .strip_prefix("Basic ")
            .ok_or(ApiError::Unauthorized)?;

        let decoded =
            Base64::decode_vec(encoded.trim()).map_err(|_| ApiError::Unauthorized)?;
        let decoded = String::from_utf8(decoded).map_err(|_| ApiError::Unauthorized)?;
        let (username, password) = decoded.split_once(':').ok_or(ApiError::Unauthorized)?;

        // constant-time comparison of both halves, no early exit
        let username_ok = username.as_bytes().ct_eq(auth.username.as_bytes());
        let password_ok = password.as_bytes().ct_eq(auth.password.as_bytes());

        if bool::from(username_ok & password_ok) {
            Ok(AdminUser)
        } else {
            Err(ApiError::Unauthorized)
        }
    }
}
