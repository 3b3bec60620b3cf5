use axum::{async_trait, extract::FromRequestParts, http::request::Parts};

use super::AppState;
use crate::{error::AppError, models::User};

/// Header carrying the authenticated member id, set by the upstream auth layer
pub const USER_ID_HEADER: &str = "x-user-id";

/// The active member making the request
#[derive(Debug, Clone)]
pub struct CurrentUser(pub User);

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let user_id: i64 = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse().ok())
            .ok_or_else(|| AppError::Unauthorized("Missing or invalid credentials".to_string()))?;

        match state.users.find_user(user_id).await? {
            Some(user) if user.is_active => Ok(CurrentUser(user)),
            Some(_) => Err(AppError::Unauthorized("User account is inactive".to_string())),
            None => Err(AppError::Unauthorized("User not found".to_string())),
        }
    }
}
