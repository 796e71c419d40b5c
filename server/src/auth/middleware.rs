//! Owner extraction from the `Authorization` header.
//!
//! Without `AUTH_SECRET` the bearer token is the owner id itself and a
//! missing header maps to the `anonymous` owner. With a secret configured the
//! token must read `<owner>:<secret>`.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};
use ensemble_engine::UserId;

use crate::error::AppError;
use crate::AppState;

/// Owner used for unauthenticated requests in development mode.
pub const ANONYMOUS_OWNER: &str = "anonymous";

/// Authenticated owner extracted from the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    /// Every document read or written belongs to this owner
    pub owner_id: UserId,
}

impl AuthUser {
    /// Resolve an `Authorization` header value against the configured secret.
    pub fn authenticate(header: Option<&str>, secret: Option<&str>) -> Result<Self, AppError> {
        let Some(header) = header else {
            return match secret {
                None => Ok(AuthUser {
                    owner_id: ANONYMOUS_OWNER.to_string(),
                }),
                Some(_) => Err(AppError::Unauthorized("Missing authorization header")),
            };
        };

        let token = header
            .strip_prefix("Bearer ")
            .ok_or(AppError::Unauthorized("Invalid authorization header format"))?
            .trim();
        if token.is_empty() {
            return Err(AppError::Unauthorized("Empty bearer token"));
        }

        let owner = match secret {
            None => token,
            Some(secret) => match token.rsplit_once(':') {
                Some((owner, given)) if given == secret => owner,
                _ => return Err(AppError::Unauthorized("Invalid bearer token")),
            },
        };
        if owner.is_empty() {
            return Err(AppError::Unauthorized("Empty owner id"));
        }

        Ok(AuthUser {
            owner_id: owner.to_string(),
        })
    }
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());

        let user = Self::authenticate(header, state.config.auth_secret.as_deref());
        if let Err(err) = &user {
            tracing::debug!(error = %err, "request rejected");
        }
        user
    }
}
