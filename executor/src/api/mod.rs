use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

pub mod error;
pub mod keys;
pub mod publications;
pub mod queries;

/// Header carrying the caller identity, populated by the gateway.
pub const X_IDENTITY_ID_HEADER: &str = "x-identity-id";

/// Header flagging a superuser caller, populated by the gateway.
pub const X_IS_SUPERUSER_HEADER: &str = "x-is-superuser";

/// The caller identity.
///
/// Token verification happens upstream: by the time a request reaches this
/// service the gateway has resolved the principal and forwards it in plain
/// headers.
pub struct Identity {
    pub identity_id: String,
    pub is_superuser: bool,
}

impl Identity {
    /// A run is visible to its owner and to any superuser.
    pub fn can_access(&self, identity_id: &str) -> bool {
        self.is_superuser || self.identity_id == identity_id
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Identity {
    type Rejection = error::Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let identity_id = parts
            .headers
            .get(X_IDENTITY_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| error::Error::Unauthorized("Missing caller identity.".to_string()))?;
        let is_superuser = parts
            .headers
            .get(X_IS_SUPERUSER_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(|value| value == "true" || value == "1")
            .unwrap_or(false);
        Ok(Identity { identity_id: identity_id.to_string(), is_superuser })
    }
}
