use crate::UserError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::error;

pub type ServerResult<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone)]
pub enum Error {
    NotFound(String),
    Unauthorized(String),
    Unprocessable(String),
    Conflict(String),
    BadRequest(String),
    InternalServerError,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match self {
            Error::NotFound(reason) => (StatusCode::NOT_FOUND, reason).into_response(),
            Error::Unauthorized(reason) => (StatusCode::UNAUTHORIZED, reason).into_response(),
            Error::Unprocessable(reason) => (StatusCode::UNPROCESSABLE_ENTITY, reason).into_response(),
            Error::Conflict(reason) => (StatusCode::CONFLICT, reason).into_response(),
            Error::BadRequest(reason) => (StatusCode::BAD_REQUEST, format!("Bad Request: {}", reason)).into_response(),
            Error::InternalServerError => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
            }
        }
    }
}

/// Surface the user-visible error kinds with their status; everything else
/// is logged here and reported as an opaque internal error.
impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        match e.downcast_ref::<UserError>() {
            Some(UserError::NotFound(message)) => Error::NotFound(message.clone()),
            Some(UserError::Unauthorized(message)) => Error::Unauthorized(message.clone()),
            Some(UserError::Unprocessable(message)) => Error::Unprocessable(message.clone()),
            Some(UserError::Conflict(message)) => Error::Conflict(message.clone()),
            Some(UserError::NotRunning(message)) => Error::Conflict(message.clone()),
            Some(UserError::InvalidParameter(message)) => Error::BadRequest(message.clone()),
            Some(UserError::InternalError(_)) | None => {
                error!("{:#}", e);
                Error::InternalServerError
            }
        }
    }
}
