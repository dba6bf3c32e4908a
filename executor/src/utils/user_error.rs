use std::fmt;

/// An error that is safe to surface to the caller of the service.
///
/// Anything else bubbling up through `anyhow` is reported as an internal
/// error without detail; descriptions here are short, operator-readable and
/// never include secrets or raw SQL.
#[derive(Debug, Clone)]
pub enum UserError {
    /// The request conflicts with the current state (e.g. a locked row).
    Conflict(String),

    /// The caller provided an invalid parameter.
    InvalidParameter(String),

    /// A error that is usually unexpected and not caused by the caller.
    InternalError(String),

    /// The requested run or result was not found.
    NotFound(String),

    /// The caller is not allowed to see the requested run.
    Unauthorized(String),

    /// The request is well-formed but cannot be applied to this run.
    Unprocessable(String),

    /// The run is not in the running state (terminate only applies to one).
    NotRunning(String),
}

impl fmt::Display for UserError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            UserError::NotFound(message) => write!(f, "Not Found: {}", message),
            UserError::InvalidParameter(message) => write!(f, "Invalid Parameter: {}", message),
            UserError::InternalError(message) => write!(f, "Internal Error: {}", message),
            UserError::Conflict(message) => write!(f, "Conflict: {}", message),
            UserError::Unauthorized(message) => write!(f, "Unauthorized: {}", message),
            UserError::Unprocessable(message) => write!(f, "Unprocessable: {}", message),
            UserError::NotRunning(message) => write!(f, "Not Running: {}", message),
        }
    }
}

impl std::error::Error for UserError {}

#[macro_export]
macro_rules! err_not_found {
    ($($arg:tt)*) => (
        $crate::utils::user_error::UserError::NotFound(format!($($arg)*)).into()
    );
}

#[macro_export]
macro_rules! err_param {
    ($($arg:tt)*) => (
        $crate::utils::user_error::UserError::InvalidParameter(format!($($arg)*)).into()
    );
}

#[macro_export]
macro_rules! err_internal {
    ($($arg:tt)*) => (
        $crate::utils::user_error::UserError::InternalError(format!($($arg)*)).into()
    );
}

#[macro_export]
macro_rules! err_conflict {
    ($($arg:tt)*) => (
        $crate::utils::user_error::UserError::Conflict(format!($($arg)*)).into()
    );
}

#[macro_export]
macro_rules! err_unauthorized {
    ($($arg:tt)*) => (
        $crate::utils::user_error::UserError::Unauthorized(format!($($arg)*)).into()
    );
}

#[macro_export]
macro_rules! err_unprocessable {
    ($($arg:tt)*) => (
        $crate::utils::user_error::UserError::Unprocessable(format!($($arg)*)).into()
    );
}

#[macro_export]
macro_rules! err_not_running {
    ($($arg:tt)*) => (
        $crate::utils::user_error::UserError::NotRunning(format!($($arg)*)).into()
    );
}
