use crate::api::error::{Error, ServerResult};
use crate::resources::queries;
use crate::server::state::ServerState;
use crate::settings;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use tracing::info;

pub fn routes(state: ServerState) -> Router {
    Router::new().route("/keys/rotate", post(rotate)).with_state(state)
}

#[derive(Deserialize)]
struct KeyIn {
    old_key: String,
}

/// Re-encrypt stored credentials from `old_key` to the current key.
///
/// Rows the old key does not open are left untouched, so a rotation can be
/// repeated safely. Returns a conflict while the rows are locked elsewhere.
async fn rotate(State(state): State<ServerState>, Json(key_in): Json<KeyIn>) -> ServerResult<StatusCode> {
    if hex::decode(&key_in.old_key).is_err() {
        return Err(Error::BadRequest("the old key must be hex encoded".to_string()));
    }
    let mut conn = state.get_db_connection().await?;
    let rotated = queries::rotate_encryption_key(&mut conn, &key_in.old_key, &settings::get_encryption_key()).await?;
    info!("Re-encrypted {} stored credentials.", rotated);
    Ok(StatusCode::NO_CONTENT)
}
