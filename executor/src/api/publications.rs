use crate::api::error::ServerResult;
use crate::tasks::publish;
use axum::extract::Query;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

pub fn routes() -> Router {
    Router::new().route("/publications", get(publish_exists))
}

#[derive(Deserialize)]
struct PublicationParams {
    publish_name: String,
}

/// Check whether a publish table already exists in the analytics store.
async fn publish_exists(Query(params): Query<PublicationParams>) -> ServerResult<Json<bool>> {
    Ok(Json(publish::publish_table_exists(&params.publish_name).await?))
}
