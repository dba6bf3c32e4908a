use crate::api::error::{Error, ServerResult};
use crate::api::Identity;
use crate::models::queries::{QueryExecutionOut, QueryIn, QueryOut};
use crate::models::QueryExecution;
use crate::resources::queries;
use crate::resources::queries::NewQueryExecution;
use crate::server::state::ServerState;
use crate::{crypto, materialize, settings, tasks};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::debug;

/// Upper bound on a single result page.
const MAX_LIMIT: i64 = 1000;

pub fn routes(state: ServerState) -> Router {
    Router::new()
        .route("/queries", post(submit))
        .route("/queries/delete", post(delete_results))
        .route("/queries/:guid", get(get_run).delete(terminate))
        .route("/queries/:guid/results", get(get_results))
        .with_state(state)
}

/// Accept a submission and spawn its engine task.
///
/// The response returns immediately; execution continues in the background
/// and is observed through `get_run` and the bus notifications.
async fn submit(State(state): State<ServerState>, Json(query_in): Json<QueryIn>) -> ServerResult<Json<QueryOut>> {
    if let Some(run_guid) = &query_in.run_guid {
        // The submitter's correlation id is not persisted: the run is keyed
        // by its guid alone.
        debug!("Submission {} correlates to run {}", query_in.guid, run_guid);
    }
    let source_conn = crypto::encrypt(&settings::get_encryption_key(), &query_in.conn_string)?;
    let mut conn = state.get_db_connection().await?;
    let query = queries::create(
        &mut conn,
        NewQueryExecution {
            guid: query_in.guid,
            query: query_in.query,
            source_conn,
            identity_id: query_in.identity_id,
            result_destinations: query_in.result_destinations,
        },
    )
    .await?;

    let task_state = state.clone();
    let query_id = query.id;
    state.push_task(Box::new(move || tasks::execute_query_task(task_state, query_id))).await?;
    Ok(Json(QueryOut { id: query.id, guid: query.guid }))
}

async fn get_run(
    State(state): State<ServerState>,
    Path(guid): Path<String>,
    identity: Identity,
) -> ServerResult<Json<QueryExecutionOut>> {
    let conn = state.get_db_connection().await?;
    let query = load_visible_run(&*conn, &guid, &identity).await?;
    Ok(Json(QueryExecutionOut::from(&query)))
}

#[derive(Deserialize)]
struct ResultsParams {
    limit: i64,
    offset: i64,
}

async fn get_results(
    State(state): State<ServerState>,
    Path(guid): Path<String>,
    Query(params): Query<ResultsParams>,
    identity: Identity,
) -> ServerResult<Json<Vec<serde_json::Map<String, serde_json::Value>>>> {
    if !(1..=MAX_LIMIT).contains(&params.limit) {
        return Err(Error::BadRequest(format!("limit must be between 1 and {MAX_LIMIT}")));
    }
    if params.offset < 0 {
        return Err(Error::BadRequest("offset must not be negative".to_string()));
    }

    let conn = state.get_db_connection().await?;
    let query = load_visible_run(&*conn, &guid, &identity).await?;
    let path = table_destination_path(&query)?;
    let rows = materialize::table::read_result_page(&path, params.limit, params.offset).await?;
    Ok(Json(rows))
}

async fn terminate(State(state): State<ServerState>, Path(guid): Path<String>) -> ServerResult<StatusCode> {
    tasks::executions::cancel_query(&state, &guid).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct DeleteResultsIn {
    guids: Vec<String>,
}

/// Drop the result tables of the given runs and flip their destinations to
/// `deleted`.
///
/// Every run is checked before anything is dropped: a run without a `table`
/// destination fails the whole request.
async fn delete_results(
    State(state): State<ServerState>,
    identity: Identity,
    Json(body): Json<DeleteResultsIn>,
) -> ServerResult<StatusCode> {
    let conn = state.get_db_connection().await?;
    let mut paths = Vec::new();
    let mut dest_ids = Vec::new();
    for guid in &body.guids {
        let query = load_visible_run(&*conn, guid, &identity).await?;
        let destination = query
            .destinations
            .iter()
            .find(|dest| dest.dest_type == "table")
            .ok_or_else(|| Error::Unprocessable(format!("Query {guid} has no table destination.")))?;
        if let Some(path) = &destination.path {
            paths.push(path.clone());
        }
        dest_ids.push(destination.id);
    }

    materialize::table::delete_query_execs(&paths).await?;
    queries::mark_destinations_deleted(&*conn, &dest_ids).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn load_visible_run(
    client: &tokio_postgres::Client,
    guid: &str,
    identity: &Identity,
) -> ServerResult<QueryExecution> {
    let query = queries::get_by_guid(client, guid)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Query {guid} does not exist.")))?;
    if !identity.can_access(&query.identity_id) {
        return Err(Error::Unauthorized(format!("Query {guid} is not visible to the caller.")));
    }
    Ok(query)
}

fn table_destination_path(query: &QueryExecution) -> ServerResult<String> {
    query
        .destinations
        .iter()
        .find(|dest| dest.dest_type == "table")
        .ok_or_else(|| Error::Unprocessable(format!("Query {} has no table destination.", query.guid)))?
        .path
        .clone()
        .ok_or_else(|| Error::Unprocessable(format!("The results of query {} are not materialized.", query.guid)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::queries::{QueryDestination, QueryDestinationStatus, QueryStatus};

    fn run_with_destinations(destinations: Vec<QueryDestination>) -> QueryExecution {
        QueryExecution {
            id: 1,
            guid: "g1".to_string(),
            query: "SELECT 1".to_string(),
            source_conn: String::new(),
            identity_id: "u1".to_string(),
            status: QueryStatus::Done,
            error_description: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            destinations,
        }
    }

    fn destination(dest_type: &str, path: Option<&str>) -> QueryDestination {
        QueryDestination {
            id: 1,
            query_id: 1,
            dest_type: dest_type.to_string(),
            status: QueryDestinationStatus::Uploaded,
            path: path.map(str::to_string),
            access_creds: None,
            error_description: None,
            finished_at: None,
        }
    }

    #[test]
    fn test_table_destination_path() {
        let run = run_with_destinations(vec![destination("table", Some("results_1"))]);
        assert_eq!(table_destination_path(&run).unwrap(), "results_1");

        // No table destination at all.
        let run = run_with_destinations(vec![destination("s3", Some("bucket/key"))]);
        assert!(matches!(table_destination_path(&run), Err(Error::Unprocessable(_))));

        // A table destination that never materialized.
        let run = run_with_destinations(vec![destination("table", None)]);
        assert!(matches!(table_destination_path(&run), Err(Error::Unprocessable(_))));
    }
}
