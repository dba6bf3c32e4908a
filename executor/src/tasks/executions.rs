use crate::models::{QueryExecution, QueryStatus};
use crate::resources::queries;
use crate::server::state::ServerState;
use crate::{crypto, err_internal, err_not_found, err_not_running, materialize, notifications, settings, Result};
use drivers::QueryRunnerFactory;
use futures::future::BoxFuture;
use tokio_postgres::Client;
use tracing::{error, warn};

/// Own a run from acceptance to its terminal status.
///
/// Errors of the orchestration itself never propagate to the spawning task:
/// they are logged with the run id and swallowed. In the degenerate case the
/// row stays `running` for an external janitor to sweep.
pub fn execute_query_task(state: ServerState, query_id: i64) -> BoxFuture<'static, Result<()>> {
    Box::pin(async move {
        if let Err(e) = run_query(&state, query_id).await {
            error!("Failed to execute query {}: {:#}", query_id, e);
        }
        Ok(())
    })
}

async fn run_query(state: &ServerState, query_id: i64) -> Result<()> {
    let mut conn = state.get_db_connection().await?;
    let Some(mut query) = queries::get(&*conn, query_id).await? else {
        warn!("Query {} no longer exists, nothing to run.", query_id);
        return Ok(());
    };

    if !queries::set_running(&*conn, query.id).await? {
        warn!("Query {} is not in the created state, nothing to run.", query.guid);
        return Ok(());
    }
    query.status = QueryStatus::Running;

    // The staging directory lives for this run only; it is removed when it
    // goes out of scope, failures included.
    let temp_dir = tempfile::tempdir()?;
    let staging_path = temp_dir.path().join(format!("{}.bin", query.guid));

    let Some(conn_string) = crypto::decrypt(&settings::get_encryption_key(), &query.source_conn) else {
        fail_run(&conn, &mut query, "Failed to decrypt the source credentials").await;
        return Ok(());
    };
    let runner = match QueryRunnerFactory::build(query.id, &conn_string) {
        Ok(runner) => runner,
        Err(e) => {
            fail_run(&conn, &mut query, &e.to_string()).await;
            return Ok(());
        }
    };

    match runner.execute_to_file(&query.query, &staging_path).await {
        Ok(()) => {}
        Err(drivers::Error::Cancelled) => {
            // The cancel protocol may have flipped the row already: re-read
            // under lock and let whoever committed first win.
            let tx = conn.transaction().await?;
            if queries::lock_status(&tx, query.id).await? == QueryStatus::Cancelled {
                tx.commit().await?;
                return Ok(());
            }
            queries::set_terminal(&tx, query.id, QueryStatus::Error, Some("Cancelled")).await?;
            tx.commit().await?;
            query.status = QueryStatus::Error;
            query.error_description = Some("Cancelled".to_string());
            notifications::send_notification(&query).await;
            return Ok(());
        }
        Err(e) => {
            error!("Failed to run query {}: {:#}", query.guid, e);
            fail_run(&conn, &mut query, "SQL execution failed").await;
            return Ok(());
        }
    }

    for i in 0..query.destinations.len() {
        let dest_id = query.destinations[i].id;
        let dest_type = query.destinations[i].dest_type.clone();
        let Some(materializer) = materialize::for_dest_type(&dest_type) else {
            error!("Unknown destination type: {}", dest_type);
            continue;
        };
        match materializer.materialize(&query, &staging_path).await {
            Ok(outcome) => {
                queries::mark_destination_uploaded(&*conn, dest_id, &outcome.path, &outcome.access_creds).await?;
            }
            Err(e) => {
                error!("Failed to upload result of query {} into {}: {}", query.guid, dest_type, e);
                queries::mark_destination_error(&*conn, dest_id, &format!("Failed to upload into {dest_type}: {e}"))
                    .await?;
                fail_run(&conn, &mut query, &format!("Results failed to upload into {dest_type}: {e}")).await;
                return Ok(());
            }
        }
    }

    if queries::set_terminal(&*conn, query.id, QueryStatus::Done, None).await? {
        query.status = QueryStatus::Done;
        query.error_description = None;
        notifications::send_notification(&query).await;
    }
    Ok(())
}

/// Reflect a failure into the row, then notify.
///
/// The terminal write is dropped when the run was concurrently cancelled, in
/// which case the cancel path already published the notification.
async fn fail_run(client: &Client, query: &mut QueryExecution, description: &str) {
    match queries::set_terminal(client, query.id, QueryStatus::Error, Some(description)).await {
        Ok(true) => {
            query.status = QueryStatus::Error;
            query.error_description = Some(description.to_string());
            notifications::send_notification(query).await;
        }
        Ok(false) => {}
        Err(e) => error!("Failed to mark query {} as failed: {:#}", query.guid, e),
    }
}

/// Cancel a running query by guid.
///
/// The row lock, the backend cancel and the status flip happen in one
/// transaction: the race with the engine's `Cancelled -> ERROR` branch is
/// resolved by whichever transaction commits first.
pub async fn cancel_query(state: &ServerState, guid: &str) -> Result<()> {
    let mut conn = state.get_db_connection().await?;
    let Some(mut query) = queries::get_by_guid(&*conn, guid).await? else {
        return Err(err_not_found!("Query {} does not exist", guid));
    };
    if query.status != QueryStatus::Running {
        return Err(err_not_running!("Query {} is not in the running state", guid));
    }
    let Some(conn_string) = crypto::decrypt(&settings::get_encryption_key(), &query.source_conn) else {
        return Err(err_internal!("Failed to decrypt the source credentials of query {}", guid));
    };
    let runner = QueryRunnerFactory::build(query.id, &conn_string).map_err(|e| -> anyhow::Error { err_internal!("{}", e) })?;

    let tx = conn.transaction().await?;
    if queries::lock_status(&tx, query.id).await? != QueryStatus::Running {
        return Err(err_not_running!("Query {} is not in the running state", guid));
    }
    match runner.cancel(guid).await {
        Ok(()) => {}
        Err(drivers::Error::NotRunning) => {
            return Err(err_not_running!("Query {} is not in the running state", guid));
        }
        Err(e) => return Err(err_internal!("Failed to cancel query {}: {}", guid, e)),
    }
    queries::set_cancelled(&tx, query.id).await?;
    tx.commit().await?;

    query.status = QueryStatus::Cancelled;
    notifications::send_notification(&query).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::models::QueryDestinationStatus;
    use crate::resources::queries::NewQueryExecution;
    use crate::utils::tests::{operational_db_enabled, unique_guid};

    async fn setup_state() -> ServerState {
        let pool = db::init().await.unwrap();
        let state = ServerState::new(pool);
        state.start().await;
        state
    }

    async fn submit(state: &ServerState, guid: &str, sql: &str, destinations: Vec<String>) -> QueryExecution {
        let mut conn = state.get_db_connection().await.unwrap();
        // The operational database doubles as the source for the test runs.
        let source_conn =
            crypto::encrypt(&settings::get_encryption_key(), &settings::get_db_connection_string()).unwrap();
        queries::create(
            &mut conn,
            NewQueryExecution {
                guid: guid.to_string(),
                query: sql.to_string(),
                source_conn,
                identity_id: "u1".to_string(),
                result_destinations: destinations,
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_happy_path_table_destination() {
        if !operational_db_enabled() {
            return;
        }
        let state = setup_state().await;
        let guid = unique_guid();
        let query =
            submit(&state, &guid, "SELECT 1 AS n, 'a' AS s", vec!["table".to_string()]).await;

        execute_query_task(state.clone(), query.id).await.unwrap();

        let conn = state.get_db_connection().await.unwrap();
        let done = queries::get_by_guid(&*conn, &guid).await.unwrap().unwrap();
        assert_eq!(done.status, QueryStatus::Done);
        assert_eq!(done.destinations[0].status, QueryDestinationStatus::Uploaded);
        let path = done.destinations[0].path.clone().unwrap();
        assert_eq!(path, format!("results_{}", query.id));

        let rows = crate::materialize::table::read_result_page(&path, 10, 0).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["n"], 1);
        assert_eq!(rows[0]["s"], "a");

        crate::materialize::table::delete_query_execs(&[path]).await.unwrap();
    }

    #[tokio::test]
    async fn test_reserved_column_fails_the_run() {
        if !operational_db_enabled() {
            return;
        }
        let state = setup_state().await;
        let guid = unique_guid();
        let query = submit(&state, &guid, "SELECT 1 AS __dwh_seq__", vec!["table".to_string()]).await;

        execute_query_task(state.clone(), query.id).await.unwrap();

        let conn = state.get_db_connection().await.unwrap();
        let failed = queries::get_by_guid(&*conn, &guid).await.unwrap().unwrap();
        assert_eq!(failed.status, QueryStatus::Error);
        assert!(failed.error_description.unwrap().contains("reserved"));
        assert_eq!(failed.destinations[0].status, QueryDestinationStatus::Error);
    }

    #[tokio::test]
    async fn test_unknown_destination_is_skipped() {
        if !operational_db_enabled() {
            return;
        }
        let state = setup_state().await;
        let guid = unique_guid();
        let query = submit(
            &state,
            &guid,
            "SELECT 1 AS n",
            vec!["table".to_string(), "s3".to_string()],
        )
        .await;

        execute_query_task(state.clone(), query.id).await.unwrap();

        let conn = state.get_db_connection().await.unwrap();
        let done = queries::get_by_guid(&*conn, &guid).await.unwrap().unwrap();
        // Declared destinations of unknown type do not fail the run.
        assert_eq!(done.status, QueryStatus::Done);
        assert_eq!(done.destinations[0].status, QueryDestinationStatus::Uploaded);
        assert_eq!(done.destinations[1].status, QueryDestinationStatus::Declared);

        crate::materialize::table::delete_query_execs(&[done.destinations[0].path.clone().unwrap()])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_terminate_rejects_runs_that_are_not_running() {
        if !operational_db_enabled() {
            return;
        }
        let state = setup_state().await;
        let guid = unique_guid();
        submit(&state, &guid, "SELECT 1", vec!["table".to_string()]).await;

        // Still in the created state.
        let error = cancel_query(&state, &guid).await.unwrap_err();
        assert!(error.to_string().contains("not in the running state"));

        // Unknown guid.
        let error = cancel_query(&state, &unique_guid()).await.unwrap_err();
        assert!(error.to_string().contains("does not exist"));
    }
}
