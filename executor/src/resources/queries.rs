use crate::models::{QueryDestination, QueryDestinationStatus, QueryExecution, QueryStatus};
use crate::{crypto, err_conflict, err_internal, Result};
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, GenericClient, Row, Transaction};

/// A submission about to be inserted; `source_conn` is already encrypted.
pub struct NewQueryExecution {
    pub guid: String,
    pub query: String,
    pub source_conn: String,
    pub identity_id: String,
    pub result_destinations: Vec<String>,
}

/// Insert a new run with its declared destinations.
pub async fn create(client: &mut Client, new: NewQueryExecution) -> Result<QueryExecution> {
    let tx = client.transaction().await?;
    let row = tx
        .query_one(
            r#"INSERT INTO queries (guid, query, source_conn, identity_id)
                    VALUES ($1, $2, $3, $4)
                 RETURNING id, guid, query, source_conn, identity_id, status, error_description,
                           created_at, updated_at"#,
            &[&new.guid, &new.query, &new.source_conn, &new.identity_id],
        )
        .await?;
    let mut query = map_query_row(&row)?;
    for dest_type in &new.result_destinations {
        let row = tx
            .query_one(
                r#"INSERT INTO results (query_id, dest_type)
                        VALUES ($1, $2)
                     RETURNING id, query_id, dest_type, status, path, access_creds, error_description,
                               finished_at"#,
                &[&query.id, dest_type],
            )
            .await?;
        query.destinations.push(map_destination_row(&row)?);
    }
    tx.commit().await?;
    Ok(query)
}

/// Load a run by primary key, destinations included in insertion order.
pub async fn get<C: GenericClient>(client: &C, id: i64) -> Result<Option<QueryExecution>> {
    let Some(row) = client
        .query_opt(
            r#"SELECT id, guid, query, source_conn, identity_id, status, error_description,
                      created_at, updated_at
                 FROM queries WHERE id = $1"#,
            &[&id],
        )
        .await?
    else {
        return Ok(None);
    };
    let mut query = map_query_row(&row)?;
    query.destinations = get_destinations(client, query.id).await?;
    Ok(Some(query))
}

/// Load a run by its externally meaningful guid.
pub async fn get_by_guid<C: GenericClient>(client: &C, guid: &str) -> Result<Option<QueryExecution>> {
    let Some(row) = client
        .query_opt(
            r#"SELECT id, guid, query, source_conn, identity_id, status, error_description,
                      created_at, updated_at
                 FROM queries WHERE guid = $1"#,
            &[&guid],
        )
        .await?
    else {
        return Ok(None);
    };
    let mut query = map_query_row(&row)?;
    query.destinations = get_destinations(client, query.id).await?;
    Ok(Some(query))
}

async fn get_destinations<C: GenericClient>(client: &C, query_id: i64) -> Result<Vec<QueryDestination>> {
    let rows = client
        .query(
            r#"SELECT id, query_id, dest_type, status, path, access_creds, error_description, finished_at
                 FROM results WHERE query_id = $1 ORDER BY id"#,
            &[&query_id],
        )
        .await?;
    rows.iter().map(map_destination_row).collect()
}

/// Move a freshly accepted run to `running`.
///
/// # Returns
/// Whether the transition happened; `false` means the row was no longer in
/// the `created` state.
pub async fn set_running<C: GenericClient>(client: &C, id: i64) -> Result<bool> {
    let updated = client
        .execute(
            "UPDATE queries SET status = $2, updated_at = now() WHERE id = $1 AND status = $3",
            &[&id, &QueryStatus::Running.as_str(), &QueryStatus::Created.as_str()],
        )
        .await?;
    Ok(updated > 0)
}

/// Move a running run to its terminal status.
///
/// The write is guarded on the `running` state so a terminal status is
/// reached exactly once: when a concurrent cancellation got there first, the
/// update is dropped and `false` is returned.
pub async fn set_terminal<C: GenericClient>(
    client: &C,
    id: i64,
    status: QueryStatus,
    error_description: Option<&str>,
) -> Result<bool> {
    let updated = client
        .execute(
            r#"UPDATE queries SET status = $2, error_description = $3, updated_at = now()
                WHERE id = $1 AND status = $4"#,
            &[&id, &status.as_str(), &error_description, &QueryStatus::Running.as_str()],
        )
        .await?;
    Ok(updated > 0)
}

/// Read the status of a run under `FOR UPDATE`.
///
/// This is the serialization point between the lifecycle engine and the
/// cancellation protocol: whoever commits first wins, the other side observes
/// the committed status here.
pub async fn lock_status(tx: &Transaction<'_>, id: i64) -> Result<QueryStatus> {
    let row = tx.query_one("SELECT status FROM queries WHERE id = $1 FOR UPDATE", &[&id]).await?;
    status_from_row(&row, "status")
}

/// Flip a locked run to `cancelled`; must run on the transaction holding the
/// row lock taken by [lock_status].
pub async fn set_cancelled(tx: &Transaction<'_>, id: i64) -> Result<()> {
    tx.execute(
        "UPDATE queries SET status = $2, updated_at = now() WHERE id = $1",
        &[&id, &QueryStatus::Cancelled.as_str()],
    )
    .await?;
    Ok(())
}

pub async fn mark_destination_uploaded<C: GenericClient>(
    client: &C,
    dest_id: i64,
    path: &str,
    access_creds: &str,
) -> Result<()> {
    client
        .execute(
            r#"UPDATE results SET status = $2, path = $3, access_creds = $4, finished_at = now()
                WHERE id = $1"#,
            &[&dest_id, &QueryDestinationStatus::Uploaded.as_str(), &path, &access_creds],
        )
        .await?;
    Ok(())
}

pub async fn mark_destination_error<C: GenericClient>(client: &C, dest_id: i64, description: &str) -> Result<()> {
    client
        .execute(
            "UPDATE results SET status = $2, error_description = $3, finished_at = now() WHERE id = $1",
            &[&dest_id, &QueryDestinationStatus::Error.as_str(), &description],
        )
        .await?;
    Ok(())
}

/// Flip destinations to `deleted` after their result tables were dropped.
pub async fn mark_destinations_deleted<C: GenericClient>(client: &C, dest_ids: &[i64]) -> Result<()> {
    if dest_ids.is_empty() {
        return Ok(());
    }
    client
        .execute(
            "UPDATE results SET status = $2, finished_at = now() WHERE id = ANY($1)",
            &[&dest_ids, &QueryDestinationStatus::Deleted.as_str()],
        )
        .await?;
    Ok(())
}

/// Re-encrypt every stored connection string that still opens with `old_key`.
///
/// All rows are taken under `FOR UPDATE NOWAIT`: a concurrent rotation (or a
/// long-lived row lock) fails the request instead of deadlocking it. Rows the
/// old key does not decrypt are left untouched, which makes the rotation
/// idempotent.
pub async fn rotate_encryption_key(client: &mut Client, old_key: &str, current_key: &str) -> Result<usize> {
    let tx = client.transaction().await?;
    let rows = tx.query("SELECT id, source_conn FROM queries FOR UPDATE NOWAIT", &[]).await.map_err(|e| {
        if e.code() == Some(&SqlState::LOCK_NOT_AVAILABLE) {
            err_conflict!("The query records are locked by another operation.")
        } else {
            anyhow::Error::from(e)
        }
    })?;

    let mut rotated = 0;
    for row in &rows {
        let id: i64 = row.get("id");
        let stored: String = row.get("source_conn");
        if let Some(plaintext) = crypto::decrypt(old_key, &stored) {
            let reencrypted = crypto::encrypt(current_key, &plaintext)?;
            tx.execute("UPDATE queries SET source_conn = $1, updated_at = now() WHERE id = $2", &[&reencrypted, &id])
                .await?;
            rotated += 1;
        }
    }
    tx.commit().await?;
    Ok(rotated)
}

fn status_from_row(row: &Row, column: &str) -> Result<QueryStatus> {
    QueryStatus::try_from(row.try_get::<_, String>(column)?.as_str()).map_err(|e| err_internal!("{}", e))
}

fn map_query_row(row: &Row) -> Result<QueryExecution> {
    Ok(QueryExecution {
        id: row.try_get("id")?,
        guid: row.try_get("guid")?,
        query: row.try_get("query")?,
        source_conn: row.try_get("source_conn")?,
        identity_id: row.try_get::<_, Option<String>>("identity_id")?.unwrap_or_default(),
        status: status_from_row(row, "status")?,
        error_description: row.try_get("error_description")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        destinations: Vec::new(),
    })
}

fn map_destination_row(row: &Row) -> Result<QueryDestination> {
    Ok(QueryDestination {
        id: row.try_get("id")?,
        query_id: row.try_get("query_id")?,
        dest_type: row.try_get("dest_type")?,
        status: QueryDestinationStatus::try_from(row.try_get::<_, String>("status")?.as_str())
            .map_err(|e| -> anyhow::Error { err_internal!("{}", e) })?,
        path: row.try_get("path")?,
        access_creds: row.try_get("access_creds")?,
        error_description: row.try_get("error_description")?,
        finished_at: row.try_get("finished_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::utils::tests::{operational_db_enabled, operational_db_url, unique_guid};

    async fn setup() -> Client {
        let client = db::connect(&operational_db_url()).await.unwrap();
        client.batch_execute(include_str!("../../assets/setup.sql")).await.unwrap();
        client
    }

    fn new_query(guid: &str) -> NewQueryExecution {
        NewQueryExecution {
            guid: guid.to_string(),
            query: "SELECT 1 AS n".to_string(),
            source_conn: "encrypted-blob".to_string(),
            identity_id: "u1".to_string(),
            result_destinations: vec!["table".to_string()],
        }
    }

    #[tokio::test]
    async fn test_create_get_and_transitions() {
        if !operational_db_enabled() {
            return;
        }
        let mut client = setup().await;
        let guid = unique_guid();

        let query = create(&mut client, new_query(&guid)).await.unwrap();
        assert_eq!(query.status, QueryStatus::Created);
        assert_eq!(query.destinations.len(), 1);
        assert_eq!(query.destinations[0].status, QueryDestinationStatus::Declared);

        let loaded = get_by_guid(&client, &guid).await.unwrap().unwrap();
        assert_eq!(loaded.id, query.id);
        assert_eq!(loaded.destinations.len(), 1);

        // created -> running, only once
        assert!(set_running(&client, query.id).await.unwrap());
        assert!(!set_running(&client, query.id).await.unwrap());

        // running -> done, only once
        assert!(set_terminal(&client, query.id, QueryStatus::Done, None).await.unwrap());
        assert!(!set_terminal(&client, query.id, QueryStatus::Error, Some("late")).await.unwrap());
        let loaded = get(&client, query.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, QueryStatus::Done);
        assert_eq!(loaded.error_description, None);
    }

    #[tokio::test]
    async fn test_cancellation_takes_the_row_lock() {
        if !operational_db_enabled() {
            return;
        }
        let mut client = setup().await;
        let query = create(&mut client, new_query(&unique_guid())).await.unwrap();
        assert!(set_running(&client, query.id).await.unwrap());

        let tx = client.transaction().await.unwrap();
        assert_eq!(lock_status(&tx, query.id).await.unwrap(), QueryStatus::Running);
        set_cancelled(&tx, query.id).await.unwrap();
        tx.commit().await.unwrap();

        // The engine's terminal write is dropped once the row is cancelled.
        assert!(!set_terminal(&client, query.id, QueryStatus::Error, Some("Cancelled")).await.unwrap());
        let loaded = get(&client, query.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, QueryStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_rotate_encryption_key_mixed_keys() {
        if !operational_db_enabled() {
            return;
        }
        const KEY_A: &str = "154de72125d4c917bd0764f09bc6af6265b28cd11da2efb659151ac02c7ca0d3";
        const KEY_B: &str = "99990203040506070809aabbccddeeff101112131415161718191a1b1c1d1e1f";

        let mut client = setup().await;
        let mut with_key_a = Vec::new();
        let mut with_key_b = Vec::new();
        for _ in 0..3 {
            let mut query = new_query(&unique_guid());
            query.source_conn = crypto::encrypt(KEY_A, "postgresql://a").unwrap();
            with_key_a.push(create(&mut client, query).await.unwrap().id);
        }
        for _ in 0..2 {
            let mut query = new_query(&unique_guid());
            query.source_conn = crypto::encrypt(KEY_B, "postgresql://b").unwrap();
            with_key_b.push(create(&mut client, query).await.unwrap().id);
        }

        let rotated = rotate_encryption_key(&mut client, KEY_A, KEY_B).await.unwrap();
        assert!(rotated >= 3);
        for id in &with_key_a {
            let query = get(&client, *id).await.unwrap().unwrap();
            assert_eq!(crypto::decrypt(KEY_B, &query.source_conn).as_deref(), Some("postgresql://a"));
        }
        for id in &with_key_b {
            let query = get(&client, *id).await.unwrap().unwrap();
            assert_eq!(crypto::decrypt(KEY_B, &query.source_conn).as_deref(), Some("postgresql://b"));
        }

        // Rotating again with the new key as the old key touches the same
        // rows but leaves their plaintext unchanged.
        let snapshot_b: Vec<String> = {
            let mut snapshot = Vec::new();
            for id in &with_key_b {
                snapshot.push(get(&client, *id).await.unwrap().unwrap().source_conn);
            }
            snapshot
        };
        rotate_encryption_key(&mut client, KEY_A, KEY_B).await.unwrap();
        for (id, previous) in with_key_b.iter().zip(snapshot_b) {
            let query = get(&client, *id).await.unwrap().unwrap();
            assert_eq!(crypto::decrypt(KEY_B, &query.source_conn).as_deref(), Some("postgresql://b"));
            // Key A no longer decrypts anything, so the second pass is a no-op.
            assert_eq!(query.source_conn, previous);
        }
    }
}
