// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A CVR store whose data is stored in a Postgres database.
//!
//! The table layout is not specified and should not be relied upon; the only
//! promise is stability across minor versions. Per-group serializability
//! comes from `SELECT ... FOR UPDATE` on the instance row plus the version
//! compare-and-swap, under serializable isolation.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio_postgres::{Client, NoTls, Statement, Transaction};
use tracing::warn;

use vp_base::retry::Retry;
use vp_repr::{ClientGroupId, CvrVersion, QueryHash, RowId, RowVersion, StateVersion};

use crate::memory::{config_patches_in_range, solely_referenced_by};
use crate::store::{CvrStore, StagedWrite};
use crate::{
    ClientRecord, CvrError, CvrSnapshot, QueryRecord, RowRecord, VersionedConfigPatch,
    CURSOR_PAGE_SIZE,
};

const SCHEMA: &str = "
CREATE TABLE cvr_instances (
    client_group_id text PRIMARY KEY,
    version text NOT NULL,
    last_active bigint NOT NULL,
    replica_version text
);

CREATE TABLE cvr_clients (
    client_group_id text NOT NULL,
    client_id text NOT NULL,
    patch_version text NOT NULL,
    desired_query_ids jsonb NOT NULL,
    deleted boolean NOT NULL DEFAULT false,
    PRIMARY KEY (client_group_id, client_id)
);

CREATE TABLE cvr_queries (
    client_group_id text NOT NULL,
    query_hash text NOT NULL,
    query_spec jsonb NOT NULL,
    internal boolean NOT NULL DEFAULT false,
    desired_by jsonb NOT NULL,
    transformation_hash text,
    transformation_version text,
    patch_version text,
    deleted boolean NOT NULL DEFAULT false,
    PRIMARY KEY (client_group_id, query_hash)
);

-- row_key_text is the canonical text of row_key; jsonb comparison semantics
-- are not byte order, and catch-up ordering must be.
CREATE TABLE cvr_rows (
    client_group_id text NOT NULL,
    schema_name text NOT NULL,
    table_name text NOT NULL,
    row_key jsonb NOT NULL,
    row_key_text text NOT NULL,
    row_version text NOT NULL,
    patch_version text NOT NULL,
    ref_counts jsonb,
    PRIMARY KEY (client_group_id, schema_name, table_name, row_key_text)
);

CREATE INDEX cvr_rows_patch_version_idx
    ON cvr_rows (client_group_id, patch_version, schema_name, table_name, row_key_text);
";

struct PreparedStatements {
    select_instance: Statement,
    select_clients: Statement,
    select_queries: Statement,
    select_rows: Statement,
    rows_first_page: Statement,
    rows_next_page: Statement,
    select_version_for_update: Statement,
    upsert_instance: Statement,
    upsert_client: Statement,
    upsert_query: Statement,
    upsert_row: Statement,
}

struct Inner {
    client: Option<Client>,
    statements: Option<PreparedStatements>,
}

/// A [`CvrStore`] backed by Postgres.
pub struct PostgresCvrStore {
    url: String,
    inner: tokio::sync::Mutex<Inner>,
}

impl std::fmt::Debug for PostgresCvrStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresCvrStore")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl PostgresCvrStore {
    /// Opens the CVR store at `url`, creating the schema on first use.
    pub async fn new(url: String) -> Result<PostgresCvrStore, CvrError> {
        let store = PostgresCvrStore {
            url,
            inner: tokio::sync::Mutex::new(Inner {
                client: None,
                statements: None,
            }),
        };
        // Connect eagerly so a bad url fails here instead of inside the
        // retry loop of the first transaction.
        let mut inner = store.inner.lock().await;
        Self::connect(&store.url, &mut inner).await?;
        drop(inner);
        Ok(store)
    }

    /// Sets `inner.client` to a new connection to the Postgres server.
    async fn connect(url: &str, inner: &mut Inner) -> Result<(), CvrError> {
        let (client, connection) = tokio_postgres::connect(url, NoTls).await?;
        vp_base::task::spawn(|| "tokio-postgres cvr connection", async move {
            if let Err(e) = connection.await {
                tracing::error!("postgres cvr connection error: {}", e);
            }
        });
        client
            .batch_execute("SET default_transaction_isolation = serializable")
            .await?;

        let schema_exists: bool = client
            .query_one(
                r#"
            SELECT EXISTS (
                SELECT 1 FROM pg_tables
                WHERE schemaname = current_schema() AND tablename = 'cvr_instances'
            )"#,
                &[],
            )
            .await?
            .get(0);
        if !schema_exists {
            client.batch_execute(SCHEMA).await?;
        }

        let select_instance = client
            .prepare(
                "SELECT version, last_active, replica_version FROM cvr_instances
                 WHERE client_group_id = $1",
            )
            .await?;
        let select_clients = client
            .prepare(
                "SELECT client_id, patch_version, desired_query_ids, deleted FROM cvr_clients
                 WHERE client_group_id = $1",
            )
            .await?;
        let select_queries = client
            .prepare(
                "SELECT query_hash, query_spec, internal, desired_by, transformation_hash,
                        transformation_version, patch_version, deleted
                 FROM cvr_queries WHERE client_group_id = $1",
            )
            .await?;
        let select_rows = client
            .prepare(
                "SELECT schema_name, table_name, row_key, row_version, patch_version, ref_counts
                 FROM cvr_rows WHERE client_group_id = $1",
            )
            .await?;
        let rows_first_page = client
            .prepare(
                "SELECT schema_name, table_name, row_key, row_version, patch_version, ref_counts
                 FROM cvr_rows
                 WHERE client_group_id = $1 AND patch_version > $2 AND patch_version <= $3
                 ORDER BY patch_version, schema_name, table_name, row_key_text
                 LIMIT $4",
            )
            .await?;
        let rows_next_page = client
            .prepare(
                "SELECT schema_name, table_name, row_key, row_version, patch_version, ref_counts
                 FROM cvr_rows
                 WHERE client_group_id = $1 AND patch_version <= $2
                   AND (patch_version, schema_name, table_name, row_key_text) > ($3, $4, $5, $6)
                 ORDER BY patch_version, schema_name, table_name, row_key_text
                 LIMIT $7",
            )
            .await?;
        let select_version_for_update = client
            .prepare("SELECT version FROM cvr_instances WHERE client_group_id = $1 FOR UPDATE")
            .await?;
        let upsert_instance = client
            .prepare(
                "INSERT INTO cvr_instances (client_group_id, version, last_active, replica_version)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (client_group_id) DO UPDATE
                 SET version = $2, last_active = $3, replica_version = $4",
            )
            .await?;
        let upsert_client = client
            .prepare(
                "INSERT INTO cvr_clients
                     (client_group_id, client_id, patch_version, desired_query_ids, deleted)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (client_group_id, client_id) DO UPDATE
                 SET patch_version = $3, desired_query_ids = $4, deleted = $5",
            )
            .await?;
        let upsert_query = client
            .prepare(
                "INSERT INTO cvr_queries
                     (client_group_id, query_hash, query_spec, internal, desired_by,
                      transformation_hash, transformation_version, patch_version, deleted)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                 ON CONFLICT (client_group_id, query_hash) DO UPDATE
                 SET query_spec = $3, internal = $4, desired_by = $5,
                     transformation_hash = $6, transformation_version = $7,
                     patch_version = $8, deleted = $9",
            )
            .await?;
        let upsert_row = client
            .prepare(
                "INSERT INTO cvr_rows
                     (client_group_id, schema_name, table_name, row_key, row_key_text,
                      row_version, patch_version, ref_counts)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT (client_group_id, schema_name, table_name, row_key_text) DO UPDATE
                 SET row_key = $4, row_version = $6, patch_version = $7, ref_counts = $8",
            )
            .await?;

        inner.client = Some(client);
        inner.statements = Some(PreparedStatements {
            select_instance,
            select_clients,
            select_queries,
            select_rows,
            rows_first_page,
            rows_next_page,
            select_version_for_update,
            upsert_instance,
            upsert_client,
            upsert_query,
            upsert_row,
        });
        Ok(())
    }

    /// Runs `f` in a transaction, retrying with backoff on connection
    /// errors. `f` may be called multiple times, so it must only operate on
    /// its transaction argument.
    #[tracing::instrument(level = "debug", skip_all)]
    async fn transact<F, T>(&self, f: F) -> Result<T, CvrError>
    where
        F: for<'a> Fn(
            &'a PreparedStatements,
            &'a Transaction<'a>,
        ) -> BoxFuture<'a, Result<T, CvrError>>,
    {
        let retry = Retry::default()
            .clamp_backoff(Duration::from_secs(1))
            .max_tries(5)
            .into_retry_stream();
        let mut retry = Box::pin(retry);
        loop {
            match self.transact_inner(&f).await {
                Ok(t) => return Ok(t),
                Err(CvrError::Postgres(pgerr)) => {
                    let mut inner = self.inner.lock().await;
                    inner.client = None;
                    drop(inner);
                    match retry.next().await {
                        Some(state) => {
                            warn!("postgres cvr error, retry attempt {}: {pgerr}", state.i);
                        }
                        None => return Err(CvrError::Postgres(pgerr)),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn transact_inner<F, T>(&self, f: &F) -> Result<T, CvrError>
    where
        F: for<'a> Fn(
            &'a PreparedStatements,
            &'a Transaction<'a>,
        ) -> BoxFuture<'a, Result<T, CvrError>>,
    {
        let mut inner = self.inner.lock().await;
        let reconnect = match &inner.client {
            Some(client) => client.is_closed(),
            None => true,
        };
        if reconnect {
            Self::connect(&self.url, &mut inner).await?;
        }
        let Inner { client, statements } = &mut *inner;
        let client = client.as_mut().expect("connected above");
        let stmts = statements.as_ref().expect("connected above");
        let tx = client.transaction().await?;
        let res = f(stmts, &tx).await?;
        tx.commit().await?;
        Ok(res)
    }

    /// Fetches one page of row patch records for a catch-up scan.
    async fn row_page(
        &self,
        group: &ClientGroupId,
        from: &CvrVersion,
        to: &CvrVersion,
        cursor: Option<&(String, RowId)>,
        limit: i64,
    ) -> Result<Vec<RowRecord>, CvrError> {
        let group = group.clone();
        let from = from.to_cookie();
        let to = to.to_cookie();
        let cursor = cursor.cloned();
        self.transact(move |stmts, tx| {
            let group = group.clone();
            let from = from.clone();
            let to = to.clone();
            let cursor = cursor.clone();
            Box::pin(async move {
                let rows = match &cursor {
                    None => {
                        tx.query(&stmts.rows_first_page, &[&group, &from, &to, &limit])
                            .await?
                    }
                    Some((patch_version, id)) => {
                        tx.query(
                            &stmts.rows_next_page,
                            &[
                                &group,
                                &to,
                                patch_version,
                                &id.schema,
                                &id.table,
                                &id.key_text(),
                                &limit,
                            ],
                        )
                        .await?
                    }
                };
                rows.iter().map(decode_row_record).collect()
            })
        })
        .await
    }
}

#[async_trait]
impl CvrStore for PostgresCvrStore {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn load(&self, group: &ClientGroupId) -> Result<CvrSnapshot, CvrError> {
        let group = group.clone();
        self.transact(move |stmts, tx| {
            let group = group.clone();
            Box::pin(async move {
                let Some(instance) = tx.query_opt(&stmts.select_instance, &[&group]).await? else {
                    return Ok(CvrSnapshot::empty(group));
                };
                let version = cookie_version(instance.get("version"))?;
                let last_active = u64::try_from(instance.get::<_, i64>("last_active"))
                    .map_err(|_| CvrError::Corruption("negative last_active".into()))?;
                let replica_version = instance
                    .get::<_, Option<String>>("replica_version")
                    .map(|v| state_version(&v))
                    .transpose()?;

                let mut clients = BTreeMap::new();
                for row in tx.query(&stmts.select_clients, &[&group]).await? {
                    let (record, deleted) = decode_client_record(&row)?;
                    if !deleted {
                        clients.insert(record.id.clone(), record);
                    }
                }
                let mut queries = BTreeMap::new();
                for row in tx.query(&stmts.select_queries, &[&group]).await? {
                    let (record, deleted) = decode_query_record(&row)?;
                    if !deleted {
                        queries.insert(record.id.clone(), record);
                    }
                }
                let mut rows = BTreeMap::new();
                for row in tx.query(&stmts.select_rows, &[&group]).await? {
                    let record = decode_row_record(&row)?;
                    rows.insert(record.id.clone(), record);
                }

                Ok(CvrSnapshot {
                    id: group,
                    version,
                    last_active,
                    replica_version,
                    clients,
                    queries,
                    rows,
                })
            })
        })
        .await
    }

    fn catchup_row_patches<'a>(
        &'a self,
        group: &'a ClientGroupId,
        from: &'a CvrVersion,
        to: &'a CvrVersion,
        exclude_queries: &'a BTreeSet<QueryHash>,
    ) -> BoxStream<'a, Result<RowRecord, CvrError>> {
        let stream = try_stream! {
            let mut cursor: Option<(String, RowId)> = None;
            loop {
                let page = self
                    .row_page(group, from, to, cursor.as_ref(), CURSOR_PAGE_SIZE as i64)
                    .await?;
                let full = page.len() == CURSOR_PAGE_SIZE;
                if let Some(last) = page.last() {
                    cursor = Some((last.patch_version.to_cookie(), last.id.clone()));
                }
                for record in page {
                    if !solely_referenced_by(&record, exclude_queries) {
                        yield record;
                    }
                }
                if !full {
                    break;
                }
            }
        };
        stream.boxed()
    }

    async fn catchup_config_patches(
        &self,
        group: &ClientGroupId,
        from: &CvrVersion,
        to: &CvrVersion,
    ) -> Result<Vec<VersionedConfigPatch>, CvrError> {
        let group = group.clone();
        let (clients, queries) = self
            .transact(move |stmts, tx| {
                let group = group.clone();
                Box::pin(async move {
                    let clients = tx
                        .query(&stmts.select_clients, &[&group])
                        .await?
                        .iter()
                        .map(decode_client_record)
                        .collect::<Result<Vec<_>, _>>()?;
                    let queries = tx
                        .query(&stmts.select_queries, &[&group])
                        .await?
                        .iter()
                        .map(decode_query_record)
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok((clients, queries))
                })
            })
            .await?;
        Ok(config_patches_in_range(
            clients.iter(),
            queries.iter(),
            from,
            to,
        ))
    }

    #[tracing::instrument(level = "debug", skip_all, fields(group = %snapshot.id))]
    async fn flush(
        &self,
        expected_version: &CvrVersion,
        snapshot: &CvrSnapshot,
        writes: &[StagedWrite],
    ) -> Result<(), CvrError> {
        let expected = expected_version.clone();
        let group = snapshot.id.clone();
        let version = snapshot.version.to_cookie();
        let last_active = i64::try_from(snapshot.last_active)
            .map_err(|_| CvrError::Internal("last_active out of range".into()))?;
        let replica_version = snapshot.replica_version.as_ref().map(|v| v.to_string());
        let writes = writes.to_vec();
        self.transact(move |stmts, tx| {
            let expected = expected.clone();
            let group = group.clone();
            let version = version.clone();
            let replica_version = replica_version.clone();
            let writes = writes.clone();
            Box::pin(async move {
                let stored = tx
                    .query_opt(&stmts.select_version_for_update, &[&group])
                    .await?;
                let actual = match stored {
                    Some(row) => cookie_version(row.get("version"))?,
                    None => CvrVersion::min(),
                };
                if actual != expected {
                    return Err(CvrError::ConcurrentModification {
                        group,
                        expected,
                        actual,
                    });
                }
                tx.execute(
                    &stmts.upsert_instance,
                    &[&group, &version, &last_active, &replica_version],
                )
                .await?;
                for write in &writes {
                    match write {
                        StagedWrite::Client { record, deleted } => {
                            tx.execute(
                                &stmts.upsert_client,
                                &[
                                    &group,
                                    &record.id,
                                    &record.patch_version.to_cookie(),
                                    &serde_json::to_value(&record.desired_query_ids)
                                        .expect("string lists are serializable"),
                                    deleted,
                                ],
                            )
                            .await?;
                        }
                        StagedWrite::Query { record, deleted } => {
                            tx.execute(
                                &stmts.upsert_query,
                                &[
                                    &group,
                                    &record.id,
                                    &serde_json::to_value(&record.spec)
                                        .expect("query specs are serializable"),
                                    &record.internal,
                                    &serde_json::to_value(&record.desired_by)
                                        .expect("desire maps are serializable"),
                                    &record.transformation_hash,
                                    &record
                                        .transformation_version
                                        .as_ref()
                                        .map(|v| v.to_cookie()),
                                    &record.patch_version.as_ref().map(|v| v.to_cookie()),
                                    deleted,
                                ],
                            )
                            .await?;
                        }
                        StagedWrite::Row(record) => {
                            tx.execute(
                                &stmts.upsert_row,
                                &[
                                    &group,
                                    &record.id.schema,
                                    &record.id.table,
                                    &record.id.key,
                                    &record.id.key_text(),
                                    &record.row_version.as_str(),
                                    &record.patch_version.to_cookie(),
                                    &record
                                        .ref_counts
                                        .as_ref()
                                        .map(|rc| {
                                            serde_json::to_value(rc)
                                                .expect("refcount maps are serializable")
                                        }),
                                ],
                            )
                            .await?;
                        }
                    }
                }
                Ok(())
            })
        })
        .await
    }
}

fn cookie_version(cookie: &str) -> Result<CvrVersion, CvrError> {
    CvrVersion::from_cookie(cookie).map_err(|e| CvrError::Corruption(e.to_string()))
}

fn state_version(token: &str) -> Result<StateVersion, CvrError> {
    StateVersion::parse(token).map_err(|e| CvrError::Corruption(e.to_string()))
}

fn decode_client_record(row: &tokio_postgres::Row) -> Result<(ClientRecord, bool), CvrError> {
    let desired_query_ids: serde_json::Value = row.get("desired_query_ids");
    Ok((
        ClientRecord {
            id: row.get("client_id"),
            patch_version: cookie_version(row.get("patch_version"))?,
            desired_query_ids: serde_json::from_value(desired_query_ids)
                .map_err(|e| CvrError::Corruption(e.to_string()))?,
        },
        row.get("deleted"),
    ))
}

fn decode_query_record(row: &tokio_postgres::Row) -> Result<(QueryRecord, bool), CvrError> {
    let spec: serde_json::Value = row.get("query_spec");
    let desired_by: serde_json::Value = row.get("desired_by");
    Ok((
        QueryRecord {
            id: row.get("query_hash"),
            spec: serde_json::from_value(spec).map_err(|e| CvrError::Corruption(e.to_string()))?,
            internal: row.get("internal"),
            desired_by: serde_json::from_value(desired_by)
                .map_err(|e| CvrError::Corruption(e.to_string()))?,
            transformation_hash: row.get("transformation_hash"),
            transformation_version: row
                .get::<_, Option<String>>("transformation_version")
                .map(|v| cookie_version(&v))
                .transpose()?,
            patch_version: row
                .get::<_, Option<String>>("patch_version")
                .map(|v| cookie_version(&v))
                .transpose()?,
        },
        row.get("deleted"),
    ))
}

fn decode_row_record(row: &tokio_postgres::Row) -> Result<RowRecord, CvrError> {
    let ref_counts = row
        .get::<_, Option<serde_json::Value>>("ref_counts")
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| CvrError::Corruption(e.to_string()))?;
    let row_version: String = row.get("row_version");
    Ok(RowRecord {
        id: RowId::new(
            row.get::<_, String>("schema_name"),
            row.get::<_, String>("table_name"),
            row.get("row_key"),
        ),
        patch_version: cookie_version(row.get("patch_version"))?,
        row_version: RowVersion::new(row_version)?,
        ref_counts,
    })
}
