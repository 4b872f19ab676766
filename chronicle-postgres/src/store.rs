use std::collections::VecDeque;
use std::fmt::Write as _;

use async_trait::async_trait;
use bb8::Pool;
use bb8_postgres::PostgresConnectionManager;
use sha2::{Digest, Sha256};
use tokio_postgres::{GenericClient, NoTls, Row};
use tokio_util::sync::CancellationToken;

use chronicle::error::{metadata_keys, IteratorError, StoreError};
use chronicle::event::PersistedEvent;
use chronicle::iterator::{EventIterator, IteratorState};
use chronicle::matcher::{Condition, Matcher};
use chronicle::message::{Envelope, Metadata, Payload};
use chronicle::store::EventStore;

/// Number of rows a [`PgIterator`] fetches per round trip.
const DEFAULT_BATCH_SIZE: i64 = 256;

const STREAM_TABLE_DDL: &str = r#"CREATE TABLE IF NOT EXISTS "{table}" (
    no                BIGSERIAL PRIMARY KEY,
    event_id          TEXT NOT NULL,
    event_name        VARCHAR(100) NOT NULL,
    payload           JSONB NOT NULL,
    metadata          JSONB NOT NULL,
    created_at        TIMESTAMPTZ(6) NOT NULL,
    aggregate_version BIGINT,
    aggregate_id      TEXT,
    UNIQUE (event_id),
    UNIQUE (aggregate_id, aggregate_version)
)"#;

/// Errors raised by the Postgres-backed store, translated at the call site
/// into [`StoreError`] where the public contract requires a specific kind
/// (`StreamAlreadyExists`, `VersionConflict`, ...).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("postgres client returned an error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("connection pool returned an error: {0}")]
    Pool(#[from] bb8::RunError<tokio_postgres::Error>),

    #[error("failed to encode event payload or metadata: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode event payload or metadata: {0}")]
    Decode(#[source] anyhow::Error),
}

impl From<Error> for StoreError {
    fn from(err: Error) -> Self {
        StoreError::Internal(err.into())
    }
}

fn physical_table_name(stream_name: &str) -> String {
    let digest = Sha256::digest(stream_name.as_bytes());
    let mut hex = String::with_capacity(digest.len() * 2 + 1);
    hex.push('_');
    for byte in digest {
        write!(hex, "{byte:02X}").expect("writing to a String never fails");
    }
    hex
}

fn is_unique_violation(error: &tokio_postgres::Error) -> bool {
    error.code() == Some(&tokio_postgres::error::SqlState::UNIQUE_VIOLATION)
}

fn metadata_from_json(value: serde_json::Value) -> Result<Metadata, Error> {
    serde_json::from_value(value).map_err(|e| Error::Decode(e.into()))
}

/// PostgreSQL-backed [`EventStore`]: a registry table mapping real stream
/// names to hash-derived physical tables, each created dynamically on
/// [`EventStore::create`].
#[derive(Clone)]
pub struct PgEventStore {
    pool: Pool<PostgresConnectionManager<NoTls>>,
    batch_size: i64,
}

impl PgEventStore {
    /// Wraps an already-migrated connection pool (see [`crate::migrate`]).
    pub fn new(pool: Pool<PostgresConnectionManager<NoTls>>) -> Self {
        PgEventStore {
            pool,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    async fn lookup_table(
        &self,
        token: &CancellationToken,
        stream_name: &str,
    ) -> Result<Option<String>, StoreError> {
        if token.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let conn = self.pool.get().await.map_err(Error::from)?;
        let row = conn
            .query_opt(
                "SELECT stream_name FROM event_streams WHERE real_stream_name = $1",
                &[&stream_name],
            )
            .await
            .map_err(Error::from)?;
        Ok(row.map(|r| r.get::<_, String>(0)))
    }
}

async fn insert_events<C: GenericClient + Sync>(
    client: &C,
    table: &str,
    events: &[Envelope],
) -> Result<(), StoreError> {
    if events.is_empty() {
        return Ok(());
    }

    let mut ids = Vec::with_capacity(events.len());
    let mut names = Vec::with_capacity(events.len());
    let mut payloads = Vec::with_capacity(events.len());
    let mut metadatas = Vec::with_capacity(events.len());
    let mut createds = Vec::with_capacity(events.len());
    let mut agg_versions: Vec<Option<i64>> = Vec::with_capacity(events.len());
    let mut agg_ids: Vec<Option<String>> = Vec::with_capacity(events.len());

    for event in events {
        ids.push(event.id().to_string());
        names.push(event.name().to_string());
        payloads.push(event.data().as_json());
        metadatas.push(
            serde_json::to_value(event.metadata())
                .map_err(|e| StoreError::from(Error::Encode(e)))?,
        );
        createds.push(event.created_at());
        agg_versions.push(
            event
                .metadata()
                .get(metadata_keys::AGGREGATE_VERSION)
                .and_then(|v| v.parse::<i64>().ok()),
        );
        agg_ids.push(event.aggregate_id().map(String::from));
    }

    let query = format!(
        "INSERT INTO \"{table}\" \
         (event_id, event_name, payload, metadata, created_at, aggregate_version, aggregate_id) \
         SELECT * FROM UNNEST($1::text[], $2::text[], $3::jsonb[], $4::jsonb[], $5::timestamptz[], $6::bigint[], $7::text[])"
    );

    match client
        .execute(
            &query,
            &[
                &ids,
                &names,
                &payloads,
                &metadatas,
                &createds,
                &agg_versions,
                &agg_ids,
            ],
        )
        .await
    {
        Ok(_) => Ok(()),
        Err(e) if is_unique_violation(&e) => {
            let (aggregate_id, expected) = agg_ids
                .into_iter()
                .zip(agg_versions)
                .find_map(|(id, v)| id.zip(v))
                .unwrap_or_else(|| ("<unknown>".to_string(), 0));

            let actual = client
                .query_opt(
                    &format!(
                        "SELECT aggregate_version FROM \"{table}\" \
                         WHERE aggregate_id = $1 ORDER BY aggregate_version DESC LIMIT 1"
                    ),
                    &[&aggregate_id],
                )
                .await
                .ok()
                .flatten()
                .and_then(|row| row.get::<_, Option<i64>>(0))
                .unwrap_or(expected);

            #[cfg(feature = "with-tracing")]
            tracing::warn!(
                table,
                aggregate_id = %aggregate_id,
                expected,
                actual,
                "version conflict on append"
            );

            Err(StoreError::VersionConflict {
                aggregate_id,
                expected: expected.max(0) as u64,
                actual: actual.max(0) as u64,
            })
        }
        Err(e) => Err(Error::from(e).into()),
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn create(
        &self,
        token: &CancellationToken,
        stream_name: &str,
        metadata: Metadata,
        initial_events: Vec<Envelope>,
    ) -> Result<(), StoreError> {
        if token.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let table = physical_table_name(stream_name);
        let mut conn = self.pool.get().await.map_err(Error::from)?;
        let txn = conn.transaction().await.map_err(Error::from)?;

        let metadata_json = serde_json::to_value(&metadata).map_err(|e| StoreError::from(Error::Encode(e)))?;
        match txn
            .execute(
                "INSERT INTO event_streams (real_stream_name, stream_name, metadata) VALUES ($1, $2, $3)",
                &[&stream_name, &table, &metadata_json],
            )
            .await
        {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(StoreError::StreamAlreadyExists(stream_name.to_string()))
            }
            Err(e) => return Err(Error::from(e).into()),
        }

        let ddl = STREAM_TABLE_DDL.replace("{table}", &table);
        txn.batch_execute(&ddl).await.map_err(Error::from)?;

        insert_events(&txn, &table, &initial_events).await?;

        txn.commit().await.map_err(Error::from)?;
        #[cfg(feature = "with-tracing")]
        tracing::debug!(stream_name, table, "created stream");
        Ok(())
    }

    async fn append_to(
        &self,
        token: &CancellationToken,
        stream_name: &str,
        events: Vec<Envelope>,
    ) -> Result<(), StoreError> {
        if token.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let table = self
            .lookup_table(token, stream_name)
            .await?
            .ok_or_else(|| StoreError::StreamDoesNotExist(stream_name.to_string()))?;
        let conn = self.pool.get().await.map_err(Error::from)?;
        insert_events(&*conn, &table, &events).await
    }

    async fn delete(&self, token: &CancellationToken, stream_name: &str) -> Result<(), StoreError> {
        if token.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let Some(table) = self.lookup_table(token, stream_name).await? else {
            return Ok(());
        };
        let mut conn = self.pool.get().await.map_err(Error::from)?;
        let txn = conn.transaction().await.map_err(Error::from)?;
        txn.batch_execute(&format!("DROP TABLE IF EXISTS \"{table}\""))
            .await
            .map_err(Error::from)?;
        txn.execute(
            "DELETE FROM event_streams WHERE real_stream_name = $1",
            &[&stream_name],
        )
        .await
        .map_err(Error::from)?;
        txn.commit().await.map_err(Error::from)?;
        Ok(())
    }

    async fn load(
        &self,
        token: &CancellationToken,
        stream_name: &str,
        from: u64,
        count: u64,
        matcher: Matcher,
    ) -> Result<Box<dyn EventIterator>, StoreError> {
        if token.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let table = self
            .lookup_table(token, stream_name)
            .await?
            .ok_or_else(|| StoreError::StreamDoesNotExist(stream_name.to_string()))?;
        Ok(Box::new(PgIterator::forward(
            self.pool.clone(),
            stream_name.to_string(),
            table,
            from,
            count,
            matcher,
            self.batch_size,
        )))
    }

    async fn load_reverse(
        &self,
        token: &CancellationToken,
        stream_name: &str,
        from: u64,
        count: u64,
        matcher: Matcher,
    ) -> Result<Box<dyn EventIterator>, StoreError> {
        if token.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let table = self
            .lookup_table(token, stream_name)
            .await?
            .ok_or_else(|| StoreError::StreamDoesNotExist(stream_name.to_string()))?;
        Ok(Box::new(PgIterator::reverse(
            self.pool.clone(),
            stream_name.to_string(),
            table,
            from,
            count,
            matcher,
            self.batch_size,
        )))
    }

    async fn fetch_stream_names(
        &self,
        token: &CancellationToken,
        substring: &str,
        matcher: Matcher,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<String>, StoreError> {
        if token.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let conn = self.pool.get().await.map_err(Error::from)?;
        let rows = conn
            .query(
                "SELECT real_stream_name, metadata FROM event_streams \
                 WHERE real_stream_name LIKE $1 ORDER BY no ASC",
                &[&format!("%{substring}%")],
            )
            .await
            .map_err(Error::from)?;
        filter_and_paginate_names(rows, &matcher, limit, offset)
    }

    async fn fetch_stream_names_regex(
        &self,
        token: &CancellationToken,
        pattern: &str,
        matcher: Matcher,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<String>, StoreError> {
        if token.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let conn = self.pool.get().await.map_err(Error::from)?;
        let rows = conn
            .query(
                "SELECT real_stream_name, metadata FROM event_streams \
                 WHERE real_stream_name ~ $1 ORDER BY no ASC",
                &[&pattern],
            )
            .await
            .map_err(Error::from)?;
        filter_and_paginate_names(rows, &matcher, limit, offset)
    }

    async fn fetch_stream_metadata(
        &self,
        token: &CancellationToken,
        stream_name: &str,
    ) -> Result<Metadata, StoreError> {
        if token.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let conn = self.pool.get().await.map_err(Error::from)?;
        let row = conn
            .query_opt(
                "SELECT metadata FROM event_streams WHERE real_stream_name = $1",
                &[&stream_name],
            )
            .await
            .map_err(Error::from)?
            .ok_or_else(|| StoreError::StreamDoesNotExist(stream_name.to_string()))?;
        metadata_from_json(row.get(0)).map_err(Into::into)
    }

    async fn update_stream_metadata(
        &self,
        token: &CancellationToken,
        stream_name: &str,
        metadata: Metadata,
    ) -> Result<(), StoreError> {
        if token.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let metadata_json = serde_json::to_value(&metadata).map_err(|e| StoreError::from(Error::Encode(e)))?;
        let conn = self.pool.get().await.map_err(Error::from)?;
        let updated = conn
            .execute(
                "UPDATE event_streams SET metadata = $2 WHERE real_stream_name = $1",
                &[&stream_name, &metadata_json],
            )
            .await
            .map_err(Error::from)?;
        if updated == 0 {
            return Err(StoreError::StreamDoesNotExist(stream_name.to_string()));
        }
        Ok(())
    }
}

fn filter_and_paginate_names(
    rows: Vec<Row>,
    matcher: &Matcher,
    limit: u64,
    offset: u64,
) -> Result<Vec<String>, StoreError> {
    let mut names = Vec::with_capacity(rows.len());
    for row in rows {
        let name: String = row.get(0);
        let metadata: Metadata = metadata_from_json(row.get(1))?;
        if matcher.matches(&metadata) {
            names.push(name);
        }
    }
    Ok(names
        .into_iter()
        .skip(offset as usize)
        .take(if limit == 0 { usize::MAX } else { limit as usize })
        .collect())
}

/// Pushes `eq`/`in` conditions (the common, index-friendly cases) into a
/// `WHERE` clause over `metadata ->> 'key'`; `not_in` and `regex` are left
/// to the client-side [`Matcher::matches`] re-check every row undergoes
/// regardless, so correctness never depends on what made it into SQL.
fn pushdown_where_clause(
    matcher: &Matcher,
    start_index: usize,
) -> (String, Vec<Box<dyn tokio_postgres::types::ToSql + Sync + Send>>) {
    let mut clauses = Vec::new();
    let mut params: Vec<Box<dyn tokio_postgres::types::ToSql + Sync + Send>> = Vec::new();

    for (key, condition) in matcher.conditions() {
        match condition {
            Condition::Eq(value) => {
                params.push(Box::new(value.clone()));
                clauses.push(format!("metadata ->> '{key}' = ${}", start_index + params.len()));
            }
            Condition::In(values) => {
                params.push(Box::new(values.clone()));
                clauses.push(format!(
                    "metadata ->> '{key}' = ANY(${}::text[])",
                    start_index + params.len()
                ));
            }
            Condition::NotIn(_) | Condition::Regex(_) => {}
        }
    }

    if clauses.is_empty() {
        (String::new(), params)
    } else {
        (format!(" AND {}", clauses.join(" AND ")), params)
    }
}

enum Direction {
    Forward,
    Reverse,
}

/// Batch-fetching cursor over a per-stream table: keyset pagination on the
/// `no` bigserial ordinal, surfaced through this crate's
/// `Fresh`/`Advancing`/`AtEnd`/`Closed` state machine (`crate::iterator`).
struct PgIterator {
    pool: Pool<PostgresConnectionManager<NoTls>>,
    stream_name: String,
    table: String,
    matcher: Matcher,
    direction: Direction,
    from: u64,
    count: u64,
    batch_size: i64,
    cursor: i64,
    skip_remaining: u64,
    yielded: u64,
    buffer: VecDeque<PersistedEvent>,
    exhausted: bool,
    state: IteratorState,
}

impl PgIterator {
    fn forward(
        pool: Pool<PostgresConnectionManager<NoTls>>,
        stream_name: String,
        table: String,
        from: u64,
        count: u64,
        matcher: Matcher,
        batch_size: i64,
    ) -> Self {
        PgIterator {
            pool,
            stream_name,
            table,
            matcher,
            direction: Direction::Forward,
            from,
            count,
            batch_size,
            cursor: from as i64,
            skip_remaining: 0,
            yielded: 0,
            buffer: VecDeque::new(),
            exhausted: false,
            state: IteratorState::Fresh,
        }
    }

    fn reverse(
        pool: Pool<PostgresConnectionManager<NoTls>>,
        stream_name: String,
        table: String,
        from: u64,
        count: u64,
        matcher: Matcher,
        batch_size: i64,
    ) -> Self {
        PgIterator {
            pool,
            stream_name,
            table,
            matcher,
            direction: Direction::Reverse,
            from,
            count,
            batch_size,
            cursor: i64::MAX,
            skip_remaining: from,
            yielded: 0,
            buffer: VecDeque::new(),
            exhausted: false,
            state: IteratorState::Fresh,
        }
    }

    fn reset_cursor(&mut self) {
        self.cursor = match self.direction {
            Direction::Forward => self.from as i64,
            Direction::Reverse => i64::MAX,
        };
        self.skip_remaining = match self.direction {
            Direction::Forward => 0,
            Direction::Reverse => self.from,
        };
        self.yielded = 0;
        self.buffer.clear();
        self.exhausted = false;
    }

    fn has_capacity(&self) -> bool {
        self.count == 0 || self.yielded < self.count
    }

    async fn fill_buffer(&mut self, token: &CancellationToken) -> Result<(), IteratorError> {
        if self.exhausted || !self.buffer.is_empty() {
            return Ok(());
        }
        if token.is_cancelled() {
            return Err(IteratorError::Cancelled);
        }

        let conn = self
            .pool
            .get()
            .await
            .map_err(|e| IteratorError::Store(Error::from(e).into()))?;

        let (extra_where, extra_params) = pushdown_where_clause(&self.matcher, 2);
        let order = match self.direction {
            Direction::Forward => "ASC",
            Direction::Reverse => "DESC",
        };
        let cmp = match self.direction {
            Direction::Forward => ">",
            Direction::Reverse => "<",
        };

        let query = format!(
            "SELECT no, event_id, event_name, payload, metadata, created_at FROM \"{}\" \
             WHERE no {cmp} $1{extra_where} ORDER BY no {order} LIMIT $2",
            self.table
        );

        let mut params: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = vec![&self.cursor, &self.batch_size];
        for p in &extra_params {
            params.push(p.as_ref());
        }

        let rows = tokio::select! {
            _ = token.cancelled() => return Err(IteratorError::Cancelled),
            result = conn.query(&query, &params) => result.map_err(|e| IteratorError::Store(Error::from(e).into()))?,
        };

        if rows.len() < self.batch_size as usize {
            self.exhausted = true;
        }
        if let Some(last) = rows.last() {
            self.cursor = last.get(0);
        }

        for row in &rows {
            let no: i64 = row.get(0);
            let event_id: String = row.get(1);
            let event_name: String = row.get(2);
            let payload: serde_json::Value = row.get(3);
            let metadata_json: serde_json::Value = row.get(4);
            let created_at: time::OffsetDateTime = row.get(5);

            let metadata: Metadata =
                metadata_from_json(metadata_json).map_err(|e| IteratorError::Store(e.into()))?;
            let name: &'static str = chronicle::intern::intern(event_name);
            let version = metadata
                .get(metadata_keys::AGGREGATE_VERSION)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);

            let envelope = Envelope::from_parts(
                event_id,
                name,
                Payload::Structured(payload),
                metadata,
                version,
                created_at,
            );

            self.buffer.push_back(PersistedEvent::new(
                self.stream_name.clone(),
                (no - 1).max(0) as u64,
                envelope,
            ));
        }

        Ok(())
    }
}

#[async_trait]
impl EventIterator for PgIterator {
    async fn next(&mut self, token: &CancellationToken) -> Result<PersistedEvent, IteratorError> {
        if self.state == IteratorState::Closed {
            return Err(IteratorError::Closed);
        }
        if token.is_cancelled() {
            return Err(IteratorError::Cancelled);
        }
        self.state = IteratorState::Advancing;

        loop {
            if token.is_cancelled() {
                return Err(IteratorError::Cancelled);
            }
            if !self.has_capacity() {
                self.state = IteratorState::AtEnd;
                return Err(IteratorError::EndOfStream);
            }

            if self.buffer.is_empty() {
                self.fill_buffer(token).await?;
                if self.buffer.is_empty() {
                    self.state = IteratorState::AtEnd;
                    return Err(IteratorError::EndOfStream);
                }
            }

            let persisted = self.buffer.pop_front().expect("checked non-empty above");
            if !self.matcher.matches(persisted.envelope.metadata()) {
                continue;
            }
            if matches!(self.direction, Direction::Reverse) && self.skip_remaining > 0 {
                self.skip_remaining -= 1;
                continue;
            }

            self.yielded += 1;
            return Ok(persisted);
        }
    }

    async fn rewind(&mut self, token: &CancellationToken) -> Result<(), IteratorError> {
        if token.is_cancelled() {
            return Err(IteratorError::Cancelled);
        }
        self.reset_cursor();
        self.state = IteratorState::Fresh;
        Ok(())
    }

    async fn close(&mut self) {
        self.buffer.clear();
        self.state = IteratorState::Closed;
    }

    fn state(&self) -> IteratorState {
        self.state
    }
}
