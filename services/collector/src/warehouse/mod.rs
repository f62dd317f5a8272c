//! Warehouse driver.
//!
//! The single shared [`Warehouse`] is the only component that talks SQL.
//! It wraps a connection pool, classifies failures, and retries transient
//! errors exactly once after re-establishing connectivity.
//!
//! # Failure semantics
//! Execution errors classify into transient / syntax / constraint / auth.
//! A transient failure triggers `ensure_connection`: up to
//! [`MAX_RECONNECT_ATTEMPTS`] probes, [`RECONNECT_DELAY`] apart, then one
//! retry of the original statement.  Exhausting the probes surfaces
//! [`WarehouseError::Unavailable`], the only error the orchestrator treats
//! as fatal.
//!
//! Column names in returned rows are folded to lower-case on read, so
//! callers never see the endpoint's upper-case column convention.

pub mod merge;
pub mod statement;

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Row as _};
use tracing::{debug, warn};

use crate::config::WarehouseConfig;
pub use merge::MergeStatement;
pub use statement::{SqlValue, Statement};

/// Probe attempts before declaring the warehouse unavailable.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;
/// Fixed delay between reconnect probes.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Rows per sub-batch in `batch_insert`.
const BATCH_CHUNK: usize = 100;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum WarehouseError {
    #[error("transient warehouse error: {0}")]
    Transient(String),
    #[error("SQL error: {0}")]
    Syntax(String),
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("warehouse auth error: {0}")]
    Auth(String),
    #[error("warehouse unavailable after {attempts} reconnect attempts: {message}")]
    Unavailable { attempts: u32, message: String },
}

impl WarehouseError {
    pub fn is_constraint(&self) -> bool {
        matches!(self, WarehouseError::Constraint(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, WarehouseError::Unavailable { .. })
    }

    fn from_sqlx(err: &sqlx::Error) -> WarehouseError {
        match err {
            sqlx::Error::Database(db) => {
                let code = db.code().map(|c| c.to_string()).unwrap_or_default();
                let message = format!("[{code}] {db}");
                // SQLSTATE classes: 08 connection, 57 operator intervention,
                // 40 rollback, 23 integrity, 28 auth, 42 syntax/access.
                if code.starts_with("08") || code.starts_with("57") || code.starts_with("40") {
                    WarehouseError::Transient(message)
                } else if code.starts_with("23") {
                    WarehouseError::Constraint(message)
                } else if code.starts_with("28") {
                    WarehouseError::Auth(message)
                } else {
                    WarehouseError::Syntax(message)
                }
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                WarehouseError::Syntax(err.to_string())
            }
            other => WarehouseError::Transient(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// One result row with case-insensitive, lower-case-normalized column access.
pub struct WarehouseRow {
    inner: PgRow,
}

impl WarehouseRow {
    fn position(&self, name: &str) -> Option<usize> {
        self.inner
            .columns()
            .iter()
            .position(|c| c.name().eq_ignore_ascii_case(name))
    }

    pub fn text(&self, name: &str) -> Option<String> {
        self.position(name)
            .and_then(|i| self.inner.try_get::<Option<String>, _>(i).ok().flatten())
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        self.position(name)
            .and_then(|i| self.inner.try_get::<Option<i64>, _>(i).ok().flatten())
    }

    pub fn float(&self, name: &str) -> Option<f64> {
        self.position(name)
            .and_then(|i| self.inner.try_get::<Option<f64>, _>(i).ok().flatten())
    }

    pub fn boolean(&self, name: &str) -> Option<bool> {
        self.position(name)
            .and_then(|i| self.inner.try_get::<Option<bool>, _>(i).ok().flatten())
    }

    pub fn timestamp(&self, name: &str) -> Option<chrono::DateTime<chrono::Utc>> {
        self.position(name).and_then(|i| {
            self.inner
                .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(i)
                .ok()
                .flatten()
        })
    }
}

// ---------------------------------------------------------------------------
// Warehouse
// ---------------------------------------------------------------------------

pub struct Warehouse {
    pool: PgPool,
}

impl Warehouse {
    /// Build the pool and validate connectivity.
    ///
    /// Transient startup failures are retried with the same bounded probe
    /// schedule as mid-run reconnects; anything else (bad credentials, bad
    /// database name) is surfaced immediately.
    pub async fn connect(cfg: &WarehouseConfig) -> Result<Warehouse, WarehouseError> {
        let schema = cfg.schema.clone();
        let role = cfg.role.clone();
        let options = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .after_connect(move |conn, _meta| {
                let schema = schema.clone();
                let role = role.clone();
                Box::pin(async move {
                    let set_schema = format!("SET search_path TO {}", quote_ident(&schema));
                    sqlx::query(&set_schema).execute(&mut *conn).await?;
                    if let Some(role) = role {
                        let set_role = format!("SET ROLE {}", quote_ident(&role));
                        sqlx::query(&set_role).execute(&mut *conn).await?;
                    }
                    Ok(())
                })
            });

        let url = cfg.url();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match options.clone().connect(&url).await {
                Ok(pool) => return Ok(Warehouse { pool }),
                Err(err) => {
                    let classified = WarehouseError::from_sqlx(&err);
                    match classified {
                        WarehouseError::Transient(message) => {
                            if attempt >= MAX_RECONNECT_ATTEMPTS {
                                return Err(WarehouseError::Unavailable {
                                    attempts: attempt,
                                    message,
                                });
                            }
                            warn!(attempt, error = %message, "warehouse connect failed, retrying");
                            tokio::time::sleep(RECONNECT_DELAY).await;
                        }
                        other => return Err(other),
                    }
                }
            }
        }
    }

    /// Apply the schema migrations under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), WarehouseError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| WarehouseError::Syntax(e.to_string()))
    }

    /// Fetch a single row, or None.
    pub async fn get(
        &self,
        sql: &str,
        binds: &[SqlValue],
    ) -> Result<Option<WarehouseRow>, WarehouseError> {
        let stmt = Statement::new(sql, binds.to_vec());
        self.with_retry(async || {
            bind_query(&stmt.sql, &stmt.binds)
                .fetch_optional(&self.pool)
                .await
        })
        .await
        .map(|row| row.map(|inner| WarehouseRow { inner }))
    }

    /// Fetch all rows.
    pub async fn all(
        &self,
        sql: &str,
        binds: &[SqlValue],
    ) -> Result<Vec<WarehouseRow>, WarehouseError> {
        let stmt = Statement::new(sql, binds.to_vec());
        self.with_retry(async || {
            bind_query(&stmt.sql, &stmt.binds)
                .fetch_all(&self.pool)
                .await
        })
        .await
        .map(|rows| rows.into_iter().map(|inner| WarehouseRow { inner }).collect())
    }

    /// Execute one statement; returns affected row count.
    pub async fn run(&self, stmt: &Statement) -> Result<u64, WarehouseError> {
        self.with_retry(async || {
            bind_query(&stmt.sql, &stmt.binds)
                .execute(&self.pool)
                .await
        })
        .await
        .map(|done| done.rows_affected())
    }

    /// Execute a MERGE built by the single merge builder.
    pub async fn merge(&self, merge: &MergeStatement) -> Result<u64, WarehouseError> {
        self.run(&merge.to_statement()).await
    }

    /// Execute a list of statements in one transaction.
    ///
    /// On a transient failure the whole transaction is retried once after
    /// reconnect; safe because every statement routed here is idempotent.
    pub async fn run_in_transaction(&self, stmts: &[Statement]) -> Result<(), WarehouseError> {
        self.with_retry(async || {
            let mut tx = self.pool.begin().await?;
            for stmt in stmts {
                bind_query(&stmt.sql, &stmt.binds)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await
        })
        .await
    }

    /// Multi-row insert in sub-batches of [`BATCH_CHUNK`].
    ///
    /// A failing sub-batch falls back to row-by-row execution; individual
    /// bad rows are logged and skipped so the rest of the batch lands.
    /// Returns the number of rows inserted.
    pub async fn batch_insert(
        &self,
        table: &str,
        cols: &[&str],
        rows: &[Vec<SqlValue>],
    ) -> Result<u64, WarehouseError> {
        let mut inserted = 0;
        for chunk in rows.chunks(BATCH_CHUNK) {
            let stmt = multi_row_insert(table, cols, chunk);
            match self.run(&stmt).await {
                Ok(count) => inserted += count,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    debug!(table, error = %err, "sub-batch failed, retrying row-by-row");
                    for row in chunk {
                        let stmt = multi_row_insert(table, cols, std::slice::from_ref(row));
                        match self.run(&stmt).await {
                            Ok(count) => inserted += count,
                            Err(err) if err.is_fatal() => return Err(err),
                            Err(err) => warn!(table, error = %err, "row skipped"),
                        }
                    }
                }
            }
        }
        Ok(inserted)
    }

    /// `SELECT 1` health probe.
    pub async fn is_healthy(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    /// Close the pool; idempotent.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // -----------------------------------------------------------------------
    // Internal: retry machinery
    // -----------------------------------------------------------------------

    /// Run `op`; on a transient error, probe connectivity and retry once.
    async fn with_retry<T, F>(&self, op: F) -> Result<T, WarehouseError>
    where
        F: AsyncFn() -> Result<T, sqlx::Error>,
    {
        match op().await {
            Ok(value) => Ok(value),
            Err(err) => {
                let classified = WarehouseError::from_sqlx(&err);
                if !matches!(classified, WarehouseError::Transient(_)) {
                    return Err(classified);
                }
                warn!(error = %classified, "transient warehouse error, reconnecting");
                self.ensure_connection().await?;
                op().await.map_err(|e| WarehouseError::from_sqlx(&e))
            }
        }
    }

    /// Probe until `SELECT 1` succeeds, bounded by the reconnect schedule.
    async fn ensure_connection(&self) -> Result<(), WarehouseError> {
        let mut last_error = String::new();
        for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
            match sqlx::query("SELECT 1").execute(&self.pool).await {
                Ok(_) => {
                    debug!(attempt, "warehouse connection re-established");
                    return Ok(());
                }
                Err(err) => {
                    last_error = err.to_string();
                    warn!(attempt, error = %last_error, "warehouse probe failed");
                    if attempt < MAX_RECONNECT_ATTEMPTS {
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        }
        Err(WarehouseError::Unavailable {
            attempts: MAX_RECONNECT_ATTEMPTS,
            message: last_error,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn bind_query<'q>(
    sql: &'q str,
    binds: &'q [SqlValue],
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    let mut query = sqlx::query(sql);
    for value in binds {
        query = match value {
            SqlValue::Text(v) => query.bind(v),
            SqlValue::OptText(v) => query.bind(v),
            SqlValue::Int(v) => query.bind(v),
            SqlValue::OptInt(v) => query.bind(v),
            SqlValue::Float(v) => query.bind(v),
            SqlValue::Bool(v) => query.bind(v),
            SqlValue::Timestamp(v) => query.bind(v),
            SqlValue::OptTimestamp(v) => query.bind(v),
            SqlValue::Uuid(v) => query.bind(v),
        };
    }
    query
}

/// Build `INSERT INTO t (a, b) VALUES ($1, $2), ($3, $4), ...`.
fn multi_row_insert(table: &str, cols: &[&str], rows: &[Vec<SqlValue>]) -> Statement {
    let mut binds = Vec::with_capacity(rows.len() * cols.len());
    let mut groups = Vec::with_capacity(rows.len());
    let mut n = 0;
    for row in rows {
        let placeholders: Vec<String> = row
            .iter()
            .map(|_| {
                n += 1;
                format!("${n}")
            })
            .collect();
        groups.push(format!("({})", placeholders.join(", ")));
        binds.extend(row.iter().cloned());
    }
    Statement::new(
        format!(
            "INSERT INTO {} ({}) VALUES {}",
            table,
            cols.join(", "),
            groups.join(", ")
        ),
        binds,
    )
}

/// Double-quote an identifier for `SET search_path` / `SET ROLE`.
fn quote_ident(raw: &str) -> String {
    format!("\"{}\"", raw.replace('"', "\"\""))
}
