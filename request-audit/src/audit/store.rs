//! Relational request log
//!
//! The `RequestLogStore` trait is the single write operation the audit pipeline
//! needs from a database. `RequestLogEntry` spells out the thirteen parameters
//! of the `api.log_request` stored function.
//!
//! # Available Backends
//!
//! - **PostgreSQL** ([`PgRequestLogStore`]): transaction per request around the
//!   stored function
//! - **In-memory** ([`MemoryRequestLogStore`]): for services running without a
//!   database and for tests

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use sqlx::{Executor, PgPool, Row, Statement};

use super::record::AuditRecord;
use crate::error::{DatabaseError, DatabaseErrorKind, DatabaseOperation, Error, Op, Result};

const OP_LOG_REQUEST: Op = "audit/PgRequestLogStore.log_request";
const OP_INITIALIZE: Op = "audit/PgRequestLogStore.initialize";

const LOG_REQUEST_SQL: &str = r#"
select api.log_request
    (
    p_request_id => $1,
    p_request_timestamp => $2,
    p_protocol => $3,
    p_protocol_major => $4,
    p_protocol_minor => $5,
    p_request_method => $6,
    p_scheme => $7,
    p_host => $8,
    p_port => $9,
    p_path => $10,
    p_header => $11,
    p_content_length => $12,
    p_remote_address => $13
    )
"#;

/// Parameters of one request-log write, in stored-function order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLogEntry<'a> {
    pub request_id: &'a str,
    pub request_timestamp: DateTime<Utc>,
    pub protocol: &'a str,
    pub protocol_major: i32,
    pub protocol_minor: i32,
    pub method: &'a str,
    pub scheme: &'a str,
    pub host: &'a str,
    pub port: &'a str,
    pub path: &'a str,
    pub header: &'a str,
    pub content_length: Option<i64>,
    pub remote_address: &'a str,
}

impl<'a> From<&'a AuditRecord> for RequestLogEntry<'a> {
    fn from(record: &'a AuditRecord) -> Self {
        let request = record.request();
        Self {
            request_id: record.request_id().as_str(),
            request_timestamp: record.time_started(),
            protocol: &request.protocol,
            protocol_major: request.protocol_major,
            protocol_minor: request.protocol_minor,
            method: &request.method,
            scheme: &request.scheme,
            host: &request.host,
            port: &request.port,
            path: &request.path,
            header: &request.header,
            content_length: request.content_length,
            remote_address: &request.remote_address,
        }
    }
}

/// Persistence for audited requests
#[async_trait]
pub trait RequestLogStore: Send + Sync {
    /// Durably record one request, returning the number of rows written
    ///
    /// A returned error means the record is not durably logged.
    async fn log_request(&self, entry: &RequestLogEntry<'_>) -> Result<i64>;
}

/// PostgreSQL request log backed by the `api.log_request` stored function
#[derive(Debug, Clone)]
pub struct PgRequestLogStore {
    pool: PgPool,
}

impl PgRequestLogStore {
    /// Create a new PostgreSQL request log
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the `api` schema, the `api.request_log` table and the
    /// `api.log_request` function
    ///
    /// Idempotent; meant to be called once during startup.
    pub async fn initialize(&self) -> Result<()> {
        let statements = [
            "CREATE SCHEMA IF NOT EXISTS api",
            r#"
            CREATE TABLE IF NOT EXISTS api.request_log (
                request_id TEXT PRIMARY KEY,
                request_timestamp TIMESTAMPTZ NOT NULL,
                protocol TEXT NOT NULL,
                protocol_major INTEGER NOT NULL,
                protocol_minor INTEGER NOT NULL,
                request_method TEXT NOT NULL,
                scheme TEXT NOT NULL,
                host TEXT NOT NULL,
                port TEXT NOT NULL,
                path TEXT NOT NULL,
                header JSONB NOT NULL,
                content_length BIGINT,
                remote_address TEXT NOT NULL,
                create_timestamp TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_request_log_timestamp ON api.request_log (request_timestamp)",
            r#"
            CREATE OR REPLACE FUNCTION api.log_request(
                p_request_id TEXT,
                p_request_timestamp TIMESTAMPTZ,
                p_protocol TEXT,
                p_protocol_major INTEGER,
                p_protocol_minor INTEGER,
                p_request_method TEXT,
                p_scheme TEXT,
                p_host TEXT,
                p_port TEXT,
                p_path TEXT,
                p_header TEXT,
                p_content_length BIGINT,
                p_remote_address TEXT
            ) RETURNS INTEGER
            LANGUAGE plpgsql
            AS $$
            DECLARE
                v_rows INTEGER;
            BEGIN
                INSERT INTO api.request_log (
                    request_id, request_timestamp, protocol, protocol_major,
                    protocol_minor, request_method, scheme, host, port, path,
                    header, content_length, remote_address
                ) VALUES (
                    p_request_id, p_request_timestamp, p_protocol, p_protocol_major,
                    p_protocol_minor, p_request_method, p_scheme, p_host, p_port, p_path,
                    p_header::jsonb, p_content_length, p_remote_address
                );
                GET DIAGNOSTICS v_rows = ROW_COUNT;
                RETURN v_rows;
            END;
            $$
            "#,
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    DatabaseError::from(e)
                        .during(DatabaseOperation::Migration)
                        .add_context(OP_INITIALIZE)
                })?;
        }

        tracing::info!("Request log schema initialized");
        Ok(())
    }
}

/// Tag a sqlx failure with the stage it happened in
fn stage(operation: DatabaseOperation) -> impl Fn(sqlx::Error) -> Error {
    move |e| {
        let mut err = DatabaseError::from(e).during(operation);
        if matches!(operation, DatabaseOperation::Begin | DatabaseOperation::Commit)
            && err.kind == DatabaseErrorKind::Other
        {
            err.kind = DatabaseErrorKind::TransactionFailed;
        }
        Error::Database(err.add_context(OP_LOG_REQUEST))
    }
}

#[async_trait]
impl RequestLogStore for PgRequestLogStore {
    async fn log_request(&self, entry: &RequestLogEntry<'_>) -> Result<i64> {
        // Dropping `tx` without commit (error or cancelled request) rolls back
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(stage(DatabaseOperation::Begin))?;

        let statement = (&mut *tx)
            .prepare(LOG_REQUEST_SQL)
            .await
            .map_err(stage(DatabaseOperation::Prepare))?;

        let mut rows = statement
            .query()
            .bind(entry.request_id)
            .bind(entry.request_timestamp)
            .bind(entry.protocol)
            .bind(entry.protocol_major)
            .bind(entry.protocol_minor)
            .bind(entry.method)
            .bind(entry.scheme)
            .bind(entry.host)
            .bind(entry.port)
            .bind(entry.path)
            .bind(entry.header)
            .bind(entry.content_length)
            .bind(entry.remote_address)
            .fetch(&mut *tx);

        let mut rows_inserted: i64 = 0;
        while let Some(row) = rows
            .try_next()
            .await
            .map_err(stage(DatabaseOperation::Execute))?
        {
            let count: i32 = row
                .try_get(0)
                .map_err(stage(DatabaseOperation::Scan))?;
            rows_inserted = i64::from(count);
        }
        drop(rows);

        tx.commit().await.map_err(stage(DatabaseOperation::Commit))?;

        tracing::debug!(
            request_id = entry.request_id,
            rows_inserted,
            "Request logged to database"
        );
        Ok(rows_inserted)
    }
}

/// A request log entry owned by [`MemoryRequestLogStore`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRequestLog {
    pub request_id: String,
    pub request_timestamp: DateTime<Utc>,
    pub protocol: String,
    pub protocol_major: i32,
    pub protocol_minor: i32,
    pub method: String,
    pub scheme: String,
    pub host: String,
    pub port: String,
    pub path: String,
    pub header: String,
    pub content_length: Option<i64>,
    pub remote_address: String,
}

impl From<&RequestLogEntry<'_>> for StoredRequestLog {
    fn from(entry: &RequestLogEntry<'_>) -> Self {
        Self {
            request_id: entry.request_id.to_string(),
            request_timestamp: entry.request_timestamp,
            protocol: entry.protocol.to_string(),
            protocol_major: entry.protocol_major,
            protocol_minor: entry.protocol_minor,
            method: entry.method.to_string(),
            scheme: entry.scheme.to_string(),
            host: entry.host.to_string(),
            port: entry.port.to_string(),
            path: entry.path.to_string(),
            header: entry.header.to_string(),
            content_length: entry.content_length,
            remote_address: entry.remote_address.to_string(),
        }
    }
}

/// In-process request log
///
/// Cloning shares the underlying log. `fail_with` makes every subsequent write
/// fail at the given stage without recording anything.
#[derive(Debug, Clone, Default)]
pub struct MemoryRequestLogStore {
    entries: Arc<Mutex<Vec<StoredRequestLog>>>,
    failure: Arc<Mutex<Option<DatabaseOperation>>>,
}

impl MemoryRequestLogStore {
    /// Create an empty in-memory request log
    pub fn new() -> Self {
        Self::default()
    }

    /// Make writes fail at `operation` (or succeed again with `None`)
    pub fn fail_with(&self, operation: Option<DatabaseOperation>) {
        *self.failure.lock().unwrap_or_else(|e| e.into_inner()) = operation;
    }

    /// Snapshot of everything recorded so far
    pub fn entries(&self) -> Vec<StoredRequestLog> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl RequestLogStore for MemoryRequestLogStore {
    async fn log_request(&self, entry: &RequestLogEntry<'_>) -> Result<i64> {
        let failure = *self.failure.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(operation) = failure {
            return Err(Error::Database(
                DatabaseError::transaction_failed(operation, "request log unavailable")
                    .add_context("audit/MemoryRequestLogStore.log_request"),
            ));
        }

        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(StoredRequestLog::from(entry));
        Ok(1)
    }
}
