//! # request-audit
//!
//! Fail-closed HTTP request auditing for axum services.
//!
//! Every request is captured into an audit record, written to the structured
//! log and to PostgreSQL (`api.log_request`), and only then handed to its
//! handler. If any required sink fails the request is rejected with
//! `400 Bad Request`.
//!
//! ## Features
//!
//! - **Body drain/replay**: the audit pipeline and the handler both see the full body
//! - **Correlation ids**: one time-sortable [`RequestId`](ids::RequestId) per request,
//!   shared by every sink and exposed to handlers as an extension
//! - **Structured logging**: JSON via `tracing-subscriber`
//! - **Relational recording**: one transaction per request through `sqlx`
//! - **TLS** (feature `tls`): rustls listener; requests over it are recorded as `https`
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use request_audit::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config)?;
//!
//!     let auditor = RequestAuditor::new(
//!         config.audit.clone(),
//!         Arc::new(MemoryRequestLogStore::new()),
//!     );
//!     let app = auditor.wrap(movie::routes(Arc::new(MemoryMovieStore::new())));
//!
//!     Server::new(config).serve(app).await
//! }
//! ```

pub mod audit;
pub mod config;
pub mod database;
pub mod error;
pub mod ids;
pub mod movie;
pub mod net;
pub mod observability;
pub mod server;

#[cfg(feature = "tls")]
pub mod tls;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::audit::{
        AuditRecord, MemoryRequestLogStore, PgRequestLogStore, RequestAuditor, RequestLogEntry,
        RequestLogStore, StructuredLogSink,
    };
    pub use crate::config::{AuditConfig, Config, DatabaseConfig, LogFailurePolicy};
    pub use crate::database::create_pool;
    pub use crate::error::{
        DatabaseError, DatabaseErrorKind, DatabaseOperation, Error, ErrorResponse, Result,
    };
    pub use crate::ids::{RequestId, RequestIdError};
    pub use crate::movie::{self, MemoryMovieStore, Movie, MovieStore, PgMovieStore};
    pub use crate::net::ConnectionInfo;
    pub use crate::observability::{init_tracing, shutdown_tracing};
    pub use crate::server::Server;

    pub use axum::{routing::get, Router};
}
