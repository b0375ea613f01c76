//! Request audit pipeline
//!
//! Every inbound request passes through four stages before its handler runs:
//!
//! 1. **Drain/replay** ([`body`]): the body is read once and restored for the handler
//! 2. **Record** ([`record`]): request metadata is captured into an [`AuditRecord`]
//!    together with a fresh [`RequestId`](crate::ids::RequestId)
//! 3. **Sinks**: the record goes to the structured log ([`log_sink`]) and the
//!    relational store ([`store`])
//! 4. **Handler**: only reached when every required sink succeeded
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use request_audit::audit::{MemoryRequestLogStore, RequestAuditor};
//!
//! let auditor = RequestAuditor::new(config.audit.clone(), Arc::new(MemoryRequestLogStore::new()));
//! let app = auditor.wrap(Router::new().route("/api/v1/movies", post(create_movie)));
//! ```

pub mod auditor;
pub mod body;
pub mod log_sink;
pub mod middleware;
pub mod record;
pub mod store;

pub use auditor::RequestAuditor;
pub use body::{drain_body, dump_body, DrainedBody, DumpedBody};
pub use log_sink::StructuredLogSink;
pub use middleware::audit_middleware;
pub use record::{AuditRecord, RequestSnapshot};
pub use store::{
    MemoryRequestLogStore, PgRequestLogStore, RequestLogEntry, RequestLogStore, StoredRequestLog,
};
