//! Request auditor: the context object shared by every audited request
//!
//! `RequestAuditor` owns the audit configuration and both sinks. It is cheap
//! to clone and is handed to the middleware as axum state.

use std::sync::Arc;

use axum::{middleware::from_fn_with_state, Router};

use super::log_sink::StructuredLogSink;
use super::middleware::audit_middleware;
use super::record::AuditRecord;
use super::store::{RequestLogEntry, RequestLogStore};
use crate::config::{AuditConfig, LogFailurePolicy};
use crate::error::Result;

/// Audit pipeline shared across requests
#[derive(Clone)]
pub struct RequestAuditor {
    config: AuditConfig,
    log_sink: StructuredLogSink,
    store: Arc<dyn RequestLogStore>,
}

impl std::fmt::Debug for RequestAuditor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestAuditor")
            .field("config", &self.config)
            .field("log_sink", &self.log_sink)
            .finish_non_exhaustive()
    }
}

impl RequestAuditor {
    /// Create an auditor writing to stdout and `store`
    pub fn new(config: AuditConfig, store: Arc<dyn RequestLogStore>) -> Self {
        let log_sink = StructuredLogSink::new(config.log_flush_timeout());
        Self::with_log_sink(config, log_sink, store)
    }

    /// Create an auditor with an explicit log sink
    pub fn with_log_sink(
        config: AuditConfig,
        log_sink: StructuredLogSink,
        store: Arc<dyn RequestLogStore>,
    ) -> Self {
        Self {
            config,
            log_sink,
            store,
        }
    }

    /// Get the audit configuration
    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    /// Get the structured log sink
    pub fn log_sink(&self) -> &StructuredLogSink {
        &self.log_sink
    }

    /// Get the relational store
    pub fn store(&self) -> &Arc<dyn RequestLogStore> {
        &self.store
    }

    /// Apply the audit middleware to every route of `router`
    pub fn wrap<S>(&self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        router.layer(from_fn_with_state(self.clone(), audit_middleware))
    }

    /// Hand `record` to both sinks
    ///
    /// Sequentially the log sink runs first and a fail-closed log failure
    /// skips the relational sink. With `parallel_sinks` both are awaited
    /// before either result is inspected. The relational sink is always
    /// required; the log sink is required unless the policy is
    /// [`LogFailurePolicy::BestEffort`].
    pub async fn run_sinks(&self, record: &AuditRecord) -> Result<()> {
        let entry = RequestLogEntry::from(record);

        let rows = if self.config.parallel_sinks {
            let (logged, stored) =
                tokio::join!(self.log_sink.emit(record), self.store.log_request(&entry));
            self.check_logged(record, logged)?;
            stored?
        } else {
            let logged = self.log_sink.emit(record).await;
            self.check_logged(record, logged)?;
            self.store.log_request(&entry).await?
        };

        tracing::debug!(request_id = %record.request_id(), rows, "Request audit recorded");
        Ok(())
    }

    fn check_logged(&self, record: &AuditRecord, logged: Result<()>) -> Result<()> {
        match (logged, self.config.log_failure_policy) {
            (Ok(()), _) => Ok(()),
            (Err(e), LogFailurePolicy::FailClosed) => Err(e),
            (Err(e), LogFailurePolicy::BestEffort) => {
                tracing::warn!(
                    request_id = %record.request_id(),
                    op = e.op().unwrap_or_default(),
                    "Structured log sink failed, continuing: {}",
                    e
                );
                Ok(())
            }
        }
    }
}
