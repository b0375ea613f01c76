//! Fail-closed audit middleware
//!
//! Every request is captured and handed to both sinks before the wrapped
//! handler runs. If capture or a required sink fails the request is rejected
//! with `400 Bad Request` and the handler never sees it.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};

use super::auditor::RequestAuditor;
use super::record::AuditRecord;
use crate::error::{Error, ErrorResponse};

/// Audit middleware function
///
/// Applied by [`RequestAuditor::wrap`]. Order per request: build the record
/// (draining and restoring the body), run the sinks, then call the handler.
pub async fn audit_middleware(
    State(auditor): State<RequestAuditor>,
    mut request: Request,
    next: Next,
) -> Response {
    if !auditor.config().enabled {
        return next.run(request).await;
    }

    let mut record =
        match AuditRecord::from_request(&mut request, auditor.config().max_body_bytes).await {
            Ok(record) => record,
            Err(e) => return reject(&e, None),
        };

    if let Err(e) = auditor.run_sinks(&record).await {
        return reject(&e, Some(&record));
    }

    let response = next.run(request).await;

    record.finish();
    tracing::info!(
        request_id = %record.request_id(),
        status = response.status().as_u16(),
        elapsed_ms = record.elapsed().map_or(0, |d| d.as_millis() as u64),
        "Request completed"
    );

    response
}

/// Log the cause and build the generic rejection
fn reject(error: &Error, record: Option<&AuditRecord>) -> Response {
    let request_id = record.map(|r| r.request_id().to_string());
    tracing::error!(
        request_id = request_id.as_deref().unwrap_or_default(),
        op = error.op().unwrap_or_default(),
        category = error.category(),
        "Request audit failed: {}",
        error
    );

    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse::with_code(
            StatusCode::BAD_REQUEST,
            "AUDIT_FAILED",
            "Unable to log request",
        )),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::log_sink::tests::CapturedLogs;
    use crate::audit::log_sink::StructuredLogSink;
    use crate::audit::store::MemoryRequestLogStore;
    use crate::config::{AuditConfig, LogFailurePolicy};
    use crate::error::DatabaseOperation;
    use crate::ids::RequestId;
    use crate::net::ConnectionInfo;
    use axum::{
        body::{to_bytes, Body, Bytes},
        extract::{ConnectInfo, Extension},
        routing::{get, post},
        Router,
    };
    use http::header;
    use std::io;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    struct Harness {
        app: Router,
        store: MemoryRequestLogStore,
        calls: Arc<AtomicUsize>,
    }

    fn harness_with(config: AuditConfig, log_sink: StructuredLogSink) -> Harness {
        let store = MemoryRequestLogStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let auditor = RequestAuditor::with_log_sink(config, log_sink, Arc::new(store.clone()));

        let echo_calls = Arc::clone(&calls);
        let ping_calls = Arc::clone(&calls);
        let routes = Router::new()
            .route(
                "/echo",
                post(move |Extension(id): Extension<RequestId>, body: Bytes| {
                    let calls = Arc::clone(&echo_calls);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        ([("x-request-id", id.to_string())], body)
                    }
                }),
            )
            .route(
                "/v1/ping",
                get(move || {
                    let calls = Arc::clone(&ping_calls);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        "pong"
                    }
                }),
            );

        Harness {
            app: auditor.wrap(routes),
            store,
            calls,
        }
    }

    fn harness(config: AuditConfig) -> Harness {
        harness_with(
            config,
            StructuredLogSink::with_flush(Duration::from_secs(1), || Ok(())),
        )
    }

    fn broken_log_sink() -> StructuredLogSink {
        StructuredLogSink::with_flush(Duration::from_secs(1), || {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "log pipe closed"))
        })
    }

    fn post_echo(body: impl Into<Body>) -> Request {
        http::Request::builder()
            .method("POST")
            .uri("/echo")
            .header(header::HOST, "localhost:8080")
            .body(body.into())
            .unwrap()
    }

    async fn assert_audit_rejection(response: Response) {
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], "AUDIT_FAILED");
        assert_eq!(json["error"], "Unable to log request");
        assert_eq!(json["status"], 400);
    }

    #[tokio::test]
    async fn test_handler_sees_full_body() {
        let h = harness(AuditConfig::default());
        let payload = vec![b'm'; 4096];

        let response = h.app.oneshot(post_echo(payload.clone())).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let id_header = response
            .headers()
            .get("x-request-id")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.len(), payload.len());
        assert_eq!(&body[..], &payload[..]);

        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
        let entries = h.store.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].request_id, id_header);
        assert_eq!(entries[0].path, "/echo");
    }

    #[tokio::test]
    async fn test_chunked_request_is_replayed_plain() {
        let h = harness(AuditConfig::default());
        let payload = b"first chunk|second chunk".to_vec();
        let mut request = post_echo(payload.clone());
        request
            .headers_mut()
            .insert(header::TRANSFER_ENCODING, "chunked".parse().unwrap());

        let response = h.app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], &payload[..]);
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.entries()[0].content_length, None);
    }

    #[tokio::test]
    async fn test_missing_port_rejects_before_sinks() {
        let logs = CapturedLogs::default();
        let _guard = tracing::subscriber::set_default(logs.subscriber());

        let h = harness(AuditConfig::default());
        let mut request = post_echo("body");
        request
            .headers_mut()
            .insert(header::HOST, "example.com".parse().unwrap());

        let response = h.app.oneshot(request).await.unwrap();
        assert_audit_rejection(response).await;

        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
        assert!(h.store.entries().is_empty());
        assert!(!logs.contents().contains("Request received"));
        assert!(logs.contents().contains("malformed_host"));
    }

    #[tokio::test]
    async fn test_relational_failure_rejects_after_log() {
        let logs = CapturedLogs::default();
        let _guard = tracing::subscriber::set_default(logs.subscriber());

        let h = harness(AuditConfig::default());
        h.store.fail_with(Some(DatabaseOperation::Commit));

        let response = h.app.oneshot(post_echo("payload")).await.unwrap();
        assert_audit_rejection(response).await;

        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
        let output = logs.contents();
        assert!(output.contains("Request received"));
        assert!(output.contains("Request audit failed"));
        assert!(!output.contains("Request completed"));
    }

    #[tokio::test]
    async fn test_identical_requests_get_distinct_records() {
        let h = harness(AuditConfig::default());

        for _ in 0..2 {
            let response = h.app.clone().oneshot(post_echo("same")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let entries = h.store.entries();
        assert_eq!(entries.len(), 2);
        assert_ne!(entries[0].request_id, entries[1].request_id);
        assert_eq!(entries[0].path, entries[1].path);
        assert_eq!(entries[0].header, entries[1].header);
    }

    #[tokio::test]
    async fn test_tls_connection_recorded_as_https() {
        let h = harness(AuditConfig::default());
        let addr: SocketAddr = "203.0.113.9:40000".parse().unwrap();
        let request = http::Request::builder()
            .method("GET")
            .uri("/v1/ping")
            .header(header::HOST, "api.test.local:8443")
            .extension(ConnectInfo(ConnectionInfo::tls(addr)))
            .body(Body::empty())
            .unwrap();

        let response = h.app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let entries = h.store.entries();
        assert_eq!(entries[0].scheme, "https");
        assert_eq!(entries[0].host, "api.test.local");
        assert_eq!(entries[0].port, "8443");
        assert_eq!(entries[0].method, "GET");
        assert_eq!(entries[0].remote_address, "203.0.113.9:40000");
    }

    #[tokio::test]
    async fn test_log_failure_fail_closed() {
        let h = harness_with(AuditConfig::default(), broken_log_sink());

        let response = h.app.oneshot(post_echo("x")).await.unwrap();
        assert_audit_rejection(response).await;
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
        assert!(h.store.entries().is_empty());
    }

    #[tokio::test]
    async fn test_log_failure_best_effort() {
        let config = AuditConfig {
            log_failure_policy: LogFailurePolicy::BestEffort,
            ..AuditConfig::default()
        };
        let h = harness_with(config, broken_log_sink());

        let response = h.app.oneshot(post_echo("x")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.entries().len(), 1);
    }

    #[tokio::test]
    async fn test_parallel_sinks_both_awaited() {
        let config = AuditConfig {
            parallel_sinks: true,
            ..AuditConfig::default()
        };

        let h = harness(config.clone());
        let response = h.app.oneshot(post_echo("x")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(h.store.entries().len(), 1);

        // A failed log sink still lets the concurrent relational write finish
        let h = harness_with(config, broken_log_sink());
        let response = h.app.oneshot(post_echo("x")).await.unwrap();
        assert_audit_rejection(response).await;
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.store.entries().len(), 1);
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let config = AuditConfig {
            max_body_bytes: 8,
            ..AuditConfig::default()
        };
        let h = harness(config);

        let response = h.app.oneshot(post_echo("more than eight bytes")).await.unwrap();
        assert_audit_rejection(response).await;
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_disabled_passes_through() {
        let config = AuditConfig {
            enabled: false,
            ..AuditConfig::default()
        };
        let h = harness(config);
        let request = http::Request::builder()
            .uri("/v1/ping")
            .header(header::HOST, "no-port.example")
            .body(Body::empty())
            .unwrap();

        let response = h.app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(h.store.entries().is_empty());
    }

    #[tokio::test]
    async fn test_completion_is_logged() {
        let logs = CapturedLogs::default();
        let _guard = tracing::subscriber::set_default(logs.subscriber());

        let h = harness(AuditConfig::default());
        let response = h.app.oneshot(post_echo("done")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let output = logs.contents();
        let line = output
            .lines()
            .find(|l| l.contains("Request completed"))
            .expect("completion line emitted");
        let json: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(json["fields"]["status"], 200);
        assert_eq!(
            json["fields"]["request_id"],
            h.store.entries()[0].request_id.as_str()
        );
    }
}
