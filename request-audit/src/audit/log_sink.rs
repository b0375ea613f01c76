//! Structured log sink for audit records
//!
//! Emits one `tracing` event per request with a fixed field set, then flushes
//! the process log writer within a bounded time.

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use super::record::AuditRecord;
use crate::error::{Error, Op, Result};

const OP_EMIT: Op = "audit/StructuredLogSink.emit";

type FlushFn = dyn Fn() -> io::Result<()> + Send + Sync;

/// Writes audit records to the structured log backend
#[derive(Clone)]
pub struct StructuredLogSink {
    flush_fn: Arc<FlushFn>,
    flush_timeout: Duration,
}

impl std::fmt::Debug for StructuredLogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StructuredLogSink")
            .field("flush_timeout", &self.flush_timeout)
            .finish_non_exhaustive()
    }
}

impl StructuredLogSink {
    /// Sink that flushes stdout, where `init_tracing` installs the JSON writer
    pub fn new(flush_timeout: Duration) -> Self {
        Self::with_flush(flush_timeout, || io::stdout().flush())
    }

    /// Sink with a custom flush for a different log writer
    pub fn with_flush<F>(flush_timeout: Duration, flush: F) -> Self
    where
        F: Fn() -> io::Result<()> + Send + Sync + 'static,
    {
        Self {
            flush_fn: Arc::new(flush),
            flush_timeout,
        }
    }

    /// Emit `record` and flush the log writer
    pub async fn emit(&self, record: &AuditRecord) -> Result<()> {
        let request = record.request();
        tracing::debug!(request_id = %record.request_id(), "log emit started");

        tracing::info!(
            request_id = %record.request_id(),
            protocol = %request.protocol,
            proto_major = request.protocol_major,
            proto_minor = request.protocol_minor,
            method = %request.method,
            scheme = %request.scheme,
            host = %request.host,
            port = %request.port,
            path = %request.path,
            header_json = %request.header,
            // -1 when the request did not declare a length
            content_length = request.content_length.unwrap_or(-1),
            transfer_encoding = %request.transfer_encoding,
            close = request.close,
            remote_addr = %request.remote_address,
            request_uri = %request.request_uri,
            "Request received"
        );

        let flushed = self.flush().await;
        tracing::debug!(request_id = %record.request_id(), "log emit ended");
        flushed
    }

    async fn flush(&self) -> Result<()> {
        let flush = Arc::clone(&self.flush_fn);
        let task = tokio::task::spawn_blocking(move || flush());

        match tokio::time::timeout(self.flush_timeout, task).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(Error::LogSink {
                op: OP_EMIT,
                message: format!("flush failed: {}", e),
            }),
            Ok(Err(e)) => Err(Error::LogSink {
                op: OP_EMIT,
                message: format!("flush task failed: {}", e),
            }),
            Err(_) => Err(Error::LogSink {
                op: OP_EMIT,
                message: format!("flush timed out after {:?}", self.flush_timeout),
            }),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::body::Body;
    use std::sync::Mutex;
    use tracing_subscriber::fmt::MakeWriter;

    /// In-memory `MakeWriter` for asserting on emitted log lines
    #[derive(Clone, Default)]
    pub(crate) struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl CapturedLogs {
        pub(crate) fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }

        pub(crate) fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync {
            tracing_subscriber::fmt()
                .json()
                .with_max_level(tracing::Level::DEBUG)
                .with_writer(self.clone())
                .finish()
        }
    }

    impl Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for CapturedLogs {
        type Writer = CapturedLogs;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    async fn sample_record() -> AuditRecord {
        let body = r#"{"title":"Heat"}"#;
        let mut request = http::Request::builder()
            .method("POST")
            .uri("/api/v1/movies?dry_run=true")
            .header(http::header::HOST, "localhost:8080")
            .header(http::header::CONTENT_LENGTH, body.len())
            .body(Body::from(body))
            .unwrap();
        AuditRecord::from_request(&mut request, 1024).await.unwrap()
    }

    fn audit_line(output: &str) -> serde_json::Value {
        let line = output
            .lines()
            .find(|l| l.contains("Request received"))
            .expect("audit line emitted");
        serde_json::from_str(line).unwrap()
    }

    #[tokio::test]
    async fn test_emit_writes_structured_fields() {
        let logs = CapturedLogs::default();
        let _guard = tracing::subscriber::set_default(logs.subscriber());

        let record = sample_record().await;
        let sink = StructuredLogSink::with_flush(Duration::from_secs(1), || Ok(()));
        sink.emit(&record).await.unwrap();

        let json = audit_line(&logs.contents());
        let fields = &json["fields"];
        assert_eq!(json["level"], "INFO");
        assert_eq!(fields["request_id"], record.request_id().as_str());
        assert_eq!(fields["protocol"], "HTTP/1.1");
        assert_eq!(fields["proto_major"], 1);
        assert_eq!(fields["proto_minor"], 1);
        assert_eq!(fields["method"], "POST");
        assert_eq!(fields["scheme"], "http");
        assert_eq!(fields["host"], "localhost");
        assert_eq!(fields["port"], "8080");
        assert_eq!(fields["path"], "/api/v1/movies");
        assert_eq!(fields["header_json"], record.request().header.as_str());
        assert_eq!(fields["content_length"], 16);
        assert_eq!(fields["transfer_encoding"], "");
        assert_eq!(fields["close"], false);
        assert_eq!(fields["remote_addr"], "");
        assert_eq!(fields["request_uri"], "/api/v1/movies?dry_run=true");

        let header_json: serde_json::Value =
            serde_json::from_str(fields["header_json"].as_str().unwrap()).unwrap();
        assert_eq!(header_json["content-length"][0], "16");
    }

    #[tokio::test]
    async fn test_undeclared_length_is_logged_as_number() {
        let logs = CapturedLogs::default();
        let _guard = tracing::subscriber::set_default(logs.subscriber());

        let mut request = http::Request::builder()
            .method("POST")
            .uri("/upload")
            .header(http::header::HOST, "localhost:8080")
            .header(http::header::TRANSFER_ENCODING, "chunked")
            .body(Body::from("abc"))
            .unwrap();
        let record = AuditRecord::from_request(&mut request, 1024).await.unwrap();
        let sink = StructuredLogSink::with_flush(Duration::from_secs(1), || Ok(()));
        sink.emit(&record).await.unwrap();

        let json = audit_line(&logs.contents());
        assert_eq!(json["fields"]["content_length"], -1);
        assert_eq!(json["fields"]["transfer_encoding"], "chunked");
    }

    #[tokio::test]
    async fn test_flush_failure_is_reported() {
        let record = sample_record().await;
        let sink = StructuredLogSink::with_flush(Duration::from_secs(1), || {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "log pipe closed"))
        });

        match sink.emit(&record).await {
            Err(Error::LogSink { op, message }) => {
                assert_eq!(op, OP_EMIT);
                assert!(message.contains("log pipe closed"));
            }
            other => panic!("expected LogSink error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_flush_is_bounded() {
        let record = sample_record().await;
        let sink = StructuredLogSink::with_flush(Duration::from_millis(20), || {
            std::thread::sleep(Duration::from_millis(500));
            Ok(())
        });

        let err = sink.emit(&record).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
