//! HTTP server with graceful shutdown

use axum::Router;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::{
    catch_panic::CatchPanicLayer,
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

use crate::{
    config::Config,
    error::{Error, Op, Result},
    net::ConnectionInfo,
};

const OP_SERVE: Op = "server/Server.serve";

/// Server instance
pub struct Server {
    config: Config,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run the server with the given (already audited) router
    ///
    /// Serves HTTPS when the `tls` feature is enabled and `tls` is configured,
    /// plain HTTP otherwise.
    pub async fn serve(self, app: Router) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.service.port));
        let app = self.apply_layers(app);

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::io(OP_SERVE, e))?;

        #[cfg(feature = "tls")]
        {
            if let Some(ref tls_config) = self.config.tls {
                let server_config = crate::tls::load_server_config(tls_config)?;
                let listener = crate::tls::TlsListener::new(listener, server_config);
                tracing::info!(service = %self.config.service.name, %addr, "Server listening (https)");

                axum::serve(
                    listener,
                    app.into_make_service_with_connect_info::<ConnectionInfo>(),
                )
                .with_graceful_shutdown(shutdown_signal())
                .await
                .map_err(|e| Error::io(OP_SERVE, e))?;

                tracing::info!("Server shutdown complete");
                return Ok(());
            }
        }

        #[cfg(not(feature = "tls"))]
        {
            if self.config.tls.is_some() {
                tracing::warn!("TLS configured but the `tls` feature is disabled, serving plain HTTP");
            }
        }

        tracing::info!(service = %self.config.service.name, %addr, "Server listening (http)");

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<ConnectionInfo>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| Error::io(OP_SERVE, e))?;

        tracing::info!("Server shutdown complete");
        Ok(())
    }

    /// Outer middleware stack; the audit layer sits inside these
    fn apply_layers(&self, app: Router) -> Router {
        tracing::info!(
            timeout_secs = self.config.service.timeout_secs,
            audit_enabled = self.config.audit.enabled,
            parallel_sinks = self.config.audit.parallel_sinks,
            "Middleware configured"
        );

        app.layer(TimeoutLayer::with_status_code(
            http::StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(self.config.service.timeout_secs),
        ))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new())
                .on_response(DefaultOnResponse::new()),
        )
        .layer(CatchPanicLayer::new())
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl+C), starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
