//! Relaybot server: Telegram intake, routing gateway and the health surface.

use crate::config::RelayConfig;
use crate::gateway::Gateway;
use crate::router::{DebounceSettings, Router};
use crate::routes;
use crate::session::{HttpBackendFactory, SessionRegistry};
use anyhow::Result;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use rb_backend::BackendClient;
use rb_channels::{ChannelAdapter, OutboundMessage, TelegramAdapter};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

const INBOUND_QUEUE_CAPACITY: usize = 1024;

pub async fn doctor() -> Result<()> {
    let cfg = RelayConfig::load()?;
    log_config_summary(&cfg, "config ok");
    Ok(())
}

pub async fn send_one_shot(chat_id: &str, message: &str) -> Result<()> {
    let cfg = RelayConfig::load()?;
    let adapter = TelegramAdapter::new(&cfg.telegram.bot_token)?;
    adapter.send(chat_id, OutboundMessage::text(message)).await?;
    tracing::info!(%chat_id, "one-shot message sent");
    Ok(())
}

pub async fn serve() -> Result<()> {
    let cfg = RelayConfig::load()?;
    log_config_summary(&cfg, "server configuration loaded");
    let addr = cfg.bind_addr();
    let listener = preflight_bind_listener(addr).await?;

    let shutdown = CancellationToken::new();

    let telegram: Arc<dyn ChannelAdapter> =
        Arc::new(TelegramAdapter::new(&cfg.telegram.bot_token)?);
    let (inbound_tx, inbound_rx) = tokio::sync::mpsc::channel(INBOUND_QUEUE_CAPACITY);
    telegram.start(inbound_tx, shutdown.child_token()).await?;
    tracing::info!(channel = telegram.channel_id(), "channel adapter started");

    let backends = Arc::new(HttpBackendFactory::new(
        BackendClient::build_http_client(cfg.backend_timeout()),
        cfg.classifier.clone(),
        cfg.escalation.clone(),
    ));
    let router = Arc::new(Router::new(
        SessionRegistry::new(backends),
        telegram.clone(),
        DebounceSettings::fixed(cfg.debounce_window()),
        shutdown.child_token(),
    ));
    let gateway = Arc::new(Gateway::new(router, inbound_rx));
    let gateway_handle = gateway.start(shutdown.child_token());
    tracing::info!("gateway started");

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    let app = routes::router()
        .layer(GlobalConcurrencyLimitLayer::new(cfg.server.http_max_in_flight))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(cfg.server.http_timeout_seconds),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!(%addr, "relaybot serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    shutdown.cancel();
    match gateway_handle.await {
        Ok(()) => tracing::info!("gateway shutdown completed"),
        Err(e) => tracing::error!(error = %e, "gateway task join failed during shutdown"),
    }

    Ok(())
}

fn log_config_summary(cfg: &RelayConfig, headline: &str) {
    tracing::info!(
        bind_addr = %cfg.bind_addr(),
        classifier_url = %cfg.classifier.url,
        escalation_url = %cfg.escalation.url,
        debounce_seconds = cfg.router.debounce_seconds,
        backend_timeout_seconds = cfg.router.backend_timeout_seconds,
        http_timeout_seconds = cfg.server.http_timeout_seconds,
        http_max_in_flight = cfg.server.http_max_in_flight,
        "{headline}"
    );
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}
