//! # bunnel-server
//!
//! Reverse HTTP tunnel server. Terminates TLS on `--port`, multiplexing
//! WebSocket agent control channels and `<subdomain>.<host>` HTTP traffic
//! over the same listener by inspecting each request's `Host` header.
//! Optionally also serves a cleartext `--proxy` port that forwards to the
//! TLS listener over loopback, for deployments that terminate TLS
//! upstream of this process.
//!
//! ## Modules
//!
//! - [`api`] — the `/api/tunnels` operational endpoint
//! - [`config`] — CLI surface
//! - [`handlers`] — the tunnel listener: routing, dispatch, channel tasks
//! - [`idle`] — background idle-tunnel reaper
//! - [`pending`] — the pending request table
//! - [`registry`] — the tunnel registry and agent-session state machine
//! - [`state`] — shared application state
//! - [`subdomain`] — subdomain allocation
//! - [`tls`] — certificate loading / self-signing

mod api;
mod config;
mod handlers;
mod idle;
mod pending;
mod registry;
mod state;
mod subdomain;
mod tls;

use anyhow::Context;
use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use clap::Parser;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::service::TowerToHyperService;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::config::Cli;
use crate::state::{AppState, ServerConfig};

fn init_tracing() {
    let filter = std::env::var("BUNNEL_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("a rustls crypto provider was already installed"))?;

    let cli = Cli::parse();
    cli.validate()?;

    let tls_config = tls::load_or_generate(cli.cert.as_deref(), cli.key.as_deref())?;
    let state = AppState::new(ServerConfig::default());

    let app = Router::new()
        .fallback(handlers::entry)
        .layer(CorsLayer::permissive())
        .with_state(state.clone());

    let idle_handle = idle::spawn(state.clone());

    let tunnel_addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    let tunnel_listener = TcpListener::bind(tunnel_addr)
        .await
        .with_context(|| format!("binding tunnel listener on {tunnel_addr}"))?;
    info!(%tunnel_addr, "tunnel listener ready");
    let tunnel_task = tokio::spawn(serve_tls(tunnel_listener, tls_config, app));

    let proxy_task = if cli.proxy != 0 {
        let proxy_addr = SocketAddr::from(([0, 0, 0, 0], cli.proxy));
        let proxy_listener = TcpListener::bind(proxy_addr)
            .await
            .with_context(|| format!("binding proxy listener on {proxy_addr}"))?;
        info!(%proxy_addr, tunnel_port = cli.port, "cleartext proxy listener ready");
        Some(tokio::spawn(serve_proxy(proxy_listener, cli.port)))
    } else {
        None
    };

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown requested, draining tunnels");

    idle_handle.abort();
    tunnel_task.abort();
    if let Some(task) = proxy_task {
        task.abort();
    }
    state.registry.drain_all(&state.pending);

    Ok(())
}

/// Accepts raw TCP connections, terminates TLS on each, and serves the
/// axum router over the result with WebSocket-upgrade support. There's no
/// `axum::serve` equivalent for manually-terminated TLS in this
/// dependency set, so the accept loop is hand-rolled.
async fn serve_tls(listener: TcpListener, tls_config: Arc<rustls::ServerConfig>, app: Router) {
    let acceptor = TlsAcceptor::from(tls_config);
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(error) => {
                warn!(%error, "failed to accept tunnel connection");
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let app = app.clone();
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(stream) => stream,
                Err(error) => {
                    warn!(%peer, %error, "TLS handshake failed");
                    return;
                }
            };
            let io = TokioIo::new(tls_stream);
            let service = TowerToHyperService::new(app);
            if let Err(error) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(io, service)
                .await
            {
                warn!(%peer, %error, "connection error");
            }
        });
    }
}

/// Cleartext entry point that forwards every request to the TLS tunnel
/// listener over loopback, for deployments that terminate TLS in front
/// of this process.
async fn serve_proxy(listener: TcpListener, tunnel_port: u16) {
    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .build()
        .expect("building loopback reqwest client");

    let app = Router::new()
        .fallback(forward_to_tunnel_port)
        .with_state((client, tunnel_port));

    if let Err(error) = axum::serve(listener, app).await {
        error!(%error, "proxy listener stopped");
    }
}

async fn forward_to_tunnel_port(
    State((client, tunnel_port)): State<(reqwest::Client, u16)>,
    req: Request<Body>,
) -> Response {
    let (parts, body) = req.into_parts();
    let body_bytes = match to_bytes(body, 10 * 1024 * 1024).await {
        Ok(bytes) => bytes,
        Err(_) => return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response(),
    };

    let host = parts
        .headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost")
        .to_string();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let url = format!("https://127.0.0.1:{tunnel_port}{path}");

    let method = match reqwest::Method::from_bytes(parts.method.as_str().as_bytes()) {
        Ok(method) => method,
        Err(_) => return (StatusCode::BAD_REQUEST, "unsupported method").into_response(),
    };

    let mut upstream = client.request(method, url).body(body_bytes.to_vec());
    for (name, value) in parts.headers.iter() {
        if name == axum::http::header::HOST {
            continue;
        }
        if let Ok(value) = value.to_str() {
            upstream = upstream.header(name.as_str(), value);
        }
    }
    upstream = upstream.header("host", host);

    let upstream_response = match upstream.send().await {
        Ok(response) => response,
        Err(error) => {
            error!(%error, "forwarding to tunnel listener failed");
            return (StatusCode::BAD_GATEWAY, "tunnel listener unreachable").into_response();
        }
    };

    let status = upstream_response.status();
    let mut builder = Response::builder().status(status.as_u16());
    for (name, value) in upstream_response.headers().iter() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            builder = builder.header(name, value);
        }
    }

    let body = upstream_response.bytes().await.unwrap_or_default();
    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response())
}
