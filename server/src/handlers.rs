//! # Tunnel Listener
//!
//! The single HTTP entry point for this server. Every inbound connection
//! — WebSocket control channels, WebSocket secondary channels, and plain
//! HTTP calls bound for a tunneled service — lands here and is routed by
//! `Host` header, not by path, so there is exactly one axum route: a
//! `fallback`.

use crate::api;
use crate::pending::{new_request_id, Outcome};
use crate::registry::ControlTx;
use crate::state::AppState;
use crate::subdomain;
use axum::body::Body;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{FromRequestParts, Request, State, WebSocketUpgrade};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tunnel_protocol::{
    decode_frame, encode_connected, encode_request, strip_hop_by_hop, Frame, Headers, WireRequest,
};

/// What an inbound `Host` header resolves to: a single label, or a
/// leftmost label equal to the configured root, is the operational root
/// surface; `<label>.<root>` is a tunnel; anything else is invalid.
enum HostKind {
    Root,
    Tunnel(String),
    Invalid,
}

fn host_without_port(host: &str) -> &str {
    host.split(':').next().unwrap_or(host)
}

fn classify_host(host: &str, root_label: &str) -> HostKind {
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() == 1 || labels[0].eq_ignore_ascii_case(root_label) {
        return HostKind::Root;
    }
    if labels.len() == 2 && labels[1].eq_ignore_ascii_case(root_label) {
        return HostKind::Tunnel(labels[0].to_ascii_lowercase());
    }
    HostKind::Invalid
}

/// `fallback` handler for the whole app. Axum doesn't route on `Host`, so
/// every request arrives here and is dispatched by hand.
pub async fn entry(State(state): State<AppState>, req: Request<Body>) -> Response {
    let (mut parts, body) = req.into_parts();

    let host_header = parts
        .headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let kind = classify_host(host_without_port(&host_header), &state.config.root_host);

    let is_upgrade = parts
        .headers
        .get(axum::http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    if is_upgrade {
        return match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
            Ok(ws) => handle_upgrade(ws, state, kind, parts.headers.clone()),
            Err(rejection) => rejection.into_response(),
        };
    }

    let req = Request::from_parts(parts, body);
    handle_http(state, kind, req).await
}

fn handle_upgrade(ws: WebSocketUpgrade, state: AppState, kind: HostKind, headers: HeaderMap) -> Response {
    match kind {
        HostKind::Root => ws.on_upgrade(move |socket| control_channel(socket, state, headers)),
        HostKind::Tunnel(subdomain) => {
            if !state.registry.contains(&subdomain) {
                return (StatusCode::NOT_FOUND, "Tunnel not found").into_response();
            }
            ws.on_upgrade(move |socket| secondary_channel(socket, state, subdomain))
        }
        HostKind::Invalid => (StatusCode::BAD_REQUEST, "unrecognized host").into_response(),
    }
}

async fn handle_http(state: AppState, kind: HostKind, req: Request<Body>) -> Response {
    match kind {
        HostKind::Invalid => (StatusCode::BAD_REQUEST, "unrecognized host").into_response(),
        HostKind::Root => {
            if req.method() != Method::GET {
                (StatusCode::NOT_FOUND, "not found").into_response()
            } else if req.uri().path() == "/api/tunnels" {
                api::list_tunnels(&state).into_response()
            } else if req.uri().path() == "/" {
                (StatusCode::OK, "Tunnel server is running").into_response()
            } else {
                (StatusCode::NOT_FOUND, "not found").into_response()
            }
        }
        HostKind::Tunnel(subdomain) => dispatch_tunnel(state, subdomain, req).await,
    }
}

/// Forwards one HTTP request across the tunnel named by `subdomain` and
/// waits for the matching response (or timeout, or tunnel loss).
async fn dispatch_tunnel(state: AppState, subdomain: String, req: Request<Body>) -> Response {
    let Some(control_tx) = state.registry.control_tx(&subdomain) else {
        return (StatusCode::NOT_FOUND, "Tunnel not found").into_response();
    };

    let (parts, body) = req.into_parts();
    let body_bytes = match axum::body::to_bytes(body, state.config.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return (StatusCode::PAYLOAD_TOO_LARGE, "request body exceeds the configured limit")
                .into_response()
        }
    };

    let mut headers: Headers = Headers::new();
    for (name, value) in parts.headers.iter() {
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().to_string(), value.to_string());
        }
    }
    strip_hop_by_hop(&mut headers);

    let body = if body_bytes.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&body_bytes).into_owned())
    };

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let id = new_request_id();
    let wire_req = WireRequest {
        id: id.clone(),
        method: parts.method.to_string(),
        path,
        headers,
        body,
    };

    let frame = match encode_request(&wire_req) {
        Ok(frame) => frame,
        Err(error) => {
            error!(%error, "failed to encode outbound wire request");
            return (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response();
        }
    };

    // Register the pending entry before the send: the response (or a very
    // fast timeout) must never be able to race ahead of the table knowing
    // to expect it.
    let rx = state
        .pending
        .put(id, subdomain.clone(), state.config.request_timeout);

    if control_tx.send(Message::Text(frame.into())).is_err() {
        state.registry.reap(&subdomain, &state.pending);
        return (StatusCode::BAD_GATEWAY, "Tunnel connection lost").into_response();
    }
    state.registry.touch(&subdomain);

    match rx.await {
        Ok(Outcome::Response(resp)) => build_http_response(resp),
        Ok(Outcome::Timeout) => (StatusCode::GATEWAY_TIMEOUT, "Request timeout").into_response(),
        Ok(Outcome::TunnelLost) => {
            (StatusCode::BAD_GATEWAY, "Tunnel connection lost").into_response()
        }
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response(),
    }
}

fn build_http_response(mut resp: tunnel_protocol::WireResponse) -> Response {
    strip_hop_by_hop(&mut resp.headers);
    let status = StatusCode::from_u16(resp.status).unwrap_or(StatusCode::BAD_GATEWAY);

    let mut builder = Response::builder().status(status);
    for (name, value) in resp.headers.iter() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            builder = builder.header(name, value);
        }
    }

    builder
        .body(Body::from(resp.body))
        .unwrap_or_else(|_| (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response())
}

/// An agent's long-lived control channel: one per tunnel, established at
/// the root host. Carries `WireRequest`/`WireResponse` frames and the
/// one-shot `connected` notice.
async fn control_channel(socket: WebSocket, state: AppState, headers: HeaderMap) {
    let (sink, mut stream) = socket.split();
    let sink = Arc::new(tokio::sync::Mutex::new(sink));
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let reattach_target = headers
        .get("x-bunnel-subdomain")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let subdomain = match reattach_target {
        Some(candidate) if state.registry.reattach(&candidate, tx.clone()) => {
            info!(subdomain = %candidate, "agent reattached within grace window");
            candidate
        }
        _ => {
            let sub = subdomain::allocate(|s| state.registry.contains(s));
            state.registry.register(sub.clone(), tx.clone());
            info!(subdomain = %sub, "agent registered");
            sub
        }
    };

    let notice = match encode_connected(&subdomain) {
        Ok(notice) => notice,
        Err(error) => {
            error!(%error, "failed to encode connected notice");
            state.registry.reap(&subdomain, &state.pending);
            return;
        }
    };
    if tx.send(Message::Text(notice.into())).is_err() {
        state.registry.reap(&subdomain, &state.pending);
        return;
    }

    let outbound_sink = sink.clone();
    let outbound_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let mut sink = outbound_sink.lock().await;
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut fatal = false;
    while let Some(frame) = stream.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(_) => break,
        };
        match msg {
            Message::Text(text) => match decode_frame(&text) {
                Ok(Frame::Response(resp)) => {
                    state.registry.touch(&subdomain);
                    state.pending.complete(&resp.id, resp);
                }
                Ok(_) => {
                    warn!(%subdomain, "control channel sent an out-of-place frame, closing");
                    fatal = true;
                    break;
                }
                Err(error) => {
                    warn!(%subdomain, %error, "malformed control frame, closing");
                    fatal = true;
                    break;
                }
            },
            Message::Binary(data) => {
                // Not a protocol frame: opaque relay payload bound for
                // whichever secondary clients are attached.
                for client in state.registry.client_channels(&subdomain) {
                    let _ = client.send(Message::Binary(data.clone()));
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    outbound_task.abort();

    if fatal {
        state.registry.reap(&subdomain, &state.pending);
    } else {
        state
            .registry
            .mark_offline(subdomain, state.config.grace_window, state.pending.clone());
    }
}

/// A secondary channel: an external client connecting at
/// `<subdomain>.<root>` over WebSocket, relayed opaquely to and from the
/// agent's control channel.
async fn secondary_channel(socket: WebSocket, state: AppState, subdomain: String) {
    // handle_upgrade already checked this; re-check in case the tunnel
    // dropped between the upgrade response and this task running.
    if !state.registry.contains(&subdomain) {
        return;
    }

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx): (ControlTx, _) = mpsc::unbounded_channel();

    if !state.registry.add_client_channel(&subdomain, tx) {
        return;
    }

    let forward_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Close(_) => break,
            other => {
                if let Some(control_tx) = state.registry.control_tx(&subdomain) {
                    let _ = control_tx.send(other);
                }
            }
        }
    }

    forward_task.abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_single_label_as_root() {
        assert!(matches!(classify_host("localhost", "localhost"), HostKind::Root));
    }

    #[test]
    fn classifies_root_label_as_root() {
        assert!(matches!(
            classify_host("bunnel.example.com", "bunnel.example.com"),
            HostKind::Root
        ));
    }

    #[test]
    fn classifies_subdomain_as_tunnel() {
        match classify_host("abc123def456.localhost", "localhost") {
            HostKind::Tunnel(sub) => assert_eq!(sub, "abc123def456"),
            _ => panic!("expected Tunnel"),
        }
    }

    #[test]
    fn rejects_more_than_one_extra_label() {
        assert!(matches!(
            classify_host("a.b.localhost", "localhost"),
            HostKind::Invalid
        ));
    }

    #[test]
    fn strips_port_before_classifying() {
        assert_eq!(host_without_port("sub.localhost:4444"), "sub.localhost");
    }
}
