//! # Agent Executor
//!
//! Owns the agent's one outbound connection to the tunnel server. A single
//! call to [`AgentExecutor::connect`] dials in, waits for the server's
//! `ConnectedNotice`, and hands back the assigned subdomain plus the
//! externally-reachable tunnel URL; from then on a background task keeps
//! the session alive — forwarding each [`tunnel_protocol::WireRequest`] to
//! the local service and reattaching to the same subdomain after
//! transient disconnects — until [`AgentExecutor::disconnect`] is called.

use crate::local;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::{error, info, warn};
use tunnel_protocol::{decode_frame, encode_response, ControlNotice, Frame};

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What [`AgentExecutor::connect`] resolves with: the subdomain the server
/// assigned and the externally-reachable `https://<subdomain>.<root>` URL
/// derived from it, per spec 4.8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectInfo {
    pub subdomain: String,
    pub tunnel_url: String,
}

pub struct AgentExecutor {
    inner: Arc<Inner>,
}

struct Inner {
    tunnel_url: String,
    local_base: String,
    insecure: bool,
    last_subdomain: Mutex<Option<String>>,
    connected: AtomicBool,
    shutdown_requested: AtomicBool,
    shutdown: Notify,
}

impl AgentExecutor {
    pub fn new(tunnel_url: String, local_base: String, insecure: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                tunnel_url,
                local_base,
                insecure,
                last_subdomain: Mutex::new(None),
                connected: AtomicBool::new(false),
                shutdown_requested: AtomicBool::new(false),
                shutdown: Notify::new(),
            }),
        }
    }

    /// Dials the tunnel server, performs the local-service availability
    /// probe, and waits for the server's `ConnectedNotice`. Resolves once
    /// with the assigned subdomain and derived tunnel URL, or rejects on
    /// probe or transport failure (spec 4.8). On success, spawns the
    /// background task that serves forwarded requests and reattaches
    /// after disconnects, until [`Self::disconnect`] is called.
    pub async fn connect(&self) -> anyhow::Result<ConnectInfo> {
        if self.inner.shutdown_requested.load(Ordering::SeqCst) {
            anyhow::bail!("this executor has already been disconnected and cannot reconnect");
        }

        let (ws_stream, info) = self.inner.dial_and_await_connected().await?;
        self.inner.connected.store(true, Ordering::SeqCst);

        let inner = self.inner.clone();
        tokio::spawn(async move { inner.serve_and_reconnect(ws_stream).await });

        Ok(info)
    }

    /// Closes the control channel and stops reconnecting. Terminal: an
    /// executor that has been disconnected does not reconnect.
    pub fn disconnect(&self) {
        self.inner.shutdown_requested.store(true, Ordering::SeqCst);
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.shutdown.notify_one();
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}

impl Inner {
    async fn dial_and_await_connected(&self) -> anyhow::Result<(WsStream, ConnectInfo)> {
        local::probe_availability(&self.local_base).await?;

        let request = self.build_request().await?;
        let connector = self.connector();
        let (mut ws_stream, _) =
            tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector)
                .await
                .map_err(|error| anyhow::anyhow!("connecting to tunnel server: {error}"))?;
        info!(tunnel = %self.tunnel_url, "connected to tunnel server");

        let frame = ws_stream
            .next()
            .await
            .ok_or_else(|| anyhow::anyhow!("tunnel server closed the connection before announcing a subdomain"))?
            .map_err(|error| anyhow::anyhow!("reading the connected notice: {error}"))?;

        let text = match frame {
            Message::Text(text) => text,
            other => anyhow::bail!("expected a connected notice, got {other:?}"),
        };

        match decode_frame(&text) {
            Ok(Frame::Connected(ControlNotice::Connected { subdomain })) => {
                *self.last_subdomain.lock().await = Some(subdomain.clone());
                let tunnel_url = derive_tunnel_url(&self.tunnel_url, &subdomain)?;
                info!(%subdomain, %tunnel_url, "tunnel established");
                Ok((ws_stream, ConnectInfo { subdomain, tunnel_url }))
            }
            Ok(other) => anyhow::bail!("expected a connected notice, got {other:?}"),
            Err(error) => anyhow::bail!("malformed connected notice: {error}"),
        }
    }

    /// Serves `ws_stream` until it closes, then keeps reattaching (with a
    /// delay between attempts) until shutdown is requested.
    async fn serve_and_reconnect(self: Arc<Self>, mut ws_stream: WsStream) {
        loop {
            self.serve(ws_stream).await;
            self.connected.store(false, Ordering::SeqCst);

            if self.shutdown_requested.load(Ordering::SeqCst) {
                return;
            }

            ws_stream = match self.reconnect_with_delay().await {
                Some(stream) => stream,
                None => return,
            };
            self.connected.store(true, Ordering::SeqCst);
        }
    }

    async fn reconnect_with_delay(&self) -> Option<WsStream> {
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {}
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
            if self.shutdown_requested.load(Ordering::SeqCst) {
                return None;
            }

            match self.dial_and_await_connected().await {
                Ok((stream, _info)) => return Some(stream),
                Err(error) => {
                    warn!(%error, "reconnect attempt failed, retrying");
                    if self.shutdown_requested.load(Ordering::SeqCst) {
                        return None;
                    }
                }
            }
        }
    }

    /// Reads and dispatches frames on one already-established control
    /// channel until it closes or shutdown is requested.
    async fn serve(&self, ws_stream: WsStream) {
        let (mut sink, mut stream) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let outbound_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let client = reqwest::Client::new();

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    if self.shutdown_requested.load(Ordering::SeqCst) {
                        break;
                    }
                }
                frame = stream.next() => {
                    match frame {
                        None => break,
                        Some(Err(error)) => {
                            warn!(%error, "control channel read error");
                            break;
                        }
                        Some(Ok(msg)) => {
                            if !self.dispatch(msg, &tx, &client).await {
                                break;
                            }
                        }
                    }
                }
            }
        }

        outbound_task.abort();
        let _ = self.close_stream(stream).await;
    }

    /// Handles one inbound frame. Returns `false` when the session should
    /// end (close frame, protocol violation).
    async fn dispatch(
        &self,
        msg: Message,
        tx: &mpsc::UnboundedSender<Message>,
        client: &reqwest::Client,
    ) -> bool {
        match msg {
            Message::Text(text) => match decode_frame(&text) {
                Ok(Frame::Connected(ControlNotice::Connected { subdomain })) => {
                    // Only expected as the first frame of a connection,
                    // already consumed by dial_and_await_connected; a
                    // repeat mid-session is logged and ignored.
                    warn!(%subdomain, "unexpected connected notice mid-session, ignoring");
                    true
                }
                Ok(Frame::Request(req)) => {
                    let tx = tx.clone();
                    let client = client.clone();
                    let local_base = self.local_base.clone();
                    tokio::spawn(async move {
                        let response = local::perform_request(&client, &local_base, req).await;
                        match encode_response(&response) {
                            Ok(text) => {
                                let _ = tx.send(Message::Text(text.into()));
                            }
                            Err(error) => {
                                error!(%error, "failed to encode response frame");
                            }
                        }
                    });
                    true
                }
                Ok(Frame::Response(_)) => {
                    warn!("agent received a response frame, which it never sends a request for");
                    true
                }
                Err(error) => {
                    warn!(%error, "malformed frame from tunnel server, closing session");
                    false
                }
            },
            Message::Close(_) => false,
            _ => true,
        }
    }

    async fn close_stream(&self, mut stream: SplitStream<WsStream>) -> anyhow::Result<()> {
        // Draining is best-effort; the socket is going away regardless.
        while stream.next().await.is_some() {}
        Ok(())
    }

    async fn build_request(
        &self,
    ) -> anyhow::Result<tokio_tungstenite::tungstenite::handshake::client::Request> {
        let mut request = self
            .tunnel_url
            .clone()
            .into_client_request()
            .map_err(|error| anyhow::anyhow!("invalid --tunnel URL: {error}"))?;

        if let Some(subdomain) = self.last_subdomain.lock().await.clone() {
            request.headers_mut().insert(
                "x-bunnel-subdomain",
                subdomain
                    .parse()
                    .map_err(|_| anyhow::anyhow!("previous subdomain is not a valid header value"))?,
            );
        }

        Ok(request)
    }

    fn connector(&self) -> Option<Connector> {
        if !self.insecure {
            return None;
        }

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .expect("default TLS protocol versions are always supported")
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertVerification))
            .with_no_client_auth();

        Some(Connector::Rustls(Arc::new(config)))
    }
}

/// Derives the externally-reachable `<subdomain>.<root>` URL from the
/// control channel's `ws(s)://` URL, swapping the scheme for its HTTP
/// equivalent (spec 4.8: "tunnelUrl is derived from the root host and the
/// notice's subdomain").
fn derive_tunnel_url(tunnel_ws_url: &str, subdomain: &str) -> anyhow::Result<String> {
    let url = url::Url::parse(tunnel_ws_url)
        .map_err(|error| anyhow::anyhow!("invalid --tunnel URL: {error}"))?;
    let scheme = match url.scheme() {
        "ws" => "http",
        "wss" => "https",
        other => other,
    };
    let host = url
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("--tunnel URL has no host"))?;
    let port_suffix = url.port().map(|port| format!(":{port}")).unwrap_or_default();

    Ok(format!("{scheme}://{subdomain}.{host}{port_suffix}/"))
}

/// Accepts any server certificate. Only reachable via `--self-signed`,
/// for talking to a `bunnel-server` running its own throwaway
/// certificate in local development.
#[derive(Debug)]
struct NoCertVerification;

impl rustls::client::danger::ServerCertVerifier for NoCertVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor() -> AgentExecutor {
        AgentExecutor::new(
            "ws://localhost:4444".to_string(),
            "http://127.0.0.1:3000".to_string(),
            false,
        )
    }

    #[tokio::test]
    async fn build_request_without_prior_subdomain_has_no_reattach_header() {
        let executor = executor();
        let request = executor.inner.build_request().await.unwrap();
        assert!(request.headers().get("x-bunnel-subdomain").is_none());
    }

    #[tokio::test]
    async fn build_request_after_connect_reuses_subdomain() {
        let executor = executor();
        *executor.inner.last_subdomain.lock().await = Some("abc123def456".to_string());
        let request = executor.inner.build_request().await.unwrap();
        assert_eq!(
            request.headers().get("x-bunnel-subdomain").unwrap(),
            "abc123def456"
        );
    }

    #[test]
    fn derives_https_url_from_wss_and_subdomain() {
        let url = derive_tunnel_url("wss://bunnel.example.com:4444", "abc123def456").unwrap();
        assert_eq!(url, "https://abc123def456.bunnel.example.com:4444/");
    }

    #[test]
    fn derives_http_url_from_ws_without_explicit_port() {
        let url = derive_tunnel_url("ws://localhost", "abc123def456").unwrap();
        assert_eq!(url, "http://abc123def456.localhost/");
    }

    #[tokio::test]
    async fn is_connected_defaults_to_false() {
        let executor = executor();
        assert!(!executor.is_connected());
    }

    #[test]
    fn disconnect_is_terminal_and_reported_by_is_connected() {
        let executor = executor();
        executor.disconnect();
        assert!(!executor.is_connected());
        assert!(executor.inner.shutdown_requested.load(Ordering::SeqCst));
    }
}
