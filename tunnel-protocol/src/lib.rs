//! Wire message types and framing for the bunnel reverse-tunnel protocol.
//!
//! Frames are single-line JSON objects exchanged over a bidirectional
//! WebSocket-style channel. There is no tag shared by every frame kind —
//! each kind is discriminated by which fields are present on the decoded
//! object.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Header name -> value. Duplicate keys during construction are
/// last-write-wins, since this is a plain map keyed by the (already
/// normalized) header name.
pub type Headers = HashMap<String, String>;

/// An HTTP request forwarded from the server to an agent for local
/// execution. `path` carries the full path plus query string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireRequest {
    pub id: String,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// An HTTP response forwarded from an agent back to the server for the
/// waiting HTTP caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireResponse {
    pub id: String,
    pub status: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub body: String,
}

/// Notices sent server -> agent that aren't part of request/response
/// correlation. Currently just the one-shot subdomain assignment sent at
/// session establishment (including after a grace-window reconnect).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlNotice {
    Connected { subdomain: String },
}

/// A decoded control-channel frame, whichever kind it turned out to be.
#[derive(Debug, Clone)]
pub enum Frame {
    Request(WireRequest),
    Response(WireResponse),
    Connected(ControlNotice),
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("frame did not match any known message shape")]
    UnknownShape,
}

/// Encodes a [`WireRequest`] as a single JSON text frame.
pub fn encode_request(req: &WireRequest) -> Result<String, serde_json::Error> {
    serde_json::to_string(req)
}

/// Encodes a [`WireResponse`] as a single JSON text frame.
pub fn encode_response(res: &WireResponse) -> Result<String, serde_json::Error> {
    serde_json::to_string(res)
}

/// Encodes the one-shot `{"type":"connected","subdomain":...}` notice.
pub fn encode_connected(subdomain: &str) -> Result<String, serde_json::Error> {
    serde_json::to_string(&ControlNotice::Connected {
        subdomain: subdomain.to_string(),
    })
}

/// Decodes a frame received on a control channel, discriminating by shape
/// rather than a shared tag:
///   - `type: "connected"` -> [`Frame::Connected`]
///   - `id, status, body` (no `type`) -> [`Frame::Response`]
///   - `id, method, path` (no `type`) -> [`Frame::Request`]
///
/// Rejects frames missing required fields with [`DecodeError`], never
/// panics on attacker-controlled input.
pub fn decode_frame(text: &str) -> Result<Frame, DecodeError> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let obj = value.as_object().ok_or(DecodeError::UnknownShape)?;

    if obj.get("type").and_then(|t| t.as_str()) == Some("connected") {
        let notice: ControlNotice = serde_json::from_value(value)?;
        return Ok(Frame::Connected(notice));
    }

    if obj.contains_key("status") {
        let res: WireResponse = serde_json::from_value(value)?;
        return Ok(Frame::Response(res));
    }

    if obj.contains_key("method") {
        let req: WireRequest = serde_json::from_value(value)?;
        return Ok(Frame::Request(req));
    }

    Err(DecodeError::UnknownShape)
}

/// Hop-by-hop headers that must not be forwarded across the tunnel
/// boundary in either direction (resolved in
/// DESIGN.md).
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

/// Removes hop-by-hop headers (and `host`) from a header map in place.
pub fn strip_hop_by_hop(headers: &mut Headers) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_request() {
        let mut headers = Headers::new();
        headers.insert("x-demo".into(), "1".into());
        let req = WireRequest {
            id: "abc".into(),
            method: "GET".into(),
            path: "/foo?bar=1".into(),
            headers,
            body: None,
        };
        let text = encode_request(&req).unwrap();
        match decode_frame(&text).unwrap() {
            Frame::Request(decoded) => {
                assert_eq!(decoded.id, "abc");
                assert_eq!(decoded.method, "GET");
                assert_eq!(decoded.path, "/foo?bar=1");
                assert_eq!(decoded.headers.get("x-demo").unwrap(), "1");
                assert!(decoded.body.is_none());
            }
            other => panic!("expected Request, got {other:?}"),
        }
    }

    #[test]
    fn round_trips_response() {
        let res = WireResponse {
            id: "abc".into(),
            status: 200,
            headers: Headers::new(),
            body: "hello".into(),
        };
        let text = encode_response(&res).unwrap();
        match decode_frame(&text).unwrap() {
            Frame::Response(decoded) => {
                assert_eq!(decoded.status, 200);
                assert_eq!(decoded.body, "hello");
            }
            other => panic!("expected Response, got {other:?}"),
        }
    }

    #[test]
    fn round_trips_connected_notice() {
        let text = encode_connected("abc123def456").unwrap();
        match decode_frame(&text).unwrap() {
            Frame::Connected(ControlNotice::Connected { subdomain }) => {
                assert_eq!(subdomain, "abc123def456");
            }
            other => panic!("expected Connected, got {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_frame() {
        assert!(matches!(
            decode_frame("{\"nonsense\": true}"),
            Err(DecodeError::UnknownShape)
        ));
        assert!(matches!(
            decode_frame("not json"),
            Err(DecodeError::InvalidJson(_))
        ));
    }

    #[test]
    fn strips_hop_by_hop_headers() {
        let mut headers = Headers::new();
        headers.insert("connection".into(), "keep-alive".into());
        headers.insert("host".into(), "sub.example.com".into());
        headers.insert("content-type".into(), "text/plain".into());
        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("content-type"));
    }
}
