//! Forwards a [`WireRequest`] to the local service this agent exposes,
//! and translates the result (or failure) back into a [`WireResponse`].

use std::time::Duration;
use tracing::warn;
use tunnel_protocol::{strip_hop_by_hop, Headers, WireRequest, WireResponse};

/// HEAD-probes the local service before the agent announces itself
/// available, so a misconfigured `--local` fails fast at startup rather
/// than on the first tunneled request.
pub async fn probe_availability(local_base: &str) -> anyhow::Result<()> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?;
    client
        .head(local_base)
        .send()
        .await
        .map_err(|error| anyhow::anyhow!("local service at {local_base} is unreachable: {error}"))?;
    Ok(())
}

pub async fn perform_request(
    client: &reqwest::Client,
    local_base: &str,
    req: WireRequest,
) -> WireResponse {
    let url = format!("{}{}", local_base.trim_end_matches('/'), req.path);

    let method = match reqwest::Method::from_bytes(req.method.as_bytes()) {
        Ok(method) => method,
        Err(_) => return error_response(&req.id, 502, "Bad Gateway"),
    };

    let mut builder = client.request(method, &url);
    let mut headers = req.headers.clone();
    strip_hop_by_hop(&mut headers);
    for (name, value) in headers.iter() {
        builder = builder.header(name, value);
    }
    if let Some(body) = req.body {
        builder = builder.body(body);
    }

    match builder.send().await {
        Ok(response) => {
            let status = response.status().as_u16();
            let mut headers = Headers::new();
            for (name, value) in response.headers().iter() {
                if let Ok(value) = value.to_str() {
                    headers.insert(name.as_str().to_string(), value.to_string());
                }
            }
            strip_hop_by_hop(&mut headers);
            let body = response.text().await.unwrap_or_default();
            WireResponse {
                id: req.id,
                status,
                headers,
                body,
            }
        }
        Err(error) => {
            warn!(%url, %error, "local service request failed");
            error_response(&req.id, 502, "Bad Gateway")
        }
    }
}

fn error_response(id: &str, status: u16, message: &str) -> WireResponse {
    WireResponse {
        id: id.to_string(),
        status,
        headers: Headers::new(),
        body: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_unsupported_method() {
        let client = reqwest::Client::new();
        let req = WireRequest {
            id: "r1".into(),
            method: "BOGUS METHOD".into(),
            path: "/".into(),
            headers: Headers::new(),
            body: None,
        };
        let resp = perform_request(&client, "http://127.0.0.1:1", req).await;
        assert_eq!(resp.status, 502);
    }
}
