//! # Pending Request Table
//!
//! Keyed mapping from request id to a single-shot response completion
//! handle. Each entry completes exactly once — by matching response, by
//! timeout, or by being drained on tunnel reap — whichever happens first.

use dashmap::DashMap;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::warn;
use tunnel_protocol::WireResponse;

pub type RequestId = String;

/// Generates a fresh request id: 16 random bytes, hex-encoded. Collisions
/// within the lifetime of a single pending table are astronomically
/// unlikely and are not otherwise guarded against.
pub fn new_request_id() -> RequestId {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 16] = rng.gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// How a pending HTTP exchange was ultimately resolved.
#[derive(Debug)]
pub enum Outcome {
    Response(WireResponse),
    Timeout,
    TunnelLost,
}

struct Entry {
    subdomain: String,
    completer: oneshot::Sender<Outcome>,
}

#[derive(Clone)]
pub struct PendingRequestTable {
    entries: Arc<DashMap<RequestId, Entry>>,
}

impl PendingRequestTable {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
        }
    }

    /// Registers `id`, owned by `subdomain`, as awaiting completion.
    /// Spawns a timer that removes the entry and resolves it with
    /// [`Outcome::Timeout`] after `timeout` unless it is completed or
    /// drained first.
    pub fn put(
        &self,
        id: RequestId,
        subdomain: String,
        timeout: Duration,
    ) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();
        self.entries.insert(
            id.clone(),
            Entry {
                subdomain,
                completer: tx,
            },
        );

        let table = self.clone();
        let timeout_id = id;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some((_, entry)) = table.entries.remove(&timeout_id) {
                let _ = entry.completer.send(Outcome::Timeout);
            }
        });

        rx
    }

    /// Completes `id` with a response received from the agent. A response
    /// for an unknown or already-completed id is silently dropped and
    /// mutates no state.
    pub fn complete(&self, id: &str, response: WireResponse) {
        match self.entries.remove(id) {
            Some((_, entry)) => {
                let _ = entry.completer.send(Outcome::Response(response));
            }
            None => {
                warn!(request_id = %id, "response for unknown or already-resolved request, dropping");
            }
        }
    }

    /// Completes and removes every entry owned by `subdomain` with
    /// [`Outcome::TunnelLost`]. Called when a tunnel is reaped.
    pub fn drain_owner(&self, subdomain: &str) {
        let ids: Vec<RequestId> = self
            .entries
            .iter()
            .filter(|entry| entry.subdomain == subdomain)
            .map(|entry| entry.key().clone())
            .collect();
        for id in ids {
            if let Some((_, entry)) = self.entries.remove(&id) {
                let _ = entry.completer.send(Outcome::TunnelLost);
            }
        }
    }
}

impl Default for PendingRequestTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn completes_with_response() {
        let table = PendingRequestTable::new();
        let rx = table.put("r1".into(), "sub".into(), Duration::from_secs(30));
        table.complete(
            "r1",
            WireResponse {
                id: "r1".into(),
                status: 200,
                headers: Default::default(),
                body: "ok".into(),
            },
        );
        match rx.await.unwrap() {
            Outcome::Response(resp) => assert_eq!(resp.body, "ok"),
            other => panic!("expected Response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_id_completion_is_a_noop() {
        let table = PendingRequestTable::new();
        table.complete(
            "missing",
            WireResponse {
                id: "missing".into(),
                status: 200,
                headers: Default::default(),
                body: String::new(),
            },
        );
        assert!(table.entries.is_empty());
    }

    #[tokio::test]
    async fn times_out_when_unanswered() {
        let table = PendingRequestTable::new();
        let rx = table.put("r1".into(), "sub".into(), Duration::from_millis(10));
        match rx.await.unwrap() {
            Outcome::Timeout => {}
            other => panic!("expected Timeout, got {other:?}"),
        }
        assert!(table.entries.is_empty());
    }

    #[test]
    fn request_ids_are_unique_and_hex() {
        let a = new_request_id();
        let b = new_request_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn drain_owner_resolves_only_matching_entries() {
        let table = PendingRequestTable::new();
        let rx_a = table.put("a".into(), "sub-a".into(), Duration::from_secs(30));
        let rx_b = table.put("b".into(), "sub-b".into(), Duration::from_secs(30));
        table.drain_owner("sub-a");
        assert!(matches!(rx_a.await.unwrap(), Outcome::TunnelLost));
        assert!(table.entries.contains_key("b"));
        drop(rx_b);
    }
}
