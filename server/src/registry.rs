//! # Tunnel Registry
//!
//! Keyed mapping from subdomain to [`TunnelInfo`], and the agent-session
//! lifecycle state machine (Online / OfflineGrace / Reaped) described in
//! this module.

use crate::pending::PendingRequestTable;
use axum::extract::ws::Message;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::info;

pub type Subdomain = String;
pub type ControlTx = mpsc::UnboundedSender<Message>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Online,
    OfflineGrace,
}

pub struct TunnelInfo {
    pub control_tx: ControlTx,
    pub client_channels: Vec<ControlTx>,
    pub state: TunnelState,
    pub last_active: Instant,
    /// Bumped on every reattach; a grace timer captures the generation it
    /// was armed with and only reaps if the generation is unchanged when
    /// it fires — still exists *and is still the same offline span*.
    grace_generation: u64,
}

impl TunnelInfo {
    pub fn is_online(&self) -> bool {
        self.state == TunnelState::Online
    }
}

#[derive(Clone)]
pub struct TunnelRegistry {
    tunnels: Arc<DashMap<Subdomain, TunnelInfo>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self {
            tunnels: Arc::new(DashMap::new()),
        }
    }

    /// Creates a fresh Online entry. The caller is expected to have
    /// allocated a collision-free subdomain already (see
    /// [`crate::subdomain::allocate`]).
    pub fn register(&self, sub: Subdomain, control_tx: ControlTx) {
        self.tunnels.insert(
            sub,
            TunnelInfo {
                control_tx,
                client_channels: Vec::new(),
                state: TunnelState::Online,
                last_active: Instant::now(),
                grace_generation: 0,
            },
        );
    }

    /// Rebinds `control_tx` onto an existing `OfflineGrace` entry for
    /// `sub`, transitioning it back to `Online`. Returns `false` (and
    /// mutates nothing) if no such entry exists — including the case
    /// where it raced a grace-expiry reap: the
    /// caller must then fall back to [`Self::register`] with a fresh
    /// subdomain.
    pub fn reattach(&self, sub: &str, control_tx: ControlTx) -> bool {
        match self.tunnels.get_mut(sub) {
            Some(mut entry) if entry.state == TunnelState::OfflineGrace => {
                entry.control_tx = control_tx;
                entry.state = TunnelState::Online;
                entry.last_active = Instant::now();
                entry.grace_generation += 1;
                true
            }
            _ => false,
        }
    }

    pub fn touch(&self, sub: &str) {
        if let Some(mut entry) = self.tunnels.get_mut(sub) {
            entry.last_active = Instant::now();
        }
    }

    /// Adds a secondary client channel's sender to `sub`'s bookkeeping
    /// set. Returns `false` if `sub` isn't registered.
    pub fn add_client_channel(&self, sub: &str, tx: ControlTx) -> bool {
        match self.tunnels.get_mut(sub) {
            Some(mut entry) => {
                entry.client_channels.push(tx);
                true
            }
            None => false,
        }
    }

    pub fn control_tx(&self, sub: &str) -> Option<ControlTx> {
        self.tunnels.get(sub).map(|entry| entry.control_tx.clone())
    }

    /// Senders for every secondary client channel currently attached to
    /// `sub`. Used to relay opaque (non-protocol) frames from the agent
    /// out to whichever external clients are watching this tunnel.
    pub fn client_channels(&self, sub: &str) -> Vec<ControlTx> {
        self.tunnels
            .get(sub)
            .map(|entry| entry.client_channels.clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, sub: &str) -> bool {
        self.tunnels.contains_key(sub)
    }

    /// Transitions Online -> OfflineGrace and arms a grace timer that
    /// reaps `sub` after `grace` unless a reattach happens first. If
    /// `sub` is already OfflineGrace, its existing timer is left
    /// untouched (no extension).
    pub fn mark_offline(&self, sub: Subdomain, grace: Duration, pending: PendingRequestTable) {
        let generation = match self.tunnels.get_mut(&sub) {
            Some(mut entry) => {
                if entry.state == TunnelState::OfflineGrace {
                    return;
                }
                entry.state = TunnelState::OfflineGrace;
                entry.last_active = Instant::now();
                entry.grace_generation
            }
            None => return,
        };

        let registry = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let still_stale = registry
                .tunnels
                .get(&sub)
                .map(|entry| {
                    entry.state == TunnelState::OfflineGrace && entry.grace_generation == generation
                })
                .unwrap_or(false);
            if still_stale {
                registry.reap(&sub, &pending);
            }
        });
    }

    /// Removes `sub`, drops its channels, and fails every pending request
    /// it owns with a tunnel-lost completion. Idempotent: reaping an
    /// already-absent subdomain is a no-op.
    pub fn reap(&self, sub: &str, pending: &PendingRequestTable) {
        if let Some((_, info)) = self.tunnels.remove(sub) {
            info!(subdomain = %sub, "reaping tunnel");
            drop(info.control_tx);
            drop(info.client_channels);
        }
        pending.drain_owner(sub);
    }

    /// Point-in-time view of every live tunnel's subdomain, state, and
    /// time since last activity.
    pub fn snapshot(&self) -> Vec<(Subdomain, TunnelState, Duration)> {
        self.tunnels
            .iter()
            .map(|entry| (entry.key().clone(), entry.state, entry.last_active.elapsed()))
            .collect()
    }

    /// Idle-monitor sweep: Online tunnels get their
    /// `last_active` refreshed first (a heartbeat), so the subsequent
    /// idle check only ever reaps tunnels that are both idle past
    /// `idle_timeout` and not currently Online.
    pub fn sweep_idle(&self, idle_timeout: Duration, pending: &PendingRequestTable) {
        for mut entry in self.tunnels.iter_mut() {
            if entry.state == TunnelState::Online {
                entry.last_active = Instant::now();
            }
        }

        let stale: Vec<Subdomain> = self
            .tunnels
            .iter()
            .filter(|entry| entry.last_active.elapsed() > idle_timeout)
            .map(|entry| entry.key().clone())
            .collect();

        for sub in stale {
            self.reap(&sub, pending);
        }
    }

    /// Reaps every live tunnel. Used on server shutdown.
    pub fn drain_all(&self, pending: &PendingRequestTable) {
        let subs: Vec<Subdomain> = self.tunnels.iter().map(|entry| entry.key().clone()).collect();
        for sub in subs {
            self.reap(&sub, pending);
        }
    }
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn channel() -> (ControlTx, mpsc::UnboundedReceiver<Message>) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn register_then_lookup() {
        let registry = TunnelRegistry::new();
        let (tx, _rx) = channel();
        registry.register("sub1".into(), tx);
        assert!(registry.contains("sub1"));
        assert!(registry.control_tx("sub1").is_some());
    }

    #[test]
    fn reattach_fails_when_online() {
        let registry = TunnelRegistry::new();
        let (tx, _rx) = channel();
        registry.register("sub1".into(), tx);
        let (tx2, _rx2) = channel();
        assert!(!registry.reattach("sub1", tx2));
    }

    #[tokio::test]
    async fn reattach_succeeds_during_grace_and_cancels_reap() {
        let registry = TunnelRegistry::new();
        let pending = PendingRequestTable::new();
        let (tx, _rx) = channel();
        registry.register("sub1".into(), tx);
        registry.mark_offline("sub1".into(), Duration::from_millis(30), pending.clone());

        let (tx2, _rx2) = channel();
        assert!(registry.reattach("sub1", tx2));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(registry.contains("sub1"), "reattached tunnel must survive the original grace deadline");
    }

    #[tokio::test]
    async fn grace_expiry_reaps_and_drains_pending() {
        let registry = TunnelRegistry::new();
        let pending = PendingRequestTable::new();
        let (tx, _rx) = channel();
        registry.register("sub1".into(), tx);
        let rx = pending.put("req1".into(), "sub1".into(), Duration::from_secs(30));

        registry.mark_offline("sub1".into(), Duration::from_millis(20), pending.clone());
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(!registry.contains("sub1"));
        assert!(matches!(
            rx.await.unwrap(),
            crate::pending::Outcome::TunnelLost
        ));
    }

    #[test]
    fn reap_is_idempotent() {
        let registry = TunnelRegistry::new();
        let pending = PendingRequestTable::new();
        registry.reap("never-registered", &pending);
        registry.reap("never-registered", &pending);
    }

    #[test]
    fn sweep_idle_spares_online_and_reaps_stale_grace() {
        let registry = TunnelRegistry::new();
        let pending = PendingRequestTable::new();
        let (tx_online, _r1) = channel();
        registry.register("online-sub".into(), tx_online);

        let (tx_grace, _r2) = channel();
        registry.register("grace-sub".into(), tx_grace);
        if let Some(mut entry) = registry.tunnels.get_mut("grace-sub") {
            entry.state = TunnelState::OfflineGrace;
            entry.last_active = Instant::now() - Duration::from_secs(600);
        }

        registry.sweep_idle(Duration::from_secs(300), &pending);

        assert!(registry.contains("online-sub"));
        assert!(!registry.contains("grace-sub"));
    }
}
