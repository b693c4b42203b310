//! # REST API
//!
//! The server's one operational HTTP endpoint, `GET /api/tunnels`, listing
//! currently registered tunnels. Reachable only on the root host (never
//! shadows a `<subdomain>.<root>` caller — see the routing dispatch in
//! `handlers.rs`).

use crate::registry::TunnelState;
use crate::state::AppState;
use axum::Json;
use serde::Serialize;

#[derive(Serialize)]
pub struct TunnelListItem {
    pub subdomain: String,
    pub state: &'static str,
    pub idle_for_secs: u64,
}

pub fn list_tunnels(state: &AppState) -> Json<Vec<TunnelListItem>> {
    let items = state
        .registry
        .snapshot()
        .into_iter()
        .map(|(subdomain, tunnel_state, idle_for)| TunnelListItem {
            subdomain,
            state: match tunnel_state {
                TunnelState::Online => "online",
                TunnelState::OfflineGrace => "offline_grace",
            },
            idle_for_secs: idle_for.as_secs(),
        })
        .collect();
    Json(items)
}
