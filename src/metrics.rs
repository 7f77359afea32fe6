//! Process-wide metrics and the read-only operational HTTP surface.
//!
//! Counters are global `lazy_static` registrations against the default `prometheus`
//! registry, matching how the rest of the pack wires up metrics — a single process
//! has exactly one registry, so there's no need to thread a registry handle through
//! every component.

use crate::kv::IndexStore;
use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use ethers::types::Address;
use lazy_static::lazy_static;
use prometheus::{register_int_counter, IntCounter};
use serde_json::json;
use std::net::SocketAddr;

lazy_static! {
    pub static ref CHALLENGES_SEEN: IntCounter =
        register_int_counter!("oracle_miner_challenges_seen_total", "New challenges observed by the Tasker").unwrap();
    pub static ref SOLUTIONS_FOUND: IntCounter =
        register_int_counter!("oracle_miner_solutions_found_total", "Solutions found by PoW workers").unwrap();
    pub static ref SOLUTIONS_FORWARDED: IntCounter = register_int_counter!(
        "oracle_miner_solutions_forwarded_total",
        "Solutions forwarded from the Mining Manager to a Submitter"
    )
    .unwrap();
    pub static ref TXS_SENT: IntCounter =
        register_int_counter!("oracle_miner_txs_sent_total", "Transactions broadcast by the Transactor").unwrap();
    pub static ref TXS_SUCCEEDED: IntCounter =
        register_int_counter!("oracle_miner_txs_succeeded_total", "Transactions confirmed with status 1").unwrap();
    pub static ref TXS_FAILED: IntCounter =
        register_int_counter!("oracle_miner_txs_failed_total", "Transactions that ended in a non-retriable failure").unwrap();
    pub static ref TRACKER_CYCLES: IntCounter =
        register_int_counter!("oracle_miner_tracker_cycles_total", "Completed tracker poll cycles, all trackers combined").unwrap();
    pub static ref TRACKER_FAILURES: IntCounter =
        register_int_counter!("oracle_miner_tracker_failures_total", "Tracker poll cycles that returned an error").unwrap();
}

#[derive(Clone)]
struct AppState {
    store: IndexStore,
    accounts: Vec<Address>,
    /// Addresses the `disputeStatus`/`tributeBalance` views will answer queries about.
    /// Empty means unrestricted (answer for any address), matching the config default.
    whitelist: std::collections::BTreeSet<Address>,
}

impl AppState {
    fn address_allowed(&self, address: Address) -> bool {
        self.whitelist.is_empty() || self.whitelist.contains(&address)
    }
}

/// Builds the router serving `/metrics` and the optional read-only JSON views.
pub fn router(store: IndexStore, accounts: Vec<Address>, whitelist: std::collections::BTreeSet<Address>) -> Router {
    let state = AppState { store, accounts, whitelist };
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/currentChallenge", get(current_challenge_handler))
        .route("/disputeStatus/:address", get(dispute_status_handler))
        .route("/tributeBalance/:address", get(tribute_balance_handler))
        .with_state(state)
}

pub async fn serve(
    store: IndexStore,
    accounts: Vec<Address>,
    whitelist: std::collections::BTreeSet<Address>,
    addr: SocketAddr,
) -> eyre::Result<()> {
    let app = router(store, accounts, whitelist);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "metrics server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn metrics_handler() -> impl IntoResponse {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buf = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buf) {
        tracing::warn!(error = %err, "failed to encode metrics");
        return (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "encode error".to_string());
    }
    (axum::http::StatusCode::OK, String::from_utf8_lossy(&buf).to_string())
}

async fn current_challenge_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.get_bytes("current_challenge") {
        Ok(Some(raw)) => Json(json!({ "currentChallenge": format!("0x{}", hex::encode(raw)) })).into_response(),
        Ok(None) => (axum::http::StatusCode::OK, Json(json!({ "currentChallenge": null }))).into_response(),
        Err(err) => (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": err.to_string() })),
        )
            .into_response(),
    }
}

async fn dispute_status_handler(
    State(state): State<AppState>,
    axum::extract::Path(address): axum::extract::Path<String>,
) -> impl IntoResponse {
    match address.parse::<Address>() {
        Ok(addr) if !state.address_allowed(addr) => (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": format!("address {address} is not in server_whitelist") })),
        )
            .into_response(),
        _ => {
            let key = format!("dispute_status/{address}");
            match state.store.get_bool(&key) {
                Ok(value) => Json(json!({ "disputeStatus": value.unwrap_or(false) })).into_response(),
                Err(err) => (
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": err.to_string() })),
                )
                    .into_response(),
            }
        }
    }
}

async fn tribute_balance_handler(
    State(state): State<AppState>,
    axum::extract::Path(address): axum::extract::Path<String>,
) -> impl IntoResponse {
    if !state
        .accounts
        .iter()
        .any(|a| format!("{:#x}", a).eq_ignore_ascii_case(&address))
    {
        return (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": format!("unknown account {address}") })),
        )
            .into_response();
    }
    if let Ok(addr) = address.parse::<Address>() {
        if !state.address_allowed(addr) {
            return (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": format!("address {address} is not in server_whitelist") })),
            )
                .into_response();
        }
    }
    let key = format!("tribute_balance/{address}");
    match state.store.get_u256(&key) {
        Ok(Some(value)) => Json(json!({ "tributeBalance": format!("{:#x}", value) })).into_response(),
        Ok(None) => (axum::http::StatusCode::OK, Json(json!({ "tributeBalance": null }))).into_response(),
        Err(err) => (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": err.to_string() })),
        )
            .into_response(),
    }
}
