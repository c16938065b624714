//! HTTP and WebSocket API consumed by the dashboard.
//!
//! Read side: stats, event queries and price history straight off the
//! event store. Write side: the admin attack / reset endpoints. The
//! WebSocket pushes every stored event live; subscribers that fall behind
//! the broadcast ring are disconnected and resync via `/api/events`.

use std::sync::{atomic::Ordering, Arc};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::{format_description::well_known::Rfc3339, Duration as TimeDuration, OffsetDateTime};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::{
    agent::{LatestSnapshot, MonitorStatus},
    chain::{ChainStateView, ProtocolClient},
    errors::ApiError,
    events::{Event, EventPayload},
    restore::perform_restore,
    store::EventStore,
    types::{weth_wei, BlockNumber, DeviationBps, EventId, PriceE8},
};

const DEFAULT_EVENTS_LIMIT: usize = 100;
const MAX_EVENTS_LIMIT: usize = 1_000;
const DEFAULT_PRICES_HOURS: i64 = 1;
const MAX_PRICES_HOURS: i64 = 168;

pub struct ApiState {
    pub store: Arc<EventStore>,
    pub chain: Arc<dyn ProtocolClient>,
    pub status: Arc<MonitorStatus>,
    pub latest: Arc<LatestSnapshot>,
    pub attack_swap_weth: u64,
    pub repause_after_restore: bool,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/stats", get(stats))
        .route("/api/events", get(events))
        .route("/api/events/threats", get(threats))
        .route("/api/events/actions", get(actions))
        .route("/api/prices", get(prices))
        .route("/api/admin/simulate-attack", post(simulate_attack))
        .route("/api/admin/reset-amm", post(reset_amm))
        .route("/api/admin/unpause", post(unpause_all))
        .route("/ws", get(ws_upgrade))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

type ApiResult<T> = Result<Json<T>, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = json!({ "error": { "kind": self.kind(), "message": self.to_string() } });
        (status, Json(body)).into_response()
    }
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct RangeQuery {
    from_id: Option<u64>,
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct HoursQuery {
    hours: Option<i64>,
}

fn clamp_limit(limit: Option<usize>, default: usize) -> usize {
    limit.unwrap_or(default).min(MAX_EVENTS_LIMIT)
}

async fn health(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    let running = state.status.running.load(Ordering::Relaxed);
    let degraded = state.status.degraded.load(Ordering::Relaxed);
    Json(json!({
        "status": if !running { "starting" } else if degraded { "degraded" } else { "healthy" },
        "cycles": state.status.cycles.load(Ordering::Relaxed),
        "llm_calls": state.status.llm_calls.load(Ordering::Relaxed),
    }))
}

#[derive(Serialize)]
struct DashboardStats {
    total_events: u64,
    threats_detected: u64,
    actions_taken: u64,
    current_oracle_price: Option<PriceE8>,
    current_amm_price: Option<PriceE8>,
    price_deviation: Option<DeviationBps>,
    amm_paused: bool,
    vault_paused: bool,
    liquidations_blocked: bool,
    last_update_iso: Option<String>,
}

async fn stats(State(state): State<Arc<ApiState>>) -> ApiResult<DashboardStats> {
    let counters = state.store.counters();
    let snapshot = state.latest.get();

    // Prefer the live flags; fall back to the last observation when the
    // chain is briefly unreachable.
    let flags: ChainStateView = match state.chain.chain_flags().await {
        Ok(flags) => flags,
        Err(err) => {
            warn!("stats falling back to cached flags: {err}");
            snapshot.as_ref().map(|s| s.flags).unwrap_or_default()
        }
    };

    Ok(Json(DashboardStats {
        total_events: counters.total_appended,
        threats_detected: counters.threats_detected,
        actions_taken: counters.actions_taken,
        current_oracle_price: snapshot.as_ref().map(|s| s.oracle_price),
        current_amm_price: snapshot.as_ref().map(|s| s.amm_spot_price),
        price_deviation: snapshot.as_ref().map(|s| s.deviation),
        amm_paused: flags.amm_paused,
        vault_paused: flags.vault_paused,
        liquidations_blocked: flags.liquidations_blocked,
        last_update_iso: snapshot
            .as_ref()
            .and_then(|s| s.observed_at.format(&Rfc3339).ok()),
    }))
}

/// `GET /api/events`: newest first, or an id-range resync when `from_id`
/// is given (oldest first, for WebSocket catch-up).
async fn events(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<RangeQuery>,
) -> ApiResult<Vec<Event>> {
    let limit = clamp_limit(query.limit, DEFAULT_EVENTS_LIMIT);
    let events = match query.from_id {
        Some(from_id) => state.store.range(EventId::new(from_id), limit),
        None => state.store.recent(limit),
    };
    Ok(Json(events))
}

async fn threats(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Vec<Event>> {
    let limit = clamp_limit(query.limit, 50);
    Ok(Json(state.store.recent_matching(limit, Event::is_threat)))
}

async fn actions(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Vec<Event>> {
    let limit = clamp_limit(query.limit, 50);
    Ok(Json(state.store.recent_matching(limit, Event::is_action)))
}

#[derive(Serialize)]
struct PricePoint {
    timestamp: String,
    oracle_price: PriceE8,
    amm_price: PriceE8,
    block_number: BlockNumber,
}

async fn prices(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<HoursQuery>,
) -> ApiResult<Vec<PricePoint>> {
    let hours = query.hours.unwrap_or(DEFAULT_PRICES_HOURS);
    if hours <= 0 {
        return Err(ApiError::BadRequest("hours must be positive".into()));
    }
    let hours = hours.min(MAX_PRICES_HOURS);
    let cutoff = OffsetDateTime::now_utc() - TimeDuration::hours(hours);

    let points = state
        .store
        .since(cutoff, Event::is_observation)
        .into_iter()
        .filter_map(|event| match event.payload {
            EventPayload::Observation {
                block,
                oracle_price,
                amm_price,
                ..
            } => Some(PricePoint {
                timestamp: event.timestamp.format(&Rfc3339).ok()?,
                oracle_price,
                amm_price,
                block_number: block,
            }),
            _ => None,
        })
        .collect();
    Ok(Json(points))
}

#[derive(Serialize)]
struct AttackResponse {
    success: bool,
    blocked: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    price_before: Option<PriceE8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    price_after: Option<PriceE8>,
}

/// `POST /api/admin/simulate-attack`: submits one oversized WETH sell to
/// crash the pool. The monitor is expected to detect and block it; a
/// revert against a paused pool reports the attack as blocked.
async fn simulate_attack(State(state): State<Arc<ApiState>>) -> ApiResult<AttackResponse> {
    let price_before = state
        .chain
        .amm_reserves()
        .await
        .ok()
        .map(|reserves| reserves.spot_price);
    info!(
        amount_weth = state.attack_swap_weth,
        "attack simulation requested"
    );

    match state
        .chain
        .swap_weth_for_usdc(weth_wei(state.attack_swap_weth))
        .await
    {
        Ok(outcome) => {
            let price_after = state
                .chain
                .amm_reserves()
                .await
                .ok()
                .map(|reserves| reserves.spot_price);
            Ok(Json(AttackResponse {
                success: true,
                blocked: false,
                message: "attack swap executed; the monitor should now react".into(),
                tx_hash: Some(format!("{:#x}", outcome.hash)),
                price_before,
                price_after,
            }))
        }
        Err(err) if err.message().to_ascii_lowercase().contains("paused") => {
            Ok(Json(AttackResponse {
                success: true,
                blocked: true,
                message: "attack was blocked: the AMM is paused".into(),
                tx_hash: None,
                price_before,
                price_after: price_before,
            }))
        }
        Err(err) => Ok(Json(AttackResponse {
            success: false,
            blocked: false,
            message: format!("attack simulation failed: {err}"),
            tx_hash: None,
            price_before,
            price_after: None,
        })),
    }
}

#[derive(Serialize)]
struct ResetResponse {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    new_price: Option<PriceE8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tx_hash: Option<String>,
}

/// `POST /api/admin/reset-amm`: runs the restore routine immediately.
async fn reset_amm(State(state): State<Arc<ApiState>>) -> ApiResult<ResetResponse> {
    info!("manual AMM reset requested");
    let outcome = perform_restore(state.chain.as_ref(), state.repause_after_restore).await;
    Ok(Json(ResetResponse {
        success: outcome.success,
        message: outcome.message.clone(),
        new_price: outcome.new_price,
        tx_hash: outcome.tx_hash.map(|hash| format!("{hash:#x}")),
    }))
}

/// `POST /api/admin/unpause`: clears every pause/block flag so a new
/// demonstration can start from a clean protocol.
async fn unpause_all(State(state): State<Arc<ApiState>>) -> ApiResult<serde_json::Value> {
    let mut failures = Vec::new();
    for (label, result) in [
        ("amm", state.chain.unpause_amm().await),
        ("vault", state.chain.unpause_vault().await),
        ("liquidations", state.chain.unblock_liquidations().await),
    ] {
        if let Err(err) = result {
            let text = err.message().to_ascii_lowercase();
            // Unpausing an already-running component is fine.
            if !text.contains("not paused") && !text.contains("not blocked") {
                failures.push(format!("{label}: {err}"));
            }
        }
    }
    if failures.is_empty() {
        Ok(Json(json!({
            "success": true,
            "message": "protocol reset to normal operating state",
        })))
    } else {
        Err(ApiError::Upstream(failures.join("; ")))
    }
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ApiState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

/// Pushes `{type:"new_event", event}` for every store append. Text
/// `"ping"` answers `"pong"`; anything else gets an error payload without
/// closing the stream. Lagging subscribers are disconnected.
async fn handle_ws(socket: WebSocket, state: Arc<ApiState>) {
    let mut updates = state.store.subscribe();
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(event) => {
                    let payload = json!({ "type": "new_event", "event": event });
                    if sink.send(Message::Text(payload.to_string().into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "ws subscriber fell behind; disconnecting");
                    break;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let reply = if text.as_str() == "ping" {
                        "pong".to_string()
                    } else {
                        json!({
                            "type": "error",
                            "kind": "bad_request",
                            "message": "unrecognized message",
                        })
                        .to_string()
                    };
                    if sink.send(Message::Text(reply.into())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!("ws receive error: {err}");
                    break;
                }
            },
        }
    }
}
