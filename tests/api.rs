//! HTTP API behavior against the in-memory fakes.

mod common;

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use http_body_util::BodyExt;
use alloy_primitives::U256;
use time::OffsetDateTime;
use tower::ServiceExt;

use common::{usd, usdc_units, FakeProtocol};
use vigil::{
    agent::{LatestSnapshot, MonitorStatus},
    chain::{ChainStateView, ProtocolClient},
    events::{EventPayload, LifecyclePhase},
    observer::Snapshot,
    server::{router, ApiState},
    store::EventStore,
    types::{deviation_bps, weth_wei, BlockNumber, CycleIndex},
};

fn snapshot_at(block: u64) -> Snapshot {
    let oracle = usd(2_000);
    let amm = usd(1_980);
    Snapshot {
        cycle: CycleIndex::new(1),
        observed_at: OffsetDateTime::UNIX_EPOCH,
        block: BlockNumber::new(block),
        oracle_price: oracle,
        amm_spot_price: amm,
        weth_reserve: weth_wei(100),
        usdc_reserve: usdc_units(198_000),
        deviation: deviation_bps(oracle, amm),
        swaps_in_block: 0,
        oracle_updates_in_block: 0,
        largest_swap_weth_wei: U256::ZERO,
        liquidations: Vec::new(),
        flags: ChainStateView::default(),
        recent_prices: vec![oracle],
        valid: true,
    }
}

fn test_state(chain: Arc<FakeProtocol>) -> (Arc<ApiState>, Arc<EventStore>) {
    let store = Arc::new(EventStore::new(1_000));
    let chain: Arc<dyn ProtocolClient> = chain;
    let latest = Arc::new(LatestSnapshot::default());
    latest.set(snapshot_at(100));
    let state = Arc::new(ApiState {
        store: Arc::clone(&store),
        chain,
        status: Arc::new(MonitorStatus::default()),
        latest,
        attack_swap_weth: 50,
        repause_after_restore: false,
    });
    (state, store)
}

async fn get_json(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, value)
}

async fn post_json(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, value)
}

#[tokio::test]
async fn health_reports_starting_before_first_cycle() {
    let (state, _store) = test_state(FakeProtocol::healthy());
    let (status, body) = get_json(router(state), "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "starting");
}

#[tokio::test]
async fn stats_merges_store_counters_and_live_flags() {
    let chain = FakeProtocol::healthy();
    chain.set_amm_paused(true);
    let (state, store) = test_state(chain);

    store.append(
        CycleIndex::new(1),
        EventPayload::Lifecycle {
            phase: LifecyclePhase::Started,
            message: "up".into(),
        },
    );

    let (status, body) = get_json(router(state), "/api/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_events"], 1);
    assert_eq!(body["amm_paused"], true);
    assert_eq!(body["vault_paused"], false);
    assert_eq!(body["current_oracle_price"], 2_000.0);
    assert_eq!(body["price_deviation"], 1.0);
    assert!(body["last_update_iso"].is_string());
}

#[tokio::test]
async fn events_endpoint_returns_newest_first_and_supports_resync() {
    let (state, store) = test_state(FakeProtocol::healthy());
    for i in 0..10 {
        store.append(
            CycleIndex::new(i),
            EventPayload::Lifecycle {
                phase: LifecyclePhase::Started,
                message: format!("event {i}"),
            },
        );
    }

    let (status, body) = get_json(router(Arc::clone(&state)), "/api/events?limit=3").await;
    assert_eq!(status, StatusCode::OK);
    let events = body.as_array().unwrap();
    assert_eq!(events.len(), 3);
    assert_eq!(events[0]["id"], 10);

    // Id-range resync returns oldest-first from the requested id.
    let (_, body) = get_json(router(state), "/api/events?from_id=4&limit=3").await;
    let events = body.as_array().unwrap();
    assert_eq!(events[0]["id"], 4);
    assert_eq!(events[2]["id"], 6);
}

#[tokio::test]
async fn prices_rejects_non_positive_hours() {
    let (state, _store) = test_state(FakeProtocol::healthy());
    let (status, body) = get_json(router(state), "/api/prices?hours=0").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "bad_request");
    assert!(body["error"]["message"].is_string());
}

#[tokio::test]
async fn simulate_attack_crashes_a_live_pool() {
    let chain = FakeProtocol::healthy();
    let spot_before = chain.spot_price();
    let (state, _store) = test_state(chain.clone());

    let (status, body) = post_json(router(state), "/api/admin/simulate-attack").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["blocked"], false);
    assert!(body["tx_hash"].is_string());
    assert!(chain.spot_price() < spot_before);
}

#[tokio::test]
async fn simulate_attack_is_blocked_by_paused_amm() {
    let chain = FakeProtocol::healthy();
    chain.set_amm_paused(true);
    let spot_before = chain.spot_price();
    let (state, _store) = test_state(chain.clone());

    let (status, body) = post_json(router(state), "/api/admin/simulate-attack").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["blocked"], true);
    assert_eq!(chain.spot_price(), spot_before);
}

#[tokio::test]
async fn reset_amm_restores_price() {
    let chain = FakeProtocol::healthy();
    chain.crash_to(usd(1_200));
    let (state, _store) = test_state(chain.clone());

    let (status, body) = post_json(router(state), "/api/admin/reset-amm").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    let spot = chain.spot_price();
    assert!(spot.abs_diff_bps(usd(2_000), usd(2_000)) <= 500);
}

#[tokio::test]
async fn unpause_clears_all_flags() {
    let chain = FakeProtocol::healthy();
    chain.set_amm_paused(true);
    let (state, _store) = test_state(chain.clone());

    let (status, body) = post_json(router(state), "/api/admin/unpause").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    let flags = chain.flags();
    assert!(!flags.amm_paused);
    assert!(!flags.vault_paused);
    assert!(!flags.liquidations_blocked);
}
