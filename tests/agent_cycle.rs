//! End-to-end cycles against the in-memory market and scripted LLM.

mod common;

use std::time::Duration;

use common::{build_harness, usd, FakeProtocol, FixedLlm, ScriptedReply};
use vigil::{
    actor::{Actor, PendingIntent},
    chain::ChainStateView,
    decider::{ActionKind, Intent},
    events::EventPayload,
    reasoner::{ClassificationSource, ThreatKind},
    types::{Confidence, CycleIndex},
};

const LLM_TIMEOUT: Duration = Duration::from_millis(50);
const RESTORE_DELAY: Duration = Duration::from_millis(100);

fn kinds(store: &vigil::store::EventStore) -> Vec<&'static str> {
    store
        .range(vigil::types::EventId::new(0), 10_000)
        .into_iter()
        .map(|event| match event.payload {
            EventPayload::Observation { .. } => "OBSERVATION",
            EventPayload::Anomaly { .. } => "ANOMALY",
            EventPayload::Reasoning { .. } => "REASONING",
            EventPayload::Decision { .. } => "DECISION",
            EventPayload::Action { .. } => "ACTION",
            EventPayload::Restore { .. } => "RESTORE",
            EventPayload::Lifecycle { .. } => "LIFECYCLE",
        })
        .collect()
}

#[tokio::test]
async fn quiet_market_emits_observation_only() {
    let chain = FakeProtocol::healthy();
    // Oracle 2000, AMM spot 2002: deviation 0.10%.
    chain.set_reserves(
        vigil::types::weth_wei(100),
        common::usdc_units(200_200),
    );
    let llm = FixedLlm::empty();
    let mut harness = build_harness(chain.clone(), llm.clone(), LLM_TIMEOUT, RESTORE_DELAY);

    let report = harness.agent.run_cycle().await.unwrap();

    assert!(report.signal.is_none());
    assert_eq!(report.intent.action, ActionKind::None);
    assert_eq!(llm.call_count(), 0);
    assert_eq!(kinds(&harness.store), vec!["OBSERVATION"]);
}

#[tokio::test]
async fn deviation_exactly_at_threshold_stays_quiet() {
    let chain = FakeProtocol::healthy();
    // Oracle 2000, AMM 2100: exactly 5.00% deviation.
    chain.set_reserves(
        vigil::types::weth_wei(100),
        common::usdc_units(210_000),
    );
    let llm = FixedLlm::empty();
    let mut harness = build_harness(chain.clone(), llm.clone(), LLM_TIMEOUT, RESTORE_DELAY);

    let report = harness.agent.run_cycle().await.unwrap();

    assert_eq!(report.snapshot.deviation.abs(), 500);
    assert!(report.signal.is_none());
    assert_eq!(llm.call_count(), 0);
    assert_eq!(kinds(&harness.store), vec!["OBSERVATION"]);
}

#[tokio::test]
async fn crash_is_classified_paused_and_restored() {
    let chain = FakeProtocol::healthy();
    let llm = FixedLlm::new(vec![ScriptedReply::assessment(
        "FLASH_LOAN_ATTACK",
        0.92,
        &["40% deviation", "large swap"],
    )]);
    let mut harness = build_harness(chain.clone(), llm.clone(), LLM_TIMEOUT, RESTORE_DELAY);

    // Cycle 0: healthy baseline.
    harness.agent.run_cycle().await.unwrap();

    // The attack: pool crashed to ~$1200 with one 50 WETH swap.
    chain.crash_to(usd(1_200));
    chain.push_swap(50);

    let report = harness.agent.run_cycle().await.unwrap();
    assert_eq!(
        report.signal,
        Some(vigil::filter::AnomalySignal::LargeDeviation)
    );
    assert_eq!(report.classification.kind, ThreatKind::FlashLoanAttack);
    assert_eq!(report.classification.confidence.bps(), 9_200);
    assert_eq!(report.intent.action, ActionKind::PauseAmm);

    // The worker executes the queued pause and arms the restore.
    let record = harness.worker.process_next().await.expect("queued action");
    assert!(record.success);
    assert!(record.tx_hash.is_some());
    assert!(chain.flags().amm_paused);
    assert_eq!(chain.pause_amm_calls(), 1);

    // After the restore delay the pool is unpaused and rebalanced.
    tokio::time::sleep(RESTORE_DELAY * 5).await;
    let spot = chain.spot_price();
    assert!(
        spot.abs_diff_bps(usd(2_000), usd(2_000)) <= 500,
        "spot {spot} not within 5% of $2000 after restore"
    );
    assert!(!chain.flags().amm_paused, "restore leaves the pool unpaused");

    assert_eq!(
        kinds(&harness.store),
        vec![
            "OBSERVATION",
            "OBSERVATION",
            "ANOMALY",
            "REASONING",
            "DECISION",
            "ACTION",
            "RESTORE",
        ]
    );
    let restore_event = harness
        .store
        .latest_matching(|e| matches!(e.payload, EventPayload::Restore { .. }))
        .unwrap();
    match restore_event.payload {
        EventPayload::Restore {
            success, new_price, ..
        } => {
            assert!(success);
            let new_price = new_price.unwrap();
            assert!(new_price.abs_diff_bps(usd(2_000), usd(2_000)) <= 500);
        }
        _ => unreachable!(),
    }
    assert_eq!(llm.call_count(), 1);
}

#[tokio::test]
async fn identical_block_is_dedup_skipped() {
    let chain = FakeProtocol::healthy();
    let llm = FixedLlm::new(vec![ScriptedReply::assessment(
        "FLASH_LOAN_ATTACK",
        0.92,
        &["crash"],
    )]);
    let mut harness = build_harness(chain.clone(), llm.clone(), LLM_TIMEOUT, RESTORE_DELAY);

    chain.crash_to(usd(1_200));
    let first = harness.agent.run_cycle().await.unwrap();
    assert_eq!(first.classification.source, ClassificationSource::Llm);
    assert_eq!(llm.call_count(), 1);

    // Same market state, same block: the reasoner must not call again.
    let second = harness.agent.run_cycle().await.unwrap();
    assert_eq!(second.classification.source, ClassificationSource::DedupSkip);
    assert_eq!(second.classification.kind, ThreatKind::Natural);
    assert_eq!(second.classification.confidence, Confidence::ZERO);
    assert_eq!(second.intent.action, ActionKind::None);
    assert_eq!(llm.call_count(), 1);

    // Second cycle recorded reasoning but no decision or action.
    let all = kinds(&harness.store);
    assert_eq!(
        all.iter().filter(|kind| **kind == "REASONING").count(),
        2
    );
    assert_eq!(all.iter().filter(|kind| **kind == "DECISION").count(), 1);
}

#[tokio::test]
async fn llm_timeout_degrades_softly_and_retries_next_block() {
    let chain = FakeProtocol::healthy();
    let llm = FixedLlm::new(vec![
        ScriptedReply::Hang,
        ScriptedReply::assessment("FLASH_LOAN_ATTACK", 0.92, &["crash"]),
    ]);
    let mut harness = build_harness(chain.clone(), llm.clone(), LLM_TIMEOUT, RESTORE_DELAY);

    chain.crash_to(usd(1_200));
    let report = harness.agent.run_cycle().await.unwrap();
    assert_eq!(report.classification.kind, ThreatKind::UnknownAnomaly);
    assert_eq!(report.classification.confidence.bps(), 5_000);
    assert_eq!(report.classification.explanation, "LLM unavailable");
    // 0.5 confidence reaches no policy rule.
    assert_eq!(report.intent.action, ActionKind::None);
    assert_eq!(llm.call_count(), 1);

    // Dedup state was not updated, so the next block retries and gets the
    // real assessment.
    chain.advance_block();
    let retry = harness.agent.run_cycle().await.unwrap();
    assert_eq!(retry.classification.kind, ThreatKind::FlashLoanAttack);
    assert_eq!(retry.intent.action, ActionKind::PauseAmm);
    assert_eq!(llm.call_count(), 2);
}

#[tokio::test]
async fn redundant_pause_is_a_successful_noop() {
    let chain = FakeProtocol::healthy();
    let llm = FixedLlm::empty();
    let harness = build_harness(chain.clone(), llm, LLM_TIMEOUT, RESTORE_DELAY);

    // The AMM is already paused and the cache knows it.
    chain.set_amm_paused(true);
    harness.state_cache.set(ChainStateView {
        amm_paused: true,
        ..ChainStateView::default()
    });

    for attempt in 0..3u64 {
        harness.slot.offer(PendingIntent {
            intent: Intent {
                action: ActionKind::PauseAmm,
                rationale: "test".into(),
                confidence: Confidence::from_f64(0.9),
            },
            cycle: CycleIndex::new(attempt),
            block: vigil::types::BlockNumber::new(100),
        });
        let record = harness.worker.process_next().await.expect("queued");
        assert!(record.success);
        assert!(record.tx_hash.is_none());
        assert_eq!(record.reason.as_deref(), Some("already in target state"));
    }

    // Three ActionEvents, no transaction ever reached the chain.
    assert_eq!(harness.store.counters().actions_taken, 3);
    assert_eq!(chain.pause_amm_calls(), 0);
    assert!(chain.flags().amm_paused);
}

#[tokio::test]
async fn stale_cache_already_paused_revert_counts_as_success() {
    let chain = FakeProtocol::healthy();
    chain.set_amm_paused(true);
    let seam: std::sync::Arc<dyn vigil::chain::ProtocolClient> = chain.clone();
    let actor = Actor::new(seam);

    // The cache is stale: it believes the AMM is live.
    let record = actor
        .execute(
            &Intent {
                action: ActionKind::PauseAmm,
                rationale: "test".into(),
                confidence: Confidence::from_f64(0.9),
            },
            &ChainStateView::default(),
        )
        .await;

    assert!(record.success);
    assert!(record.tx_hash.is_none());
    assert!(record.reason.unwrap().to_lowercase().contains("already paused"));
    assert_eq!(chain.pause_amm_calls(), 1);
}

#[tokio::test]
async fn quiet_run_never_calls_llm() {
    let chain = FakeProtocol::healthy();
    let llm = FixedLlm::empty();
    let mut harness = build_harness(chain.clone(), llm.clone(), LLM_TIMEOUT, RESTORE_DELAY);

    let mut last_id = 0;
    let mut last_cycle = None;
    for _ in 0..120 {
        chain.advance_block();
        let report = harness.agent.run_cycle().await.unwrap();
        assert!(report.signal.is_none());

        // Monotonicity: ids and cycle indices strictly increase.
        let newest = harness.store.recent(1).pop().unwrap();
        assert!(newest.id.into_inner() > last_id);
        last_id = newest.id.into_inner();
        if let Some(previous) = last_cycle {
            assert!(report.snapshot.cycle > previous);
        }
        last_cycle = Some(report.snapshot.cycle);
    }

    assert_eq!(llm.call_count(), 0);
    let counters = harness.store.counters();
    assert_eq!(counters.total_appended, 120);
    assert_eq!(counters.threats_detected, 0);
    assert_eq!(counters.actions_taken, 0);
}

#[tokio::test]
async fn medium_confidence_flash_loan_blocks_liquidations() {
    let chain = FakeProtocol::healthy();
    let llm = FixedLlm::new(vec![ScriptedReply::assessment(
        "FLASH_LOAN_ATTACK",
        0.60,
        &["suspicious"],
    )]);
    let mut harness = build_harness(chain.clone(), llm, LLM_TIMEOUT, RESTORE_DELAY);

    chain.crash_to(usd(1_200));
    let report = harness.agent.run_cycle().await.unwrap();
    assert_eq!(report.intent.action, ActionKind::BlockLiquidations);

    let record = harness.worker.process_next().await.expect("queued");
    assert!(record.success);
    assert!(chain.flags().liquidations_blocked);
    assert!(!chain.flags().amm_paused);
}

#[tokio::test]
async fn transient_observation_failure_aborts_cycle_without_events() {
    let chain = FakeProtocol::healthy();
    let llm = FixedLlm::empty();
    let mut harness = build_harness(chain.clone(), llm, LLM_TIMEOUT, RESTORE_DELAY);

    chain.fail_next_reads(1);
    let result = harness.agent.run_cycle().await;
    assert!(result.is_err());
    assert_eq!(harness.store.counters().total_appended, 0);

    // Next tick recovers.
    let report = harness.agent.run_cycle().await.unwrap();
    assert!(report.signal.is_none());
    assert_eq!(harness.store.counters().total_appended, 1);
}

#[tokio::test(start_paused = true)]
async fn repeated_failures_degrade_then_recover() {
    let chain = FakeProtocol::healthy();
    let llm = FixedLlm::empty();
    let harness = build_harness(chain.clone(), llm, LLM_TIMEOUT, RESTORE_DELAY);

    // Exactly ten failing ticks, then healthy again.
    chain.fail_next_reads(10);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let store = harness.store.clone();
    let agent_task = tokio::spawn(harness.agent.run(shutdown_rx));

    let has_phase = |store: &vigil::store::EventStore, wanted: vigil::events::LifecyclePhase| {
        store
            .latest_matching(move |event| {
                matches!(
                    event.payload,
                    EventPayload::Lifecycle { phase, .. } if phase == wanted
                )
            })
            .is_some()
    };

    // Wait (in paused time) for the degraded transition.
    for _ in 0..5_000 {
        if has_phase(&store, vigil::events::LifecyclePhase::Degraded) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(has_phase(&store, vigil::events::LifecyclePhase::Degraded));

    // Reads succeed again: the agent recovers at the slowed interval.
    for _ in 0..5_000 {
        if has_phase(&store, vigil::events::LifecyclePhase::Recovered) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(has_phase(&store, vigil::events::LifecyclePhase::Recovered));

    shutdown_tx.send(true).unwrap();
    agent_task.await.unwrap();
    assert!(has_phase(&store, vigil::events::LifecyclePhase::Stopped));
}
