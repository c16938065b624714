//! The monitor's cycle loop: Observe -> Filter -> Reason -> Decide -> Act.
//!
//! Per-cycle errors are contained within the cycle; the loop always
//! continues. Ten consecutive observation failures degrade the loop to a
//! 10x poll interval until one observation succeeds again.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, RwLock,
};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::{
    actor::{IntentSlot, PendingIntent, StateCache},
    config::{DeciderThresholds, FilterThresholds},
    decider::{decide, ActionKind, Intent},
    errors::ChainError,
    events::{EventPayload, LifecyclePhase},
    filter::{should_reason, AnomalySignal},
    observer::{Observer, Snapshot},
    reasoner::{Classification, Reasoner},
    store::EventStore,
    types::CycleIndex,
};

/// Consecutive observation failures before the loop degrades.
const DEGRADE_AFTER_FAILURES: u32 = 10;
/// Poll interval multiplier while degraded.
const DEGRADED_INTERVAL_FACTOR: u32 = 10;

/// Live counters exposed through the HTTP API.
#[derive(Default)]
pub struct MonitorStatus {
    pub running: AtomicBool,
    pub degraded: AtomicBool,
    pub cycles: AtomicU64,
    pub llm_calls: AtomicU64,
}

/// Most recent snapshot, shared read-mostly with the API server.
#[derive(Default)]
pub struct LatestSnapshot {
    inner: RwLock<Option<Snapshot>>,
}

impl LatestSnapshot {
    pub fn set(&self, snapshot: Snapshot) {
        *self.inner.write().expect("latest snapshot poisoned") = Some(snapshot);
    }

    pub fn get(&self) -> Option<Snapshot> {
        self.inner.read().expect("latest snapshot poisoned").clone()
    }
}

/// What one cycle concluded; returned for tests and logging.
pub struct CycleReport {
    pub snapshot: Snapshot,
    pub signal: Option<AnomalySignal>,
    pub classification: Classification,
    pub intent: Intent,
}

pub struct Agent {
    observer: Observer,
    reasoner: Reasoner,
    filter_thresholds: FilterThresholds,
    decider_thresholds: DeciderThresholds,
    slot: Arc<IntentSlot>,
    state_cache: Arc<StateCache>,
    store: Arc<EventStore>,
    status: Arc<MonitorStatus>,
    latest: Arc<LatestSnapshot>,
    poll_interval: Duration,
    consecutive_failures: u32,
}

impl Agent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        observer: Observer,
        reasoner: Reasoner,
        filter_thresholds: FilterThresholds,
        decider_thresholds: DeciderThresholds,
        slot: Arc<IntentSlot>,
        state_cache: Arc<StateCache>,
        store: Arc<EventStore>,
        status: Arc<MonitorStatus>,
        latest: Arc<LatestSnapshot>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            observer,
            reasoner,
            filter_thresholds,
            decider_thresholds,
            slot,
            state_cache,
            store,
            status,
            latest,
            poll_interval,
            consecutive_failures: 0,
        }
    }

    /// Runs one full cycle. Observation failures abort the cycle without
    /// emitting partial events.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, ChainError> {
        let snapshot = self.observer.observe().await?;
        let cycle = snapshot.cycle;

        self.state_cache.set(snapshot.flags);
        self.latest.set(snapshot.clone());
        self.status.cycles.fetch_add(1, Ordering::Relaxed);
        self.store
            .append(cycle, EventPayload::observation(&snapshot));

        let signal = should_reason(&snapshot, &self.filter_thresholds);

        let classification = match signal {
            Some(signal) => {
                self.store.append(
                    cycle,
                    EventPayload::Anomaly {
                        block: snapshot.block,
                        signal,
                        price_deviation: snapshot.deviation,
                    },
                );
                let classification = self.reasoner.classify(&snapshot, signal).await;
                self.status
                    .llm_calls
                    .store(self.reasoner.llm_calls(), Ordering::Relaxed);
                self.store
                    .append(cycle, EventPayload::reasoning(snapshot.block, &classification));
                if classification.is_threat() {
                    warn!(
                        kind = %classification.kind,
                        confidence = %classification.confidence,
                        "threat classified"
                    );
                }
                classification
            }
            // Quiet cycle: no reasoning event is recorded at all.
            None => Classification::deterministic_skip(),
        };

        let state = self.state_cache.get();
        let intent = decide(&classification, &state, &self.decider_thresholds);

        if intent.action != ActionKind::None {
            self.store.append(
                cycle,
                EventPayload::Decision {
                    block: snapshot.block,
                    action: intent.action,
                    rationale: intent.rationale.clone(),
                    confidence: intent.confidence,
                },
            );
            self.slot.offer(PendingIntent {
                intent: intent.clone(),
                cycle,
                block: snapshot.block,
            });
        }

        Ok(CycleReport {
            snapshot,
            signal,
            classification,
            intent,
        })
    }

    /// Main loop; exits on the shutdown signal.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        self.status.running.store(true, Ordering::Relaxed);
        self.store.append(
            CycleIndex::new(0),
            EventPayload::Lifecycle {
                phase: LifecyclePhase::Started,
                message: format!(
                    "monitor online, polling every {:?}",
                    self.poll_interval
                ),
            },
        );

        let mut interval = self.poll_interval;
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(interval) => {
                    match self.run_cycle().await {
                        Ok(report) => {
                            self.consecutive_failures = 0;
                            if self.status.degraded.swap(false, Ordering::Relaxed) {
                                interval = self.poll_interval;
                                self.store.append(
                                    report.snapshot.cycle,
                                    EventPayload::Lifecycle {
                                        phase: LifecyclePhase::Recovered,
                                        message: "observation recovered; normal poll interval restored"
                                            .to_string(),
                                    },
                                );
                            }
                        }
                        Err(err) => {
                            self.consecutive_failures += 1;
                            warn!(
                                failures = self.consecutive_failures,
                                "observation cycle failed: {err}"
                            );
                            let cycle = CycleIndex::new(self.status.cycles.load(Ordering::Relaxed));
                            if !err.is_transient() {
                                self.store.append(
                                    cycle,
                                    EventPayload::Lifecycle {
                                        phase: LifecyclePhase::Error,
                                        message: format!("cycle aborted: {err}"),
                                    },
                                );
                            }
                            if self.consecutive_failures >= DEGRADE_AFTER_FAILURES
                                && !self.status.degraded.swap(true, Ordering::Relaxed)
                            {
                                interval = self.poll_interval * DEGRADED_INTERVAL_FACTOR;
                                error!(
                                    "{} consecutive observation failures; slowing to {:?}",
                                    self.consecutive_failures, interval
                                );
                                self.store.append(
                                    cycle,
                                    EventPayload::Lifecycle {
                                        phase: LifecyclePhase::Degraded,
                                        message: format!(
                                            "{} consecutive observation failures; poll interval {:?}",
                                            self.consecutive_failures, interval
                                        ),
                                    },
                                );
                            }
                        }
                    }
                }
            }
        }

        self.status.running.store(false, Ordering::Relaxed);
        let counters = self.store.counters();
        let cycles = self.status.cycles.load(Ordering::Relaxed);
        let llm_calls = self.reasoner.llm_calls();
        let blocks_per_llm_call = cycles as f64 / llm_calls.max(1) as f64;
        info!(
            cycles,
            threats = counters.threats_detected,
            actions = counters.actions_taken,
            llm_calls,
            blocks_per_llm_call,
            "monitor stopped"
        );
        self.store.append(
            CycleIndex::new(cycles),
            EventPayload::Lifecycle {
                phase: LifecyclePhase::Stopped,
                message: format!(
                    "monitor stopped after {cycles} cycles ({} threats, {} actions, {llm_calls} llm calls)",
                    counters.threats_detected, counters.actions_taken
                ),
            },
        );
    }
}
