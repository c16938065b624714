//! On-chain action execution.
//!
//! The actor is the only component that submits protective transactions.
//! It reconciles every intent against the last observed contract state
//! (an intent whose target state already holds is a successful no-op),
//! treats "already paused / already blocked" reverts as success, and is
//! fed through a depth-1 coalescing slot so at most one action is ever in
//! flight.

use std::{
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use alloy_primitives::B256;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::{
    chain::{ChainStateView, ProtocolClient},
    decider::{ActionKind, Intent},
    events::EventPayload,
    restore::RestoreScheduler,
    store::EventStore,
    types::{BlockNumber, CycleIndex},
};

/// Upper bound on finishing an in-flight action during shutdown.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of executing one intent.
#[derive(Debug, Clone)]
pub struct ActionRecord {
    pub intent: Intent,
    pub success: bool,
    pub tx_hash: Option<B256>,
    pub reason: Option<String>,
    pub block: Option<BlockNumber>,
    pub duration: Duration,
}

/// Shared cache of the pause/block flags, refreshed by the observer each
/// tick and optimistically advanced after successful actions.
#[derive(Default)]
pub struct StateCache {
    inner: RwLock<ChainStateView>,
}

impl StateCache {
    pub fn get(&self) -> ChainStateView {
        *self.inner.read().expect("state cache poisoned")
    }

    pub fn set(&self, view: ChainStateView) {
        *self.inner.write().expect("state cache poisoned") = view;
    }

    fn apply(&self, action: ActionKind) {
        let mut view = self.inner.write().expect("state cache poisoned");
        match action {
            ActionKind::PauseAmm => view.amm_paused = true,
            ActionKind::BlockLiquidations => view.liquidations_blocked = true,
            ActionKind::PauseVault => view.vault_paused = true,
            ActionKind::None | ActionKind::Restore => {}
        }
    }
}

/// An intent queued for the worker, tagged with its originating cycle.
#[derive(Debug, Clone)]
pub struct PendingIntent {
    pub intent: Intent,
    pub cycle: CycleIndex,
    pub block: BlockNumber,
}

/// Depth-1 coalescing queue between the agent loop and the actor worker.
///
/// A new intent replaces a pending one of equal or lower severity and is
/// dropped when something more severe is already waiting.
pub struct IntentSlot {
    pending: Mutex<Option<PendingIntent>>,
    notify: Notify,
}

impl IntentSlot {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Offers an intent; returns false when a more severe intent is
    /// already pending.
    pub fn offer(&self, candidate: PendingIntent) -> bool {
        let mut slot = self.pending.lock().expect("intent slot poisoned");
        if let Some(pending) = slot.as_ref() {
            if pending.intent.action.severity() > candidate.intent.action.severity() {
                warn!(
                    pending = %pending.intent.action,
                    dropped = %candidate.intent.action,
                    "more severe intent already queued; dropping"
                );
                return false;
            }
        }
        *slot = Some(candidate);
        drop(slot);
        self.notify.notify_one();
        true
    }

    pub fn take(&self) -> Option<PendingIntent> {
        self.pending.lock().expect("intent slot poisoned").take()
    }

    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

impl Default for IntentSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Executes intents against the chain.
pub struct Actor {
    chain: Arc<dyn ProtocolClient>,
}

impl Actor {
    pub fn new(chain: Arc<dyn ProtocolClient>) -> Self {
        Self { chain }
    }

    /// Executes one intent, reconciling with `state` first.
    pub async fn execute(&self, intent: &Intent, state: &ChainStateView) -> ActionRecord {
        let started = Instant::now();

        if let Some(reason) = redundant_reason(intent.action, state) {
            info!(action = %intent.action, "skipping redundant action: {reason}");
            return ActionRecord {
                intent: intent.clone(),
                success: true,
                tx_hash: None,
                reason: Some(reason.to_string()),
                block: None,
                duration: started.elapsed(),
            };
        }

        let submitted = match intent.action {
            ActionKind::PauseAmm => self.chain.pause_amm().await,
            ActionKind::BlockLiquidations => self.chain.block_liquidations().await,
            ActionKind::PauseVault => self.chain.pause_vault(&intent.rationale).await,
            ActionKind::None | ActionKind::Restore => {
                return ActionRecord {
                    intent: intent.clone(),
                    success: true,
                    tx_hash: None,
                    reason: Some("nothing to execute".to_string()),
                    block: None,
                    duration: started.elapsed(),
                }
            }
        };

        match submitted {
            Ok(outcome) => {
                info!(
                    action = %intent.action,
                    tx = %outcome.hash,
                    block = ?outcome.block,
                    "protective action confirmed"
                );
                ActionRecord {
                    intent: intent.clone(),
                    success: true,
                    tx_hash: Some(outcome.hash),
                    reason: None,
                    block: outcome.block.map(BlockNumber::new),
                    duration: started.elapsed(),
                }
            }
            Err(err) if !err.is_transient() && is_already_in_state(err.message()) => {
                // The contract told us the target state already holds.
                info!(action = %intent.action, "action redundant on chain: {err}");
                ActionRecord {
                    intent: intent.clone(),
                    success: true,
                    tx_hash: None,
                    reason: Some(err.message().to_string()),
                    block: None,
                    duration: started.elapsed(),
                }
            }
            Err(err) => {
                error!(action = %intent.action, "protective action failed: {err}");
                ActionRecord {
                    intent: intent.clone(),
                    success: false,
                    tx_hash: None,
                    reason: Some(err.to_string()),
                    block: None,
                    duration: started.elapsed(),
                }
            }
        }
    }
}

fn redundant_reason(action: ActionKind, state: &ChainStateView) -> Option<&'static str> {
    let redundant = match action {
        ActionKind::PauseAmm => state.amm_paused,
        ActionKind::BlockLiquidations => state.liquidations_blocked,
        ActionKind::PauseVault => state.vault_paused,
        ActionKind::None | ActionKind::Restore => false,
    };
    redundant.then_some("already in target state")
}

fn is_already_in_state(revert: &str) -> bool {
    let lowered = revert.to_ascii_lowercase();
    lowered.contains("already paused")
        || lowered.contains("already blocked")
        || lowered.contains("pausable: paused")
}

/// Serial worker draining the intent slot.
pub struct ActionWorker {
    slot: Arc<IntentSlot>,
    actor: Actor,
    state: Arc<StateCache>,
    store: Arc<EventStore>,
    restore: Arc<RestoreScheduler>,
}

impl ActionWorker {
    pub fn new(
        slot: Arc<IntentSlot>,
        actor: Actor,
        state: Arc<StateCache>,
        store: Arc<EventStore>,
        restore: Arc<RestoreScheduler>,
    ) -> Self {
        Self {
            slot,
            actor,
            state,
            store,
            restore,
        }
    }

    /// Runs until shutdown, then drains at most one pending intent with a
    /// bounded wait.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = self.slot.notified() => {
                    while self.process_next().await.is_some() {}
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        if let Err(_elapsed) =
            tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, async {
                while self.process_next().await.is_some() {}
            })
            .await
        {
            warn!("actor shutdown drain timed out");
        }
    }

    /// Takes and executes one pending intent, recording the result.
    /// Public for deterministic driving in tests.
    pub async fn process_next(&self) -> Option<ActionRecord> {
        let pending = self.slot.take()?;
        let state = self.state.get();
        let record = self.actor.execute(&pending.intent, &state).await;

        if record.success {
            self.state.apply(pending.intent.action);
        }
        let armed_restore =
            record.success && record.tx_hash.is_some() && pending.intent.action == ActionKind::PauseAmm;

        self.store.append(
            pending.cycle,
            EventPayload::Action {
                block: record.block,
                action: pending.intent.action,
                success: record.success,
                tx_hash: record.tx_hash,
                reason: record.reason.clone(),
                duration_ms: record.duration.as_millis() as u64,
            },
        );

        // Only an actual state transition schedules a restore; a
        // redundant pause means one is already pending or done.
        if armed_restore {
            self.restore.arm(pending.cycle);
        }
        Some(record)
    }
}
