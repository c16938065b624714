//! Event model: everything the monitor does is recorded as one tagged
//! event in the append-only store.

use alloy_primitives::B256;
use serde::Serialize;
use time::OffsetDateTime;

use crate::{
    decider::ActionKind,
    filter::AnomalySignal,
    reasoner::{Classification, ClassificationSource, ThreatKind},
    types::{BlockNumber, Confidence, CycleIndex, DeviationBps, EventId, PriceE8},
};

/// One entry of the event store.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: EventId,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub cycle: CycleIndex,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn block(&self) -> Option<BlockNumber> {
        match &self.payload {
            EventPayload::Observation { block, .. }
            | EventPayload::Anomaly { block, .. }
            | EventPayload::Reasoning { block, .. }
            | EventPayload::Decision { block, .. } => Some(*block),
            EventPayload::Action { block, .. } | EventPayload::Restore { block, .. } => *block,
            EventPayload::Lifecycle { .. } => None,
        }
    }

    pub fn is_threat(&self) -> bool {
        matches!(
            &self.payload,
            EventPayload::Reasoning { classification, .. }
                if *classification != ThreatKind::Natural
        )
    }

    pub fn is_action(&self) -> bool {
        matches!(&self.payload, EventPayload::Action { .. })
    }

    pub fn is_observation(&self) -> bool {
        matches!(&self.payload, EventPayload::Observation { .. })
    }
}

/// Lifecycle phases reported by the agent itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecyclePhase {
    Started,
    Stopped,
    Error,
    Degraded,
    Recovered,
}

/// Tagged event body. The `kind` tag is part of the wire format consumed
/// by the dashboard.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind")]
pub enum EventPayload {
    #[serde(rename = "OBSERVATION")]
    Observation {
        block: BlockNumber,
        oracle_price: PriceE8,
        amm_price: PriceE8,
        price_deviation: DeviationBps,
        swaps_in_block: u32,
        oracle_updates_in_block: u32,
        liquidation_seen: bool,
        amm_paused: bool,
        vault_paused: bool,
        liquidations_blocked: bool,
        valid: bool,
    },
    #[serde(rename = "ANOMALY")]
    Anomaly {
        block: BlockNumber,
        signal: AnomalySignal,
        price_deviation: DeviationBps,
    },
    #[serde(rename = "REASONING")]
    Reasoning {
        block: BlockNumber,
        classification: ThreatKind,
        confidence: Confidence,
        explanation: String,
        evidence: Vec<String>,
        source: ClassificationSource,
    },
    #[serde(rename = "DECISION")]
    Decision {
        block: BlockNumber,
        action: ActionKind,
        rationale: String,
        confidence: Confidence,
    },
    #[serde(rename = "ACTION")]
    Action {
        block: Option<BlockNumber>,
        action: ActionKind,
        success: bool,
        tx_hash: Option<B256>,
        reason: Option<String>,
        duration_ms: u64,
    },
    #[serde(rename = "RESTORE")]
    Restore {
        block: Option<BlockNumber>,
        success: bool,
        tx_hash: Option<B256>,
        new_price: Option<PriceE8>,
        target_price: PriceE8,
        message: String,
    },
    #[serde(rename = "LIFECYCLE")]
    Lifecycle {
        phase: LifecyclePhase,
        message: String,
    },
}

impl EventPayload {
    pub fn observation(snapshot: &crate::observer::Snapshot) -> Self {
        EventPayload::Observation {
            block: snapshot.block,
            oracle_price: snapshot.oracle_price,
            amm_price: snapshot.amm_spot_price,
            price_deviation: snapshot.deviation,
            swaps_in_block: snapshot.swaps_in_block,
            oracle_updates_in_block: snapshot.oracle_updates_in_block,
            liquidation_seen: snapshot.liquidation_seen(),
            amm_paused: snapshot.flags.amm_paused,
            vault_paused: snapshot.flags.vault_paused,
            liquidations_blocked: snapshot.flags.liquidations_blocked,
            valid: snapshot.valid,
        }
    }

    pub fn reasoning(block: BlockNumber, classification: &Classification) -> Self {
        EventPayload::Reasoning {
            block,
            classification: classification.kind,
            confidence: classification.confidence,
            explanation: classification.explanation.clone(),
            evidence: classification.evidence.clone(),
            source: classification.source,
        }
    }
}
