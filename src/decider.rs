//! Policy engine: maps a classification onto at most one protective action.
//!
//! `decide` is a pure function of the classification and the last observed
//! on-chain state; when several rules match, the most restrictive action
//! wins.

use serde::Serialize;
use std::fmt;

use crate::{
    chain::ChainStateView,
    config::DeciderThresholds,
    reasoner::{Classification, ThreatKind},
    types::Confidence,
};

/// Protective actions the monitor can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    None,
    PauseAmm,
    BlockLiquidations,
    PauseVault,
    Restore,
}

impl ActionKind {
    /// Restrictiveness order used for tie-breaks and queue coalescing:
    /// PAUSE_VAULT > PAUSE_AMM > BLOCK_LIQUIDATIONS > RESTORE > NONE.
    pub fn severity(self) -> u8 {
        match self {
            ActionKind::None => 0,
            ActionKind::Restore => 1,
            ActionKind::BlockLiquidations => 2,
            ActionKind::PauseAmm => 3,
            ActionKind::PauseVault => 4,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionKind::None => "NONE",
            ActionKind::PauseAmm => "PAUSE_AMM",
            ActionKind::BlockLiquidations => "BLOCK_LIQUIDATIONS",
            ActionKind::PauseVault => "PAUSE_VAULT",
            ActionKind::Restore => "RESTORE",
        };
        f.write_str(name)
    }
}

/// The decider's chosen action plus its justification.
#[derive(Debug, Clone, Serialize)]
pub struct Intent {
    pub action: ActionKind,
    pub rationale: String,
    pub confidence: Confidence,
}

impl Intent {
    fn new(action: ActionKind, rationale: String, confidence: Confidence) -> Self {
        Self {
            action,
            rationale,
            confidence,
        }
    }

    fn none(rationale: &str, confidence: Confidence) -> Self {
        Self::new(ActionKind::None, rationale.to_string(), confidence)
    }
}

/// Applies the policy table. Pure: identical inputs always produce the
/// same intent.
pub fn decide(
    classification: &Classification,
    state: &ChainStateView,
    thresholds: &DeciderThresholds,
) -> Intent {
    let confidence = classification.confidence;

    if classification.kind == ThreatKind::Natural {
        return Intent::none("market activity within normal parameters", confidence);
    }
    if confidence < thresholds.block_liquidations {
        return Intent::none(
            "threat confidence below every action threshold",
            confidence,
        );
    }

    // Collect every matching rule, then pick the most restrictive.
    let mut candidates: Vec<Intent> = Vec::new();

    match classification.kind {
        ThreatKind::FlashLoanAttack if confidence >= thresholds.pause => {
            if state.amm_paused || state.vault_paused {
                candidates.push(Intent::none(
                    "flash loan attack confirmed but protocol already paused",
                    confidence,
                ));
            } else {
                candidates.push(Intent::new(
                    ActionKind::PauseAmm,
                    format!(
                        "flash loan attack detected with {confidence} confidence; pausing AMM \
                         to stop the manipulation"
                    ),
                    confidence,
                ));
            }
        }
        ThreatKind::FlashLoanAttack => {
            // Medium confidence: conservative response.
            if !state.amm_paused && !state.liquidations_blocked {
                candidates.push(Intent::new(
                    ActionKind::BlockLiquidations,
                    format!(
                        "potential flash loan attack with {confidence} confidence; blocking \
                         liquidations as a precaution"
                    ),
                    confidence,
                ));
            }
        }
        ThreatKind::OracleManipulation => {
            if !state.liquidations_blocked {
                candidates.push(Intent::new(
                    ActionKind::BlockLiquidations,
                    format!(
                        "oracle manipulation detected with {confidence} confidence; blocking \
                         liquidations to protect borrowers"
                    ),
                    confidence,
                ));
            } else {
                candidates.push(Intent::none(
                    "oracle manipulation detected but liquidations already blocked",
                    confidence,
                ));
            }
        }
        ThreatKind::Sandwich if confidence >= thresholds.pause => {
            if !state.amm_paused {
                candidates.push(Intent::new(
                    ActionKind::PauseAmm,
                    format!(
                        "sandwich pattern detected with {confidence} confidence; pausing AMM"
                    ),
                    confidence,
                ));
            }
        }
        ThreatKind::UnknownAnomaly if confidence >= thresholds.pause_vault => {
            if !state.amm_paused && !state.vault_paused {
                candidates.push(Intent::new(
                    ActionKind::PauseVault,
                    format!(
                        "unclassified anomaly with {confidence} confidence; pausing vault \
                         until reviewed"
                    ),
                    confidence,
                ));
            }
        }
        _ => {}
    }

    candidates
        .into_iter()
        .max_by_key(|intent| intent.action.severity())
        .unwrap_or_else(|| {
            Intent::none(
                "no policy rule matched at this confidence and state",
                confidence,
            )
        })
}
