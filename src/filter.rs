//! Deterministic anomaly filter.
//!
//! The filter is the gatekeeper for LLM calls: it is a pure predicate over
//! the current snapshot and the trailing price window. All comparisons are
//! strict (a value exactly at a threshold is not an anomaly) and all
//! percentage math runs on integer basis points.

use serde::Serialize;
use std::fmt;

use crate::{config::FilterThresholds, observer::Snapshot, types::PriceE8};

/// The six deterministic conditions that justify invoking the reasoner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnomalySignal {
    LargeDeviation,
    MultipleOracleUpdates,
    AttackSwapPattern,
    SameBlockRecovery,
    UnfairLiquidation,
    ExtremeMove,
}

impl fmt::Display for AnomalySignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AnomalySignal::LargeDeviation => "LARGE_DEVIATION",
            AnomalySignal::MultipleOracleUpdates => "MULTIPLE_ORACLE_UPDATES",
            AnomalySignal::AttackSwapPattern => "ATTACK_SWAP_PATTERN",
            AnomalySignal::SameBlockRecovery => "SAME_BLOCK_RECOVERY",
            AnomalySignal::UnfairLiquidation => "UNFAIR_LIQUIDATION",
            AnomalySignal::ExtremeMove => "EXTREME_MOVE",
        };
        f.write_str(name)
    }
}

/// Returns the first matching anomaly signal, or `None` when the snapshot
/// does not warrant reasoning. Invalid snapshots never reason.
pub fn should_reason(snapshot: &Snapshot, thresholds: &FilterThresholds) -> Option<AnomalySignal> {
    if !snapshot.valid {
        return None;
    }

    let deviation = snapshot.deviation.abs();

    // A liquidation taken against a disagreeing price is the most
    // specific signal; it is checked ahead of the generic deviation rule
    // so the reasoner can dedup on the individual liquidation events.
    if snapshot.liquidation_seen() && deviation > thresholds.deviation_bps {
        return Some(AnomalySignal::UnfairLiquidation);
    }

    // Oracle and AMM disagree beyond the configured threshold.
    if deviation > thresholds.deviation_bps {
        return Some(AnomalySignal::LargeDeviation);
    }

    // More than one oracle update landed in the block window.
    if snapshot.oracle_updates_in_block > 1 {
        return Some(AnomalySignal::MultipleOracleUpdates);
    }

    // Burst of swaps, or any single oversized swap.
    if snapshot.swaps_in_block > thresholds.max_swaps_in_block
        || snapshot.largest_swap_weth_wei > thresholds.large_swap_wei
    {
        return Some(AnomalySignal::AttackSwapPattern);
    }

    // Spike-and-recover across the three-price window: the endpoints
    // agree while the middle price jumped.
    if let [p0, p1, p2] = snapshot.recent_prices.as_slice() {
        let settled = p0.abs_diff_bps(*p2, *p0) < thresholds.recovery_settle_bps;
        let spiked = p1.abs_diff_bps(*p0, *p0) > thresholds.recovery_spike_bps;
        if settled && spiked {
            return Some(AnomalySignal::SameBlockRecovery);
        }
    }

    // Single-step extreme move.
    if let Some(window) = last_two(&snapshot.recent_prices) {
        let (prev, curr) = window;
        if curr.abs_diff_bps(prev, prev) > thresholds.extreme_move_bps {
            return Some(AnomalySignal::ExtremeMove);
        }
    }

    None
}

fn last_two(prices: &[PriceE8]) -> Option<(PriceE8, PriceE8)> {
    match prices {
        [.., prev, curr] => Some((*prev, *curr)),
        _ => None,
    }
}
