//! Per-cycle market observation.
//!
//! Each tick reads the oracle, the AMM pool and the vault, fetches the
//! protocol logs emitted since the previous tick and assembles an
//! immutable [`Snapshot`]. A tick that fails transiently is aborted whole;
//! no partial snapshot is ever emitted.

use std::sync::Arc;

use alloy_primitives::U256;
use ringbuffer::{AllocRingBuffer, RingBuffer};
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::{
    chain::{ChainStateView, LiquidationSeen, ProtocolClient, ProtocolLogs, SwapSeen},
    errors::ChainResult,
    types::{deviation_bps, spot_price_e8, BlockNumber, CycleIndex, DeviationBps, PriceE8},
};

/// How many per-block oracle prices the observer retains.
const PRICE_HISTORY_CAPACITY: usize = 16;
/// How many trailing prices a snapshot carries for the filter/reasoner.
pub const SNAPSHOT_PRICE_WINDOW: usize = 3;
/// Reported spot and reserve-derived spot may differ by at most this many
/// basis points before the snapshot is considered inconsistent.
const RESERVE_CONSISTENCY_BPS: u64 = 10;

/// Immutable market state captured by one observation cycle.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub cycle: CycleIndex,
    pub observed_at: OffsetDateTime,
    pub block: BlockNumber,
    pub oracle_price: PriceE8,
    pub amm_spot_price: PriceE8,
    pub weth_reserve: U256,
    pub usdc_reserve: U256,
    /// Signed `(oracle - amm) / oracle * 100` in basis points.
    pub deviation: DeviationBps,
    pub swaps_in_block: u32,
    pub oracle_updates_in_block: u32,
    /// Largest single swap input seen this cycle, in WETH-equivalent wei.
    pub largest_swap_weth_wei: U256,
    pub liquidations: Vec<LiquidationSeen>,
    pub flags: ChainStateView,
    /// Trailing oracle prices, oldest first, current price last.
    pub recent_prices: Vec<PriceE8>,
    /// False when reserves are empty or inconsistent with the reported
    /// spot; invalid snapshots never reach the reasoner.
    pub valid: bool,
}

impl Snapshot {
    pub fn liquidation_seen(&self) -> bool {
        !self.liquidations.is_empty()
    }
}

/// Builds snapshots from the chain seam on a fixed tick.
pub struct Observer {
    chain: Arc<dyn ProtocolClient>,
    next_cycle: u64,
    last_block: Option<BlockNumber>,
    /// Latest oracle price per observed block.
    price_history: AllocRingBuffer<(BlockNumber, PriceE8)>,
}

impl Observer {
    pub fn new(chain: Arc<dyn ProtocolClient>) -> Self {
        Self {
            chain,
            next_cycle: 0,
            last_block: None,
            price_history: AllocRingBuffer::new(PRICE_HISTORY_CAPACITY),
        }
    }

    /// Runs one observation cycle. Any error aborts the tick; internal
    /// state is only advanced once the snapshot is complete.
    pub async fn observe(&mut self) -> ChainResult<Snapshot> {
        let block = self.chain.current_block().await?;
        let oracle = self.chain.oracle_price().await?;
        let reserves = self.chain.amm_reserves().await?;
        let flags = self.chain.chain_flags().await?;

        let logs = match self.last_block {
            // Same block as the previous tick: nothing new happened.
            Some(last) if block <= last => ProtocolLogs::default(),
            Some(last) => self.chain.protocol_logs(last.next(), block).await?,
            // First tick: no log baseline yet.
            None => ProtocolLogs::default(),
        };

        let deviation = deviation_bps(oracle.price, reserves.spot_price);
        let valid = validate_reserves(reserves.weth, reserves.usdc, reserves.spot_price);
        if !valid {
            warn!(
                block = %block,
                weth = %reserves.weth,
                usdc = %reserves.usdc,
                "snapshot marked invalid: empty or inconsistent reserves"
            );
        }

        let largest_swap_weth_wei = logs
            .swaps
            .iter()
            .map(|swap| weth_equivalent_wei(swap, oracle.price))
            .max()
            .unwrap_or(U256::ZERO);

        self.push_price(block, oracle.price);
        let recent_prices = self.recent_prices();

        let snapshot = Snapshot {
            cycle: CycleIndex::new(self.next_cycle),
            observed_at: OffsetDateTime::now_utc(),
            block,
            oracle_price: oracle.price,
            amm_spot_price: reserves.spot_price,
            weth_reserve: reserves.weth,
            usdc_reserve: reserves.usdc,
            deviation,
            swaps_in_block: logs.swaps.len() as u32,
            oracle_updates_in_block: logs.oracle_updates,
            largest_swap_weth_wei,
            liquidations: logs.liquidations,
            flags,
            recent_prices,
            valid,
        };

        debug!(
            cycle = self.next_cycle,
            block = %block,
            oracle = %oracle.price,
            amm = %reserves.spot_price,
            deviation = %deviation,
            swaps = snapshot.swaps_in_block,
            "market snapshot"
        );

        self.next_cycle += 1;
        self.last_block = Some(block);
        Ok(snapshot)
    }

    /// Records the latest oracle price for `block`, replacing an earlier
    /// reading from the same block.
    fn push_price(&mut self, block: BlockNumber, price: PriceE8) {
        let same_block = matches!(self.price_history.back(), Some(entry) if entry.0 == block);
        if same_block {
            if let Some(entry) = self.price_history.back_mut() {
                *entry = (block, price);
            }
        } else {
            self.price_history.enqueue((block, price));
        }
    }

    fn recent_prices(&self) -> Vec<PriceE8> {
        let len = self.price_history.len();
        self.price_history
            .iter()
            .skip(len.saturating_sub(SNAPSHOT_PRICE_WINDOW))
            .map(|(_, price)| *price)
            .collect()
    }
}

fn validate_reserves(weth: U256, usdc: U256, reported_spot: PriceE8) -> bool {
    if weth.is_zero() && usdc.is_zero() {
        return false;
    }
    let Some(computed) = spot_price_e8(weth, usdc) else {
        return false;
    };
    // The pool computes its own spot from the same reserves; allow only
    // rounding-level disagreement.
    computed.abs_diff_bps(reported_spot, reported_spot) <= RESERVE_CONSISTENCY_BPS
}

/// A swap input in WETH-equivalent wei: WETH inputs pass through, USDC
/// inputs are converted at the oracle price.
fn weth_equivalent_wei(swap: &SwapSeen, oracle_price: PriceE8) -> U256 {
    if swap.is_weth_to_usdc {
        return swap.amount_in;
    }
    if oracle_price.is_zero() {
        return U256::ZERO;
    }
    // usdc (6 dec) -> wei (18 dec) at an 8-decimal price:
    // wei = usdc * 1e20 / price_e8
    let scale = U256::from(10u64).pow(U256::from(20u64));
    swap.amount_in.saturating_mul(scale) / oracle_price.to_u256()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::weth_wei;
    use alloy_primitives::Address;

    fn usd(dollars: u64) -> PriceE8 {
        PriceE8::from_raw(dollars as u128 * PriceE8::SCALE)
    }

    fn usdc_units(amount: u64) -> U256 {
        U256::from(amount) * U256::from(1_000_000u64)
    }

    #[test]
    fn reserve_validation() {
        // Consistent: 100 WETH / 200k USDC at $2000.
        assert!(validate_reserves(weth_wei(100), usdc_units(200_000), usd(2_000)));
        // Fresh deploy.
        assert!(!validate_reserves(U256::ZERO, U256::ZERO, usd(0)));
        // Reported spot disagrees with reserves.
        assert!(!validate_reserves(weth_wei(100), usdc_units(200_000), usd(1_500)));
    }

    #[test]
    fn weth_equivalent_conversion() {
        let swap_in_weth = SwapSeen {
            sender: Address::ZERO,
            amount_in: weth_wei(50),
            is_weth_to_usdc: true,
            block: BlockNumber::new(1),
        };
        assert_eq!(weth_equivalent_wei(&swap_in_weth, usd(2_000)), weth_wei(50));

        // 20_000 USDC at $2000/WETH is 10 WETH.
        let swap_in_usdc = SwapSeen {
            sender: Address::ZERO,
            amount_in: usdc_units(20_000),
            is_weth_to_usdc: false,
            block: BlockNumber::new(1),
        };
        assert_eq!(weth_equivalent_wei(&swap_in_usdc, usd(2_000)), weth_wei(10));
        assert_eq!(weth_equivalent_wei(&swap_in_usdc, usd(0)), U256::ZERO);
    }
}
