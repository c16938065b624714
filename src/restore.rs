//! Post-defense price restoration.
//!
//! After a successful AMM pause the scheduler arms a single delayed task:
//! unpause the pool, push the spot price back to the oracle price with one
//! counter-swap derived from the constant-product invariant, and
//! optionally re-pause. Arming again cancels the previous task; at most
//! one restore is ever pending.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use alloy_primitives::U256;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::{
    chain::ProtocolClient,
    events::EventPayload,
    store::EventStore,
    types::{spot_price_e8, BlockNumber, CycleIndex, PriceE8},
};

/// Restore counts as successful when the new spot lands within this many
/// basis points of the oracle price (5%).
const RESTORE_TOLERANCE_BPS: u64 = 500;

#[derive(Debug, Clone)]
pub struct RestoreConfig {
    pub delay: Duration,
    /// Re-pause the AMM after a successful restore. Default off: the pool
    /// resumes trading at the restored price.
    pub repause: bool,
}

/// Which side of the pool the counter-swap feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapDirection {
    WethForUsdc,
    UsdcForWeth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSwap {
    pub direction: SwapDirection,
    pub amount_in: U256,
}

/// Result of one restore attempt, ready to be appended as an event.
#[derive(Debug, Clone)]
pub struct RestoreOutcome {
    pub success: bool,
    pub tx_hash: Option<alloy_primitives::B256>,
    pub block: Option<BlockNumber>,
    pub new_price: Option<PriceE8>,
    pub target_price: PriceE8,
    pub message: String,
}

impl RestoreOutcome {
    pub fn into_payload(self) -> EventPayload {
        EventPayload::Restore {
            block: self.block,
            success: self.success,
            tx_hash: self.tx_hash,
            new_price: self.new_price,
            target_price: self.target_price,
            message: self.message,
        }
    }

    fn failed(target_price: PriceE8, message: String) -> Self {
        Self {
            success: false,
            tx_hash: None,
            block: None,
            new_price: None,
            target_price,
            message,
        }
    }
}

/// Owns the single pending restore task.
pub struct RestoreScheduler {
    chain: Arc<dyn ProtocolClient>,
    store: Arc<EventStore>,
    config: RestoreConfig,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RestoreScheduler {
    pub fn new(chain: Arc<dyn ProtocolClient>, store: Arc<EventStore>, config: RestoreConfig) -> Self {
        Self {
            chain,
            store,
            config,
            task: Mutex::new(None),
        }
    }

    /// Schedules a restore at `now + delay`. A task armed earlier (for an
    /// older attack) is cancelled first.
    pub fn arm(self: &Arc<Self>, cycle: CycleIndex) {
        let mut slot = self.task.lock().expect("restore scheduler poisoned");
        if let Some(previous) = slot.take() {
            previous.abort();
            info!("previous restore task cancelled; re-arming");
        }
        let this = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(this.config.delay).await;
            info!("restore delay elapsed; restoring AMM price");
            let outcome = perform_restore(this.chain.as_ref(), this.config.repause).await;
            if !outcome.success {
                warn!("restore incomplete: {}", outcome.message);
            }
            this.store.append(cycle, outcome.into_payload());
        }));
    }

    /// Cancels any pending restore; used on shutdown and by tests.
    pub fn cancel(&self) {
        if let Some(task) = self.task.lock().expect("restore scheduler poisoned").take() {
            task.abort();
        }
    }
}

impl Drop for RestoreScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Unpauses the AMM and drives its spot price back to the oracle price.
///
/// Shared by the scheduler and the admin reset endpoint.
pub async fn perform_restore(chain: &dyn ProtocolClient, repause: bool) -> RestoreOutcome {
    let target = match chain.oracle_price().await {
        Ok(reading) => reading.price,
        Err(err) => {
            return RestoreOutcome::failed(
                PriceE8::from_raw(0),
                format!("could not read oracle price: {err}"),
            )
        }
    };

    // The pool must trade to rebalance. "not paused" reverts are fine.
    if let Err(err) = chain.unpause_amm().await {
        let text = err.message().to_ascii_lowercase();
        if !text.contains("not paused") {
            return RestoreOutcome::failed(target, format!("unpause failed: {err}"));
        }
    }

    let reserves = match chain.amm_reserves().await {
        Ok(reserves) => reserves,
        Err(err) => {
            return RestoreOutcome::failed(target, format!("could not read reserves: {err}"))
        }
    };

    let mut tx_hash = None;
    let mut block = None;
    match counter_swap(reserves.weth, reserves.usdc, target) {
        Some(swap) => {
            let submitted = match swap.direction {
                SwapDirection::WethForUsdc => chain.swap_weth_for_usdc(swap.amount_in).await,
                SwapDirection::UsdcForWeth => chain.swap_usdc_for_weth(swap.amount_in).await,
            };
            match submitted {
                Ok(outcome) => {
                    tx_hash = Some(outcome.hash);
                    block = outcome.block.map(BlockNumber::new);
                }
                Err(err) => {
                    return RestoreOutcome::failed(target, format!("counter-swap failed: {err}"))
                }
            }
        }
        None => info!("pool already near oracle price; no counter-swap needed"),
    }

    if repause {
        if let Err(err) = chain.pause_amm().await {
            warn!("re-pause after restore failed: {err}");
        }
    }

    let new_price = match chain.amm_reserves().await {
        Ok(reserves) => Some(reserves.spot_price),
        Err(_) => None,
    };
    let success = new_price
        .map(|price| price.abs_diff_bps(target, target) <= RESTORE_TOLERANCE_BPS)
        .unwrap_or(false);

    RestoreOutcome {
        success,
        tx_hash,
        block,
        new_price,
        target_price: target,
        message: if success {
            "price restored to oracle".to_string()
        } else {
            "spot price still outside tolerance after restore".to_string()
        },
    }
}

/// Solves the counter-swap that moves a constant-product pool to
/// `target` price: with `k = x * y`, the balanced reserves are
/// `usdc' = sqrt(k * p / 1e20)` and `weth' = sqrt(k * 1e20 / p)`, and the
/// trade is the deficit on whichever side needs liquidity.
///
/// Returns `None` when the pool is already within tolerance or the
/// reserves are degenerate.
pub fn counter_swap(weth: U256, usdc: U256, target: PriceE8) -> Option<CounterSwap> {
    if weth.is_zero() || usdc.is_zero() || target.is_zero() {
        return None;
    }
    let current = spot_price_e8(weth, usdc)?;
    if current.abs_diff_bps(target, target) <= RESTORE_TOLERANCE_BPS {
        return None;
    }

    // usdc has 6 decimals, weth 18, prices 8: price = usdc * 1e20 / weth.
    let scale = U256::from(10u64).pow(U256::from(20u64));
    let k = weth.checked_mul(usdc)?;
    let p = target.to_u256();

    let usdc_target = isqrt(k.checked_mul(p)? / scale);
    let weth_target = isqrt(k.checked_mul(scale)? / p);

    if usdc_target > usdc {
        Some(CounterSwap {
            direction: SwapDirection::UsdcForWeth,
            amount_in: usdc_target - usdc,
        })
    } else if weth_target > weth {
        Some(CounterSwap {
            direction: SwapDirection::WethForUsdc,
            amount_in: weth_target - weth,
        })
    } else {
        None
    }
}

/// Babylonian integer square root.
fn isqrt(value: U256) -> U256 {
    if value.is_zero() {
        return U256::ZERO;
    }
    let one = U256::from(1u64);
    let mut x = value;
    let mut y = (value + one) >> 1;
    while y < x {
        x = y;
        y = (x + value / x) >> 1;
    }
    x
}
