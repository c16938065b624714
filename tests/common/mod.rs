//! In-memory fakes driving the monitor in integration tests: a scriptable
//! constant-product market and a scripted LLM.
#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;

use vigil::{
    actor::{ActionWorker, Actor, IntentSlot, StateCache},
    agent::{Agent, LatestSnapshot, MonitorStatus},
    chain::{
        AmmReserves, ChainStateView, LiquidationSeen, OracleReading, ProtocolClient, ProtocolLogs,
        SwapSeen, TxOutcome,
    },
    config::{DeciderThresholds, FilterThresholds},
    errors::{ChainError, ChainResult, LlmError, LlmResult},
    llm::LlmClient,
    observer::Observer,
    reasoner::Reasoner,
    restore::{RestoreConfig, RestoreScheduler},
    store::EventStore,
    types::{spot_price_e8, weth_wei, BlockNumber, Confidence, PriceE8},
};

pub const USDC_UNIT: u64 = 1_000_000;

pub fn usd(dollars: u64) -> PriceE8 {
    PriceE8::from_raw(dollars as u128 * PriceE8::SCALE)
}

pub fn usdc_units(amount: u64) -> U256 {
    U256::from(amount) * U256::from(USDC_UNIT)
}

struct MarketSim {
    block: u64,
    oracle_price: PriceE8,
    weth: U256,
    usdc: U256,
    flags: ChainStateView,
    pending_logs: ProtocolLogs,
    /// Remaining reads that fail transiently before recovery.
    transient_failures: u32,
    tx_counter: u64,
    pause_amm_calls: u64,
}

impl MarketSim {
    fn spot(&self) -> PriceE8 {
        spot_price_e8(self.weth, self.usdc).unwrap_or(PriceE8::from_raw(0))
    }

    fn next_tx(&mut self) -> TxOutcome {
        self.tx_counter += 1;
        self.block += 1;
        TxOutcome {
            hash: B256::from(U256::from(self.tx_counter)),
            block: Some(self.block),
            gas_used: Some(50_000),
        }
    }
}

/// Scriptable in-memory protocol implementing the chain seam.
pub struct FakeProtocol {
    sim: Mutex<MarketSim>,
}

impl FakeProtocol {
    /// A healthy pool: 100 WETH / 200k USDC, oracle at $2000.
    pub fn healthy() -> Arc<Self> {
        Arc::new(Self {
            sim: Mutex::new(MarketSim {
                block: 100,
                oracle_price: usd(2_000),
                weth: weth_wei(100),
                usdc: usdc_units(200_000),
                flags: ChainStateView::default(),
                pending_logs: ProtocolLogs::default(),
                transient_failures: 0,
                tx_counter: 0,
                pause_amm_calls: 0,
            }),
        })
    }

    fn sim(&self) -> std::sync::MutexGuard<'_, MarketSim> {
        self.sim.lock().expect("sim poisoned")
    }

    pub fn advance_block(&self) {
        self.sim().block += 1;
    }

    pub fn set_oracle_price(&self, price: PriceE8) {
        self.sim().oracle_price = price;
    }

    pub fn set_reserves(&self, weth: U256, usdc: U256) {
        let mut sim = self.sim();
        sim.weth = weth;
        sim.usdc = usdc;
    }

    pub fn set_amm_paused(&self, paused: bool) {
        self.sim().flags.amm_paused = paused;
    }

    pub fn spot_price(&self) -> PriceE8 {
        self.sim().spot()
    }

    pub fn flags(&self) -> ChainStateView {
        self.sim().flags
    }

    pub fn current_block_number(&self) -> u64 {
        self.sim().block
    }

    pub fn pause_amm_calls(&self) -> u64 {
        self.sim().pause_amm_calls
    }

    /// Queues a swap log that the next observation will pick up.
    pub fn push_swap(&self, amount_in_weth: u64) {
        let mut sim = self.sim();
        let block = BlockNumber::new(sim.block);
        sim.pending_logs.swaps.push(SwapSeen {
            sender: Address::repeat_byte(0xaa),
            amount_in: weth_wei(amount_in_weth),
            is_weth_to_usdc: true,
            block,
        });
    }

    pub fn push_liquidation(&self, user: Address) {
        let mut sim = self.sim();
        let block = BlockNumber::new(sim.block);
        sim.pending_logs.liquidations.push(LiquidationSeen { user, block });
    }

    /// Makes the next `count` reads fail transiently.
    pub fn fail_next_reads(&self, count: u32) {
        self.sim().transient_failures = count;
    }

    /// Crashes the pool to roughly `spot` dollars per WETH by draining
    /// USDC along the constant-product curve.
    pub fn crash_to(&self, spot: PriceE8) {
        let mut sim = self.sim();
        let k = sim.weth * sim.usdc;
        let scale = U256::from(10u64).pow(U256::from(20u64));
        // usdc' = sqrt(k * p / 1e20)
        let target_usdc = isqrt(k * spot.to_u256() / scale);
        sim.usdc = target_usdc;
        sim.weth = k / target_usdc;
        sim.block += 1;
    }

    fn check_failure(&self) -> ChainResult<()> {
        let mut sim = self.sim();
        if sim.transient_failures > 0 {
            sim.transient_failures -= 1;
            return Err(ChainError::Transient("simulated rpc outage".into()));
        }
        Ok(())
    }
}

fn isqrt(value: U256) -> U256 {
    if value.is_zero() {
        return U256::ZERO;
    }
    let mut x = value;
    let mut y = (value + U256::from(1u64)) >> 1;
    while y < x {
        x = y;
        y = (x + value / x) >> 1;
    }
    x
}

#[async_trait]
impl ProtocolClient for FakeProtocol {
    async fn current_block(&self) -> ChainResult<BlockNumber> {
        self.check_failure()?;
        Ok(BlockNumber::new(self.sim().block))
    }

    async fn oracle_price(&self) -> ChainResult<OracleReading> {
        self.check_failure()?;
        let sim = self.sim();
        Ok(OracleReading {
            price: sim.oracle_price,
            timestamp: 0,
            block: BlockNumber::new(sim.block),
        })
    }

    async fn amm_reserves(&self) -> ChainResult<AmmReserves> {
        self.check_failure()?;
        let sim = self.sim();
        Ok(AmmReserves {
            weth: sim.weth,
            usdc: sim.usdc,
            spot_price: sim.spot(),
        })
    }

    async fn chain_flags(&self) -> ChainResult<ChainStateView> {
        self.check_failure()?;
        Ok(self.sim().flags)
    }

    async fn protocol_logs(&self, _from: BlockNumber, _to: BlockNumber) -> ChainResult<ProtocolLogs> {
        self.check_failure()?;
        Ok(std::mem::take(&mut self.sim().pending_logs))
    }

    async fn pause_amm(&self) -> ChainResult<TxOutcome> {
        let mut sim = self.sim();
        sim.pause_amm_calls += 1;
        if sim.flags.amm_paused {
            return Err(ChainError::Permanent("execution reverted: AMM: already paused".into()));
        }
        sim.flags.amm_paused = true;
        Ok(sim.next_tx())
    }

    async fn unpause_amm(&self) -> ChainResult<TxOutcome> {
        let mut sim = self.sim();
        if !sim.flags.amm_paused {
            return Err(ChainError::Permanent("execution reverted: AMM: not paused".into()));
        }
        sim.flags.amm_paused = false;
        Ok(sim.next_tx())
    }

    async fn pause_vault(&self, _reason: &str) -> ChainResult<TxOutcome> {
        let mut sim = self.sim();
        if sim.flags.vault_paused {
            return Err(ChainError::Permanent("execution reverted: vault already paused".into()));
        }
        sim.flags.vault_paused = true;
        Ok(sim.next_tx())
    }

    async fn unpause_vault(&self) -> ChainResult<TxOutcome> {
        let mut sim = self.sim();
        if !sim.flags.vault_paused {
            return Err(ChainError::Permanent("execution reverted: vault not paused".into()));
        }
        sim.flags.vault_paused = false;
        Ok(sim.next_tx())
    }

    async fn block_liquidations(&self) -> ChainResult<TxOutcome> {
        let mut sim = self.sim();
        if sim.flags.liquidations_blocked {
            return Err(ChainError::Permanent(
                "execution reverted: liquidations already blocked".into(),
            ));
        }
        sim.flags.liquidations_blocked = true;
        Ok(sim.next_tx())
    }

    async fn unblock_liquidations(&self) -> ChainResult<TxOutcome> {
        let mut sim = self.sim();
        if !sim.flags.liquidations_blocked {
            return Err(ChainError::Permanent(
                "execution reverted: liquidations not blocked".into(),
            ));
        }
        sim.flags.liquidations_blocked = false;
        Ok(sim.next_tx())
    }

    async fn swap_weth_for_usdc(&self, amount_in: U256) -> ChainResult<TxOutcome> {
        let mut sim = self.sim();
        if sim.flags.amm_paused {
            return Err(ChainError::Permanent("execution reverted: AMM: paused".into()));
        }
        let k = sim.weth * sim.usdc;
        sim.weth += amount_in;
        sim.usdc = k / sim.weth;
        Ok(sim.next_tx())
    }

    async fn swap_usdc_for_weth(&self, amount_in: U256) -> ChainResult<TxOutcome> {
        let mut sim = self.sim();
        if sim.flags.amm_paused {
            return Err(ChainError::Permanent("execution reverted: AMM: paused".into()));
        }
        let k = sim.weth * sim.usdc;
        sim.usdc += amount_in;
        sim.weth = k / sim.usdc;
        Ok(sim.next_tx())
    }
}

/// A scripted reply for the fake LLM.
pub enum ScriptedReply {
    Text(String),
    /// Sleeps far past the reasoner's timeout.
    Hang,
    TransportError,
}

impl ScriptedReply {
    pub fn assessment(classification: &str, confidence: f64, evidence: &[&str]) -> Self {
        let evidence: Vec<String> = evidence.iter().map(|s| s.to_string()).collect();
        ScriptedReply::Text(
            serde_json::json!({
                "classification": classification,
                "confidence": confidence,
                "explanation": "scripted assessment",
                "evidence": evidence,
            })
            .to_string(),
        )
    }
}

/// LLM fake: pops scripted replies in order and counts calls.
pub struct FixedLlm {
    replies: Mutex<VecDeque<ScriptedReply>>,
    pub calls: AtomicU64,
}

impl FixedLlm {
    pub fn new(replies: Vec<ScriptedReply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            calls: AtomicU64::new(0),
        })
    }

    pub fn empty() -> Arc<Self> {
        Self::new(Vec::new())
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl LlmClient for FixedLlm {
    async fn complete(&self, _prompt: &str) -> LlmResult<String> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let reply = self.replies.lock().expect("replies poisoned").pop_front();
        match reply {
            Some(ScriptedReply::Text(text)) => Ok(text),
            Some(ScriptedReply::Hang) => {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
                Err(LlmError::EmptyResponse)
            }
            Some(ScriptedReply::TransportError) => Err(LlmError::Http {
                status: 503,
                body: "scripted outage".into(),
            }),
            None => Err(LlmError::EmptyResponse),
        }
    }
}

/// Everything a test needs to drive the monitor deterministically.
pub struct Harness {
    pub agent: Agent,
    pub worker: ActionWorker,
    pub store: Arc<EventStore>,
    pub restore: Arc<RestoreScheduler>,
    pub state_cache: Arc<StateCache>,
    pub slot: Arc<IntentSlot>,
    pub status: Arc<MonitorStatus>,
}

pub fn filter_thresholds() -> FilterThresholds {
    FilterThresholds {
        deviation_bps: 500,
        extreme_move_bps: 1_000,
        max_swaps_in_block: 3,
        large_swap_wei: weth_wei(10),
        recovery_settle_bps: 100,
        recovery_spike_bps: 1_000,
    }
}

pub fn decider_thresholds() -> DeciderThresholds {
    DeciderThresholds {
        pause: Confidence::from_f64(0.75),
        block_liquidations: Confidence::from_f64(0.50),
        pause_vault: Confidence::from_f64(0.90),
    }
}

/// Builds a full monitor around the fakes. `llm_timeout` bounds each LLM
/// call; `restore_delay` arms the scheduler.
pub fn build_harness(
    chain: Arc<FakeProtocol>,
    llm: Arc<FixedLlm>,
    llm_timeout: Duration,
    restore_delay: Duration,
) -> Harness {
    let chain: Arc<dyn ProtocolClient> = chain;
    let store = Arc::new(EventStore::new(10_000));
    let status = Arc::new(MonitorStatus::default());
    let latest = Arc::new(LatestSnapshot::default());
    let state_cache = Arc::new(StateCache::default());
    let slot = Arc::new(IntentSlot::new());
    let restore = Arc::new(RestoreScheduler::new(
        Arc::clone(&chain),
        Arc::clone(&store),
        RestoreConfig {
            delay: restore_delay,
            repause: false,
        },
    ));

    let agent = Agent::new(
        Observer::new(Arc::clone(&chain)),
        Reasoner::new(llm, llm_timeout, 1_000),
        filter_thresholds(),
        decider_thresholds(),
        Arc::clone(&slot),
        Arc::clone(&state_cache),
        Arc::clone(&store),
        Arc::clone(&status),
        Arc::clone(&latest),
        Duration::from_secs(2),
    );
    let worker = ActionWorker::new(
        Arc::clone(&slot),
        Actor::new(Arc::clone(&chain)),
        Arc::clone(&state_cache),
        Arc::clone(&store),
        Arc::clone(&restore),
    );

    Harness {
        agent,
        worker,
        store,
        restore,
        state_cache,
        slot,
        status,
    }
}
