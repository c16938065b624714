use std::{env, net::SocketAddr, time::Duration};

use alloy_primitives::{Address, U256};
use anyhow::{Context, Result};

use crate::types::{weth_wei, Confidence};

/// Default Gemini-compatible endpoint used when LLM_API_URL is not set.
const DEFAULT_LLM_API_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_LLM_MODEL: &str = "gemini-1.5-pro";

/// Addresses of the deployed, ABI-frozen protocol contracts.
#[derive(Debug, Clone, Copy)]
pub struct ContractAddresses {
    pub weth: Address,
    pub usdc: Address,
    pub oracle: Address,
    pub amm: Address,
    pub vault: Address,
}

/// Runtime configuration, loaded from the environment.
///
/// Required options fail startup (exit code 1); everything else has a
/// documented default. Percent thresholds are converted once to basis
/// points so the hot paths never touch floats.
#[derive(Debug, Clone)]
pub struct Config {
    pub chain_rpc_url: String,
    pub chain_id: u64,
    pub signer_key: String,
    pub contracts: ContractAddresses,

    pub llm_api_key: String,
    pub llm_api_url: String,
    pub llm_model: String,
    pub llm_call_timeout: Duration,

    pub poll_interval: Duration,
    pub price_deviation_threshold_pct: f64,
    pub extreme_move_threshold_pct: f64,
    pub large_swap_weth: u64,

    pub pause_confidence_threshold: f64,
    pub block_liquidation_confidence_threshold: f64,

    pub restore_delay: Duration,
    pub repause_after_restore: bool,

    pub event_store_capacity: usize,
    pub analyzed_events_capacity: usize,

    pub http_bind_addr: SocketAddr,
    pub attack_swap_weth: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let cfg = Self {
            chain_rpc_url: required("CHAIN_RPC_URL")?,
            chain_id: parse_u64("CHAIN_ID", 11_155_111)?,
            signer_key: required("SIGNER_KEY")?,
            contracts: ContractAddresses {
                weth: required_address("CONTRACT_WETH")?,
                usdc: required_address("CONTRACT_USDC")?,
                oracle: required_address("CONTRACT_ORACLE")?,
                amm: required_address("CONTRACT_AMM")?,
                vault: required_address("CONTRACT_VAULT")?,
            },
            llm_api_key: required("LLM_API_KEY")?,
            llm_api_url: env_or("LLM_API_URL", DEFAULT_LLM_API_URL),
            llm_model: env_or("LLM_MODEL", DEFAULT_LLM_MODEL),
            llm_call_timeout: Duration::from_secs(parse_u64("LLM_CALL_TIMEOUT_SEC", 10)?),
            poll_interval: Duration::from_secs(parse_u64("POLL_INTERVAL_SEC", 2)?),
            price_deviation_threshold_pct: parse_f64("PRICE_DEVIATION_THRESHOLD_PCT", 5.0)?,
            extreme_move_threshold_pct: parse_f64("EXTREME_MOVE_THRESHOLD_PCT", 10.0)?,
            large_swap_weth: parse_u64("LARGE_SWAP_WETH", 10)?,
            pause_confidence_threshold: parse_f64("PAUSE_CONFIDENCE_THRESHOLD", 0.75)?,
            block_liquidation_confidence_threshold: parse_f64(
                "BLOCK_LIQUIDATION_CONFIDENCE_THRESHOLD",
                0.50,
            )?,
            restore_delay: Duration::from_secs(parse_u64("RESTORE_DELAY_SEC", 5)?),
            repause_after_restore: parse_bool("REPAUSE_AFTER_RESTORE", false)?,
            event_store_capacity: parse_u64("EVENT_STORE_CAPACITY", 10_000)? as usize,
            analyzed_events_capacity: parse_u64("ANALYZED_EVENTS_CAPACITY", 1_000)? as usize,
            http_bind_addr: env_or("HTTP_BIND_ADDR", "0.0.0.0:8080")
                .parse()
                .context("HTTP_BIND_ADDR is not a valid socket address")?,
            attack_swap_weth: parse_u64("ATTACK_SWAP_WETH", 50)?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            (1..=30).contains(&self.poll_interval.as_secs()),
            "POLL_INTERVAL_SEC must be between 1 and 30"
        );
        anyhow::ensure!(
            self.price_deviation_threshold_pct > 0.0,
            "PRICE_DEVIATION_THRESHOLD_PCT must be positive"
        );
        anyhow::ensure!(
            self.extreme_move_threshold_pct > 0.0,
            "EXTREME_MOVE_THRESHOLD_PCT must be positive"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.pause_confidence_threshold),
            "PAUSE_CONFIDENCE_THRESHOLD must be within [0, 1]"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.block_liquidation_confidence_threshold),
            "BLOCK_LIQUIDATION_CONFIDENCE_THRESHOLD must be within [0, 1]"
        );
        anyhow::ensure!(
            self.block_liquidation_confidence_threshold <= self.pause_confidence_threshold,
            "block-liquidation threshold must not exceed the pause threshold"
        );
        anyhow::ensure!(
            self.event_store_capacity > 0,
            "EVENT_STORE_CAPACITY must be positive"
        );
        anyhow::ensure!(
            self.analyzed_events_capacity > 0,
            "ANALYZED_EVENTS_CAPACITY must be positive"
        );
        anyhow::ensure!(
            self.llm_call_timeout.as_secs() > 0,
            "LLM_CALL_TIMEOUT_SEC must be positive"
        );
        anyhow::ensure!(self.attack_swap_weth > 0, "ATTACK_SWAP_WETH must be positive");
        Ok(())
    }

    /// Filter thresholds in integer form.
    pub fn filter_thresholds(&self) -> FilterThresholds {
        FilterThresholds {
            deviation_bps: pct_to_bps(self.price_deviation_threshold_pct),
            extreme_move_bps: pct_to_bps(self.extreme_move_threshold_pct),
            max_swaps_in_block: 3,
            large_swap_wei: weth_wei(self.large_swap_weth),
            recovery_settle_bps: 100,
            recovery_spike_bps: 1_000,
        }
    }

    /// Decider thresholds scaled to confidence basis points.
    pub fn decider_thresholds(&self) -> DeciderThresholds {
        DeciderThresholds {
            pause: Confidence::from_f64(self.pause_confidence_threshold),
            block_liquidations: Confidence::from_f64(self.block_liquidation_confidence_threshold),
            pause_vault: Confidence::from_f64(0.90),
        }
    }
}

/// Integer thresholds consumed by the anomaly filter. All comparisons
/// are strict, so a value exactly at a threshold is not anomalous.
#[derive(Debug, Clone, Copy)]
pub struct FilterThresholds {
    /// Oracle/AMM disagreement above this is anomalous. Default 500.
    pub deviation_bps: u64,
    /// Single-step price move above this is anomalous. Default 1000.
    pub extreme_move_bps: u64,
    /// Swap count per block above this is anomalous. Default 3.
    pub max_swaps_in_block: u32,
    /// Any single swap input above this (WETH wei) is anomalous.
    pub large_swap_wei: U256,
    /// Recovery pattern: endpoints of the three-price window must agree
    /// within this. Default 100.
    pub recovery_settle_bps: u64,
    /// Recovery pattern: the middle price must have jumped by more than
    /// this. Default 1000.
    pub recovery_spike_bps: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct DeciderThresholds {
    pub pause: Confidence,
    pub block_liquidations: Confidence,
    pub pause_vault: Confidence,
}

fn pct_to_bps(pct: f64) -> u64 {
    (pct * 100.0).round() as u64
}

fn required(name: &str) -> Result<String> {
    let value = env::var(name).with_context(|| format!("{name} not set"))?;
    anyhow::ensure!(!value.trim().is_empty(), "{name} is empty");
    Ok(value)
}

fn required_address(name: &str) -> Result<Address> {
    required(name)?
        .parse::<Address>()
        .with_context(|| format!("{name} is not a valid address"))
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_u64(name: &str, default: u64) -> Result<u64> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .with_context(|| format!("{name} is not a valid integer")),
        Err(_) => Ok(default),
    }
}

fn parse_f64(name: &str, default: f64) -> Result<f64> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<f64>()
            .with_context(|| format!("{name} is not a valid number")),
        Err(_) => Ok(default),
    }
}

fn parse_bool(name: &str, default: bool) -> Result<bool> {
    match env::var(name) {
        Ok(raw) => match raw.trim() {
            "1" | "true" | "TRUE" | "yes" => Ok(true),
            "0" | "false" | "FALSE" | "no" => Ok(false),
            other => anyhow::bail!("{name} has invalid boolean value {other:?}"),
        },
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pct_to_bps_rounds() {
        assert_eq!(pct_to_bps(5.0), 500);
        assert_eq!(pct_to_bps(10.0), 1_000);
        assert_eq!(pct_to_bps(0.125), 13);
    }

    #[test]
    fn decider_thresholds_scale() {
        let cfg = test_config();
        let t = cfg.decider_thresholds();
        assert_eq!(t.pause.bps(), 7_500);
        assert_eq!(t.block_liquidations.bps(), 5_000);
        assert_eq!(t.pause_vault.bps(), 9_000);
    }

    #[test]
    fn filter_thresholds_scale() {
        let cfg = test_config();
        let t = cfg.filter_thresholds();
        assert_eq!(t.deviation_bps, 500);
        assert_eq!(t.extreme_move_bps, 1_000);
        assert_eq!(t.large_swap_wei, weth_wei(10));
    }

    fn test_config() -> Config {
        Config {
            chain_rpc_url: "http://localhost:8545".into(),
            chain_id: 11_155_111,
            signer_key: "0x01".into(),
            contracts: ContractAddresses {
                weth: Address::ZERO,
                usdc: Address::ZERO,
                oracle: Address::ZERO,
                amm: Address::ZERO,
                vault: Address::ZERO,
            },
            llm_api_key: "key".into(),
            llm_api_url: DEFAULT_LLM_API_URL.into(),
            llm_model: DEFAULT_LLM_MODEL.into(),
            llm_call_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(2),
            price_deviation_threshold_pct: 5.0,
            extreme_move_threshold_pct: 10.0,
            large_swap_weth: 10,
            pause_confidence_threshold: 0.75,
            block_liquidation_confidence_threshold: 0.50,
            restore_delay: Duration::from_secs(5),
            repause_after_restore: false,
            event_store_capacity: 10_000,
            analyzed_events_capacity: 1_000,
            http_bind_addr: "0.0.0.0:8080".parse().unwrap(),
            attack_swap_weth: 50,
        }
    }
}
