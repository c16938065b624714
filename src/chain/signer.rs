//! Transaction submission for the single monitor signer.
//!
//! All outgoing transactions are serialized through one in-process lock;
//! there is no pipelining. The nonce is tracked optimistically and
//! refetched from the chain after any permanent failure.

use std::{sync::Arc, time::Duration};

use alloy_consensus::{SignableTransaction, TxEip1559, TxEnvelope};
use alloy_eips::eip2718::Encodable2718;
use alloy_primitives::{Address, TxKind, B256, U256};
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::errors::{ChainError, ChainResult};

use super::rpc::{with_retry, RetryPolicy, RpcClient};

/// Priority fee paid on every transaction (1.5 gwei).
const PRIORITY_FEE_WEI: u128 = 1_500_000_000;
/// Hard cap on any single transaction's gas limit.
const GAS_LIMIT_CAP: u64 = 1_000_000;
/// Gas headroom applied on top of the node's estimate (25%).
const GAS_HEADROOM_NUM: u64 = 125;
const GAS_HEADROOM_DEN: u64 = 100;
/// How long to poll for a receipt before giving up.
const RECEIPT_TIMEOUT: Duration = Duration::from_secs(60);
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Result of a confirmed submission.
#[derive(Debug, Clone, Copy)]
pub struct TxOutcome {
    pub hash: B256,
    pub block: Option<u64>,
    pub gas_used: Option<u64>,
}

struct SenderState {
    /// Next nonce to use; `None` forces a refetch from the chain.
    next_nonce: Option<u64>,
}

/// Serialized transaction sender for the monitor's signing key.
pub struct TxSender {
    rpc: Arc<RpcClient>,
    signer: PrivateKeySigner,
    chain_id: u64,
    state: Mutex<SenderState>,
    retry: RetryPolicy,
}

impl TxSender {
    pub fn new(rpc: Arc<RpcClient>, signer_key: &str, chain_id: u64) -> ChainResult<Self> {
        let signer: PrivateKeySigner = signer_key
            .trim()
            .parse()
            .map_err(|err| ChainError::Permanent(format!("invalid signer key: {err}")))?;
        Ok(Self {
            rpc,
            signer,
            chain_id,
            state: Mutex::new(SenderState { next_nonce: None }),
            retry: RetryPolicy::default(),
        })
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// Builds, signs, submits and confirms one transaction.
    ///
    /// Holds the sender lock for the whole submit-and-confirm sequence so
    /// nonces can never be issued out of order.
    pub async fn submit(&self, to: Address, calldata: Vec<u8>) -> ChainResult<TxOutcome> {
        let mut state = self.state.lock().await;
        let result = self.submit_locked(&mut state, to, calldata).await;
        if let Err(err) = &result {
            if !err.is_transient() {
                // Anything permanent may mean the chain saw a different
                // nonce than we think; refetch before the next attempt.
                state.next_nonce = None;
            }
        }
        result
    }

    async fn submit_locked(
        &self,
        state: &mut SenderState,
        to: Address,
        calldata: Vec<u8>,
    ) -> ChainResult<TxOutcome> {
        let from = self.signer.address();

        let nonce = match state.next_nonce {
            Some(nonce) => nonce,
            None => {
                let fetched =
                    with_retry(&self.retry, || self.rpc.transaction_count(from)).await?;
                debug!(nonce = fetched, "refetched signer nonce");
                state.next_nonce = Some(fetched);
                fetched
            }
        };

        // Estimation doubles as a pre-flight: reverts (including the
        // idempotent "already paused" family) surface here with their
        // revert reason, before any nonce is consumed.
        let estimated =
            with_retry(&self.retry, || self.rpc.estimate_gas(from, to, &calldata)).await?;
        let gas_limit = (estimated * GAS_HEADROOM_NUM / GAS_HEADROOM_DEN).min(GAS_LIMIT_CAP);

        let base_fee = with_retry(&self.retry, || self.rpc.base_fee()).await?;
        let max_fee = base_fee * 2 + PRIORITY_FEE_WEI;

        let tx = TxEip1559 {
            chain_id: self.chain_id,
            nonce,
            gas_limit,
            max_fee_per_gas: max_fee,
            max_priority_fee_per_gas: PRIORITY_FEE_WEI,
            to: TxKind::Call(to),
            value: U256::ZERO,
            input: calldata.into(),
            access_list: Default::default(),
        };

        let signature = self
            .signer
            .sign_hash_sync(&tx.signature_hash())
            .map_err(|err| ChainError::Permanent(format!("signing failed: {err}")))?;
        let envelope = TxEnvelope::Eip1559(tx.into_signed(signature));
        let raw = envelope.encoded_2718();

        let hash =
            with_retry(&self.retry, || self.rpc.send_raw_transaction(&raw)).await?;
        info!(%hash, nonce, gas_limit, "transaction submitted");

        let receipt = self.wait_for_receipt(hash).await?;
        if receipt.status != 1 {
            state.next_nonce = None;
            return Err(ChainError::Permanent(format!(
                "transaction {hash} reverted in block {:?}",
                receipt.block_number
            )));
        }

        state.next_nonce = Some(nonce + 1);
        Ok(TxOutcome {
            hash,
            block: receipt.block_number,
            gas_used: receipt.gas_used,
        })
    }

    async fn wait_for_receipt(&self, hash: B256) -> ChainResult<super::rpc::RpcReceipt> {
        let deadline = tokio::time::Instant::now() + RECEIPT_TIMEOUT;
        loop {
            match self.rpc.transaction_receipt(hash).await {
                Ok(Some(receipt)) => return Ok(receipt),
                Ok(None) => {}
                Err(err) if err.is_transient() => {
                    warn!("receipt poll failed transiently: {err}");
                }
                Err(err) => return Err(err),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ChainError::Transient(format!(
                    "no receipt for {hash} within {RECEIPT_TIMEOUT:?}"
                )));
            }
            tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gas_headroom_and_cap() {
        let estimated = 100_000u64;
        let with_headroom = estimated * GAS_HEADROOM_NUM / GAS_HEADROOM_DEN;
        assert_eq!(with_headroom, 125_000);
        assert_eq!(with_headroom.min(GAS_LIMIT_CAP), 125_000);

        let huge = 2_000_000u64;
        assert_eq!((huge * GAS_HEADROOM_NUM / GAS_HEADROOM_DEN).min(GAS_LIMIT_CAP), GAS_LIMIT_CAP);
    }

    #[test]
    fn fee_recipe() {
        let base_fee = 10_000_000_000u128; // 10 gwei
        let max_fee = base_fee * 2 + PRIORITY_FEE_WEI;
        assert_eq!(max_fee, 21_500_000_000);
    }
}
