//! Typed access to the protocol's frozen contract surface.
//!
//! The ABI below mirrors the deployed oracle / AMM pool / lending vault
//! exactly; the monitor never deploys or mutates contracts beyond the
//! pause / block / restore writes listed here.

use std::sync::Arc;

use alloy_primitives::{Address, U256};
use alloy_sol_types::{sol, SolCall, SolEvent};
use async_trait::async_trait;
use serde::Serialize;

use crate::{
    config::ContractAddresses,
    errors::{ChainError, ChainResult},
    types::{BlockNumber, PriceE8},
};

use super::{
    rpc::{with_retry, RetryPolicy, RpcClient, RpcLog},
    signer::{TxOutcome, TxSender},
};

sol! {
    interface IPriceOracle {
        function getPrice() external view returns (uint256 price, uint256 timestamp, uint256 blockNumber);
        function forceUpdatePrice(uint256 newPrice) external;

        event PriceUpdated(uint256 indexed timestamp, uint256 oldPrice, uint256 newPrice, uint256 percentageChange, address indexed updater);
    }

    interface IAmmPool {
        function getReserves() external view returns (uint256 wethReserve, uint256 usdcReserve, uint256 spotPrice);
        function paused() external view returns (bool);
        function pause() external;
        function unpause() external;
        function swapWethForUsdc(uint256 amountIn) external;
        function swapUsdcForWeth(uint256 amountIn) external;

        event Swap(address indexed sender, uint256 amountIn, uint256 amountOut, bool isWethToUsdc, uint256 effectivePrice, uint256 blockNumber);
        event EmergencyPaused(address indexed by, uint256 timestamp);
        event ReserveAnomaly(uint256 wethReserve, uint256 usdcReserve, string details);
    }

    interface ILendingVault {
        function paused() external view returns (bool);
        function liquidationsBlocked() external view returns (bool);
        function isLiquidatable(address user) external view returns (bool liquidatable, uint256 shortfall);
        function pause(string reason) external;
        function unpause() external;
        function blockLiquidations() external;
        function unblockLiquidations() external;

        event Liquidation(address indexed liquidator, address indexed user, uint256 debtRepaid, uint256 collateralSeized, uint256 oraclePrice, uint256 blockNumber, uint256 timestamp);
        event LiquidationsBlocked(address indexed by, uint256 timestamp);
    }
}

/// Oracle price read with its on-chain metadata.
#[derive(Debug, Clone, Copy)]
pub struct OracleReading {
    pub price: PriceE8,
    pub timestamp: u64,
    pub block: BlockNumber,
}

/// AMM reserves plus the pool's own spot price.
#[derive(Debug, Clone, Copy)]
pub struct AmmReserves {
    pub weth: U256,
    pub usdc: U256,
    pub spot_price: PriceE8,
}

/// Pause/block flags as last observed on chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChainStateView {
    pub amm_paused: bool,
    pub vault_paused: bool,
    pub liquidations_blocked: bool,
}

/// A swap decoded from the AMM's `Swap` event.
#[derive(Debug, Clone, Copy)]
pub struct SwapSeen {
    pub sender: Address,
    pub amount_in: U256,
    pub is_weth_to_usdc: bool,
    pub block: BlockNumber,
}

/// A liquidation decoded from the vault's `Liquidation` event.
#[derive(Debug, Clone, Copy)]
pub struct LiquidationSeen {
    pub user: Address,
    pub block: BlockNumber,
}

/// Protocol activity decoded from one block range.
#[derive(Debug, Clone, Default)]
pub struct ProtocolLogs {
    pub swaps: Vec<SwapSeen>,
    pub oracle_updates: u32,
    pub liquidations: Vec<LiquidationSeen>,
}

/// Read/write seam against the protocol contracts.
///
/// The live implementation talks JSON-RPC; tests drive the monitor with an
/// in-memory fake.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    async fn current_block(&self) -> ChainResult<BlockNumber>;
    async fn oracle_price(&self) -> ChainResult<OracleReading>;
    async fn amm_reserves(&self) -> ChainResult<AmmReserves>;
    async fn chain_flags(&self) -> ChainResult<ChainStateView>;
    async fn protocol_logs(&self, from: BlockNumber, to: BlockNumber) -> ChainResult<ProtocolLogs>;

    async fn pause_amm(&self) -> ChainResult<TxOutcome>;
    async fn unpause_amm(&self) -> ChainResult<TxOutcome>;
    async fn pause_vault(&self, reason: &str) -> ChainResult<TxOutcome>;
    async fn unpause_vault(&self) -> ChainResult<TxOutcome>;
    async fn block_liquidations(&self) -> ChainResult<TxOutcome>;
    async fn unblock_liquidations(&self) -> ChainResult<TxOutcome>;
    async fn swap_weth_for_usdc(&self, amount_in: U256) -> ChainResult<TxOutcome>;
    async fn swap_usdc_for_weth(&self, amount_in: U256) -> ChainResult<TxOutcome>;
}

/// Live [`ProtocolClient`] over an [`RpcClient`] and a [`TxSender`].
pub struct ProtocolContracts {
    rpc: Arc<RpcClient>,
    sender: Arc<TxSender>,
    addresses: ContractAddresses,
    retry: RetryPolicy,
}

impl ProtocolContracts {
    pub fn new(rpc: Arc<RpcClient>, sender: Arc<TxSender>, addresses: ContractAddresses) -> Self {
        Self {
            rpc,
            sender,
            addresses,
            retry: RetryPolicy::default(),
        }
    }

    async fn view<C: SolCall>(&self, to: Address, call: C) -> ChainResult<C::Return> {
        let data = call.abi_encode();
        let raw = with_retry(&self.retry, || self.rpc.call(to, &data)).await?;
        C::abi_decode_returns(&raw, true)
            .map_err(|err| ChainError::Permanent(format!("abi decode {}: {err}", C::SIGNATURE)))
    }

    fn decode_logs(&self, logs: Vec<RpcLog>) -> ProtocolLogs {
        let mut decoded = ProtocolLogs::default();
        for log in logs {
            let Some(topic0) = log.topics.first().copied() else {
                continue;
            };
            let block = BlockNumber::new(log.block_number.unwrap_or_default());
            if log.address == self.addresses.amm && topic0 == IAmmPool::Swap::SIGNATURE_HASH {
                if let Ok(swap) =
                    IAmmPool::Swap::decode_raw_log(log.topics.iter().copied(), &log.data, true)
                {
                    decoded.swaps.push(SwapSeen {
                        sender: swap.sender,
                        amount_in: swap.amountIn,
                        is_weth_to_usdc: swap.isWethToUsdc,
                        block,
                    });
                }
            } else if log.address == self.addresses.oracle
                && topic0 == IPriceOracle::PriceUpdated::SIGNATURE_HASH
            {
                decoded.oracle_updates += 1;
            } else if log.address == self.addresses.vault
                && topic0 == ILendingVault::Liquidation::SIGNATURE_HASH
            {
                if let Ok(liq) = ILendingVault::Liquidation::decode_raw_log(
                    log.topics.iter().copied(),
                    &log.data,
                    true,
                ) {
                    decoded.liquidations.push(LiquidationSeen {
                        user: liq.user,
                        block,
                    });
                }
            }
        }
        decoded
    }

    fn price_from_u256(value: U256, what: &str) -> ChainResult<PriceE8> {
        PriceE8::from_u256(value)
            .ok_or_else(|| ChainError::Permanent(format!("{what} does not fit fixed-point range")))
    }
}

#[async_trait]
impl ProtocolClient for ProtocolContracts {
    async fn current_block(&self) -> ChainResult<BlockNumber> {
        let number = with_retry(&self.retry, || self.rpc.block_number()).await?;
        Ok(BlockNumber::new(number))
    }

    async fn oracle_price(&self) -> ChainResult<OracleReading> {
        let ret = self
            .view(self.addresses.oracle, IPriceOracle::getPriceCall {})
            .await?;
        Ok(OracleReading {
            price: Self::price_from_u256(ret.price, "oracle price")?,
            timestamp: ret.timestamp.try_into().unwrap_or(u64::MAX),
            block: BlockNumber::new(ret.blockNumber.try_into().unwrap_or_default()),
        })
    }

    async fn amm_reserves(&self) -> ChainResult<AmmReserves> {
        let ret = self
            .view(self.addresses.amm, IAmmPool::getReservesCall {})
            .await?;
        Ok(AmmReserves {
            weth: ret.wethReserve,
            usdc: ret.usdcReserve,
            spot_price: Self::price_from_u256(ret.spotPrice, "amm spot price")?,
        })
    }

    async fn chain_flags(&self) -> ChainResult<ChainStateView> {
        let amm_paused = self
            .view(self.addresses.amm, IAmmPool::pausedCall {})
            .await?
            ._0;
        let vault_paused = self
            .view(self.addresses.vault, ILendingVault::pausedCall {})
            .await?
            ._0;
        let liquidations_blocked = self
            .view(self.addresses.vault, ILendingVault::liquidationsBlockedCall {})
            .await?
            ._0;
        Ok(ChainStateView {
            amm_paused,
            vault_paused,
            liquidations_blocked,
        })
    }

    async fn protocol_logs(&self, from: BlockNumber, to: BlockNumber) -> ChainResult<ProtocolLogs> {
        if from > to {
            return Ok(ProtocolLogs::default());
        }
        let addresses = [
            self.addresses.amm,
            self.addresses.oracle,
            self.addresses.vault,
        ];
        let logs = with_retry(&self.retry, || {
            self.rpc
                .get_logs(from.into_inner(), to.into_inner(), &addresses)
        })
        .await?;
        Ok(self.decode_logs(logs))
    }

    async fn pause_amm(&self) -> ChainResult<TxOutcome> {
        self.sender
            .submit(self.addresses.amm, IAmmPool::pauseCall {}.abi_encode())
            .await
    }

    async fn unpause_amm(&self) -> ChainResult<TxOutcome> {
        self.sender
            .submit(self.addresses.amm, IAmmPool::unpauseCall {}.abi_encode())
            .await
    }

    async fn pause_vault(&self, reason: &str) -> ChainResult<TxOutcome> {
        // Reason strings are bounded to keep calldata gas predictable.
        let mut reason = reason.to_string();
        if reason.len() > 200 {
            let mut cut = 200;
            while !reason.is_char_boundary(cut) {
                cut -= 1;
            }
            reason.truncate(cut);
        }
        self.sender
            .submit(
                self.addresses.vault,
                ILendingVault::pauseCall { reason }.abi_encode(),
            )
            .await
    }

    async fn unpause_vault(&self) -> ChainResult<TxOutcome> {
        self.sender
            .submit(self.addresses.vault, ILendingVault::unpauseCall {}.abi_encode())
            .await
    }

    async fn block_liquidations(&self) -> ChainResult<TxOutcome> {
        self.sender
            .submit(
                self.addresses.vault,
                ILendingVault::blockLiquidationsCall {}.abi_encode(),
            )
            .await
    }

    async fn unblock_liquidations(&self) -> ChainResult<TxOutcome> {
        self.sender
            .submit(
                self.addresses.vault,
                ILendingVault::unblockLiquidationsCall {}.abi_encode(),
            )
            .await
    }

    async fn swap_weth_for_usdc(&self, amount_in: U256) -> ChainResult<TxOutcome> {
        self.sender
            .submit(
                self.addresses.amm,
                IAmmPool::swapWethForUsdcCall { amountIn: amount_in }.abi_encode(),
            )
            .await
    }

    async fn swap_usdc_for_weth(&self, amount_in: U256) -> ChainResult<TxOutcome> {
        self.sender
            .submit(
                self.addresses.amm,
                IAmmPool::swapUsdcForWethCall { amountIn: amount_in }.abi_encode(),
            )
            .await
    }
}
