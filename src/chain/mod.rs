pub mod contracts;
pub mod rpc;
pub mod signer;

pub use contracts::{
    AmmReserves, ChainStateView, LiquidationSeen, OracleReading, ProtocolClient,
    ProtocolContracts, ProtocolLogs, SwapSeen,
};
pub use rpc::{with_retry, RetryPolicy, RpcClient};
pub use signer::{TxOutcome, TxSender};
