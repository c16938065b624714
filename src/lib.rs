//! vigil: autonomous on-chain security monitor for a WETH/USDC lending
//! protocol.
//!
//! The core loop observes the chain, screens each snapshot with a
//! deterministic anomaly filter, consults an LLM only for deduplicated
//! anomalous states, maps classifications onto protective transactions
//! and restores the AMM price after a defense. An embedded HTTP/WebSocket
//! API fronts the event store for the dashboard.

pub mod actor;
pub mod agent;
pub mod chain;
pub mod config;
pub mod decider;
pub mod errors;
pub mod events;
pub mod filter;
pub mod llm;
pub mod observer;
pub mod reasoner;
pub mod restore;
pub mod server;
pub mod store;
pub mod types;

pub use actor::{ActionRecord, ActionWorker, Actor, IntentSlot, PendingIntent, StateCache};
pub use agent::{Agent, CycleReport, LatestSnapshot, MonitorStatus};
pub use chain::{
    AmmReserves, ChainStateView, LiquidationSeen, OracleReading, ProtocolClient,
    ProtocolContracts, ProtocolLogs, RetryPolicy, RpcClient, SwapSeen, TxOutcome, TxSender,
};
pub use config::{Config, ContractAddresses, DeciderThresholds, FilterThresholds};
pub use decider::{decide, ActionKind, Intent};
pub use errors::{ApiError, ChainError, ChainResult, LlmError, LlmResult};
pub use events::{Event, EventPayload, LifecyclePhase};
pub use filter::{should_reason, AnomalySignal};
pub use llm::{HttpLlmClient, LlmClient};
pub use observer::{Observer, Snapshot};
pub use reasoner::{Classification, ClassificationSource, Reasoner, ThreatKind};
pub use restore::{counter_swap, perform_restore, CounterSwap, RestoreConfig, RestoreScheduler, SwapDirection};
pub use server::{router, ApiState};
pub use store::{EventStore, StoreCounters};
pub use types::{BlockNumber, Confidence, CycleIndex, DeviationBps, EventId, PriceE8};
