use std::{process, sync::Arc, time::Duration};

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use vigil::{
    actor::{ActionWorker, Actor, IntentSlot, StateCache},
    agent::{Agent, LatestSnapshot, MonitorStatus},
    chain::{with_retry, ProtocolClient, ProtocolContracts, RetryPolicy, RpcClient, TxSender},
    config::Config,
    errors::LlmError,
    llm::HttpLlmClient,
    observer::Observer,
    reasoner::Reasoner,
    restore::{RestoreConfig, RestoreScheduler},
    server::{router, ApiState},
    store::EventStore,
};

/// Process exit codes: 0 normal, 1 configuration, 2 unrecoverable chain,
/// 3 LLM credential.
const EXIT_CONFIG: i32 = 1;
const EXIT_CHAIN: i32 = 2;
const EXIT_LLM: i32 = 3;

const RPC_CALL_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vigil=info")),
        )
        .init();

    info!("vigil security monitor starting");

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!("configuration error: {err:#}");
            process::exit(EXIT_CONFIG);
        }
    };

    // --- chain adapter -----------------------------------------------------
    let rpc = match RpcClient::new(&config.chain_rpc_url, RPC_CALL_TIMEOUT) {
        Ok(rpc) => Arc::new(rpc),
        Err(err) => {
            error!("invalid chain endpoint: {err}");
            process::exit(EXIT_CONFIG);
        }
    };
    let sender = match TxSender::new(Arc::clone(&rpc), &config.signer_key, config.chain_id) {
        Ok(sender) => Arc::new(sender),
        Err(err) => {
            error!("invalid signer key: {err}");
            process::exit(EXIT_CONFIG);
        }
    };

    let retry = RetryPolicy::default();
    match with_retry(&retry, || rpc.chain_id()).await {
        Ok(chain_id) if chain_id != config.chain_id => {
            warn!(
                expected = config.chain_id,
                actual = chain_id,
                "endpoint chain id differs from configuration"
            );
        }
        Ok(chain_id) => info!(chain_id, "connected to chain endpoint"),
        Err(err) => {
            error!("chain endpoint unreachable after retries: {err}");
            process::exit(EXIT_CHAIN);
        }
    }
    match with_retry(&retry, || rpc.balance(sender.address())).await {
        Ok(balance) if balance.is_zero() => {
            error!(signer = %sender.address(), "signer account has no funds");
            process::exit(EXIT_CHAIN);
        }
        Ok(balance) => info!(signer = %sender.address(), %balance, "signer funded"),
        Err(err) => {
            error!("could not query signer balance after retries: {err}");
            process::exit(EXIT_CHAIN);
        }
    }

    // --- llm ----------------------------------------------------------------
    let llm = match HttpLlmClient::new(
        &config.llm_api_url,
        &config.llm_api_key,
        &config.llm_model,
        config.llm_call_timeout,
    ) {
        Ok(llm) => Arc::new(llm),
        Err(err) => {
            error!("llm client setup failed: {err}");
            process::exit(EXIT_CONFIG);
        }
    };
    match llm.verify_credentials().await {
        Ok(()) => info!(model = %config.llm_model, "llm credentials verified"),
        Err(LlmError::Credential(status)) => {
            error!(status, "llm credential rejected");
            process::exit(EXIT_LLM);
        }
        Err(err) => warn!("llm preflight inconclusive, continuing: {err}"),
    }

    // --- components ---------------------------------------------------------
    let contracts = Arc::new(ProtocolContracts::new(
        Arc::clone(&rpc),
        Arc::clone(&sender),
        config.contracts,
    ));
    let chain: Arc<dyn ProtocolClient> = contracts;

    let store = Arc::new(EventStore::new(config.event_store_capacity));
    let status = Arc::new(MonitorStatus::default());
    let latest = Arc::new(LatestSnapshot::default());
    let state_cache = Arc::new(StateCache::default());
    let slot = Arc::new(IntentSlot::new());
    let restore = Arc::new(RestoreScheduler::new(
        Arc::clone(&chain),
        Arc::clone(&store),
        RestoreConfig {
            delay: config.restore_delay,
            repause: config.repause_after_restore,
        },
    ));

    let observer = Observer::new(Arc::clone(&chain));
    let reasoner = Reasoner::new(
        llm,
        config.llm_call_timeout,
        config.analyzed_events_capacity,
    );
    let agent = Agent::new(
        observer,
        reasoner,
        config.filter_thresholds(),
        config.decider_thresholds(),
        Arc::clone(&slot),
        Arc::clone(&state_cache),
        Arc::clone(&store),
        Arc::clone(&status),
        Arc::clone(&latest),
        config.poll_interval,
    );
    let worker = ActionWorker::new(
        Arc::clone(&slot),
        Actor::new(Arc::clone(&chain)),
        Arc::clone(&state_cache),
        Arc::clone(&store),
        Arc::clone(&restore),
    );

    // --- serve --------------------------------------------------------------
    let api_state = Arc::new(ApiState {
        store: Arc::clone(&store),
        chain: Arc::clone(&chain),
        status: Arc::clone(&status),
        latest: Arc::clone(&latest),
        attack_swap_weth: config.attack_swap_weth,
        repause_after_restore: config.repause_after_restore,
    });
    let listener = match tokio::net::TcpListener::bind(config.http_bind_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(addr = %config.http_bind_addr, "could not bind http listener: {err}");
            process::exit(EXIT_CONFIG);
        }
    };
    info!(addr = %config.http_bind_addr, "http api listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut server_shutdown = shutdown_rx.clone();
    let server_task = tokio::spawn(async move {
        let serve = axum::serve(listener, router(api_state)).with_graceful_shutdown(async move {
            let _ = server_shutdown.changed().await;
        });
        if let Err(err) = serve.await {
            error!("http server error: {err}");
        }
    });
    let worker_task = tokio::spawn(worker.run(shutdown_rx.clone()));
    let agent_task = tokio::spawn(agent.run(shutdown_rx));

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(err) => error!("could not listen for shutdown signal: {err}"),
    }

    let _ = shutdown_tx.send(true);
    restore.cancel();
    let _ = agent_task.await;
    let _ = worker_task.await;
    let _ = server_task.await;

    info!("vigil stopped");
    process::exit(0);
}
