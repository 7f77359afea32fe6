mod config;
mod contract;
mod dispute;
mod error;
mod kv;
mod metrics;
mod mining_manager;
mod model;
mod submitter;
mod tasker;
mod trackers;
mod transactor;
mod worker;

use clap::Parser;
use config::Config;
use contract::OracleContract;
use error::CoreError;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Middleware, Provider, Ws};
use ethers::signers::{LocalWallet, Signer};
use eyre::{eyre, Result};
use fs2::FileExt;
use model::Account;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "oracle-miner", version, about = "Oracle mining and submission daemon")]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Override the RPC node URL from the config file (must be a ws:// or wss:// URL;
    /// event subscriptions require a pubsub-capable transport).
    #[arg(long)]
    node_url: Option<String>,

    /// Path to a `.env` file to load before reading the private key environment
    /// variable. Defaults to `.env` in the working directory if present.
    #[arg(long)]
    env_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    match &args.env_file {
        Some(path) => {
            dotenvy::from_path(path).map_err(|e| eyre!("failed to load env file {}: {e}", path.display()))?;
        }
        None => {
            let _ = dotenvy::dotenv();
        }
    }

    let mut config = Config::load(&args.config).map_err(report_config_error)?;
    if let Some(node_url) = args.node_url {
        config.node_url = node_url;
    }

    let private_key = config::load_private_key(&config.private_key_env).map_err(report_config_error)?;

    std::fs::create_dir_all(&config.index_folder)
        .map_err(|e| eyre!("failed to create index store directory: {e}"))?;

    // Single-instance guard, alongside the KV store.
    let lock_path = std::path::Path::new(&config.index_folder).join("oracle-miner.lock");
    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&lock_path)
        .map_err(|e| eyre!("failed to open lock file {}: {e}", lock_path.display()))?;
    lock_file
        .try_lock_exclusive()
        .map_err(|e| eyre!("another instance is already running ({}): {e}", lock_path.display()))?;
    let _lock_guard = lock_file;

    let provider = Provider::<Ws>::connect(&config.node_url)
        .await
        .map_err(|e| eyre!("failed to connect to node {}: {e}", config.node_url))?;

    let remote_chain_id = provider.get_chainid().await.map_err(|e| eyre!("get_chainid failed: {e}"))?;
    let wallet = private_key
        .parse::<LocalWallet>()
        .map_err(|e| eyre!("invalid private key: {e}"))?
        .with_chain_id(remote_chain_id.as_u64());

    let code = provider
        .get_code(config.contract_address, None)
        .await
        .map_err(|e| eyre!("get_code failed: {e}"))?;
    if code.0.is_empty() {
        return Err(eyre!("no contract code at configured address {:?}", config.contract_address));
    }

    // Wrapped in its own Arc rather than handed to SignerMiddleware directly so the
    // Transactor's client type lines up with its generic parameter (`Arc<SignerMiddleware<Arc<M>, _>>`).
    // No NonceManagerMiddleware here: the Transactor owns nonce selection itself (read-latest,
    // reuse-across-retries, bump-on-replace), and a middleware-level nonce cache would fight it.
    let provider = Arc::new(provider);
    let signer = SignerMiddleware::new(provider, wallet.clone());
    let client = Arc::new(signer);

    let account = Account::new(wallet, 0);
    let accounts = vec![account];

    let store = kv::IndexStore::open(&config.index_folder)
        .map_err(|e| eyre!("failed to open index store: {e}"))?;

    let contract = OracleContract::new(config.contract_address, client.clone());

    let root_cancel = CancellationToken::new();

    tracing::info!(
        contract = ?config.contract_address,
        node_url = %config.node_url,
        public_address = ?config.public_address,
        "oracle-miner starting"
    );

    let mut join_handles = Vec::new();

    // Tasker: subscribes to NewChallenge and feeds the Mining Manager.
    let (challenge_tx, challenge_rx) = tasker::channel();
    {
        let contract = contract.clone();
        let cancel = root_cancel.clone();
        let tx = challenge_tx.clone();
        join_handles.push(tokio::spawn(async move {
            tasker::run(contract, tx, std::time::Duration::from_secs(5), cancel).await;
        }));
    }
    // Polling safety net: repairs gaps across Tasker resubscribe boundaries by
    // republishing the `currentVariables` tracker's snapshot every tracker_sleep_cycle.
    {
        let store = store.clone();
        let cancel = root_cancel.clone();
        let sleep_cycle = config.tracker_sleep_cycle;
        join_handles.push(tokio::spawn(async move {
            tasker::run_kv_repair(store, challenge_tx, sleep_cycle, cancel).await;
        }));
    }

    let manager = mining_manager::MiningManager::new(
        account_address(&accounts),
        config.num_processors,
        gpu_worker_count(&config),
        root_cancel.clone(),
    );

    let (solutions_tx, solutions_rx) = mpsc::channel(64);
    {
        let manager = manager.clone();
        let cancel = root_cancel.clone();
        join_handles.push(tokio::spawn(async move {
            mining_manager::run_solution_collector(manager, solutions_rx, cancel).await;
        }));
    }
    {
        let manager = manager.clone();
        let cancel = root_cancel.clone();
        join_handles.push(tokio::spawn(async move {
            mining_manager::run_challenge_feed(manager, challenge_rx, solutions_tx, cancel).await;
        }));
    }

    // One Submitter per account, each driving its solutions through the Transactor.
    for acc in &accounts {
        let sub_rx = manager.subscribe().await;
        let store = store.clone();
        let account = acc.clone();
        let config = config.clone();
        let client = client.clone();
        let cancel = root_cancel.clone();
        join_handles.push(tokio::spawn(async move {
            let transactor = Arc::new(transactor::Transactor {
                client,
                store: store.clone(),
                config: config.clone(),
            });
            submitter::run(account, store, sub_rx, cancel, move |account, job| {
                let transactor = transactor.clone();
                let contract_address = config.contract_address;
                async move {
                    metrics::SOLUTIONS_FORWARDED.inc();
                    let calldata = submit_mining_solution_calldata(&job);
                    metrics::TXS_SENT.inc();
                    let cancel_token = CancellationToken::new();
                    match transactor.transact(contract_address, calldata, &cancel_token).await {
                        Ok(_) => {
                            metrics::TXS_SUCCEEDED.inc();
                            tracing::info!(account = ?account.address, "submission confirmed");
                            Ok(())
                        }
                        Err(CoreError::Cancelled) => Ok(()),
                        Err(err) => {
                            metrics::TXS_FAILED.inc();
                            tracing::warn!(account = ?account.address, kind = err.kind_name(), error = %err, "submission failed");
                            Err(eyre::eyre!("{err}"))
                        }
                    }
                }
            })
            .await;
        }));
    }

    // Trackers.
    let trackers = build_trackers(&config, client.clone(), contract.clone(), store.clone(), &accounts);
    {
        let sleep_cycle = config.tracker_sleep_cycle;
        let cancel = root_cancel.clone();
        join_handles.push(tokio::spawn(async move {
            trackers::run_scheduler(trackers, sleep_cycle, cancel).await;
        }));
    }

    // Dispute checker (off by default).
    if config.enabled_trackers.dispute_checker {
        let checker = dispute::DisputeChecker {
            client: client.clone(),
            contract_address: config.contract_address,
            store: store.clone(),
            dispute_time_delta: config.dispute_time_delta,
            dispute_threshold: config.dispute_threshold,
            report_dir: std::path::PathBuf::from("."),
            last_checked_block: 0,
        };
        let sleep_cycle = config.tracker_sleep_cycle;
        let cancel = root_cancel.clone();
        join_handles.push(tokio::spawn(async move {
            dispute::run(checker, sleep_cycle, cancel).await;
        }));
    }

    // Metrics / operational HTTP endpoints.
    {
        let addr: std::net::SocketAddr = format!("{}:{}", config.server_host, config.server_port)
            .parse()
            .map_err(|e| eyre!("invalid server_host/server_port: {e}"))?;
        let store = store.clone();
        let account_addrs = accounts.iter().map(|a| a.address).collect();
        let whitelist = config.server_whitelist.clone();
        join_handles.push(tokio::spawn(async move {
            if let Err(err) = metrics::serve(store, account_addrs, whitelist, addr).await {
                tracing::error!(error = %err, "metrics server exited with an error");
            }
        }));
    }

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received; cancelling all components");
    root_cancel.cancel();

    for handle in join_handles {
        let _ = handle.await;
    }

    Ok(())
}

fn report_config_error(err: CoreError) -> eyre::Report {
    eyre!("{err}")
}

fn account_address(accounts: &[Account]) -> ethers::types::Address {
    accounts.first().map(|a| a.address).unwrap_or_default()
}

fn gpu_worker_count(config: &Config) -> usize {
    config.gpu_config.values().filter(|g| !g.disabled).count()
}

fn submit_mining_solution_calldata(job: &model::SubmitJob) -> ethers::types::Bytes {
    use ethers::abi::Token;
    let tokens = vec![
        Token::String(job.solution.nonce.clone()),
        Token::FixedArray(job.solution.request_ids.iter().map(|v| Token::Uint(*v)).collect()),
        Token::FixedArray(job.request_values.iter().map(|v| Token::Uint(*v)).collect()),
    ];
    let selector = ethers::utils::id("submitMiningSolution(string,uint256[5],uint256[5])");
    let mut data = selector[..4].to_vec();
    data.extend(ethers::abi::encode(&tokens));
    ethers::types::Bytes::from(data)
}

fn build_trackers<M: Middleware + 'static>(
    config: &Config,
    client: Arc<M>,
    contract: OracleContract<M>,
    store: kv::IndexStore,
    accounts: &[Account],
) -> Vec<Box<dyn trackers::Tracker>> {
    let mut out: Vec<Box<dyn trackers::Tracker>> = Vec::new();
    let toggles = &config.enabled_trackers;

    if toggles.balance {
        out.push(Box::new(trackers::BalanceTracker {
            client: client.clone(),
            store: store.clone(),
            accounts: accounts.to_vec(),
        }));
    }
    if toggles.tribute_balance {
        out.push(Box::new(trackers::TributeBalanceTracker {
            contract: contract.clone(),
            store: store.clone(),
            accounts: accounts.to_vec(),
        }));
    }
    if toggles.gas {
        out.push(Box::new(trackers::GasTracker { client: client.clone(), store: store.clone() }));
    }
    if toggles.current_variables || toggles.new_current_variables {
        out.push(Box::new(trackers::CurrentVariablesTracker { contract: contract.clone(), store: store.clone() }));
    }
    if toggles.time_out {
        out.push(Box::new(trackers::TimeoutTracker {
            store: store.clone(),
            request_ids: (1..=5u64).map(ethers::types::U256::from).collect(),
        }));
    }
    if toggles.dispute_status {
        out.push(Box::new(trackers::DisputeStatusTracker {
            contract: contract.clone(),
            store: store.clone(),
            accounts: accounts.to_vec(),
        }));
    }
    out
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    let mut sighup = signal(SignalKind::hangup()).expect("failed to register SIGHUP handler");
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
        _ = sighup.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
