//! Duskpool - Main Entry Point
//!
//! This file serves as the entry point for the Duskpool mining pool server.
//! It loads configuration, initializes logging, and wires the Upstream
//! Feed, Treasury Tracker, Stratum layer, Reward Allocator, and
//! Persistence Gateway together.

use clap::{Parser, Subcommand};
use log::{error, info, warn};
use std::process;
use std::sync::Arc;

use duskpool_allocator::{ActiveWorkerSnapshot, AllocatorConfig, RewardAllocator};
use duskpool_core::current_timestamp;
use duskpool_crypto::Sha256dHasher;
use duskpool_rpc::{NodeClient, NodeEvent, RestClient, WsNodeClient};
use duskpool_storage::{PersistenceGateway, SqliteGateway};
use duskpool_stratum::{MiningPool, PortPolicy, SharesManagerConfig, StratumPort};
use duskpool_treasury::{CoinbaseEvent, TreasuryConfig, TreasuryTracker};
use duskpool_util::PoolConfig;

#[derive(Parser)]
#[clap(name = "duskpool")]
#[clap(about = "Duskpool - a Stratum mining pool server for Kaspa-family BlockDAG coins")]
struct Cli {
    /// Sets a custom config file
    #[clap(short, long, value_name = "FILE", default_value = "duskpool.toml")]
    config: String,

    /// Verbosity level (0-5)
    #[clap(short, long, default_value = "3")]
    verbosity: u8,

    #[clap(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the resolved pool configuration and exit
    ShowConfig,
}

fn main() {
    let cli = Cli::parse();
    duskpool_util::init_logging(cli.verbosity);

    let config = match PoolConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            error!("failed to load configuration from {}: {}", cli.config, e);
            process::exit(1);
        }
    };

    if let Some(Commands::ShowConfig) = cli.command {
        println!("{:#?}", config.redacted());
        process::exit(0);
    }

    info!("starting duskpool, network={}", config.network);

    tokio::runtime::Runtime::new().unwrap().block_on(run(config));
}

async fn run(config: PoolConfig) {
    let storage: Arc<dyn PersistenceGateway> = match SqliteGateway::open(&config.database_path).await {
        Ok(gw) => Arc::new(gw),
        Err(e) => {
            error!("failed to open database at {}: {}", config.database_path.display(), e);
            process::exit(1);
        }
    };

    let (_ws_client, mut node_events) = WsNodeClient::connect(&config.node_rpc_url).await;
    let rest = Arc::new(RestClient::new(&config.node_rest_url));
    let node: Arc<dyn NodeClient> = rest.clone();
    let hasher = Arc::new(Sha256dHasher);

    let treasury_config = TreasuryConfig {
        pool_address: config.pool_address.clone(),
        pool_fee_bps: config.pool_fee_bps,
        worker_pool_size: config.treasury_worker_pool_size,
        pool_start_time: current_timestamp() as i64,
    };
    let (treasury, mut coinbase_events) = TreasuryTracker::new(treasury_config, storage.clone());
    let treasury = Arc::new(treasury);
    treasury.spawn_workers();

    let ports: Vec<StratumPort> = config
        .stratum_ports
        .iter()
        .map(|p| StratumPort {
            policy: Arc::new(PortPolicy {
                port: p.port,
                initial_difficulty: p.initial_difficulty,
                extra_nonce_size: p.extra_nonce_size,
                allow_user_difficulty: p.allow_user_difficulty,
                var_diff: p.var_diff,
                min_diff: p.min_diff,
            }),
            shares_config: SharesManagerConfig {
                shares_per_minute: p.shares_per_minute,
                clamp_pow2: p.clamp_pow2,
                min_diff: p.min_diff,
                max_diff: p.max_diff,
            },
        })
        .collect();
    let port_policies: Vec<Arc<PortPolicy>> = ports.iter().map(|p| p.policy.clone()).collect();

    let pool = Arc::new(MiningPool::new(config.template_cache_size, node.clone(), storage.clone(), hasher, ports));
    pool.spawn_maintenance_tasks();

    for policy in port_policies {
        let pool = pool.clone();
        tokio::spawn(async move {
            if let Err(e) = pool.serve_port(policy.clone()).await {
                error!("stratum listener on port {} stopped: {}", policy.port, e);
            }
        });
    }

    let allocator_config = AllocatorConfig { rebate_bps: config.rebate_bps, pool_miner_info_tag: config.pool_miner_info_tag.clone() };
    let allocator = Arc::new(RewardAllocator::new(allocator_config, storage.clone(), rest.clone(), pool.share_window()));

    {
        let allocator = allocator.clone();
        let pool = pool.clone();
        tokio::spawn(async move {
            while let Some(event) = coinbase_events.recv().await {
                handle_coinbase(&allocator, &pool, event).await;
            }
        });
    }

    {
        let pool = pool.clone();
        let treasury = treasury.clone();
        tokio::spawn(async move {
            while let Some(event) = node_events.recv().await {
                match event {
                    NodeEvent::NewBlockTemplate(tpl) => pool.handle_new_block_template(tpl).await,
                    NodeEvent::BlockAdded(block) => treasury.handle_block_added(block).await,
                    NodeEvent::Maturity(maturity) => {
                        if let Err(e) = treasury.handle_maturity(maturity).await {
                            warn!("failed to process maturity event: {}", e);
                        }
                    }
                    NodeEvent::UtxoProcStart => treasury.handle_utxo_proc_start().await,
                }
            }
        });
    }

    info!("duskpool started, stratum ports: {:?}", config.stratum_ports.iter().map(|p| p.port).collect::<Vec<_>>());

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown signal received, exiting");
}

async fn handle_coinbase(allocator: &RewardAllocator, pool: &MiningPool, event: CoinbaseEvent) {
    let now = current_timestamp();
    let active_workers: Vec<ActiveWorkerSnapshot> = pool
        .active_worker_snapshots()
        .await
        .into_iter()
        .map(|w| ActiveWorkerSnapshot {
            payout_address: w.identity.payout_address,
            worker_name: w.identity.worker_name,
            min_diff: w.min_diff,
            seconds_since_last_share: now.saturating_sub(w.last_share),
        })
        .collect();
    match allocator.allocate(event, &active_workers).await {
        Ok(outcome) => info!(
            "allocated coinbase: mined_block={} daa={} miners={} credited={}",
            outcome.mined_block_hash, outcome.mined_daa_score, outcome.miners_credited, outcome.total_credited
        ),
        Err(e) => error!("allocation failed: {}", e),
    }
}
