// src/main.rs

//! The main entry point for the cluster coordination node.

use anyhow::{anyhow, Result};
use std::env;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, info};
use tracing_subscriber::{filter::EnvFilter, prelude::*};
use vdiclusterd::config::Config;
use vdiclusterd::core::collaborators::{NullObjectStore, NullRequestExecutor, NullVdiLayer};
use vdiclusterd::core::driver::tcp::{TcpClusterDriver, TcpDriverConfig};
use vdiclusterd::core::driver::ClusterDriver;
use vdiclusterd::core::epoch_log::EpochLog;
use vdiclusterd::core::node::NodeEntry;
use vdiclusterd::core::protocol::message::VdiOpKind;
use vdiclusterd::core::protocol::vdi_op::MakeFsRequest;
use vdiclusterd::core::status::ClusterStatusCode;
use vdiclusterd::Core;

#[tokio::main]
async fn main() -> Result<()> {
    run_app().await
}

async fn run_app() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");
    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("vdiclusterd version {VERSION}");
        return Ok(());
    }

    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("config.toml");

    let config = match Config::from_file(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("failed to load configuration from \"{config_path}\": {e}");
            std::process::exit(1);
        }
    };

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    tracing_subscriber::registry()
        .with(EnvFilter::new(log_level))
        .with(tracing_subscriber::fmt::layer().compact().with_ansi(true))
        .init();

    let send_format = args.contains(&"--format".to_string());

    if let Err(e) = run_node(config, send_format).await {
        error!("node runtime error: {}", e);
        return Err(e);
    }

    Ok(())
}

async fn run_node(config: Config, send_format: bool) -> Result<()> {
    let my_entry = NodeEntry::new(config.node.host.clone(), config.node.port, 0, 128);

    let epoch_log = EpochLog::open(&config.cluster.epoch_log_dir)?;
    let object_store = Arc::new(NullObjectStore::default());
    let vdi_layer = Arc::new(NullVdiLayer);
    let executor = Arc::new(NullRequestExecutor);

    let driver: Arc<dyn ClusterDriver> = match config.cluster.driver.as_str() {
        "tcp" => {
            let bus_addr = format!("{}:{}", config.node.host, config.cluster.bus_port)
                .parse()
                .map_err(|e| anyhow!("invalid node.host/cluster.bus_port: {}", e))?;
            let sequencer_addr = config
                .cluster
                .sequencer_addr
                .as_deref()
                .ok_or_else(|| anyhow!("cluster.sequencer_addr is required for the tcp driver"))?
                .parse()
                .map_err(|e| anyhow!("invalid cluster.sequencer_addr: {}", e))?;
            Arc::new(TcpClusterDriver::new(TcpDriverConfig {
                bus_addr,
                sequencer_addr,
                entry: my_entry.clone(),
            }))
        }
        other => {
            return Err(anyhow!(
                "cluster.driver = \"{}\" is not runnable as a standalone process; \
                 the simulated driver exists for in-process tests only",
                other
            ));
        }
    };

    let my_id = driver.init().await.map_err(|e| anyhow!(e.to_string()))?;

    let core = Core::new(
        my_id,
        my_entry,
        epoch_log,
        object_store,
        vdi_layer,
        executor,
        config.cluster.replication_factor_hint,
    );

    if send_format {
        let format_core = Arc::clone(&core);
        let format_driver = Arc::clone(&driver);
        let copies = config.cluster.replication_factor_hint;
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            let ctime = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let op = vdiclusterd::core::protocol::message::VdiOpPayload {
                kind: VdiOpKind::MakeFs,
                request_id: 1,
                request_body: bincode::encode_to_vec(
                    MakeFsRequest { ctime, copies },
                    bincode::config::standard(),
                )
                .unwrap(),
                result: ClusterStatusCode::Success,
                response_body: vec![],
            };
            match format_core.submit_vdi_op(format_driver.as_ref(), op).await {
                Ok(response) if response.result == ClusterStatusCode::Success => {
                    info!("cluster formatted at ctime {}", ctime);
                }
                Ok(response) => error!("make-fs rejected: {:?}", response.result),
                Err(e) => error!("failed to submit make-fs: {}", e),
            }
        });
    }

    core.run(driver).await.map_err(|e| anyhow!(e.to_string()))
}
