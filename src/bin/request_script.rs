use clap::Parser;
use fog_client::app::netapp_cli::render_result;
use fog_client::config::script_config::ScriptConfig;
use fog_client::core::protocol::{ProtocolContext, ProtocolNode, ProtocolSettings};
use fog_client::domain::ports::{OrchestratorApi, RequestRecorder};
use fog_client::utils::{logger, validation::Validate};
use fog_client::{CsvRequestStore, LocalStorage, Manager, NodeOptions, OrchestratorClient, Result};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

#[derive(Parser)]
#[command(name = "request-script")]
#[command(about = "Sends hosting requests in a loop to load a fog topology")]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "script.toml")]
    config: String,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match ScriptConfig::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ Failed to load config file '{}': {}", args.config, e);
            eprintln!("💡 Make sure the file exists and is valid TOML format");
            std::process::exit(1);
        }
    };

    // 容器內無人值守，使用 JSON 日誌
    logger::init_json_logger(args.verbose || config.verbose);
    tracing::info!("Loaded configuration from {}", args.config);

    // 驗證配置
    if let Err(e) = config.validate() {
        tracing::error!("❌ Configuration validation failed: {}", e);
        tracing::error!("💡 Suggestion: {}", e.recovery_suggestion());
        eprintln!("❌ {}", e.user_friendly_message());
        std::process::exit(1);
    }

    if let Err(e) = run(config).await {
        tracing::error!("❌ request-script failed: {} (Severity: {:?})", e, e.severity());
        eprintln!("❌ {}", e.user_friendly_message());
        eprintln!("💡 {}", e.recovery_suggestion());
        std::process::exit(1);
    }
    Ok(())
}

async fn run(config: ScriptConfig) -> Result<()> {
    let server = config.server()?;
    let catalog = config.catalog()?;
    let interval = config.request_interval()?;
    let api: Arc<dyn OrchestratorApi> = Arc::new(OrchestratorClient::new(server)?);
    let mut manager = Manager::new(api.clone(), server, config.mode, &config.data_dir);

    let options = NodeOptions {
        id: config.id.clone(),
        label: config.label.clone(),
        dpid: None,
    };
    let session = manager.connect(&options, config.declared_capacity()).await?;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let settings = match ProtocolSettings::from_remote(&session.settings, session.my_ip, session.my_mac.clone()) {
        Ok(settings) => settings,
        Err(e) => {
            manager.disconnect().await;
            return Err(e);
        }
    };
    tracing::info!("Protocol flavor: {:?}", settings.flavor);

    let store = Arc::new(CsvRequestStore::open(
        LocalStorage::new(&config.data_dir),
        session.my_ip,
        Some(api),
    )?);
    let known_ids = store.known_ids().await;
    let recorder: Arc<dyn RequestRecorder> = store;
    let node = ProtocolNode::start(
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, session.settings.protocol_port)),
        ProtocolContext {
            settings,
            catalog,
            resources: session.resources.clone(),
            recorder: Some(recorder),
            known_ids,
        },
    )
    .await?;

    if config.is_infinite() {
        tracing::info!("{} threads sending requests until interrupted", config.threads);
    } else {
        tracing::info!("{} threads sending {} requests each", config.threads, config.limit);
    }

    let config = Arc::new(config);
    let mut threads = JoinSet::new();
    for _ in 0..config.threads {
        threads.spawn(send_requests(node.clone(), config.clone(), interval));
    }

    tokio::select! {
        _ = async { while threads.join_next().await.is_some() {} } => {
            tracing::info!("All requests sent");
        }
        _ = tokio::signal::ctrl_c() => {
            threads.abort_all();
        }
    }

    node.shutdown();
    manager.disconnect().await;
    Ok(())
}

/// One sending loop: `limit` requests, `interval` apart.
async fn send_requests(node: Arc<ProtocolNode>, config: Arc<ScriptConfig>, interval: Duration) {
    let data = config.data.clone().into_bytes();
    let mut pending = JoinSet::new();
    let mut index = 0u64;

    while config.is_infinite() || index < config.limit as u64 {
        index += 1;
        if config.sequential {
            send_request(&node, index, config.cos_id, data.clone()).await;
        } else {
            let node = node.clone();
            let data = data.clone();
            let cos_id = config.cos_id;
            pending.spawn(async move { send_request(&node, index, cos_id, data).await });
        }
        tokio::time::sleep(interval).await;
    }

    while pending.join_next().await.is_some() {}
}

async fn send_request(node: &Arc<ProtocolNode>, index: u64, cos_id: u32, data: Vec<u8>) {
    match node.send_request(cos_id, data).await {
        Ok(result) => println!("{}- {}", index, render_result(&result)),
        Err(e) => println!("{}- {}", index, e),
    }
}
