use clap::Parser;
use fog_client::app::netapp_cli;
use fog_client::core::protocol::{ProtocolContext, ProtocolNode, ProtocolSettings};
use fog_client::domain::model::Mode;
use fog_client::domain::ports::{OrchestratorApi, RequestRecorder};
use fog_client::utils::error::ErrorSeverity;
use fog_client::utils::{logger, validation::Validate};
use fog_client::{
    CliConfig, CosCatalog, CsvRequestStore, FogError, LocalStorage, Manager, NodeOptions,
    OrchestratorClient, Result, Session,
};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = CliConfig::parse();

    // 初始化日誌
    logger::init_cli_logger(config.verbose(), &config.data_dir);

    tracing::info!("Starting fog-client in {} mode", config.mode());
    if config.verbose() {
        tracing::debug!("CLI config: {:?}", config);
    }

    // 驗證配置
    if let Err(e) = config.validate() {
        tracing::error!("❌ Configuration validation failed: {}", e);
        tracing::error!("💡 Suggestion: {}", e.recovery_suggestion());
        eprintln!("❌ {}", e.user_friendly_message());
        std::process::exit(1);
    }

    if let Err(e) = run(config).await {
        tracing::error!(
            "❌ fog-client failed: {} (Category: {:?}, Severity: {:?})",
            e,
            e.category(),
            e.severity()
        );
        tracing::error!("💡 Recovery suggestion: {}", e.recovery_suggestion());
        eprintln!("❌ {}", e.user_friendly_message());
        eprintln!("💡 {}", e.recovery_suggestion());

        // 根據錯誤嚴重程度決定退出碼
        let exit_code = match e.severity() {
            ErrorSeverity::Low => 0,
            ErrorSeverity::Medium => 2,
            ErrorSeverity::High => 1,
            ErrorSeverity::Critical => 3,
        };
        if exit_code > 0 {
            std::process::exit(exit_code);
        }
    }

    Ok(())
}

async fn run(config: CliConfig) -> Result<()> {
    let server = config.server()?;
    let mode = config.mode();
    let catalog = match &config.cos_file {
        Some(path) => CosCatalog::from_file(path)?,
        None => CosCatalog::builtin(),
    };

    let client = OrchestratorClient::new(server)?;
    tracing::info!("Orchestrator API at {}", client.base_url());
    let api: Arc<dyn OrchestratorApi> = Arc::new(client);
    let mut manager = Manager::new(api.clone(), server, mode, &config.data_dir);

    let node_args = config.node_args();
    let options = NodeOptions {
        id: node_args.id,
        label: node_args.label,
        dpid: config.dpid().map(str::to_string),
    };

    let session = tokio::select! {
        session = manager.connect(&options, config.declared_capacity()) => session?,
        _ = tokio::signal::ctrl_c() => {
            println!();
            return Ok(());
        }
    };
    println!("✅ Node connected ({})", mode);

    let served = serve(&config, mode, catalog, api, session).await;

    let deleted = manager.disconnect().await;
    tracing::info!("Disconnected (node deleted: {})", deleted);
    served
}

/// Runs the protocol and the interactive sender until Ctrl-C.
async fn serve(
    config: &CliConfig,
    mode: Mode,
    catalog: CosCatalog,
    api: Arc<dyn OrchestratorApi>,
    session: Session,
) -> Result<()> {
    let cancel = CancellationToken::new();
    let mut protocol = None;

    if mode != Mode::Switch {
        match ProtocolSettings::from_remote(&session.settings, session.my_ip, session.my_mac.clone()) {
            Ok(settings) => {
                let store = Arc::new(CsvRequestStore::open(
                    LocalStorage::new(&config.data_dir),
                    session.my_ip,
                    Some(api),
                )?);
                let known_ids = store.known_ids().await;
                let recorder: Arc<dyn RequestRecorder> = store;
                let bind = SocketAddr::from((Ipv4Addr::UNSPECIFIED, session.settings.protocol_port));
                let node = ProtocolNode::start(
                    bind,
                    ProtocolContext {
                        settings,
                        catalog,
                        resources: session.resources.clone(),
                        recorder: Some(recorder),
                        known_ids,
                    },
                )
                .await?;

                tokio::spawn(netapp_cli::run(
                    node.clone(),
                    mode,
                    BufReader::new(tokio::io::stdin()),
                    cancel.clone(),
                ));
                protocol = Some(node);
            }
            Err(FogError::ProtocolDisabled) => {
                tracing::warn!(
                    "Protocol will not be used (PROTOCOL_SEND_TO is {})",
                    session.settings.send_to
                );
            }
            Err(e) => return Err(e),
        }
    }

    if tokio::signal::ctrl_c().await.is_err() {
        tracing::warn!("Unable to listen for Ctrl-C");
    }
    println!();

    cancel.cancel();
    if let Some(node) = protocol {
        node.shutdown();
    }
    Ok(())
}
