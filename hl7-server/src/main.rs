//! HL7消息分发服务器主程序

mod application;
mod config;

use anyhow::{Context, Result};
use application::LoggingApplication;
use clap::Parser;
use crate::config::ServerConfig;
use hl7_core::Connector;
use hl7_dispatch::{ApiServer, ApiState, ConnectorRegistry, Connectors, MessageDispatcher, ReceivingApplication};
use hl7_store::{DatabasePool, MessageService, SqlMessageService};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// HL7服务器命令行参数
#[derive(Parser, Debug)]
#[command(name = "hl7-server")]
#[command(about = "HL7 v2 消息分发服务器 (MLLP)")]
struct Args {
    /// 配置文件路径
    #[arg(short, long)]
    config: Option<String>,

    /// 日志级别（RUST_LOG 优先）
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// 数据库连接字符串，覆盖配置文件
    #[arg(short, long)]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 初始化日志
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting HL7 server...");

    let mut config = ServerConfig::load(args.config.as_deref())?;
    if let Some(url) = args.database_url {
        config.database.url = url;
    }
    config.validate()?;

    info!("HL7 server configuration:");
    info!("  Database: {}", config.database.url);
    info!("  Connectors: {}", config.connectors.len());
    if config.api.enabled {
        info!("  API: {}", config.api.address);
    }

    let pool = DatabasePool::connect(&config.database.url, config.database.max_connections)
        .await
        .context("Failed to connect to database")?;
    let store = SqlMessageService::new(&pool);
    store.create_tables().await.context("Failed to create tables")?;
    let service: Arc<dyn MessageService> = Arc::new(store);

    let registry = Arc::new(ConnectorRegistry::with_connectors(config.connectors.clone()));
    let dispatcher = Arc::new(MessageDispatcher::new(
        service,
        registry.clone(),
        config.dispatcher.clone(),
    ));
    let watcher = dispatcher.watch(registry.subscribe());
    dispatcher.start().await.context("Failed to start dispatcher")?;

    let application: Arc<dyn ReceivingApplication> =
        Arc::new(LoggingApplication::accepting(config.accepted_message_types.clone()));
    for connector in config.connectors.iter().filter(|c| c.is_receiver()) {
        let address = dispatcher
            .listen(connector, application.clone())
            .await
            .with_context(|| format!("Failed to listen on {}", connector))?;
        info!(connector = %connector.reference, "Receiver listening on {}", address);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let api = if config.api.enabled {
        let server = ApiServer::new(ApiState::new(dispatcher.clone(), registry.clone()));
        let address = config.api.address.clone();
        let mut shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            server
                .run(&address, async move {
                    let _ = shutdown.changed().await;
                })
                .await
        }))
    } else {
        None
    };

    #[cfg(unix)]
    let reload = spawn_reload(
        args.config.clone(),
        registry.clone(),
        dispatcher.clone(),
        application.clone(),
        shutdown_rx.clone(),
    )?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    if let Some(api) = api {
        match api.await {
            Ok(Err(e)) => error!("API server failed: {}", e),
            Err(e) => error!("API server task failed: {}", e),
            Ok(Ok(())) => {}
        }
    }
    #[cfg(unix)]
    let _ = reload.await;

    dispatcher.shutdown().await;
    let _ = watcher.await;
    pool.close().await;
    info!("HL7 server stopped");
    Ok(())
}

/// 收到 SIGHUP 时重新加载连接器配置
#[cfg(unix)]
fn spawn_reload(
    path: Option<String>,
    registry: Arc<ConnectorRegistry>,
    dispatcher: Arc<MessageDispatcher>,
    application: Arc<dyn ReceivingApplication>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<tokio::task::JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                }
            }
            info!("Reloading connector configuration");
            let config = match ServerConfig::load(path.as_deref()).and_then(|c| c.validate().map(|_| c)) {
                Ok(config) => config,
                Err(e) => {
                    warn!("Keeping current connectors: {:#}", e);
                    continue;
                }
            };
            reload_connectors(&registry, &dispatcher, &application, config.connectors).await;
        }
    }))
}

/// 将新的连接器配置应用到注册表，并为新增的接收方启动监听
#[cfg(unix)]
async fn reload_connectors(
    registry: &ConnectorRegistry,
    dispatcher: &MessageDispatcher,
    application: &Arc<dyn ReceivingApplication>,
    connectors: Vec<Connector>,
) {
    for existing in registry.get_connectors().await {
        if !connectors.iter().any(|c| c.reference == existing.reference) {
            registry.remove(&existing.reference).await;
        }
    }

    for connector in connectors {
        let current = registry.get_connector(&connector.reference).await;
        if current.as_ref() != Some(&connector) {
            registry.replace(connector.clone()).await;
        }
        if connector.is_receiver() && dispatcher.listening_address(&connector.reference).await.is_none() {
            match dispatcher.listen(&connector, application.clone()).await {
                Ok(address) => info!(connector = %connector.reference, "Receiver listening on {}", address),
                Err(e) => error!(connector = %connector.reference, "Failed to listen: {}", e),
            }
        }
    }

    // 新增的发送方立即投递遗留消息
    if let Err(e) = dispatcher.start().await {
        warn!("Failed to start senders: {}", e);
    }
}
