//! 诊所管理服务器主程序

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use clinic_admin::{init_logging, ConfigManager};
use clinic_database::{DatabasePool, MemoryStore, PostgresStore, SharedStore};
use clinic_web::{create_app, AppState, WebOptions, WebServer};
use clinic_workflow::ClinicWorkflow;
use tracing::{info, warn};

/// 命令行参数
#[derive(Parser, Debug)]
#[command(name = "clinic-server")]
#[command(about = "Servidor de gestión de clínicas dentales")]
struct Args {
    /// 配置文件路径
    #[arg(short, long)]
    config: Option<String>,

    /// 覆盖监听端口
    #[arg(short, long)]
    port: Option<u16>,

    /// 覆盖日志级别
    #[arg(short, long)]
    log_level: Option<String>,

    /// 使用内存存储（不连接数据库）
    #[arg(long)]
    in_memory: bool,

    /// 输出生效配置后退出
    #[arg(long)]
    print_config: bool,
}

async fn open_store(manager: &ConfigManager, in_memory: bool) -> Result<SharedStore> {
    if in_memory {
        warn!("Using in-memory store; data will be lost on shutdown");
        return Ok(Arc::new(MemoryStore::new()));
    }

    let database = &manager.config().database;
    let pool = DatabasePool::connect(&database.pool_options())
        .await
        .context("Failed to connect to database")?;
    let store: SharedStore = Arc::new(PostgresStore::new(pool));
    if database.run_migrations {
        store.migrate().await.context("Failed to run migrations")?;
    }
    Ok(store)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut manager = ConfigManager::load(args.config.as_deref())?;
    manager.apply_overrides(args.port, args.log_level.as_deref())?;

    if args.print_config {
        println!("{}", manager.to_toml()?);
        return Ok(());
    }

    let config = manager.config().clone();
    init_logging(&config.logging)?;
    info!(
        source = manager.source_path().unwrap_or("defaults"),
        "Starting clinic server"
    );

    let store = open_store(&manager, args.in_memory).await?;
    let state = AppState::new(
        store,
        ClinicWorkflow::new(config.workflow.clone()),
        config.pagination.page_settings(),
    );
    let options = WebOptions {
        enable_cors: config.web.enable_cors,
        cors_allowed_origins: config.web.cors_allowed_origins.clone(),
        request_timeout: config.server.request_timeout(),
    };

    let addr: SocketAddr = config
        .server
        .bind_address()
        .parse()
        .with_context(|| format!("Invalid bind address: {}", config.server.bind_address()))?;
    WebServer::new(addr, create_app(state, &options)).run().await
}
