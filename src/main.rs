use anyhow::Result;
use colored::*;
use std::time::Duration;
use tokio_stream::{wrappers::IntervalStream, StreamExt};
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod error;
mod handlers;
mod models;
mod services;
mod utils;

use config::Config;
use handlers::{router, AppState};

const SESSION_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    init_logging()?;

    // 加载配置
    dotenv::dotenv().ok();
    let config = Config::load()?;

    println!("{}", "LMArena Free API Server (Rust Version)".bright_green().bold());
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Environment: {}", config.environment);
    println!("Config file: {}", config.config_file);
    println!("Server binding to: {}:{}", config.server.host, config.server.port);
    match &config.arena.browser_sidecar_url {
        Some(url) => println!("Browser sidecar: {}", url),
        None => println!("{}", "Browser sidecar: disabled (direct tier only)".yellow()),
    }

    let state = AppState::new(config.clone())?;
    if state.client.catalog().is_empty() {
        warn!("No models configured, every chat request will be rejected");
    }

    // 定期清理过期会话
    let client = state.client.clone();
    tokio::spawn(async move {
        let mut ticks = IntervalStream::new(tokio::time::interval(SESSION_CLEANUP_INTERVAL));
        while ticks.next().await.is_some() {
            client.sessions().cleanup_expired_sessions();
        }
    });

    // 创建路由
    let app = router(state);

    // 启动服务器
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    println!("{}", format!("Server started on http://{}", addr).bright_green().bold());

    axum::serve(listener, app).await?;

    Ok(())
}

fn init_logging() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lmarena_free_api=debug,tower_http=debug".into())
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
