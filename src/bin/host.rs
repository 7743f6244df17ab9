//! deskpilot-host 执行进程
//!
//! 监听通道端口，对认知进程提供感知与动作执行，并定时推送遥测。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use deskpilot::channel::HostServer;
use deskpilot::config::{load_config, render_config};
use deskpilot::core::ShutdownManager;
use deskpilot::host::{HostProviders, HostService, MockDesktop};
use deskpilot::observability;
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[command(name = "deskpilot-host", version, about = "Desktop operating agent (execution host)")]
struct Cli {
    /// 额外的配置文件
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 使用模拟计算器桌面代替平台后端
    #[arg(long)]
    mock: bool,

    /// 打印生效配置后退出
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = load_config(cli.config.clone()).context("Failed to load config")?;
    observability::init(&cfg.app.log_level);

    if cli.print_config {
        println!("{}", render_config(&cfg).context("Failed to render config")?);
        return Ok(());
    }

    let providers = if cli.mock {
        tracing::info!("serving mock calculator desktop");
        HostProviders::mock(Arc::new(MockDesktop::calculator_demo()))
    } else {
        tracing::warn!("no platform backend available; perception and input requests will fail");
        HostProviders::unavailable()
    };
    let service = Arc::new(HostService::new(providers, &cfg));

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let addr = cfg.ipc.addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    if cfg.ipc.authkey == "changeme" {
        tracing::warn!("using the default channel secret; set IPC_AUTHKEY");
    }

    let server = HostServer::new(
        service,
        cfg.ipc.authkey.as_bytes().to_vec(),
        Duration::from_millis(cfg.telemetry.interval_ms),
        shutdown.token(),
    );
    server.serve(listener).await.context("Host server failed")?;
    if let Some(reason) = shutdown.reason() {
        tracing::info!(%reason, "host stopped");
    }
    Ok(())
}
