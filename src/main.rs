//! deskpilot 认知进程
//!
//! 入口：加载配置、初始化日志、连接执行端（或进程内模拟桌面）、创建编排器并运行一个 Goal。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use deskpilot::channel::ChannelClient;
use deskpilot::config::{load_config, render_config};
use deskpilot::core::{create_agent, ShutdownManager, ShutdownReason};
use deskpilot::host::{ExecutionHost, HostProviders, HostService, LocalHost, MockDesktop};
use deskpilot::llm::create_client;
use deskpilot::observability;
use deskpilot::sprint::{EventTopic, Goal, LlmReasoner, RunOutcome, SprintEvent};
use tokio::sync::broadcast;

#[derive(Parser, Debug)]
#[command(name = "deskpilot", version, about = "Desktop operating agent (cognition process)")]
struct Cli {
    /// 要完成的目标
    goal: Option<String>,

    /// 额外的配置文件
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 目标的约束条件（可重复）
    #[arg(long = "constraint")]
    constraints: Vec<String>,

    /// 打印生效配置后退出
    #[arg(long)]
    print_config: bool,

    /// 不连接执行端，在进程内运行模拟计算器桌面
    #[arg(long)]
    local_mock: bool,

    /// 以 JSON 输出运行报告
    #[arg(long)]
    json: bool,
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
    let objective = cli
        .goal
        .clone()
        .context("A goal is required, e.g. deskpilot \"open calculator and compute 2+2\"")?;
    let goal = cli
        .constraints
        .iter()
        .fold(Goal::new(objective), |g, c| g.with_constraint(c.clone()));

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let (host, client): (Arc<dyn ExecutionHost>, Option<Arc<ChannelClient>>) = if cli.local_mock {
        tracing::info!("using in-process mock desktop");
        let desk = Arc::new(MockDesktop::calculator_demo());
        let service = HostService::new(HostProviders::mock(desk), &cfg);
        let host: Arc<dyn ExecutionHost> = Arc::new(LocalHost::new(Arc::new(service)));
        (host, None)
    } else {
        let client = Arc::new(
            ChannelClient::connect(&cfg.ipc)
                .await
                .with_context(|| format!("Failed to connect to host at {}", cfg.ipc.addr()))?,
        );
        spawn_telemetry_log(client.subscribe_telemetry());
        let host: Arc<dyn ExecutionHost> = client.clone();
        (host, Some(client))
    };

    let llm = create_client(&cfg.llm);
    let reasoner = Arc::new(LlmReasoner::new(llm.clone()));
    let (agent, task) = create_agent(host, reasoner, &cfg, shutdown.token());

    let printer = print_events(agent.subscribe());
    let (report, ()) = futures_util::future::join(agent.submit(goal), printer).await;
    let report = report.context("Run ended without a report")?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("outcome: {:?}", report.outcome);
        println!("sprints: {}", report.sprints);
        for note in report.notes.entries() {
            println!("  [sprint {}] {}", note.sprint, note.text);
        }
    }

    let usage = llm.usage();
    tracing::info!(
        prompt = usage.prompt,
        completion = usage.completion,
        total = usage.total(),
        "token usage"
    );

    if let RunOutcome::Fault { message } = &report.outcome {
        shutdown.trigger(ShutdownReason::Fault(message.clone()));
    }
    agent.quit();
    let _ = task.await;
    if let Some(client) = client {
        client.close("run finished").await;
    }

    match report.outcome {
        RunOutcome::Done => Ok(()),
        other => anyhow::bail!("goal not reached: {:?}", other),
    }
}

/// 把过程事件写到日志，直到 Finished
async fn print_events(mut rx: broadcast::Receiver<SprintEvent>) {
    loop {
        match rx.recv().await {
            Ok(SprintEvent::Finished { .. }) => break,
            Ok(SprintEvent::Screen { elements, active_window, .. }) => {
                tracing::debug!(elements, window = ?active_window, "screen");
            }
            Ok(event) => {
                let topic = event.topic();
                let body = serde_json::to_string(&event).unwrap_or_default();
                match topic {
                    EventTopic::Thought => tracing::info!(topic = "thought", "{}", body),
                    _ => tracing::debug!(topic = ?topic, "{}", body),
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "event printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn spawn_telemetry_log(mut rx: broadcast::Receiver<deskpilot::channel::TelemetryEvent>) {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(ev) => tracing::trace!(
                    pointer = ?ev.pointer,
                    window = ?ev.active_window.map(|w| w.title),
                    "telemetry"
                ),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
