//! Agent 编排器：主控循环
//!
//! 建立命令 / 状态 / 事件三通道，在后台任务中消费命令（Submit / Cancel / Quit）。
//! 每个 Goal 是一次独立运行：SessionSupervisor 发放运行 token，新 Goal 会取消仍在进行的旧运行。

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channel::PerceiveRequest;
use crate::config::AppConfig;
use crate::core::{AgentStatus, SessionSupervisor};
use crate::host::ExecutionHost;
use crate::sprint::{
    EventBus, Goal, ReasoningService, RunReport, SprintEvent, SprintLimits, SprintMachine,
};

/// 发往编排器的命令
#[derive(Debug)]
pub enum Command {
    /// 开始新 Goal；reply 在运行结束时收到报告
    Submit {
        goal: Goal,
        reply: Option<oneshot::Sender<RunReport>>,
    },
    /// 中止当前运行
    Cancel,
    Quit,
}

/// 调用方持有的句柄
#[derive(Clone)]
pub struct AgentHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<AgentStatus>,
    events: EventBus,
}

impl AgentHandle {
    /// 提交 Goal；编排器已退出时返回的接收端会立即关闭
    pub fn submit(&self, goal: Goal) -> oneshot::Receiver<RunReport> {
        let (tx, rx) = oneshot::channel();
        let _ = self.commands.send(Command::Submit {
            goal,
            reply: Some(tx),
        });
        rx
    }

    pub fn cancel(&self) {
        let _ = self.commands.send(Command::Cancel);
    }

    pub fn quit(&self) {
        let _ = self.commands.send(Command::Quit);
    }

    pub fn status(&self) -> watch::Receiver<AgentStatus> {
        self.status.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SprintEvent> {
        self.events.subscribe()
    }
}

/// 创建 Agent 运行时；shutdown 取消时所有运行一并取消，后台任务退出
pub fn create_agent(
    host: Arc<dyn ExecutionHost>,
    reasoner: Arc<dyn ReasoningService>,
    config: &AppConfig,
    shutdown: CancellationToken,
) -> (AgentHandle, JoinHandle<()>) {
    let limits = SprintLimits::from(&config.sprint);
    let perceive_request = PerceiveRequest {
        include_image: config.perception.include_image,
        force_ocr: false,
    };
    let events = EventBus::new(config.telemetry.bus_capacity);

    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<Command>();
    let (status_tx, status_rx) = watch::channel(AgentStatus::default());
    let status_tx = Arc::new(status_tx);
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<u64>();

    let handle = AgentHandle {
        commands: cmd_tx,
        status: status_rx,
        events: events.clone(),
    };

    let supervisor = SessionSupervisor::with_root(shutdown.clone());
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(run_id) = done_rx.recv() => supervisor.finish_run(run_id),
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Submit { goal, reply }) => {
                        let ticket = supervisor.begin_run();
                        tracing::info!(run_id = ticket.run_id, goal = %goal.objective, "run submitted");
                        let machine = SprintMachine::new(goal, host.clone(), reasoner.clone())
                            .with_limits(limits)
                            .with_events(events.clone())
                            .with_status(status_tx.clone())
                            .with_perceive_request(perceive_request.clone());
                        let done = done_tx.clone();
                        tokio::spawn(async move {
                            let report = machine.run(ticket.token).await;
                            let _ = done.send(ticket.run_id);
                            if let Some(reply) = reply {
                                let _ = reply.send(report);
                            }
                        });
                    }
                    Some(Command::Cancel) => {
                        supervisor.cancel_current();
                        status_tx.send_modify(|s| {
                            s.busy = false;
                            s.error_message = Some("cancelled".to_string());
                        });
                    }
                    Some(Command::Quit) | None => break,
                }
            }
        }
        supervisor.cancel_all();
        tracing::info!("orchestrator stopped");
    });

    (handle, task)
}
