//! 冲刺状态机场景测试：模拟桌面 + 脚本化推理

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use deskpilot::channel::PerceiveRequest;
    use deskpilot::config::AppConfig;
    use deskpilot::core::{create_agent, AgentError, ErrorKind, SprintPhase};
    use deskpilot::dispatch::{Action, ActionResult, HandleState};
    use deskpilot::host::{
        ExecutionHost, HostProviders, HostService, InputEvent, LocalHost, MockDesktop,
    };
    use deskpilot::llm::ScriptedLlmClient;
    use deskpilot::perception::{PerceptionSnapshot, Rect, StructuralNode};
    use deskpilot::sprint::{
        Goal, LlmReasoner, RunOutcome, SprintEvent, SprintLimits, SprintMachine,
    };
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    const HOTKEY_PLAN: &str = r#"{"milestone":"save","actions":[{"action":"hotkey","keys":["ctrl","s"]}],"success_condition":"file saved"}"#;
    const NOT_MET: &str = r#"{"satisfied":false,"rationale":"no save dialog"}"#;
    const MET: &str = r#"{"satisfied":true,"rationale":"saved"}"#;

    fn config() -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.perception.include_image = false;
        cfg
    }

    fn local_host(desk: Arc<MockDesktop>) -> Arc<LocalHost> {
        let service = HostService::new(HostProviders::mock(desk), &config());
        Arc::new(LocalHost::new(Arc::new(service)))
    }

    fn limits(max_no_progress: u32) -> SprintLimits {
        SprintLimits {
            max_no_progress,
            max_sprints: 20,
        }
    }

    /// 带一个 OK 按钮的窗口
    fn dialog_desk() -> Arc<MockDesktop> {
        let desk = Arc::new(MockDesktop::new());
        let rect = Rect::new(200, 200, 400, 300);
        let h = desk.add_window("Confirm", rect);
        desk.set_tree(
            h,
            StructuralNode::new("Confirm", "Window", rect).with_children(vec![
                StructuralNode::new("OK", "Button", Rect::new(300, 420, 80, 30))
                    .with_automation_id("ok"),
            ]),
        );
        desk
    }

    /// 计数并可注入失败的执行端包装
    struct FlakyHost {
        inner: Arc<LocalHost>,
        perceives: AtomicUsize,
        /// 前 N 次感知请求超时
        perceive_timeouts: AtomicUsize,
        executed_on: Mutex<Vec<Uuid>>,
        fail_first: Mutex<Option<ErrorKind>>,
        always_timeout: bool,
    }

    impl FlakyHost {
        fn new(inner: Arc<LocalHost>) -> Self {
            Self {
                inner,
                perceives: AtomicUsize::new(0),
                perceive_timeouts: AtomicUsize::new(0),
                executed_on: Mutex::new(Vec::new()),
                fail_first: Mutex::new(None),
                always_timeout: false,
            }
        }
    }

    #[async_trait]
    impl ExecutionHost for FlakyHost {
        async fn perceive(
            &self,
            request: PerceiveRequest,
        ) -> Result<PerceptionSnapshot, AgentError> {
            let n = self.perceives.fetch_add(1, Ordering::SeqCst) + 1;
            if self
                .perceive_timeouts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok()
            {
                return Err(AgentError::Timeout(format!("perceive request {} timed out", n)));
            }
            self.inner.perceive(request).await
        }

        async fn execute(
            &self,
            action: &Action,
            snapshot: &PerceptionSnapshot,
        ) -> Result<ActionResult, AgentError> {
            self.executed_on.lock().unwrap().push(snapshot.id);
            if self.always_timeout {
                return Ok(ActionResult::channel_failure(
                    ErrorKind::Timeout,
                    "execute request timed out",
                ));
            }
            if let Some(kind) = self.fail_first.lock().unwrap().take() {
                return Ok(ActionResult::failed(
                    kind,
                    "injected failure",
                    HandleState::default(),
                ));
            }
            self.inner.execute(action, snapshot).await
        }
    }

    #[tokio::test]
    async fn test_calculator_two_plus_two() {
        let desk = Arc::new(MockDesktop::calculator_demo());
        let host = local_host(desk.clone());
        let llm = Arc::new(ScriptedLlmClient::new([
            r#"```json
{
  "thought": "open the calculator and press the keys",
  "milestone": "compute 2+2",
  "actions": [
    {"action": "launch", "app": "Calculator"},
    {"action": "click", "target": "2"},
    {"action": "click", "target": "+"},
    {"action": "click", "target": "2"},
    {"action": "click", "target": "="},
  ],
  "success_condition": "display shows 4",
  "final_milestone": true
}
```"#,
            r#"{"satisfied": true, "rationale": "the display reads 4"}"#,
        ]));
        let reasoner = Arc::new(LlmReasoner::new(llm.clone()));
        let (agent, task) = create_agent(host, reasoner, &config(), CancellationToken::new());

        let report = agent
            .submit(Goal::new("Open calculator and compute 2+2"))
            .await
            .unwrap();
        assert_eq!(report.outcome, RunOutcome::Done);
        assert_eq!(report.sprints, 1);
        assert_eq!(report.history.len(), 1);
        assert_eq!(report.history[0].executed.len(), 5);
        assert!(report.history[0].executed.iter().all(|e| e.result.success));

        // 验证时显示屏的 "4" 只能由 OCR 读到
        let calls = llm.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[1][1].content.contains("display shows 4"));
        assert!(calls[1][1].content.contains(":4<Text>"));

        let invoked: Vec<String> = desk
            .events()
            .into_iter()
            .filter_map(|e| match e {
                InputEvent::Invoke(h) => Some(h.name),
                _ => None,
            })
            .collect();
        assert_eq!(invoked, vec!["2", "+", "2", "="]);

        let status = agent.status().borrow().clone();
        assert_eq!(status.phase, SprintPhase::Done);
        assert!(!status.busy);

        agent.quit();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_done_after_n_minus_one_failed_sprints() {
        let llm = Arc::new(ScriptedLlmClient::new([
            HOTKEY_PLAN, NOT_MET, HOTKEY_PLAN, NOT_MET, HOTKEY_PLAN, MET,
        ]));
        let machine = SprintMachine::new(
            Goal::new("save the file"),
            local_host(dialog_desk()),
            Arc::new(LlmReasoner::new(llm)),
        )
        .with_limits(limits(3));

        let report = machine.run(CancellationToken::new()).await;
        assert_eq!(report.outcome, RunOutcome::Done);
        assert_eq!(report.sprints, 3);
        assert_eq!(report.notes.len(), 2);
    }

    #[tokio::test]
    async fn test_aborted_after_n_failed_sprints() {
        let llm = Arc::new(ScriptedLlmClient::new([
            HOTKEY_PLAN, NOT_MET, HOTKEY_PLAN, NOT_MET, HOTKEY_PLAN, NOT_MET, HOTKEY_PLAN, MET,
        ]));
        let machine = SprintMachine::new(
            Goal::new("save the file"),
            local_host(dialog_desk()),
            Arc::new(LlmReasoner::new(llm.clone())),
        )
        .with_limits(limits(3));

        let report = machine.run(CancellationToken::new()).await;
        match &report.outcome {
            RunOutcome::Aborted { reason } => assert!(reason.contains("3")),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(report.sprints, 3);
        assert_eq!(llm.remaining(), 2);
        let texts: Vec<&str> = report.notes.entries().iter().map(|n| n.text.as_str()).collect();
        assert!(texts.iter().all(|t| t.contains("not met")));
    }

    #[tokio::test]
    async fn test_empty_plan_counts_as_no_progress() {
        let empty = r#"{"thought":"nothing to do","actions":[],"success_condition":"x"}"#;
        let llm = Arc::new(ScriptedLlmClient::new([empty, empty, empty]));
        let mut machine = SprintMachine::new(
            Goal::new("do something"),
            local_host(dialog_desk()),
            Arc::new(LlmReasoner::new(llm.clone())),
        )
        .with_limits(limits(3));
        let cancel = CancellationToken::new();

        machine.step(&cancel).await.unwrap();
        assert_eq!(machine.phase(), SprintPhase::Planning);
        machine.step(&cancel).await.unwrap();
        assert_eq!(machine.no_progress(), 1);
        assert_eq!(machine.phase(), SprintPhase::Planning);
        assert!(machine.current_plan().is_none());
        assert!(machine.notes().entries()[0]
            .text
            .starts_with("planner produced no actionable plan"));

        let report = machine.run(cancel).await;
        assert!(matches!(report.outcome, RunOutcome::Aborted { .. }));
        assert!(report.history.is_empty());
        // 没有进入过验证
        assert_eq!(llm.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_element_not_found_reperceives_once() {
        let desk = dialog_desk();
        let host = Arc::new(FlakyHost::new(local_host(desk.clone())));
        *host.fail_first.lock().unwrap() = Some(ErrorKind::ElementNotFound);
        let llm = Arc::new(ScriptedLlmClient::new([
            r#"{"actions":[{"action":"click","target":"OK"}],"success_condition":"dialog closed"}"#,
            MET,
        ]));
        let machine = SprintMachine::new(
            Goal::new("confirm"),
            host.clone(),
            Arc::new(LlmReasoner::new(llm)),
        );

        let report = machine.run(CancellationToken::new()).await;
        assert_eq!(report.outcome, RunOutcome::Done);

        let used = host.executed_on.lock().unwrap().clone();
        assert_eq!(used.len(), 2);
        assert_ne!(used[0], used[1], "retry must act on a fresh snapshot");
        // 规划 + 重新感知 + 验证
        assert_eq!(host.perceives.load(Ordering::SeqCst), 3);
        let executed = &report.history[0].executed;
        assert_eq!(executed.last().map(|e| e.attempts), Some(2));
        assert!(desk
            .events()
            .iter()
            .any(|e| matches!(e, InputEvent::Invoke(h) if h.name == "OK")));
    }

    #[tokio::test]
    async fn test_double_timeout_abandons_sprint_with_one_note() {
        let mut flaky = FlakyHost::new(local_host(dialog_desk()));
        flaky.always_timeout = true;
        let host = Arc::new(flaky);
        let llm = Arc::new(ScriptedLlmClient::new([
            r#"{"milestone":"confirm","actions":[{"action":"click","target":"OK"},{"action":"hotkey","keys":["enter"]}],"success_condition":"dialog closed"}"#,
            r#"{"satisfied":false,"rationale":"dialog still open"}"#,
        ]));
        let mut machine = SprintMachine::new(
            Goal::new("confirm"),
            host.clone(),
            Arc::new(LlmReasoner::new(llm)),
        );
        let cancel = CancellationToken::new();

        machine.step(&cancel).await.unwrap();
        machine.step(&cancel).await.unwrap();
        assert_eq!(machine.phase(), SprintPhase::Executing);
        machine.step(&cancel).await.unwrap();
        assert_eq!(machine.phase(), SprintPhase::Verifying);
        // 第一个动作重试一次后放弃，第二个动作不执行
        assert_eq!(host.executed_on.lock().unwrap().len(), 2);
        assert!(machine.notes().is_empty());

        machine.step(&cancel).await.unwrap();
        assert_eq!(machine.phase(), SprintPhase::Planning);
        assert_eq!(machine.notes().len(), 1);
        let note = &machine.notes().entries()[0].text;
        assert!(note.contains("dialog still open"));
        assert!(note.contains("sprint abandoned"));
        assert!(note.contains("Timeout"));
        assert_eq!(machine.no_progress(), 1);
        assert!(machine.history()[0].abandoned.is_some());
    }

    #[tokio::test]
    async fn test_cancel_discards_in_flight_result() {
        let desk = Arc::new(MockDesktop::calculator_demo());
        desk.set_input_delay(Duration::from_millis(400));
        let host = local_host(desk.clone());
        let llm = Arc::new(ScriptedLlmClient::new([
            r#"{"actions":[{"action":"launch","app":"Calculator"},{"action":"click","target":"2"}],"success_condition":"calculator open"}"#,
        ]));
        let (agent, task) = create_agent(
            host,
            Arc::new(LlmReasoner::new(llm)),
            &config(),
            CancellationToken::new(),
        );
        let mut events = agent.subscribe();

        let reply = agent.submit(Goal::new("open calculator"));
        loop {
            if let SprintEvent::ActionStarted { index: 0, .. } = events.recv().await.unwrap() {
                break;
            }
        }
        agent.cancel();

        let report = reply.await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert!(report.history.is_empty());

        // 已下发的动作执行完毕，但结果没有记入
        let mut finished = 0;
        while let Ok(ev) = events.try_recv() {
            if matches!(ev, SprintEvent::ActionFinished { .. }) {
                finished += 1;
            }
        }
        assert_eq!(finished, 0);
        assert!(desk
            .events()
            .iter()
            .any(|e| matches!(e, InputEvent::Launch(c) if c == "calc.exe")));
        assert!(!desk.events().iter().any(|e| matches!(e, InputEvent::Invoke(_))));

        let status = agent.status().borrow().clone();
        assert!(!status.busy);
        assert_eq!(status.error_message.as_deref(), Some("cancelled"));

        agent.quit();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_perceive_timeout_retried_once() {
        let host = Arc::new(FlakyHost::new(local_host(dialog_desk())));
        host.perceive_timeouts.store(1, Ordering::SeqCst);
        let llm = Arc::new(ScriptedLlmClient::new([HOTKEY_PLAN, MET]));
        let mut machine = SprintMachine::new(
            Goal::new("save the file"),
            host.clone(),
            Arc::new(LlmReasoner::new(llm.clone())),
        );
        let cancel = CancellationToken::new();

        machine.step(&cancel).await.unwrap();
        machine.step(&cancel).await.unwrap();
        assert_eq!(machine.phase(), SprintPhase::Executing);
        assert_eq!(host.perceives.load(Ordering::SeqCst), 2);
        assert!(machine.notes().is_empty());
        assert_eq!(machine.no_progress(), 0);
        assert_eq!(llm.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_second_perceive_timeout_gives_up() {
        let host = Arc::new(FlakyHost::new(local_host(dialog_desk())));
        host.perceive_timeouts.store(2, Ordering::SeqCst);
        let llm = Arc::new(ScriptedLlmClient::new([HOTKEY_PLAN, MET]));
        let mut machine = SprintMachine::new(
            Goal::new("save the file"),
            host.clone(),
            Arc::new(LlmReasoner::new(llm.clone())),
        );
        let cancel = CancellationToken::new();

        machine.step(&cancel).await.unwrap();
        machine.step(&cancel).await.unwrap();
        assert_eq!(machine.phase(), SprintPhase::Planning);
        assert_eq!(host.perceives.load(Ordering::SeqCst), 2);
        assert_eq!(machine.no_progress(), 1);
        assert!(machine.notes().entries()[0].text.contains("timed out"));
        assert!(llm.calls().is_empty());
    }

    #[tokio::test]
    async fn test_read_file_contents_become_note() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("todo.txt");
        std::fs::write(&path, "buy milk").unwrap();
        let plan = serde_json::json!({
            "actions": [{"action": "read_file", "path": path.to_string_lossy()}],
            "success_condition": "file read"
        })
        .to_string();
        let llm = Arc::new(ScriptedLlmClient::new([plan.as_str(), MET]));
        let machine = SprintMachine::new(
            Goal::new("read my todo list"),
            local_host(dialog_desk()),
            Arc::new(LlmReasoner::new(llm)),
        );

        let report = machine.run(CancellationToken::new()).await;
        assert_eq!(report.outcome, RunOutcome::Done);
        assert_eq!(report.notes.len(), 1);
        let note = &report.notes.entries()[0].text;
        assert!(note.starts_with("contents of "));
        assert!(note.ends_with("buy milk"));
    }

    #[tokio::test]
    async fn test_new_submit_supersedes_running_goal() {
        let desk = Arc::new(MockDesktop::calculator_demo());
        desk.set_input_delay(Duration::from_millis(300));
        let llm = Arc::new(ScriptedLlmClient::new([
            r#"{"actions":[{"action":"launch","app":"Calculator"},{"action":"click","target":"2"},{"action":"click","target":"+"}],"success_condition":"2+ entered"}"#,
            r#"{"actions":[{"action":"hotkey","keys":["escape"]}],"success_condition":"display cleared"}"#,
            MET,
        ]));
        let (agent, task) = create_agent(
            local_host(desk.clone()),
            Arc::new(LlmReasoner::new(llm)),
            &config(),
            CancellationToken::new(),
        );
        let mut events = agent.subscribe();

        let first = agent.submit(Goal::new("type 2+"));
        let mut first_plan = None;
        loop {
            match events.recv().await.unwrap() {
                SprintEvent::PlanAccepted { plan_id, .. } => first_plan = Some(plan_id),
                SprintEvent::ActionStarted { index: 0, .. } => break,
                _ => {}
            }
        }
        let first_plan = first_plan.unwrap();
        let second = agent.submit(Goal::new("clear the display"));

        assert_eq!(first.await.unwrap().outcome, RunOutcome::Cancelled);
        let report = second.await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Done);
        assert_eq!(report.history[0].executed.len(), 1);

        let mut second_plan = None;
        while let Ok(ev) = events.try_recv() {
            match ev {
                SprintEvent::PlanAccepted { plan_id, .. } => second_plan = Some(plan_id),
                SprintEvent::ActionFinished { plan_id, .. } => {
                    assert_ne!(plan_id, first_plan, "superseded run reported a result")
                }
                SprintEvent::ActionStarted { plan_id, index, .. } if plan_id == first_plan => {
                    panic!("superseded run started action {}", index)
                }
                _ => {}
            }
        }
        assert!(second_plan.is_some_and(|p| p != first_plan));

        // 旧计划只执行了已下发的 launch；之后桌面上只出现新计划的按键
        let log = desk.events();
        assert!(!log.iter().any(|e| matches!(e, InputEvent::Invoke(_))));
        let launch = log
            .iter()
            .position(|e| matches!(e, InputEvent::Launch(_)))
            .unwrap();
        let after: Vec<&InputEvent> = log[launch + 1..]
            .iter()
            .filter(|e| !matches!(e, InputEvent::Focus(_)))
            .collect();
        assert_eq!(after, vec![&InputEvent::Keys(vec!["escape".into()])]);

        agent.quit();
        task.await.unwrap();
    }
}
