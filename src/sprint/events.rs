//! 冲刺过程事件：发布到 broadcast 总线，供 CLI / 仪表盘订阅
//!
//! 每个事件归属一个主题：thought（计划、笔记、结论）、log（阶段与动作）、screen（快照缩略图）。

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::core::SprintPhase;
use crate::dispatch::ActionResult;
use crate::perception::PerceptionSnapshot;

use super::machine::RunOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventTopic {
    Thought,
    Log,
    Screen,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SprintEvent {
    PhaseChanged {
        phase: SprintPhase,
        sprint: u32,
    },
    /// 新计划被接受
    PlanAccepted {
        plan_id: Uuid,
        sprint: u32,
        milestone: String,
        thought: String,
        success_condition: String,
        actions: Vec<String>,
    },
    NoteAppended {
        sprint: u32,
        text: String,
    },
    ActionStarted {
        plan_id: Uuid,
        index: usize,
        action: String,
    },
    ActionFinished {
        plan_id: Uuid,
        index: usize,
        attempt: u32,
        result: ActionResult,
    },
    /// 新快照（image 为裁剪区域的 JPEG base64，可能为空）
    Screen {
        snapshot_id: Uuid,
        active_window: Option<String>,
        elements: usize,
        image: Option<String>,
    },
    Verdict {
        sprint: u32,
        satisfied: bool,
        rationale: String,
    },
    Finished {
        outcome: RunOutcome,
    },
}

impl SprintEvent {
    pub fn topic(&self) -> EventTopic {
        match self {
            SprintEvent::PlanAccepted { .. }
            | SprintEvent::NoteAppended { .. }
            | SprintEvent::Verdict { .. } => EventTopic::Thought,
            SprintEvent::Screen { .. } => EventTopic::Screen,
            SprintEvent::PhaseChanged { .. }
            | SprintEvent::ActionStarted { .. }
            | SprintEvent::ActionFinished { .. }
            | SprintEvent::Finished { .. } => EventTopic::Log,
        }
    }

    pub fn screen(snapshot: &PerceptionSnapshot) -> Self {
        SprintEvent::Screen {
            snapshot_id: snapshot.id,
            active_window: snapshot.active_window.as_ref().map(|w| w.title.clone()),
            elements: snapshot.elements.len(),
            image: snapshot.image.clone(),
        }
    }
}

/// 事件总线；没有订阅者时直接丢弃
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SprintEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: SprintEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SprintEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topics_and_shape() {
        let ev = SprintEvent::NoteAppended {
            sprint: 2,
            text: "x".into(),
        };
        assert_eq!(ev.topic(), EventTopic::Thought);
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "note_appended");
        let ev = SprintEvent::PhaseChanged {
            phase: SprintPhase::Verifying,
            sprint: 1,
        };
        assert_eq!(ev.topic(), EventTopic::Log);
    }

    #[tokio::test]
    async fn test_bus_delivers_to_subscribers() {
        let bus = EventBus::new(8);
        bus.publish(SprintEvent::NoteAppended { sprint: 1, text: "dropped".into() });
        let mut rx = bus.subscribe();
        bus.publish(SprintEvent::NoteAppended { sprint: 1, text: "seen".into() });
        match rx.recv().await.unwrap() {
            SprintEvent::NoteAppended { text, .. } => assert_eq!(text, "seen"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
