//! 核心编排层：错误与恢复、状态投影、会话监管、关闭管理、主控循环

pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod session_supervisor;
pub mod shutdown;
pub mod state;

pub use error::{AgentError, ErrorKind, RecoveryAction};
pub use orchestrator::{create_agent, AgentHandle, Command};
pub use recovery::RecoveryEngine;
pub use session_supervisor::{RunTicket, SessionSupervisor};
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use state::{AgentStatus, SprintPhase};
