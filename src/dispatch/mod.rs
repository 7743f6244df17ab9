//! 动作层：动作模型、输入接口、应用启动、Shell 执行与分发器

pub mod action;
pub mod dispatcher;
pub mod input;
pub mod launcher;
pub mod shell;

pub use action::{Action, ActionResult, HandleState, ScrollDirection};
pub use dispatcher::{ActionDispatcher, DispatcherConfig};
pub use input::{InputProvider, MouseButton, StructuralActuator, UnavailableInput};
pub use launcher::{AppLauncher, ProcessLauncher};
