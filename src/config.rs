//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `DESKPILOT__*` 覆盖（双下划线表示嵌套，如 `DESKPILOT__IPC__PORT=6001`），
//! 最后兼容旧式的 `IPC_HOST` / `IPC_PORT` / `IPC_AUTHKEY`。

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub ipc: IpcSection,
    pub perception: PerceptionSection,
    pub dispatch: DispatchSection,
    pub sprint: SprintSection,
    pub llm: LlmSection,
    pub telemetry: TelemetrySection,
}

/// [app] 段：名称与日志级别
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppSection {
    #[serde(default = "default_app_name")]
    pub name: String,
    /// 未设置 RUST_LOG 时使用的默认级别
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
        }
    }
}

fn default_app_name() -> String {
    "deskpilot".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// [ipc] 段：认知进程与执行进程之间的通道
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IpcSection {
    #[serde(default = "default_ipc_host")]
    pub host: String,
    #[serde(default = "default_ipc_port")]
    pub port: u16,
    /// 握手共享密钥
    #[serde(default = "default_ipc_authkey")]
    pub authkey: String,
    /// 单个请求的截止时间（毫秒）
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for IpcSection {
    fn default() -> Self {
        Self {
            host: default_ipc_host(),
            port: default_ipc_port(),
            authkey: default_ipc_authkey(),
            request_timeout_ms: default_request_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl IpcSection {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_ipc_host() -> String {
    "localhost".to_string()
}

fn default_ipc_port() -> u16 {
    6000
}

fn default_ipc_authkey() -> String {
    "changeme".to_string()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

/// 重复元素处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupPolicy {
    /// 与结构化元素重叠的 OCR 元素被丢弃
    PreferStructural,
    /// 两者都保留，由下游自行区分
    KeepAll,
}

/// [perception] 段：OCR 回退阈值、视口边距、放大倍数、去重
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PerceptionSection {
    /// 结构化树中「有意义」节点少于此数时启用 OCR
    #[serde(default = "default_min_meaningful")]
    pub min_meaningful_elements: usize,
    /// 窗口标题包含这些词时视为不配合的应用（虚拟机等），强制 OCR
    #[serde(default = "default_non_cooperative_keywords")]
    pub non_cooperative_keywords: Vec<String>,
    /// 活动窗口外扩边距（像素）
    #[serde(default = "default_viewport_margin")]
    pub viewport_margin: i32,
    /// 裁剪后放大倍数，1.0 表示不放大
    #[serde(default = "default_upscale")]
    pub upscale: f32,
    #[serde(default = "default_dedup")]
    pub dedup: DedupPolicy,
    #[serde(default = "default_dedup_iou")]
    pub dedup_iou_threshold: f32,
    /// 给模型的截图最大宽度
    #[serde(default = "default_max_image_width")]
    pub max_image_width: u32,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    /// 快照是否附带截图
    #[serde(default = "default_true")]
    pub include_image: bool,
    /// 截图上叠加元素框与 id 标签
    #[serde(default = "default_true")]
    pub annotate_image: bool,
}

impl Default for PerceptionSection {
    fn default() -> Self {
        Self {
            min_meaningful_elements: default_min_meaningful(),
            non_cooperative_keywords: default_non_cooperative_keywords(),
            viewport_margin: default_viewport_margin(),
            upscale: default_upscale(),
            dedup: default_dedup(),
            dedup_iou_threshold: default_dedup_iou(),
            max_image_width: default_max_image_width(),
            jpeg_quality: default_jpeg_quality(),
            include_image: true,
            annotate_image: true,
        }
    }
}

fn default_min_meaningful() -> usize {
    5
}

fn default_non_cooperative_keywords() -> Vec<String> {
    vec!["oracle".into(), "virtualbox".into(), "vm".into()]
}

fn default_viewport_margin() -> i32 {
    16
}

fn default_upscale() -> f32 {
    1.0
}

fn default_dedup() -> DedupPolicy {
    DedupPolicy::PreferStructural
}

fn default_dedup_iou() -> f32 {
    0.5
}

fn default_max_image_width() -> u32 {
    1920
}

fn default_jpeg_quality() -> u8 {
    70
}

fn default_true() -> bool {
    true
}

/// [dispatch] 段：启动等待、Shell 超时
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatchSection {
    #[serde(default = "default_shell_timeout_secs")]
    pub shell_timeout_secs: u64,
    /// launch 后等待新窗口出现的最长时间
    #[serde(default = "default_launch_wait_secs")]
    pub launch_wait_secs: u64,
    #[serde(default = "default_launch_poll_ms")]
    pub launch_poll_ms: u64,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            shell_timeout_secs: default_shell_timeout_secs(),
            launch_wait_secs: default_launch_wait_secs(),
            launch_poll_ms: default_launch_poll_ms(),
        }
    }
}

fn default_shell_timeout_secs() -> u64 {
    15
}

fn default_launch_wait_secs() -> u64 {
    20
}

fn default_launch_poll_ms() -> u64 {
    500
}

/// [sprint] 段：无进展上限与冲刺总数上限
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SprintSection {
    /// 连续多少次未通过验证后进入 Aborted
    #[serde(default = "default_max_no_progress")]
    pub max_no_progress: u32,
    /// 单次运行的冲刺总数上限
    #[serde(default = "default_max_sprints")]
    pub max_sprints: u32,
}

impl Default for SprintSection {
    fn default() -> Self {
        Self {
            max_no_progress: default_max_no_progress(),
            max_sprints: default_max_sprints(),
        }
    }
}

fn default_max_no_progress() -> u32 {
    3
}

fn default_max_sprints() -> u32 {
    15
}

/// [llm] 段：后端选择、超时与重试
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmSection {
    /// 后端：openai / mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
    #[serde(default)]
    pub retry: LlmRetrySection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            timeouts: LlmTimeoutsSection::default(),
            retry: LlmRetrySection::default(),
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmTimeoutsSection {
    #[serde(default = "default_llm_request_timeout")]
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_llm_request_timeout(),
        }
    }
}

fn default_llm_request_timeout() -> u64 {
    60
}

/// [llm.retry] 段：指数退避
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmRetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for LlmRetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    8_000
}

/// [telemetry] 段：执行进程的遥测轮询频率
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetrySection {
    #[serde(default = "default_telemetry_interval_ms")]
    pub interval_ms: u64,
    /// 事件总线容量
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            interval_ms: default_telemetry_interval_ms(),
            bus_capacity: default_bus_capacity(),
        }
    }
}

fn default_telemetry_interval_ms() -> u64 {
    250
}

fn default_bus_capacity() -> usize {
    256
}

/// 从 config 目录加载配置，环境变量 DESKPILOT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 叠加环境变量 DESKPILOT__*（双下划线表示嵌套键）
/// 4. 最后应用 IPC_HOST / IPC_PORT / IPC_AUTHKEY
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("DESKPILOT")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    let mut cfg: AppConfig = c.try_deserialize()?;
    apply_ipc_env(&mut cfg.ipc, |k| std::env::var(k).ok())?;
    Ok(cfg)
}

/// 兼容旧式环境变量；lookup 抽出来便于测试
fn apply_ipc_env(
    ipc: &mut IpcSection,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), config::ConfigError> {
    if let Some(host) = lookup("IPC_HOST") {
        ipc.host = host;
    }
    if let Some(port) = lookup("IPC_PORT") {
        ipc.port = port
            .parse()
            .map_err(|e| config::ConfigError::Message(format!("IPC_PORT '{}': {}", port, e)))?;
    }
    if let Some(key) = lookup("IPC_AUTHKEY") {
        ipc.authkey = key;
    }
    Ok(())
}

/// 渲染当前生效配置（--print-config）
pub fn render_config(cfg: &AppConfig) -> Result<String, toml::ser::Error> {
    toml::to_string_pretty(cfg)
}
