//! 应用启动：别名表 + 已安装应用索引上的模糊匹配，再交给 AppLauncher 拉起进程

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::process::Command;

use crate::perception::PlatformResult;

/// 常用应用别名 -> 启动命令
const ALIASES: &[(&str, &str)] = &[
    ("calc", "calc.exe"),
    ("calculator", "calc.exe"),
    ("rechner", "calc.exe"),
    ("settings", "ms-settings:"),
    ("einstellungen", "ms-settings:"),
    ("notepad", "notepad.exe"),
    ("editor", "notepad.exe"),
    ("explorer", "explorer.exe"),
    ("file explorer", "explorer.exe"),
    ("cmd", "cmd.exe"),
    ("terminal", "wt.exe"),
    ("powershell", "powershell.exe"),
    ("chrome", "chrome.exe"),
    ("firefox", "firefox.exe"),
    ("edge", "msedge.exe"),
    ("browser", "msedge.exe"),
    ("task manager", "taskmgr.exe"),
    ("control panel", "control.exe"),
    ("vscode", "code"),
];

/// 模糊匹配最低得分
const MIN_FUZZY_SCORE: f32 = 0.5;

#[async_trait]
pub trait AppLauncher: Send + Sync {
    /// 已安装应用：小写名称 -> 启动命令
    async fn index(&self) -> PlatformResult<BTreeMap<String, String>>;
    /// 拉起进程，不等待其退出
    async fn spawn(&self, command: &str) -> PlatformResult<()>;
}

/// 通过系统 shell 拉起进程；索引只含别名表
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

#[async_trait]
impl AppLauncher for ProcessLauncher {
    async fn index(&self) -> PlatformResult<BTreeMap<String, String>> {
        Ok(BTreeMap::new())
    }

    async fn spawn(&self, command: &str) -> PlatformResult<()> {
        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", "start", "", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        cmd.stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());
        cmd.spawn()
            .map(|_| ())
            .map_err(|e| format!("spawn '{}': {}", command, e))
    }
}

/// 查询解析结果
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedApp {
    pub name: String,
    pub command: String,
    pub score: f32,
}

/// 解析应用名：精确别名 > 索引精确 > 索引子串 / 模糊得分最高者
pub fn resolve_app(query: &str, index: &BTreeMap<String, String>) -> Option<ResolvedApp> {
    let q = query.trim().to_lowercase();
    if q.is_empty() {
        return None;
    }
    let exact = ALIASES
        .iter()
        .find(|(name, _)| *name == q)
        .map(|(n, c)| (n.to_string(), c.to_string()))
        .or_else(|| index.get(&q).map(|c| (q.clone(), c.clone())));
    if let Some((name, command)) = exact {
        return Some(ResolvedApp {
            name,
            command,
            score: 1.0,
        });
    }

    let candidates = ALIASES
        .iter()
        .map(|(n, c)| (n.to_string(), c.to_string()))
        .chain(index.iter().map(|(n, c)| (n.clone(), c.clone())));
    candidates
        .map(|(name, command)| {
            let score = if name.contains(&q) || q.contains(&name) {
                0.9
            } else {
                similarity(&q, &name)
            };
            ResolvedApp {
                name,
                command,
                score,
            }
        })
        .filter(|r| r.score >= MIN_FUZZY_SCORE)
        .max_by(|a, b| {
            a.score
                .partial_cmp(&b.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.name.len().cmp(&a.name.len()))
        })
}

/// 最接近的几个名称，用于失败时的提示
pub fn suggestions(query: &str, index: &BTreeMap<String, String>, n: usize) -> Vec<String> {
    let q = query.trim().to_lowercase();
    let mut scored: Vec<(f32, String)> = ALIASES
        .iter()
        .map(|(name, _)| name.to_string())
        .chain(index.keys().cloned())
        .map(|name| (similarity(&q, &name), name))
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored.dedup_by(|a, b| a.1 == b.1);
    scored.into_iter().take(n).map(|(_, name)| name).collect()
}

/// 字符二元组 Dice 系数，范围 [0, 1]
pub fn similarity(a: &str, b: &str) -> f32 {
    fn bigrams(s: &str) -> Vec<(char, char)> {
        let chars: Vec<char> = s.chars().collect();
        chars.windows(2).map(|w| (w[0], w[1])).collect()
    }
    if a == b {
        return 1.0;
    }
    let (ba, mut bb) = (bigrams(a), bigrams(b));
    if ba.is_empty() || bb.is_empty() {
        return 0.0;
    }
    let total = ba.len() + bb.len();
    let mut hits = 0usize;
    for g in &ba {
        if let Some(pos) = bb.iter().position(|x| x == g) {
            bb.swap_remove(pos);
            hits += 1;
        }
    }
    (2 * hits) as f32 / total as f32
}
