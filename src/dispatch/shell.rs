//! Shell 命令执行：禁止危险子串，sh -c / cmd /C，带超时，合并 stdout 与 stderr

use std::time::Duration;

use tokio::process::Command;

/// 禁止的命令子串
const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf /",
    "rm -fr /",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    "format c:",
    "del /s /q c:\\",
    ":(){ :|:& };:", // fork bomb
];

/// 命令成功但没有输出时的返回文本
pub const NO_OUTPUT: &str = "Command executed successfully (No Output).";

pub fn check_command(raw: &str) -> Result<(), String> {
    let lower = raw.to_lowercase();
    if lower.trim().is_empty() {
        return Err("Empty command".to_string());
    }
    for forbidden in FORBIDDEN_SUBSTR {
        if lower.contains(forbidden) {
            return Err(format!("Forbidden pattern: {}", forbidden));
        }
    }
    Ok(())
}

/// 执行命令；非零退出码、超时、无法启动都返回 Err（附带已有输出）
pub async fn run_shell(command: &str, timeout: Duration) -> Result<String, String> {
    let command = command.trim();
    check_command(command)?;

    tracing::info!(command = %command, "shell command execute");

    let mut cmd = if cfg!(target_os = "windows") {
        let mut c = Command::new("cmd");
        c.args(["/C", command]);
        c
    } else {
        let mut c = Command::new("sh");
        c.args(["-c", command]);
        c
    };
    cmd.kill_on_drop(true);

    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| format!("Command timed out after {}s", timeout.as_secs()))?
        .map_err(|e| format!("Execution failed: {}", e))?;

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let combined = match (stdout.is_empty(), stderr.is_empty()) {
        (true, true) => String::new(),
        (false, true) => stdout,
        (true, false) => format!("stderr: {}", stderr),
        (false, false) => format!("{}\nstderr: {}", stdout, stderr),
    };
    if !output.status.success() {
        return Err(format!("Exit {:?}\n{}", output.status.code(), combined));
    }
    Ok(if combined.is_empty() {
        NO_OUTPUT.to_string()
    } else {
        combined
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forbidden() {
        assert!(check_command("rm -rf / --no-preserve-root").is_err());
        assert!(check_command("   ").is_err());
        assert!(check_command("echo hi").is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_shell_output() {
        let out = run_shell("echo hello", Duration::from_secs(5)).await.unwrap();
        assert_eq!(out, "hello");
        let empty = run_shell("true", Duration::from_secs(5)).await.unwrap();
        assert_eq!(empty, NO_OUTPUT);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_shell_failure_and_timeout() {
        let err = run_shell("echo oops 1>&2; exit 3", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.contains("oops"));
        let err = run_shell("sleep 5", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.contains("timed out"));
    }
}
