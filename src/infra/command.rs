//! 命令执行器
//!
//! 提供统一的外部进程执行接口，支持：
//! - 参数逐个传递（从不拼接 shell 字符串）
//! - 超时控制
//! - 取消支持（取消时终止子进程）
//! - stdout/stderr 分离捕获，可选逐行实时转发

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// 子进程退出后等待输出读取完成的最长时间
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// 输出行发送端，每读到一行 stdout/stderr 就发送一次
pub type LineSender = mpsc::UnboundedSender<String>;

/// 命令执行错误
#[derive(Debug)]
pub enum CommandError {
    /// 命令启动失败
    SpawnFailed(std::io::Error),
    /// 命令超时（已终止子进程）
    Timeout(Duration),
    /// 命令被取消（已终止子进程）
    Cancelled,
    /// 等待命令完成失败
    WaitFailed(std::io::Error),
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::SpawnFailed(e) => write!(f, "Failed to spawn command: {}", e),
            CommandError::Timeout(after) => write!(f, "Command timed out after {}s", after.as_secs()),
            CommandError::Cancelled => write!(f, "Command was cancelled"),
            CommandError::WaitFailed(e) => write!(f, "Failed to wait for command: {}", e),
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommandError::SpawnFailed(e) | CommandError::WaitFailed(e) => Some(e),
            _ => None,
        }
    }
}

/// 待执行的命令
#[derive(Debug, Clone)]
pub struct CommandSpec {
    program: String,
    args: Vec<OsString>,
    work_dir: Option<PathBuf>,
    envs: Vec<(String, String)>,
    timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            work_dir: None,
            envs: Vec::new(),
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.work_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// 用于日志展示的命令行（仅展示，不会被执行）
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }
}

/// 命令执行结果
#[derive(Debug)]
pub struct CommandOutput {
    /// 退出状态
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// 退出码（被信号终止时为 -1）
    pub fn code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }

    /// 合并后的输出（stdout 在前），首尾空白已去除
    pub fn combined(&self) -> String {
        let stdout = self.stdout.trim();
        let stderr = self.stderr.trim();
        match (stdout.is_empty(), stderr.is_empty()) {
            (true, true) => String::new(),
            (false, true) => stdout.to_string(),
            (true, false) => stderr.to_string(),
            (false, false) => format!("{}\n{}", stdout, stderr),
        }
    }
}

/// 命令执行器
pub struct CommandRunner;

impl CommandRunner {
    /// 执行命令并捕获输出，支持超时和取消
    ///
    /// 非零退出码不视为错误，由调用方根据 [`CommandOutput::success`] 判断
    pub async fn run(
        spec: &CommandSpec,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, CommandError> {
        Self::execute(spec, cancel, None).await
    }

    /// 执行命令，同时把每一行输出实时发送到 `lines`
    ///
    /// 完整输出仍然捕获在返回值中。返回时所有发送端都已释放，接收端随之结束
    pub async fn run_streaming(
        spec: &CommandSpec,
        cancel: &CancellationToken,
        lines: LineSender,
    ) -> Result<CommandOutput, CommandError> {
        Self::execute(spec, cancel, Some(lines)).await
    }

    async fn execute(
        spec: &CommandSpec,
        cancel: &CancellationToken,
        lines: Option<LineSender>,
    ) -> Result<CommandOutput, CommandError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = spec.work_dir {
            command.current_dir(dir);
        }
        for (key, value) in &spec.envs {
            command.env(key, value);
        }

        debug!(command = %spec.display(), "Spawning command");
        let mut child = command.spawn().map_err(CommandError::SpawnFailed)?;

        // 并行读取 stdout/stderr，避免管道写满阻塞子进程
        let stdout_task = spawn_line_reader(child.stdout.take(), lines.clone());
        let stderr_task = spawn_line_reader(child.stderr.take(), lines);

        // 等待命令完成，支持超时和取消
        let status = tokio::select! {
            _ = cancel.cancelled() => {
                warn!(command = %spec.display(), "Command cancelled, killing process");
                let _ = child.kill().await;
                stdout_task.abort();
                stderr_task.abort();
                return Err(CommandError::Cancelled);
            }
            _ = tokio::time::sleep(spec.timeout) => {
                error!(command = %spec.display(), "Command timed out after {:?}", spec.timeout);
                let _ = child.kill().await;
                stdout_task.abort();
                stderr_task.abort();
                return Err(CommandError::Timeout(spec.timeout));
            }
            status = child.wait() => status.map_err(CommandError::WaitFailed)?,
        };

        // 等待输出读取完成（孙进程可能仍持有管道）
        let stdout = drain(stdout_task).await;
        let stderr = drain(stderr_task).await;

        Ok(CommandOutput {
            status,
            stdout,
            stderr,
        })
    }
}

/// 逐行读取输出：转发到 `lines`（如有）并累积为完整文本
///
/// 按字节读取行，非 UTF-8 输出做有损转换，不会中断读取
fn spawn_line_reader<R>(reader: Option<R>, lines: Option<LineSender>) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut captured = String::new();
        let Some(reader) = reader else {
            return captured;
        };

        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf);
                    let line = text.trim_end_matches(&['\n', '\r'][..]);
                    if let Some(ref tx) = lines {
                        let _ = tx.send(line.to_string());
                    }
                    captured.push_str(line);
                    captured.push('\n');
                }
            }
        }
        captured
    })
}

/// 等待读取任务结束，超时则终止任务（同时释放其发送端）
async fn drain(mut task: JoinHandle<String>) -> String {
    match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut task).await {
        Ok(output) => output.unwrap_or_default(),
        Err(_) => {
            task.abort();
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(program: &str) -> CommandSpec {
        CommandSpec::new(program, Duration::from_secs(5)).current_dir("/tmp")
    }

    #[tokio::test]
    async fn test_run_success() {
        let output = CommandRunner::run(&spec("echo").arg("hello"), &CancellationToken::new())
            .await
            .unwrap();

        assert!(output.success());
        assert_eq!(output.code(), 0);
        assert!(output.stdout.contains("hello"));
        assert_eq!(output.combined(), "hello");
    }

    #[tokio::test]
    async fn test_run_not_found() {
        let result = CommandRunner::run(&spec("nonexistent_command_12345"), &CancellationToken::new()).await;

        assert!(matches!(result, Err(CommandError::SpawnFailed(_))));
    }

    #[tokio::test]
    async fn test_arguments_are_not_shell_interpreted() {
        let output = CommandRunner::run(
            &spec("echo").arg("$(id); rm -rf /tmp/nothing"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(output.stdout.trim(), "$(id); rm -rf /tmp/nothing");
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_captured() {
        let output = CommandRunner::run(
            &spec("sh").args(["-c", "echo out; echo oops >&2; exit 3"]),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(!output.success());
        assert_eq!(output.code(), 3);
        assert_eq!(output.combined(), "out\noops");
    }

    #[tokio::test]
    async fn test_run_timeout() {
        let slow = CommandSpec::new("sleep", Duration::from_millis(100)).arg("5");
        let result = CommandRunner::run(&slow, &CancellationToken::new()).await;

        assert!(matches!(result, Err(CommandError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_run_cancelled() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let slow = CommandSpec::new("sleep", Duration::from_secs(30)).arg("5");
        let result = CommandRunner::run(&slow, &cancel).await;

        assert!(matches!(result, Err(CommandError::Cancelled)));
    }

    #[tokio::test]
    async fn test_streaming_forwards_lines_before_exit() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let slow = CommandSpec::new("sh", Duration::from_secs(30)).args(["-c", "echo first; sleep 5; echo never"]);

        let run = {
            let cancel = cancel.clone();
            tokio::spawn(async move { CommandRunner::run_streaming(&slow, &cancel, tx).await })
        };

        // 第一行在进程结束前就已送达
        let first = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .unwrap();
        assert_eq!(first.as_deref(), Some("first"));
        assert!(!run.is_finished());

        cancel.cancel();
        assert!(matches!(run.await.unwrap(), Err(CommandError::Cancelled)));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_streaming_still_captures_output() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let output = CommandRunner::run_streaming(
            &spec("sh").args(["-c", "echo out; echo oops >&2; exit 2"]),
            &CancellationToken::new(),
            tx,
        )
        .await
        .unwrap();

        assert_eq!(output.code(), 2);
        assert_eq!(output.combined(), "out\noops");

        let mut forwarded = Vec::new();
        while let Some(line) = rx.recv().await {
            forwarded.push(line);
        }
        forwarded.sort();
        assert_eq!(forwarded, vec!["oops".to_string(), "out".to_string()]);
    }

    #[test]
    fn test_display() {
        let spec = CommandSpec::new("git", Duration::from_secs(1)).args(["clone", "--", "https://example.com/a.git"]);
        assert_eq!(spec.display(), "git clone -- https://example.com/a.git");
    }
}
