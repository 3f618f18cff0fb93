//! Docker Compose 构建 / 启动 / 停止
//!
//! 每次调用都带上租户的项目名（`-p`），不同租户的构建和清理互不影响。
//! 命令输出逐行实时写入租户日志。

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::env::constants::{BUILD_TIMEOUT, DOWN_TIMEOUT, UP_TIMEOUT};
use crate::infra::{CommandError, CommandSpec};

use super::context::{run_logged, LogSink};

/// 错误报告中保留的输出行数（完整输出已实时写入日志）
const ERROR_DETAIL_LINES: usize = 20;

/// compose 命令的作用对象
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComposeTarget {
    pub project_name: String,
    pub descriptor_path: PathBuf,
    pub work_dir: PathBuf,
}

/// 成功步骤的合并输出
#[derive(Clone, Debug, Default)]
pub struct StepOutput {
    pub output: String,
}

/// 构建 / 启动 / 停止错误
#[derive(Debug, Error)]
pub enum BuildDeployError {
    #[error("image build failed")]
    Build { output: String },

    #[error("container start failed")]
    Run { output: String },

    #[error("teardown failed")]
    Stop { output: String },

    #[error("{step} timed out after {}s", .after.as_secs())]
    Timeout { step: &'static str, after: Duration },

    #[error("{step} cancelled")]
    Cancelled { step: &'static str },

    #[error("failed to run {program}: {message}")]
    Spawn { program: String, message: String },
}

impl BuildDeployError {
    /// 失败前捕获的工具输出
    pub fn output(&self) -> Option<&str> {
        match self {
            Self::Build { output } | Self::Run { output } | Self::Stop { output } => {
                Some(output.as_str())
            }
            _ => None,
        }
    }

    /// 面向用户的错误详情：输出的最后几行，无输出时为错误描述
    pub fn detail(&self) -> String {
        match self.output().map(str::trim) {
            Some(output) if !output.is_empty() => {
                let lines: Vec<&str> = output.lines().collect();
                let start = lines.len().saturating_sub(ERROR_DETAIL_LINES);
                lines[start..].join("\n")
            }
            _ => self.to_string(),
        }
    }
}

/// 容器引擎操作
///
/// 实现方把命令输出逐行写入 `log`
#[async_trait]
pub trait BuildDeployRunner: Send + Sync {
    /// 不使用缓存构建镜像
    async fn build(
        &self,
        target: &ComposeTarget,
        log: &dyn LogSink,
        cancel: &CancellationToken,
    ) -> Result<StepOutput, BuildDeployError>;

    /// 启动服务，强制重建容器
    async fn up(
        &self,
        target: &ComposeTarget,
        log: &dyn LogSink,
        cancel: &CancellationToken,
    ) -> Result<StepOutput, BuildDeployError>;

    /// 停止服务并清理孤儿资源
    async fn down(
        &self,
        target: &ComposeTarget,
        log: &dyn LogSink,
        cancel: &CancellationToken,
    ) -> Result<StepOutput, BuildDeployError>;
}

#[derive(Clone, Copy)]
enum Step {
    Build,
    Up,
    Down,
}

impl Step {
    fn name(self) -> &'static str {
        match self {
            Step::Build => "build",
            Step::Up => "up",
            Step::Down => "down",
        }
    }

    fn args(self) -> &'static [&'static str] {
        match self {
            Step::Build => &["build", "--no-cache"],
            Step::Up => &["up", "-d", "--force-recreate"],
            Step::Down => &["down", "--remove-orphans"],
        }
    }

    fn timeout(self) -> Duration {
        match self {
            Step::Build => BUILD_TIMEOUT,
            Step::Up => UP_TIMEOUT,
            Step::Down => DOWN_TIMEOUT,
        }
    }

    fn failure(self, output: String) -> BuildDeployError {
        match self {
            Step::Build => BuildDeployError::Build { output },
            Step::Up => BuildDeployError::Run { output },
            Step::Down => BuildDeployError::Stop { output },
        }
    }
}

/// `docker compose` / `docker-compose` 执行器
#[derive(Clone, Debug)]
pub struct ComposeRunner {
    program: String,
    base_args: Vec<String>,
}

impl ComposeRunner {
    /// 检测 compose 命令：优先独立的 `docker-compose`，否则使用 `docker compose` 插件
    pub async fn detect() -> Self {
        let check = Command::new("which").arg("docker-compose").output().await;

        if check.map(|o| o.status.success()).unwrap_or(false) {
            Self::with_command("docker-compose", Vec::<String>::new())
        } else {
            Self::with_command("docker", ["compose"])
        }
    }

    pub fn with_command<I, S>(program: impl Into<String>, base_args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            base_args: base_args.into_iter().map(Into::into).collect(),
        }
    }

    /// 命令名称（如 `docker compose`），用于日志
    pub fn describe(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.base_args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn spec(&self, target: &ComposeTarget, step: Step) -> CommandSpec {
        CommandSpec::new(&self.program, step.timeout())
            .args(&self.base_args)
            .arg("-p")
            .arg(&target.project_name)
            .arg("-f")
            .arg(&target.descriptor_path)
            .args(step.args())
            .current_dir(&target.work_dir)
    }

    async fn execute(
        &self,
        target: &ComposeTarget,
        step: Step,
        log: &dyn LogSink,
        cancel: &CancellationToken,
    ) -> Result<StepOutput, BuildDeployError> {
        let spec = self.spec(target, step);
        tracing::info!(
            project = %target.project_name,
            command = %spec.display(),
            "Running compose step"
        );

        let output = run_logged(&spec, log, cancel)
            .await
            .map_err(|e| match e {
                CommandError::Timeout(after) => BuildDeployError::Timeout {
                    step: step.name(),
                    after,
                },
                CommandError::Cancelled => BuildDeployError::Cancelled { step: step.name() },
                CommandError::SpawnFailed(e) | CommandError::WaitFailed(e) => {
                    BuildDeployError::Spawn {
                        program: self.program.clone(),
                        message: e.to_string(),
                    }
                }
            })?;

        let combined = output.combined();
        if output.success() {
            Ok(StepOutput { output: combined })
        } else {
            tracing::warn!(
                project = %target.project_name,
                step = step.name(),
                exit_code = output.code(),
                "Compose step failed"
            );
            Err(step.failure(combined))
        }
    }
}

#[async_trait]
impl BuildDeployRunner for ComposeRunner {
    async fn build(
        &self,
        target: &ComposeTarget,
        log: &dyn LogSink,
        cancel: &CancellationToken,
    ) -> Result<StepOutput, BuildDeployError> {
        self.execute(target, Step::Build, log, cancel).await
    }

    async fn up(
        &self,
        target: &ComposeTarget,
        log: &dyn LogSink,
        cancel: &CancellationToken,
    ) -> Result<StepOutput, BuildDeployError> {
        self.execute(target, Step::Up, log, cancel).await
    }

    async fn down(
        &self,
        target: &ComposeTarget,
        log: &dyn LogSink,
        cancel: &CancellationToken,
    ) -> Result<StepOutput, BuildDeployError> {
        self.execute(target, Step::Down, log, cancel).await
    }
}
