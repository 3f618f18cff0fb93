//! 源码同步
//!
//! 把租户的工作目录更新到远程分支最新提交。工作目录只是构建产物，
//! 本地改动直接丢弃；检出损坏时重新完整克隆一次，仍失败则放弃。

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::env::constants::{
    GIT_CLEAN_TIMEOUT, GIT_CLONE_TIMEOUT, GIT_FETCH_TIMEOUT, GIT_RESET_TIMEOUT,
    GIT_REV_PARSE_TIMEOUT, GIT_STATUS_TIMEOUT,
};
use crate::infra::{CommandError, CommandOutput, CommandRunner, CommandSpec};

use super::context::{run_logged, LogSink};

/// 同步结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncResult {
    /// 当前跟踪的分支
    pub branch: String,
    /// HEAD 是否变化（全新克隆总为 true）
    pub updated: bool,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("git clone failed: {0}")]
    Clone(String),

    #[error("update failed: {update}; full re-clone also failed: {reclone}")]
    Recovery { update: String, reclone: String },

    #[error("source sync cancelled")]
    Cancelled,

    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait SourceSynchronizer: Send + Sync {
    async fn sync(
        &self,
        work_dir: &Path,
        remote_url: &str,
        log: &dyn LogSink,
        cancel: &CancellationToken,
    ) -> Result<SyncResult, SyncError>;
}

/// 单个 git 步骤的失败
enum StepError {
    Failed(String),
    Cancelled,
}

impl From<CommandError> for StepError {
    fn from(e: CommandError) -> Self {
        match e {
            CommandError::Cancelled => StepError::Cancelled,
            other => StepError::Failed(other.to_string()),
        }
    }
}

/// 基于 `git` 命令行的同步器
pub struct GitSynchronizer {
    program: String,
}

impl Default for GitSynchronizer {
    fn default() -> Self {
        Self::new("git")
    }
}

impl GitSynchronizer {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn git(&self, timeout: Duration) -> CommandSpec {
        // 私有仓库不能卡在凭据输入提示上
        CommandSpec::new(&self.program, timeout).env("GIT_TERMINAL_PROMPT", "0")
    }

    /// 执行一个只读的 git 步骤，输出不进日志
    async fn step(
        &self,
        spec: CommandSpec,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, StepError> {
        let output = CommandRunner::run(&spec, cancel).await?;
        Self::check(&spec, output)
    }

    /// 执行 clone / fetch / reset，输出逐行写入日志
    async fn step_logged(
        &self,
        spec: CommandSpec,
        log: &dyn LogSink,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, StepError> {
        let output = run_logged(&spec, log, cancel).await?;
        Self::check(&spec, output)
    }

    /// 非零退出码转为携带输出的失败
    fn check(spec: &CommandSpec, output: CommandOutput) -> Result<CommandOutput, StepError> {
        if output.success() {
            Ok(output)
        } else {
            let detail = output.combined();
            Err(StepError::Failed(if detail.is_empty() {
                format!("`{}` exited with code {}", spec.display(), output.code())
            } else {
                detail
            }))
        }
    }

    async fn fresh_clone(
        &self,
        work_dir: &Path,
        remote_url: &str,
        log: &dyn LogSink,
        cancel: &CancellationToken,
    ) -> Result<SyncResult, StepError> {
        if tokio::fs::try_exists(work_dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(work_dir)
                .await
                .map_err(|e| StepError::Failed(format!("cannot remove {}: {}", work_dir.display(), e)))?;
        }
        let parent = work_dir.parent().unwrap_or(work_dir);
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StepError::Failed(format!("cannot create {}: {}", parent.display(), e)))?;

        let clone = self
            .git(GIT_CLONE_TIMEOUT)
            .args(["clone", "--"])
            .arg(remote_url)
            .arg(work_dir)
            .current_dir(parent);
        self.step_logged(clone, log, cancel).await?;

        let branch = self
            .current_branch(work_dir, cancel)
            .await
            .unwrap_or_else(|_| "HEAD".to_string());
        Ok(SyncResult {
            branch,
            updated: true,
        })
    }

    /// 增量更新已有检出
    async fn update(
        &self,
        work_dir: &Path,
        remote_url: &str,
        log: &dyn LogSink,
        cancel: &CancellationToken,
    ) -> Result<SyncResult, StepError> {
        // 仓库地址变更按分叉处理
        let origin = self
            .step(
                self.git(GIT_STATUS_TIMEOUT)
                    .args(["remote", "get-url", "origin"])
                    .current_dir(work_dir),
                cancel,
            )
            .await?;
        let origin = origin.stdout.trim();
        if origin != remote_url {
            return Err(StepError::Failed(format!(
                "origin points to {} but the configured repository is {}",
                origin, remote_url
            )));
        }

        let status = self
            .step(
                self.git(GIT_STATUS_TIMEOUT)
                    .args(["status", "--porcelain"])
                    .current_dir(work_dir),
                cancel,
            )
            .await?;
        if !status.stdout.trim().is_empty() {
            warn!(dir = %work_dir.display(), "Discarding local changes in working copy");
            log.append("WARNING: Local changes detected. Resetting working copy...").await;
            self.step(
                self.git(GIT_CLEAN_TIMEOUT)
                    .args(["reset", "--hard", "HEAD"])
                    .current_dir(work_dir),
                cancel,
            )
            .await?;
            self.step(
                self.git(GIT_CLEAN_TIMEOUT)
                    .args(["clean", "-fdx"])
                    .current_dir(work_dir),
                cancel,
            )
            .await?;
            log.append("Local changes removed.").await;
        }

        let before = self.head(work_dir, cancel).await.ok();

        self.step_logged(
            self.git(GIT_FETCH_TIMEOUT)
                .args(["fetch", "--prune", "origin"])
                .current_dir(work_dir),
            log,
            cancel,
        )
        .await?;

        let branch = match self.current_branch(work_dir, cancel).await? {
            b if b.is_empty() || b == "HEAD" => self.remote_default_branch(work_dir, cancel).await?,
            b => b,
        };
        if branch.starts_with('-') {
            return Err(StepError::Failed(format!("refusing suspicious branch name '{}'", branch)));
        }

        self.step_logged(
            self.git(GIT_RESET_TIMEOUT)
                .args(["reset", "--hard"])
                .arg(format!("origin/{}", branch))
                .current_dir(work_dir),
            log,
            cancel,
        )
        .await?;

        let after = self.head(work_dir, cancel).await.ok();
        Ok(SyncResult {
            branch,
            updated: before.is_none() || before != after,
        })
    }

    async fn current_branch(
        &self,
        work_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<String, StepError> {
        let output = self
            .step(
                self.git(GIT_REV_PARSE_TIMEOUT)
                    .args(["rev-parse", "--abbrev-ref", "HEAD"])
                    .current_dir(work_dir),
                cancel,
            )
            .await?;
        Ok(output.stdout.trim().to_string())
    }

    /// 游离 HEAD 时取 `origin` 的默认分支
    async fn remote_default_branch(
        &self,
        work_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<String, StepError> {
        let output = self
            .step(
                self.git(GIT_REV_PARSE_TIMEOUT)
                    .args(["symbolic-ref", "--short", "refs/remotes/origin/HEAD"])
                    .current_dir(work_dir),
                cancel,
            )
            .await?;
        let name = output.stdout.trim();
        Ok(name.strip_prefix("origin/").unwrap_or(name).to_string())
    }

    async fn head(&self, work_dir: &Path, cancel: &CancellationToken) -> Result<String, StepError> {
        let output = self
            .step(
                self.git(GIT_REV_PARSE_TIMEOUT)
                    .args(["rev-parse", "HEAD"])
                    .current_dir(work_dir),
                cancel,
            )
            .await?;
        Ok(output.stdout.trim().to_string())
    }
}

#[async_trait]
impl SourceSynchronizer for GitSynchronizer {
    async fn sync(
        &self,
        work_dir: &Path,
        remote_url: &str,
        log: &dyn LogSink,
        cancel: &CancellationToken,
    ) -> Result<SyncResult, SyncError> {
        let has_metadata = tokio::fs::try_exists(work_dir.join(".git"))
            .await
            .unwrap_or(false);

        if !has_metadata {
            log.append("Cloning repository...").await;
            return match self.fresh_clone(work_dir, remote_url, log, cancel).await {
                Ok(result) => {
                    log.append("Clone successful.").await;
                    info!(dir = %work_dir.display(), branch = %result.branch, "Cloned repository");
                    Ok(result)
                }
                Err(StepError::Cancelled) => Err(SyncError::Cancelled),
                Err(StepError::Failed(e)) => Err(SyncError::Clone(e)),
            };
        }

        log.append("Repository exists, pulling updates...").await;
        let update_error = match self.update(work_dir, remote_url, log, cancel).await {
            Ok(result) => {
                log.append("Pull successful.").await;
                info!(
                    dir = %work_dir.display(),
                    branch = %result.branch,
                    updated = result.updated,
                    "Updated working copy"
                );
                return Ok(result);
            }
            Err(StepError::Cancelled) => return Err(SyncError::Cancelled),
            Err(StepError::Failed(e)) => e,
        };

        // 只做一次破坏性恢复
        warn!(dir = %work_dir.display(), error = %update_error, "Update failed, re-cloning");
        log.append(&format!("Pull error: {}", update_error)).await;
        log.append("Attempting a full re-clone...").await;

        match self.fresh_clone(work_dir, remote_url, log, cancel).await {
            Ok(result) => {
                log.append("Re-clone successful.").await;
                Ok(result)
            }
            Err(StepError::Cancelled) => Err(SyncError::Cancelled),
            Err(StepError::Failed(reclone)) => Err(SyncError::Recovery {
                update: update_error,
                reclone,
            }),
        }
    }
}
