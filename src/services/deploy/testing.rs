//! 测试用的进程内替身
//!
//! 不依赖 git 和 docker，按脚本返回结果，输出像真实实现一样写入日志

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::infra::{AnalysisError, FailureAnalyzer};

use super::compose::{BuildDeployError, BuildDeployRunner, ComposeTarget, StepOutput};
use super::context::LogSink;
use super::source_sync::{SourceSynchronizer, SyncError, SyncResult};

/// 内存日志
#[derive(Default)]
pub struct MemoryLog {
    lines: Mutex<Vec<String>>,
}

impl MemoryLog {
    pub fn text(&self) -> String {
        let lines = self.lines.lock().unwrap();
        let mut out = String::new();
        for line in lines.iter() {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

#[async_trait]
impl LogSink for MemoryLog {
    async fn append(&self, text: &str) {
        self.lines.lock().unwrap().push(text.to_string());
    }
}

/// 不调用 git 的同步器，直接生成工作目录
pub struct FakeSync {
    /// 是否写入 Dockerfile
    pub with_recipe: bool,
    /// 返回携带两条错误信息的 Recovery 错误
    pub fail: bool,
    /// 阻塞直到被取消
    pub hang: bool,
    pub calls: AtomicUsize,
}

impl FakeSync {
    pub fn with_recipe() -> Self {
        Self {
            with_recipe: true,
            fail: false,
            hang: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn without_recipe() -> Self {
        Self {
            with_recipe: false,
            ..Self::with_recipe()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::with_recipe()
        }
    }

    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::with_recipe()
        }
    }
}

#[async_trait]
impl SourceSynchronizer for FakeSync {
    async fn sync(
        &self,
        work_dir: &Path,
        _remote_url: &str,
        log: &dyn LogSink,
        cancel: &CancellationToken,
    ) -> Result<SyncResult, SyncError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang {
            cancel.cancelled().await;
            return Err(SyncError::Cancelled);
        }
        if self.fail {
            log.append("Attempting a full re-clone...").await;
            return Err(SyncError::Recovery {
                update: "fetch: could not resolve host".to_string(),
                reclone: "clone: repository not found".to_string(),
            });
        }

        tokio::fs::create_dir_all(work_dir).await?;
        if self.with_recipe {
            tokio::fs::write(work_dir.join("Dockerfile"), "FROM nginx:alpine\n").await?;
        }
        log.append("Clone successful.").await;
        Ok(SyncResult {
            branch: "main".to_string(),
            updated: true,
        })
    }
}

/// 按脚本返回结果的容器引擎
#[derive(Default)]
pub struct FakeRunner {
    pub fail_build: bool,
    pub fail_up: bool,
    pub fail_down: bool,
    /// `build` 的耗时，期间响应取消
    pub build_delay: Option<Duration>,
    pub calls: Mutex<Vec<(&'static str, ComposeTarget)>>,
}

impl FakeRunner {
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().iter().map(|(step, _)| *step).collect()
    }

    pub fn targets(&self) -> Vec<ComposeTarget> {
        self.calls.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
    }

    fn record(&self, step: &'static str, target: &ComposeTarget) {
        self.calls.lock().unwrap().push((step, target.clone()));
    }

    /// 像真实执行器一样先把输出写入日志，再返回结果
    async fn finish(
        log: &dyn LogSink,
        output: &str,
        failure: Option<fn(String) -> BuildDeployError>,
    ) -> Result<StepOutput, BuildDeployError> {
        log.append(output).await;
        match failure {
            Some(make) => Err(make(output.to_string())),
            None => Ok(StepOutput {
                output: output.to_string(),
            }),
        }
    }
}

#[async_trait]
impl BuildDeployRunner for FakeRunner {
    async fn build(
        &self,
        target: &ComposeTarget,
        log: &dyn LogSink,
        cancel: &CancellationToken,
    ) -> Result<StepOutput, BuildDeployError> {
        self.record("build", target);
        if let Some(delay) = self.build_delay {
            tokio::select! {
                _ = cancel.cancelled() => return Err(BuildDeployError::Cancelled { step: "build" }),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if self.fail_build {
            Self::finish(
                log,
                "ERROR: failed to solve: npm ci exited with 1",
                Some(|output| BuildDeployError::Build { output }),
            )
            .await
        } else {
            Self::finish(log, "Successfully built", None).await
        }
    }

    async fn up(
        &self,
        target: &ComposeTarget,
        log: &dyn LogSink,
        _cancel: &CancellationToken,
    ) -> Result<StepOutput, BuildDeployError> {
        self.record("up", target);
        if self.fail_up {
            Self::finish(
                log,
                "port is already allocated",
                Some(|output| BuildDeployError::Run { output }),
            )
            .await
        } else {
            Self::finish(log, "Container td-alice Started", None).await
        }
    }

    async fn down(
        &self,
        target: &ComposeTarget,
        log: &dyn LogSink,
        _cancel: &CancellationToken,
    ) -> Result<StepOutput, BuildDeployError> {
        self.record("down", target);
        if self.fail_down {
            Self::finish(
                log,
                "Cannot connect to the Docker daemon",
                Some(|output| BuildDeployError::Stop { output }),
            )
            .await
        } else {
            Self::finish(log, "Container td-alice Removed", None).await
        }
    }
}

/// 返回固定诊断结果的分析器
pub struct FakeAnalyzer {
    pub reply: Result<String, String>,
    pub calls: AtomicUsize,
    pub last_tail: Mutex<Option<String>>,
    /// 设置后，每次分析都等待一次通知再返回
    pub gate: Option<Arc<Notify>>,
}

impl FakeAnalyzer {
    pub fn replying(text: &str) -> Self {
        Self {
            reply: Ok(text.to_string()),
            calls: AtomicUsize::new(0),
            last_tail: Mutex::new(None),
            gate: None,
        }
    }

    pub fn gated(text: &str, gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::replying(text)
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            reply: Err(message.to_string()),
            ..Self::replying("")
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FailureAnalyzer for FakeAnalyzer {
    async fn analyze(&self, api_key: &str, log_tail: &str) -> Result<String, AnalysisError> {
        if api_key.is_empty() {
            return Err(AnalysisError::MissingKey);
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_tail.lock().unwrap() = Some(log_tail.to_string());
        if let Some(ref gate) = self.gate {
            gate.notified().await;
        }
        self.reply.clone().map_err(AnalysisError::Request)
    }
}
