//! 部署上下文
//!
//! 统一的部署执行上下文，包含租户信息、记录存储和取消令牌

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::domain::{DeploymentStatus, TenantId};
use crate::infra::{CommandError, CommandOutput, CommandRunner, CommandSpec};
use crate::state::DeploymentRecordStore;

/// 部署日志输出
///
/// 同步器和运行器通过它逐行写入租户日志，每次追加都是独立事务
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn append(&self, text: &str);
}

/// 执行命令，输出逐行实时写入日志
///
/// 长时间的 clone / build 在运行期间就能被轮询方看到进度
pub async fn run_logged(
    spec: &CommandSpec,
    log: &dyn LogSink,
    cancel: &CancellationToken,
) -> Result<CommandOutput, CommandError> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let forward = async {
        while let Some(line) = rx.recv().await {
            if !line.trim().is_empty() {
                log.append(&line).await;
            }
        }
    };
    let (result, ()) = tokio::join!(CommandRunner::run_streaming(spec, cancel, tx), forward);
    result
}

/// 部署执行上下文
#[derive(Clone)]
pub struct DeployContext {
    /// 本次运行 ID
    pub run_id: String,
    pub tenant: TenantId,
    /// 记录存储
    pub store: Arc<dyn DeploymentRecordStore>,
    /// 取消令牌
    pub cancel_token: CancellationToken,
}

impl DeployContext {
    /// 追加日志
    pub async fn log(&self, text: &str) {
        if let Err(e) = self.store.append_log(&self.tenant, text).await {
            tracing::warn!(
                tenant = %self.tenant,
                run_id = %self.run_id,
                error = %e,
                "Failed to append deployment log"
            );
        }
    }

    /// 更新部署状态
    pub async fn set_status(&self, status: DeploymentStatus) {
        if let Err(e) = self.store.set_status(&self.tenant, status).await {
            tracing::error!(
                tenant = %self.tenant,
                run_id = %self.run_id,
                status = %status,
                error = %e,
                "Failed to persist deployment status"
            );
        }
    }

    /// 检查是否被取消
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

#[async_trait]
impl LogSink for DeployContext {
    async fn append(&self, text: &str) {
        self.log(text).await;
    }
}
