//! 部署服务模块
//!
//! `Orchestrator` 负责每个租户的单飞保证、后台运行调度、取消和停止。
//! 运行本身由 [`pipeline`] 按顺序执行。

pub mod compose;
pub mod context;
pub mod pipeline;
pub mod source_sync;

#[cfg(test)]
pub(crate) mod testing;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::env::constants::ANALYSIS_LOG_TAIL_CHARS;
use crate::domain::{
    ConfigInput, ConfigValidator, DeploymentState, DeploymentStatus, DescriptorGenerator, Tenant,
    TenantDeploymentConfig, TenantId, TenantLayout, ValidationError,
};
use crate::error::DeployError;
use crate::infra::analysis::{format_analysis_block, log_tail};
use crate::infra::{AnalysisError, FailureAnalyzer};
use crate::state::DeploymentRecordStore;

pub use compose::{BuildDeployError, BuildDeployRunner, ComposeRunner, ComposeTarget, StepOutput};
pub use context::{DeployContext, LogSink};
pub use pipeline::{Pipeline, RunPlan};
pub use source_sync::{GitSynchronizer, SourceSynchronizer, SyncError, SyncResult};

/// 编排器配置
#[derive(Clone, Debug)]
pub struct OrchestratorSettings {
    /// 租户目录根路径
    pub base_path: PathBuf,
    pub base_domain: String,
    /// 反向代理所在的外部网络
    pub network: String,
    /// 同时执行的部署上限
    pub max_concurrent_builds: usize,
    /// 单次部署总超时
    pub run_timeout: Duration,
}

/// 运行中的部署
#[derive(Clone, Debug)]
pub struct RunningDeploy {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub cancel_token: CancellationToken,
}

/// 部署编排器
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn DeploymentRecordStore>,
    sync: Arc<dyn SourceSynchronizer>,
    runner: Arc<dyn BuildDeployRunner>,
    analyzer: Arc<dyn FailureAnalyzer>,
    validator: ConfigValidator,
    descriptor: DescriptorGenerator,
    settings: OrchestratorSettings,
    /// 构建槽位（工作池）
    build_slots: Arc<Semaphore>,
    /// 每个租户当前运行中的部署 (tenant -> RunningDeploy)
    running: RwLock<HashMap<TenantId, RunningDeploy>>,
    /// 进程关闭时取消所有运行
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn DeploymentRecordStore>,
        sync: Arc<dyn SourceSynchronizer>,
        runner: Arc<dyn BuildDeployRunner>,
        analyzer: Arc<dyn FailureAnalyzer>,
        settings: OrchestratorSettings,
    ) -> Self {
        let slots = settings.max_concurrent_builds.max(1);
        Self {
            inner: Arc::new(Inner {
                store,
                sync,
                runner,
                analyzer,
                validator: ConfigValidator::new(&settings.base_domain),
                descriptor: DescriptorGenerator::new(&settings.base_domain, &settings.network),
                build_slots: Arc::new(Semaphore::new(slots)),
                running: RwLock::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                settings,
            }),
        }
    }

    /// 校验并保存租户配置
    ///
    /// 子域名被其他租户占用时返回 Conflict
    pub async fn save_config(&self, tenant: &Tenant, input: &ConfigInput) -> Result<(), DeployError> {
        let valid = self.inner.validator.validate(input)?;
        let subdomain = valid.as_config().subdomain.clone();
        self.inner.store.set_config(&tenant.id, valid).await?;
        tracing::info!(tenant = %tenant.id, subdomain = %subdomain, "Deployment configuration saved");
        Ok(())
    }

    pub async fn config(&self, tenant: &TenantId) -> Option<TenantDeploymentConfig> {
        self.inner.store.get_config(tenant).await
    }

    /// 当前状态和日志（纯读取）
    pub async fn status(&self, tenant: &TenantId) -> DeploymentState {
        self.inner.store.get_state(tenant).await
    }

    /// 开始部署
    ///
    /// 原子地把状态置为 `deploying` 并清空日志后立即返回 run ID，部署在后台执行
    pub async fn start(&self, tenant: &Tenant) -> Result<String, DeployError> {
        let inner = &self.inner;
        let config = inner
            .store
            .get_config(&tenant.id)
            .await
            .ok_or(DeployError::NotConfigured)?;
        let slug = tenant
            .slug()
            .ok_or(DeployError::Validation(ValidationError::InvalidTenantIdentity))?;

        if !inner.store.try_begin_deploy(&tenant.id).await? {
            return Err(DeployError::Conflict(
                "A deployment is already in progress.".to_string(),
            ));
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        let cancel_token = inner.register(&tenant.id, &run_id).await;

        let ctx = DeployContext {
            run_id: run_id.clone(),
            tenant: tenant.id.clone(),
            store: inner.store.clone(),
            cancel_token,
        };
        let plan = RunPlan {
            layout: TenantLayout::new(&inner.settings.base_path, &slug),
            config,
        };

        tracing::info!(
            tenant = %tenant.id,
            run_id = %run_id,
            subdomain = %plan.config.subdomain,
            "Deployment started"
        );
        tokio::spawn(self.inner.clone().execute(ctx, plan));

        Ok(run_id)
    }

    /// 停止租户服务
    ///
    /// 不受单飞限制，总是尝试 `down`。描述文件缺失时按当前配置重新生成。
    pub async fn stop(&self, tenant: &Tenant) -> Result<(), DeployError> {
        let inner = &self.inner;
        let slug = tenant
            .slug()
            .ok_or(DeployError::Validation(ValidationError::InvalidTenantIdentity))?;
        let layout = TenantLayout::new(&inner.settings.base_path, &slug);

        if !tokio::fs::try_exists(&layout.descriptor_path).await.unwrap_or(false) {
            let config = inner
                .store
                .get_config(&tenant.id)
                .await
                .ok_or(DeployError::NotConfigured)?;
            let descriptor =
                inner
                    .descriptor
                    .render(&slug, &config.subdomain, &layout.repo_dir, config.port);
            tokio::fs::create_dir_all(&layout.root).await?;
            tokio::fs::write(&layout.descriptor_path, descriptor).await?;
        }

        let target = ComposeTarget {
            project_name: layout.project_name(),
            descriptor_path: layout.descriptor_path.clone(),
            work_dir: layout.root.clone(),
        };
        // 停止不属于任何一次运行，输出直接写入租户日志
        let ctx = DeployContext {
            run_id: uuid::Uuid::new_v4().to_string(),
            tenant: tenant.id.clone(),
            store: inner.store.clone(),
            cancel_token: CancellationToken::new(),
        };
        ctx.log("").await;
        let result = inner.runner.down(&target, &ctx, &ctx.cancel_token).await;
        let in_flight = inner.running.read().await.contains_key(&tenant.id);

        match result {
            Ok(_) => {
                if in_flight {
                    // 进行中的部署自己决定最终状态
                    inner
                        .append(
                            &tenant.id,
                            "Project stopped. A deployment is still in progress; cancel it to abort.",
                        )
                        .await;
                } else {
                    inner.append(&tenant.id, "Project stopped.").await;
                    inner.store.set_status(&tenant.id, DeploymentStatus::Stopped).await?;
                }
                tracing::info!(tenant = %tenant.id, project = %target.project_name, "Project stopped");
                Ok(())
            }
            Err(e) => {
                inner
                    .append(&tenant.id, &format!("STOP ERROR: {}", e.detail()))
                    .await;
                if !in_flight {
                    inner.store.set_status(&tenant.id, DeploymentStatus::Error).await?;
                }
                tracing::error!(tenant = %tenant.id, error = %e, "Failed to stop project");
                Err(e.into())
            }
        }
    }

    /// 取消进行中的部署
    pub async fn cancel(&self, tenant: &TenantId) -> Result<(), DeployError> {
        let running = self.inner.running.read().await;
        match running.get(tenant) {
            Some(deploy) => {
                tracing::info!(
                    tenant = %tenant,
                    run_id = %deploy.run_id,
                    elapsed_secs = (Utc::now() - deploy.started_at).num_seconds(),
                    "Cancelling deployment"
                );
                deploy.cancel_token.cancel();
                Ok(())
            }
            None => Err(DeployError::Conflict(
                "No deployment is in progress.".to_string(),
            )),
        }
    }

    /// 显式失败分析，结果同时追加到日志
    pub async fn analyze(&self, tenant: &TenantId) -> Result<String, DeployError> {
        let key = self
            .inner
            .store
            .get_config(tenant)
            .await
            .and_then(|c| c.analysis_api_key)
            .ok_or(AnalysisError::MissingKey)?;

        let log = self.inner.store.get_state(tenant).await.log;
        let analysis = self
            .inner
            .analyzer
            .analyze(&key, log_tail(&log, ANALYSIS_LOG_TAIL_CHARS))
            .await
            .map_err(|e| {
                tracing::warn!(tenant = %tenant, error = %e, "Failure analysis failed");
                e
            })?;

        self.inner
            .append(tenant, &format_analysis_block(&analysis))
            .await;
        Ok(analysis)
    }

    /// 是否有运行中的部署
    pub async fn is_running(&self, tenant: &TenantId) -> bool {
        self.inner.running.read().await.contains_key(tenant)
    }

    pub async fn active_runs(&self) -> usize {
        self.inner.running.read().await.len()
    }

    /// 取消所有运行中的部署
    pub fn shutdown(&self) {
        tracing::info!("Cancelling all running deployments");
        self.inner.shutdown.cancel();
    }
}

impl Inner {
    async fn register(&self, tenant: &TenantId, run_id: &str) -> CancellationToken {
        let cancel_token = self.shutdown.child_token();
        let mut running = self.running.write().await;
        running.insert(
            tenant.clone(),
            RunningDeploy {
                run_id: run_id.to_string(),
                started_at: Utc::now(),
                cancel_token: cancel_token.clone(),
            },
        );
        cancel_token
    }

    /// 只移除本次运行的注册，避免误删新一轮部署
    async fn unregister(&self, tenant: &TenantId, run_id: &str) {
        let mut running = self.running.write().await;
        if running.get(tenant).is_some_and(|d| d.run_id == run_id) {
            running.remove(tenant);
        }
    }

    async fn append(&self, tenant: &TenantId, text: &str) {
        if let Err(e) = self.store.append_log(tenant, text).await {
            tracing::warn!(tenant = %tenant, error = %e, "Failed to append deployment log");
        }
    }

    /// 后台执行一次部署
    async fn execute(self: Arc<Self>, ctx: DeployContext, plan: RunPlan) {
        let timeout_task = spawn_timeout(ctx.clone(), self.settings.run_timeout);

        let mut stages = pipeline::initial_stages();
        let result = self.run_with_slot(&ctx, &plan, &mut stages).await;
        pipeline::skip_pending(&mut stages);
        timeout_task.abort();

        match result {
            Ok(url) => {
                ctx.log("").await;
                ctx.log("Deployment successful!").await;
                ctx.log(&format!("Your project is reachable at: {}", url)).await;
                log_stage_summary(&ctx, &stages).await;
                ctx.set_status(DeploymentStatus::Running).await;
                tracing::info!(tenant = %ctx.tenant, run_id = %ctx.run_id, url = %url, "Deployment finished");
            }
            Err(DeployError::Cancelled) => {
                ctx.log("Deployment cancelled.").await;
                log_stage_summary(&ctx, &stages).await;
                ctx.set_status(DeploymentStatus::Error).await;
                tracing::warn!(tenant = %ctx.tenant, run_id = %ctx.run_id, "Deployment cancelled");
            }
            Err(e) => {
                log_stage_summary(&ctx, &stages).await;
                ctx.set_status(DeploymentStatus::Error).await;
                tracing::warn!(tenant = %ctx.tenant, run_id = %ctx.run_id, error = %e, "Deployment failed");
                self.maybe_auto_analyze(&ctx, plan.config.analysis_api_key.as_deref())
                    .await;
            }
        }

        self.unregister(&ctx.tenant, &ctx.run_id).await;
    }

    /// 等待构建槽位后执行流水线，槽位在返回时释放
    async fn run_with_slot(
        &self,
        ctx: &DeployContext,
        plan: &RunPlan,
        stages: &mut [crate::domain::DeployStage],
    ) -> Result<String, DeployError> {
        let _permit = match self.build_slots.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                ctx.log("Waiting for a free build slot...").await;
                tokio::select! {
                    _ = ctx.cancel_token.cancelled() => return Err(DeployError::Cancelled),
                    permit = self.build_slots.clone().acquire_owned() => {
                        permit.map_err(|_| DeployError::Cancelled)?
                    }
                }
            }
        };

        let pipeline = Pipeline {
            sync: self.sync.as_ref(),
            runner: self.runner.as_ref(),
            descriptor: &self.descriptor,
        };
        pipeline.run(ctx, plan, stages).await
    }

    /// 失败后自动分析（仅当配置了 key）
    ///
    /// 分析期间若已开始新一轮部署，则丢弃结果。写入时持有运行表读锁，
    /// 并且只在状态仍为 `error` 时追加，新一轮的注册和开始都无法穿插进来。
    async fn maybe_auto_analyze(&self, ctx: &DeployContext, api_key: Option<&str>) {
        let Some(api_key) = api_key else {
            return;
        };

        let log = self.store.get_state(&ctx.tenant).await.log;
        let outcome = self
            .analyzer
            .analyze(api_key, log_tail(&log, ANALYSIS_LOG_TAIL_CHARS))
            .await;

        let running = self.running.read().await;
        if !running.get(&ctx.tenant).is_some_and(|d| d.run_id == ctx.run_id) {
            tracing::debug!(run_id = %ctx.run_id, "Discarding analysis of a superseded run");
            return;
        }

        let text = match outcome {
            Ok(analysis) => format_analysis_block(&analysis),
            Err(e) => {
                tracing::warn!(tenant = %ctx.tenant, error = %e, "Automatic failure analysis failed");
                format!("\nAnalysis failed: {}", e)
            }
        };
        match self
            .store
            .append_log_if(&ctx.tenant, DeploymentStatus::Error, &text)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(run_id = %ctx.run_id, "Discarding analysis of a superseded run");
            }
            Err(e) => {
                tracing::warn!(tenant = %ctx.tenant, error = %e, "Failed to append failure analysis");
            }
        }
        drop(running);
    }
}

async fn log_stage_summary(ctx: &DeployContext, stages: &[crate::domain::DeployStage]) {
    ctx.log("").await;
    ctx.log("=== Stage Summary ===").await;
    for stage in stages {
        ctx.log(&stage.summary_line()).await;
    }
}

/// 启动超时保护任务
fn spawn_timeout(ctx: DeployContext, limit: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = ctx.cancel_token.cancelled() => {}
            _ = tokio::time::sleep(limit) => {
                tracing::error!(
                    tenant = %ctx.tenant,
                    run_id = %ctx.run_id,
                    "Deployment timed out after {} minutes",
                    limit.as_secs() / 60
                );
                ctx.log(&format!("ERROR: Deployment exceeded the {} minute limit.", limit.as_secs() / 60))
                    .await;
                ctx.cancel_token.cancel();
            }
        }
    })
}
