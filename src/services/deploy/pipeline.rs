//! 部署流水线
//!
//! 一次部署的严格顺序步骤：目录 → 同步源码 → 检查 Dockerfile → 生成描述 → 构建 → 启动。
//! 工具输出在执行期间逐行写入租户日志；失败时再追加错误摘要并返回错误，由编排器决定最终状态。

use crate::domain::{DeployStage, DescriptorGenerator, TenantDeploymentConfig, TenantLayout};
use crate::error::DeployError;

use super::compose::{BuildDeployError, BuildDeployRunner, ComposeTarget};
use super::context::DeployContext;
use super::source_sync::{SourceSynchronizer, SyncError};

/// 构建配方文件名
pub const BUILD_RECIPE_FILE: &str = "Dockerfile";

/// 缺少 Dockerfile 时的提示
pub const MISSING_RECIPE_HINT: [&str; 3] = [
    "ERROR: No Dockerfile found in the repository root!",
    "Your repository must contain a Dockerfile.",
    "Tip: start from the project template, it ships a working Dockerfile.",
];

// 阶段下标
const STAGE_SYNC: usize = 0;
const STAGE_RECIPE: usize = 1;
const STAGE_RENDER: usize = 2;
const STAGE_BUILD: usize = 3;
const STAGE_UP: usize = 4;

/// 一次部署的输入
#[derive(Clone, Debug)]
pub struct RunPlan {
    pub config: TenantDeploymentConfig,
    pub layout: TenantLayout,
}

impl RunPlan {
    pub fn target(&self) -> ComposeTarget {
        ComposeTarget {
            project_name: self.layout.project_name(),
            descriptor_path: self.layout.descriptor_path.clone(),
            work_dir: self.layout.root.clone(),
        }
    }
}

/// 初始化阶段列表
pub fn initial_stages() -> Vec<DeployStage> {
    vec![
        DeployStage::new("sync", "Source Sync"),
        DeployStage::new("recipe", "Dockerfile Check"),
        DeployStage::new("render", "Compose File"),
        DeployStage::new("build", "Image Build"),
        DeployStage::new("up", "Container Start"),
    ]
}

/// 流水线依赖
pub struct Pipeline<'a> {
    pub sync: &'a dyn SourceSynchronizer,
    pub runner: &'a dyn BuildDeployRunner,
    pub descriptor: &'a DescriptorGenerator,
}

impl Pipeline<'_> {
    /// 执行部署，成功返回对外 URL
    ///
    /// 未执行到的阶段保持 Pending，由调用方标记为跳过
    pub async fn run(
        &self,
        ctx: &DeployContext,
        plan: &RunPlan,
        stages: &mut [DeployStage],
    ) -> Result<String, DeployError> {
        let layout = &plan.layout;
        let config = &plan.config;

        // Step 1: 目录
        ctx.log(&format!("[1/5] Deployment directory: {}", layout.root.display()))
            .await;
        if let Err(e) = tokio::fs::create_dir_all(&layout.root).await {
            ctx.log(&format!("ERROR: cannot create {}: {}", layout.root.display(), e))
                .await;
            return Err(e.into());
        }
        ensure_active(ctx)?;

        // Step 2: 同步源码
        stages[STAGE_SYNC].start();
        ctx.log("[2/5] Synchronizing source...").await;
        let synced = self
            .sync
            .sync(&layout.repo_dir, &config.repo_url, ctx, &ctx.cancel_token)
            .await;
        match synced {
            Ok(result) => {
                stages[STAGE_SYNC].finish(true);
                tracing::info!(
                    run_id = %ctx.run_id,
                    branch = %result.branch,
                    updated = result.updated,
                    "Source synchronized"
                );
            }
            Err(SyncError::Cancelled) => {
                stages[STAGE_SYNC].finish(false);
                return Err(DeployError::Cancelled);
            }
            Err(e) => {
                stages[STAGE_SYNC].finish(false);
                ctx.log(&format!("SYNC ERROR:\n{}", e)).await;
                return Err(e.into());
            }
        }
        ensure_active(ctx)?;

        // Step 3: Dockerfile
        stages[STAGE_RECIPE].start();
        ctx.log("[3/5] Checking for Dockerfile...").await;
        let recipe = layout.repo_dir.join(BUILD_RECIPE_FILE);
        if !tokio::fs::try_exists(&recipe).await.unwrap_or(false) {
            stages[STAGE_RECIPE].finish(false);
            for line in MISSING_RECIPE_HINT {
                ctx.log(line).await;
            }
            return Err(DeployError::MissingBuildRecipe);
        }
        stages[STAGE_RECIPE].finish(true);
        ctx.log("Dockerfile found.").await;

        // Step 4: 描述文件（每次重新生成）
        stages[STAGE_RENDER].start();
        ctx.log("[4/5] Generating compose file...").await;
        let descriptor = self.descriptor.render(
            &layout.slug,
            &config.subdomain,
            &layout.repo_dir,
            config.port,
        );
        if let Err(e) = tokio::fs::write(&layout.descriptor_path, &descriptor).await {
            stages[STAGE_RENDER].finish(false);
            ctx.log(&format!("ERROR: cannot write {}: {}", layout.descriptor_path.display(), e))
                .await;
            return Err(e.into());
        }
        stages[STAGE_RENDER].finish(true);
        ctx.log(&format!("{} written:", crate::domain::deploy::DESCRIPTOR_FILE_NAME))
            .await;
        ctx.log("---").await;
        ctx.log(descriptor.trim_end()).await;
        ctx.log("---").await;
        ensure_active(ctx)?;

        // Step 5: 构建 + 启动
        let target = plan.target();
        ctx.log("[5/5] Build and deploy...").await;

        stages[STAGE_BUILD].start();
        ctx.log("Building image...").await;
        match self.runner.build(&target, ctx, &ctx.cancel_token).await {
            Ok(_) => {
                stages[STAGE_BUILD].finish(true);
                ctx.log("Build successful.").await;
            }
            Err(e) => {
                stages[STAGE_BUILD].finish(false);
                return Err(report_engine_error(ctx, "BUILD ERROR", e).await);
            }
        }
        ensure_active(ctx)?;

        stages[STAGE_UP].start();
        ctx.log("Starting container...").await;
        match self.runner.up(&target, ctx, &ctx.cancel_token).await {
            Ok(_) => {
                stages[STAGE_UP].finish(true);
            }
            Err(e) => {
                stages[STAGE_UP].finish(false);
                return Err(report_engine_error(ctx, "DEPLOY ERROR", e).await);
            }
        }

        Ok(self.descriptor.public_url(&config.subdomain))
    }
}

fn ensure_active(ctx: &DeployContext) -> Result<(), DeployError> {
    if ctx.is_cancelled() {
        Err(DeployError::Cancelled)
    } else {
        Ok(())
    }
}

/// 记录容器引擎错误，取消不视为步骤失败
async fn report_engine_error(ctx: &DeployContext, prefix: &str, e: BuildDeployError) -> DeployError {
    if let BuildDeployError::Cancelled { .. } = e {
        return DeployError::Cancelled;
    }
    ctx.log(&format!("{}:\n{}", prefix, e.detail())).await;
    e.into()
}

/// 把未执行的阶段标记为跳过
pub fn skip_pending(stages: &mut [DeployStage]) {
    for stage in stages.iter_mut() {
        if stage.status == crate::domain::StageStatus::Pending {
            stage.skip();
        }
    }
}
