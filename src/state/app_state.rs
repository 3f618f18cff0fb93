//! 应用状态

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::config::env::constants::{ANALYSIS_TIMEOUT, DEPLOY_TIMEOUT};
use crate::config::EnvConfig;
use crate::infra::AnalysisClient;
use crate::services::deploy::{ComposeRunner, GitSynchronizer, Orchestrator, OrchestratorSettings};

use super::record_store::{DeploymentRecordStore, JsonRecordStore};

/// 应用状态
///
/// 编排器（及其持有的记录存储）由进程入口创建后显式注入，不存在模块级单例
pub struct AppState {
    /// 外部认证层与本服务之间的共享密钥
    pub api_key: String,
    /// 环境配置
    pub config: EnvConfig,
    /// 部署编排器
    pub orchestrator: Orchestrator,
    /// 服务启动时间
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: EnvConfig, orchestrator: Orchestrator) -> Self {
        Self {
            api_key: config.api_key.clone(),
            config,
            orchestrator,
            started_at: Utc::now(),
        }
    }

    /// 按配置组装生产依赖：JSON 文件存储、git、docker compose、分析客户端
    pub async fn from_config(config: EnvConfig) -> anyhow::Result<Self> {
        tracing::info!(
            api_key_len = config.api_key.len(),
            port = config.port,
            base_path = %config.base_path.display(),
            base_domain = %config.base_domain,
            proxy_network = %config.proxy_network,
            max_concurrent_builds = config.max_concurrent_builds,
            "Loaded configuration"
        );

        tokio::fs::create_dir_all(&config.data_dir).await?;
        let store: Arc<dyn DeploymentRecordStore> =
            Arc::new(JsonRecordStore::open(config.store_path()).await?);

        let runner = ComposeRunner::detect().await;
        tracing::info!(command = %runner.describe(), "Using compose command");

        let analyzer = AnalysisClient::new(
            config.analysis.endpoint.clone(),
            config.analysis.model.clone(),
            ANALYSIS_TIMEOUT,
        )?;

        let orchestrator = Orchestrator::new(
            store,
            Arc::new(GitSynchronizer::default()),
            Arc::new(runner),
            Arc::new(analyzer),
            OrchestratorSettings {
                base_path: config.base_path.clone(),
                base_domain: config.base_domain.clone(),
                network: config.proxy_network.clone(),
                max_concurrent_builds: config.max_concurrent_builds,
                run_timeout: DEPLOY_TIMEOUT,
            },
        );

        Ok(Self::new(config, orchestrator))
    }

    /// 运行时长（秒）
    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }
}
