//! 部署记录存储
//!
//! 定义租户配置、部署状态和追加式日志的存储契约，
//! 并提供基于 JSON 文件的实现（原子写入，重启后恢复）。
//!
//! 每个操作都是独立的短事务：调用方不会在外部进程执行期间持有锁，
//! 并发读取方总能看到最新的部分进度。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::domain::{
    DeploymentState, DeploymentStatus, TenantDeploymentConfig, TenantId, ValidConfig,
};

/// 持久化格式版本
const STORE_VERSION: u32 = 1;

/// 重启时中断的部署追加的日志
const INTERRUPTED_NOTE: &str = "Deployment interrupted: the deploy service restarted while this run was in progress.";

/// 存储错误
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Subdomain '{0}' is already taken by another user.")]
    SubdomainTaken(String),

    #[error("failed to persist deployment records: {0}")]
    Persist(String),
}

/// 部署记录存储契约
#[async_trait]
pub trait DeploymentRecordStore: Send + Sync {
    /// 获取租户配置
    async fn get_config(&self, tenant: &TenantId) -> Option<TenantDeploymentConfig>;

    /// 写入租户配置，子域名被其他租户占用时返回 [`StoreError::SubdomainTaken`]
    async fn set_config(&self, tenant: &TenantId, config: ValidConfig) -> Result<(), StoreError>;

    /// 获取部署状态（未知租户返回初始状态）
    async fn get_state(&self, tenant: &TenantId) -> DeploymentState;

    async fn set_status(&self, tenant: &TenantId, status: DeploymentStatus) -> Result<(), StoreError>;

    /// 原子追加一行日志，从不覆盖已有内容
    async fn append_log(&self, tenant: &TenantId, text: &str) -> Result<(), StoreError>;

    async fn reset_log(&self, tenant: &TenantId) -> Result<(), StoreError>;

    /// 单飞保护：状态不是 `deploying` 时原子地置为 `deploying` 并清空日志
    ///
    /// 返回 false 表示已有部署在进行
    async fn try_begin_deploy(&self, tenant: &TenantId) -> Result<bool, StoreError>;

    /// 仅当状态仍为 `expected` 时追加日志（与状态检查在同一事务内）
    ///
    /// 返回 false 表示状态已变化，日志未写入
    async fn append_log_if(
        &self,
        tenant: &TenantId,
        expected: DeploymentStatus,
        text: &str,
    ) -> Result<bool, StoreError>;
}

/// 单个租户的记录
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TenantRecord {
    #[serde(default)]
    pub config: Option<TenantDeploymentConfig>,
    #[serde(default)]
    pub state: DeploymentState,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// 持久化的记录文件
#[derive(Clone, Debug, Serialize, Deserialize)]
struct PersistedRecords {
    /// 版本号（用于未来格式升级）
    version: u32,
    saved_at: DateTime<Utc>,
    tenants: BTreeMap<TenantId, TenantRecord>,
}

/// JSON 文件存储
///
/// `path` 为 None 时仅保存在内存中（测试和临时运行）
pub struct JsonRecordStore {
    records: RwLock<BTreeMap<TenantId, TenantRecord>>,
    path: Option<PathBuf>,
}

impl JsonRecordStore {
    /// 创建纯内存存储
    pub fn in_memory() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            path: None,
        }
    }

    /// 打开（或创建）文件存储
    ///
    /// 加载时将所有 `deploying` 状态的租户标记为 `error`：进程重启后不会有部署在运行
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let mut tenants = load_records(&path).await?;

        let mut interrupted = 0;
        for record in tenants.values_mut() {
            if record.state.status == DeploymentStatus::Deploying {
                record.state.status = DeploymentStatus::Error;
                push_line(&mut record.state.log, INTERRUPTED_NOTE);
                record.updated_at = Some(Utc::now());
                interrupted += 1;
            }
        }

        let store = Self {
            records: RwLock::new(tenants),
            path: Some(path),
        };

        if interrupted > 0 {
            warn!(count = interrupted, "Marked interrupted deployments as failed");
            let records = store.records.read().await;
            store.persist(&records).await?;
        }

        Ok(store)
    }

    /// 在写锁内修改单个租户记录并持久化
    async fn mutate<T>(
        &self,
        tenant: &TenantId,
        f: impl FnOnce(&mut TenantRecord) -> T,
    ) -> Result<T, StoreError> {
        let mut records = self.records.write().await;
        let previous = records.get(tenant).cloned();
        let record = records.entry(tenant.clone()).or_default();
        let result = f(record);
        record.updated_at = Some(Utc::now());
        self.commit(&mut records, tenant, previous).await?;
        Ok(result)
    }

    /// 持久化已修改的记录，失败时把该租户恢复为修改前的值
    ///
    /// 内存状态与磁盘保持一致：调用方收到错误时没有任何变更生效
    async fn commit(
        &self,
        records: &mut BTreeMap<TenantId, TenantRecord>,
        tenant: &TenantId,
        previous: Option<TenantRecord>,
    ) -> Result<(), StoreError> {
        if let Err(e) = self.persist(records).await {
            match previous {
                Some(record) => records.insert(tenant.clone(), record),
                None => records.remove(tenant),
            };
            return Err(e);
        }
        Ok(())
    }

    /// 保存到文件（原子写入）
    async fn persist(&self, records: &BTreeMap<TenantId, TenantRecord>) -> Result<(), StoreError> {
        let Some(ref path) = self.path else {
            return Ok(());
        };

        let snapshot = PersistedRecords {
            version: STORE_VERSION,
            saved_at: Utc::now(),
            tenants: records.clone(),
        };

        write_atomic(path, &snapshot).await.map_err(|e| {
            error!(path = %path.display(), error = %e, "Failed to persist deployment records");
            StoreError::Persist(e.to_string())
        })
    }
}

#[async_trait]
impl DeploymentRecordStore for JsonRecordStore {
    async fn get_config(&self, tenant: &TenantId) -> Option<TenantDeploymentConfig> {
        let records = self.records.read().await;
        records.get(tenant).and_then(|r| r.config.clone())
    }

    async fn set_config(&self, tenant: &TenantId, config: ValidConfig) -> Result<(), StoreError> {
        let config = config.into_inner();
        // 检查与写入在同一把写锁内完成
        let mut records = self.records.write().await;
        let taken = records.iter().any(|(id, record)| {
            id != tenant
                && record
                    .config
                    .as_ref()
                    .is_some_and(|c| c.subdomain == config.subdomain)
        });
        if taken {
            return Err(StoreError::SubdomainTaken(config.subdomain));
        }

        let previous = records.get(tenant).cloned();
        let record = records.entry(tenant.clone()).or_default();
        record.config = Some(config);
        record.updated_at = Some(Utc::now());
        self.commit(&mut records, tenant, previous).await
    }

    async fn get_state(&self, tenant: &TenantId) -> DeploymentState {
        let records = self.records.read().await;
        records
            .get(tenant)
            .map(|r| r.state.clone())
            .unwrap_or_default()
    }

    async fn set_status(&self, tenant: &TenantId, status: DeploymentStatus) -> Result<(), StoreError> {
        self.mutate(tenant, |record| record.state.status = status).await
    }

    async fn append_log(&self, tenant: &TenantId, text: &str) -> Result<(), StoreError> {
        self.mutate(tenant, |record| push_line(&mut record.state.log, text))
            .await
    }

    async fn reset_log(&self, tenant: &TenantId) -> Result<(), StoreError> {
        self.mutate(tenant, |record| record.state.log.clear()).await
    }

    async fn try_begin_deploy(&self, tenant: &TenantId) -> Result<bool, StoreError> {
        let mut records = self.records.write().await;
        let previous = records.get(tenant).cloned();
        let record = records.entry(tenant.clone()).or_default();
        if !record.state.status.can_start() {
            return Ok(false);
        }
        record.state.status = DeploymentStatus::Deploying;
        record.state.log.clear();
        record.updated_at = Some(Utc::now());
        self.commit(&mut records, tenant, previous).await?;
        Ok(true)
    }

    async fn append_log_if(
        &self,
        tenant: &TenantId,
        expected: DeploymentStatus,
        text: &str,
    ) -> Result<bool, StoreError> {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(tenant) else {
            return Ok(false);
        };
        if record.state.status != expected {
            return Ok(false);
        }
        let previous = Some(record.clone());
        push_line(&mut record.state.log, text);
        record.updated_at = Some(Utc::now());
        self.commit(&mut records, tenant, previous).await?;
        Ok(true)
    }
}

fn push_line(log: &mut String, text: &str) {
    log.push_str(text);
    log.push('\n');
}

/// 从文件加载记录，文件不存在时返回空集合
async fn load_records(path: &Path) -> Result<BTreeMap<TenantId, TenantRecord>, StoreError> {
    if !fs::try_exists(path).await.unwrap_or(false) {
        info!(path = %path.display(), "No deployment records yet, starting empty");
        return Ok(BTreeMap::new());
    }

    let content = fs::read_to_string(path)
        .await
        .map_err(|e| StoreError::Persist(format!("read {}: {}", path.display(), e)))?;
    let persisted: PersistedRecords = serde_json::from_str(&content)
        .map_err(|e| StoreError::Persist(format!("parse {}: {}", path.display(), e)))?;

    info!(
        path = %path.display(),
        tenants = persisted.tenants.len(),
        saved_at = %persisted.saved_at,
        "Loaded deployment records"
    );
    Ok(persisted.tenants)
}

async fn write_atomic(path: &Path, snapshot: &PersistedRecords) -> std::io::Result<()> {
    let temp_path = path.with_extension("json.tmp");

    // 确保目录存在
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let content = serde_json::to_string_pretty(snapshot)?;
    fs::write(&temp_path, &content).await?;

    // 原子重命名
    fs::rename(&temp_path, path).await
}
