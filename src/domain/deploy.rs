//! 部署相关领域模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 生成的编排描述文件名（与 repo 目录并列）
pub const DESCRIPTOR_FILE_NAME: &str = "docker-compose.generated.yml";

/// 工作副本子目录名
pub const REPO_DIR_NAME: &str = "repo";

/// 容器/项目名前缀
pub const PROJECT_PREFIX: &str = "td-";

/// 租户标识（由外部认证层提供，不透明字符串）
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// 已认证的租户身份
#[derive(Clone, Debug)]
pub struct Tenant {
    pub id: TenantId,
    /// 用户名，用于派生目录名和容器名
    pub name: String,
    /// 是否已被管理员验证
    pub verified: bool,
}

impl Tenant {
    pub fn new(id: impl Into<String>, name: impl Into<String>, verified: bool) -> Self {
        Self {
            id: TenantId::new(id),
            name: name.into(),
            verified,
        }
    }

    /// 派生租户 slug：仅保留 ASCII 字母数字并转小写
    ///
    /// 用户名清洗后为空时回退到租户 ID；两者都为空返回 None
    pub fn slug(&self) -> Option<String> {
        [self.name.as_str(), self.id.as_str()]
            .into_iter()
            .map(sanitize_slug)
            .find(|s| !s.is_empty())
    }
}

fn sanitize_slug(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// 租户部署配置（仅能通过 ConfigValidator 校验后写入）
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantDeploymentConfig {
    pub repo_url: String,
    pub subdomain: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_api_key: Option<String>,
}

impl TenantDeploymentConfig {
    pub fn has_analysis_key(&self) -> bool {
        self.analysis_api_key.is_some()
    }
}

// 不在日志中泄露 API key
impl std::fmt::Debug for TenantDeploymentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantDeploymentConfig")
            .field("repo_url", &self.repo_url)
            .field("subdomain", &self.subdomain)
            .field("port", &self.port)
            .field(
                "analysis_api_key",
                &self.analysis_api_key.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// 部署状态
///
/// `none` → `deploying` → `running` | `error`；
/// `running` → `deploying` | `stopped`；`stopped` / `error` → `deploying`
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    #[default]
    None,
    Deploying,
    Running,
    Stopped,
    Error,
}

impl DeploymentStatus {
    /// 转换为字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::None => "none",
            DeploymentStatus::Deploying => "deploying",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Stopped => "stopped",
            DeploymentStatus::Error => "error",
        }
    }

    /// 是否允许开始新的部署（单飞保护）
    pub fn can_start(&self) -> bool {
        !matches!(self, DeploymentStatus::Deploying)
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 租户部署状态：状态 + 追加式日志
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentState {
    pub status: DeploymentStatus,
    pub log: String,
}

/// 租户在磁盘上的目录布局
///
/// `<base>/<slug>/repo` 为工作副本，描述文件与之并列
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TenantLayout {
    pub slug: String,
    pub root: PathBuf,
    pub repo_dir: PathBuf,
    pub descriptor_path: PathBuf,
}

impl TenantLayout {
    pub fn new(base_path: &Path, slug: &str) -> Self {
        let root = base_path.join(slug);
        Self {
            slug: slug.to_string(),
            repo_dir: root.join(REPO_DIR_NAME),
            descriptor_path: root.join(DESCRIPTOR_FILE_NAME),
            root,
        }
    }

    /// 容器引擎项目名，同时作为容器名
    pub fn project_name(&self) -> String {
        project_name(&self.slug)
    }
}

pub fn project_name(slug: &str) -> String {
    format!("{}{}", PROJECT_PREFIX, slug)
}

/// 阶段状态
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

/// 部署阶段信息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeployStage {
    /// 阶段标识 (e.g., "sync", "build", "up")
    pub name: String,
    /// 显示名称
    pub display_name: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// 持续时间（毫秒）
    pub duration_ms: Option<i64>,
    pub status: StageStatus,
}

impl DeployStage {
    /// 创建新的待执行阶段
    pub fn new(name: &str, display_name: &str) -> Self {
        Self {
            name: name.to_string(),
            display_name: display_name.to_string(),
            started_at: None,
            finished_at: None,
            duration_ms: None,
            status: StageStatus::Pending,
        }
    }

    /// 开始执行阶段
    pub fn start(&mut self) {
        self.started_at = Some(Utc::now());
        self.status = StageStatus::Running;
    }

    /// 完成阶段
    pub fn finish(&mut self, success: bool) {
        let now = Utc::now();
        self.finished_at = Some(now);
        self.status = if success {
            StageStatus::Success
        } else {
            StageStatus::Failed
        };
        if let Some(started) = self.started_at {
            self.duration_ms = Some((now - started).num_milliseconds());
        }
    }

    /// 跳过阶段
    pub fn skip(&mut self) {
        self.status = StageStatus::Skipped;
    }

    /// 阶段摘要行，如 `✓ Build (5321ms)`
    pub fn summary_line(&self) -> String {
        let duration = self
            .duration_ms
            .map(|d| format!("{}ms", d))
            .unwrap_or_else(|| "-".to_string());
        let icon = match self.status {
            StageStatus::Success => "✓",
            StageStatus::Failed => "✗",
            StageStatus::Skipped => "⊘",
            StageStatus::Running => "⟳",
            StageStatus::Pending => "○",
        };
        format!("{} {} ({})", icon, self.display_name, duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_as_str() {
        assert_eq!(DeploymentStatus::None.as_str(), "none");
        assert_eq!(DeploymentStatus::Deploying.as_str(), "deploying");
        assert_eq!(DeploymentStatus::Running.as_str(), "running");
        assert_eq!(DeploymentStatus::Stopped.as_str(), "stopped");
        assert_eq!(DeploymentStatus::Error.as_str(), "error");
    }

    #[test]
    fn test_only_deploying_blocks_start() {
        assert!(DeploymentStatus::None.can_start());
        assert!(DeploymentStatus::Running.can_start());
        assert!(DeploymentStatus::Stopped.can_start());
        assert!(DeploymentStatus::Error.can_start());
        assert!(!DeploymentStatus::Deploying.can_start());
    }

    #[test]
    fn test_status_serde_snake_case() {
        let json = serde_json::to_string(&DeploymentStatus::Deploying).unwrap();
        assert_eq!(json, "\"deploying\"");
        let parsed: DeploymentStatus = serde_json::from_str("\"stopped\"").unwrap();
        assert_eq!(parsed, DeploymentStatus::Stopped);
    }

    #[test]
    fn test_slug_strips_non_alphanumeric() {
        let tenant = Tenant::new("42", "Jane.Doe-99", true);
        assert_eq!(tenant.slug().as_deref(), Some("janedoe99"));
    }

    #[test]
    fn test_slug_falls_back_to_id() {
        let tenant = Tenant::new("u-17", "___", true);
        assert_eq!(tenant.slug().as_deref(), Some("u17"));

        let tenant = Tenant::new("--", "..", true);
        assert!(tenant.slug().is_none());
    }

    #[test]
    fn test_layout_paths() {
        let layout = TenantLayout::new(Path::new("/srv/deployments"), "alice");
        assert_eq!(layout.root, PathBuf::from("/srv/deployments/alice"));
        assert_eq!(layout.repo_dir, PathBuf::from("/srv/deployments/alice/repo"));
        assert_eq!(
            layout.descriptor_path,
            PathBuf::from("/srv/deployments/alice/docker-compose.generated.yml")
        );
        assert_eq!(layout.project_name(), "td-alice");
    }

    #[test]
    fn test_config_debug_redacts_key() {
        let config = TenantDeploymentConfig {
            repo_url: "https://example.com/org/app.git".to_string(),
            subdomain: "myapp".to_string(),
            port: 3000,
            analysis_api_key: Some("sk-secret".to_string()),
        };
        let debug = format!("{:?}", config);
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_deploy_stage_lifecycle() {
        let mut stage = DeployStage::new("build", "Build");
        assert_eq!(stage.status, StageStatus::Pending);
        assert!(stage.summary_line().starts_with("○ Build"));

        stage.start();
        assert_eq!(stage.status, StageStatus::Running);
        assert!(stage.started_at.is_some());

        stage.finish(true);
        assert_eq!(stage.status, StageStatus::Success);
        assert!(stage.duration_ms.is_some());
        assert!(stage.summary_line().starts_with("✓ Build ("));
    }
}
