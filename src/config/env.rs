//! 环境变量配置加载

use std::env;
use std::path::PathBuf;
use tracing::warn;

/// 环境配置
#[derive(Clone, Debug)]
pub struct EnvConfig {
    /// 外部认证层与本服务之间的共享密钥
    pub api_key: String,
    /// 服务监听端口
    pub port: u16,
    /// 租户目录根路径
    pub base_path: PathBuf,
    /// 记录存储目录（deployments.json 所在目录）
    pub data_dir: PathBuf,
    /// 服务根域名
    pub base_domain: String,
    /// 反向代理所在的外部 Docker 网络
    pub proxy_network: String,
    /// 同时运行的部署上限
    pub max_concurrent_builds: usize,
    /// 失败分析配置
    pub analysis: AnalysisConfig,
}

/// 失败分析接口配置
#[derive(Clone, Debug)]
pub struct AnalysisConfig {
    pub endpoint: String,
    pub model: String,
}

impl EnvConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Self {
        // API Key - 支持旧名称兼容
        let api_key = load_with_fallback("DEPLOY_AGENT_API_KEY", "API_KEY")
            .unwrap_or_else(|| "change-me-in-production".to_string());
        if env::var("DEPLOY_AGENT_API_KEY").is_err() && env::var("API_KEY").is_ok() {
            warn!("Deprecated environment variable API_KEY detected. Please use DEPLOY_AGENT_API_KEY");
        }

        let port = env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3000);

        let base_path = env::var("DEPLOY_BASE_PATH")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(constants::DEFAULT_BASE_PATH));

        let data_dir = env::var("DEPLOY_DATA_DIR")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| base_path.clone());

        let base_domain = env::var("DEPLOY_BASE_DOMAIN")
            .ok()
            .map(|v| v.trim().trim_matches('.').to_ascii_lowercase())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "example.com".to_string());

        let proxy_network = env::var("DEPLOY_PROXY_NETWORK")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "web".to_string());

        let max_concurrent_builds = env::var("DEPLOY_MAX_CONCURRENT_BUILDS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(constants::DEFAULT_MAX_CONCURRENT_BUILDS);

        let analysis = AnalysisConfig::from_env();

        Self {
            api_key,
            port,
            base_path,
            data_dir,
            base_domain,
            proxy_network,
            max_concurrent_builds,
            analysis,
        }
    }

    /// 记录存储文件路径
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join(constants::STORE_FILE_NAME)
    }
}

impl AnalysisConfig {
    pub fn from_env() -> Self {
        let endpoint = env::var("ANALYSIS_API_URL")
            .unwrap_or_else(|_| "https://api.anthropic.com/v1/messages".to_string());
        let model = env::var("ANALYSIS_MODEL").unwrap_or_else(|_| "claude-sonnet-4-20250514".to_string());
        Self { endpoint, model }
    }
}

/// 加载环境变量，支持 fallback
fn load_with_fallback(primary: &str, fallback: &str) -> Option<String> {
    env::var(primary).ok().or_else(|| env::var(fallback).ok())
}

/// 常量
pub mod constants {
    use std::time::Duration;

    /// 默认租户目录根路径
    pub const DEFAULT_BASE_PATH: &str = "/srv/deployments";

    /// 记录存储文件名
    pub const STORE_FILE_NAME: &str = "deployments.json";

    /// 默认并发部署上限
    pub const DEFAULT_MAX_CONCURRENT_BUILDS: usize = 2;

    /// 单次部署总超时（30 分钟）
    pub const DEPLOY_TIMEOUT: Duration = Duration::from_secs(1800);

    // git 操作超时
    pub const GIT_CLONE_TIMEOUT: Duration = Duration::from_secs(120);
    pub const GIT_FETCH_TIMEOUT: Duration = Duration::from_secs(120);
    pub const GIT_STATUS_TIMEOUT: Duration = Duration::from_secs(10);
    pub const GIT_CLEAN_TIMEOUT: Duration = Duration::from_secs(15);
    pub const GIT_REV_PARSE_TIMEOUT: Duration = Duration::from_secs(5);
    pub const GIT_RESET_TIMEOUT: Duration = Duration::from_secs(30);

    // 容器引擎操作超时
    pub const BUILD_TIMEOUT: Duration = Duration::from_secs(600);
    pub const UP_TIMEOUT: Duration = Duration::from_secs(120);
    pub const DOWN_TIMEOUT: Duration = Duration::from_secs(60);

    /// 失败分析请求超时
    pub const ANALYSIS_TIMEOUT: Duration = Duration::from_secs(30);

    /// 发送给分析接口的日志末尾字符数
    pub const ANALYSIS_LOG_TAIL_CHARS: usize = 4000;

    /// 客户端建议轮询间隔（毫秒）
    pub const STATUS_POLL_INTERVAL_MS: u64 = 2000;

    /// 版本号
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}
