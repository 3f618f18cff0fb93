//! 部署配置校验
//!
//! 纯函数校验，无 I/O。遇到第一个错误即返回（fail-fast），
//! 错误信息直接展示给用户。

use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

use super::deploy::TenantDeploymentConfig;

/// 默认容器端口
pub const DEFAULT_CONTAINER_PORT: u16 = 80;

/// 子域名最大长度（DNS label）
pub const MAX_SUBDOMAIN_LEN: usize = 63;

/// 保留子域名（另外还会保留服务自身域名的第一段）
pub const RESERVED_SUBDOMAINS: &[&str] = &["www", "mail", "ftp", "admin", "api", "demo"];

/// 仅允许 HTTPS 远程仓库：`https://<host>.<tld>[/path...][.git]`
pub const REPO_URL_PATTERN: &str =
    r"(?i)^https://[a-z0-9_.-]+\.[a-z]{2,}(/[a-z0-9_.@:~/-]+)*(\.git)?$";

/// DNS label：字母数字开头结尾，中间可含连字符
pub const SUBDOMAIN_PATTERN: &str = r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$";

static REPO_URL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(REPO_URL_PATTERN).expect("repository URL regex is valid"));

static SUBDOMAIN_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(SUBDOMAIN_PATTERN).expect("subdomain regex is valid"));

/// 配置校验错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid Git repository URL. Only HTTPS URLs are allowed.")]
    InvalidRepoUrl,

    #[error("Invalid subdomain. Only lowercase letters, digits and inner hyphens are allowed (max 63 characters).")]
    InvalidSubdomain,

    #[error("The subdomain '{0}' is reserved.")]
    ReservedSubdomain(String),

    #[error("Invalid port {0} (allowed range 1-65535).")]
    InvalidPort(i64),

    #[error("Invalid analysis API key: it must not contain whitespace or control characters.")]
    InvalidAnalysisKey,

    #[error("Cannot derive a deployment directory name from this account.")]
    InvalidTenantIdentity,
}

/// 用户提交的原始配置
#[derive(Debug, Clone, Default)]
pub struct ConfigInput {
    pub repo_url: Option<String>,
    pub subdomain: Option<String>,
    /// 原样保留字符串，解析失败时回退为默认端口
    pub port: Option<String>,
    pub analysis_api_key: Option<String>,
}

/// 通过校验的配置，只能由 [`ConfigValidator::validate`] 构造
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidConfig(TenantDeploymentConfig);

impl ValidConfig {
    pub fn as_config(&self) -> &TenantDeploymentConfig {
        &self.0
    }

    pub fn into_inner(self) -> TenantDeploymentConfig {
        self.0
    }
}

/// 配置校验器
#[derive(Debug, Clone)]
pub struct ConfigValidator {
    reserved: Vec<String>,
}

impl ConfigValidator {
    /// 创建校验器，`base_domain` 的第一段（如 `example.com` 中的 `example`）也被保留
    pub fn new(base_domain: &str) -> Self {
        let mut reserved: Vec<String> = RESERVED_SUBDOMAINS.iter().map(|s| s.to_string()).collect();
        if let Some(label) = base_domain
            .trim()
            .split('.')
            .next()
            .map(|l| l.to_ascii_lowercase())
            .filter(|l| !l.is_empty())
        {
            if !reserved.contains(&label) {
                reserved.push(label);
            }
        }
        Self { reserved }
    }

    /// 校验完整配置，返回第一个错误
    pub fn validate(&self, input: &ConfigInput) -> Result<ValidConfig, ValidationError> {
        let repo_url = validate_repo_url(input.repo_url.as_deref().unwrap_or_default())?;
        let subdomain = self.validate_subdomain(input.subdomain.as_deref().unwrap_or_default())?;
        let port = parse_port(input.port.as_deref())?;
        let analysis_api_key = validate_analysis_key(input.analysis_api_key.as_deref())?;

        Ok(ValidConfig(TenantDeploymentConfig {
            repo_url,
            subdomain,
            port,
            analysis_api_key,
        }))
    }

    /// 规范化（trim + 小写）后校验子域名
    pub fn validate_subdomain(&self, raw: &str) -> Result<String, ValidationError> {
        let subdomain = normalize_subdomain(raw);
        if !is_dns_label(&subdomain) {
            return Err(ValidationError::InvalidSubdomain);
        }
        if self.is_reserved(&subdomain) {
            return Err(ValidationError::ReservedSubdomain(subdomain));
        }
        Ok(subdomain)
    }

    pub fn is_reserved(&self, subdomain: &str) -> bool {
        self.reserved.iter().any(|r| r == subdomain)
    }
}

/// 校验仓库 URL，返回去除首尾空白后的 URL
pub fn validate_repo_url(raw: &str) -> Result<String, ValidationError> {
    let url = raw.trim();
    // 非 ASCII 一律拒绝，避免大小写折叠匹配到 Unicode 变体
    if url.is_empty() || !url.is_ascii() {
        return Err(ValidationError::InvalidRepoUrl);
    }
    if REPO_URL_REGEX.is_match(url) {
        Ok(url.to_string())
    } else {
        Err(ValidationError::InvalidRepoUrl)
    }
}

pub fn normalize_subdomain(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// 严格的 DNS label 语法检查（不做规范化，大写视为非法）
pub fn is_dns_label(label: &str) -> bool {
    label.len() <= MAX_SUBDOMAIN_LEN && SUBDOMAIN_REGEX.is_match(label)
}

/// 解析端口：缺失或无法解析时使用默认值 80，超出 [1, 65535] 报错
///
/// 超出 i64 的纯数字同样视为越界，而不是无法解析
pub fn parse_port(raw: Option<&str>) -> Result<u16, ValidationError> {
    let Some(text) = raw.map(str::trim) else {
        return Ok(DEFAULT_CONTAINER_PORT);
    };
    let value = match text.parse::<i64>() {
        Ok(value) => value,
        Err(_) if is_integer_literal(text) => {
            let clamped = if text.starts_with('-') { i64::MIN } else { i64::MAX };
            return Err(ValidationError::InvalidPort(clamped));
        }
        Err(_) => return Ok(DEFAULT_CONTAINER_PORT),
    };
    if (1..=i64::from(u16::MAX)).contains(&value) {
        Ok(value as u16)
    } else {
        Err(ValidationError::InvalidPort(value))
    }
}

/// 可带正负号的十进制整数
fn is_integer_literal(text: &str) -> bool {
    let digits = text.strip_prefix(&['+', '-'][..]).unwrap_or(text);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// API key 会作为 HTTP header 发出，不允许空白和控制字符
fn validate_analysis_key(raw: Option<&str>) -> Result<Option<String>, ValidationError> {
    let Some(key) = raw.map(str::trim).filter(|k| !k.is_empty()) else {
        return Ok(None);
    };
    if key.chars().all(|c| c.is_ascii_graphic()) {
        Ok(Some(key.to_string()))
    } else {
        Err(ValidationError::InvalidAnalysisKey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(repo: &str, subdomain: &str, port: Option<&str>) -> ConfigInput {
        ConfigInput {
            repo_url: Some(repo.to_string()),
            subdomain: Some(subdomain.to_string()),
            port: port.map(str::to_string),
            analysis_api_key: None,
        }
    }

    #[test]
    fn test_accepts_https_urls() {
        for url in [
            "https://github.com/org/app.git",
            "https://github.com/org/app",
            "HTTPS://GitLab.Example.org/group/sub-group/my_app.git",
            "https://codeberg.org/user/repo",
            "https://example.com",
            "  https://example.com/org/app.git  ",
        ] {
            assert!(validate_repo_url(url).is_ok(), "expected {url} to be accepted");
        }
        assert_eq!(
            validate_repo_url(" https://example.com/org/app.git ").unwrap(),
            "https://example.com/org/app.git"
        );
    }

    #[test]
    fn test_rejects_non_https_urls() {
        for url in [
            "http://github.com/org/app.git",
            "git@github.com:org/app.git",
            "ssh://git@github.com/org/app.git",
            "file:///etc/passwd",
            "/srv/repos/app",
            "ext::sh -c touch% /tmp/pwned",
            "https://localhost/app",
            "https://github.com/org/app;rm -rf",
            "https://github.com/org/$(id)",
            "https://user@github.com/org/app",
            "https://gіthub.com/org/app",
            "",
        ] {
            assert_eq!(
                validate_repo_url(url),
                Err(ValidationError::InvalidRepoUrl),
                "expected {url} to be rejected"
            );
        }
    }

    #[test]
    fn test_dns_label_grammar() {
        assert!(is_dns_label("myapp"));
        assert!(is_dns_label("a"));
        assert!(is_dns_label("my-app-2"));
        assert!(is_dns_label(&"a".repeat(63)));

        assert!(!is_dns_label(""));
        assert!(!is_dns_label("-myapp"));
        assert!(!is_dns_label("myapp-"));
        assert!(!is_dns_label("MyApp"));
        assert!(!is_dns_label("my_app"));
        assert!(!is_dns_label("my.app"));
        assert!(!is_dns_label(&"a".repeat(64)));
    }

    #[test]
    fn test_subdomain_is_normalized() {
        let validator = ConfigValidator::new("example.com");
        assert_eq!(validator.validate_subdomain("  MyApp ").unwrap(), "myapp");
        assert_eq!(
            validator.validate_subdomain("-bad"),
            Err(ValidationError::InvalidSubdomain)
        );
        assert_eq!(
            validator.validate_subdomain(&"b".repeat(64)),
            Err(ValidationError::InvalidSubdomain)
        );
        assert_eq!(validator.validate_subdomain("   "), Err(ValidationError::InvalidSubdomain));
    }

    #[test]
    fn test_reserved_subdomains() {
        let validator = ConfigValidator::new("hackspace.dev");
        for name in ["www", "admin", "api", "mail", "ftp", "demo", "hackspace", "WWW"] {
            assert!(
                matches!(
                    validator.validate_subdomain(name),
                    Err(ValidationError::ReservedSubdomain(_))
                ),
                "expected {name} to be reserved"
            );
        }
        assert!(validator.validate_subdomain("myapp").is_ok());
    }

    #[test]
    fn test_port_parsing() {
        assert_eq!(parse_port(Some("abc")), Ok(80));
        assert_eq!(parse_port(None), Ok(80));
        assert_eq!(parse_port(Some("")), Ok(80));
        assert_eq!(parse_port(Some("8080")), Ok(8080));
        assert_eq!(parse_port(Some(" 3000 ")), Ok(3000));
        assert_eq!(parse_port(Some("1")), Ok(1));
        assert_eq!(parse_port(Some("65535")), Ok(65535));
        assert_eq!(parse_port(Some("70000")), Err(ValidationError::InvalidPort(70000)));
        assert_eq!(parse_port(Some("0")), Err(ValidationError::InvalidPort(0)));
        assert_eq!(parse_port(Some("-5")), Err(ValidationError::InvalidPort(-5)));
        assert_eq!(parse_port(Some("+8080")), Ok(8080));
        assert_eq!(parse_port(Some("80a")), Ok(80));
        assert_eq!(parse_port(Some("-")), Ok(80));
    }

    #[test]
    fn test_port_beyond_i64_is_out_of_range() {
        assert!(matches!(
            parse_port(Some("99999999999999999999")),
            Err(ValidationError::InvalidPort(_))
        ));
        assert!(matches!(
            parse_port(Some(" -99999999999999999999 ")),
            Err(ValidationError::InvalidPort(_))
        ));
    }

    #[test]
    fn test_patterns_compile() {
        assert!(Regex::new(REPO_URL_PATTERN).is_ok());
        assert!(Regex::new(SUBDOMAIN_PATTERN).is_ok());
    }

    #[test]
    fn test_validate_full_config() {
        let validator = ConfigValidator::new("example.com");
        let mut raw = input("https://example.com/org/app.git", "MyApp", Some("3000"));
        raw.analysis_api_key = Some("  sk-test-123 ".to_string());

        let valid = validator.validate(&raw).unwrap().into_inner();
        assert_eq!(valid.repo_url, "https://example.com/org/app.git");
        assert_eq!(valid.subdomain, "myapp");
        assert_eq!(valid.port, 3000);
        assert_eq!(valid.analysis_api_key.as_deref(), Some("sk-test-123"));
    }

    #[test]
    fn test_validate_is_fail_fast() {
        let validator = ConfigValidator::new("example.com");
        // URL、子域名、端口都非法时只报告第一个
        let raw = input("ftp://nope", "-", Some("0"));
        assert_eq!(validator.validate(&raw), Err(ValidationError::InvalidRepoUrl));

        let raw = input("https://example.com/a", "api", Some("0"));
        assert_eq!(
            validator.validate(&raw),
            Err(ValidationError::ReservedSubdomain("api".to_string()))
        );
    }

    #[test]
    fn test_missing_fields_are_rejected() {
        let validator = ConfigValidator::new("example.com");
        assert_eq!(
            validator.validate(&ConfigInput::default()),
            Err(ValidationError::InvalidRepoUrl)
        );
    }

    #[test]
    fn test_analysis_key_rules() {
        assert_eq!(validate_analysis_key(None), Ok(None));
        assert_eq!(validate_analysis_key(Some("   ")), Ok(None));
        assert_eq!(
            validate_analysis_key(Some("sk-ant\nx-injected: 1")),
            Err(ValidationError::InvalidAnalysisKey)
        );
    }
}
