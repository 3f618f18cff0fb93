//! 编排描述文件生成
//!
//! 纯函数：相同输入必须产生逐字节相同的输出，每次部署前重新生成并写入日志。
//! 所有插值字段都按 YAML 双引号标量转义，存储的自由文本不会被原样嵌入。

use std::fmt::Write as _;
use std::path::Path;

use super::deploy::project_name;

/// 反向代理标签生成器
#[derive(Debug, Clone)]
pub struct DescriptorGenerator {
    /// 服务根域名，如 `example.com`
    base_domain: String,
    /// 反向代理所在的外部共享网络
    network: String,
}

impl DescriptorGenerator {
    pub fn new(base_domain: impl Into<String>, network: impl Into<String>) -> Self {
        Self {
            base_domain: base_domain.into(),
            network: network.into(),
        }
    }

    /// 租户对外可访问的主机名
    pub fn public_host(&self, subdomain: &str) -> String {
        format!("{}.{}", subdomain, self.base_domain)
    }

    /// 租户对外可访问的 URL
    pub fn public_url(&self, subdomain: &str) -> String {
        format!("https://{}", self.public_host(subdomain))
    }

    /// 渲染单服务 compose 描述
    pub fn render(&self, tenant_slug: &str, subdomain: &str, work_dir: &Path, port: u16) -> String {
        let mut out = String::new();
        out.push_str("# Generated by tenant-deploy. Regenerated before every deployment; do not edit.\n");
        out.push_str("services:\n");
        out.push_str("  app:\n");
        let _ = writeln!(out, "    build: {}", yaml_quote(&work_dir.to_string_lossy()));
        let _ = writeln!(out, "    container_name: {}", yaml_quote(&project_name(tenant_slug)));
        out.push_str("    restart: unless-stopped\n");
        out.push_str("    networks:\n");
        let _ = writeln!(out, "      - {}", yaml_quote(&self.network));
        out.push_str("    labels:\n");
        let _ = writeln!(out, "      caddy: {}", yaml_quote(&self.public_host(subdomain)));
        let _ = writeln!(
            out,
            "      caddy.reverse_proxy: {}",
            yaml_quote(&format!("{{{{upstreams {}}}}}", port))
        );
        out.push('\n');
        out.push_str("networks:\n");
        let _ = writeln!(out, "  {}:", yaml_quote(&self.network));
        out.push_str("    external: true\n");
        out
    }
}

/// 转义为 YAML 双引号标量
pub fn yaml_quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(out, "\\u{:04X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn generator() -> DescriptorGenerator {
        DescriptorGenerator::new("example.com", "web")
    }

    #[test]
    fn test_render_is_deterministic() {
        let dir = PathBuf::from("/srv/deployments/alice/repo");
        let first = generator().render("alice", "myapp", &dir, 3000);
        let second = generator().render("alice", "myapp", &dir, 3000);
        assert_eq!(first, second);
    }

    #[test]
    fn test_render_contents() {
        let dir = PathBuf::from("/srv/deployments/alice/repo");
        let text = generator().render("alice", "myapp", &dir, 3000);

        assert!(text.contains("    build: \"/srv/deployments/alice/repo\"\n"));
        assert!(text.contains("    container_name: \"td-alice\"\n"));
        assert!(text.contains("    restart: unless-stopped\n"));
        assert!(text.contains("      - \"web\"\n"));
        assert!(text.contains("      caddy: \"myapp.example.com\"\n"));
        assert!(text.contains("      caddy.reverse_proxy: \"{{upstreams 3000}}\"\n"));
        assert!(text.contains("  \"web\":\n    external: true\n"));
    }

    #[test]
    fn test_render_varies_with_inputs() {
        let dir = PathBuf::from("/srv/deployments/alice/repo");
        let a = generator().render("alice", "myapp", &dir, 3000);
        let b = generator().render("alice", "myapp", &dir, 8080);
        assert_ne!(a, b);
    }

    #[test]
    fn test_render_escapes_untrusted_path() {
        let dir = PathBuf::from("/srv/x\"\n    privileged: true");
        let text = generator().render("alice", "myapp", &dir, 80);
        assert!(!text.contains("\n    privileged: true"));
        assert!(text.contains("build: \"/srv/x\\\"\\n    privileged: true\""));
    }

    #[test]
    fn test_yaml_quote() {
        assert_eq!(yaml_quote("plain"), "\"plain\"");
        assert_eq!(yaml_quote("a\\b"), "\"a\\\\b\"");
        assert_eq!(yaml_quote("tab\there"), "\"tab\\there\"");
        assert_eq!(yaml_quote("\u{7}"), "\"\\u0007\"");
    }

    #[test]
    fn test_public_url() {
        assert_eq!(generator().public_url("myapp"), "https://myapp.example.com");
    }
}
