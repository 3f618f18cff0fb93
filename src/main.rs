//! Tenant Deploy - 多租户一键部署引擎
//!
//! Usage:
//! - Normal mode: `tenant-deploy`
//! - With custom port: `tenant-deploy --port 8080`

use tenant_deploy::RuntimeConfig;

/// 解析命令行参数
fn parse_args() -> RuntimeConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = RuntimeConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" if i + 1 < args.len() => {
                config.port_override = args[i + 1].parse().ok();
                i += 2;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {
                i += 1;
            }
        }
    }

    config
}

fn print_help() {
    println!("Tenant Deploy - 多租户一键部署引擎");
    println!();
    println!("USAGE:");
    println!("    tenant-deploy [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --port <PORT>    Override the listening port");
    println!("    -h, --help       Print help information");
    println!();
    println!("ENVIRONMENT:");
    println!("    DEPLOY_AGENT_API_KEY         Shared key of the upstream auth layer");
    println!("    DEPLOY_BASE_PATH             Root of tenant directories (default /srv/deployments)");
    println!("    DEPLOY_BASE_DOMAIN           Public base domain (default example.com)");
    println!("    DEPLOY_PROXY_NETWORK         External proxy network (default web)");
    println!("    DEPLOY_DATA_DIR              Directory of deployments.json");
    println!("    DEPLOY_MAX_CONCURRENT_BUILDS Concurrent deployment cap (default 2)");
    println!("    PORT                         Listening port (default 3000)");
}

fn main() -> anyhow::Result<()> {
    let config = parse_args();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(tenant_deploy::init_and_run_with_config(config))
}
