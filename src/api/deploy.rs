//! 部署管理 API
//!
//! 包含 /deploy/config, /deploy/start, /deploy/status, /deploy/stop,
//! /deploy/analyze, /deploy/cancel 端点。租户身份来自外部认证层转发的 header。

use axum::{
    extract::State,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::config::env::constants::STATUS_POLL_INTERVAL_MS;
use crate::domain::validation::DEFAULT_CONTAINER_PORT;
use crate::domain::{ConfigInput, DeploymentStatus};
use crate::error::ApiResult;
use crate::middleware::{TenantIdentity, VerifiedTenant};
use crate::state::AppState;

/// 端口接受任意 JSON 值，原样转成字符串交给校验器
///
/// 小数、布尔等无法解析的值由校验器回退为默认端口
fn port_to_raw(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

/// 保存配置请求
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveConfigRequest {
    #[serde(default, alias = "gitRepo")]
    pub repo_url: Option<String>,
    #[serde(default)]
    pub subdomain: Option<String>,
    #[serde(default, alias = "appPort")]
    pub port: Option<Value>,
    #[serde(default, alias = "aiApiKey")]
    pub analysis_api_key: Option<String>,
}

impl From<SaveConfigRequest> for ConfigInput {
    fn from(req: SaveConfigRequest) -> Self {
        ConfigInput {
            repo_url: req.repo_url,
            subdomain: req.subdomain,
            port: req.port.map(port_to_raw),
            analysis_api_key: req.analysis_api_key,
        }
    }
}

/// 配置与状态响应
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigResponse {
    pub repo_url: String,
    pub subdomain: String,
    pub port: u16,
    pub status: DeploymentStatus,
    pub log: String,
    pub has_analysis_key: bool,
    pub is_verified: bool,
}

/// 状态轮询响应
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: DeploymentStatus,
    pub log: String,
    /// 部署中时建议的轮询间隔
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

impl MessageResponse {
    fn new(message: &str) -> Self {
        Self {
            message: message.to_string(),
            run_id: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AnalysisResponse {
    pub analysis: String,
}

/// 创建部署管理路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/deploy/config", get(get_config).post(save_config))
        .route("/deploy/start", post(start_deploy))
        .route("/deploy/status", get(get_status))
        .route("/deploy/stop", post(stop_deploy))
        .route("/deploy/analyze", post(analyze_failure))
        .route("/deploy/cancel", post(cancel_deploy))
}

/// 获取配置和状态
///
/// GET /deploy/config
async fn get_config(
    TenantIdentity(tenant): TenantIdentity,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let config = state.orchestrator.config(&tenant.id).await;
    let deployment = state.orchestrator.status(&tenant.id).await;

    let (repo_url, subdomain, port, has_analysis_key) = match config {
        Some(c) => {
            let has_key = c.has_analysis_key();
            (c.repo_url, c.subdomain, c.port, has_key)
        }
        None => (String::new(), String::new(), DEFAULT_CONTAINER_PORT, false),
    };

    Json(ConfigResponse {
        repo_url,
        subdomain,
        port,
        status: deployment.status,
        log: deployment.log,
        has_analysis_key,
        is_verified: tenant.verified,
    })
}

/// 保存配置
///
/// POST /deploy/config
async fn save_config(
    VerifiedTenant(tenant): VerifiedTenant,
    State(state): State<Arc<AppState>>,
    Json(request): Json<SaveConfigRequest>,
) -> ApiResult<impl IntoResponse> {
    state
        .orchestrator
        .save_config(&tenant, &request.into())
        .await?;
    Ok(Json(MessageResponse::new("Configuration saved.")))
}

/// 开始部署（立即返回，部署在后台执行）
///
/// POST /deploy/start
async fn start_deploy(
    VerifiedTenant(tenant): VerifiedTenant,
    State(state): State<Arc<AppState>>,
) -> ApiResult<impl IntoResponse> {
    let run_id = state.orchestrator.start(&tenant).await?;
    Ok(Json(MessageResponse {
        message: "Deployment started.".to_string(),
        run_id: Some(run_id),
    }))
}

/// 轮询状态
///
/// GET /deploy/status
async fn get_status(
    TenantIdentity(tenant): TenantIdentity,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let deployment = state.orchestrator.status(&tenant.id).await;
    let poll_interval_ms =
        (deployment.status == DeploymentStatus::Deploying).then_some(STATUS_POLL_INTERVAL_MS);

    Json(StatusResponse {
        status: deployment.status,
        log: deployment.log,
        poll_interval_ms,
    })
}

/// 停止项目
///
/// POST /deploy/stop
async fn stop_deploy(
    VerifiedTenant(tenant): VerifiedTenant,
    State(state): State<Arc<AppState>>,
) -> ApiResult<impl IntoResponse> {
    state.orchestrator.stop(&tenant).await?;
    Ok(Json(MessageResponse::new("Project stopped.")))
}

/// 失败分析
///
/// POST /deploy/analyze
async fn analyze_failure(
    TenantIdentity(tenant): TenantIdentity,
    State(state): State<Arc<AppState>>,
) -> ApiResult<impl IntoResponse> {
    let analysis = state.orchestrator.analyze(&tenant.id).await?;
    Ok(Json(AnalysisResponse { analysis }))
}

/// 取消进行中的部署
///
/// POST /deploy/cancel
async fn cancel_deploy(
    VerifiedTenant(tenant): VerifiedTenant,
    State(state): State<Arc<AppState>>,
) -> ApiResult<impl IntoResponse> {
    state.orchestrator.cancel(&tenant.id).await?;
    Ok(Json(MessageResponse::new("Cancellation requested.")))
}
