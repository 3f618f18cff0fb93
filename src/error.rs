//! 统一错误处理
//!
//! - `DeployError`：编排器对外暴露的错误分类
//! - `ApiError`：实现 `IntoResponse`，统一 `{error, message}` 响应体

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::domain::ValidationError;
use crate::infra::AnalysisError;
use crate::services::deploy::{BuildDeployError, SyncError};
use crate::state::StoreError;

/// 编排器错误
#[derive(Debug, Error)]
pub enum DeployError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// 子域名冲突或部署已在进行
    #[error("{0}")]
    Conflict(String),

    #[error("Please configure a repository and subdomain first.")]
    NotConfigured,

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("No Dockerfile found in the repository root.")]
    MissingBuildRecipe,

    #[error(transparent)]
    Engine(#[from] BuildDeployError),

    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    #[error("Deployment cancelled.")]
    Cancelled,

    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record store error: {0}")]
    Store(String),
}

impl From<StoreError> for DeployError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::SubdomainTaken(_) => DeployError::Conflict(e.to_string()),
            StoreError::Persist(msg) => DeployError::Store(msg),
        }
    }
}

/// API 错误响应结构
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }
}

/// 统一 API 错误类型
#[derive(Debug)]
pub enum ApiError {
    /// 401 - 未授权（API Key 无效或缺失，或缺少租户身份）
    Unauthorized,
    /// 403 - 租户未验证
    Forbidden(String),
    /// 400 - 请求无效
    BadRequest(String),
    /// 409 - 冲突（子域名已占用、部署已在进行）
    Conflict(String),
    /// 502 - 外部分析接口失败
    BadGateway(String),
    /// 500 - 内部错误
    Internal(String),
}

impl ApiError {
    pub fn unauthorized() -> Self {
        Self::Unauthorized
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    /// HTTP 状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<DeployError> for ApiError {
    fn from(e: DeployError) -> Self {
        match e {
            DeployError::Validation(_) | DeployError::NotConfigured => {
                ApiError::BadRequest(e.to_string())
            }
            DeployError::Conflict(msg) => ApiError::Conflict(msg),
            DeployError::Analysis(AnalysisError::MissingKey) => ApiError::BadRequest(e.to_string()),
            DeployError::Analysis(inner) => {
                ApiError::BadGateway(format!("Failure analysis failed: {}", inner))
            }
            DeployError::Engine(BuildDeployError::Stop { ref output }) => {
                let detail = output.lines().last().unwrap_or_default().to_string();
                if detail.is_empty() {
                    ApiError::Internal("Failed to stop the project.".to_string())
                } else {
                    ApiError::Internal(format!("Failed to stop the project: {}", detail))
                }
            }
            DeployError::Engine(inner) => {
                ApiError::Internal(format!("Failed to stop the project: {}", inner))
            }
            other => {
                tracing::error!(error = %other, "Unexpected deployment error");
                ApiError::Internal("Internal server error.".to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let (error_type, message) = match self {
            ApiError::Unauthorized => ("unauthorized", "Invalid or missing API key".to_string()),
            ApiError::Forbidden(msg) => ("forbidden", msg),
            ApiError::BadRequest(msg) => ("bad_request", msg),
            ApiError::Conflict(msg) => ("conflict", msg),
            ApiError::BadGateway(msg) => ("bad_gateway", msg),
            ApiError::Internal(msg) => ("internal_error", msg),
        };

        let body = ErrorResponse::new(error_type, message);
        (status, Json(body)).into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Unauthorized => write!(f, "Unauthorized"),
            ApiError::Forbidden(m) => write!(f, "Forbidden: {}", m),
            ApiError::BadRequest(m) => write!(f, "Bad request: {}", m),
            ApiError::Conflict(m) => write!(f, "Conflict: {}", m),
            ApiError::BadGateway(m) => write!(f, "Bad gateway: {}", m),
            ApiError::Internal(m) => write!(f, "Internal error: {}", m),
        }
    }
}

impl std::error::Error for ApiError {}

/// 便捷类型别名
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_new() {
        let resp = ErrorResponse::new("test_error", "Test message");
        assert_eq!(resp.error, "test_error");
        assert_eq!(resp.message, "Test message");
    }

    #[test]
    fn test_deploy_error_status_mapping() {
        let cases = [
            (DeployError::Validation(ValidationError::InvalidRepoUrl), StatusCode::BAD_REQUEST),
            (DeployError::NotConfigured, StatusCode::BAD_REQUEST),
            (DeployError::Conflict("busy".to_string()), StatusCode::CONFLICT),
            (DeployError::Analysis(AnalysisError::MissingKey), StatusCode::BAD_REQUEST),
            (DeployError::Analysis(AnalysisError::Timeout), StatusCode::BAD_GATEWAY),
            (DeployError::Store("disk full".to_string()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status_code(), expected);
        }
    }

    #[test]
    fn test_subdomain_taken_maps_to_conflict() {
        let err: DeployError = StoreError::SubdomainTaken("myapp".to_string()).into();
        assert!(matches!(err, DeployError::Conflict(ref m) if m.contains("myapp")));
    }

    #[test]
    fn test_internal_details_not_leaked() {
        let err = ApiError::from(DeployError::Store("/var/lib/secret path".to_string()));
        assert!(matches!(err, ApiError::Internal(ref m) if !m.contains("secret")));
    }

    #[test]
    fn test_stop_error_includes_last_output_line() {
        let err = ApiError::from(DeployError::Engine(BuildDeployError::Stop {
            output: "line one\nno such project".to_string(),
        }));
        assert!(matches!(err, ApiError::Internal(ref m) if m.ends_with("no such project")));
    }
}
