//! 认证与租户身份 Extractor
//!
//! 认证本身由外部认证层完成。它使用共享的 `x-api-key` 调用本服务，
//! 并通过以下 header 转发租户身份：
//! - `x-tenant-id`：租户 ID（必需）
//! - `x-tenant-name`：用户名，用于派生目录名（缺省时使用 ID）
//! - `x-tenant-verified`：是否已被管理员验证（`true` / `1`）

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::HeaderMap, request::Parts},
};
use std::sync::Arc;

use crate::domain::Tenant;
use crate::error::ApiError;
use crate::state::AppState;

pub const TENANT_ID_HEADER: &str = "x-tenant-id";
pub const TENANT_NAME_HEADER: &str = "x-tenant-name";
pub const TENANT_VERIFIED_HEADER: &str = "x-tenant-verified";

/// 验证 API Key
///
/// 检查 `x-api-key` header 是否与配置的 API key 匹配
pub fn verify_api_key(headers: &HeaderMap, expected_key: &str) -> Result<(), ApiError> {
    let provided_key = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok());

    match provided_key {
        Some(key) if key == expected_key => Ok(()),
        Some(_) => {
            tracing::warn!("Invalid API key provided");
            Err(ApiError::unauthorized())
        }
        None => {
            tracing::warn!("Missing x-api-key header");
            Err(ApiError::unauthorized())
        }
    }
}

/// 已认证租户（未验证也允许）
///
/// 用于 GET config、GET status 和 POST analyze
#[derive(Debug, Clone)]
pub struct TenantIdentity(pub Tenant);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for TenantIdentity {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        verify_api_key(&parts.headers, &state.api_key)?;
        tenant_from_headers(&parts.headers).map(TenantIdentity)
    }
}

/// 已验证租户
///
/// 用于修改配置、开始、停止和取消部署；未验证返回 403
#[derive(Debug, Clone)]
pub struct VerifiedTenant(pub Tenant);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for VerifiedTenant {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let TenantIdentity(tenant) = TenantIdentity::from_request_parts(parts, state).await?;
        require_verified(tenant).map(VerifiedTenant)
    }
}

/// 从转发 header 解析租户身份
pub fn tenant_from_headers(headers: &HeaderMap) -> Result<Tenant, ApiError> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    let Some(id) = header(TENANT_ID_HEADER) else {
        tracing::warn!("Missing x-tenant-id header");
        return Err(ApiError::unauthorized());
    };
    let name = header(TENANT_NAME_HEADER).unwrap_or(id);
    let verified = header(TENANT_VERIFIED_HEADER)
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false);

    Ok(Tenant::new(id, name, verified))
}

pub fn require_verified(tenant: Tenant) -> Result<Tenant, ApiError> {
    if tenant.verified {
        Ok(tenant)
    } else {
        tracing::warn!(tenant = %tenant.id, "Rejected unverified tenant");
        Err(ApiError::forbidden(
            "Account not verified yet. Please contact an administrator.",
        ))
    }
}
