//! 调用方身份与权限守卫
//!
//! 认证由上游网关完成，网关通过 `x-user-*` 请求头转发用户信息。

use std::ops::Deref;

use axum::async_trait;
use axum::extract::{FromRequestParts, MatchedPath, Request};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use axum::Json;
use clinic_core::policy::{navigation_for, NavItem};
use clinic_core::{CallerContext, ClinicError, Result, Role};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::response::{ApiResponse, JsonResponse};
use crate::routes;

pub const HEADER_USER_ID: &str = "x-user-id";
pub const HEADER_USER_NAME: &str = "x-user-name";
pub const HEADER_USER_ROLE: &str = "x-user-role";
pub const HEADER_USER_SEDE: &str = "x-user-sede";

/// 已解析的调用方
#[derive(Debug, Clone)]
pub struct Caller(pub CallerContext);

impl Deref for Caller {
    type Target = CallerContext;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// 读取请求头文本；允许 UTF-8 姓名
fn header_text(headers: &HeaderMap, name: &str) -> Result<Option<String>> {
    let Some(value) = headers.get(name) else {
        return Ok(None);
    };
    let text = String::from_utf8(value.as_bytes().to_vec())
        .map_err(|_| ClinicError::Unauthorized(format!("Cabecera {} no válida", name)))?;
    let text = text.trim();
    Ok((!text.is_empty()).then(|| text.to_string()))
}

fn required_header(headers: &HeaderMap, name: &str) -> Result<String> {
    header_text(headers, name)?
        .ok_or_else(|| ClinicError::Unauthorized(format!("Falta la cabecera {}", name)))
}

/// 从网关请求头构建调用方上下文，缺失或格式错误时返回 401
pub fn caller_from_headers(headers: &HeaderMap) -> Result<CallerContext> {
    let id = required_header(headers, HEADER_USER_ID)?
        .parse::<Uuid>()
        .map_err(|_| ClinicError::Unauthorized("Identificador de usuario no válido".to_string()))?;
    let nombre = required_header(headers, HEADER_USER_NAME)?;
    let role = required_header(headers, HEADER_USER_ROLE)?.parse::<Role>()?;
    let sede = header_text(headers, HEADER_USER_SEDE)?;
    if sede.is_none() && !role.is_global() {
        return Err(ClinicError::Unauthorized(
            "El usuario no tiene una sede asignada".to_string(),
        ));
    }
    Ok(CallerContext {
        id,
        nombre,
        role,
        sede,
    })
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> ApiResult<Self> {
        if let Some(caller) = parts.extensions.get::<Caller>() {
            return Ok(caller.clone());
        }
        Ok(Caller(caller_from_headers(&parts.headers)?))
    }
}

/// 路由守卫：按路由表检查调用方是否拥有该路由声明的权限
pub async fn require_permission(mut request: Request, next: Next) -> ApiResult<Response> {
    let caller = caller_from_headers(request.headers())?;
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_default();

    match routes::permission_for(request.method(), &path) {
        Some(Some(permission)) => caller.require(permission)?,
        Some(None) => {}
        None => {
            tracing::warn!(method = %request.method(), path = %path, "route without declared permission");
            return Err(ApiError(ClinicError::forbidden(
                "La ruta no tiene permisos declarados",
            )));
        }
    }

    request.extensions_mut().insert(Caller(caller));
    Ok(next.run(request).await)
}

/// 角色的权限与导航
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionsView {
    pub role: Role,
    pub permissions: &'static [&'static str],
    pub navegacion: Vec<&'static NavItem>,
}

/// GET /api/auth/me
pub async fn me(caller: Caller) -> JsonResponse<CallerContext> {
    Json(ApiResponse::ok(caller.0))
}

/// GET /api/auth/permissions
pub async fn permissions(caller: Caller) -> JsonResponse<PermissionsView> {
    Json(ApiResponse::ok(PermissionsView {
        role: caller.role,
        permissions: caller.role.permissions(),
        navegacion: navigation_for(caller.role),
    }))
}
