//! 统一响应格式 `{success, message?, data?, pagination?}`

use axum::http::StatusCode;
use axum::Json;
use clinic_core::Pagination;
use clinic_database::{ListParams, PageSettings};
use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<Pagination>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            message: None,
            data: Some(data),
            pagination: None,
        }
    }

    pub fn with_message(data: T, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::ok(data)
        }
    }

    /// 列表响应：分页信息与查询使用同一组参数计算
    pub fn paginated(data: T, params: &ListParams, settings: &PageSettings, total: u64) -> Self {
        Self {
            pagination: Some(Pagination::new(params.page(), params.limit(settings), total)),
            ..Self::ok(data)
        }
    }
}

impl ApiResponse<()> {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            data: None,
            pagination: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            ..Self::message(message)
        }
    }
}

pub type JsonResponse<T> = Json<ApiResponse<T>>;

/// 201 Created
pub fn created<T: Serialize>(data: T, message: &str) -> (StatusCode, JsonResponse<T>) {
    (StatusCode::CREATED, Json(ApiResponse::with_message(data, message)))
}
