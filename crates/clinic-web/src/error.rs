//! 错误到 HTTP 响应的映射

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use clinic_core::ClinicError;

use crate::response::ApiResponse;

/// 处理器边界上的错误
#[derive(Debug)]
pub struct ApiError(pub ClinicError);

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            ClinicError::Validation(_)
            | ClinicError::InvalidTransition { .. }
            | ClinicError::MissingReason(_) => StatusCode::BAD_REQUEST,
            ClinicError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ClinicError::Forbidden(_) => StatusCode::FORBIDDEN,
            ClinicError::NotFound(_) => StatusCode::NOT_FOUND,
            ClinicError::Conflict(_) => StatusCode::CONFLICT,
            ClinicError::Config(_)
            | ClinicError::Database(_)
            | ClinicError::Serialization(_)
            | ClinicError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ClinicError> for ApiError {
    fn from(err: ClinicError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        // 服务端错误只记录日志，不向客户端暴露细节
        let message = if self.0.is_client_error() {
            self.0.to_string()
        } else {
            tracing::error!(error = %self.0, "request failed");
            "Error interno del servidor".to_string()
        };
        (status, Json(ApiResponse::error(message))).into_response()
    }
}
