//! 请求提取器：解析失败时返回统一格式的 400 响应

use axum::async_trait;
use axum::extract::{FromRequest, FromRequestParts, Path, Query, Request};
use axum::http::request::Parts;
use axum::Json;
use clinic_core::ClinicError;
use serde::de::DeserializeOwned;

use crate::error::ApiError;

/// JSON 请求体
#[derive(Debug, Clone)]
pub struct ApiJson<T>(pub T);

/// 查询字符串
#[derive(Debug, Clone)]
pub struct ApiQuery<T>(pub T);

/// 路径参数
#[derive(Debug, Clone)]
pub struct ApiPath<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await.map_err(|e| {
            ApiError(ClinicError::validation(format!(
                "Cuerpo de la petición no válido: {}",
                e.body_text()
            )))
        })?;
        Ok(Self(value))
    }
}

#[async_trait]
impl<S, T> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state).await.map_err(|e| {
            ApiError(ClinicError::validation(format!(
                "Parámetros de consulta no válidos: {}",
                e.body_text()
            )))
        })?;
        Ok(Self(value))
    }
}

#[async_trait]
impl<S, T> FromRequestParts<S> for ApiPath<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(value) = Path::<T>::from_request_parts(parts, state).await.map_err(|e| {
            ApiError(ClinicError::validation(format!(
                "Parámetro de ruta no válido: {}",
                e.body_text()
            )))
        })?;
        Ok(Self(value))
    }
}
