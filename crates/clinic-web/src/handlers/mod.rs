//! HTTP 处理器
//!
//! 每个处理器的流程相同：加载记录、访问守卫、调用工作流、以乐观锁保存。

pub mod budgets;
pub mod patients;
pub mod payment_links;
pub mod payments;
pub mod refunds;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use clinic_core::{AccessGuard, ClinicError, Patient, Result};
use clinic_database::ListParams;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::auth::Caller;
use crate::state::AppState;

/// 客户端携带的版本号与当前记录不一致时提前拒绝
pub(crate) fn check_version(sent: Option<i64>, current: i64) -> Result<()> {
    match sent {
        Some(version) if version != current => Err(ClinicError::Conflict(
            "El registro fue modificado por otro usuario; recarga e inténtalo de nuevo".to_string(),
        )),
        _ => Ok(()),
    }
}

/// `GET /search?q=`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchParams {
    pub q: Option<String>,
    pub limit: Option<u64>,
}

impl SearchParams {
    pub fn term(&self) -> Result<String> {
        self.q
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ClinicError::validation("El término de búsqueda es obligatorio"))
    }

    pub fn list_params(&self) -> ListParams {
        ListParams {
            limit: self.limit,
            ..Default::default()
        }
    }
}

/// 加载患者并检查调用方能否读取
pub(crate) async fn load_patient(state: &AppState, caller: &Caller, id: Uuid) -> Result<Patient> {
    let patient = state.repos.patients.fetch(id).await?;
    AccessGuard::ensure_can_read(caller, &patient)?;
    Ok(patient)
}

/// 健康检查
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let timestamp = chrono::Utc::now().to_rfc3339();
    match state.repos.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "timestamp": timestamp,
                "version": env!("CARGO_PKG_VERSION"),
            })),
        ),
        Err(e) => {
            tracing::error!(error = %e, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "timestamp": timestamp,
                    "version": env!("CARGO_PKG_VERSION"),
                })),
            )
        }
    }
}
