//! 退款接口

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use clinic_core::refund::{NewRefund, RefundStatusRequest, RefundSummary, RefundUpdate, RefundView};
use clinic_core::{AccessGuard, ClinicError, Payment, Refund, RefundStatus, Result};
use clinic_database::search::{buscar_reembolsos, RefundFilters};
use clinic_database::{Filter, GroupBy, ListParams, Predicate, Query, Scalar, Sequence};
use clinic_workflow::{Origin, RefundOutcome, StatsReport};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::{check_version, load_patient, SearchParams};
use crate::auth::Caller;
use crate::error::ApiResult;
use crate::extract::{ApiJson, ApiPath, ApiQuery};
use crate::response::{created, ApiResponse, JsonResponse};
use crate::state::AppState;

const OPEN_STATES: [RefundStatus; 4] = [
    RefundStatus::Solicitada,
    RefundStatus::Revisando,
    RefundStatus::Aprobada,
    RefundStatus::Procesando,
];

/// 同一收款上尚未结束的退款合计
async fn open_amount(state: &AppState, payment: Uuid, exclude: Option<Uuid>) -> Result<Decimal> {
    let filter = Filter::new().eq("pago", payment).and(Predicate::In(
        "estado",
        OPEN_STATES.iter().map(|s| Scalar::from(s.as_str())).collect(),
    ));
    let mut query = Query::new(filter);
    query.limit = u64::from(u32::MAX);
    Ok(state
        .repos
        .refunds
        .find(&query)
        .await?
        .iter()
        .filter(|r| Some(r.id) != exclude)
        .map(Refund::importe_pendiente)
        .sum())
}

fn ensure_within_refundable(payment: &Payment, open: Decimal, requested: Decimal) -> Result<()> {
    if open + requested > payment.refundable() {
        return Err(ClinicError::validation(format!(
            "El importe solicitado supera el disponible para devolución ({} pendientes de {})",
            open,
            payment.refundable()
        )));
    }
    Ok(())
}

/// GET /api/refunds
pub async fn list(
    State(state): State<AppState>,
    caller: Caller,
    ApiQuery(filters): ApiQuery<RefundFilters>,
    ApiQuery(params): ApiQuery<ListParams>,
) -> ApiResult<JsonResponse<Vec<RefundSummary>>> {
    let query = buscar_reembolsos(&filters, caller.sede_scope(), &params, &state.pages)?;
    let page = state.repos.refunds.page(&query).await?;
    let items = page.items.iter().map(Refund::summary).collect();
    Ok(Json(ApiResponse::paginated(items, &params, &state.pages, page.total)))
}

/// GET /api/refunds/search
pub async fn search(
    State(state): State<AppState>,
    caller: Caller,
    ApiQuery(params): ApiQuery<SearchParams>,
) -> ApiResult<JsonResponse<Vec<RefundSummary>>> {
    let filters = RefundFilters {
        q: Some(params.term()?),
        ..Default::default()
    };
    let query = buscar_reembolsos(&filters, caller.sede_scope(), &params.list_params(), &state.pages)?;
    let refunds = state.repos.refunds.find(&query).await?;
    Ok(Json(ApiResponse::ok(refunds.iter().map(Refund::summary).collect())))
}

/// GET /api/refunds/patient/:patient_id
pub async fn by_patient(
    State(state): State<AppState>,
    caller: Caller,
    ApiPath(patient_id): ApiPath<Uuid>,
    ApiQuery(params): ApiQuery<ListParams>,
) -> ApiResult<JsonResponse<Vec<RefundSummary>>> {
    load_patient(&state, &caller, patient_id).await?;
    let filters = RefundFilters {
        paciente: Some(patient_id),
        ..Default::default()
    };
    let query = buscar_reembolsos(&filters, caller.sede_scope(), &params, &state.pages)?;
    let page = state.repos.refunds.page(&query).await?;
    let items = page.items.iter().map(Refund::summary).collect();
    Ok(Json(ApiResponse::paginated(items, &params, &state.pages, page.total)))
}

/// GET /api/refunds/stats
pub async fn stats(
    State(state): State<AppState>,
    caller: Caller,
    ApiQuery(filters): ApiQuery<RefundFilters>,
) -> ApiResult<JsonResponse<StatsReport>> {
    let query = buscar_reembolsos(&filters, caller.sede_scope(), &ListParams::default(), &state.pages)?;
    let repo = &state.repos.refunds;
    let por_estado = repo
        .aggregate(&query.filter, GroupBy::Field("estado"), Some("importeSolicitado"))
        .await?;
    let por_mes = repo
        .aggregate(&query.filter, GroupBy::Month("createdAt"), Some("importeSolicitado"))
        .await?;
    Ok(Json(ApiResponse::ok(StatsReport::new(por_estado, por_mes))))
}

/// GET /api/refunds/:id
pub async fn get(
    State(state): State<AppState>,
    caller: Caller,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<JsonResponse<RefundView>> {
    let refund = state.repos.refunds.fetch(id).await?;
    AccessGuard::ensure_can_read(&caller, &refund)?;
    Ok(Json(ApiResponse::ok(refund.view())))
}

/// POST /api/refunds
pub async fn create(
    State(state): State<AppState>,
    caller: Caller,
    ApiJson(input): ApiJson<NewRefund>,
) -> ApiResult<(StatusCode, JsonResponse<RefundView>)> {
    let payment = state.repos.payments.fetch(input.pago).await?;
    AccessGuard::ensure_can_read(&caller, &payment)?;
    let open = open_amount(&state, payment.id, None).await?;
    ensure_within_refundable(&payment, open, input.importe_solicitado)?;

    let numero = state.repos.next_number(Sequence::Refund).await?;
    let origin = Origin::new(numero, &caller, Utc::now());
    let refund = state.workflow.refunds().create(input, &payment, &origin)?;
    state.repos.refunds.insert(&refund).await?;
    Ok(created(refund.view(), "Solicitud de devolución registrada"))
}

/// PUT /api/refunds/:id
pub async fn update(
    State(state): State<AppState>,
    caller: Caller,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(update): ApiJson<RefundUpdate>,
) -> ApiResult<JsonResponse<RefundView>> {
    let mut refund = state.repos.refunds.fetch(id).await?;
    AccessGuard::ensure_can_modify(&caller, &refund)?;
    check_version(update.version, refund.meta.version)?;

    let payment = state.repos.payments.fetch(refund.pago).await?;
    if let Some(importe) = update.importe_solicitado {
        let open = open_amount(&state, payment.id, Some(refund.id)).await?;
        ensure_within_refundable(&payment, open, importe)?;
    }
    state
        .workflow
        .refunds()
        .update(&mut refund, update, &payment, &caller.actor(), Utc::now())?;
    state.repos.refunds.save(&mut refund).await?;
    Ok(Json(ApiResponse::with_message(
        refund.view(),
        "Devolución actualizada correctamente",
    )))
}

/// PUT /api/refunds/:id/status
///
/// 完成时先回写收款，再保存退款。
pub async fn change_status(
    State(state): State<AppState>,
    caller: Caller,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(request): ApiJson<RefundStatusRequest>,
) -> ApiResult<JsonResponse<RefundView>> {
    let mut refund = state.repos.refunds.fetch(id).await?;
    AccessGuard::ensure_can_change_status(&caller, &refund)?;

    let now = Utc::now();
    let outcome = state
        .workflow
        .refunds()
        .change_status(&mut refund, request, &caller, now)?;
    if let RefundOutcome::Completed { importe } = outcome {
        let mut payment = state.repos.payments.fetch(refund.pago).await?;
        state.workflow.payments().apply_refund(
            &mut payment,
            importe,
            &refund.numero,
            &caller.actor(),
            now,
        )?;
        state.repos.payments.save(&mut payment).await?;
    }
    state.repos.refunds.save(&mut refund).await?;

    let message = format!("Estado de la devolución actualizado a '{}'", refund.estado);
    Ok(Json(ApiResponse::with_message(refund.view(), message)))
}

/// DELETE /api/refunds/:id
pub async fn delete(
    State(state): State<AppState>,
    caller: Caller,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<JsonResponse<()>> {
    let refund = state.repos.refunds.fetch(id).await?;
    AccessGuard::ensure_can_delete(&caller, &refund)?;
    if refund.estado == RefundStatus::Completada {
        return Err(ClinicError::Conflict(
            "No se puede eliminar una devolución completada".to_string(),
        )
        .into());
    }

    state.repos.refunds.delete(id).await?;
    tracing::info!(refund = %refund.numero, user = %caller.id, "refund deleted");
    Ok(Json(ApiResponse::message("Devolución eliminada correctamente")))
}
