//! 支付链接接口，包括面向患者的公开访问

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use clinic_core::payment_link::{
    AttemptRequest, LinkPaymentRequest, NewPaymentLink, PaymentLinkSummary, PaymentLinkUpdate,
    PaymentLinkView, PublicPaymentLink, RenewRequest,
};
use clinic_core::{
    AccessGuard, ClinicError, LinkStatus, Payment, PaymentLink, Result, StatusChangeRequest,
};
use clinic_database::search::{buscar_enlaces, LinkFilters};
use clinic_database::{Filter, GroupBy, ListParams, Query, Sequence};
use clinic_workflow::{Origin, PatientSnapshot, StatsReport};
use serde::Deserialize;
use uuid::Uuid;

use super::payments::ensure_budget_of_patient;
use super::{check_version, load_patient, SearchParams};
use crate::auth::Caller;
use crate::error::ApiResult;
use crate::extract::{ApiJson, ApiPath, ApiQuery};
use crate::response::{created, ApiResponse, JsonResponse};
use crate::state::AppState;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    pub motivo: Option<String>,
}

/// 读取时惰性过期：状态变化的链接立即写回
async fn refresh(state: &AppState, links: &mut [PaymentLink], now: DateTime<Utc>) -> Result<()> {
    for link in links.iter_mut() {
        if state.workflow.links().refresh_expiry(link, now) {
            state.repos.payment_links.save(link).await?;
        }
    }
    Ok(())
}

async fn load(state: &AppState, caller: &Caller, id: Uuid, now: DateTime<Utc>) -> Result<PaymentLink> {
    let mut link = state.repos.payment_links.fetch(id).await?;
    AccessGuard::ensure_can_read(caller, &link)?;
    refresh(state, std::slice::from_mut(&mut link), now).await?;
    Ok(link)
}

async fn find_by_token(state: &AppState, token: &str) -> Result<PaymentLink> {
    let mut query = Query::new(Filter::new().eq("token", token));
    query.limit = 1;
    state
        .repos
        .payment_links
        .find(&query)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| ClinicError::not_found("Enlace de pago no encontrado"))
}

async fn list_page(
    state: &AppState,
    caller: &Caller,
    filters: &LinkFilters,
    params: &ListParams,
) -> Result<JsonResponse<Vec<PaymentLinkSummary>>> {
    let now = Utc::now();
    let query = buscar_enlaces(filters, caller.sede_scope(), params, &state.pages, now)?;
    let mut page = state.repos.payment_links.page(&query).await?;
    refresh(state, &mut page.items, now).await?;
    let items = page.items.iter().map(PaymentLink::summary).collect();
    Ok(Json(ApiResponse::paginated(items, params, &state.pages, page.total)))
}

/// GET /api/payment-links
pub async fn list(
    State(state): State<AppState>,
    caller: Caller,
    ApiQuery(filters): ApiQuery<LinkFilters>,
    ApiQuery(params): ApiQuery<ListParams>,
) -> ApiResult<JsonResponse<Vec<PaymentLinkSummary>>> {
    Ok(list_page(&state, &caller, &filters, &params).await?)
}

/// GET /api/payment-links/search
pub async fn search(
    State(state): State<AppState>,
    caller: Caller,
    ApiQuery(params): ApiQuery<SearchParams>,
) -> ApiResult<JsonResponse<Vec<PaymentLinkSummary>>> {
    let now = Utc::now();
    let filters = LinkFilters {
        q: Some(params.term()?),
        ..Default::default()
    };
    let query = buscar_enlaces(&filters, caller.sede_scope(), &params.list_params(), &state.pages, now)?;
    let mut links = state.repos.payment_links.find(&query).await?;
    refresh(&state, &mut links, now).await?;
    Ok(Json(ApiResponse::ok(links.iter().map(PaymentLink::summary).collect())))
}

/// GET /api/payment-links/patient/:patient_id
pub async fn by_patient(
    State(state): State<AppState>,
    caller: Caller,
    ApiPath(patient_id): ApiPath<Uuid>,
    ApiQuery(params): ApiQuery<ListParams>,
) -> ApiResult<JsonResponse<Vec<PaymentLinkSummary>>> {
    load_patient(&state, &caller, patient_id).await?;
    let filters = LinkFilters {
        paciente: Some(patient_id),
        ..Default::default()
    };
    Ok(list_page(&state, &caller, &filters, &params).await?)
}

/// GET /api/payment-links/stats
pub async fn stats(
    State(state): State<AppState>,
    caller: Caller,
    ApiQuery(filters): ApiQuery<LinkFilters>,
) -> ApiResult<JsonResponse<StatsReport>> {
    let query = buscar_enlaces(
        &filters,
        caller.sede_scope(),
        &ListParams::default(),
        &state.pages,
        Utc::now(),
    )?;
    let repo = &state.repos.payment_links;
    let por_estado = repo.aggregate(&query.filter, GroupBy::Field("estado"), Some("importe")).await?;
    let por_mes = repo.aggregate(&query.filter, GroupBy::Month("createdAt"), Some("importe")).await?;
    Ok(Json(ApiResponse::ok(StatsReport::new(por_estado, por_mes))))
}

/// GET /api/payment-links/:id
pub async fn get(
    State(state): State<AppState>,
    caller: Caller,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<JsonResponse<PaymentLinkView>> {
    let now = Utc::now();
    let link = load(&state, &caller, id, now).await?;
    Ok(Json(ApiResponse::ok(link.view(now))))
}

/// POST /api/payment-links
pub async fn create(
    State(state): State<AppState>,
    caller: Caller,
    ApiJson(input): ApiJson<NewPaymentLink>,
) -> ApiResult<(StatusCode, JsonResponse<PaymentLinkView>)> {
    let patient = load_patient(&state, &caller, input.paciente).await?;
    ensure_budget_of_patient(&state, &caller, input.presupuesto, patient.id).await?;

    let numero = state.repos.next_number(Sequence::PaymentLink).await?;
    let now = Utc::now();
    let origin = Origin::new(numero, &caller, now);
    let link = state
        .workflow
        .links()
        .create(input, &PatientSnapshot::from(&patient), &origin)?;
    state.repos.payment_links.insert(&link).await?;
    Ok(created(link.view(now), "Enlace de pago creado correctamente"))
}

/// PUT /api/payment-links/:id
pub async fn update(
    State(state): State<AppState>,
    caller: Caller,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(update): ApiJson<PaymentLinkUpdate>,
) -> ApiResult<JsonResponse<PaymentLinkView>> {
    let now = Utc::now();
    let mut link = load(&state, &caller, id, now).await?;
    AccessGuard::ensure_can_modify(&caller, &link)?;
    check_version(update.version, link.meta.version)?;
    state
        .workflow
        .links()
        .update(&mut link, update, &caller.actor(), now)?;
    state.repos.payment_links.save(&mut link).await?;
    Ok(Json(ApiResponse::with_message(
        link.view(now),
        "Enlace de pago actualizado correctamente",
    )))
}

/// PUT /api/payment-links/:id/status
pub async fn change_status(
    State(state): State<AppState>,
    caller: Caller,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(request): ApiJson<StatusChangeRequest<LinkStatus>>,
) -> ApiResult<JsonResponse<PaymentLinkView>> {
    let now = Utc::now();
    let mut link = load(&state, &caller, id, now).await?;
    AccessGuard::ensure_can_change_status(&caller, &link)?;
    state
        .workflow
        .links()
        .change_status(&mut link, request, &caller.actor(), now)?;
    state.repos.payment_links.save(&mut link).await?;
    let message = format!("Estado del enlace actualizado a '{}'", link.estado);
    Ok(Json(ApiResponse::with_message(link.view(now), message)))
}

/// POST /api/payment-links/:id/cancel
pub async fn cancel(
    State(state): State<AppState>,
    caller: Caller,
    ApiPath(id): ApiPath<Uuid>,
    body: Option<ApiJson<CancelRequest>>,
) -> ApiResult<JsonResponse<PaymentLinkView>> {
    let now = Utc::now();
    let mut link = load(&state, &caller, id, now).await?;
    AccessGuard::ensure_can_change_status(&caller, &link)?;
    let request = body.map(|ApiJson(r)| r).unwrap_or_default();
    state
        .workflow
        .links()
        .cancel(&mut link, request.motivo, &caller.actor(), now)?;
    state.repos.payment_links.save(&mut link).await?;
    Ok(Json(ApiResponse::with_message(
        link.view(now),
        "Enlace de pago cancelado",
    )))
}

/// POST /api/payment-links/:id/renew
pub async fn renew(
    State(state): State<AppState>,
    caller: Caller,
    ApiPath(id): ApiPath<Uuid>,
    body: Option<ApiJson<RenewRequest>>,
) -> ApiResult<JsonResponse<PaymentLinkView>> {
    let now = Utc::now();
    let mut link = load(&state, &caller, id, now).await?;
    AccessGuard::ensure_can_change_status(&caller, &link)?;
    let request = body.map(|ApiJson(r)| r).unwrap_or_default();
    state
        .workflow
        .links()
        .renew(&mut link, request, &caller.actor(), now)?;
    state.repos.payment_links.save(&mut link).await?;
    Ok(Json(ApiResponse::with_message(
        link.view(now),
        "Enlace de pago renovado",
    )))
}

/// POST /api/payment-links/:id/pay
///
/// 先写链接再写收款：链接的版本检查保证同一链接只会生成一笔收款。
pub async fn pay(
    State(state): State<AppState>,
    caller: Caller,
    ApiPath(id): ApiPath<Uuid>,
    body: Option<ApiJson<LinkPaymentRequest>>,
) -> ApiResult<(StatusCode, JsonResponse<Payment>)> {
    let now = Utc::now();
    let mut link = load(&state, &caller, id, now).await?;
    AccessGuard::ensure_can_change_status(&caller, &link)?;
    state.workflow.links().ensure_payable(&link, now)?;

    let request = body.map(|ApiJson(r)| r).unwrap_or_default();
    let numero = state.repos.next_number(Sequence::Payment).await?;
    let origin = Origin::new(numero, &caller, now);
    let payment = state
        .workflow
        .payments()
        .create_from_link(&link, request, &origin)?;
    state
        .workflow
        .links()
        .mark_paid(&mut link, payment.id, &caller.actor(), now)?;

    state.repos.payment_links.save(&mut link).await?;
    state.repos.payments.insert(&payment).await?;

    tracing::info!(link = %link.numero, payment = %payment.numero, "payment link paid");
    Ok(created(payment, "Pago registrado mediante enlace"))
}

/// DELETE /api/payment-links/:id
pub async fn delete(
    State(state): State<AppState>,
    caller: Caller,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<JsonResponse<()>> {
    let link = state.repos.payment_links.fetch(id).await?;
    AccessGuard::ensure_can_delete(&caller, &link)?;
    if link.estado == LinkStatus::Pagado {
        return Err(ClinicError::Conflict(
            "No se puede eliminar un enlace de pago ya pagado".to_string(),
        )
        .into());
    }

    state.repos.payment_links.delete(id).await?;
    tracing::info!(link = %link.numero, user = %caller.id, "payment link deleted");
    Ok(Json(ApiResponse::message("Enlace de pago eliminado correctamente")))
}

/// GET /api/payment-links/public/:token
pub async fn public_get(
    State(state): State<AppState>,
    ApiPath(token): ApiPath<String>,
) -> ApiResult<JsonResponse<PublicPaymentLink>> {
    let mut link = find_by_token(&state, &token).await?;
    state.workflow.links().register_view(&mut link, Utc::now());
    state.repos.payment_links.save(&mut link).await?;
    Ok(Json(ApiResponse::ok(link.public_view())))
}

/// POST /api/payment-links/public/:token/attempt
pub async fn public_attempt(
    State(state): State<AppState>,
    ApiPath(token): ApiPath<String>,
    body: Option<ApiJson<AttemptRequest>>,
) -> ApiResult<JsonResponse<PublicPaymentLink>> {
    let mut link = find_by_token(&state, &token).await?;
    let before = link.clone();
    let request = body.map(|ApiJson(r)| r).unwrap_or_default();
    let outcome = state
        .workflow
        .links()
        .record_attempt(&mut link, request, Utc::now());
    if link != before {
        state.repos.payment_links.save(&mut link).await?;
    }
    outcome?;
    Ok(Json(ApiResponse::ok(link.public_view())))
}
