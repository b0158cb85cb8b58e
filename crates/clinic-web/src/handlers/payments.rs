//! 收款接口

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use clinic_core::payment::{NewPayment, PaymentSummary, PaymentUpdate, ReconcileRequest};
use clinic_core::{
    AccessGuard, ClinicError, Patient, Payment, PaymentStatus, Result, StatusChangeRequest,
};
use clinic_database::search::{buscar_pagos, PaymentFilters};
use clinic_database::{Filter, GroupBy, ListParams, Sequence};
use clinic_workflow::{Origin, PatientSnapshot, StatsReport};
use uuid::Uuid;

use super::{check_version, load_patient, SearchParams};
use crate::auth::Caller;
use crate::error::ApiResult;
use crate::extract::{ApiJson, ApiPath, ApiQuery};
use crate::response::{created, ApiResponse, JsonResponse};
use crate::state::AppState;

/// 关联的预算必须属于同一患者
pub(crate) async fn ensure_budget_of_patient(
    state: &AppState,
    caller: &Caller,
    budget_id: Option<Uuid>,
    patient: Uuid,
) -> Result<()> {
    let Some(budget_id) = budget_id else {
        return Ok(());
    };
    let budget = state.repos.budgets.fetch(budget_id).await?;
    AccessGuard::ensure_can_read(caller, &budget)?;
    if budget.paciente != patient {
        return Err(ClinicError::validation(
            "El presupuesto no pertenece al paciente indicado",
        ));
    }
    Ok(())
}

/// GET /api/payments
pub async fn list(
    State(state): State<AppState>,
    caller: Caller,
    ApiQuery(filters): ApiQuery<PaymentFilters>,
    ApiQuery(params): ApiQuery<ListParams>,
) -> ApiResult<JsonResponse<Vec<PaymentSummary>>> {
    let query = buscar_pagos(&filters, caller.sede_scope(), &params, &state.pages)?;
    let page = state.repos.payments.page(&query).await?;
    let items = page.items.iter().map(Payment::summary).collect();
    Ok(Json(ApiResponse::paginated(items, &params, &state.pages, page.total)))
}

/// GET /api/payments/search
pub async fn search(
    State(state): State<AppState>,
    caller: Caller,
    ApiQuery(params): ApiQuery<SearchParams>,
) -> ApiResult<JsonResponse<Vec<PaymentSummary>>> {
    let filters = PaymentFilters {
        q: Some(params.term()?),
        ..Default::default()
    };
    let query = buscar_pagos(&filters, caller.sede_scope(), &params.list_params(), &state.pages)?;
    let payments = state.repos.payments.find(&query).await?;
    Ok(Json(ApiResponse::ok(payments.iter().map(Payment::summary).collect())))
}

/// GET /api/payments/patient/:patient_id
pub async fn by_patient(
    State(state): State<AppState>,
    caller: Caller,
    ApiPath(patient_id): ApiPath<Uuid>,
    ApiQuery(params): ApiQuery<ListParams>,
) -> ApiResult<JsonResponse<Vec<PaymentSummary>>> {
    load_patient(&state, &caller, patient_id).await?;
    let filters = PaymentFilters {
        paciente: Some(patient_id),
        ..Default::default()
    };
    let query = buscar_pagos(&filters, caller.sede_scope(), &params, &state.pages)?;
    let page = state.repos.payments.page(&query).await?;
    let items = page.items.iter().map(Payment::summary).collect();
    Ok(Json(ApiResponse::paginated(items, &params, &state.pages, page.total)))
}

/// GET /api/payments/stats
pub async fn stats(
    State(state): State<AppState>,
    caller: Caller,
    ApiQuery(filters): ApiQuery<PaymentFilters>,
) -> ApiResult<JsonResponse<StatsReport>> {
    let query = buscar_pagos(&filters, caller.sede_scope(), &ListParams::default(), &state.pages)?;
    let repo = &state.repos.payments;
    let por_estado = repo.aggregate(&query.filter, GroupBy::Field("estado"), Some("importe")).await?;
    let por_mes = repo.aggregate(&query.filter, GroupBy::Month("createdAt"), Some("importe")).await?;
    Ok(Json(ApiResponse::ok(StatsReport::new(por_estado, por_mes))))
}

/// GET /api/payments/:id
pub async fn get(
    State(state): State<AppState>,
    caller: Caller,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<JsonResponse<Payment>> {
    let payment = state.repos.payments.fetch(id).await?;
    AccessGuard::ensure_can_read(&caller, &payment)?;
    Ok(Json(ApiResponse::ok(payment)))
}

/// POST /api/payments
pub async fn create(
    State(state): State<AppState>,
    caller: Caller,
    ApiJson(input): ApiJson<NewPayment>,
) -> ApiResult<(StatusCode, JsonResponse<Payment>)> {
    let patient = load_patient(&state, &caller, input.paciente).await?;
    ensure_budget_of_patient(&state, &caller, input.presupuesto, patient.id).await?;

    let numero = state.repos.next_number(Sequence::Payment).await?;
    let origin = Origin::new(numero, &caller, Utc::now());
    let payment = state
        .workflow
        .payments()
        .create(input, &PatientSnapshot::from(&patient), &origin)?;
    state.repos.payments.insert(&payment).await?;
    Ok(created(payment, "Pago registrado correctamente"))
}

/// PUT /api/payments/:id
pub async fn update(
    State(state): State<AppState>,
    caller: Caller,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(update): ApiJson<PaymentUpdate>,
) -> ApiResult<JsonResponse<Payment>> {
    let mut payment = state.repos.payments.fetch(id).await?;
    AccessGuard::ensure_can_modify(&caller, &payment)?;
    check_version(update.version, payment.meta.version)?;

    let new_patient: Option<Patient> = match update.paciente.filter(|p| *p != payment.paciente) {
        Some(patient_id) => Some(load_patient(&state, &caller, patient_id).await?),
        None => None,
    };
    let patient_id = new_patient.as_ref().map_or(payment.paciente, |p| p.id);
    if update.presupuesto.is_some() || new_patient.is_some() {
        ensure_budget_of_patient(
            &state,
            &caller,
            update.presupuesto.or(payment.presupuesto),
            patient_id,
        )
        .await?;
    }

    let snapshot = new_patient.as_ref().map(PatientSnapshot::from);
    state.workflow.payments().update(
        &mut payment,
        update,
        snapshot.as_ref(),
        &caller.actor(),
        Utc::now(),
    )?;
    state.repos.payments.save(&mut payment).await?;
    Ok(Json(ApiResponse::with_message(payment, "Pago actualizado correctamente")))
}

/// PUT /api/payments/:id/status
pub async fn change_status(
    State(state): State<AppState>,
    caller: Caller,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(request): ApiJson<StatusChangeRequest<PaymentStatus>>,
) -> ApiResult<JsonResponse<Payment>> {
    let mut payment = state.repos.payments.fetch(id).await?;
    AccessGuard::ensure_can_change_status(&caller, &payment)?;
    state
        .workflow
        .payments()
        .change_status(&mut payment, request, &caller.actor(), Utc::now())?;
    state.repos.payments.save(&mut payment).await?;
    let message = format!("Estado del pago actualizado a '{}'", payment.estado);
    Ok(Json(ApiResponse::with_message(payment, message)))
}

/// POST /api/payments/:id/reconcile
pub async fn reconcile(
    State(state): State<AppState>,
    caller: Caller,
    ApiPath(id): ApiPath<Uuid>,
    body: Option<ApiJson<ReconcileRequest>>,
) -> ApiResult<JsonResponse<Payment>> {
    let mut payment = state.repos.payments.fetch(id).await?;
    AccessGuard::ensure_can_read(&caller, &payment)?;
    let request = body.map(|ApiJson(r)| r).unwrap_or_default();
    state
        .workflow
        .payments()
        .reconcile(&mut payment, request, &caller.actor(), Utc::now())?;
    state.repos.payments.save(&mut payment).await?;
    Ok(Json(ApiResponse::with_message(payment, "Pago conciliado correctamente")))
}

/// DELETE /api/payments/:id
pub async fn delete(
    State(state): State<AppState>,
    caller: Caller,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<JsonResponse<()>> {
    let payment = state.repos.payments.fetch(id).await?;
    AccessGuard::ensure_can_delete(&caller, &payment)?;

    if state.repos.refunds.exists(&Filter::new().eq("pago", id)).await? {
        return Err(ClinicError::Conflict(
            "No se puede eliminar un pago con devoluciones asociadas".to_string(),
        )
        .into());
    }

    state.repos.payments.delete(id).await?;
    tracing::info!(payment = %payment.numero, user = %caller.id, "payment deleted");
    Ok(Json(ApiResponse::message("Pago eliminado correctamente")))
}
