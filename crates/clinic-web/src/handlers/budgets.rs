//! 预算接口与销售管线

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use clinic_core::budget::{BudgetSummary, BudgetUpdate, BudgetView, NewBudget, NewCommunication};
use clinic_core::{AccessGuard, Budget, BudgetStatus, ClinicError, StatusChangeRequest};
use clinic_database::search::{buscar_presupuestos, BudgetFilters};
use clinic_database::{Filter, GroupBy, ListParams, Predicate, Scalar, Sequence};
use clinic_workflow::{Origin, PatientSnapshot, PipelineStats, StatsReport};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use super::{check_version, load_patient, SearchParams};
use crate::auth::Caller;
use crate::error::ApiResult;
use crate::extract::{ApiJson, ApiPath, ApiQuery};
use crate::response::{created, ApiResponse, JsonResponse};
use crate::state::AppState;

/// 看板中的一列
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineColumn {
    pub estado: BudgetStatus,
    pub cantidad: u64,
    pub importe: Decimal,
    pub presupuestos: Vec<BudgetSummary>,
}

fn summaries(budgets: &[Budget]) -> Vec<BudgetSummary> {
    let now = Utc::now();
    budgets.iter().map(|b| b.summary(now)).collect()
}

/// GET /api/budgets
pub async fn list(
    State(state): State<AppState>,
    caller: Caller,
    ApiQuery(filters): ApiQuery<BudgetFilters>,
    ApiQuery(params): ApiQuery<ListParams>,
) -> ApiResult<JsonResponse<Vec<BudgetSummary>>> {
    let query = buscar_presupuestos(&filters, caller.sede_scope(), &params, &state.pages, Utc::now())?;
    let page = state.repos.budgets.page(&query).await?;
    Ok(Json(ApiResponse::paginated(
        summaries(&page.items),
        &params,
        &state.pages,
        page.total,
    )))
}

/// GET /api/budgets/search
pub async fn search(
    State(state): State<AppState>,
    caller: Caller,
    ApiQuery(params): ApiQuery<SearchParams>,
) -> ApiResult<JsonResponse<Vec<BudgetSummary>>> {
    let filters = BudgetFilters {
        q: Some(params.term()?),
        ..Default::default()
    };
    let query = buscar_presupuestos(
        &filters,
        caller.sede_scope(),
        &params.list_params(),
        &state.pages,
        Utc::now(),
    )?;
    let budgets = state.repos.budgets.find(&query).await?;
    Ok(Json(ApiResponse::ok(summaries(&budgets))))
}

/// GET /api/budgets/patient/:patient_id
pub async fn by_patient(
    State(state): State<AppState>,
    caller: Caller,
    ApiPath(patient_id): ApiPath<Uuid>,
    ApiQuery(params): ApiQuery<ListParams>,
) -> ApiResult<JsonResponse<Vec<BudgetSummary>>> {
    load_patient(&state, &caller, patient_id).await?;
    let filters = BudgetFilters {
        paciente: Some(patient_id),
        ..Default::default()
    };
    let query = buscar_presupuestos(&filters, caller.sede_scope(), &params, &state.pages, Utc::now())?;
    let page = state.repos.budgets.page(&query).await?;
    Ok(Json(ApiResponse::paginated(
        summaries(&page.items),
        &params,
        &state.pages,
        page.total,
    )))
}

/// GET /api/budgets/stats
pub async fn stats(
    State(state): State<AppState>,
    caller: Caller,
    ApiQuery(filters): ApiQuery<BudgetFilters>,
) -> ApiResult<JsonResponse<StatsReport>> {
    let query = buscar_presupuestos(
        &filters,
        caller.sede_scope(),
        &ListParams::default(),
        &state.pages,
        Utc::now(),
    )?;
    let repo = &state.repos.budgets;
    let por_estado = repo.aggregate(&query.filter, GroupBy::Field("estado"), Some("total")).await?;
    let por_mes = repo.aggregate(&query.filter, GroupBy::Month("createdAt"), Some("total")).await?;
    let por_profesional = repo
        .aggregate(&query.filter, GroupBy::Field("profesional.nombre"), Some("total"))
        .await?;
    Ok(Json(ApiResponse::ok(
        StatsReport::new(por_estado, por_mes).with_professionals(por_profesional),
    )))
}

/// GET /api/budgets/pipeline
///
/// 每个状态一列，列内为最近更新的预算（数量受分页上限约束）。
pub async fn pipeline(
    State(state): State<AppState>,
    caller: Caller,
    ApiQuery(filters): ApiQuery<BudgetFilters>,
    ApiQuery(params): ApiQuery<ListParams>,
) -> ApiResult<JsonResponse<Vec<PipelineColumn>>> {
    let filters = BudgetFilters {
        estado: None,
        ..filters
    };
    let params = ListParams {
        page: None,
        sort_by: Some("updatedAt".to_string()),
        sort_order: Some("desc".to_string()),
        ..params
    };
    let base = buscar_presupuestos(&filters, caller.sede_scope(), &params, &state.pages, Utc::now())?;
    let totals = state
        .repos
        .budgets
        .aggregate(&base.filter, GroupBy::Field("estado"), Some("total"))
        .await?;

    let mut columns = Vec::with_capacity(BudgetStatus::ALL.len());
    for estado in BudgetStatus::ALL {
        let mut query = base.clone();
        query
            .filter
            .push(Predicate::Eq("estado", Scalar::from(estado.as_str())));
        let budgets = state.repos.budgets.find(&query).await?;
        let (cantidad, importe) = totals
            .iter()
            .find(|b| b.key == estado.as_str())
            .map(|b| (b.count, b.sum))
            .unwrap_or((0, Decimal::ZERO));
        columns.push(PipelineColumn {
            estado,
            cantidad,
            importe,
            presupuestos: summaries(&budgets),
        });
    }
    Ok(Json(ApiResponse::ok(columns)))
}

/// GET /api/budgets/pipeline/stats
pub async fn pipeline_stats(
    State(state): State<AppState>,
    caller: Caller,
    ApiQuery(filters): ApiQuery<BudgetFilters>,
) -> ApiResult<JsonResponse<PipelineStats>> {
    let query = buscar_presupuestos(
        &filters,
        caller.sede_scope(),
        &ListParams::default(),
        &state.pages,
        Utc::now(),
    )?;
    let repo = &state.repos.budgets;
    let by_status = repo.aggregate(&query.filter, GroupBy::Field("estado"), Some("total")).await?;
    let decision_hours = repo
        .aggregate(
            &query.filter,
            GroupBy::Field("estado"),
            Some("metricas.horasHastaDecision"),
        )
        .await?;
    Ok(Json(ApiResponse::ok(PipelineStats::from_buckets(
        &by_status,
        &decision_hours,
    ))))
}

/// GET /api/budgets/:id
pub async fn get(
    State(state): State<AppState>,
    caller: Caller,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<JsonResponse<BudgetView>> {
    let budget = state.repos.budgets.fetch(id).await?;
    AccessGuard::ensure_can_read(&caller, &budget)?;
    Ok(Json(ApiResponse::ok(budget.view(Utc::now()))))
}

/// POST /api/budgets
pub async fn create(
    State(state): State<AppState>,
    caller: Caller,
    ApiJson(input): ApiJson<NewBudget>,
) -> ApiResult<(StatusCode, JsonResponse<BudgetView>)> {
    let patient = load_patient(&state, &caller, input.paciente).await?;
    let snapshot = PatientSnapshot::from(&patient);
    let numero = state.repos.next_number(Sequence::Budget).await?;
    let now = Utc::now();
    let origin = Origin::new(numero, &caller, now);

    let budget = state.workflow.pipeline().create(input, &snapshot, &origin)?;
    state.repos.budgets.insert(&budget).await?;
    Ok(created(budget.view(now), "Presupuesto creado correctamente"))
}

/// PUT /api/budgets/:id
pub async fn update(
    State(state): State<AppState>,
    caller: Caller,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(update): ApiJson<BudgetUpdate>,
) -> ApiResult<JsonResponse<BudgetView>> {
    let mut budget = state.repos.budgets.fetch(id).await?;
    AccessGuard::ensure_can_modify(&caller, &budget)?;
    check_version(update.version, budget.meta.version)?;
    if let Some(profesional) = &update.profesional {
        if profesional.id != budget.profesional.id && !caller.role.is_elevated() {
            return Err(ClinicError::forbidden(
                "Solo la administración puede reasignar el profesional del presupuesto",
            )
            .into());
        }
    }

    let new_patient = match update.paciente.filter(|p| *p != budget.paciente) {
        Some(patient_id) => Some(PatientSnapshot::from(
            &load_patient(&state, &caller, patient_id).await?,
        )),
        None => None,
    };

    let now = Utc::now();
    state
        .workflow
        .pipeline()
        .update(&mut budget, update, new_patient.as_ref(), &caller.actor(), now)?;
    state.repos.budgets.save(&mut budget).await?;
    Ok(Json(ApiResponse::with_message(
        budget.view(now),
        "Presupuesto actualizado correctamente",
    )))
}

/// PUT /api/budgets/:id/status
pub async fn change_status(
    State(state): State<AppState>,
    caller: Caller,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(request): ApiJson<StatusChangeRequest<BudgetStatus>>,
) -> ApiResult<JsonResponse<BudgetView>> {
    let mut budget = state.repos.budgets.fetch(id).await?;
    AccessGuard::ensure_can_change_status(&caller, &budget)?;

    let now = Utc::now();
    state
        .workflow
        .pipeline()
        .change_status(&mut budget, request, &caller.actor(), now)?;
    state.repos.budgets.save(&mut budget).await?;
    Ok(Json(ApiResponse::with_message(
        budget.view(now),
        format!("Estado del presupuesto actualizado a '{}'", budget.estado),
    )))
}

/// POST /api/budgets/:id/communication
pub async fn add_communication(
    State(state): State<AppState>,
    caller: Caller,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(input): ApiJson<NewCommunication>,
) -> ApiResult<(StatusCode, JsonResponse<BudgetView>)> {
    let mut budget = state.repos.budgets.fetch(id).await?;
    AccessGuard::ensure_can_change_status(&caller, &budget)?;

    let now = Utc::now();
    state
        .workflow
        .pipeline()
        .add_communication(&mut budget, input, &caller.actor(), now)?;
    state.repos.budgets.save(&mut budget).await?;
    Ok(created(budget.view(now), "Comunicación registrada correctamente"))
}

/// DELETE /api/budgets/:id
pub async fn delete(
    State(state): State<AppState>,
    caller: Caller,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<JsonResponse<()>> {
    let budget = state.repos.budgets.fetch(id).await?;
    AccessGuard::ensure_can_delete(&caller, &budget)?;

    if state
        .repos
        .payments
        .exists(&Filter::new().eq("presupuesto", id))
        .await?
    {
        return Err(ClinicError::Conflict(
            "No se puede eliminar un presupuesto con pagos asociados".to_string(),
        )
        .into());
    }

    state.repos.budgets.delete(id).await?;
    tracing::info!(budget = %budget.numero, user = %caller.id, "budget deleted");
    Ok(Json(ApiResponse::message("Presupuesto eliminado correctamente")))
}
