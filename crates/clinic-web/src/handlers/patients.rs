//! 患者接口

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use clinic_core::patient::{ClinicalHistory, NewPatient, PatientSummary, PatientUpdate, PatientView};
use clinic_core::policy::permissions::PATIENTS_CLINICAL_HISTORY;
use clinic_core::{AccessGuard, ClinicError, Patient, PatientStatus, Result, StatusChangeRequest};
use clinic_database::search::{buscar_pacientes, PatientFilters};
use clinic_database::{Filter, GroupBy, ListParams, Query, Sequence};
use clinic_workflow::StatsReport;
use uuid::Uuid;

use super::{check_version, SearchParams};
use crate::auth::Caller;
use crate::error::ApiResult;
use crate::extract::{ApiJson, ApiPath, ApiQuery};
use crate::response::{created, ApiResponse, JsonResponse};
use crate::state::AppState;

/// 邮箱与 DNI 在所有站点内唯一
async fn ensure_unique(
    state: &AppState,
    field: &'static str,
    value: &str,
    exclude: Option<Uuid>,
    message: &str,
) -> Result<()> {
    let mut query = Query::new(Filter::new().eq(field, value));
    query.limit = 2;
    let taken = state
        .repos
        .patients
        .find(&query)
        .await?
        .iter()
        .any(|p| Some(p.id) != exclude);
    if taken {
        return Err(ClinicError::validation(message));
    }
    Ok(())
}

fn normalized(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn touches_clinical_fields(update: &PatientUpdate) -> bool {
    update.alergias.is_some()
        || update.medicamentos.is_some()
        || update.antecedentes.is_some()
        || update.notas_clinicas.is_some()
}

fn view_for(caller: &Caller, patient: &Patient) -> PatientView {
    patient.view(
        caller.has_permission(PATIENTS_CLINICAL_HISTORY),
        Utc::now().date_naive(),
    )
}

/// GET /api/patients
pub async fn list(
    State(state): State<AppState>,
    caller: Caller,
    ApiQuery(filters): ApiQuery<PatientFilters>,
    ApiQuery(params): ApiQuery<ListParams>,
) -> ApiResult<JsonResponse<Vec<PatientSummary>>> {
    let query = buscar_pacientes(&filters, caller.sede_scope(), &params, &state.pages)?;
    let page = state.repos.patients.page(&query).await?;
    let items = page.items.iter().map(Patient::summary).collect();
    Ok(Json(ApiResponse::paginated(items, &params, &state.pages, page.total)))
}

/// GET /api/patients/search
pub async fn search(
    State(state): State<AppState>,
    caller: Caller,
    ApiQuery(params): ApiQuery<SearchParams>,
) -> ApiResult<JsonResponse<Vec<PatientSummary>>> {
    let filters = PatientFilters {
        q: Some(params.term()?),
        ..Default::default()
    };
    let query = buscar_pacientes(&filters, caller.sede_scope(), &params.list_params(), &state.pages)?;
    let patients = state.repos.patients.find(&query).await?;
    Ok(Json(ApiResponse::ok(patients.iter().map(Patient::summary).collect())))
}

/// GET /api/patients/stats
pub async fn stats(
    State(state): State<AppState>,
    caller: Caller,
    ApiQuery(filters): ApiQuery<PatientFilters>,
) -> ApiResult<JsonResponse<StatsReport>> {
    let query = buscar_pacientes(&filters, caller.sede_scope(), &ListParams::default(), &state.pages)?;
    let repo = &state.repos.patients;
    let por_estado = repo.aggregate(&query.filter, GroupBy::Field("estado"), None).await?;
    let por_mes = repo.aggregate(&query.filter, GroupBy::Month("createdAt"), None).await?;
    let por_profesional = repo
        .aggregate(&query.filter, GroupBy::Field("profesionalAsignado.nombre"), None)
        .await?;
    Ok(Json(ApiResponse::ok(
        StatsReport::new(por_estado, por_mes).with_professionals(por_profesional),
    )))
}

/// GET /api/patients/:id
pub async fn get(
    State(state): State<AppState>,
    caller: Caller,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<JsonResponse<PatientView>> {
    let patient = state.repos.patients.fetch(id).await?;
    AccessGuard::ensure_can_read(&caller, &patient)?;
    Ok(Json(ApiResponse::ok(view_for(&caller, &patient))))
}

/// GET /api/patients/:id/clinical-history
pub async fn clinical_history(
    State(state): State<AppState>,
    caller: Caller,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<JsonResponse<ClinicalHistory>> {
    let patient = state.repos.patients.fetch(id).await?;
    AccessGuard::ensure_can_read(&caller, &patient)?;
    Ok(Json(ApiResponse::ok(patient.clinical_history())))
}

/// POST /api/patients
pub async fn create(
    State(state): State<AppState>,
    caller: Caller,
    ApiJson(input): ApiJson<NewPatient>,
) -> ApiResult<(StatusCode, JsonResponse<PatientView>)> {
    let now = Utc::now();
    let input = input.normalize(now.date_naive())?;
    let sede = caller.resolve_sede(input.sede.clone())?;

    if let Some(email) = &input.email {
        ensure_unique(&state, "email", email, None, "Ya existe un paciente con ese email").await?;
    }
    if let Some(dni) = &input.dni {
        ensure_unique(&state, "dni", dni, None, "Ya existe un paciente con ese DNI").await?;
    }

    let numero = state.repos.next_number(Sequence::ClinicalRecord).await?;
    let patient = input.into_patient(Uuid::new_v4(), numero, sede, caller.actor(), now);
    state.repos.patients.insert(&patient).await?;

    tracing::info!(patient = %patient.numero_historia_clinica, sede = %patient.sede, "patient created");
    Ok(created(view_for(&caller, &patient), "Paciente creado correctamente"))
}

/// PUT /api/patients/:id
pub async fn update(
    State(state): State<AppState>,
    caller: Caller,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(update): ApiJson<PatientUpdate>,
) -> ApiResult<JsonResponse<PatientView>> {
    let mut patient = state.repos.patients.fetch(id).await?;
    AccessGuard::ensure_can_modify(&caller, &patient)?;
    check_version(update.version, patient.meta.version)?;
    if touches_clinical_fields(&update) {
        caller.require(PATIENTS_CLINICAL_HISTORY)?;
    }

    if let Some(email) = normalized(&update.email).map(|e| e.to_lowercase()) {
        if patient.email.as_deref() != Some(email.as_str()) {
            ensure_unique(&state, "email", &email, Some(id), "Ya existe un paciente con ese email").await?;
        }
    }
    if let Some(dni) = normalized(&update.dni).map(|d| d.to_uppercase()) {
        if patient.dni.as_deref() != Some(dni.as_str()) {
            ensure_unique(&state, "dni", &dni, Some(id), "Ya existe un paciente con ese DNI").await?;
        }
    }

    patient.apply_update(update, &caller.actor(), Utc::now())?;
    state.repos.patients.save(&mut patient).await?;
    Ok(Json(ApiResponse::with_message(
        view_for(&caller, &patient),
        "Paciente actualizado correctamente",
    )))
}

/// PUT /api/patients/:id/status
pub async fn change_status(
    State(state): State<AppState>,
    caller: Caller,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(request): ApiJson<StatusChangeRequest<PatientStatus>>,
) -> ApiResult<JsonResponse<PatientView>> {
    let mut patient = state.repos.patients.fetch(id).await?;
    AccessGuard::ensure_can_change_status(&caller, &patient)?;
    patient.change_status(request.estado, request.motivo, &caller.actor(), Utc::now())?;
    state.repos.patients.save(&mut patient).await?;

    tracing::info!(patient = %patient.numero_historia_clinica, estado = %patient.estado, "patient status changed");
    Ok(Json(ApiResponse::with_message(
        view_for(&caller, &patient),
        format!("Estado del paciente actualizado a '{}'", patient.estado),
    )))
}

/// DELETE /api/patients/:id
pub async fn delete(
    State(state): State<AppState>,
    caller: Caller,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<JsonResponse<()>> {
    let patient = state.repos.patients.fetch(id).await?;
    AccessGuard::ensure_can_delete(&caller, &patient)?;

    let linked = Filter::new().eq("paciente", id);
    if state.repos.budgets.exists(&linked).await? || state.repos.payments.exists(&linked).await? {
        return Err(ClinicError::Conflict(
            "No se puede eliminar un paciente con presupuestos o pagos asociados".to_string(),
        )
        .into());
    }

    state.repos.patients.delete(id).await?;
    tracing::info!(patient = %patient.numero_historia_clinica, user = %caller.id, "patient deleted");
    Ok(Json(ApiResponse::message("Paciente eliminado correctamente")))
}
