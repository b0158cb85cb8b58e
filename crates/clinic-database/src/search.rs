//! 各实体的检索条件构建（`buscar_*`）
//!
//! 将扁平的查询参数转换为 [`Query`]。非全局角色的站点范围由调用方传入并强制附加。

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use clinic_core::{BudgetStatus, ClinicError, LinkStatus, Result};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use uuid::Uuid;

use crate::queries::{FieldKind, FieldPath, Filter, Predicate, Query, Scalar, Sort, SortOrder};

/// 分页设置（来自配置）
#[derive(Debug, Clone, Copy)]
pub struct PageSettings {
    pub default_limit: u64,
    pub max_limit: u64,
}

impl Default for PageSettings {
    fn default() -> Self {
        Self {
            default_limit: 20,
            max_limit: 100,
        }
    }
}

/// 分页与排序参数
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
    pub page: Option<u64>,
    pub limit: Option<u64>,
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
}

impl ListParams {
    pub fn page(&self) -> u64 {
        self.page.unwrap_or(1).max(1)
    }

    pub fn limit(&self, settings: &PageSettings) -> u64 {
        self.limit
            .unwrap_or(settings.default_limit)
            .clamp(1, settings.max_limit)
    }
}

/// 可排序字段白名单
type SortFields = &'static [(&'static str, FieldKind)];

fn build_query(
    filter: Filter,
    params: &ListParams,
    settings: &PageSettings,
    sortable: SortFields,
) -> Result<Query> {
    let mut sort = Sort::default();
    if let Some(sort_by) = params.sort_by.as_deref().filter(|s| !s.is_empty()) {
        let (field, kind) = sortable
            .iter()
            .find(|(name, _)| *name == sort_by)
            .ok_or_else(|| {
                ClinicError::validation(format!("No se puede ordenar por '{}'", sort_by))
            })?;
        sort.field = *field;
        sort.kind = *kind;
    }
    if let Some(order) = params.sort_order.as_deref().filter(|s| !s.is_empty()) {
        sort.order = order.parse::<SortOrder>()?;
    }
    let limit = params.limit(settings);
    // OFFSET 以 BIGINT 绑定
    let offset = (params.page() - 1)
        .checked_mul(limit)
        .filter(|offset| i64::try_from(*offset).is_ok())
        .ok_or_else(|| ClinicError::validation("La página solicitada está fuera de rango"))?;
    Ok(Query {
        filter,
        sort,
        offset,
        limit,
    })
}

/// 逗号分隔的枚举列表
fn parse_list<T: DeserializeOwned>(field: &str, raw: &Option<String>) -> Result<Vec<T>> {
    let Some(raw) = raw.as_deref() else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|value| {
            serde_json::from_value(serde_json::Value::String(value.to_string())).map_err(|_| {
                ClinicError::validation(format!("Valor no válido para {}: '{}'", field, value))
            })
        })
        .collect()
}

/// 枚举的线上名称
fn wire_name<T: serde::Serialize>(value: &T) -> Result<String> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Ok(other.to_string()),
    }
}

fn push_enum_filter<T: DeserializeOwned + serde::Serialize>(
    filter: &mut Filter,
    path: FieldPath,
    field: &str,
    raw: &Option<String>,
) -> Result<()> {
    let values: Vec<T> = parse_list(field, raw)?;
    match values.len() {
        0 => {}
        1 => filter.push(Predicate::Eq(path, Scalar::Text(wire_name(&values[0])?))),
        _ => filter.push(Predicate::In(
            path,
            values
                .iter()
                .map(|v| wire_name(v).map(Scalar::Text))
                .collect::<Result<_>>()?,
        )),
    }
    Ok(())
}

fn push_text(filter: &mut Filter, fields: &[FieldPath], q: &Option<String>) {
    if let Some(term) = q.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        filter.push(Predicate::Text(fields.to_vec(), term.to_string()));
    }
}

fn push_uuid(filter: &mut Filter, path: FieldPath, value: Option<Uuid>) {
    if let Some(id) = value {
        filter.push(Predicate::Eq(path, Scalar::from(id)));
    }
}

fn push_tags(filter: &mut Filter, path: FieldPath, raw: &Option<String>) {
    let tags: Vec<String> = raw
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();
    if !tags.is_empty() {
        filter.push(Predicate::AnyOf(path, tags));
    }
}

fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::default()))
}

fn end_of_day(date: NaiveDate) -> DateTime<Utc> {
    let end = NaiveTime::from_hms_micro_opt(23, 59, 59, 999_999).unwrap_or_default();
    Utc.from_utc_datetime(&date.and_time(end))
}

/// 闭区间日期范围（整日）
fn push_date_range(
    filter: &mut Filter,
    path: FieldPath,
    desde: Option<NaiveDate>,
    hasta: Option<NaiveDate>,
) -> Result<()> {
    if let (Some(d), Some(h)) = (desde, hasta) {
        if d > h {
            return Err(ClinicError::validation(
                "La fecha inicial no puede ser posterior a la final",
            ));
        }
    }
    if desde.is_some() || hasta.is_some() {
        filter.push(Predicate::Range {
            field: path,
            min: desde.map(|d| Scalar::Date(start_of_day(d))),
            max: hasta.map(|h| Scalar::Date(end_of_day(h))),
        });
    }
    Ok(())
}

fn push_amount_range(
    filter: &mut Filter,
    path: FieldPath,
    min: Option<Decimal>,
    max: Option<Decimal>,
) -> Result<()> {
    if let (Some(lo), Some(hi)) = (min, max) {
        if lo > hi {
            return Err(ClinicError::validation(
                "El importe mínimo no puede superar al máximo",
            ));
        }
    }
    if min.is_some() || max.is_some() {
        filter.push(Predicate::Range {
            field: path,
            min: min.map(Scalar::Number),
            max: max.map(Scalar::Number),
        });
    }
    Ok(())
}

/// 站点条件：受限角色强制使用自身站点，全局角色可选过滤
fn push_sede(filter: &mut Filter, scope: Option<&str>, requested: &Option<String>) {
    let requested = requested.as_deref().map(str::trim).filter(|s| !s.is_empty());
    if let Some(sede) = scope.or(requested) {
        filter.push(Predicate::Eq("sede", Scalar::from(sede)));
    }
}

// ========== 患者 ==========

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientFilters {
    pub q: Option<String>,
    pub estado: Option<String>,
    pub sede: Option<String>,
    pub profesional: Option<Uuid>,
    pub etiquetas: Option<String>,
    pub desde: Option<NaiveDate>,
    pub hasta: Option<NaiveDate>,
}

pub const PATIENT_SORT: SortFields = &[
    ("nombre", FieldKind::Text),
    ("apellidos", FieldKind::Text),
    ("numeroHistoriaClinica", FieldKind::Text),
    ("createdAt", FieldKind::Date),
    ("updatedAt", FieldKind::Date),
];

pub fn buscar_pacientes(
    filters: &PatientFilters,
    scope: Option<&str>,
    params: &ListParams,
    settings: &PageSettings,
) -> Result<Query> {
    let mut filter = Filter::new();
    push_sede(&mut filter, scope, &filters.sede);
    push_text(
        &mut filter,
        &["nombre", "apellidos", "email", "numeroHistoriaClinica"],
        &filters.q,
    );
    push_enum_filter::<clinic_core::PatientStatus>(&mut filter, "estado", "estado", &filters.estado)?;
    push_uuid(&mut filter, "profesionalAsignado.id", filters.profesional);
    push_tags(&mut filter, "etiquetas", &filters.etiquetas);
    push_date_range(&mut filter, "createdAt", filters.desde, filters.hasta)?;
    build_query(filter, params, settings, PATIENT_SORT)
}

// ========== 预算 ==========

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetFilters {
    pub q: Option<String>,
    pub estado: Option<String>,
    pub prioridad: Option<String>,
    pub sede: Option<String>,
    pub profesional: Option<Uuid>,
    pub paciente: Option<Uuid>,
    pub desde: Option<NaiveDate>,
    pub hasta: Option<NaiveDate>,
    pub importe_min: Option<Decimal>,
    pub importe_max: Option<Decimal>,
    pub etiquetas: Option<String>,
    /// 仅已过期的未决预算
    pub vencidos: Option<bool>,
}

pub const BUDGET_SORT: SortFields = &[
    ("numero", FieldKind::Text),
    ("pacienteNombre", FieldKind::Text),
    ("total", FieldKind::Number),
    ("fechaVencimiento", FieldKind::Date),
    ("fechaPresentacion", FieldKind::Date),
    ("createdAt", FieldKind::Date),
    ("updatedAt", FieldKind::Date),
];

pub fn buscar_presupuestos(
    filters: &BudgetFilters,
    scope: Option<&str>,
    params: &ListParams,
    settings: &PageSettings,
    now: DateTime<Utc>,
) -> Result<Query> {
    let mut filter = Filter::new();
    push_sede(&mut filter, scope, &filters.sede);
    push_text(
        &mut filter,
        &["numero", "pacienteNombre", "profesional.nombre"],
        &filters.q,
    );
    push_enum_filter::<BudgetStatus>(&mut filter, "estado", "estado", &filters.estado)?;
    push_enum_filter::<clinic_core::Priority>(&mut filter, "prioridad", "prioridad", &filters.prioridad)?;
    push_uuid(&mut filter, "profesional.id", filters.profesional);
    push_uuid(&mut filter, "paciente", filters.paciente);
    push_date_range(&mut filter, "createdAt", filters.desde, filters.hasta)?;
    push_amount_range(&mut filter, "total", filters.importe_min, filters.importe_max)?;
    push_tags(&mut filter, "etiquetas", &filters.etiquetas);
    if filters.vencidos == Some(true) {
        filter.push(Predicate::In(
            "estado",
            vec![
                Scalar::from(BudgetStatus::Pendiente.as_str()),
                Scalar::from(BudgetStatus::Presentado.as_str()),
            ],
        ));
        filter.push(Predicate::Range {
            field: "fechaVencimiento",
            min: None,
            max: Some(Scalar::Date(now)),
        });
    }
    build_query(filter, params, settings, BUDGET_SORT)
}

// ========== 收款 ==========

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentFilters {
    pub q: Option<String>,
    pub estado: Option<String>,
    pub metodo: Option<String>,
    pub pasarela: Option<String>,
    pub sede: Option<String>,
    pub paciente: Option<Uuid>,
    pub presupuesto: Option<Uuid>,
    pub conciliado: Option<bool>,
    pub desde: Option<NaiveDate>,
    pub hasta: Option<NaiveDate>,
    pub importe_min: Option<Decimal>,
    pub importe_max: Option<Decimal>,
}

pub const PAYMENT_SORT: SortFields = &[
    ("numero", FieldKind::Text),
    ("pacienteNombre", FieldKind::Text),
    ("importe", FieldKind::Number),
    ("fechaPago", FieldKind::Date),
    ("createdAt", FieldKind::Date),
];

pub fn buscar_pagos(
    filters: &PaymentFilters,
    scope: Option<&str>,
    params: &ListParams,
    settings: &PageSettings,
) -> Result<Query> {
    let mut filter = Filter::new();
    push_sede(&mut filter, scope, &filters.sede);
    push_text(
        &mut filter,
        &["numero", "pacienteNombre", "concepto", "referenciaExterna"],
        &filters.q,
    );
    push_enum_filter::<clinic_core::PaymentStatus>(&mut filter, "estado", "estado", &filters.estado)?;
    push_enum_filter::<clinic_core::payment::PaymentMethod>(&mut filter, "metodo", "metodo", &filters.metodo)?;
    push_enum_filter::<clinic_core::payment::Gateway>(&mut filter, "pasarela", "pasarela", &filters.pasarela)?;
    push_uuid(&mut filter, "paciente", filters.paciente);
    push_uuid(&mut filter, "presupuesto", filters.presupuesto);
    if let Some(conciliado) = filters.conciliado {
        filter.push(Predicate::Eq("conciliacion.conciliado", Scalar::Bool(conciliado)));
    }
    push_date_range(&mut filter, "createdAt", filters.desde, filters.hasta)?;
    push_amount_range(&mut filter, "importe", filters.importe_min, filters.importe_max)?;
    build_query(filter, params, settings, PAYMENT_SORT)
}

// ========== 支付链接 ==========

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkFilters {
    pub q: Option<String>,
    pub estado: Option<String>,
    pub sede: Option<String>,
    pub paciente: Option<Uuid>,
    pub presupuesto: Option<Uuid>,
    pub desde: Option<NaiveDate>,
    pub hasta: Option<NaiveDate>,
    pub importe_min: Option<Decimal>,
    pub importe_max: Option<Decimal>,
    /// 仍为 `activo` 但已超过到期时间
    pub vencidos: Option<bool>,
}

pub const LINK_SORT: SortFields = &[
    ("numero", FieldKind::Text),
    ("pacienteNombre", FieldKind::Text),
    ("importe", FieldKind::Number),
    ("fechaExpiracion", FieldKind::Date),
    ("createdAt", FieldKind::Date),
];

pub fn buscar_enlaces(
    filters: &LinkFilters,
    scope: Option<&str>,
    params: &ListParams,
    settings: &PageSettings,
    now: DateTime<Utc>,
) -> Result<Query> {
    let mut filter = Filter::new();
    push_sede(&mut filter, scope, &filters.sede);
    push_text(&mut filter, &["numero", "pacienteNombre", "concepto"], &filters.q);
    push_enum_filter::<LinkStatus>(&mut filter, "estado", "estado", &filters.estado)?;
    push_uuid(&mut filter, "paciente", filters.paciente);
    push_uuid(&mut filter, "presupuesto", filters.presupuesto);
    push_date_range(&mut filter, "createdAt", filters.desde, filters.hasta)?;
    push_amount_range(&mut filter, "importe", filters.importe_min, filters.importe_max)?;
    if filters.vencidos == Some(true) {
        filter.push(Predicate::Eq("estado", Scalar::from(LinkStatus::Activo.as_str())));
        filter.push(Predicate::Range {
            field: "fechaExpiracion",
            min: None,
            max: Some(Scalar::Date(now)),
        });
    }
    build_query(filter, params, settings, LINK_SORT)
}

// ========== 退款 ==========

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundFilters {
    pub q: Option<String>,
    pub estado: Option<String>,
    pub categoria: Option<String>,
    pub sede: Option<String>,
    pub paciente: Option<Uuid>,
    pub pago: Option<Uuid>,
    pub desde: Option<NaiveDate>,
    pub hasta: Option<NaiveDate>,
    pub importe_min: Option<Decimal>,
    pub importe_max: Option<Decimal>,
}

pub const REFUND_SORT: SortFields = &[
    ("numero", FieldKind::Text),
    ("pacienteNombre", FieldKind::Text),
    ("importeSolicitado", FieldKind::Number),
    ("createdAt", FieldKind::Date),
];

pub fn buscar_reembolsos(
    filters: &RefundFilters,
    scope: Option<&str>,
    params: &ListParams,
    settings: &PageSettings,
) -> Result<Query> {
    let mut filter = Filter::new();
    push_sede(&mut filter, scope, &filters.sede);
    push_text(
        &mut filter,
        &["numero", "pagoNumero", "pacienteNombre", "motivo"],
        &filters.q,
    );
    push_enum_filter::<clinic_core::RefundStatus>(&mut filter, "estado", "estado", &filters.estado)?;
    push_enum_filter::<clinic_core::refund::RefundCategory>(&mut filter, "categoria", "categoria", &filters.categoria)?;
    push_uuid(&mut filter, "paciente", filters.paciente);
    push_uuid(&mut filter, "pago", filters.pago);
    push_date_range(&mut filter, "createdAt", filters.desde, filters.hasta)?;
    push_amount_range(
        &mut filter,
        "importeSolicitado",
        filters.importe_min,
        filters.importe_max,
    )?;
    build_query(filter, params, settings, REFUND_SORT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_page_offset_out_of_range_is_rejected() {
        let params = ListParams {
            page: Some(3),
            limit: Some(10),
            ..Default::default()
        };
        let query = buscar_presupuestos(
            &BudgetFilters::default(),
            None,
            &params,
            &PageSettings::default(),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(query.offset, 20);

        for page in [u64::MAX, u64::MAX / 10] {
            let params = ListParams {
                page: Some(page),
                limit: Some(10),
                ..Default::default()
            };
            let result = buscar_presupuestos(
                &BudgetFilters::default(),
                None,
                &params,
                &PageSettings::default(),
                Utc::now(),
            );
            assert!(matches!(result, Err(ClinicError::Validation(_))));
        }
    }

    #[test]
    fn test_scope_overrides_requested_sede() {
        let filters = BudgetFilters {
            sede: Some("barcelona".to_string()),
            ..Default::default()
        };
        let query = buscar_presupuestos(
            &filters,
            Some("madrid"),
            &ListParams::default(),
            &PageSettings::default(),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(
            query.filter.predicates()[0],
            Predicate::Eq("sede", Scalar::from("madrid"))
        );
        assert_eq!(query.filter.predicates().len(), 1);
    }

    #[test]
    fn test_overdue_shortcut_matches_only_open_expired_budgets() {
        let now: DateTime<Utc> = "2026-05-01T00:00:00Z".parse().unwrap();
        let filters = BudgetFilters {
            vencidos: Some(true),
            ..Default::default()
        };
        let query = buscar_presupuestos(&filters, None, &ListParams::default(), &PageSettings::default(), now)
            .unwrap();

        let expired = json!({"estado": "presentado", "fechaVencimiento": "2026-04-01T00:00:00Z"});
        let future = json!({"estado": "presentado", "fechaVencimiento": "2026-06-01T00:00:00Z"});
        let accepted = json!({"estado": "aceptado", "fechaVencimiento": "2026-04-01T00:00:00Z"});
        assert!(query.filter.matches(&expired));
        assert!(!query.filter.matches(&future));
        assert!(!query.filter.matches(&accepted));
    }

    #[test]
    fn test_enum_lists_and_invalid_values() {
        let filters = BudgetFilters {
            estado: Some("pendiente,presentado".to_string()),
            ..Default::default()
        };
        let query = buscar_presupuestos(&filters, None, &ListParams::default(), &PageSettings::default(), Utc::now())
            .unwrap();
        assert!(query.filter.matches(&json!({"estado": "presentado"})));
        assert!(!query.filter.matches(&json!({"estado": "perdido"})));

        let invalid = BudgetFilters {
            estado: Some("ganado".to_string()),
            ..Default::default()
        };
        let err = buscar_presupuestos(&invalid, None, &ListParams::default(), &PageSettings::default(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, ClinicError::Validation(_)));
    }

    #[test]
    fn test_sort_whitelist_and_pagination() {
        let params = ListParams {
            page: Some(3),
            limit: Some(500),
            sort_by: Some("total".to_string()),
            sort_order: Some("asc".to_string()),
        };
        let query = buscar_presupuestos(
            &BudgetFilters::default(),
            None,
            &params,
            &PageSettings::default(),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(query.limit, 100);
        assert_eq!(query.offset, 200);
        assert_eq!(query.sort.kind, FieldKind::Number);
        assert_eq!(query.sort.order, SortOrder::Asc);

        let bad = ListParams {
            sort_by: Some("data".to_string()),
            ..Default::default()
        };
        assert!(buscar_pagos(&PaymentFilters::default(), None, &bad, &PageSettings::default()).is_err());
    }

    #[test]
    fn test_inclusive_date_range() {
        let filters = PaymentFilters {
            desde: NaiveDate::from_ymd_opt(2026, 3, 1),
            hasta: NaiveDate::from_ymd_opt(2026, 3, 31),
            ..Default::default()
        };
        let query = buscar_pagos(&filters, None, &ListParams::default(), &PageSettings::default()).unwrap();
        assert!(query.filter.matches(&json!({"createdAt": "2026-03-31T23:59:00Z"})));
        assert!(query.filter.matches(&json!({"createdAt": "2026-03-01T00:00:00Z"})));
        assert!(!query.filter.matches(&json!({"createdAt": "2026-04-01T00:00:00Z"})));
    }

    #[test]
    fn test_free_text_and_tags() {
        let filters = PatientFilters {
            q: Some("hc0000".to_string()),
            etiquetas: Some("vip, ortodoncia".to_string()),
            ..Default::default()
        };
        let query = buscar_pacientes(&filters, None, &ListParams::default(), &PageSettings::default()).unwrap();
        let doc = json!({"numeroHistoriaClinica": "HC000012", "etiquetas": ["ortodoncia"]});
        assert!(query.filter.matches(&doc));
    }
}
