//! 治疗预算（销售管线核心实体）

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ActorRef, RecordMeta, StatusEntry};
use crate::policy::Scoped;
use crate::utils::{days_until, hours_between};

/// 预算状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum BudgetStatus {
    #[default]
    Pendiente,
    Presentado,
    Aceptado,
    Perdido,
    Caducado,
    Cancelado,
}

impl BudgetStatus {
    pub const ALL: [BudgetStatus; 6] = [
        BudgetStatus::Pendiente,
        BudgetStatus::Presentado,
        BudgetStatus::Aceptado,
        BudgetStatus::Perdido,
        BudgetStatus::Caducado,
        BudgetStatus::Cancelado,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetStatus::Pendiente => "pendiente",
            BudgetStatus::Presentado => "presentado",
            BudgetStatus::Aceptado => "aceptado",
            BudgetStatus::Perdido => "perdido",
            BudgetStatus::Caducado => "caducado",
            BudgetStatus::Cancelado => "cancelado",
        }
    }

    /// 禁止普通角色编辑内容的终态
    pub fn is_locked(&self) -> bool {
        matches!(self, BudgetStatus::Aceptado | BudgetStatus::Perdido)
    }
}

impl fmt::Display for BudgetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 优先级
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Baja,
    #[default]
    Media,
    Alta,
    Urgente,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Baja => "baja",
            Priority::Media => "media",
            Priority::Alta => "alta",
            Priority::Urgente => "urgente",
        }
    }
}

/// 预算明细行
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BudgetItem {
    pub descripcion: String,
    pub cantidad: u32,
    pub precio_unitario: Decimal,
    /// 单项折扣百分比
    #[serde(default)]
    pub descuento: Decimal,
    #[serde(default)]
    pub categoria: Option<String>,
    /// 牙位编号
    #[serde(default)]
    pub pieza: Option<String>,
    /// 折后行金额（服务端计算）
    #[serde(default)]
    pub subtotal: Decimal,
}

/// 各阶段耗时（小时）
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BudgetMetrics {
    pub horas_en_pendiente: Option<f64>,
    pub horas_en_presentado: Option<f64>,
    pub horas_hasta_decision: Option<f64>,
}

/// 沟通渠道
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommunicationChannel {
    Telefono,
    Email,
    Whatsapp,
    Sms,
    Presencial,
}

/// 与患者的沟通记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Communication {
    pub tipo: CommunicationChannel,
    pub resumen: String,
    pub fecha: DateTime<Utc>,
    pub usuario: ActorRef,
    #[serde(default)]
    pub proximo_seguimiento: Option<DateTime<Utc>>,
}

/// 预算
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Budget {
    pub id: Uuid,
    pub numero: String,
    pub paciente: Uuid,
    pub paciente_nombre: String,
    pub profesional: ActorRef,
    pub items: Vec<BudgetItem>,
    #[serde(default)]
    pub descuento_global: Decimal,
    #[serde(default)]
    pub impuestos: Decimal,
    #[serde(default)]
    pub subtotal: Decimal,
    #[serde(default)]
    pub total: Decimal,
    #[serde(default)]
    pub estado: BudgetStatus,
    #[serde(default)]
    pub prioridad: Priority,
    pub validez_dias: u32,
    pub fecha_vencimiento: DateTime<Utc>,
    #[serde(default)]
    pub fecha_presentacion: Option<DateTime<Utc>>,
    #[serde(default)]
    pub fecha_aceptacion: Option<DateTime<Utc>>,
    #[serde(default)]
    pub fecha_rechazo: Option<DateTime<Utc>>,
    #[serde(default)]
    pub motivo_rechazo: Option<String>,
    #[serde(default)]
    pub metricas: BudgetMetrics,
    #[serde(default)]
    pub historial_estados: Vec<StatusEntry<BudgetStatus>>,
    #[serde(default)]
    pub comunicaciones: Vec<Communication>,
    #[serde(default)]
    pub etiquetas: Vec<String>,
    #[serde(default)]
    pub notas: Option<String>,
    pub sede: String,
    #[serde(flatten)]
    pub meta: RecordMeta,
}

/// 明细行输入
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetItemInput {
    pub descripcion: String,
    pub cantidad: u32,
    pub precio_unitario: Decimal,
    #[serde(default)]
    pub descuento: Decimal,
    pub categoria: Option<String>,
    pub pieza: Option<String>,
}

/// 创建预算请求
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewBudget {
    pub paciente: Uuid,
    /// 仅高级角色可指定，否则为当前用户
    pub profesional: Option<ActorRef>,
    pub items: Vec<BudgetItemInput>,
    #[serde(default)]
    pub descuento_global: Decimal,
    #[serde(default)]
    pub impuestos: Decimal,
    pub prioridad: Option<Priority>,
    pub validez_dias: Option<u32>,
    pub fecha_vencimiento: Option<DateTime<Utc>>,
    #[serde(default)]
    pub etiquetas: Vec<String>,
    pub notas: Option<String>,
    pub sede: Option<String>,
}

/// 更新预算请求
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetUpdate {
    pub paciente: Option<Uuid>,
    pub profesional: Option<ActorRef>,
    pub items: Option<Vec<BudgetItemInput>>,
    pub descuento_global: Option<Decimal>,
    pub impuestos: Option<Decimal>,
    pub prioridad: Option<Priority>,
    pub fecha_vencimiento: Option<DateTime<Utc>>,
    pub etiquetas: Option<Vec<String>>,
    pub notas: Option<String>,
    pub version: Option<i64>,
}

/// 新增沟通记录请求
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCommunication {
    pub tipo: CommunicationChannel,
    pub resumen: String,
    pub proximo_seguimiento: Option<DateTime<Utc>>,
}

impl BudgetItemInput {
    pub fn into_item(self) -> BudgetItem {
        BudgetItem {
            descripcion: self.descripcion.trim().to_string(),
            cantidad: self.cantidad,
            precio_unitario: self.precio_unitario,
            descuento: self.descuento,
            categoria: self.categoria,
            pieza: self.pieza,
            subtotal: Decimal::ZERO,
        }
    }
}

impl Budget {
    /// 是否已过期（仅对未决预算有意义）
    pub fn esta_vencido(&self, now: DateTime<Utc>) -> bool {
        matches!(self.estado, BudgetStatus::Pendiente | BudgetStatus::Presentado)
            && self.fecha_vencimiento < now
    }

    /// 剩余天数，仅在 `presentado` 状态下有值
    pub fn dias_restantes(&self, now: DateTime<Utc>) -> Option<i64> {
        (self.estado == BudgetStatus::Presentado).then(|| days_until(self.fecha_vencimiento, now))
    }

    /// 进入当前状态以来的小时数
    pub fn tiempo_en_estado_actual(&self, now: DateTime<Utc>) -> f64 {
        let since = self
            .historial_estados
            .last()
            .map(|entry| entry.fecha)
            .unwrap_or(self.meta.created_at);
        hours_between(since, now)
    }

    pub fn summary(&self, now: DateTime<Utc>) -> BudgetSummary {
        BudgetSummary {
            id: self.id,
            numero: self.numero.clone(),
            paciente: self.paciente,
            paciente_nombre: self.paciente_nombre.clone(),
            profesional: self.profesional.clone(),
            total: self.total,
            estado: self.estado,
            prioridad: self.prioridad,
            sede: self.sede.clone(),
            fecha_vencimiento: self.fecha_vencimiento,
            dias_restantes: self.dias_restantes(now),
            created_at: self.meta.created_at,
        }
    }

    pub fn view(&self, now: DateTime<Utc>) -> BudgetView {
        BudgetView {
            budget: self.clone(),
            esta_vencido: self.esta_vencido(now),
            dias_restantes: self.dias_restantes(now),
            tiempo_en_estado_actual: self.tiempo_en_estado_actual(now),
        }
    }
}

impl Scoped for Budget {
    const LABEL: &'static str = "el presupuesto";
    const OWN_RECORDS_MESSAGE: &'static str = "Solo puedes modificar tus propios presupuestos";

    fn sede(&self) -> &str {
        &self.sede
    }

    fn is_owned_by(&self, user_id: Uuid) -> bool {
        self.profesional.id == user_id
    }

    fn terminal_state(&self) -> Option<String> {
        self.estado.is_locked().then(|| self.estado.to_string())
    }

    fn allows_self_delete(&self, user_id: Uuid) -> bool {
        self.meta.creado_por.id == user_id && self.estado == BudgetStatus::Pendiente
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetSummary {
    pub id: Uuid,
    pub numero: String,
    pub paciente: Uuid,
    pub paciente_nombre: String,
    pub profesional: ActorRef,
    pub total: Decimal,
    pub estado: BudgetStatus,
    pub prioridad: Priority,
    pub sede: String,
    pub fecha_vencimiento: DateTime<Utc>,
    pub dias_restantes: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// 带计算字段的详情视图
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetView {
    #[serde(flatten)]
    pub budget: Budget,
    pub esta_vencido: bool,
    pub dias_restantes: Option<i64>,
    pub tiempo_en_estado_actual: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AccessGuard, CallerContext, ClinicError, Role};

    fn caller(role: Role) -> CallerContext {
        CallerContext {
            id: Uuid::new_v4(),
            nombre: "Recepción Madrid".to_string(),
            role,
            sede: Some("madrid".to_string()),
        }
    }

    fn budget_created_by(creator: &CallerContext) -> Budget {
        let now = Utc::now();
        Budget {
            id: Uuid::new_v4(),
            numero: "PRES-2026-00001".to_string(),
            paciente: Uuid::new_v4(),
            paciente_nombre: "Ana García".to_string(),
            profesional: ActorRef::new(Uuid::new_v4(), "Dr. Pérez"),
            items: Vec::new(),
            descuento_global: Decimal::ZERO,
            impuestos: Decimal::ZERO,
            subtotal: Decimal::ZERO,
            total: Decimal::ZERO,
            estado: BudgetStatus::Pendiente,
            prioridad: Priority::default(),
            validez_dias: 30,
            fecha_vencimiento: now + chrono::Duration::days(30),
            fecha_presentacion: None,
            fecha_aceptacion: None,
            fecha_rechazo: None,
            motivo_rechazo: None,
            metricas: BudgetMetrics::default(),
            historial_estados: Vec::new(),
            comunicaciones: Vec::new(),
            etiquetas: Vec::new(),
            notas: None,
            sede: "madrid".to_string(),
            meta: RecordMeta::new(creator.actor(), now),
        }
    }

    #[test]
    fn test_creator_deletes_own_pending_budget() {
        let creator = caller(Role::Receptionist);
        let budget = budget_created_by(&creator);
        assert!(budget.allows_self_delete(creator.id));
        assert!(AccessGuard::ensure_can_delete(&creator, &budget).is_ok());
    }

    #[test]
    fn test_self_delete_denied_to_other_users() {
        let creator = caller(Role::Receptionist);
        let budget = budget_created_by(&creator);

        // 即使是预算的负责专业人员也不能删除
        let profesional = CallerContext {
            id: budget.profesional.id,
            ..caller(Role::ClinicalProfessional)
        };
        for other in [caller(Role::Receptionist), caller(Role::AdminSede), profesional] {
            assert!(!budget.allows_self_delete(other.id));
            assert!(matches!(
                AccessGuard::ensure_can_delete(&other, &budget),
                Err(ClinicError::Forbidden(_))
            ));
        }
    }

    #[test]
    fn test_self_delete_ends_once_presented() {
        let creator = caller(Role::Receptionist);
        let mut budget = budget_created_by(&creator);
        for estado in [BudgetStatus::Presentado, BudgetStatus::Caducado, BudgetStatus::Cancelado] {
            budget.estado = estado;
            assert!(!budget.allows_self_delete(creator.id), "{estado}");
            assert!(AccessGuard::ensure_can_delete(&creator, &budget).is_err());
        }
    }
}
