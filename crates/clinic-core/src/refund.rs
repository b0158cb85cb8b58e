//! 退款申请

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ActorRef, RecordMeta, StatusEntry};
use crate::policy::Scoped;

/// 退款状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    #[default]
    Solicitada,
    Revisando,
    Aprobada,
    Rechazada,
    Procesando,
    Completada,
    Fallida,
    Cancelada,
}

impl RefundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundStatus::Solicitada => "solicitada",
            RefundStatus::Revisando => "revisando",
            RefundStatus::Aprobada => "aprobada",
            RefundStatus::Rechazada => "rechazada",
            RefundStatus::Procesando => "procesando",
            RefundStatus::Completada => "completada",
            RefundStatus::Fallida => "fallida",
            RefundStatus::Cancelada => "cancelada",
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(
            self,
            RefundStatus::Completada | RefundStatus::Rechazada | RefundStatus::Cancelada
        )
    }
}

impl fmt::Display for RefundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 退款类别
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RefundCategory {
    ErrorCobro,
    Duplicado,
    TratamientoNoRealizado,
    Insatisfaccion,
    Cancelacion,
    Otro,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Approval {
    pub usuario: ActorRef,
    pub fecha: DateTime<Utc>,
    pub importe: Decimal,
    #[serde(default)]
    pub notas: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Rejection {
    pub usuario: ActorRef,
    pub fecha: DateTime<Utc>,
    pub motivo: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Processing {
    #[serde(default)]
    pub fecha_inicio: Option<DateTime<Utc>>,
    #[serde(default)]
    pub fecha_fin: Option<DateTime<Utc>>,
    #[serde(default)]
    pub referencia: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Refund {
    pub id: Uuid,
    pub numero: String,
    pub pago: Uuid,
    pub pago_numero: String,
    pub paciente: Uuid,
    pub paciente_nombre: String,
    pub importe_solicitado: Decimal,
    #[serde(default)]
    pub importe_aprobado: Option<Decimal>,
    pub categoria: RefundCategory,
    pub motivo: String,
    #[serde(default)]
    pub metodo_devolucion: Option<String>,
    #[serde(default)]
    pub estado: RefundStatus,
    #[serde(default)]
    pub aprobacion: Option<Approval>,
    #[serde(default)]
    pub rechazo: Option<Rejection>,
    #[serde(default)]
    pub procesamiento: Processing,
    #[serde(default)]
    pub historial_estados: Vec<StatusEntry<RefundStatus>>,
    pub sede: String,
    #[serde(flatten)]
    pub meta: RecordMeta,
}

/// 创建退款请求
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRefund {
    pub pago: Uuid,
    pub importe_solicitado: Decimal,
    pub categoria: RefundCategory,
    pub motivo: String,
    pub metodo_devolucion: Option<String>,
}

/// 退款状态变更请求
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundStatusRequest {
    pub estado: RefundStatus,
    pub motivo: Option<String>,
    pub observaciones: Option<String>,
    /// 审批金额（`aprobada`）
    pub importe_aprobado: Option<Decimal>,
    /// 处理参考号（`procesando`/`completada`）
    pub referencia: Option<String>,
    /// 失败原因（`fallida`）
    pub error: Option<String>,
}

/// 编辑退款请求（仅审批前）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundUpdate {
    pub importe_solicitado: Option<Decimal>,
    pub categoria: Option<RefundCategory>,
    pub motivo: Option<String>,
    pub metodo_devolucion: Option<String>,
    pub version: Option<i64>,
}

impl Refund {
    /// 尚未退还的金额
    pub fn importe_pendiente(&self) -> Decimal {
        if self.estado == RefundStatus::Completada {
            Decimal::ZERO
        } else {
            self.importe_aprobado.unwrap_or(self.importe_solicitado)
        }
    }

    pub fn summary(&self) -> RefundSummary {
        RefundSummary {
            id: self.id,
            numero: self.numero.clone(),
            pago_numero: self.pago_numero.clone(),
            paciente_nombre: self.paciente_nombre.clone(),
            importe_solicitado: self.importe_solicitado,
            importe_aprobado: self.importe_aprobado,
            categoria: self.categoria,
            estado: self.estado,
            sede: self.sede.clone(),
            created_at: self.meta.created_at,
        }
    }

    pub fn view(&self) -> RefundView {
        RefundView {
            refund: self.clone(),
            importe_pendiente: self.importe_pendiente(),
        }
    }
}

impl Scoped for Refund {
    const LABEL: &'static str = "la devolución";
    const OWN_RECORDS_MESSAGE: &'static str = "Solo puedes modificar tus propias devoluciones";

    fn sede(&self) -> &str {
        &self.sede
    }

    fn is_owned_by(&self, user_id: Uuid) -> bool {
        self.meta.creado_por.id == user_id
    }

    fn terminal_state(&self) -> Option<String> {
        self.estado.is_final().then(|| self.estado.to_string())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundSummary {
    pub id: Uuid,
    pub numero: String,
    pub pago_numero: String,
    pub paciente_nombre: String,
    pub importe_solicitado: Decimal,
    pub importe_aprobado: Option<Decimal>,
    pub categoria: RefundCategory,
    pub estado: RefundStatus,
    pub sede: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundView {
    #[serde(flatten)]
    pub refund: Refund,
    pub importe_pendiente: Decimal,
}
