//! 收款记录

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ActorRef, RecordMeta, StatusEntry};
use crate::policy::Scoped;

/// 收款状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    #[default]
    Pendiente,
    Procesando,
    Completado,
    Fallido,
    Devuelto,
    Cancelado,
    Parcial,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pendiente => "pendiente",
            PaymentStatus::Procesando => "procesando",
            PaymentStatus::Completado => "completado",
            PaymentStatus::Fallido => "fallido",
            PaymentStatus::Devuelto => "devuelto",
            PaymentStatus::Cancelado => "cancelado",
            PaymentStatus::Parcial => "parcial",
        }
    }

    /// 已收款（可对账、可退款）
    pub fn is_collected(&self) -> bool {
        matches!(self, PaymentStatus::Completado | PaymentStatus::Parcial)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 支付方式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Efectivo,
    Tarjeta,
    Transferencia,
    Bizum,
    EnlacePago,
    Financiacion,
    Otro,
}

/// 支付网关
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Gateway {
    #[default]
    Manual,
    Stripe,
    Redsys,
    Paypal,
}

/// 对账信息
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Reconciliation {
    pub conciliado: bool,
    #[serde(default)]
    pub fecha: Option<DateTime<Utc>>,
    #[serde(default)]
    pub usuario: Option<ActorRef>,
    #[serde(default)]
    pub referencia_bancaria: Option<String>,
}

/// 收款
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: Uuid,
    pub numero: String,
    pub paciente: Uuid,
    pub paciente_nombre: String,
    #[serde(default)]
    pub presupuesto: Option<Uuid>,
    #[serde(default)]
    pub factura: Option<Uuid>,
    #[serde(default)]
    pub tratamiento: Option<Uuid>,
    #[serde(default)]
    pub cita: Option<Uuid>,
    pub concepto: String,
    pub importe: Decimal,
    #[serde(default)]
    pub comision: Decimal,
    /// importe − comision（服务端计算）
    #[serde(default)]
    pub neto: Decimal,
    pub moneda: String,
    pub metodo: PaymentMethod,
    #[serde(default)]
    pub pasarela: Gateway,
    #[serde(default)]
    pub referencia_externa: Option<String>,
    #[serde(default)]
    pub estado: PaymentStatus,
    #[serde(default)]
    pub historial_estados: Vec<StatusEntry<PaymentStatus>>,
    #[serde(default)]
    pub conciliacion: Reconciliation,
    #[serde(default)]
    pub importe_reembolsado: Decimal,
    #[serde(default)]
    pub fecha_pago: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notas: Option<String>,
    pub sede: String,
    #[serde(flatten)]
    pub meta: RecordMeta,
}

/// 创建收款请求
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPayment {
    pub paciente: Uuid,
    pub presupuesto: Option<Uuid>,
    pub factura: Option<Uuid>,
    pub tratamiento: Option<Uuid>,
    pub cita: Option<Uuid>,
    pub concepto: String,
    pub importe: Decimal,
    #[serde(default)]
    pub comision: Decimal,
    pub moneda: Option<String>,
    pub metodo: PaymentMethod,
    pub pasarela: Option<Gateway>,
    pub referencia_externa: Option<String>,
    pub estado: Option<PaymentStatus>,
    pub notas: Option<String>,
    pub sede: Option<String>,
}

/// 更新收款请求
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentUpdate {
    pub paciente: Option<Uuid>,
    pub presupuesto: Option<Uuid>,
    pub concepto: Option<String>,
    pub importe: Option<Decimal>,
    pub comision: Option<Decimal>,
    pub metodo: Option<PaymentMethod>,
    pub pasarela: Option<Gateway>,
    pub referencia_externa: Option<String>,
    pub notas: Option<String>,
    pub version: Option<i64>,
}

/// 对账请求
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileRequest {
    pub referencia_bancaria: Option<String>,
}

impl Payment {
    /// 尚可退款金额
    pub fn refundable(&self) -> Decimal {
        (self.importe - self.importe_reembolsado).max(Decimal::ZERO)
    }

    pub fn summary(&self) -> PaymentSummary {
        PaymentSummary {
            id: self.id,
            numero: self.numero.clone(),
            paciente: self.paciente,
            paciente_nombre: self.paciente_nombre.clone(),
            concepto: self.concepto.clone(),
            importe: self.importe,
            neto: self.neto,
            metodo: self.metodo,
            estado: self.estado,
            conciliado: self.conciliacion.conciliado,
            fecha_pago: self.fecha_pago,
            sede: self.sede.clone(),
        }
    }
}

impl Scoped for Payment {
    const LABEL: &'static str = "el pago";
    const OWN_RECORDS_MESSAGE: &'static str = "Solo puedes modificar tus propios pagos";

    fn sede(&self) -> &str {
        &self.sede
    }

    fn is_owned_by(&self, user_id: Uuid) -> bool {
        self.meta.creado_por.id == user_id
    }

    fn terminal_state(&self) -> Option<String> {
        if matches!(self.estado, PaymentStatus::Devuelto | PaymentStatus::Cancelado) {
            Some(self.estado.to_string())
        } else if self.conciliacion.conciliado {
            Some("conciliado".to_string())
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSummary {
    pub id: Uuid,
    pub numero: String,
    pub paciente: Uuid,
    pub paciente_nombre: String,
    pub concepto: String,
    pub importe: Decimal,
    pub neto: Decimal,
    pub metodo: PaymentMethod,
    pub estado: PaymentStatus,
    pub conciliado: bool,
    pub fecha_pago: Option<DateTime<Utc>>,
    pub sede: String,
}
