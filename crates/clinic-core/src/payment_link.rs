//! 支付链接：可分享、带令牌、限时的收款请求

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{RecordMeta, StatusEntry};
use crate::policy::Scoped;

/// 支付链接状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    #[default]
    Activo,
    Pagado,
    Vencido,
    Cancelado,
    Suspendido,
}

impl LinkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkStatus::Activo => "activo",
            LinkStatus::Pagado => "pagado",
            LinkStatus::Vencido => "vencido",
            LinkStatus::Cancelado => "cancelado",
            LinkStatus::Suspendido => "suspendido",
        }
    }
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 安全锁定信息
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LinkSecurity {
    pub bloqueado: bool,
    #[serde(default)]
    pub fecha_bloqueo: Option<DateTime<Utc>>,
    #[serde(default)]
    pub motivo_bloqueo: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentLink {
    pub id: Uuid,
    pub numero: String,
    pub token: String,
    pub paciente: Uuid,
    pub paciente_nombre: String,
    #[serde(default)]
    pub presupuesto: Option<Uuid>,
    pub concepto: String,
    pub importe: Decimal,
    pub moneda: String,
    pub fecha_expiracion: DateTime<Utc>,
    #[serde(default)]
    pub estado: LinkStatus,
    #[serde(default)]
    pub visualizaciones: u32,
    #[serde(default)]
    pub ultima_visualizacion: Option<DateTime<Utc>>,
    #[serde(default)]
    pub intentos: u32,
    pub limite_tentativas: u32,
    #[serde(default)]
    pub seguridad: LinkSecurity,
    #[serde(default)]
    pub pago: Option<Uuid>,
    #[serde(default)]
    pub fecha_pago: Option<DateTime<Utc>>,
    #[serde(default)]
    pub historial_estados: Vec<StatusEntry<LinkStatus>>,
    pub sede: String,
    #[serde(flatten)]
    pub meta: RecordMeta,
}

/// 创建支付链接请求
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPaymentLink {
    pub paciente: Uuid,
    pub presupuesto: Option<Uuid>,
    pub concepto: String,
    pub importe: Decimal,
    pub moneda: Option<String>,
    pub dias_validez: Option<u32>,
    pub limite_tentativas: Option<u32>,
    pub sede: Option<String>,
}

/// 更新支付链接请求（仅 `activo` 链接）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentLinkUpdate {
    pub concepto: Option<String>,
    pub importe: Option<Decimal>,
    pub fecha_expiracion: Option<DateTime<Utc>>,
    pub limite_tentativas: Option<u32>,
    pub version: Option<i64>,
}

/// 续期请求
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenewRequest {
    pub dias_validez: Option<u32>,
    pub motivo: Option<String>,
}

/// 标记已支付请求
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkPaymentRequest {
    pub pasarela: Option<crate::payment::Gateway>,
    pub referencia_externa: Option<String>,
    #[serde(default)]
    pub comision: Decimal,
}

/// 公开访问时的支付尝试结果
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRequest {
    #[serde(default)]
    pub detalle: Option<String>,
}

impl PaymentLink {
    pub fn esta_vencido(&self, now: DateTime<Utc>) -> bool {
        self.fecha_expiracion < now
    }

    pub fn url_path(&self) -> String {
        format!("/pago/{}", self.token)
    }

    pub fn summary(&self) -> PaymentLinkSummary {
        PaymentLinkSummary {
            id: self.id,
            numero: self.numero.clone(),
            paciente: self.paciente,
            paciente_nombre: self.paciente_nombre.clone(),
            concepto: self.concepto.clone(),
            importe: self.importe,
            estado: self.estado,
            fecha_expiracion: self.fecha_expiracion,
            visualizaciones: self.visualizaciones,
            intentos: self.intentos,
            sede: self.sede.clone(),
        }
    }

    pub fn view(&self, now: DateTime<Utc>) -> PaymentLinkView {
        PaymentLinkView {
            link: self.clone(),
            esta_vencido: self.esta_vencido(now),
            url: self.url_path(),
        }
    }

    /// 面向患者的公开视图，不暴露内部字段
    pub fn public_view(&self) -> PublicPaymentLink {
        PublicPaymentLink {
            numero: self.numero.clone(),
            paciente_nombre: self.paciente_nombre.clone(),
            concepto: self.concepto.clone(),
            importe: self.importe,
            moneda: self.moneda.clone(),
            fecha_expiracion: self.fecha_expiracion,
            estado: self.estado,
        }
    }
}

impl Scoped for PaymentLink {
    const LABEL: &'static str = "el enlace de pago";
    const OWN_RECORDS_MESSAGE: &'static str = "Solo puedes modificar tus propios enlaces de pago";

    fn sede(&self) -> &str {
        &self.sede
    }

    fn is_owned_by(&self, user_id: Uuid) -> bool {
        self.meta.creado_por.id == user_id
    }

    fn terminal_state(&self) -> Option<String> {
        (self.estado == LinkStatus::Pagado).then(|| self.estado.to_string())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentLinkSummary {
    pub id: Uuid,
    pub numero: String,
    pub paciente: Uuid,
    pub paciente_nombre: String,
    pub concepto: String,
    pub importe: Decimal,
    pub estado: LinkStatus,
    pub fecha_expiracion: DateTime<Utc>,
    pub visualizaciones: u32,
    pub intentos: u32,
    pub sede: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentLinkView {
    #[serde(flatten)]
    pub link: PaymentLink,
    pub esta_vencido: bool,
    pub url: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicPaymentLink {
    pub numero: String,
    pub paciente_nombre: String,
    pub concepto: String,
    pub importe: Decimal,
    pub moneda: String,
    pub fecha_expiracion: DateTime<Utc>,
    pub estado: LinkStatus,
}
