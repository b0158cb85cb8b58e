//! 统计报表
//!
//! 把存储层的分组聚合结果整理成接口返回的报表结构，只读。

use clinic_core::utils::round_money;
use clinic_core::{BudgetStatus, GroupBucket};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;

/// 通用统计：总数、总额、按状态与月份分组
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatsReport {
    pub total: u64,
    pub importe_total: Decimal,
    pub por_estado: Vec<GroupBucket>,
    pub por_mes: Vec<GroupBucket>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub por_profesional: Option<Vec<GroupBucket>>,
}

impl StatsReport {
    pub fn new(por_estado: Vec<GroupBucket>, por_mes: Vec<GroupBucket>) -> Self {
        let total = por_estado.iter().map(|b| b.count).sum();
        let importe_total = round_money(por_estado.iter().map(|b| b.sum).sum());
        Self {
            total,
            importe_total,
            por_estado,
            por_mes,
            por_profesional: None,
        }
    }

    pub fn with_professionals(mut self, por_profesional: Vec<GroupBucket>) -> Self {
        self.por_profesional = Some(por_profesional);
        self
    }
}

/// 管线阶段
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStage {
    pub estado: BudgetStatus,
    pub cantidad: u64,
    pub importe: Decimal,
}

/// 管线统计
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStats {
    pub etapas: Vec<PipelineStage>,
    pub total_presupuestos: u64,
    pub importe_aceptado: Decimal,
    /// aceptados / (aceptados + perdidos) × 100
    pub tasa_conversion: Option<f64>,
    pub horas_medias_hasta_decision: Option<f64>,
}

impl PipelineStats {
    /// `by_status` 按状态分组求和 `total`；`decision_hours` 按状态分组求和 `horasHastaDecision`
    pub fn from_buckets(by_status: &[GroupBucket], decision_hours: &[GroupBucket]) -> Self {
        let find = |buckets: &[GroupBucket], estado: BudgetStatus| {
            buckets
                .iter()
                .find(|b| b.key == estado.as_str())
                .map(|b| (b.count, b.sum))
                .unwrap_or((0, Decimal::ZERO))
        };

        let etapas: Vec<PipelineStage> = BudgetStatus::ALL
            .into_iter()
            .map(|estado| {
                let (cantidad, importe) = find(by_status, estado);
                PipelineStage {
                    estado,
                    cantidad,
                    importe: round_money(importe),
                }
            })
            .collect();

        let (aceptados, importe_aceptado) = find(by_status, BudgetStatus::Aceptado);
        let (perdidos, _) = find(by_status, BudgetStatus::Perdido);
        let decididos = aceptados + perdidos;
        let tasa_conversion = (decididos > 0)
            .then(|| round2(aceptados as f64 * 100.0 / decididos as f64));

        let (n_aceptados, h_aceptados) = find(decision_hours, BudgetStatus::Aceptado);
        let (n_perdidos, h_perdidos) = find(decision_hours, BudgetStatus::Perdido);
        let n = n_aceptados + n_perdidos;
        let horas_medias_hasta_decision = (n > 0).then(|| {
            let horas = (h_aceptados + h_perdidos).to_f64().unwrap_or_default();
            round2(horas / n as f64)
        });

        Self {
            total_presupuestos: etapas.iter().map(|e| e.cantidad).sum(),
            etapas,
            importe_aceptado: round_money(importe_aceptado),
            tasa_conversion,
            horas_medias_hasta_decision,
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
