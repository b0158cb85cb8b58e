//! 预算销售管线
//!
//! 负责预算的创建、编辑、状态流转、阶段耗时指标和沟通记录。

use chrono::{DateTime, Duration, Utc};
use clinic_core::budget::{
    BudgetMetrics, BudgetUpdate, Communication, NewBudget, NewCommunication,
};
use clinic_core::utils::{hours_between, normalize_optional, require_text};
use clinic_core::{
    ActorRef, Budget, BudgetStatus, ClinicError, RecordMeta, Result, StatusChangeRequest,
    StatusEntry,
};

use crate::context::{Origin, PatientSnapshot};
use crate::pricing::{reprice, PricingLimits};
use crate::state_machine::StateMachine;

/// 有效期天数上限
pub const MAX_VALIDITY_DAYS: u32 = 365;

/// 由有效期天数计算到期时间
fn validity_expiry(now: DateTime<Utc>, dias: u32) -> Result<DateTime<Utc>> {
    if dias == 0 || dias > MAX_VALIDITY_DAYS {
        return Err(ClinicError::validation(format!(
            "La validez del presupuesto debe estar entre 1 y {} días",
            MAX_VALIDITY_DAYS
        )));
    }
    now.checked_add_signed(Duration::days(i64::from(dias)))
        .ok_or_else(|| ClinicError::validation("Fecha de vencimiento fuera de rango"))
}

/// 预算管线
#[derive(Debug)]
pub struct BudgetPipeline {
    state_machine: StateMachine<BudgetStatus>,
    limits: PricingLimits,
    default_validity_days: u32,
}

impl BudgetPipeline {
    pub fn new(limits: PricingLimits, default_validity_days: u32) -> Self {
        Self {
            state_machine: StateMachine::new(),
            limits,
            default_validity_days,
        }
    }

    pub fn state_machine(&self) -> &StateMachine<BudgetStatus> {
        &self.state_machine
    }

    pub fn limits(&self) -> &PricingLimits {
        &self.limits
    }

    /// 创建预算：初始状态 `pendiente`，编号在创建时一次性分配
    pub fn create(
        &self,
        input: NewBudget,
        patient: &PatientSnapshot,
        origin: &Origin<'_>,
    ) -> Result<Budget> {
        let now = origin.now;
        let actor = origin.actor();
        let sede = origin
            .caller
            .resolve_sede(input.sede.or_else(|| Some(patient.sede.clone())))?;
        let validez_dias = input.validez_dias.unwrap_or(self.default_validity_days);
        let default_expiry = validity_expiry(now, validez_dias)?;
        let fecha_vencimiento = match input.fecha_vencimiento {
            Some(fecha) if fecha <= now => {
                return Err(ClinicError::validation(
                    "La fecha de vencimiento debe ser futura",
                ))
            }
            Some(fecha) => fecha,
            None => default_expiry,
        };

        // 非高级角色只能为自己建预算
        let profesional = match input.profesional {
            Some(profesional) if origin.caller.role.is_elevated() => profesional,
            _ => actor.clone(),
        };

        let mut budget = Budget {
            id: origin.id,
            numero: origin.numero.clone(),
            paciente: patient.id,
            paciente_nombre: patient.nombre.clone(),
            profesional,
            items: input.items.into_iter().map(|item| item.into_item()).collect(),
            descuento_global: input.descuento_global,
            impuestos: input.impuestos,
            subtotal: Default::default(),
            total: Default::default(),
            estado: BudgetStatus::Pendiente,
            prioridad: input.prioridad.unwrap_or_default(),
            validez_dias,
            fecha_vencimiento,
            fecha_presentacion: None,
            fecha_aceptacion: None,
            fecha_rechazo: None,
            motivo_rechazo: None,
            metricas: BudgetMetrics::default(),
            historial_estados: vec![StatusEntry::new(
                BudgetStatus::Pendiente,
                now,
                actor.clone(),
                Some("Presupuesto creado".to_string()),
                None,
            )],
            comunicaciones: Vec::new(),
            etiquetas: input.etiquetas,
            notas: normalize_optional(input.notas),
            sede,
            meta: RecordMeta::new(actor, now),
        };
        self.prepare_for_save(&mut budget)?;

        tracing::info!(budget = %budget.numero, total = %budget.total, "budget created");
        Ok(budget)
    }

    /// 编辑预算内容；患者/专业人员变化时刷新反规范化的名称
    pub fn update(
        &self,
        budget: &mut Budget,
        update: BudgetUpdate,
        new_patient: Option<&PatientSnapshot>,
        actor: &ActorRef,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut draft = budget.clone();

        if let Some(patient) = new_patient {
            if patient.id != draft.paciente {
                draft.paciente = patient.id;
                draft.paciente_nombre = patient.nombre.clone();
            }
        }
        if let Some(profesional) = update.profesional {
            if profesional.id != draft.profesional.id {
                draft.profesional = profesional;
            }
        }
        if let Some(items) = update.items {
            draft.items = items.into_iter().map(|item| item.into_item()).collect();
        }
        if let Some(descuento) = update.descuento_global {
            draft.descuento_global = descuento;
        }
        if let Some(impuestos) = update.impuestos {
            draft.impuestos = impuestos;
        }
        if let Some(prioridad) = update.prioridad {
            draft.prioridad = prioridad;
        }
        if let Some(fecha) = update.fecha_vencimiento {
            if fecha <= now {
                return Err(ClinicError::validation(
                    "La fecha de vencimiento debe ser futura",
                ));
            }
            draft.fecha_vencimiento = fecha;
        }
        if let Some(etiquetas) = update.etiquetas {
            draft.etiquetas = etiquetas;
        }
        if update.notas.is_some() {
            draft.notas = normalize_optional(update.notas);
        }

        self.prepare_for_save(&mut draft)?;
        draft.meta.touch(actor, now);
        *budget = draft;
        Ok(())
    }

    /// 状态流转；失败时预算保持不变
    pub fn change_status(
        &self,
        budget: &mut Budget,
        request: StatusChangeRequest<BudgetStatus>,
        actor: &ActorRef,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let from = budget.estado;
        let to = self.state_machine.transition(from, request.estado)?;

        let motivo_rechazo = normalize_optional(request.motivo_rechazo);
        if to == BudgetStatus::Perdido && motivo_rechazo.is_none() {
            return Err(ClinicError::MissingReason(
                "El motivo de rechazo es obligatorio para marcar el presupuesto como perdido"
                    .to_string(),
            ));
        }
        // 过期后重新提交时顺延有效期
        let extended_expiry = if to == BudgetStatus::Presentado
            && from == BudgetStatus::Caducado
            && budget.fecha_vencimiento <= now
        {
            Some(validity_expiry(now, budget.validez_dias)?)
        } else {
            None
        };

        budget.estado = to;
        match to {
            BudgetStatus::Presentado => {
                budget.fecha_presentacion.get_or_insert(now);
                if let Some(fecha) = extended_expiry {
                    budget.fecha_vencimiento = fecha;
                }
            }
            BudgetStatus::Aceptado => {
                budget.fecha_aceptacion.get_or_insert(now);
            }
            BudgetStatus::Perdido | BudgetStatus::Cancelado => {
                budget.fecha_rechazo.get_or_insert(now);
            }
            BudgetStatus::Pendiente | BudgetStatus::Caducado => {}
        }
        if to == BudgetStatus::Perdido {
            budget.motivo_rechazo = motivo_rechazo;
        }

        budget.historial_estados.push(StatusEntry::new(
            to,
            now,
            actor.clone(),
            normalize_optional(request.motivo),
            normalize_optional(request.observaciones),
        ));
        budget.metricas = compute_metrics(budget);
        budget.meta.touch(actor, now);

        tracing::info!(budget = %budget.numero, %from, %to, "budget status changed");
        Ok(())
    }

    /// 追加沟通记录
    pub fn add_communication(
        &self,
        budget: &mut Budget,
        input: NewCommunication,
        actor: &ActorRef,
        now: DateTime<Utc>,
    ) -> Result<()> {
        require_text("El resumen", &input.resumen, 1000)?;
        if let Some(seguimiento) = input.proximo_seguimiento {
            if seguimiento <= now {
                return Err(ClinicError::validation(
                    "La fecha de seguimiento debe ser futura",
                ));
            }
        }
        budget.comunicaciones.push(Communication {
            tipo: input.tipo,
            resumen: input.resumen.trim().to_string(),
            fecha: now,
            usuario: actor.clone(),
            proximo_seguimiento: input.proximo_seguimiento,
        });
        budget.meta.touch(actor, now);
        Ok(())
    }

    /// 保存前钩子：重算金额和阶段指标
    pub fn prepare_for_save(&self, budget: &mut Budget) -> Result<()> {
        reprice(budget, &self.limits)?;
        budget.metricas = compute_metrics(budget);
        Ok(())
    }
}

/// 阶段耗时指标
pub fn compute_metrics(budget: &Budget) -> BudgetMetrics {
    let created = budget.meta.created_at;
    let decision = budget.fecha_aceptacion.or(budget.fecha_rechazo);
    BudgetMetrics {
        horas_en_pendiente: budget
            .fecha_presentacion
            .map(|presentado| hours_between(created, presentado)),
        horas_en_presentado: budget
            .fecha_presentacion
            .zip(decision)
            .map(|(presentado, decidido)| hours_between(presentado, decidido)),
        horas_hasta_decision: decision.map(|decidido| hours_between(created, decidido)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clinic_core::budget::BudgetItemInput;
    use clinic_core::{CallerContext, Role};
    use rust_decimal::Decimal;
    use uuid::Uuid;

    fn caller() -> CallerContext {
        CallerContext {
            id: Uuid::new_v4(),
            nombre: "Dr. Pérez".to_string(),
            role: Role::ClinicalProfessional,
            sede: Some("madrid".to_string()),
        }
    }

    fn patient() -> PatientSnapshot {
        PatientSnapshot {
            id: Uuid::new_v4(),
            nombre: "Ana García".to_string(),
            sede: "madrid".to_string(),
        }
    }

    fn new_budget() -> NewBudget {
        NewBudget {
            paciente: Uuid::new_v4(),
            profesional: None,
            items: vec![BudgetItemInput {
                descripcion: "Corona cerámica".to_string(),
                cantidad: 2,
                precio_unitario: Decimal::from(100),
                descuento: Decimal::from(10),
                categoria: Some("protesis".to_string()),
                pieza: Some("36".to_string()),
            }],
            descuento_global: Decimal::ZERO,
            impuestos: Decimal::from(21),
            prioridad: None,
            validez_dias: None,
            fecha_vencimiento: None,
            etiquetas: vec![],
            notas: None,
            sede: None,
        }
    }

    fn created(at: DateTime<Utc>) -> (BudgetPipeline, Budget, CallerContext) {
        let pipeline = BudgetPipeline::new(PricingLimits::default(), 30);
        let caller = caller();
        let origin = Origin::new("PRES-2026-00001".to_string(), &caller, at);
        let budget = pipeline.create(new_budget(), &patient(), &origin).unwrap();
        (pipeline, budget, caller)
    }

    fn change(estado: BudgetStatus) -> StatusChangeRequest<BudgetStatus> {
        StatusChangeRequest {
            estado,
            motivo: None,
            observaciones: None,
            motivo_rechazo: None,
        }
    }

    #[test]
    fn test_create_computes_totals_and_defaults() {
        let now = Utc::now();
        let (_, budget, caller) = created(now);
        assert_eq!(budget.subtotal, Decimal::new(18000, 2));
        assert_eq!(budget.total, Decimal::new(21780, 2));
        assert_eq!(budget.estado, BudgetStatus::Pendiente);
        assert_eq!(budget.fecha_vencimiento, now + Duration::days(30));
        assert_eq!(budget.profesional.id, caller.id);
        assert_eq!(budget.sede, "madrid");
        assert_eq!(budget.historial_estados.len(), 1);
    }

    #[test]
    fn test_validity_days_are_bounded() {
        let pipeline = BudgetPipeline::new(PricingLimits::default(), 30);
        let caller = caller();
        let now = Utc::now();
        for dias in [0, MAX_VALIDITY_DAYS + 1, u32::MAX] {
            let origin = Origin::new("PRES-2026-00002".to_string(), &caller, now);
            let input = NewBudget {
                validez_dias: Some(dias),
                ..new_budget()
            };
            let result = pipeline.create(input, &patient(), &origin);
            assert!(matches!(result, Err(ClinicError::Validation(_))), "dias = {dias}");
        }

        // 显式到期日不绕过天数检查
        let origin = Origin::new("PRES-2026-00003".to_string(), &caller, now);
        let input = NewBudget {
            validez_dias: Some(u32::MAX),
            fecha_vencimiento: Some(now + Duration::days(10)),
            ..new_budget()
        };
        assert!(pipeline.create(input, &patient(), &origin).is_err());

        let origin = Origin::new("PRES-2026-00004".to_string(), &caller, now);
        let input = NewBudget {
            validez_dias: Some(MAX_VALIDITY_DAYS),
            ..new_budget()
        };
        let budget = pipeline.create(input, &patient(), &origin).unwrap();
        assert_eq!(budget.fecha_vencimiento, now + Duration::days(365));
    }

    #[test]
    fn test_expired_resubmission_with_bad_validity_leaves_budget_untouched() {
        let (pipeline, mut budget, caller) = created(Utc::now() - Duration::days(40));
        budget.estado = BudgetStatus::Caducado;
        budget.fecha_vencimiento = Utc::now() - Duration::days(1);
        budget.validez_dias = u32::MAX;
        let before = budget.clone();

        let result = pipeline.change_status(
            &mut budget,
            change(BudgetStatus::Presentado),
            &caller.actor(),
            Utc::now(),
        );
        assert!(matches!(result, Err(ClinicError::Validation(_))));
        assert_eq!(budget, before);

        budget.validez_dias = 15;
        let now = Utc::now();
        pipeline
            .change_status(&mut budget, change(BudgetStatus::Presentado), &caller.actor(), now)
            .unwrap();
        assert_eq!(budget.estado, BudgetStatus::Presentado);
        assert_eq!(budget.fecha_vencimiento, now + Duration::days(15));
    }

    #[test]
    fn test_only_elevated_roles_assign_another_professional() {
        let pipeline = BudgetPipeline::new(PricingLimits::default(), 30);
        let other = ActorRef {
            id: Uuid::new_v4(),
            nombre: "Dra. López".to_string(),
        };
        let input = || NewBudget {
            profesional: Some(other.clone()),
            ..new_budget()
        };

        let professional = caller();
        let origin = Origin::new("PRES-2026-00005".to_string(), &professional, Utc::now());
        let budget = pipeline.create(input(), &patient(), &origin).unwrap();
        assert_eq!(budget.profesional.id, professional.id);

        let admin = CallerContext {
            role: Role::AdminSede,
            ..caller()
        };
        let origin = Origin::new("PRES-2026-00006".to_string(), &admin, Utc::now());
        let budget = pipeline.create(input(), &patient(), &origin).unwrap();
        assert_eq!(budget.profesional.id, other.id);
    }

    #[test]
    fn test_invalid_transition_leaves_budget_untouched() {
        let (pipeline, mut budget, caller) = created(Utc::now());
        let before = budget.clone();
        let result = pipeline.change_status(
            &mut budget,
            change(BudgetStatus::Aceptado),
            &caller.actor(),
            Utc::now(),
        );
        assert!(matches!(result, Err(ClinicError::InvalidTransition { .. })));
        assert_eq!(budget, before);
    }

    #[test]
    fn test_lost_requires_reason_and_sets_rejection_date_once() {
        let t0 = Utc::now() - Duration::days(10);
        let (pipeline, mut budget, caller) = created(t0);
        let actor = caller.actor();

        pipeline
            .change_status(&mut budget, change(BudgetStatus::Presentado), &actor, t0 + Duration::hours(24))
            .unwrap();

        let before = budget.clone();
        let missing = pipeline.change_status(
            &mut budget,
            change(BudgetStatus::Perdido),
            &actor,
            t0 + Duration::hours(48),
        );
        assert!(matches!(missing, Err(ClinicError::MissingReason(_))));
        assert_eq!(budget, before);

        let first_loss = t0 + Duration::hours(48);
        let mut lost = change(BudgetStatus::Perdido);
        lost.motivo_rechazo = Some("Precio".to_string());
        pipeline.change_status(&mut budget, lost.clone(), &actor, first_loss).unwrap();
        assert_eq!(budget.fecha_rechazo, Some(first_loss));
        assert_eq!(budget.motivo_rechazo.as_deref(), Some("Precio"));

        // 重新激活后再次丢失，fechaRechazo 保持第一次的值
        pipeline
            .change_status(&mut budget, change(BudgetStatus::Presentado), &actor, t0 + Duration::hours(72))
            .unwrap();
        pipeline
            .change_status(&mut budget, lost, &actor, t0 + Duration::hours(96))
            .unwrap();
        assert_eq!(budget.fecha_rechazo, Some(first_loss));
        assert_eq!(budget.fecha_presentacion, Some(t0 + Duration::hours(24)));
        assert_eq!(budget.historial_estados.len(), 5);
    }

    #[test]
    fn test_time_in_stage_metrics() {
        let t0 = Utc::now() - Duration::days(5);
        let (pipeline, mut budget, caller) = created(t0);
        let actor = caller.actor();
        pipeline
            .change_status(&mut budget, change(BudgetStatus::Presentado), &actor, t0 + Duration::hours(10))
            .unwrap();
        pipeline
            .change_status(&mut budget, change(BudgetStatus::Aceptado), &actor, t0 + Duration::hours(40))
            .unwrap();
        assert_eq!(budget.metricas.horas_en_pendiente, Some(10.0));
        assert_eq!(budget.metricas.horas_en_presentado, Some(30.0));
        assert_eq!(budget.metricas.horas_hasta_decision, Some(40.0));
    }

    #[test]
    fn test_dias_restantes_only_when_presented() {
        let now = Utc::now();
        let (pipeline, mut budget, caller) = created(now);
        assert_eq!(budget.dias_restantes(now), None);

        pipeline
            .change_status(&mut budget, change(BudgetStatus::Presentado), &caller.actor(), now)
            .unwrap();
        let later = now + Duration::hours(12);
        let expected =
            ((budget.fecha_vencimiento - later).num_milliseconds() as f64 / 86_400_000.0).ceil() as i64;
        assert_eq!(budget.dias_restantes(later), Some(expected));
        assert_eq!(expected, 30);
        assert!(!budget.esta_vencido(later));
        assert!(budget.esta_vencido(now + Duration::days(31)));
    }

    #[test]
    fn test_update_reprices_and_refreshes_patient_snapshot() {
        let (pipeline, mut budget, caller) = created(Utc::now());
        let other = PatientSnapshot {
            id: Uuid::new_v4(),
            nombre: "Luis Martín".to_string(),
            sede: "madrid".to_string(),
        };
        let update = BudgetUpdate {
            descuento_global: Some(Decimal::from(10)),
            ..Default::default()
        };
        pipeline
            .update(&mut budget, update, Some(&other), &caller.actor(), Utc::now())
            .unwrap();
        assert_eq!(budget.paciente_nombre, "Luis Martín");
        assert_eq!(budget.total, Decimal::new(19602, 2));

        let bad = BudgetUpdate {
            impuestos: Some(Decimal::from(80)),
            ..Default::default()
        };
        let before = budget.clone();
        assert!(pipeline
            .update(&mut budget, bad, None, &caller.actor(), Utc::now())
            .is_err());
        assert_eq!(budget, before);
    }

    #[test]
    fn test_communication_log() {
        let now = Utc::now();
        let (pipeline, mut budget, caller) = created(now);
        pipeline
            .add_communication(
                &mut budget,
                NewCommunication {
                    tipo: clinic_core::budget::CommunicationChannel::Telefono,
                    resumen: "Paciente pide financiación".to_string(),
                    proximo_seguimiento: Some(now + Duration::days(2)),
                },
                &caller.actor(),
                now,
            )
            .unwrap();
        assert_eq!(budget.comunicaciones.len(), 1);
    }
}
