//! 退款审批与处理

use chrono::{DateTime, Utc};
use clinic_core::policy::permissions;
use clinic_core::refund::{
    Approval, NewRefund, Processing, Rejection, RefundStatusRequest, RefundUpdate,
};
use clinic_core::utils::{normalize_optional, require_text, round_money};
use clinic_core::{
    ActorRef, CallerContext, ClinicError, Payment, RecordMeta, Refund, RefundStatus, Result,
    StatusEntry,
};
use rust_decimal::Decimal;

use crate::context::Origin;
use crate::state_machine::StateMachine;

/// 状态变更的结果
#[derive(Debug, Clone, PartialEq)]
pub enum RefundOutcome {
    /// 仅退款记录变化
    Updated,
    /// 退款完成，需要把金额回写到收款
    Completed { importe: Decimal },
}

#[derive(Debug, Default)]
pub struct RefundDesk {
    state_machine: StateMachine<RefundStatus>,
}

impl RefundDesk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state_machine(&self) -> &StateMachine<RefundStatus> {
        &self.state_machine
    }

    /// 申请退款：收款必须已收，金额不超过可退余额
    pub fn create(&self, input: NewRefund, payment: &Payment, origin: &Origin<'_>) -> Result<Refund> {
        if !payment.estado.is_collected() {
            return Err(ClinicError::validation(
                "Solo se pueden devolver pagos completados o parciales",
            ));
        }
        require_text("El motivo", &input.motivo, 1000)?;
        let importe = round_money(input.importe_solicitado);
        if importe <= Decimal::ZERO {
            return Err(ClinicError::validation(
                "El importe solicitado debe ser mayor que 0",
            ));
        }
        if importe > payment.refundable() {
            return Err(ClinicError::validation(format!(
                "El importe solicitado supera el disponible para devolver ({})",
                payment.refundable()
            )));
        }

        let now = origin.now;
        let actor = origin.actor();
        let refund = Refund {
            id: origin.id,
            numero: origin.numero.clone(),
            pago: payment.id,
            pago_numero: payment.numero.clone(),
            paciente: payment.paciente,
            paciente_nombre: payment.paciente_nombre.clone(),
            importe_solicitado: importe,
            importe_aprobado: None,
            categoria: input.categoria,
            motivo: input.motivo.trim().to_string(),
            metodo_devolucion: normalize_optional(input.metodo_devolucion),
            estado: RefundStatus::Solicitada,
            aprobacion: None,
            rechazo: None,
            procesamiento: Processing::default(),
            historial_estados: vec![StatusEntry::new(
                RefundStatus::Solicitada,
                now,
                actor.clone(),
                Some("Devolución solicitada".to_string()),
                None,
            )],
            sede: payment.sede.clone(),
            meta: RecordMeta::new(actor, now),
        };

        tracing::info!(refund = %refund.numero, payment = %payment.numero, importe = %importe, "refund requested");
        Ok(refund)
    }

    /// 审批前可修改金额、类别与说明；金额按收款当前可退余额重新校验
    pub fn update(
        &self,
        refund: &mut Refund,
        update: RefundUpdate,
        payment: &Payment,
        actor: &ActorRef,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !matches!(refund.estado, RefundStatus::Solicitada | RefundStatus::Revisando) {
            return Err(ClinicError::validation(format!(
                "No se puede editar una devolución en estado '{}'",
                refund.estado
            )));
        }
        let mut draft = refund.clone();
        if let Some(importe) = update.importe_solicitado {
            let importe = round_money(importe);
            if importe <= Decimal::ZERO || importe > payment.refundable() {
                return Err(ClinicError::validation(format!(
                    "El importe solicitado debe ser mayor que 0 y no superar {}",
                    payment.refundable()
                )));
            }
            draft.importe_solicitado = importe;
        }
        if let Some(categoria) = update.categoria {
            draft.categoria = categoria;
        }
        if let Some(motivo) = update.motivo {
            require_text("El motivo", &motivo, 1000)?;
            draft.motivo = motivo.trim().to_string();
        }
        if update.metodo_devolucion.is_some() {
            draft.metodo_devolucion = normalize_optional(update.metodo_devolucion);
        }
        draft.meta.touch(actor, now);
        *refund = draft;
        Ok(())
    }

    /// 状态变更；审批类与处理类状态分别需要对应权限
    pub fn change_status(
        &self,
        refund: &mut Refund,
        request: RefundStatusRequest,
        caller: &CallerContext,
        now: DateTime<Utc>,
    ) -> Result<RefundOutcome> {
        let from = refund.estado;
        let to = self.state_machine.transition(from, request.estado)?;
        match to {
            RefundStatus::Aprobada | RefundStatus::Rechazada => {
                caller.require(permissions::REFUNDS_APPROVE)?
            }
            RefundStatus::Procesando | RefundStatus::Completada | RefundStatus::Fallida => {
                caller.require(permissions::REFUNDS_PROCESS)?
            }
            _ => {}
        }

        let actor = caller.actor();
        let motivo = normalize_optional(request.motivo);
        let mut outcome = RefundOutcome::Updated;

        // 先完成所有校验，再修改记录
        match to {
            RefundStatus::Aprobada => {
                let importe = round_money(request.importe_aprobado.unwrap_or(refund.importe_solicitado));
                if importe <= Decimal::ZERO || importe > refund.importe_solicitado {
                    return Err(ClinicError::validation(
                        "El importe aprobado debe ser mayor que 0 y no superar el solicitado",
                    ));
                }
                refund.importe_aprobado = Some(importe);
                refund.aprobacion = Some(Approval {
                    usuario: actor.clone(),
                    fecha: now,
                    importe,
                    notas: normalize_optional(request.observaciones.clone()),
                });
            }
            RefundStatus::Rechazada => {
                let Some(reason) = motivo.clone() else {
                    return Err(ClinicError::MissingReason(
                        "El motivo es obligatorio para rechazar la devolución".to_string(),
                    ));
                };
                refund.rechazo = Some(Rejection {
                    usuario: actor.clone(),
                    fecha: now,
                    motivo: reason,
                });
            }
            RefundStatus::Procesando => {
                refund.procesamiento.fecha_inicio.get_or_insert(now);
                refund.procesamiento.error = None;
                if let Some(referencia) = normalize_optional(request.referencia.clone()) {
                    refund.procesamiento.referencia = Some(referencia);
                }
            }
            RefundStatus::Completada => {
                refund.procesamiento.fecha_fin = Some(now);
                if let Some(referencia) = normalize_optional(request.referencia.clone()) {
                    refund.procesamiento.referencia = Some(referencia);
                }
                outcome = RefundOutcome::Completed {
                    importe: refund.importe_aprobado.unwrap_or(refund.importe_solicitado),
                };
            }
            RefundStatus::Fallida => {
                refund.procesamiento.error = normalize_optional(request.error.clone())
                    .or_else(|| Some("Error no especificado".to_string()));
            }
            RefundStatus::Solicitada | RefundStatus::Revisando | RefundStatus::Cancelada => {}
        }

        refund.estado = to;
        refund.historial_estados.push(StatusEntry::new(
            to,
            now,
            actor.clone(),
            motivo,
            normalize_optional(request.observaciones),
        ));
        refund.meta.touch(&actor, now);

        tracing::info!(refund = %refund.numero, %from, %to, "refund status changed");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PatientSnapshot;
    use crate::payment::PaymentLedger;
    use clinic_core::payment::{NewPayment, PaymentMethod};
    use clinic_core::refund::RefundCategory;
    use clinic_core::{PaymentStatus, Role};
    use uuid::Uuid;

    fn caller(role: Role) -> CallerContext {
        CallerContext {
            id: Uuid::new_v4(),
            nombre: format!("{}", role),
            role,
            sede: Some("bilbao".to_string()),
        }
    }

    fn payment(caller: &CallerContext, estado: PaymentStatus) -> Payment {
        let ledger = PaymentLedger::new("EUR");
        let patient = PatientSnapshot {
            id: Uuid::new_v4(),
            nombre: "Iker Etxeberria".to_string(),
            sede: "bilbao".to_string(),
        };
        let input = NewPayment {
            paciente: patient.id,
            presupuesto: None,
            factura: None,
            tratamiento: None,
            cita: None,
            concepto: "Implante".to_string(),
            importe: Decimal::from(900),
            comision: Decimal::ZERO,
            moneda: None,
            metodo: PaymentMethod::Transferencia,
            pasarela: None,
            referencia_externa: None,
            estado: Some(estado),
            notas: None,
            sede: None,
        };
        let origin = Origin::new("TXN-2026-000010".to_string(), caller, Utc::now());
        ledger.create(input, &patient, &origin).unwrap()
    }

    fn new_refund(importe: i64) -> NewRefund {
        NewRefund {
            pago: Uuid::new_v4(),
            importe_solicitado: Decimal::from(importe),
            categoria: RefundCategory::TratamientoNoRealizado,
            motivo: "Tratamiento anulado".to_string(),
            metodo_devolucion: None,
        }
    }

    fn request(estado: RefundStatus) -> RefundStatusRequest {
        RefundStatusRequest {
            estado,
            motivo: None,
            observaciones: None,
            importe_aprobado: None,
            referencia: None,
            error: None,
        }
    }

    #[test]
    fn test_create_requires_collected_payment_and_available_amount() {
        let owner = caller(Role::Owner);
        let desk = RefundDesk::new();
        let origin = Origin::new("REF-2026-000001".to_string(), &owner, Utc::now());

        let pending = payment(&owner, PaymentStatus::Pendiente);
        assert!(desk.create(new_refund(100), &pending, &origin).is_err());

        let paid = payment(&owner, PaymentStatus::Completado);
        assert!(desk.create(new_refund(1000), &paid, &origin).is_err());

        let refund = desk.create(new_refund(300), &paid, &origin).unwrap();
        assert_eq!(refund.sede, "bilbao");
        assert_eq!(refund.pago_numero, paid.numero);
        assert_eq!(refund.importe_pendiente(), Decimal::from(300));
    }

    #[test]
    fn test_full_flow_completes_with_approved_amount() {
        let owner = caller(Role::Owner);
        let desk = RefundDesk::new();
        let paid = payment(&owner, PaymentStatus::Completado);
        let origin = Origin::new("REF-2026-000002".to_string(), &owner, Utc::now());
        let mut refund = desk.create(new_refund(300), &paid, &origin).unwrap();

        desk.change_status(&mut refund, request(RefundStatus::Revisando), &owner, Utc::now())
            .unwrap();
        let mut approve = request(RefundStatus::Aprobada);
        approve.importe_aprobado = Some(Decimal::from(250));
        desk.change_status(&mut refund, approve, &owner, Utc::now()).unwrap();
        desk.change_status(&mut refund, request(RefundStatus::Procesando), &owner, Utc::now())
            .unwrap();
        let outcome = desk
            .change_status(&mut refund, request(RefundStatus::Completada), &owner, Utc::now())
            .unwrap();

        assert_eq!(outcome, RefundOutcome::Completed { importe: Decimal::from(250) });
        assert_eq!(refund.importe_pendiente(), Decimal::ZERO);
        assert!(refund.procesamiento.fecha_inicio.is_some());
        assert!(refund.procesamiento.fecha_fin.is_some());
        assert_eq!(refund.historial_estados.len(), 5);
    }

    #[test]
    fn test_approval_amount_cannot_exceed_request() {
        let owner = caller(Role::Owner);
        let desk = RefundDesk::new();
        let paid = payment(&owner, PaymentStatus::Completado);
        let origin = Origin::new("REF-2026-000003".to_string(), &owner, Utc::now());
        let mut refund = desk.create(new_refund(100), &paid, &origin).unwrap();
        desk.change_status(&mut refund, request(RefundStatus::Revisando), &owner, Utc::now())
            .unwrap();

        let mut approve = request(RefundStatus::Aprobada);
        approve.importe_aprobado = Some(Decimal::from(150));
        let before = refund.clone();
        assert!(desk.change_status(&mut refund, approve, &owner, Utc::now()).is_err());
        assert_eq!(refund, before);
    }

    #[test]
    fn test_rejection_requires_reason() {
        let owner = caller(Role::Owner);
        let desk = RefundDesk::new();
        let paid = payment(&owner, PaymentStatus::Completado);
        let origin = Origin::new("REF-2026-000004".to_string(), &owner, Utc::now());
        let mut refund = desk.create(new_refund(100), &paid, &origin).unwrap();
        desk.change_status(&mut refund, request(RefundStatus::Revisando), &owner, Utc::now())
            .unwrap();

        let err = desk
            .change_status(&mut refund, request(RefundStatus::Rechazada), &owner, Utc::now())
            .unwrap_err();
        assert!(matches!(err, ClinicError::MissingReason(_)));

        let mut reject = request(RefundStatus::Rechazada);
        reject.motivo = Some("Fuera de plazo".to_string());
        desk.change_status(&mut refund, reject, &owner, Utc::now()).unwrap();
        assert_eq!(refund.rechazo.as_ref().map(|r| r.motivo.as_str()), Some("Fuera de plazo"));
        assert!(desk.state_machine().is_terminal(refund.estado));
    }

    #[test]
    fn test_approval_requires_permission() {
        let owner = caller(Role::Owner);
        let receptionist = caller(Role::Receptionist);
        let desk = RefundDesk::new();
        let paid = payment(&owner, PaymentStatus::Completado);
        let origin = Origin::new("REF-2026-000005".to_string(), &receptionist, Utc::now());
        let mut refund = desk.create(new_refund(100), &paid, &origin).unwrap();
        desk.change_status(&mut refund, request(RefundStatus::Revisando), &receptionist, Utc::now())
            .unwrap();

        let err = desk
            .change_status(&mut refund, request(RefundStatus::Aprobada), &receptionist, Utc::now())
            .unwrap_err();
        assert!(matches!(err, ClinicError::Forbidden(_)));
        assert_eq!(refund.estado, RefundStatus::Revisando);
    }

    #[test]
    fn test_update_only_before_approval() {
        let owner = caller(Role::Owner);
        let desk = RefundDesk::new();
        let paid = payment(&owner, PaymentStatus::Completado);
        let origin = Origin::new("REF-2026-000006".to_string(), &owner, Utc::now());
        let mut refund = desk.create(new_refund(100), &paid, &origin).unwrap();

        let too_much = RefundUpdate {
            importe_solicitado: Some(Decimal::from(1000)),
            ..Default::default()
        };
        assert!(desk.update(&mut refund, too_much, &paid, &owner.actor(), Utc::now()).is_err());

        let update = RefundUpdate {
            importe_solicitado: Some(Decimal::from(250)),
            motivo: Some("Tratamiento no realizado".to_string()),
            ..Default::default()
        };
        desk.update(&mut refund, update, &paid, &owner.actor(), Utc::now()).unwrap();
        assert_eq!(refund.importe_solicitado, Decimal::from(250));

        desk.change_status(&mut refund, request(RefundStatus::Revisando), &owner, Utc::now())
            .unwrap();
        desk.change_status(&mut refund, request(RefundStatus::Aprobada), &owner, Utc::now())
            .unwrap();
        let err = desk
            .update(&mut refund, RefundUpdate::default(), &paid, &owner.actor(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, ClinicError::Validation(_)));
    }
}
