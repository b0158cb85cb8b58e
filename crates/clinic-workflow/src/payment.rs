//! 收款账本
//!
//! 收款的创建、编辑、状态流转、对账，以及退款完成后的回写。

use chrono::{DateTime, Utc};
use clinic_core::payment::{
    Gateway, NewPayment, PaymentMethod, PaymentUpdate, ReconcileRequest, Reconciliation,
};
use clinic_core::payment_link::LinkPaymentRequest;
use clinic_core::utils::{normalize_optional, require_text, round_money};
use clinic_core::{
    ActorRef, ClinicError, Payment, PaymentLink, PaymentStatus, RecordMeta, Result,
    StatusChangeRequest, StatusEntry,
};
use rust_decimal::Decimal;

use crate::context::{Origin, PatientSnapshot};
use crate::state_machine::StateMachine;

/// 收款账本
#[derive(Debug)]
pub struct PaymentLedger {
    state_machine: StateMachine<PaymentStatus>,
    default_currency: String,
}

impl PaymentLedger {
    pub fn new(default_currency: impl Into<String>) -> Self {
        Self {
            state_machine: StateMachine::new(),
            default_currency: default_currency.into(),
        }
    }

    pub fn state_machine(&self) -> &StateMachine<PaymentStatus> {
        &self.state_machine
    }

    /// 登记收款；仅允许以 `pendiente`、`procesando` 或 `completado` 开始
    pub fn create(
        &self,
        input: NewPayment,
        patient: &PatientSnapshot,
        origin: &Origin<'_>,
    ) -> Result<Payment> {
        let now = origin.now;
        let actor = origin.actor();
        let sede = origin
            .caller
            .resolve_sede(input.sede.or_else(|| Some(patient.sede.clone())))?;
        let estado = input.estado.unwrap_or_default();
        if !matches!(
            estado,
            PaymentStatus::Pendiente | PaymentStatus::Procesando | PaymentStatus::Completado
        ) {
            return Err(ClinicError::validation(format!(
                "Un pago no puede registrarse en estado '{}'",
                estado
            )));
        }

        let mut payment = Payment {
            id: origin.id,
            numero: origin.numero.clone(),
            paciente: patient.id,
            paciente_nombre: patient.nombre.clone(),
            presupuesto: input.presupuesto,
            factura: input.factura,
            tratamiento: input.tratamiento,
            cita: input.cita,
            concepto: input.concepto.trim().to_string(),
            importe: input.importe,
            comision: input.comision,
            neto: Decimal::ZERO,
            moneda: self.currency_or_default(input.moneda),
            metodo: input.metodo,
            pasarela: input.pasarela.unwrap_or_default(),
            referencia_externa: normalize_optional(input.referencia_externa),
            estado,
            historial_estados: vec![StatusEntry::new(
                estado,
                now,
                actor.clone(),
                Some("Pago registrado".to_string()),
                None,
            )],
            conciliacion: Reconciliation::default(),
            importe_reembolsado: Decimal::ZERO,
            fecha_pago: (estado == PaymentStatus::Completado).then_some(now),
            notas: normalize_optional(input.notas),
            sede,
            meta: RecordMeta::new(actor, now),
        };
        prepare_for_save(&mut payment)?;

        tracing::info!(payment = %payment.numero, importe = %payment.importe, %estado, "payment recorded");
        Ok(payment)
    }

    /// 支付链接付款后生成的已完成收款
    pub fn create_from_link(
        &self,
        link: &PaymentLink,
        request: LinkPaymentRequest,
        origin: &Origin<'_>,
    ) -> Result<Payment> {
        let now = origin.now;
        let actor = origin.actor();
        let mut payment = Payment {
            id: origin.id,
            numero: origin.numero.clone(),
            paciente: link.paciente,
            paciente_nombre: link.paciente_nombre.clone(),
            presupuesto: link.presupuesto,
            factura: None,
            tratamiento: None,
            cita: None,
            concepto: link.concepto.clone(),
            importe: link.importe,
            comision: request.comision,
            neto: Decimal::ZERO,
            moneda: link.moneda.clone(),
            metodo: PaymentMethod::EnlacePago,
            pasarela: request.pasarela.unwrap_or(Gateway::Manual),
            referencia_externa: normalize_optional(request.referencia_externa),
            estado: PaymentStatus::Completado,
            historial_estados: vec![StatusEntry::new(
                PaymentStatus::Completado,
                now,
                actor.clone(),
                Some(format!("Pagado mediante enlace {}", link.numero)),
                None,
            )],
            conciliacion: Reconciliation::default(),
            importe_reembolsado: Decimal::ZERO,
            fecha_pago: Some(now),
            notas: None,
            sede: link.sede.clone(),
            meta: RecordMeta::new(actor, now),
        };
        prepare_for_save(&mut payment)?;
        Ok(payment)
    }

    /// 编辑收款内容
    pub fn update(
        &self,
        payment: &mut Payment,
        update: PaymentUpdate,
        new_patient: Option<&PatientSnapshot>,
        actor: &ActorRef,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut draft = payment.clone();
        if let Some(patient) = new_patient {
            if patient.id != draft.paciente {
                draft.paciente = patient.id;
                draft.paciente_nombre = patient.nombre.clone();
            }
        }
        if update.presupuesto.is_some() {
            draft.presupuesto = update.presupuesto;
        }
        if let Some(concepto) = update.concepto {
            draft.concepto = concepto.trim().to_string();
        }
        if let Some(importe) = update.importe {
            draft.importe = importe;
        }
        if let Some(comision) = update.comision {
            draft.comision = comision;
        }
        if let Some(metodo) = update.metodo {
            draft.metodo = metodo;
        }
        if let Some(pasarela) = update.pasarela {
            draft.pasarela = pasarela;
        }
        if update.referencia_externa.is_some() {
            draft.referencia_externa = normalize_optional(update.referencia_externa);
        }
        if update.notas.is_some() {
            draft.notas = normalize_optional(update.notas);
        }
        if draft.importe < draft.importe_reembolsado {
            return Err(ClinicError::validation(
                "El importe no puede ser inferior a lo ya reembolsado",
            ));
        }

        prepare_for_save(&mut draft)?;
        draft.meta.touch(actor, now);
        *payment = draft;
        Ok(())
    }

    pub fn change_status(
        &self,
        payment: &mut Payment,
        request: StatusChangeRequest<PaymentStatus>,
        actor: &ActorRef,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let from = payment.estado;
        let to = self.state_machine.transition(from, request.estado)?;

        payment.estado = to;
        if to == PaymentStatus::Completado {
            payment.fecha_pago.get_or_insert(now);
        }
        payment.historial_estados.push(StatusEntry::new(
            to,
            now,
            actor.clone(),
            normalize_optional(request.motivo),
            normalize_optional(request.observaciones),
        ));
        payment.meta.touch(actor, now);

        tracing::info!(payment = %payment.numero, %from, %to, "payment status changed");
        Ok(())
    }

    /// 对账：只对已收款的记录执行一次
    pub fn reconcile(
        &self,
        payment: &mut Payment,
        request: ReconcileRequest,
        actor: &ActorRef,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if payment.conciliacion.conciliado {
            return Err(ClinicError::validation("El pago ya está conciliado"));
        }
        if !payment.estado.is_collected() {
            return Err(ClinicError::validation(
                "Solo se pueden conciliar pagos completados o parciales",
            ));
        }
        payment.conciliacion = Reconciliation {
            conciliado: true,
            fecha: Some(now),
            usuario: Some(actor.clone()),
            referencia_bancaria: normalize_optional(request.referencia_bancaria),
        };
        payment.meta.touch(actor, now);

        tracing::info!(payment = %payment.numero, "payment reconciled");
        Ok(())
    }

    /// 退款完成后累加已退金额，全额退款时转为 `devuelto`，否则 `parcial`
    pub fn apply_refund(
        &self,
        payment: &mut Payment,
        amount: Decimal,
        refund_numero: &str,
        actor: &ActorRef,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if amount <= Decimal::ZERO || amount > payment.refundable() {
            return Err(ClinicError::validation(
                "El importe de la devolución supera lo disponible en el pago",
            ));
        }
        let reembolsado = round_money(payment.importe_reembolsado + amount);
        let target = if reembolsado >= payment.importe {
            PaymentStatus::Devuelto
        } else {
            PaymentStatus::Parcial
        };
        if target != payment.estado {
            self.state_machine.transition(payment.estado, target)?;
            payment.estado = target;
            payment.historial_estados.push(StatusEntry::new(
                target,
                now,
                actor.clone(),
                Some(format!("Devolución {}", refund_numero)),
                None,
            ));
        }
        payment.importe_reembolsado = reembolsado;
        payment.meta.touch(actor, now);
        Ok(())
    }

    fn currency_or_default(&self, moneda: Option<String>) -> String {
        normalize_optional(moneda)
            .map(|m| m.to_uppercase())
            .unwrap_or_else(|| self.default_currency.clone())
    }
}

/// 保存前钩子：校验金额并重算 `neto`
pub fn prepare_for_save(payment: &mut Payment) -> Result<()> {
    require_text("El concepto", &payment.concepto, 300)?;
    if payment.importe <= Decimal::ZERO {
        return Err(ClinicError::validation("El importe debe ser mayor que 0"));
    }
    if payment.comision < Decimal::ZERO || payment.comision > payment.importe {
        return Err(ClinicError::validation(
            "La comisión debe estar entre 0 y el importe",
        ));
    }
    payment.importe = round_money(payment.importe);
    payment.comision = round_money(payment.comision);
    payment.neto = payment.importe - payment.comision;
    Ok(())
}
