//! 支付链接生命周期
//!
//! 过期与锁定均为惰性判断：每次读取或写入链接时调用 [`LinkManager::refresh_expiry`]。

use chrono::{DateTime, Duration, Utc};
use clinic_core::payment_link::{
    AttemptRequest, LinkSecurity, NewPaymentLink, PaymentLinkUpdate, RenewRequest,
};
use clinic_core::utils::{generate_link_token, normalize_optional, require_text, round_money};
use clinic_core::{
    ActorRef, ClinicError, LinkStatus, PaymentLink, RecordMeta, Result, StatusChangeRequest,
    StatusEntry,
};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::context::{system_actor, Origin, PatientSnapshot};
use crate::state_machine::StateMachine;

/// 链接默认参数
#[derive(Debug, Clone)]
pub struct LinkDefaults {
    pub validity_days: u32,
    pub attempt_limit: u32,
    pub currency: String,
}

impl Default for LinkDefaults {
    fn default() -> Self {
        Self {
            validity_days: 7,
            attempt_limit: 3,
            currency: "EUR".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct LinkManager {
    state_machine: StateMachine<LinkStatus>,
    defaults: LinkDefaults,
}

impl LinkManager {
    pub fn new(defaults: LinkDefaults) -> Self {
        Self {
            state_machine: StateMachine::new(),
            defaults,
        }
    }

    pub fn state_machine(&self) -> &StateMachine<LinkStatus> {
        &self.state_machine
    }

    pub fn create(
        &self,
        input: NewPaymentLink,
        patient: &PatientSnapshot,
        origin: &Origin<'_>,
    ) -> Result<PaymentLink> {
        let now = origin.now;
        let actor = origin.actor();
        let sede = origin
            .caller
            .resolve_sede(input.sede.or_else(|| Some(patient.sede.clone())))?;
        let dias = input.dias_validez.unwrap_or(self.defaults.validity_days);
        let limite = input.limite_tentativas.unwrap_or(self.defaults.attempt_limit);

        let mut link = PaymentLink {
            id: origin.id,
            numero: origin.numero.clone(),
            token: generate_link_token(origin.id),
            paciente: patient.id,
            paciente_nombre: patient.nombre.clone(),
            presupuesto: input.presupuesto,
            concepto: input.concepto.trim().to_string(),
            importe: input.importe,
            moneda: normalize_optional(input.moneda)
                .map(|m| m.to_uppercase())
                .unwrap_or_else(|| self.defaults.currency.clone()),
            fecha_expiracion: expiry_from(now, dias)?,
            estado: LinkStatus::Activo,
            visualizaciones: 0,
            ultima_visualizacion: None,
            intentos: 0,
            limite_tentativas: limite,
            seguridad: LinkSecurity::default(),
            pago: None,
            fecha_pago: None,
            historial_estados: vec![StatusEntry::new(
                LinkStatus::Activo,
                now,
                actor.clone(),
                Some("Enlace creado".to_string()),
                None,
            )],
            sede,
            meta: RecordMeta::new(actor, now),
        };
        validate(&mut link)?;

        tracing::info!(link = %link.numero, importe = %link.importe, "payment link created");
        Ok(link)
    }

    /// 惰性过期：活动链接超过期限时转为 `vencido`，返回是否发生变化
    pub fn refresh_expiry(&self, link: &mut PaymentLink, now: DateTime<Utc>) -> bool {
        if link.estado != LinkStatus::Activo || !link.esta_vencido(now) {
            return false;
        }
        let system = system_actor();
        self.apply(link, LinkStatus::Vencido, &system, now, Some("Enlace vencido".to_string()), None);
        true
    }

    /// 编辑活动链接
    pub fn update(
        &self,
        link: &mut PaymentLink,
        update: PaymentLinkUpdate,
        actor: &ActorRef,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.refresh_expiry(link, now);
        ensure_active(link)?;

        let mut draft = link.clone();
        if let Some(concepto) = update.concepto {
            draft.concepto = concepto.trim().to_string();
        }
        if let Some(importe) = update.importe {
            draft.importe = importe;
        }
        if let Some(fecha) = update.fecha_expiracion {
            if fecha <= now {
                return Err(ClinicError::validation(
                    "La fecha de expiración debe ser futura",
                ));
            }
            draft.fecha_expiracion = fecha;
        }
        if let Some(limite) = update.limite_tentativas {
            draft.limite_tentativas = limite;
        }
        validate(&mut draft)?;
        draft.meta.touch(actor, now);
        *link = draft;
        Ok(())
    }

    /// 通用状态变更；`pagado` 与重新激活分别走专用操作
    pub fn change_status(
        &self,
        link: &mut PaymentLink,
        request: StatusChangeRequest<LinkStatus>,
        actor: &ActorRef,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.refresh_expiry(link, now);
        match request.estado {
            LinkStatus::Pagado => Err(ClinicError::validation(
                "Para marcar el enlace como pagado usa la operación de pago",
            )),
            LinkStatus::Activo => self.renew(
                link,
                RenewRequest {
                    dias_validez: None,
                    motivo: request.motivo,
                },
                actor,
                now,
            ),
            estado => {
                self.state_machine.transition(link.estado, estado)?;
                self.apply(
                    link,
                    estado,
                    actor,
                    now,
                    normalize_optional(request.motivo),
                    normalize_optional(request.observaciones),
                );
                Ok(())
            }
        }
    }

    pub fn cancel(
        &self,
        link: &mut PaymentLink,
        motivo: Option<String>,
        actor: &ActorRef,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.refresh_expiry(link, now);
        self.state_machine.transition(link.estado, LinkStatus::Cancelado)?;
        self.apply(link, LinkStatus::Cancelado, actor, now, normalize_optional(motivo), None);
        Ok(())
    }

    /// 续期：新的到期时间、清零尝试次数、解除锁定，令牌保持不变
    pub fn renew(
        &self,
        link: &mut PaymentLink,
        request: RenewRequest,
        actor: &ActorRef,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.refresh_expiry(link, now);
        self.state_machine.transition(link.estado, LinkStatus::Activo)?;
        let dias = request.dias_validez.unwrap_or(self.defaults.validity_days);
        let fecha_expiracion = expiry_from(now, dias)?;

        link.fecha_expiracion = fecha_expiracion;
        link.intentos = 0;
        link.seguridad = LinkSecurity::default();
        let motivo = normalize_optional(request.motivo).or_else(|| Some("Enlace renovado".to_string()));
        self.apply(link, LinkStatus::Activo, actor, now, motivo, None);
        Ok(())
    }

    /// 公开访问计数
    pub fn register_view(&self, link: &mut PaymentLink, now: DateTime<Utc>) {
        self.refresh_expiry(link, now);
        link.visualizaciones += 1;
        link.ultima_visualizacion = Some(now);
    }

    /// 记录一次支付尝试，达到上限时挂起并锁定
    pub fn record_attempt(
        &self,
        link: &mut PaymentLink,
        request: AttemptRequest,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.refresh_expiry(link, now);
        ensure_active(link)?;

        link.intentos += 1;
        if link.intentos >= link.limite_tentativas {
            let motivo = "Límite de intentos alcanzado".to_string();
            link.seguridad = LinkSecurity {
                bloqueado: true,
                fecha_bloqueo: Some(now),
                motivo_bloqueo: Some(motivo.clone()),
            };
            self.apply(
                link,
                LinkStatus::Suspendido,
                &system_actor(),
                now,
                Some(motivo),
                normalize_optional(request.detalle),
            );
            tracing::warn!(link = %link.numero, intentos = link.intentos, "payment link locked after too many attempts");
        }
        Ok(())
    }

    /// 标记已支付并关联生成的收款
    pub fn mark_paid(
        &self,
        link: &mut PaymentLink,
        payment_id: Uuid,
        actor: &ActorRef,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.refresh_expiry(link, now);
        self.state_machine.transition(link.estado, LinkStatus::Pagado)?;
        link.pago = Some(payment_id);
        link.fecha_pago = Some(now);
        self.apply(link, LinkStatus::Pagado, actor, now, None, None);
        Ok(())
    }

    /// 可以付款的前置检查（不修改链接）
    pub fn ensure_payable(&self, link: &PaymentLink, now: DateTime<Utc>) -> Result<()> {
        if link.estado == LinkStatus::Activo && link.esta_vencido(now) {
            return Err(ClinicError::validation("El enlace de pago ha vencido"));
        }
        ensure_active(link)
    }

    fn apply(
        &self,
        link: &mut PaymentLink,
        to: LinkStatus,
        actor: &ActorRef,
        now: DateTime<Utc>,
        motivo: Option<String>,
        observaciones: Option<String>,
    ) {
        let from = link.estado;
        link.estado = to;
        link.historial_estados
            .push(StatusEntry::new(to, now, actor.clone(), motivo, observaciones));
        link.meta.touch(actor, now);
        tracing::info!(link = %link.numero, %from, %to, "payment link status changed");
    }
}

fn ensure_active(link: &PaymentLink) -> Result<()> {
    if link.estado == LinkStatus::Activo {
        Ok(())
    } else {
        Err(ClinicError::validation(format!(
            "El enlace de pago no está activo (estado: {})",
            link.estado
        )))
    }
}

fn expiry_from(now: DateTime<Utc>, dias: u32) -> Result<DateTime<Utc>> {
    if dias == 0 || dias > 365 {
        return Err(ClinicError::validation(
            "Los días de validez deben estar entre 1 y 365",
        ));
    }
    Ok(now + Duration::days(i64::from(dias)))
}

fn validate(link: &mut PaymentLink) -> Result<()> {
    require_text("El concepto", &link.concepto, 300)?;
    if link.importe <= Decimal::ZERO {
        return Err(ClinicError::validation("El importe debe ser mayor que 0"));
    }
    if link.limite_tentativas == 0 {
        return Err(ClinicError::validation(
            "El límite de intentos debe ser al menos 1",
        ));
    }
    link.importe = round_money(link.importe);
    Ok(())
}
