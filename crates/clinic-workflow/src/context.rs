//! 创建记录时由处理器准备的上下文

use chrono::{DateTime, Utc};
use clinic_core::{ActorRef, CallerContext, Patient};
use uuid::Uuid;

/// 系统自动操作使用的操作人（如链接过期）
pub fn system_actor() -> ActorRef {
    ActorRef::new(Uuid::nil(), "Sistema")
}

/// 患者快照：反规范化到其他实体的患者引用
///
/// 只在引用字段本身变化时刷新，患者改名不会回写已有记录。
#[derive(Debug, Clone, PartialEq)]
pub struct PatientSnapshot {
    pub id: Uuid,
    pub nombre: String,
    pub sede: String,
}

impl From<&Patient> for PatientSnapshot {
    fn from(patient: &Patient) -> Self {
        Self {
            id: patient.id,
            nombre: patient.nombre_completo(),
            sede: patient.sede.clone(),
        }
    }
}

/// 新记录的来源信息
#[derive(Debug, Clone)]
pub struct Origin<'a> {
    pub id: Uuid,
    pub numero: String,
    pub caller: &'a CallerContext,
    pub now: DateTime<Utc>,
}

impl<'a> Origin<'a> {
    pub fn new(numero: String, caller: &'a CallerContext, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            numero,
            caller,
            now,
        }
    }

    pub fn actor(&self) -> ActorRef {
        self.caller.actor()
    }
}
