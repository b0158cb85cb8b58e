//! 角色权限策略与站点/角色访问守卫
//!
//! 角色→权限表只在这里定义一次：API 路由守卫和前端导航过滤
//! （通过 `GET /api/auth/permissions` 下发）共用同一份数据。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ClinicError, Result};
use crate::models::ActorRef;

/// 权限标识
pub mod permissions {
    pub const PATIENTS_READ: &str = "patients:read";
    pub const PATIENTS_CREATE: &str = "patients:create";
    pub const PATIENTS_UPDATE: &str = "patients:update";
    pub const PATIENTS_DELETE: &str = "patients:delete";
    pub const PATIENTS_CLINICAL_HISTORY: &str = "patients:clinical_history";

    pub const BUDGETS_READ: &str = "budgets:read";
    pub const BUDGETS_CREATE: &str = "budgets:create";
    pub const BUDGETS_UPDATE: &str = "budgets:update";
    pub const BUDGETS_DELETE: &str = "budgets:delete";
    pub const BUDGETS_CHANGE_STATUS: &str = "budgets:change_status";

    pub const PAYMENTS_READ: &str = "payments:read";
    pub const PAYMENTS_CREATE: &str = "payments:create";
    pub const PAYMENTS_UPDATE: &str = "payments:update";
    pub const PAYMENTS_DELETE: &str = "payments:delete";
    pub const PAYMENTS_RECONCILE: &str = "payments:reconcile";

    pub const LINKS_READ: &str = "payment_links:read";
    pub const LINKS_CREATE: &str = "payment_links:create";
    pub const LINKS_UPDATE: &str = "payment_links:update";
    pub const LINKS_CANCEL: &str = "payment_links:cancel";
    pub const LINKS_DELETE: &str = "payment_links:delete";

    pub const REFUNDS_READ: &str = "refunds:read";
    pub const REFUNDS_CREATE: &str = "refunds:create";
    pub const REFUNDS_APPROVE: &str = "refunds:approve";
    pub const REFUNDS_PROCESS: &str = "refunds:process";
    pub const REFUNDS_DELETE: &str = "refunds:delete";

    pub const REPORTS_READ: &str = "reports:read";
}

use permissions::*;

/// 用户角色
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// 诊所所有者 - 完全访问权限
    Owner,
    /// 总部分析师 - 跨站点可见
    HqAnalyst,
    /// 站点管理员
    AdminSede,
    /// 临床专业人员（牙医、卫生士）
    ClinicalProfessional,
    /// 前台
    Receptionist,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::Owner,
        Role::HqAnalyst,
        Role::AdminSede,
        Role::ClinicalProfessional,
        Role::Receptionist,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::HqAnalyst => "hq_analyst",
            Role::AdminSede => "admin_sede",
            Role::ClinicalProfessional => "clinical_professional",
            Role::Receptionist => "receptionist",
        }
    }

    /// 不受站点范围限制的角色
    pub fn is_global(&self) -> bool {
        matches!(self, Role::Owner | Role::HqAnalyst)
    }

    /// 可修改他人记录的角色
    pub fn is_elevated(&self) -> bool {
        matches!(self, Role::Owner | Role::HqAnalyst | Role::AdminSede)
    }

    /// 角色拥有的权限
    pub fn permissions(&self) -> &'static [&'static str] {
        match self {
            Role::Owner => &[
                PATIENTS_READ, PATIENTS_CREATE, PATIENTS_UPDATE, PATIENTS_DELETE,
                PATIENTS_CLINICAL_HISTORY,
                BUDGETS_READ, BUDGETS_CREATE, BUDGETS_UPDATE, BUDGETS_DELETE,
                BUDGETS_CHANGE_STATUS,
                PAYMENTS_READ, PAYMENTS_CREATE, PAYMENTS_UPDATE, PAYMENTS_DELETE,
                PAYMENTS_RECONCILE,
                LINKS_READ, LINKS_CREATE, LINKS_UPDATE, LINKS_CANCEL, LINKS_DELETE,
                REFUNDS_READ, REFUNDS_CREATE, REFUNDS_APPROVE, REFUNDS_PROCESS, REFUNDS_DELETE,
                REPORTS_READ,
            ],
            Role::HqAnalyst => &[
                PATIENTS_READ, PATIENTS_CREATE, PATIENTS_UPDATE, PATIENTS_CLINICAL_HISTORY,
                BUDGETS_READ, BUDGETS_CREATE, BUDGETS_UPDATE, BUDGETS_CHANGE_STATUS,
                PAYMENTS_READ, PAYMENTS_CREATE, PAYMENTS_UPDATE, PAYMENTS_RECONCILE,
                LINKS_READ, LINKS_CREATE, LINKS_UPDATE, LINKS_CANCEL,
                REFUNDS_READ, REFUNDS_CREATE, REFUNDS_APPROVE, REFUNDS_PROCESS,
                REPORTS_READ,
            ],
            Role::AdminSede => &[
                PATIENTS_READ, PATIENTS_CREATE, PATIENTS_UPDATE, PATIENTS_CLINICAL_HISTORY,
                BUDGETS_READ, BUDGETS_CREATE, BUDGETS_UPDATE, BUDGETS_CHANGE_STATUS,
                PAYMENTS_READ, PAYMENTS_CREATE, PAYMENTS_UPDATE, PAYMENTS_RECONCILE,
                LINKS_READ, LINKS_CREATE, LINKS_UPDATE, LINKS_CANCEL,
                REFUNDS_READ, REFUNDS_CREATE, REFUNDS_APPROVE, REFUNDS_PROCESS,
                REPORTS_READ,
            ],
            Role::ClinicalProfessional => &[
                PATIENTS_READ, PATIENTS_CREATE, PATIENTS_UPDATE, PATIENTS_CLINICAL_HISTORY,
                BUDGETS_READ, BUDGETS_CREATE, BUDGETS_UPDATE, BUDGETS_DELETE,
                BUDGETS_CHANGE_STATUS,
                PAYMENTS_READ,
                LINKS_READ, LINKS_CREATE,
                REFUNDS_READ,
            ],
            Role::Receptionist => &[
                PATIENTS_READ, PATIENTS_CREATE, PATIENTS_UPDATE,
                BUDGETS_READ, BUDGETS_CREATE, BUDGETS_DELETE, BUDGETS_CHANGE_STATUS,
                PAYMENTS_READ, PAYMENTS_CREATE, PAYMENTS_UPDATE,
                LINKS_READ, LINKS_CREATE, LINKS_UPDATE, LINKS_CANCEL,
                REFUNDS_READ, REFUNDS_CREATE,
            ],
        }
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions().contains(&permission)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ClinicError;

    fn from_str(s: &str) -> Result<Self> {
        Role::ALL
            .into_iter()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| ClinicError::Unauthorized(format!("Rol desconocido: {}", s)))
    }
}

/// 前端导航条目
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NavItem {
    pub key: &'static str,
    pub label: &'static str,
    pub path: &'static str,
    /// 为 `None` 时对所有角色可见
    pub permission: Option<&'static str>,
}

pub const NAVIGATION: &[NavItem] = &[
    NavItem { key: "dashboard", label: "Inicio", path: "/", permission: None },
    NavItem { key: "patients", label: "Pacientes", path: "/pacientes", permission: Some(PATIENTS_READ) },
    NavItem { key: "budgets", label: "Presupuestos", path: "/presupuestos", permission: Some(BUDGETS_READ) },
    NavItem { key: "pipeline", label: "Pipeline", path: "/pipeline", permission: Some(BUDGETS_READ) },
    NavItem { key: "payments", label: "Pagos", path: "/pagos", permission: Some(PAYMENTS_READ) },
    NavItem { key: "payment_links", label: "Enlaces de pago", path: "/enlaces-pago", permission: Some(LINKS_READ) },
    NavItem { key: "refunds", label: "Devoluciones", path: "/devoluciones", permission: Some(REFUNDS_READ) },
    NavItem { key: "reports", label: "Informes", path: "/informes", permission: Some(REPORTS_READ) },
];

/// 角色可见的导航条目
pub fn navigation_for(role: Role) -> Vec<&'static NavItem> {
    NAVIGATION
        .iter()
        .filter(|item| item.permission.map_or(true, |p| role.has_permission(p)))
        .collect()
}

/// 请求调用方上下文（由上游网关解析后附加到请求）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallerContext {
    pub id: Uuid,
    pub nombre: String,
    pub role: Role,
    pub sede: Option<String>,
}

impl CallerContext {
    pub fn actor(&self) -> ActorRef {
        ActorRef::new(self.id, self.nombre.clone())
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.role.has_permission(permission)
    }

    pub fn require(&self, permission: &str) -> Result<()> {
        if self.has_permission(permission) {
            Ok(())
        } else {
            tracing::warn!(user = %self.id, role = %self.role, permission, "permission denied");
            Err(ClinicError::forbidden(format!(
                "No tienes permiso para realizar esta acción ({})",
                permission
            )))
        }
    }

    /// 列表查询时需要强制附加的站点条件
    pub fn sede_scope(&self) -> Option<&str> {
        if self.role.is_global() {
            None
        } else {
            self.sede.as_deref()
        }
    }

    /// 创建记录时确定其所属站点
    pub fn resolve_sede(&self, requested: Option<String>) -> Result<String> {
        let requested = requested
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        match (self.sede_scope(), requested) {
            (Some(own), Some(req)) if own != req => Err(ClinicError::forbidden(
                "No puedes crear registros en otra sede",
            )),
            (Some(own), _) => Ok(own.to_string()),
            (None, Some(req)) => Ok(req),
            (None, None) => self
                .sede
                .clone()
                .ok_or_else(|| ClinicError::validation("La sede es obligatoria")),
        }
    }
}

/// 受站点/归属范围约束的记录
pub trait Scoped {
    /// 用于错误消息，例如 "el presupuesto"
    const LABEL: &'static str;
    /// 非所有者修改时的提示
    const OWN_RECORDS_MESSAGE: &'static str;

    fn sede(&self) -> &str;

    fn is_owned_by(&self, user_id: Uuid) -> bool;

    /// 处于终态时返回状态名
    fn terminal_state(&self) -> Option<String> {
        None
    }

    /// 非 owner 的自助删除例外
    fn allows_self_delete(&self, _user_id: Uuid) -> bool {
        false
    }
}

/// 访问守卫：每个请求基于刚加载的记录重新判定，不缓存
pub struct AccessGuard;

impl AccessGuard {
    pub fn ensure_can_read<T: Scoped>(caller: &CallerContext, record: &T) -> Result<()> {
        if let Some(own) = caller.sede_scope() {
            if own != record.sede() {
                tracing::warn!(
                    user = %caller.id,
                    caller_sede = own,
                    record_sede = record.sede(),
                    "cross-sede access denied"
                );
                return Err(ClinicError::forbidden(
                    "No tienes acceso a registros de otra sede",
                ));
            }
        }
        Ok(())
    }

    /// 状态变更：站点 + 归属检查
    pub fn ensure_can_change_status<T: Scoped>(caller: &CallerContext, record: &T) -> Result<()> {
        Self::ensure_can_read(caller, record)?;
        if !caller.role.is_elevated() && !record.is_owned_by(caller.id) {
            return Err(ClinicError::forbidden(T::OWN_RECORDS_MESSAGE));
        }
        Ok(())
    }

    /// 内容修改：站点 + 归属 + 终态检查（归属检查在前）
    pub fn ensure_can_modify<T: Scoped>(caller: &CallerContext, record: &T) -> Result<()> {
        Self::ensure_can_change_status(caller, record)?;
        if let Some(state) = record.terminal_state() {
            if !caller.role.is_global() {
                return Err(ClinicError::forbidden(format!(
                    "No se puede modificar {} en estado '{}'",
                    T::LABEL,
                    state
                )));
            }
        }
        Ok(())
    }

    /// 物理删除：仅 owner，或创建者删除自己仍处于待定状态的预算
    pub fn ensure_can_delete<T: Scoped>(caller: &CallerContext, record: &T) -> Result<()> {
        Self::ensure_can_read(caller, record)?;
        if caller.role == Role::Owner || record.allows_self_delete(caller.id) {
            return Ok(());
        }
        Err(ClinicError::forbidden(
            "Solo el propietario de la clínica puede eliminar registros",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Record {
        sede: String,
        owner: Uuid,
        terminal: bool,
    }

    impl Scoped for Record {
        const LABEL: &'static str = "el registro";
        const OWN_RECORDS_MESSAGE: &'static str = "Solo puedes modificar tus propios registros";

        fn sede(&self) -> &str {
            &self.sede
        }

        fn is_owned_by(&self, user_id: Uuid) -> bool {
            self.owner == user_id
        }

        fn terminal_state(&self) -> Option<String> {
            self.terminal.then(|| "cerrado".to_string())
        }
    }

    fn caller(role: Role, sede: Option<&str>) -> CallerContext {
        CallerContext {
            id: Uuid::new_v4(),
            nombre: "Test".to_string(),
            role,
            sede: sede.map(str::to_string),
        }
    }

    #[test]
    fn test_cross_sede_forbidden_except_global_roles() {
        let record = Record { sede: "madrid".into(), owner: Uuid::new_v4(), terminal: false };
        for role in Role::ALL {
            let c = caller(role, Some("valencia"));
            let read = AccessGuard::ensure_can_read(&c, &record);
            let write = AccessGuard::ensure_can_modify(&c, &record);
            if role.is_global() {
                assert!(read.is_ok(), "{role} should read");
            } else {
                assert!(matches!(read, Err(ClinicError::Forbidden(_))), "{role} read");
                assert!(matches!(write, Err(ClinicError::Forbidden(_))), "{role} write");
            }
        }
    }

    #[test]
    fn test_ownership_checked_before_terminal_state() {
        let record = Record { sede: "madrid".into(), owner: Uuid::new_v4(), terminal: true };
        let c = caller(Role::ClinicalProfessional, Some("madrid"));
        match AccessGuard::ensure_can_modify(&c, &record) {
            Err(ClinicError::Forbidden(msg)) => {
                assert_eq!(msg, "Solo puedes modificar tus propios registros")
            }
            other => panic!("unexpected {:?}", other),
        }

        let admin = caller(Role::AdminSede, Some("madrid"));
        match AccessGuard::ensure_can_modify(&admin, &record) {
            Err(ClinicError::Forbidden(msg)) => assert!(msg.contains("cerrado")),
            other => panic!("unexpected {:?}", other),
        }

        let hq = caller(Role::HqAnalyst, None);
        assert!(AccessGuard::ensure_can_modify(&hq, &record).is_ok());
    }

    #[test]
    fn test_delete_is_owner_only() {
        let record = Record { sede: "madrid".into(), owner: Uuid::new_v4(), terminal: false };
        assert!(AccessGuard::ensure_can_delete(&caller(Role::Owner, None), &record).is_ok());
        assert!(AccessGuard::ensure_can_delete(&caller(Role::AdminSede, Some("madrid")), &record).is_err());
        assert!(AccessGuard::ensure_can_delete(&caller(Role::HqAnalyst, None), &record).is_err());
    }

    #[test]
    fn test_resolve_sede_for_new_records() {
        let local = caller(Role::Receptionist, Some("madrid"));
        assert_eq!(local.resolve_sede(None).unwrap(), "madrid");
        assert!(local.resolve_sede(Some("bilbao".into())).is_err());

        let owner = caller(Role::Owner, None);
        assert_eq!(owner.resolve_sede(Some("bilbao".into())).unwrap(), "bilbao");
        assert!(owner.resolve_sede(None).is_err());
    }

    #[test]
    fn test_navigation_follows_permission_table() {
        let nav: Vec<_> = navigation_for(Role::ClinicalProfessional)
            .into_iter()
            .map(|item| item.key)
            .collect();
        assert!(nav.contains(&"patients"));
        assert!(!nav.contains(&"reports"));
        assert_eq!(navigation_for(Role::Owner).len(), NAVIGATION.len());
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!("hq_analyst".parse::<Role>().unwrap(), Role::HqAnalyst);
        assert!("superuser".parse::<Role>().is_err());
    }
}
