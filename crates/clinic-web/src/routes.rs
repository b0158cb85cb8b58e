//! 受保护路由与所需权限
//!
//! 路由守卫和 `server::create_app` 共用这张表；每条受保护路由都必须在此声明，
//! 未声明的路由一律拒绝。

use axum::http::Method;
use clinic_core::policy::permissions::*;

/// `(方法, 完整路径, 所需权限)`；权限为 `None` 时只要求已识别的调用方
pub type RouteRule = (Method, &'static str, Option<&'static str>);

pub fn route_permissions() -> Vec<RouteRule> {
    vec![
        (Method::GET, "/api/auth/me", None),
        (Method::GET, "/api/auth/permissions", None),
        // 患者
        (Method::GET, "/api/patients", Some(PATIENTS_READ)),
        (Method::POST, "/api/patients", Some(PATIENTS_CREATE)),
        (Method::GET, "/api/patients/search", Some(PATIENTS_READ)),
        (Method::GET, "/api/patients/stats", Some(REPORTS_READ)),
        (Method::GET, "/api/patients/:id", Some(PATIENTS_READ)),
        (Method::PUT, "/api/patients/:id", Some(PATIENTS_UPDATE)),
        (Method::DELETE, "/api/patients/:id", Some(PATIENTS_DELETE)),
        (Method::PUT, "/api/patients/:id/status", Some(PATIENTS_UPDATE)),
        (Method::GET, "/api/patients/:id/clinical-history", Some(PATIENTS_CLINICAL_HISTORY)),
        // 预算
        (Method::GET, "/api/budgets", Some(BUDGETS_READ)),
        (Method::POST, "/api/budgets", Some(BUDGETS_CREATE)),
        (Method::GET, "/api/budgets/search", Some(BUDGETS_READ)),
        (Method::GET, "/api/budgets/stats", Some(REPORTS_READ)),
        (Method::GET, "/api/budgets/pipeline", Some(BUDGETS_READ)),
        (Method::GET, "/api/budgets/pipeline/stats", Some(REPORTS_READ)),
        (Method::GET, "/api/budgets/patient/:patient_id", Some(BUDGETS_READ)),
        (Method::GET, "/api/budgets/:id", Some(BUDGETS_READ)),
        (Method::PUT, "/api/budgets/:id", Some(BUDGETS_UPDATE)),
        (Method::DELETE, "/api/budgets/:id", Some(BUDGETS_DELETE)),
        (Method::PUT, "/api/budgets/:id/status", Some(BUDGETS_CHANGE_STATUS)),
        (Method::POST, "/api/budgets/:id/communication", Some(BUDGETS_CHANGE_STATUS)),
        // 收款
        (Method::GET, "/api/payments", Some(PAYMENTS_READ)),
        (Method::POST, "/api/payments", Some(PAYMENTS_CREATE)),
        (Method::GET, "/api/payments/search", Some(PAYMENTS_READ)),
        (Method::GET, "/api/payments/stats", Some(REPORTS_READ)),
        (Method::GET, "/api/payments/patient/:patient_id", Some(PAYMENTS_READ)),
        (Method::GET, "/api/payments/:id", Some(PAYMENTS_READ)),
        (Method::PUT, "/api/payments/:id", Some(PAYMENTS_UPDATE)),
        (Method::DELETE, "/api/payments/:id", Some(PAYMENTS_DELETE)),
        (Method::PUT, "/api/payments/:id/status", Some(PAYMENTS_UPDATE)),
        (Method::POST, "/api/payments/:id/reconcile", Some(PAYMENTS_RECONCILE)),
        // 支付链接
        (Method::GET, "/api/payment-links", Some(LINKS_READ)),
        (Method::POST, "/api/payment-links", Some(LINKS_CREATE)),
        (Method::GET, "/api/payment-links/search", Some(LINKS_READ)),
        (Method::GET, "/api/payment-links/stats", Some(REPORTS_READ)),
        (Method::GET, "/api/payment-links/patient/:patient_id", Some(LINKS_READ)),
        (Method::GET, "/api/payment-links/:id", Some(LINKS_READ)),
        (Method::PUT, "/api/payment-links/:id", Some(LINKS_UPDATE)),
        (Method::DELETE, "/api/payment-links/:id", Some(LINKS_DELETE)),
        (Method::PUT, "/api/payment-links/:id/status", Some(LINKS_UPDATE)),
        (Method::POST, "/api/payment-links/:id/cancel", Some(LINKS_CANCEL)),
        (Method::POST, "/api/payment-links/:id/renew", Some(LINKS_UPDATE)),
        (Method::POST, "/api/payment-links/:id/pay", Some(PAYMENTS_CREATE)),
        // 退款
        (Method::GET, "/api/refunds", Some(REFUNDS_READ)),
        (Method::POST, "/api/refunds", Some(REFUNDS_CREATE)),
        (Method::GET, "/api/refunds/search", Some(REFUNDS_READ)),
        (Method::GET, "/api/refunds/stats", Some(REPORTS_READ)),
        (Method::GET, "/api/refunds/patient/:patient_id", Some(REFUNDS_READ)),
        (Method::GET, "/api/refunds/:id", Some(REFUNDS_READ)),
        (Method::PUT, "/api/refunds/:id", Some(REFUNDS_CREATE)),
        (Method::DELETE, "/api/refunds/:id", Some(REFUNDS_DELETE)),
        (Method::PUT, "/api/refunds/:id/status", Some(REFUNDS_CREATE)),
    ]
}

/// 查找路由声明：`None` 表示未声明，`Some(None)` 表示无需特定权限
pub fn permission_for(method: &Method, path: &str) -> Option<Option<&'static str>> {
    route_permissions()
        .into_iter()
        .find(|(m, p, _)| m == method && *p == path)
        .map(|(_, _, permission)| permission)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clinic_core::Role;
    use std::collections::HashSet;

    #[test]
    fn test_no_duplicate_routes() {
        let rules = route_permissions();
        let unique: HashSet<_> = rules.iter().map(|(m, p, _)| (m.clone(), *p)).collect();
        assert_eq!(unique.len(), rules.len());
    }

    #[test]
    fn test_every_permission_is_granted_to_some_role() {
        for (_, path, permission) in route_permissions() {
            if let Some(permission) = permission {
                assert!(
                    Role::ALL.iter().any(|r| r.has_permission(permission)),
                    "{} requires unknown permission {}",
                    path,
                    permission
                );
            }
        }
    }

    #[test]
    fn test_lookup() {
        assert_eq!(
            permission_for(&Method::PUT, "/api/budgets/:id/status"),
            Some(Some(BUDGETS_CHANGE_STATUS))
        );
        assert_eq!(permission_for(&Method::GET, "/api/auth/me"), Some(None));
        assert_eq!(permission_for(&Method::PATCH, "/api/budgets/:id"), None);
    }
}
