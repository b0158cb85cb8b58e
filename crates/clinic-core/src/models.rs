//! 共享数据模型定义
//!
//! 五类实体（患者、预算、收款、支付链接、退款）共用的值类型。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 操作人引用（带反规范化显示名）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActorRef {
    pub id: Uuid,
    pub nombre: String,
}

impl ActorRef {
    pub fn new(id: Uuid, nombre: impl Into<String>) -> Self {
        Self {
            id,
            nombre: nombre.into(),
        }
    }
}

/// 状态历史条目，只追加不删除
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusEntry<S> {
    pub estado: S,
    pub fecha: DateTime<Utc>,
    pub usuario: ActorRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motivo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observaciones: Option<String>,
}

impl<S> StatusEntry<S> {
    pub fn new(
        estado: S,
        fecha: DateTime<Utc>,
        usuario: ActorRef,
        motivo: Option<String>,
        observaciones: Option<String>,
    ) -> Self {
        Self {
            estado,
            fecha,
            usuario,
            motivo,
            observaciones,
        }
    }
}

/// 状态变更请求体（`PUT /:id/status`）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChangeRequest<S> {
    pub estado: S,
    #[serde(default)]
    pub motivo: Option<String>,
    #[serde(default)]
    pub observaciones: Option<String>,
    #[serde(default)]
    pub motivo_rechazo: Option<String>,
}

/// 记录元数据：所有实体共有的审计字段
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecordMeta {
    pub creado_por: ActorRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actualizado_por: Option<ActorRef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// 乐观锁版本号，每次成功保存后加一
    #[serde(default)]
    pub version: i64,
}

impl RecordMeta {
    pub fn new(creado_por: ActorRef, now: DateTime<Utc>) -> Self {
        Self {
            creado_por,
            actualizado_por: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// 标记一次修改
    pub fn touch(&mut self, actor: &ActorRef, now: DateTime<Utc>) {
        self.actualizado_por = Some(actor.clone());
        self.updated_at = now;
    }
}

/// 分页信息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub current: u64,
    pub pages: u64,
    pub total: u64,
    pub has_next: bool,
    pub has_prev: bool,
}

impl Pagination {
    pub fn new(current: u64, limit: u64, total: u64) -> Self {
        let limit = limit.max(1);
        let pages = total.div_ceil(limit);
        Self {
            current,
            pages,
            total,
            has_next: current < pages,
            has_prev: current > 1,
        }
    }
}

/// 分组聚合结果（按状态、专业人员或月份）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GroupBucket {
    pub key: String,
    pub count: u64,
    pub sum: rust_decimal::Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pagination_bounds() {
        let p = Pagination::new(1, 20, 45);
        assert_eq!(p.pages, 3);
        assert!(p.has_next);
        assert!(!p.has_prev);

        let p = Pagination::new(3, 20, 45);
        assert!(!p.has_next);
        assert!(p.has_prev);

        let empty = Pagination::new(1, 20, 0);
        assert_eq!(empty.pages, 0);
        assert!(!empty.has_next);
    }

    #[test]
    fn test_status_entry_wire_format() {
        let entry = StatusEntry::new(
            "presentado",
            Utc::now(),
            ActorRef::new(Uuid::nil(), "Dra. Ruiz"),
            None,
            Some("llamada".to_string()),
        );
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["estado"], "presentado");
        assert_eq!(json["usuario"]["nombre"], "Dra. Ruiz");
        assert!(json.get("motivo").is_none());
        assert_eq!(json["observaciones"], "llamada");
    }
}
