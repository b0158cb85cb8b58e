//! 查询条件
//!
//! 过滤条件以小型语法树表示：PostgreSQL 实现将其渲染为 JSONB 上的 SQL（值全部绑定），
//! 内存实现直接在 `serde_json::Value` 上求值。字段路径为点分隔的 camelCase 名称，
//! 例如 `profesional.id`。

use std::cmp::Ordering;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use clinic_core::{ClinicError, Result};
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::{Postgres, QueryBuilder};
use uuid::Uuid;

/// 字段路径（只接受编译期常量）
pub type FieldPath = &'static str;

/// 比较值
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Text(String),
    Number(Decimal),
    Date(DateTime<Utc>),
    Bool(bool),
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::Text(value)
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Text(value.to_string())
    }
}

impl From<Uuid> for Scalar {
    fn from(value: Uuid) -> Self {
        Scalar::Text(value.to_string())
    }
}

impl From<Decimal> for Scalar {
    fn from(value: Decimal) -> Self {
        Scalar::Number(value)
    }
}

impl From<DateTime<Utc>> for Scalar {
    fn from(value: DateTime<Utc>) -> Self {
        Scalar::Date(value)
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Bool(value)
    }
}

/// 过滤谓词
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq(FieldPath, Scalar),
    In(FieldPath, Vec<Scalar>),
    /// 任一字段包含关键字（不区分大小写）
    Text(Vec<FieldPath>, String),
    /// 闭区间，任一端可省略
    Range {
        field: FieldPath,
        min: Option<Scalar>,
        max: Option<Scalar>,
    },
    /// 数组字段包含任一标签
    AnyOf(FieldPath, Vec<String>),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

/// 多个谓词的合取
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    predicates: Vec<Predicate>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, predicate: Predicate) {
        self.predicates.push(predicate);
    }

    pub fn and(mut self, predicate: Predicate) -> Self {
        self.push(predicate);
        self
    }

    pub fn eq(self, field: FieldPath, value: impl Into<Scalar>) -> Self {
        self.and(Predicate::Eq(field, value.into()))
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// 内存求值
    pub fn matches(&self, doc: &Value) -> bool {
        self.predicates.iter().all(|p| p.matches(doc))
    }
}

/// 排序字段的类型，决定 SQL 中的转换方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Number,
    Date,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl FromStr for SortOrder {
    type Err = ClinicError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            other => Err(ClinicError::validation(format!(
                "Orden no válido: '{}' (usa asc o desc)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sort {
    pub field: FieldPath,
    pub kind: FieldKind,
    pub order: SortOrder,
}

impl Default for Sort {
    fn default() -> Self {
        Self {
            field: "createdAt",
            kind: FieldKind::Date,
            order: SortOrder::Desc,
        }
    }
}

/// 分页查询
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub filter: Filter,
    pub sort: Sort,
    pub offset: u64,
    pub limit: u64,
}

impl Query {
    pub fn new(filter: Filter) -> Self {
        Self {
            filter,
            sort: Sort::default(),
            offset: 0,
            limit: 20,
        }
    }
}

/// 聚合分组方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupBy {
    Field(FieldPath),
    /// 按日期字段的 `YYYY-MM` 分组
    Month(FieldPath),
}

/// 缺失分组键时使用的名称
pub const MISSING_GROUP_KEY: &str = "sin_asignar";

// ========== SQL 渲染 ==========

/// `a.b` → `'{a,b}'`
pub fn json_path(field: &str) -> Result<String> {
    let valid = !field.is_empty()
        && field.split('.').all(|segment| {
            !segment.is_empty() && segment.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if !valid {
        return Err(ClinicError::Internal(format!("Ruta de campo no válida: {}", field)));
    }
    Ok(format!("'{{{}}}'", field.replace('.', ",")))
}

fn text_expr(field: &str) -> Result<String> {
    Ok(format!("(data #>> {})", json_path(field)?))
}

fn typed_expr(field: &str, scalar: &Scalar) -> Result<String> {
    let text = text_expr(field)?;
    Ok(match scalar {
        Scalar::Text(_) => text,
        Scalar::Number(_) => format!("{}::numeric", text),
        Scalar::Date(_) => format!("{}::timestamptz", text),
        Scalar::Bool(_) => format!("{}::boolean", text),
    })
}

fn kind_expr(field: &str, kind: FieldKind) -> Result<String> {
    let text = text_expr(field)?;
    Ok(match kind {
        FieldKind::Text => text,
        FieldKind::Number => format!("{}::numeric", text),
        FieldKind::Date => format!("{}::timestamptz", text),
    })
}

fn push_scalar(qb: &mut QueryBuilder<'_, Postgres>, scalar: &Scalar) {
    match scalar {
        Scalar::Text(value) => qb.push_bind(value.clone()),
        Scalar::Number(value) => qb.push_bind(*value),
        Scalar::Date(value) => qb.push_bind(*value),
        Scalar::Bool(value) => qb.push_bind(*value),
    };
}

/// 转义 LIKE 通配符
pub fn like_pattern(term: &str) -> String {
    let escaped = term
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

fn push_predicate(qb: &mut QueryBuilder<'_, Postgres>, predicate: &Predicate) -> Result<()> {
    match predicate {
        Predicate::Eq(field, value) => {
            qb.push(typed_expr(field, value)?).push(" = ");
            push_scalar(qb, value);
        }
        Predicate::In(field, values) => {
            let Some(first) = values.first() else {
                qb.push("FALSE");
                return Ok(());
            };
            qb.push(typed_expr(field, first)?).push(" IN (");
            let mut separated = qb.separated(", ");
            for value in values {
                match value {
                    Scalar::Text(v) => separated.push_bind(v.clone()),
                    Scalar::Number(v) => separated.push_bind(*v),
                    Scalar::Date(v) => separated.push_bind(*v),
                    Scalar::Bool(v) => separated.push_bind(*v),
                };
            }
            qb.push(")");
        }
        Predicate::Text(fields, term) => {
            if fields.is_empty() {
                qb.push("TRUE");
                return Ok(());
            }
            let pattern = like_pattern(term);
            qb.push("(");
            for (i, field) in fields.iter().enumerate() {
                if i > 0 {
                    qb.push(" OR ");
                }
                qb.push(text_expr(field)?).push(" ILIKE ");
                qb.push_bind(pattern.clone());
            }
            qb.push(")");
        }
        Predicate::Range { field, min, max } => {
            let Some(sample) = min.as_ref().or(max.as_ref()) else {
                qb.push("TRUE");
                return Ok(());
            };
            let expr = typed_expr(field, sample)?;
            qb.push("(");
            if let Some(min) = min {
                qb.push(&expr).push(" >= ");
                push_scalar(qb, min);
            }
            if let Some(max) = max {
                if min.is_some() {
                    qb.push(" AND ");
                }
                qb.push(&expr).push(" <= ");
                push_scalar(qb, max);
            }
            qb.push(")");
        }
        Predicate::AnyOf(field, tags) => {
            qb.push(format!("(data #> {}) ?| ", json_path(field)?));
            qb.push_bind(tags.clone());
        }
        Predicate::And(items) | Predicate::Or(items) => {
            let (joiner, empty) = match predicate {
                Predicate::And(_) => (" AND ", "TRUE"),
                _ => (" OR ", "FALSE"),
            };
            if items.is_empty() {
                qb.push(empty);
                return Ok(());
            }
            qb.push("(");
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    qb.push(joiner);
                }
                push_predicate(qb, item)?;
            }
            qb.push(")");
        }
    }
    Ok(())
}

/// 追加 `WHERE ...`（无条件时不追加）
pub fn push_where(qb: &mut QueryBuilder<'_, Postgres>, filter: &Filter) -> Result<()> {
    for (i, predicate) in filter.predicates().iter().enumerate() {
        qb.push(if i == 0 { " WHERE " } else { " AND " });
        push_predicate(qb, predicate)?;
    }
    Ok(())
}

/// 追加排序与分页
pub fn push_order_and_page(qb: &mut QueryBuilder<'_, Postgres>, query: &Query) -> Result<()> {
    let direction = match query.sort.order {
        SortOrder::Asc => "ASC",
        SortOrder::Desc => "DESC",
    };
    qb.push(format!(
        " ORDER BY {} {} NULLS LAST, id {}",
        kind_expr(query.sort.field, query.sort.kind)?,
        direction,
        direction
    ));
    qb.push(" LIMIT ").push_bind(query.limit as i64);
    qb.push(" OFFSET ").push_bind(query.offset as i64);
    Ok(())
}

/// 分组键表达式
pub fn group_expr(group: GroupBy) -> Result<String> {
    let expr = match group {
        GroupBy::Field(field) => text_expr(field)?,
        GroupBy::Month(field) => format!(
            "to_char({}::timestamptz AT TIME ZONE 'UTC', 'YYYY-MM')",
            text_expr(field)?
        ),
    };
    Ok(format!("COALESCE({}, '{}')", expr, MISSING_GROUP_KEY))
}

/// 求和表达式
pub fn sum_expr(field: Option<FieldPath>) -> Result<String> {
    Ok(match field {
        Some(field) => format!("COALESCE(SUM({}::numeric), 0)", text_expr(field)?),
        None => "0::numeric".to_string(),
    })
}

// ========== 内存求值 ==========

/// 读取点分路径上的值（null 视为缺失）
pub fn lookup<'a>(doc: &'a Value, field: &str) -> Option<&'a Value> {
    let pointer = format!("/{}", field.replace('.', "/"));
    doc.pointer(&pointer).filter(|v| !v.is_null())
}

/// 值的文本形式，与 PostgreSQL `#>>` 的结果一致
pub fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

pub fn as_decimal(value: &Value) -> Option<Decimal> {
    let text = as_text(value)?;
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}

pub fn as_date(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn compare(value: &Value, scalar: &Scalar) -> Option<Ordering> {
    match scalar {
        Scalar::Text(expected) => as_text(value).map(|actual| actual.as_str().cmp(expected.as_str())),
        Scalar::Number(expected) => as_decimal(value).map(|actual| actual.cmp(expected)),
        Scalar::Date(expected) => as_date(value).map(|actual| actual.cmp(expected)),
        Scalar::Bool(expected) => value.as_bool().map(|actual| actual.cmp(expected)),
    }
}

/// 按排序字段比较两个文档，缺失值排在最后
pub fn compare_documents(a: &Value, b: &Value, sort: &Sort) -> Ordering {
    let key = |doc: &Value| -> Option<Scalar> {
        let value = lookup(doc, sort.field)?;
        match sort.kind {
            FieldKind::Text => as_text(value).map(Scalar::Text),
            FieldKind::Number => as_decimal(value).map(Scalar::Number),
            FieldKind::Date => as_date(value).map(Scalar::Date),
        }
    };
    let ordered = |x: &Scalar, y: &Scalar| match (x, y) {
        (Scalar::Text(x), Scalar::Text(y)) => x.cmp(y),
        (Scalar::Number(x), Scalar::Number(y)) => x.cmp(y),
        (Scalar::Date(x), Scalar::Date(y)) => x.cmp(y),
        _ => Ordering::Equal,
    };
    match (key(a), key(b)) {
        (Some(x), Some(y)) => match sort.order {
            SortOrder::Asc => ordered(&x, &y),
            SortOrder::Desc => ordered(&y, &x),
        },
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// 内存中的分组键
pub fn group_key(doc: &Value, group: GroupBy) -> String {
    let key = match group {
        GroupBy::Field(field) => lookup(doc, field).and_then(as_text),
        GroupBy::Month(field) => lookup(doc, field)
            .and_then(as_date)
            .map(|dt| dt.format("%Y-%m").to_string()),
    };
    key.unwrap_or_else(|| MISSING_GROUP_KEY.to_string())
}

impl Predicate {
    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Predicate::Eq(field, expected) => lookup(doc, field)
                .and_then(|v| compare(v, expected))
                .is_some_and(|o| o == Ordering::Equal),
            Predicate::In(field, values) => values
                .iter()
                .any(|expected| Predicate::Eq(field, expected.clone()).matches(doc)),
            Predicate::Text(fields, term) => {
                let needle = term.to_lowercase();
                fields.iter().any(|field| {
                    lookup(doc, field)
                        .and_then(as_text)
                        .is_some_and(|text| text.to_lowercase().contains(&needle))
                })
            }
            Predicate::Range { field, min, max } => {
                let Some(value) = lookup(doc, field) else {
                    return min.is_none() && max.is_none();
                };
                let above = min
                    .as_ref()
                    .map_or(true, |m| compare(value, m).is_some_and(|o| o != Ordering::Less));
                let below = max
                    .as_ref()
                    .map_or(true, |m| compare(value, m).is_some_and(|o| o != Ordering::Greater));
                above && below
            }
            Predicate::AnyOf(field, tags) => lookup(doc, field)
                .and_then(Value::as_array)
                .is_some_and(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .any(|item| tags.iter().any(|tag| tag == item))
                }),
            Predicate::And(items) => items.iter().all(|p| p.matches(doc)),
            Predicate::Or(items) => items.iter().any(|p| p.matches(doc)),
        }
    }
}
