//! 通用工具函数

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use rust_decimal::{Decimal, RoundingStrategy};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{ClinicError, Result};

const MS_PER_DAY: f64 = 86_400_000.0;

/// 金额保留两位小数（四舍五入，远离零）
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// 校验百分比在 `0..=max` 内；越界直接拒绝，不做截断
pub fn ensure_percentage(field: &str, value: Decimal, max: Decimal) -> Result<()> {
    if value < Decimal::ZERO || value > max {
        return Err(ClinicError::validation(format!(
            "{} debe estar entre 0 y {}",
            field, max
        )));
    }
    Ok(())
}

/// 生成人类可读的编号，例如 `PRES-2026-00042`
pub fn format_reference(prefix: &str, year: i32, seq: u64, width: usize) -> String {
    format!("{}-{}-{:0width$}", prefix, year, seq, width = width)
}

/// 患者病历号：`HC` + 6 位数字
pub fn format_clinical_record(seq: u64) -> String {
    format!("HC{:06}", seq)
}

/// 生成支付链接令牌（十六进制 SHA-256）
pub fn generate_link_token(link_id: Uuid) -> String {
    let mut hasher = Sha256::new();
    hasher.update(Uuid::new_v4().as_bytes());
    hasher.update(link_id.as_bytes());
    hasher.update(Utc::now().timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// 两个时间点之间的小时数，保留两位小数
pub fn hours_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let hours = (to - from).num_seconds() as f64 / 3600.0;
    (hours * 100.0).round() / 100.0
}

/// 距离截止时间的剩余天数，向上取整（毫秒精度）
pub fn days_until(deadline: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let millis = (deadline - now).num_milliseconds() as f64;
    (millis / MS_PER_DAY).ceil() as i64
}

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email pattern is valid")
    })
}

fn dni_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // DNI (8 dígitos + letra) o NIE (X/Y/Z + 7 dígitos + letra)
    RE.get_or_init(|| Regex::new(r"^([0-9]{8}|[XYZ][0-9]{7})[A-Z]$").expect("dni pattern is valid"))
}

fn phone_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\+?[0-9 ]{9,15}$").expect("phone pattern is valid"))
}

pub fn is_valid_email(email: &str) -> bool {
    email_regex().is_match(email)
}

pub fn is_valid_dni(dni: &str) -> bool {
    dni_regex().is_match(dni)
}

pub fn is_valid_phone(phone: &str) -> bool {
    phone_regex().is_match(phone)
}

/// 去除首尾空白，空字符串视为未提供
pub fn normalize_optional(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// 必填文本字段校验
pub fn require_text(field: &str, value: &str, max_len: usize) -> Result<()> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ClinicError::validation(format!("{} es obligatorio", field)));
    }
    if trimmed.chars().count() > max_len {
        return Err(ClinicError::validation(format!(
            "{} no puede superar {} caracteres",
            field, max_len
        )));
    }
    Ok(())
}
