//! 预算金额计算
//!
//! `lineTotal = cantidad × precioUnitario × (1 − descuento/100)`，
//! `total = Σ lineTotal × (1 − descuentoGlobal/100) × (1 + impuestos/100)`。
//! 计算字段每次保存时重算，客户端传入的值一律忽略。

use clinic_core::budget::BudgetItem;
use clinic_core::utils::{ensure_percentage, require_text, round_money};
use clinic_core::{Budget, ClinicError, Result};
use rust_decimal::Decimal;

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

/// 计算限制
#[derive(Debug, Clone)]
pub struct PricingLimits {
    /// 税率上限（百分比），由诊所配置
    pub max_tax_pct: Decimal,
}

impl Default for PricingLimits {
    fn default() -> Self {
        Self {
            max_tax_pct: Decimal::from(50),
        }
    }
}

/// 计算结果
#[derive(Debug, Clone, PartialEq)]
pub struct Totals {
    pub subtotal: Decimal,
    pub total: Decimal,
}

fn discount_factor(pct: Decimal) -> Decimal {
    Decimal::ONE - pct / HUNDRED
}

fn amount_overflow() -> ClinicError {
    ClinicError::validation("Los importes del presupuesto superan el máximo admitido")
}

/// 单行折后金额（未取整）；溢出时返回校验错误
pub fn line_total(item: &BudgetItem) -> Result<Decimal> {
    Decimal::from(item.cantidad)
        .checked_mul(item.precio_unitario)
        .and_then(|gross| gross.checked_mul(discount_factor(item.descuento)))
        .ok_or_else(amount_overflow)
}

fn validate_item(index: usize, item: &BudgetItem) -> Result<()> {
    let position = index + 1;
    require_text(&format!("La descripción de la línea {}", position), &item.descripcion, 300)?;
    if item.cantidad == 0 {
        return Err(ClinicError::validation(format!(
            "La cantidad de la línea {} debe ser al menos 1",
            position
        )));
    }
    if item.precio_unitario < Decimal::ZERO {
        return Err(ClinicError::validation(format!(
            "El precio unitario de la línea {} no puede ser negativo",
            position
        )));
    }
    ensure_percentage(&format!("El descuento de la línea {}", position), item.descuento, HUNDRED)
}

/// 校验输入并计算合计（不修改预算）
pub fn compute_totals(
    items: &[BudgetItem],
    descuento_global: Decimal,
    impuestos: Decimal,
    limits: &PricingLimits,
) -> Result<Totals> {
    if items.is_empty() {
        return Err(ClinicError::validation(
            "El presupuesto debe tener al menos una línea",
        ));
    }
    for (index, item) in items.iter().enumerate() {
        validate_item(index, item)?;
    }
    ensure_percentage("El descuento global", descuento_global, HUNDRED)?;
    ensure_percentage("Los impuestos", impuestos, limits.max_tax_pct)?;

    let subtotal = items.iter().try_fold(Decimal::ZERO, |acc, item| {
        acc.checked_add(line_total(item)?).ok_or_else(amount_overflow)
    })?;
    let total = subtotal
        .checked_mul(discount_factor(descuento_global))
        .and_then(|net| net.checked_mul(Decimal::ONE + impuestos / HUNDRED))
        .ok_or_else(amount_overflow)?;

    Ok(Totals {
        subtotal: round_money(subtotal),
        total: round_money(total),
    })
}

/// 重算预算的行金额、小计和总额
pub fn reprice(budget: &mut Budget, limits: &PricingLimits) -> Result<()> {
    let totals = compute_totals(
        &budget.items,
        budget.descuento_global,
        budget.impuestos,
        limits,
    )?;
    for item in &mut budget.items {
        item.subtotal = round_money(line_total(item)?);
    }
    budget.subtotal = totals.subtotal;
    budget.total = totals.total;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(cantidad: u32, precio: i64, descuento: i64) -> BudgetItem {
        BudgetItem {
            descripcion: "Empaste".to_string(),
            cantidad,
            precio_unitario: Decimal::from(precio),
            descuento: Decimal::from(descuento),
            categoria: None,
            pieza: None,
            subtotal: Decimal::ZERO,
        }
    }

    #[test]
    fn test_single_item_with_discount_and_tax() {
        let totals = compute_totals(
            &[item(2, 100, 10)],
            Decimal::ZERO,
            Decimal::from(21),
            &PricingLimits::default(),
        )
        .unwrap();
        assert_eq!(totals.subtotal, Decimal::new(18000, 2));
        assert_eq!(totals.total, Decimal::new(21780, 2));
    }

    #[test]
    fn test_total_matches_formula_across_discounts_and_tax() {
        let items = [item(3, 45, 5), item(1, 1200, 0), item(2, 80, 100)];
        for global in [0i64, 7, 15, 50, 100] {
            for tax in [0i64, 4, 10, 21, 50] {
                let totals = compute_totals(
                    &items,
                    Decimal::from(global),
                    Decimal::from(tax),
                    &PricingLimits::default(),
                )
                .unwrap();
                let lines = 3.0 * 45.0 * 0.95 + 1200.0 + 0.0;
                let expected =
                    lines * (1.0 - global as f64 / 100.0) * (1.0 + tax as f64 / 100.0);
                let actual: f64 = totals.total.to_string().parse().unwrap();
                assert!(
                    (actual - expected).abs() < 0.005 + 1e-9,
                    "global={global} tax={tax} expected={expected} actual={actual}"
                );
            }
        }
    }

    #[test]
    fn test_out_of_range_percentages_are_rejected() {
        let limits = PricingLimits::default();
        assert!(compute_totals(&[item(1, 10, 101)], Decimal::ZERO, Decimal::ZERO, &limits).is_err());
        assert!(compute_totals(&[item(1, 10, 0)], Decimal::from(-5), Decimal::ZERO, &limits).is_err());
        assert!(compute_totals(&[item(1, 10, 0)], Decimal::ZERO, Decimal::from(51), &limits).is_err());
        assert!(compute_totals(&[item(0, 10, 0)], Decimal::ZERO, Decimal::ZERO, &limits).is_err());
        assert!(compute_totals(&[], Decimal::ZERO, Decimal::ZERO, &limits).is_err());
    }

    #[test]
    fn test_amount_overflow_is_a_validation_error() {
        let limits = PricingLimits::default();
        let mut huge = item(4_000_000_000, 0, 0);
        huge.precio_unitario = Decimal::from(7_000_000_000_000_000_000u64) * Decimal::TEN;
        let result = compute_totals(&[huge], Decimal::ZERO, Decimal::ZERO, &limits);
        assert!(matches!(result, Err(ClinicError::Validation(_))));

        // 单行不溢出，但合计或税后金额溢出
        let mut line = item(1, 0, 0);
        line.precio_unitario = Decimal::MAX;
        let result = compute_totals(&[line.clone(), line.clone()], Decimal::ZERO, Decimal::ZERO, &limits);
        assert!(matches!(result, Err(ClinicError::Validation(_))));
        let result = compute_totals(&[line], Decimal::ZERO, Decimal::from(21), &limits);
        assert!(matches!(result, Err(ClinicError::Validation(_))));
    }
}
