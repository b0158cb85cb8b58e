//! 状态机
//!
//! 以"当前状态 → 允许的下一状态"表描述各实体的生命周期。

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use clinic_core::{BudgetStatus, ClinicError, LinkStatus, PaymentStatus, RefundStatus, Result};

/// 具有固定转换表的状态类型
pub trait Lifecycle: Copy + Eq + Hash + fmt::Debug + fmt::Display + 'static {
    fn transitions() -> &'static [(Self, &'static [Self])];
}

impl Lifecycle for BudgetStatus {
    fn transitions() -> &'static [(Self, &'static [Self])] {
        use BudgetStatus::*;
        &[
            (Pendiente, &[Presentado, Cancelado]),
            (Presentado, &[Aceptado, Perdido, Caducado]),
            // 例外情况下已接受的预算仍可标记为丢失
            (Aceptado, &[Perdido]),
            (Perdido, &[Presentado]),
            (Caducado, &[Presentado]),
            (Cancelado, &[Pendiente]),
        ]
    }
}

impl Lifecycle for PaymentStatus {
    fn transitions() -> &'static [(Self, &'static [Self])] {
        use PaymentStatus::*;
        &[
            (Pendiente, &[Procesando, Completado, Fallido, Cancelado]),
            (Procesando, &[Completado, Fallido, Parcial, Cancelado]),
            (Parcial, &[Completado, Devuelto, Cancelado]),
            (Completado, &[Devuelto, Parcial]),
            (Fallido, &[Pendiente]),
        ]
    }
}

impl Lifecycle for LinkStatus {
    fn transitions() -> &'static [(Self, &'static [Self])] {
        use LinkStatus::*;
        &[
            (Activo, &[Pagado, Vencido, Cancelado, Suspendido]),
            // 只能通过续期重新激活
            (Vencido, &[Activo]),
            (Cancelado, &[Activo]),
            (Suspendido, &[Activo]),
        ]
    }
}

impl Lifecycle for RefundStatus {
    fn transitions() -> &'static [(Self, &'static [Self])] {
        use RefundStatus::*;
        &[
            (Solicitada, &[Revisando, Cancelada]),
            (Revisando, &[Aprobada, Rechazada, Cancelada]),
            (Aprobada, &[Procesando, Cancelada]),
            (Procesando, &[Completada, Fallida]),
            (Fallida, &[Procesando]),
        ]
    }
}

/// 通用状态机
#[derive(Debug)]
pub struct StateMachine<S: Lifecycle> {
    transitions: HashMap<S, Vec<S>>,
}

impl<S: Lifecycle> StateMachine<S> {
    /// 创建新的状态机实例
    pub fn new() -> Self {
        let transitions = S::transitions()
            .iter()
            .map(|(from, to)| (*from, to.to_vec()))
            .collect();
        Self { transitions }
    }

    /// 检查状态转换是否有效
    pub fn can_transition(&self, from: S, to: S) -> bool {
        self.transitions
            .get(&from)
            .is_some_and(|next| next.contains(&to))
    }

    /// 执行状态转换
    pub fn transition(&self, from: S, to: S) -> Result<S> {
        if self.can_transition(from, to) {
            Ok(to)
        } else {
            Err(ClinicError::invalid_transition(from, to))
        }
    }

    /// 获取状态的所有后继状态
    pub fn possible_next(&self, current: S) -> Vec<S> {
        self.transitions.get(&current).cloned().unwrap_or_default()
    }

    /// 没有出边的状态
    pub fn is_terminal(&self, state: S) -> bool {
        self.possible_next(state).is_empty()
    }
}

impl<S: Lifecycle> Default for StateMachine<S> {
    fn default() -> Self {
        Self::new()
    }
}
