//! # Clinic Core
//!
//! 牙科诊所管理系统的核心模块，提供实体数据结构、错误定义、
//! 角色权限策略和通用工具。

pub mod budget;
pub mod error;
pub mod models;
pub mod patient;
pub mod payment;
pub mod payment_link;
pub mod policy;
pub mod refund;
pub mod utils;

pub use budget::{Budget, BudgetItem, BudgetStatus, Priority};
pub use error::{ClinicError, Result};
pub use models::*;
pub use patient::{Patient, PatientStatus};
pub use payment::{Payment, PaymentStatus};
pub use payment_link::{LinkStatus, PaymentLink};
pub use policy::{AccessGuard, CallerContext, Role, Scoped};
pub use refund::{Refund, RefundStatus};
