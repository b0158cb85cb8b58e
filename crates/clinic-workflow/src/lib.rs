//! # 诊所工作流模块
//!
//! 提供实体生命周期管理，包括：
//! - 状态机：预算、收款、支付链接和退款的状态转换表
//! - 预算管线：金额计算、阶段耗时指标、沟通记录
//! - 收款账本与对账
//! - 支付链接：惰性过期、尝试次数锁定、续期
//! - 退款审批与处理

pub mod context;
pub mod engine;
pub mod payment;
pub mod payment_link;
pub mod pipeline;
pub mod pricing;
pub mod refund;
pub mod state_machine;
pub mod stats;

// 重新导出主要类型
pub use context::{system_actor, Origin, PatientSnapshot};
pub use engine::{ClinicWorkflow, WorkflowSettings};
pub use payment::PaymentLedger;
pub use payment_link::{LinkDefaults, LinkManager};
pub use pipeline::BudgetPipeline;
pub use pricing::{compute_totals, PricingLimits, Totals};
pub use refund::{RefundDesk, RefundOutcome};
pub use state_machine::{Lifecycle, StateMachine};
pub use stats::{PipelineStats, StatsReport};
