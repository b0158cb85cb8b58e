//! 工作流引擎
//!
//! 持有各实体的生命周期组件，供 Web 层共享。

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::payment::PaymentLedger;
use crate::payment_link::{LinkDefaults, LinkManager};
use crate::pipeline::BudgetPipeline;
use crate::pricing::PricingLimits;
use crate::refund::RefundDesk;

/// 可配置的业务参数
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkflowSettings {
    /// 税率上限（百分比）
    pub max_tax_pct: Decimal,
    pub budget_validity_days: u32,
    pub link_validity_days: u32,
    pub link_attempt_limit: u32,
    pub default_currency: String,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            max_tax_pct: Decimal::from(50),
            budget_validity_days: 30,
            link_validity_days: 7,
            link_attempt_limit: 3,
            default_currency: "EUR".to_string(),
        }
    }
}

/// 工作流引擎
#[derive(Debug)]
pub struct ClinicWorkflow {
    settings: WorkflowSettings,
    pipeline: BudgetPipeline,
    payments: PaymentLedger,
    links: LinkManager,
    refunds: RefundDesk,
}

impl ClinicWorkflow {
    pub fn new(settings: WorkflowSettings) -> Self {
        let pipeline = BudgetPipeline::new(
            PricingLimits {
                max_tax_pct: settings.max_tax_pct,
            },
            settings.budget_validity_days,
        );
        let links = LinkManager::new(LinkDefaults {
            validity_days: settings.link_validity_days,
            attempt_limit: settings.link_attempt_limit,
            currency: settings.default_currency.clone(),
        });
        tracing::info!(
            budget_validity_days = settings.budget_validity_days,
            link_attempt_limit = settings.link_attempt_limit,
            "clinic workflow initialised"
        );
        Self {
            pipeline,
            payments: PaymentLedger::new(settings.default_currency.clone()),
            links,
            refunds: RefundDesk::new(),
            settings,
        }
    }

    pub fn settings(&self) -> &WorkflowSettings {
        &self.settings
    }

    pub fn pipeline(&self) -> &BudgetPipeline {
        &self.pipeline
    }

    pub fn payments(&self) -> &PaymentLedger {
        &self.payments
    }

    pub fn links(&self) -> &LinkManager {
        &self.links
    }

    pub fn refunds(&self) -> &RefundDesk {
        &self.refunds
    }
}

impl Default for ClinicWorkflow {
    fn default() -> Self {
        Self::new(WorkflowSettings::default())
    }
}
