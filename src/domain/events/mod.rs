//! Domain events
use crate::domain::aggregates::PayoutType;
use crate::domain::value_objects::Money;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stream", content = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    Ledger(LedgerEvent),
    Grant(GrantEvent),
}

impl DomainEvent {
    /// Subject suffix used when publishing.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ledger(e) => match e {
                LedgerEvent::CommissionAccrued { .. } => "commission_accrued",
                LedgerEvent::PayoutRequested { .. } => "payout_requested",
                LedgerEvent::PayoutApproved { .. } => "payout_approved",
                LedgerEvent::PayoutPaid { .. } => "payout_paid",
                LedgerEvent::PayoutRejected { .. } => "payout_rejected",
            },
            Self::Grant(e) => match e {
                GrantEvent::Consumed { .. } => "grant_consumed",
                GrantEvent::QuotaIncreased { .. } => "grant_quota_increased",
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    CommissionAccrued { affiliate_id: String, order_id: String, commission: Money },
    PayoutRequested { affiliate_id: String, request_id: String, amount: Money, payout_type: PayoutType },
    PayoutApproved { affiliate_id: String, request_id: String },
    PayoutPaid { affiliate_id: String, request_id: String, amount: Money, store_credit_bonus: Option<Money> },
    PayoutRejected { affiliate_id: String, request_id: String, amount: Money },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GrantEvent {
    Consumed { influencer_id: String, receipt_id: String, product_title: String, products_used: u32, max_products: u32 },
    QuotaIncreased { influencer_id: String, max_products: u32 },
}
