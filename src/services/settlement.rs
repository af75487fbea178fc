//! Order settlement routing
//!
//! Consumes the once-per-order settlement event from checkout and routes it to
//! exactly one incentive: commission accrual for an affiliate code or grant
//! consumption for an influencer code. Referral problems found at this point
//! never fail the order; they are logged and reported in the outcome.

use std::sync::Arc;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::aggregates::InfluencerProductReceipt;
use crate::domain::value_objects::Money;
use crate::journal::{Commit, Journal, SettledOrder};
use crate::services::grants::GrantQuotaTracker;
use crate::services::ledger::{AccrualOutcome, IncentiveLedger};
use crate::services::resolver::{CodeResolution, IncentiveCodeResolver, ReferralOwner, Unavailable};
use crate::{IncentiveError, Result};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementEvent {
    pub order_id: String,
    /// Grand total the customer paid, after every discount.
    pub order_total: Money,
    pub referral_code: Option<String>,
    /// Title recorded on the grant receipt for influencer orders.
    pub grant_product_title: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SettlementOutcome {
    NoReferral,
    ReferralNotApplied { code: String, reason: Unavailable },
    CommissionAccrued { affiliate_id: String, commission: Money },
    GrantConsumed { influencer_id: String, receipt: InfluencerProductReceipt },
    /// Commission for this order was credited outside settlement.
    AlreadyAccrued { affiliate_id: String },
    /// The order id was settled before; the first outcome is returned.
    Replayed { original: Box<SettlementOutcome> },
}

pub struct SettlementService {
    resolver: Arc<IncentiveCodeResolver>,
    ledger: Arc<IncentiveLedger>,
    grants: Arc<GrantQuotaTracker>,
    settled: DashMap<String, SettlementOutcome>,
    journal: Journal,
}

impl SettlementService {
    pub fn new(resolver: Arc<IncentiveCodeResolver>, ledger: Arc<IncentiveLedger>, grants: Arc<GrantQuotaTracker>, journal: Journal) -> Self {
        Self { resolver, ledger, grants, settled: DashMap::new(), journal }
    }

    /// Reloads stored outcomes. Grant receipts that name an order with no
    /// stored outcome were written just before a stop; they count as settled.
    pub(crate) fn restore(&self, settled: Vec<SettledOrder>, order_receipts: Vec<InfluencerProductReceipt>) {
        for order in settled {
            self.settled.insert(order.order_id, order.outcome);
        }
        for receipt in order_receipts {
            let Some(order_id) = receipt.order_id.clone() else { continue };
            self.settled
                .entry(order_id)
                .or_insert_with(|| SettlementOutcome::GrantConsumed { influencer_id: receipt.influencer_id.clone(), receipt });
        }
    }

    pub fn settle(&self, event: &SettlementEvent) -> Result<SettlementOutcome> {
        if event.order_total.is_negative() {
            return Err(IncentiveError::InvalidAmount(format!("order {} has a negative total", event.order_id)));
        }
        match self.settled.entry(event.order_id.clone()) {
            Entry::Occupied(seen) => {
                info!(order_id = %event.order_id, "settlement replay, returning first outcome");
                Ok(SettlementOutcome::Replayed { original: Box::new(seen.get().clone()) })
            }
            Entry::Vacant(slot) => {
                let outcome = self.route(event)?;
                self.journal.record(Commit::settlement(SettledOrder {
                    order_id: event.order_id.clone(), outcome: outcome.clone(), settled_at: Utc::now(),
                }));
                slot.insert(outcome.clone());
                Ok(outcome)
            }
        }
    }

    pub fn outcome(&self, order_id: &str) -> Option<SettlementOutcome> { self.settled.get(order_id).map(|o| o.value().clone()) }

    fn route(&self, event: &SettlementEvent) -> Result<SettlementOutcome> {
        let Some(code) = event.referral_code.as_deref().filter(|c| !c.trim().is_empty()) else {
            return Ok(SettlementOutcome::NoReferral);
        };

        let binding = match self.resolver.resolve(code) {
            CodeResolution::Bound(binding) => binding,
            CodeResolution::NotFound { reason } => {
                warn!(order_id = %event.order_id, code, ?reason, "referral code not applied at settlement");
                return Ok(SettlementOutcome::ReferralNotApplied { code: code.to_string(), reason });
            }
        };

        match binding.owner {
            ReferralOwner::Affiliate { affiliate_id } => {
                match self.ledger.accrue_commission(&affiliate_id, &event.order_id, &event.order_total)? {
                    AccrualOutcome::Accrued { commission } => Ok(SettlementOutcome::CommissionAccrued { affiliate_id, commission }),
                    AccrualOutcome::Replayed => Ok(SettlementOutcome::AlreadyAccrued { affiliate_id }),
                }
            }
            ReferralOwner::Influencer { influencer_id } => {
                let title = event.grant_product_title.clone().unwrap_or_else(|| format!("Order {}", event.order_id));
                match self.grants.consume_for_order(&influencer_id, &title, &event.order_id) {
                    Ok(receipt) => Ok(SettlementOutcome::GrantConsumed { influencer_id, receipt }),
                    Err(IncentiveError::QuotaExhausted { .. }) => {
                        Ok(SettlementOutcome::ReferralNotApplied { code: binding.code.to_string(), reason: Unavailable::Exhausted })
                    }
                    Err(IncentiveError::CodeExpired { .. }) => {
                        Ok(SettlementOutcome::ReferralNotApplied { code: binding.code.to_string(), reason: Unavailable::Expired })
                    }
                    Err(IncentiveError::InfluencerPaused(_)) => {
                        Ok(SettlementOutcome::ReferralNotApplied { code: binding.code.to_string(), reason: Unavailable::Paused })
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }
}
