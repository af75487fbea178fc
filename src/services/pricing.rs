//! Discount stacking engine
//!
//! Prices every line of a cart against one [`RuleCatalog`] snapshot. The
//! precedence is fixed: member override, then at most one volume tier, then at
//! most one bundle, then the referral discount on every line. Percentages
//! compound multiplicatively on the running unit price and only the final unit
//! price is rounded (banker's rounding to the currency's minor unit).

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::aggregates::{Cart, LineItem};
use crate::domain::catalog::{BundleDiscount, RuleCatalog, TierScope, VolumeTier};
use crate::domain::value_objects::{round_minor, Money, MoneyError, Percent};
use crate::services::resolver::ReferralBinding;
use crate::{IncentiveError, Result};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiscountKind {
    MemberPrice,
    VolumeTier { min_quantity: u32, percent: Percent },
    Bundle { bundle_id: String, percent: Percent },
    Referral { code: String, percent: Percent },
}

/// One pricing step that fired for a line, with the per-unit amount it took off
/// the running price (unrounded).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedDiscount {
    pub kind: DiscountKind,
    pub amount_off_per_unit: Money,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricedLine {
    pub line_id: String,
    pub product_id: String,
    pub variant_id: String,
    pub quantity: u32,
    pub base_unit_price: Money,
    pub final_unit_price: Money,
    pub line_total: Money,
    pub applied_discounts: Vec<AppliedDiscount>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PricingIssue {
    /// The line was left out of every total.
    UnknownVariant { line_id: String, variant_id: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricedCart {
    pub currency: String,
    pub lines: Vec<PricedLine>,
    pub issues: Vec<PricingIssue>,
    pub subtotal: Money,
    pub total_discount: Money,
    pub grand_total: Money,
    pub referral_applied: bool,
}

impl PricedCart {
    /// A cart with issues must be fixed before checkout.
    pub fn is_valid(&self) -> bool { self.issues.is_empty() }

    /// Turns the first issue into an error, for callers that gate checkout.
    pub fn ensure_valid(&self) -> Result<()> {
        match self.issues.first() {
            None => Ok(()),
            Some(PricingIssue::UnknownVariant { variant_id, .. }) => Err(IncentiveError::UnknownVariant { variant_id: variant_id.clone() }),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DiscountStackingEngine;

impl DiscountStackingEngine {
    pub fn new() -> Self { Self }

    pub fn price(&self, cart: &Cart, referral: Option<&ReferralBinding>, is_member: bool, catalog: &RuleCatalog) -> Result<PricedCart> {
        let currency = cart.currency();
        let mut issues = Vec::new();
        let mut known: Vec<(&LineItem, &str)> = Vec::with_capacity(cart.items().len());

        for item in cart.items() {
            match catalog.product_for_variant(&item.variant_id) {
                Some(product_id) if product_id == item.product_id => known.push((item, product_id)),
                _ => issues.push(PricingIssue::UnknownVariant { line_id: item.line_id.clone(), variant_id: item.variant_id.clone() }),
            }
        }

        let mut quantities: HashMap<&str, u32> = HashMap::new();
        for (item, product_id) in &known {
            let q = quantities.entry(*product_id).or_default();
            *q = q.saturating_add(item.quantity);
        }

        let mut lines = Vec::with_capacity(known.len());
        let mut subtotal = Decimal::ZERO;
        let mut grand_total = Decimal::ZERO;
        for (item, product_id) in known {
            let line = self.price_line(item, product_id, currency, referral, is_member, catalog, &quantities)?;
            subtotal += item.base_unit_price.amount() * Decimal::from(item.quantity);
            grand_total += line.line_total.amount();
            lines.push(line);
        }

        if grand_total < Decimal::ZERO {
            return Err(IncentiveError::RuleConflict(format!("cart {} priced to a negative total {}", cart.id(), grand_total)));
        }
        debug!(cart_id = cart.id(), %subtotal, %grand_total, issues = issues.len(), "priced cart");

        Ok(PricedCart {
            currency: currency.to_string(),
            lines,
            issues,
            subtotal: Money::new(subtotal, currency),
            total_discount: Money::new(subtotal - grand_total, currency),
            grand_total: Money::new(grand_total, currency),
            referral_applied: referral.is_some(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn price_line(
        &self,
        item: &LineItem,
        product_id: &str,
        currency: &str,
        referral: Option<&ReferralBinding>,
        is_member: bool,
        catalog: &RuleCatalog,
        quantities: &HashMap<&str, u32>,
    ) -> Result<PricedLine> {
        ensure_currency(currency, &item.base_unit_price)?;
        let mut price = item.base_unit_price.amount();
        let mut applied = Vec::new();

        if is_member {
            if let Some(member_price) = catalog.member_override(&item.variant_id) {
                ensure_currency(currency, member_price)?;
                if member_price.is_negative() {
                    return Err(IncentiveError::RuleConflict(format!("member price for {} is negative", item.variant_id)));
                }
                // An override above the current price would raise it; lowest net price wins.
                if member_price.amount() < price {
                    applied.push(AppliedDiscount { kind: DiscountKind::MemberPrice, amount_off_per_unit: Money::new(price - member_price.amount(), currency) });
                    price = member_price.amount();
                }
            }
        }

        if let Some(tier) = select_volume_tier(catalog.volume_tiers(), product_id, item.quantity) {
            let kind = DiscountKind::VolumeTier { min_quantity: tier.min_quantity, percent: tier.percent };
            price = take_percent(price, tier.percent, kind, currency, &mut applied);
        }

        if let Some(bundle) = select_bundle(catalog.bundles(), product_id, quantities) {
            let kind = DiscountKind::Bundle { bundle_id: bundle.bundle_id.clone(), percent: bundle.percent };
            price = take_percent(price, bundle.percent, kind, currency, &mut applied);
        }

        if let Some(binding) = referral {
            let kind = DiscountKind::Referral { code: binding.code.to_string(), percent: binding.customer_discount };
            price = take_percent(price, binding.customer_discount, kind, currency, &mut applied);
        }

        let final_unit = round_minor(price, currency);
        if final_unit < Decimal::ZERO {
            return Err(IncentiveError::RuleConflict(format!("line {} priced to a negative unit price {}", item.line_id, final_unit)));
        }

        Ok(PricedLine {
            line_id: item.line_id.clone(),
            product_id: product_id.to_string(),
            variant_id: item.variant_id.clone(),
            quantity: item.quantity,
            base_unit_price: item.base_unit_price.clone(),
            final_unit_price: Money::new(final_unit, currency),
            line_total: Money::new(final_unit * Decimal::from(item.quantity), currency),
            applied_discounts: applied,
        })
    }
}

fn ensure_currency(currency: &str, money: &Money) -> Result<()> {
    if money.currency() != currency {
        return Err(MoneyError::CurrencyMismatch { left: currency.to_string(), right: money.currency().to_string() }.into());
    }
    Ok(())
}

fn take_percent(price: Decimal, percent: Percent, kind: DiscountKind, currency: &str, applied: &mut Vec<AppliedDiscount>) -> Decimal {
    let next = price * percent.remaining_factor();
    applied.push(AppliedDiscount { kind, amount_off_per_unit: Money::new(price - next, currency) });
    next
}

/// Highest qualifying `min_quantity`, product-scoped tiers first, global tiers
/// only when no product tier qualifies. Equal thresholds resolve to the larger
/// percent.
pub fn select_volume_tier<'a>(tiers: &'a [VolumeTier], product_id: &str, quantity: u32) -> Option<&'a VolumeTier> {
    let best = |product_scoped: bool| {
        tiers
            .iter()
            .filter(|t| t.min_quantity <= quantity)
            .filter(move |t| match &t.scope {
                TierScope::Product(p) => product_scoped && p == product_id,
                TierScope::Global => !product_scoped,
            })
            .max_by(|a, b| a.min_quantity.cmp(&b.min_quantity).then(a.percent.cmp(&b.percent)))
    };
    best(true).or_else(|| best(false))
}

/// Largest-percent active bundle containing `product_id` whose every member is
/// in the cart with at least `required_quantity`. Ties go to the lowest bundle id.
pub fn select_bundle<'a>(bundles: &'a [BundleDiscount], product_id: &str, quantities: &HashMap<&str, u32>) -> Option<&'a BundleDiscount> {
    bundles
        .iter()
        .filter(|b| b.active && b.member_product_ids.iter().any(|m| m == product_id))
        .filter(|b| {
            b.member_product_ids
                .iter()
                .all(|m| quantities.get(m.as_str()).copied().unwrap_or(0) >= b.required_quantity.max(1))
        })
        .max_by(|a, b| a.percent.cmp(&b.percent).then_with(|| b.bundle_id.cmp(&a.bundle_id)))
}
