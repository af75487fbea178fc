//! Rule catalog snapshot
//!
//! A `RuleCatalog` is the read-only set of discount rules and known variants a
//! single pricing pass runs against. It carries no behaviour beyond lookups;
//! callers swap whole snapshots rather than editing one in place.

use crate::domain::value_objects::{Money, Percent};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Scope of a volume tier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "product_id", rename_all = "snake_case")]
pub enum TierScope {
    Global,
    Product(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeTier {
    pub scope: TierScope,
    pub min_quantity: u32,
    pub percent: Percent,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleDiscount {
    pub bundle_id: String,
    pub member_product_ids: Vec<String>,
    pub percent: Percent,
    /// Quantity each member product needs in the cart for the bundle to qualify.
    #[serde(default = "default_required_quantity")]
    pub required_quantity: u32,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_required_quantity() -> u32 { 1 }
fn default_active() -> bool { true }

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiscountRule {
    MemberOverride { variant_id: String, price: Money },
    VolumeTier(VolumeTier),
    BundleDiscount(BundleDiscount),
}

/// Variant known to the catalog source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownVariant {
    pub variant_id: String,
    pub product_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleCatalog {
    member_overrides: HashMap<String, Money>,
    volume_tiers: Vec<VolumeTier>,
    bundles: Vec<BundleDiscount>,
    variants: HashMap<String, String>,
}

impl RuleCatalog {
    pub fn new() -> Self { Self::default() }

    /// Builds a snapshot from a flat rule list. A later `MemberOverride` for the
    /// same variant replaces an earlier one.
    pub fn from_rules(rules: impl IntoIterator<Item = DiscountRule>, variants: impl IntoIterator<Item = KnownVariant>) -> Self {
        let mut catalog = Self::new();
        for rule in rules { catalog.push_rule(rule); }
        for v in variants { catalog.variants.insert(v.variant_id, v.product_id); }
        catalog
    }

    pub fn with_rule(mut self, rule: DiscountRule) -> Self { self.push_rule(rule); self }

    pub fn with_variant(mut self, variant_id: impl Into<String>, product_id: impl Into<String>) -> Self {
        self.variants.insert(variant_id.into(), product_id.into());
        self
    }

    fn push_rule(&mut self, rule: DiscountRule) {
        match rule {
            DiscountRule::MemberOverride { variant_id, price } => { self.member_overrides.insert(variant_id, price); }
            DiscountRule::VolumeTier(tier) => self.volume_tiers.push(tier),
            DiscountRule::BundleDiscount(bundle) => self.bundles.push(bundle),
        }
    }

    pub fn product_for_variant(&self, variant_id: &str) -> Option<&str> {
        self.variants.get(variant_id).map(String::as_str)
    }

    pub fn member_override(&self, variant_id: &str) -> Option<&Money> { self.member_overrides.get(variant_id) }

    pub fn volume_tiers(&self) -> &[VolumeTier] { &self.volume_tiers }

    pub fn bundles(&self) -> &[BundleDiscount] { &self.bundles }

    /// Every rule in the snapshot, overrides ordered by variant id.
    pub fn rules(&self) -> Vec<DiscountRule> {
        let mut overrides: Vec<_> = self.member_overrides.iter().collect();
        overrides.sort_by(|a, b| a.0.cmp(b.0));
        overrides
            .into_iter()
            .map(|(variant_id, price)| DiscountRule::MemberOverride { variant_id: variant_id.clone(), price: price.clone() })
            .chain(self.volume_tiers.iter().cloned().map(DiscountRule::VolumeTier))
            .chain(self.bundles.iter().cloned().map(DiscountRule::BundleDiscount))
            .collect()
    }

    pub fn variant_count(&self) -> usize { self.variants.len() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_later_override_wins() {
        let catalog = RuleCatalog::new()
            .with_rule(DiscountRule::MemberOverride { variant_id: "V1".into(), price: Money::sek(dec!(90)) })
            .with_rule(DiscountRule::MemberOverride { variant_id: "V1".into(), price: Money::sek(dec!(80)) });
        assert_eq!(catalog.member_override("V1").unwrap().amount(), dec!(80));
        assert_eq!(catalog.rules().len(), 1);
    }

    #[test]
    fn test_rule_json_shape() {
        let json = r#"{"kind":"volume_tier","scope":{"type":"product","product_id":"P1"},"min_quantity":10,"percent":"15"}"#;
        let rule: DiscountRule = serde_json::from_str(json).unwrap();
        match rule {
            DiscountRule::VolumeTier(t) => {
                assert_eq!(t.scope, TierScope::Product("P1".into()));
                assert_eq!(t.percent.value(), dec!(15));
            }
            other => panic!("unexpected rule {other:?}"),
        }
    }
}
