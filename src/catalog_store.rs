//! Postgres-backed rule catalog
//!
//! Loads the whole discount catalog in one pass and turns it into a
//! [`RuleCatalog`] snapshot. A row that cannot form a valid rule fails the
//! load, so a bad edit leaves the running snapshot in place.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::info;

use crate::domain::catalog::{BundleDiscount, DiscountRule, KnownVariant, RuleCatalog, TierScope, VolumeTier};
use crate::domain::value_objects::{Money, Percent};
use crate::{IncentiveError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct VariantRow { pub variant_id: String, pub product_id: String }

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MemberPriceRow { pub variant_id: String, pub price: Decimal, pub currency: String }

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct VolumeTierRow { pub product_id: Option<String>, pub min_quantity: i32, pub percent: Decimal }

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BundleRow { pub bundle_id: String, pub percent: Decimal, pub required_quantity: i32, pub active: bool }

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BundleMemberRow { pub bundle_id: String, pub product_id: String }

#[derive(Debug, Clone, Default)]
pub struct CatalogRows {
    pub variants: Vec<VariantRow>,
    pub member_prices: Vec<MemberPriceRow>,
    pub volume_tiers: Vec<VolumeTierRow>,
    pub bundles: Vec<BundleRow>,
    pub bundle_members: Vec<BundleMemberRow>,
}

#[derive(Clone)]
pub struct PgCatalogStore { pool: PgPool }

impl PgCatalogStore {
    pub fn new(pool: PgPool) -> Self { Self { pool } }

    pub async fn load(&self) -> Result<RuleCatalog> {
        let rows = self.fetch_rows().await.map_err(|e| IncentiveError::StorageError(e.to_string()))?;
        let catalog = assemble(rows)?;
        info!(variants = catalog.variant_count(), rules = catalog.rules().len(), "rule catalog loaded");
        Ok(catalog)
    }

    async fn fetch_rows(&self) -> std::result::Result<CatalogRows, sqlx::Error> {
        let variants = sqlx::query_as::<_, VariantRow>("SELECT variant_id, product_id FROM catalog_variants ORDER BY variant_id")
            .fetch_all(&self.pool).await?;
        let member_prices = sqlx::query_as::<_, MemberPriceRow>("SELECT variant_id, price, currency FROM member_prices ORDER BY variant_id")
            .fetch_all(&self.pool).await?;
        let volume_tiers = sqlx::query_as::<_, VolumeTierRow>("SELECT product_id, min_quantity, percent FROM volume_tiers ORDER BY id")
            .fetch_all(&self.pool).await?;
        let bundles = sqlx::query_as::<_, BundleRow>("SELECT bundle_id, percent, required_quantity, active FROM bundle_discounts ORDER BY bundle_id")
            .fetch_all(&self.pool).await?;
        let bundle_members = sqlx::query_as::<_, BundleMemberRow>("SELECT bundle_id, product_id FROM bundle_members ORDER BY bundle_id, product_id")
            .fetch_all(&self.pool).await?;
        Ok(CatalogRows { variants, member_prices, volume_tiers, bundles, bundle_members })
    }
}

/// Converts raw catalog rows into a snapshot.
pub fn assemble(rows: CatalogRows) -> Result<RuleCatalog> {
    let mut rules = Vec::with_capacity(rows.member_prices.len() + rows.volume_tiers.len() + rows.bundles.len());

    for row in rows.member_prices {
        if row.price < Decimal::ZERO {
            return Err(IncentiveError::RuleConflict(format!("member price for {} is negative", row.variant_id)));
        }
        rules.push(DiscountRule::MemberOverride { variant_id: row.variant_id, price: Money::new(row.price, &row.currency) });
    }

    for row in rows.volume_tiers {
        let min_quantity = positive(row.min_quantity, "volume tier min_quantity")?;
        let scope = row.product_id.map_or(TierScope::Global, TierScope::Product);
        rules.push(DiscountRule::VolumeTier(VolumeTier { scope, min_quantity, percent: Percent::new(row.percent)? }));
    }

    let mut members: HashMap<String, Vec<String>> = HashMap::new();
    for m in rows.bundle_members {
        members.entry(m.bundle_id).or_default().push(m.product_id);
    }
    for row in rows.bundles {
        let member_product_ids = members.remove(&row.bundle_id).unwrap_or_default();
        if member_product_ids.is_empty() {
            return Err(IncentiveError::RuleConflict(format!("bundle {} has no member products", row.bundle_id)));
        }
        rules.push(DiscountRule::BundleDiscount(BundleDiscount {
            required_quantity: positive(row.required_quantity, "bundle required_quantity")?,
            percent: Percent::new(row.percent)?,
            bundle_id: row.bundle_id,
            member_product_ids,
            active: row.active,
        }));
    }

    let variants = rows.variants.into_iter().map(|v| KnownVariant { variant_id: v.variant_id, product_id: v.product_id });
    Ok(RuleCatalog::from_rules(rules, variants))
}

fn positive(value: i32, what: &str) -> Result<u32> {
    u32::try_from(value)
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| IncentiveError::RuleConflict(format!("{what} must be positive, got {value}")))
}
