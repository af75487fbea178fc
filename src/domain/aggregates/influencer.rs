//! Influencer Aggregate

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::domain::events::{DomainEvent, GrantEvent};
use crate::domain::value_objects::{Quantity, ReferralCode};
use crate::{IncentiveError, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfluencerStatus { #[default] Active, Paused }

/// Why a grant cannot be used right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantAvailability { Available, Paused, Expired, Exhausted }

/// Audit record of one consumed grant. Never mutated or removed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfluencerProductReceipt {
    pub id: String,
    pub influencer_id: String,
    pub product_title: String,
    /// Order whose settlement consumed the grant, when there was one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// Stored columns of an influencer grant. Receipts are stored as their own rows.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InfluencerRecord {
    pub influencer_id: String,
    pub code: ReferralCode,
    pub display_name: String,
    pub status: InfluencerStatus,
    pub max_products: u32,
    pub products_used: u32,
    pub valid_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct InfluencerGrant {
    influencer_id: String,
    code: ReferralCode,
    display_name: String,
    status: InfluencerStatus,
    max_products: Quantity,
    products_used: Quantity,
    valid_until: Option<DateTime<Utc>>,
    receipts: Vec<InfluencerProductReceipt>,
    created_at: DateTime<Utc>,
    events: Vec<DomainEvent>,
}

impl InfluencerGrant {
    pub fn create(code: ReferralCode, display_name: impl Into<String>, max_products: u32, valid_until: Option<DateTime<Utc>>) -> Result<Self> {
        if max_products == 0 {
            return Err(IncentiveError::InvalidAmount("max_products must be greater than zero".into()));
        }
        Ok(Self {
            influencer_id: Uuid::new_v4().to_string(), code, display_name: display_name.into(),
            status: InfluencerStatus::Active, max_products: Quantity::new(max_products), products_used: Quantity::default(),
            valid_until, receipts: vec![], created_at: Utc::now(), events: vec![],
        })
    }

    /// Rebuilds a grant from stored rows. Every used product has exactly one
    /// receipt, so the two counts must agree.
    pub fn restore(record: InfluencerRecord, receipts: Vec<InfluencerProductReceipt>) -> Result<Self> {
        if receipts.len() != record.products_used as usize {
            return Err(IncentiveError::StorageError(format!(
                "influencer {} has {} receipts but {} products used", record.influencer_id, receipts.len(), record.products_used
            )));
        }
        Ok(Self {
            influencer_id: record.influencer_id, code: record.code, display_name: record.display_name, status: record.status,
            max_products: Quantity::new(record.max_products), products_used: Quantity::new(record.products_used),
            valid_until: record.valid_until, receipts, created_at: record.created_at, events: vec![],
        })
    }

    pub fn record(&self) -> InfluencerRecord {
        InfluencerRecord {
            influencer_id: self.influencer_id.clone(), code: self.code.clone(), display_name: self.display_name.clone(),
            status: self.status, max_products: self.max_products(), products_used: self.products_used(),
            valid_until: self.valid_until, created_at: self.created_at,
        }
    }

    pub fn influencer_id(&self) -> &str { &self.influencer_id }
    pub fn code(&self) -> &ReferralCode { &self.code }
    pub fn display_name(&self) -> &str { &self.display_name }
    pub fn status(&self) -> InfluencerStatus { self.status }
    pub fn max_products(&self) -> u32 { self.max_products.value() }
    pub fn products_used(&self) -> u32 { self.products_used.value() }
    pub fn remaining(&self) -> u32 { self.max_products.subtract(self.products_used.value()).map(|q| q.value()).unwrap_or(0) }
    pub fn valid_until(&self) -> Option<DateTime<Utc>> { self.valid_until }
    pub fn receipts(&self) -> &[InfluencerProductReceipt] { &self.receipts }
    pub fn created_at(&self) -> DateTime<Utc> { self.created_at }

    pub fn availability(&self, now: DateTime<Utc>) -> GrantAvailability {
        if self.status == InfluencerStatus::Paused { return GrantAvailability::Paused; }
        if self.valid_until.is_some_and(|until| now >= until) { return GrantAvailability::Expired; }
        if self.products_used >= self.max_products { return GrantAvailability::Exhausted; }
        GrantAvailability::Available
    }

    /// Uses one product from the quota and appends a receipt. A refused call
    /// leaves the grant untouched.
    pub(crate) fn consume(&mut self, product_title: impl Into<String>, order_id: Option<&str>, now: DateTime<Utc>) -> Result<InfluencerProductReceipt> {
        if self.status == InfluencerStatus::Paused {
            return Err(IncentiveError::InfluencerPaused(self.influencer_id.clone()));
        }
        if self.valid_until.is_some_and(|until| now >= until) {
            return Err(IncentiveError::CodeExpired { owner_id: self.influencer_id.clone() });
        }
        if self.products_used >= self.max_products {
            return Err(IncentiveError::QuotaExhausted { influencer_id: self.influencer_id.clone() });
        }
        self.products_used = self.products_used.add(1);
        let receipt = InfluencerProductReceipt {
            id: Uuid::now_v7().to_string(), influencer_id: self.influencer_id.clone(),
            product_title: product_title.into(), order_id: order_id.map(String::from), received_at: now,
        };
        self.receipts.push(receipt.clone());
        self.raise_event(DomainEvent::Grant(GrantEvent::Consumed {
            influencer_id: self.influencer_id.clone(), receipt_id: receipt.id.clone(), product_title: receipt.product_title.clone(),
            products_used: self.products_used.value(), max_products: self.max_products.value(),
        }));
        Ok(receipt)
    }

    /// Administrative correction for over-grants. Quotas only ever grow.
    pub(crate) fn increase_quota(&mut self, additional: u32) -> Result<u32> {
        if additional == 0 {
            return Err(IncentiveError::InvalidAmount("quota increase must be greater than zero".into()));
        }
        self.max_products = self.max_products.add(additional);
        self.raise_event(DomainEvent::Grant(GrantEvent::QuotaIncreased {
            influencer_id: self.influencer_id.clone(), max_products: self.max_products.value(),
        }));
        Ok(self.max_products.value())
    }

    pub(crate) fn extend_validity(&mut self, valid_until: Option<DateTime<Utc>>) { self.valid_until = valid_until; }
    pub(crate) fn pause(&mut self) { self.status = InfluencerStatus::Paused; }
    pub(crate) fn resume(&mut self) { self.status = InfluencerStatus::Active; }

    pub(crate) fn take_events(&mut self) -> Vec<DomainEvent> { std::mem::take(&mut self.events) }
    fn raise_event(&mut self, e: DomainEvent) { self.events.push(e); }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn grant(max: u32) -> InfluencerGrant {
        InfluencerGrant::create(ReferralCode::new("LISA").unwrap(), "Lisa", max, None).unwrap()
    }

    #[test]
    fn test_consume_until_exhausted() {
        let mut g = grant(2);
        g.consume("Serum", None, Utc::now()).unwrap();
        g.consume("Cream", None, Utc::now()).unwrap();
        assert_eq!(g.availability(Utc::now()), GrantAvailability::Exhausted);
        let err = g.consume("Toner", None, Utc::now()).unwrap_err();
        assert!(matches!(err, IncentiveError::QuotaExhausted { .. }));
        assert_eq!(g.products_used(), 2);
        assert_eq!(g.receipts().len(), 2);
    }

    #[test]
    fn test_expiry_checked_at_instant() {
        let now = Utc::now();
        let mut g = InfluencerGrant::create(ReferralCode::new("LISA").unwrap(), "Lisa", 3, Some(now)).unwrap();
        assert_eq!(g.availability(now - Duration::seconds(1)), GrantAvailability::Available);
        assert_eq!(g.availability(now), GrantAvailability::Expired);
        assert!(matches!(g.consume("Serum", None, now), Err(IncentiveError::CodeExpired { .. })));
        assert_eq!(g.products_used(), 0);
    }

    #[test]
    fn test_paused_grant_cannot_be_consumed() {
        let mut g = grant(2);
        g.pause();
        assert_eq!(g.consume("Serum", None, Utc::now()), Err(IncentiveError::InfluencerPaused(g.influencer_id().to_string())));
        assert_eq!(g.products_used(), 0);
        assert!(g.receipts().is_empty());
        g.resume();
        assert!(g.consume("Serum", None, Utc::now()).is_ok());
    }

    #[test]
    fn test_increase_quota_reopens_grant() {
        let mut g = grant(1);
        g.consume("Serum", None, Utc::now()).unwrap();
        assert_eq!(g.increase_quota(2).unwrap(), 3);
        assert_eq!(g.remaining(), 2);
        assert!(g.increase_quota(0).is_err());
    }

    #[test]
    fn test_restore_requires_matching_receipts() {
        let mut g = grant(3);
        g.consume("Serum", Some("O1"), Utc::now()).unwrap();
        let restored = InfluencerGrant::restore(g.record(), g.receipts().to_vec()).unwrap();
        assert_eq!(restored.record(), g.record());
        assert_eq!(restored.receipts()[0].order_id.as_deref(), Some("O1"));
        assert!(matches!(InfluencerGrant::restore(g.record(), vec![]), Err(IncentiveError::StorageError(_))));
    }

    #[test]
    fn test_zero_quota_rejected() {
        assert!(InfluencerGrant::create(ReferralCode::new("LISA").unwrap(), "Lisa", 0, None).is_err());
    }
}
