//! Influencer grant quotas

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::aggregates::{GrantAvailability, InfluencerGrant, InfluencerProductReceipt, InfluencerStatus};
use crate::domain::value_objects::ReferralCode;
use crate::journal::{Commit, Journal};
use crate::notifications::Notifier;
use crate::{IncentiveError, Result};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantView {
    pub influencer_id: String,
    pub code: ReferralCode,
    pub display_name: String,
    pub status: InfluencerStatus,
    pub max_products: u32,
    pub products_used: u32,
    pub remaining: u32,
    pub valid_until: Option<DateTime<Utc>>,
    pub availability: GrantAvailability,
}

impl GrantView {
    fn of(g: &InfluencerGrant, now: DateTime<Utc>) -> Self {
        Self {
            influencer_id: g.influencer_id().to_string(), code: g.code().clone(), display_name: g.display_name().to_string(),
            status: g.status(), max_products: g.max_products(), products_used: g.products_used(), remaining: g.remaining(),
            valid_until: g.valid_until(), availability: g.availability(now),
        }
    }
}

/// Tracks each influencer's free-product entitlement. One row per influencer;
/// consumption holds the row's write guard across check, increment and receipt.
pub struct GrantQuotaTracker {
    grants: DashMap<String, InfluencerGrant>,
    notifier: Notifier,
    journal: Journal,
}

impl GrantQuotaTracker {
    pub fn new(notifier: Notifier) -> Self { Self::with_journal(notifier, Journal::disabled()) }

    pub fn with_journal(notifier: Notifier, journal: Journal) -> Self { Self { grants: DashMap::new(), notifier, journal } }

    pub(crate) fn insert(&self, grant: InfluencerGrant) -> Result<GrantView> {
        let view = GrantView::of(&grant, Utc::now());
        match self.grants.entry(grant.influencer_id().to_string()) {
            Entry::Occupied(_) => Err(IncentiveError::DuplicateCode(grant.code().to_string())),
            Entry::Vacant(slot) => {
                info!(influencer_id = %view.influencer_id, max_products = view.max_products, "influencer grant created");
                self.journal.record(Commit::influencer(&grant, None));
                slot.insert(grant);
                Ok(view)
            }
        }
    }

    pub(crate) fn restore(&self, grant: InfluencerGrant) -> Result<()> {
        match self.grants.entry(grant.influencer_id().to_string()) {
            Entry::Occupied(slot) => Err(IncentiveError::StorageError(format!("influencer {} stored twice", slot.key()))),
            Entry::Vacant(slot) => {
                slot.insert(grant);
                Ok(())
            }
        }
    }

    /// Every stored receipt that names the order it was consumed for.
    pub(crate) fn order_receipts(&self) -> Vec<InfluencerProductReceipt> {
        self.grants
            .iter()
            .flat_map(|g| g.receipts().iter().filter(|r| r.order_id.is_some()).cloned().collect::<Vec<_>>())
            .collect()
    }

    pub fn snapshot(&self, influencer_id: &str) -> Result<GrantView> {
        self.grants
            .get(influencer_id)
            .map(|g| GrantView::of(g.value(), Utc::now()))
            .ok_or_else(|| IncentiveError::InfluencerNotFound(influencer_id.to_string()))
    }

    pub fn availability_at(&self, influencer_id: &str, now: DateTime<Utc>) -> Option<GrantAvailability> {
        self.grants.get(influencer_id).map(|g| g.availability(now))
    }

    pub fn receipts(&self, influencer_id: &str) -> Result<Vec<InfluencerProductReceipt>> {
        self.grants
            .get(influencer_id)
            .map(|g| g.receipts().to_vec())
            .ok_or_else(|| IncentiveError::InfluencerNotFound(influencer_id.to_string()))
    }

    pub fn consume_grant(&self, influencer_id: &str, product_title: &str) -> Result<InfluencerProductReceipt> {
        self.consume_grant_at(influencer_id, product_title, Utc::now())
    }

    pub fn consume_grant_at(&self, influencer_id: &str, product_title: &str, now: DateTime<Utc>) -> Result<InfluencerProductReceipt> {
        self.consume(influencer_id, product_title, None, now)
    }

    /// Consumes a grant on behalf of a settled order; the receipt keeps the order id.
    pub(crate) fn consume_for_order(&self, influencer_id: &str, product_title: &str, order_id: &str) -> Result<InfluencerProductReceipt> {
        self.consume(influencer_id, product_title, Some(order_id), Utc::now())
    }

    fn consume(&self, influencer_id: &str, product_title: &str, order_id: Option<&str>, now: DateTime<Utc>) -> Result<InfluencerProductReceipt> {
        let (receipt, events, used, max) = {
            let mut grant = self.row_mut(influencer_id)?;
            let receipt = match grant.consume(product_title, order_id, now) {
                Ok(r) => r,
                Err(e) => {
                    warn!(influencer_id, product_title, "grant refused: {}", e);
                    return Err(e);
                }
            };
            self.journal.record(Commit::influencer(&grant, Some(&receipt)));
            (receipt, grant.take_events(), grant.products_used(), grant.max_products())
        };
        info!(influencer_id, product_title, used, max, "grant consumed");
        self.notifier.notify_all(events);
        Ok(receipt)
    }

    /// Raises `max_products` by `additional`. There is no way to lower a quota
    /// or remove a receipt.
    pub fn increase_quota(&self, influencer_id: &str, additional: u32) -> Result<GrantView> {
        let (view, events) = {
            let mut grant = self.row_mut(influencer_id)?;
            let max = grant.increase_quota(additional)?;
            self.journal.record(Commit::influencer(&grant, None));
            info!(influencer_id, additional, max, "grant quota increased");
            (GrantView::of(&grant, Utc::now()), grant.take_events())
        };
        self.notifier.notify_all(events);
        Ok(view)
    }

    pub fn set_valid_until(&self, influencer_id: &str, valid_until: Option<DateTime<Utc>>) -> Result<GrantView> {
        let mut grant = self.row_mut(influencer_id)?;
        grant.extend_validity(valid_until);
        self.journal.record(Commit::influencer(&grant, None));
        info!(influencer_id, ?valid_until, "grant validity changed");
        Ok(GrantView::of(&grant, Utc::now()))
    }

    pub fn pause(&self, influencer_id: &str) -> Result<GrantView> {
        let mut grant = self.row_mut(influencer_id)?;
        grant.pause();
        self.journal.record(Commit::influencer(&grant, None));
        info!(influencer_id, "influencer paused");
        Ok(GrantView::of(&grant, Utc::now()))
    }

    pub fn resume(&self, influencer_id: &str) -> Result<GrantView> {
        let mut grant = self.row_mut(influencer_id)?;
        grant.resume();
        self.journal.record(Commit::influencer(&grant, None));
        info!(influencer_id, "influencer resumed");
        Ok(GrantView::of(&grant, Utc::now()))
    }

    fn row_mut(&self, influencer_id: &str) -> Result<dashmap::mapref::one::RefMut<'_, String, InfluencerGrant>> {
        self.grants
            .get_mut(influencer_id)
            .ok_or_else(|| IncentiveError::InfluencerNotFound(influencer_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn tracker_with(max: u32) -> (GrantQuotaTracker, String) {
        let tracker = GrantQuotaTracker::new(Notifier::disconnected());
        let grant = InfluencerGrant::create(ReferralCode::new("LISA").unwrap(), "Lisa", max, None).unwrap();
        let id = grant.influencer_id().to_string();
        tracker.insert(grant).unwrap();
        (tracker, id)
    }

    #[test]
    fn test_exhausted_grant_never_mutates() {
        let (tracker, id) = tracker_with(1);
        tracker.consume_grant(&id, "Serum").unwrap();
        for _ in 0..3 {
            assert_eq!(tracker.consume_grant(&id, "Cream"), Err(IncentiveError::QuotaExhausted { influencer_id: id.clone() }));
        }
        let view = tracker.snapshot(&id).unwrap();
        assert_eq!(view.products_used, 1);
        assert_eq!(view.availability, GrantAvailability::Exhausted);
        assert_eq!(tracker.receipts(&id).unwrap().len(), 1);
    }

    #[test]
    fn test_quota_increase_reopens() {
        let (tracker, id) = tracker_with(1);
        tracker.consume_grant(&id, "Serum").unwrap();
        let view = tracker.increase_quota(&id, 1).unwrap();
        assert_eq!(view.remaining, 1);
        tracker.consume_grant(&id, "Cream").unwrap();
        assert_eq!(tracker.receipts(&id).unwrap().iter().map(|r| r.product_title.as_str()).collect::<Vec<_>>(), vec!["Serum", "Cream"]);
    }

    #[test]
    fn test_concurrent_consumption_respects_quota() {
        let (tracker, id) = tracker_with(5);
        let tracker = Arc::new(tracker);
        let successes: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..16)
                .map(|i| {
                    let tracker = tracker.clone();
                    let id = id.clone();
                    s.spawn(move || tracker.consume_grant(&id, &format!("Product {i}")).is_ok())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap() as usize).sum()
        });
        assert_eq!(successes, 5);
        assert_eq!(tracker.snapshot(&id).unwrap().products_used, 5);
    }

    #[test]
    fn test_consumption_is_journaled_with_its_receipt() {
        let (journal, mut rx) = Journal::channel();
        let tracker = GrantQuotaTracker::with_journal(Notifier::disconnected(), journal);
        let grant = InfluencerGrant::create(ReferralCode::new("LISA").unwrap(), "Lisa", 1, None).unwrap();
        let id = grant.influencer_id().to_string();
        tracker.insert(grant).unwrap();
        let receipt = tracker.consume_for_order(&id, "Serum", "O1").unwrap();
        assert!(tracker.consume_grant(&id, "Cream").is_err());

        let created = rx.try_recv().unwrap();
        assert_eq!(created.influencer.map(|r| r.products_used), Some(0));
        let consumed = rx.try_recv().unwrap();
        assert_eq!(consumed.receipts, vec![receipt.clone()]);
        assert_eq!(consumed.influencer.as_ref().map(|r| r.products_used), Some(1));
        assert!(rx.try_recv().is_err());
        assert_eq!(tracker.order_receipts(), vec![receipt]);
    }

    #[test]
    fn test_unknown_influencer() {
        let (tracker, _) = tracker_with(1);
        assert_eq!(tracker.consume_grant("nope", "Serum"), Err(IncentiveError::InfluencerNotFound("nope".into())));
    }
}
