//! Incentive ledger
//!
//! The only writer of affiliate balances. Each affiliate row is the unit of
//! serialization: every mutation runs while holding that row's `DashMap` write
//! guard, so the balance check in [`IncentiveLedger::request_payout`] and the
//! reservation it makes cannot interleave with another request for the same
//! affiliate. Rows for different affiliates proceed in parallel.
//!
//! Lock order is settlement key, then affiliate row, then payout index. Nothing
//! acquires them in the opposite direction. Each committed mutation is queued
//! on the [`Journal`] before the row guard is released.

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::aggregates::{Affiliate, AffiliateStatus, Balance, LedgerEntry, LedgerEntryKind, PayoutRequest, PayoutType};
use crate::domain::value_objects::{Money, Percent, ReferralCode};
use crate::journal::{Commit, Journal};
use crate::notifications::Notifier;
use crate::{IncentiveError, Result};

/// Extra store credit minted when a payout is taken as store credit.
pub const STORE_CREDIT_BONUS: Percent = Percent::whole(10);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AccrualOutcome {
    Accrued { commission: Money },
    /// The order id was already accrued; nothing changed.
    Replayed,
}

/// Dashboard view of one affiliate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffiliateView {
    pub id: String,
    pub code: ReferralCode,
    pub display_name: String,
    pub commission_percent: Percent,
    pub status: AffiliateStatus,
    pub balance: Balance,
}

impl From<&Affiliate> for AffiliateView {
    fn from(a: &Affiliate) -> Self {
        Self {
            id: a.id().to_string(), code: a.code().clone(), display_name: a.display_name().to_string(),
            commission_percent: a.commission_percent(), status: a.status(), balance: a.balance(),
        }
    }
}

/// Result of settling a payout.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PaidPayout {
    pub request: PayoutRequest,
    pub store_credit_bonus: Option<Money>,
}

pub struct IncentiveLedger {
    accounts: DashMap<String, Affiliate>,
    payout_index: DashMap<String, String>,
    accrued_orders: DashMap<String, String>,
    store_credit_bonus: Percent,
    notifier: Notifier,
    journal: Journal,
}

impl IncentiveLedger {
    pub fn new(notifier: Notifier) -> Self { Self::with_journal(notifier, Journal::disabled()) }

    pub fn with_journal(notifier: Notifier, journal: Journal) -> Self {
        Self {
            accounts: DashMap::new(),
            payout_index: DashMap::new(),
            accrued_orders: DashMap::new(),
            store_credit_bonus: STORE_CREDIT_BONUS,
            notifier,
            journal,
        }
    }

    pub(crate) fn insert(&self, affiliate: Affiliate) -> Result<AffiliateView> {
        let view = AffiliateView::from(&affiliate);
        match self.accounts.entry(affiliate.id().to_string()) {
            Entry::Occupied(_) => Err(IncentiveError::DuplicateCode(affiliate.code().to_string())),
            Entry::Vacant(slot) => {
                info!(affiliate_id = %view.id, code = %view.code, "affiliate enrolled");
                self.journal.record(Commit::affiliate(&affiliate, 0, None));
                slot.insert(affiliate);
                Ok(view)
            }
        }
    }

    /// Loads a stored affiliate and rebuilds the payout and accrual indexes
    /// from its rows. Nothing is journaled.
    pub(crate) fn restore(&self, affiliate: Affiliate) -> Result<()> {
        let affiliate_id = affiliate.id().to_string();
        for request in affiliate.payouts() {
            self.payout_index.insert(request.id().to_string(), affiliate_id.clone());
        }
        for entry in affiliate.entries() {
            if let LedgerEntryKind::CommissionAccrued { order_id, .. } = &entry.kind {
                self.accrued_orders.insert(order_id.clone(), affiliate_id.clone());
            }
        }
        match self.accounts.entry(affiliate_id) {
            Entry::Occupied(slot) => Err(IncentiveError::StorageError(format!("affiliate {} stored twice", slot.key()))),
            Entry::Vacant(slot) => {
                slot.insert(affiliate);
                Ok(())
            }
        }
    }

    pub fn affiliate(&self, affiliate_id: &str) -> Result<AffiliateView> {
        self.accounts
            .get(affiliate_id)
            .map(|a| AffiliateView::from(a.value()))
            .ok_or_else(|| IncentiveError::AffiliateNotFound(affiliate_id.to_string()))
    }

    pub fn affiliates(&self) -> Vec<AffiliateView> {
        let mut all: Vec<_> = self.accounts.iter().map(|a| AffiliateView::from(a.value())).collect();
        all.sort_by(|a, b| a.code.cmp(&b.code));
        all
    }

    pub fn affiliate_status(&self, affiliate_id: &str) -> Option<AffiliateStatus> {
        self.accounts.get(affiliate_id).map(|a| a.status())
    }

    pub fn get_balance(&self, affiliate_id: &str) -> Result<Balance> {
        self.accounts
            .get(affiliate_id)
            .map(|a| a.balance())
            .ok_or_else(|| IncentiveError::AffiliateNotFound(affiliate_id.to_string()))
    }

    pub fn payouts_for(&self, affiliate_id: &str) -> Result<Vec<PayoutRequest>> {
        self.accounts
            .get(affiliate_id)
            .map(|a| a.payouts().to_vec())
            .ok_or_else(|| IncentiveError::AffiliateNotFound(affiliate_id.to_string()))
    }

    pub fn entries_for(&self, affiliate_id: &str) -> Result<Vec<LedgerEntry>> {
        self.accounts
            .get(affiliate_id)
            .map(|a| a.entries().to_vec())
            .ok_or_else(|| IncentiveError::AffiliateNotFound(affiliate_id.to_string()))
    }

    pub fn payout(&self, request_id: &str) -> Result<PayoutRequest> {
        let affiliate_id = self.owner_of(request_id)?;
        self.accounts
            .get(&affiliate_id)
            .and_then(|a| a.payout(request_id).cloned())
            .ok_or_else(|| IncentiveError::PayoutNotFound(request_id.to_string()))
    }

    /// Admin queue: requests still waiting on approval or payment, oldest first.
    pub fn open_payouts(&self) -> Vec<PayoutRequest> {
        let mut open: Vec<PayoutRequest> = self
            .accounts
            .iter()
            .flat_map(|a| a.payouts().iter().filter(|p| p.status().holds_reservation()).cloned().collect::<Vec<_>>())
            .collect();
        open.sort_by(|a, b| a.created_at().cmp(&b.created_at()).then_with(|| a.id().cmp(b.id())));
        open
    }

    /// Credits commission for a settled order, at most once per `order_id`.
    pub fn accrue_commission(&self, affiliate_id: &str, order_id: &str, order_total: &Money) -> Result<AccrualOutcome> {
        match self.accrued_orders.entry(order_id.to_string()) {
            Entry::Occupied(seen) => {
                info!(order_id, first_affiliate = %seen.get(), "settlement replay ignored");
                Ok(AccrualOutcome::Replayed)
            }
            Entry::Vacant(slot) => {
                let (commission, events) = {
                    let mut account = self.account_mut(affiliate_id)?;
                    let mark = account.entries().len();
                    let commission = account.accrue(order_id, order_total)?;
                    self.journal.record(Commit::affiliate(&account, mark, None));
                    (commission, account.take_events())
                };
                slot.insert(affiliate_id.to_string());
                info!(affiliate_id, order_id, %commission, "commission accrued");
                self.notifier.notify_all(events);
                Ok(AccrualOutcome::Accrued { commission })
            }
        }
    }

    pub fn is_accrued(&self, order_id: &str) -> bool { self.accrued_orders.contains_key(order_id) }

    /// Reserves `amount` out of pending earnings and opens a payout request.
    pub fn request_payout(&self, affiliate_id: &str, amount: Money, payout_type: PayoutType) -> Result<PayoutRequest> {
        let (request, events) = {
            let mut account = self.account_mut(affiliate_id)?;
            let mark = account.entries().len();
            let request = match account.request_payout(amount, payout_type, Utc::now()) {
                Ok(r) => r,
                Err(e) => {
                    warn!(affiliate_id, "payout request refused: {}", e);
                    return Err(e);
                }
            };
            self.journal.record(Commit::affiliate(&account, mark, Some(&request)));
            self.payout_index.insert(request.id().to_string(), affiliate_id.to_string());
            (request, account.take_events())
        };
        info!(affiliate_id, request_id = request.id(), amount = %request.amount(), ?payout_type, "payout requested");
        self.notifier.notify_all(events);
        Ok(request)
    }

    /// Advisory approval; balances do not move.
    pub fn approve(&self, request_id: &str) -> Result<PayoutRequest> {
        let affiliate_id = self.owner_of(request_id)?;
        let (request, events) = {
            let mut account = self.account_mut(&affiliate_id)?;
            let request = account.approve_payout(request_id, Utc::now())?;
            self.journal.record(Commit::affiliate(&account, account.entries().len(), Some(&request)));
            (request, account.take_events())
        };
        info!(%affiliate_id, request_id, "payout approved");
        self.notifier.notify_all(events);
        Ok(request)
    }

    /// Rejects a pending request and returns its reservation to pending earnings.
    pub fn reject(&self, request_id: &str, note: Option<String>) -> Result<PayoutRequest> {
        let affiliate_id = self.owner_of(request_id)?;
        let (request, events) = {
            let mut account = self.account_mut(&affiliate_id)?;
            let mark = account.entries().len();
            let request = account.reject_payout(request_id, note, Utc::now())?;
            self.journal.record(Commit::affiliate(&account, mark, Some(&request)));
            (request, account.take_events())
        };
        info!(%affiliate_id, request_id, amount = %request.amount(), "payout rejected, reservation released");
        self.notifier.notify_all(events);
        Ok(request)
    }

    pub fn mark_paid(&self, request_id: &str) -> Result<PaidPayout> {
        let affiliate_id = self.owner_of(request_id)?;
        let (request, bonus, events) = {
            let mut account = self.account_mut(&affiliate_id)?;
            let mark = account.entries().len();
            let (request, bonus) = account.mark_payout_paid(request_id, self.store_credit_bonus, Utc::now())?;
            self.journal.record(Commit::affiliate(&account, mark, Some(&request)));
            (request, bonus, account.take_events())
        };
        info!(%affiliate_id, request_id, amount = %request.amount(), bonus = ?bonus, "payout paid");
        self.notifier.notify_all(events);
        Ok(PaidPayout { request, store_credit_bonus: bonus })
    }

    pub fn pause(&self, affiliate_id: &str) -> Result<AffiliateView> {
        let mut account = self.account_mut(affiliate_id)?;
        account.pause();
        self.persist_row(&account);
        info!(affiliate_id, "affiliate paused");
        Ok(AffiliateView::from(&*account))
    }

    pub fn resume(&self, affiliate_id: &str) -> Result<AffiliateView> {
        let mut account = self.account_mut(affiliate_id)?;
        account.resume();
        self.persist_row(&account);
        info!(affiliate_id, "affiliate resumed");
        Ok(AffiliateView::from(&*account))
    }

    /// Applies to future accruals only.
    pub fn set_commission_percent(&self, affiliate_id: &str, percent: Decimal) -> Result<AffiliateView> {
        let mut account = self.account_mut(affiliate_id)?;
        account.set_commission_percent(percent)?;
        self.persist_row(&account);
        info!(affiliate_id, %percent, "commission percent changed");
        Ok(AffiliateView::from(&*account))
    }

    /// `pending + reserved + paid == total` for one affiliate.
    pub fn verify_invariant(&self, affiliate_id: &str) -> Result<bool> {
        let holds = self
            .accounts
            .get(affiliate_id)
            .map(|a| a.invariant_holds())
            .ok_or_else(|| IncentiveError::AffiliateNotFound(affiliate_id.to_string()))?;
        if !holds {
            warn!(affiliate_id, "balance invariant violated");
        }
        Ok(holds)
    }

    fn persist_row(&self, account: &Affiliate) { self.journal.record(Commit::affiliate(account, account.entries().len(), None)); }

    fn owner_of(&self, request_id: &str) -> Result<String> {
        self.payout_index
            .get(request_id)
            .map(|id| id.value().clone())
            .ok_or_else(|| IncentiveError::PayoutNotFound(request_id.to_string()))
    }

    fn account_mut(&self, affiliate_id: &str) -> Result<dashmap::mapref::one::RefMut<'_, String, Affiliate>> {
        debug!(affiliate_id, "locking affiliate row");
        self.accounts
            .get_mut(affiliate_id)
            .ok_or_else(|| IncentiveError::AffiliateNotFound(affiliate_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::PayoutStatus;
    use crate::domain::events::{DomainEvent, LedgerEvent};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn ledger_with_affiliate(earned_on: Decimal) -> (IncentiveLedger, String) {
        let ledger = IncentiveLedger::new(Notifier::disconnected());
        let affiliate = Affiliate::create(ReferralCode::new("ANNA10").unwrap(), "Anna", dec!(10), "SEK").unwrap();
        let id = affiliate.id().to_string();
        ledger.insert(affiliate).unwrap();
        if earned_on > Decimal::ZERO {
            ledger.accrue_commission(&id, "seed", &Money::sek(earned_on)).unwrap();
        }
        (ledger, id)
    }

    #[test]
    fn test_accrual_is_idempotent() {
        let (ledger, id) = ledger_with_affiliate(Decimal::ZERO);
        let first = ledger.accrue_commission(&id, "O1", &Money::sek(dec!(180))).unwrap();
        assert_eq!(first, AccrualOutcome::Accrued { commission: Money::sek(dec!(18)) });
        assert_eq!(ledger.accrue_commission(&id, "O1", &Money::sek(dec!(180))).unwrap(), AccrualOutcome::Replayed);
        assert_eq!(ledger.get_balance(&id).unwrap().pending.amount(), dec!(18));
        assert!(ledger.is_accrued("O1"));
    }

    #[test]
    fn test_failed_accrual_can_be_retried() {
        let (ledger, id) = ledger_with_affiliate(Decimal::ZERO);
        assert!(ledger.accrue_commission(&id, "O1", &Money::usd(dec!(100))).is_err());
        assert!(!ledger.is_accrued("O1"));
        assert!(matches!(ledger.accrue_commission(&id, "O1", &Money::sek(dec!(100))).unwrap(), AccrualOutcome::Accrued { .. }));
    }

    #[test]
    fn test_unknown_affiliate() {
        let (ledger, _) = ledger_with_affiliate(Decimal::ZERO);
        assert_eq!(ledger.accrue_commission("nope", "O1", &Money::sek(dec!(1))), Err(IncentiveError::AffiliateNotFound("nope".into())));
        assert!(!ledger.is_accrued("O1"));
    }

    #[test]
    fn test_payout_lifecycle_keeps_invariant() {
        let (ledger, id) = ledger_with_affiliate(dec!(1000));
        let r = ledger.request_payout(&id, Money::sek(dec!(40)), PayoutType::Cash).unwrap();
        assert!(ledger.verify_invariant(&id).unwrap());
        assert_eq!(ledger.open_payouts().len(), 1);
        ledger.approve(r.id()).unwrap();
        assert!(ledger.verify_invariant(&id).unwrap());
        let paid = ledger.mark_paid(r.id()).unwrap();
        assert!(paid.store_credit_bonus.is_none());
        let b = ledger.get_balance(&id).unwrap();
        assert_eq!((b.pending.amount(), b.reserved.amount(), b.paid.amount(), b.total.amount()), (dec!(60), dec!(0), dec!(40), dec!(100)));
        assert!(ledger.open_payouts().is_empty());
        assert!(ledger.verify_invariant(&id).unwrap());
    }

    #[test]
    fn test_invalid_transition_leaves_balances() {
        let (ledger, id) = ledger_with_affiliate(dec!(1000));
        let r = ledger.request_payout(&id, Money::sek(dec!(40)), PayoutType::Cash).unwrap();
        ledger.approve(r.id()).unwrap();
        ledger.mark_paid(r.id()).unwrap();
        let before = ledger.get_balance(&id).unwrap();
        assert!(matches!(ledger.approve(r.id()), Err(IncentiveError::InvalidTransition { from: PayoutStatus::Paid, .. })));
        assert!(matches!(ledger.reject(r.id(), None), Err(IncentiveError::InvalidTransition { .. })));
        assert_eq!(ledger.get_balance(&id).unwrap(), before);
        assert_eq!(ledger.payout("missing"), Err(IncentiveError::PayoutNotFound("missing".into())));
    }

    #[test]
    fn test_concurrent_requests_cannot_overdraw() {
        let (ledger, id) = ledger_with_affiliate(dec!(1000)); // 100 pending
        let ledger = Arc::new(ledger);
        let results: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let ledger = ledger.clone();
                    let id = id.clone();
                    s.spawn(move || ledger.request_payout(&id, Money::sek(dec!(60)), PayoutType::Cash))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.iter().any(|r| matches!(r, Err(IncentiveError::InsufficientBalance { .. }))));
        assert_eq!(ledger.get_balance(&id).unwrap().pending.amount(), dec!(40));
        assert!(ledger.verify_invariant(&id).unwrap());
    }

    #[test]
    fn test_every_mutation_is_journaled_and_restorable() {
        let (journal, mut rx) = Journal::channel();
        let ledger = IncentiveLedger::with_journal(Notifier::disconnected(), journal);
        let affiliate = Affiliate::create(ReferralCode::new("ANNA10").unwrap(), "Anna", dec!(10), "SEK").unwrap();
        let id = affiliate.id().to_string();
        ledger.insert(affiliate).unwrap();
        ledger.accrue_commission(&id, "O1", &Money::sek(dec!(1000))).unwrap();
        let r = ledger.request_payout(&id, Money::sek(dec!(40)), PayoutType::StoreCredit).unwrap();
        ledger.approve(r.id()).unwrap();
        ledger.mark_paid(r.id()).unwrap();
        assert!(ledger.request_payout(&id, Money::sek(dec!(500)), PayoutType::Cash).is_err());

        let mut commits = vec![];
        while let Ok(c) = rx.try_recv() {
            commits.push(c);
        }
        assert_eq!(commits.len(), 5);
        let entries: Vec<_> = commits.iter().flat_map(|c| c.entries.iter().map(|e| e.entry.clone())).collect();
        assert_eq!(entries, ledger.entries_for(&id).unwrap());
        let last = commits.last().unwrap();
        assert_eq!(last.payouts[0].status(), PayoutStatus::Paid);

        let record = last.affiliate.clone().unwrap();
        let restored = IncentiveLedger::new(Notifier::disconnected());
        restored.restore(Affiliate::restore(record, last.payouts.clone(), entries).unwrap()).unwrap();
        assert_eq!(restored.get_balance(&id).unwrap(), ledger.get_balance(&id).unwrap());
        assert_eq!(restored.accrue_commission(&id, "O1", &Money::sek(dec!(1000))).unwrap(), AccrualOutcome::Replayed);
        assert_eq!(restored.payout(r.id()).unwrap().status(), PayoutStatus::Paid);
    }

    #[tokio::test]
    async fn test_events_emitted_after_commit() {
        let (notifier, mut rx) = Notifier::channel();
        let ledger = IncentiveLedger::new(notifier);
        let affiliate = Affiliate::create(ReferralCode::new("ANNA10").unwrap(), "Anna", dec!(10), "SEK").unwrap();
        let id = affiliate.id().to_string();
        ledger.insert(affiliate).unwrap();
        ledger.accrue_commission(&id, "O1", &Money::sek(dec!(200))).unwrap();
        match rx.recv().await {
            Some(DomainEvent::Ledger(LedgerEvent::CommissionAccrued { commission, .. })) => assert_eq!(commission.amount(), dec!(20)),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
