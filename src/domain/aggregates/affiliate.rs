//! Affiliate Aggregate
//!
//! Owns every monetary field of an affiliate together with the payout requests
//! drawn against them. The balance fields are only writable through the
//! crate-private operations below, which the ledger service calls while it
//! holds the affiliate's row.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::domain::aggregates::payout::{PayoutRequest, PayoutStatus, PayoutType};
use crate::domain::events::{DomainEvent, LedgerEvent};
use crate::domain::value_objects::{Money, Percent, ReferralCode};
use crate::{IncentiveError, Result};

pub const MIN_COMMISSION_PERCENT: u32 = 5;
pub const MAX_COMMISSION_PERCENT: u32 = 15;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AffiliateStatus { #[default] Active, Paused }

/// Snapshot returned by balance queries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub pending: Money,
    pub reserved: Money,
    pub paid: Money,
    pub total: Money,
    pub store_credit: Money,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerEntryKind {
    CommissionAccrued { order_id: String, order_total: Money },
    PayoutReserved { request_id: String },
    ReservationReleased { request_id: String },
    PayoutSettled { request_id: String },
    StoreCreditBonus { request_id: String },
}

/// Append-only audit record of a balance movement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub kind: LedgerEntryKind,
    pub amount: Money,
    pub recorded_at: DateTime<Utc>,
}

/// Stored columns of an affiliate. Payout requests and ledger entries are
/// stored as their own rows.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AffiliateRecord {
    pub id: String,
    pub code: ReferralCode,
    pub display_name: String,
    pub commission_percent: Percent,
    pub status: AffiliateStatus,
    pub balance: Balance,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct Affiliate {
    id: String,
    code: ReferralCode,
    display_name: String,
    commission_percent: Percent,
    status: AffiliateStatus,
    pending: Money,
    reserved: Money,
    paid: Money,
    total: Money,
    store_credit: Money,
    payouts: Vec<PayoutRequest>,
    entries: Vec<LedgerEntry>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    events: Vec<DomainEvent>,
}

pub fn validate_commission_percent(value: Decimal) -> Result<Percent> {
    if value < Decimal::from(MIN_COMMISSION_PERCENT) || value > Decimal::from(MAX_COMMISSION_PERCENT) {
        return Err(IncentiveError::InvalidCommissionPercent(value));
    }
    Ok(Percent::new(value)?)
}

impl Affiliate {
    pub fn create(code: ReferralCode, display_name: impl Into<String>, commission_percent: Decimal, currency: &str) -> Result<Self> {
        let commission_percent = validate_commission_percent(commission_percent)?;
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4().to_string(), code, display_name: display_name.into(), commission_percent,
            status: AffiliateStatus::Active, pending: Money::zero(currency), reserved: Money::zero(currency),
            paid: Money::zero(currency), total: Money::zero(currency), store_credit: Money::zero(currency),
            payouts: vec![], entries: vec![], created_at: now, updated_at: now, events: vec![],
        })
    }

    /// Rebuilds an affiliate from stored rows, refusing rows whose balances do
    /// not add up against their payout requests.
    pub fn restore(record: AffiliateRecord, payouts: Vec<PayoutRequest>, entries: Vec<LedgerEntry>) -> Result<Self> {
        let Balance { pending, reserved, paid, total, store_credit } = record.balance;
        let affiliate = Self {
            id: record.id, code: record.code, display_name: record.display_name, commission_percent: record.commission_percent,
            status: record.status, pending, reserved, paid, total, store_credit, payouts, entries,
            created_at: record.created_at, updated_at: record.updated_at, events: vec![],
        };
        if !affiliate.invariant_holds() {
            return Err(IncentiveError::StorageError(format!("stored balances of affiliate {} do not add up", affiliate.id)));
        }
        Ok(affiliate)
    }

    pub fn record(&self) -> AffiliateRecord {
        AffiliateRecord {
            id: self.id.clone(), code: self.code.clone(), display_name: self.display_name.clone(),
            commission_percent: self.commission_percent, status: self.status, balance: self.balance(),
            created_at: self.created_at, updated_at: self.updated_at,
        }
    }

    pub fn id(&self) -> &str { &self.id }
    pub fn code(&self) -> &ReferralCode { &self.code }
    pub fn display_name(&self) -> &str { &self.display_name }
    pub fn commission_percent(&self) -> Percent { self.commission_percent }
    pub fn status(&self) -> AffiliateStatus { self.status }
    pub fn is_active(&self) -> bool { self.status == AffiliateStatus::Active }
    pub fn currency(&self) -> &str { self.total.currency() }
    pub fn payouts(&self) -> &[PayoutRequest] { &self.payouts }
    pub fn entries(&self) -> &[LedgerEntry] { &self.entries }
    pub fn created_at(&self) -> DateTime<Utc> { self.created_at }
    pub fn updated_at(&self) -> DateTime<Utc> { self.updated_at }

    pub fn balance(&self) -> Balance {
        Balance {
            pending: self.pending.clone(), reserved: self.reserved.clone(), paid: self.paid.clone(),
            total: self.total.clone(), store_credit: self.store_credit.clone(),
        }
    }

    pub fn payout(&self, request_id: &str) -> Option<&PayoutRequest> { self.payouts.iter().find(|p| p.id() == request_id) }

    /// `pending + Σ(pending|approved requests) + paid == total`, and the cached
    /// `reserved` figure agrees with the requests.
    pub fn invariant_holds(&self) -> bool {
        let outstanding: Decimal = self.payouts.iter()
            .filter(|p| p.status().holds_reservation())
            .map(|p| p.amount().amount())
            .sum();
        outstanding == self.reserved.amount()
            && self.pending.amount() + outstanding + self.paid.amount() == self.total.amount()
            && !self.pending.is_negative()
            && !self.paid.is_negative()
    }

    pub(crate) fn pause(&mut self) { self.status = AffiliateStatus::Paused; self.touch(); }
    pub(crate) fn resume(&mut self) { self.status = AffiliateStatus::Active; self.touch(); }

    pub(crate) fn set_commission_percent(&mut self, value: Decimal) -> Result<()> {
        self.commission_percent = validate_commission_percent(value)?;
        self.touch();
        Ok(())
    }

    /// Credits commission on a settled order total. Returns the rounded commission.
    pub(crate) fn accrue(&mut self, order_id: &str, order_total: &Money) -> Result<Money> {
        if order_total.is_negative() {
            return Err(IncentiveError::InvalidAmount(format!("order total {order_total} is negative")));
        }
        let commission = order_total.percent(self.commission_percent).round_minor();
        let pending = self.pending.add(&commission)?;
        let total = self.total.add(&commission)?;
        self.pending = pending;
        self.total = total;
        self.record_entry(LedgerEntryKind::CommissionAccrued { order_id: order_id.to_string(), order_total: order_total.clone() }, commission.clone());
        self.raise_event(DomainEvent::Ledger(LedgerEvent::CommissionAccrued {
            affiliate_id: self.id.clone(), order_id: order_id.to_string(), commission: commission.clone(),
        }));
        Ok(commission)
    }

    /// Checks the available balance and moves `amount` from pending into
    /// reserved, creating the request in the same step.
    pub(crate) fn request_payout(&mut self, amount: Money, payout_type: PayoutType, now: DateTime<Utc>) -> Result<PayoutRequest> {
        if !amount.is_positive() {
            return Err(IncentiveError::InvalidAmount(format!("payout amount {amount} must be positive")));
        }
        if amount.round_minor() != amount {
            return Err(IncentiveError::InvalidAmount(format!("payout amount {amount} is finer than the currency's minor unit")));
        }
        let remaining = self.pending.subtract(&amount)?;
        if remaining.is_negative() {
            return Err(IncentiveError::InsufficientBalance { requested: amount, available: self.pending.clone() });
        }
        let reserved = self.reserved.add(&amount)?;
        let request = PayoutRequest::new(&self.id, amount.clone(), payout_type, now);
        self.pending = remaining;
        self.reserved = reserved;
        self.payouts.push(request.clone());
        self.record_entry(LedgerEntryKind::PayoutReserved { request_id: request.id().to_string() }, amount.clone());
        self.raise_event(DomainEvent::Ledger(LedgerEvent::PayoutRequested {
            affiliate_id: self.id.clone(), request_id: request.id().to_string(), amount, payout_type,
        }));
        Ok(request)
    }

    pub(crate) fn approve_payout(&mut self, request_id: &str, now: DateTime<Utc>) -> Result<PayoutRequest> {
        let request = self.payout_mut(request_id)?;
        request.approve(now)?;
        let approved = request.clone();
        self.touch();
        self.raise_event(DomainEvent::Ledger(LedgerEvent::PayoutApproved {
            affiliate_id: self.id.clone(), request_id: request_id.to_string(),
        }));
        Ok(approved)
    }

    /// Returns the reserved amount to pending.
    pub(crate) fn reject_payout(&mut self, request_id: &str, note: Option<String>, now: DateTime<Utc>) -> Result<PayoutRequest> {
        let amount = self.payout(request_id).ok_or_else(|| IncentiveError::PayoutNotFound(request_id.to_string()))?.amount().clone();
        let reserved = self.reserved.subtract(&amount)?;
        let pending = self.pending.add(&amount)?;
        let request = self.payout_mut(request_id)?;
        request.reject(note, now)?;
        let rejected = request.clone();
        self.reserved = reserved;
        self.pending = pending;
        self.record_entry(LedgerEntryKind::ReservationReleased { request_id: request_id.to_string() }, amount.clone());
        self.raise_event(DomainEvent::Ledger(LedgerEvent::PayoutRejected {
            affiliate_id: self.id.clone(), request_id: request_id.to_string(), amount,
        }));
        Ok(rejected)
    }

    /// Moves the reserved amount into paid. Store-credit payouts additionally
    /// mint `store_credit_bonus` of the amount as store credit, which is new
    /// value and never touches pending.
    pub(crate) fn mark_payout_paid(&mut self, request_id: &str, store_credit_bonus: Percent, now: DateTime<Utc>) -> Result<(PayoutRequest, Option<Money>)> {
        let (amount, payout_type) = {
            let r = self.payout(request_id).ok_or_else(|| IncentiveError::PayoutNotFound(request_id.to_string()))?;
            (r.amount().clone(), r.payout_type())
        };
        let reserved = self.reserved.subtract(&amount)?;
        let paid = self.paid.add(&amount)?;
        let bonus = match payout_type {
            PayoutType::StoreCredit => Some(amount.percent(store_credit_bonus).round_minor()),
            PayoutType::Cash => None,
        };
        let store_credit = match &bonus {
            Some(b) => self.store_credit.add(&amount)?.add(b)?,
            None => self.store_credit.clone(),
        };
        let request = self.payout_mut(request_id)?;
        request.mark_paid(now)?;
        let settled = request.clone();
        self.reserved = reserved;
        self.paid = paid;
        self.store_credit = store_credit;
        self.record_entry(LedgerEntryKind::PayoutSettled { request_id: request_id.to_string() }, amount.clone());
        if let Some(b) = &bonus {
            self.record_entry(LedgerEntryKind::StoreCreditBonus { request_id: request_id.to_string() }, b.clone());
        }
        self.raise_event(DomainEvent::Ledger(LedgerEvent::PayoutPaid {
            affiliate_id: self.id.clone(), request_id: request_id.to_string(), amount, store_credit_bonus: bonus.clone(),
        }));
        Ok((settled, bonus))
    }

    pub(crate) fn take_events(&mut self) -> Vec<DomainEvent> { std::mem::take(&mut self.events) }

    fn payout_mut(&mut self, request_id: &str) -> Result<&mut PayoutRequest> {
        self.payouts.iter_mut().find(|p| p.id() == request_id).ok_or_else(|| IncentiveError::PayoutNotFound(request_id.to_string()))
    }

    fn record_entry(&mut self, kind: LedgerEntryKind, amount: Money) {
        let now = Utc::now();
        self.entries.push(LedgerEntry { id: Uuid::now_v7().to_string(), kind, amount, recorded_at: now });
        self.updated_at = now;
    }

    fn raise_event(&mut self, e: DomainEvent) { self.events.push(e); }
    fn touch(&mut self) { self.updated_at = Utc::now(); }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn affiliate() -> Affiliate {
        Affiliate::create(ReferralCode::new("ANNA10").unwrap(), "Anna", dec!(10), "SEK").unwrap()
    }

    #[test]
    fn test_commission_bounds() {
        let code = ReferralCode::new("X").unwrap();
        assert!(Affiliate::create(code.clone(), "x", dec!(4.99), "SEK").is_err());
        assert!(Affiliate::create(code.clone(), "x", dec!(15.01), "SEK").is_err());
        assert!(Affiliate::create(code, "x", dec!(5), "SEK").is_ok());
    }

    #[test]
    fn test_accrue_rounds_to_minor_unit() {
        let mut a = affiliate();
        let c = a.accrue("O1", &Money::sek(dec!(123.45))).unwrap();
        assert_eq!(c.amount(), dec!(12.34)); // 12.345 -> banker's
        assert_eq!(a.balance().pending.amount(), dec!(12.34));
        assert_eq!(a.balance().total.amount(), dec!(12.34));
        assert!(a.invariant_holds());
        assert_eq!(a.take_events().len(), 1);
    }

    #[test]
    fn test_insufficient_balance_leaves_state() {
        let mut a = affiliate();
        a.accrue("O1", &Money::sek(dec!(100))).unwrap();
        let err = a.request_payout(Money::sek(dec!(10.01)), PayoutType::Cash, Utc::now()).unwrap_err();
        assert_eq!(err, IncentiveError::InsufficientBalance { requested: Money::sek(dec!(10.01)), available: Money::sek(dec!(10)) });
        assert_eq!(a.balance().pending.amount(), dec!(10));
        assert!(a.payouts().is_empty());
        assert!(a.invariant_holds());
    }

    #[test]
    fn test_payout_amount_must_fit_minor_unit() {
        let mut a = affiliate();
        a.accrue("O1", &Money::sek(dec!(100))).unwrap();
        assert!(matches!(a.request_payout(Money::sek(dec!(0.001)), PayoutType::Cash, Utc::now()), Err(IncentiveError::InvalidAmount(_))));
        assert!(matches!(a.request_payout(Money::sek(dec!(2.505)), PayoutType::Cash, Utc::now()), Err(IncentiveError::InvalidAmount(_))));
        assert!(a.payouts().is_empty());
        assert_eq!(a.balance().pending.amount(), dec!(10));
        assert!(a.request_payout(Money::sek(dec!(2.50)), PayoutType::Cash, Utc::now()).is_ok());
    }

    #[test]
    fn test_rejection_returns_reservation() {
        let mut a = affiliate();
        a.accrue("O1", &Money::sek(dec!(100))).unwrap();
        let r = a.request_payout(Money::sek(dec!(6)), PayoutType::Cash, Utc::now()).unwrap();
        assert_eq!(a.balance().pending.amount(), dec!(4));
        assert_eq!(a.balance().reserved.amount(), dec!(6));
        a.reject_payout(r.id(), None, Utc::now()).unwrap();
        assert_eq!(a.balance().pending.amount(), dec!(10));
        assert!(a.balance().reserved.is_zero());
        assert!(a.invariant_holds());
    }

    #[test]
    fn test_failed_transition_keeps_balances() {
        let mut a = affiliate();
        a.accrue("O1", &Money::sek(dec!(100))).unwrap();
        let r = a.request_payout(Money::sek(dec!(5)), PayoutType::Cash, Utc::now()).unwrap();
        let before = a.balance();
        assert!(matches!(a.mark_payout_paid(r.id(), Percent::from_whole(10).unwrap(), Utc::now()), Err(IncentiveError::InvalidTransition { .. })));
        assert_eq!(a.balance(), before);
    }

    #[test]
    fn test_restore_round_trips_and_checks_balances() {
        let mut a = affiliate();
        a.accrue("O1", &Money::sek(dec!(500))).unwrap();
        a.request_payout(Money::sek(dec!(20)), PayoutType::Cash, Utc::now()).unwrap();
        let restored = Affiliate::restore(a.record(), a.payouts().to_vec(), a.entries().to_vec()).unwrap();
        assert_eq!(restored.record(), a.record());
        assert_eq!(restored.entries().len(), 2);

        let mut tampered = a.record();
        tampered.balance.pending = Money::sek(dec!(50));
        assert!(matches!(Affiliate::restore(tampered, a.payouts().to_vec(), vec![]), Err(IncentiveError::StorageError(_))));
        assert!(matches!(Affiliate::restore(a.record(), vec![], vec![]), Err(IncentiveError::StorageError(_))));
    }

    #[test]
    fn test_store_credit_bonus() {
        let mut a = affiliate();
        a.accrue("O1", &Money::sek(dec!(500))).unwrap();
        let r = a.request_payout(Money::sek(dec!(50)), PayoutType::StoreCredit, Utc::now()).unwrap();
        a.approve_payout(r.id(), Utc::now()).unwrap();
        let (_, bonus) = a.mark_payout_paid(r.id(), Percent::from_whole(10).unwrap(), Utc::now()).unwrap();
        assert_eq!(bonus.unwrap().amount(), dec!(5));
        let b = a.balance();
        assert!(b.pending.is_zero());
        assert_eq!(b.paid.amount(), dec!(50));
        assert_eq!(b.store_credit.amount(), dec!(55));
        assert!(a.invariant_holds());
    }
}
