//! Payout request state machine
//!
//! `Pending -> Approved -> Paid` and `Pending -> Rejected`. Nothing skips
//! `Pending`, and `Paid`/`Rejected` are terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;
use crate::domain::value_objects::Money;
use crate::{IncentiveError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutType { Cash, StoreCredit }

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus { #[default] Pending, Approved, Paid, Rejected }

impl PayoutStatus {
    /// Whether a request in this status still holds reserved funds.
    pub fn holds_reservation(&self) -> bool { matches!(self, Self::Pending | Self::Approved) }
    pub fn is_terminal(&self) -> bool { matches!(self, Self::Paid | Self::Rejected) }
}

impl fmt::Display for PayoutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self { Self::Pending => "pending", Self::Approved => "approved", Self::Paid => "paid", Self::Rejected => "rejected" };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PayoutRequest {
    id: String,
    affiliate_id: String,
    amount: Money,
    payout_type: PayoutType,
    status: PayoutStatus,
    note: Option<String>,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

/// Stored columns of a payout request.
#[derive(Clone, Debug, PartialEq)]
pub struct PayoutRecord {
    pub id: String,
    pub affiliate_id: String,
    pub amount: Money,
    pub payout_type: PayoutType,
    pub status: PayoutStatus,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl From<PayoutRecord> for PayoutRequest {
    fn from(r: PayoutRecord) -> Self {
        Self {
            id: r.id, affiliate_id: r.affiliate_id, amount: r.amount, payout_type: r.payout_type,
            status: r.status, note: r.note, created_at: r.created_at, processed_at: r.processed_at,
        }
    }
}

impl PayoutRequest {
    pub(crate) fn new(affiliate_id: &str, amount: Money, payout_type: PayoutType, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(), affiliate_id: affiliate_id.to_string(), amount, payout_type,
            status: PayoutStatus::Pending, note: None, created_at: now, processed_at: None,
        }
    }

    pub fn id(&self) -> &str { &self.id }
    pub fn affiliate_id(&self) -> &str { &self.affiliate_id }
    pub fn amount(&self) -> &Money { &self.amount }
    pub fn payout_type(&self) -> PayoutType { self.payout_type }
    pub fn status(&self) -> PayoutStatus { self.status }
    pub fn note(&self) -> Option<&str> { self.note.as_deref() }
    pub fn created_at(&self) -> DateTime<Utc> { self.created_at }
    pub fn processed_at(&self) -> Option<DateTime<Utc>> { self.processed_at }

    pub(crate) fn approve(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(PayoutStatus::Pending, PayoutStatus::Approved, now)
    }

    pub(crate) fn reject(&mut self, note: Option<String>, now: DateTime<Utc>) -> Result<()> {
        self.transition(PayoutStatus::Pending, PayoutStatus::Rejected, now)?;
        self.note = note;
        Ok(())
    }

    pub(crate) fn mark_paid(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(PayoutStatus::Approved, PayoutStatus::Paid, now)
    }

    fn transition(&mut self, expected: PayoutStatus, to: PayoutStatus, now: DateTime<Utc>) -> Result<()> {
        if self.status != expected {
            return Err(IncentiveError::InvalidTransition { request_id: self.id.clone(), from: self.status, to });
        }
        self.status = to;
        self.processed_at = Some(now);
        Ok(())
    }
}
