//! Referral code resolution
//!
//! Maps a customer-entered code to the affiliate or influencer that owns it.
//! Codes are never deleted: a paused owner, an expired grant or an exhausted
//! quota makes the code resolve as not found while the record stays in place.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::aggregates::{AffiliateStatus, GrantAvailability};
use crate::domain::value_objects::{Percent, ReferralCode};
use crate::services::grants::GrantQuotaTracker;
use crate::services::ledger::IncentiveLedger;
use crate::{IncentiveError, Result};

/// Discount every valid referral code gives the customer.
pub const CUSTOMER_DISCOUNT: Percent = Percent::whole(10);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReferralOwner {
    Affiliate { affiliate_id: String },
    Influencer { influencer_id: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferralBinding {
    pub code: ReferralCode,
    pub owner: ReferralOwner,
    pub customer_discount: Percent,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unavailable {
    Unknown,
    Paused,
    Expired,
    Exhausted,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CodeResolution {
    Bound(ReferralBinding),
    NotFound { reason: Unavailable },
}

impl CodeResolution {
    pub fn binding(&self) -> Option<&ReferralBinding> {
        match self { Self::Bound(b) => Some(b), Self::NotFound { .. } => None }
    }

    pub fn into_binding(self) -> Option<ReferralBinding> {
        match self { Self::Bound(b) => Some(b), Self::NotFound { .. } => None }
    }
}

pub struct IncentiveCodeResolver {
    directory: DashMap<ReferralCode, ReferralOwner>,
    ledger: Arc<IncentiveLedger>,
    grants: Arc<GrantQuotaTracker>,
    customer_discount: Percent,
}

impl IncentiveCodeResolver {
    pub fn new(ledger: Arc<IncentiveLedger>, grants: Arc<GrantQuotaTracker>) -> Self {
        Self {
            directory: DashMap::new(),
            ledger,
            grants,
            customer_discount: CUSTOMER_DISCOUNT,
        }
    }

    /// Claims `code` for `owner`. A code belongs to one owner for good.
    pub fn register(&self, code: &ReferralCode, owner: ReferralOwner) -> Result<()> {
        match self.directory.entry(code.clone()) {
            Entry::Occupied(_) => Err(IncentiveError::DuplicateCode(code.to_string())),
            Entry::Vacant(slot) => {
                debug!(%code, ?owner, "registered referral code");
                slot.insert(owner);
                Ok(())
            }
        }
    }

    pub fn is_registered(&self, code: &ReferralCode) -> bool { self.directory.contains_key(code) }

    pub(crate) fn unregister(&self, code: &ReferralCode) { self.directory.remove(code); }

    pub fn resolve(&self, code: &str) -> CodeResolution { self.resolve_at(code, Utc::now()) }

    pub fn resolve_at(&self, code: &str, now: DateTime<Utc>) -> CodeResolution {
        let Ok(code) = ReferralCode::new(code) else {
            return CodeResolution::NotFound { reason: Unavailable::Unknown };
        };
        let Some(owner) = self.directory.get(&code).map(|o| o.value().clone()) else {
            return CodeResolution::NotFound { reason: Unavailable::Unknown };
        };

        let reason = match &owner {
            ReferralOwner::Affiliate { affiliate_id } => match self.ledger.affiliate_status(affiliate_id) {
                Some(AffiliateStatus::Active) => None,
                Some(AffiliateStatus::Paused) => Some(Unavailable::Paused),
                None => Some(Unavailable::Unknown),
            },
            ReferralOwner::Influencer { influencer_id } => match self.grants.availability_at(influencer_id, now) {
                Some(GrantAvailability::Available) => None,
                Some(GrantAvailability::Paused) => Some(Unavailable::Paused),
                Some(GrantAvailability::Expired) => Some(Unavailable::Expired),
                Some(GrantAvailability::Exhausted) => Some(Unavailable::Exhausted),
                None => Some(Unavailable::Unknown),
            },
        };

        match reason {
            Some(reason) => {
                debug!(%code, ?reason, "referral code not applicable");
                CodeResolution::NotFound { reason }
            }
            None => CodeResolution::Bound(ReferralBinding { code, owner, customer_discount: self.customer_discount }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::{Affiliate, InfluencerGrant};
    use crate::notifications::Notifier;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    struct Fixture { resolver: IncentiveCodeResolver, ledger: Arc<IncentiveLedger>, grants: Arc<GrantQuotaTracker> }

    fn fixture() -> Fixture {
        let ledger = Arc::new(IncentiveLedger::new(Notifier::disconnected()));
        let grants = Arc::new(GrantQuotaTracker::new(Notifier::disconnected()));
        Fixture { resolver: IncentiveCodeResolver::new(ledger.clone(), grants.clone()), ledger, grants }
    }

    fn add_affiliate(f: &Fixture, code: &str) -> String {
        let code = ReferralCode::new(code).unwrap();
        let affiliate = Affiliate::create(code.clone(), "Anna", dec!(10), "SEK").unwrap();
        let id = affiliate.id().to_string();
        f.resolver.register(&code, ReferralOwner::Affiliate { affiliate_id: id.clone() }).unwrap();
        f.ledger.insert(affiliate).unwrap();
        id
    }

    fn add_influencer(f: &Fixture, code: &str, max: u32, valid_until: Option<DateTime<Utc>>) -> String {
        let code = ReferralCode::new(code).unwrap();
        let grant = InfluencerGrant::create(code.clone(), "Lisa", max, valid_until).unwrap();
        let id = grant.influencer_id().to_string();
        f.resolver.register(&code, ReferralOwner::Influencer { influencer_id: id.clone() }).unwrap();
        f.grants.insert(grant).unwrap();
        id
    }

    #[test]
    fn test_lookup_is_trimmed_and_case_insensitive() {
        let f = fixture();
        let id = add_affiliate(&f, "ANNA10");
        let resolution = f.resolver.resolve("  anna10 ");
        let binding = resolution.binding().unwrap();
        assert_eq!(binding.owner, ReferralOwner::Affiliate { affiliate_id: id });
        assert_eq!(binding.customer_discount.value(), dec!(10));
    }

    #[test]
    fn test_unknown_and_malformed_codes() {
        let f = fixture();
        assert_eq!(f.resolver.resolve("NOPE"), CodeResolution::NotFound { reason: Unavailable::Unknown });
        assert_eq!(f.resolver.resolve("no pe"), CodeResolution::NotFound { reason: Unavailable::Unknown });
    }

    #[test]
    fn test_paused_affiliate_not_bound() {
        let f = fixture();
        let id = add_affiliate(&f, "ANNA10");
        f.ledger.pause(&id).unwrap();
        assert_eq!(f.resolver.resolve("anna10"), CodeResolution::NotFound { reason: Unavailable::Paused });
        f.ledger.resume(&id).unwrap();
        assert!(f.resolver.resolve("anna10").binding().is_some());
    }

    #[test]
    fn test_influencer_expiry_and_exhaustion() {
        let f = fixture();
        let now = Utc::now();
        add_influencer(&f, "LISA", 1, Some(now + Duration::days(1)));
        assert!(f.resolver.resolve_at("lisa", now).binding().is_some());
        assert_eq!(f.resolver.resolve_at("lisa", now + Duration::days(2)), CodeResolution::NotFound { reason: Unavailable::Expired });

        let id = add_influencer(&f, "MIA", 1, None);
        f.grants.consume_grant(&id, "Serum").unwrap();
        assert_eq!(f.resolver.resolve("mia"), CodeResolution::NotFound { reason: Unavailable::Exhausted });
    }

    #[test]
    fn test_code_has_single_owner() {
        let f = fixture();
        add_affiliate(&f, "ANNA10");
        let code = ReferralCode::new("anna10").unwrap();
        let err = f.resolver.register(&code, ReferralOwner::Influencer { influencer_id: "I1".into() }).unwrap_err();
        assert_eq!(err, IncentiveError::DuplicateCode("ANNA10".into()));
    }
}
