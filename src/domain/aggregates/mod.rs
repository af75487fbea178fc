//! Aggregates module
pub mod affiliate;
pub mod application;
pub mod cart;
pub mod influencer;
pub mod payout;

pub use affiliate::{Affiliate, AffiliateRecord, AffiliateStatus, Balance, LedgerEntry, LedgerEntryKind};
pub use application::{AffiliateApplication, ApplicationRecord, ApplicationStatus};
pub use cart::{Cart, CartError, LineItem};
pub use influencer::{GrantAvailability, InfluencerGrant, InfluencerProductReceipt, InfluencerRecord, InfluencerStatus};
pub use payout::{PayoutRecord, PayoutRequest, PayoutStatus, PayoutType};
