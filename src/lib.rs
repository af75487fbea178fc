//! Storefront Incentives
//!
//! Pricing and incentive settlement core for a storefront that runs a referral
//! economy on top of its sales.
//!
//! ## Features
//! - Deterministic discount stacking (member price, volume tier, bundle, referral)
//! - Referral code resolution for affiliates and influencers
//! - Commission ledger with reserved payouts and store-credit bonuses
//! - Influencer product-grant quotas with an append-only receipt log
//! - Outbox-style notification events published over NATS
//! - Write-behind journal that keeps the incentive state in Postgres

pub mod api;
pub mod catalog_store;
pub mod config;
pub mod domain;
pub mod journal;
pub mod notifications;
pub mod services;
pub mod state_store;

use domain::aggregates::PayoutStatus;
use domain::value_objects::{Money, MoneyError, PercentError, ReferralCodeError};
use thiserror::Error;

// =============================================================================
// Error Types
// =============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IncentiveError {
    #[error("Unknown variant {variant_id}")]
    UnknownVariant { variant_id: String },

    #[error("Rule conflict: {0}")]
    RuleConflict(String),

    #[error("Insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: Money, available: Money },

    #[error("Invalid transition for payout {request_id}: {from} -> {to}")]
    InvalidTransition { request_id: String, from: PayoutStatus, to: PayoutStatus },

    #[error("Grant quota exhausted for influencer {influencer_id}")]
    QuotaExhausted { influencer_id: String },

    #[error("Influencer is paused: {0}")]
    InfluencerPaused(String),

    #[error("Code or grant expired for {owner_id}")]
    CodeExpired { owner_id: String },

    #[error("Affiliate not found: {0}")]
    AffiliateNotFound(String),

    #[error("Influencer not found: {0}")]
    InfluencerNotFound(String),

    #[error("Payout request not found: {0}")]
    PayoutNotFound(String),

    #[error("Affiliate application not found: {0}")]
    ApplicationNotFound(String),

    #[error("Affiliate application already reviewed: {0}")]
    ApplicationAlreadyReviewed(String),

    #[error("Referral code already registered: {0}")]
    DuplicateCode(String),

    #[error("Invalid referral code: {0}")]
    InvalidCode(#[from] ReferralCodeError),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Commission percent must be between 5 and 15, got {0}")]
    InvalidCommissionPercent(rust_decimal::Decimal),

    #[error("Invalid percent: {0}")]
    InvalidPercent(#[from] PercentError),

    #[error(transparent)]
    CurrencyMismatch(#[from] MoneyError),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, IncentiveError>;
