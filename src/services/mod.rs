//! Application services
//!
//! [`IncentiveCore`] owns one instance of every service plus the current rule
//! catalog snapshot, and implements the flows that cross module boundaries.

pub mod grants;
pub mod ledger;
pub mod pricing;
pub mod resolver;
pub mod settlement;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::info;

use crate::domain::aggregates::{Affiliate, AffiliateApplication, ApplicationStatus, Cart, InfluencerGrant};
use crate::domain::catalog::RuleCatalog;
use crate::domain::value_objects::ReferralCode;
use crate::journal::{Commit, Journal, PersistedState};
use crate::notifications::Notifier;
use crate::{IncentiveError, Result};

use grants::{GrantQuotaTracker, GrantView};
use ledger::{AffiliateView, IncentiveLedger};
use pricing::{DiscountStackingEngine, PricedCart};
use resolver::{IncentiveCodeResolver, ReferralOwner};
use settlement::{SettlementEvent, SettlementOutcome, SettlementService};

pub struct IncentiveCore {
    catalog: RwLock<Arc<RuleCatalog>>,
    engine: DiscountStackingEngine,
    ledger: Arc<IncentiveLedger>,
    grants: Arc<GrantQuotaTracker>,
    resolver: Arc<IncentiveCodeResolver>,
    settlement: SettlementService,
    applications: DashMap<String, AffiliateApplication>,
    journal: Journal,
    default_currency: String,
}

impl IncentiveCore {
    /// A core whose state lives only in memory.
    pub fn new(catalog: RuleCatalog, notifier: Notifier, default_currency: &str) -> Self {
        Self::with_journal(catalog, notifier, Journal::disabled(), default_currency)
    }

    pub fn with_journal(catalog: RuleCatalog, notifier: Notifier, journal: Journal, default_currency: &str) -> Self {
        let ledger = Arc::new(IncentiveLedger::with_journal(notifier.clone(), journal.clone()));
        let grants = Arc::new(GrantQuotaTracker::with_journal(notifier, journal.clone()));
        let resolver = Arc::new(IncentiveCodeResolver::new(ledger.clone(), grants.clone()));
        let settlement = SettlementService::new(resolver.clone(), ledger.clone(), grants.clone(), journal.clone());
        Self {
            catalog: RwLock::new(Arc::new(catalog)),
            engine: DiscountStackingEngine::new(),
            ledger,
            grants,
            resolver,
            settlement,
            applications: DashMap::new(),
            journal,
            default_currency: default_currency.to_uppercase(),
        }
    }

    /// Loads stored state into an empty core: owners, their codes, applications
    /// and settled orders. Nothing loaded here is journaled again.
    pub fn restore(&self, state: PersistedState) -> Result<()> {
        let (affiliates, influencers) = (state.affiliates.len(), state.influencers.len());
        for affiliate in state.affiliates {
            self.resolver.register(affiliate.code(), ReferralOwner::Affiliate { affiliate_id: affiliate.id().to_string() })?;
            self.ledger.restore(affiliate)?;
        }
        for grant in state.influencers {
            self.resolver.register(grant.code(), ReferralOwner::Influencer { influencer_id: grant.influencer_id().to_string() })?;
            self.grants.restore(grant)?;
        }
        for application in state.applications {
            self.applications.insert(application.id().to_string(), application);
        }
        let settled = state.settlements.len();
        self.settlement.restore(state.settlements, self.grants.order_receipts());
        info!(affiliates, influencers, applications = self.applications.len(), settled, "incentive state restored");
        Ok(())
    }

    pub fn ledger(&self) -> &IncentiveLedger { &self.ledger }
    pub fn grants(&self) -> &GrantQuotaTracker { &self.grants }
    pub fn resolver(&self) -> &IncentiveCodeResolver { &self.resolver }
    pub fn settlement(&self) -> &SettlementService { &self.settlement }
    pub fn default_currency(&self) -> &str { &self.default_currency }

    /// The snapshot pricing currently reads. Callers keep their `Arc` for the
    /// whole computation, so a concurrent swap never changes a cart mid-price.
    pub async fn catalog(&self) -> Arc<RuleCatalog> { self.catalog.read().await.clone() }

    pub async fn replace_catalog(&self, catalog: RuleCatalog) {
        let variants = catalog.variant_count();
        *self.catalog.write().await = Arc::new(catalog);
        info!(variants, "rule catalog replaced");
    }

    /// Resolves the cart's referral code (if any) and prices the cart against
    /// the current catalog. An inapplicable code prices as if none was given.
    pub async fn price_cart(&self, cart: &Cart, is_member: bool) -> Result<PricedCart> {
        let catalog = self.catalog().await;
        let binding = cart.referral_code().and_then(|code| self.resolver.resolve(code).into_binding());
        self.engine.price(cart, binding.as_ref(), is_member, &catalog)
    }

    pub fn settle_order(&self, event: &SettlementEvent) -> Result<SettlementOutcome> { self.settlement.settle(event) }

    /// Creates an affiliate and claims its code. The code is claimed first, so
    /// two enrollments racing for the same code cannot both succeed.
    pub fn enroll_affiliate(&self, code: &str, display_name: &str, commission_percent: Decimal) -> Result<AffiliateView> {
        let code = ReferralCode::new(code)?;
        let affiliate = Affiliate::create(code.clone(), display_name, commission_percent, &self.default_currency)?;
        self.resolver.register(&code, ReferralOwner::Affiliate { affiliate_id: affiliate.id().to_string() })?;
        self.ledger.insert(affiliate).map_err(|e| {
            self.resolver.unregister(&code);
            e
        })
    }

    pub fn enroll_influencer(&self, code: &str, display_name: &str, max_products: u32, valid_until: Option<DateTime<Utc>>) -> Result<GrantView> {
        let code = ReferralCode::new(code)?;
        let grant = InfluencerGrant::create(code.clone(), display_name, max_products, valid_until)?;
        self.resolver.register(&code, ReferralOwner::Influencer { influencer_id: grant.influencer_id().to_string() })?;
        self.grants.insert(grant).map_err(|e| {
            self.resolver.unregister(&code);
            e
        })
    }

    pub fn submit_application(&self, name: &str, email: &str, requested_code: &str) -> Result<AffiliateApplication> {
        let code = ReferralCode::new(requested_code)?;
        if self.resolver.is_registered(&code) {
            return Err(IncentiveError::DuplicateCode(code.to_string()));
        }
        let application = AffiliateApplication::submit(name, email, code);
        info!(application_id = application.id(), code = %application.requested_code(), "affiliate application submitted");
        self.journal.record(Commit::application(&application));
        self.applications.insert(application.id().to_string(), application.clone());
        Ok(application)
    }

    /// Enrolls the applicant as an affiliate. The application row stays locked
    /// across enrollment, so it is approved at most once.
    pub fn approve_application(&self, application_id: &str, commission_percent: Decimal) -> Result<(AffiliateApplication, AffiliateView)> {
        let mut application = self
            .applications
            .get_mut(application_id)
            .ok_or_else(|| IncentiveError::ApplicationNotFound(application_id.to_string()))?;
        application.ensure_pending()?;
        let view = self.enroll_affiliate(application.requested_code().as_str(), application.name(), commission_percent)?;
        application.approve(&view.id)?;
        self.journal.record(Commit::application(&application));
        info!(application_id, affiliate_id = %view.id, "affiliate application approved");
        Ok((application.clone(), view))
    }

    pub fn reject_application(&self, application_id: &str) -> Result<AffiliateApplication> {
        let mut application = self
            .applications
            .get_mut(application_id)
            .ok_or_else(|| IncentiveError::ApplicationNotFound(application_id.to_string()))?;
        application.reject()?;
        self.journal.record(Commit::application(&application));
        info!(application_id, "affiliate application rejected");
        Ok(application.clone())
    }

    pub fn list_applications(&self, status: Option<ApplicationStatus>) -> Vec<AffiliateApplication> {
        let mut all: Vec<_> = self
            .applications
            .iter()
            .filter(|a| status.map_or(true, |s| a.status() == s))
            .map(|a| a.value().clone())
            .collect();
        all.sort_by(|a, b| a.submitted_at().cmp(&b.submitted_at()).then_with(|| a.id().cmp(b.id())));
        all
    }
}
