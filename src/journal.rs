//! Write-behind state journal
//!
//! Every committed mutation of an affiliate, influencer, application or order
//! settlement is described by one [`Commit`] and queued on the [`Journal`].
//! Services queue the commit while they still hold the row it came from, so
//! for any one row the queue order is the commit order. A background writer
//! applies each commit to a [`StateStore`] as one transaction and retries a
//! failed commit until the store accepts it; commits are idempotent, so a
//! retry after an unacknowledged success is harmless.
//!
//! On start-up the store is read back into a [`PersistedState`] and handed to
//! [`crate::services::IncentiveCore::restore`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::domain::aggregates::{
    Affiliate, AffiliateApplication, AffiliateRecord, InfluencerGrant, InfluencerProductReceipt, InfluencerRecord, LedgerEntry, PayoutRequest,
};
use crate::services::settlement::SettlementOutcome;
use crate::{IncentiveError, Result};

const RETRY_INITIAL: Duration = Duration::from_millis(100);
const RETRY_MAX: Duration = Duration::from_secs(5);

/// A ledger entry together with the affiliate it belongs to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredEntry {
    pub affiliate_id: String,
    pub entry: LedgerEntry,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettledOrder {
    pub order_id: String,
    pub outcome: SettlementOutcome,
    pub settled_at: DateTime<Utc>,
}

/// Rows written by one committed mutation. Owner rows and payout requests are
/// full snapshots and replace what is stored; entries, receipts and settled
/// orders are appended once and never rewritten.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Commit {
    pub affiliate: Option<AffiliateRecord>,
    pub payouts: Vec<PayoutRequest>,
    pub entries: Vec<StoredEntry>,
    pub influencer: Option<InfluencerRecord>,
    pub receipts: Vec<InfluencerProductReceipt>,
    pub application: Option<AffiliateApplication>,
    pub settlement: Option<SettledOrder>,
}

impl Commit {
    /// The affiliate's current row plus everything it appended from
    /// `entries_from` on, and the payout request the mutation touched.
    pub fn affiliate(account: &Affiliate, entries_from: usize, payout: Option<&PayoutRequest>) -> Self {
        let entries = account.entries().get(entries_from..).unwrap_or_default();
        Self {
            affiliate: Some(account.record()),
            payouts: payout.cloned().into_iter().collect(),
            entries: entries.iter().map(|e| StoredEntry { affiliate_id: account.id().to_string(), entry: e.clone() }).collect(),
            ..Self::default()
        }
    }

    pub fn influencer(grant: &InfluencerGrant, receipt: Option<&InfluencerProductReceipt>) -> Self {
        Self { influencer: Some(grant.record()), receipts: receipt.cloned().into_iter().collect(), ..Self::default() }
    }

    pub fn application(application: &AffiliateApplication) -> Self {
        Self { application: Some(application.clone()), ..Self::default() }
    }

    pub fn settlement(order: SettledOrder) -> Self { Self { settlement: Some(order), ..Self::default() } }

    /// Short description for logs.
    pub fn subject(&self) -> String {
        if let Some(a) = &self.affiliate { return format!("affiliate {}", a.id); }
        if let Some(i) = &self.influencer { return format!("influencer {}", i.influencer_id); }
        if let Some(a) = &self.application { return format!("application {}", a.id()); }
        if let Some(s) = &self.settlement { return format!("order {}", s.order_id); }
        "empty commit".to_string()
    }
}

#[derive(Clone, Debug)]
pub struct Journal {
    sender: Option<mpsc::UnboundedSender<Commit>>,
}

impl Journal {
    /// Creates a journal together with the receiving end of its queue.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Commit>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { sender: Some(tx) }, rx)
    }

    /// A journal that keeps nothing. State lives only in memory.
    pub fn disabled() -> Self { Self { sender: None } }

    pub fn record(&self, commit: Commit) {
        let Some(sender) = &self.sender else { return };
        let subject = commit.subject();
        if sender.send(commit).is_err() {
            error!(%subject, "journal writer is gone, commit not persisted");
        }
    }
}

/// Durable home of the incentive state.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    async fn load(&self) -> Result<PersistedState>;

    /// Applies every row of `commit` in one transaction.
    async fn apply(&self, commit: &Commit) -> Result<()>;
}

/// Drains `rx` into `store` until every journal handle is dropped.
pub fn spawn_writer<S: StateStore>(mut rx: mpsc::UnboundedReceiver<Commit>, store: Arc<S>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut written: u64 = 0;
        while let Some(commit) = rx.recv().await {
            let mut delay = RETRY_INITIAL;
            while let Err(e) = store.apply(&commit).await {
                warn!(subject = %commit.subject(), retry_in = ?delay, "failed to persist commit: {}", e);
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RETRY_MAX);
            }
            written += 1;
            debug!(subject = %commit.subject(), "commit persisted");
        }
        info!(written, "journal writer stopped");
    })
}

/// Stored rows in commit order, before they are grouped under their owners.
#[derive(Clone, Debug, Default)]
pub struct StateRows {
    pub affiliates: Vec<AffiliateRecord>,
    pub payouts: Vec<PayoutRequest>,
    pub entries: Vec<StoredEntry>,
    pub influencers: Vec<InfluencerRecord>,
    pub receipts: Vec<InfluencerProductReceipt>,
    pub applications: Vec<AffiliateApplication>,
    pub settlements: Vec<SettledOrder>,
}

#[derive(Debug, Default)]
pub struct PersistedState {
    pub affiliates: Vec<Affiliate>,
    pub influencers: Vec<InfluencerGrant>,
    pub applications: Vec<AffiliateApplication>,
    pub settlements: Vec<SettledOrder>,
}

impl StateRows {
    /// Groups payouts, entries and receipts under their owners and rebuilds
    /// the aggregates. A child row without an owner fails the load.
    pub fn assemble(self) -> Result<PersistedState> {
        let mut payouts: HashMap<String, Vec<PayoutRequest>> = HashMap::new();
        for p in self.payouts {
            payouts.entry(p.affiliate_id().to_string()).or_default().push(p);
        }
        let mut entries: HashMap<String, Vec<LedgerEntry>> = HashMap::new();
        for e in self.entries {
            entries.entry(e.affiliate_id).or_default().push(e.entry);
        }
        let affiliates = self
            .affiliates
            .into_iter()
            .map(|record| {
                let own_payouts = payouts.remove(&record.id).unwrap_or_default();
                let own_entries = entries.remove(&record.id).unwrap_or_default();
                Affiliate::restore(record, own_payouts, own_entries)
            })
            .collect::<Result<Vec<_>>>()?;
        if let Some(orphan) = payouts.keys().chain(entries.keys()).next() {
            return Err(IncentiveError::StorageError(format!("stored rows reference unknown affiliate {orphan}")));
        }

        let mut receipts: HashMap<String, Vec<InfluencerProductReceipt>> = HashMap::new();
        for r in self.receipts {
            receipts.entry(r.influencer_id.clone()).or_default().push(r);
        }
        let influencers = self
            .influencers
            .into_iter()
            .map(|record| {
                let own = receipts.remove(&record.influencer_id).unwrap_or_default();
                InfluencerGrant::restore(record, own)
            })
            .collect::<Result<Vec<_>>>()?;
        if let Some(orphan) = receipts.keys().next() {
            return Err(IncentiveError::StorageError(format!("stored receipts reference unknown influencer {orphan}")));
        }

        Ok(PersistedState { affiliates, influencers, applications: self.applications, settlements: self.settlements })
    }
}
