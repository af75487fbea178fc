//! Postgres-backed incentive state
//!
//! Reads every table back at start-up and applies journal commits, each in its
//! own transaction. Owner rows and payout requests are upserted from full
//! snapshots; entries, receipts and settled orders are inserted once and a
//! repeated insert is ignored.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::{error, info};

use crate::domain::aggregates::{
    AffiliateApplication, AffiliateRecord, ApplicationRecord, Balance, InfluencerProductReceipt, InfluencerRecord, LedgerEntry,
    LedgerEntryKind, PayoutRecord, PayoutRequest,
};
use crate::domain::value_objects::{Money, Percent, ReferralCode};
use crate::journal::{Commit, PersistedState, SettledOrder, StateRows, StateStore, StoredEntry};
use crate::services::settlement::SettlementOutcome;
use crate::{IncentiveError, Result};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AffiliateRow {
    pub id: String,
    pub code: String,
    pub display_name: String,
    pub commission_percent: Decimal,
    pub status: String,
    pub currency: String,
    pub pending: Decimal,
    pub reserved: Decimal,
    pub paid: Decimal,
    pub total: Decimal,
    pub store_credit: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PayoutRow {
    pub id: String,
    pub affiliate_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub payout_type: String,
    pub status: String,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EntryRow {
    pub id: String,
    pub affiliate_id: String,
    pub kind: Json<LedgerEntryKind>,
    pub amount: Decimal,
    pub currency: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InfluencerRow {
    pub id: String,
    pub code: String,
    pub display_name: String,
    pub status: String,
    pub max_products: i64,
    pub products_used: i64,
    pub valid_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ReceiptRow {
    pub id: String,
    pub influencer_id: String,
    pub product_title: String,
    pub order_id: Option<String>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ApplicationRow {
    pub id: String,
    pub name: String,
    pub email: String,
    pub requested_code: String,
    pub status: String,
    pub affiliate_id: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SettledRow {
    pub order_id: String,
    pub outcome: Json<SettlementOutcome>,
    pub settled_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct PgStateStore { pool: PgPool }

impl PgStateStore {
    pub fn new(pool: PgPool) -> Self { Self { pool } }

    async fn fetch_rows(&self) -> std::result::Result<StoredRows, sqlx::Error> {
        Ok(StoredRows {
            affiliates: sqlx::query_as::<_, AffiliateRow>("SELECT * FROM affiliates ORDER BY created_at, id").fetch_all(&self.pool).await?,
            payouts: sqlx::query_as::<_, PayoutRow>("SELECT * FROM payout_requests ORDER BY created_at, id").fetch_all(&self.pool).await?,
            entries: sqlx::query_as::<_, EntryRow>("SELECT * FROM ledger_entries ORDER BY id").fetch_all(&self.pool).await?,
            influencers: sqlx::query_as::<_, InfluencerRow>("SELECT * FROM influencer_grants ORDER BY created_at, id").fetch_all(&self.pool).await?,
            receipts: sqlx::query_as::<_, ReceiptRow>("SELECT * FROM influencer_receipts ORDER BY id").fetch_all(&self.pool).await?,
            applications: sqlx::query_as::<_, ApplicationRow>("SELECT * FROM affiliate_applications ORDER BY submitted_at, id")
                .fetch_all(&self.pool)
                .await?,
            settlements: sqlx::query_as::<_, SettledRow>("SELECT * FROM settled_orders ORDER BY settled_at, order_id").fetch_all(&self.pool).await?,
        })
    }

    async fn write(&self, commit: &Commit) -> std::result::Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        if let Some(a) = &commit.affiliate {
            sqlx::query(
                "INSERT INTO affiliates (id, code, display_name, commission_percent, status, currency, pending, reserved, paid, total, store_credit, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
                 ON CONFLICT (id) DO UPDATE SET display_name = EXCLUDED.display_name, commission_percent = EXCLUDED.commission_percent, \
                 status = EXCLUDED.status, pending = EXCLUDED.pending, reserved = EXCLUDED.reserved, paid = EXCLUDED.paid, \
                 total = EXCLUDED.total, store_credit = EXCLUDED.store_credit, updated_at = EXCLUDED.updated_at",
            )
            .bind(&a.id)
            .bind(a.code.as_str())
            .bind(&a.display_name)
            .bind(a.commission_percent.value())
            .bind(label(&a.status))
            .bind(a.balance.total.currency())
            .bind(a.balance.pending.amount())
            .bind(a.balance.reserved.amount())
            .bind(a.balance.paid.amount())
            .bind(a.balance.total.amount())
            .bind(a.balance.store_credit.amount())
            .bind(a.created_at)
            .bind(a.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        for p in &commit.payouts {
            sqlx::query(
                "INSERT INTO payout_requests (id, affiliate_id, amount, currency, payout_type, status, note, created_at, processed_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
                 ON CONFLICT (id) DO UPDATE SET status = EXCLUDED.status, note = EXCLUDED.note, processed_at = EXCLUDED.processed_at",
            )
            .bind(p.id())
            .bind(p.affiliate_id())
            .bind(p.amount().amount())
            .bind(p.amount().currency())
            .bind(label(&p.payout_type()))
            .bind(label(&p.status()))
            .bind(p.note())
            .bind(p.created_at())
            .bind(p.processed_at())
            .execute(&mut *tx)
            .await?;
        }

        for e in &commit.entries {
            sqlx::query(
                "INSERT INTO ledger_entries (id, affiliate_id, kind, amount, currency, recorded_at) \
                 VALUES ($1, $2, $3, $4, $5, $6) ON CONFLICT (id) DO NOTHING",
            )
            .bind(&e.entry.id)
            .bind(&e.affiliate_id)
            .bind(Json(&e.entry.kind))
            .bind(e.entry.amount.amount())
            .bind(e.entry.amount.currency())
            .bind(e.entry.recorded_at)
            .execute(&mut *tx)
            .await?;
        }

        if let Some(i) = &commit.influencer {
            sqlx::query(
                "INSERT INTO influencer_grants (id, code, display_name, status, max_products, products_used, valid_until, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
                 ON CONFLICT (id) DO UPDATE SET display_name = EXCLUDED.display_name, status = EXCLUDED.status, \
                 max_products = EXCLUDED.max_products, products_used = EXCLUDED.products_used, valid_until = EXCLUDED.valid_until",
            )
            .bind(&i.influencer_id)
            .bind(i.code.as_str())
            .bind(&i.display_name)
            .bind(label(&i.status))
            .bind(i64::from(i.max_products))
            .bind(i64::from(i.products_used))
            .bind(i.valid_until)
            .bind(i.created_at)
            .execute(&mut *tx)
            .await?;
        }

        for r in &commit.receipts {
            sqlx::query(
                "INSERT INTO influencer_receipts (id, influencer_id, product_title, order_id, received_at) \
                 VALUES ($1, $2, $3, $4, $5) ON CONFLICT (id) DO NOTHING",
            )
            .bind(&r.id)
            .bind(&r.influencer_id)
            .bind(&r.product_title)
            .bind(r.order_id.as_deref())
            .bind(r.received_at)
            .execute(&mut *tx)
            .await?;
        }

        if let Some(a) = &commit.application {
            sqlx::query(
                "INSERT INTO affiliate_applications (id, name, email, requested_code, status, affiliate_id, submitted_at, reviewed_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
                 ON CONFLICT (id) DO UPDATE SET status = EXCLUDED.status, affiliate_id = EXCLUDED.affiliate_id, reviewed_at = EXCLUDED.reviewed_at",
            )
            .bind(a.id())
            .bind(a.name())
            .bind(a.email())
            .bind(a.requested_code().as_str())
            .bind(label(&a.status()))
            .bind(a.affiliate_id())
            .bind(a.submitted_at())
            .bind(a.reviewed_at())
            .execute(&mut *tx)
            .await?;
        }

        if let Some(s) = &commit.settlement {
            sqlx::query("INSERT INTO settled_orders (order_id, outcome, settled_at) VALUES ($1, $2, $3) ON CONFLICT (order_id) DO NOTHING")
                .bind(&s.order_id)
                .bind(Json(&s.outcome))
                .bind(s.settled_at)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn load(&self) -> Result<PersistedState> {
        let rows = self.fetch_rows().await.map_err(|e| IncentiveError::StorageError(e.to_string()))?;
        let state = rows.decode()?.assemble()?;
        info!(affiliates = state.affiliates.len(), influencers = state.influencers.len(), "incentive state loaded");
        Ok(state)
    }

    async fn apply(&self, commit: &Commit) -> Result<()> {
        self.write(commit).await.map_err(|e| {
            error!(subject = %commit.subject(), "transaction rolled back: {}", e);
            IncentiveError::StorageError(e.to_string())
        })
    }
}

/// Raw table contents as read from Postgres.
#[derive(Debug, Clone, Default)]
pub struct StoredRows {
    pub affiliates: Vec<AffiliateRow>,
    pub payouts: Vec<PayoutRow>,
    pub entries: Vec<EntryRow>,
    pub influencers: Vec<InfluencerRow>,
    pub receipts: Vec<ReceiptRow>,
    pub applications: Vec<ApplicationRow>,
    pub settlements: Vec<SettledRow>,
}

impl StoredRows {
    /// Turns column values back into domain records. An unreadable value
    /// fails the whole load.
    pub fn decode(self) -> Result<StateRows> {
        let affiliates = self
            .affiliates
            .into_iter()
            .map(|r| -> Result<AffiliateRecord> {
                let money = |amount| Money::new(amount, &r.currency);
                Ok(AffiliateRecord {
                    code: code(&r.code)?,
                    commission_percent: Percent::new(r.commission_percent)?,
                    status: parse_label("affiliate status", &r.status)?,
                    balance: Balance {
                        pending: money(r.pending), reserved: money(r.reserved), paid: money(r.paid),
                        total: money(r.total), store_credit: money(r.store_credit),
                    },
                    id: r.id,
                    display_name: r.display_name,
                    created_at: r.created_at,
                    updated_at: r.updated_at,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let payouts = self
            .payouts
            .into_iter()
            .map(|r| -> Result<PayoutRequest> {
                Ok(PayoutRequest::from(PayoutRecord {
                    amount: Money::new(r.amount, &r.currency),
                    payout_type: parse_label("payout type", &r.payout_type)?,
                    status: parse_label("payout status", &r.status)?,
                    id: r.id, affiliate_id: r.affiliate_id, note: r.note, created_at: r.created_at, processed_at: r.processed_at,
                }))
            })
            .collect::<Result<Vec<_>>>()?;

        let entries = self
            .entries
            .into_iter()
            .map(|r| StoredEntry {
                affiliate_id: r.affiliate_id,
                entry: LedgerEntry { id: r.id, kind: r.kind.0, amount: Money::new(r.amount, &r.currency), recorded_at: r.recorded_at },
            })
            .collect();

        let influencers = self
            .influencers
            .into_iter()
            .map(|r| -> Result<InfluencerRecord> {
                Ok(InfluencerRecord {
                    code: code(&r.code)?,
                    status: parse_label("influencer status", &r.status)?,
                    max_products: count("max_products", r.max_products)?,
                    products_used: count("products_used", r.products_used)?,
                    influencer_id: r.id, display_name: r.display_name, valid_until: r.valid_until, created_at: r.created_at,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let receipts = self
            .receipts
            .into_iter()
            .map(|r| InfluencerProductReceipt {
                id: r.id, influencer_id: r.influencer_id, product_title: r.product_title, order_id: r.order_id, received_at: r.received_at,
            })
            .collect();

        let applications = self
            .applications
            .into_iter()
            .map(|r| -> Result<AffiliateApplication> {
                Ok(AffiliateApplication::from(ApplicationRecord {
                    requested_code: code(&r.requested_code)?,
                    status: parse_label("application status", &r.status)?,
                    id: r.id, name: r.name, email: r.email, affiliate_id: r.affiliate_id,
                    submitted_at: r.submitted_at, reviewed_at: r.reviewed_at,
                }))
            })
            .collect::<Result<Vec<_>>>()?;

        let settlements = self
            .settlements
            .into_iter()
            .map(|r| SettledOrder { order_id: r.order_id, outcome: r.outcome.0, settled_at: r.settled_at })
            .collect();

        Ok(StateRows { affiliates, payouts, entries, influencers, receipts, applications, settlements })
    }
}

/// Column text of a unit enum, e.g. `PayoutType::StoreCredit` -> `store_credit`.
fn label<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        other => other.map(|v| v.to_string()).unwrap_or_default(),
    }
}

fn parse_label<T: DeserializeOwned>(column: &str, raw: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|_| IncentiveError::StorageError(format!("unexpected {column} {raw:?}")))
}

fn code(raw: &str) -> Result<ReferralCode> {
    ReferralCode::new(raw).map_err(|e| IncentiveError::StorageError(format!("stored code {raw:?}: {e}")))
}

fn count(column: &str, value: i64) -> Result<u32> {
    u32::try_from(value).map_err(|_| IncentiveError::StorageError(format!("{column} out of range: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::{AffiliateStatus, ApplicationStatus, PayoutStatus, PayoutType};
    use rust_decimal_macros::dec;

    fn rows() -> StoredRows {
        let now = Utc::now();
        StoredRows {
            affiliates: vec![AffiliateRow {
                id: "A1".into(), code: "ANNA10".into(), display_name: "Anna".into(), commission_percent: dec!(10),
                status: "active".into(), currency: "SEK".into(), pending: dec!(20), reserved: dec!(30), paid: dec!(0),
                total: dec!(50), store_credit: dec!(0), created_at: now, updated_at: now,
            }],
            payouts: vec![PayoutRow {
                id: "R1".into(), affiliate_id: "A1".into(), amount: dec!(30), currency: "SEK".into(),
                payout_type: "store_credit".into(), status: "approved".into(), note: None, created_at: now, processed_at: Some(now),
            }],
            entries: vec![EntryRow {
                id: "E1".into(), affiliate_id: "A1".into(),
                kind: Json(LedgerEntryKind::CommissionAccrued { order_id: "O1".into(), order_total: Money::sek(dec!(500)) }),
                amount: dec!(50), currency: "SEK".into(), recorded_at: now,
            }],
            influencers: vec![InfluencerRow {
                id: "I1".into(), code: "LISA".into(), display_name: "Lisa".into(), status: "paused".into(),
                max_products: 3, products_used: 1, valid_until: None, created_at: now,
            }],
            receipts: vec![ReceiptRow { id: "X1".into(), influencer_id: "I1".into(), product_title: "Serum".into(), order_id: Some("O2".into()), received_at: now }],
            applications: vec![ApplicationRow {
                id: "P1".into(), name: "Bo".into(), email: "bo@example.com".into(), requested_code: "BO5".into(),
                status: "rejected".into(), affiliate_id: None, submitted_at: now, reviewed_at: Some(now),
            }],
            settlements: vec![],
        }
    }

    #[test]
    fn test_decode_and_assemble() {
        let state = rows().decode().unwrap().assemble().unwrap();
        let a = &state.affiliates[0];
        assert_eq!(a.status(), AffiliateStatus::Active);
        assert_eq!(a.balance().reserved.amount(), dec!(30));
        assert_eq!(a.payouts()[0].payout_type(), PayoutType::StoreCredit);
        assert_eq!(a.payouts()[0].status(), PayoutStatus::Approved);
        assert_eq!(a.entries().len(), 1);
        assert_eq!(state.influencers[0].receipts()[0].order_id.as_deref(), Some("O2"));
        assert_eq!(state.applications[0].status(), ApplicationStatus::Rejected);
    }

    #[test]
    fn test_unreadable_columns_fail_the_load() {
        let mut bad = rows();
        bad.payouts[0].status = "lost".into();
        assert!(matches!(bad.decode(), Err(IncentiveError::StorageError(_))));

        let mut bad = rows();
        bad.influencers[0].products_used = -1;
        assert!(matches!(bad.decode(), Err(IncentiveError::StorageError(_))));

        let mut bad = rows();
        bad.affiliates[0].pending = dec!(25);
        assert!(matches!(bad.decode().and_then(StateRows::assemble), Err(IncentiveError::StorageError(_))));
    }

    #[test]
    fn test_labels_match_column_checks() {
        assert_eq!(label(&PayoutType::StoreCredit), "store_credit");
        assert_eq!(label(&PayoutStatus::Rejected), "rejected");
        assert_eq!(label(&AffiliateStatus::Paused), "paused");
        assert_eq!(parse_label::<ApplicationStatus>("status", "approved").unwrap(), ApplicationStatus::Approved);
    }
}
