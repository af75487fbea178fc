//! HTTP API
//!
//! Thin axum layer over [`IncentiveCore`]. Handlers validate the request body,
//! call one core operation and map [`IncentiveError`] onto a status code and a
//! JSON error body.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use validator::Validate;

use crate::catalog_store::PgCatalogStore;
use crate::domain::aggregates::{
    AffiliateApplication, ApplicationStatus, Balance, Cart, InfluencerProductReceipt, LedgerEntry, LineItem, PayoutRequest, PayoutType,
};
use crate::domain::value_objects::Money;
use crate::services::grants::GrantView;
use crate::services::ledger::{AffiliateView, PaidPayout};
use crate::services::pricing::PricedCart;
use crate::services::resolver::CodeResolution;
use crate::services::settlement::{SettlementEvent, SettlementOutcome};
use crate::services::IncentiveCore;
use crate::IncentiveError;

#[derive(Clone)]
pub struct AppState {
    pub core: Arc<IncentiveCore>,
    pub catalog_store: Option<PgCatalogStore>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { Json(serde_json::json!({"status": "healthy", "service": "storefront-incentives"})) }))
        .route("/api/v1/pricing", post(price_cart))
        .route("/api/v1/settlements", post(settle_order))
        .route("/api/v1/referrals/:code", get(resolve_code))
        .route("/api/v1/affiliates/:id", get(get_affiliate))
        .route("/api/v1/affiliates/:id/balance", get(get_balance))
        .route("/api/v1/affiliates/:id/entries", get(list_entries))
        .route("/api/v1/affiliates/:id/payouts", get(list_payouts).post(request_payout))
        .route("/api/v1/affiliate-applications", post(submit_application))
        .route("/api/v1/influencers/:id/grant", get(get_grant))
        .route("/api/v1/influencers/:id/grants/consume", post(consume_grant))
        .route("/api/v1/admin/affiliates", get(list_affiliates).post(enroll_affiliate))
        .route("/api/v1/admin/affiliates/:id/pause", post(pause_affiliate))
        .route("/api/v1/admin/affiliates/:id/resume", post(resume_affiliate))
        .route("/api/v1/admin/affiliate-applications", get(list_applications))
        .route("/api/v1/admin/affiliate-applications/:id/approve", post(approve_application))
        .route("/api/v1/admin/affiliate-applications/:id/reject", post(reject_application))
        .route("/api/v1/admin/influencers", post(enroll_influencer))
        .route("/api/v1/admin/influencers/:id/quota", post(increase_quota))
        .route("/api/v1/admin/payouts", get(list_open_payouts))
        .route("/api/v1/admin/payouts/:id/approve", post(approve_payout))
        .route("/api/v1/admin/payouts/:id/reject", post(reject_payout))
        .route("/api/v1/admin/payouts/:id/mark-paid", post(mark_payout_paid))
        .route("/api/v1/admin/catalog/reload", post(reload_catalog))
        .with_state(state)
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested: Option<Money>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available: Option<Money>,
}

#[derive(Debug)]
pub enum ApiError {
    Incentive(IncentiveError),
    Validation(String),
    Unavailable(String),
}

impl From<IncentiveError> for ApiError {
    fn from(e: IncentiveError) -> Self { Self::Incentive(e) }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(e: validator::ValidationErrors) -> Self { Self::Validation(e.to_string()) }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message, amounts) = match self {
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "validation_failed", msg, None),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg, None),
            ApiError::Incentive(e) => {
                let message = e.to_string();
                match e {
                    IncentiveError::InsufficientBalance { requested, available } => {
                        (StatusCode::UNPROCESSABLE_ENTITY, "insufficient_balance", message, Some((requested, available)))
                    }
                    IncentiveError::UnknownVariant { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "unknown_variant", message, None),
                    IncentiveError::RuleConflict(_) => (StatusCode::CONFLICT, "rule_conflict", message, None),
                    IncentiveError::InvalidTransition { .. } => (StatusCode::CONFLICT, "invalid_transition", message, None),
                    IncentiveError::QuotaExhausted { .. } => (StatusCode::CONFLICT, "quota_exhausted", message, None),
                    IncentiveError::InfluencerPaused(_) => (StatusCode::CONFLICT, "influencer_paused", message, None),
                    IncentiveError::CodeExpired { .. } => (StatusCode::GONE, "code_expired", message, None),
                    IncentiveError::DuplicateCode(_) => (StatusCode::CONFLICT, "duplicate_code", message, None),
                    IncentiveError::ApplicationAlreadyReviewed(_) => (StatusCode::CONFLICT, "already_reviewed", message, None),
                    IncentiveError::AffiliateNotFound(_)
                    | IncentiveError::InfluencerNotFound(_)
                    | IncentiveError::PayoutNotFound(_)
                    | IncentiveError::ApplicationNotFound(_) => (StatusCode::NOT_FOUND, "not_found", message, None),
                    IncentiveError::InvalidCode(_)
                    | IncentiveError::InvalidAmount(_)
                    | IncentiveError::InvalidCommissionPercent(_)
                    | IncentiveError::InvalidPercent(_)
                    | IncentiveError::CurrencyMismatch(_) => (StatusCode::BAD_REQUEST, "invalid_request", message, None),
                    IncentiveError::StorageError(_) | IncentiveError::Config(_) => {
                        error!("internal error: {}", message);
                        (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message, None)
                    }
                }
            }
        };
        let (requested, available) = amounts.map_or((None, None), |(r, a)| (Some(r), Some(a)));
        (status, Json(ErrorBody { error, message, requested, available })).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// =============================================================================
// Requests
// =============================================================================

#[derive(Debug, Deserialize, Validate)]
pub struct CartLineRequest {
    pub line_id: Option<String>,
    #[validate(length(min = 1))]
    pub product_id: String,
    #[validate(length(min = 1))]
    pub variant_id: String,
    #[serde(default)]
    pub title: String,
    #[validate(range(min = 1, max = 10000))]
    pub quantity: u32,
    pub unit_price: Decimal,
}

#[derive(Debug, Deserialize, Validate)]
pub struct PriceCartRequest {
    #[validate(length(equal = 3))]
    pub currency: Option<String>,
    #[serde(default)]
    pub is_member: bool,
    #[validate(length(max = 32))]
    pub referral_code: Option<String>,
    #[validate]
    pub items: Vec<CartLineRequest>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SettlementRequest {
    #[validate(length(min = 1, max = 128))]
    pub order_id: String,
    pub order_total: Decimal,
    #[validate(length(equal = 3))]
    pub currency: Option<String>,
    pub referral_code: Option<String>,
    #[validate(length(min = 1, max = 200))]
    pub grant_product_title: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PayoutBody {
    pub amount: Decimal,
    pub payout_type: PayoutType,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct RejectBody {
    #[validate(length(max = 500))]
    pub note: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ConsumeGrantBody {
    #[validate(length(min = 1, max = 200))]
    pub product_title: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct IncreaseQuotaBody {
    #[validate(range(min = 1))]
    pub additional: u32,
}

#[derive(Debug, Deserialize, Validate)]
pub struct EnrollAffiliateBody {
    #[validate(length(min = 1, max = 32))]
    pub code: String,
    #[validate(length(min = 1, max = 200))]
    pub display_name: String,
    pub commission_percent: Decimal,
}

#[derive(Debug, Deserialize, Validate)]
pub struct EnrollInfluencerBody {
    #[validate(length(min = 1, max = 32))]
    pub code: String,
    #[validate(length(min = 1, max = 200))]
    pub display_name: String,
    #[validate(range(min = 1))]
    pub max_products: u32,
    pub valid_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ApplicationBody {
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 1, max = 32))]
    pub requested_code: String,
}

#[derive(Debug, Deserialize)]
pub struct ApproveApplicationBody {
    pub commission_percent: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct ApplicationFilter { pub status: Option<ApplicationStatus> }

#[derive(Debug, Serialize)]
pub struct ApprovedApplication { pub application: AffiliateApplication, pub affiliate: AffiliateView }

// =============================================================================
// Handlers
// =============================================================================

async fn price_cart(State(s): State<AppState>, Json(r): Json<PriceCartRequest>) -> ApiResult<Json<PricedCart>> {
    r.validate()?;
    let currency = r.currency.as_deref().unwrap_or(s.core.default_currency());
    let mut cart = Cart::new(currency);
    for line in r.items {
        let mut item = LineItem::new(line.product_id, line.variant_id, line.title, line.quantity, Money::new(line.unit_price, currency));
        if let Some(id) = line.line_id { item.line_id = id; }
        cart.add_item(item).map_err(|e| ApiError::Validation(e.to_string()))?;
    }
    if let Some(code) = r.referral_code { cart.apply_referral_code(code); }
    Ok(Json(s.core.price_cart(&cart, r.is_member).await?))
}

async fn settle_order(State(s): State<AppState>, Json(r): Json<SettlementRequest>) -> ApiResult<Json<SettlementOutcome>> {
    r.validate()?;
    let currency = r.currency.as_deref().unwrap_or(s.core.default_currency());
    let event = SettlementEvent {
        order_id: r.order_id,
        order_total: Money::new(r.order_total, currency),
        referral_code: r.referral_code,
        grant_product_title: r.grant_product_title,
    };
    Ok(Json(s.core.settle_order(&event)?))
}

async fn resolve_code(State(s): State<AppState>, Path(code): Path<String>) -> Json<CodeResolution> {
    Json(s.core.resolver().resolve(&code))
}

async fn get_affiliate(State(s): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<AffiliateView>> {
    Ok(Json(s.core.ledger().affiliate(&id)?))
}

async fn get_balance(State(s): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Balance>> {
    Ok(Json(s.core.ledger().get_balance(&id)?))
}

async fn list_entries(State(s): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Vec<LedgerEntry>>> {
    Ok(Json(s.core.ledger().entries_for(&id)?))
}

async fn list_payouts(State(s): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Vec<PayoutRequest>>> {
    Ok(Json(s.core.ledger().payouts_for(&id)?))
}

async fn request_payout(State(s): State<AppState>, Path(id): Path<String>, Json(r): Json<PayoutBody>) -> ApiResult<(StatusCode, Json<PayoutRequest>)> {
    let currency = s.core.ledger().get_balance(&id)?.total.currency().to_string();
    let request = s.core.ledger().request_payout(&id, Money::new(r.amount, &currency), r.payout_type)?;
    Ok((StatusCode::CREATED, Json(request)))
}

async fn submit_application(State(s): State<AppState>, Json(r): Json<ApplicationBody>) -> ApiResult<(StatusCode, Json<AffiliateApplication>)> {
    r.validate()?;
    Ok((StatusCode::CREATED, Json(s.core.submit_application(&r.name, &r.email, &r.requested_code)?)))
}

async fn get_grant(State(s): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<GrantView>> {
    Ok(Json(s.core.grants().snapshot(&id)?))
}

async fn consume_grant(State(s): State<AppState>, Path(id): Path<String>, Json(r): Json<ConsumeGrantBody>) -> ApiResult<(StatusCode, Json<InfluencerProductReceipt>)> {
    r.validate()?;
    Ok((StatusCode::CREATED, Json(s.core.grants().consume_grant(&id, &r.product_title)?)))
}

async fn list_affiliates(State(s): State<AppState>) -> Json<Vec<AffiliateView>> { Json(s.core.ledger().affiliates()) }

async fn enroll_affiliate(State(s): State<AppState>, Json(r): Json<EnrollAffiliateBody>) -> ApiResult<(StatusCode, Json<AffiliateView>)> {
    r.validate()?;
    Ok((StatusCode::CREATED, Json(s.core.enroll_affiliate(&r.code, &r.display_name, r.commission_percent)?)))
}

async fn pause_affiliate(State(s): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<AffiliateView>> {
    Ok(Json(s.core.ledger().pause(&id)?))
}

async fn resume_affiliate(State(s): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<AffiliateView>> {
    Ok(Json(s.core.ledger().resume(&id)?))
}

async fn list_applications(State(s): State<AppState>, Query(f): Query<ApplicationFilter>) -> Json<Vec<AffiliateApplication>> {
    Json(s.core.list_applications(f.status))
}

async fn approve_application(State(s): State<AppState>, Path(id): Path<String>, Json(r): Json<ApproveApplicationBody>) -> ApiResult<Json<ApprovedApplication>> {
    let (application, affiliate) = s.core.approve_application(&id, r.commission_percent)?;
    Ok(Json(ApprovedApplication { application, affiliate }))
}

async fn reject_application(State(s): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<AffiliateApplication>> {
    Ok(Json(s.core.reject_application(&id)?))
}

async fn enroll_influencer(State(s): State<AppState>, Json(r): Json<EnrollInfluencerBody>) -> ApiResult<(StatusCode, Json<GrantView>)> {
    r.validate()?;
    Ok((StatusCode::CREATED, Json(s.core.enroll_influencer(&r.code, &r.display_name, r.max_products, r.valid_until)?)))
}

async fn increase_quota(State(s): State<AppState>, Path(id): Path<String>, Json(r): Json<IncreaseQuotaBody>) -> ApiResult<Json<GrantView>> {
    r.validate()?;
    Ok(Json(s.core.grants().increase_quota(&id, r.additional)?))
}

async fn list_open_payouts(State(s): State<AppState>) -> Json<Vec<PayoutRequest>> { Json(s.core.ledger().open_payouts()) }

async fn approve_payout(State(s): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<PayoutRequest>> {
    Ok(Json(s.core.ledger().approve(&id)?))
}

/// The note is optional; a POST without a body rejects without one.
async fn reject_payout(State(s): State<AppState>, Path(id): Path<String>, body: Option<Json<RejectBody>>) -> ApiResult<Json<PayoutRequest>> {
    let r = body.map(|Json(r)| r).unwrap_or_default();
    r.validate()?;
    Ok(Json(s.core.ledger().reject(&id, r.note)?))
}

async fn mark_payout_paid(State(s): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<PaidPayout>> {
    Ok(Json(s.core.ledger().mark_paid(&id)?))
}

async fn reload_catalog(State(s): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let store = s.catalog_store.as_ref().ok_or_else(|| ApiError::Unavailable("no catalog database configured".into()))?;
    let catalog = store.load().await?;
    let variants = catalog.variant_count();
    s.core.replace_catalog(catalog).await;
    info!(variants, "catalog reloaded on request");
    Ok(Json(serde_json::json!({"status": "reloaded", "variants": variants})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::catalog::RuleCatalog;
    use crate::notifications::Notifier;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use serde_json::{json, Value};
    use rust_decimal_macros::dec;
    use std::str::FromStr;
    use tower::ServiceExt;

    fn amount(v: &Value) -> Decimal { Decimal::from_str(v["amount"].as_str().unwrap()).unwrap() }

    fn app() -> (Router, Arc<IncentiveCore>) {
        let catalog = RuleCatalog::new().with_variant("V1", "P1");
        let core = Arc::new(IncentiveCore::new(catalog, Notifier::disconnected(), "SEK"));
        (router(AppState { core: core.clone(), catalog_store: None }), core)
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri).header("content-type", "application/json");
        let request = match body {
            Some(b) => request.body(Body::from(b.to_string())).unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = app();
        let (status, body) = call(&app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_pricing_with_referral() {
        let (app, core) = app();
        core.enroll_affiliate("ANNA10", "Anna", dec!(10)).unwrap();
        let body = json!({
            "referral_code": "anna10",
            "items": [{"product_id": "P1", "variant_id": "V1", "title": "Serum", "quantity": 2, "unit_price": "100.00"}]
        });
        let (status, priced) = call(&app, Method::POST, "/api/v1/pricing", Some(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(priced["referral_applied"], true);
        assert_eq!(amount(&priced["grand_total"]), dec!(180));
    }

    #[tokio::test]
    async fn test_validation_rejects_zero_quantity() {
        let (app, _) = app();
        let body = json!({"items": [{"product_id": "P1", "variant_id": "V1", "quantity": 0, "unit_price": "10"}]});
        let (status, err) = call(&app, Method::POST, "/api/v1/pricing", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(err["error"], "validation_failed");
    }

    #[tokio::test]
    async fn test_settlement_then_payout_flow() {
        let (app, core) = app();
        let affiliate = core.enroll_affiliate("ANNA10", "Anna", dec!(10)).unwrap();

        let settle = json!({"order_id": "O1", "order_total": "1000", "referral_code": "ANNA10"});
        let (status, outcome) = call(&app, Method::POST, "/api/v1/settlements", Some(settle.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(outcome["outcome"], "commission_accrued");
        let (_, replay) = call(&app, Method::POST, "/api/v1/settlements", Some(settle)).await;
        assert_eq!(replay["outcome"], "replayed");

        let uri = format!("/api/v1/affiliates/{}/payouts", affiliate.id);
        let (status, err) = call(&app, Method::POST, &uri, Some(json!({"amount": "150", "payout_type": "cash"}))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(err["error"], "insufficient_balance");
        assert_eq!(amount(&err["available"]), dec!(100));
        assert_eq!(amount(&err["requested"]), dec!(150));

        let (status, request) = call(&app, Method::POST, &uri, Some(json!({"amount": "40", "payout_type": "store_credit"}))).await;
        assert_eq!(status, StatusCode::CREATED);
        let request_id = request["id"].as_str().unwrap().to_string();

        let (status, _) = call(&app, Method::POST, &format!("/api/v1/admin/payouts/{request_id}/approve"), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, paid) = call(&app, Method::POST, &format!("/api/v1/admin/payouts/{request_id}/mark-paid"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(amount(&paid["store_credit_bonus"]), dec!(4));
        let (status, _) = call(&app, Method::POST, &format!("/api/v1/admin/payouts/{request_id}/approve"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (_, balance) = call(&app, Method::GET, &format!("/api/v1/affiliates/{}/balance", affiliate.id), None).await;
        assert_eq!(amount(&balance["pending"]), dec!(60));
        assert_eq!(amount(&balance["paid"]), dec!(40));
        assert_eq!(amount(&balance["store_credit"]), dec!(44));
    }

    #[tokio::test]
    async fn test_reject_payout_with_and_without_note() {
        let (app, core) = app();
        let affiliate = core.enroll_affiliate("ANNA10", "Anna", dec!(10)).unwrap();
        core.settle_order(&SettlementEvent {
            order_id: "O1".into(), order_total: Money::sek(dec!(1000)), referral_code: Some("ANNA10".into()), grant_product_title: None,
        }).unwrap();
        let uri = format!("/api/v1/affiliates/{}/payouts", affiliate.id);
        let (_, first) = call(&app, Method::POST, &uri, Some(json!({"amount": "30", "payout_type": "cash"}))).await;
        let (_, second) = call(&app, Method::POST, &uri, Some(json!({"amount": "20", "payout_type": "cash"}))).await;

        let reject = format!("/api/v1/admin/payouts/{}/reject", first["id"].as_str().unwrap());
        let (status, rejected) = call(&app, Method::POST, &reject, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(rejected["status"], "rejected");
        assert_eq!(rejected["note"], Value::Null);
        let (status, err) = call(&app, Method::POST, &reject, None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(err["error"], "invalid_transition");

        let reject = format!("/api/v1/admin/payouts/{}/reject", second["id"].as_str().unwrap());
        let (status, rejected) = call(&app, Method::POST, &reject, Some(json!({"note": "duplicate"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(rejected["note"], "duplicate");

        let (_, balance) = call(&app, Method::GET, &format!("/api/v1/affiliates/{}/balance", affiliate.id), None).await;
        assert_eq!(amount(&balance["pending"]), dec!(100));
        assert_eq!(amount(&balance["reserved"]), dec!(0));
    }

    #[tokio::test]
    async fn test_grant_consumption_and_quota() {
        let (app, core) = app();
        let grant = core.enroll_influencer("LISA", "Lisa", 1, None).unwrap();
        let uri = format!("/api/v1/influencers/{}/grants/consume", grant.influencer_id);
        let (status, _) = call(&app, Method::POST, &uri, Some(json!({"product_title": "Serum"}))).await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, err) = call(&app, Method::POST, &uri, Some(json!({"product_title": "Cream"}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(err["error"], "quota_exhausted");

        let quota_uri = format!("/api/v1/admin/influencers/{}/quota", grant.influencer_id);
        let (status, view) = call(&app, Method::POST, &quota_uri, Some(json!({"additional": 2}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["remaining"], 2);
    }

    #[tokio::test]
    async fn test_unknown_resources() {
        let (app, _) = app();
        let (status, body) = call(&app, Method::GET, "/api/v1/affiliates/nope/balance", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
        let (_, resolution) = call(&app, Method::GET, "/api/v1/referrals/GHOST", None).await;
        assert_eq!(resolution["status"], "not_found");
        let (status, _) = call(&app, Method::POST, "/api/v1/admin/catalog/reload", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_application_review() {
        let (app, _) = app();
        let body = json!({"name": "Anna", "email": "anna@example.com", "requested_code": "anna10"});
        let (status, application) = call(&app, Method::POST, "/api/v1/affiliate-applications", Some(body)).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = application["id"].as_str().unwrap().to_string();

        let bad = json!({"name": "Bo", "email": "not-an-email", "requested_code": "BO"});
        let (status, _) = call(&app, Method::POST, "/api/v1/affiliate-applications", Some(bad)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let uri = format!("/api/v1/admin/affiliate-applications/{id}/approve");
        let (status, approved) = call(&app, Method::POST, &uri, Some(json!({"commission_percent": "12"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(approved["affiliate"]["code"], "ANNA10");
        let (_, pending) = call(&app, Method::GET, "/api/v1/admin/affiliate-applications?status=pending", None).await;
        assert_eq!(pending.as_array().unwrap().len(), 0);
    }
}
