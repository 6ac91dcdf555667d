#![deny(unsafe_code)]

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use sesh_core::{
    run_with_retry, Bounty, CheckInRequest, Collection, CoreError, Currency, DocKey, Ledger,
    LedgerEntry, ReplayGuard, RetryPolicy, SettlementEngine, StoreError, SweepReport, TxStore,
    Verifier, VerifyOutcome, WalletAudit,
};
use sesh_store::StoreConfig;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub store: StoreConfig,
    pub sweep_interval: Duration,
    pub sweep_batch_limit: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::Memory,
            sweep_interval: Duration::from_secs(3600),
            sweep_batch_limit: 500,
        }
    }
}

#[derive(Clone)]
pub struct ServiceState {
    pub store: Arc<dyn TxStore>,
    pub guard: Arc<ReplayGuard>,
    pub verifier: Arc<Verifier>,
    pub ledger: Arc<Ledger>,
    pub settlement: Arc<SettlementEngine>,
}

impl ServiceState {
    pub async fn bootstrap(config: ServiceConfig) -> Result<Self, ServiceError> {
        let store = config.store.bootstrap().await?;
        let guard = Arc::new(ReplayGuard::new(store.clone()));
        let verifier = Arc::new(Verifier::with_guard(guard.clone()));
        let ledger = Arc::new(Ledger::new(store.clone()));
        let settlement = Arc::new(
            SettlementEngine::new(store.clone()).with_batch_limit(config.sweep_batch_limit),
        );

        Ok(Self {
            store,
            guard,
            verifier,
            ledger,
            settlement,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/verify/check-in", post(verify_check_in))
        .route("/v1/wallets/:user_id/balance", get(get_balance))
        .route("/v1/wallets/:user_id/audit", get(audit_wallet))
        .route("/v1/ledger/entries", get(list_ledger_entries))
        .route("/v1/bounties", post(create_bounty))
        .route("/v1/bounties/:bounty_id", get(get_bounty))
        .route("/v1/sweep/run", post(run_sweep))
        .with_state(state)
}

/// Periodic scheduler tick: sweep expired bounties, then reclaim dead replay
/// records. Failures are logged and left for the next tick.
pub fn spawn_sweeper(state: ServiceState, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match state.settlement.sweep_now().await {
                Ok(report) => info!(
                    examined = report.examined,
                    refunded = report.refunded,
                    locked = report.locked,
                    skipped = report.skipped,
                    failed = report.failed,
                    "bounty expiry sweep completed"
                ),
                Err(err) => error!(error = %err, "bounty expiry sweep failed"),
            }
            match state.guard.purge_expired(Utc::now()).await {
                Ok(purged) if purged > 0 => debug!(purged, "expired replay records reclaimed"),
                Ok(_) => {}
                Err(err) => debug!(error = %err, "replay record reclamation skipped"),
            }
        }
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{message}")]
    Http { status: StatusCode, message: String },
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::CONFLICT,
            message: message.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::Core(CoreError::Store(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Http { status, message } => (*status, message.clone()),
            ApiError::Core(CoreError::InvalidNonce(msg)) => {
                (StatusCode::BAD_REQUEST, msg.clone())
            }
            ApiError::Core(CoreError::InvalidEntry(msg)) => {
                (StatusCode::BAD_REQUEST, msg.clone())
            }
            ApiError::Core(CoreError::InvalidBounty(msg)) => {
                (StatusCode::BAD_REQUEST, msg.clone())
            }
            // Verification indeterminate: the caller must not treat this as
            // a grant, only as "try again".
            ApiError::Core(err) if err.is_retryable() => {
                (StatusCode::SERVICE_UNAVAILABLE, err.to_string())
            }
            ApiError::Core(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    store_backend: &'static str,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "sesh-service",
        store_backend: state.store.backend_label(),
    })
}

#[derive(Debug, Clone, Deserialize)]
struct VerifyCheckInRequest {
    user_id: String,
    spot_id: String,
    lat: f64,
    lng: f64,
    nonce: String,
    client_timestamp: String,
}

async fn verify_check_in(
    State(state): State<ServiceState>,
    Json(request): Json<VerifyCheckInRequest>,
) -> Result<Json<VerifyOutcome>, ApiError> {
    let check_in = CheckInRequest {
        spot_id: request.spot_id,
        lat: request.lat,
        lng: request.lng,
        nonce: request.nonce,
        client_timestamp: request.client_timestamp,
    };
    let outcome = state.verifier.verify(&request.user_id, &check_in).await?;
    Ok(Json(outcome))
}

#[derive(Debug, Clone, Serialize)]
struct BalanceResponse {
    user_id: String,
    balance: i64,
}

async fn get_balance(
    State(state): State<ServiceState>,
    Path(user_id): Path<String>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let balance = state.ledger.balance(&user_id).await?;
    Ok(Json(BalanceResponse { user_id, balance }))
}

async fn audit_wallet(
    State(state): State<ServiceState>,
    Path(user_id): Path<String>,
) -> Result<Json<WalletAudit>, ApiError> {
    Ok(Json(state.ledger.audit_user(&user_id).await?))
}

#[derive(Debug, Clone, Deserialize)]
struct LedgerEntriesQuery {
    user_id: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
struct LedgerEntriesResponse {
    total: usize,
    returned: usize,
    items: Vec<LedgerEntry>,
}

async fn list_ledger_entries(
    State(state): State<ServiceState>,
    Query(query): Query<LedgerEntriesQuery>,
) -> Result<Json<LedgerEntriesResponse>, ApiError> {
    let entries = match &query.user_id {
        Some(user_id) => state.ledger.entries_for_user(user_id).await?,
        None => state.ledger.entries().await?,
    };
    let total = entries.len();
    let limit = query.limit.unwrap_or(100);
    let items: Vec<LedgerEntry> = entries.into_iter().take(limit).collect();
    Ok(Json(LedgerEntriesResponse {
        total,
        returned: items.len(),
        items,
    }))
}

#[derive(Debug, Clone, Deserialize)]
struct CreateBountyRequest {
    id: Option<String>,
    creator_uid: Option<String>,
    reward_total: u64,
    currency: Option<Currency>,
    expires_at: DateTime<Utc>,
}

async fn create_bounty(
    State(state): State<ServiceState>,
    Json(request): Json<CreateBountyRequest>,
) -> Result<(StatusCode, Json<Bounty>), ApiError> {
    let bounty = Bounty::open(
        request.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
        request.creator_uid,
        request.reward_total,
        request.currency.unwrap_or(Currency::Credits),
        request.expires_at,
        Utc::now(),
    );
    bounty.validate()?;

    let created = run_with_retry(
        state.store.clone(),
        &RetryPolicy::default(),
        move |tx| {
            let bounty = bounty.clone();
            async move {
                let key = DocKey::new(Collection::Bounties, bounty.id.clone());
                if tx.get::<Bounty>(&key).await?.is_some() {
                    return Ok(None);
                }
                tx.put(key, &bounty)?;
                Ok(Some(bounty))
            }
            .boxed()
        },
    )
    .await?;

    match created {
        Some(bounty) => Ok((StatusCode::CREATED, Json(bounty))),
        None => Err(ApiError::conflict("bounty id already exists")),
    }
}

async fn get_bounty(
    State(state): State<ServiceState>,
    Path(bounty_id): Path<String>,
) -> Result<Json<Bounty>, ApiError> {
    let key = DocKey::new(Collection::Bounties, bounty_id.as_str());
    let doc = state
        .store
        .get(&key)
        .await
        .map_err(CoreError::from)?
        .ok_or_else(|| ApiError::not_found(format!("bounty '{bounty_id}' not found")))?;
    let bounty: Bounty = serde_json::from_value(doc.value)
        .map_err(|e| CoreError::from(StoreError::from(e)))?;
    Ok(Json(bounty))
}

/// Manual sweep trigger for ops tooling; the scheduled task uses the same
/// entry point.
async fn run_sweep(State(state): State<ServiceState>) -> Result<Json<SweepReport>, ApiError> {
    Ok(Json(state.settlement.sweep_now().await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn test_app() -> Router {
        let state = ServiceState::bootstrap(ServiceConfig::default())
            .await
            .unwrap();
        build_router(state)
    }

    fn json_post(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_store_backend() {
        let app = test_app().await;
        let response = app
            .oneshot(Request::builder().uri("/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["store_backend"], "memory");
    }

    #[tokio::test]
    async fn verify_round_trip_detects_replay() {
        let app = test_app().await;
        let payload = serde_json::json!({
            "user_id": "u1",
            "spot_id": "42",
            "lat": 37.7749,
            "lng": -122.4194,
            "nonce": "nonce-0001",
            "client_timestamp": Utc::now().to_rfc3339(),
        });

        let response = app
            .clone()
            .oneshot(json_post("/v1/verify/check-in", payload.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["ok"], true);

        let response = app
            .oneshot(json_post("/v1/verify/check-in", payload))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["ok"], false);
        assert_eq!(body["reason"], "replay_detected");
    }

    #[tokio::test]
    async fn short_nonce_is_a_bad_request() {
        let app = test_app().await;
        let payload = serde_json::json!({
            "user_id": "u1",
            "spot_id": "42",
            "lat": 37.7749,
            "lng": -122.4194,
            "nonce": "short",
            "client_timestamp": Utc::now().to_rfc3339(),
        });
        let response = app
            .oneshot(json_post("/v1/verify/check-in", payload))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn bounty_lifecycle_over_http() {
        let app = test_app().await;
        let expired = (Utc::now() - chrono::Duration::hours(2)).to_rfc3339();

        let response = app
            .clone()
            .oneshot(json_post(
                "/v1/bounties",
                serde_json::json!({
                    "id": "b1",
                    "creator_uid": "u1",
                    "reward_total": 100,
                    "expires_at": expired,
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        // Duplicate creation is refused.
        let response = app
            .clone()
            .oneshot(json_post(
                "/v1/bounties",
                serde_json::json!({
                    "id": "b1",
                    "creator_uid": "u1",
                    "reward_total": 100,
                    "expires_at": expired,
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app
            .clone()
            .oneshot(json_post("/v1/sweep/run", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let report: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(report["refunded"], 1);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/v1/wallets/u1/balance")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["balance"], 80);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/bounties/b1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "expired");
    }

    #[tokio::test]
    async fn oversized_bounty_reward_is_a_bad_request() {
        let app = test_app().await;
        let response = app
            .oneshot(json_post(
                "/v1/bounties",
                serde_json::json!({
                    "id": "b-huge",
                    "creator_uid": "u1",
                    "reward_total": u64::MAX,
                    "expires_at": (Utc::now() + chrono::Duration::hours(1)).to_rfc3339(),
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_bounty_is_not_found() {
        let app = test_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/bounties/nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
