use std::sync::Arc;

use alloy_primitives::Address;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use escrow_core::enums::{PaymentStatus, Stage};
use escrow_core::ids::{JobId, TxHash};
use escrow_core::pricing::{format_fixed, parse_usd, USD_DECIMALS};
use orchestrator::OrchestratorError;
use reconciler::{ReconcileError, ReconcileOutcome};
use serde::{Deserialize, Serialize};

use crate::service::{PostJob, ServiceError};
use crate::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/post-job", post(post_job))
        .route("/complete-job", post(complete_job))
        .route("/cancel-job", post(cancel_job))
        .route("/job-status", get(job_status))
        .route("/job-details", get(job_details))
        .route("/confirm-deposit", post(confirm_deposit))
        .route("/confirm-release", post(confirm_release))
        .route("/confirm-refund", post(confirm_refund))
        .route("/eth-price", get(eth_price))
        .with_state(state)
}

type ApiError = (StatusCode, String);

async fn health() -> &'static str {
    "OK"
}

#[derive(Deserialize)]
pub struct PostJobRequest {
    pub job_id: u64,
    pub freelancer_address: String,
    /// Decimal dollars, e.g. `"1000"` or `"249.99"`.
    pub usd_amount: String,
    pub client_address: String,
}

#[derive(Deserialize)]
pub struct JobQuery {
    pub job_id: u64,
}

#[derive(Serialize, Deserialize)]
pub struct TransactionResponse {
    pub tx_hash: String,
    pub block_number: u64,
    pub gas_used: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: u64,
    pub client_address: String,
    pub freelancer_address: String,
    pub usd_amount: String,
    pub payment_status: PaymentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash_deposit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash_release: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash_refund: Option<String>,
    /// Unix seconds; the mirror's view is only as fresh as this.
    pub updated_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub divergence: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct JobDetailsResponse {
    pub job_id: u64,
    pub exists: bool,
    pub client_address: String,
    pub freelancer_address: String,
    pub usd_amount: String,
    /// Wei, decimal.
    pub eth_amount: String,
    pub is_completed: bool,
    pub is_paid: bool,
}

#[derive(Serialize)]
pub struct ConfirmResponse {
    pub success: bool,
    pub payment_status: PaymentStatus,
    pub reconcile: ReconcileOutcome,
}

#[derive(Serialize, Deserialize)]
pub struct EthPriceResponse {
    pub eth_usd_price: String,
}

async fn post_job(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PostJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let payee = parse_address("freelancer_address", &req.freelancer_address)?;
    let payer = parse_address("client_address", &req.client_address)?;
    let usd_amount = parse_usd(&req.usd_amount)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid usd_amount: {e}")))?;

    let outcome = state
        .service
        .post_job(PostJob {
            job_id: JobId(req.job_id),
            payee,
            usd_amount,
            payer,
        })
        .await
        .map_err(into_response)?;

    Ok(Json(TransactionResponse::from(outcome)))
}

async fn complete_job(
    State(state): State<Arc<AppState>>,
    Query(q): Query<JobQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state
        .service
        .complete_job(JobId(q.job_id))
        .await
        .map_err(into_response)?;
    Ok(Json(TransactionResponse::from(outcome)))
}

async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Query(q): Query<JobQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state
        .service
        .cancel_job(JobId(q.job_id))
        .await
        .map_err(into_response)?;
    Ok(Json(TransactionResponse::from(outcome)))
}

async fn job_status(
    State(state): State<Arc<AppState>>,
    Query(q): Query<JobQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state
        .service
        .job_status(JobId(q.job_id))
        .await
        .map_err(into_response)?;

    let hex = |h: Option<TxHash>| h.map(|h| h.to_string());
    Ok(Json(JobStatusResponse {
        job_id: record.job_id.0,
        client_address: record.payer.to_string(),
        freelancer_address: record.payee.to_string(),
        usd_amount: format_fixed(record.usd_amount, USD_DECIMALS),
        payment_status: record.payment_status,
        tx_hash_deposit: hex(record.tx_hash_deposit),
        tx_hash_release: hex(record.tx_hash_release),
        tx_hash_refund: hex(record.tx_hash_refund),
        updated_at: record.updated_at,
        divergence: record.divergence,
    }))
}

async fn job_details(
    State(state): State<Arc<AppState>>,
    Query(q): Query<JobQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .service
        .job_details(JobId(q.job_id))
        .await
        .map_err(into_response)?;

    Ok(Json(JobDetailsResponse {
        job_id: q.job_id,
        exists: !job.is_absent(),
        client_address: job.payer.to_string(),
        freelancer_address: job.payee.to_string(),
        usd_amount: format_fixed(job.usd_amount, USD_DECIMALS),
        eth_amount: job.native_amount.to_string(),
        is_completed: job.is_completed,
        is_paid: job.is_paid,
    }))
}

async fn confirm_deposit(
    state: State<Arc<AppState>>,
    query: Query<JobQuery>,
) -> Result<impl IntoResponse, ApiError> {
    confirm(state, query, Stage::Deposit).await
}

async fn confirm_release(
    state: State<Arc<AppState>>,
    query: Query<JobQuery>,
) -> Result<impl IntoResponse, ApiError> {
    confirm(state, query, Stage::Release).await
}

async fn confirm_refund(
    state: State<Arc<AppState>>,
    query: Query<JobQuery>,
) -> Result<impl IntoResponse, ApiError> {
    confirm(state, query, Stage::Refund).await
}

async fn confirm(
    State(state): State<Arc<AppState>>,
    Query(q): Query<JobQuery>,
    stage: Stage,
) -> Result<Json<ConfirmResponse>, ApiError> {
    let (record, outcome) = state
        .service
        .confirm(JobId(q.job_id), stage)
        .await
        .map_err(into_response)?;

    Ok(Json(ConfirmResponse {
        success: record.payment_status == stage.confirmed(),
        payment_status: record.payment_status,
        reconcile: outcome,
    }))
}

async fn eth_price(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let round = state.service.eth_price().await.map_err(into_response)?;
    let price = round
        .usd_price()
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;

    Ok(Json(EthPriceResponse {
        eth_usd_price: format_fixed(price, USD_DECIMALS),
    }))
}

impl From<orchestrator::TxOutcome> for TransactionResponse {
    fn from(outcome: orchestrator::TxOutcome) -> Self {
        Self {
            tx_hash: outcome.tx_hash.to_string(),
            block_number: outcome.block_number,
            gas_used: outcome.gas_used,
            success: outcome.success,
            error: outcome.error,
        }
    }
}

fn parse_address(field: &str, value: &str) -> Result<Address, ApiError> {
    value
        .trim()
        .parse::<Address>()
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid {field}: {e}")))
}

fn into_response(err: ServiceError) -> ApiError {
    let status = match &err {
        ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
        ServiceError::Conflict(_) => StatusCode::CONFLICT,
        ServiceError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        ServiceError::Orchestrator(e) | ServiceError::Reconcile(ReconcileError::Ledger(e)) => {
            orchestrator_status(e)
        }
        ServiceError::Reconcile(ReconcileError::UnknownJob(_)) => StatusCode::NOT_FOUND,
        ServiceError::Reconcile(ReconcileError::Store(_)) => StatusCode::SERVICE_UNAVAILABLE,
        ServiceError::Reconcile(_) => StatusCode::CONFLICT,
    };

    let message = match &err {
        ServiceError::Orchestrator(e) => match e.broadcast_hash() {
            Some(hash) => format!("{e}; tx {hash} was broadcast, check /job-status later"),
            None => e.to_string(),
        },
        other => other.to_string(),
    };

    if status.is_server_error() {
        tracing::warn!(%status, error = %message, "request failed");
    }
    (status, message)
}

fn orchestrator_status(err: &OrchestratorError) -> StatusCode {
    match err {
        OrchestratorError::Validation(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::Rejected(_) => StatusCode::CONFLICT,
        OrchestratorError::Timeout { .. } | OrchestratorError::ReadTimeout { .. } => {
            StatusCode::GATEWAY_TIMEOUT
        }
        OrchestratorError::PriceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        OrchestratorError::Confirmation { .. } | OrchestratorError::Chain(_) => StatusCode::BAD_GATEWAY,
    }
}
