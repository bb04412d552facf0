use crate::{
    captcha::{CaptchaAttempt, CaptchaVerifier},
    config::AppConfig,
    gate::ConcurrencyGate,
    idempotency::{IdempotencyGuard, SubmissionKey},
    jobs::{AuditQueue, JobInfo},
    models::{AcceptedResponse, ApiError, AuditRequest, AuditSubmission, HashPiiRequest, HashPiiResponse},
    pipeline::AuditPipeline,
    rate_limit::{FixedWindowLimiter, RateDecision, email_key, ip_key},
};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{ConnectInfo, FromRequestParts, Path, State},
    http::{HeaderMap, StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use metrics_exporter_prometheus::PrometheusHandle;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::{collections::BTreeMap, convert::Infallible, net::SocketAddr, sync::Arc};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

static EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email regex"));

/// Shared service context, built once in `main` and cloned into handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub ip_limiter: FixedWindowLimiter,
    pub email_limiter: FixedWindowLimiter,
    pub idempotency: IdempotencyGuard,
    pub captcha: Arc<dyn CaptchaVerifier>,
    pub pipeline: AuditPipeline,
    pub gate: ConcurrencyGate,
    pub queue: AuditQueue,
    pub openapi: Arc<serde_json::Value>,
    pub prometheus_handle: Option<PrometheusHandle>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/api/audit", post(submit_audit))
        .route("/api/audit/jobs/{id}", get(get_job_status))
        .route("/api/hash-pii", post(hash_pii))
        .with_state(state)
}

/// Socket peer when the server was started with connect info.
pub struct PeerAddr(pub Option<SocketAddr>);

impl<S: Send + Sync> FromRequestParts<S> for PeerAddr {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(PeerAddr(
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| info.0),
        ))
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(&'static str),
    #[error("captcha_failed")]
    Captcha,
    #[error("rate_limited")]
    RateLimited(RateDecision),
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("not_found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Captcha => StatusCode::FORBIDDEN,
            AppError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
        };
        let payload = match &self {
            AppError::Unavailable(detail) => ApiError {
                error: "unavailable".into(),
                detail: Some(detail.clone()),
            },
            other => ApiError {
                error: other.to_string(),
                detail: None,
            },
        };
        let mut response = (status, Json(payload)).into_response();
        if let AppError::RateLimited(decision) = &self {
            decision.apply_headers(response.headers_mut());
        }
        response
    }
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "audit-agent-rs",
        "gate": {
            "max": state.gate.max(),
            "in_flight": state.gate.in_flight(),
            "waiting": state.gate.waiting(),
        },
    }))
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(secret) = &state.config.metrics_key
        && presented(&headers, "X-Metrics-Key") != secret.as_str()
    {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    let body = state
        .prometheus_handle
        .as_ref()
        .map(PrometheusHandle::render)
        .unwrap_or_default();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response()
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    if let Some(key) = &state.config.docs_key
        && presented(&headers, "X-Docs-Key") != key.as_str()
    {
        return Err(AppError::Unauthorized);
    }
    Ok(Json((*state.openapi).clone()))
}

fn presented<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

/// Accept a lead-form submission and hand it to the background pipeline.
///
/// - Method: `POST`
/// - Path: `/api/audit`
/// - Body: `{name, email, phone?, url, turnstileToken?}`
/// - Response: `202` received or duplicate; `400`, `403`, `429` otherwise
async fn submit_audit(
    State(state): State<AppState>,
    PeerAddr(peer): PeerAddr,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    crate::metrics::inc_requests("/api/audit");
    let ip = ip_key(&headers, peer);
    let ip_decision = state.ip_limiter.check(&ip).await;
    if !ip_decision.allowed {
        return Err(reject_rate_limited(&state, state.ip_limiter.name(), &ip, ip_decision));
    }

    let request = match parse_request(&body, &state.config.allowed_hosts) {
        Ok(request) => request,
        Err(err) => {
            crate::metrics::inc_outcome("invalid");
            return Err(err);
        }
    };
    let email = email_key(Some(request.email.as_str()));
    let email_decision = state.email_limiter.check(&email).await;
    if !email_decision.allowed {
        return Err(reject_rate_limited(&state, state.email_limiter.name(), &email, email_decision));
    }

    let client_ip = ip.strip_prefix("ip:").filter(|v| *v != "unknown");
    let attempt = CaptchaAttempt {
        token: request.turnstile_token.as_deref(),
        client_ip,
        user_agent: headers.get(header::USER_AGENT).and_then(|v| v.to_str().ok()),
    };
    if !state.captcha.verify(&attempt).await {
        crate::metrics::inc_outcome("captcha_failed");
        return Err(AppError::Captcha);
    }

    let key = SubmissionKey::derive(&headers, &body);
    if state.idempotency.check_and_mark(&key).await {
        crate::metrics::inc_outcome("duplicate");
        info!(target = "audit.api", key = %key, "duplicate submission");
        return Ok(accepted(&ip_decision, AcceptedResponse::duplicate()));
    }

    let submission = AuditSubmission {
        submission_id: Uuid::new_v4(),
        name: request.name,
        email: request.email,
        phone: request.phone,
        url: request.url,
        received_at: Utc::now(),
    };
    let tracked = submission.clone();
    let id = match state.queue.enqueue(submission).await {
        Ok(id) => id,
        Err(err) => {
            state.idempotency.forget(&key).await;
            return Err(AppError::Unavailable(err.to_string()));
        }
    };
    state.pipeline.track_detached(
        "captcha_ok",
        None,
        Some(json!({ "email": tracked.email })),
    );
    state.pipeline.track_detached("form_received", Some(tracked), None);
    crate::metrics::inc_outcome("received");
    info!(target = "audit.api", submission_id = %id, key = %key, "submission accepted");
    Ok(accepted(&ip_decision, AcceptedResponse::received(id)))
}

fn reject_rate_limited(
    state: &AppState,
    limiter: &'static str,
    key: &str,
    decision: RateDecision,
) -> AppError {
    crate::metrics::inc_outcome("rate_limited");
    warn!(target = "audit.api", limiter, key, "rate limited");
    state.pipeline.track_detached(
        "rate_limited",
        None,
        Some(json!({ "limiter": limiter, "key": key })),
    );
    AppError::RateLimited(decision)
}

fn accepted(decision: &RateDecision, body: AcceptedResponse) -> Response {
    let mut response = (StatusCode::ACCEPTED, Json(body)).into_response();
    decision.apply_headers(response.headers_mut());
    response
}

fn parse_request(body: &[u8], allowed_hosts: &[String]) -> Result<AuditRequest, AppError> {
    let mut request: AuditRequest =
        serde_json::from_slice(body).map_err(|_| AppError::Validation("invalid JSON body"))?;
    request.name = request.name.trim().to_string();
    request.email = request.email.trim().to_string();
    request.url = request.url.trim().to_string();

    if request.name.is_empty() || request.email.is_empty() || request.url.is_empty() {
        return Err(AppError::Validation("name, email and url required"));
    }
    if !EMAIL.is_match(&request.email) {
        return Err(AppError::Validation("invalid email format"));
    }
    if !is_supported_url(&request.url, allowed_hosts) {
        return Err(AppError::Validation("invalid or unsupported URL"));
    }
    Ok(request)
}

/// http(s) URL whose host is an allow-listed domain or one of its subdomains.
fn is_supported_url(raw: &str, allowed_hosts: &[String]) -> bool {
    let Ok(url) = reqwest::Url::parse(raw) else {
        return false;
    };
    if !matches!(url.scheme(), "http" | "https") {
        return false;
    }
    let Some(host) = url.host_str().map(str::to_ascii_lowercase) else {
        return false;
    };
    allowed_hosts.iter().any(|domain| {
        host == *domain
            || host
                .strip_suffix(domain.as_str())
                .is_some_and(|prefix| prefix.ends_with('.'))
    })
}

async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobInfo>, AppError> {
    let Ok(uuid) = Uuid::parse_str(&id) else {
        return Err(AppError::Validation("invalid_job_id"));
    };
    state.queue.get(uuid).await.map(Json).ok_or(AppError::NotFound)
}

fn sha256_norm(value: &str) -> String {
    hex::encode(Sha256::digest(value.trim().to_lowercase().as_bytes()))
}

/// Hashes PII fields for ad-platform conversion APIs.
///
/// - Method: `POST`
/// - Path: `/api/hash-pii`
/// - Body: `{email?, phone?, firstName?, lastName?}`
async fn hash_pii(Json(request): Json<HashPiiRequest>) -> Json<HashPiiResponse> {
    crate::metrics::inc_requests("/api/hash-pii");
    let fields = [
        ("em", request.email),
        ("ph", request.phone),
        ("fn", request.first_name),
        ("ln", request.last_name),
    ];
    let hashed: BTreeMap<&'static str, String> = fields
        .into_iter()
        .filter_map(|(key, value)| {
            value
                .filter(|v| !v.trim().is_empty())
                .map(|v| (key, sha256_norm(&v)))
        })
        .collect();
    Json(HashPiiResponse { ok: true, hashed })
}
