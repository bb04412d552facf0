mod api;
mod attio;
mod captcha;
mod config;
mod gate;
mod http;
mod idempotency;
mod jobs;
mod llm;
mod mailer;
mod metrics;
mod models;
mod pdf;
mod pipeline;
mod rate_limit;
mod scrape;
mod slack;
mod supabase;

use api::{AppState, build_router};
use config::AppConfig;
use eyre::WrapErr;
use gate::ConcurrencyGate;
use idempotency::IdempotencyGuard;
use jobs::AuditQueue;
use metrics_exporter_prometheus::PrometheusBuilder;
use pipeline::{AuditPipeline, Collaborators};
use rate_limit::FixedWindowLimiter;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

const JANITOR_INTERVAL: Duration = Duration::from_secs(60);
const JOB_RETENTION: Duration = Duration::from_secs(60 * 60);

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    init_tracing();
    if let Err(err) = run().await {
        error!(target = "audit.api", "server crashed: {err:?}");
        std::process::exit(1);
    }
}

async fn run() -> eyre::Result<()> {
    let config = AppConfig::from_env();

    let prometheus_handle = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(err) => {
            warn!(target = "audit.metrics", error = %err, "prometheus recorder unavailable");
            None
        }
    };
    let redis = match &config.redis_url {
        Some(url) => Some(redis::Client::open(url.as_str()).wrap_err("invalid REDIS_URL")?),
        None => None,
    };
    let openapi: serde_json::Value = serde_yaml::from_str(include_str!("../docs/openapi.yaml"))
        .unwrap_or(serde_json::json!({"openapi":"3.0.3"}));

    let pipeline = AuditPipeline::new(Collaborators {
        scraper: Arc::new(scrape::HttpScraper::new()),
        grader: Arc::new(llm::LlmGrader::new(llm::LlmClient::new(
            llm::LlmConfig::from_env(),
        ))),
        renderer: Arc::new(pdf::HttpPdfRenderer::from_env()),
        mailer: Arc::new(mailer::MailerSend::from_env()),
        store: Arc::new(supabase::SupabaseStore::from_env()),
        crm: Arc::new(attio::AttioClient::from_env()),
        notifier: Arc::new(slack::SlackNotifier::from_env()),
    });
    let gate = ConcurrencyGate::new(config.max_concurrency);
    let (queue, _dispatcher) =
        AuditQueue::spawn(pipeline.clone(), gate.clone(), config.gate_acquire_timeout);

    let state = AppState {
        ip_limiter: FixedWindowLimiter::new("ip", config.ip_limit),
        email_limiter: FixedWindowLimiter::new("email", config.email_limit),
        idempotency: IdempotencyGuard::new(config.idempotency_ttl).with_redis(redis),
        captcha: Arc::new(captcha::TurnstileVerifier::new(config.captcha.clone())),
        pipeline,
        gate,
        queue,
        openapi: Arc::new(openapi),
        prometheus_handle,
        config: Arc::new(config.clone()),
    };
    spawn_janitor(state.clone());

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);
    let app = build_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(config.body_limit));

    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    info!(target = "audit.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("failed to bind {addr}"))?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .wrap_err("server error")?;
    Ok(())
}

/// Periodically drops expired limiter buckets, seen keys and finished jobs.
fn spawn_janitor(state: AppState) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(JANITOR_INTERVAL);
        loop {
            ticker.tick().await;
            let ip = state.ip_limiter.sweep().await;
            let email = state.email_limiter.sweep().await;
            let seen = state.idempotency.sweep().await;
            let jobs = state.queue.sweep(JOB_RETENTION).await;
            debug!(target = "audit.janitor", ip, email, seen, jobs, "sweep complete");
        }
    });
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
