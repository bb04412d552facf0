use std::{env, time::Duration};
use tracing::info;

/// Process-wide settings, read once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub body_limit: usize,
    pub max_concurrency: usize,
    pub gate_acquire_timeout: Option<Duration>,
    pub ip_limit: LimitPolicy,
    pub email_limit: LimitPolicy,
    pub idempotency_ttl: Duration,
    pub redis_url: Option<String>,
    pub captcha: CaptchaConfig,
    pub allowed_hosts: Vec<String>,
    pub metrics_key: Option<String>,
    pub docs_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitPolicy {
    pub max: u32,
    pub window: Duration,
}

#[derive(Debug, Clone)]
pub struct CaptchaConfig {
    pub enabled: bool,
    pub secret: Option<String>,
    pub bypass: bool,
    pub trusted_agents: Vec<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let config = Self {
            port: parse_env("PORT").unwrap_or(8000),
            body_limit: parse_env::<usize>("REQUEST_MAX_BYTES")
                .filter(|v| *v > 0)
                .unwrap_or(256 * 1024),
            max_concurrency: parse_env::<usize>("GLOBAL_MAX_CONCURRENCY")
                .filter(|v| *v > 0)
                .unwrap_or(3),
            gate_acquire_timeout: parse_env::<u64>("GATE_ACQUIRE_TIMEOUT_SECS")
                .filter(|v| *v > 0)
                .map(Duration::from_secs),
            ip_limit: LimitPolicy {
                max: parse_env("RATE_LIMIT_IP_MAX").unwrap_or(12),
                window: secs_or("RATE_LIMIT_IP_WINDOW_SECS", 10 * 60),
            },
            email_limit: LimitPolicy {
                max: parse_env("RATE_LIMIT_EMAIL_MAX").unwrap_or(10),
                window: secs_or("RATE_LIMIT_EMAIL_WINDOW_SECS", 24 * 60 * 60),
            },
            idempotency_ttl: secs_or("IDEMPOTENCY_TTL_SECS", 10 * 60),
            redis_url: non_empty("REDIS_URL"),
            captcha: CaptchaConfig {
                enabled: parse_env_bool("TURNSTILE_ENABLED"),
                secret: non_empty("TURNSTILE_SECRET_KEY"),
                bypass: parse_env_bool("CAPTCHA_BYPASS"),
                trusted_agents: list_or("CAPTCHA_TRUSTED_AGENTS", &["Framer"]),
            },
            allowed_hosts: list_or(
                "AUDIT_ALLOWED_HOSTS",
                &["airbnb.com", "booking.com", "vrbo.com"],
            ),
            metrics_key: non_empty("METRICS_KEY"),
            docs_key: non_empty("OPENAPI_KEY"),
        };
        info!(
            target = "audit.config",
            max_concurrency = config.max_concurrency,
            ip_max = config.ip_limit.max,
            email_max = config.email_limit.max,
            ttl_secs = config.idempotency_ttl.as_secs(),
            captcha_enabled = config.captcha.enabled,
            "configuration loaded"
        );
        config
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            body_limit: 256 * 1024,
            max_concurrency: 3,
            gate_acquire_timeout: None,
            ip_limit: LimitPolicy {
                max: 12,
                window: Duration::from_secs(10 * 60),
            },
            email_limit: LimitPolicy {
                max: 10,
                window: Duration::from_secs(24 * 60 * 60),
            },
            idempotency_ttl: Duration::from_secs(10 * 60),
            redis_url: None,
            captcha: CaptchaConfig {
                enabled: false,
                secret: None,
                bypass: false,
                trusted_agents: vec!["Framer".to_string()],
            },
            allowed_hosts: vec![
                "airbnb.com".to_string(),
                "booking.com".to_string(),
                "vrbo.com".to_string(),
            ],
            metrics_key: None,
            docs_key: None,
        }
    }
}

pub fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse::<T>().ok())
}

pub fn parse_env_bool(name: &str) -> bool {
    env::var(name)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

pub fn non_empty(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn secs_or(name: &str, default: u64) -> Duration {
    Duration::from_secs(
        parse_env::<u64>(name)
            .filter(|v| *v > 0)
            .unwrap_or(default),
    )
}

fn list_or(name: &str, default: &[&str]) -> Vec<String> {
    let parsed = non_empty(name)
        .map(|raw| {
            raw.split(',')
                .map(|item| item.trim().to_ascii_lowercase())
                .filter(|item| !item.is_empty())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    if parsed.is_empty() {
        default.iter().map(|s| s.to_string()).collect()
    } else {
        parsed
    }
}
