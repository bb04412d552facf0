use crate::config::CaptchaConfig;
use crate::http::build_client;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

const SITEVERIFY_URL: &str = "https://challenges.cloudflare.com/turnstile/v0/siteverify";

#[derive(Debug, Clone, Copy, Default)]
pub struct CaptchaAttempt<'a> {
    pub token: Option<&'a str>,
    pub client_ip: Option<&'a str>,
    pub user_agent: Option<&'a str>,
}

/// Gates acceptance of a submission. Never errors: every failure is `false`.
#[async_trait]
pub trait CaptchaVerifier: Send + Sync {
    async fn verify(&self, attempt: &CaptchaAttempt<'_>) -> bool;
}

#[derive(Debug, Error)]
pub enum CaptchaError {
    #[error("missing token")]
    MissingToken,
    #[error("TURNSTILE_SECRET_KEY missing")]
    MissingSecret,
    #[error("siteverify request failed: {0}")]
    Request(String),
    #[error("rejected: {0:?}")]
    Rejected(Vec<String>),
}

pub struct TurnstileVerifier {
    config: CaptchaConfig,
    endpoint: String,
    http: Client,
}

#[derive(Debug, Deserialize)]
struct SiteverifyResponse {
    #[serde(default)]
    success: bool,
    #[serde(default, rename = "error-codes")]
    error_codes: Vec<String>,
}

impl TurnstileVerifier {
    pub fn new(config: CaptchaConfig) -> Self {
        Self {
            config,
            endpoint: SITEVERIFY_URL.to_string(),
            http: build_client(),
        }
    }

    #[cfg(test)]
    fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.to_string();
        self
    }

    fn bypassed(&self, user_agent: Option<&str>) -> bool {
        if self.config.bypass {
            return true;
        }
        let Some(agent) = user_agent.map(str::to_ascii_lowercase) else {
            return false;
        };
        self.config
            .trusted_agents
            .iter()
            .any(|trusted| !trusted.is_empty() && agent.contains(&trusted.to_ascii_lowercase()))
    }

    async fn siteverify(&self, attempt: &CaptchaAttempt<'_>) -> Result<(), CaptchaError> {
        let token = attempt
            .token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(CaptchaError::MissingToken)?;
        let secret = self
            .config
            .secret
            .as_deref()
            .ok_or(CaptchaError::MissingSecret)?;

        let params = [
            ("secret", secret),
            ("response", token),
            ("remoteip", attempt.client_ip.unwrap_or("")),
        ];
        let response = self
            .http
            .post(&self.endpoint)
            .timeout(Duration::from_secs(8))
            .form(&params)
            .send()
            .await
            .map_err(|err| CaptchaError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(CaptchaError::Request(format!("HTTP {}", response.status())));
        }
        let payload: SiteverifyResponse = response
            .json()
            .await
            .map_err(|err| CaptchaError::Request(err.to_string()))?;
        if payload.success {
            Ok(())
        } else {
            Err(CaptchaError::Rejected(payload.error_codes))
        }
    }
}

#[async_trait]
impl CaptchaVerifier for TurnstileVerifier {
    async fn verify(&self, attempt: &CaptchaAttempt<'_>) -> bool {
        if !self.config.enabled {
            return true;
        }
        if self.bypassed(attempt.user_agent) {
            debug!(target = "audit.captcha", "captcha bypassed for trusted caller");
            return true;
        }
        match self.siteverify(attempt).await {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    target = "audit.captcha",
                    client_ip = attempt.client_ip.unwrap_or("unknown"),
                    error = %err,
                    "captcha verification failed"
                );
                false
            }
        }
    }
}
