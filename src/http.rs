use crate::config::parse_env;
use reqwest::Client;
use std::time::Duration;

pub const USER_AGENT: &str = "Hospitri-Audit-Agent/1.0";

/// Shared outbound client. Per-call timeouts override the default.
pub fn build_client() -> Client {
    let timeout = parse_env::<u64>("HTTP_TIMEOUT_SECS").unwrap_or(20);
    let connect = parse_env::<u64>("HTTP_CONNECT_TIMEOUT_SECS").unwrap_or(5);
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(Duration::from_secs(timeout))
        .connect_timeout(Duration::from_secs(connect))
        .build()
        .unwrap_or_else(|_| Client::new())
}
