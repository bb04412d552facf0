use crate::config::non_empty;
use crate::http::build_client;
use crate::models::AuditSubmission;
use crate::pipeline::{Notifier, NotifyError};
use async_trait::async_trait;
use chrono::SecondsFormat;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

const POST_MESSAGE_URL: &str = "https://slack.com/api/chat.postMessage";

/// Posts a lead card to the audit channel via `chat.postMessage`.
pub struct SlackNotifier {
    token: Option<String>,
    channel: Option<String>,
    http: Client,
}

#[derive(Debug, Deserialize)]
struct SlackResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    ts: Option<String>,
}

impl SlackNotifier {
    pub fn from_env() -> Self {
        Self {
            token: non_empty("SLACK_BOT_TOKEN"),
            channel: non_empty("SLACK_AUDIT_CHANNEL"),
            http: build_client(),
        }
    }
}

fn activity_url(crm_url: &str) -> String {
    let base = crm_url.trim_end_matches('/');
    if base.ends_with("/activity") {
        base.to_string()
    } else {
        format!("{base}/activity")
    }
}

pub fn audit_blocks(submission: &AuditSubmission, crm_url: Option<&str>) -> Vec<Value> {
    let when = submission
        .received_at
        .to_rfc3339_opts(SecondsFormat::Secs, true);
    let phone = submission.phone.as_deref().unwrap_or("n/a");
    let mut blocks = vec![
        json!({
            "type": "header",
            "text": { "type": "plain_text", "text": "🎉 New audit lead!", "emoji": true },
        }),
        json!({
            "type": "section",
            "text": {
                "type": "mrkdwn",
                "text": format!("*{}* just requested a listing audit.", submission.name),
            },
        }),
        json!({
            "type": "section",
            "fields": [
                { "type": "mrkdwn", "text": format!("*Email:*\n{}", submission.email) },
                { "type": "mrkdwn", "text": format!("*Phone:*\n{phone}") },
                { "type": "mrkdwn", "text": format!("*Listing:*\n<{}>", submission.url) },
                { "type": "mrkdwn", "text": format!("*Received:*\n{when}") },
            ],
        }),
    ];
    if let Some(url) = crm_url {
        blocks.push(json!({
            "type": "actions",
            "elements": [{
                "type": "button",
                "text": { "type": "plain_text", "text": "View in Attio" },
                "url": activity_url(url),
            }],
        }));
    }
    blocks
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn audit_lead(
        &self,
        submission: &AuditSubmission,
        crm_url: Option<&str>,
    ) -> Result<(), NotifyError> {
        let (Some(token), Some(channel)) = (&self.token, &self.channel) else {
            debug!(target = "audit.notify", "slack not configured; skipping");
            return Ok(());
        };
        let body = json!({
            "channel": channel,
            "text": format!("New audit lead: {}", submission.email),
            "blocks": audit_blocks(submission, crm_url),
        });
        let response: SlackResponse = self
            .http
            .post(POST_MESSAGE_URL)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|err| NotifyError::Api(err.to_string()))?
            .json()
            .await
            .map_err(|err| NotifyError::Api(err.to_string()))?;
        if !response.ok {
            return Err(NotifyError::Api(
                response.error.unwrap_or_else(|| "unknown_error".into()),
            ));
        }
        info!(
            target = "audit.notify",
            submission_id = %submission.submission_id,
            ts = response.ts.as_deref().unwrap_or(""),
            "lead posted"
        );
        Ok(())
    }
}
