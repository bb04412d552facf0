use crate::config::non_empty;
use crate::http::build_client;
use crate::pipeline::{DeliveryError, EmailContent, Mailer};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use reqwest::Client;
use serde_json::{Value, json};
use std::{path::Path, time::Duration};

const MAILERSEND_URL: &str = "https://api.mailersend.com/v1/email";

pub struct MailerSend {
    api_key: Option<String>,
    from: Option<String>,
    template_id: Option<String>,
    http: Client,
}

impl MailerSend {
    pub fn from_env() -> Self {
        Self {
            api_key: non_empty("MAILERSEND_API_KEY"),
            from: non_empty("MAILERSEND_FROM"),
            template_id: non_empty("MAILERSEND_TEMPLATE_ID"),
            http: build_client(),
        }
    }
}

/// With a template the variables drive the body; otherwise subject/html do.
fn build_payload(
    from: &str,
    to: &str,
    template_id: Option<&str>,
    content: &EmailContent,
    attachment_b64: String,
    filename: &str,
) -> Value {
    let mut payload = json!({
        "from": { "email": from },
        "to": [{ "email": to }],
        "subject": content.subject,
        "attachments": [{ "content": attachment_b64, "filename": filename }],
    });
    match template_id {
        Some(id) => {
            payload["template_id"] = json!(id);
            payload["personalization"] = json!([{
                "email": to,
                "data": content.variables,
            }]);
        }
        None => payload["html"] = json!(content.html),
    }
    payload
}

#[async_trait]
impl Mailer for MailerSend {
    async fn send(
        &self,
        to: &str,
        content: &EmailContent,
        attachment: &Path,
    ) -> Result<(), DeliveryError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(DeliveryError::NotConfigured("MAILERSEND_API_KEY missing"))?;
        let from = self
            .from
            .as_deref()
            .ok_or(DeliveryError::NotConfigured("MAILERSEND_FROM missing"))?;

        let file = tokio::fs::read(attachment)
            .await
            .map_err(|err| DeliveryError::Attachment(err.to_string()))?;
        let filename = attachment
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("audit.pdf");
        let payload = build_payload(
            from,
            to,
            self.template_id.as_deref(),
            content,
            BASE64.encode(file),
            filename,
        );

        let response = self
            .http
            .post(MAILERSEND_URL)
            .bearer_auth(api_key)
            .timeout(Duration::from_secs(20))
            .json(&payload)
            .send()
            .await
            .map_err(|err| DeliveryError::Request(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError::Request(format!("HTTP {status}: {body}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn content() -> EmailContent {
        let mut variables = BTreeMap::new();
        variables.insert("name".to_string(), "Jane".to_string());
        EmailContent {
            subject: "Your audit".into(),
            html: "<p>Hi Jane</p>".into(),
            variables,
        }
    }

    #[test]
    fn html_payload_without_template() {
        let payload = build_payload("audits@h.co", "jane@x.com", None, &content(), "QUJD".into(), "audit.pdf");
        assert_eq!(payload["html"], "<p>Hi Jane</p>");
        assert!(payload.get("template_id").is_none());
        assert_eq!(payload["attachments"][0]["content"], "QUJD");
        assert_eq!(payload["to"][0]["email"], "jane@x.com");
    }

    #[test]
    fn template_payload_carries_variables() {
        let payload = build_payload("audits@h.co", "jane@x.com", Some("tpl-1"), &content(), "QUJD".into(), "audit.pdf");
        assert_eq!(payload["template_id"], "tpl-1");
        assert_eq!(payload["personalization"][0]["data"]["name"], "Jane");
        assert!(payload.get("html").is_none());
    }

    #[tokio::test]
    async fn missing_key_is_not_configured() {
        let mailer = MailerSend {
            api_key: None,
            from: Some("audits@h.co".into()),
            template_id: None,
            http: build_client(),
        };
        let err = mailer
            .send("jane@x.com", &content(), Path::new("/nonexistent.pdf"))
            .await
            .expect_err("no key");
        assert!(matches!(err, DeliveryError::NotConfigured(_)));
    }
}
