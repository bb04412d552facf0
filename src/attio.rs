use crate::config::non_empty;
use crate::http::build_client;
use crate::models::AuditSubmission;
use crate::pipeline::{Crm, CrmError, CrmRecord};
use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
struct AttioSettings {
    base_url: String,
    api_key: String,
    classification_lead_id: Option<String>,
    source_form_id: Option<String>,
    audit_list_id: Option<String>,
    lead_status_new_id: Option<String>,
}

/// People upsert keyed on email, then membership in the audit list.
pub struct AttioClient {
    settings: Option<AttioSettings>,
    http: Client,
}

#[derive(Debug, Deserialize)]
struct UpsertResponse {
    data: UpsertData,
}

#[derive(Debug, Deserialize)]
struct UpsertData {
    id: RecordId,
    #[serde(default)]
    web_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RecordId {
    record_id: String,
}

impl AttioClient {
    pub fn from_env() -> Self {
        let settings = non_empty("ATTIO_API_KEY").map(|api_key| AttioSettings {
            base_url: non_empty("ATTIO_BASE_URL")
                .unwrap_or_else(|| "https://api.attio.com".into())
                .trim_end_matches('/')
                .to_string(),
            api_key,
            classification_lead_id: non_empty("ATTIO_CLASSIFICATION_LEAD_ID"),
            source_form_id: non_empty("ATTIO_SOURCE_WEBSITE_FORM_ID"),
            audit_list_id: non_empty("ATTIO_AUDIT_LIST_ID"),
            lead_status_new_id: non_empty("ATTIO_LEAD_STATUS_NEW_ID"),
        });
        Self {
            settings,
            http: build_client(),
        }
    }

    /// Retries 429 and 5xx with linear backoff; other failures return at once.
    async fn put(
        &self,
        settings: &AttioSettings,
        url: &str,
        query: &[(&str, &str)],
        body: &Value,
    ) -> Result<reqwest::Response, CrmError> {
        let mut last_error = String::new();
        for attempt in 0..MAX_ATTEMPTS {
            let result = self
                .http
                .put(url)
                .query(query)
                .bearer_auth(&settings.api_key)
                .header("Accept", "application/json")
                .timeout(Duration::from_secs(10))
                .json(body)
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) if retryable(response.status()) => {
                    last_error = format!("HTTP {}", response.status());
                }
                Ok(response) => {
                    return Err(CrmError::Request(format!("HTTP {}", response.status())));
                }
                Err(err) => return Err(CrmError::Request(err.to_string())),
            }
            if attempt + 1 < MAX_ATTEMPTS {
                sleep(backoff(attempt)).await;
            }
        }
        Err(CrmError::Request(last_error))
    }

    async fn add_to_audit_list(
        &self,
        settings: &AttioSettings,
        record_id: &str,
    ) -> Result<(), CrmError> {
        let Some(list_id) = &settings.audit_list_id else {
            return Ok(());
        };
        let url = format!(
            "{}/v2/lists/{}/entries",
            settings.base_url,
            urlencoding::encode(list_id)
        );
        let body = json!({
            "data": {
                "parent_record_id": record_id,
                "parent_object": "people",
                "entry_values": {
                    "lead_status": settings.lead_status_new_id.iter().collect::<Vec<_>>(),
                },
            },
        });
        self.put(settings, &url, &[], &body).await.map(|_| ())
    }
}

fn retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn backoff(attempt: u32) -> Duration {
    let jitter = rand::rng().random_range(0..100);
    Duration::from_millis(500 * u64::from(attempt + 1) + jitter)
}

/// `"Jane Q Doe"` becomes `"Doe, Jane"`; single names pass through.
pub fn format_name(name: &str) -> String {
    let parts: Vec<&str> = name.split_whitespace().collect();
    match parts.as_slice() {
        [first, .., last] => format!("{last}, {first}"),
        _ => name.trim().to_string(),
    }
}

fn person_payload(settings: &AttioSettings, submission: &AuditSubmission) -> Value {
    let mut values = json!({
        "name": format_name(&submission.name),
        "email_addresses": [submission.email.to_lowercase()],
        "source_url": "https://hospitri.com/ai-audit",
        "listing_url": submission.url,
    });
    if let Some(id) = &settings.classification_lead_id {
        values["classification"] = json!([id]);
    }
    if let Some(id) = &settings.source_form_id {
        values["source"] = json!(id);
    }
    if let Some(phone) = &submission.phone {
        values["phone_numbers"] = json!([phone]);
    }
    json!({ "data": { "values": values } })
}

#[async_trait]
impl Crm for AttioClient {
    async fn upsert_lead(
        &self,
        submission: &AuditSubmission,
    ) -> Result<Option<CrmRecord>, CrmError> {
        let Some(settings) = &self.settings else {
            warn!(target = "audit.crm", "missing ATTIO_API_KEY; skipping");
            return Ok(None);
        };
        let url = format!("{}/v2/objects/people/records", settings.base_url);
        let body = person_payload(settings, submission);
        let response = self
            .put(settings, &url, &[("matching_attribute", "email_addresses")], &body)
            .await?;
        let parsed: UpsertResponse = response
            .json()
            .await
            .map_err(|err| CrmError::Request(err.to_string()))?;

        let record = CrmRecord {
            record_id: parsed.data.id.record_id,
            web_url: parsed.data.web_url,
        };
        if let Err(err) = self.add_to_audit_list(settings, &record.record_id).await {
            warn!(target = "audit.crm", record_id = %record.record_id, error = %err, "audit list entry failed");
        }
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::fakes::submission;

    fn settings() -> AttioSettings {
        AttioSettings {
            base_url: "https://api.attio.com".into(),
            api_key: "k".into(),
            classification_lead_id: Some("cls-lead".into()),
            source_form_id: None,
            audit_list_id: None,
            lead_status_new_id: None,
        }
    }

    #[test]
    fn names_are_last_comma_first() {
        assert_eq!(format_name("Jane Doe"), "Doe, Jane");
        assert_eq!(format_name("  Jane  Q  Doe "), "Doe, Jane");
        assert_eq!(format_name("Cher"), "Cher");
        assert_eq!(format_name(""), "");
    }

    #[test]
    fn payload_lowercases_email_and_skips_absent_phone() {
        let mut s = submission();
        s.email = "Jane@X.com".into();
        let payload = person_payload(&settings(), &s);
        let values = &payload["data"]["values"];
        assert_eq!(values["email_addresses"][0], "jane@x.com");
        assert_eq!(values["classification"][0], "cls-lead");
        assert!(values.get("phone_numbers").is_none());
        assert!(values.get("source").is_none());
    }

    #[test]
    fn only_throttling_and_server_errors_retry() {
        assert!(retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(retryable(StatusCode::BAD_GATEWAY));
        assert!(!retryable(StatusCode::BAD_REQUEST));
        assert!(backoff(1) >= Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn missing_key_skips() {
        let client = AttioClient {
            settings: None,
            http: build_client(),
        };
        assert!(client.upsert_lead(&submission()).await.expect("skip").is_none());
    }
}
