use crate::config::non_empty;
use crate::http::build_client;
use crate::models::{AuditReport, AuditSubmission, platform_of};
use crate::pipeline::{AnalyticsEvent, PersistenceError, Store};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// PostgREST-backed store for leads, audits and funnel events.
#[derive(Debug, Clone)]
pub struct SupabaseStore {
    target: Option<Target>,
    http: Client,
}

#[derive(Debug, Clone)]
struct Target {
    base_url: String,
    service_key: String,
}

#[derive(Debug, Serialize)]
struct LeadRow<'a> {
    name: &'a str,
    email: String,
    phone: Option<&'a str>,
    source_url: &'a str,
}

#[derive(Debug, Serialize)]
struct AuditRow<'a> {
    lead_id: &'a str,
    listing_url: &'a str,
    listing_title: Option<&'a str>,
    overall_score: f64,
    platform: &'static str,
    submission_id: String,
}

#[derive(Debug, Deserialize)]
struct Inserted {
    id: serde_json::Value,
}

impl Inserted {
    fn id_string(&self) -> String {
        match &self.id {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl SupabaseStore {
    pub fn from_env() -> Self {
        let base_url = non_empty("SUPABASE_URL");
        let service_key = non_empty("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|| non_empty("SUPABASE_SERVICE_KEY"))
            .or_else(|| non_empty("SUPABASE_KEY"));
        let target = match (base_url, service_key) {
            (Some(base_url), Some(service_key)) => Some(Target {
                base_url: base_url.trim_end_matches('/').to_string(),
                service_key,
            }),
            _ => None,
        };
        Self {
            target,
            http: build_client(),
        }
    }

    fn authed(&self, target: &Target, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &target.service_key)
            .header("Authorization", format!("Bearer {}", target.service_key))
    }

    async fn insert<T: Serialize + ?Sized>(
        &self,
        target: &Target,
        path: &str,
        rows: &T,
        prefer: &str,
    ) -> Result<Vec<Inserted>, PersistenceError> {
        let url = format!("{}/rest/v1/{}", target.base_url, path);
        let response = self
            .authed(target, self.http.post(url))
            .header("Prefer", prefer)
            .json(rows)
            .send()
            .await
            .map_err(|err| PersistenceError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(PersistenceError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }
        if prefer.contains("return=minimal") {
            return Ok(Vec::new());
        }
        response
            .json()
            .await
            .map_err(|err| PersistenceError::Deserialize(err.to_string()))
    }
}

#[async_trait]
impl Store for SupabaseStore {
    async fn persist(
        &self,
        submission: &AuditSubmission,
        report: &AuditReport,
    ) -> Result<Option<String>, PersistenceError> {
        let Some(target) = &self.target else {
            debug!(target = "audit.store", "SUPABASE_URL not set; skipping persist");
            return Ok(None);
        };

        let lead = LeadRow {
            name: &submission.name,
            email: submission.email.to_lowercase(),
            phone: submission.phone.as_deref(),
            source_url: &submission.url,
        };
        let lead_id = self
            .insert(target, "leads", &[lead], "return=representation")
            .await?
            .pop()
            .map(|row| row.id_string())
            .ok_or_else(|| PersistenceError::Deserialize("lead insert returned no row".into()))?;

        let audit = AuditRow {
            lead_id: &lead_id,
            listing_url: &submission.url,
            listing_title: report.listing_title.as_deref(),
            overall_score: report.overall_score,
            platform: platform_of(&submission.url),
            submission_id: submission.submission_id.to_string(),
        };
        let path = format!("audits?on_conflict={}", urlencoding::encode("submission_id"));
        let audit_id = self
            .insert(
                target,
                &path,
                &[audit],
                "resolution=ignore-duplicates,return=representation",
            )
            .await?
            .pop()
            .map(|row| row.id_string());
        Ok(audit_id)
    }

    async fn track(&self, event: &AnalyticsEvent) -> Result<(), PersistenceError> {
        let Some(target) = &self.target else {
            return Ok(());
        };
        self.insert(target, "events", std::slice::from_ref(event), "return=minimal")
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::fakes::submission;

    fn unconfigured() -> SupabaseStore {
        SupabaseStore {
            target: None,
            http: build_client(),
        }
    }

    #[tokio::test]
    async fn unconfigured_store_is_a_quiet_skip() {
        let store = unconfigured();
        let report = AuditReport {
            listing_title: None,
            overall_score: 7.0,
            category_breakdown: Default::default(),
            quick_wins: Vec::new(),
            pro_tip: None,
        };
        assert_eq!(store.persist(&submission(), &report).await.expect("skip"), None);
        let event = AnalyticsEvent {
            event: "form_received",
            submission_id: None,
            email: None,
            url: None,
            props: None,
        };
        assert!(store.track(&event).await.is_ok());
    }

    #[tokio::test]
    async fn unreachable_store_reports_request_error() {
        let store = SupabaseStore {
            target: Some(Target {
                base_url: "http://127.0.0.1:1".into(),
                service_key: "k".into(),
            }),
            http: build_client(),
        };
        let event = AnalyticsEvent {
            event: "scrape_ok",
            submission_id: None,
            email: None,
            url: None,
            props: None,
        };
        assert!(matches!(
            store.track(&event).await,
            Err(PersistenceError::Request(_))
        ));
    }

    #[test]
    fn numeric_ids_are_stringified() {
        let row: Inserted = serde_json::from_str(r#"{"id": 42}"#).expect("row");
        assert_eq!(row.id_string(), "42");
        let row: Inserted = serde_json::from_str(r#"{"id": "a-b"}"#).expect("row");
        assert_eq!(row.id_string(), "a-b");
    }
}
