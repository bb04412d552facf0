use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{NoneAsEmptyString, serde_as};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Raw form/webhook payload. Every field defaults so that missing values are
/// reported as validation errors rather than extractor rejections.
#[serde_as]
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub url: String,
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default, rename = "turnstileToken", alias = "cf-turnstile-response")]
    pub turnstile_token: Option<String>,
}

/// A submission that passed the front door and was handed to the background.
#[derive(Debug, Clone, Serialize)]
pub struct AuditSubmission {
    pub submission_id: Uuid,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub url: String,
    pub received_at: DateTime<Utc>,
}

impl AuditSubmission {
    pub fn first_name(&self) -> &str {
        self.name.split_whitespace().next().unwrap_or(&self.name)
    }
}

#[derive(Debug, Serialize)]
pub struct AcceptedResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submission_id: Option<String>,
}

impl AcceptedResponse {
    pub fn received(submission_id: Uuid) -> Self {
        Self {
            ok: true,
            received: Some(true),
            duplicate: None,
            submission_id: Some(submission_id.to_string()),
        }
    }

    pub fn duplicate() -> Self {
        Self {
            ok: true,
            received: None,
            duplicate: Some(true),
            submission_id: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Extracted listing content handed to the grader.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScrapedListing {
    pub url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub text: String,
}

impl ScrapedListing {
    pub fn platform(&self) -> &'static str {
        platform_of(&self.url)
    }
}

pub fn platform_of(url: &str) -> &'static str {
    let lowered = url.to_ascii_lowercase();
    if lowered.contains("airbnb.") {
        "airbnb"
    } else if lowered.contains("booking.") {
        "booking"
    } else if lowered.contains("vrbo.") {
        "vrbo"
    } else {
        "other"
    }
}

/// Structured grade returned by the language model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditReport {
    #[serde(default)]
    pub listing_title: Option<String>,
    pub overall_score: f64,
    #[serde(default)]
    pub category_breakdown: BTreeMap<String, CategoryScore>,
    #[serde(default)]
    pub quick_wins: Vec<QuickWin>,
    #[serde(default)]
    pub pro_tip: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryScore {
    pub numeric: u8,
    pub grade: String,
    #[serde(default)]
    pub what_works: String,
    #[serde(default)]
    pub what_to_improve: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuickWin {
    pub action: String,
    pub effort: String,
    pub potential_uplift_type: String,
    pub potential_uplift: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HashPiiRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HashPiiResponse {
    pub ok: bool,
    pub hashed: BTreeMap<&'static str, String>,
}
