use super::openai::{LlmClient, LlmError, LlmMessage};
use crate::models::{AuditReport, ScrapedListing};
use crate::pipeline::{GradeError, Grader};
use async_trait::async_trait;
use tracing::{info, warn};

const SYSTEM_PROMPT: &str = "You are Hospitri's Listing Auditor. Input is text extracted from an \
OTA listing (Airbnb/Booking/VRBO). Reply with ONE JSON object with keys listing_title, \
overall_score (0-10, one decimal), category_breakdown (title, description, images, amenities, \
reviews, pricing, policies_fees, response_speed; each {numeric 0-10, grade A-D, what_works, \
what_to_improve}), quick_wins (exactly 3 of {action, effort Low|Med|High, \
potential_uplift_type revenue|experience, potential_uplift}) and pro_tip. No prose.";

pub struct LlmGrader {
    client: LlmClient,
}

impl LlmGrader {
    pub fn new(client: LlmClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Grader for LlmGrader {
    async fn grade(&self, listing: &ScrapedListing) -> Result<AuditReport, GradeError> {
        if !self.client.is_configured() {
            return Err(GradeError::NotConfigured);
        }
        let messages = [
            LlmMessage::system(SYSTEM_PROMPT),
            LlmMessage::user(listing_prompt(listing)),
        ];
        let response = self.client.chat_json(&messages).await.map_err(|err| match err {
            LlmError::InvalidResponse(_) => GradeError::Empty,
            other => GradeError::Request(other.to_string()),
        })?;
        if let Some(usage) = &response.usage {
            info!(
                target = "audit.llm",
                model = self.client.model(),
                input_tokens = usage.prompt_tokens,
                output_tokens = usage.completion_tokens,
                total_tokens = usage.total_tokens,
                "model usage"
            );
        }
        parse_report(&response.text).inspect_err(|err| {
            warn!(target = "audit.llm", error = %err, "failed to parse model json");
        })
    }
}

fn listing_prompt(listing: &ScrapedListing) -> String {
    let mut prompt = String::from("Extracted listing text (reduced):\n");
    if let Some(title) = &listing.title {
        prompt.push_str(&format!("Title: {title}\n"));
    }
    if let Some(description) = &listing.description {
        prompt.push_str(&format!("Description: {description}\n"));
    }
    prompt.push_str(&listing.text);
    prompt
}

/// Accepts bare JSON or JSON wrapped in a markdown code fence.
pub fn parse_report(text: &str) -> Result<AuditReport, GradeError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(GradeError::Empty);
    }
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();
    let report: AuditReport =
        serde_json::from_str(body).map_err(|err| GradeError::Malformed(err.to_string()))?;
    if !report.overall_score.is_finite() || !(0.0..=100.0).contains(&report.overall_score) {
        return Err(GradeError::Malformed(format!(
            "overall_score out of range: {}",
            report.overall_score
        )));
    }
    Ok(report)
}
