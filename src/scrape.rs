use crate::http::build_client;
use crate::models::ScrapedListing;
use crate::pipeline::{ScrapeError, Scraper};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

const SCRAPER_AGENT: &str = "HospitriAuditBot/1.0";
pub const MAX_TEXT_CHARS: usize = 60_000;

static TITLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("title regex"));
static OG_TITLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<meta[^>]+property=["']og:title["'][^>]*content=["']([^"']*)["']"#)
        .expect("og:title regex")
});
static DESCRIPTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?is)<meta[^>]+(?:name=["']description["']|property=["']og:description["'])[^>]*content=["']([^"']*)["']"#,
    )
    .expect("description regex")
});
static NON_CONTENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(script|style|noscript|svg)[^>]*>.*?</(script|style|noscript|svg)>")
        .expect("non-content regex")
});
static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]+>").expect("tag regex"));
static SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("space regex"));

/// Fetches a listing page over plain HTTP and reduces it to readable text.
pub struct HttpScraper {
    http: Client,
    timeout: Duration,
}

impl HttpScraper {
    pub fn new() -> Self {
        Self {
            http: build_client(),
            timeout: Duration::from_secs(60),
        }
    }
}

#[async_trait]
impl Scraper for HttpScraper {
    async fn fetch(&self, url: &str) -> Result<ScrapedListing, ScrapeError> {
        let response = self
            .http
            .get(url)
            .header(reqwest::header::USER_AGENT, SCRAPER_AGENT)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|err| ScrapeError::Navigation(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ScrapeError::Navigation(format!("HTTP {}", response.status())));
        }
        let html = response
            .text()
            .await
            .map_err(|err| ScrapeError::Navigation(err.to_string()))?;
        let listing = extract_listing(url, &html);
        debug!(
            target = "audit.scrape",
            url,
            html_len = html.len(),
            text_len = listing.text.len(),
            "page fetched"
        );
        if listing.text.is_empty() {
            return Err(ScrapeError::Empty(url.to_string()));
        }
        Ok(listing)
    }
}

pub fn extract_listing(url: &str, html: &str) -> ScrapedListing {
    let capture = |re: &Regex| {
        re.captures(html)
            .and_then(|c| c.get(1))
            .map(|m| collapse(&decode_entities(m.as_str())))
            .filter(|s| !s.is_empty())
    };
    let title = capture(&OG_TITLE).or_else(|| capture(&TITLE));
    let description = capture(&DESCRIPTION);

    let stripped = NON_CONTENT.replace_all(html, " ");
    let stripped = TAG.replace_all(&stripped, " ");
    let text = truncate_chars(&collapse(&decode_entities(&stripped)), MAX_TEXT_CHARS);

    ScrapedListing {
        url: url.to_string(),
        title,
        description,
        text,
    }
}

fn collapse(input: &str) -> String {
    SPACE.replace_all(input, " ").trim().to_string()
}

fn decode_entities(input: &str) -> String {
    input
        .replace("&nbsp;", " ")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

fn truncate_chars(input: &str, max: usize) -> String {
    match input.char_indices().nth(max) {
        Some((idx, _)) => input[..idx].to_string(),
        None => input.to_string(),
    }
}
