use crate::config::{non_empty, parse_env};
use crate::http::build_client;
use crate::models::{AuditReport, AuditSubmission};
use crate::pipeline::{PdfRenderer, RenderError};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::{path::PathBuf, time::Duration};
use uuid::Uuid;

/// Client for an HTML→PDF render service (headless Chromium behind HTTP).
pub struct HttpPdfRenderer {
    endpoint: Option<String>,
    api_key: Option<String>,
    scale: f64,
    out_dir: PathBuf,
    http: Client,
}

impl HttpPdfRenderer {
    pub fn from_env() -> Self {
        Self {
            endpoint: non_empty("PDF_RENDER_URL"),
            api_key: non_empty("PDF_RENDER_KEY"),
            scale: parse_env::<f64>("PDF_SCALE").unwrap_or(0.82).clamp(0.6, 1.0),
            out_dir: non_empty("PDF_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir),
            http: build_client(),
        }
    }
}

#[async_trait]
impl PdfRenderer for HttpPdfRenderer {
    async fn render(&self, html: &str) -> Result<PathBuf, RenderError> {
        let endpoint = self.endpoint.as_deref().ok_or(RenderError::NotConfigured)?;
        let body = json!({
            "html": html,
            "options": {
                "format": "A4",
                "printBackground": true,
                "preferCSSPageSize": true,
                "scale": self.scale,
            },
        });
        let mut request = self
            .http
            .post(endpoint)
            .timeout(Duration::from_secs(60))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|err| RenderError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(RenderError::Request(format!("HTTP {}", response.status())));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|err| RenderError::Request(err.to_string()))?;
        if !bytes.starts_with(b"%PDF") {
            return Err(RenderError::Request("response is not a pdf".into()));
        }

        let path = self.out_dir.join(format!("audit-{}.pdf", Uuid::new_v4().simple()));
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|err| RenderError::Io(err.to_string()))?;
        Ok(path)
    }
}

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Minimal report document; layout is owned by the render service's CSS.
pub fn report_html(submission: &AuditSubmission, report: &AuditReport) -> String {
    let mut rows = String::new();
    for (category, score) in &report.category_breakdown {
        rows.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}/10</td><td>{}</td><td>{}</td></tr>",
            escape_html(category),
            escape_html(&score.grade),
            score.numeric,
            escape_html(&score.what_works),
            escape_html(&score.what_to_improve),
        ));
    }
    let mut wins = String::new();
    for win in &report.quick_wins {
        wins.push_str(&format!(
            "<li>{} <small>({} effort, {})</small></li>",
            escape_html(&win.action),
            escape_html(&win.effort),
            escape_html(&win.potential_uplift),
        ));
    }
    let title = report
        .listing_title
        .as_deref()
        .unwrap_or(submission.url.as_str());

    format!(
        r#"<!doctype html><html><head><meta charset="utf-8"><style>
body{{font-family:Arial,sans-serif;margin:32px}}table{{border-collapse:collapse}}td{{padding:4px 8px;border-bottom:1px solid #ddd}}
</style></head><body>
<h1>Hospitri Listing Audit</h1>
<p><b>Prepared for:</b> {name}</p>
<p><b>Listing:</b> {title}</p>
<p><b>URL:</b> {url}</p>
<p><b>Overall:</b> {score:.1}</p>
<table>{rows}</table>
<h2>Quick wins</h2><ol>{wins}</ol>
<p>{tip}</p>
</body></html>"#,
        name = escape_html(&submission.name),
        title = escape_html(title),
        url = escape_html(&submission.url),
        score = report.overall_score,
        rows = rows,
        wins = wins,
        tip = escape_html(report.pro_tip.as_deref().unwrap_or("")),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CategoryScore, QuickWin};
    use std::collections::BTreeMap;

    #[test]
    fn escapes_markup() {
        assert_eq!(escape_html(r#"<a href="x">&'"#), "&lt;a href=&quot;x&quot;&gt;&amp;&#39;");
    }

    #[test]
    fn report_contains_scores_and_wins() {
        let submission = crate::pipeline::fakes::submission();
        let mut breakdown = BTreeMap::new();
        breakdown.insert(
            "images".to_string(),
            CategoryScore {
                numeric: 6,
                grade: "C".into(),
                what_works: "Bright shots".into(),
                what_to_improve: "Add bedroom".into(),
            },
        );
        let report = AuditReport {
            listing_title: Some("Loft <3".into()),
            overall_score: 7.04,
            category_breakdown: breakdown,
            quick_wins: vec![QuickWin {
                action: "Add 5 photos".into(),
                effort: "Low".into(),
                potential_uplift_type: "revenue".into(),
                potential_uplift: "$$".into(),
            }],
            pro_tip: None,
        };
        let html = report_html(&submission, &report);
        assert!(html.contains("Loft &lt;3"));
        assert!(html.contains("<b>Overall:</b> 7.0"));
        assert!(html.contains("6/10"));
        assert!(html.contains("Add 5 photos"));
    }

    #[tokio::test]
    async fn unconfigured_renderer_errors() {
        let renderer = HttpPdfRenderer {
            endpoint: None,
            api_key: None,
            scale: 0.82,
            out_dir: std::env::temp_dir(),
            http: build_client(),
        };
        assert!(matches!(
            renderer.render("<html></html>").await,
            Err(RenderError::NotConfigured)
        ));
    }
}
