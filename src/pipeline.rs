use crate::models::{AuditReport, AuditSubmission, ScrapedListing, StageReport};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use std::{
    collections::BTreeMap,
    fmt,
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};
use thiserror::Error;
use tracing::{error, info, warn};

// -------- Collaborator contracts --------

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("empty page: {0}")]
    Empty(String),
}

#[derive(Debug, Error)]
pub enum GradeError {
    #[error("grader not configured")]
    NotConfigured,
    #[error("model request failed: {0}")]
    Request(String),
    #[error("model returned empty output")]
    Empty,
    #[error("model output malformed: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("renderer not configured")]
    NotConfigured,
    #[error("render request failed: {0}")]
    Request(String),
    #[error("could not write pdf: {0}")]
    Io(String),
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("mailer not configured: {0}")]
    NotConfigured(&'static str),
    #[error("attachment unreadable: {0}")]
    Attachment(String),
    #[error("mail api rejected request: {0}")]
    Request(String),
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
}

#[derive(Debug, Error)]
pub enum CrmError {
    #[error("crm request failed: {0}")]
    Request(String),
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("chat api error: {0}")]
    Api(String),
}

#[async_trait]
pub trait Scraper: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<ScrapedListing, ScrapeError>;
}

#[async_trait]
pub trait Grader: Send + Sync {
    async fn grade(&self, listing: &ScrapedListing) -> Result<AuditReport, GradeError>;
}

#[async_trait]
pub trait PdfRenderer: Send + Sync {
    async fn render(&self, html: &str) -> Result<PathBuf, RenderError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct EmailContent {
    pub subject: String,
    pub html: String,
    pub variables: BTreeMap<String, String>,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(
        &self,
        to: &str,
        content: &EmailContent,
        attachment: &Path,
    ) -> Result<(), DeliveryError>;
}

/// Funnel event written to the analytics table.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsEvent {
    pub event: &'static str,
    pub submission_id: Option<String>,
    pub email: Option<String>,
    pub url: Option<String>,
    pub props: Option<Value>,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Records the lead and its audit; returns the audit row id when one was
    /// created (an already-recorded submission yields `None`).
    async fn persist(
        &self,
        submission: &AuditSubmission,
        report: &AuditReport,
    ) -> Result<Option<String>, PersistenceError>;

    async fn track(&self, event: &AnalyticsEvent) -> Result<(), PersistenceError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct CrmRecord {
    pub record_id: String,
    pub web_url: Option<String>,
}

#[async_trait]
pub trait Crm: Send + Sync {
    async fn upsert_lead(&self, submission: &AuditSubmission)
    -> Result<Option<CrmRecord>, CrmError>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn audit_lead(
        &self,
        submission: &AuditSubmission,
        crm_url: Option<&str>,
    ) -> Result<(), NotifyError>;
}

#[derive(Clone)]
pub struct Collaborators {
    pub scraper: Arc<dyn Scraper>,
    pub grader: Arc<dyn Grader>,
    pub renderer: Arc<dyn PdfRenderer>,
    pub mailer: Arc<dyn Mailer>,
    pub store: Arc<dyn Store>,
    pub crm: Arc<dyn Crm>,
    pub notifier: Arc<dyn Notifier>,
}

// -------- Stage errors --------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Scraping,
    Grading,
    Rendering,
    Persisting,
    Notifying,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Scraping => "scrape",
            Stage::Grading => "grade",
            Stage::Rendering => "render",
            Stage::Persisting => "persist",
            Stage::Notifying => "notify",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {cause}")]
pub struct StageError {
    pub stage: Stage,
    pub cause: String,
}

impl StageError {
    fn new(stage: Stage, cause: impl fmt::Display) -> Self {
        Self {
            stage,
            cause: cause.to_string(),
        }
    }
}

// -------- Orchestrator --------

/// Ephemeral state of one audit run, owned by the task executing it.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    pub submission_id: String,
    pub stages: Vec<StageReport>,
    pub record_id: Option<String>,
    pub crm_record: Option<CrmRecord>,
    pub overall_score: Option<f64>,
    /// Secondary side effects that failed without aborting the run.
    pub warnings: Vec<String>,
}

impl PipelineRun {
    fn new(submission: &AuditSubmission) -> Self {
        Self {
            submission_id: submission.submission_id.to_string(),
            stages: Vec::new(),
            record_id: None,
            crm_record: None,
            overall_score: None,
            warnings: Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct AuditPipeline {
    collaborators: Collaborators,
}

impl AuditPipeline {
    pub fn new(collaborators: Collaborators) -> Self {
        Self { collaborators }
    }

    /// Records a funnel event; failures are logged and swallowed.
    pub async fn track(&self, event: &'static str, submission: Option<&AuditSubmission>, props: Option<Value>) {
        let payload = AnalyticsEvent {
            event,
            submission_id: submission.map(|s| s.submission_id.to_string()),
            email: submission.map(|s| s.email.clone()),
            url: submission.map(|s| s.url.clone()),
            props,
        };
        if let Err(err) = self.collaborators.store.track(&payload).await {
            warn!(target = "audit.metrics", event, error = %err, "event tracking failed");
        }
    }

    /// Fire-and-forget [`track`](Self::track) for the request path.
    pub fn track_detached(&self, event: &'static str, submission: Option<AuditSubmission>, props: Option<Value>) {
        let pipeline = self.clone();
        tokio::spawn(async move {
            pipeline.track(event, submission.as_ref(), props).await;
        });
    }

    /// Scrape, grade and render are fail-fast. Persist, email, CRM and chat
    /// notification are attempted independently once a PDF exists; the run
    /// still fails if the email could not be delivered.
    pub async fn run(&self, submission: &AuditSubmission) -> Result<PipelineRun, StageError> {
        let mut run = PipelineRun::new(submission);
        let result = self.execute(submission, &mut run).await;
        match &result {
            Ok(()) => info!(
                target = "audit.pipeline",
                submission_id = %submission.submission_id,
                email = %submission.email,
                url = %submission.url,
                warnings = run.warnings.len(),
                "audit sent"
            ),
            Err(err) => {
                crate::metrics::stage_failed(err.stage.as_str());
                error!(
                    target = "audit.pipeline",
                    submission_id = %submission.submission_id,
                    email = %submission.email,
                    url = %submission.url,
                    stage = %err.stage,
                    error = %err.cause,
                    "background processing failed"
                );
                self.track(
                    "pipeline_failed",
                    Some(submission),
                    Some(json!({ "stage": err.stage.as_str(), "error": err.cause })),
                )
                .await;
            }
        }
        result.map(|()| run)
    }

    async fn execute(
        &self,
        submission: &AuditSubmission,
        run: &mut PipelineRun,
    ) -> Result<(), StageError> {
        let c = &self.collaborators;

        let listing = capture_stage(Stage::Scraping, &mut run.stages, c.scraper.fetch(&submission.url)).await?;
        self.track(
            "scrape_ok",
            Some(submission),
            Some(json!({ "platform": listing.platform(), "chars": listing.text.len() })),
        )
        .await;

        let report = capture_stage(Stage::Grading, &mut run.stages, c.grader.grade(&listing)).await?;
        run.overall_score = Some(report.overall_score);
        self.track(
            "openai_ok",
            Some(submission),
            Some(json!({ "overall_score": report.overall_score })),
        )
        .await;

        let html = crate::pdf::report_html(submission, &report);
        let pdf_path = capture_stage(Stage::Rendering, &mut run.stages, c.renderer.render(&html)).await?;
        self.track("pdf_ok", Some(submission), None).await;

        let delivered = self.side_effects(submission, &report, &pdf_path, run).await;

        if let Err(err) = tokio::fs::remove_file(&pdf_path).await {
            warn!(target = "audit.pipeline", path = %pdf_path.display(), error = %err, "pdf cleanup failed");
        }
        delivered
    }

    async fn side_effects(
        &self,
        submission: &AuditSubmission,
        report: &AuditReport,
        pdf_path: &Path,
        run: &mut PipelineRun,
    ) -> Result<(), StageError> {
        let c = &self.collaborators;

        match capture_stage(Stage::Persisting, &mut run.stages, c.store.persist(submission, report)).await {
            Ok(record_id) => {
                run.record_id = record_id;
                self.track("db_ok", Some(submission), None).await;
            }
            Err(err) => {
                warn!(
                    target = "audit.pipeline",
                    submission_id = %submission.submission_id,
                    email = %submission.email,
                    url = %submission.url,
                    error = %err,
                    "persist failed, continuing"
                );
                run.warnings.push(err.to_string());
            }
        }

        let email = email_content(submission, report);
        let delivery = capture_stage(
            Stage::Notifying,
            &mut run.stages,
            c.mailer.send(&submission.email, &email, pdf_path),
        )
        .await;
        if delivery.is_ok() {
            self.track("email_ok", Some(submission), None).await;
        }

        match c.crm.upsert_lead(submission).await {
            Ok(record) => run.crm_record = record,
            Err(err) => {
                warn!(target = "audit.crm", submission_id = %submission.submission_id, email = %submission.email, error = %err, "crm sync failed");
                run.warnings.push(format!("crm: {err}"));
            }
        }

        let crm_url = run.crm_record.as_ref().and_then(|r| r.web_url.as_deref());
        if let Err(err) = c.notifier.audit_lead(submission, crm_url).await {
            warn!(target = "audit.notify", submission_id = %submission.submission_id, error = %err, "chat notification failed");
            run.warnings.push(format!("notify: {err}"));
        }

        delivery
    }
}

async fn capture_stage<T, E, Fut>(
    stage: Stage,
    stages: &mut Vec<StageReport>,
    fut: Fut,
) -> Result<T, StageError>
where
    E: fmt::Display,
    Fut: Future<Output = Result<T, E>>,
{
    let started = Instant::now();
    let value = fut.await.map_err(|err| StageError::new(stage, err))?;
    let elapsed_ms = started.elapsed().as_millis();
    crate::metrics::stage_elapsed(stage.as_str(), elapsed_ms);
    stages.push(StageReport::new(stage.as_str(), elapsed_ms));
    Ok(value)
}

fn email_content(submission: &AuditSubmission, report: &AuditReport) -> EmailContent {
    let mut variables = BTreeMap::new();
    variables.insert("name".to_string(), submission.first_name().to_string());
    variables.insert("url".to_string(), submission.url.clone());
    variables.insert(
        "overall_score".to_string(),
        format!("{:.1}", report.overall_score),
    );
    if let Some(title) = &report.listing_title {
        variables.insert("listing_title".to_string(), title.clone());
    }
    EmailContent {
        subject: format!("Hospitri: Audit for {}", submission.url),
        html: format!(
            "<p>Hi {},</p><p>Attached is your audit for <b>{}</b>.</p>",
            crate::pdf::escape_html(submission.first_name()),
            crate::pdf::escape_html(&submission.url)
        ),
        variables,
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use std::sync::Mutex;

    /// Shared call log across every fake collaborator.
    #[derive(Clone, Default)]
    pub struct CallLog(Arc<Mutex<Vec<&'static str>>>);

    impl CallLog {
        pub fn push(&self, call: &'static str) {
            self.0.lock().expect("call log").push(call);
        }

        pub fn calls(&self) -> Vec<&'static str> {
            self.0.lock().expect("call log").clone()
        }

        pub fn count(&self, call: &'static str) -> usize {
            self.calls().iter().filter(|c| **c == call).count()
        }
    }

    #[derive(Clone, Default)]
    pub struct Faults {
        pub scrape: bool,
        pub grade: bool,
        pub render: bool,
        pub persist: bool,
        pub mail: bool,
        pub crm: bool,
        pub notify: bool,
        pub track: bool,
        pub stall_track: bool,
    }

    pub struct Fake {
        pub log: CallLog,
        pub events: CallLog,
        pub faults: Faults,
    }

    #[async_trait]
    impl Scraper for Fake {
        async fn fetch(&self, url: &str) -> Result<ScrapedListing, ScrapeError> {
            self.log.push("scrape");
            if self.faults.scrape {
                return Err(ScrapeError::Navigation("timeout".into()));
            }
            Ok(ScrapedListing {
                url: url.to_string(),
                title: Some("Cozy loft".into()),
                description: None,
                text: "Cozy loft with a view".into(),
            })
        }
    }

    #[async_trait]
    impl Grader for Fake {
        async fn grade(&self, _listing: &ScrapedListing) -> Result<AuditReport, GradeError> {
            self.log.push("grade");
            if self.faults.grade {
                return Err(GradeError::Malformed("not json".into()));
            }
            Ok(AuditReport {
                listing_title: Some("Cozy loft".into()),
                overall_score: 7.4,
                category_breakdown: BTreeMap::new(),
                quick_wins: Vec::new(),
                pro_tip: None,
            })
        }
    }

    #[async_trait]
    impl PdfRenderer for Fake {
        async fn render(&self, _html: &str) -> Result<PathBuf, RenderError> {
            self.log.push("render");
            if self.faults.render {
                return Err(RenderError::Request("HTTP 500".into()));
            }
            Ok(std::env::temp_dir().join(format!("audit-test-{}.pdf", uuid::Uuid::new_v4())))
        }
    }

    #[async_trait]
    impl Mailer for Fake {
        async fn send(&self, _to: &str, _content: &EmailContent, _attachment: &Path) -> Result<(), DeliveryError> {
            self.log.push("mail");
            if self.faults.mail {
                return Err(DeliveryError::Request("HTTP 422".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Store for Fake {
        async fn persist(&self, _submission: &AuditSubmission, _report: &AuditReport) -> Result<Option<String>, PersistenceError> {
            self.log.push("persist");
            if self.faults.persist {
                return Err(PersistenceError::Request("HTTP 503".into()));
            }
            Ok(Some("audit-1".into()))
        }

        async fn track(&self, event: &AnalyticsEvent) -> Result<(), PersistenceError> {
            if self.faults.stall_track {
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            }
            self.events.push(event.event);
            if self.faults.track {
                return Err(PersistenceError::Request("HTTP 503".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Crm for Fake {
        async fn upsert_lead(&self, _submission: &AuditSubmission) -> Result<Option<CrmRecord>, CrmError> {
            self.log.push("crm");
            if self.faults.crm {
                return Err(CrmError::Request("HTTP 500".into()));
            }
            Ok(Some(CrmRecord {
                record_id: "rec-1".into(),
                web_url: Some("https://app.attio.com/rec-1".into()),
            }))
        }
    }

    #[async_trait]
    impl Notifier for Fake {
        async fn audit_lead(&self, _submission: &AuditSubmission, _crm_url: Option<&str>) -> Result<(), NotifyError> {
            self.log.push("notify");
            if self.faults.notify {
                return Err(NotifyError::Api("channel_not_found".into()));
            }
            Ok(())
        }
    }

    pub fn collaborators(faults: Faults) -> (Collaborators, CallLog) {
        let (collaborators, log, _events) = collaborators_with_events(faults);
        (collaborators, log)
    }

    /// Like `collaborators`, plus a log of tracked funnel event names.
    pub fn collaborators_with_events(faults: Faults) -> (Collaborators, CallLog, CallLog) {
        let log = CallLog::default();
        let events = CallLog::default();
        let fake = Arc::new(Fake {
            log: log.clone(),
            events: events.clone(),
            faults,
        });
        let collaborators = Collaborators {
            scraper: fake.clone(),
            grader: fake.clone(),
            renderer: fake.clone(),
            mailer: fake.clone(),
            store: fake.clone(),
            crm: fake.clone(),
            notifier: fake,
        };
        (collaborators, log, events)
    }

    pub fn submission() -> AuditSubmission {
        AuditSubmission {
            submission_id: uuid::Uuid::new_v4(),
            name: "Jane Doe".into(),
            email: "jane@x.com".into(),
            phone: None,
            url: "https://airbnb.com/rooms/1".into(),
            received_at: chrono::Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fakes::{Faults, collaborators, submission};
    use super::*;

    #[tokio::test]
    async fn stages_run_in_order() {
        let (c, log) = collaborators(Faults::default());
        let run = AuditPipeline::new(c).run(&submission()).await.expect("run");
        assert_eq!(
            log.calls(),
            vec!["scrape", "grade", "render", "persist", "mail", "crm", "notify"]
        );
        let names: Vec<&str> = run.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["scrape", "grade", "render", "persist", "notify"]);
        assert_eq!(run.record_id.as_deref(), Some("audit-1"));
        assert_eq!(run.overall_score, Some(7.4));
        assert!(run.warnings.is_empty());
    }

    #[tokio::test]
    async fn grade_failure_stops_render_and_mail() {
        let (c, log) = collaborators(Faults {
            grade: true,
            ..Default::default()
        });
        let err = AuditPipeline::new(c).run(&submission()).await.expect_err("grade fails");
        assert_eq!(err.stage, Stage::Grading);
        assert_eq!(log.calls(), vec!["scrape", "grade"]);
    }

    #[tokio::test]
    async fn scrape_failure_is_terminal() {
        let (c, log) = collaborators(Faults {
            scrape: true,
            ..Default::default()
        });
        let err = AuditPipeline::new(c).run(&submission()).await.expect_err("scrape fails");
        assert_eq!(err.stage, Stage::Scraping);
        assert_eq!(log.calls(), vec!["scrape"]);
    }

    #[tokio::test]
    async fn persist_failure_still_sends_email() {
        let (c, log) = collaborators(Faults {
            persist: true,
            ..Default::default()
        });
        let run = AuditPipeline::new(c).run(&submission()).await.expect("run");
        assert_eq!(log.count("mail"), 1);
        assert_eq!(log.count("notify"), 1);
        assert!(run.record_id.is_none());
        assert_eq!(run.warnings.len(), 1);
    }

    #[tokio::test]
    async fn secondary_failures_do_not_mask_each_other() {
        let (c, log) = collaborators(Faults {
            crm: true,
            notify: true,
            track: true,
            ..Default::default()
        });
        let run = AuditPipeline::new(c).run(&submission()).await.expect("run");
        assert_eq!(log.count("crm"), 1);
        assert_eq!(log.count("notify"), 1);
        assert_eq!(run.warnings.len(), 2);
        assert!(run.crm_record.is_none());
    }

    #[tokio::test]
    async fn email_failure_fails_run_after_side_effects() {
        let (c, log) = collaborators(Faults {
            mail: true,
            ..Default::default()
        });
        let err = AuditPipeline::new(c).run(&submission()).await.expect_err("mail fails");
        assert_eq!(err.stage, Stage::Notifying);
        assert_eq!(log.count("crm"), 1);
        assert_eq!(log.count("notify"), 1);
    }

    #[test]
    fn email_uses_first_name_and_escapes() {
        let mut s = submission();
        s.name = "<b>Jane</b> Doe".into();
        let report = AuditReport {
            listing_title: None,
            overall_score: 8.24,
            category_breakdown: BTreeMap::new(),
            quick_wins: Vec::new(),
            pro_tip: None,
        };
        let content = email_content(&s, &report);
        assert!(content.html.contains("&lt;b&gt;Jane&lt;/b&gt;"));
        assert_eq!(content.variables["overall_score"], "8.2");
        assert!(content.subject.ends_with("https://airbnb.com/rooms/1"));
    }
}
