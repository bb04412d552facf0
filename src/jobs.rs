use crate::{
    gate::ConcurrencyGate,
    models::AuditSubmission,
    pipeline::{AuditPipeline, PipelineRun},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Background hand-off for accepted submissions.
///
/// A single dispatcher drains the channel in arrival order and waits on the
/// concurrency gate before spawning each run, so queued audits are admitted
/// FIFO and the permit lives exactly as long as the run. The channel is
/// unbounded: `enqueue` never waits on the gate.
#[derive(Clone)]
pub struct AuditQueue {
    tx: mpsc::UnboundedSender<AuditSubmission>,
    statuses: Arc<Mutex<HashMap<Uuid, JobRecord>>>,
}

#[derive(Clone)]
struct JobRecord {
    state: JobState,
    updated_at: DateTime<Utc>,
}

#[derive(Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed { result: PipelineRun },
    Failed { error: String, stage: Option<String> },
}

impl JobState {
    fn is_finished(&self) -> bool {
        matches!(self, JobState::Completed { .. } | JobState::Failed { .. })
    }
}

#[derive(Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    #[serde(flatten)]
    pub state: JobState,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("worker not available")]
    Closed,
}

impl AuditQueue {
    pub fn spawn(
        pipeline: AuditPipeline,
        gate: ConcurrencyGate,
        acquire_timeout: Option<Duration>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditSubmission>();
        let statuses: Arc<Mutex<HashMap<Uuid, JobRecord>>> = Arc::new(Mutex::new(HashMap::new()));
        let statuses_bg = statuses.clone();

        let handle = tokio::spawn(async move {
            while let Some(submission) = rx.recv().await {
                let id = submission.submission_id;
                let acquired = match acquire_timeout {
                    Some(limit) => gate.acquire_timeout(limit).await,
                    None => gate.acquire().await,
                };
                let permit = match acquired {
                    Ok(permit) => permit,
                    Err(err) => {
                        warn!(
                            target = "audit.jobs",
                            submission_id = %id,
                            error = %err,
                            "audit dropped before start"
                        );
                        set_state(
                            &statuses_bg,
                            id,
                            JobState::Failed {
                                error: err.to_string(),
                                stage: Some("gate".into()),
                            },
                        )
                        .await;
                        continue;
                    }
                };

                set_state(&statuses_bg, id, JobState::Running).await;
                let pipeline = pipeline.clone();
                let statuses = statuses_bg.clone();
                tokio::spawn(async move {
                    let run = tokio::spawn(async move { pipeline.run(&submission).await });
                    let outcome = run.await;
                    drop(permit);
                    let state = match outcome {
                        Ok(Ok(run)) => JobState::Completed { result: run },
                        Ok(Err(err)) => JobState::Failed {
                            error: err.cause,
                            stage: Some(err.stage.to_string()),
                        },
                        Err(join) => {
                            error!(
                                target = "audit.jobs",
                                submission_id = %id,
                                error = %join,
                                "audit task aborted"
                            );
                            JobState::Failed {
                                error: "audit task aborted".into(),
                                stage: None,
                            }
                        }
                    };
                    set_state(&statuses, id, state).await;
                });
            }
            info!(target = "audit.jobs", "dispatcher stopped");
        });

        (Self { tx, statuses }, handle)
    }

    pub async fn enqueue(&self, submission: AuditSubmission) -> Result<Uuid, QueueError> {
        let id = submission.submission_id;
        set_state(&self.statuses, id, JobState::Queued).await;
        if self.tx.send(submission).is_err() {
            self.statuses.lock().await.remove(&id);
            return Err(QueueError::Closed);
        }
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Option<JobInfo> {
        let guard = self.statuses.lock().await;
        guard.get(&id).cloned().map(|record| JobInfo {
            id: id.to_string(),
            state: record.state,
            updated_at: record.updated_at,
        })
    }

    /// Forgets finished jobs older than `retention`.
    pub async fn sweep(&self, retention: Duration) -> usize {
        let cutoff = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|d| Utc::now().checked_sub_signed(d));
        let Some(cutoff) = cutoff else {
            return 0;
        };
        let mut guard = self.statuses.lock().await;
        let before = guard.len();
        guard.retain(|_, record| !(record.state.is_finished() && record.updated_at < cutoff));
        before - guard.len()
    }
}

async fn set_state(statuses: &Mutex<HashMap<Uuid, JobRecord>>, id: Uuid, state: JobState) {
    statuses.lock().await.insert(
        id,
        JobRecord {
            state,
            updated_at: Utc::now(),
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::fakes::{Faults, collaborators, submission};

    async fn wait_finished(queue: &AuditQueue, id: Uuid) -> JobInfo {
        for _ in 0..500 {
            if let Some(info) = queue.get(id).await
                && info.state.is_finished()
            {
                return info;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {id} did not finish");
    }

    #[tokio::test]
    async fn accepted_job_completes() {
        let (c, log) = collaborators(Faults::default());
        let gate = ConcurrencyGate::new(2);
        let (queue, _worker) = AuditQueue::spawn(AuditPipeline::new(c), gate.clone(), None);
        let id = queue.enqueue(submission()).await.expect("enqueue");

        let info = wait_finished(&queue, id).await;
        assert!(matches!(info.state, JobState::Completed { .. }));
        assert_eq!(log.count("mail"), 1);
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn failed_stage_is_reported() {
        let (c, _log) = collaborators(Faults {
            render: true,
            ..Default::default()
        });
        let (queue, _worker) =
            AuditQueue::spawn(AuditPipeline::new(c), ConcurrencyGate::new(1), None);
        let id = queue.enqueue(submission()).await.expect("enqueue");

        match wait_finished(&queue, id).await.state {
            JobState::Failed { stage, .. } => assert_eq!(stage.as_deref(), Some("render")),
            _ => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn gate_timeout_fails_job_without_running_it() {
        let (c, log) = collaborators(Faults::default());
        let gate = ConcurrencyGate::new(1);
        let held = gate.acquire().await.expect("hold slot");
        let (queue, _worker) = AuditQueue::spawn(
            AuditPipeline::new(c),
            gate.clone(),
            Some(Duration::from_millis(20)),
        );
        let id = queue.enqueue(submission()).await.expect("enqueue");

        match wait_finished(&queue, id).await.state {
            JobState::Failed { stage, .. } => assert_eq!(stage.as_deref(), Some("gate")),
            _ => panic!("expected gate timeout"),
        }
        assert!(log.calls().is_empty());
        drop(held);
    }

    #[tokio::test]
    async fn unknown_job_is_none_and_sweep_keeps_fresh_results() {
        let (c, _log) = collaborators(Faults::default());
        let (queue, _worker) =
            AuditQueue::spawn(AuditPipeline::new(c), ConcurrencyGate::new(3), None);
        assert!(queue.get(Uuid::new_v4()).await.is_none());

        let id = queue.enqueue(submission()).await.expect("enqueue");
        wait_finished(&queue, id).await;
        assert_eq!(queue.sweep(Duration::from_secs(3600)).await, 0);
        assert_eq!(queue.sweep(Duration::ZERO).await, 1);
        assert!(queue.get(id).await.is_none());
    }

    #[tokio::test]
    async fn enqueue_returns_while_gate_is_saturated() {
        let (c, log) = collaborators(Faults::default());
        let gate = ConcurrencyGate::new(1);
        let held = gate.acquire().await.expect("hold slot");
        let (queue, _worker) = AuditQueue::spawn(AuditPipeline::new(c), gate.clone(), None);

        let mut ids = Vec::new();
        for i in 0..20 {
            let mut next = submission();
            next.submission_id = Uuid::new_v4();
            next.url = format!("https://airbnb.com/rooms/{i}");
            let id = tokio::time::timeout(Duration::from_millis(200), queue.enqueue(next))
                .await
                .expect("enqueue must not wait on the gate")
                .expect("enqueue");
            ids.push(id);
        }
        for id in &ids {
            let info = queue.get(*id).await.expect("known job");
            assert!(matches!(info.state, JobState::Queued));
        }
        assert!(log.calls().is_empty());

        drop(held);
        for id in ids {
            assert!(matches!(
                wait_finished(&queue, id).await.state,
                JobState::Completed { .. }
            ));
        }
        assert_eq!(log.count("mail"), 20);
    }
}
