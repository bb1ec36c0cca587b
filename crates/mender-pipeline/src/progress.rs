//! Bridge from lifecycle hooks to a job-queue progress store and a chat notifier.
//!
//! The store receives state keys under the job id (`status`, `stages`,
//! `current_stage`, `progress`, `error`, `questions`). The notifier receives a
//! short plain-text line at run start, completion, failure, and pause.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use mender_types::{MenderError, Question, Result};

use crate::hooks::PipelineHooks;
use crate::stage::{StageResult, StageResults};

/// Key/value state attached to a queued job.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn set_state(&self, job_id: &str, key: &str, value: Value) -> Result<()>;
}

/// Outbound human-facing messages (chat, email, ...).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str) -> Result<()>;
}

/// In-process [`ProgressStore`], handy for tests and local runs.
#[derive(Default)]
pub struct MemoryProgressStore {
    values: tokio::sync::RwLock<HashMap<(String, String), Value>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, job_id: &str, key: &str) -> Option<Value> {
        self.values
            .read()
            .await
            .get(&(job_id.to_string(), key.to_string()))
            .cloned()
    }
}

#[async_trait]
impl ProgressStore for MemoryProgressStore {
    async fn set_state(&self, job_id: &str, key: &str, value: Value) -> Result<()> {
        self.values
            .write()
            .await
            .insert((job_id.to_string(), key.to_string()), value);
        Ok(())
    }
}

pub struct ProgressBridge {
    job_id: String,
    store: Arc<dyn ProgressStore>,
    notifier: Option<Arc<dyn Notifier>>,
    total: AtomicUsize,
    done: AtomicUsize,
}

impl ProgressBridge {
    pub fn new(job_id: impl Into<String>, store: Arc<dyn ProgressStore>) -> Self {
        Self {
            job_id: job_id.into(),
            store,
            notifier: None,
            total: AtomicUsize::new(0),
            done: AtomicUsize::new(0),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.store.set_state(&self.job_id, key, value).await
    }

    async fn say(&self, message: String) -> Result<()> {
        match &self.notifier {
            Some(n) => n.notify(&message).await,
            None => Ok(()),
        }
    }

    fn percent(&self) -> u64 {
        let total = self.total.load(Ordering::SeqCst);
        if total == 0 {
            return 0;
        }
        let done = self.done.load(Ordering::SeqCst).min(total);
        (done * 100 / total) as u64
    }
}

#[async_trait]
impl PipelineHooks for ProgressBridge {
    async fn on_run_start(&self, run_id: &str, stage_names: &[String]) -> Result<()> {
        self.total.store(stage_names.len(), Ordering::SeqCst);
        self.done.store(0, Ordering::SeqCst);
        self.set("run_id", json!(run_id)).await?;
        self.set("status", json!("running")).await?;
        self.set("stages", json!(stage_names)).await?;
        self.set("progress", json!(0)).await?;
        self.say(format!(
            "Run {} started: {}",
            run_id,
            stage_names.join(" -> ")
        ))
        .await
    }

    async fn on_stage_start(&self, _run_id: &str, stage: &str) -> Result<()> {
        self.set("current_stage", json!(stage)).await
    }

    async fn on_stage_complete(&self, _run_id: &str, stage: &str, result: &StageResult) -> Result<()> {
        self.done.fetch_add(1, Ordering::SeqCst);
        self.set(
            &format!("stage.{stage}"),
            json!({ "status": result.status.as_str(), "duration_ms": result.duration_ms }),
        )
        .await?;
        self.set("progress", json!(self.percent())).await
    }

    async fn on_run_complete(&self, run_id: &str, results: &StageResults) -> Result<()> {
        self.set("status", json!("completed")).await?;
        self.set("progress", json!(100)).await?;
        self.say(format!("Run {} completed ({} stages)", run_id, results.len()))
            .await
    }

    async fn on_run_fail(&self, run_id: &str, error: &MenderError, _results: &StageResults) -> Result<()> {
        self.set("status", json!("failed")).await?;
        self.set("error", json!(error.to_string())).await?;
        self.say(format!("Run {} failed: {}", run_id, error)).await
    }

    async fn on_run_paused(&self, run_id: &str, stage: &str, questions: &[Question]) -> Result<()> {
        self.set("status", json!("paused")).await?;
        self.set("questions", serde_json::to_value(questions)?).await?;
        self.say(format!(
            "Run {} paused at {}: {} question(s) need an answer",
            run_id,
            stage,
            questions.len()
        ))
        .await
    }
}
