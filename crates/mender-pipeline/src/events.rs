//! Pipeline event stream for observers.
//!
//! [`EventBridge`] turns lifecycle hooks into [`PipelineEvent`]s on a
//! [`tokio::sync::broadcast`] channel so loggers, dashboards, and job-queue
//! workers can follow a run without coupling to the orchestrator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use mender_types::{MenderError, Question, Result};

use crate::hooks::PipelineHooks;
use crate::stage::{StageResult, StageResults};

/// Events emitted during a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PipelineEvent {
    RunStarted {
        run_id: String,
        stages: Vec<String>,
    },
    StageStarted {
        run_id: String,
        stage: String,
    },
    StageCompleted {
        run_id: String,
        stage: String,
        status: String,
        duration_ms: u64,
        attempts: usize,
    },
    RunCompleted {
        run_id: String,
        stage_count: usize,
    },
    RunFailed {
        run_id: String,
        error: String,
    },
    RunPaused {
        run_id: String,
        stage: String,
        questions: Vec<String>,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<PipelineEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Hooks implementation that publishes every lifecycle step as an event.
#[derive(Clone, Default)]
pub struct EventBridge {
    emitter: EventEmitter,
}

impl EventBridge {
    pub fn new(emitter: EventEmitter) -> Self {
        Self { emitter }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.emitter.subscribe()
    }
}

#[async_trait]
impl PipelineHooks for EventBridge {
    async fn on_run_start(&self, run_id: &str, stage_names: &[String]) -> Result<()> {
        self.emitter.emit(PipelineEvent::RunStarted {
            run_id: run_id.to_string(),
            stages: stage_names.to_vec(),
        });
        Ok(())
    }

    async fn on_stage_start(&self, run_id: &str, stage: &str) -> Result<()> {
        self.emitter.emit(PipelineEvent::StageStarted {
            run_id: run_id.to_string(),
            stage: stage.to_string(),
        });
        Ok(())
    }

    async fn on_stage_complete(&self, run_id: &str, stage: &str, result: &StageResult) -> Result<()> {
        self.emitter.emit(PipelineEvent::StageCompleted {
            run_id: run_id.to_string(),
            stage: stage.to_string(),
            status: result.status.as_str().to_string(),
            duration_ms: result.duration_ms,
            attempts: result.attempts,
        });
        Ok(())
    }

    async fn on_run_complete(&self, run_id: &str, results: &StageResults) -> Result<()> {
        self.emitter.emit(PipelineEvent::RunCompleted {
            run_id: run_id.to_string(),
            stage_count: results.len(),
        });
        Ok(())
    }

    async fn on_run_fail(&self, run_id: &str, error: &MenderError, _results: &StageResults) -> Result<()> {
        self.emitter.emit(PipelineEvent::RunFailed {
            run_id: run_id.to_string(),
            error: error.to_string(),
        });
        Ok(())
    }

    async fn on_run_paused(&self, run_id: &str, stage: &str, questions: &[Question]) -> Result<()> {
        self.emitter.emit(PipelineEvent::RunPaused {
            run_id: run_id.to_string(),
            stage: stage.to_string(),
            questions: questions.iter().map(|q| q.prompt.clone()).collect(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emitter_sends_and_receives() {
        let emitter = EventEmitter::new(16);
        let mut rx = emitter.subscribe();

        emitter.emit(PipelineEvent::RunStarted {
            run_id: "r1".into(),
            stages: vec!["build".into(), "verify".into()],
        });

        match rx.recv().await.unwrap() {
            PipelineEvent::RunStarted { run_id, stages } => {
                assert_eq!(run_id, "r1");
                assert_eq!(stages.len(), 2);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn emit_with_no_subscribers_does_not_panic() {
        let emitter = EventEmitter::new(16);
        emitter.emit(PipelineEvent::RunFailed {
            run_id: "r".into(),
            error: "something went wrong".into(),
        });
    }

    #[tokio::test]
    async fn bridge_translates_hooks_to_events() {
        let bridge = EventBridge::default();
        let mut rx = bridge.subscribe();

        bridge.on_stage_start("r2", "Verify").await.unwrap();
        bridge
            .on_run_paused("r2", "Verify", &[Question::new("Ship anyway?")])
            .await
            .unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            PipelineEvent::StageStarted {
                run_id: "r2".into(),
                stage: "Verify".into()
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            PipelineEvent::RunPaused {
                run_id: "r2".into(),
                stage: "Verify".into(),
                questions: vec!["Ship anyway?".into()],
            }
        );
    }
}
