//! The orchestrator: runs stage definitions in order against one shared context.
//!
//! Per stage: body raced against its timeout, linear-backoff retries, result
//! recorded, gate evaluated (with optional recovery), and only then the failed
//! status check, so a recoverable stage's failed result still reaches recovery.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use mender_resilience::BackoffPolicy;
use mender_types::{MenderError, Outcome, Question, Result, StageStatus};

use crate::hooks::{NoopHooks, PipelineHooks};
use crate::stage::{StageDefinition, StageResult, StageResults};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running,
    Completed,
    Failed,
    Paused,
}

/// State of the orchestrator's current (or most recent) run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    pub run_id: Option<String>,
    pub status: RunStatus,
    pub current_stage: Option<String>,
    pub results: StageResults,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub rolled_back: bool,
}

impl PipelineRun {
    fn idle() -> Self {
        Self {
            run_id: None,
            status: RunStatus::Idle,
            current_stage: None,
            results: StageResults::new(),
            started_at: None,
            completed_at: None,
            rolled_back: false,
        }
    }

    fn start(run_id: String) -> Self {
        Self {
            run_id: Some(run_id),
            status: RunStatus::Running,
            started_at: Some(Utc::now()),
            ..Self::idle()
        }
    }
}

/// What a recovery handler did about a rejected gate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Recovery {
    /// The run may advance past the rejected gate.
    pub handled: bool,
    /// Replaces the stage's recorded data.
    pub replacement: Option<serde_json::Value>,
    /// Replaces the stage's recorded status.
    pub status: Option<StageStatus>,
    /// Recovery discarded work; sets `PipelineRun::rolled_back`.
    pub rolled_back: bool,
}

impl Recovery {
    pub fn handled() -> Self {
        Self {
            handled: true,
            ..Self::default()
        }
    }

    pub fn unhandled() -> Self {
        Self::default()
    }
}

impl From<bool> for Recovery {
    fn from(handled: bool) -> Self {
        Self {
            handled,
            ..Self::default()
        }
    }
}

/// Called when the gate of a recoverable stage rejects its result.
#[async_trait]
pub trait GateRecovery<C: Send + Sync>: Send + Sync {
    async fn on_gate_failure(
        &self,
        stage_id: &str,
        reason: &str,
        ctx: &C,
        results: &StageResults,
    ) -> Recovery;
}

enum StageFlow {
    Continue,
    Paused(Vec<Question>),
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Sequential stage executor over a caller-typed context `C`.
///
/// One run at a time per orchestrator; separate orchestrators run independently.
pub struct Orchestrator<C: Send + Sync> {
    context: C,
    hooks: Arc<dyn PipelineHooks>,
    recovery: Option<Arc<dyn GateRecovery<C>>>,
    state: RwLock<PipelineRun>,
    run_lock: Mutex<()>,
}

impl<C: Send + Sync> Orchestrator<C> {
    pub fn new(context: C) -> Self {
        Self {
            context,
            hooks: Arc::new(NoopHooks),
            recovery: None,
            state: RwLock::new(PipelineRun::idle()),
            run_lock: Mutex::new(()),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn PipelineHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_recovery(mut self, recovery: Arc<dyn GateRecovery<C>>) -> Self {
        self.recovery = Some(recovery);
        self
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn into_context(self) -> C {
        self.context
    }

    /// Snapshot of the current or most recent run.
    pub async fn state(&self) -> PipelineRun {
        self.state.read().await.clone()
    }

    /// Typed data recorded by `stage_id` in the current or most recent run.
    pub async fn result<T: DeserializeOwned>(&self, stage_id: &str) -> Result<Option<T>> {
        self.state.read().await.results.data(stage_id)
    }

    /// Execute `stages` in order.
    ///
    /// Returns the results map when every stage passes (or the run pauses for
    /// input); returns the aborting error when a gate rejects without recovery
    /// or a stage ends failed.
    pub async fn execute(&self, stages: &[StageDefinition<C>]) -> Result<StageResults> {
        let _exclusive = self.run_lock.lock().await;
        let run_id = uuid::Uuid::new_v4().to_string();
        *self.state.write().await = PipelineRun::start(run_id.clone());

        let names: Vec<String> = stages.iter().map(|s| s.name.clone()).collect();
        tracing::info!(run_id = %run_id, stages = names.len(), "Pipeline run started");
        best_effort("on_run_start", self.hooks.on_run_start(&run_id, &names).await);

        let mut results = StageResults::new();
        for stage in stages {
            match self.run_stage(&run_id, stage, &mut results).await {
                Ok(StageFlow::Continue) => {}
                Ok(StageFlow::Paused(questions)) => {
                    self.finish(RunStatus::Paused).await;
                    tracing::info!(run_id = %run_id, stage = %stage.id, "Pipeline paused for input");
                    best_effort(
                        "on_run_paused",
                        self.hooks.on_run_paused(&run_id, &stage.name, &questions).await,
                    );
                    return Ok(results);
                }
                Err(e) => {
                    self.finish(RunStatus::Failed).await;
                    tracing::error!(run_id = %run_id, stage = %stage.id, error = %e, "Pipeline failed");
                    best_effort("on_run_fail", self.hooks.on_run_fail(&run_id, &e, &results).await);
                    return Err(e);
                }
            }
        }

        self.finish(RunStatus::Completed).await;
        tracing::info!(run_id = %run_id, "Pipeline run completed");
        best_effort("on_run_complete", self.hooks.on_run_complete(&run_id, &results).await);
        Ok(results)
    }

    async fn finish(&self, status: RunStatus) {
        let mut state = self.state.write().await;
        state.status = status;
        state.current_stage = None;
        state.completed_at = Some(Utc::now());
    }

    async fn record(&self, results: &StageResults, rolled_back: bool) {
        let mut state = self.state.write().await;
        state.results = results.clone();
        state.rolled_back |= rolled_back;
    }

    async fn run_stage(
        &self,
        run_id: &str,
        stage: &StageDefinition<C>,
        results: &mut StageResults,
    ) -> Result<StageFlow> {
        self.state.write().await.current_stage = Some(stage.id.clone());
        tracing::info!(stage = %stage.id, name = %stage.name, "Stage started");
        best_effort("on_stage_start", self.hooks.on_stage_start(run_id, &stage.name).await);

        let result = self.attempt(stage, results).await;
        let status = result.status;
        let error = result.error.clone();
        results.insert(result.clone());
        self.record(results, false).await;
        tracing::info!(
            stage = %stage.id,
            status = status.as_str(),
            attempts = result.attempts,
            duration_ms = result.duration_ms,
            "Stage finished"
        );
        best_effort(
            "on_stage_complete",
            self.hooks.on_stage_complete(run_id, &stage.name, &result).await,
        );

        if status == StageStatus::Paused {
            return Ok(StageFlow::Paused(result.questions));
        }

        if let Some(gate) = &stage.gate {
            let verdict = gate.check(&result, &self.context).await;
            if !verdict.can_proceed {
                let reason = verdict
                    .reason
                    .unwrap_or_else(|| "gate rejected the stage result".to_string());
                tracing::warn!(stage = %stage.id, reason = %reason, "Gate rejected");

                if stage.policy.recoverable {
                    if let Some(recovery) = &self.recovery {
                        let outcome = recovery
                            .on_gate_failure(&stage.id, &reason, &self.context, results)
                            .await;
                        if outcome.handled {
                            if let Some(entry) = results.get_mut(&stage.id) {
                                if let Some(data) = outcome.replacement {
                                    entry.data = Some(data);
                                }
                                if let Some(status) = outcome.status {
                                    entry.status = status;
                                }
                            }
                            self.record(results, outcome.rolled_back).await;
                            tracing::info!(
                                stage = %stage.id,
                                rolled_back = outcome.rolled_back,
                                "Gate failure recovered"
                            );
                            return Ok(StageFlow::Continue);
                        }
                    }
                }

                return Err(MenderError::GateRejected {
                    stage: stage.name.clone(),
                    reason,
                });
            }
        }

        if status == StageStatus::Failed {
            return Err(MenderError::StageFailed {
                stage: stage.name.clone(),
                message: error.unwrap_or_default(),
            });
        }
        Ok(StageFlow::Continue)
    }

    /// Run the stage body with timeout and retries; never returns an error.
    async fn attempt(&self, stage: &StageDefinition<C>, results: &StageResults) -> StageResult {
        let started_at = Utc::now();
        let clock = Instant::now();
        let backoff = BackoffPolicy::Linear(stage.policy.retry_delay);
        let timeout = stage.policy.timeout;
        let mut last_error = String::new();

        for attempt in 0..=stage.policy.retries {
            // A timed-out body is dropped here, cancelling it at its next await.
            let outcome = match tokio::time::timeout(timeout, stage.body.execute(&self.context, results)).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => Outcome::failed(e.to_string()),
                Err(_) => Outcome::failed(
                    MenderError::StageTimeout {
                        stage: stage.name.clone(),
                        timeout_ms: timeout.as_millis() as u64,
                    }
                    .to_string(),
                ),
            };

            match outcome {
                Outcome::Failed { error } => {
                    if attempt < stage.policy.retries {
                        let delay = backoff.delay_for_attempt(attempt);
                        tracing::warn!(
                            stage = %stage.id,
                            attempt = attempt + 1,
                            delay_ms = %delay.as_millis(),
                            error = %error,
                            "Stage attempt failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    last_error = error;
                }
                done => {
                    return StageResult::from_outcome(&stage.id, done, started_at, clock.elapsed(), attempt + 1);
                }
            }
        }

        StageResult::from_outcome(
            &stage.id,
            Outcome::failed(last_error),
            started_at,
            clock.elapsed(),
            stage.policy.retries + 1,
        )
    }
}

fn best_effort(hook: &str, outcome: Result<()>) {
    if let Err(e) = outcome {
        tracing::warn!(hook, error = %e, "Hook failed, continuing");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::GateResult;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Counter {
        calls: AtomicUsize,
    }

    fn flaky(fail_times: usize) -> StageDefinition<Counter> {
        StageDefinition::from_fn("flaky", "Flaky", move |ctx: &Counter, _| {
            Box::pin(async move {
                let n = ctx.calls.fetch_add(1, Ordering::SeqCst);
                if n < fail_times {
                    Err(MenderError::Other(format!("attempt {} failed", n + 1)))
                } else {
                    Outcome::completed(n + 1)
                }
            })
        })
    }

    // 1. Fails twice, succeeds on the third attempt
    #[tokio::test(start_paused = true)]
    async fn retry_until_success() {
        let orch = Orchestrator::new(Counter::default());
        let stages = vec![flaky(2).retries(2).retry_delay(Duration::from_millis(100))];
        let start = Instant::now();

        let results = orch.execute(&stages).await.unwrap();

        let r = results.get("flaky").unwrap();
        assert_eq!(r.status, StageStatus::Completed);
        assert_eq!(r.attempts, 3);
        assert_eq!(orch.context().calls.load(Ordering::SeqCst), 3);
        assert_eq!(orch.result::<usize>("flaky").await.unwrap(), Some(3));
        // linear: 100 * 1 + 100 * 2
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    // 2. No retries and always failing aborts the run
    #[tokio::test(start_paused = true)]
    async fn failure_without_retries_aborts() {
        let orch = Orchestrator::new(Counter::default());
        let stages = vec![flaky(usize::MAX).retries(0)];

        let err = orch.execute(&stages).await.unwrap_err();
        match err {
            MenderError::StageFailed { stage, message } => {
                assert_eq!(stage, "Flaky");
                assert_eq!(message, "attempt 1 failed");
            }
            other => panic!("expected StageFailed, got {other:?}"),
        }
        let state = orch.state().await;
        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.results.get("flaky").unwrap().status, StageStatus::Failed);
        assert_eq!(orch.context().calls.load(Ordering::SeqCst), 1);
    }

    // 3. Timeout message names the stage and the limit
    #[tokio::test(start_paused = true)]
    async fn timeout_becomes_failure() {
        let orch = Orchestrator::new(());
        let stages = vec![StageDefinition::from_fn("slow", "Slow Call", |_: &(), _| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(Outcome::done())
            })
        })
        .timeout(Duration::from_millis(250))];

        let err = orch.execute(&stages).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Stage 'Slow Call' failed: Slow Call timed out after 250ms"
        );
    }

    // 4. Gate rejection on a non-recoverable stage aborts with GateRejected
    #[tokio::test]
    async fn gate_rejection_aborts() {
        let orch = Orchestrator::new(());
        let ran_after = Arc::new(AtomicUsize::new(0));
        let ra = ran_after.clone();
        let stages = vec![
            StageDefinition::from_fn("check", "Check", |_: &(), _| Box::pin(async { Ok(Outcome::done()) }))
                .gate_fn(|_, _| GateResult::reject("quality too low")),
            StageDefinition::from_fn("after", "After", move |_: &(), _| {
                ra.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Ok(Outcome::done()) })
            }),
        ];

        let err = orch.execute(&stages).await.unwrap_err();
        assert!(matches!(err, MenderError::GateRejected { ref reason, .. } if reason == "quality too low"));
        assert_eq!(ran_after.load(Ordering::SeqCst), 0);
    }

    // 5. Recoverable gate failure continues; failed result is inspected by the gate first
    #[tokio::test]
    async fn recovered_gate_lets_failed_stage_continue() {
        struct Heal;

        #[async_trait]
        impl GateRecovery<()> for Heal {
            async fn on_gate_failure(&self, stage_id: &str, reason: &str, _: &(), _: &StageResults) -> Recovery {
                assert_eq!(stage_id, "verify");
                assert_eq!(reason, "build failed");
                Recovery {
                    handled: true,
                    replacement: Some(serde_json::json!({"healed": true})),
                    status: Some(StageStatus::Completed),
                    rolled_back: true,
                }
            }
        }

        let orch = Orchestrator::new(()).with_recovery(Arc::new(Heal));
        let stages = vec![
            StageDefinition::from_fn("verify", "Verify", |_: &(), _| {
                Box::pin(async { Ok(Outcome::failed("tsc exited 2")) })
            })
            .recoverable()
            .gate_fn(|result, _| {
                if result.is_completed() {
                    GateResult::pass()
                } else {
                    GateResult::reject("build failed")
                }
            }),
            StageDefinition::from_fn("report", "Report", |_: &(), results| {
                Box::pin(async move {
                    let healed: Option<serde_json::Value> = results.data("verify")?;
                    Outcome::completed(healed)
                })
            }),
        ];

        let results = orch.execute(&stages).await.unwrap();
        assert_eq!(results.get("verify").unwrap().status, StageStatus::Completed);
        assert_eq!(
            results.data::<serde_json::Value>("report").unwrap(),
            Some(serde_json::json!({"healed": true}))
        );
        let state = orch.state().await;
        assert_eq!(state.status, RunStatus::Completed);
        assert!(state.rolled_back);
    }

    // 6. Unhandled recovery still aborts
    #[tokio::test]
    async fn unhandled_recovery_aborts() {
        struct Refuse;

        #[async_trait]
        impl GateRecovery<()> for Refuse {
            async fn on_gate_failure(&self, _: &str, _: &str, _: &(), _: &StageResults) -> Recovery {
                Recovery::unhandled()
            }
        }

        let orch = Orchestrator::new(()).with_recovery(Arc::new(Refuse));
        let stages = vec![StageDefinition::from_fn("verify", "Verify", |_: &(), _| {
            Box::pin(async { Ok(Outcome::done()) })
        })
        .recoverable()
        .gate_fn(|_, _| GateResult::reject("tests failed"))];

        let err = orch.execute(&stages).await.unwrap_err();
        assert!(matches!(err, MenderError::GateRejected { .. }));
        assert!(!orch.state().await.rolled_back);
    }

    // 7. Paused outcome stops the run without error and without retries
    #[tokio::test]
    async fn paused_stage_stops_run() {
        let orch = Orchestrator::new(Counter::default());
        let stages = vec![
            StageDefinition::from_fn("ask", "Ask", |ctx: &Counter, _| {
                Box::pin(async move {
                    ctx.calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Outcome::paused(vec![Question::new("Which environment?")]))
                })
            })
            .retries(3),
            flaky(0),
        ];

        let results = orch.execute(&stages).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results.get("ask").unwrap().status, StageStatus::Paused);
        assert_eq!(orch.context().calls.load(Ordering::SeqCst), 1);
        assert_eq!(orch.state().await.status, RunStatus::Paused);
    }

    // 8. Later stages see earlier results; state starts idle
    #[tokio::test]
    async fn later_stages_read_earlier_results() {
        let orch = Orchestrator::new(());
        assert_eq!(orch.state().await.status, RunStatus::Idle);

        let stages = vec![
            StageDefinition::from_fn("a", "A", |_: &(), _| Box::pin(async { Outcome::completed(20) })),
            StageDefinition::from_fn("b", "B", |_: &(), results| {
                Box::pin(async move {
                    let a: i32 = results.data("a")?.unwrap_or_default();
                    Outcome::completed(a + 1)
                })
            }),
        ];

        let results = orch.execute(&stages).await.unwrap();
        assert_eq!(results.stage_ids(), vec!["a", "b"]);
        assert_eq!(orch.result::<i32>("b").await.unwrap(), Some(21));
        let state = orch.state().await;
        assert!(state.run_id.is_some());
        assert!(state.completed_at.is_some());
    }
}
