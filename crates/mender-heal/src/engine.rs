//! The self-heal loop.
//!
//! Given a safe head and the fixes that were applied before verification
//! failed, rebuild the workspace one fix at a time, try a bounded
//! diagnostics-driven repair, and guarantee that whatever state is left behind
//! has just been built and tested: healed and passing, or reset to the safe
//! head.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use mender_types::{MenderError, Result};

use crate::checkpoint::{CheckpointId, CheckpointStore};
use crate::diagnostics::parse_build_errors;
use crate::executor::CommandExecutor;
use crate::fix::{FixResult, GranularFix};
use crate::fixer::FileFixer;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealConfig {
    pub build_command: String,
    /// No test command means tests are considered passing.
    pub test_command: Option<String>,
    #[serde(with = "mender_types::duration_serde")]
    pub build_timeout: Duration,
    #[serde(with = "mender_types::duration_serde")]
    pub test_timeout: Duration,
    pub max_iterations: usize,
    pub max_files_per_iteration: usize,
}

impl Default for HealConfig {
    fn default() -> Self {
        Self {
            build_command: "npm run build".into(),
            test_command: Some("npm test".into()),
            build_timeout: Duration::from_secs(600),
            test_timeout: Duration::from_secs(600),
            max_iterations: 3,
            max_files_per_iteration: 5,
        }
    }
}

impl HealConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    pub fn from_json(data: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(data)
            .map_err(|e| MenderError::Config(format!("invalid heal config: {e}")))?;
        if config.build_command.trim().is_empty() {
            return Err(MenderError::Config("build_command must not be empty".into()));
        }
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// One round of the diagnostics-driven repair loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealIteration {
    pub iteration: usize,
    pub errors_found: usize,
    pub files_fixed: usize,
    pub build_passed: bool,
    pub errors: Vec<String>,
    #[serde(default)]
    pub stalled: bool,
}

/// Build and test status of the current tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    pub build_passed: bool,
    pub tests_passed: bool,
    pub build_output: String,
    pub test_output: String,
}

impl Verification {
    pub fn passed(&self) -> bool {
        self.build_passed && self.tests_passed
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelfHealResult {
    pub applied_fixes: Vec<FixResult>,
    pub rolled_back_fixes: Vec<FixResult>,
    pub heal_iterations: Vec<HealIteration>,
    pub build_passed: bool,
    pub tests_passed: bool,
    pub build_output: String,
    pub test_output: String,
    /// The workspace was reset to the safe head as a last resort.
    pub reset_to_safe_head: bool,
}

impl SelfHealResult {
    pub fn healed(&self) -> bool {
        self.build_passed && self.tests_passed && !self.reset_to_safe_head
    }

    /// Anything was discarded: a rolled-back fix or the floor reset.
    pub fn rolled_back(&self) -> bool {
        self.reset_to_safe_head || !self.rolled_back_fixes.is_empty()
    }

    fn record(&mut self, v: Verification) {
        self.build_passed = v.build_passed;
        self.tests_passed = v.tests_passed;
        self.build_output = v.build_output;
        self.test_output = v.test_output;
    }

    /// Plain-text report for humans.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let status = if self.healed() {
            "healed"
        } else if self.reset_to_safe_head {
            "reset to safe head"
        } else {
            "not healed"
        };
        out.push_str(&format!(
            "Self-heal {status}: build {}, tests {}\n",
            pass_fail(self.build_passed),
            pass_fail(self.tests_passed)
        ));
        out.push_str(&format!(
            "Fixes: {} applied, {} rolled back\n",
            self.applied_fixes.len(),
            self.rolled_back_fixes.len()
        ));
        for fix in &self.applied_fixes {
            out.push_str(&format!("  + {} {}\n", fix.action_id, fix.description));
        }
        for fix in &self.rolled_back_fixes {
            out.push_str(&format!("  - {} {}\n", fix.action_id, fix.description));
        }
        for it in &self.heal_iterations {
            out.push_str(&format!(
                "Iteration {}: {} errors, {} files fixed, build {}{}\n",
                it.iteration,
                it.errors_found,
                it.files_fixed,
                pass_fail(it.build_passed),
                if it.stalled { " (stalled)" } else { "" }
            ));
        }
        out
    }
}

fn pass_fail(ok: bool) -> &'static str {
    if ok {
        "passed"
    } else {
        "failed"
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct SelfHealEngine {
    base: PathBuf,
    config: HealConfig,
    exec: Arc<dyn CommandExecutor>,
    store: Arc<dyn CheckpointStore>,
    fixer: Arc<dyn FileFixer>,
}

impl SelfHealEngine {
    pub fn new(
        base: impl Into<PathBuf>,
        config: HealConfig,
        exec: Arc<dyn CommandExecutor>,
        store: Arc<dyn CheckpointStore>,
        fixer: Arc<dyn FileFixer>,
    ) -> Self {
        Self {
            base: base.into(),
            config,
            exec,
            store,
            fixer,
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn config(&self) -> &HealConfig {
        &self.config
    }

    /// Run the build; tests only when the build passes.
    pub async fn verify(&self) -> Result<Verification> {
        let build = self
            .exec
            .exec(&self.config.build_command, Some(self.config.build_timeout))
            .await?;
        let mut v = Verification {
            build_passed: build.success(),
            build_output: build.combined_output(),
            ..Verification::default()
        };
        if !v.build_passed {
            v.test_output = "skipped: build failed".into();
            return Ok(v);
        }
        match &self.config.test_command {
            Some(command) => {
                let tests = self.exec.exec(command, Some(self.config.test_timeout)).await?;
                v.tests_passed = tests.success();
                v.test_output = tests.combined_output();
            }
            None => {
                v.tests_passed = true;
                v.test_output = "no test command configured".into();
            }
        }
        Ok(v)
    }

    async fn build(&self) -> Result<(bool, String)> {
        let build = self
            .exec
            .exec(&self.config.build_command, Some(self.config.build_timeout))
            .await?;
        Ok((build.success(), build.combined_output()))
    }

    /// Heal the workspace. Never fails: problems are reported in the result.
    pub async fn heal(&self, safe_head: &CheckpointId, fixes: &[Box<dyn GranularFix>]) -> SelfHealResult {
        tracing::info!(safe_head = %safe_head, fixes = fixes.len(), "Self-heal started");
        let mut result = SelfHealResult::default();

        if let Err(e) = self.run(safe_head, fixes, &mut result).await {
            tracing::error!(error = %e, "Self-heal aborted, resetting to safe head");
            let notes = format!("self-heal aborted: {e}");
            match self.store.reset_to(safe_head).await {
                Ok(()) => {
                    result.reset_to_safe_head = true;
                    match self.verify().await {
                        Ok(v) => {
                            let build_output = format!("{notes}\n{}", v.build_output);
                            result.record(Verification { build_output, ..v });
                        }
                        Err(e) => {
                            result.build_passed = false;
                            result.tests_passed = false;
                            result.build_output = format!("{notes}\nre-verification failed: {e}");
                        }
                    }
                }
                Err(reset) => {
                    result.build_passed = false;
                    result.tests_passed = false;
                    result.build_output = format!("{notes}\nfloor reset failed: {reset}");
                }
            }
        }

        tracing::info!(
            build_passed = result.build_passed,
            tests_passed = result.tests_passed,
            applied = result.applied_fixes.len(),
            rolled_back = result.rolled_back_fixes.len(),
            iterations = result.heal_iterations.len(),
            reset = result.reset_to_safe_head,
            "Self-heal finished"
        );
        result
    }

    async fn run(
        &self,
        safe_head: &CheckpointId,
        fixes: &[Box<dyn GranularFix>],
        result: &mut SelfHealResult,
    ) -> Result<()> {
        self.store.reset_to(safe_head).await?;

        self.reapply(safe_head, fixes, result).await?;

        let batch = self.verify().await?;
        let build_failed = !batch.build_passed;
        let build_output = batch.build_output.clone();
        result.record(batch);

        if build_failed {
            self.heal_loop(build_output, result).await?;
        }

        let last = self.verify().await?;
        if !last.passed() {
            tracing::warn!(safe_head = %safe_head, "Still failing, resetting to safe head");
            self.store.reset_to(safe_head).await?;
            result.reset_to_safe_head = true;
            let baseline = self.verify().await?;
            result.record(baseline);
        } else {
            result.record(last);
        }
        Ok(())
    }

    /// Re-apply fixes one by one, keeping only those that build.
    async fn reapply(
        &self,
        safe_head: &CheckpointId,
        fixes: &[Box<dyn GranularFix>],
        result: &mut SelfHealResult,
    ) -> Result<()> {
        // last checkpoint holding exactly the applied fixes
        let mut good = safe_head.clone();

        for fix in fixes {
            let snapshot = match self.store.snapshot().await {
                Ok(id) => id,
                Err(e) => {
                    tracing::warn!(fix = fix.id(), error = %e, "No snapshot, skipping fix");
                    self.store.reset_to(&good).await?;
                    result
                        .rolled_back_fixes
                        .push(FixResult::failed(fix.as_ref(), format!("not applied, snapshot failed: {e}")));
                    continue;
                }
            };

            let applied = match fix.apply(&self.base).await {
                Ok(r) => r,
                Err(e) => FixResult::failed(fix.as_ref(), e.to_string()),
            };
            if !applied.success {
                tracing::warn!(fix = fix.id(), "Fix did not apply, rolling back");
                self.store.restore(&snapshot).await?;
                result.rolled_back_fixes.push(applied);
                continue;
            }

            let (passed, output) = self.build().await?;
            if !passed {
                tracing::warn!(fix = fix.id(), "Build failed after fix, rolling back");
                self.store.restore(&snapshot).await?;
                result
                    .rolled_back_fixes
                    .push(FixResult::failed(fix.as_ref(), output));
                continue;
            }

            match self
                .store
                .commit(&format!("mender: {} ({})", fix.description(), fix.id()))
                .await
            {
                Ok(id) => {
                    tracing::info!(fix = fix.id(), checkpoint = %id, "Fix kept");
                    good = id;
                    result.applied_fixes.push(applied);
                }
                Err(e) => {
                    tracing::warn!(fix = fix.id(), error = %e, "Commit failed, rolling back");
                    self.store.reset_to(&good).await?;
                    result
                        .rolled_back_fixes
                        .push(FixResult::failed(fix.as_ref(), format!("checkpoint failed: {e}")));
                }
            }
        }
        Ok(())
    }

    /// Diagnostics-driven repair, bounded by `max_iterations`.
    async fn heal_loop(&self, mut output: String, result: &mut SelfHealResult) -> Result<()> {
        for iteration in 1..=self.config.max_iterations {
            let diagnostics = parse_build_errors(&output);
            if diagnostics.is_empty() {
                tracing::info!(iteration, "No parseable diagnostics, stopping heal loop");
                break;
            }

            let snapshot = self.store.snapshot().await?;
            let files = diagnostics.worst_files(self.config.max_files_per_iteration);
            let mut files_fixed = 0;
            for (file, errors) in &files {
                let outcome = self.fixer.fix_file(file, errors, &self.base).await;
                if outcome.success {
                    files_fixed += 1;
                } else {
                    tracing::debug!(file = %file, output = %outcome.output, "File fix failed");
                }
            }

            let (passed, rebuilt) = self.build().await?;
            let mut record = HealIteration {
                iteration,
                errors_found: diagnostics.error_count(),
                files_fixed,
                build_passed: passed,
                errors: diagnostics
                    .errors
                    .iter()
                    .map(|d| format!("{}:{}", d.file, d.to_error_string()))
                    .collect(),
                stalled: false,
            };
            tracing::info!(
                iteration,
                errors = record.errors_found,
                files_fixed,
                build_passed = passed,
                "Heal iteration finished"
            );

            if passed {
                self.store
                    .commit(&format!("mender: heal iteration {iteration}"))
                    .await?;
                result.heal_iterations.push(record);
                break;
            }

            let remaining = parse_build_errors(&rebuilt).error_count();
            if files_fixed == 0 && remaining >= record.errors_found {
                tracing::warn!(iteration, "Heal loop stalled, restoring pre-iteration snapshot");
                self.store.restore(&snapshot).await?;
                record.stalled = true;
                result.heal_iterations.push(record);
                break;
            }

            result.heal_iterations.push(record);
            output = rebuilt;
        }
        Ok(())
    }
}
