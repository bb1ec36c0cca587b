//! The file-fix operation and a small worker pool for bulk use.
//!
//! A [`FileFixer`] rewrites one file in place given its error strings. The heal
//! loop calls it sequentially; [`fix_files_in_parallel`] is for bulk jobs where
//! every file is disjoint and no shared build runs in between.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use crate::executor::{shell_quote, CommandExecutor};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixOutcome {
    pub success: bool,
    pub output: String,
}

impl FixOutcome {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
        }
    }
}

/// Opaque rewrite of one file, typically backed by a coding agent.
#[async_trait]
pub trait FileFixer: Send + Sync {
    async fn fix_file(&self, path: &str, errors: &[String], base: &Path) -> FixOutcome;
}

/// [`FileFixer`] running a shell command template.
///
/// `{file}` is replaced with the quoted file path and `{errors}` with the quoted,
/// newline-joined error list; the errors are also exported as `MENDER_ERRORS`.
pub struct CommandFileFixer {
    exec: Arc<dyn CommandExecutor>,
    template: String,
    timeout: Duration,
}

impl CommandFileFixer {
    pub fn new(exec: Arc<dyn CommandExecutor>, template: impl Into<String>) -> Self {
        Self {
            exec,
            template: template.into(),
            timeout: Duration::from_secs(300),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn render(&self, path: &str, errors: &[String], base: &Path) -> String {
        let joined = shell_quote(&errors.join("\n"));
        let body = self
            .template
            .replace("{file}", &shell_quote(path))
            .replace("{errors}", &joined);
        format!(
            "cd {} && export MENDER_ERRORS={} && {}",
            shell_quote(&base.to_string_lossy()),
            joined,
            body
        )
    }
}

#[async_trait]
impl FileFixer for CommandFileFixer {
    async fn fix_file(&self, path: &str, errors: &[String], base: &Path) -> FixOutcome {
        let command = self.render(path, errors, base);
        match self.exec.exec(&command, Some(self.timeout)).await {
            Ok(result) if result.success() => FixOutcome::ok(result.combined_output()),
            Ok(result) => FixOutcome::failed(result.combined_output()),
            Err(e) => FixOutcome::failed(e.to_string()),
        }
    }
}

/// Fix disjoint files with `workers` concurrent workers pulling from a shared
/// cursor. Results come back in input order.
pub async fn fix_files_in_parallel(
    files: Vec<(String, Vec<String>)>,
    fixer: Arc<dyn FileFixer>,
    base: PathBuf,
    workers: usize,
) -> Vec<FixOutcome> {
    let total = files.len();
    let files = Arc::new(files);
    let cursor = Arc::new(AtomicUsize::new(0));
    let mut set: JoinSet<Vec<(usize, FixOutcome)>> = JoinSet::new();

    for worker in 0..workers.clamp(1, total.max(1)) {
        let files = files.clone();
        let cursor = cursor.clone();
        let fixer = fixer.clone();
        let base = base.clone();
        set.spawn(async move {
            let mut done = Vec::new();
            loop {
                let index = cursor.fetch_add(1, Ordering::SeqCst);
                let Some((path, errors)) = files.get(index) else {
                    break;
                };
                tracing::debug!(worker, file = %path, "Fixing file");
                done.push((index, fixer.fix_file(path, errors, &base).await));
            }
            done
        });
    }

    let mut outcomes: Vec<Option<FixOutcome>> = vec![None; total];
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(done) => {
                for (index, outcome) in done {
                    outcomes[index] = Some(outcome);
                }
            }
            Err(e) => tracing::warn!(error = %e, "Fix worker panicked"),
        }
    }

    outcomes
        .into_iter()
        .map(|o| o.unwrap_or_else(|| FixOutcome::failed("worker did not complete")))
        .collect()
}
