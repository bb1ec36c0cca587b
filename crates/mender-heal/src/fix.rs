//! Granular fix actions: independently appliable, independently verifiable.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use mender_types::{MenderError, Result};

use crate::executor::{shell_quote, CommandExecutor};

/// Outcome of applying one fix or one heal iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixResult {
    pub action_id: String,
    pub description: String,
    pub success: bool,
    pub output: String,
}

impl FixResult {
    pub fn ok(fix: &dyn GranularFix, output: impl Into<String>) -> Self {
        Self {
            action_id: fix.id().to_string(),
            description: fix.description().to_string(),
            success: true,
            output: output.into(),
        }
    }

    pub fn failed(fix: &dyn GranularFix, output: impl Into<String>) -> Self {
        Self {
            success: false,
            ..Self::ok(fix, output)
        }
    }
}

#[async_trait]
pub trait GranularFix: Send + Sync {
    fn id(&self) -> &str;

    fn description(&self) -> &str;

    /// Apply the fix to the workspace rooted at `base`.
    ///
    /// `Ok` with `success: false` and `Err` are both treated as a failed fix.
    async fn apply(&self, base: &Path) -> Result<FixResult>;
}

// ---------------------------------------------------------------------------
// PatchFix
// ---------------------------------------------------------------------------

/// Applies a unified diff with `git apply`.
pub struct PatchFix {
    id: String,
    description: String,
    patch: String,
    exec: Arc<dyn CommandExecutor>,
}

impl PatchFix {
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        patch: impl Into<String>,
        exec: Arc<dyn CommandExecutor>,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            patch: patch.into(),
            exec,
        }
    }
}

const PATCH_EOF: &str = "MENDER_PATCH_EOF";

#[async_trait]
impl GranularFix for PatchFix {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn apply(&self, base: &Path) -> Result<FixResult> {
        if self.patch.lines().any(|l| l == PATCH_EOF) {
            return Err(MenderError::Other(format!(
                "patch for {} contains the heredoc terminator",
                self.id
            )));
        }
        let mut patch = self.patch.clone();
        if !patch.ends_with('\n') {
            patch.push('\n');
        }
        let command = format!(
            "cd {} && git apply --whitespace=nowarn - <<'{PATCH_EOF}'\n{patch}{PATCH_EOF}",
            shell_quote(&base.to_string_lossy()),
        );
        let result = self.exec.exec(&command, None).await?;
        let output = result.combined_output();
        Ok(if result.success() {
            FixResult::ok(self, output)
        } else {
            FixResult::failed(self, output)
        })
    }
}

// ---------------------------------------------------------------------------
// WriteFileFix
// ---------------------------------------------------------------------------

/// Replaces one file's contents.
pub struct WriteFileFix {
    id: String,
    description: String,
    path: PathBuf,
    contents: String,
}

impl WriteFileFix {
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        path: impl Into<PathBuf>,
        contents: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            path: path.into(),
            contents: contents.into(),
        }
    }
}

#[async_trait]
impl GranularFix for WriteFileFix {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn apply(&self, base: &Path) -> Result<FixResult> {
        let target = base.join(&self.path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, &self.contents).await?;
        Ok(FixResult::ok(
            self,
            format!("wrote {} bytes to {}", self.contents.len(), self.path.display()),
        ))
    }
}

// ---------------------------------------------------------------------------
// Serializable fix list
// ---------------------------------------------------------------------------

/// JSON form of a fix, as read from a fixes file.
///
/// ```json
/// [
///   { "kind": "patch", "id": "f1", "description": "guard null", "patch": "--- a/x\n+++ b/x\n..." },
///   { "kind": "write", "id": "f2", "description": "pin version", "path": "VERSION", "contents": "1.2.0\n" }
/// ]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FixSpec {
    Patch {
        id: String,
        description: String,
        patch: String,
    },
    Write {
        id: String,
        description: String,
        path: PathBuf,
        contents: String,
    },
}

impl FixSpec {
    pub fn into_fix(self, exec: Arc<dyn CommandExecutor>) -> Box<dyn GranularFix> {
        match self {
            FixSpec::Patch {
                id,
                description,
                patch,
            } => Box::new(PatchFix::new(id, description, patch, exec)),
            FixSpec::Write {
                id,
                description,
                path,
                contents,
            } => Box::new(WriteFileFix::new(id, description, path, contents)),
        }
    }
}

/// Parse a JSON array of [`FixSpec`]s into runnable fixes.
pub fn load_fixes(json: &str, exec: Arc<dyn CommandExecutor>) -> Result<Vec<Box<dyn GranularFix>>> {
    let specs: Vec<FixSpec> = serde_json::from_str(json)
        .map_err(|e| MenderError::Config(format!("invalid fixes file: {e}")))?;
    Ok(specs.into_iter().map(|s| s.into_fix(exec.clone())).collect())
}
