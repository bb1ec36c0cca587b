//! Snapshot / restore / commit over the working tree.
//!
//! The heal engine treats the workspace as a transaction log: every fix is
//! bracketed by a snapshot it can roll back to, and every fix that survives a
//! build becomes its own commit. [`GitCheckpointStore`] backs this with git;
//! another backend only has to honour the same four operations.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use mender_types::{MenderError, Result};

use crate::executor::{shell_quote, CommandExecutor};

/// Opaque handle to a recorded tree state.
///
/// `base` is the committed revision; `stash` holds uncommitted changes on top
/// of it when the snapshot was taken on a dirty tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointId {
    pub base: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stash: Option<String>,
}

impl CheckpointId {
    /// A plain committed revision such as a safe head.
    pub fn commit(rev: impl Into<String>) -> Self {
        Self {
            base: rev.into(),
            stash: None,
        }
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.stash {
            Some(stash) => write!(f, "{}+{}", short(&self.base), short(stash)),
            None => f.write_str(short(&self.base)),
        }
    }
}

fn short(rev: &str) -> &str {
    rev.get(..8).unwrap_or(rev)
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Record the current tree without changing it.
    async fn snapshot(&self) -> Result<CheckpointId>;

    /// Bring the tree back to exactly the state recorded by `snapshot`.
    async fn restore(&self, id: &CheckpointId) -> Result<()>;

    /// Make the current tree a durable checkpoint.
    async fn commit(&self, label: &str) -> Result<CheckpointId>;

    /// Discard everything and move to the committed revision of `id`.
    async fn reset_to(&self, id: &CheckpointId) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Git backend
// ---------------------------------------------------------------------------

pub struct GitCheckpointStore {
    exec: Arc<dyn CommandExecutor>,
    author: Option<(String, String)>,
}

impl GitCheckpointStore {
    pub fn new(exec: Arc<dyn CommandExecutor>) -> Self {
        Self { exec, author: None }
    }

    /// Commit identity, for workspaces without a configured git user.
    pub fn with_author(mut self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.author = Some((name.into(), email.into()));
        self
    }

    async fn git(&self, args: &str) -> Result<String> {
        let command = match &self.author {
            Some((name, email)) => format!(
                "git -c user.name={} -c user.email={} {}",
                shell_quote(name),
                shell_quote(email),
                args
            ),
            None => format!("git {args}"),
        };
        let result = self
            .exec
            .exec(&command, None)
            .await?
            .into_checked(&command)
            .map_err(|e| MenderError::Checkpoint(e.to_string()))?;
        Ok(result.stdout.trim().to_string())
    }

    async fn head(&self) -> Result<String> {
        self.git("rev-parse HEAD").await
    }

    async fn clean_reset(&self, rev: &str) -> Result<()> {
        self.git(&format!("reset --hard --quiet {}", shell_quote(rev))).await?;
        self.git("clean -fd --quiet").await?;
        Ok(())
    }

    /// The current HEAD, usable as a safe head before any fix is applied.
    pub async fn current_head(&self) -> Result<CheckpointId> {
        Ok(CheckpointId::commit(self.head().await?))
    }
}

#[async_trait]
impl CheckpointStore for GitCheckpointStore {
    async fn snapshot(&self) -> Result<CheckpointId> {
        let base = self.head().await?;
        // stage untracked files so the stash commit carries them too
        self.git("add -A").await?;
        let stash = self.git("stash create").await?;
        let id = CheckpointId {
            base,
            stash: (!stash.is_empty()).then_some(stash),
        };
        tracing::debug!(checkpoint = %id, "Snapshot taken");
        Ok(id)
    }

    async fn restore(&self, id: &CheckpointId) -> Result<()> {
        self.clean_reset(&id.base).await?;
        if let Some(stash) = &id.stash {
            self.git(&format!("stash apply --quiet {}", shell_quote(stash)))
                .await?;
        }
        tracing::debug!(checkpoint = %id, "Snapshot restored");
        Ok(())
    }

    async fn commit(&self, label: &str) -> Result<CheckpointId> {
        self.git("add -A").await?;
        self.git(&format!("commit --quiet --allow-empty -m {}", shell_quote(label)))
            .await?;
        let id = CheckpointId::commit(self.head().await?);
        tracing::debug!(checkpoint = %id, label, "Checkpoint committed");
        Ok(id)
    }

    async fn reset_to(&self, id: &CheckpointId) -> Result<()> {
        self.clean_reset(&id.base).await?;
        tracing::debug!(checkpoint = %id, "Reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::LocalExecutor;
    use std::path::Path;
    use tempfile::TempDir;

    async fn git_repo(dir: &Path) -> Option<GitCheckpointStore> {
        let exec: Arc<dyn CommandExecutor> = Arc::new(LocalExecutor::new(dir));
        let init = exec.exec("git init --quiet", None).await.ok()?;
        if !init.success() {
            return None;
        }
        let store = GitCheckpointStore::new(exec).with_author("Mender", "mender@localhost");
        std::fs::write(dir.join("a.txt"), "one\n").unwrap();
        store.commit("initial").await.ok()?;
        Some(store)
    }

    #[test]
    fn display_is_short() {
        let id = CheckpointId {
            base: "0123456789abcdef".into(),
            stash: Some("fedcba9876543210".into()),
        };
        assert_eq!(id.to_string(), "01234567+fedcba98");
        assert_eq!(CheckpointId::commit("abc").to_string(), "abc");
    }

    #[tokio::test]
    async fn snapshot_and_restore_dirty_tree() {
        let dir = TempDir::new().unwrap();
        let Some(store) = git_repo(dir.path()).await else {
            eprintln!("git unavailable, skipping");
            return;
        };

        std::fs::write(dir.path().join("a.txt"), "two\n").unwrap();
        std::fs::write(dir.path().join("new.txt"), "fresh\n").unwrap();
        let snap = store.snapshot().await.unwrap();
        assert!(snap.stash.is_some());

        std::fs::write(dir.path().join("a.txt"), "broken\n").unwrap();
        std::fs::write(dir.path().join("junk.txt"), "junk\n").unwrap();
        store.restore(&snap).await.unwrap();

        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "two\n");
        assert_eq!(std::fs::read_to_string(dir.path().join("new.txt")).unwrap(), "fresh\n");
        assert!(!dir.path().join("junk.txt").exists());
    }

    #[tokio::test]
    async fn commit_then_reset() {
        let dir = TempDir::new().unwrap();
        let Some(store) = git_repo(dir.path()).await else {
            eprintln!("git unavailable, skipping");
            return;
        };
        let safe = store.current_head().await.unwrap();

        std::fs::write(dir.path().join("a.txt"), "fixed\n").unwrap();
        let fixed = store.commit("fix: a").await.unwrap();
        assert_ne!(fixed, safe);

        store.reset_to(&safe).await.unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "one\n");
        assert_eq!(store.current_head().await.unwrap(), safe);
    }
}
