use std::path::PathBuf;

use futures::future::BoxFuture;
use tracing::debug;

use strata_core::error::{Result, StrataError};
use strata_core::traits::BranchCreator;

/// Branch creator used when VCS integration is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBranchCreator;

impl BranchCreator for NoopBranchCreator {
    fn create_branch(&self, name: String, base_ref: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            debug!(branch = %name, base_ref = %base_ref, "VCS disabled, branch not created");
            Ok(())
        })
    }
}

/// Creates local git branches with `git branch <name> <base>`.
#[derive(Debug, Clone)]
pub struct GitBranchCreator {
    repo_dir: PathBuf,
}

impl GitBranchCreator {
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
        }
    }
}

impl BranchCreator for GitBranchCreator {
    fn create_branch(&self, name: String, base_ref: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            match run_git(&["branch", &name, &base_ref], &self.repo_dir).await {
                Ok(_) => {
                    debug!(branch = %name, base_ref = %base_ref, "Branch created");
                    Ok(())
                }
                // Re-running a node after a backtrack reuses its branch.
                Err(e) if e.contains("already exists") => {
                    debug!(branch = %name, "Branch already exists");
                    Ok(())
                }
                Err(e) => Err(StrataError::Branch(format!("{}: {}", name, e.trim()))),
            }
        })
    }
}

async fn run_git(args: &[&str], cwd: &std::path::Path) -> std::result::Result<String, String> {
    let output = tokio::process::Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .await
        .map_err(|e| format!("Failed to run git: {}", e))?;
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    if output.status.success() {
        Ok(if stdout.is_empty() { stderr } else { stdout })
    } else {
        Err(if stderr.is_empty() { stdout } else { stderr })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_always_succeeds() {
        assert!(NoopBranchCreator
            .create_branch("strata/X-1/a".into(), "main".into())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn git_outside_repository_reports_branch_error() {
        let dir = tempfile::tempdir().unwrap();
        let creator = GitBranchCreator::new(dir.path());
        // Either git is missing or the directory is not a repository.
        let err = creator
            .create_branch("strata/X-1/a".into(), "main".into())
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::Branch(_)));
    }
}
