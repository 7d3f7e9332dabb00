use std::path::Path;

use async_trait::async_trait;

use crate::error::{AppError, Result};
use crate::process::{CommandRunner, ExecOptions};

/// Repository-management operations, each a single git invocation through
/// the command runner.
#[async_trait]
pub trait Vcs: Send + Sync {
    async fn clone_repo(&self, url: &str, destination: &Path) -> Result<()>;

    /// Forced checkout of a revision.
    async fn checkout(&self, dir: &Path, revision: &str) -> Result<()>;

    async fn fetch(&self, dir: &Path) -> Result<()>;

    /// Remove untracked files and directories, including ignored ones.
    async fn clean(&self, dir: &Path) -> Result<()>;

    /// Cheap validity probe of an existing clone: does `git remote -v`
    /// succeed in it?
    async fn remote_ok(&self, dir: &Path) -> Result<bool>;
}

/// Validate a revision to prevent argument injection.
/// Rejects values starting with `-` as defence in depth.
fn validate_revision(revision: &str) -> Result<()> {
    if revision.starts_with('-') {
        return Err(AppError::Git(format!(
            "Invalid revision (starts with '-'): {revision}"
        )));
    }
    Ok(())
}

pub struct GitClient {
    runner: CommandRunner,
    git_path: String,
}

impl GitClient {
    pub fn new() -> Self {
        Self::with_git_path("git")
    }

    pub fn with_git_path(git_path: &str) -> Self {
        Self {
            runner: CommandRunner::new(),
            git_path: git_path.to_string(),
        }
    }

    async fn run(&self, args: &[&str], cwd: Option<&Path>) -> Result<()> {
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(self.git_path.clone());
        argv.extend(args.iter().map(|s| s.to_string()));
        self.runner
            .execute(&argv, cwd, &ExecOptions::default())
            .await?;
        Ok(())
    }
}

impl Default for GitClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Vcs for GitClient {
    async fn clone_repo(&self, url: &str, destination: &Path) -> Result<()> {
        let destination = destination.to_string_lossy();
        self.run(&["clone", url, destination.as_ref()], None).await
    }

    async fn checkout(&self, dir: &Path, revision: &str) -> Result<()> {
        validate_revision(revision)?;
        self.run(&["checkout", "--force", revision], Some(dir)).await
    }

    async fn fetch(&self, dir: &Path) -> Result<()> {
        self.run(&["fetch", "--force"], Some(dir)).await
    }

    async fn clean(&self, dir: &Path) -> Result<()> {
        self.run(&["clean", "--force", "-d", "-x"], Some(dir)).await
    }

    async fn remote_ok(&self, dir: &Path) -> Result<bool> {
        let argv = vec![
            self.git_path.clone(),
            "remote".to_string(),
            "-v".to_string(),
        ];
        let opts = ExecOptions {
            no_throw: true,
            ..Default::default()
        };
        let code = self.runner.execute(&argv, Some(dir), &opts).await?;
        Ok(code == 0)
    }
}
