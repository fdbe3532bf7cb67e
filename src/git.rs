//! Git subprocess plumbing.
//!
//! All git argument construction lives here, behind the [`GitRunner`] port
//! so orchestration code can be tested against a scripted fake instead of
//! a real binary. Commit/push/pull report "nothing to do" as `Ok(false)`;
//! a non-zero exit from a command that matters raises
//! [`WikiError::GitOperation`] carrying the captured stderr.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use crate::error::WikiError;

pub const MAX_COMMIT_MESSAGE_LEN: usize = 1000;

/// Captured result of one git invocation.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Port over the external git binary: `run(args, cwd)` and nothing else.
pub trait GitRunner: Send + Sync {
    fn run(&self, args: &[&str], cwd: &Path) -> std::io::Result<GitOutput>;
}

/// Production runner that shells out to `git`.
pub struct SystemGit;

impl GitRunner for SystemGit {
    fn run(&self, args: &[&str], cwd: &Path) -> std::io::Result<GitOutput> {
        let output = Command::new("git").args(args).current_dir(cwd).output()?;
        Ok(GitOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Validate and normalize a commit message.
pub fn validate_commit_message(message: &str) -> Result<String, WikiError> {
    let message = message.trim();

    if message.is_empty() {
        return Err(WikiError::InvalidCommitMessage("message cannot be empty".into()));
    }
    if message.len() > MAX_COMMIT_MESSAGE_LEN {
        return Err(WikiError::InvalidCommitMessage(format!(
            "message too long (max {} characters)",
            MAX_COMMIT_MESSAGE_LEN
        )));
    }
    if message.contains('\0') {
        return Err(WikiError::InvalidCommitMessage(
            "message contains invalid characters".into(),
        ));
    }

    Ok(message.to_string())
}

/// A commit from `git log`, restricted to the page files it touched.
#[derive(Debug, Clone)]
pub struct ChangeEntry {
    pub sha: String,
    pub date: String,
    pub message: String,
    pub files: Vec<String>,
}

/// Git operations against one working copy.
///
/// Operations that mutate the working copy or talk to the remote are
/// serialized behind an internal lock: interleaved `git add`/`commit`
/// sequences from parallel workers would corrupt each other's staging.
pub struct GitClient {
    repo_path: PathBuf,
    branch: String,
    remote_url: String,
    runner: Box<dyn GitRunner>,
    op_lock: Mutex<()>,
}

impl GitClient {
    pub fn new(repo_path: PathBuf, branch: String, remote_url: String) -> Self {
        Self::with_runner(repo_path, branch, remote_url, Box::new(SystemGit))
    }

    pub fn with_runner(
        repo_path: PathBuf,
        branch: String,
        remote_url: String,
        runner: Box<dyn GitRunner>,
    ) -> Self {
        Self {
            repo_path,
            branch,
            remote_url,
            runner,
            op_lock: Mutex::new(()),
        }
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    fn run(&self, args: &[&str]) -> Result<GitOutput, WikiError> {
        self.runner
            .run(args, &self.repo_path)
            .map_err(|e| WikiError::GitOperation(format!("failed to execute git {:?}: {}", args, e)))
    }

    fn run_checked(&self, args: &[&str]) -> Result<GitOutput, WikiError> {
        let output = self.run(args)?;
        if !output.success() {
            return Err(WikiError::GitOperation(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or(""),
                output.stderr.trim()
            )));
        }
        Ok(output)
    }

    /// Create the working copy if it is missing: clone when a remote is
    /// configured, otherwise `git init` with empty `pages/` and
    /// `attachments/` trees. Idempotent.
    pub fn ensure_repo_exists(&self) -> Result<(), WikiError> {
        if !self.repo_path.exists() {
            std::fs::create_dir_all(&self.repo_path)
                .map_err(|e| WikiError::GitOperation(format!("cannot create repo dir: {}", e)))?;
        }

        if self.repo_path.join(".git").exists() {
            return Ok(());
        }

        if !self.remote_url.is_empty() {
            let mut args = vec!["clone"];
            if !self.branch.is_empty() {
                args.extend(["--branch", self.branch.as_str()]);
            }
            args.extend([self.remote_url.as_str(), "."]);
            self.run_checked(&args)?;
        } else {
            self.run_checked(&["init"])?;
            for dir in ["pages", "attachments"] {
                std::fs::create_dir_all(self.repo_path.join(dir)).map_err(|e| {
                    WikiError::GitOperation(format!("cannot create {} dir: {}", dir, e))
                })?;
            }
        }

        Ok(())
    }

    /// Stage everything, commit, and push when a remote is configured.
    ///
    /// Returns `Ok(false)` when the working tree is clean (nothing to
    /// commit is not a failure).
    pub fn commit_and_push(&self, message: &str) -> Result<bool, WikiError> {
        let message = validate_commit_message(message)?;
        let _guard = self.op_lock.lock().unwrap_or_else(|e| e.into_inner());

        self.run_checked(&["add", "-A"])?;

        let status = self.run(&["status", "--porcelain"])?;
        if status.stdout.trim().is_empty() {
            return Ok(false);
        }

        self.run_checked(&["commit", "-m", &message])?;

        let remotes = self.run(&["remote"])?;
        if !remotes.stdout.trim().is_empty() {
            let mut args = vec!["push"];
            if !self.branch.is_empty() {
                args.extend(["origin", self.branch.as_str()]);
            }
            self.run_checked(&args)?;
        }

        Ok(true)
    }

    /// Pull latest changes. Returns `Ok(false)` when no remote is
    /// configured.
    pub fn pull(&self) -> Result<bool, WikiError> {
        let _guard = self.op_lock.lock().unwrap_or_else(|e| e.into_inner());

        let remotes = self.run(&["remote"])?;
        if remotes.stdout.trim().is_empty() {
            return Ok(false);
        }

        let mut args = vec!["pull", "--rebase"];
        if !self.branch.is_empty() {
            args.extend(["origin", self.branch.as_str()]);
        }
        self.run_checked(&args)?;
        Ok(true)
    }

    /// Recent commits touching page files. Log reads are non-critical, so
    /// any failure yields an empty list rather than an error.
    pub fn recent_changes(&self, limit: usize) -> Vec<ChangeEntry> {
        let limit = limit.clamp(1, 1000);
        let count = format!("-{}", limit);

        let output = match self.run(&[
            "log",
            count.as_str(),
            "--name-only",
            "--pretty=format:%H|%ai|%s",
        ]) {
            Ok(output) if output.success() => output,
            Ok(_) | Err(_) => return Vec::new(),
        };

        parse_log_output(&output.stdout)
    }

    /// GitHub web URL for a page's source file, when the remote looks
    /// like GitHub. SSH and HTTPS remote formats are both recognized.
    pub fn source_url(&self, page_path: &str) -> Option<String> {
        if self.remote_url.is_empty() {
            return None;
        }

        let branch = if self.branch.is_empty() { "main" } else { &self.branch };

        let org_repo = self
            .remote_url
            .strip_prefix("git@github.com:")
            .or_else(|| {
                self.remote_url
                    .strip_prefix("https://github.com/")
                    .or_else(|| self.remote_url.strip_prefix("http://github.com/"))
            })
            .map(|rest| rest.trim_end_matches(".git"));

        match org_repo {
            Some(org_repo) if org_repo.contains('/') => Some(format!(
                "https://github.com/{}/blob/{}/pages/{}.md",
                org_repo, branch, page_path
            )),
            _ => {
                tracing::warn!(remote = %self.remote_url, "remote URL is not a recognized GitHub format");
                None
            }
        }
    }
}

fn parse_log_output(stdout: &str) -> Vec<ChangeEntry> {
    let mut changes: Vec<ChangeEntry> = Vec::new();

    for line in stdout.lines() {
        if line.contains('|') {
            let mut parts = line.splitn(3, '|');
            if let (Some(sha), Some(date), Some(message)) =
                (parts.next(), parts.next(), parts.next())
            {
                changes.push(ChangeEntry {
                    sha: sha.to_string(),
                    date: date.to_string(),
                    message: message.to_string(),
                    files: Vec::new(),
                });
            }
        } else if !line.trim().is_empty() {
            if let Some(current) = changes.last_mut() {
                if let Some(page) = line.strip_prefix("pages/").and_then(|p| p.strip_suffix(".md"))
                {
                    current.files.push(page.to_string());
                }
            }
        }
    }

    changes
}
