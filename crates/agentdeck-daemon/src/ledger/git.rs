//! Git plumbing for execution checkpoints.
//!
//! Every operation shells out to the `git` CLI in the session's working
//! directory. Nothing here touches the user's real index except
//! [`GitDiff::commit_all`].

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Errors from git operations.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("Failed to run git: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("git {args} failed ({status}): {stderr}")]
    Command {
        args: String,
        status: String,
        stderr: String,
    },

    #[error("Unexpected git output: {0}")]
    InvalidOutput(String),
}

/// Size and content of a change between two trees.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffSummary {
    pub files_changed: i64,
    pub insertions: i64,
    pub deletions: i64,
    /// `git diff --binary` output, byte for byte; applies with
    /// `git apply --binary`. Not necessarily UTF-8.
    pub patch: Vec<u8>,
}

impl DiffSummary {
    pub fn is_empty(&self) -> bool {
        self.files_changed == 0
    }
}

/// Thin async wrapper over the `git` executable.
#[derive(Debug, Clone)]
pub struct GitDiff {
    program: PathBuf,
}

impl Default for GitDiff {
    fn default() -> Self {
        Self::new("git")
    }
}

impl GitDiff {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(
        &self,
        dir: &Path,
        args: &[&str],
        envs: &[(&str, &OsStr)],
        stdin: Option<&[u8]>,
    ) -> Result<Vec<u8>, GitError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .current_dir(dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("LC_ALL", "C")
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in envs {
            cmd.env(key, value);
        }

        let start = std::time::Instant::now();
        let mut child = cmd.spawn()?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input).await?;
            drop(pipe);
        }
        let output = child.wait_with_output().await?;
        debug!(
            dir = %dir.display(),
            args = %args.join(" "),
            elapsed_ms = start.elapsed().as_millis(),
            status = %output.status,
            "git finished"
        );

        if !output.status.success() {
            return Err(GitError::Command {
                args: args.join(" "),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    async fn run_text(&self, dir: &Path, args: &[&str]) -> Result<String, GitError> {
        let out = self.run(dir, args, &[], None).await?;
        Ok(String::from_utf8_lossy(&out).trim().to_string())
    }

    /// Whether `dir` is inside a work tree.
    pub async fn is_repository(&self, dir: &Path) -> bool {
        matches!(
            self.run_text(dir, &["rev-parse", "--is-inside-work-tree"]).await.as_deref(),
            Ok("true")
        )
    }

    /// Full hash of `HEAD`.
    pub async fn head_commit(&self, dir: &Path) -> Result<String, GitError> {
        let hash = self
            .run_text(dir, &["rev-parse", "--verify", "HEAD^{commit}"])
            .await?;
        validate_hash(hash)
    }

    /// Tracked modifications or untracked, non-ignored files exist.
    pub async fn is_dirty(&self, dir: &Path) -> Result<bool, GitError> {
        let out = self
            .run(
                dir,
                &["status", "--porcelain", "--untracked-files=all"],
                &[("GIT_OPTIONAL_LOCKS", OsStr::new("0"))],
                None,
            )
            .await?;
        Ok(!out.iter().all(u8::is_ascii_whitespace))
    }

    /// Stage everything and commit. Hooks run, so a rejecting hook surfaces
    /// as an error. Returns the new `HEAD`.
    pub async fn commit_all(&self, dir: &Path, message: &str) -> Result<String, GitError> {
        self.run(dir, &["add", "-A"], &[], None).await?;
        self.run(dir, &["commit", "--quiet", "-m", message], &[], None)
            .await?;
        self.head_commit(dir).await
    }

    /// Hash of a tree holding the current working-tree contents, untracked
    /// files included. Built in a throwaway index seeded from `HEAD`, so
    /// tracked files that match `.gitignore` stay in the tree. The real
    /// index is untouched.
    pub async fn snapshot_tree(&self, dir: &Path) -> Result<String, GitError> {
        let scratch = tempfile::tempdir()?;
        let index = scratch.path().join("index");
        let envs = [("GIT_INDEX_FILE", index.as_os_str())];

        self.run(dir, &["read-tree", "HEAD"], &envs, None).await?;
        self.run(dir, &["add", "-A"], &envs, None).await?;
        let out = self.run(dir, &["write-tree"], &envs, None).await?;
        validate_hash(String::from_utf8_lossy(&out).trim().to_string())
    }

    /// Binary-safe patch and line stats between two tree-ish revisions.
    pub async fn diff(&self, dir: &Path, from: &str, to: &str) -> Result<DiffSummary, GitError> {
        let common = ["--no-color", "--no-ext-diff", "--no-renames"];

        let mut numstat_args = vec!["diff", "--numstat"];
        numstat_args.extend(common);
        numstat_args.extend([from, to]);
        let numstat = self.run_text(dir, &numstat_args).await?;

        let mut patch_args = vec!["diff", "--binary"];
        patch_args.extend(common);
        patch_args.extend([from, to]);
        let patch = self.run(dir, &patch_args, &[], None).await?;

        let mut summary = parse_numstat(&numstat)?;
        summary.patch = patch;
        Ok(summary)
    }

    /// Apply a patch produced by [`GitDiff::diff`] to the working tree.
    pub async fn apply_patch(&self, dir: &Path, patch: &[u8]) -> Result<(), GitError> {
        if patch.iter().all(u8::is_ascii_whitespace) {
            return Ok(());
        }
        self.run(
            dir,
            &["apply", "--binary", "--whitespace=nowarn", "-"],
            &[],
            Some(patch),
        )
        .await?;
        Ok(())
    }
}

fn validate_hash(hash: String) -> Result<String, GitError> {
    if hash.len() >= 40 && hash.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(hash)
    } else {
        Err(GitError::InvalidOutput(format!("not an object id: {hash:?}")))
    }
}

/// Sum `git diff --numstat` lines. Binary files show `-` counts and only
/// add to the file total.
fn parse_numstat(output: &str) -> Result<DiffSummary, GitError> {
    let mut summary = DiffSummary::default();
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let mut fields = line.splitn(3, '\t');
        let (Some(added), Some(removed), Some(_path)) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(GitError::InvalidOutput(format!("numstat line: {line:?}")));
        };
        summary.files_changed += 1;
        summary.insertions += added.parse::<i64>().unwrap_or(0);
        summary.deletions += removed.parse::<i64>().unwrap_or(0);
    }
    Ok(summary)
}
