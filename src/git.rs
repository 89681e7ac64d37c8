//! Thin wrapper over the `git` CLI.
//!
//! Every call runs with `GIT_TERMINAL_PROMPT=0` and races the job deadline;
//! losing the race drops the child, which kills it. Command output that can
//! reach logs or job records has the provider token masked.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use tokio::process::Command;

use crate::deadline::Deadline;
use crate::errors::GitError;

/// Author and committer identity applied to runner commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitIdentity {
    pub name: String,
    pub email: String,
}

impl Default for GitIdentity {
    fn default() -> Self {
        Self {
            name: "Repobox".to_string(),
            email: "bot@repobox.dev".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffStats {
    pub files: u32,
    pub added: u64,
    pub removed: u64,
}

/// `ghp_1234567890abcdefghijklmnop` -> `ghp_****mnop`. Tokens of 12 or fewer
/// characters are fully hidden.
pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 12 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}****{}", head, tail)
}

/// Rewrite an `https` URL to carry `oauth2:<token>` credentials. Any
/// credentials already present in the URL are replaced.
pub fn embed_token(url: &str, token: &str) -> Result<String, GitError> {
    let rest = url
        .strip_prefix("https://")
        .ok_or_else(|| GitError::UnsupportedScheme {
            url: url.to_string(),
        })?;
    let (authority, path) = match rest.find('/') {
        Some(idx) => rest.split_at(idx),
        None => (rest, ""),
    };
    let host = authority.rsplit_once('@').map(|(_, h)| h).unwrap_or(authority);
    Ok(format!("https://oauth2:{}@{}{}", token, host, path))
}

/// Parse `git diff --numstat`. Binary files (`-\t-\tpath`) count as 0/0;
/// lines that do not have the three-column shape are skipped.
pub fn parse_numstat(output: &str) -> DiffStats {
    let mut stats = DiffStats::default();
    for line in output.lines() {
        let mut cols = line.splitn(3, '\t');
        let (Some(added), Some(removed), Some(path)) = (cols.next(), cols.next(), cols.next())
        else {
            continue;
        };
        if path.is_empty() {
            continue;
        }
        let parse = |col: &str| -> Option<u64> {
            if col == "-" { Some(0) } else { col.parse().ok() }
        };
        let (Some(added), Some(removed)) = (parse(added), parse(removed)) else {
            continue;
        };
        stats.files += 1;
        stats.added += added;
        stats.removed += removed;
    }
    stats
}

#[derive(Debug, Clone)]
pub struct GitOperator {
    token: Option<SecretString>,
    identity: GitIdentity,
}

impl GitOperator {
    pub fn new(token: Option<SecretString>, identity: GitIdentity) -> Self {
        Self { token, identity }
    }

    /// Anonymous operator, for public repositories and local remotes.
    pub fn anonymous(identity: GitIdentity) -> Self {
        Self::new(None, identity)
    }

    fn mask(&self, text: &str) -> String {
        match self.token.as_ref().map(|t| t.expose_secret()) {
            Some(token) if !token.is_empty() => text.replace(token, &mask_token(token)),
            _ => text.to_string(),
        }
    }

    async fn output(
        &self,
        dir: Option<&Path>,
        args: &[&str],
        deadline: &Deadline,
    ) -> Result<std::process::Output, GitError> {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_AUTHOR_NAME", &self.identity.name)
            .env("GIT_AUTHOR_EMAIL", &self.identity.email)
            .env("GIT_COMMITTER_NAME", &self.identity.name)
            .env("GIT_COMMITTER_EMAIL", &self.identity.email)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }

        let subcommand = args.first().copied().unwrap_or("");
        tracing::debug!(command = subcommand, "running git");

        let child = cmd.spawn().map_err(GitError::Spawn)?;
        tokio::select! {
            out = child.wait_with_output() => out.map_err(GitError::Spawn),
            expiry = deadline.expired() => Err(expiry.into()),
        }
    }

    /// Run and require success. Returns stdout.
    async fn run(
        &self,
        dir: Option<&Path>,
        args: &[&str],
        deadline: &Deadline,
    ) -> Result<String, GitError> {
        let output = self.output(dir, args, deadline).await?;
        if !output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let stdout = String::from_utf8_lossy(&output.stdout);
            if !stdout.trim().is_empty() {
                if !combined.is_empty() {
                    combined.push('\n');
                }
                combined.push_str(stdout.trim());
            }
            return Err(GitError::CommandFailed {
                command: args.first().copied().unwrap_or("").to_string(),
                output: self.mask(&combined),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    pub async fn clone(&self, url: &str, dest: &Path, deadline: &Deadline) -> Result<(), GitError> {
        let dest_str = dest.to_string_lossy();
        let Some(token) = self.token.as_ref() else {
            self.run(None, &["clone", "--", url, &dest_str], deadline)
                .await?;
            return Ok(());
        };

        let authed = embed_token(url, token.expose_secret())?;
        self.run(None, &["clone", "--", &authed, &dest_str], deadline)
            .await?;

        let restore = Deadline::after(Duration::from_secs(30));
        if let Err(e) = self
            .run(Some(dest), &["remote", "set-url", "origin", url], &restore)
            .await
        {
            tracing::warn!(error = %e, "failed to strip credentials from origin after clone");
        }
        Ok(())
    }

    pub async fn create_branch(
        &self,
        repo: &Path,
        name: &str,
        deadline: &Deadline,
    ) -> Result<(), GitError> {
        self.run(Some(repo), &["checkout", "-b", name], deadline)
            .await
            .map(|_| ())
    }

    pub async fn checkout(
        &self,
        repo: &Path,
        branch: &str,
        deadline: &Deadline,
    ) -> Result<(), GitError> {
        self.run(Some(repo), &["checkout", branch], deadline)
            .await
            .map(|_| ())
    }

    /// Branch HEAD points at, or `None` when HEAD is detached.
    pub async fn current_branch(
        &self,
        repo: &Path,
        deadline: &Deadline,
    ) -> Result<Option<String>, GitError> {
        match self
            .run(Some(repo), &["symbolic-ref", "--short", "-q", "HEAD"], deadline)
            .await
        {
            Ok(out) => {
                let name = out.trim();
                Ok((!name.is_empty()).then(|| name.to_string()))
            }
            Err(GitError::CommandFailed { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Stage everything and commit. Returns `false` without committing when
    /// nothing is staged.
    pub async fn commit(
        &self,
        repo: &Path,
        message: &str,
        deadline: &Deadline,
    ) -> Result<bool, GitError> {
        self.run(Some(repo), &["add", "-A"], deadline).await?;

        let staged = self
            .output(Some(repo), &["diff", "--cached", "--quiet"], deadline)
            .await?;
        match staged.status.code() {
            Some(0) => return Ok(false),
            Some(1) => {}
            _ => {
                return Err(GitError::CommandFailed {
                    command: "diff".to_string(),
                    output: self.mask(String::from_utf8_lossy(&staged.stderr).trim()),
                });
            }
        }

        self.run(Some(repo), &["commit", "-m", message], deadline)
            .await?;
        Ok(true)
    }

    /// Push `branch` with upstream tracking. With a token, `origin` is
    /// pointed at the credentialed URL for the duration of the push and
    /// restored afterwards; a failed restore is logged, not returned.
    pub async fn push(&self, repo: &Path, branch: &str, deadline: &Deadline) -> Result<(), GitError> {
        let Some(token) = self.token.as_ref() else {
            self.run(Some(repo), &["push", "-u", "origin", branch], deadline)
                .await?;
            return Ok(());
        };

        let original = self
            .run(Some(repo), &["remote", "get-url", "origin"], deadline)
            .await?;
        let original = original.trim();
        let authed = embed_token(original, token.expose_secret())?;
        self.run(Some(repo), &["remote", "set-url", "origin", &authed], deadline)
            .await?;

        let pushed = self
            .run(Some(repo), &["push", "-u", "origin", branch], deadline)
            .await;

        // The job deadline may already have fired; restore on a fresh budget.
        let restore = Deadline::after(Duration::from_secs(30));
        if let Err(e) = self
            .run(Some(repo), &["remote", "set-url", "origin", original], &restore)
            .await
        {
            tracing::warn!(error = %e, "failed to restore origin URL after push");
        }

        pushed.map(|_| ())
    }

    pub async fn diff_stats(
        &self,
        repo: &Path,
        base: &str,
        deadline: &Deadline,
    ) -> Result<DiffStats, GitError> {
        let out = self
            .run(Some(repo), &["diff", "--numstat", base], deadline)
            .await?;
        Ok(parse_numstat(&out))
    }
}
