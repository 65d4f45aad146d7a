//! Local checkout of the remote policy repository.
//!
//! # Purpose
//! Clones the configured remote on startup and fast-forwards it on demand by
//! shelling out to `git`.
//!
//! # Security notes
//! The access token travels as an `Authorization` header passed with
//! `git -c http.extraHeader=...`; it is never written into the clone's remote
//! URL or `.git/config`, and never logged.
use super::{PolicyError, PolicyResult};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Basic-auth user paired with the access token.
const AUTH_USER: &str = "inspektor";

#[async_trait]
pub trait PolicyRepository: Send + Sync {
    /// Reset the local directory and clone the remote, if one is configured.
    async fn init(&self) -> PolicyResult<()>;
    /// Fast-forward the checkout to the remote head.
    async fn pull(&self) -> PolicyResult<()>;
    fn is_enabled(&self) -> bool;
    fn local_path(&self) -> &Path;
    fn remote_url(&self) -> Option<&str>;
    async fn head_commit(&self) -> Option<String>;
}

#[derive(Debug, Clone)]
pub struct GitRepository {
    remote: Option<String>,
    access_token: Option<String>,
    path: PathBuf,
    git_bin: PathBuf,
}

impl GitRepository {
    pub fn new(
        remote: Option<String>,
        access_token: Option<String>,
        path: impl Into<PathBuf>,
        git_bin: impl Into<PathBuf>,
    ) -> Self {
        Self {
            remote: remote.filter(|url| !url.trim().is_empty()),
            access_token: access_token.filter(|token| !token.is_empty()),
            path: path.into(),
            git_bin: git_bin.into(),
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.git_bin);
        command.env("GIT_TERMINAL_PROMPT", "0");
        if let Some(token) = &self.access_token {
            command.arg("-c").arg(format!(
                "http.extraHeader=Authorization: Basic {}",
                basic_credentials(token)
            ));
        }
        command
    }

    async fn run(&self, mut command: Command, action: &'static str) -> PolicyResult<String> {
        let output = command.output().await.map_err(|err| {
            PolicyError::SyncFailure(format!("{action}: run {}: {err}", self.git_bin.display()))
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PolicyError::SyncFailure(format!(
                "{action}: git exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

fn basic_credentials(token: &str) -> String {
    STANDARD.encode(format!("{AUTH_USER}:{token}"))
}

#[async_trait]
impl PolicyRepository for GitRepository {
    async fn init(&self) -> PolicyResult<()> {
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(PolicyError::SyncFailure(format!(
                    "clean {}: {err}",
                    self.path.display()
                )));
            }
        }
        tokio::fs::create_dir_all(&self.path).await.map_err(|err| {
            PolicyError::SyncFailure(format!("create {}: {err}", self.path.display()))
        })?;

        let Some(remote) = &self.remote else {
            tracing::info!("no policy repository configured; policy sync disabled");
            return Ok(());
        };
        let mut command = self.command();
        command
            .arg("clone")
            .arg("--quiet")
            .arg(remote)
            .arg(&self.path);
        self.run(command, "clone").await?;
        tracing::info!(path = %self.path.display(), "policy repository cloned");
        Ok(())
    }

    async fn pull(&self) -> PolicyResult<()> {
        if self.remote.is_none() {
            return Ok(());
        }
        let mut command = self.command();
        command
            .arg("-C")
            .arg(&self.path)
            .arg("pull")
            .arg("--ff-only")
            .arg("--quiet");
        // "Already up to date" exits 0.
        self.run(command, "pull").await?;
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.remote.is_some()
    }

    fn local_path(&self) -> &Path {
        &self.path
    }

    fn remote_url(&self) -> Option<&str> {
        self.remote.as_deref()
    }

    async fn head_commit(&self) -> Option<String> {
        self.remote.as_ref()?;
        let mut command = Command::new(&self.git_bin);
        command
            .arg("-C")
            .arg(&self.path)
            .arg("rev-parse")
            .arg("HEAD");
        match self.run(command, "rev-parse").await {
            Ok(commit) if !commit.is_empty() => Some(commit),
            Ok(_) => None,
            Err(err) => {
                tracing::warn!(error = %err, "unable to read policy commit");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    fn git_available() -> bool {
        StdCommand::new("git")
            .arg("--version")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    fn git(dir: &Path, args: &[&str]) -> String {
        let output = StdCommand::new("git")
            .arg("-C")
            .arg(dir)
            .args([
                "-c",
                "user.name=policy-admin",
                "-c",
                "user.email=policy-admin@example.com",
                "-c",
                "commit.gpgsign=false",
            ])
            .args(args)
            .output()
            .expect("git");
        assert!(
            output.status.success(),
            "git {args:?}: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    fn commit_file(dir: &Path, name: &str, contents: &str) -> String {
        std::fs::write(dir.join(name), contents).expect("write");
        git(dir, &["add", name]);
        git(dir, &["commit", "--quiet", "-m", name]);
        git(dir, &["rev-parse", "HEAD"])
    }

    fn origin_repo() -> tempfile::TempDir {
        let origin = tempfile::tempdir().expect("origin");
        git(origin.path(), &["init", "--quiet"]);
        commit_file(origin.path(), "acl.rego", "package inspektor.resource_acl\n");
        origin
    }

    #[test]
    fn token_is_encoded_as_basic_auth() {
        assert_eq!(basic_credentials("s3cret"), STANDARD.encode("inspektor:s3cret"));
    }

    #[tokio::test]
    async fn disabled_without_remote() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("policy");
        std::fs::create_dir_all(&path).expect("mkdir");
        std::fs::write(path.join("stale.rego"), "old").expect("stale");
        let repo = GitRepository::new(None, None, &path, "git");
        repo.init().await.expect("init");
        assert!(!repo.is_enabled());
        assert!(!path.join("stale.rego").exists());
        repo.pull().await.expect("pull is a no-op");
        assert!(repo.head_commit().await.is_none());
    }

    #[tokio::test]
    async fn clone_and_fast_forward() {
        if !git_available() {
            eprintln!("git not installed; skipping");
            return;
        }
        let origin = origin_repo();
        let checkout = tempfile::tempdir().expect("checkout");
        let path = checkout.path().join("policy");
        let repo = GitRepository::new(
            Some(origin.path().display().to_string()),
            None,
            &path,
            "git",
        );
        repo.init().await.expect("clone");
        let first = git(origin.path(), &["rev-parse", "HEAD"]);
        assert_eq!(repo.head_commit().await.as_deref(), Some(first.as_str()));

        repo.pull().await.expect("already up to date");

        let second = commit_file(origin.path(), "extra.rego", "package extra\n");
        repo.pull().await.expect("pull");
        assert_eq!(repo.head_commit().await.as_deref(), Some(second.as_str()));
        assert!(path.join("extra.rego").exists());
    }

    #[tokio::test]
    async fn diverged_checkout_is_sync_failure() {
        if !git_available() {
            eprintln!("git not installed; skipping");
            return;
        }
        let origin = origin_repo();
        let checkout = tempfile::tempdir().expect("checkout");
        let path = checkout.path().join("policy");
        let repo = GitRepository::new(
            Some(origin.path().display().to_string()),
            None,
            &path,
            "git",
        );
        repo.init().await.expect("clone");
        let local = commit_file(&path, "local.rego", "package local\n");
        commit_file(origin.path(), "remote.rego", "package remote\n");

        let err = repo.pull().await.expect_err("diverged");
        assert!(matches!(err, PolicyError::SyncFailure(_)));
        assert_eq!(repo.head_commit().await.as_deref(), Some(local.as_str()));
    }

    #[tokio::test]
    async fn unreachable_remote_is_sync_failure() {
        if !git_available() {
            eprintln!("git not installed; skipping");
            return;
        }
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = GitRepository::new(
            Some(dir.path().join("missing-origin").display().to_string()),
            Some("token".to_string()),
            dir.path().join("policy"),
            "git",
        );
        let err = repo.init().await.expect_err("clone fails");
        assert!(matches!(err, PolicyError::SyncFailure(msg) if !msg.contains("token")));
    }
}
