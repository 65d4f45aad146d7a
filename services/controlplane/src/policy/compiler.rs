//! Rego source tree to wasm artifact.
//!
//! The OPA toolchain writes a gzipped tar bundle; the artifact is the single
//! `/policy.wasm` entry inside it.
use super::{PolicyError, PolicyResult};
use async_trait::async_trait;
use bytes::Bytes;
use flate2::read::GzDecoder;
use std::io::Read;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Bundle entry holding the compiled policy.
pub const ARTIFACT_NAME: &str = "/policy.wasm";

#[async_trait]
pub trait PolicyCompiler: Send + Sync {
    async fn compile(&self, source: &Path) -> PolicyResult<Bytes>;
}

/// Compiles with the `opa` CLI (`opa build -t wasm`).
#[derive(Debug, Clone)]
pub struct OpaCompiler {
    binary: PathBuf,
    entrypoint: String,
}

impl OpaCompiler {
    pub fn new(binary: impl Into<PathBuf>, entrypoint: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            entrypoint: entrypoint.into(),
        }
    }
}

#[async_trait]
impl PolicyCompiler for OpaCompiler {
    async fn compile(&self, source: &Path) -> PolicyResult<Bytes> {
        let scratch = tempfile::tempdir()
            .map_err(|err| PolicyError::BuildFailure(format!("create scratch dir: {err}")))?;
        let bundle_path = scratch.path().join("bundle.tar.gz");

        let mut command = Command::new(&self.binary);
        command
            .arg("build")
            .arg("-t")
            .arg("wasm")
            .arg("-e")
            .arg(&self.entrypoint)
            .arg("-o")
            .arg(&bundle_path)
            // Skip `.git` and other dotfiles in the checkout.
            .arg("--ignore")
            .arg(".*")
            .arg(source);

        let output = command.output().await.map_err(|err| {
            PolicyError::BuildFailure(format!("run {}: {err}", self.binary.display()))
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PolicyError::BuildFailure(format!(
                "{} exited with {}: {}",
                self.binary.display(),
                output.status,
                stderr.trim()
            )));
        }

        let bundle = tokio::fs::read(&bundle_path)
            .await
            .map_err(|err| PolicyError::BuildFailure(format!("read bundle: {err}")))?;
        let artifact = tokio::task::spawn_blocking(move || extract_artifact(&bundle, ARTIFACT_NAME))
            .await
            .map_err(|err| PolicyError::BuildFailure(format!("extract task: {err}")))??;
        tracing::debug!(size = artifact.len(), source = %source.display(), "policy compiled");
        Ok(Bytes::from(artifact))
    }
}

/// Read `name` out of a gzipped tar bundle.
///
/// Leading `/` is ignored when matching entry names. A short read relative to
/// the entry's declared size is an error.
pub fn extract_artifact(bundle: &[u8], name: &str) -> PolicyResult<Vec<u8>> {
    let wanted = name.trim_start_matches('/');
    let mut archive = tar::Archive::new(GzDecoder::new(bundle));
    let entries = archive
        .entries()
        .map_err(|err| PolicyError::BuildFailure(format!("open bundle: {err}")))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|err| PolicyError::BuildFailure(format!("read bundle: {err}")))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path_bytes().into_owned();
        if String::from_utf8_lossy(&path).trim_start_matches('/') != wanted {
            continue;
        }
        let declared = entry
            .header()
            .size()
            .map_err(|err| PolicyError::BuildFailure(format!("read entry size: {err}")))?;
        let mut artifact = Vec::with_capacity(declared as usize);
        entry
            .read_to_end(&mut artifact)
            .map_err(|err| PolicyError::BuildFailure(format!("read {name}: {err}")))?;
        if artifact.len() as u64 != declared {
            return Err(PolicyError::BuildFailure(format!(
                "{name} truncated: read {} of {declared} bytes",
                artifact.len()
            )));
        }
        return Ok(artifact);
    }
    Err(PolicyError::BuildFailure(format!("{name} not present in bundle")))
}
