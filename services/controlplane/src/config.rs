use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

// Control plane configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    pub grpc_bind: SocketAddr,
    pub http_bind: SocketAddr,
    pub metrics_bind: SocketAddr,
    pub storage: StorageBackend,
    pub postgres: Option<PostgresConfig>,
    pub policy: PolicyConfig,
    pub admin_password: String,
    /// Period of the expired-session cleanup task; `None` leaves expiry to `Auth`.
    pub session_sweep_interval: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Postgres,
}

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout_ms: u64,
    pub acquire_timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// Remote repository URL; `None` disables policy sync.
    pub repo_url: Option<String>,
    pub access_token: Option<String>,
    pub local_path: PathBuf,
    pub entrypoint: String,
    pub opa_bin: String,
    pub git_bin: String,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            repo_url: None,
            access_token: None,
            local_path: PathBuf::from("./policy_dir"),
            entrypoint: "inspektor/resource_acl/allow".to_string(),
            opa_bin: "opa".to_string(),
            git_bin: "git".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ControlPlaneConfigOverride {
    grpc_bind: Option<String>,
    http_bind: Option<String>,
    metrics_bind: Option<String>,
    storage: Option<String>,
    postgres_url: Option<String>,
    policy_repo: Option<String>,
    policy_path: Option<String>,
    policy_entrypoint: Option<String>,
    session_sweep_secs: Option<u64>,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_env<T>(key: &str, default: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env_or(key, default)
        .parse()
        .with_context(|| format!("parse {key}"))
}

fn parse_storage(value: &str) -> Result<StorageBackend> {
    match value.trim().to_ascii_lowercase().as_str() {
        "memory" => Ok(StorageBackend::Memory),
        "postgres" => Ok(StorageBackend::Postgres),
        other => anyhow::bail!("unknown storage backend: {other}"),
    }
}

impl ControlPlaneConfig {
    pub fn from_env() -> Result<Self> {
        let grpc_bind = parse_env("INSPEKTOR_GRPC_BIND", "0.0.0.0:5003")?;
        let http_bind = parse_env("INSPEKTOR_HTTP_BIND", "0.0.0.0:3123")?;
        let metrics_bind = parse_env("INSPEKTOR_METRICS_BIND", "0.0.0.0:8080")?;
        let storage = parse_storage(&env_or("INSPEKTOR_STORAGE", "memory"))?;
        let postgres = match env_non_empty("INSPEKTOR_POSTGRES_URL") {
            Some(url) => Some(PostgresConfig {
                url,
                max_connections: parse_env("INSPEKTOR_POSTGRES_MAX_CONNECTIONS", "10")?,
                connect_timeout_ms: parse_env("INSPEKTOR_POSTGRES_CONNECT_TIMEOUT_MS", "5000")?,
                acquire_timeout_ms: parse_env("INSPEKTOR_POSTGRES_ACQUIRE_TIMEOUT_MS", "5000")?,
            }),
            None => None,
        };
        let defaults = PolicyConfig::default();
        let policy = PolicyConfig {
            repo_url: env_non_empty("INSPEKTOR_POLICY_REPO"),
            access_token: env_non_empty("INSPEKTOR_POLICY_ACCESS_TOKEN"),
            local_path: env_non_empty("INSPEKTOR_POLICY_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.local_path),
            entrypoint: env_non_empty("INSPEKTOR_POLICY_ENTRYPOINT")
                .unwrap_or(defaults.entrypoint),
            opa_bin: env_non_empty("INSPEKTOR_OPA_BIN").unwrap_or(defaults.opa_bin),
            git_bin: env_non_empty("INSPEKTOR_GIT_BIN").unwrap_or(defaults.git_bin),
        };
        let admin_password = env_or("INSPEKTOR_ADMIN_PASSWORD", "admin");
        let session_sweep_interval = match env_non_empty("INSPEKTOR_SESSION_SWEEP_SECS") {
            Some(value) => {
                let secs: u64 = value
                    .parse()
                    .with_context(|| "parse INSPEKTOR_SESSION_SWEEP_SECS")?;
                Some(Duration::from_secs(secs.max(1)))
            }
            None => None,
        };
        Ok(Self {
            grpc_bind,
            http_bind,
            metrics_bind,
            storage,
            postgres,
            policy,
            admin_password,
            session_sweep_interval,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("INSPEKTOR_CP_CONFIG") {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read INSPEKTOR_CP_CONFIG: {path}"))?;
            let override_cfg: ControlPlaneConfigOverride = serde_yaml::from_str(&contents)
                .with_context(|| "parse control plane config yaml")?;
            config.apply_override(override_cfg)?;
        }
        Ok(config)
    }

    fn apply_override(&mut self, override_cfg: ControlPlaneConfigOverride) -> Result<()> {
        if let Some(value) = override_cfg.grpc_bind {
            self.grpc_bind = value.parse().with_context(|| "parse grpc_bind")?;
        }
        if let Some(value) = override_cfg.http_bind {
            self.http_bind = value.parse().with_context(|| "parse http_bind")?;
        }
        if let Some(value) = override_cfg.metrics_bind {
            self.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
        }
        if let Some(value) = override_cfg.storage {
            self.storage = parse_storage(&value)?;
        }
        if let Some(url) = override_cfg.postgres_url {
            match self.postgres.as_mut() {
                Some(pg) => pg.url = url,
                None => {
                    self.postgres = Some(PostgresConfig {
                        url,
                        max_connections: 10,
                        connect_timeout_ms: 5000,
                        acquire_timeout_ms: 5000,
                    })
                }
            }
        }
        if let Some(value) = override_cfg.policy_repo {
            self.policy.repo_url = Some(value).filter(|url| !url.trim().is_empty());
        }
        if let Some(value) = override_cfg.policy_path {
            self.policy.local_path = PathBuf::from(value);
        }
        if let Some(value) = override_cfg.policy_entrypoint {
            self.policy.entrypoint = value;
        }
        if let Some(value) = override_cfg.session_sweep_secs {
            self.session_sweep_interval = Some(Duration::from_secs(value.max(1)));
        }
        Ok(())
    }
}
