//! Integration settings persisted in the key-value store.
//!
//! # Purpose
//! Holds the per-integration sections (audit log, CloudWatch, Teams, Slack)
//! as one JSON document. The HTTP layer that edits them lives elsewhere; this
//! module owns the document format and the read-modify-write helper.
//!
//! # Concurrency
//! Updates are optimistic: read, apply a pure merge, then compare-and-swap
//! against the value that was read. A lost race re-reads and re-applies the
//! merge, up to [`UPDATE_ATTEMPTS`] times.
use crate::error::{ControlPlaneError, ControlPlaneResult};
use crate::store::InspektorStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const INTEGRATION_CONFIG_KEY: &str = "integration_config";

const UPDATE_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_log_config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_watch_config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teams_config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slack_config: Option<Value>,
}

fn decode(raw: Option<&str>) -> ControlPlaneResult<IntegrationConfig> {
    match raw {
        Some(raw) => serde_json::from_str(raw).map_err(|err| {
            ControlPlaneError::Internal(anyhow::anyhow!("decode integration config: {err}"))
        }),
        None => Ok(IntegrationConfig::default()),
    }
}

fn encode(config: &IntegrationConfig) -> ControlPlaneResult<String> {
    serde_json::to_string(config).map_err(|err| {
        ControlPlaneError::Internal(anyhow::anyhow!("encode integration config: {err}"))
    })
}

/// Current settings; an absent key reads as an empty document.
pub async fn load_integration_config(
    store: &dyn InspektorStore,
) -> ControlPlaneResult<IntegrationConfig> {
    let raw = store.kv_get(INTEGRATION_CONFIG_KEY).await?;
    decode(raw.as_deref())
}

/// Apply `merge` to the stored settings and write the result back.
///
/// `merge` may run more than once when writers race, so it must not have side
/// effects beyond building the new document.
///
/// # Errors
/// - `Internal` if the stored document cannot be decoded, or if every attempt
///   lost the race.
pub async fn update_integration_config<F>(
    store: &dyn InspektorStore,
    mut merge: F,
) -> ControlPlaneResult<IntegrationConfig>
where
    F: FnMut(IntegrationConfig) -> IntegrationConfig + Send,
{
    for attempt in 1..=UPDATE_ATTEMPTS {
        let current = store.kv_get(INTEGRATION_CONFIG_KEY).await?;
        let updated = merge(decode(current.as_deref())?);
        let encoded = encode(&updated)?;
        if store
            .kv_compare_and_swap(INTEGRATION_CONFIG_KEY, current.as_deref(), &encoded)
            .await?
        {
            return Ok(updated);
        }
        tracing::debug!(attempt, "integration config changed concurrently; retrying");
    }
    Err(ControlPlaneError::Internal(anyhow::anyhow!(
        "integration config update lost {UPDATE_ATTEMPTS} races"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn missing_key_loads_as_empty() {
        let store = InMemoryStore::new();
        assert_eq!(
            load_integration_config(&store).await.expect("load"),
            IntegrationConfig::default()
        );
    }

    #[tokio::test]
    async fn update_merges_into_existing_sections() {
        let store = InMemoryStore::new();
        store
            .kv_set(
                INTEGRATION_CONFIG_KEY,
                r##"{"slackConfig":{"channel":"#db-access"}}"##,
            )
            .await
            .expect("seed");

        update_integration_config(&store, |mut cfg| {
            cfg.audit_log_config = Some(json!({"enabled": true}));
            cfg
        })
        .await
        .expect("update");

        let cfg = load_integration_config(&store).await.expect("load");
        assert_eq!(cfg.slack_config, Some(json!({"channel": "#db-access"})));
        assert_eq!(cfg.audit_log_config, Some(json!({"enabled": true})));
        assert!(cfg.teams_config.is_none());
    }

    #[tokio::test]
    async fn concurrent_updates_are_not_lost() {
        let store = Arc::new(InMemoryStore::new());
        let mut handles = Vec::new();
        for section in ["audit", "cloudwatch", "teams", "slack"] {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                update_integration_config(store.as_ref(), |mut cfg| {
                    let value = Some(json!({ "set": section }));
                    match section {
                        "audit" => cfg.audit_log_config = value,
                        "cloudwatch" => cfg.cloud_watch_config = value,
                        "teams" => cfg.teams_config = value,
                        _ => cfg.slack_config = value,
                    }
                    cfg
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("update");
        }
        let cfg = load_integration_config(store.as_ref()).await.expect("load");
        assert!(cfg.audit_log_config.is_some());
        assert!(cfg.cloud_watch_config.is_some());
        assert!(cfg.teams_config.is_some());
        assert!(cfg.slack_config.is_some());
    }

    #[tokio::test]
    async fn corrupt_document_is_internal_error() {
        let store = InMemoryStore::new();
        store
            .kv_set(INTEGRATION_CONFIG_KEY, "not json")
            .await
            .expect("seed");
        let err = load_integration_config(&store).await.expect_err("corrupt");
        assert!(matches!(err, ControlPlaneError::Internal(_)));
    }
}
