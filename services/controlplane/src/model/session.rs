//! Session records and their JSON metadata.
//!
//! # Purpose
//! A session binds a user (or nobody, for a temporary grant) to a data source
//! and carries the generated database credential plus optional overrides.
//!
//! # Key invariants
//! - `expires_at == 0` means permanent; any other value is a nanosecond epoch
//!   deadline and marks the session as a temporary grant.
//! - `temp_roles` only apply while the session has a non-zero `expires_at`.
//! - The JSON keys match rows written by earlier releases and must not change.
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    /// Data source the session grants access to.
    pub object_id: i64,
    pub user_id: Option<i64>,
    pub meta: SessionMeta,
}

impl Session {
    pub fn kind(&self) -> SessionKind {
        self.meta.kind()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    #[serde(rename = "type", default)]
    pub engine: String,
    #[serde(default)]
    pub postgres_username: String,
    #[serde(default)]
    pub postgres_password: String,
    #[serde(default)]
    pub temp_roles: Vec<String>,
    #[serde(default)]
    pub expires_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    #[serde(default)]
    pub temp_created_by: String,
    #[serde(default)]
    pub passthrough: bool,
}

impl SessionMeta {
    pub fn kind(&self) -> SessionKind {
        if self.expires_at == 0 {
            SessionKind::Permanent
        } else {
            SessionKind::Temporary
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Permanent,
    Temporary,
}

/// Insert payload for a session row; the store assigns the id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSession {
    pub object_id: i64,
    pub user_id: Option<i64>,
    pub meta: SessionMeta,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_uses_legacy_json_keys() {
        let meta = SessionMeta {
            engine: "postgres".to_string(),
            postgres_username: "brave-otter".to_string(),
            postgres_password: "00aa11bb22cc33".to_string(),
            temp_roles: vec!["dev".to_string()],
            expires_at: 42,
            context: Some(serde_json::json!({"approvedBy": "ops"})),
            temp_created_by: "slack".to_string(),
            passthrough: false,
        };
        let value = serde_json::to_value(&meta).expect("json");
        assert_eq!(value["type"], "postgres");
        assert_eq!(value["postgresUsername"], "brave-otter");
        assert_eq!(value["postgresPassword"], "00aa11bb22cc33");
        assert_eq!(value["tempRoles"][0], "dev");
        assert_eq!(value["expiresAt"], 42);
        assert_eq!(value["tempCreatedBy"], "slack");
        assert_eq!(value["context"]["approvedBy"], "ops");
    }

    #[test]
    fn zero_expiry_means_permanent() {
        let mut meta: SessionMeta = serde_json::from_str("{}").expect("empty meta");
        assert_eq!(meta.kind(), SessionKind::Permanent);
        meta.expires_at = 1;
        assert_eq!(meta.kind(), SessionKind::Temporary);
    }
}
