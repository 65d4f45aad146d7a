//! User records.
//!
//! # Purpose
//! Defines the persisted user identity. Role names are not stored on the user;
//! they are resolved through the role store.
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub meta: UserMeta,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMeta {
    #[serde(default)]
    pub first_password_reset: bool,
}
