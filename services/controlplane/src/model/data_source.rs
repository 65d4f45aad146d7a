//! Data source records.
//!
//! # Purpose
//! A data source is a protected database fronted by one dataplane agent. The
//! agent proves its identity with `sidecar_token`.
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSource {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing)]
    pub sidecar_token: String,
    pub hostname: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDataSource {
    pub name: String,
    pub kind: String,
    pub sidecar_token: String,
    pub hostname: String,
}
