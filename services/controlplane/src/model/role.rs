//! Role assignments.
//!
//! # Purpose
//! A role is a name attached to either a user or a data source. Roles on a
//! data source say who may request access to it; roles on a user say what the
//! user is entitled to.
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectType {
    #[serde(rename = "USER")]
    User,
    #[serde(rename = "DATA_SOURCE")]
    DataSource,
}

impl ObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::User => "USER",
            ObjectType::DataSource => "DATA_SOURCE",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The (object_id, object_type) pair a role set hangs off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub id: i64,
    pub kind: ObjectType,
}

impl ObjectRef {
    pub fn user(id: i64) -> Self {
        Self {
            id,
            kind: ObjectType::User,
        }
    }

    pub fn data_source(id: i64) -> Self {
        Self {
            id,
            kind: ObjectType::DataSource,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: i64,
    pub object_id: i64,
    pub object_type: ObjectType,
    pub name: String,
}
