//! Control-plane data model module.
//!
//! # Purpose
//! Re-exports the user, data source, role, and session records shared by the
//! store, credential broker, and RPC gateway.
mod data_source;
mod role;
mod session;
mod user;

pub use data_source::{DataSource, NewDataSource};
pub use role::{ObjectRef, ObjectType, Role};
pub use session::{NewSession, Session, SessionKind, SessionMeta};
pub use user::{User, UserMeta};
