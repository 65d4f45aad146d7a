//! Generated protobuf and tonic code for `proto/api.proto`.
//!
//! Checked in so the build does not need `protoc`. Regenerate with
//! `tonic-build` (with `.bytes(["."])`) after editing the proto.
pub mod api {
    include!("api.rs");
    include!("api.tonic.rs");
}

pub use api::inspektor_client::InspektorClient;
pub use api::inspektor_server::{Inspektor, InspektorServer};
pub use api::{AuthRequest, AuthResponse, DataSourceResponse, Empty, InspektorPolicy};
