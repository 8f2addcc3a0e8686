//! snapmatch: the core face-identity pipeline of an event-photo
//! recognition service.
//!
//! This crate is a facade over the workspace members; the service shell
//! (HTTP surface, dashboards) consumes the pipeline through these
//! re-exports.

pub use common;
pub use face_engine;
pub use identity_store;
pub use matcher;
pub use pipeline;
pub use telemetry;
