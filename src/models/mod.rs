//! Core data models.
//!
//! - `manifest`: planned and transmittable compose manifests plus their JSON
//!   wire form.
//! - `object`: stored object metadata (SQLite row) and the client-side stat.
//! - `policy`: upload token put policies.

pub mod manifest;
pub mod object;
pub mod policy;
