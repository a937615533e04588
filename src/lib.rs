//! Offset writes over immutable object storage.
//!
//! [`services::stream_writer::StreamWriter`] turns "write these bytes at this
//! offset" into either a whole-object PUT or a server-side compose of
//! uploaded parts and byte ranges of the existing object. The crate also
//! ships the reference backend that serves those compose requests.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
