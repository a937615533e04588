//! Client-side write path (staging, planning, encoding, composing) and the
//! reference backend's storage layer.

pub mod backend;
pub mod checksum;
pub mod compose_client;
pub mod encoder;
pub mod planner;
pub mod staging;
pub mod storage_service;
pub mod stream_writer;
