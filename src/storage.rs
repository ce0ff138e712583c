//! Storage subsystem
//!
//! `file_storage` lays out a capture on disk: the raw data file written by the
//! sequential sink and the JSON report stored next to it.

pub mod file_storage;

pub use file_storage::CaptureStorage;
