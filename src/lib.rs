// src/lib.rs

//! Speedhive dump library
//!
//! Resumable export of timing data (organization → events → sessions →
//! laps and announcements) to NDJSON artifacts, plus stream processors that
//! turn those artifacts into CSV tables and an SQLite store.

pub mod error;
pub mod models;
pub mod pipeline;
pub mod processing;
pub mod services;
pub mod storage;
