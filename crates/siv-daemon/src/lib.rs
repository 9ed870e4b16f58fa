//! siv-daemon - Student Identity Verification Service
//!
//! The service shell around [`siv_core`]: SQLite-backed implementations of
//! the core storage traits, the OCR collaborator interface, the async
//! review worker, and the HTTP surface.
//!
//! # Architecture
//!
//! ```text
//! POST /verification/submit --> VerificationStateMachine --> SQLite stores
//!            |                                                    ^
//!            v (job)                                              |
//!      ReviewWorker --> TextExtractor (timeout) --> matcher -------+
//! ```
//!
//! Uploads return as soon as ingestion and the audit write complete; OCR
//! and matching run on the worker, decoupled through an mpsc channel.
//! An OCR failure or timeout never retracts an upload — the identity is
//! left in `processing` for manual review.
//!
//! # Modules
//!
//! - [`config`]: TOML daemon configuration
//! - [`storage`]: SQLite persistence (WAL mode, append-only audit table)
//! - [`ocr`]: Text-extraction collaborator contract with timeout handling
//! - [`worker`]: Queue-driven automated review loop
//! - [`http`]: Axum router for the public verification endpoints

pub mod config;
pub mod http;
pub mod ocr;
pub mod storage;
pub mod worker;

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// The core takes explicit timestamps; this is the single place the
/// daemon reads the clock.
#[must_use]
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
