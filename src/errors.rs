//! Core error types.
//!
//! Leaf failures are plain `thiserror` enums; anything that crosses a task or
//! adapter boundary is wrapped in an `error_stack::Report` the way the original
//! telemetry recorder wrapped its `TelemetryError`, so callers get an attachable
//! context chain instead of a bare `Display` string.
use std::fmt;

use error_stack::Context;
use thiserror::Error;

/// Failures from an ingestion adapter (MQTT, SignalR, replay loader).
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("connection to upstream failed: {0}")]
    Connect(String),
    #[error("negotiate handshake failed: {0}")]
    Negotiate(String),
    #[error("reconnect attempts exhausted")]
    Unavailable,
    #[error("malformed payload discarded: {0}")]
    MalformedPayload(String),
}

/// Failures from the persistence port.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage write failed: {0}")]
    Write(String),
    #[error("storage read failed: {0}")]
    Read(String),
    #[error("document not found")]
    NotFound,
}

impl Context for StorageError {}

/// Failures surfaced by the replay engine's `start` call.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("replay resource missing for session {0}")]
    ResourceMissing(i64),
    #[error("replay track build failed: {0}")]
    TrackBuild(String),
}

/// Umbrella `error_stack::Context` the core attaches domain errors to.
#[derive(Debug)]
pub struct CoreError;

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session core operation failed")
    }
}

impl Context for CoreError {}

pub type CoreResult<T> = error_stack::Result<T, CoreError>;
