//! Real-time F1 telemetry aggregation and distribution core.
//!
//! A single writer task (`writer`) owns all mutation of the session
//! aggregate (`session`), fed by ingestion adapters (`adapters`) that
//! normalize upstream MQTT/SignalR/REST messages (`normalizer`) into a
//! source-agnostic event schema (`events`), arbitrated for
//! freshness (`arbiter`) and applied through one dispatch site (`apply`).
//! Downstream, a trio of timer-driven batchers (`batcher`) read an
//! immutable snapshot off a `watch` channel and push to a pub/sub
//! boundary (`broadcaster`). `controller` drives session lifecycle,
//! `geometry`/`aggregator` derive track geometry and per-driver state,
//! `persistence` is the storage port, and `replay` re-plays a saved
//! session through the same normalizer/apply pipeline.
pub mod adapters;
pub mod aggregator;
pub mod apply;
pub mod arbiter;
pub mod batcher;
pub mod broadcaster;
pub mod config;
pub mod controller;
pub mod errors;
pub mod events;
pub mod geometry;
pub mod normalizer;
pub mod persistence;
pub mod replay;
pub mod session;
pub mod writer;

pub use broadcaster::Broadcaster;
pub use config::CoreConfig;
pub use events::InternalEvent;
pub use persistence::Storage;
pub use session::{Session, SessionSnapshot};
