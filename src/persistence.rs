//! Persistence Layer (§4.7): the `Storage` port and its documents. The
//! actual document-store engine stays out of scope (§1, §6) — this module
//! defines the port precisely and ships an in-memory implementation used as
//! the default when no `STORAGE_URI` is configured, and in tests.
use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use error_stack::{IntoReport, Result, ResultExt};
use serde::{Deserialize, Serialize};

use crate::errors::{CoreError, StorageError};
use crate::session::types::{Corner, Path, PitLaneProfile, SectorBoundaries};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackmapHistoryEntry {
    pub path: Path,
    pub total_laps_processed: u64,
    pub year: i32,
    pub archived_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackmapDocument {
    pub track_name: String,
    pub path: Path,
    pub arc_version: u64,
    pub multiviewer_path: Option<Path>,
    pub corners: Vec<Corner>,
    pub sector_boundaries: Option<SectorBoundaries>,
    pub pit_lane_profile: Option<PitLaneProfile>,
    pub meeting_keys: Vec<i64>,
    pub latest_session_key: i64,
    pub history: Vec<TrackmapHistoryEntry>,
    pub rotation_override: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDocument {
    pub session_key: i64,
    pub snapshot: serde_json::Value,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayMessage {
    pub topic: String,
    pub data: serde_json::Value,
    pub timestamp_millis: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayDocument {
    pub session_key: i64,
    pub messages: Vec<ReplayMessage>,
    pub track_name: String,
    pub session_name: String,
    pub session_end_ts: DateTime<Utc>,
    pub driver_count: u32,
    pub created_at: DateTime<Utc>,
}

/// The persistence port (§4.7). A document-store with atomic upserts is
/// assumed underneath; this trait only names the operations the core needs.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn upsert_trackmap(&self, doc: TrackmapUpsert) -> Result<(), CoreError>;
    async fn load_trackmap(&self, track_name: &str) -> Result<Option<TrackmapDocument>, CoreError>;
    async fn progressive_save(&self, doc: SessionDocument) -> Result<(), CoreError>;
    async fn save_replay(&self, doc: ReplayDocument) -> Result<(), CoreError>;
    async fn load_replay(&self, session_key: i64) -> Result<Option<ReplayDocument>, CoreError>;
}

/// Fields an upsert call may update; unset fields leave the stored document
/// value untouched (§4.7).
#[derive(Debug, Clone)]
pub struct TrackmapUpsert {
    pub track_name: String,
    pub path: Path,
    pub multiviewer_path: Option<Path>,
    pub corners: Option<Vec<Corner>>,
    pub sector_boundaries: Option<SectorBoundaries>,
    pub pit_lane_profile: Option<PitLaneProfile>,
    pub meeting_key: Option<i64>,
    pub latest_session_key: i64,
    pub total_laps_processed: u64,
}

/// The replay-document namespace offset keeping replay records distinct
/// from live session records (§4.7).
pub const REPLAY_KEY_OFFSET: i64 = 1_000_000;

pub fn replay_key(session_key: i64) -> i64 {
    session_key + REPLAY_KEY_OFFSET
}

/// Trims the front of `messages` until the serialized payload fits within
/// `REPLAY_MAX_BYTES`, keeping the window closest to the end of the
/// recording (§4.7: "window-trimmed from the end to stay under a
/// configurable max-bytes budget").
pub fn trim_replay_window(mut messages: Vec<ReplayMessage>, max_bytes: usize) -> Vec<ReplayMessage> {
    loop {
        let size: usize = messages.iter().map(|m| approximate_size(m)).sum();
        if size <= max_bytes || messages.len() <= 1 {
            break;
        }
        messages.remove(0);
    }
    messages
}

fn approximate_size(message: &ReplayMessage) -> usize {
    message.topic.len() + serde_json::to_string(&message.data).map(|s| s.len()).unwrap_or(0) + 16
}

/// In-memory `Storage` implementation: the default when no `STORAGE_URI` is
/// configured, and used throughout the test suite. Not a production
/// backend.
#[derive(Default)]
pub struct InMemoryStorage {
    trackmaps: Mutex<HashMap<String, TrackmapDocument>>,
    sessions: Mutex<HashMap<i64, SessionDocument>>,
    replays: Mutex<HashMap<i64, ReplayDocument>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        InMemoryStorage::default()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn upsert_trackmap(&self, upsert: TrackmapUpsert) -> Result<(), CoreError> {
        let mut guard = self.trackmaps.lock().map_err(|_| StorageError::Write("trackmap store poisoned".into()))
            .into_report()
            .change_context(CoreError)?;
        let now = Utc::now();
        let entry = guard.entry(upsert.track_name.clone()).or_insert_with(|| TrackmapDocument {
            track_name: upsert.track_name.clone(),
            path: Vec::new(),
            arc_version: 0,
            multiviewer_path: None,
            corners: Vec::new(),
            sector_boundaries: None,
            pit_lane_profile: None,
            meeting_keys: Vec::new(),
            latest_session_key: upsert.latest_session_key,
            history: Vec::new(),
            rotation_override: None,
            created_at: now,
            updated_at: now,
        });

        // §4.7: archive into history[] before overwrite if the stored
        // document is from a prior year and carries a non-empty path.
        if entry.updated_at.year() < now.year() && !entry.path.is_empty() {
            entry.history.push(TrackmapHistoryEntry {
                path: std::mem::take(&mut entry.path),
                total_laps_processed: upsert.total_laps_processed,
                year: entry.updated_at.year(),
                archived_at: now,
            });
        }

        entry.path = upsert.path;
        entry.arc_version += 1;
        if upsert.multiviewer_path.is_some() {
            entry.multiviewer_path = upsert.multiviewer_path;
        }
        if upsert.corners.is_some() {
            entry.corners = upsert.corners.unwrap_or_default();
        }
        if upsert.sector_boundaries.is_some() {
            entry.sector_boundaries = upsert.sector_boundaries;
        }
        if upsert.pit_lane_profile.is_some() {
            entry.pit_lane_profile = upsert.pit_lane_profile;
        }
        if let Some(meeting_key) = upsert.meeting_key {
            if !entry.meeting_keys.contains(&meeting_key) {
                entry.meeting_keys.push(meeting_key);
            }
        }
        entry.latest_session_key = upsert.latest_session_key;
        entry.updated_at = now;
        Ok(())
    }

    async fn load_trackmap(&self, track_name: &str) -> Result<Option<TrackmapDocument>, CoreError> {
        let guard = self.trackmaps.lock().map_err(|_| StorageError::Read("trackmap store poisoned".into()))
            .into_report()
            .change_context(CoreError)?;
        Ok(guard.get(track_name).cloned())
    }

    async fn progressive_save(&self, doc: SessionDocument) -> Result<(), CoreError> {
        let mut guard = self.sessions.lock().map_err(|_| StorageError::Write("session store poisoned".into()))
            .into_report()
            .change_context(CoreError)?;
        guard.insert(doc.session_key, doc);
        Ok(())
    }

    async fn save_replay(&self, doc: ReplayDocument) -> Result<(), CoreError> {
        let mut guard = self.replays.lock().map_err(|_| StorageError::Write("replay store poisoned".into()))
            .into_report()
            .change_context(CoreError)?;
        guard.insert(replay_key(doc.session_key), doc);
        Ok(())
    }

    async fn load_replay(&self, session_key: i64) -> Result<Option<ReplayDocument>, CoreError> {
        let guard = self.replays.lock().map_err(|_| StorageError::Read("replay store poisoned".into()))
            .into_report()
            .change_context(CoreError)?;
        Ok(guard.get(&replay_key(session_key)).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upsert(track: &str, path: Path) -> TrackmapUpsert {
        TrackmapUpsert {
            track_name: track.to_string(),
            path,
            multiviewer_path: None,
            corners: None,
            sector_boundaries: None,
            pit_lane_profile: None,
            meeting_key: Some(1),
            latest_session_key: 42,
            total_laps_processed: 10,
        }
    }

    #[tokio::test]
    async fn upsert_then_load_round_trips() {
        let storage = InMemoryStorage::new();
        storage.upsert_trackmap(upsert("Monza", vec![crate::session::types::Point { x: 0.0, y: 0.0 }])).await.unwrap();
        let doc = storage.load_trackmap("Monza").await.unwrap().unwrap();
        assert_eq!(doc.arc_version, 1);
        assert_eq!(doc.latest_session_key, 42);
    }

    #[tokio::test]
    async fn replay_key_is_namespaced_away_from_live_sessions() {
        assert_eq!(replay_key(42), 1_000_042);
    }

    #[test]
    fn trim_replay_window_keeps_the_tail() {
        let messages: Vec<ReplayMessage> = (0..100)
            .map(|i| ReplayMessage { topic: "Location".into(), data: serde_json::json!({"x": i}), timestamp_millis: i })
            .collect();
        let trimmed = trim_replay_window(messages.clone(), 500);
        assert!(trimmed.len() < messages.len());
        assert_eq!(trimmed.last().unwrap().timestamp_millis, 99);
    }
}
