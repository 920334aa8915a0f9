//! Runtime configuration, loaded from environment variables.
//!
//! Mirrors the explicit-builder style `TelemetryBuilder` used for the original
//! UDP recorder: nothing is implicit, every cadence has a named default, and
//! env vars only override what's already a sane constant.
use std::env;
use std::fmt;
use std::time::Duration;

/// Freshness window past which an OpenF1 topic is no longer suppressed (§4.2).
pub const ARBITER_FRESHNESS_WINDOW: Duration = Duration::from_secs(15);

/// Cadence the position batcher emits on (§4.6).
pub const POSITION_BATCH_INTERVAL: Duration = Duration::from_millis(100);

/// Cadence the driver-state batcher emits on (§4.5/§4.6).
pub const DRIVER_STATE_BATCH_INTERVAL: Duration = Duration::from_millis(1000);

/// Cadence the fallback clock checks upstream clock staleness on (§4.6).
pub const CLOCK_FALLBACK_INTERVAL: Duration = Duration::from_secs(5);

/// Age past which the upstream clock is considered stale (§4.6).
pub const CLOCK_STALE_THRESHOLD: Duration = Duration::from_secs(15);

/// Cadence progressive session snapshots are persisted on (§4.7).
pub const PROGRESSIVE_SAVE_INTERVAL: Duration = Duration::from_secs(30);

/// Cadence the idle-state session poller checks for a live session (§4.3).
pub const SESSION_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Cadence the writer checks an `Active` session against `dateEndTs` (§4.3).
pub const ENDING_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Delay after session start before the one-shot capability report fires (§4.3).
pub const CAPABILITY_REPORT_DELAY: Duration = Duration::from_secs(17);

/// Timeout for the best-effort MultiViewer fetch (§4.3).
pub const MULTIVIEWER_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Grace period of MQTT silence before the REST fallback poller activates for a topic.
pub const REST_FALLBACK_GRACE_PERIOD: Duration = Duration::from_secs(15);

/// SignalR reconnect retry period and attempt cap (§5).
pub const SIGNALR_RETRY_PERIOD: Duration = Duration::from_secs(60);
pub const SIGNALR_MAX_RETRIES: u32 = 3;

/// MQTT reconnect period (indefinite retries, §5).
pub const MQTT_RECONNECT_PERIOD: Duration = Duration::from_secs(5);

/// Tick cadence of the replay engine (§4.8).
pub const REPLAY_TICK_INTERVAL: Duration = Duration::from_millis(50);

/// Default replay playback speed multiplier (§4.8).
pub const REPLAY_DEFAULT_SPEED: f64 = 4.0;

/// Minimum number of drivers on track before replay fast-forward stops (§4.8).
pub const REPLAY_FAST_FORWARD_DRIVER_THRESHOLD: usize = 5;

/// Replay buffer budget before window-trimming from the end (§4.7).
pub const REPLAY_MAX_BYTES: usize = 6 * 1024 * 1024;

/// Session snapshot TTL (§4.7 / §6).
pub const SESSION_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Pit-timeout threshold, in leader laps behind, before a stationary pit-lane
/// driver is assumed retired (§4.5).
pub const PIT_TIMEOUT_LAPS: i64 = 2;

/// Target point count the track centerline is downsampled to (§4.4).
pub const CENTERLINE_TARGET_POINTS: usize = 400;

/// Outlier-removal distance threshold (metres) applied to each lap trace
/// before seed selection (§4.4).
pub const CENTERLINE_OUTLIER_THRESHOLD: f64 = 8.0;

/// Moving-average smoothing radius applied to the downsampled centerline (§4.4).
pub const CENTERLINE_SMOOTHING_RADIUS: usize = 2;

/// Layout-change detection thresholds (§4.4, §9 Open Questions): conservative
/// by design, since a false positive (unnecessary regeneration) is cheaper
/// than incorrectly refining a genuinely new track.
pub const LAYOUT_CHANGE_BBOX_THRESHOLD: f64 = 250.0;
pub const LAYOUT_CHANGE_RESIDUAL_THRESHOLD: f64 = 40.0;

/// REST fallback poller per-endpoint cadence (§6).
#[derive(Debug, Clone, Copy)]
pub struct RestPollCadences {
    pub car_data: Duration,
    pub intervals: Duration,
    pub position: Duration,
    pub pit: Duration,
    pub stints: Duration,
    pub race_control: Duration,
    pub weather: Duration,
    pub overtakes: Duration,
}

impl Default for RestPollCadences {
    fn default() -> Self {
        RestPollCadences {
            car_data: Duration::from_secs(2),
            intervals: Duration::from_secs(4),
            position: Duration::from_secs(4),
            pit: Duration::from_secs(10),
            stints: Duration::from_secs(10),
            race_control: Duration::from_secs(5),
            weather: Duration::from_secs(60),
            overtakes: Duration::from_secs(10),
        }
    }
}

/// Upstream credentials and transport endpoints, loaded from the environment
/// (§6). Never logged in full; `Debug` redacts the password.
#[derive(Clone)]
pub struct CoreConfig {
    pub upstream_username: Option<String>,
    pub upstream_password: Option<String>,
    pub storage_uri: Option<String>,
    pub host: String,
    pub port: u16,
    pub rest_poll: RestPollCadences,
    pub signalr_negotiate_url: String,
    pub signalr_hub_ws_url: String,
    pub rest_base_url: String,
    pub multiviewer_base_url: String,
}

impl fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreConfig")
            .field("upstream_username", &self.upstream_username)
            .field("upstream_password", &self.upstream_password.as_ref().map(|_| "<redacted>"))
            .field("storage_uri", &self.storage_uri)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("rest_poll", &self.rest_poll)
            .field("signalr_negotiate_url", &self.signalr_negotiate_url)
            .field("signalr_hub_ws_url", &self.signalr_hub_ws_url)
            .field("rest_base_url", &self.rest_base_url)
            .field("multiviewer_base_url", &self.multiviewer_base_url)
            .finish()
    }
}

impl CoreConfig {
    /// Builds configuration from process environment variables, falling back
    /// to the documented defaults for `host`/`port` when absent.
    pub fn from_env() -> Self {
        CoreConfig {
            upstream_username: env::var("UPSTREAM_USERNAME").ok(),
            upstream_password: env::var("UPSTREAM_PASSWORD").ok(),
            storage_uri: env::var("STORAGE_URI").ok(),
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            rest_poll: RestPollCadences::default(),
            signalr_negotiate_url: env::var("SIGNALR_NEGOTIATE_URL")
                .unwrap_or_else(|_| "https://livetiming.formula1.com/signalr/negotiate".to_string()),
            signalr_hub_ws_url: env::var("SIGNALR_HUB_WS_URL")
                .unwrap_or_else(|_| "wss://livetiming.formula1.com/signalr/connect".to_string()),
            rest_base_url: env::var("REST_BASE_URL").unwrap_or_else(|_| "https://api.openf1.org/v1".to_string()),
            multiviewer_base_url: env::var("MULTIVIEWER_BASE_URL")
                .unwrap_or_else(|_| "https://api.multiviewer.app/api/v1".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_password() {
        let cfg = CoreConfig {
            upstream_username: Some("driver".into()),
            upstream_password: Some("secret".into()),
            storage_uri: None,
            host: "0.0.0.0".into(),
            port: 8080,
            rest_poll: RestPollCadences::default(),
            signalr_negotiate_url: "https://livetiming.formula1.com/signalr/negotiate".into(),
            signalr_hub_ws_url: "wss://livetiming.formula1.com/signalr/connect".into(),
            rest_base_url: "https://api.openf1.org/v1".into(),
            multiviewer_base_url: "https://api.multiviewer.app/api/v1".into(),
        };
        let rendered = format!("{:?}", cfg);
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("redacted"));
    }

    #[test]
    fn defaults_when_env_absent() {
        env::remove_var("HOST");
        env::remove_var("PORT");
        let cfg = CoreConfig::from_env();
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.port, 8080);
    }
}
