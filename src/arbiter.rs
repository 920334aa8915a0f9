//! Source Arbiter (§4.2): suppresses overlapping OpenF1 (MQTT) events when a
//! fresher SignalR update for the same topic has been seen recently.
//! SignalR never suppresses SignalR.
use std::collections::HashMap;

use crate::config::ARBITER_FRESHNESS_WINDOW;
use crate::events::{EventSource, EventType, InternalEvent};

/// Tracks the last-seen timestamp per SignalR topic. Read by the arbiter,
/// written by the normalizer; stale reads are tolerable (§5).
#[derive(Debug, Default)]
pub struct SourceArbiter {
    topic_last_seen: HashMap<EventType, i64>,
}

impl SourceArbiter {
    pub fn new() -> Self {
        SourceArbiter { topic_last_seen: HashMap::new() }
    }

    /// Decides whether `event` should be dropped. Also records SignalR
    /// arrivals into `topic_last_seen` as a side effect, matching the
    /// normalizer/arbiter shared-map contract in §5.
    pub fn admit(&mut self, event: &InternalEvent) -> bool {
        match event.source {
            EventSource::Signalr => {
                self.topic_last_seen.insert(event.event_type, event.timestamp_millis);
                true
            }
            EventSource::Replay => true,
            EventSource::Mqtt => {
                if !event.event_type.is_arbitrated() {
                    return true;
                }
                match self.topic_last_seen.get(&event.event_type) {
                    Some(&last_seen) => {
                        let age = event.timestamp_millis - last_seen;
                        age > ARBITER_FRESHNESS_WINDOW.as_millis() as i64
                    }
                    None => true,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventPayload, WeatherPayload};

    fn weather_event(source: EventSource, air_temp: f64, t_ms: i64) -> InternalEvent {
        InternalEvent::new(
            EventType::Weather,
            None,
            EventPayload::Weather(WeatherPayload {
                air_temp,
                track_temp: 30.0,
                humidity: 40.0,
                rainfall: false,
                wind_speed: 1.0,
                wind_dir: 90.0,
                pressure: 1000.0,
            }),
            t_ms,
            source,
        )
    }

    /// S1: SignalR WeatherData at t=0, OpenF1 weather at t=100 suppressed,
    /// OpenF1 weather at t=20000 (past the 15s window) admitted.
    #[test]
    fn scenario_s1_source_arbitration() {
        let mut arbiter = SourceArbiter::new();
        assert!(arbiter.admit(&weather_event(EventSource::Signalr, 20.0, 0)));
        assert!(!arbiter.admit(&weather_event(EventSource::Mqtt, 99.0, 100)));
        assert!(arbiter.admit(&weather_event(EventSource::Mqtt, 25.0, 20_000)));
    }

    /// §8 property 3 boundary: exactly at the 15s window edge is still
    /// suppressed (`age > window`, not `>=`).
    #[test]
    fn boundary_exactly_at_freshness_window_is_suppressed() {
        let mut arbiter = SourceArbiter::new();
        assert!(arbiter.admit(&weather_event(EventSource::Signalr, 20.0, 0)));
        assert!(!arbiter.admit(&weather_event(EventSource::Mqtt, 25.0, 15_000)));
        assert!(arbiter.admit(&weather_event(EventSource::Mqtt, 25.0, 15_001)));
    }

    #[test]
    fn openf1_exclusive_topics_never_suppressed() {
        let mut arbiter = SourceArbiter::new();
        let event = InternalEvent::new(
            EventType::Location,
            Some(44),
            EventPayload::Location(crate::events::LocationPayload { x: 1.0, y: 2.0 }),
            0,
            EventSource::Mqtt,
        );
        assert!(arbiter.admit(&event));
    }

    #[test]
    fn signalr_never_suppresses_signalr() {
        let mut arbiter = SourceArbiter::new();
        assert!(arbiter.admit(&weather_event(EventSource::Signalr, 20.0, 0)));
        assert!(arbiter.admit(&weather_event(EventSource::Signalr, 21.0, 1)));
    }
}
