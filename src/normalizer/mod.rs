//! Normalizer (§4.1): converts each upstream message into the
//! source-agnostic [`crate::events::InternalEvent`] schema. Pure translation
//! except for the SignalR deep-merge accumulator, which is the only place
//! the Normalizer holds state.
pub mod merge;
pub mod mqtt;
pub mod signalr;

pub use mqtt::normalize_mqtt;
pub use signalr::{normalize_signalr, SignalRAccumulator};
