//! Track Geometry Engine (§4.4): GPS -> track centerline; sectors; corners;
//! pit-lane profile. Pure functions only — no session scaffolding.
pub mod path;
pub mod pitlane;
pub mod sectors;
