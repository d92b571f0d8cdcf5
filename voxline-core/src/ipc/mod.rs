//! Everything the host observes: serialisable events plus the three live
//! values (`connected`, `is_speaking`, `volume`).
//!
//! Event types derive `serde::Serialize` + `serde::Deserialize` so a host can
//! forward them to a front end verbatim.

pub mod events;
pub mod signals;
