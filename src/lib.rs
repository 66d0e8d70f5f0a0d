//! Reloadgate - a gating reverse proxy for reconfigurable upstreams
//!
//! This library provides a reverse proxy that:
//! - Forwards all HTTP traffic to a single configured upstream
//! - Suppresses forwarding for a fixed cooldown window after a reload,
//!   serving a static placeholder page instead
//! - Exposes an administrative endpoint that stamps the cooldown window and
//!   runs an ordered, fail-fast pipeline of external reconfiguration commands
//! - Serializes reload and forwarding decisions through a single shared
//!   gate lock

pub mod config;
pub mod error;
pub mod gate;
pub mod proxy;
pub mod reload;
pub mod upstream;
