//! Transport adapters.
//!
//! Thin, target-gated bindings to the HTTP server, the MQTT client and
//! the cloud telemetry collaborator. All protocol logic (payload
//! shapes, rate limiting, token bookkeeping) is pure and host-tested;
//! only the socket ends are ESP-IDF specific.

pub mod cloud;
pub mod http;
pub mod mqtt;
