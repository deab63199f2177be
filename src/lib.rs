//! Brewing controller firmware core.
//!
//! Exposes the pure-logic modules for integration testing and external
//! inspection. All ESP-IDF-specific code is guarded by
//! `#[cfg(target_os = "espidf")]` within each module; the host build
//! substitutes in-memory simulation backends.

#![deny(unused_must_use)]

pub mod clock;
pub mod command;
pub mod compiler;
pub mod config;
pub mod engine;
pub mod error;
pub mod heaters;
pub mod pid;
pub mod probes;
pub mod registry;
pub mod schedule;
pub mod session;
pub mod settings;
pub mod transport;

pub use engine::BrewEngine;
pub use error::{Error, Result};
