//! Shared types for the OSA runtime: errors, messages, stream events,
//! signals, agent roles/tiers, and the env-driven configuration.

pub mod agent;
pub mod config;
pub mod error;
pub mod message;
pub mod signal;
pub mod stream;

pub use error::{Error, Result};
