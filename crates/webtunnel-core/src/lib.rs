//! `webtunnel` Core Library
//!
//! Shared functionality for `webtunnel` components:
//! - Configuration model and layered loading
//! - Persistent identity token
//! - Relay wire protocol messages
//! - Common error types

pub mod config;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod tracing_init;

pub use config::{Config, ConfigOverlay, ServerAddr};
pub use error::{Error, Result};
pub use identity::Identity;
