//! Core types for the Ferry image mirroring engine.
//!
//! This crate holds the pieces every other crate depends on: the error
//! type and the configuration model. Domain logic lives in `ferry-engine`.

pub mod config;
pub mod error;

pub use config::{Cleanup, MirrorConfig, PrepareEntry, RegistryCredentials};
pub use error::{FerryError, Result};
