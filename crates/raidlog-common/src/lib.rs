//! raidlog Common - Shared types and utilities
//!
//! This crate provides the error type, checksum helpers, configuration and
//! sector/block arithmetic shared by the journal engine and its
//! collaborators.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use checksum::{page_checksum, uuid_seed, verify_page};
pub use config::{DeviceConfig, JournalConfig};
pub use error::{Error, Result};
pub use types::*;
