//! # wsjrpc-settings
//!
//! Configuration for the hub and its peers, loaded from three layers
//! (in priority order):
//! 1. **Compiled defaults**: [`WsjrpcSettings::default()`]
//! 2. **User file**: `~/.wsjrpc/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `WSJRPC_*` overrides (highest priority)
//!
//! Command-line flags in the binaries are applied on top of the result.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, deep_merge, load_settings, load_settings_from_path,
    load_settings_with_env, settings_path,
};
pub use types::*;
