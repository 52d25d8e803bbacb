//! # opus-settings
//!
//! Layered configuration for the Opus message gateway.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`GatewaySettings::default()`]
//! 2. **User file**: `~/.opus/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `OPUS_*` overrides (highest priority)
//!
//! ```no_run
//! let settings = opus_settings::load_settings().unwrap_or_default();
//! println!("gateway port: {}", settings.server.port);
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
