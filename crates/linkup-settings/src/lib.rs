//! # linkup-settings
//!
//! Layered configuration for Linkup servers and clients.
//!
//! 1. **Compiled defaults**: [`LinkupSettings::default()`]
//! 2. **User file**: `~/.linkup/settings.json`, deep-merged over defaults
//! 3. **Environment**: `LINKUP_*` overrides (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::{ClientSettings, LinkupSettings, LoggingSettings, ServerSettings};

use std::sync::OnceLock;

static SETTINGS: OnceLock<LinkupSettings> = OnceLock::new();

/// Process-wide settings, loaded on first access.
///
/// Falls back to compiled defaults if the user file cannot be loaded.
pub fn get_settings() -> &'static LinkupSettings {
    SETTINGS.get_or_init(|| {
        load_settings().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to load settings, using defaults");
            LinkupSettings::default()
        })
    })
}

/// Install `settings` as the process-wide value.
///
/// Returns the settings back if the global was already initialized.
#[allow(clippy::result_large_err)]
pub fn init_settings(settings: LinkupSettings) -> std::result::Result<(), LinkupSettings> {
    SETTINGS.set(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_path_under_home() {
        let path = settings_path();
        assert!(path.ends_with(".linkup/settings.json"));
    }

    #[test]
    fn init_then_get() {
        let mut settings = LinkupSettings::default();
        settings.logging.level = "trace".into();
        // Another test may have initialized the global first.
        if init_settings(settings).is_ok() {
            assert_eq!(get_settings().logging.level, "trace");
        }
    }
}
