//! # party-settings
//!
//! Layered configuration for the party client.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults** — [`ClientSettings::default()`]
//! 2. **User file** — `~/.party/settings.json` (deep-merged over defaults)
//! 3. **Environment variables** — `PARTY_*` overrides (highest priority)
//!
//! The global value is reloadable: [`reload_settings_from_path`] swaps it so
//! later [`get_settings`] calls observe the new values. Runtime components
//! take a [`SyncSettings`]/[`EventSettings`] by value at construction, so a
//! reload affects sessions joined afterwards.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;

static SETTINGS: RwLock<Option<Arc<ClientSettings>>> = RwLock::new(None);

/// Get the global settings, loading them on first access.
///
/// Falls back to compiled defaults if loading fails.
pub fn get_settings() -> Arc<ClientSettings> {
    if let Some(s) = SETTINGS.read().as_ref() {
        return Arc::clone(s);
    }

    let mut guard = SETTINGS.write();
    // Another thread may have initialized while we waited for the write lock
    if let Some(s) = guard.as_ref() {
        return Arc::clone(s);
    }

    let settings = Arc::new(match load_settings() {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load settings, using defaults");
            ClientSettings::default()
        }
    });
    *guard = Some(Arc::clone(&settings));
    settings
}

/// Replace the global settings.
pub fn init_settings(settings: ClientSettings) {
    *SETTINGS.write() = Some(Arc::new(settings));
}

/// Reload the global settings from a file, falling back to defaults on error.
pub fn reload_settings_from_path(path: &Path) {
    let new = Arc::new(match load_settings_from_path(path) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, ?path, "failed to reload settings, falling back to defaults");
            ClientSettings::default()
        }
    });
    *SETTINGS.write() = Some(new);
    tracing::info!(?path, "settings reloaded from disk");
}

#[cfg(test)]
pub(crate) fn reset_settings() {
    *SETTINGS.write() = None;
}
