//! # prlens-settings
//!
//! Layered configuration for prlens.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`PrlensSettings::default()`]
//! 2. **User file**: `~/.prlens/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `PRLENS_*` overrides (highest priority)
//!
//! The global cache is reloadable: [`reload_settings_from_path`] swaps the
//! value so later [`get_settings`] calls see the new file contents. Readers
//! that call [`get_settings`] per request (the HTTP handlers) pick up a
//! reload immediately; values consumed once at startup (bind address,
//! upstream URL, queue capacity) need a restart.
//!
//! ```no_run
//! use prlens_settings::get_settings;
//!
//! let settings = get_settings();
//! println!("listening on {}", settings.server.bind_addr());
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, deep_merge, load_settings, load_settings_from_path, load_settings_with,
    settings_path,
};
pub use types::*;

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;

/// Global settings cache. `Option` so the value can be swapped on reload.
static SETTINGS: RwLock<Option<Arc<PrlensSettings>>> = RwLock::new(None);

/// Get the global settings instance.
///
/// The first call loads `~/.prlens/settings.json` with env overrides and
/// falls back to compiled defaults if that fails. Later calls return the
/// cached snapshot.
pub fn get_settings() -> Arc<PrlensSettings> {
    if let Some(s) = SETTINGS.read().as_ref() {
        return Arc::clone(s);
    }

    let mut guard = SETTINGS.write();
    if let Some(s) = guard.as_ref() {
        return Arc::clone(s);
    }

    let settings = Arc::new(match load_settings() {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load settings, using defaults");
            PrlensSettings::default()
        }
    });
    *guard = Some(Arc::clone(&settings));
    settings
}

/// Replace the global settings with a specific value.
///
/// Used at startup once CLI flags have been applied.
pub fn init_settings(settings: PrlensSettings) {
    *SETTINGS.write() = Some(Arc::new(settings));
}

/// Reload settings from `path` and swap the global cache.
///
/// On failure the previous value is kept and the error is returned.
pub fn reload_settings_from_path(path: &Path) -> Result<Arc<PrlensSettings>> {
    let new = Arc::new(load_settings_from_path(path)?);
    *SETTINGS.write() = Some(Arc::clone(&new));
    tracing::info!(?path, "settings reloaded from disk");
    Ok(new)
}

/// Clear the cache so the next [`get_settings`] reloads.
#[cfg(test)]
pub(crate) fn reset_settings() {
    *SETTINGS.write() = None;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests that touch the global must hold this lock.
    static SETTINGS_MUTEX: parking_lot::Mutex<()> = parking_lot::Mutex::new(());

    #[test]
    fn init_settings_sets_custom_value() {
        let _lock = SETTINGS_MUTEX.lock();
        reset_settings();
        let mut custom = PrlensSettings::default();
        custom.server.port = 9999;
        init_settings(custom);
        assert_eq!(get_settings().server.port, 9999);
        reset_settings();
    }

    #[test]
    fn reload_updates_cached_value() {
        let _lock = SETTINGS_MUTEX.lock();
        reset_settings();
        init_settings(PrlensSettings::default());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"router": {"queueCapacity": 7}}"#).unwrap();

        let reloaded = reload_settings_from_path(&path).unwrap();
        assert_eq!(reloaded.router.queue_capacity, 7);
        assert_eq!(get_settings().router.queue_capacity, 7);
        assert_eq!(get_settings().server.port, 4317);
        reset_settings();
    }

    #[test]
    fn failed_reload_keeps_previous_value() {
        let _lock = SETTINGS_MUTEX.lock();
        reset_settings();
        let mut custom = PrlensSettings::default();
        custom.server.port = 7777;
        init_settings(custom);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "[broken").unwrap();

        assert!(reload_settings_from_path(&path).is_err());
        assert_eq!(get_settings().server.port, 7777);
        reset_settings();
    }

    #[test]
    fn snapshots_are_isolated() {
        let _lock = SETTINGS_MUTEX.lock();
        reset_settings();
        init_settings(PrlensSettings::default());
        let snapshot = get_settings();

        let mut next = PrlensSettings::default();
        next.server.port = 5555;
        init_settings(next);

        assert_eq!(snapshot.server.port, 4317);
        assert_eq!(get_settings().server.port, 5555);
        reset_settings();
    }
}
