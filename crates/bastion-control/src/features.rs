//! Runtime feature flags.
//!
//! A [`FeatureFlags`] table maps flag names to an enabled bit plus a short
//! description. Flags are registered up front and toggled while the
//! process runs; the feature-gate stage consults the table per request.
//! A name that was never registered reads as disabled.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Instant;
use thiserror::Error;

/// Toggling a flag that was never registered.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("feature flag '{0}' is not registered")]
pub struct FeatureNotFound(pub String);

/// One registered flag.
#[derive(Debug, Clone)]
pub struct Feature {
    /// Flag name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Whether the feature is on.
    pub enabled: bool,
    /// When the flag was last registered or toggled.
    pub updated_at: Instant,
}

/// Shared feature-flag table.
#[derive(Debug, Default)]
pub struct FeatureFlags {
    flags: RwLock<HashMap<String, Feature>>,
}

impl FeatureFlags {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `name`, replacing any earlier registration.
    pub fn register(&self, name: impl Into<String>, description: impl Into<String>, enabled: bool) {
        let name = name.into();
        let feature = Feature {
            name: name.clone(),
            description: description.into(),
            enabled,
            updated_at: Instant::now(),
        };
        self.flags.write().insert(name, feature);
    }

    /// Turns `name` on.
    pub fn enable(&self, name: &str) -> Result<(), FeatureNotFound> {
        self.set(name, true)
    }

    /// Turns `name` off.
    pub fn disable(&self, name: &str) -> Result<(), FeatureNotFound> {
        self.set(name, false)
    }

    /// Sets the enabled bit of a registered flag.
    pub fn set(&self, name: &str, enabled: bool) -> Result<(), FeatureNotFound> {
        let mut flags = self.flags.write();
        let feature = flags
            .get_mut(name)
            .ok_or_else(|| FeatureNotFound(name.to_string()))?;
        if feature.enabled != enabled {
            tracing::info!(feature = %name, enabled, "feature flag toggled");
        }
        feature.enabled = enabled;
        feature.updated_at = Instant::now();
        Ok(())
    }

    /// Returns `true` if `name` is registered and enabled.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.flags.read().get(name).is_some_and(|f| f.enabled)
    }

    /// Returns a copy of one flag.
    pub fn get(&self, name: &str) -> Option<Feature> {
        self.flags.read().get(name).cloned()
    }

    /// Returns flag names and states, sorted by name.
    pub fn snapshot(&self) -> Vec<(String, bool)> {
        let mut flags: Vec<_> = self
            .flags
            .read()
            .values()
            .map(|f| (f.name.clone(), f.enabled))
            .collect();
        flags.sort();
        flags
    }

    /// Returns the number of registered flags.
    pub fn len(&self) -> usize {
        self.flags.read().len()
    }

    /// Returns `true` if no flag is registered.
    pub fn is_empty(&self) -> bool {
        self.flags.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_flag_is_disabled() {
        let flags = FeatureFlags::new();
        assert!(!flags.is_enabled("beta"));
        assert_eq!(flags.enable("beta"), Err(FeatureNotFound("beta".to_string())));
        assert!(flags.is_empty());
    }

    #[test]
    fn test_toggle_registered_flag() {
        let flags = FeatureFlags::new();
        flags.register("beta", "new checkout flow", false);
        assert!(!flags.is_enabled("beta"));

        flags.enable("beta").unwrap();
        assert!(flags.is_enabled("beta"));

        flags.disable("beta").unwrap();
        assert!(!flags.is_enabled("beta"));
        assert_eq!(flags.get("beta").unwrap().description, "new checkout flow");
    }

    #[test]
    fn test_register_replaces() {
        let flags = FeatureFlags::new();
        flags.register("beta", "first", true);
        flags.register("beta", "second", false);
        assert_eq!(flags.len(), 1);
        assert!(!flags.is_enabled("beta"));
    }

    #[test]
    fn test_snapshot_sorted() {
        let flags = FeatureFlags::new();
        flags.register("search", "", true);
        flags.register("export", "", false);
        assert_eq!(
            flags.snapshot(),
            vec![("export".to_string(), false), ("search".to_string(), true)]
        );
    }
}
