//! Per-stage skip-path lists.
//!
//! Every stage owns a [`SkipPaths`]. A skipped path bypasses that stage
//! only; the rest of the pipeline still runs.
//!
//! Entries ending in `*` match by prefix, all others match exactly:
//!
//! ```
//! use bastion_middleware::SkipPaths;
//!
//! let skip = SkipPaths::new(["/health", "/public/*"]);
//! assert!(skip.matches("/health"));
//! assert!(!skip.matches("/healthz"));
//! assert!(skip.matches("/public/logo.png"));
//! assert!(!skip.matches("/api/users"));
//! ```

use std::collections::HashSet;

/// A set of exact and prefix path patterns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkipPaths {
    exact: HashSet<String>,
    prefixes: Vec<String>,
}

impl SkipPaths {
    /// Builds a list from patterns. A trailing `*` marks a prefix.
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut skip = Self::default();
        for pattern in patterns {
            skip.push(pattern.as_ref());
        }
        skip
    }

    /// Adds an exact path.
    #[must_use]
    pub fn exact(mut self, path: impl Into<String>) -> Self {
        self.exact.insert(path.into());
        self
    }

    /// Adds a path prefix.
    #[must_use]
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefixes.push(prefix.into());
        self
    }

    fn push(&mut self, pattern: &str) {
        match pattern.strip_suffix('*') {
            Some(prefix) => self.prefixes.push(prefix.to_string()),
            None => {
                self.exact.insert(pattern.to_string());
            }
        }
    }

    /// Returns `true` if `path` is skipped.
    pub fn matches(&self, path: &str) -> bool {
        self.exact.contains(path) || self.prefixes.iter().any(|p| path.starts_with(p.as_str()))
    }

    /// Returns `true` if no path is skipped.
    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.prefixes.is_empty()
    }
}
