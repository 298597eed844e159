//! Scope filtering for class internal names.
//!
//! The runtime delivers a class-file-load event for every class in the
//! process, and almost all of them are platform classes that are never
//! targets. The exclude set is therefore checked first: a hit costs one
//! prefix scan and ends the pipeline for that class. Only survivors are
//! matched against the include set (namespace prefixes plus explicit
//! class names).
//!
//! Matching is pure string work with no side effects, safe to call from
//! any runtime thread.

use std::collections::HashSet;

use crate::config::AgentConfig;

/// Decides whether a class name is in scope.
pub struct ScopeFilter {
    exclude_prefixes: Vec<String>,
    include_prefixes: Vec<String>,
    include_classes: HashSet<String>,
}

impl ScopeFilter {
    #[must_use]
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            exclude_prefixes: config.exclude_prefixes.clone(),
            include_prefixes: config.include_prefixes.clone(),
            include_classes: config.include_classes.iter().cloned().collect(),
        }
    }

    /// True when `name` should flow through classification and archiving.
    ///
    /// An exclude match short-circuits before the include set is ever
    /// consulted, even when the same name would also match an include
    /// pattern.
    #[must_use]
    pub fn in_scope(&self, name: &str) -> bool {
        if self.exclude_prefixes.iter().any(|prefix| name.starts_with(prefix.as_str())) {
            return false;
        }
        self.include_classes.contains(name)
            || self.include_prefixes.iter().any(|prefix| name.starts_with(prefix.as_str()))
    }
}
