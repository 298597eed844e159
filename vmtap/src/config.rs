//! Agent configuration.
//!
//! Scope patterns, the bind target signature, and pipeline tuning are
//! externally supplied: the attach bootstrap hands the engine a fully
//! parsed [`AgentConfig`], built in code or loaded from a JSON file.
//! Parsing of the raw attach-option string itself stays outside the
//! engine; the only piece it understands is the comma-separated class
//! list commonly carried there ([`parse_class_list`]).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use vmtap_common::MethodInfo;

/// Platform and vendor namespaces skipped before any other work.
///
/// The vast majority of classes the runtime loads come from these; the
/// exclude check bounds their cost to one prefix scan.
const DEFAULT_EXCLUDES: &[&str] = &["java/", "javax/", "jdk/", "sun/", "com/sun/"];

/// Thread names granted fine-grained call notification by default.
const DEFAULT_SCOPED_THREADS: &[&str] = &["main", "Attach Listener"];

/// Default capacity of the timing queue.
const DEFAULT_QUEUE_CAPACITY: usize = 10_240;

/// Identity of the native method whose binding gets redirected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSignature {
    /// Declaring class signature, descriptor form (`LDataVault;`).
    pub class_signature: String,
    /// Simple method name.
    pub method_name: String,
    /// Method descriptor (`([B)[B`).
    pub descriptor: String,
}

impl TargetSignature {
    /// True when a bound method is the one this signature names.
    ///
    /// Only `public native` methods qualify; anything else is left bound
    /// unmodified no matter how its name reads.
    #[must_use]
    pub fn matches(&self, info: &MethodInfo) -> bool {
        info.is_public()
            && info.is_native()
            && info.class_signature == self.class_signature
            && info.name == self.method_name
            && info.descriptor == self.descriptor
    }
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Master switch; a disabled agent observes nothing.
    pub enabled: bool,

    /// Class-name prefixes never examined. Checked before anything else.
    pub exclude_prefixes: Vec<String>,

    /// Class-name prefixes in scope.
    pub include_prefixes: Vec<String>,

    /// Exact internal names in scope.
    pub include_classes: Vec<String>,

    /// Root directory for archived class files.
    pub archive_root: PathBuf,

    /// Fully-qualified names eligible for on-demand retransformation.
    pub retransform_targets: Vec<String>,

    /// Thread display names that get per-call notification.
    pub scoped_threads: Vec<String>,

    /// Native method whose binding is redirected, if any.
    pub bind_target: Option<TargetSignature>,

    /// Leading argument bytes selecting the substitute implementation on
    /// a redirected call. Empty never matches, so every call forwards to
    /// the captured original.
    pub discriminator: Vec<u8>,

    /// Timing queue capacity; producers block when the queue is full.
    pub queue_capacity: usize,

    /// Route timing records through the background consumer. When false,
    /// records are written synchronously on the calling thread.
    pub async_timing: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            exclude_prefixes: DEFAULT_EXCLUDES.iter().map(ToString::to_string).collect(),
            include_prefixes: Vec::new(),
            include_classes: Vec::new(),
            archive_root: PathBuf::from("dumps"),
            retransform_targets: Vec::new(),
            scoped_threads: DEFAULT_SCOPED_THREADS.iter().map(ToString::to_string).collect(),
            bind_target: None,
            discriminator: Vec::new(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            async_timing: true,
        }
    }
}

impl AgentConfig {
    /// Load a configuration from a JSON file.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or does not parse.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("malformed config file: {}", path.display()))
    }
}

/// Split the comma-separated class list carried in the attach options.
///
/// Blank entries are dropped, so trailing commas and double commas are
/// harmless.
#[must_use]
pub fn parse_class_list(options: &str) -> Vec<String> {
    options
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmtap_common::{ACC_NATIVE, ACC_PUBLIC};

    fn target() -> TargetSignature {
        TargetSignature {
            class_signature: "LDataVault;".to_string(),
            method_name: "seal".to_string(),
            descriptor: "([B)[B".to_string(),
        }
    }

    fn method(modifiers: u32) -> MethodInfo {
        MethodInfo {
            class_signature: "LDataVault;".to_string(),
            name: "seal".to_string(),
            descriptor: "([B)[B".to_string(),
            modifiers,
        }
    }

    #[test]
    fn test_signature_match() {
        assert!(target().matches(&method(ACC_PUBLIC | ACC_NATIVE)));
    }

    #[test]
    fn test_signature_rejects_missing_modifiers() {
        assert!(!target().matches(&method(ACC_PUBLIC)));
        assert!(!target().matches(&method(ACC_NATIVE)));
    }

    #[test]
    fn test_signature_rejects_other_method() {
        let mut other = method(ACC_PUBLIC | ACC_NATIVE);
        other.name = "open".to_string();
        assert!(!target().matches(&other));
    }

    #[test]
    fn test_default_excludes_platform_namespaces() {
        let config = AgentConfig::default();
        assert!(config.exclude_prefixes.iter().any(|p| p == "java/"));
        assert!(config.include_prefixes.is_empty());
        assert!(config.enabled);
        assert!(config.queue_capacity > 0);
    }

    #[test]
    fn test_parse_class_list() {
        assert_eq!(
            parse_class_list("com/example/A, com/example/B,,DataVault,"),
            vec!["com/example/A", "com/example/B", "DataVault"]
        );
        assert!(parse_class_list("").is_empty());
    }

    #[test]
    fn test_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vmtap.json");
        let json = r#"{
            "include_prefixes": ["com/example/"],
            "queue_capacity": 16,
            "bind_target": {
                "class_signature": "LDataVault;",
                "method_name": "seal",
                "descriptor": "([B)[B"
            }
        }"#;
        std::fs::write(&path, json).unwrap();

        let config = AgentConfig::from_file(&path).unwrap();
        assert_eq!(config.include_prefixes, vec!["com/example/"]);
        assert_eq!(config.queue_capacity, 16);
        assert_eq!(config.bind_target, Some(target()));
        // unspecified fields keep their defaults
        assert!(config.exclude_prefixes.iter().any(|p| p == "java/"));
    }

    #[test]
    fn test_config_from_missing_file() {
        assert!(AgentConfig::from_file("/nonexistent/vmtap.json").is_err());
    }
}
