//! On-demand retransformation of already-loaded target classes.
//!
//! Retransformation re-delivers the class-file-load pipeline for the
//! requested classes, which routes them back through scope filtering and
//! tamper classification. The usual workflow: a class is flagged as
//! encrypted on first load, analysis tweaks the configuration, and a
//! retransform re-delivers its bytecode for a second look.

use std::collections::HashSet;

use log::{info, warn};

use crate::runtime::{AgentEvent, RuntimeEnv, RuntimeResult};

/// Strip descriptor decoration from a class signature.
///
/// `Lcom/example/Widget;` becomes `com/example/Widget`; names already in
/// plain form pass through unchanged.
#[must_use]
pub fn normalize_signature(signature: &str) -> &str {
    signature
        .strip_prefix('L')
        .and_then(|rest| rest.strip_suffix(';'))
        .unwrap_or(signature)
}

/// Enumerate loaded classes and ask the runtime to retransform the ones
/// named in `targets`. Returns how many classes were submitted.
///
/// # Errors
/// Enumeration or retransform failures are logged and handed back to the
/// caller as-is. No retry is attempted.
pub fn request(runtime: &dyn RuntimeEnv, targets: &HashSet<String>) -> RuntimeResult<usize> {
    if targets.is_empty() {
        return Ok(0);
    }

    let classes = runtime.loaded_classes().inspect_err(|e| {
        warn!(
            target: AgentEvent::ClassFileLoad.log_target(),
            "failed to enumerate loaded classes: {e}"
        );
    })?;

    let mut selected = Vec::new();
    for class in classes {
        // A class whose signature cannot be resolved is skipped, not an
        // error: missing enrichment never aborts the sweep.
        let Ok(signature) = runtime.class_signature(class) else {
            continue;
        };
        if targets.contains(normalize_signature(&signature)) {
            selected.push(class);
        }
    }

    if selected.is_empty() {
        return Ok(0);
    }

    runtime.retransform_classes(&selected).inspect_err(|e| {
        warn!(
            target: AgentEvent::ClassFileLoad.log_target(),
            "retransform request for {} classes failed: {e}",
            selected.len()
        );
    })?;

    info!(
        target: AgentEvent::ClassFileLoad.log_target(),
        "retransform requested for {} of {} target classes",
        selected.len(),
        targets.len()
    );
    Ok(selected.len())
}
