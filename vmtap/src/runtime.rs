//! Boundary with the hooked runtime.
//!
//! The engine never talks to the host VM directly. Everything it needs
//! (capability negotiation, event notification toggles, name lookups,
//! class enumeration, retransformation) goes through [`RuntimeEnv`],
//! implemented by the FFI bootstrap shim in production and by mocks in
//! tests.
//!
//! Failures returned here follow one rule: nothing propagates back across
//! a callback boundary into the runtime. Callers absorb the error, log
//! it, and skip the remaining work for that event.

use thiserror::Error;
use vmtap_common::{ClassHandle, ThreadHandle};

/// Capabilities negotiated with the host before event registration.
///
/// Abstractly this is a declared capability set: assembled once at
/// startup, handed to the runtime in one call, independent of whatever
/// flag-struct layout the host uses internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
    /// Receive class-file-load events for every class, including system
    /// classes loaded before attach.
    AllClassHookEvents,
    /// Receive an event each time the runtime binds a native method.
    NativeMethodBindEvents,
    /// Ask the runtime to re-deliver the load pipeline for loaded classes.
    RetransformClasses,
    /// Receive per-call entry/exit events (scoped per thread, see
    /// `thread_scope`).
    MethodCallEvents,
}

/// Event categories the engine observes.
///
/// Each category logs under its own target so the host's sink
/// configuration can route and level them independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentEvent {
    VmInit,
    VmDeath,
    ThreadStart,
    ThreadEnd,
    ClassFileLoad,
    MethodEntry,
    MethodExit,
    NativeMethodBind,
}

impl AgentEvent {
    /// Stable log target for this event category.
    #[must_use]
    pub const fn log_target(self) -> &'static str {
        match self {
            AgentEvent::VmInit => "vmtap::vm_init",
            AgentEvent::VmDeath => "vmtap::vm_death",
            AgentEvent::ThreadStart => "vmtap::thread_start",
            AgentEvent::ThreadEnd => "vmtap::thread_end",
            AgentEvent::ClassFileLoad => "vmtap::class_file_load",
            AgentEvent::MethodEntry => "vmtap::method_entry",
            AgentEvent::MethodExit => "vmtap::method_exit",
            AgentEvent::NativeMethodBind => "vmtap::native_method_bind",
        }
    }
}

/// Status reported by the hooked runtime for a failed operation.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("handle no longer refers to a live object")]
    StaleHandle,

    #[error("capability unavailable: {0:?}")]
    CapabilityUnavailable(Capability),

    #[error("class is not modifiable")]
    NotModifiable,

    #[error("runtime reported status {0}")]
    Status(i32),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Operations the engine needs from the hooked runtime.
pub trait RuntimeEnv: Send + Sync {
    /// Declare the capability set. Called once, before event registration.
    fn add_capabilities(&self, capabilities: &[Capability]) -> RuntimeResult<()>;

    /// Toggle delivery of one event category, process-wide (`thread` =
    /// `None`) or for a single thread.
    fn set_event_enabled(
        &self,
        event: AgentEvent,
        thread: Option<ThreadHandle>,
        enabled: bool,
    ) -> RuntimeResult<()>;

    /// Resolve a thread's display name.
    fn thread_name(&self, thread: ThreadHandle) -> RuntimeResult<String>;

    /// Handles of every class currently loaded.
    fn loaded_classes(&self) -> RuntimeResult<Vec<ClassHandle>>;

    /// Signature of a loaded class, descriptor form (`Lcom/example/Widget;`).
    fn class_signature(&self, class: ClassHandle) -> RuntimeResult<String>;

    /// Re-deliver the class-file-load pipeline for the given classes.
    fn retransform_classes(&self, classes: &[ClassHandle]) -> RuntimeResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_targets_are_distinct() {
        let events = [
            AgentEvent::VmInit,
            AgentEvent::VmDeath,
            AgentEvent::ThreadStart,
            AgentEvent::ThreadEnd,
            AgentEvent::ClassFileLoad,
            AgentEvent::MethodEntry,
            AgentEvent::MethodExit,
            AgentEvent::NativeMethodBind,
        ];
        let targets: std::collections::HashSet<_> =
            events.iter().map(|e| e.log_target()).collect();
        assert_eq!(targets.len(), events.len());
        assert!(targets.iter().all(|t| t.starts_with("vmtap::")));
    }

    #[test]
    fn test_error_display() {
        let err = RuntimeError::CapabilityUnavailable(Capability::RetransformClasses);
        assert!(err.to_string().contains("RetransformClasses"));
        assert_eq!(RuntimeError::Status(21).to_string(), "runtime reported status 21");
    }
}
