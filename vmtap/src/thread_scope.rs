//! Per-thread notification scope.
//!
//! Fine-grained call events are expensive, so they stay globally
//! disabled. This tracker enables them only for a small well-known set of
//! thread names (the main thread, the attach worker) and disables them
//! again when those threads end. Every started thread is cached by
//! handle so later callbacks can resolve its display name without going
//! back to the runtime.
//!
//! Start/end callbacks are delivered non-reentrantly per thread by the
//! host, so the cache only needs a plain mutex.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use log::{debug, warn};
use vmtap_common::ThreadHandle;

use crate::runtime::{AgentEvent, RuntimeEnv};

/// Cached state for one live thread.
struct TrackedThread {
    name: String,
    scoped: bool,
}

/// Tracks thread lifetimes and toggles per-call notification scope.
pub struct ThreadScopeTracker {
    scoped_names: HashSet<String>,
    threads: Mutex<HashMap<ThreadHandle, TrackedThread>>,
}

impl ThreadScopeTracker {
    #[must_use]
    pub fn new(scoped_names: impl IntoIterator<Item = String>) -> Self {
        Self { scoped_names: scoped_names.into_iter().collect(), threads: Mutex::new(HashMap::new()) }
    }

    /// Thread-start: cache the display name; for well-known names, enable
    /// per-call notification for this thread only.
    ///
    /// When the name cannot be resolved the event's remaining work is
    /// skipped; the thread is simply not tracked.
    pub fn on_thread_start(&self, runtime: &dyn RuntimeEnv, thread: ThreadHandle) {
        let Ok(name) = runtime.thread_name(thread) else {
            debug!(target: AgentEvent::ThreadStart.log_target(), "no name for {thread}");
            return;
        };

        let mut scoped = self.scoped_names.contains(&name);
        if scoped {
            scoped = self.toggle_call_events(runtime, thread, true);
            if scoped {
                debug!(
                    target: AgentEvent::ThreadStart.log_target(),
                    "per-call notification enabled for \"{name}\" ({thread})"
                );
            }
        }

        if let Ok(mut threads) = self.threads.lock() {
            threads.insert(thread, TrackedThread { name, scoped });
        }
    }

    /// Thread-end: disable scope if it was enabled, and evict the cache
    /// entry regardless of prior state.
    pub fn on_thread_end(&self, runtime: &dyn RuntimeEnv, thread: ThreadHandle) {
        let Some(tracked) = self.threads.lock().ok().and_then(|mut t| t.remove(&thread)) else {
            return;
        };
        if tracked.scoped {
            self.toggle_call_events(runtime, thread, false);
            debug!(
                target: AgentEvent::ThreadEnd.log_target(),
                "per-call notification disabled for \"{}\" ({thread})",
                tracked.name
            );
        }
    }

    /// Cached display name for a tracked thread.
    #[must_use]
    pub fn display_name(&self, thread: ThreadHandle) -> Option<String> {
        self.threads.lock().ok().and_then(|t| t.get(&thread).map(|tracked| tracked.name.clone()))
    }

    /// Number of currently tracked threads.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.threads.lock().map(|t| t.len()).unwrap_or(0)
    }

    /// Flip entry and exit notification for one thread. Returns whether
    /// both toggles took effect.
    fn toggle_call_events(
        &self,
        runtime: &dyn RuntimeEnv,
        thread: ThreadHandle,
        enabled: bool,
    ) -> bool {
        for event in [AgentEvent::MethodEntry, AgentEvent::MethodExit] {
            if let Err(e) = runtime.set_event_enabled(event, Some(thread), enabled) {
                warn!(
                    target: AgentEvent::ThreadStart.log_target(),
                    "failed to toggle {event:?} for {thread}: {e}"
                );
                return false;
            }
        }
        true
    }
}
