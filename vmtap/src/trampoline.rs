//! Native-bind interception: capture originals, dispatch substitutes.
//!
//! When the runtime binds the configured target method, the registry
//! captures the original entry point under an exclusive lock and hands
//! the runtime a replacement. Every later call to the method lands in
//! [`Trampolines::dispatch`], which takes the shared lock, inspects the
//! argument buffer against the discriminating header, and either runs
//! the injected substitute implementation or forwards to the captured
//! original with the arguments untouched.
//!
//! Capture-before-replace: the original entry is recorded before the
//! replacement is ever visible, so it can never be lost, only
//! interposed.
//!
//! ## Locking
//!
//! Binds are rare and serialized per class load; invocations are frequent
//! and arrive concurrently on runtime-owned threads. A reader/writer lock
//! keeps concurrent dispatches from serializing against each other while
//! still giving the bind path exclusive access for its single write.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use log::{debug, warn};
use vmtap_common::{MethodHandle, MethodInfo};

use crate::config::TargetSignature;
use crate::runtime::AgentEvent;

/// A callable native entry point.
///
/// The engine models entry points as owned callables rather than raw
/// addresses: a captured original is one variant of the dispatch, the
/// substitute is the other, and the discriminator picks between them.
pub type NativeFn = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// Substitute implementation run when the discriminator matches.
///
/// This is a policy slot, not an algorithm: the engine only guarantees
/// the dispatch structure. The default passes arguments through
/// unchanged.
pub type SubstituteFn = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// Pass-through substitute used when no policy is injected.
#[must_use]
pub fn passthrough_substitute() -> SubstituteFn {
    Arc::new(|args: &[u8]| args.to_vec())
}

/// One captured binding. The original entry is immutable once recorded;
/// only the active flag ever changes, and only at teardown.
struct TrampolineEntry {
    original: NativeFn,
    active: bool,
}

/// Registry of captured native entry points plus the dispatch logic the
/// replacement entry points run.
pub struct Trampolines {
    target: TargetSignature,
    discriminator: Vec<u8>,
    substitute: SubstituteFn,
    entries: RwLock<HashMap<MethodHandle, TrampolineEntry>>,
}

impl Trampolines {
    #[must_use]
    pub fn new(
        target: TargetSignature,
        discriminator: Vec<u8>,
        substitute: SubstituteFn,
    ) -> Arc<Self> {
        Arc::new(Self { target, discriminator, substitute, entries: RwLock::new(HashMap::new()) })
    }

    /// Handle a native-method-bind observation.
    ///
    /// Returns the replacement entry point when the method matches the
    /// target signature, or `None` to leave the binding untouched. A
    /// repeated bind for an already-captured handle (a retransformed
    /// class re-binding its natives) keeps the first captured original.
    pub fn observe_bind(
        self: &Arc<Self>,
        handle: MethodHandle,
        info: &MethodInfo,
        original: NativeFn,
    ) -> Option<NativeFn> {
        if !self.target.matches(info) {
            return None;
        }

        let Ok(mut entries) = self.entries.write() else {
            return None;
        };
        if entries.contains_key(&handle) {
            debug!(
                target: AgentEvent::NativeMethodBind.log_target(),
                "re-bind of already captured {handle} ({info}), keeping first original"
            );
        } else {
            entries.insert(handle, TrampolineEntry { original, active: true });
            warn!(
                target: AgentEvent::NativeMethodBind.log_target(),
                "redirecting {handle} ({info})"
            );
        }
        drop(entries);

        let this = Arc::clone(self);
        Some(Arc::new(move |args: &[u8]| this.dispatch(handle, args).unwrap_or_default()))
    }

    /// Invoke a redirected method.
    ///
    /// `None` means the handle was never captured: a call arrived for a
    /// method whose bind this registry did not record. Under correct
    /// operation that never happens, so it is logged and answered with
    /// no result rather than a guess.
    pub fn dispatch(&self, handle: MethodHandle, args: &[u8]) -> Option<Vec<u8>> {
        let (original, active) = {
            let entries = self.entries.read().ok()?;
            let Some(entry) = entries.get(&handle) else {
                warn!(
                    target: AgentEvent::NativeMethodBind.log_target(),
                    "dispatch for uncaptured {handle}"
                );
                return None;
            };
            (Arc::clone(&entry.original), entry.active)
        };

        // The shared lock is released before either callable runs: the
        // original may re-enter the runtime and trigger further binds.
        if active && self.discriminates(args) {
            Some((self.substitute)(args))
        } else {
            Some(original(args))
        }
    }

    fn discriminates(&self, args: &[u8]) -> bool {
        !self.discriminator.is_empty() && args.starts_with(&self.discriminator)
    }

    /// Number of captured bindings.
    #[must_use]
    pub fn captured(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    /// Mark every entry inactive. Late calls pass straight through to
    /// their originals regardless of the discriminator.
    pub fn deactivate_all(&self) {
        if let Ok(mut entries) = self.entries.write() {
            for entry in entries.values_mut() {
                entry.active = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vmtap_common::{ACC_NATIVE, ACC_PUBLIC};

    fn target() -> TargetSignature {
        TargetSignature {
            class_signature: "LDataVault;".to_string(),
            method_name: "seal".to_string(),
            descriptor: "([B)[B".to_string(),
        }
    }

    fn target_method() -> MethodInfo {
        MethodInfo {
            class_signature: "LDataVault;".to_string(),
            name: "seal".to_string(),
            descriptor: "([B)[B".to_string(),
            modifiers: ACC_PUBLIC | ACC_NATIVE,
        }
    }

    fn echo_original(calls: Arc<AtomicUsize>) -> NativeFn {
        Arc::new(move |args: &[u8]| {
            calls.fetch_add(1, Ordering::SeqCst);
            args.to_vec()
        })
    }

    #[test]
    fn test_non_matching_method_left_alone() {
        let trampolines = Trampolines::new(target(), vec![], passthrough_substitute());
        let mut info = target_method();
        info.modifiers = ACC_PUBLIC; // not native

        let replaced =
            trampolines.observe_bind(MethodHandle(1), &info, echo_original(Arc::default()));
        assert!(replaced.is_none());
        assert_eq!(trampolines.captured(), 0);
    }

    #[test]
    fn test_forward_branch_reaches_original() {
        let calls = Arc::new(AtomicUsize::new(0));
        let trampolines = Trampolines::new(target(), b"GATE".to_vec(), passthrough_substitute());

        let replaced = trampolines
            .observe_bind(MethodHandle(1), &target_method(), echo_original(Arc::clone(&calls)))
            .expect("target method should be redirected");

        assert_eq!(replaced(b"payload"), b"payload".to_vec());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_discriminator_selects_substitute() {
        let calls = Arc::new(AtomicUsize::new(0));
        let substitute: SubstituteFn = Arc::new(|_args: &[u8]| b"substituted".to_vec());
        let trampolines = Trampolines::new(target(), b"GATE".to_vec(), substitute);

        let replaced = trampolines
            .observe_bind(MethodHandle(1), &target_method(), echo_original(Arc::clone(&calls)))
            .unwrap();

        assert_eq!(replaced(b"GATE:payload"), b"substituted".to_vec());
        // original untouched on the substitute branch
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_empty_discriminator_always_forwards() {
        let calls = Arc::new(AtomicUsize::new(0));
        let trampolines = Trampolines::new(target(), vec![], passthrough_substitute());
        let replaced = trampolines
            .observe_bind(MethodHandle(1), &target_method(), echo_original(Arc::clone(&calls)))
            .unwrap();

        replaced(b"");
        replaced(b"anything");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_uncaptured_handle_dispatches_to_nothing() {
        let trampolines = Trampolines::new(target(), vec![], passthrough_substitute());
        assert_eq!(trampolines.dispatch(MethodHandle(99), b"payload"), None);
    }

    #[test]
    fn test_first_capture_wins() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let trampolines = Trampolines::new(target(), vec![], passthrough_substitute());

        trampolines
            .observe_bind(MethodHandle(1), &target_method(), echo_original(Arc::clone(&first)))
            .unwrap();
        let replaced = trampolines
            .observe_bind(MethodHandle(1), &target_method(), echo_original(Arc::clone(&second)))
            .unwrap();

        replaced(b"x");
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_deactivated_entries_forward_even_on_match() {
        let calls = Arc::new(AtomicUsize::new(0));
        let substitute: SubstituteFn = Arc::new(|_args: &[u8]| b"substituted".to_vec());
        let trampolines = Trampolines::new(target(), b"GATE".to_vec(), substitute);
        let replaced = trampolines
            .observe_bind(MethodHandle(1), &target_method(), echo_original(Arc::clone(&calls)))
            .unwrap();

        trampolines.deactivate_all();
        assert_eq!(replaced(b"GATE:payload"), b"GATE:payload".to_vec());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_forwarding_calls() {
        const THREADS: usize = 16;
        const CALLS_PER_THREAD: usize = 64;

        let calls = Arc::new(AtomicUsize::new(0));
        let trampolines = Trampolines::new(target(), b"GATE".to_vec(), passthrough_substitute());
        let replaced = trampolines
            .observe_bind(MethodHandle(1), &target_method(), echo_original(Arc::clone(&calls)))
            .unwrap();

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let replaced = Arc::clone(&replaced);
                std::thread::spawn(move || {
                    for c in 0..CALLS_PER_THREAD {
                        let payload = format!("thread {t} call {c}");
                        // forwarded result is the original's echo, intact
                        assert_eq!(replaced(payload.as_bytes()), payload.as_bytes().to_vec());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), THREADS * CALLS_PER_THREAD);
    }
}
