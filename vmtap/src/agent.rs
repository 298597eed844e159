//! The agent context.
//!
//! One [`Agent`] owns every piece of process-wide state (scope filter,
//! encrypted-name set, archiver, trampoline registry, thread tracker,
//! timing pipeline) with explicit construction and explicit teardown.
//! The bootstrap shim builds it at attach time, routes raw runtime
//! callbacks into the `on_*` methods, and calls [`Agent::shutdown`] when
//! the host goes away.
//!
//! Every `on_*` method upholds one contract: nothing escapes back across
//! the callback boundary. Failures are absorbed and logged; an escaping
//! panic or error there would take the whole hosted process down.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{ensure, Result};
use log::{debug, error, info, trace, warn};
use vmtap_common::{ClassDescriptor, MethodHandle, MethodInfo, ThreadHandle};

use crate::archive::{ArchiveSink, DirArchiver};
use crate::classification::{classify, ClassKind, EncryptedSet};
use crate::config::AgentConfig;
use crate::filter::ScopeFilter;
use crate::retransform;
use crate::runtime::{AgentEvent, Capability, RuntimeEnv, RuntimeResult};
use crate::thread_scope::ThreadScopeTracker;
use crate::timing::{self, LogSink, TimingPipeline, TimingSink};
use crate::trampoline::{passthrough_substitute, NativeFn, SubstituteFn, Trampolines};

/// Counters exposed for diagnostics and the shutdown summary.
#[derive(Debug, Default, Clone, Copy)]
pub struct AgentStats {
    /// In-scope class-file-load events seen.
    pub classes_observed: usize,
    /// Buffers successfully written by the archiver.
    pub classes_archived: usize,
    /// Distinct classes flagged as encrypted.
    pub encrypted_classes: usize,
    /// Native binds redirected through the trampoline registry.
    pub binds_redirected: usize,
}

/// Process-wide engine state and callback entry points.
pub struct Agent {
    config: AgentConfig,
    filter: ScopeFilter,
    encrypted: EncryptedSet,
    archiver: Box<dyn ArchiveSink>,
    trampolines: Option<Arc<Trampolines>>,
    thread_scope: ThreadScopeTracker,
    timing_sink: Arc<dyn TimingSink>,
    pipeline: Option<TimingPipeline>,
    targets: Mutex<HashSet<String>>,

    classes_observed: AtomicUsize,
    classes_archived: AtomicUsize,
    binds_redirected: AtomicUsize,
}

impl Agent {
    /// Build an agent with production collaborators: a disk archiver under
    /// the configured root, the pass-through substitute, and the logging
    /// timing sink.
    ///
    /// # Errors
    /// Rejects configurations the engine cannot honor.
    pub fn new(config: AgentConfig) -> Result<Self> {
        let archiver = Box::new(DirArchiver::new(config.archive_root.clone()));
        Self::with_parts(config, archiver, passthrough_substitute(), Arc::new(LogSink))
    }

    /// Build an agent with injected collaborators. This is the seam the
    /// tests use: a spy archiver, a marker substitute, a counting sink.
    ///
    /// # Errors
    /// Rejects configurations the engine cannot honor.
    pub fn with_parts(
        config: AgentConfig,
        archiver: Box<dyn ArchiveSink>,
        substitute: SubstituteFn,
        timing_sink: Arc<dyn TimingSink>,
    ) -> Result<Self> {
        ensure!(config.queue_capacity > 0, "timing queue capacity must be positive");

        let filter = ScopeFilter::new(&config);
        let trampolines = config
            .bind_target
            .clone()
            .map(|target| Trampolines::new(target, config.discriminator.clone(), substitute));
        let thread_scope = ThreadScopeTracker::new(config.scoped_threads.iter().cloned());
        let pipeline = config
            .async_timing
            .then(|| TimingPipeline::start(config.queue_capacity, Arc::clone(&timing_sink)));
        let targets = Mutex::new(config.retransform_targets.iter().cloned().collect());

        Ok(Self {
            config,
            filter,
            encrypted: EncryptedSet::new(),
            archiver,
            trampolines,
            thread_scope,
            timing_sink,
            pipeline,
            targets,
            classes_observed: AtomicUsize::new(0),
            classes_archived: AtomicUsize::new(0),
            binds_redirected: AtomicUsize::new(0),
        })
    }

    /// The capability set this configuration needs from the runtime,
    /// assembled once.
    #[must_use]
    pub fn required_capabilities(&self) -> BTreeSet<Capability> {
        let mut capabilities = BTreeSet::from([
            Capability::AllClassHookEvents,
            Capability::RetransformClasses,
            Capability::MethodCallEvents,
        ]);
        if self.trampolines.is_some() {
            capabilities.insert(Capability::NativeMethodBindEvents);
        }
        capabilities
    }

    /// Negotiate capabilities and enable exactly the events the
    /// configuration needs. Call once, before the runtime starts
    /// delivering events.
    ///
    /// # Errors
    /// Returns the runtime's status when negotiation or registration
    /// fails; the bootstrap decides whether to detach.
    pub fn initialize(&self, runtime: &dyn RuntimeEnv) -> RuntimeResult<()> {
        let capabilities: Vec<Capability> = self.required_capabilities().into_iter().collect();
        runtime.add_capabilities(&capabilities)?;

        for event in [AgentEvent::ClassFileLoad, AgentEvent::ThreadStart, AgentEvent::ThreadEnd] {
            runtime.set_event_enabled(event, None, true)?;
        }
        if self.trampolines.is_some() {
            runtime.set_event_enabled(AgentEvent::NativeMethodBind, None, true)?;
        }
        // per-call events stay globally off; the scope tracker turns them
        // on thread by thread
        runtime.set_event_enabled(AgentEvent::MethodEntry, None, false)?;
        runtime.set_event_enabled(AgentEvent::MethodExit, None, false)?;

        info!(
            target: AgentEvent::VmInit.log_target(),
            "agent initialized with {} capabilities",
            capabilities.len()
        );
        Ok(())
    }

    /// Class-file-load callback.
    ///
    /// The descriptor's buffer is owned by the runtime and valid only for
    /// this call; the archiver writes it out before returning and nothing
    /// retains it. Output parameters are never touched; the original
    /// bytecode always stands.
    pub fn on_class_file_load(&self, descriptor: &ClassDescriptor<'_>) {
        if !self.config.enabled || descriptor.is_empty() {
            return;
        }
        if !self.filter.in_scope(descriptor.name) {
            return;
        }
        self.classes_observed.fetch_add(1, Ordering::Relaxed);
        trace!(
            target: AgentEvent::ClassFileLoad.log_target(),
            "{} ({} bytes)",
            descriptor.name,
            descriptor.len()
        );

        let kind = classify(descriptor.data);
        if kind == ClassKind::Encrypted && self.encrypted.insert(descriptor.name) {
            warn!(
                target: AgentEvent::ClassFileLoad.log_target(),
                "tampered bytecode for {}",
                descriptor.name
            );
        }

        match self.archiver.store(kind, descriptor.name, descriptor.data) {
            Ok(path) => {
                self.classes_archived.fetch_add(1, Ordering::Relaxed);
                debug!(
                    target: AgentEvent::ClassFileLoad.log_target(),
                    "archived {} to {}",
                    descriptor.name,
                    path.display()
                );
            }
            Err(e) => {
                // abandoned: no retry, and never fatal to the host
                error!(
                    target: AgentEvent::ClassFileLoad.log_target(),
                    "failed to archive {}: {e}",
                    descriptor.name
                );
            }
        }
    }

    /// Native-method-bind callback.
    ///
    /// Returns the replacement entry point for the configured target
    /// method, or `None` to leave the binding unmodified.
    #[must_use]
    pub fn on_native_method_bind(
        &self,
        handle: MethodHandle,
        info: &MethodInfo,
        original: NativeFn,
    ) -> Option<NativeFn> {
        if !self.config.enabled {
            return None;
        }
        let replacement = self.trampolines.as_ref()?.observe_bind(handle, info, original);
        if replacement.is_some() {
            self.binds_redirected.fetch_add(1, Ordering::Relaxed);
        }
        replacement
    }

    /// Thread-start callback.
    pub fn on_thread_start(&self, runtime: &dyn RuntimeEnv, thread: ThreadHandle) {
        if self.config.enabled {
            self.thread_scope.on_thread_start(runtime, thread);
        }
    }

    /// Thread-end callback.
    pub fn on_thread_end(&self, runtime: &dyn RuntimeEnv, thread: ThreadHandle) {
        if self.config.enabled {
            self.thread_scope.on_thread_end(runtime, thread);
        }
    }

    /// Method-entry callback for a scoped thread.
    pub fn on_method_entry(&self, class_name: &str, method_name: &str) {
        if self.config.enabled {
            timing::enter_call(class_name, method_name);
        }
    }

    /// Method-exit callback for a scoped thread. Produces the timing
    /// record for the innermost open call and hands it to the pipeline
    /// (or writes it synchronously when async timing is off).
    pub fn on_method_exit(&self, thread: ThreadHandle) {
        if !self.config.enabled {
            return;
        }
        let thread_name =
            self.thread_scope.display_name(thread).unwrap_or_else(|| thread.to_string());
        let Some(record) = timing::exit_call(&thread_name) else {
            return;
        };
        match &self.pipeline {
            Some(pipeline) => pipeline.push(record),
            None => self.timing_sink.record(&record),
        }
    }

    /// Ask the runtime to re-deliver class-file-load for every target
    /// class currently loaded. Returns the submitted count.
    ///
    /// # Errors
    /// Enumeration or retransform failure, logged and passed through.
    pub fn retransform_targets(&self, runtime: &dyn RuntimeEnv) -> RuntimeResult<usize> {
        let targets = self.targets.lock().map(|t| t.clone()).unwrap_or_default();
        retransform::request(runtime, &targets)
    }

    /// Extend the retransform target set.
    pub fn add_retransform_targets(&self, names: impl IntoIterator<Item = String>) {
        if let Ok(mut targets) = self.targets.lock() {
            targets.extend(names);
        }
    }

    /// Sorted names of classes observed with tampered bytecode.
    #[must_use]
    pub fn encrypted_classes(&self) -> Vec<String> {
        self.encrypted.snapshot()
    }

    #[must_use]
    pub fn stats(&self) -> AgentStats {
        AgentStats {
            classes_observed: self.classes_observed.load(Ordering::Relaxed),
            classes_archived: self.classes_archived.load(Ordering::Relaxed),
            encrypted_classes: self.encrypted.len(),
            binds_redirected: self.binds_redirected.load(Ordering::Relaxed),
        }
    }

    /// Teardown: deactivate redirections so late calls pass through,
    /// drain the timing pipeline, and flush the logger. Safe to call more
    /// than once; nothing here can fail loudly.
    pub fn shutdown(&self) {
        if let Some(trampolines) = &self.trampolines {
            trampolines.deactivate_all();
        }
        if let Some(pipeline) = &self.pipeline {
            pipeline.shutdown();
        }

        let stats = self.stats();
        info!(
            target: AgentEvent::VmDeath.log_target(),
            "agent shut down: {} classes observed, {} archived, {} encrypted, {} binds redirected",
            stats.classes_observed,
            stats.classes_archived,
            stats.encrypted_classes,
            stats.binds_redirected
        );
        log::logger().flush();
    }
}
