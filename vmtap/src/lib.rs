//! # vmtap - Managed-Runtime Interception Engine
//!
//! vmtap observes a managed runtime from outside its normal control flow.
//! It watches class-loading and native-method-binding events, classifies
//! observed bytecode as tampered or normal, and can transparently
//! redirect calls to specific native methods through a
//! captured-original/trampoline mechanism. It exists for engineers
//! analyzing how a protected application resists instrumentation.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Hooked Runtime                            │
//! │        (class loads, native binds, thread lifecycle)            │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ callbacks via the bootstrap shim
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     vmtap (This Crate)                          │
//! │                                                                 │
//! │  class load ──▶ ScopeFilter ──▶ classify ──▶ DirArchiver       │
//! │                                     │                           │
//! │                                     ▼                           │
//! │                               EncryptedSet                      │
//! │                                                                 │
//! │  native bind ──▶ Trampolines ◀── every later call (dispatch)    │
//! │                                                                 │
//! │  thread start/end ──▶ ThreadScopeTracker                        │
//! │  method entry/exit ──▶ TimingPipeline ──▶ log sink              │
//! │                                                                 │
//! │  on demand: retransform ──▶ back through the class-load path    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`agent`]: the context object owning all process-wide state, with
//!   the callback entry points and explicit init/teardown
//! - [`config`]: externally supplied configuration (scope patterns, bind
//!   target, discriminator, pipeline tuning)
//! - [`filter`]: exclude-then-include scope decisions on class names
//! - [`classification`]: magic-number tamper heuristic + encrypted set
//! - [`archive`]: best-effort bucketed persistence of observed buffers
//! - [`trampoline`]: captured-original registry and call dispatch
//! - [`retransform`]: on-demand reload of already-loaded target classes
//! - [`thread_scope`]: per-thread call-notification scope
//! - [`timing`]: bounded call-timing pipeline with one background writer
//! - [`runtime`]: the collaborator trait standing in for the hooked
//!   runtime, plus capability and event enumerations
//!
//! ## Key Concepts
//!
//! - **Trampoline**: a substitute entry point interposed on a native
//!   method; the captured original is never lost, only forwarded to.
//! - **Magic-number heuristic**: a well-formed class file opens with
//!   fixed magic bytes; anything else was tampered with before the
//!   runtime saw it.
//! - **Retransformation**: the runtime re-delivers the class-load
//!   pipeline for chosen classes, closing the observe → reconfigure →
//!   re-observe loop.
//! - **Callback discipline**: runtime-owned buffers live only for their
//!   callback; failures never escape back into the host.

pub mod agent;
pub mod archive;
pub mod classification;
pub mod config;
pub mod filter;
pub mod retransform;
pub mod runtime;
pub mod thread_scope;
pub mod timing;
pub mod trampoline;

// Re-export the types embedders touch most
pub use agent::{Agent, AgentStats};
pub use classification::{classify, ClassKind};
pub use config::{parse_class_list, AgentConfig, TargetSignature};
pub use runtime::{AgentEvent, Capability, RuntimeEnv, RuntimeError, RuntimeResult};
pub use timing::{TimingRecord, TimingSink};
pub use trampoline::{NativeFn, SubstituteFn};
