//! Command hook registry.
//!
//! Hooks observe every command as it is issued at each level of the device
//! tree and every completion as it travels back up. They are registered once
//! on the memory system and threaded to the devices through `IssueContext`.
//!
//! # Example
//!
//! ```
//! use nvsim::hooks::{CommandTracer, HookRegistry};
//! use std::sync::Arc;
//!
//! let tracer = Arc::new(CommandTracer::new());
//! let mut hooks = HookRegistry::new();
//! hooks.register(tracer.clone());
//!
//! assert_eq!(hooks.len(), 1);
//! assert!(tracer.records().is_empty());
//! ```

use parking_lot::Mutex;
use std::sync::Arc;

use crate::request::{OpType, Request};
use crate::types::{ComponentId, Cycle, RequestId};

/// Observer of device commands.
///
/// All methods default to doing nothing.
pub trait CommandHook: Send + Sync {
    /// Called before `device` issues `request`.
    fn pre_issue(&self, _device: ComponentId, _request: &Request, _now: Cycle) {}

    /// Called after `device` issued `request`.
    fn post_issue(&self, _device: ComponentId, _request: &Request, _now: Cycle) {}

    /// Called when `device` receives the completion of `request`.
    fn on_complete(&self, _device: ComponentId, _request: &Request, _now: Cycle) {}
}

/// Ordered list of command hooks.
#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: Vec<Arc<dyn CommandHook>>,
}

impl HookRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a hook. Hooks run in registration order.
    pub fn register(&mut self, hook: Arc<dyn CommandHook>) {
        self.hooks.push(hook);
    }

    /// Returns the number of registered hooks.
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Returns true if no hooks are registered.
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Removes all hooks.
    pub fn clear(&mut self) {
        self.hooks.clear();
    }

    pub fn pre_issue(&self, device: ComponentId, request: &Request, now: Cycle) {
        for hook in &self.hooks {
            hook.pre_issue(device, request, now);
        }
    }

    pub fn post_issue(&self, device: ComponentId, request: &Request, now: Cycle) {
        for hook in &self.hooks {
            hook.post_issue(device, request, now);
        }
    }

    pub fn on_complete(&self, device: ComponentId, request: &Request, now: Cycle) {
        for hook in &self.hooks {
            hook.on_complete(device, request, now);
        }
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

/// What a trace record describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceKind {
    Issue,
    Complete,
}

/// One traced command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceRecord {
    pub kind: TraceKind,
    pub device: ComponentId,
    pub request: RequestId,
    pub op: OpType,
    pub cycle: Cycle,
}

/// Hook that records every issue and completion.
///
/// By default only ranks are recorded, which yields exactly one record per
/// command. `with_all_levels` records every device level.
#[derive(Debug, Default)]
pub struct CommandTracer {
    records: Mutex<Vec<TraceRecord>>,
    all_levels: bool,
}

impl CommandTracer {
    /// Creates a tracer recording rank-level events.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a tracer recording every device level.
    pub fn with_all_levels() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            all_levels: true,
        }
    }

    /// Returns a copy of the recorded trace.
    pub fn records(&self) -> Vec<TraceRecord> {
        self.records.lock().clone()
    }

    /// Returns the issued commands as `(cycle, op)` pairs.
    pub fn issued(&self) -> Vec<(Cycle, OpType)> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.kind == TraceKind::Issue)
            .map(|r| (r.cycle, r.op))
            .collect()
    }

    /// Discards the recorded trace.
    pub fn clear(&self) {
        self.records.lock().clear();
    }

    fn record(&self, kind: TraceKind, device: ComponentId, request: &Request, now: Cycle) {
        if !self.all_levels && !matches!(device, ComponentId::Rank { .. }) {
            return;
        }
        self.records.lock().push(TraceRecord {
            kind,
            device,
            request: request.id,
            op: request.op,
            cycle: now,
        });
    }
}

impl CommandHook for CommandTracer {
    fn post_issue(&self, device: ComponentId, request: &Request, now: Cycle) {
        self.record(TraceKind::Issue, device, request, now);
    }

    fn on_complete(&self, device: ComponentId, request: &Request, now: Cycle) {
        self.record(TraceKind::Complete, device, request, now);
    }
}
