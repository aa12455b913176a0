//! Memory device hierarchy.
//!
//! A channel's devices form a tree: the interconnect owns ranks, ranks own
//! banks, banks own subarrays. Every level implements `Device`, validating a
//! command against its own timing state before handing it to the child that
//! owns the addressed resource.
//!
//! Commands are validated completely, including every child, before any
//! state changes. A command that fails validation leaves the tree untouched.

pub mod bank;
pub mod cached;
pub mod interconnect;
pub mod rank;
pub mod subarray;

pub use bank::{Bank, BankState, BankStats, BankTiming};
pub use cached::{BankModel, CachedBank, CachedBankStats};
pub use interconnect::{Interconnect, InterconnectStats};
pub use rank::{Rank, RankState, RankStats, RankTiming};
pub use subarray::{SubArray, SubArrayState, SubArrayStats, SubArrayTiming};

use thiserror::Error;

use crate::address::Address;
use crate::event::EventQueue;
use crate::hooks::HookRegistry;
use crate::request::Request;
use crate::types::{ComponentId, Cycle, EventId};

/// Why a command cannot be issued.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    #[error("bank timing constraint not met")]
    BankTiming,

    #[error("rank timing constraint not met")]
    RankTiming,

    #[error("subarray timing constraint not met")]
    SubArrayTiming,

    #[error("bus timing constraint not met")]
    BusTiming,

    #[error("command not legal in the current state")]
    InvalidState,

    #[error("refresh waiting for an open bank to close")]
    OpenRefreshWaiting,

    #[error("refresh waiting for a closed bank to become ready")]
    ClosedRefreshWaiting,

    #[error("command not supported by this device")]
    UnsupportedCommand,

    #[error("addressed device does not exist")]
    NoSuchDevice,

    #[error("unknown failure")]
    Unknown,
}

/// Everything a device needs while issuing or completing a command.
pub struct IssueContext<'a> {
    /// Event queue of the device's clock domain
    pub queue: &'a mut EventQueue,
    /// Command observers
    pub hooks: &'a HookRegistry,
}

impl<'a> IssueContext<'a> {
    pub fn new(queue: &'a mut EventQueue, hooks: &'a HookRegistry) -> Self {
        Self { queue, hooks }
    }

    /// Current cycle of the device's clock domain.
    pub fn now(&self) -> Cycle {
        self.queue.current_cycle()
    }
}

/// Timing state captured when a command was issued.
///
/// Each level fills in its own snapshot on the way down. Restoring it with
/// `Interconnect::interrupt_write` rolls an in-flight write back.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SavedState {
    /// Address of the issued command
    pub address: Address,
    pub rank: Option<RankTiming>,
    pub bank: Option<BankTiming>,
    pub subarray: Option<SubArrayTiming>,
    /// Completion event of an NVM write pulse
    pub completion: Option<(EventId, Cycle)>,
    /// Write-pulse cycles of the issued write
    pub write_pulse: Cycle,
    pub issue_cycle: Cycle,
}

impl SavedState {
    /// Returns true if a write pulse is in flight.
    pub fn has_write_pulse(&self) -> bool {
        self.completion.is_some() && self.write_pulse > 0
    }

    /// Cycle the write pulse completes, if any.
    pub fn completion_cycle(&self) -> Option<Cycle> {
        self.completion.map(|(_, cycle)| cycle)
    }
}

/// Common contract of every level of the device tree.
pub trait Device {
    /// Identifier used for event routing and statistics.
    fn id(&self) -> ComponentId;

    /// Checks whether `request` could be issued at `now`.
    ///
    /// Only wait statistics change.
    fn is_issuable(&mut self, request: &Request, now: Cycle) -> Result<(), FailReason>;

    /// Issues `request` at the current cycle of `ctx`.
    ///
    /// The command is re-validated first and refused without any state change
    /// if it is not legal.
    fn issue_command(&mut self, request: &Request, ctx: &mut IssueContext<'_>) -> Result<SavedState, FailReason>;

    /// Handles a completion arriving at this level.
    ///
    /// Returns true if the completion should keep travelling up the tree.
    fn request_complete(&mut self, request: &mut Request, ctx: &mut IssueContext<'_>) -> bool;

    /// Advances internal accounting by `steps` cycles.
    fn cycle(&mut self, steps: Cycle);

    /// Finalizes derived statistics before reporting.
    fn calculate_stats(&mut self) {}

    /// Exports statistics as JSON.
    fn export_stats(&self) -> serde_json::Value;
}

/// Moves `counter` forward to `at` if `at` is later.
pub(crate) fn push_out(counter: &mut Cycle, at: Cycle) {
    if at > *counter {
        *counter = at;
    }
}

/// Logs a command that was refused during issue.
pub(crate) fn refuse(device: ComponentId, request: &Request, now: Cycle, reason: FailReason) -> FailReason {
    tracing::warn!(
        "{}: refusing {} for request {} at cycle {}: {}",
        device,
        request.op,
        request.id,
        now,
        reason
    );
    reason
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_out_only_moves_forward() {
        let mut counter = 10;
        push_out(&mut counter, 5);
        assert_eq!(counter, 10);
        push_out(&mut counter, 12);
        assert_eq!(counter, 12);
    }

    #[test]
    fn test_context_reads_queue_clock() {
        let mut queue = EventQueue::new();
        let hooks = HookRegistry::new();
        queue.loop_steps(7, &mut crate::event::NullHandler);
        let ctx = IssueContext::new(&mut queue, &hooks);
        assert_eq!(ctx.now(), 7);
    }

    #[test]
    fn test_fail_reason_display() {
        assert_eq!(
            FailReason::OpenRefreshWaiting.to_string(),
            "refresh waiting for an open bank to close"
        );
    }
}
