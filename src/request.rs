//! Memory requests.
//!
//! A `Request` is both the unit of work a front end hands to a controller
//! (a *transaction*) and the protocol primitive a controller hands to the
//! device tree (a *command*). Requests are plain values: they are cloned
//! into events and lanes instead of being shared by pointer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::address::Address;
use crate::types::{ComponentId, Cycle, RequestId};

/// Operation carried by a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpType {
    Nop,
    Activate,
    Read,
    ReadPrecharge,
    Write,
    WritePrecharge,
    Precharge,
    PrechargeAll,
    PowerdownPda,
    PowerdownPdpf,
    PowerdownPdps,
    Powerup,
    Refresh,
    BusRead,
    BusWrite,
}

impl OpType {
    /// READ or READ_PRECHARGE.
    pub fn is_read(self) -> bool {
        matches!(self, OpType::Read | OpType::ReadPrecharge)
    }

    /// WRITE or WRITE_PRECHARGE.
    pub fn is_write(self) -> bool {
        matches!(self, OpType::Write | OpType::WritePrecharge)
    }

    /// Column commands move data over the bus.
    pub fn is_column(self) -> bool {
        self.is_read() || self.is_write()
    }

    /// Column command that closes its row afterwards.
    pub fn has_implicit_precharge(self) -> bool {
        matches!(self, OpType::ReadPrecharge | OpType::WritePrecharge)
    }

    /// PRECHARGE or PRECHARGE_ALL.
    pub fn is_precharge(self) -> bool {
        matches!(self, OpType::Precharge | OpType::PrechargeAll)
    }

    /// Any of the three power-down commands.
    pub fn is_powerdown(self) -> bool {
        matches!(
            self,
            OpType::PowerdownPda | OpType::PowerdownPdpf | OpType::PowerdownPdps
        )
    }

    /// Returns the plain column command for an implicit-precharge variant.
    pub fn without_precharge(self) -> OpType {
        match self {
            OpType::ReadPrecharge => OpType::Read,
            OpType::WritePrecharge => OpType::Write,
            other => other,
        }
    }

    /// Returns the implicit-precharge variant of a column command.
    pub fn with_precharge(self) -> OpType {
        match self {
            OpType::Read => OpType::ReadPrecharge,
            OpType::Write => OpType::WritePrecharge,
            other => other,
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpType::Nop => "NOP",
            OpType::Activate => "ACTIVATE",
            OpType::Read => "READ",
            OpType::ReadPrecharge => "READ_PRECHARGE",
            OpType::Write => "WRITE",
            OpType::WritePrecharge => "WRITE_PRECHARGE",
            OpType::Precharge => "PRECHARGE",
            OpType::PrechargeAll => "PRECHARGE_ALL",
            OpType::PowerdownPda => "POWERDOWN_PDA",
            OpType::PowerdownPdpf => "POWERDOWN_PDPF",
            OpType::PowerdownPdps => "POWERDOWN_PDPS",
            OpType::Powerup => "POWERUP",
            OpType::Refresh => "REFRESH",
            OpType::BusRead => "BUS_READ",
            OpType::BusWrite => "BUS_WRITE",
        };
        f.write_str(name)
    }
}

/// Completion status of a request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    #[default]
    Incomplete,
    Complete,
    Retry,
}

/// Who finishes a request once the device tree reports it complete.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Owner {
    /// A transaction from outside the memory system; its continuation runs.
    #[default]
    Frontend,
    /// A command generated by the controller of this channel.
    Controller,
    /// An implicit follow-up created by a device (e.g. implicit precharge).
    Device(ComponentId),
}

/// Mutable per-request flags used by write pause/cancel and scheduling.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFlags {
    /// The last in-flight attempt was cancelled
    pub cancelled: bool,
    /// The last in-flight attempt was paused
    pub paused: bool,
    /// May no longer be paused or cancelled
    pub forced: bool,
    /// Scheduling hint set by the front end
    pub priority: bool,
    /// The write model reported a hard failure
    pub hard_failure: bool,
    /// Number of times an in-flight attempt was interrupted
    pub cancellation_count: u32,
}

/// Continuation invoked exactly once when a transaction completes.
#[derive(Clone)]
pub struct CompletionHandle(Arc<dyn Fn(&Request) + Send + Sync>);

impl CompletionHandle {
    /// Wraps a closure.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Request) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    fn call(&self, request: &Request) {
        (self.0)(request)
    }
}

impl fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CompletionHandle(..)")
    }
}

/// A memory request.
#[derive(Clone, Debug)]
pub struct Request {
    /// Identifier, shared by a transaction and the commands built from it
    pub id: RequestId,
    /// Translated target address
    pub address: Address,
    /// Operation
    pub op: OpType,
    /// Number of bursts transferred by a column command
    pub burst_count: u64,
    /// Issuing hardware thread
    pub thread_id: u32,
    /// Payload, consumed by the write model
    pub data: Vec<u8>,
    /// Completion status
    pub status: RequestStatus,
    /// Scheduling and interruption flags
    pub flags: RequestFlags,
    /// Write-pulse cycles already completed before a pause
    pub progress: Cycle,
    /// Who finishes this request
    pub owner: Owner,
    /// Cycle the controller accepted the transaction
    pub arrival_cycle: Cycle,
    /// Cycle the column command was issued
    pub issue_cycle: Cycle,
    /// Cycle the transaction completed
    pub completion_cycle: Cycle,
    pub is_prefetch: bool,
    pub program_counter: u64,
    completion: Option<CompletionHandle>,
}

impl Request {
    /// Creates a request with default fields.
    pub fn new(id: RequestId, op: OpType, address: Address) -> Self {
        Self {
            id,
            address,
            op,
            burst_count: 1,
            thread_id: 0,
            data: Vec::new(),
            status: RequestStatus::Incomplete,
            flags: RequestFlags::default(),
            progress: 0,
            owner: Owner::Frontend,
            arrival_cycle: 0,
            issue_cycle: 0,
            completion_cycle: 0,
            is_prefetch: false,
            program_counter: 0,
            completion: None,
        }
    }

    /// Creates a read transaction.
    pub fn read(id: RequestId, address: Address) -> Self {
        Self::new(id, OpType::Read, address)
    }

    /// Creates a write transaction.
    pub fn write(id: RequestId, address: Address) -> Self {
        Self::new(id, OpType::Write, address)
    }

    /// Creates a controller-owned command targeting the same location as `parent`.
    ///
    /// The command carries no continuation.
    pub fn command(op: OpType, parent: &Request) -> Self {
        Self {
            id: parent.id,
            address: parent.address,
            op,
            burst_count: parent.burst_count,
            thread_id: parent.thread_id,
            data: Vec::new(),
            status: RequestStatus::Incomplete,
            flags: RequestFlags::default(),
            progress: 0,
            owner: Owner::Controller,
            arrival_cycle: parent.arrival_cycle,
            issue_cycle: 0,
            completion_cycle: 0,
            is_prefetch: parent.is_prefetch,
            program_counter: parent.program_counter,
            completion: None,
        }
    }

    /// Creates a device-owned follow-up (e.g. an implicit precharge).
    pub fn follow_up(op: OpType, parent: &Request, owner: ComponentId) -> Self {
        let mut req = Self::command(op, parent);
        req.owner = Owner::Device(owner);
        req
    }

    /// Sets the burst count.
    pub fn with_burst_count(mut self, burst_count: u64) -> Self {
        self.burst_count = burst_count.max(1);
        self
    }

    /// Sets the payload.
    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    /// Sets the owner.
    pub fn with_owner(mut self, owner: Owner) -> Self {
        self.owner = owner;
        self
    }

    /// Attaches a completion continuation.
    pub fn with_completion<F>(mut self, f: F) -> Self
    where
        F: Fn(&Request) + Send + Sync + 'static,
    {
        self.completion = Some(CompletionHandle::new(f));
        self
    }

    /// Returns true if a continuation is attached.
    pub fn has_completion(&self) -> bool {
        self.completion.is_some()
    }

    /// Marks the request complete and runs its continuation.
    ///
    /// The continuation is taken out of the request, so a second call is a no-op.
    pub fn complete(&mut self, cycle: Cycle) {
        self.status = RequestStatus::Complete;
        self.completion_cycle = cycle;
        if let Some(handle) = self.completion.take() {
            handle.call(self);
        }
    }

    /// Latency from issue to completion.
    pub fn latency(&self) -> Cycle {
        self.completion_cycle.saturating_sub(self.issue_cycle)
    }

    /// Latency from arrival to issue.
    pub fn queue_latency(&self) -> Cycle {
        self.issue_cycle.saturating_sub(self.arrival_cycle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_op_classes() {
        assert!(OpType::ReadPrecharge.is_read());
        assert!(OpType::WritePrecharge.is_write());
        assert!(OpType::Write.is_column());
        assert!(!OpType::Activate.is_column());
        assert!(OpType::PowerdownPdps.is_powerdown());
        assert_eq!(OpType::Read.with_precharge(), OpType::ReadPrecharge);
        assert_eq!(OpType::WritePrecharge.without_precharge(), OpType::Write);
        assert_eq!(OpType::Activate.with_precharge(), OpType::Activate);
        assert_eq!(OpType::PrechargeAll.to_string(), "PRECHARGE_ALL");
    }

    #[test]
    fn test_command_inherits_location() {
        let addr = Address::new(0, 1, 2, 3, 4);
        let txn = Request::read(9, addr).with_burst_count(4);
        let act = Request::command(OpType::Activate, &txn);

        assert_eq!(act.id, 9);
        assert_eq!(act.address, addr);
        assert_eq!(act.burst_count, 4);
        assert_eq!(act.owner, Owner::Controller);
        assert!(!act.has_completion());
    }

    #[test]
    fn test_completion_runs_once() {
        let calls = Arc::new(AtomicU64::new(0));
        let seen = calls.clone();
        let mut req = Request::read(1, Address::default())
            .with_completion(move |r| {
                assert_eq!(r.status, RequestStatus::Complete);
                seen.fetch_add(r.completion_cycle, Ordering::SeqCst);
            });

        req.issue_cycle = 10;
        req.complete(42);
        req.complete(50);

        assert_eq!(calls.load(Ordering::SeqCst), 42);
        assert_eq!(req.latency(), 40);
    }

    #[test]
    fn test_clone_shares_continuation() {
        let calls = Arc::new(AtomicU64::new(0));
        let seen = calls.clone();
        let req = Request::write(2, Address::default()).with_completion(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let mut copy = req.clone();
        copy.complete(5);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(req.has_completion());
        assert!(!copy.has_completion());
    }
}
