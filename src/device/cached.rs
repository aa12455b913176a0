//! Bank variants and the cached row buffer bank.
//!
//! `BankModel` is the closed set of bank implementations a rank can hold.
//! `CachedBank` wraps a plain `Bank` with a few row-region buffers: every
//! ACTIVATE copies a window of the row into a buffer, and a buffer that is
//! evicted while dirty has to be written back first.

use std::collections::VecDeque;

use super::{Bank, BankState, Device, FailReason, IssueContext, SavedState};
use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointSet};
use crate::config::{BankParams, TimingParams};
use crate::request::{OpType, Request};
use crate::types::{ComponentId, Cycle};

/// Cached row buffer statistics.
#[derive(Clone, Debug, Default)]
pub struct CachedBankStats {
    /// Buffers filled by an ACTIVATE
    pub allocations: u64,
    /// Buffers evicted to make room
    pub evictions: u64,
    /// Dirty columns written back on eviction
    pub writebacks: u64,
    pub read_hits: u64,
    pub write_hits: u64,
}

#[derive(Clone, Debug)]
struct RowBuffer {
    row: u64,
    col_start: u64,
    dirty: Vec<bool>,
    reads: u64,
    writes: u64,
}

impl RowBuffer {
    fn holds(&self, row: u64, col: u64) -> bool {
        self.row == row && col >= self.col_start && col < self.col_start + self.dirty.len() as u64
    }
}

/// A bank with cached row-region buffers.
pub struct CachedBank {
    bank: Bank,
    /// Most recently used first
    buffers: VecDeque<RowBuffer>,
    capacity: usize,
    row_size: u64,
    read_only: bool,
    stats: CachedBankStats,
}

impl CachedBank {
    /// Wraps `bank` with the buffers described by `params`.
    pub fn new(bank: Bank, params: &BankParams) -> Self {
        Self {
            bank,
            buffers: VecDeque::new(),
            capacity: params.cached_row_count.max(1),
            row_size: params.cached_row_size.max(1),
            read_only: params.cached_rows_read_only,
            stats: CachedBankStats::default(),
        }
    }

    pub fn inner(&self) -> &Bank {
        &self.bank
    }

    pub fn stats(&self) -> &CachedBankStats {
        &self.stats
    }

    /// Number of buffers in use.
    pub fn buffers_in_use(&self) -> usize {
        self.buffers.len()
    }

    fn find(&self, row: u64, col: u64) -> Option<usize> {
        self.buffers.iter().position(|b| b.holds(row, col))
    }

    fn touch(&mut self, index: usize) {
        if let Some(buffer) = self.buffers.remove(index) {
            self.buffers.push_front(buffer);
        }
    }

    /// Allocates a buffer for the activated row and returns the dirty
    /// columns that had to be written back.
    fn allocate(&mut self, request: &Request) -> u64 {
        let row = request.address.row;
        let col_start = request.address.col - request.address.col % self.row_size;

        if let Some(index) = self
            .buffers
            .iter()
            .position(|b| b.row == row && b.col_start == col_start)
        {
            self.touch(index);
            return 0;
        }

        let mut dirty = 0;
        if self.buffers.len() >= self.capacity {
            if let Some(evicted) = self.buffers.pop_back() {
                dirty = evicted.dirty.iter().filter(|&&d| d).count() as u64;
                tracing::trace!(
                    "{}: evicting row {} after {} reads and {} writes",
                    self.bank.id(),
                    evicted.row,
                    evicted.reads,
                    evicted.writes
                );
                self.stats.evictions += 1;
                self.stats.writebacks += dirty;
            }
        }

        self.buffers.push_front(RowBuffer {
            row,
            col_start,
            dirty: vec![false; self.row_size as usize],
            reads: 0,
            writes: 0,
        });
        self.stats.allocations += 1;
        dirty
    }

    /// Pushes the bank's column counters out to cover the buffer fill.
    fn charge_fill(&mut self, now: Cycle, dirty: u64, p: &TimingParams) {
        let mut timer = 0;
        if dirty > 0 {
            timer += p.t_rcd.saturating_sub(p.t_al);
            timer += p.t_burst.max(p.t_ccd) * (dirty - 1);
            timer += p.t_al + p.t_cwd + p.t_burst + p.t_wr + p.t_rp;
        }
        timer += p.t_rcd;
        let region = self.row_size * p.t_ccd;
        timer += region;

        let column_ready = (now + timer).saturating_sub(p.t_al + region);
        self.bank.delay_commands(
            column_ready + p.t_ccd,
            column_ready,
            now + timer.max(p.t_ras),
        );
    }
}

impl Device for CachedBank {
    fn id(&self) -> ComponentId {
        self.bank.id()
    }

    fn is_issuable(&mut self, request: &Request, now: Cycle) -> Result<(), FailReason> {
        self.bank.is_issuable(request, now)
    }

    fn issue_command(&mut self, request: &Request, ctx: &mut IssueContext<'_>) -> Result<SavedState, FailReason> {
        let now = ctx.now();
        let saved = self.bank.issue_command(request, ctx)?;

        match request.op {
            OpType::Activate => {
                let dirty = self.allocate(request);
                let params = self.bank.params();
                self.charge_fill(now, dirty, &params);
            }
            OpType::Read | OpType::ReadPrecharge => {
                if let Some(index) = self.find(request.address.row, request.address.col) {
                    self.buffers[index].reads += 1;
                    self.stats.read_hits += 1;
                    self.touch(index);
                }
            }
            OpType::Write | OpType::WritePrecharge => {
                if let Some(index) = self.find(request.address.row, request.address.col) {
                    let buffer = &mut self.buffers[index];
                    buffer.writes += 1;
                    if !self.read_only {
                        let offset = (request.address.col - buffer.col_start) as usize;
                        buffer.dirty[offset] = true;
                    }
                    self.stats.write_hits += 1;
                    self.touch(index);
                }
            }
            _ => {}
        }

        Ok(saved)
    }

    fn request_complete(&mut self, request: &mut Request, ctx: &mut IssueContext<'_>) -> bool {
        self.bank.request_complete(request, ctx)
    }

    fn cycle(&mut self, steps: Cycle) {
        self.bank.cycle(steps);
    }

    fn export_stats(&self) -> serde_json::Value {
        let mut stats = self.bank.export_stats();
        let s = &self.stats;
        stats["cached_rows"] = serde_json::json!({
            "allocations": s.allocations,
            "evictions": s.evictions,
            "writebacks": s.writebacks,
            "read_hits": s.read_hits,
            "write_hits": s.write_hits,
        });
        stats
    }
}

/// The bank implementations a rank can hold.
pub enum BankModel {
    Standard(Bank),
    Cached(CachedBank),
}

impl BankModel {
    /// The underlying bank.
    pub fn bank(&self) -> &Bank {
        match self {
            BankModel::Standard(bank) => bank,
            BankModel::Cached(cached) => cached.inner(),
        }
    }

    fn bank_mut(&mut self) -> &mut Bank {
        match self {
            BankModel::Standard(bank) => bank,
            BankModel::Cached(cached) => &mut cached.bank,
        }
    }

    pub fn state(&self) -> BankState {
        self.bank().state()
    }

    pub fn is_idle(&self) -> bool {
        self.bank().is_idle()
    }

    pub(crate) fn validate(&mut self, request: &Request, now: Cycle, record: bool) -> Result<(), FailReason> {
        self.bank_mut().validate(request, now, record)
    }

    pub(crate) fn begin_refresh(&mut self, now: Cycle) {
        self.bank_mut().begin_refresh(now);
    }

    pub(crate) fn end_refresh(&mut self) {
        self.bank_mut().end_refresh();
    }

    pub fn interrupt_write(&mut self, saved: &SavedState, ctx: &mut IssueContext<'_>) -> Option<Cycle> {
        self.bank_mut().interrupt_write(saved, ctx)
    }

    pub(crate) fn complete_at(&mut self, recipient: ComponentId, request: &mut Request, ctx: &mut IssueContext<'_>) -> bool {
        self.bank_mut().complete_at(recipient, request, ctx)
    }

    fn as_device(&mut self) -> &mut dyn Device {
        match self {
            BankModel::Standard(bank) => bank,
            BankModel::Cached(cached) => cached,
        }
    }
}

impl Device for BankModel {
    fn id(&self) -> ComponentId {
        self.bank().id()
    }

    fn is_issuable(&mut self, request: &Request, now: Cycle) -> Result<(), FailReason> {
        self.as_device().is_issuable(request, now)
    }

    fn issue_command(&mut self, request: &Request, ctx: &mut IssueContext<'_>) -> Result<SavedState, FailReason> {
        self.as_device().issue_command(request, ctx)
    }

    fn request_complete(&mut self, request: &mut Request, ctx: &mut IssueContext<'_>) -> bool {
        self.as_device().request_complete(request, ctx)
    }

    fn cycle(&mut self, steps: Cycle) {
        self.as_device().cycle(steps);
    }

    fn calculate_stats(&mut self) {
        self.as_device().calculate_stats();
    }

    fn export_stats(&self) -> serde_json::Value {
        match self {
            BankModel::Standard(bank) => bank.export_stats(),
            BankModel::Cached(cached) => cached.export_stats(),
        }
    }
}

impl Checkpoint for BankModel {
    fn create_checkpoint(&self, set: &mut CheckpointSet) {
        self.bank().create_checkpoint(set);
    }

    fn restore_checkpoint(&mut self, set: &CheckpointSet) -> Result<(), CheckpointError> {
        self.bank_mut().restore_checkpoint(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::config::PrechargeCounting;
    use crate::endurance::NullModel;
    use crate::event::{EventQueue, NullHandler};
    use crate::hooks::HookRegistry;
    use crate::request::Owner;
    use std::sync::Arc;

    fn cached(read_only: bool, count: usize) -> CachedBank {
        let bank = Bank::new(
            0,
            0,
            0,
            1,
            Arc::new(TimingParams::default()),
            Arc::new(NullModel),
            PrechargeCounting::Once,
        );
        let params = BankParams {
            bank_type: crate::config::BankType::Cached,
            cached_row_count: count,
            cached_row_size: 8,
            cached_rows_read_only: read_only,
        };
        CachedBank::new(bank, &params)
    }

    fn request(op: OpType, row: u64, col: u64) -> Request {
        Request::new(1, op, Address::new(0, 0, 0, row, col)).with_owner(Owner::Controller)
    }

    fn issue(bank: &mut CachedBank, queue: &mut EventQueue, req: &Request) -> Result<SavedState, FailReason> {
        let hooks = HookRegistry::new();
        let mut ctx = IssueContext::new(queue, &hooks);
        bank.issue_command(req, &mut ctx)
    }

    #[test]
    fn test_activate_allocates_and_delays_reads() {
        let mut b = cached(true, 2);
        let mut queue = EventQueue::new();
        issue(&mut b, &mut queue, &request(OpType::Activate, 3, 10)).unwrap();

        assert_eq!(b.buffers_in_use(), 1);
        assert_eq!(b.stats().allocations, 1);
        // tRCD + row region fill, minus the region, plus one tCCD.
        assert_eq!(b.inner().timing().next_read, 10 + 4);
        assert_eq!(b.inner().timing().next_write, 10);
    }

    #[test]
    fn test_hits_and_dirty_eviction() {
        let mut b = cached(false, 1);
        let mut queue = EventQueue::new();
        issue(&mut b, &mut queue, &request(OpType::Activate, 3, 10)).unwrap();
        queue.loop_steps(20, &mut NullHandler);

        issue(&mut b, &mut queue, &request(OpType::Write, 3, 10)).unwrap();
        queue.loop_steps(20, &mut NullHandler);
        issue(&mut b, &mut queue, &request(OpType::Read, 3, 11)).unwrap();
        assert_eq!(b.stats().write_hits, 1);
        assert_eq!(b.stats().read_hits, 1);

        queue.loop_steps(30, &mut NullHandler);
        issue(&mut b, &mut queue, &request(OpType::Precharge, 3, 0)).unwrap();
        queue.loop_steps(20, &mut NullHandler);
        issue(&mut b, &mut queue, &request(OpType::Activate, 4, 0)).unwrap();

        assert_eq!(b.stats().evictions, 1);
        assert_eq!(b.stats().writebacks, 1);
        assert_eq!(b.buffers_in_use(), 1);
    }

    #[test]
    fn test_windows_of_same_row_are_separate() {
        let mut b = cached(false, 2);
        let mut queue = EventQueue::new();
        issue(&mut b, &mut queue, &request(OpType::Activate, 3, 2)).unwrap();
        queue.loop_steps(50, &mut NullHandler);
        issue(&mut b, &mut queue, &request(OpType::Precharge, 3, 0)).unwrap();
        queue.loop_steps(20, &mut NullHandler);

        // Columns 8..16 lie outside the first buffer's window.
        issue(&mut b, &mut queue, &request(OpType::Activate, 3, 12)).unwrap();
        assert_eq!(b.stats().allocations, 2);
        assert_eq!(b.buffers_in_use(), 2);

        queue.loop_steps(30, &mut NullHandler);
        issue(&mut b, &mut queue, &request(OpType::Read, 3, 12)).unwrap();
        assert_eq!(b.stats().read_hits, 1);
    }

    #[test]
    fn test_read_only_buffers_stay_clean() {
        let mut b = cached(true, 1);
        let mut queue = EventQueue::new();
        issue(&mut b, &mut queue, &request(OpType::Activate, 3, 0)).unwrap();
        queue.loop_steps(20, &mut NullHandler);
        issue(&mut b, &mut queue, &request(OpType::Write, 3, 1)).unwrap();

        queue.loop_steps(40, &mut NullHandler);
        issue(&mut b, &mut queue, &request(OpType::Precharge, 3, 0)).unwrap();
        queue.loop_steps(20, &mut NullHandler);
        issue(&mut b, &mut queue, &request(OpType::Activate, 9, 0)).unwrap();
        assert_eq!(b.stats().writebacks, 0);
    }

    #[test]
    fn test_bank_model_dispatch() {
        let mut model = BankModel::Cached(cached(true, 2));
        let mut queue = EventQueue::new();
        let hooks = HookRegistry::new();
        let mut ctx = IssueContext::new(&mut queue, &hooks);
        model
            .issue_command(&request(OpType::Activate, 1, 0), &mut ctx)
            .unwrap();

        assert_eq!(model.state(), BankState::Open);
        assert_eq!(model.export_stats()["cached_rows"]["allocations"], 1);
    }
}
