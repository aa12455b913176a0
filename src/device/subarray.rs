//! Subarray timing model.
//!
//! The subarray is the leaf of the device tree. It owns the row buffer and
//! the row-level timing counters, schedules completion responses, and runs
//! the write model for NVM write pulses.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{push_out, refuse, Device, FailReason, IssueContext, SavedState};
use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointSet};
use crate::config::TimingParams;
use crate::endurance::{WriteModel, WriteOutcome};
use crate::request::{OpType, Owner, Request};
use crate::types::{ComponentId, Cycle, EventId};

/// Row buffer state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubArrayState {
    Open,
    #[default]
    Closed,
    Precharging,
    Refreshing,
    /// An NVM write pulse is in flight
    Writing,
}

impl SubArrayState {
    fn code(self) -> u64 {
        match self {
            SubArrayState::Open => 0,
            SubArrayState::Closed => 1,
            SubArrayState::Precharging => 2,
            SubArrayState::Refreshing => 3,
            SubArrayState::Writing => 4,
        }
    }

    fn from_code(code: u64) -> Self {
        match code {
            0 => SubArrayState::Open,
            2 => SubArrayState::Precharging,
            3 => SubArrayState::Refreshing,
            4 => SubArrayState::Writing,
            _ => SubArrayState::Closed,
        }
    }
}

/// Timing counters and FSM state of a subarray.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubArrayTiming {
    pub state: SubArrayState,
    pub open_row: Option<u64>,
    pub next_activate: Cycle,
    pub next_precharge: Cycle,
    pub next_read: Cycle,
    pub next_write: Cycle,
    pub last_activate: Cycle,
}

/// Subarray statistics.
#[derive(Clone, Debug, Default)]
pub struct SubArrayStats {
    pub activates: u64,
    pub reads: u64,
    pub writes: u64,
    pub precharges: u64,
    pub refreshes: u64,
    /// Writes the write model reported as hard failures
    pub write_failures: u64,
    /// ACTIVATE checks that failed on timing
    pub act_waits: u64,
    /// Cycles those ACTIVATEs still had to wait
    pub act_wait_total: u64,
    /// Cycles spent transferring data
    pub data_cycles: u64,
    /// Cycles spent in a write pulse
    pub write_pulse_cycles: u64,
    pub interrupted_writes: u64,
}

/// The leaf of the device tree.
pub struct SubArray {
    id: ComponentId,
    params: Arc<TimingParams>,
    model: Arc<dyn WriteModel>,
    timing: SubArrayTiming,
    write_event: Option<(EventId, Cycle)>,
    stats: SubArrayStats,
}

impl SubArray {
    /// Creates a closed subarray.
    pub fn new(id: ComponentId, params: Arc<TimingParams>, model: Arc<dyn WriteModel>) -> Self {
        Self {
            id,
            params,
            model,
            timing: SubArrayTiming::default(),
            write_event: None,
            stats: SubArrayStats::default(),
        }
    }

    pub fn state(&self) -> SubArrayState {
        self.timing.state
    }

    pub fn timing(&self) -> &SubArrayTiming {
        &self.timing
    }

    pub fn stats(&self) -> &SubArrayStats {
        &self.stats
    }

    /// Row currently held in the row buffer.
    pub fn open_row(&self) -> Option<u64> {
        self.timing.open_row
    }

    /// Closed, or closing.
    pub fn is_idle(&self) -> bool {
        matches!(
            self.timing.state,
            SubArrayState::Closed | SubArrayState::Precharging
        )
    }

    /// Checks `request` against the FSM and counters.
    ///
    /// Wait statistics are only recorded when `record` is set.
    pub(crate) fn validate(&mut self, request: &Request, now: Cycle, record: bool) -> Result<(), FailReason> {
        let t = &self.timing;
        match request.op {
            OpType::Activate => {
                if !self.is_idle() {
                    return Err(FailReason::InvalidState);
                }
                if now < t.next_activate {
                    if record {
                        self.stats.act_waits += 1;
                        self.stats.act_wait_total += t.next_activate - now;
                    }
                    return Err(FailReason::SubArrayTiming);
                }
                Ok(())
            }
            OpType::Read | OpType::ReadPrecharge | OpType::Write | OpType::WritePrecharge => {
                match t.state {
                    SubArrayState::Open => {}
                    SubArrayState::Writing => return Err(FailReason::SubArrayTiming),
                    _ => return Err(FailReason::InvalidState),
                }
                if t.open_row != Some(request.address.row) {
                    return Err(FailReason::InvalidState);
                }
                let next = if request.op.is_read() {
                    t.next_read
                } else {
                    t.next_write
                };
                if now < next {
                    return Err(FailReason::SubArrayTiming);
                }
                Ok(())
            }
            OpType::Precharge | OpType::PrechargeAll => {
                match t.state {
                    SubArrayState::Open | SubArrayState::Closed => {}
                    SubArrayState::Writing => return Err(FailReason::SubArrayTiming),
                    _ => return Err(FailReason::InvalidState),
                }
                if now < t.next_precharge {
                    return Err(FailReason::SubArrayTiming);
                }
                Ok(())
            }
            OpType::Refresh => {
                if !self.is_idle() {
                    return Err(FailReason::InvalidState);
                }
                if now < t.next_activate {
                    return Err(FailReason::SubArrayTiming);
                }
                Ok(())
            }
            OpType::PowerdownPda => {
                if self.is_idle() || t.state == SubArrayState::Open {
                    Ok(())
                } else {
                    Err(FailReason::InvalidState)
                }
            }
            OpType::PowerdownPdpf | OpType::PowerdownPdps => {
                if self.is_idle() {
                    Ok(())
                } else {
                    Err(FailReason::InvalidState)
                }
            }
            OpType::Powerup => Ok(()),
            OpType::Nop | OpType::BusRead | OpType::BusWrite => Err(FailReason::UnsupportedCommand),
        }
    }

    fn activate(&mut self, request: &Request, ctx: &mut IssueContext<'_>) {
        let p = &self.params;
        let now = ctx.now();
        let t = &mut self.timing;

        push_out(&mut t.next_precharge, now + p.t_rcd.max(p.t_ras));
        let column_ready = (now + p.t_rcd).saturating_sub(p.t_al);
        push_out(&mut t.next_read, column_ready);
        push_out(&mut t.next_write, column_ready);

        t.state = SubArrayState::Open;
        t.open_row = Some(request.address.row);
        t.last_activate = now;
        self.stats.activates += 1;

        ctx.queue.insert_response(self.id, request.clone(), now + p.t_rcd);
    }

    fn read(&mut self, request: &Request, ctx: &mut IssueContext<'_>) {
        let p = self.params.clone();
        let now = ctx.now();
        let t = &mut self.timing;

        if request.op == OpType::ReadPrecharge {
            let next_activate = now + p.t_al + p.t_rtp + p.t_rp;
            push_out(&mut t.next_activate, next_activate);
            let next_activate = t.next_activate;
            push_out(&mut t.next_precharge, next_activate);
            push_out(&mut t.next_read, next_activate);
            push_out(&mut t.next_write, next_activate);

            let implicit = Request::follow_up(OpType::ReadPrecharge, request, self.id);
            ctx.queue.insert_response(self.id, implicit, now + p.t_al + p.t_rtp);
        } else {
            push_out(
                &mut t.next_precharge,
                (now + p.t_al + p.t_burst + p.t_rtp).saturating_sub(p.t_ccd),
            );
            push_out(&mut t.next_read, now + p.t_burst.max(p.t_ccd));
            push_out(
                &mut t.next_write,
                (now + p.t_cas + p.t_burst + p.t_rtrs).saturating_sub(p.t_cwd),
            );
        }

        self.stats.reads += 1;
        self.stats.data_cycles += p.t_burst;
        ctx.queue.insert_response(self.id, request.clone(), now + p.t_cas + p.t_burst);
    }

    fn write(&mut self, request: &Request, ctx: &mut IssueContext<'_>) -> (Cycle, Option<(EventId, Cycle)>) {
        let p = self.params.clone();
        let now = ctx.now();
        let mut response = request.clone();

        let pulse = match self.model.write(&request.address, &request.data) {
            WriteOutcome::Latency(cycles) => cycles,
            WriteOutcome::HardFailure => {
                tracing::warn!(
                    "{}: write to row {} failed permanently",
                    self.id,
                    request.address.row
                );
                response.flags.hard_failure = true;
                self.stats.write_failures += 1;
                0
            }
        };
        let wt = pulse.saturating_sub(request.progress);

        let t = &mut self.timing;
        let write_done = now + p.t_al + p.t_cwd + p.t_burst + wt + p.t_wr;
        if request.op == OpType::WritePrecharge {
            push_out(&mut t.next_activate, write_done + p.t_rp);
            let next_activate = t.next_activate;
            push_out(&mut t.next_precharge, next_activate);
            push_out(&mut t.next_read, next_activate);
            push_out(&mut t.next_write, next_activate);
        } else {
            push_out(&mut t.next_precharge, write_done);
            push_out(&mut t.next_read, now + p.t_cwd + p.t_burst + p.t_wtr + wt);
            push_out(&mut t.next_write, now + p.t_burst.max(p.t_ccd) + wt);
        }

        self.stats.writes += 1;
        self.stats.data_cycles += p.t_burst;
        self.stats.write_pulse_cycles += wt;

        let when = now + p.t_cwd + p.t_burst + wt;
        let event = ctx.queue.insert_response(self.id, response, when);

        if request.op == OpType::WritePrecharge {
            let implicit = Request::follow_up(OpType::WritePrecharge, request, self.id);
            ctx.queue.insert_response(self.id, implicit, write_done);
        }

        if wt > 0 {
            t.state = SubArrayState::Writing;
            self.write_event = Some((event, when));
            (wt, Some((event, when)))
        } else {
            (0, None)
        }
    }

    fn precharge(&mut self, request: &Request, ctx: &mut IssueContext<'_>) {
        let p = &self.params;
        let now = ctx.now();
        let t = &mut self.timing;

        push_out(&mut t.next_activate, now + p.t_rp.max(1));
        if t.state == SubArrayState::Open {
            t.state = SubArrayState::Precharging;
            t.open_row = None;
            ctx.queue.insert_response(self.id, request.clone(), now + p.t_rp);
        } else {
            // Already closed; only the timing applies.
            self.stats.precharges += 1;
        }
    }

    /// Starts a refresh without scheduling a completion.
    pub(crate) fn begin_refresh(&mut self, now: Cycle) {
        push_out(&mut self.timing.next_activate, now + self.params.t_rfc);
        self.timing.state = SubArrayState::Refreshing;
        self.timing.open_row = None;
    }

    /// Ends a refresh started with `begin_refresh`.
    pub(crate) fn end_refresh(&mut self) {
        if self.timing.state == SubArrayState::Refreshing {
            self.timing.state = SubArrayState::Closed;
            self.stats.refreshes += 1;
        }
    }

    /// Rolls back the write recorded in `saved`.
    ///
    /// Returns the write-pulse cycles that had already completed, or `None`
    /// if that write is no longer in flight.
    pub fn interrupt_write(&mut self, saved: &SavedState, ctx: &mut IssueContext<'_>) -> Option<Cycle> {
        let event = self.write_event?;
        if saved.completion != Some(event) {
            return None;
        }

        let now = ctx.now();
        ctx.queue.remove_event(event.0, event.1);
        if let Some(timing) = saved.subarray {
            self.timing = timing;
        }
        self.timing.state = SubArrayState::Open;
        self.write_event = None;
        self.stats.interrupted_writes += 1;

        let pulse_start = saved.issue_cycle + self.params.t_cwd + self.params.t_burst;
        let done = now.saturating_sub(pulse_start).min(saved.write_pulse);
        tracing::debug!(
            "{}: write interrupted at cycle {} after {} of {} pulse cycles",
            self.id,
            now,
            done,
            saved.write_pulse
        );
        Some(done)
    }

    fn checkpoint_key(&self) -> String {
        format!("{}.timing", self.id)
    }
}

impl Device for SubArray {
    fn id(&self) -> ComponentId {
        self.id
    }

    fn is_issuable(&mut self, request: &Request, now: Cycle) -> Result<(), FailReason> {
        self.validate(request, now, true)
    }

    fn issue_command(&mut self, request: &Request, ctx: &mut IssueContext<'_>) -> Result<SavedState, FailReason> {
        let now = ctx.now();
        if let Err(reason) = self.validate(request, now, false) {
            return Err(refuse(self.id, request, now, reason));
        }

        ctx.hooks.pre_issue(self.id, request, now);
        let mut saved = SavedState {
            address: request.address,
            subarray: Some(self.timing),
            issue_cycle: now,
            ..SavedState::default()
        };

        match request.op {
            OpType::Activate => self.activate(request, ctx),
            OpType::Read | OpType::ReadPrecharge => self.read(request, ctx),
            OpType::Write | OpType::WritePrecharge => {
                let (pulse, completion) = self.write(request, ctx);
                saved.write_pulse = pulse;
                saved.completion = completion;
            }
            OpType::Precharge | OpType::PrechargeAll => self.precharge(request, ctx),
            OpType::Refresh => {
                self.begin_refresh(now);
                ctx.queue
                    .insert_response(self.id, request.clone(), now + self.params.t_rfc);
            }
            // Power state lives in the bank; the row buffer is unaffected.
            _ => {}
        }

        tracing::debug!("{}: issued {} at cycle {}", self.id, request.op, now);
        ctx.hooks.post_issue(self.id, request, now);
        Ok(saved)
    }

    fn request_complete(&mut self, request: &mut Request, ctx: &mut IssueContext<'_>) -> bool {
        let now = ctx.now();
        ctx.hooks.on_complete(self.id, request, now);

        if request.owner == Owner::Device(self.id) {
            match request.op {
                OpType::ReadPrecharge | OpType::WritePrecharge => {
                    let mut precharge = request.clone();
                    precharge.op = OpType::Precharge;
                    self.timing.state = SubArrayState::Precharging;
                    self.timing.open_row = None;
                    ctx.queue
                        .insert_response(self.id, precharge, now + self.params.t_rp);
                }
                OpType::Precharge => {
                    if self.timing.state == SubArrayState::Precharging {
                        self.timing.state = SubArrayState::Closed;
                    }
                    self.stats.precharges += 1;
                }
                _ => {}
            }
            return false;
        }

        match request.op {
            OpType::Precharge | OpType::PrechargeAll => {
                if self.timing.state == SubArrayState::Precharging {
                    self.timing.state = SubArrayState::Closed;
                }
                self.stats.precharges += 1;
            }
            OpType::Refresh => self.end_refresh(),
            OpType::Write | OpType::WritePrecharge => {
                if self.timing.state == SubArrayState::Writing {
                    self.timing.state = SubArrayState::Open;
                }
                self.write_event = None;
            }
            _ => {}
        }
        true
    }

    fn cycle(&mut self, _steps: Cycle) {}

    fn export_stats(&self) -> serde_json::Value {
        let s = &self.stats;
        serde_json::json!({
            "activates": s.activates,
            "reads": s.reads,
            "writes": s.writes,
            "precharges": s.precharges,
            "refreshes": s.refreshes,
            "write_failures": s.write_failures,
            "act_waits": s.act_waits,
            "act_wait_total": s.act_wait_total,
            "data_cycles": s.data_cycles,
            "write_pulse_cycles": s.write_pulse_cycles,
            "interrupted_writes": s.interrupted_writes,
        })
    }
}

impl Checkpoint for SubArray {
    fn create_checkpoint(&self, set: &mut CheckpointSet) {
        let t = &self.timing;
        set.insert(
            self.checkpoint_key(),
            vec![
                t.state.code(),
                t.open_row.unwrap_or(u64::MAX),
                t.next_activate,
                t.next_precharge,
                t.next_read,
                t.next_write,
                t.last_activate,
            ],
        );
    }

    fn restore_checkpoint(&mut self, set: &CheckpointSet) -> Result<(), CheckpointError> {
        let v = set.get_exact(&self.checkpoint_key(), 7)?;
        self.timing = SubArrayTiming {
            state: SubArrayState::from_code(v[0]),
            open_row: (v[1] != u64::MAX).then_some(v[1]),
            next_activate: v[2],
            next_precharge: v[3],
            next_read: v[4],
            next_write: v[5],
            last_activate: v[6],
        };
        self.write_event = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::endurance::{FixedLatencyModel, NullModel};
    use crate::event::{EventQueue, NullHandler};
    use crate::hooks::HookRegistry;

    const ID: ComponentId = ComponentId::SubArray {
        channel: 0,
        rank: 0,
        bank: 0,
        subarray: 0,
    };

    fn subarray() -> SubArray {
        SubArray::new(ID, Arc::new(TimingParams::default()), Arc::new(NullModel))
    }

    fn request(op: OpType, row: u64) -> Request {
        Request::new(1, op, Address::new(0, 0, 0, row, 0)).with_owner(Owner::Controller)
    }

    fn issue(sa: &mut SubArray, queue: &mut EventQueue, req: &Request) -> Result<SavedState, FailReason> {
        let hooks = HookRegistry::new();
        let mut ctx = IssueContext::new(queue, &hooks);
        sa.issue_command(req, &mut ctx)
    }

    #[test]
    fn test_activate_then_read_timing() {
        let mut sa = subarray();
        let mut queue = EventQueue::new();
        issue(&mut sa, &mut queue, &request(OpType::Activate, 5)).unwrap();

        assert_eq!(sa.state(), SubArrayState::Open);
        assert_eq!(sa.open_row(), Some(5));
        let read = request(OpType::Read, 5);
        assert_eq!(sa.is_issuable(&read, 9), Err(FailReason::SubArrayTiming));
        assert!(sa.is_issuable(&read, 10).is_ok());
        assert_eq!(sa.timing().next_precharge, 24);
    }

    #[test]
    fn test_wrong_row_rejected() {
        let mut sa = subarray();
        let mut queue = EventQueue::new();
        issue(&mut sa, &mut queue, &request(OpType::Activate, 5)).unwrap();

        assert_eq!(
            sa.is_issuable(&request(OpType::Read, 6), 20),
            Err(FailReason::InvalidState)
        );
        assert_eq!(
            sa.is_issuable(&request(OpType::Activate, 6), 20),
            Err(FailReason::InvalidState)
        );
    }

    #[test]
    fn test_rejection_does_not_mutate() {
        let mut sa = subarray();
        let mut queue = EventQueue::new();
        let before = *sa.timing();

        let result = issue(&mut sa, &mut queue, &request(OpType::Read, 1));
        assert_eq!(result, Err(FailReason::InvalidState));
        assert_eq!(*sa.timing(), before);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_activate_wait_stats() {
        let mut sa = subarray();
        let mut queue = EventQueue::new();
        issue(&mut sa, &mut queue, &request(OpType::Activate, 1)).unwrap();
        queue.loop_steps(24, &mut NullHandler);
        issue(&mut sa, &mut queue, &request(OpType::Precharge, 1)).unwrap();

        assert_eq!(
            sa.is_issuable(&request(OpType::Activate, 2), 30),
            Err(FailReason::SubArrayTiming)
        );
        assert_eq!(sa.stats().act_waits, 1);
        assert_eq!(sa.stats().act_wait_total, 4);
    }

    #[test]
    fn test_write_pulse_blocks_reads() {
        let mut sa = SubArray::new(
            ID,
            Arc::new(TimingParams::default()),
            Arc::new(FixedLatencyModel::new(50)),
        );
        let mut queue = EventQueue::new();
        issue(&mut sa, &mut queue, &request(OpType::Activate, 3)).unwrap();
        queue.loop_steps(10, &mut NullHandler);

        let saved = issue(&mut sa, &mut queue, &request(OpType::Write, 3)).unwrap();
        assert_eq!(sa.state(), SubArrayState::Writing);
        assert_eq!(saved.write_pulse, 50);
        // tCWD + tBURST + pulse
        assert_eq!(saved.completion_cycle(), Some(10 + 7 + 4 + 50));
        assert_eq!(
            sa.is_issuable(&request(OpType::Read, 3), 40),
            Err(FailReason::SubArrayTiming)
        );
    }

    #[test]
    fn test_interrupt_restores_counters() {
        let mut sa = SubArray::new(
            ID,
            Arc::new(TimingParams::default()),
            Arc::new(FixedLatencyModel::new(50)),
        );
        let mut queue = EventQueue::new();
        let hooks = HookRegistry::new();
        issue(&mut sa, &mut queue, &request(OpType::Activate, 3)).unwrap();
        queue.loop_steps(10, &mut NullHandler);
        let before = *sa.timing();

        let saved = issue(&mut sa, &mut queue, &request(OpType::Write, 3)).unwrap();
        assert_eq!(queue.pending(), 1);
        queue.loop_steps(20, &mut NullHandler);

        let mut ctx = IssueContext::new(&mut queue, &hooks);
        let done = sa.interrupt_write(&saved, &mut ctx);
        // Pulse starts at 10 + tCWD + tBURST = 21.
        assert_eq!(done, Some(9));
        assert_eq!(*sa.timing(), before);
        assert!(queue.is_empty());
        assert_eq!(sa.stats().interrupted_writes, 1);

        let mut ctx = IssueContext::new(&mut queue, &hooks);
        assert_eq!(sa.interrupt_write(&saved, &mut ctx), None);
    }

    #[test]
    fn test_unsupported_command() {
        let mut sa = subarray();
        assert_eq!(
            sa.is_issuable(&request(OpType::BusRead, 0), 0),
            Err(FailReason::UnsupportedCommand)
        );
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let mut sa = subarray();
        let mut queue = EventQueue::new();
        issue(&mut sa, &mut queue, &request(OpType::Activate, 9)).unwrap();

        let mut set = CheckpointSet::new();
        sa.create_checkpoint(&mut set);

        let mut restored = subarray();
        restored.restore_checkpoint(&set).unwrap();
        assert_eq!(restored.timing(), sa.timing());
    }
}
