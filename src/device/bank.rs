//! DDR3-style bank.
//!
//! A bank tracks which of its subarrays hold an open row (most recently
//! activated first), enforces bank-level column and power timing, and
//! owns the power-down and refresh states.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

use super::{push_out, refuse, Device, FailReason, IssueContext, SavedState, SubArray};
use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointSet};
use crate::config::{PrechargeCounting, TimingParams};
use crate::endurance::WriteModel;
use crate::request::{OpType, Request};
use crate::types::{ComponentId, Cycle};

/// Bank FSM state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BankState {
    Open,
    #[default]
    Closed,
    /// Active power-down (a row is open)
    PowerDownActive,
    /// Precharge power-down, fast exit
    PowerDownFast,
    /// Precharge power-down, slow exit
    PowerDownSlow,
    Refreshing,
}

impl BankState {
    /// Any of the power-down states.
    pub fn is_powered_down(self) -> bool {
        matches!(
            self,
            BankState::PowerDownActive | BankState::PowerDownFast | BankState::PowerDownSlow
        )
    }

    pub(crate) fn code(self) -> u64 {
        match self {
            BankState::Open => 0,
            BankState::Closed => 1,
            BankState::PowerDownActive => 2,
            BankState::PowerDownFast => 3,
            BankState::PowerDownSlow => 4,
            BankState::Refreshing => 5,
        }
    }

    pub(crate) fn from_code(code: u64) -> Self {
        match code {
            0 => BankState::Open,
            2 => BankState::PowerDownActive,
            3 => BankState::PowerDownFast,
            4 => BankState::PowerDownSlow,
            5 => BankState::Refreshing,
            _ => BankState::Closed,
        }
    }
}

/// Timing counters and FSM state of a bank.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BankTiming {
    pub state: BankState,
    pub next_activate: Cycle,
    pub next_precharge: Cycle,
    pub next_read: Cycle,
    pub next_write: Cycle,
    pub next_power_down: Cycle,
    pub next_power_up: Cycle,
    /// Commands issued so far
    pub issued: u64,
}

/// Bank statistics.
#[derive(Clone, Debug, Default)]
pub struct BankStats {
    pub activates: u64,
    pub reads: u64,
    pub writes: u64,
    pub precharges: u64,
    pub refreshes: u64,
    pub power_downs: u64,
    pub power_ups: u64,
    /// ACTIVATE checks that failed on bank timing
    pub act_waits: u64,
    pub act_wait_total: u64,
    /// Cycles with at least one open row
    pub active_cycles: u64,
    /// Cycles closed and powered up
    pub standby_cycles: u64,
    pub fast_exit_cycles: u64,
    pub slow_exit_cycles: u64,
    pub active_power_down_cycles: u64,
    pub refresh_cycles: u64,
}

/// A bank made of one or more subarrays.
pub struct Bank {
    id: ComponentId,
    params: Arc<TimingParams>,
    counting: PrechargeCounting,
    subarrays: Vec<SubArray>,
    /// Subarrays with an open row, most recently activated first
    active: VecDeque<u64>,
    timing: BankTiming,
    stats: BankStats,
}

impl Bank {
    /// Creates a closed bank.
    ///
    /// # Arguments
    /// * `channel` - Channel index
    /// * `rank` - Rank index
    /// * `bank` - Bank index within the rank
    /// * `subarrays` - Number of subarrays
    /// * `params` - Timing parameters shared by the channel
    /// * `model` - Write model shared by the channel
    /// * `counting` - How PRECHARGE_ALL is counted
    pub fn new(
        channel: u64,
        rank: u64,
        bank: u64,
        subarrays: u64,
        params: Arc<TimingParams>,
        model: Arc<dyn WriteModel>,
        counting: PrechargeCounting,
    ) -> Self {
        let subarrays = (0..subarrays.max(1))
            .map(|subarray| {
                SubArray::new(
                    ComponentId::SubArray {
                        channel,
                        rank,
                        bank,
                        subarray,
                    },
                    params.clone(),
                    model.clone(),
                )
            })
            .collect();

        Self {
            id: ComponentId::Bank { channel, rank, bank },
            params,
            counting,
            subarrays,
            active: VecDeque::new(),
            timing: BankTiming::default(),
            stats: BankStats::default(),
        }
    }

    pub fn state(&self) -> BankState {
        self.timing.state
    }

    pub fn timing(&self) -> &BankTiming {
        &self.timing
    }

    pub fn stats(&self) -> &BankStats {
        &self.stats
    }

    pub fn subarray(&self, index: u64) -> Option<&SubArray> {
        self.subarrays.get(index as usize)
    }

    pub(crate) fn params(&self) -> Arc<TimingParams> {
        self.params.clone()
    }

    pub fn subarray_count(&self) -> usize {
        self.subarrays.len()
    }

    /// Subarrays with an open row, most recently activated first.
    pub fn active_subarrays(&self) -> impl Iterator<Item = u64> + '_ {
        self.active.iter().copied()
    }

    /// No row open and no refresh in progress.
    pub fn is_idle(&self) -> bool {
        self.active.is_empty()
            && self.timing.state != BankState::Refreshing
            && self.subarrays.iter().all(SubArray::is_idle)
    }

    fn step(&self) -> Cycle {
        self.params.t_burst.max(self.params.t_ccd)
    }

    fn child_index(&self, request: &Request) -> Result<usize, FailReason> {
        let index = request.address.subarray as usize;
        if index < self.subarrays.len() {
            Ok(index)
        } else {
            Err(FailReason::NoSuchDevice)
        }
    }

    /// Delays column commands and precharge, used by the cached row buffers.
    pub(crate) fn delay_commands(&mut self, read: Cycle, write: Cycle, precharge: Cycle) {
        push_out(&mut self.timing.next_read, read);
        push_out(&mut self.timing.next_write, write);
        push_out(&mut self.timing.next_precharge, precharge);
        push_out(&mut self.timing.next_power_down, precharge);
    }

    /// Checks `request` against this bank and the subarrays it involves.
    pub(crate) fn validate(&mut self, request: &Request, now: Cycle, record: bool) -> Result<(), FailReason> {
        let t = self.timing;
        match request.op {
            OpType::Activate => {
                if t.state.is_powered_down() || t.state == BankState::Refreshing {
                    return Err(FailReason::InvalidState);
                }
                if now < t.next_activate {
                    if record {
                        self.stats.act_waits += 1;
                        self.stats.act_wait_total += t.next_activate - now;
                    }
                    return Err(FailReason::BankTiming);
                }
                let index = self.child_index(request)?;
                self.subarrays[index].validate(request, now, record)
            }
            OpType::Read | OpType::ReadPrecharge | OpType::Write | OpType::WritePrecharge => {
                if t.state != BankState::Open {
                    return Err(FailReason::InvalidState);
                }
                let next = if request.op.is_read() {
                    t.next_read
                } else {
                    t.next_write
                };
                if now < next {
                    return Err(FailReason::BankTiming);
                }
                let index = self.child_index(request)?;
                self.subarrays[index].validate(request, now, record)
            }
            OpType::Precharge => {
                if !matches!(t.state, BankState::Open | BankState::Closed) {
                    return Err(FailReason::InvalidState);
                }
                if now < t.next_precharge {
                    return Err(FailReason::BankTiming);
                }
                let index = self.child_index(request)?;
                self.subarrays[index].validate(request, now, record)
            }
            OpType::PrechargeAll => {
                if !matches!(t.state, BankState::Open | BankState::Closed) {
                    return Err(FailReason::InvalidState);
                }
                if now < t.next_precharge {
                    return Err(FailReason::BankTiming);
                }
                for &index in &self.active {
                    self.subarrays[index as usize].validate(request, now, record)?;
                }
                Ok(())
            }
            OpType::PowerdownPda | OpType::PowerdownPdpf | OpType::PowerdownPdps => {
                let legal = match request.op {
                    OpType::PowerdownPda => matches!(t.state, BankState::Open | BankState::Closed),
                    _ => t.state == BankState::Closed,
                };
                if !legal {
                    return Err(FailReason::InvalidState);
                }
                if now < t.next_power_down {
                    return Err(FailReason::BankTiming);
                }
                for subarray in &mut self.subarrays {
                    subarray.validate(request, now, record)?;
                }
                Ok(())
            }
            OpType::Powerup => {
                if !t.state.is_powered_down() {
                    return Err(FailReason::InvalidState);
                }
                if now < t.next_power_up {
                    return Err(FailReason::BankTiming);
                }
                Ok(())
            }
            OpType::Refresh => {
                match t.state {
                    BankState::Open => return Err(FailReason::OpenRefreshWaiting),
                    BankState::Closed if now < t.next_activate => {
                        return Err(FailReason::ClosedRefreshWaiting)
                    }
                    BankState::Closed => {}
                    _ => return Err(FailReason::InvalidState),
                }
                for subarray in &mut self.subarrays {
                    subarray.validate(request, now, record)?;
                }
                Ok(())
            }
            _ => {
                let index = self.child_index(request)?;
                self.subarrays[index].validate(request, now, record)
            }
        }
    }

    fn close_subarray(&mut self, index: u64) {
        self.active.retain(|&a| a != index);
        if self.active.is_empty() && self.timing.state == BankState::Open {
            self.timing.state = BankState::Closed;
        }
    }

    /// Starts a refresh of every subarray without scheduling a completion.
    pub(crate) fn begin_refresh(&mut self, now: Cycle) {
        let done = now + self.params.t_rfc;
        push_out(&mut self.timing.next_activate, done);
        push_out(&mut self.timing.next_power_down, done);
        self.timing.state = BankState::Refreshing;
        for subarray in &mut self.subarrays {
            subarray.begin_refresh(now);
        }
    }

    /// Ends a refresh started with `begin_refresh`.
    pub(crate) fn end_refresh(&mut self) {
        if self.timing.state == BankState::Refreshing {
            self.timing.state = BankState::Closed;
            self.stats.refreshes += 1;
        }
        for subarray in &mut self.subarrays {
            subarray.end_refresh();
        }
    }

    /// Rolls back the write recorded in `saved`.
    ///
    /// Bank counters are restored verbatim only if nothing else was issued to
    /// the bank after the write. Otherwise the current counters are kept, since
    /// they also carry the constraints of the later commands. The subarray is
    /// always rolled back.
    pub fn interrupt_write(&mut self, saved: &SavedState, ctx: &mut IssueContext<'_>) -> Option<Cycle> {
        let index = saved.address.subarray as usize;
        let done = self.subarrays.get_mut(index)?.interrupt_write(saved, ctx)?;
        if let Some(timing) = saved.bank {
            if self.timing.issued == timing.issued + 1 {
                self.timing = timing;
            } else {
                tracing::debug!(
                    "{}: keeping counters on write rollback, {} commands issued since",
                    self.id,
                    self.timing.issued - timing.issued - 1
                );
            }
        }
        Some(done)
    }

    fn issue_inner(&mut self, request: &Request, ctx: &mut IssueContext<'_>) -> Result<SavedState, FailReason> {
        let p = self.params.clone();
        let now = ctx.now();
        let step = self.step();
        let bc = request.burst_count.max(1);

        let saved = match request.op {
            OpType::Activate => {
                let index = request.address.subarray;
                let saved = self.subarrays[index as usize].issue_command(request, ctx)?;
                push_out(&mut self.timing.next_power_down, now + p.t_rcd);
                self.active.retain(|&a| a != index);
                self.active.push_front(index);
                self.timing.state = BankState::Open;
                self.stats.activates += 1;
                saved
            }
            OpType::Read | OpType::ReadPrecharge => {
                let index = request.address.subarray;
                let saved = self.subarrays[index as usize].issue_command(request, ctx)?;
                let t = &mut self.timing;
                push_out(&mut t.next_read, now + step * bc);
                push_out(
                    &mut t.next_write,
                    (now + step * (bc - 1) + p.t_cas + p.t_burst + p.t_rtrs).saturating_sub(p.t_cwd),
                );
                if request.op == OpType::ReadPrecharge {
                    let closed = now + step * (bc - 1) + p.t_al + p.t_rtp + p.t_rp;
                    push_out(&mut t.next_power_down, closed);
                    push_out(&mut t.next_activate, closed);
                    self.close_subarray(index);
                } else {
                    push_out(&mut t.next_power_down, now + step * (bc - 1) + p.t_rdpden);
                }
                self.stats.reads += 1;
                saved
            }
            OpType::Write | OpType::WritePrecharge => {
                let index = request.address.subarray;
                let saved = self.subarrays[index as usize].issue_command(request, ctx)?;
                let t = &mut self.timing;
                push_out(
                    &mut t.next_read,
                    now + step * (bc - 1) + p.t_cwd + p.t_burst + p.t_wtr,
                );
                push_out(&mut t.next_write, now + step * bc);
                if request.op == OpType::WritePrecharge {
                    push_out(&mut t.next_power_down, now + step * (bc - 1) + p.t_wrapden);
                    push_out(
                        &mut t.next_activate,
                        now + p.t_al + p.t_cwd + p.t_burst + p.t_wr + p.t_rp,
                    );
                    self.close_subarray(index);
                } else {
                    push_out(&mut t.next_power_down, now + step * (bc - 1) + p.t_wrpden);
                }
                self.stats.writes += 1;
                saved
            }
            OpType::Precharge => {
                let index = request.address.subarray;
                let saved = self.subarrays[index as usize].issue_command(request, ctx)?;
                push_out(&mut self.timing.next_power_down, now + p.t_rp);
                push_out(&mut self.timing.next_activate, now + p.t_rp.max(1));
                self.close_subarray(index);
                self.stats.precharges += 1;
                saved
            }
            OpType::PrechargeAll => {
                let mut saved = SavedState::default();
                let mut closed = 0;
                // Oldest activation first.
                while let Some(index) = self.active.pop_back() {
                    let mut precharge = request.clone();
                    precharge.address.subarray = index;
                    saved = self.subarrays[index as usize].issue_command(&precharge, ctx)?;
                    closed += 1;
                }
                if self.timing.state == BankState::Open {
                    self.timing.state = BankState::Closed;
                }
                push_out(&mut self.timing.next_power_down, now + p.t_rp);
                push_out(&mut self.timing.next_activate, now + p.t_rp.max(1));
                self.stats.precharges += match self.counting {
                    PrechargeCounting::Once => 1,
                    PrechargeCounting::PerSubArray => closed,
                };
                saved.address = request.address;
                saved
            }
            OpType::Refresh => {
                self.begin_refresh(now);
                ctx.queue.insert_response(self.id, request.clone(), now + p.t_rfc);
                SavedState {
                    address: request.address,
                    issue_cycle: now,
                    ..SavedState::default()
                }
            }
            OpType::PowerdownPda | OpType::PowerdownPdpf | OpType::PowerdownPdps => {
                for subarray in &mut self.subarrays {
                    subarray.issue_command(request, ctx)?;
                }
                push_out(&mut self.timing.next_power_up, now + p.t_pd);
                self.timing.state = match (self.timing.state, request.op) {
                    (BankState::Open, _) => BankState::PowerDownActive,
                    (_, OpType::PowerdownPdps) => BankState::PowerDownSlow,
                    _ => BankState::PowerDownFast,
                };
                self.stats.power_downs += 1;
                SavedState {
                    address: request.address,
                    issue_cycle: now,
                    ..SavedState::default()
                }
            }
            OpType::Powerup => {
                let t = &mut self.timing;
                let exit = now + p.t_xp;
                push_out(&mut t.next_power_down, exit);
                push_out(&mut t.next_activate, exit);
                push_out(&mut t.next_precharge, exit);
                push_out(&mut t.next_write, exit);
                let read_exit = if t.state == BankState::PowerDownSlow {
                    now + p.t_xpdll
                } else {
                    exit
                };
                push_out(&mut t.next_read, read_exit);
                t.state = if t.state == BankState::PowerDownActive {
                    BankState::Open
                } else {
                    BankState::Closed
                };
                self.stats.power_ups += 1;
                SavedState {
                    address: request.address,
                    issue_cycle: now,
                    ..SavedState::default()
                }
            }
            _ => {
                let index = request.address.subarray;
                self.subarrays[index as usize].issue_command(request, ctx)?
            }
        };

        Ok(saved)
    }
}

impl Device for Bank {
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
        let before = self.timing;
        let mut saved = self.issue_inner(request, ctx)?;
        self.timing.issued += 1;
        saved.bank = Some(before);

        tracing::debug!("{}: issued {} at cycle {}", self.id, request.op, now);
        ctx.hooks.post_issue(self.id, request, now);
        Ok(saved)
    }

    fn request_complete(&mut self, request: &mut Request, ctx: &mut IssueContext<'_>) -> bool {
        ctx.hooks.on_complete(self.id, request, ctx.now());
        true
    }

    fn cycle(&mut self, steps: Cycle) {
        let s = &mut self.stats;
        match self.timing.state {
            BankState::Open => s.active_cycles += steps,
            BankState::Closed => s.standby_cycles += steps,
            BankState::PowerDownActive => s.active_power_down_cycles += steps,
            BankState::PowerDownFast => s.fast_exit_cycles += steps,
            BankState::PowerDownSlow => s.slow_exit_cycles += steps,
            BankState::Refreshing => s.refresh_cycles += steps,
        }
        for subarray in &mut self.subarrays {
            subarray.cycle(steps);
        }
    }

    fn export_stats(&self) -> serde_json::Value {
        let s = &self.stats;
        let mut stats = serde_json::json!({
            "activates": s.activates,
            "reads": s.reads,
            "writes": s.writes,
            "precharges": s.precharges,
            "refreshes": s.refreshes,
            "power_downs": s.power_downs,
            "power_ups": s.power_ups,
            "act_waits": s.act_waits,
            "act_wait_total": s.act_wait_total,
            "active_cycles": s.active_cycles,
            "standby_cycles": s.standby_cycles,
            "fast_exit_cycles": s.fast_exit_cycles,
            "slow_exit_cycles": s.slow_exit_cycles,
            "active_power_down_cycles": s.active_power_down_cycles,
            "refresh_cycles": s.refresh_cycles,
        });
        for (index, subarray) in self.subarrays.iter().enumerate() {
            stats[format!("subarray{}", index)] = subarray.export_stats();
        }
        stats
    }
}

impl Bank {
    /// Routes a completion addressed to `recipient` within this bank.
    pub(crate) fn complete_at(&mut self, recipient: ComponentId, request: &mut Request, ctx: &mut IssueContext<'_>) -> bool {
        match recipient {
            ComponentId::SubArray { subarray, .. } => {
                let Some(child) = self.subarrays.get_mut(subarray as usize) else {
                    tracing::warn!("{}: completion for missing {}", self.id, recipient);
                    return false;
                };
                if !child.request_complete(request, ctx) {
                    return false;
                }
                self.request_complete(request, ctx)
            }
            _ => {
                if request.op == OpType::Refresh {
                    self.end_refresh();
                }
                self.request_complete(request, ctx)
            }
        }
    }
}

impl Checkpoint for Bank {
    fn create_checkpoint(&self, set: &mut CheckpointSet) {
        let t = &self.timing;
        let mut values = vec![
            t.state.code(),
            t.next_activate,
            t.next_precharge,
            t.next_read,
            t.next_write,
            t.next_power_down,
            t.next_power_up,
            t.issued,
        ];
        values.extend(self.active.iter().copied());
        set.insert(format!("{}.timing", self.id), values);

        for subarray in &self.subarrays {
            subarray.create_checkpoint(set);
        }
    }

    fn restore_checkpoint(&mut self, set: &CheckpointSet) -> Result<(), CheckpointError> {
        let key = format!("{}.timing", self.id);
        let v = set.get(&key)?;
        if v.len() < 8 {
            return Err(CheckpointError::Length {
                key,
                expected: 8,
                found: v.len(),
            });
        }

        self.timing = BankTiming {
            state: BankState::from_code(v[0]),
            next_activate: v[1],
            next_precharge: v[2],
            next_read: v[3],
            next_write: v[4],
            next_power_down: v[5],
            next_power_up: v[6],
            issued: v[7],
        };
        self.active = v[8..].iter().copied().collect();

        for subarray in &mut self.subarrays {
            subarray.restore_checkpoint(set)?;
        }
        Ok(())
    }
}
