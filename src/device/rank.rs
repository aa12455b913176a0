//! Standard rank.
//!
//! The rank enforces the rank-wide constraints: activation spacing (tRRD),
//! the rolling activation window (tFAW), column command spacing, and bus
//! turnaround between ranks. It fans power and refresh commands out to its
//! banks.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{push_out, refuse, Bank, BankModel, CachedBank, Device, FailReason, IssueContext, SavedState};
use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointSet};
use crate::config::{BankParams, BankType, Geometry, PrechargeCounting, TimingParams};
use crate::endurance::WriteModel;
use crate::request::{OpType, Owner, Request};
use crate::types::{ComponentId, Cycle};

/// Rank FSM state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RankState {
    Open,
    #[default]
    Closed,
    Refreshing,
    PowerDownActive,
    PowerDownFast,
    PowerDownSlow,
}

impl RankState {
    pub fn is_powered_down(self) -> bool {
        matches!(
            self,
            RankState::PowerDownActive | RankState::PowerDownFast | RankState::PowerDownSlow
        )
    }

    fn code(self) -> u64 {
        match self {
            RankState::Open => 0,
            RankState::Closed => 1,
            RankState::Refreshing => 2,
            RankState::PowerDownActive => 3,
            RankState::PowerDownFast => 4,
            RankState::PowerDownSlow => 5,
        }
    }

    fn from_code(code: u64) -> Self {
        match code {
            0 => RankState::Open,
            2 => RankState::Refreshing,
            3 => RankState::PowerDownActive,
            4 => RankState::PowerDownFast,
            5 => RankState::PowerDownSlow,
            _ => RankState::Closed,
        }
    }
}

/// Timing counters and FSM state of a rank.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RankTiming {
    pub state: RankState,
    pub next_activate: Cycle,
    pub next_precharge: Cycle,
    pub next_read: Cycle,
    pub next_write: Cycle,
    /// Commands issued so far
    pub issued: u64,
}

/// Rank statistics.
#[derive(Clone, Debug, Default)]
pub struct RankStats {
    pub activates: u64,
    pub reads: u64,
    pub writes: u64,
    pub precharges: u64,
    pub refreshes: u64,
    pub power_downs: u64,
    pub power_ups: u64,
    /// ACTIVATEs delayed by tRRD
    pub rrd_waits: u64,
    /// ACTIVATEs delayed by the activation window
    pub faw_waits: u64,
    /// Bus turnaround updates caused by sibling ranks
    pub notifies: u64,
}

/// A rank of banks.
pub struct Rank {
    id: ComponentId,
    params: Arc<TimingParams>,
    banks: Vec<BankModel>,
    banks_per_refresh: u64,
    /// Most recent activations, `None` for unused slots
    activations: Vec<Option<Cycle>>,
    activation_index: usize,
    /// First bank of the group being refreshed
    refresh_head: Option<u64>,
    timing: RankTiming,
    stats: RankStats,
}

impl Rank {
    /// Creates a closed rank with the banks described by `geometry`.
    ///
    /// # Arguments
    /// * `channel` - Channel index
    /// * `rank` - Rank index
    /// * `geometry` - Memory organization
    /// * `bank_params` - Bank model selection
    /// * `params` - Timing parameters shared by the channel
    /// * `model` - Write model shared by the channel
    /// * `counting` - How PRECHARGE_ALL is counted
    pub fn new(
        channel: u64,
        rank: u64,
        geometry: &Geometry,
        bank_params: &BankParams,
        params: Arc<TimingParams>,
        model: Arc<dyn WriteModel>,
        counting: PrechargeCounting,
    ) -> Self {
        let banks = (0..geometry.banks)
            .map(|bank| {
                let inner = Bank::new(
                    channel,
                    rank,
                    bank,
                    geometry.subarrays,
                    params.clone(),
                    model.clone(),
                    counting,
                );
                match bank_params.bank_type {
                    BankType::Standard => BankModel::Standard(inner),
                    BankType::Cached => BankModel::Cached(CachedBank::new(inner, bank_params)),
                }
            })
            .collect();

        let timing = RankTiming {
            next_activate: params.t_cmd,
            next_precharge: params.t_cmd,
            next_read: params.t_cmd,
            next_write: params.t_cmd,
            ..RankTiming::default()
        };

        Self {
            id: ComponentId::Rank { channel, rank },
            params,
            banks,
            banks_per_refresh: geometry.banks_per_refresh.max(1),
            activations: vec![None; geometry.raw.max(1)],
            activation_index: 0,
            refresh_head: None,
            timing,
            stats: RankStats::default(),
        }
    }

    pub fn state(&self) -> RankState {
        self.timing.state
    }

    pub fn timing(&self) -> &RankTiming {
        &self.timing
    }

    pub fn stats(&self) -> &RankStats {
        &self.stats
    }

    pub fn bank(&self, index: u64) -> Option<&BankModel> {
        self.banks.get(index as usize)
    }

    pub fn bank_count(&self) -> usize {
        self.banks.len()
    }

    /// Every bank is idle.
    pub fn is_idle(&self) -> bool {
        self.banks.iter().all(BankModel::is_idle)
    }

    fn step(&self) -> Cycle {
        self.params.t_burst.max(self.params.t_ccd)
    }

    fn bank_index(&self, request: &Request) -> Result<usize, FailReason> {
        let index = request.address.bank as usize;
        if index < self.banks.len() {
            Ok(index)
        } else {
            Err(FailReason::NoSuchDevice)
        }
    }

    fn refresh_group(&self, head: u64) -> std::ops::Range<usize> {
        let start = head as usize;
        let end = (start + self.banks_per_refresh as usize).min(self.banks.len());
        start..end
    }

    /// Checks the rolling activation window.
    fn window_open(&self, now: Cycle) -> bool {
        let oldest = self.activations[(self.activation_index + 1) % self.activations.len()];
        oldest.map_or(true, |at| at + self.params.t_faw <= now)
    }

    fn record_activation(&mut self, now: Cycle) {
        self.activation_index = (self.activation_index + 1) % self.activations.len();
        self.activations[self.activation_index] = Some(now);
    }

    fn check_activate(&mut self, now: Cycle, record: bool) -> Result<(), FailReason> {
        if now < self.timing.next_activate {
            if record {
                self.stats.rrd_waits += 1;
            }
            return Err(FailReason::RankTiming);
        }
        if !self.window_open(now) {
            if record {
                self.stats.faw_waits += 1;
            }
            return Err(FailReason::RankTiming);
        }
        Ok(())
    }

    pub(crate) fn validate(&mut self, request: &Request, now: Cycle, record: bool) -> Result<(), FailReason> {
        let t = self.timing;
        match request.op {
            OpType::Activate => {
                if t.state.is_powered_down() {
                    return Err(FailReason::InvalidState);
                }
                self.check_activate(now, record)?;
                let index = self.bank_index(request)?;
                self.banks[index].validate(request, now, record)
            }
            OpType::Read | OpType::ReadPrecharge => {
                if now < t.next_read {
                    return Err(FailReason::RankTiming);
                }
                let index = self.bank_index(request)?;
                self.banks[index].validate(request, now, record)
            }
            OpType::Write | OpType::WritePrecharge => {
                if now < t.next_write {
                    return Err(FailReason::RankTiming);
                }
                let index = self.bank_index(request)?;
                self.banks[index].validate(request, now, record)
            }
            OpType::Precharge | OpType::PrechargeAll => {
                if now < t.next_precharge {
                    return Err(FailReason::RankTiming);
                }
                let index = self.bank_index(request)?;
                self.banks[index].validate(request, now, record)
            }
            OpType::Refresh => {
                if t.state.is_powered_down() {
                    return Err(FailReason::InvalidState);
                }
                self.check_activate(now, record)?;
                let head = self.bank_index(request)?;
                for index in self.refresh_group(head as u64) {
                    self.banks[index].validate(request, now, record)?;
                }
                Ok(())
            }
            OpType::PowerdownPda | OpType::PowerdownPdpf | OpType::PowerdownPdps | OpType::Powerup => {
                for bank in &mut self.banks {
                    bank.validate(request, now, record)?;
                }
                Ok(())
            }
            _ => {
                let index = self.bank_index(request)?;
                self.banks[index].validate(request, now, record)
            }
        }
    }

    /// Applies bus turnaround after a sibling rank used the data bus.
    pub fn notify(&mut self, op: OpType, now: Cycle) {
        let p = &self.params;
        let t = &mut self.timing;
        if op.is_read() {
            push_out(&mut t.next_read, now + p.t_burst + p.t_rtrs);
            push_out(
                &mut t.next_write,
                (now + p.t_cas + p.t_burst + p.t_rtrs).saturating_sub(p.t_cwd),
            );
        } else if op.is_write() {
            push_out(&mut t.next_write, now + p.t_burst + p.t_ost);
            push_out(
                &mut t.next_read,
                (now + p.t_burst + p.t_cwd + p.t_rtrs).saturating_sub(p.t_cas),
            );
        } else {
            return;
        }
        self.stats.notifies += 1;
    }

    /// Rolls back the write recorded in `saved`.
    ///
    /// Rank counters are restored verbatim only if the write was the last
    /// command the rank issued. Otherwise the current counters are kept, since
    /// they also carry the constraints of the later commands.
    pub fn interrupt_write(&mut self, saved: &SavedState, ctx: &mut IssueContext<'_>) -> Option<Cycle> {
        let index = saved.address.bank as usize;
        let done = self.banks.get_mut(index)?.interrupt_write(saved, ctx)?;
        if let Some(timing) = saved.rank {
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
        let index = request.address.bank as usize;

        let saved = match request.op {
            OpType::Activate => {
                let saved = self.banks[index].issue_command(request, ctx)?;
                self.record_activation(now);
                push_out(&mut self.timing.next_activate, now + p.t_rrdr);
                push_out(&mut self.timing.next_precharge, now + p.t_ras);
                self.timing.state = RankState::Open;
                self.stats.activates += 1;
                saved
            }
            OpType::Read | OpType::ReadPrecharge => {
                let saved = self.banks[index].issue_command(request, ctx)?;
                push_out(&mut self.timing.next_read, now + step * bc);
                push_out(
                    &mut self.timing.next_write,
                    (now + step * (bc - 1) + p.t_cas + p.t_burst + p.t_rtrs).saturating_sub(p.t_cwd),
                );
                if request.op == OpType::ReadPrecharge {
                    let recheck = Request::follow_up(OpType::Precharge, request, self.id);
                    ctx.queue
                        .insert_response(self.id, recheck, now + p.t_al + p.t_rtp + p.t_rp);
                }
                self.stats.reads += 1;
                saved
            }
            OpType::Write | OpType::WritePrecharge => {
                let saved = self.banks[index].issue_command(request, ctx)?;
                push_out(
                    &mut self.timing.next_read,
                    now + step * (bc - 1) + p.t_cwd + p.t_burst + p.t_wtr,
                );
                push_out(&mut self.timing.next_write, now + step * bc);
                if request.op == OpType::WritePrecharge {
                    let recheck = Request::follow_up(OpType::Precharge, request, self.id);
                    ctx.queue.insert_response(
                        self.id,
                        recheck,
                        now + p.t_al + p.t_cwd + p.t_burst + p.t_wr + p.t_rp,
                    );
                }
                self.stats.writes += 1;
                saved
            }
            OpType::Precharge | OpType::PrechargeAll => {
                let saved = self.banks[index].issue_command(request, ctx)?;
                push_out(&mut self.timing.next_precharge, now + p.t_ppd);
                if self.is_idle() {
                    self.timing.state = RankState::Closed;
                }
                self.stats.precharges += 1;
                saved
            }
            OpType::Refresh => {
                for bank in self.refresh_group(index as u64) {
                    self.banks[bank].begin_refresh(now);
                }
                self.refresh_head = Some(index as u64);
                self.record_activation(now);
                push_out(&mut self.timing.next_activate, now + p.t_rrdr);
                self.timing.state = RankState::Refreshing;
                ctx.queue.insert_response(self.id, request.clone(), now + p.t_rfc);
                SavedState {
                    address: request.address,
                    issue_cycle: now,
                    ..SavedState::default()
                }
            }
            OpType::PowerdownPda | OpType::PowerdownPdpf | OpType::PowerdownPdps => {
                let any_open = !self.is_idle();
                for bank in &mut self.banks {
                    bank.issue_command(request, ctx)?;
                }
                self.timing.state = match (any_open, request.op) {
                    (true, _) => RankState::PowerDownActive,
                    (false, OpType::PowerdownPdps) => RankState::PowerDownSlow,
                    _ => RankState::PowerDownFast,
                };
                self.stats.power_downs += 1;
                SavedState {
                    address: request.address,
                    issue_cycle: now,
                    ..SavedState::default()
                }
            }
            OpType::Powerup => {
                let exit = if self.timing.state == RankState::PowerDownSlow {
                    now + p.t_xpdll
                } else {
                    now + p.t_xp
                };
                for bank in &mut self.banks {
                    bank.issue_command(request, ctx)?;
                }
                let t = &mut self.timing;
                push_out(&mut t.next_activate, exit);
                push_out(&mut t.next_precharge, exit);
                push_out(&mut t.next_read, exit);
                push_out(&mut t.next_write, exit);
                t.state = if t.state == RankState::PowerDownActive {
                    RankState::Open
                } else {
                    RankState::Closed
                };
                self.stats.power_ups += 1;
                SavedState {
                    address: request.address,
                    issue_cycle: now,
                    ..SavedState::default()
                }
            }
            _ => self.banks[index].issue_command(request, ctx)?,
        };

        Ok(saved)
    }

    /// Routes a completion addressed to `recipient` within this rank.
    pub(crate) fn complete_at(&mut self, recipient: ComponentId, request: &mut Request, ctx: &mut IssueContext<'_>) -> bool {
        match recipient {
            ComponentId::Bank { bank, .. } | ComponentId::SubArray { bank, .. } => {
                let Some(child) = self.banks.get_mut(bank as usize) else {
                    tracing::warn!("{}: completion for missing {}", self.id, recipient);
                    return false;
                };
                if !child.complete_at(recipient, request, ctx) {
                    return false;
                }
                self.request_complete(request, ctx)
            }
            _ => self.request_complete(request, ctx),
        }
    }
}

impl Device for Rank {
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
        saved.rank = Some(before);

        tracing::debug!("{}: issued {} at cycle {}", self.id, request.op, now);
        ctx.hooks.post_issue(self.id, request, now);
        Ok(saved)
    }

    fn request_complete(&mut self, request: &mut Request, ctx: &mut IssueContext<'_>) -> bool {
        ctx.hooks.on_complete(self.id, request, ctx.now());

        if request.owner == Owner::Device(self.id) {
            if self.timing.state == RankState::Open && self.is_idle() {
                self.timing.state = RankState::Closed;
            }
            return false;
        }

        if request.op == OpType::Refresh && self.timing.state == RankState::Refreshing {
            if let Some(head) = self.refresh_head.take() {
                for bank in self.refresh_group(head) {
                    self.banks[bank].end_refresh();
                }
            }
            self.timing.state = if self.is_idle() {
                RankState::Closed
            } else {
                RankState::Open
            };
            self.stats.refreshes += 1;
        }
        true
    }

    fn cycle(&mut self, steps: Cycle) {
        for bank in &mut self.banks {
            bank.cycle(steps);
        }
    }

    fn calculate_stats(&mut self) {
        for bank in &mut self.banks {
            bank.calculate_stats();
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
            "rrd_waits": s.rrd_waits,
            "faw_waits": s.faw_waits,
            "notifies": s.notifies,
        });
        for (index, bank) in self.banks.iter().enumerate() {
            stats[format!("bank{}", index)] = bank.export_stats();
        }
        stats
    }
}

impl Checkpoint for Rank {
    fn create_checkpoint(&self, set: &mut CheckpointSet) {
        let t = &self.timing;
        let mut values = vec![
            t.state.code(),
            t.next_activate,
            t.next_precharge,
            t.next_read,
            t.next_write,
            t.issued,
            self.activation_index as u64,
        ];
        values.extend(self.activations.iter().map(|a| a.unwrap_or(u64::MAX)));
        set.insert(format!("{}.timing", self.id), values);

        for bank in &self.banks {
            bank.create_checkpoint(set);
        }
    }

    fn restore_checkpoint(&mut self, set: &CheckpointSet) -> Result<(), CheckpointError> {
        let key = format!("{}.timing", self.id);
        let v = set.get_exact(&key, 7 + self.activations.len())?;
        self.timing = RankTiming {
            state: RankState::from_code(v[0]),
            next_activate: v[1],
            next_precharge: v[2],
            next_read: v[3],
            next_write: v[4],
            issued: v[5],
        };
        self.activation_index = v[6] as usize % self.activations.len();
        for (slot, &value) in self.activations.iter_mut().zip(&v[7..]) {
            *slot = (value != u64::MAX).then_some(value);
        }

        for bank in &mut self.banks {
            bank.restore_checkpoint(set)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::device::BankState;
    use crate::endurance::{FixedLatencyModel, NullModel};
    use crate::event::{EventQueue, NullHandler};
    use crate::hooks::HookRegistry;

    fn rank(banks: u64) -> Rank {
        rank_with(banks, TimingParams::default())
    }

    fn rank_with(banks: u64, params: TimingParams) -> Rank {
        let geometry = Geometry {
            banks,
            banks_per_refresh: banks,
            ..Geometry::default()
        };
        Rank::new(
            0,
            0,
            &geometry,
            &BankParams::default(),
            Arc::new(params),
            Arc::new(NullModel),
            PrechargeCounting::Once,
        )
    }

    fn request(op: OpType, bank: u64, row: u64) -> Request {
        Request::new(1, op, Address::new(0, 0, bank, row, 0)).with_owner(Owner::Controller)
    }

    fn issue(rank: &mut Rank, queue: &mut EventQueue, req: &Request) -> Result<SavedState, FailReason> {
        let hooks = HookRegistry::new();
        let mut ctx = IssueContext::new(queue, &hooks);
        rank.issue_command(req, &mut ctx)
    }

    #[test]
    fn test_counters_start_at_tcmd() {
        let mut r = rank(2);
        assert_eq!(
            r.is_issuable(&request(OpType::Activate, 0, 1), 0),
            Err(FailReason::RankTiming)
        );
        assert!(r.is_issuable(&request(OpType::Activate, 0, 1), 1).is_ok());
    }

    #[test]
    fn test_rrd_spacing() {
        let mut r = rank(4);
        let mut queue = EventQueue::new();
        queue.loop_steps(1, &mut NullHandler);
        issue(&mut r, &mut queue, &request(OpType::Activate, 0, 1)).unwrap();

        let second = request(OpType::Activate, 1, 1);
        assert_eq!(r.is_issuable(&second, 5), Err(FailReason::RankTiming));
        assert_eq!(r.stats().rrd_waits, 1);
        assert!(r.is_issuable(&second, 6).is_ok());
    }

    #[test]
    fn test_activation_window() {
        let params = TimingParams {
            t_faw: 30,
            ..TimingParams::default()
        };
        let mut r = rank_with(8, params);
        let mut queue = EventQueue::new();
        queue.loop_steps(1, &mut NullHandler);
        // tRRDR = 5: activations at 1, 6, 11, 16.
        for bank in 0..4 {
            issue(&mut r, &mut queue, &request(OpType::Activate, bank, 1)).unwrap();
            queue.loop_steps(5, &mut NullHandler);
        }
        assert_eq!(queue.current_cycle(), 21);

        let fifth = request(OpType::Activate, 4, 1);
        assert_eq!(r.is_issuable(&fifth, 21), Err(FailReason::RankTiming));
        assert_eq!(r.stats().faw_waits, 1);
        assert_eq!(r.stats().rrd_waits, 0);
        assert!(r.is_issuable(&fifth, 31).is_ok());
    }

    #[test]
    fn test_notify_pushes_counters() {
        let mut r = rank(1);
        let p = TimingParams::default();
        r.notify(OpType::Read, 100);
        assert_eq!(r.timing().next_read, 100 + p.t_burst + p.t_rtrs);
        assert_eq!(r.timing().next_write, 100 + p.t_cas + p.t_burst + p.t_rtrs - p.t_cwd);

        r.notify(OpType::Write, 200);
        assert_eq!(r.timing().next_write, 200 + p.t_burst + p.t_ost);
        assert_eq!(r.stats().notifies, 2);

        r.notify(OpType::Activate, 300);
        assert_eq!(r.stats().notifies, 2);
    }

    fn nvm_rank(banks: u64) -> Rank {
        let geometry = Geometry {
            banks,
            banks_per_refresh: banks,
            ..Geometry::default()
        };
        Rank::new(
            0,
            0,
            &geometry,
            &BankParams::default(),
            Arc::new(TimingParams::default()),
            Arc::new(FixedLatencyModel::new(50)),
            PrechargeCounting::Once,
        )
    }

    #[test]
    fn test_interrupt_restores_rank_counters() {
        let mut r = nvm_rank(2);
        let mut queue = EventQueue::new();
        let hooks = HookRegistry::new();
        queue.loop_steps(1, &mut NullHandler);
        issue(&mut r, &mut queue, &request(OpType::Activate, 0, 3)).unwrap();
        queue.loop_steps(10, &mut NullHandler);
        let before = *r.timing();

        let saved = issue(&mut r, &mut queue, &request(OpType::Write, 0, 3)).unwrap();
        assert_ne!(*r.timing(), before);
        queue.loop_steps(20, &mut NullHandler);

        let mut ctx = IssueContext::new(&mut queue, &hooks);
        // Pulse starts at 11 + tCWD + tBURST = 22.
        assert_eq!(r.interrupt_write(&saved, &mut ctx), Some(9));
        assert_eq!(*r.timing(), before);
    }

    #[test]
    fn test_interrupt_keeps_later_rank_counters() {
        let mut r = nvm_rank(2);
        let mut queue = EventQueue::new();
        let hooks = HookRegistry::new();
        queue.loop_steps(1, &mut NullHandler);
        issue(&mut r, &mut queue, &request(OpType::Activate, 0, 3)).unwrap();
        queue.loop_steps(10, &mut NullHandler);

        let saved = issue(&mut r, &mut queue, &request(OpType::Write, 0, 3)).unwrap();
        queue.loop_steps(4, &mut NullHandler);
        issue(&mut r, &mut queue, &request(OpType::Activate, 1, 7)).unwrap();
        let after = *r.timing();
        queue.loop_steps(16, &mut NullHandler);

        let mut ctx = IssueContext::new(&mut queue, &hooks);
        assert_eq!(r.interrupt_write(&saved, &mut ctx), Some(9));
        assert_eq!(*r.timing(), after);
        assert_eq!(r.stats().activates, 2);
    }

    #[test]
    fn test_refresh_covers_group() {
        let mut r = rank(4);
        let mut queue = EventQueue::new();
        queue.loop_steps(1, &mut NullHandler);
        issue(&mut r, &mut queue, &request(OpType::Refresh, 0, 0)).unwrap();

        assert_eq!(r.state(), RankState::Refreshing);
        for bank in 0..4 {
            assert_eq!(r.bank(bank).map(BankModel::state), Some(BankState::Refreshing));
        }
        assert_eq!(queue.pending(), 1);
    }

    #[test]
    fn test_power_down_all_banks() {
        let mut r = rank(2);
        let mut queue = EventQueue::new();
        issue(&mut r, &mut queue, &request(OpType::PowerdownPdpf, 0, 0)).unwrap();
        assert_eq!(r.state(), RankState::PowerDownFast);
        assert!(r.bank(1).map_or(false, |b| b.state().is_powered_down()));

        queue.loop_steps(10, &mut NullHandler);
        issue(&mut r, &mut queue, &request(OpType::Powerup, 0, 0)).unwrap();
        assert_eq!(r.state(), RankState::Closed);
    }
}
