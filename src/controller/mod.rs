//! Memory controllers.
//!
//! A controller accepts transactions from the front end, turns each one into
//! a short protocol command sequence, and feeds those commands to its
//! channel's interconnect whenever the device tree accepts them. The
//! scheduling policy decides which transaction goes next; `ControllerCore`
//! holds the machinery every policy shares: per-bank command lanes, row
//! bookkeeping, refresh, power-down, early completion and write
//! interruption.

pub mod frfcfs_wqf;

pub use frfcfs_wqf::{FrFcfsWqf, FrFcfsWqfStats};

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Range;

use crate::address::Address;
use crate::config::{ClosePage, ControllerParams, EndMode, MemoryConfig, PowerDownMode, WriteInterrupt};
use crate::device::{Device, Interconnect, IssueContext, SavedState};
use crate::event::{EventQueue, EventType};
use crate::request::{OpType, Owner, Request, RequestStatus};
use crate::types::{ComponentId, Cycle, EventId, RequestId};

/// Priority of controller wakeups; device responses in the same cycle fire first.
pub const CYCLE_PRIORITY: i32 = 1;

/// Contract between the memory system and a scheduling policy.
pub trait MemoryController: Send {
    /// Identifier used for event routing.
    fn id(&self) -> ComponentId;

    /// Offers a transaction to the controller.
    ///
    /// Returns false without blocking if the transaction cannot be queued.
    fn issue_command(&mut self, request: Request, queue: &mut EventQueue) -> bool;

    /// Returns true if `request` would currently be accepted.
    fn is_issuable(&self, request: &Request) -> bool;

    /// Returns true if any transaction queue is full.
    fn queue_full(&self) -> bool;

    /// Handles a completion arriving from the device tree.
    fn request_complete(&mut self, request: Request, queue: &mut EventQueue);

    /// Runs one scheduling pass. `steps` is the number of cycles since the
    /// previous pass.
    fn cycle(&mut self, steps: Cycle, bus: &mut Interconnect, ctx: &mut IssueContext<'_>);

    /// Returns true if the controller still has work it can make progress on.
    fn has_pending_work(&self) -> bool;

    /// Schedules a scheduling pass at the current cycle.
    fn wake(&mut self, queue: &mut EventQueue);

    /// Serves every queued write before anything else. Policies without a
    /// write queue ignore this.
    fn force_drain(&mut self, _queue: &mut EventQueue) {}

    /// Finalizes derived statistics before reporting.
    fn calculate_stats(&mut self) {}

    /// Exports statistics as JSON.
    fn export_stats(&self) -> serde_json::Value;
}

/// Row bookkeeping of one bank, as seen by the controller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BankBook {
    /// An ACTIVATE is queued or issued and no close is planned
    pub activate_queued: bool,
    /// Row that will be open once the lane drains
    pub effective_row: u64,
    pub effective_subarray: u64,
    /// Row hits scheduled since the last activation
    pub starved: u64,
    /// Blocked for scheduling until a refresh is issued
    pub refresh_pending: bool,
}

impl BankBook {
    /// Returns true if `address` hits the row this bank will have open.
    pub fn holds(&self, address: &Address) -> bool {
        self.activate_queued
            && self.effective_row == address.row
            && self.effective_subarray == address.subarray
    }
}

/// How a transaction related to its bank's row buffer when it was scheduled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RowOutcome {
    /// Target row already open
    Hit,
    /// Bank closed, ACTIVATE needed
    Closed,
    /// Different row open, PRECHARGE and ACTIVATE needed
    Conflict,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RefreshPhase {
    Idle,
    /// Closing open banks of the group
    Closing,
    /// REFRESH queued in the head lane
    Queued,
}

#[derive(Clone, Copy, Debug)]
struct RefreshGroup {
    next_due: Cycle,
    phase: RefreshPhase,
}

#[derive(Debug)]
struct LaneEntry {
    request: Request,
    /// Cycle the command entered the lane
    queued: Cycle,
    /// Already reported as stuck
    reported: bool,
}

#[derive(Debug)]
struct InFlightWrite {
    request: Request,
    saved: SavedState,
}

/// Controller statistics shared by every policy.
#[derive(Clone, Debug, Default)]
pub struct ControllerStats {
    /// Cycles covered by scheduling passes
    pub cycles: u64,
    pub completed_reads: u64,
    pub completed_writes: u64,
    pub total_latency: u64,
    pub total_queue_latency: u64,
    pub measured_latencies: u64,
    pub early_completions: u64,
    pub hard_failures: u64,
    pub write_interruptions: u64,
    pub forced_writes: u64,
    pub refreshes: u64,
    pub power_downs: u64,
    pub power_ups: u64,
    pub deadlock_reports: u64,
}

impl ControllerStats {
    pub fn average_latency(&self) -> f64 {
        if self.measured_latencies == 0 {
            0.0
        } else {
            self.total_latency as f64 / self.measured_latencies as f64
        }
    }

    pub fn average_queue_latency(&self) -> f64 {
        if self.measured_latencies == 0 {
            0.0
        } else {
            self.total_queue_latency as f64 / self.measured_latencies as f64
        }
    }
}

/// Transaction-to-command machinery shared by scheduling policies.
pub struct ControllerCore {
    id: ComponentId,
    channel: u64,
    ranks: u64,
    banks: u64,
    params: ControllerParams,
    t_refi: Cycle,
    t_cas: Cycle,
    /// One command lane per (rank, bank)
    lanes: Vec<VecDeque<LaneEntry>>,
    books: Vec<BankBook>,
    banks_per_refresh: u64,
    groups_per_rank: u64,
    refresh: Vec<RefreshGroup>,
    powered_down: Vec<bool>,
    /// Interruptible writes keyed by lane
    writes_in_flight: BTreeMap<usize, InFlightWrite>,
    /// Reads completing early; true once the first completion arrived
    early: HashMap<RequestId, bool>,
    wakeup: Option<(EventId, Cycle)>,
    next_command_id: RequestId,
    round_robin: usize,
    stats: ControllerStats,
}

impl ControllerCore {
    /// Creates the shared machinery for one channel.
    pub fn new(channel: u64, config: &MemoryConfig) -> Self {
        let geometry = &config.geometry;
        let params = config.controller.clone();
        let lane_count = (geometry.ranks * geometry.banks) as usize;
        let banks_per_refresh = geometry.banks_per_refresh.clamp(1, geometry.banks.max(1));
        let groups_per_rank = geometry.banks.div_ceil(banks_per_refresh);
        let t_refi = config.timing.t_refi.max(1);

        let refresh = if params.use_refresh {
            let total = geometry.ranks * groups_per_rank;
            (0..total)
                .map(|index| {
                    let offset = if params.stagger_refresh {
                        t_refi * index / total.max(1)
                    } else {
                        0
                    };
                    RefreshGroup {
                        next_due: t_refi + offset,
                        phase: RefreshPhase::Idle,
                    }
                })
                .collect()
        } else {
            Vec::new()
        };

        Self {
            id: ComponentId::Controller { channel },
            channel,
            ranks: geometry.ranks,
            banks: geometry.banks,
            params,
            t_refi,
            t_cas: config.timing.t_cas,
            lanes: (0..lane_count).map(|_| VecDeque::new()).collect(),
            books: vec![BankBook::default(); lane_count],
            banks_per_refresh,
            groups_per_rank,
            refresh,
            powered_down: vec![false; geometry.ranks as usize],
            writes_in_flight: BTreeMap::new(),
            early: HashMap::new(),
            wakeup: None,
            next_command_id: RequestId::MAX,
            round_robin: 0,
            stats: ControllerStats::default(),
        }
    }

    pub fn id(&self) -> ComponentId {
        self.id
    }

    pub fn params(&self) -> &ControllerParams {
        &self.params
    }

    pub fn stats(&self) -> &ControllerStats {
        &self.stats
    }

    /// Returns the bookkeeping of a bank.
    pub fn book(&self, rank: u64, bank: u64) -> Option<&BankBook> {
        self.books.get(self.lane_of(rank, bank))
    }

    /// Number of commands waiting in a bank's lane.
    pub fn lane_len(&self, rank: u64, bank: u64) -> usize {
        self.lanes.get(self.lane_of(rank, bank)).map_or(0, VecDeque::len)
    }

    /// Returns true if every lane is empty.
    pub fn lanes_empty(&self) -> bool {
        self.lanes.iter().all(VecDeque::is_empty)
    }

    pub fn is_powered_down(&self, rank: u64) -> bool {
        self.powered_down.get(rank as usize).copied().unwrap_or(false)
    }

    /// Returns true if `address` names a bank of this channel.
    pub fn in_range(&self, address: &Address) -> bool {
        address.channel == self.channel && address.rank < self.ranks && address.bank < self.banks
    }

    fn lane_of(&self, rank: u64, bank: u64) -> usize {
        (rank * self.banks + bank) as usize
    }

    fn lane_index(&self, address: &Address) -> usize {
        self.lane_of(address.rank, address.bank)
    }

    /// The bank's lane is empty and the bank is not held for refresh.
    fn schedulable(&self, lane: usize) -> bool {
        self.lanes[lane].is_empty() && !self.books[lane].refresh_pending
    }

    fn next_command_id(&mut self) -> RequestId {
        let id = self.next_command_id;
        self.next_command_id -= 1;
        id
    }

    /// Builds a controller-owned command addressed to a bank.
    fn build_command(&mut self, op: OpType, rank: u64, bank: u64) -> Request {
        let id = self.next_command_id();
        Request::new(id, op, Address::new(self.channel, rank, bank, 0, 0)).with_owner(Owner::Controller)
    }

    /// Builds a REFRESH for the group whose head is `bank`.
    pub fn build_refresh_request(&mut self, rank: u64, bank: u64) -> Request {
        self.build_command(OpType::Refresh, rank, bank)
    }

    /// PRECHARGE closing the row a bank will have open.
    fn precharge_for(&self, lane: usize, request: &Request) -> Request {
        let book = &self.books[lane];
        let mut precharge = Request::command(OpType::Precharge, request);
        precharge.address.row = book.effective_row;
        precharge.address.subarray = book.effective_subarray;
        precharge
    }

    /// First command `request` would generate if scheduled now.
    fn first_command(&self, request: &Request) -> Request {
        let lane = self.lane_index(&request.address);
        let book = &self.books[lane];
        if !book.activate_queued {
            Request::command(OpType::Activate, request)
        } else if !book.holds(&request.address) {
            self.precharge_for(lane, request)
        } else {
            request.clone()
        }
    }

    /// Finds a transaction whose bank keeps serving row hits past the
    /// starvation threshold while it waits for a different row.
    pub fn find_starved_request<F>(&self, queue: &VecDeque<Request>, pred: F) -> Option<usize>
    where
        F: Fn(&Request) -> bool,
    {
        queue.iter().position(|request| {
            let lane = self.lane_index(&request.address);
            let book = &self.books[lane];
            pred(request)
                && self.schedulable(lane)
                && book.activate_queued
                && !book.holds(&request.address)
                && book.starved >= self.params.starvation_threshold
        })
    }

    /// Finds the oldest transaction hitting its bank's open row.
    pub fn find_row_buffer_hit<F>(&self, queue: &VecDeque<Request>, pred: F) -> Option<usize>
    where
        F: Fn(&Request) -> bool,
    {
        queue.iter().position(|request| {
            let lane = self.lane_index(&request.address);
            pred(request) && self.schedulable(lane) && self.books[lane].holds(&request.address)
        })
    }

    /// Finds the oldest transaction on an open bank whose first command
    /// could issue right now.
    pub fn find_oldest_ready_request<F>(
        &self,
        queue: &VecDeque<Request>,
        bus: &mut Interconnect,
        now: Cycle,
        pred: F,
    ) -> Option<usize>
    where
        F: Fn(&Request) -> bool,
    {
        queue.iter().position(|request| {
            let lane = self.lane_index(&request.address);
            pred(request)
                && self.schedulable(lane)
                && self.books[lane].activate_queued
                && bus.is_issuable(&self.first_command(request), now).is_ok()
        })
    }

    /// Finds the oldest transaction whose bank is closed.
    pub fn find_closed_bank_request<F>(&self, queue: &VecDeque<Request>, pred: F) -> Option<usize>
    where
        F: Fn(&Request) -> bool,
    {
        queue.iter().position(|request| {
            let lane = self.lane_index(&request.address);
            pred(request) && self.schedulable(lane) && !self.books[lane].activate_queued
        })
    }

    /// Moves a transaction into its bank's lane as a command sequence.
    ///
    /// # Arguments
    /// * `request` - Transaction removed from its queue
    /// * `now` - Current cycle
    /// * `others` - Queues still holding transactions, consulted by the
    ///   relaxed close-page policy
    ///
    /// # Panics
    /// Panics if the lane is not empty.
    pub fn issue_memory_commands(&mut self, request: Request, now: Cycle, others: &[&VecDeque<Request>]) -> RowOutcome {
        let lane = self.lane_index(&request.address);
        assert!(
            self.lanes[lane].is_empty(),
            "{}: lane for rank {} bank {} is busy",
            self.id,
            request.address.rank,
            request.address.bank
        );

        let address = request.address;
        let book = self.books[lane];
        let outcome = if !book.activate_queued {
            RowOutcome::Closed
        } else if book.holds(&address) {
            RowOutcome::Hit
        } else {
            RowOutcome::Conflict
        };

        let mut commands = Vec::with_capacity(3);
        match outcome {
            RowOutcome::Closed => commands.push(Request::command(OpType::Activate, &request)),
            RowOutcome::Conflict => {
                commands.push(self.precharge_for(lane, &request));
                commands.push(Request::command(OpType::Activate, &request));
            }
            RowOutcome::Hit => {}
        }

        let close = match self.params.close_page {
            ClosePage::Open => false,
            ClosePage::Strict => true,
            ClosePage::Relaxed => !others.iter().any(|queue| {
                queue.iter().any(|other| {
                    other.address.rank == address.rank
                        && other.address.bank == address.bank
                        && other.address.row == address.row
                        && other.address.subarray == address.subarray
                })
            }),
        };

        let book = &mut self.books[lane];
        match outcome {
            RowOutcome::Hit => book.starved += 1,
            _ => {
                book.starved = 0;
                book.activate_queued = true;
                book.effective_row = address.row;
                book.effective_subarray = address.subarray;
            }
        }

        let mut column = request;
        if close {
            column.op = column.op.with_precharge();
            book.activate_queued = false;
        }
        commands.push(column);

        for command in commands {
            self.lanes[lane].push_back(LaneEntry {
                request: command,
                queued: now,
                reported: false,
            });
        }
        outcome
    }

    /// Offers every lane's head command to the interconnect.
    pub fn cycle_command_queues(&mut self, bus: &mut Interconnect, ctx: &mut IssueContext<'_>) {
        let now = ctx.now();
        let count = self.lanes.len();

        for offset in 0..count {
            let lane = (self.round_robin + offset) % count;
            let Some(entry) = self.lanes[lane].front() else {
                continue;
            };

            let mut command = entry.request.clone();
            if command.owner == Owner::Frontend {
                command.issue_cycle = now;
            }

            if let Err(reason) = bus.is_issuable(&command, now) {
                self.check_deadlock(lane, now, &reason.to_string());
                continue;
            }
            if let Ok(saved) = bus.issue_command(&command, ctx) {
                self.lanes[lane].pop_front();
                self.on_issued(lane, command, saved, ctx);
            }
        }

        self.round_robin = (self.round_robin + 1) % count.max(1);
    }

    fn check_deadlock(&mut self, lane: usize, now: Cycle, reason: &str) {
        let timer = self.params.deadlock_timer;
        let id = self.id;
        let Some(entry) = self.lanes[lane].front_mut() else {
            return;
        };
        if entry.reported || now.saturating_sub(entry.queued) <= timer {
            return;
        }
        entry.reported = true;
        self.stats.deadlock_reports += 1;
        tracing::warn!(
            "{}: {} for request {} waiting since cycle {} ({})",
            id,
            entry.request.op,
            entry.request.id,
            entry.queued,
            reason
        );
    }

    fn early_delay(&self) -> Option<Cycle> {
        match self.params.end_mode {
            EndMode::Normal => None,
            EndMode::CriticalWordFirst => Some(self.t_cas + 1),
            EndMode::Immediate => Some(0),
            EndMode::Custom(cycles) => Some(cycles),
        }
    }

    fn on_issued(&mut self, lane: usize, command: Request, saved: SavedState, ctx: &mut IssueContext<'_>) {
        let now = ctx.now();
        tracing::trace!("{}: issued {} for request {} at cycle {}", self.id, command.op, command.id, now);

        if command.op == OpType::Refresh {
            self.refresh_issued(&command.address);
            return;
        }
        if command.owner != Owner::Frontend {
            return;
        }

        if command.op.is_read() {
            if let Some(delay) = self.early_delay() {
                self.early.insert(command.id, false);
                self.stats.early_completions += 1;
                ctx.queue.insert_response(self.id, command.clone(), now + delay);
            }
        }

        if command.op == OpType::Write
            && saved.has_write_pulse()
            && self.params.write_interrupt != WriteInterrupt::None
            && !command.flags.forced
            && command.flags.cancellation_count < self.params.max_write_interruptions
        {
            self.writes_in_flight.insert(
                lane,
                InFlightWrite {
                    request: command,
                    saved,
                },
            );
        }
    }

    fn group_banks(&self, group: u64) -> Range<u64> {
        let start = group * self.banks_per_refresh;
        start..(start + self.banks_per_refresh).min(self.banks)
    }

    fn refresh_issued(&mut self, address: &Address) {
        let index = (address.rank * self.groups_per_rank + address.bank / self.banks_per_refresh) as usize;
        let Some(group) = self.refresh.get_mut(index) else {
            return;
        };
        group.phase = RefreshPhase::Idle;
        group.next_due += self.t_refi;

        for bank in self.group_banks(address.bank / self.banks_per_refresh) {
            let lane = self.lane_of(address.rank, bank);
            self.books[lane].refresh_pending = false;
        }
        self.stats.refreshes += 1;
    }

    /// Starts due refreshes and moves refreshing groups forward.
    pub fn handle_refresh(&mut self, now: Cycle) {
        for index in 0..self.refresh.len() {
            let rank = index as u64 / self.groups_per_rank;
            let banks = self.group_banks(index as u64 % self.groups_per_rank);

            if self.refresh[index].phase == RefreshPhase::Idle && now >= self.refresh[index].next_due {
                tracing::debug!(
                    "{}: refresh due for rank {} banks {:?} at cycle {}",
                    self.id,
                    rank,
                    banks,
                    now
                );
                self.refresh[index].phase = RefreshPhase::Closing;
                for bank in banks.clone() {
                    let lane = self.lane_of(rank, bank);
                    self.books[lane].refresh_pending = true;
                }
            }

            if self.refresh[index].phase != RefreshPhase::Closing || self.is_powered_down(rank) {
                continue;
            }

            for bank in banks.clone() {
                let lane = self.lane_of(rank, bank);
                if self.lanes[lane].is_empty() && self.books[lane].activate_queued {
                    let precharge = self.build_command(OpType::PrechargeAll, rank, bank);
                    self.books[lane].activate_queued = false;
                    self.lanes[lane].push_back(LaneEntry {
                        request: precharge,
                        queued: now,
                        reported: false,
                    });
                }
            }

            let closed = banks.clone().all(|bank| {
                let lane = self.lane_of(rank, bank);
                self.lanes[lane].is_empty() && !self.books[lane].activate_queued
            });
            if closed {
                let refresh = self.build_refresh_request(rank, banks.start);
                let lane = self.lane_of(rank, banks.start);
                self.lanes[lane].push_back(LaneEntry {
                    request: refresh,
                    queued: now,
                    reported: false,
                });
                self.refresh[index].phase = RefreshPhase::Queued;
            }
        }
    }

    /// Earliest refresh not yet started.
    pub fn next_refresh_due(&self) -> Option<Cycle> {
        self.refresh
            .iter()
            .filter(|group| group.phase == RefreshPhase::Idle)
            .map(|group| group.next_due)
            .min()
    }

    fn rank_has_work(&self, rank: u64, queues: &[&VecDeque<Request>]) -> bool {
        let lanes = self.lane_of(rank, 0)..self.lane_of(rank + 1, 0);
        self.lanes[lanes].iter().any(|lane| !lane.is_empty())
            || queues
                .iter()
                .any(|queue| queue.iter().any(|request| request.address.rank == rank))
            || self
                .refresh
                .iter()
                .enumerate()
                .any(|(index, group)| index as u64 / self.groups_per_rank == rank && group.phase != RefreshPhase::Idle)
    }

    fn try_issue(&mut self, command: &Request, bus: &mut Interconnect, ctx: &mut IssueContext<'_>) -> bool {
        bus.is_issuable(command, ctx.now()).is_ok() && bus.issue_command(command, ctx).is_ok()
    }

    /// Powers idle ranks down and busy ranks back up.
    pub fn handle_power_down(&mut self, queues: &[&VecDeque<Request>], bus: &mut Interconnect, ctx: &mut IssueContext<'_>) {
        let Some(mode) = self.params.power_down else {
            return;
        };

        for rank in 0..self.ranks {
            let busy = self.rank_has_work(rank, queues);
            if self.is_powered_down(rank) {
                if busy {
                    let powerup = self.build_command(OpType::Powerup, rank, 0);
                    if self.try_issue(&powerup, bus, ctx) {
                        self.powered_down[rank as usize] = false;
                        self.stats.power_ups += 1;
                    }
                }
            } else if !busy {
                let open = bus.rank(rank).is_some_and(|r| !r.is_idle());
                let op = match (open, mode) {
                    (true, _) => OpType::PowerdownPda,
                    (false, PowerDownMode::Fast) => OpType::PowerdownPdpf,
                    (false, PowerDownMode::Slow) => OpType::PowerdownPdps,
                };
                let powerdown = self.build_command(op, rank, 0);
                if self.try_issue(&powerdown, bus, ctx) {
                    self.powered_down[rank as usize] = true;
                    self.stats.power_downs += 1;
                }
            }
        }
    }

    /// Interrupts in-flight writes whose bank has a read waiting.
    ///
    /// At most `limit` writes are interrupted, lowest lane first, so the
    /// caller can keep its write queue within capacity. Returns the
    /// interrupted writes, ready to be queued again.
    pub fn interrupt_writes(
        &mut self,
        reads: &VecDeque<Request>,
        limit: usize,
        bus: &mut Interconnect,
        ctx: &mut IssueContext<'_>,
    ) -> Vec<Request> {
        let mode = self.params.write_interrupt;
        if mode == WriteInterrupt::None || self.writes_in_flight.is_empty() || limit == 0 {
            return Vec::new();
        }

        let waiting: Vec<usize> = self
            .writes_in_flight
            .keys()
            .copied()
            .filter(|&lane| {
                self.lanes[lane]
                    .iter()
                    .any(|command| command.request.owner == Owner::Frontend && command.request.op.is_read())
                    || reads.iter().any(|read| self.lane_index(&read.address) == lane)
            })
            .collect();

        let mut interrupted = Vec::new();
        for lane in waiting {
            if interrupted.len() >= limit {
                tracing::trace!("{}: write queue full, lane {} keeps its write running", self.id, lane);
                break;
            }
            let Some(InFlightWrite { mut request, saved }) = self.writes_in_flight.remove(&lane) else {
                continue;
            };
            // None means the pulse already finished.
            let Some(done) = bus.interrupt_write(&saved, ctx) else {
                continue;
            };

            request.flags.cancellation_count += 1;
            if mode == WriteInterrupt::Pause {
                request.progress += done;
                request.flags.paused = true;
            } else {
                request.progress = 0;
                request.flags.cancelled = true;
            }
            request.status = RequestStatus::Retry;
            if request.flags.cancellation_count >= self.params.max_write_interruptions {
                request.flags.forced = true;
                self.stats.forced_writes += 1;
            }
            self.stats.write_interruptions += 1;

            tracing::debug!(
                "{}: write {} interrupted at cycle {} ({} pulse cycles done, {} interruptions)",
                self.id,
                request.id,
                ctx.now(),
                done,
                request.flags.cancellation_count
            );
            interrupted.push(request);
        }
        interrupted
    }

    /// Finishes a completion arriving at the controller.
    ///
    /// Returns the transaction if this arrival completed it.
    pub fn request_complete(&mut self, mut request: Request, now: Cycle) -> Option<Request> {
        if request.owner != Owner::Frontend {
            tracing::trace!("{}: {} done at cycle {}", self.id, request.op, now);
            return None;
        }

        if let Some(done) = self.early.get_mut(&request.id) {
            if *done {
                self.early.remove(&request.id);
                return None;
            }
            *done = true;
        }

        if request.op.is_write() {
            self.writes_in_flight.retain(|_, write| write.request.id != request.id);
        }
        if request.flags.hard_failure {
            self.stats.hard_failures += 1;
        }

        request.op = request.op.without_precharge();
        request.complete(now);

        if request.op == OpType::Read {
            self.stats.completed_reads += 1;
        } else {
            self.stats.completed_writes += 1;
        }
        self.stats.total_latency += request.latency();
        self.stats.total_queue_latency += request.queue_latency();
        self.stats.measured_latencies += 1;
        Some(request)
    }

    /// Records the cycles covered by a scheduling pass and forgets the
    /// wakeup that triggered it.
    pub fn begin_cycle(&mut self, steps: Cycle) {
        self.stats.cycles += steps;
        self.wakeup = None;
    }

    /// Schedules a controller wakeup at `when`, merging with an earlier one.
    pub fn schedule_wakeup(&mut self, queue: &mut EventQueue, when: Cycle) {
        let now = queue.current_cycle();
        let when = when.max(now);
        if let Some((id, at)) = self.wakeup {
            if at >= now && at <= when && queue.contains(id, at) {
                return;
            }
            if at > when {
                queue.remove_event(id, at);
            }
        }
        let id = queue.insert_event(EventType::Cycle, self.id, None, when, 0, CYCLE_PRIORITY);
        self.wakeup = Some((id, when));
    }

    /// Schedules the next pass: next cycle if busy, otherwise at the next
    /// refresh.
    pub fn finish_cycle(&mut self, busy: bool, queue: &mut EventQueue) {
        let next = queue.current_cycle() + 1;
        if busy {
            self.schedule_wakeup(queue, next);
        } else if let Some(due) = self.next_refresh_due() {
            self.schedule_wakeup(queue, due.max(next));
        }
    }

    /// Work the core can make progress on without new transactions.
    pub fn has_pending_work(&self) -> bool {
        !self.lanes_empty()
            || self.refresh.iter().any(|group| group.phase != RefreshPhase::Idle)
            || (self.params.power_down.is_some() && self.powered_down.iter().any(|&down| !down))
    }

    pub fn export_stats(&self) -> serde_json::Value {
        let s = &self.stats;
        serde_json::json!({
            "cycles": s.cycles,
            "completed_reads": s.completed_reads,
            "completed_writes": s.completed_writes,
            "average_latency": s.average_latency(),
            "average_queue_latency": s.average_queue_latency(),
            "measured_latencies": s.measured_latencies,
            "early_completions": s.early_completions,
            "hard_failures": s.hard_failures,
            "write_interruptions": s.write_interruptions,
            "forced_writes": s.forced_writes,
            "refreshes": s.refreshes,
            "power_downs": s.power_downs,
            "power_ups": s.power_ups,
            "deadlock_reports": s.deadlock_reports,
        })
    }
}
