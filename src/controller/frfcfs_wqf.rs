//! First-ready, first-come-first-served scheduling with write-queue drain.
//!
//! Reads and writes wait in separate queues. Reads are served until the
//! write queue reaches its high-water mark; the controller then serves only
//! writes until the queue falls to the low-water mark. Within the active
//! queue the first matching rule wins: a starved transaction, a row-buffer
//! hit, the oldest transaction that is ready now, a transaction to a closed
//! bank.

use std::collections::VecDeque;

use super::{ControllerCore, MemoryController, RowOutcome};
use crate::config::MemoryConfig;
use crate::device::{Interconnect, IssueContext};
use crate::event::EventQueue;
use crate::request::Request;
use crate::types::{ComponentId, Cycle};

/// Scheduling statistics.
#[derive(Clone, Debug, Default)]
pub struct FrFcfsWqfStats {
    /// Reads accepted
    pub mem_reads: u64,
    /// Writes accepted
    pub mem_writes: u64,
    pub rb_hits: u64,
    pub rb_miss: u64,
    pub starvation_precharges: u64,
    pub drain_phases: u64,
    pub forced_drains: u64,
    pub rejected_reads: u64,
    pub rejected_writes: u64,
}

/// FR-FCFS controller with a write-queue drain.
pub struct FrFcfsWqf {
    core: ControllerCore,
    read_queue: VecDeque<Request>,
    write_queue: VecDeque<Request>,
    read_queue_size: usize,
    write_queue_size: usize,
    high_water_mark: usize,
    low_water_mark: usize,
    draining: bool,
    /// Drain until the write queue is empty
    force_drain: bool,
    stats: FrFcfsWqfStats,
}

impl FrFcfsWqf {
    /// Creates the controller of one channel.
    pub fn new(channel: u64, config: &MemoryConfig) -> Self {
        let params = &config.controller;
        Self {
            core: ControllerCore::new(channel, config),
            read_queue: VecDeque::with_capacity(params.read_queue_size),
            write_queue: VecDeque::with_capacity(params.write_queue_size),
            read_queue_size: params.read_queue_size,
            write_queue_size: params.write_queue_size,
            high_water_mark: params.high_water_mark(),
            low_water_mark: params.low_water_mark,
            draining: false,
            force_drain: false,
            stats: FrFcfsWqfStats::default(),
        }
    }

    pub fn core(&self) -> &ControllerCore {
        &self.core
    }

    pub fn stats(&self) -> &FrFcfsWqfStats {
        &self.stats
    }

    pub fn read_queue_len(&self) -> usize {
        self.read_queue.len()
    }

    pub fn write_queue_len(&self) -> usize {
        self.write_queue.len()
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    pub fn is_force_draining(&self) -> bool {
        self.force_drain
    }

    fn update_drain(&mut self) {
        let occupancy = self.write_queue.len();
        if self.force_drain {
            if occupancy == 0 {
                self.force_drain = false;
                self.draining = false;
            }
            return;
        }

        if !self.draining && occupancy >= self.high_water_mark {
            self.draining = true;
            self.stats.drain_phases += 1;
            tracing::debug!("{}: write drain started with {} writes", self.core.id(), occupancy);
        } else if self.draining && occupancy <= self.low_water_mark {
            self.draining = false;
            tracing::debug!("{}: write drain stopped with {} writes", self.core.id(), occupancy);
        }
    }

    /// Picks the next transaction from the active queue.
    fn select(&mut self, bus: &mut Interconnect, now: Cycle) -> Option<Request> {
        let draining = self.draining;
        let queue = if draining {
            &self.write_queue
        } else {
            &self.read_queue
        };
        let any = |_: &Request| true;

        let (index, starved) = if let Some(index) = self.core.find_starved_request(queue, any) {
            (index, true)
        } else if let Some(index) = self.core.find_row_buffer_hit(queue, any) {
            (index, false)
        } else if let Some(index) = self.core.find_oldest_ready_request(queue, bus, now, any) {
            (index, false)
        } else {
            (self.core.find_closed_bank_request(queue, any)?, false)
        };

        if starved {
            self.stats.starvation_precharges += 1;
        }
        if draining {
            self.write_queue.remove(index)
        } else {
            self.read_queue.remove(index)
        }
    }
}

impl MemoryController for FrFcfsWqf {
    fn id(&self) -> ComponentId {
        self.core.id()
    }

    fn issue_command(&mut self, mut request: Request, queue: &mut EventQueue) -> bool {
        if !self.is_issuable(&request) {
            if request.op.is_write() {
                self.stats.rejected_writes += 1;
            } else {
                self.stats.rejected_reads += 1;
            }
            return false;
        }

        let now = queue.current_cycle();
        request.arrival_cycle = now;
        if request.op.is_write() {
            self.write_queue.push_back(request);
            self.stats.mem_writes += 1;
        } else {
            self.read_queue.push_back(request);
            self.stats.mem_reads += 1;
        }
        self.core.schedule_wakeup(queue, now);
        true
    }

    fn is_issuable(&self, request: &Request) -> bool {
        if !self.core.in_range(&request.address) {
            return false;
        }
        if request.op.is_read() {
            self.read_queue.len() < self.read_queue_size
        } else if request.op.is_write() {
            // A forced drain decides admission on its own.
            let blocked = if self.force_drain {
                self.core.params().block_writes_on_force_drain
            } else {
                self.draining
            };
            !blocked && self.write_queue.len() < self.write_queue_size
        } else {
            false
        }
    }

    fn queue_full(&self) -> bool {
        self.read_queue.len() >= self.read_queue_size || self.write_queue.len() >= self.write_queue_size
    }

    fn request_complete(&mut self, request: Request, queue: &mut EventQueue) {
        let now = queue.current_cycle();
        self.core.request_complete(request, now);
        if self.has_pending_work() {
            self.core.schedule_wakeup(queue, now);
        }
    }

    fn cycle(&mut self, steps: Cycle, bus: &mut Interconnect, ctx: &mut IssueContext<'_>) {
        self.core.begin_cycle(steps);
        let now = ctx.now();

        self.core.handle_refresh(now);
        self.core
            .handle_power_down(&[&self.read_queue, &self.write_queue], bus, ctx);

        self.update_drain();
        if let Some(request) = self.select(bus, now) {
            let outcome = self
                .core
                .issue_memory_commands(request, now, &[&self.read_queue, &self.write_queue]);
            match outcome {
                RowOutcome::Hit => self.stats.rb_hits += 1,
                RowOutcome::Closed | RowOutcome::Conflict => self.stats.rb_miss += 1,
            }
        }

        self.core.cycle_command_queues(bus, ctx);

        if !self.draining {
            // Interrupted writes go back into the write queue, which must not
            // grow past its capacity.
            let room = self.write_queue_size.saturating_sub(self.write_queue.len());
            for write in self
                .core
                .interrupt_writes(&self.read_queue, room, bus, ctx)
                .into_iter()
                .rev()
            {
                self.write_queue.push_front(write);
            }
        }

        let busy = self.has_pending_work();
        self.core.finish_cycle(busy, ctx.queue);
    }

    fn wake(&mut self, queue: &mut EventQueue) {
        let now = queue.current_cycle();
        self.core.schedule_wakeup(queue, now);
    }

    /// Drains the write queue completely, regardless of the water marks.
    fn force_drain(&mut self, queue: &mut EventQueue) {
        if !self.force_drain {
            self.force_drain = true;
            self.stats.forced_drains += 1;
            if !self.draining {
                self.stats.drain_phases += 1;
            }
            self.draining = true;
        }
        self.wake(queue);
    }

    /// Writes parked below the high-water mark are not pending work; they
    /// wait for more writes or a forced drain.
    fn has_pending_work(&self) -> bool {
        !self.read_queue.is_empty()
            || (self.draining && !self.write_queue.is_empty())
            || self.core.has_pending_work()
    }

    fn export_stats(&self) -> serde_json::Value {
        let s = &self.stats;
        let mut stats = serde_json::json!({
            "mem_reads": s.mem_reads,
            "mem_writes": s.mem_writes,
            "rb_hits": s.rb_hits,
            "rb_miss": s.rb_miss,
            "starvation_precharges": s.starvation_precharges,
            "drain_phases": s.drain_phases,
            "forced_drains": s.forced_drains,
            "rejected_reads": s.rejected_reads,
            "rejected_writes": s.rejected_writes,
            "read_queue": self.read_queue.len(),
            "write_queue": self.write_queue.len(),
        });
        if let (Some(target), serde_json::Value::Object(core)) = (stats.as_object_mut(), self.core.export_stats()) {
            target.extend(core);
        }
        stats
    }
}
