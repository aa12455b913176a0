//! The top-level memory system.
//!
//! A `MemorySystem` owns one event queue for its clock domain and, per
//! channel, a controller and the device tree behind it. It routes every
//! event the queue fires to the right component, so nothing in the tree
//! holds a pointer to anything else.

use std::sync::Arc;

use crate::address::{Address, AddressTranslator};
use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointSet};
use crate::config::{ConfigResult, MemoryConfig};
use crate::controller::{FrFcfsWqf, MemoryController};
use crate::device::{Device, Interconnect, IssueContext};
use crate::endurance::{model_from_config, WriteModel};
use crate::engine::ClockedSystem;
use crate::event::{EventHandler, EventQueue};
use crate::hooks::{CommandHook, HookRegistry};
use crate::request::{OpType, Request};
use crate::stats::StatsReport;
use crate::types::{ComponentId, Cycle, RequestId};

/// One memory channel: a controller and its device tree.
pub struct Channel {
    controller: Box<dyn MemoryController>,
    bus: Interconnect,
    /// Cycle of the previous scheduling pass
    last_cycle: Cycle,
}

impl Channel {
    pub fn controller(&self) -> &dyn MemoryController {
        self.controller.as_ref()
    }

    pub fn bus(&self) -> &Interconnect {
        &self.bus
    }
}

/// Event routing state, kept apart from the queue that drives it.
struct Router {
    channels: Vec<Channel>,
    hooks: HookRegistry,
    dropped_events: u64,
}

impl EventHandler for Router {
    fn cycle(&mut self, recipient: ComponentId, _steps: Cycle, queue: &mut EventQueue) {
        let ComponentId::Controller { channel } = recipient else {
            tracing::trace!("Dropping cycle event for {}", recipient);
            self.dropped_events += 1;
            return;
        };
        let Some(ch) = self.channels.get_mut(channel as usize) else {
            tracing::warn!("Cycle event for missing channel {}", channel);
            self.dropped_events += 1;
            return;
        };

        let now = queue.current_cycle();
        let elapsed = now - ch.last_cycle;
        ch.last_cycle = now;
        ch.bus.cycle(elapsed);

        let mut ctx = IssueContext::new(queue, &self.hooks);
        ch.controller.cycle(elapsed, &mut ch.bus, &mut ctx);
    }

    fn request_complete(&mut self, recipient: ComponentId, mut request: Request, queue: &mut EventQueue) {
        let channel = recipient.channel().and_then(|c| self.channels.get_mut(c as usize));
        let Some(ch) = channel else {
            tracing::trace!("Dropping response for {}", recipient);
            self.dropped_events += 1;
            return;
        };

        match recipient {
            ComponentId::Controller { .. } => ch.controller.request_complete(request, queue),
            _ => {
                let mut ctx = IssueContext::new(queue, &self.hooks);
                ch.bus.complete_at(recipient, &mut request, &mut ctx);
            }
        }
    }
}

/// A complete memory system in one clock domain.
///
/// # Example
///
/// ```ignore
/// let config = MemoryConfig::from_yaml_file("memory.yaml")?;
/// let mut memory = MemorySystem::new(config)?;
/// let request = memory.request(1, OpType::Read, 0x4000)
///     .with_completion(|r| println!("read done at {}", r.completion_cycle));
/// memory.issue_command(request);
/// memory.run_until_idle(10_000);
/// ```
pub struct MemorySystem {
    config: MemoryConfig,
    translator: AddressTranslator,
    model: Arc<dyn WriteModel>,
    queue: EventQueue,
    router: Router,
}

impl MemorySystem {
    /// Builds a memory system from a validated configuration.
    pub fn new(config: MemoryConfig) -> ConfigResult<Self> {
        config.validate()?;
        let translator = config.translator()?;
        let model = model_from_config(&config.endurance);

        let channels = (0..config.geometry.channels)
            .map(|channel| Channel {
                controller: Box::new(FrFcfsWqf::new(channel, &config)),
                bus: Interconnect::new(channel, &config, model.clone()),
                last_cycle: 0,
            })
            .collect::<Vec<_>>();

        tracing::info!(
            "Memory system: {} channels, {} ranks, {} banks, {} rows x {} cols",
            config.geometry.channels,
            config.geometry.ranks,
            config.geometry.banks,
            config.geometry.rows,
            config.geometry.cols
        );

        let mut system = Self {
            config,
            translator,
            model,
            queue: EventQueue::new(),
            router: Router {
                channels,
                hooks: HookRegistry::new(),
                dropped_events: 0,
            },
        };

        // The first pass schedules refresh and power-down.
        if system.config.controller.use_refresh || system.config.controller.power_down.is_some() {
            for channel in &mut system.router.channels {
                channel.controller.wake(&mut system.queue);
            }
        }
        Ok(system)
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn translator(&self) -> &AddressTranslator {
        &self.translator
    }

    pub fn write_model(&self) -> &Arc<dyn WriteModel> {
        &self.model
    }

    /// Registers a command hook.
    pub fn register_hook(&mut self, hook: Arc<dyn CommandHook>) {
        self.router.hooks.register(hook);
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.router.hooks
    }

    pub fn channel(&self, index: u64) -> Option<&Channel> {
        self.router.channels.get(index as usize)
    }

    pub fn channel_count(&self) -> usize {
        self.router.channels.len()
    }

    pub fn current_cycle(&self) -> Cycle {
        self.queue.current_cycle()
    }

    /// Translates a physical address.
    pub fn translate(&self, physical: u64) -> Address {
        self.translator.translate(physical)
    }

    /// Builds a transaction for a physical address.
    pub fn request(&self, id: RequestId, op: OpType, physical: u64) -> Request {
        Request::new(id, op, self.translate(physical))
    }

    fn channel_mut(&mut self, request: &Request) -> Option<&mut Channel> {
        self.router.channels.get_mut(request.address.channel as usize)
    }

    /// Offers a transaction to the controller of its channel.
    ///
    /// Returns false if the controller cannot accept it now.
    pub fn issue_command(&mut self, request: Request) -> bool {
        let index = request.address.channel as usize;
        let Some(channel) = self.router.channels.get_mut(index) else {
            tracing::warn!("Request {} addresses missing channel {}", request.id, index);
            return false;
        };
        channel.controller.issue_command(request, &mut self.queue)
    }

    /// Returns true if the controller of the request's channel would accept it.
    pub fn is_issuable(&self, request: &Request) -> bool {
        self.router
            .channels
            .get(request.address.channel as usize)
            .is_some_and(|channel| channel.controller.is_issuable(request))
    }

    /// Returns true if any controller has a full queue.
    pub fn queue_full(&self) -> bool {
        self.router.channels.iter().any(|channel| channel.controller.queue_full())
    }

    /// Forces every controller to drain its write queue.
    pub fn force_drain(&mut self) {
        for channel in &mut self.router.channels {
            channel.controller.force_drain(&mut self.queue);
        }
    }

    /// Returns true if any controller has work or any event is pending.
    pub fn is_busy(&self) -> bool {
        !self.queue.is_empty()
            || self
                .router
                .channels
                .iter()
                .any(|channel| channel.controller.has_pending_work())
    }

    /// Advances the clock by `steps` cycles.
    pub fn cycle(&mut self, steps: Cycle) {
        self.queue.loop_steps(steps, &mut self.router);
    }

    /// Processes events until nothing is pending or `limit` cycles are reached.
    ///
    /// Returns true if the system went idle.
    pub fn run_until_idle(&mut self, limit: Cycle) -> bool {
        while !self.queue.is_empty() {
            if self.queue.next_event_cycle() > limit {
                self.queue.loop_steps(limit.saturating_sub(self.queue.current_cycle()), &mut self.router);
                return false;
            }
            self.queue.loop_next(&mut self.router);
        }
        true
    }

    /// Mutable access to a channel's device tree, for drivers that poke
    /// device state directly.
    pub fn bus_mut(&mut self, channel: u64) -> Option<&mut Interconnect> {
        self.router.channels.get_mut(channel as usize).map(|c| &mut c.bus)
    }

    /// Finalizes derived statistics on every component.
    pub fn calculate_stats(&mut self) {
        for channel in &mut self.router.channels {
            channel.controller.calculate_stats();
            channel.bus.calculate_stats();
        }
    }

    /// Collects the statistics of every component.
    pub fn export_stats(&self) -> serde_json::Value {
        let mut stats = serde_json::json!({
            "cycles": self.queue.current_cycle(),
            "dropped_events": self.router.dropped_events,
            "event_queue": self.queue.export_stats(),
            "endurance": self.model.export_stats(),
        });
        for (index, channel) in self.router.channels.iter().enumerate() {
            let mut channel_stats = channel.bus.export_stats();
            channel_stats["controller"] = channel.controller.export_stats();
            stats[format!("channel{}", index)] = channel_stats;
        }
        stats
    }

    /// Builds a flat statistics report.
    pub fn stats_report(&mut self) -> StatsReport {
        self.calculate_stats();
        StatsReport::from_json(&self.export_stats())
    }

    /// Saves the timing state of the clock and every device.
    pub fn checkpoint(&self) -> CheckpointSet {
        let mut set = CheckpointSet::new();
        self.create_checkpoint(&mut set);
        set
    }
}

impl Checkpoint for MemorySystem {
    fn create_checkpoint(&self, set: &mut CheckpointSet) {
        self.queue.create_checkpoint(set);
        for channel in &self.router.channels {
            channel.bus.create_checkpoint(set);
        }
    }

    fn restore_checkpoint(&mut self, set: &CheckpointSet) -> Result<(), CheckpointError> {
        self.queue.restore_checkpoint(set)?;
        let now = self.queue.current_cycle();
        for channel in &mut self.router.channels {
            channel.bus.restore_checkpoint(set)?;
            channel.last_cycle = now;
        }
        Ok(())
    }
}

impl ClockedSystem for MemorySystem {
    fn event_queue(&self) -> &EventQueue {
        &self.queue
    }

    fn advance(&mut self, steps: Cycle) {
        self.cycle(steps);
    }

    fn export_stats(&self) -> serde_json::Value {
        MemorySystem::export_stats(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::CommandTracer;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn system() -> MemorySystem {
        let config = MemoryConfig::builder()
            .organization(1, 1, 4)
            .rows_cols(1024, 64)
            .build()
            .unwrap();
        MemorySystem::new(config).unwrap()
    }

    #[test]
    fn test_read_completes() {
        let mut memory = system();
        let done = Arc::new(AtomicU64::new(0));
        let seen = done.clone();
        let request = memory
            .request(1, OpType::Read, 0x1000)
            .with_completion(move |r| seen.store(r.completion_cycle, Ordering::SeqCst));

        assert!(memory.issue_command(request));
        assert!(memory.run_until_idle(1_000));

        let t = &memory.config().timing;
        // ACT at 1, READ after tRCD, data after tCAS + tBURST, then the bus.
        let expected = 1 + t.t_rcd + t.t_cas + t.t_burst + memory.config().controller.off_chip_latency;
        assert_eq!(done.load(Ordering::SeqCst), expected);
    }

    #[test]
    fn test_missing_channel_rejected() {
        let mut memory = system();
        let request = Request::read(1, Address::new(3, 0, 0, 0, 0));
        assert!(!memory.is_issuable(&request));
        assert!(!memory.issue_command(request));
    }

    #[test]
    fn test_hooks_see_commands() {
        let mut memory = system();
        let tracer = Arc::new(CommandTracer::new());
        memory.register_hook(tracer.clone());

        let request = memory.request(1, OpType::Write, 0x2000);
        assert!(memory.issue_command(request));
        memory.force_drain();
        assert!(memory.run_until_idle(1_000));

        let ops: Vec<OpType> = tracer.issued().into_iter().map(|(_, op)| op).collect();
        assert_eq!(ops, vec![OpType::Activate, OpType::Write]);
    }

    #[test]
    fn test_checkpoint_restores_counters() {
        let mut memory = system();
        let request = memory.request(1, OpType::Read, 0x1000);
        assert!(memory.issue_command(request));
        memory.run_until_idle(1_000);
        let set = CheckpointSet::decode(&memory.checkpoint().encode()).unwrap();

        let mut fresh = system();
        fresh.restore_checkpoint(&set).unwrap();
        assert_eq!(fresh.current_cycle(), memory.current_cycle());
        assert_eq!(fresh.checkpoint(), memory.checkpoint());
    }

    #[test]
    fn test_stats_tree() {
        let mut memory = system();
        let request = memory.request(1, OpType::Read, 0x1000);
        assert!(memory.issue_command(request));
        memory.run_until_idle(1_000);

        let stats = memory.export_stats();
        assert_eq!(stats["channel0"]["controller"]["mem_reads"], 1);
        assert_eq!(stats["channel0"]["controller"]["completed_reads"], 1);
        assert_eq!(stats["channel0"]["rank0"]["activates"], 1);
    }
}
