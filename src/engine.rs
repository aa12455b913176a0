//! Multi-frequency simulation engine.
//!
//! The `GlobalEventQueue` drives several independently clocked systems, each
//! with its own `EventQueue`, on one global clock. A domain running at
//! frequency `f` under a global clock `F` is at local cycle `floor(g * f / F)`
//! at global cycle `g`.
//!
//! Each iteration jumps to the nearest global cycle at which any domain has a
//! pending event, advances every domain to that instant (only the owners of
//! events at that instant fire), and repeats. No domain is ever advanced past
//! an event that belongs to an earlier global step.

use thiserror::Error;

use crate::event::EventQueue;
use crate::types::{Cycle, NEVER};

/// Errors raised while assembling an engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Clock domain {0} has a frequency of zero")]
    ZeroFrequency(String),

    #[error("Clock domain {name} runs at {frequency} which is faster than the global clock {global}")]
    FasterThanGlobal {
        name: String,
        frequency: u64,
        global: u64,
    },
}

/// A system with its own clock and event queue.
pub trait ClockedSystem: Send {
    /// Returns the system's event queue.
    fn event_queue(&self) -> &EventQueue;

    /// Advances the local clock by `steps` cycles, firing due events.
    ///
    /// Events at the current local cycle must fire even when `steps` is zero.
    fn advance(&mut self, steps: Cycle);

    /// Exports statistics as JSON.
    fn export_stats(&self) -> serde_json::Value {
        self.event_queue().export_stats()
    }
}

/// Statistics collected by the global queue.
#[derive(Clone, Debug, Default)]
pub struct EngineStats {
    /// Global cycles simulated
    pub steps_executed: u64,
    /// Iterations that stopped at a pending event
    pub event_steps: u64,
    /// Calls to `ClockedSystem::advance`
    pub domain_advances: u64,
}

struct ClockDomain {
    name: String,
    frequency: u64,
    system: Box<dyn ClockedSystem>,
}

/// Synchronizes several clock domains onto one wall clock.
///
/// # Example
///
/// ```ignore
/// let mut global = GlobalEventQueue::new(2000);  // 2 GHz CPU clock
/// global.add_domain("memory", 400, Box::new(memory))?;
/// global.cycle(10_000);
/// ```
pub struct GlobalEventQueue {
    /// Global clock frequency (any unit, shared with the domains)
    frequency: u64,
    /// Current global cycle
    current_cycle: Cycle,
    domains: Vec<ClockDomain>,
    stats: EngineStats,
}

impl GlobalEventQueue {
    /// Creates a global queue running at `frequency`.
    pub fn new(frequency: u64) -> Self {
        Self {
            frequency: frequency.max(1),
            current_cycle: 0,
            domains: Vec::new(),
            stats: EngineStats::default(),
        }
    }

    /// Adds a clock domain and returns its index.
    ///
    /// # Arguments
    /// * `name` - Name used in logs and statistics
    /// * `frequency` - Domain frequency, in the same unit as the global clock
    /// * `system` - The clocked system
    pub fn add_domain(
        &mut self,
        name: impl Into<String>,
        frequency: u64,
        system: Box<dyn ClockedSystem>,
    ) -> Result<usize, EngineError> {
        let name = name.into();
        if frequency == 0 {
            return Err(EngineError::ZeroFrequency(name));
        }
        if frequency > self.frequency {
            return Err(EngineError::FasterThanGlobal {
                name,
                frequency,
                global: self.frequency,
            });
        }

        tracing::info!(
            "Adding clock domain {} at {} (global clock {})",
            name,
            frequency,
            self.frequency
        );
        self.domains.push(ClockDomain {
            name,
            frequency,
            system,
        });
        Ok(self.domains.len() - 1)
    }

    /// Returns the current global cycle.
    pub fn current_cycle(&self) -> Cycle {
        self.current_cycle
    }

    /// Returns the global clock frequency.
    pub fn frequency(&self) -> u64 {
        self.frequency
    }

    /// Returns the number of domains.
    pub fn domain_count(&self) -> usize {
        self.domains.len()
    }

    /// Returns a domain's system.
    pub fn domain(&self, index: usize) -> Option<&dyn ClockedSystem> {
        self.domains.get(index).map(|d| d.system.as_ref())
    }

    /// Returns the engine statistics.
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Converts a global cycle to a domain's local cycle (rounding down).
    pub fn to_local(&self, global: Cycle, frequency: u64) -> Cycle {
        (global as u128 * frequency as u128 / self.frequency as u128) as Cycle
    }

    /// Converts a domain's local cycle to the first global cycle at or after it.
    pub fn to_global(&self, local: Cycle, frequency: u64) -> Cycle {
        let scaled = local as u128 * self.frequency as u128;
        let f = frequency as u128;
        ((scaled + f - 1) / f).min(NEVER as u128) as Cycle
    }

    fn domain_next_global(&self, domain: &ClockDomain) -> Option<Cycle> {
        let next = domain.system.event_queue().next_event_cycle();
        (next != NEVER).then(|| self.to_global(next, domain.frequency))
    }

    /// Returns the global cycle of the nearest pending event in any domain.
    pub fn next_event_cycle(&self) -> Option<Cycle> {
        self.domains
            .iter()
            .filter_map(|d| self.domain_next_global(d))
            .min()
    }

    fn sync_domains(&mut self, global: Cycle) {
        for index in 0..self.domains.len() {
            let target = self.to_local(global, self.domains[index].frequency);
            let domain = &mut self.domains[index];
            let now = domain.system.event_queue().current_cycle();
            domain.system.advance(target.saturating_sub(now));
            self.stats.domain_advances += 1;
        }
    }

    /// Advances the global clock by `steps` cycles.
    pub fn cycle(&mut self, steps: Cycle) {
        let end = self.current_cycle.saturating_add(steps);

        loop {
            match self.next_event_cycle() {
                Some(next) if next <= end => {
                    let next = next.max(self.current_cycle);
                    self.sync_domains(next);
                    self.current_cycle = next;
                    self.stats.event_steps += 1;
                }
                _ => {
                    self.sync_domains(end);
                    self.current_cycle = end;
                    break;
                }
            }
        }

        self.stats.steps_executed += steps;
    }

    /// Runs until the global clock reaches `max_cycle`.
    pub fn run(&mut self, max_cycle: Cycle) {
        if max_cycle > self.current_cycle {
            self.cycle(max_cycle - self.current_cycle);
        }
    }

    /// Runs until no domain has pending events or `limit` global cycles pass.
    ///
    /// Returns true if every domain went idle.
    pub fn run_until_idle(&mut self, limit: Cycle) -> bool {
        let end = self.current_cycle.saturating_add(limit);
        while let Some(next) = self.next_event_cycle() {
            if next > end {
                self.run(end);
                return false;
            }
            let next = next.max(self.current_cycle);
            self.cycle(next - self.current_cycle);
        }
        true
    }

    /// Exports statistics from the engine and all domains.
    pub fn export_stats(&self) -> serde_json::Value {
        let mut domains = serde_json::Map::new();
        for domain in &self.domains {
            let mut stats = domain.system.export_stats();
            if let Some(map) = stats.as_object_mut() {
                map.insert("frequency".to_string(), domain.frequency.into());
            }
            domains.insert(domain.name.clone(), stats);
        }

        serde_json::json!({
            "engine": {
                "current_cycle": self.current_cycle,
                "frequency": self.frequency,
                "steps_executed": self.stats.steps_executed,
                "event_steps": self.stats.event_steps,
                "domain_advances": self.stats.domain_advances,
                "domain_count": self.domains.len(),
            },
            "domains": domains,
        })
    }
}
