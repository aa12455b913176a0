//! # nvsim
//!
//! A cycle-accurate simulator of DRAM and non-volatile main memory.
//!
//! ## Design
//!
//! - **Event-Driven**: every component schedules its future work on an
//!   `EventQueue`. Nothing happens between events, so idle stretches cost
//!   nothing.
//! - **Device Tree**: each channel is a tree of interconnect, ranks, banks and
//!   subarrays. Every level checks its own timing counters before a command
//!   may issue, and the command is applied to every level on its way down.
//! - **Explicit Context**: devices never hold pointers to their parents or to
//!   the clock. The current cycle, the event queue and the hooks reach them
//!   through an `IssueContext`; completions are routed by `ComponentId`.
//! - **Multiple Clocks**: a `GlobalEventQueue` drives several systems with
//!   their own frequencies on a single global timeline.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use nvsim::{MemoryConfig, MemorySystem, OpType};
//!
//! let config = MemoryConfig::builder()
//!     .organization(1, 2, 8)
//!     .build()?;
//! let mut memory = MemorySystem::new(config)?;
//!
//! let request = memory
//!     .request(1, OpType::Read, 0x4000)
//!     .with_completion(|r| println!("done at {}", r.completion_cycle));
//! memory.issue_command(request);
//! memory.run_until_idle(100_000);
//!
//! println!("{}", memory.stats_report());
//! ```
//!
//! ## Configuration-Driven Setup
//!
//! ```rust,ignore
//! use nvsim::config::MemoryConfig;
//!
//! let config = MemoryConfig::from_yaml_file("pcm.yaml")?;
//! nvsim::init_logging(&config.simulation.log_level);
//! ```

pub mod types;
pub mod address;
pub mod request;
pub mod event;
pub mod engine;
pub mod config;
pub mod endurance;
pub mod hooks;
pub mod checkpoint;
pub mod device;
pub mod controller;
pub mod system;
pub mod stats;

// Re-export commonly used types
pub use types::{ComponentId, Cycle, EventId, RequestId, NEVER};
pub use address::{Address, AddressError, AddressTranslator, MemoryPartition, TranslationMethod};
pub use request::{CompletionHandle, OpType, Owner, Request, RequestFlags, RequestStatus};
pub use event::{Event, EventHandler, EventQueue, EventType, NullHandler};
pub use engine::{ClockedSystem, EngineError, GlobalEventQueue};
pub use config::{ConfigError, ConfigResult, MemoryConfig, MemoryConfigBuilder};
pub use endurance::{WriteModel, WriteOutcome};
pub use hooks::{CommandHook, CommandTracer, HookRegistry};
pub use checkpoint::{Checkpoint, CheckpointError, CheckpointSet};
pub use device::{Device, FailReason, Interconnect, IssueContext, SavedState};
pub use controller::{FrFcfsWqf, MemoryController};
pub use system::MemorySystem;
pub use stats::{StatsCollector, StatsReport, Timer};

/// Initialize the tracing subscriber for logging.
///
/// `RUST_LOG`, when set, overrides `level`.
///
/// # Example
///
/// ```rust,ignore
/// nvsim::init_logging("info");
/// ```
pub fn init_logging(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
