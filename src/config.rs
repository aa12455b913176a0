//! Configuration system for the memory simulator.
//!
//! This module provides YAML/JSON configuration file support for describing
//! a memory system declaratively. Timing keys keep their protocol names.
//!
//! # Configuration File Structure
//!
//! ```yaml
//! simulation:
//!   log_level: info
//!   clock_mhz: 400
//!
//! geometry:
//!   channels: 1
//!   ranks: 2
//!   banks: 8
//!   rows: 16384
//!   cols: 128
//!
//! timing:
//!   tRCD: 10
//!   tRAS: 24
//!   tRP: 10
//!
//! controller:
//!   read_queue_size: 32
//!   write_queue_size: 8
//!   high_water_mark: 6
//!   low_water_mark: 2
//!   close_page: relaxed
//!
//! address_mapping:
//!   scheme: "R:RK:BK:CH:C"
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::address::{AddressError, AddressTranslator, TranslationMethod};
use crate::types::Cycle;

/// Errors that can occur during configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Address mapping error: {0}")]
    Address(#[from] AddressError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown file format: {0}")]
    UnknownFormat(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Global simulation parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimulationParams {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Memory clock in MHz
    #[serde(default = "default_clock_mhz")]
    pub clock_mhz: u64,

    /// Front-end (CPU) clock in MHz
    #[serde(default = "default_cpu_mhz")]
    pub cpu_mhz: u64,

    /// Maximum number of memory cycles to simulate
    #[serde(default = "default_max_cycles")]
    pub max_cycles: Cycle,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_clock_mhz() -> u64 {
    400
}

fn default_cpu_mhz() -> u64 {
    2000
}

fn default_max_cycles() -> Cycle {
    1_000_000
}

impl Default for SimulationParams {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            clock_mhz: default_clock_mhz(),
            cpu_mhz: default_cpu_mhz(),
            max_cycles: default_max_cycles(),
        }
    }
}

/// Memory organization.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Geometry {
    #[serde(default = "default_one")]
    pub channels: u64,

    #[serde(default = "default_ranks")]
    pub ranks: u64,

    #[serde(default = "default_banks")]
    pub banks: u64,

    #[serde(default = "default_rows")]
    pub rows: u64,

    /// Columns per row, in bursts
    #[serde(default = "default_cols")]
    pub cols: u64,

    /// Subarrays per bank
    #[serde(default = "default_one")]
    pub subarrays: u64,

    /// Low address bits selecting a byte within one burst
    #[serde(default = "default_offset_bits")]
    pub offset_bits: u32,

    /// Banks refreshed together by one REFRESH command
    #[serde(default = "default_banks")]
    pub banks_per_refresh: u64,

    /// Activations tracked by the rank activation window (tFAW)
    #[serde(default = "default_raw")]
    pub raw: usize,
}

fn default_one() -> u64 {
    1
}

fn default_ranks() -> u64 {
    2
}

fn default_banks() -> u64 {
    8
}

fn default_rows() -> u64 {
    16384
}

fn default_cols() -> u64 {
    128
}

fn default_offset_bits() -> u32 {
    6
}

fn default_raw() -> usize {
    4
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            channels: default_one(),
            ranks: default_ranks(),
            banks: default_banks(),
            rows: default_rows(),
            cols: default_cols(),
            subarrays: default_one(),
            offset_bits: default_offset_bits(),
            banks_per_refresh: default_banks(),
            raw: default_raw(),
        }
    }
}

impl Geometry {
    /// Rows held by each subarray.
    pub fn rows_per_subarray(&self) -> u64 {
        (self.rows / self.subarrays.max(1)).max(1)
    }
}

/// Protocol timing constants, in memory clock cycles.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingParams {
    #[serde(rename = "tAL")]
    pub t_al: Cycle,
    #[serde(rename = "tBURST")]
    pub t_burst: Cycle,
    #[serde(rename = "tCAS")]
    pub t_cas: Cycle,
    #[serde(rename = "tCCD")]
    pub t_ccd: Cycle,
    #[serde(rename = "tCMD")]
    pub t_cmd: Cycle,
    #[serde(rename = "tCWD")]
    pub t_cwd: Cycle,
    #[serde(rename = "tFAW")]
    pub t_faw: Cycle,
    #[serde(rename = "tOST")]
    pub t_ost: Cycle,
    #[serde(rename = "tPD")]
    pub t_pd: Cycle,
    #[serde(rename = "tPPD")]
    pub t_ppd: Cycle,
    #[serde(rename = "tRAS")]
    pub t_ras: Cycle,
    #[serde(rename = "tRCD")]
    pub t_rcd: Cycle,
    #[serde(rename = "tREFI")]
    pub t_refi: Cycle,
    #[serde(rename = "tRFC")]
    pub t_rfc: Cycle,
    #[serde(rename = "tRP")]
    pub t_rp: Cycle,
    #[serde(rename = "tRRDR")]
    pub t_rrdr: Cycle,
    #[serde(rename = "tRRDW")]
    pub t_rrdw: Cycle,
    #[serde(rename = "tRTP")]
    pub t_rtp: Cycle,
    #[serde(rename = "tRTRS")]
    pub t_rtrs: Cycle,
    #[serde(rename = "tWR")]
    pub t_wr: Cycle,
    #[serde(rename = "tWTR")]
    pub t_wtr: Cycle,
    #[serde(rename = "tXP")]
    pub t_xp: Cycle,
    #[serde(rename = "tXPDLL")]
    pub t_xpdll: Cycle,
    #[serde(rename = "tRDPDEN")]
    pub t_rdpden: Cycle,
    #[serde(rename = "tWRPDEN")]
    pub t_wrpden: Cycle,
    #[serde(rename = "tWRAPDEN")]
    pub t_wrapden: Cycle,
}

impl Default for TimingParams {
    /// DDR3-1600-like defaults.
    fn default() -> Self {
        Self {
            t_al: 0,
            t_burst: 4,
            t_cas: 10,
            t_ccd: 4,
            t_cmd: 1,
            t_cwd: 7,
            t_faw: 20,
            t_ost: 1,
            t_pd: 6,
            t_ppd: 0,
            t_ras: 24,
            t_rcd: 10,
            t_refi: 6240,
            t_rfc: 107,
            t_rp: 10,
            t_rrdr: 5,
            t_rrdw: 5,
            t_rtp: 5,
            t_rtrs: 1,
            t_wr: 10,
            t_wtr: 5,
            t_xp: 5,
            t_xpdll: 20,
            t_rdpden: 15,
            t_wrpden: 25,
            t_wrapden: 26,
        }
    }
}

/// Whether rows are closed after a column access.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClosePage {
    /// Rows stay open until a conflict
    #[default]
    Open,
    /// Close when no other queued transaction hits the row
    Relaxed,
    /// Always close
    Strict,
}

/// When a read transaction is reported complete.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndMode {
    /// When the device response arrives
    #[default]
    Normal,
    /// tCAS + 1 cycles after issue
    CriticalWordFirst,
    /// At issue
    Immediate,
    /// A fixed number of cycles after issue
    Custom(Cycle),
}

/// Power-down state entered by idle ranks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerDownMode {
    /// Precharge power-down, fast exit
    Fast,
    /// Precharge power-down, slow exit
    Slow,
}

/// How a read may interrupt an in-flight NVM write.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteInterrupt {
    #[default]
    None,
    /// Abort and restart the write from scratch
    Cancel,
    /// Suspend and resume the write with its progress kept
    Pause,
}

/// How PRECHARGE_ALL is counted in bank statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrechargeCounting {
    /// One precharge per command
    #[default]
    Once,
    /// One precharge per closed subarray
    PerSubArray,
}

/// Bank implementation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BankType {
    #[default]
    Standard,
    /// Bank with cached row buffers
    Cached,
}

/// Controller policy parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ControllerParams {
    #[serde(default = "default_read_queue_size")]
    pub read_queue_size: usize,

    #[serde(default = "default_write_queue_size")]
    pub write_queue_size: usize,

    /// Write-queue occupancy that starts a drain (defaults to the queue size)
    #[serde(default)]
    pub high_water_mark: Option<usize>,

    /// Write-queue occupancy that ends a drain
    #[serde(default)]
    pub low_water_mark: usize,

    /// Row hits a bank may serve before a conflicting request is forced through
    #[serde(default = "default_starvation_threshold")]
    pub starvation_threshold: u64,

    #[serde(default)]
    pub close_page: ClosePage,

    #[serde(default)]
    pub end_mode: EndMode,

    #[serde(default)]
    pub use_refresh: bool,

    /// Offset refresh of successive bank groups across the refresh interval
    #[serde(default)]
    pub stagger_refresh: bool,

    #[serde(default)]
    pub power_down: Option<PowerDownMode>,

    #[serde(default)]
    pub write_interrupt: WriteInterrupt,

    /// Interruptions after which a write is forced through
    #[serde(default = "default_max_write_interruptions")]
    pub max_write_interruptions: u32,

    /// Reject new writes while a forced drain is latched
    #[serde(default = "default_true")]
    pub block_writes_on_force_drain: bool,

    #[serde(default)]
    pub precharge_counting: PrechargeCounting,

    /// Cycles a lane head may wait before it is reported
    #[serde(default = "default_deadlock_timer")]
    pub deadlock_timer: Cycle,

    /// Off-chip bus delay added to every completion
    #[serde(default = "default_off_chip_latency")]
    pub off_chip_latency: Cycle,
}

fn default_read_queue_size() -> usize {
    32
}

fn default_write_queue_size() -> usize {
    8
}

fn default_starvation_threshold() -> u64 {
    4
}

fn default_max_write_interruptions() -> u32 {
    4
}

fn default_true() -> bool {
    true
}

fn default_deadlock_timer() -> Cycle {
    1_000_000
}

fn default_off_chip_latency() -> Cycle {
    10
}

impl Default for ControllerParams {
    fn default() -> Self {
        Self {
            read_queue_size: default_read_queue_size(),
            write_queue_size: default_write_queue_size(),
            high_water_mark: None,
            low_water_mark: 0,
            starvation_threshold: default_starvation_threshold(),
            close_page: ClosePage::default(),
            end_mode: EndMode::default(),
            use_refresh: false,
            stagger_refresh: false,
            power_down: None,
            write_interrupt: WriteInterrupt::default(),
            max_write_interruptions: default_max_write_interruptions(),
            block_writes_on_force_drain: default_true(),
            precharge_counting: PrechargeCounting::default(),
            deadlock_timer: default_deadlock_timer(),
            off_chip_latency: default_off_chip_latency(),
        }
    }
}

impl ControllerParams {
    /// Effective high-water mark.
    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark.unwrap_or(self.write_queue_size)
    }
}

/// Bank model parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BankParams {
    #[serde(default)]
    pub bank_type: BankType,

    /// Number of cached row buffers
    #[serde(default = "default_cached_row_count")]
    pub cached_row_count: usize,

    /// Columns held by one cached row buffer
    #[serde(default = "default_cached_row_size")]
    pub cached_row_size: u64,

    /// Cached rows never become dirty
    #[serde(default = "default_true")]
    pub cached_rows_read_only: bool,
}

fn default_cached_row_count() -> usize {
    4
}

fn default_cached_row_size() -> u64 {
    32
}

impl Default for BankParams {
    fn default() -> Self {
        Self {
            bank_type: BankType::default(),
            cached_row_count: default_cached_row_count(),
            cached_row_size: default_cached_row_size(),
            cached_rows_read_only: default_true(),
        }
    }
}

/// Write model selection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnduranceKind {
    /// No extra write latency
    #[default]
    None,
    /// Constant extra write-pulse latency
    Fixed,
    /// Constant latency plus a per-row write budget
    Row,
}

/// Endurance model parameters.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EnduranceParams {
    #[serde(default)]
    pub model: EnduranceKind,

    /// Extra write-pulse cycles per write
    #[serde(default)]
    pub write_pulse: Cycle,

    /// Writes a row survives before failing (row model)
    #[serde(default)]
    pub row_write_limit: u64,
}

/// Address mapping parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AddressMapping {
    /// Fields from most to least significant
    #[serde(default = "default_scheme")]
    pub scheme: String,
}

fn default_scheme() -> String {
    "R:RK:BK:CH:C".to_string()
}

impl Default for AddressMapping {
    fn default() -> Self {
        Self {
            scheme: default_scheme(),
        }
    }
}

/// Complete memory system configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default)]
    pub simulation: SimulationParams,

    #[serde(default)]
    pub geometry: Geometry,

    #[serde(default)]
    pub timing: TimingParams,

    #[serde(default)]
    pub controller: ControllerParams,

    #[serde(default)]
    pub bank: BankParams,

    #[serde(default)]
    pub endurance: EnduranceParams,

    #[serde(default)]
    pub address_mapping: AddressMapping,
}

impl MemoryConfig {
    /// Creates a configuration with all defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a builder from the defaults.
    pub fn builder() -> MemoryConfigBuilder {
        MemoryConfigBuilder::new()
    }

    /// Loads configuration from a YAML file.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Loads configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> ConfigResult<Self> {
        let config: MemoryConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a JSON file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Loads configuration from a JSON string.
    pub fn from_json(json: &str) -> ConfigResult<Self> {
        let config: MemoryConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a file, auto-detecting format.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");

        match ext.to_lowercase().as_str() {
            "yaml" | "yml" => Self::from_yaml_file(path),
            "json" => Self::from_json_file(path),
            _ => Err(ConfigError::UnknownFormat(ext.to_string())),
        }
    }

    /// Validates the entire configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        let g = &self.geometry;
        for (name, value) in [
            ("channels", g.channels),
            ("ranks", g.ranks),
            ("banks", g.banks),
            ("rows", g.rows),
            ("cols", g.cols),
            ("subarrays", g.subarrays),
        ] {
            if value == 0 {
                return Err(ConfigError::Validation(format!(
                    "geometry.{} must be at least 1",
                    name
                )));
            }
        }
        if g.raw == 0 {
            return Err(ConfigError::Validation(
                "geometry.raw must be at least 1".to_string(),
            ));
        }
        if g.rows % g.subarrays != 0 {
            tracing::warn!(
                "{} rows do not divide evenly into {} subarrays",
                g.rows,
                g.subarrays
            );
        }

        let c = &self.controller;
        if c.read_queue_size == 0 || c.write_queue_size == 0 {
            return Err(ConfigError::Validation(
                "Queue sizes must be at least 1".to_string(),
            ));
        }
        if c.high_water_mark() > c.write_queue_size {
            return Err(ConfigError::Validation(format!(
                "high_water_mark {} exceeds write_queue_size {}",
                c.high_water_mark(),
                c.write_queue_size
            )));
        }
        if c.low_water_mark >= c.high_water_mark() {
            return Err(ConfigError::Validation(format!(
                "low_water_mark {} must be below high_water_mark {}",
                c.low_water_mark,
                c.high_water_mark()
            )));
        }
        if c.use_refresh {
            if g.banks_per_refresh == 0 || g.banks % g.banks_per_refresh != 0 {
                return Err(ConfigError::Validation(format!(
                    "banks_per_refresh {} must divide banks {}",
                    g.banks_per_refresh, g.banks
                )));
            }
            if self.timing.t_refi == 0 {
                return Err(ConfigError::Validation(
                    "tREFI must be non-zero when refresh is enabled".to_string(),
                ));
            }
        }

        if self.timing.t_burst == 0 {
            tracing::warn!("tBURST is zero; data transfers take no bus time");
        }
        if self.bank.bank_type == BankType::Cached && self.bank.cached_row_count == 0 {
            return Err(ConfigError::Validation(
                "cached_row_count must be at least 1 for cached banks".to_string(),
            ));
        }

        TranslationMethod::new().set_scheme(&self.address_mapping.scheme)?;
        Ok(())
    }

    /// Builds the address translator described by this configuration.
    pub fn translator(&self) -> ConfigResult<AddressTranslator> {
        let g = &self.geometry;
        let mut method = TranslationMethod::new();
        method.set_scheme(&self.address_mapping.scheme)?;
        method.set_count(g.rows, g.cols, g.banks, g.ranks, g.channels)?;
        Ok(AddressTranslator::new(method, g.offset_bits, g.subarrays))
    }

    /// Looks up a single key in any section, e.g. `tRCD` or `read_queue_size`.
    pub fn lookup(&self, key: &str) -> Option<serde_json::Value> {
        let tree = serde_json::to_value(self).ok()?;
        tree.as_object()?
            .values()
            .filter_map(|section| section.as_object())
            .find_map(|section| section.get(key).cloned())
    }

    /// Looks up a numeric key.
    pub fn lookup_u64(&self, key: &str) -> Option<u64> {
        self.lookup(key).and_then(|v| v.as_u64())
    }

    /// Saves configuration to a YAML file.
    pub fn to_yaml_file<P: AsRef<Path>>(&self, path: P) -> ConfigResult<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Saves configuration to a JSON file.
    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> ConfigResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Converts to YAML string.
    pub fn to_yaml(&self) -> ConfigResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Converts to JSON string.
    pub fn to_json(&self) -> ConfigResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Builder for creating MemoryConfig programmatically.
#[derive(Default)]
pub struct MemoryConfigBuilder {
    config: MemoryConfig,
}

impl MemoryConfigBuilder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the log level.
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.simulation.log_level = level.into();
        self
    }

    /// Sets the memory clock.
    pub fn clock_mhz(mut self, mhz: u64) -> Self {
        self.config.simulation.clock_mhz = mhz;
        self
    }

    /// Sets channel, rank and bank counts.
    pub fn organization(mut self, channels: u64, ranks: u64, banks: u64) -> Self {
        self.config.geometry.channels = channels;
        self.config.geometry.ranks = ranks;
        self.config.geometry.banks = banks;
        self.config.geometry.banks_per_refresh = banks;
        self
    }

    /// Sets rows and columns per bank.
    pub fn rows_cols(mut self, rows: u64, cols: u64) -> Self {
        self.config.geometry.rows = rows;
        self.config.geometry.cols = cols;
        self
    }

    /// Sets subarrays per bank.
    pub fn subarrays(mut self, subarrays: u64) -> Self {
        self.config.geometry.subarrays = subarrays;
        self
    }

    /// Sets banks refreshed per REFRESH command.
    pub fn banks_per_refresh(mut self, banks: u64) -> Self {
        self.config.geometry.banks_per_refresh = banks;
        self
    }

    /// Replaces the timing parameters.
    pub fn timing(mut self, timing: TimingParams) -> Self {
        self.config.timing = timing;
        self
    }

    /// Sets the read and write queue sizes.
    pub fn queue_sizes(mut self, read: usize, write: usize) -> Self {
        self.config.controller.read_queue_size = read;
        self.config.controller.write_queue_size = write;
        self
    }

    /// Sets the write-drain watermarks.
    pub fn watermarks(mut self, high: usize, low: usize) -> Self {
        self.config.controller.high_water_mark = Some(high);
        self.config.controller.low_water_mark = low;
        self
    }

    /// Sets the starvation threshold.
    pub fn starvation_threshold(mut self, threshold: u64) -> Self {
        self.config.controller.starvation_threshold = threshold;
        self
    }

    /// Sets the close-page policy.
    pub fn close_page(mut self, policy: ClosePage) -> Self {
        self.config.controller.close_page = policy;
        self
    }

    /// Sets the read completion mode.
    pub fn end_mode(mut self, mode: EndMode) -> Self {
        self.config.controller.end_mode = mode;
        self
    }

    /// Enables periodic refresh.
    pub fn use_refresh(mut self, enable: bool) -> Self {
        self.config.controller.use_refresh = enable;
        self
    }

    /// Enables rank power-down.
    pub fn power_down(mut self, mode: PowerDownMode) -> Self {
        self.config.controller.power_down = Some(mode);
        self
    }

    /// Enables write pause/cancel.
    pub fn write_interrupt(mut self, mode: WriteInterrupt, max_interruptions: u32) -> Self {
        self.config.controller.write_interrupt = mode;
        self.config.controller.max_write_interruptions = max_interruptions;
        self
    }

    /// Sets whether a latched forced drain rejects new writes.
    pub fn block_writes_on_force_drain(mut self, block: bool) -> Self {
        self.config.controller.block_writes_on_force_drain = block;
        self
    }

    /// Sets PRECHARGE_ALL counting.
    pub fn precharge_counting(mut self, counting: PrechargeCounting) -> Self {
        self.config.controller.precharge_counting = counting;
        self
    }

    /// Sets the off-chip bus latency.
    pub fn off_chip_latency(mut self, latency: Cycle) -> Self {
        self.config.controller.off_chip_latency = latency;
        self
    }

    /// Selects the bank model.
    pub fn bank_type(mut self, bank_type: BankType) -> Self {
        self.config.bank.bank_type = bank_type;
        self
    }

    /// Selects the write model.
    pub fn endurance(mut self, model: EnduranceKind, write_pulse: Cycle, row_write_limit: u64) -> Self {
        self.config.endurance = EnduranceParams {
            model,
            write_pulse,
            row_write_limit,
        };
        self
    }

    /// Sets the address mapping scheme.
    pub fn scheme(mut self, scheme: impl Into<String>) -> Self {
        self.config.address_mapping.scheme = scheme.into();
        self
    }

    /// Builds and validates the configuration.
    pub fn build(self) -> ConfigResult<MemoryConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MemoryConfig::new();
        assert_eq!(config.geometry.banks, 8);
        assert_eq!(config.controller.read_queue_size, 32);
        assert_eq!(config.controller.write_queue_size, 8);
        assert_eq!(config.controller.high_water_mark(), 8);
        assert_eq!(config.controller.starvation_threshold, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r#"
simulation:
  log_level: debug
  clock_mhz: 666

geometry:
  channels: 2
  ranks: 1
  banks: 4
  rows: 1024
  cols: 64

timing:
  tRCD: 12
  tRAS: 30

controller:
  read_queue_size: 16
  write_queue_size: 16
  high_water_mark: 12
  low_water_mark: 4
  close_page: relaxed
  write_interrupt: pause

endurance:
  model: fixed
  write_pulse: 40
"#;

        let config = MemoryConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.simulation.clock_mhz, 666);
        assert_eq!(config.geometry.channels, 2);
        assert_eq!(config.timing.t_rcd, 12);
        assert_eq!(config.timing.t_ras, 30);
        // Unspecified timings keep defaults.
        assert_eq!(config.timing.t_rp, 10);
        assert_eq!(config.controller.high_water_mark(), 12);
        assert_eq!(config.controller.close_page, ClosePage::Relaxed);
        assert_eq!(config.controller.write_interrupt, WriteInterrupt::Pause);
        assert_eq!(config.endurance.model, EnduranceKind::Fixed);
    }

    #[test]
    fn test_json_parsing() {
        let json = r#"{
            "geometry": { "banks": 2, "ranks": 1 },
            "timing": { "tCAS": 7 },
            "controller": { "end_mode": { "custom": 3 } }
        }"#;

        let config = MemoryConfig::from_json(json).unwrap();
        assert_eq!(config.geometry.banks, 2);
        assert_eq!(config.timing.t_cas, 7);
        assert_eq!(config.controller.end_mode, EndMode::Custom(3));
    }

    #[test]
    fn test_builder() {
        let config = MemoryConfigBuilder::new()
            .organization(1, 1, 4)
            .rows_cols(256, 32)
            .queue_sizes(2, 4)
            .watermarks(3, 1)
            .close_page(ClosePage::Strict)
            .build()
            .unwrap();

        assert_eq!(config.geometry.banks, 4);
        assert_eq!(config.geometry.banks_per_refresh, 4);
        assert_eq!(config.controller.read_queue_size, 2);
        assert_eq!(config.controller.high_water_mark(), 3);
    }

    #[test]
    fn test_validation_watermarks() {
        let result = MemoryConfigBuilder::new()
            .queue_sizes(8, 8)
            .watermarks(9, 0)
            .build();
        assert!(matches!(result, Err(ConfigError::Validation(_))));

        let result = MemoryConfigBuilder::new()
            .queue_sizes(8, 8)
            .watermarks(4, 4)
            .build();
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_validation_zero_geometry() {
        let yaml = r#"
geometry:
  banks: 0
"#;
        assert!(MemoryConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_validation_bad_scheme() {
        let result = MemoryConfigBuilder::new().scheme("R:RK:XX:CH:C").build();
        assert!(matches!(result, Err(ConfigError::Address(_))));
    }

    #[test]
    fn test_validation_refresh_groups() {
        let result = MemoryConfigBuilder::new()
            .organization(1, 1, 8)
            .banks_per_refresh(3)
            .use_refresh(true)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_lookup() {
        let config = MemoryConfig::new();
        assert_eq!(config.lookup_u64("tRCD"), Some(10));
        assert_eq!(config.lookup_u64("read_queue_size"), Some(32));
        assert_eq!(config.lookup_u64("banks"), Some(8));
        assert!(config.lookup("NoSuchKey").is_none());
    }

    #[test]
    fn test_translator_from_config() {
        let config = MemoryConfigBuilder::new()
            .organization(2, 2, 4)
            .rows_cols(128, 16)
            .build()
            .unwrap();
        let translator = config.translator().unwrap();
        let a = translator.translate(0x1234 << 6);
        assert!(a.channel < 2 && a.rank < 2 && a.bank < 4 && a.row < 128 && a.col < 16);
        assert_eq!(translator.reverse_translate(&a), 0x1234 << 6);
    }

    #[test]
    fn test_unknown_format() {
        assert!(matches!(
            MemoryConfig::from_file("memory.toml"),
            Err(ConfigError::UnknownFormat(_))
        ));
    }

    #[test]
    fn test_serialization_roundtrip() {
        let config = MemoryConfigBuilder::new()
            .organization(1, 2, 4)
            .use_refresh(true)
            .build()
            .unwrap();

        let yaml = config.to_yaml().unwrap();
        let restored = MemoryConfig::from_yaml(&yaml).unwrap();

        assert_eq!(restored.geometry.ranks, 2);
        assert!(restored.controller.use_refresh);
        assert_eq!(restored.timing, config.timing);
    }
}
