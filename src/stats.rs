//! Statistics reports.
//!
//! Every component exports its counters as a `serde_json` tree. This module
//! flattens such a tree into dotted `name value` entries, the format memory
//! simulators traditionally print at the end of a run, and exports it as
//! text, CSV or JSON.

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;

/// One flattened statistic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatEntry {
    /// Dotted path, e.g. `channel0.rank0.bank1.reads`
    pub name: String,

    /// Rendered value
    pub value: String,
}

/// A flat statistics report.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsReport {
    /// Run name, printed as a header
    pub name: String,

    /// Entries in tree order
    pub entries: Vec<StatEntry>,
}

impl StatsReport {
    /// Creates an empty report.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the run name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Flattens a JSON tree. Nested objects join their keys with dots and
    /// arrays use the element index as key.
    pub fn from_json(tree: &serde_json::Value) -> Self {
        let mut report = Self::new();
        report.push_value("", tree);
        report
    }

    fn push_value(&mut self, prefix: &str, value: &serde_json::Value) {
        let join = |key: &str| {
            if prefix.is_empty() {
                key.to_string()
            } else {
                format!("{}.{}", prefix, key)
            }
        };

        match value {
            serde_json::Value::Object(map) => {
                for (key, child) in map {
                    self.push_value(&join(key), child);
                }
            }
            serde_json::Value::Array(items) => {
                for (index, child) in items.iter().enumerate() {
                    self.push_value(&join(&index.to_string()), child);
                }
            }
            serde_json::Value::Null => {}
            serde_json::Value::String(s) => self.push(prefix, s.clone()),
            other => self.push(prefix, other.to_string()),
        }
    }

    /// Appends an entry.
    pub fn push(&mut self, name: impl Into<String>, value: impl ToString) {
        self.entries.push(StatEntry {
            name: name.into(),
            value: value.to_string(),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up an entry by its full name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.value.as_str())
    }

    /// Looks up an entry and parses it as an integer.
    pub fn get_u64(&self, name: &str) -> Option<u64> {
        self.get(name).and_then(|value| value.parse().ok())
    }

    /// Returns the entries whose name starts with `prefix`.
    pub fn filter<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a StatEntry> + 'a {
        self.entries.iter().filter(move |entry| entry.name.starts_with(prefix))
    }

    /// Writes one `name value` line per entry.
    pub fn write_text<W: Write>(&self, mut w: W) -> std::io::Result<()> {
        if !self.name.is_empty() {
            writeln!(w, "# {}", self.name)?;
        }
        for entry in &self.entries {
            writeln!(w, "{} {}", entry.name, entry.value)?;
        }
        Ok(())
    }

    /// Renders the report as `name value` lines.
    pub fn to_text(&self) -> String {
        let mut buf = Vec::new();
        // Writing into a Vec cannot fail.
        let _ = self.write_text(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Renders the report as two-column CSV.
    pub fn to_csv(&self) -> String {
        let mut csv = String::from("metric,value\n");
        for entry in &self.entries {
            csv.push_str(&format!("{},{}\n", entry.name, entry.value));
        }
        csv
    }

    /// Exports the report to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn to_text_file<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        std::fs::write(path, self.to_text())
    }

    pub fn to_csv_file<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        std::fs::write(path, self.to_csv())
    }

    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let json = self
            .to_json()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, json)
    }
}

impl std::fmt::Display for StatsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_text())
    }
}

/// A simple timer for measuring wall-clock time.
#[derive(Debug)]
pub struct Timer {
    start: std::time::Instant,
}

impl Timer {
    /// Starts a new timer.
    pub fn start() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }

    /// Returns elapsed time in milliseconds.
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    /// Returns elapsed time in seconds.
    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::start()
    }
}

/// Wall-clock figures of a run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunTiming {
    /// Total wall-clock time in milliseconds
    pub wall_time_ms: f64,

    /// Simulated cycles
    pub cycles: u64,

    /// Simulated cycles per wall-clock second
    pub cycles_per_second: f64,
}

/// Collects the report and wall-clock timing of one run.
#[derive(Debug, Default)]
pub struct StatsCollector {
    name: String,
    timer: Option<Timer>,
    timing: RunTiming,
    report: StatsReport,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Starts timing.
    pub fn start(&mut self) {
        self.timer = Some(Timer::start());
    }

    /// Stops timing after `cycles` simulated cycles.
    pub fn stop(&mut self, cycles: u64) {
        self.timing.cycles = cycles;
        if let Some(timer) = self.timer.take() {
            self.timing.wall_time_ms = timer.elapsed_ms();
        }
        if self.timing.wall_time_ms > 0.0 {
            self.timing.cycles_per_second = cycles as f64 / (self.timing.wall_time_ms / 1000.0);
        }
    }

    /// Replaces the report with a flattened copy of `tree`.
    pub fn update_from_json(&mut self, tree: &serde_json::Value) {
        self.report = StatsReport::from_json(tree).with_name(self.name.clone());
    }

    pub fn timing(&self) -> &RunTiming {
        &self.timing
    }

    /// Returns the report with the wall-clock figures appended.
    pub fn report(&self) -> StatsReport {
        let mut report = self.report.clone().with_name(self.name.clone());
        report.push("sim.wall_time_ms", format!("{:.2}", self.timing.wall_time_ms));
        report.push("sim.cycles_per_second", format!("{:.2}", self.timing.cycles_per_second));
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> serde_json::Value {
        serde_json::json!({
            "cycles": 1000,
            "channel0": {
                "controller": { "mem_reads": 4, "average_latency": 31.5 },
                "rank0": { "bank1": { "reads": 10 } }
            },
            "ignored": null
        })
    }

    #[test]
    fn test_flatten_tree() {
        let report = StatsReport::from_json(&tree());

        assert_eq!(report.get_u64("cycles"), Some(1000));
        assert_eq!(report.get_u64("channel0.rank0.bank1.reads"), Some(10));
        assert_eq!(report.get("channel0.controller.average_latency"), Some("31.5"));
        assert_eq!(report.get("ignored"), None);
        assert_eq!(report.len(), 4);
    }

    #[test]
    fn test_text_lines() {
        let report = StatsReport::from_json(&tree()).with_name("run");
        let text = report.to_text();

        assert!(text.starts_with("# run\n"));
        assert!(text.contains("channel0.rank0.bank1.reads 10\n"));
    }

    #[test]
    fn test_csv_export() {
        let report = StatsReport::from_json(&tree());
        let csv = report.to_csv();

        assert!(csv.starts_with("metric,value\n"));
        assert!(csv.contains("channel0.controller.mem_reads,4\n"));
    }

    #[test]
    fn test_filter_prefix() {
        let report = StatsReport::from_json(&tree());
        let names: Vec<&str> = report.filter("channel0.controller").map(|e| e.name.as_str()).collect();
        assert_eq!(names.len(), 2);
    }

    #[test]
    fn test_arrays_indexed() {
        let report = StatsReport::from_json(&serde_json::json!({ "lanes": [3, 5] }));
        assert_eq!(report.get_u64("lanes.1"), Some(5));
    }

    #[test]
    fn test_timer() {
        let timer = Timer::start();
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(timer.elapsed_ms() >= 10.0);
    }

    #[test]
    fn test_stats_collector() {
        let mut collector = StatsCollector::new();
        collector.set_name("Test");
        collector.start();
        std::thread::sleep(std::time::Duration::from_millis(5));
        collector.stop(5000);
        collector.update_from_json(&tree());

        assert!(collector.timing().wall_time_ms >= 5.0);
        assert!(collector.timing().cycles_per_second > 0.0);

        let report = collector.report();
        assert_eq!(report.name, "Test");
        assert!(report.get("sim.wall_time_ms").is_some());
        assert_eq!(report.get_u64("cycles"), Some(1000));
    }
}
