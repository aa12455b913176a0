//! Tests for running memory systems in several clock domains.
//!
//! These tests verify:
//! - Domains at different frequencies complete work in global time order
//! - No domain is advanced past an earlier pending event
//! - Idle detection across domains

use std::sync::Arc;

use parking_lot::Mutex;

use nvsim::address::Address;
use nvsim::config::MemoryConfig;
use nvsim::engine::{ClockedSystem, EngineError, GlobalEventQueue};
use nvsim::request::Request;
use nvsim::system::MemorySystem;
use nvsim::types::Cycle;

type Log = Arc<Mutex<Vec<(&'static str, Cycle)>>>;

fn memory() -> MemorySystem {
    let config = MemoryConfig::builder().organization(1, 1, 4).build().unwrap();
    MemorySystem::new(config).unwrap()
}

fn logged_read(memory: &mut MemorySystem, name: &'static str, id: u64, log: &Log) {
    let log = log.clone();
    let request = Request::read(id, Address::new(0, 0, 0, 1, 0))
        .with_completion(move |r| log.lock().push((name, r.completion_cycle)));
    assert!(memory.issue_command(request));
}

#[test]
fn test_faster_domain_finishes_first() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));

    let mut fast = memory();
    let mut slow = memory();
    logged_read(&mut fast, "fast", 1, &log);
    logged_read(&mut slow, "slow", 2, &log);

    let mut global = GlobalEventQueue::new(800);
    global.add_domain("slow", 200, Box::new(slow)).unwrap();
    global.add_domain("fast", 400, Box::new(fast)).unwrap();

    assert!(global.run_until_idle(1_000_000));

    let log = log.lock();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].0, "fast");
    assert_eq!(log[1].0, "slow");
    // Same local latency in both domains.
    assert_eq!(log[0].1, log[1].1);

    // The slow domain's completion lies twice as far out on the global clock.
    let latency = log[0].1;
    assert_eq!(global.to_global(latency, 400) * 2, global.to_global(latency, 200));
}

#[test]
fn test_domains_never_overshoot() {
    let mut a = memory();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    logged_read(&mut a, "a", 1, &log);

    let mut global = GlobalEventQueue::new(300);
    global.add_domain("a", 100, Box::new(a)).unwrap();
    global.add_domain("b", 300, Box::new(memory())).unwrap();

    let mut previous = 0;
    while let Some(next) = global.next_event_cycle() {
        let domain = global.domain(0).unwrap();
        let local = domain.event_queue().current_cycle();
        assert!(global.to_global(local, 100) <= next);

        global.cycle(next.saturating_sub(global.current_cycle()) + 1);
        assert!(global.current_cycle() > previous);
        previous = global.current_cycle();
    }
    assert_eq!(log.lock().len(), 1);
}

#[test]
fn test_memory_domain_rejects_faster_clock() {
    let mut global = GlobalEventQueue::new(100);
    assert!(matches!(
        global.add_domain("memory", 400, Box::new(memory())),
        Err(EngineError::FasterThanGlobal { .. })
    ));
}

#[test]
fn test_domain_stats_exported() {
    let mut a = memory();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    logged_read(&mut a, "a", 1, &log);

    let mut global = GlobalEventQueue::new(400);
    global.add_domain("memory", 400, Box::new(a)).unwrap();
    assert!(global.run_until_idle(100_000));

    let stats = global.export_stats();
    assert_eq!(stats["domains"]["memory"]["frequency"], 400);
    assert_eq!(
        stats["domains"]["memory"]["channel0"]["controller"]["completed_reads"],
        1
    );

    let domain = global.domain(0).unwrap();
    assert_eq!(domain.export_stats()["channel0"]["controller"]["mem_reads"], 1);
}
