//! Performance benchmarks for the memory simulator.
//!
//! Run with: `cargo bench`
//! Or for specific bench: `cargo bench --bench memory_bench`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use nvsim::config::{EnduranceKind, MemoryConfig, WriteInterrupt};
use nvsim::event::{EventQueue, EventType, NullHandler};
use nvsim::request::OpType;
use nvsim::system::MemorySystem;
use nvsim::types::ComponentId;

/// Small linear congruential generator so runs are repeatable.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 17
    }
}

/// Feeds `count` random transactions into `memory`, retrying on back-pressure.
fn drive(memory: &mut MemorySystem, count: u64, write_ratio: u64, seed: u64) {
    let mut rng = Lcg(seed);
    let span = memory.translator().reverse_translate(&nvsim::address::Address::new(
        memory.channel_count() as u64 - 1,
        memory.config().geometry.ranks - 1,
        memory.config().geometry.banks - 1,
        memory.config().geometry.rows - 1,
        memory.config().geometry.cols - 1,
    ));

    for id in 0..count {
        let op = if rng.next() % 100 < write_ratio {
            OpType::Write
        } else {
            OpType::Read
        };
        let request = memory.request(id, op, rng.next() % span);
        while !memory.is_issuable(&request) {
            memory.cycle(1);
        }
        memory.issue_command(request);
    }
    memory.force_drain();
    let limit = memory.current_cycle() + 10_000_000;
    memory.run_until_idle(limit);
}

// ============================================================================
// Event queue
// ============================================================================

fn bench_event_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_queue");

    for num_events in [100, 1000, 10000].iter() {
        group.throughput(Throughput::Elements(*num_events as u64));
        group.bench_with_input(
            BenchmarkId::new("events", num_events),
            num_events,
            |b, &num_events| {
                b.iter(|| {
                    let mut queue = EventQueue::new();
                    let recipient = ComponentId::Controller { channel: 0 };
                    for i in 0..num_events as u64 {
                        queue.insert_event(EventType::Cycle, recipient, None, (i * 7) % 997, i, 0);
                    }
                    queue.loop_steps(1000, &mut NullHandler);
                    black_box(queue.current_cycle())
                });
            },
        );
    }

    group.finish();
}

// ============================================================================
// Full memory system
// ============================================================================

fn bench_random_traffic(c: &mut Criterion) {
    let mut group = c.benchmark_group("random_traffic");
    group.sample_size(20);

    for write_ratio in [0, 30, 70].iter() {
        group.throughput(Throughput::Elements(1000));
        group.bench_with_input(
            BenchmarkId::new("write_percent", write_ratio),
            write_ratio,
            |b, &write_ratio| {
                let config = MemoryConfig::builder()
                    .organization(2, 2, 8)
                    .build()
                    .unwrap();
                b.iter(|| {
                    let mut memory = MemorySystem::new(config.clone()).unwrap();
                    drive(&mut memory, 1000, write_ratio, 42);
                    black_box(memory.current_cycle())
                });
            },
        );
    }

    group.finish();
}

fn bench_nvm_write_pausing(c: &mut Criterion) {
    let mut group = c.benchmark_group("nvm_writes");
    group.sample_size(20);
    group.throughput(Throughput::Elements(1000));

    for (name, mode) in [("none", WriteInterrupt::None), ("pause", WriteInterrupt::Pause)] {
        let config = MemoryConfig::builder()
            .organization(1, 1, 8)
            .endurance(EnduranceKind::Fixed, 150, 0)
            .write_interrupt(mode, 4)
            .build()
            .unwrap();
        group.bench_function(name, |b| {
            b.iter(|| {
                let mut memory = MemorySystem::new(config.clone()).unwrap();
                drive(&mut memory, 1000, 40, 7);
                black_box(memory.current_cycle())
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_event_queue,
    bench_random_traffic,
    bench_nvm_write_pausing,
);

criterion_main!(benches);
