//! Tests for event ordering within one clock domain.
//!
//! These tests verify:
//! - Events fire in (cycle, priority, insertion) order
//! - Events inserted for the current cycle fire before the clock advances
//! - Removed events never fire
//! - Loop semantics at the loop boundary

use std::sync::Arc;

use parking_lot::Mutex;

use nvsim::address::Address;
use nvsim::event::{EventHandler, EventQueue, EventType, NullHandler};
use nvsim::request::Request;
use nvsim::types::{ComponentId, Cycle};

/// Records `(data, cycle)` for every fired cycle event.
#[derive(Default)]
struct Recorder {
    fired: Vec<(ComponentId, Cycle)>,
    responses: Vec<(u64, Cycle)>,
}

impl EventHandler for Recorder {
    fn cycle(&mut self, recipient: ComponentId, _steps: Cycle, queue: &mut EventQueue) {
        self.fired.push((recipient, queue.current_cycle()));
    }

    fn request_complete(&mut self, _recipient: ComponentId, request: Request, queue: &mut EventQueue) {
        self.responses.push((request.id, queue.current_cycle()));
    }
}

fn ext(id: u64) -> ComponentId {
    ComponentId::External(id)
}

// ============================================================================
// Ordering
// ============================================================================

#[test]
fn test_cycle_then_priority_order() {
    let mut queue = EventQueue::new();
    let mut recorder = Recorder::default();

    queue.insert_event(EventType::Cycle, ext(1), None, 5, 0, 1);
    queue.insert_event(EventType::Cycle, ext(2), None, 5, 0, 0);
    queue.insert_event(EventType::Cycle, ext(3), None, 3, 0, 0);

    queue.loop_steps(10, &mut recorder);

    assert_eq!(recorder.fired, vec![(ext(3), 3), (ext(2), 5), (ext(1), 5)]);
    assert_eq!(queue.current_cycle(), 10);
    assert!(queue.is_empty());
}

#[test]
fn test_equal_priority_keeps_insertion_order() {
    let mut queue = EventQueue::new();
    let mut recorder = Recorder::default();

    for id in 0..5 {
        queue.insert_event(EventType::Cycle, ext(id), None, 4, 0, 0);
    }
    queue.loop_steps(4, &mut recorder);

    let ids: Vec<ComponentId> = recorder.fired.iter().map(|(id, _)| *id).collect();
    assert_eq!(ids, (0..5).map(ext).collect::<Vec<_>>());
}

#[test]
fn test_responses_and_cycles_interleave_by_priority() {
    let mut queue = EventQueue::new();
    let mut recorder = Recorder::default();

    queue.insert_event(EventType::Cycle, ext(1), None, 2, 0, 1);
    queue.insert_response(ext(2), Request::read(9, Address::default()), 2);
    queue.loop_steps(2, &mut recorder);

    assert_eq!(recorder.responses, vec![(9, 2)]);
    assert_eq!(recorder.fired, vec![(ext(1), 2)]);
}

// ============================================================================
// Same-cycle delivery
// ============================================================================

#[test]
fn test_same_cycle_insertion_fires_before_advance() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut queue = EventQueue::new();

    let outer = log.clone();
    queue.insert_callback(3, 0, move |q| {
        outer.lock().push(("first", q.current_cycle()));
        let inner = outer.clone();
        let now = q.current_cycle();
        q.insert_callback(now, 0, move |q| inner.lock().push(("second", q.current_cycle())));
    });

    queue.loop_steps(3, &mut NullHandler);

    assert_eq!(*log.lock(), vec![("first", 3), ("second", 3)]);
    assert_eq!(queue.current_cycle(), 3);
}

#[test]
fn test_zero_step_loop_fires_current_cycle() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut queue = EventQueue::new();
    queue.loop_steps(6, &mut NullHandler);

    let seen = log.clone();
    queue.insert_callback(6, 0, move |q| seen.lock().push(q.current_cycle()));
    queue.loop_steps(0, &mut NullHandler);

    assert_eq!(*log.lock(), vec![6]);
}

#[test]
fn test_events_beyond_target_wait() {
    let mut queue = EventQueue::new();
    let mut recorder = Recorder::default();

    queue.insert_event(EventType::Cycle, ext(1), None, 11, 0, 0);
    queue.loop_steps(10, &mut recorder);
    assert!(recorder.fired.is_empty());
    assert_eq!(queue.next_event_cycle(), 11);

    queue.loop_steps(1, &mut recorder);
    assert_eq!(recorder.fired, vec![(ext(1), 11)]);
}

// ============================================================================
// Removal and monotonic time
// ============================================================================

#[test]
fn test_removed_event_never_fires() {
    let mut queue = EventQueue::new();
    let mut recorder = Recorder::default();

    let id = queue.insert_event(EventType::Cycle, ext(1), None, 4, 0, 0);
    queue.insert_event(EventType::Cycle, ext(2), None, 4, 0, 0);
    assert!(queue.remove_event(id, 4));
    assert!(!queue.remove_event(id, 4));

    queue.loop_steps(5, &mut recorder);
    assert_eq!(recorder.fired, vec![(ext(2), 4)]);
}

#[test]
fn test_clock_never_goes_back() {
    let mut queue = EventQueue::new();
    let mut recorder = Recorder::default();

    queue.loop_steps(20, &mut recorder);
    queue.insert_event(EventType::Cycle, ext(1), None, 5, 0, 0);
    queue.loop_steps(0, &mut recorder);

    assert_eq!(recorder.fired, vec![(ext(1), 20)]);
    assert_eq!(queue.stats().clamped, 1);

    let mut previous = 0;
    for when in [25, 22, 40, 31] {
        queue.insert_event(EventType::Cycle, ext(when), None, when, 0, 0);
    }
    while queue.loop_next(&mut recorder) {
        assert!(queue.current_cycle() >= previous);
        previous = queue.current_cycle();
    }
    assert_eq!(previous, 40);
}
