//! Per-clock-domain event scheduling.
//!
//! An `EventQueue` holds events keyed by absolute cycle. `process()` fires
//! every event at the nearest pending cycle and recomputes the next one.
//! Events at the same cycle fire in ascending priority, then in insertion
//! order.
//!
//! The queue never calls back into the components it serves directly.
//! Instead, `process()` takes an `EventHandler` which routes each event to
//! its recipient, and hands the queue itself back so the recipient can
//! schedule follow-up events (including events for the very same cycle).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::request::Request;
use crate::types::{ComponentId, Cycle, EventId, NEVER};

/// Kind of action an event performs when it fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Unknown,
    /// Periodic cycle notification to the recipient
    Cycle,
    Idle,
    Request,
    /// Completion of the attached request
    Response,
    /// Generic callback
    Callback,
}

/// Closure run by a callback event.
pub type EventCallback = Box<dyn FnOnce(&mut EventQueue) + Send>;

/// A scheduled action.
pub struct Event {
    /// Assigned by the queue on insertion
    pub id: EventId,
    pub event_type: EventType,
    pub recipient: ComponentId,
    /// Request carried by `Response` events
    pub request: Option<Request>,
    /// Absolute cycle at which the event fires
    pub cycle: Cycle,
    /// Lower values fire first within a cycle
    pub priority: i32,
    /// Opaque user data
    pub data: u64,
    callback: Option<EventCallback>,
}

impl Event {
    /// Creates an event with priority 0 and no request.
    pub fn new(event_type: EventType, recipient: ComponentId, cycle: Cycle) -> Self {
        Self {
            id: 0,
            event_type,
            recipient,
            request: None,
            cycle,
            priority: 0,
            data: 0,
            callback: None,
        }
    }

    /// Creates a callback event.
    pub fn callback<F>(cycle: Cycle, f: F) -> Self
    where
        F: FnOnce(&mut EventQueue) + Send + 'static,
    {
        let mut event = Self::new(EventType::Callback, ComponentId::None, cycle);
        event.callback = Some(Box::new(f));
        event
    }

    /// Attaches a request.
    pub fn with_request(mut self, request: Request) -> Self {
        self.request = Some(request);
        self
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the user data.
    pub fn with_data(mut self, data: u64) -> Self {
        self.data = data;
        self
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.id)
            .field("event_type", &self.event_type)
            .field("recipient", &self.recipient)
            .field("request", &self.request.as_ref().map(|r| (r.id, r.op)))
            .field("cycle", &self.cycle)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Routes fired events to their recipients.
pub trait EventHandler {
    /// Called for `Cycle` events. `steps` is the number of cycles since the
    /// previous processed event cycle.
    fn cycle(&mut self, recipient: ComponentId, steps: Cycle, queue: &mut EventQueue);

    /// Called for `Response` events.
    fn request_complete(&mut self, recipient: ComponentId, request: Request, queue: &mut EventQueue);
}

/// Handler that ignores cycle and response events.
///
/// Useful for queues that only carry callbacks.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullHandler;

impl EventHandler for NullHandler {
    fn cycle(&mut self, _recipient: ComponentId, _steps: Cycle, _queue: &mut EventQueue) {}

    fn request_complete(&mut self, _recipient: ComponentId, _request: Request, _queue: &mut EventQueue) {}
}

/// Statistics collected by an event queue.
#[derive(Clone, Debug, Default)]
pub struct EventQueueStats {
    /// Events inserted
    pub inserted: u64,
    /// Events removed before firing
    pub removed: u64,
    /// Events fired
    pub fired: u64,
    /// Calls to `process()` that fired at least one event
    pub process_calls: u64,
    /// Events scheduled in the past and moved to the current cycle
    pub clamped: u64,
    /// Largest number of pending events
    pub peak_pending: usize,
}

/// Scheduler for a single clock domain.
pub struct EventQueue {
    events: BTreeMap<Cycle, Vec<Event>>,
    next_event_cycle: Cycle,
    last_event_cycle: Cycle,
    current_cycle: Cycle,
    next_id: EventId,
    pending: usize,
    stats: EventQueueStats,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventQueue")
            .field("current_cycle", &self.current_cycle)
            .field("next_event_cycle", &self.next_event_cycle)
            .field("pending", &self.pending)
            .finish()
    }
}

impl EventQueue {
    /// Creates an empty queue at cycle 0.
    pub fn new() -> Self {
        Self {
            events: BTreeMap::new(),
            next_event_cycle: NEVER,
            last_event_cycle: 0,
            current_cycle: 0,
            next_id: 1,
            pending: 0,
            stats: EventQueueStats::default(),
        }
    }

    /// Returns the current local cycle.
    pub fn current_cycle(&self) -> Cycle {
        self.current_cycle
    }

    /// Returns the nearest pending cycle, or `NEVER` when empty.
    pub fn next_event_cycle(&self) -> Cycle {
        self.next_event_cycle
    }

    /// Returns the cycle of the last processed event batch.
    pub fn last_event_cycle(&self) -> Cycle {
        self.last_event_cycle
    }

    /// Returns the number of pending events.
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Returns true if nothing is scheduled.
    pub fn is_empty(&self) -> bool {
        self.pending == 0
    }

    /// Returns the queue statistics.
    pub fn stats(&self) -> &EventQueueStats {
        &self.stats
    }

    /// Schedules an event and returns its id.
    ///
    /// Events in the past are moved to the current cycle.
    pub fn schedule(&mut self, mut event: Event) -> EventId {
        if event.cycle < self.current_cycle {
            tracing::warn!(
                "Event for {} scheduled at cycle {} which is before current cycle {}",
                event.recipient,
                event.cycle,
                self.current_cycle
            );
            event.cycle = self.current_cycle;
            self.stats.clamped += 1;
        }

        let id = self.next_id;
        self.next_id += 1;
        event.id = id;

        let cycle = event.cycle;
        let slot = self.events.entry(cycle).or_default();
        let position = slot.partition_point(|e| e.priority <= event.priority);
        slot.insert(position, event);

        if cycle < self.next_event_cycle {
            self.next_event_cycle = cycle;
        }

        self.pending += 1;
        self.stats.inserted += 1;
        self.stats.peak_pending = self.stats.peak_pending.max(self.pending);
        id
    }

    /// Schedules an event.
    ///
    /// # Arguments
    /// * `event_type` - What the event does when it fires
    /// * `recipient` - Component the event is routed to
    /// * `request` - Request carried by the event
    /// * `when` - Absolute cycle to fire at
    /// * `data` - Opaque user data
    /// * `priority` - Lower values fire first within a cycle
    pub fn insert_event(
        &mut self,
        event_type: EventType,
        recipient: ComponentId,
        request: Option<Request>,
        when: Cycle,
        data: u64,
        priority: i32,
    ) -> EventId {
        let mut event = Event::new(event_type, recipient, when)
            .with_priority(priority)
            .with_data(data);
        event.request = request;
        self.schedule(event)
    }

    /// Schedules a response event delivering `request` to `recipient`.
    pub fn insert_response(&mut self, recipient: ComponentId, request: Request, when: Cycle) -> EventId {
        self.schedule(Event::new(EventType::Response, recipient, when).with_request(request))
    }

    /// Schedules a generic callback.
    pub fn insert_callback<F>(&mut self, when: Cycle, priority: i32, f: F) -> EventId
    where
        F: FnOnce(&mut EventQueue) + Send + 'static,
    {
        self.schedule(Event::callback(when, f).with_priority(priority))
    }

    /// Cancels a scheduled event.
    ///
    /// Returns false if no event with that id is pending at `when`.
    pub fn remove_event(&mut self, id: EventId, when: Cycle) -> bool {
        let Some(slot) = self.events.get_mut(&when) else {
            return false;
        };
        let Some(position) = slot.iter().position(|e| e.id == id) else {
            return false;
        };

        slot.remove(position);
        if slot.is_empty() {
            self.events.remove(&when);
            if when == self.next_event_cycle {
                self.recompute_next();
            }
        }

        self.pending -= 1;
        self.stats.removed += 1;
        true
    }

    /// Finds a pending event by type and recipient at `when`.
    pub fn find_event(&self, event_type: EventType, recipient: ComponentId, when: Cycle) -> Option<EventId> {
        self.events.get(&when).and_then(|slot| {
            slot.iter()
                .find(|e| e.event_type == event_type && e.recipient == recipient)
                .map(|e| e.id)
        })
    }

    /// Returns true if an event with this id is pending at `when`.
    pub fn contains(&self, id: EventId, when: Cycle) -> bool {
        self.events
            .get(&when)
            .map_or(false, |slot| slot.iter().any(|e| e.id == id))
    }

    fn recompute_next(&mut self) {
        self.next_event_cycle = self.events.keys().next().copied().unwrap_or(NEVER);
    }

    /// Fires every event at the nearest pending cycle.
    ///
    /// Returns the number of events fired. Events the handler schedules for
    /// the same cycle are left for the next call.
    pub fn process<H: EventHandler + ?Sized>(&mut self, handler: &mut H) -> usize {
        let cycle = self.next_event_cycle;
        let Some(fired) = self.events.remove(&cycle) else {
            self.recompute_next();
            return 0;
        };

        self.pending -= fired.len();
        self.recompute_next();

        let steps = cycle.saturating_sub(self.last_event_cycle);
        let count = fired.len();

        for event in fired {
            self.stats.fired += 1;
            match event.event_type {
                EventType::Cycle => handler.cycle(event.recipient, steps, self),
                EventType::Response => match event.request {
                    Some(request) => handler.request_complete(event.recipient, request, self),
                    None => tracing::warn!(
                        "Response event for {} at cycle {} carries no request",
                        event.recipient,
                        cycle
                    ),
                },
                EventType::Callback => {
                    if let Some(callback) = event.callback {
                        callback(self);
                    }
                }
                EventType::Idle | EventType::Request | EventType::Unknown => {
                    tracing::trace!(
                        "Ignoring {:?} event for {} at cycle {}",
                        event.event_type,
                        event.recipient,
                        cycle
                    );
                }
            }
        }

        self.last_event_cycle = cycle;
        self.stats.process_calls += 1;
        count
    }

    /// Advances the local clock by `steps` cycles, firing events on the way.
    ///
    /// Events at the current cycle fire before the clock moves past it,
    /// including events inserted while that cycle is being processed.
    /// Events at the final cycle fire on arrival.
    pub fn loop_steps<H: EventHandler + ?Sized>(&mut self, steps: Cycle, handler: &mut H) {
        let target = self.current_cycle.saturating_add(steps);

        loop {
            while self.next_event_cycle == self.current_cycle {
                self.process(handler);
            }

            if self.current_cycle >= target {
                break;
            }

            self.current_cycle = self.next_event_cycle.min(target);
        }
    }

    /// Jumps to the next pending cycle and fires everything there.
    ///
    /// Returns false if the queue was empty.
    pub fn loop_next<H: EventHandler + ?Sized>(&mut self, handler: &mut H) -> bool {
        if self.next_event_cycle == NEVER {
            return false;
        }

        let steps = self.next_event_cycle.saturating_sub(self.current_cycle);
        self.loop_steps(steps, handler);
        true
    }

    /// Restores the clock from a checkpoint. Pending events are left untouched.
    pub(crate) fn restore_clock(&mut self, current: Cycle, last: Cycle) {
        self.current_cycle = current;
        self.last_event_cycle = last;
    }

    /// Exports statistics as JSON.
    pub fn export_stats(&self) -> serde_json::Value {
        serde_json::json!({
            "current_cycle": self.current_cycle,
            "pending": self.pending,
            "inserted": self.stats.inserted,
            "removed": self.stats.removed,
            "fired": self.stats.fired,
            "process_calls": self.stats.process_calls,
            "clamped": self.stats.clamped,
            "peak_pending": self.stats.peak_pending,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorder {
        fired: Vec<(ComponentId, Cycle)>,
        steps: Vec<Cycle>,
    }

    impl EventHandler for Recorder {
        fn cycle(&mut self, recipient: ComponentId, steps: Cycle, queue: &mut EventQueue) {
            self.fired.push((recipient, queue.current_cycle()));
            self.steps.push(steps);
        }

        fn request_complete(&mut self, recipient: ComponentId, request: Request, queue: &mut EventQueue) {
            self.fired.push((recipient, queue.current_cycle()));
            assert_eq!(request.id, 7);
        }
    }

    fn ext(id: u64) -> ComponentId {
        ComponentId::External(id)
    }

    #[test]
    fn test_insert_updates_next_cycle() {
        let mut queue = EventQueue::new();
        assert_eq!(queue.next_event_cycle(), NEVER);

        queue.insert_event(EventType::Cycle, ext(1), None, 10, 0, 0);
        assert_eq!(queue.next_event_cycle(), 10);
        queue.insert_event(EventType::Cycle, ext(1), None, 4, 0, 0);
        assert_eq!(queue.next_event_cycle(), 4);
        queue.insert_event(EventType::Cycle, ext(1), None, 8, 0, 0);
        assert_eq!(queue.next_event_cycle(), 4);
        assert_eq!(queue.pending(), 3);
    }

    #[test]
    fn test_remove_event() {
        let mut queue = EventQueue::new();
        let a = queue.insert_event(EventType::Cycle, ext(1), None, 3, 0, 0);
        let b = queue.insert_event(EventType::Cycle, ext(2), None, 6, 0, 0);

        assert!(!queue.remove_event(a, 6));
        assert!(queue.remove_event(a, 3));
        assert!(!queue.remove_event(a, 3));
        assert_eq!(queue.next_event_cycle(), 6);
        assert!(queue.remove_event(b, 6));
        assert_eq!(queue.next_event_cycle(), NEVER);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_process_fires_only_nearest_cycle() {
        let mut queue = EventQueue::new();
        let mut rec = Recorder::default();
        queue.insert_event(EventType::Cycle, ext(1), None, 5, 0, 0);
        queue.insert_event(EventType::Cycle, ext(2), None, 5, 0, 0);
        queue.insert_event(EventType::Cycle, ext(3), None, 9, 0, 0);

        assert_eq!(queue.process(&mut rec), 2);
        assert_eq!(queue.next_event_cycle(), 9);
        assert_eq!(rec.steps, vec![5, 5]);
        assert_eq!(queue.last_event_cycle(), 5);
    }

    #[test]
    fn test_priority_then_insertion_order() {
        let mut queue = EventQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (tag, priority) in [(1, 2), (2, 0), (3, 2), (4, -1), (5, 0)] {
            let order = order.clone();
            queue.insert_callback(1, priority, move |_| order.lock().push(tag));
        }

        queue.loop_steps(1, &mut NullHandler);
        assert_eq!(*order.lock(), vec![4, 2, 5, 1, 3]);
    }

    #[test]
    fn test_same_cycle_insertion_fires_next_process() {
        let mut queue = EventQueue::new();
        let hits = Arc::new(Mutex::new(Vec::new()));
        let inner = hits.clone();

        queue.insert_callback(0, 0, move |q| {
            inner.lock().push("first");
            let now = q.current_cycle();
            let again = inner.clone();
            q.insert_callback(now, 0, move |_| again.lock().push("second"));
        });

        queue.process(&mut NullHandler);
        assert_eq!(*hits.lock(), vec!["first"]);
        assert_eq!(queue.next_event_cycle(), 0);

        queue.process(&mut NullHandler);
        assert_eq!(*hits.lock(), vec!["first", "second"]);
    }

    #[test]
    fn test_loop_processes_exact_match_before_advancing() {
        let mut queue = EventQueue::new();
        let mut rec = Recorder::default();
        queue.insert_event(EventType::Cycle, ext(1), None, 0, 0, 0);
        queue.insert_event(EventType::Cycle, ext(2), None, 3, 0, 0);
        queue.insert_event(EventType::Cycle, ext(3), None, 12, 0, 0);

        queue.loop_steps(10, &mut rec);
        assert_eq!(queue.current_cycle(), 10);
        assert_eq!(rec.fired, vec![(ext(1), 0), (ext(2), 3)]);

        queue.loop_steps(2, &mut rec);
        assert_eq!(rec.fired.last(), Some(&(ext(3), 12)));
    }

    #[test]
    fn test_loop_next() {
        let mut queue = EventQueue::new();
        let mut rec = Recorder::default();
        assert!(!queue.loop_next(&mut rec));

        queue.insert_event(EventType::Cycle, ext(1), None, 42, 0, 0);
        assert!(queue.loop_next(&mut rec));
        assert_eq!(queue.current_cycle(), 42);
        assert_eq!(rec.fired, vec![(ext(1), 42)]);
    }

    #[test]
    fn test_response_carries_request() {
        let mut queue = EventQueue::new();
        let mut rec = Recorder::default();
        queue.insert_response(ext(9), Request::read(7, Address::default()), 2);
        queue.loop_steps(5, &mut rec);
        assert_eq!(rec.fired, vec![(ext(9), 2)]);
    }

    #[test]
    fn test_past_event_is_clamped() {
        let mut queue = EventQueue::new();
        queue.loop_steps(20, &mut NullHandler);
        queue.insert_event(EventType::Cycle, ext(1), None, 5, 0, 0);

        assert_eq!(queue.next_event_cycle(), 20);
        assert_eq!(queue.stats().clamped, 1);
    }

    #[test]
    fn test_find_event() {
        let mut queue = EventQueue::new();
        let id = queue.insert_event(EventType::Response, ext(4), None, 7, 0, 0);
        assert_eq!(queue.find_event(EventType::Response, ext(4), 7), Some(id));
        assert_eq!(queue.find_event(EventType::Cycle, ext(4), 7), None);
        assert!(queue.contains(id, 7));
    }

    #[test]
    fn test_export_stats() {
        let mut queue = EventQueue::new();
        queue.insert_event(EventType::Idle, ext(1), None, 1, 0, 0);
        queue.loop_steps(1, &mut NullHandler);

        let stats = queue.export_stats();
        assert_eq!(stats["inserted"], 1);
        assert_eq!(stats["fired"], 1);
        assert_eq!(stats["current_cycle"], 1);
    }
}
