//! Append-only event store with a bounded ring and a broadcast bus.
//!
//! Appends are atomic: the id is assigned and the entry pushed under one
//! lock, then fanned out to subscribers in insertion order. When the ring
//! is full the oldest entry is evicted silently; consumers that fall
//! behind resync with an id-range query.

use std::{collections::VecDeque, sync::Mutex};

use time::OffsetDateTime;
use tokio::sync::broadcast;

use crate::{
    events::{Event, EventPayload},
    types::{CycleIndex, EventId},
};

/// Capacity of the broadcast channel between the store and its
/// subscribers. Slow subscribers past this lag are disconnected.
const BUS_CAPACITY: usize = 256;

#[derive(Debug, Default, Clone, Copy)]
pub struct StoreCounters {
    /// Total events ever appended; monotone even across eviction.
    pub total_appended: u64,
    pub threats_detected: u64,
    pub actions_taken: u64,
}

struct StoreInner {
    ring: VecDeque<Event>,
    next_id: u64,
    counters: StoreCounters,
}

pub struct EventStore {
    inner: Mutex<StoreInner>,
    bus: broadcast::Sender<Event>,
    capacity: usize,
}

impl EventStore {
    pub fn new(capacity: usize) -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            inner: Mutex::new(StoreInner {
                ring: VecDeque::with_capacity(capacity.min(4096)),
                next_id: 1,
                counters: StoreCounters::default(),
            }),
            bus,
            capacity,
        }
    }

    /// Appends one event, assigning the next id, and broadcasts it.
    pub fn append(&self, cycle: CycleIndex, payload: EventPayload) -> Event {
        let event = {
            let mut inner = self.inner.lock().expect("event store poisoned");
            let event = Event {
                id: EventId::new(inner.next_id),
                timestamp: OffsetDateTime::now_utc(),
                cycle,
                payload,
            };
            inner.next_id += 1;
            inner.counters.total_appended += 1;
            if event.is_threat() {
                inner.counters.threats_detected += 1;
            }
            if event.is_action() {
                inner.counters.actions_taken += 1;
            }
            inner.ring.push_back(event.clone());
            while inner.ring.len() > self.capacity {
                inner.ring.pop_front();
            }
            event
        };
        // Nobody listening is fine; the store is the source of truth.
        let _ = self.bus.send(event.clone());
        event
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe()
    }

    pub fn counters(&self) -> StoreCounters {
        self.inner.lock().expect("event store poisoned").counters
    }

    /// Most recent `limit` events, newest first.
    pub fn recent(&self, limit: usize) -> Vec<Event> {
        let inner = self.inner.lock().expect("event store poisoned");
        inner.ring.iter().rev().take(limit).cloned().collect()
    }

    /// Events with `id >= from_id`, oldest first, capped at `limit`.
    ///
    /// O(log n + k): the start position is found by binary search over
    /// the id-ordered ring.
    pub fn range(&self, from_id: EventId, limit: usize) -> Vec<Event> {
        let inner = self.inner.lock().expect("event store poisoned");
        let ring = &inner.ring;
        let start = ring.partition_point(|event| event.id < from_id);
        ring.iter().skip(start).take(limit).cloned().collect()
    }

    /// Events at or after `cutoff` that match `predicate`, oldest first.
    pub fn since(
        &self,
        cutoff: OffsetDateTime,
        predicate: impl Fn(&Event) -> bool,
    ) -> Vec<Event> {
        let inner = self.inner.lock().expect("event store poisoned");
        inner
            .ring
            .iter()
            .filter(|event| event.timestamp >= cutoff && predicate(event))
            .cloned()
            .collect()
    }

    /// Most recent `limit` events matching `predicate`, newest first.
    pub fn recent_matching(
        &self,
        limit: usize,
        predicate: impl Fn(&Event) -> bool,
    ) -> Vec<Event> {
        let inner = self.inner.lock().expect("event store poisoned");
        inner
            .ring
            .iter()
            .rev()
            .filter(|event| predicate(event))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Newest event matching `predicate`, if any.
    pub fn latest_matching(&self, predicate: impl Fn(&Event) -> bool) -> Option<Event> {
        let inner = self.inner.lock().expect("event store poisoned");
        inner.ring.iter().rev().find(|event| predicate(event)).cloned()
    }
}
