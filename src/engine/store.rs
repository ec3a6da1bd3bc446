use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

pub type SharedSlot = Arc<RwLock<Slot>>;
pub type SharedCalendar = Arc<RwLock<SlotCalendar>>;
pub type SharedQueue = Arc<RwLock<QueueState>>;

/// Slot records keyed by id, each behind its own lock, plus per-provider start-time calendars.
///
/// Booking only ever locks a single slot row. Calendars are locked by generation and day
/// listings, never by booking.
pub struct SlotStore {
    slots: DashMap<Ulid, SharedSlot>,
    calendars: DashMap<Ulid, SharedCalendar>,
}

impl Default for SlotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotStore {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            calendars: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, id: &Ulid) -> Option<SharedSlot> {
        self.slots.get(id).map(|e| e.value().clone())
    }

    pub fn all(&self) -> Vec<SharedSlot> {
        self.slots.iter().map(|e| e.value().clone()).collect()
    }

    pub fn calendar(&self, provider_id: &Ulid) -> Option<SharedCalendar> {
        self.calendars.get(provider_id).map(|e| e.value().clone())
    }

    pub fn calendar_or_default(&self, provider_id: Ulid) -> SharedCalendar {
        self.calendars
            .entry(provider_id)
            .or_default()
            .value()
            .clone()
    }

    /// Register slots for `provider_id`, skipping any whose start time is already taken.
    /// The caller holds the provider's calendar lock. Returns the slots actually added.
    pub fn insert_generated(
        &self,
        calendar: &mut SlotCalendar,
        provider_id: Ulid,
        slots: &[(Ulid, Span)],
    ) -> Vec<Slot> {
        let mut created = Vec::with_capacity(slots.len());
        for &(id, span) in slots {
            if !calendar.insert(span.start, id) {
                continue;
            }
            let slot = Slot::new(id, provider_id, span);
            self.slots.insert(id, Arc::new(RwLock::new(slot.clone())));
            created.push(slot);
        }
        created
    }

    /// Re-insert a slot from a compacted snapshot.
    pub fn restore(&self, calendar: &mut SlotCalendar, slot: Slot) {
        if calendar.insert(slot.span.start, slot.id) {
            self.slots.insert(slot.id, Arc::new(RwLock::new(slot)));
        }
    }
}

/// One queue per provider, each behind its own lock. Providers never contend with each other.
pub struct QueueStore {
    queues: DashMap<Ulid, SharedQueue>,
}

impl Default for QueueStore {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueStore {
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
        }
    }

    pub fn get(&self, provider_id: &Ulid) -> Option<SharedQueue> {
        self.queues.get(provider_id).map(|e| e.value().clone())
    }

    pub fn get_or_create(&self, provider_id: Ulid) -> SharedQueue {
        self.queues
            .entry(provider_id)
            .or_insert_with(|| Arc::new(RwLock::new(QueueState::new(provider_id))))
            .value()
            .clone()
    }

    pub fn all(&self) -> Vec<SharedQueue> {
        self.queues.iter().map(|e| e.value().clone()).collect()
    }

    pub fn provider_ids(&self) -> Vec<Ulid> {
        self.queues.iter().map(|e| *e.key()).collect()
    }
}
