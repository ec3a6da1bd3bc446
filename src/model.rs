use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const DAY_MS: Ms = 86_400_000;

/// Start of the day that contains `t`.
pub fn day_start(t: Ms) -> Ms {
    t - t.rem_euclid(DAY_MS)
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// The calendar day containing `t`.
    pub fn day_of(t: Ms) -> Self {
        let start = day_start(t);
        Self::new(start, start + DAY_MS)
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }
}

// ── Slots ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlotStatus {
    Available,
    Booked,
    /// Temporary hold by a single customer, see `Slot::hold_expires_at`.
    Locked,
}

/// A bookable unit of a provider's calendar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: Ulid,
    pub provider_id: Ulid,
    pub span: Span,
    pub status: SlotStatus,
    /// Booking holder when BOOKED, hold owner when LOCKED.
    pub customer_id: Option<Ulid>,
    pub hold_expires_at: Option<Ms>,
    /// Bumped on every status change.
    pub version: u64,
}

impl Slot {
    pub fn new(id: Ulid, provider_id: Ulid, span: Span) -> Self {
        Self {
            id,
            provider_id,
            span,
            status: SlotStatus::Available,
            customer_id: None,
            hold_expires_at: None,
            version: 0,
        }
    }

    pub fn hold_expired(&self, now: Ms) -> bool {
        self.status == SlotStatus::Locked && self.hold_expires_at.is_some_and(|exp| exp <= now)
    }

    /// AVAILABLE, or LOCKED by a hold that has already run out.
    pub fn is_bookable(&self, now: Ms) -> bool {
        match self.status {
            SlotStatus::Available => true,
            SlotStatus::Locked => self.hold_expired(now),
            SlotStatus::Booked => false,
        }
    }

    pub fn book(&mut self, customer_id: Ulid) {
        self.status = SlotStatus::Booked;
        self.customer_id = Some(customer_id);
        self.hold_expires_at = None;
        self.version += 1;
    }

    pub fn hold(&mut self, customer_id: Ulid, expires_at: Ms) {
        self.status = SlotStatus::Locked;
        self.customer_id = Some(customer_id);
        self.hold_expires_at = Some(expires_at);
        self.version += 1;
    }

    pub fn release(&mut self) {
        self.status = SlotStatus::Available;
        self.customer_id = None;
        self.hold_expires_at = None;
        self.version += 1;
    }
}

/// Per-provider index of slot start times. Enforces one slot per (provider, start).
#[derive(Debug, Clone, Default)]
pub struct SlotCalendar {
    by_start: BTreeMap<Ms, Ulid>,
}

impl SlotCalendar {
    pub fn contains_start(&self, start: Ms) -> bool {
        self.by_start.contains_key(&start)
    }

    /// Returns false (and keeps the existing slot) if `start` is taken.
    pub fn insert(&mut self, start: Ms, slot_id: Ulid) -> bool {
        if self.by_start.contains_key(&start) {
            return false;
        }
        self.by_start.insert(start, slot_id);
        true
    }

    /// Ids of slots starting inside `span`, ordered by start.
    pub fn starting_in(&self, span: &Span) -> impl Iterator<Item = Ulid> + '_ {
        self.by_start.range(span.start..span.end).map(|(_, id)| *id)
    }
}

// ── Walk-in queue ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueStatus {
    Waiting,
    InProgress,
    Completed,
    NoShow,
    Cancelled,
}

impl QueueStatus {
    pub fn is_active(self) -> bool {
        matches!(self, QueueStatus::Waiting | QueueStatus::InProgress)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: Ulid,
    pub provider_id: Ulid,
    pub customer_id: Ulid,
    /// Dense 1..N among active entries. Terminal entries keep the position they left from.
    pub position: u32,
    pub status: QueueStatus,
    pub created_at: Ms,
    pub updated_at: Ms,
}

/// One provider's walk-in queue.
#[derive(Debug, Clone)]
pub struct QueueState {
    pub provider_id: Ulid,
    /// Active entries; the entry at index `i` holds position `i + 1`.
    pub active: Vec<QueueEntry>,
    /// Terminal entries in the order they left the queue.
    pub history: Vec<QueueEntry>,
}

impl QueueState {
    pub fn new(provider_id: Ulid) -> Self {
        Self {
            provider_id,
            active: Vec::new(),
            history: Vec::new(),
        }
    }

    pub fn next_position(&self) -> u32 {
        self.active.len() as u32 + 1
    }

    pub fn index_of(&self, entry_id: Ulid) -> Option<usize> {
        self.active.iter().position(|e| e.id == entry_id)
    }

    pub fn active_index_for(&self, customer_id: Ulid) -> Option<usize> {
        self.active.iter().position(|e| e.customer_id == customer_id)
    }

    pub fn active_for(&self, customer_id: Ulid) -> Option<&QueueEntry> {
        self.active.iter().find(|e| e.customer_id == customer_id)
    }

    pub fn in_progress_index(&self) -> Option<usize> {
        self.active
            .iter()
            .position(|e| e.status == QueueStatus::InProgress)
    }

    /// Lowest-position WAITING entry, ignoring `skip`.
    pub fn next_waiting(&self, skip: Option<Ulid>) -> Option<&QueueEntry> {
        self.active
            .iter()
            .filter(|e| Some(e.id) != skip)
            .find(|e| e.status == QueueStatus::Waiting)
    }

    pub fn push(&mut self, entry: QueueEntry) {
        debug_assert_eq!(entry.position, self.next_position());
        self.active.push(entry);
    }

    /// Move the entry at `index` to a terminal status and close the gap it leaves.
    pub fn close(&mut self, index: usize, status: QueueStatus, at: Ms) -> QueueEntry {
        debug_assert!(status.is_terminal());
        let mut entry = self.active.remove(index);
        entry.status = status;
        entry.updated_at = at;
        for later in &mut self.active[index..] {
            later.position -= 1;
            later.updated_at = at;
        }
        self.history.push(entry.clone());
        entry
    }

    pub fn promote(&mut self, index: usize, at: Ms) -> &QueueEntry {
        let entry = &mut self.active[index];
        entry.status = QueueStatus::InProgress;
        entry.updated_at = at;
        entry
    }

    /// WAITING entries strictly ahead of `position`.
    pub fn waiting_ahead(&self, position: u32) -> usize {
        self.active
            .iter()
            .take_while(|e| e.position < position)
            .filter(|e| e.status == QueueStatus::Waiting)
            .count()
    }
}

// ── WAL records ──────────────────────────────────────────────────

/// The event types, flat with no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SlotsGenerated {
        provider_id: Ulid,
        slots: Vec<(Ulid, Span)>,
    },
    SlotBooked {
        id: Ulid,
        customer_id: Ulid,
    },
    SlotHeld {
        id: Ulid,
        customer_id: Ulid,
        expires_at: Ms,
    },
    HoldReleased {
        id: Ulid,
    },
    QueueJoined {
        id: Ulid,
        provider_id: Ulid,
        customer_id: Ulid,
        at: Ms,
    },
    /// Terminal transition, renumbering and the promotion it triggers, as one record.
    QueueEntryClosed {
        id: Ulid,
        provider_id: Ulid,
        status: QueueStatus,
        promoted: Option<Ulid>,
        at: Ms,
    },
    QueueAdvanced {
        id: Ulid,
        provider_id: Ulid,
        at: Ms,
    },
    SlotRestored(Slot),
    QueueEntryRestored(QueueEntry),
}

// ── Change notifications ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueAction {
    Join,
    Cancel,
    Complete,
    NoShow,
    Advance,
}

impl QueueAction {
    pub fn label(self) -> &'static str {
        match self {
            QueueAction::Join => "join",
            QueueAction::Cancel => "cancel",
            QueueAction::Complete => "complete",
            QueueAction::NoShow => "no_show",
            QueueAction::Advance => "advance",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueChange {
    pub provider_id: Ulid,
    /// `None` for provider-wide changes.
    pub customer_id: Option<Ulid>,
    pub action: QueueAction,
    pub at: Ms,
}

/// A provider's whole active queue after a change, by position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub provider_id: Ulid,
    pub entries: Vec<QueueEntry>,
    pub at: Ms,
}
