mod error;
mod queue;
mod slots;
mod store;

pub use error::EngineError;
pub use store::{QueueStore, SharedCalendar, SharedQueue, SharedSlot, SlotStore};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::wal::Wal;

pub const DEFAULT_AVERAGE_SERVICE_MINUTES: u32 = 30;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit:
/// wait for one append, drain everything already queued behind it, then fsync once
/// and answer every sender in the batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    // Commit what we have before compaction or counters see the log.
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {} events: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let append_result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after an append error so half-buffered bytes don't leak into the next batch.
    let flush_result = wal.flush_sync();
    append_result.and(flush_result)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// Slot scheduler and queue scheduler over a shared, WAL-backed store.
///
/// Every mutation follows the same order: commit gate (shared) → entity lock → validate →
/// WAL append → apply → notify. The commit gate is taken exclusively only by compaction.
pub struct Engine {
    pub(super) slots: SlotStore,
    pub(super) queues: QueueStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) commit_gate: RwLock<()>,
    pub notify: Arc<NotifyHub>,
    average_service_minutes: u32,
}

/// Apply a slot status event to a slot row (caller holds the row lock).
fn apply_slot_event(slot: &mut Slot, event: &Event) {
    match event {
        Event::SlotBooked { customer_id, .. } => slot.book(*customer_id),
        Event::SlotHeld {
            customer_id,
            expires_at,
            ..
        } => slot.hold(*customer_id, *expires_at),
        Event::HoldReleased { .. } => slot.release(),
        _ => {}
    }
}

/// Apply a queue event to a provider's queue (caller holds the queue lock).
fn apply_queue_event(queue: &mut QueueState, event: &Event) {
    match event {
        Event::QueueJoined {
            id,
            provider_id,
            customer_id,
            at,
        } => {
            let position = queue.next_position();
            queue.push(QueueEntry {
                id: *id,
                provider_id: *provider_id,
                customer_id: *customer_id,
                position,
                status: QueueStatus::Waiting,
                created_at: *at,
                updated_at: *at,
            });
        }
        Event::QueueEntryClosed {
            id,
            status,
            promoted,
            at,
            ..
        } => {
            if let Some(index) = queue.index_of(*id) {
                queue.close(index, *status, *at);
            }
            if let Some(next) = promoted
                && let Some(index) = queue.index_of(*next)
            {
                queue.promote(index, *at);
            }
        }
        Event::QueueAdvanced { id, at, .. } => {
            if let Some(index) = queue.index_of(*id) {
                queue.promote(index, *at);
            }
        }
        Event::QueueEntryRestored(entry) => {
            if entry.status.is_terminal() {
                queue.history.push(entry.clone());
            } else {
                queue.active.push(entry.clone());
            }
        }
        _ => {}
    }
}

/// The provider whose queue a queue event touches.
fn queue_provider(event: &Event) -> Option<Ulid> {
    match event {
        Event::QueueJoined { provider_id, .. }
        | Event::QueueEntryClosed { provider_id, .. }
        | Event::QueueAdvanced { provider_id, .. } => Some(*provider_id),
        Event::QueueEntryRestored(entry) => Some(entry.provider_id),
        _ => None,
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            slots: SlotStore::new(),
            queues: QueueStore::new(),
            wal_tx,
            commit_gate: RwLock::new(()),
            notify,
            average_service_minutes: DEFAULT_AVERAGE_SERVICE_MINUTES,
        };

        for event in &events {
            engine.replay(event);
        }
        let active: usize = engine
            .queues
            .all()
            .iter()
            .filter_map(|shared| shared.try_read().ok().map(|q| q.active.len()))
            .sum();
        metrics::gauge!(observability::QUEUE_ACTIVE_ENTRIES).set(active as f64);

        if !events.is_empty() {
            info!(
                events = events.len(),
                slots = engine.slots.len(),
                providers = engine.queues.provider_ids().len(),
                "replayed WAL"
            );
        }

        Ok(engine)
    }

    pub fn with_average_service_minutes(mut self, minutes: u32) -> Self {
        self.average_service_minutes = minutes;
        self
    }

    pub fn average_service_minutes(&self) -> u32 {
        self.average_service_minutes
    }

    /// Rebuild in-memory state from one WAL record. We are the sole owner of every lock
    /// during replay, so try_write always succeeds. Never block here: replay may run
    /// inside an async context.
    fn replay(&self, event: &Event) {
        match event {
            Event::SlotsGenerated { provider_id, slots } => {
                let calendar = self.slots.calendar_or_default(*provider_id);
                let mut cal = calendar.try_write().expect("replay: uncontended write");
                self.slots.insert_generated(&mut cal, *provider_id, slots);
            }
            Event::SlotRestored(slot) => {
                let calendar = self.slots.calendar_or_default(slot.provider_id);
                let mut cal = calendar.try_write().expect("replay: uncontended write");
                self.slots.restore(&mut cal, slot.clone());
            }
            Event::SlotBooked { id, .. } | Event::SlotHeld { id, .. } | Event::HoldReleased { id } => {
                if let Some(shared) = self.slots.get(id) {
                    let mut slot = shared.try_write().expect("replay: uncontended write");
                    apply_slot_event(&mut slot, event);
                }
            }
            other => {
                if let Some(provider_id) = queue_provider(other) {
                    let shared = self.queues.get_or_create(provider_id);
                    let mut queue = shared.try_write().expect("replay: uncontended write");
                    apply_queue_event(&mut queue, other);
                }
            }
        }
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Durably commit a slot event, then apply it to the locked row.
    pub(super) async fn commit_slot(&self, slot: &mut Slot, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_slot_event(slot, event);
        Ok(())
    }

    /// Durably commit a queue event, then apply it to the locked queue.
    pub(super) async fn commit_queue(
        &self,
        queue: &mut QueueState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_queue_event(queue, event);
        Ok(())
    }

    /// Rewrite the WAL with just the records needed to rebuild the current state.
    /// Holds the commit gate exclusively so no mutation can land between snapshot and swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.commit_gate.write().await;

        let mut events = Vec::new();
        for shared in self.slots.all() {
            events.push(Event::SlotRestored(shared.read().await.clone()));
        }
        for shared in self.queues.all() {
            let queue = shared.read().await;
            for entry in queue.history.iter().chain(queue.active.iter()) {
                events.push(Event::QueueEntryRestored(entry.clone()));
            }
        }
        let records = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;

        metrics::counter!(observability::WAL_COMPACTIONS_TOTAL).increment(1);
        info!(records, "compacted WAL");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
