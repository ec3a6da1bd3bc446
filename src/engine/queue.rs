use std::time::Instant;

use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::MAX_QUEUE_LEN;
use crate::model::*;
use crate::observability;

use super::{Engine, EngineError, now_ms};

/// The entry to promote once `leaving` is out of the chair: the lowest-position WAITING entry.
fn advance_target(queue: &QueueState, leaving: Option<Ulid>) -> Option<Ulid> {
    queue.next_waiting(leaving).map(|e| e.id)
}

impl Engine {
    fn announce(&self, provider_id: Ulid, customer_id: Ulid, action: QueueAction, at: Ms) {
        self.notify.send(&QueueChange {
            provider_id,
            customer_id: Some(customer_id),
            action,
            at,
        });
    }

    /// Push the whole active queue to the provider's queue topic. Caller holds the queue lock.
    fn publish_snapshot(&self, queue: &QueueState, at: Ms) {
        if !self.notify.wants_snapshot(queue.provider_id) {
            return;
        }
        self.notify.send_snapshot(&QueueSnapshot {
            provider_id: queue.provider_id,
            entries: queue.active.clone(),
            at,
        });
    }

    /// Add `customer_id` to the end of the provider's queue as WAITING.
    pub async fn join_queue(
        &self,
        provider_id: Ulid,
        customer_id: Ulid,
    ) -> Result<QueueEntry, EngineError> {
        let started = Instant::now();
        let result = self.join_queue_locked(provider_id, customer_id).await;
        observability::record_op(observability::QUEUE_OPS_TOTAL, "join", started, &result);
        result
    }

    async fn join_queue_locked(
        &self,
        provider_id: Ulid,
        customer_id: Ulid,
    ) -> Result<QueueEntry, EngineError> {
        let _commit = self.commit_gate.read().await;
        let shared = self.queues.get_or_create(provider_id);
        let mut queue = shared.write().await;

        if queue.active_for(customer_id).is_some() {
            return Err(EngineError::AlreadyQueued {
                provider_id,
                customer_id,
            });
        }
        if queue.active.len() >= MAX_QUEUE_LEN {
            return Err(EngineError::LimitExceeded("queue is full"));
        }

        let at = now_ms();
        let event = Event::QueueJoined {
            id: Ulid::new(),
            provider_id,
            customer_id,
            at,
        };
        self.commit_queue(&mut queue, &event).await?;
        let entry = queue
            .active
            .last()
            .cloned()
            .ok_or(EngineError::WalError("joined entry missing after apply".into()))?;

        metrics::gauge!(observability::QUEUE_ACTIVE_ENTRIES).increment(1.0);
        info!(%provider_id, %customer_id, position = entry.position, "joined queue");
        self.announce(provider_id, customer_id, QueueAction::Join, at);
        self.publish_snapshot(&queue, at);
        Ok(entry)
    }

    /// Leave the queue. Later entries move up by one; if the leaving customer was being
    /// served, the next waiting customer is called.
    pub async fn cancel(&self, provider_id: Ulid, customer_id: Ulid) -> Result<QueueEntry, EngineError> {
        let started = Instant::now();
        let result = self.cancel_locked(provider_id, customer_id).await;
        observability::record_op(observability::QUEUE_OPS_TOTAL, "cancel", started, &result);
        result
    }

    async fn cancel_locked(
        &self,
        provider_id: Ulid,
        customer_id: Ulid,
    ) -> Result<QueueEntry, EngineError> {
        let not_queued = EngineError::NotQueued {
            provider_id,
            customer_id,
        };
        let _commit = self.commit_gate.read().await;
        let shared = self.queues.get(&provider_id).ok_or(not_queued.clone())?;
        let mut queue = shared.write().await;
        let index = queue.active_index_for(customer_id).ok_or(not_queued)?;

        self.close_entry(&mut queue, index, QueueStatus::Cancelled, QueueAction::Cancel)
            .await
    }

    /// Finish the customer in the chair and call the next one.
    pub async fn complete_current_customer(&self, provider_id: Ulid) -> Result<QueueEntry, EngineError> {
        let started = Instant::now();
        let result = self
            .close_in_progress(provider_id, QueueStatus::Completed, QueueAction::Complete)
            .await;
        observability::record_op(observability::QUEUE_OPS_TOTAL, "complete", started, &result);
        result
    }

    /// The customer in the chair never showed up; call the next one.
    pub async fn mark_no_show(&self, provider_id: Ulid) -> Result<QueueEntry, EngineError> {
        let started = Instant::now();
        let result = self
            .close_in_progress(provider_id, QueueStatus::NoShow, QueueAction::NoShow)
            .await;
        observability::record_op(observability::QUEUE_OPS_TOTAL, "no_show", started, &result);
        result
    }

    async fn close_in_progress(
        &self,
        provider_id: Ulid,
        status: QueueStatus,
        action: QueueAction,
    ) -> Result<QueueEntry, EngineError> {
        let _commit = self.commit_gate.read().await;
        let shared = self
            .queues
            .get(&provider_id)
            .ok_or(EngineError::NoCustomerInProgress(provider_id))?;
        let mut queue = shared.write().await;
        let index = queue
            .in_progress_index()
            .ok_or(EngineError::NoCustomerInProgress(provider_id))?;

        self.close_entry(&mut queue, index, status, action).await
    }

    /// Terminal transition, renumbering and (if the chair frees up) advancement, committed
    /// as a single WAL record. Caller holds the queue lock.
    async fn close_entry(
        &self,
        queue: &mut QueueState,
        index: usize,
        status: QueueStatus,
        action: QueueAction,
    ) -> Result<QueueEntry, EngineError> {
        let leaving = &queue.active[index];
        let promoted = if leaving.status == QueueStatus::InProgress {
            advance_target(queue, Some(leaving.id))
        } else {
            None
        };

        let at = now_ms();
        let provider_id = queue.provider_id;
        let event = Event::QueueEntryClosed {
            id: leaving.id,
            provider_id,
            status,
            promoted,
            at,
        };
        self.commit_queue(queue, &event).await?;
        let closed = queue
            .history
            .last()
            .cloned()
            .ok_or(EngineError::WalError("closed entry missing after apply".into()))?;

        metrics::gauge!(observability::QUEUE_ACTIVE_ENTRIES).decrement(1.0);
        info!(
            %provider_id,
            customer_id = %closed.customer_id,
            status = ?status,
            left_from = closed.position,
            "left queue"
        );
        self.announce(provider_id, closed.customer_id, action, at);
        if let Some(next) = promoted {
            self.announce_advance(queue, next, at);
        }
        self.publish_snapshot(queue, at);
        Ok(closed)
    }

    fn announce_advance(&self, queue: &QueueState, promoted: Ulid, at: Ms) {
        if let Some(index) = queue.index_of(promoted) {
            let entry = &queue.active[index];
            debug!(provider_id = %queue.provider_id, customer_id = %entry.customer_id, "advanced queue");
            self.announce(queue.provider_id, entry.customer_id, QueueAction::Advance, at);
        }
    }

    /// Start serving when the chair is empty. `Ok(None)` if nobody is waiting.
    pub async fn call_next(&self, provider_id: Ulid) -> Result<Option<QueueEntry>, EngineError> {
        let started = Instant::now();
        let result = self.call_next_locked(provider_id).await;
        observability::record_op(observability::QUEUE_OPS_TOTAL, "call_next", started, &result);
        result
    }

    async fn call_next_locked(&self, provider_id: Ulid) -> Result<Option<QueueEntry>, EngineError> {
        let _commit = self.commit_gate.read().await;
        let Some(shared) = self.queues.get(&provider_id) else {
            return Ok(None);
        };
        let mut queue = shared.write().await;

        if let Some(index) = queue.in_progress_index() {
            return Err(EngineError::CustomerInProgress {
                provider_id,
                customer_id: queue.active[index].customer_id,
            });
        }
        let Some(next) = advance_target(&queue, None) else {
            return Ok(None);
        };

        let at = now_ms();
        let event = Event::QueueAdvanced {
            id: next,
            provider_id,
            at,
        };
        self.commit_queue(&mut queue, &event).await?;
        self.announce_advance(&queue, next, at);
        self.publish_snapshot(&queue, at);
        Ok(queue.index_of(next).map(|i| queue.active[i].clone()))
    }

    /// Active entries (WAITING and IN_PROGRESS), by position.
    pub async fn get_queue(&self, provider_id: Ulid) -> Vec<QueueEntry> {
        match self.queues.get(&provider_id) {
            Some(shared) => shared.read().await.active.clone(),
            None => Vec::new(),
        }
    }

    /// Entries that have left the queue, in the order they left.
    pub async fn get_queue_history(&self, provider_id: Ulid) -> Vec<QueueEntry> {
        match self.queues.get(&provider_id) {
            Some(shared) => shared.read().await.history.clone(),
            None => Vec::new(),
        }
    }

    pub async fn get_customer_position(
        &self,
        provider_id: Ulid,
        customer_id: Ulid,
    ) -> Result<QueueEntry, EngineError> {
        let not_queued = EngineError::NotQueued {
            provider_id,
            customer_id,
        };
        let shared = self.queues.get(&provider_id).ok_or(not_queued.clone())?;
        let queue = shared.read().await;
        queue.active_for(customer_id).cloned().ok_or(not_queued)
    }

    /// Minutes until the customer is likely called: WAITING entries ahead of them times the
    /// average service duration, saturating at `u32::MAX`. Ignores time left on the customer
    /// currently in the chair.
    pub async fn estimate_wait_time(&self, provider_id: Ulid, customer_id: Ulid) -> Result<u32, EngineError> {
        let not_queued = EngineError::NotQueued {
            provider_id,
            customer_id,
        };
        let shared = self.queues.get(&provider_id).ok_or(not_queued.clone())?;
        let queue = shared.read().await;
        let entry = queue.active_for(customer_id).ok_or(not_queued)?;
        let ahead = u32::try_from(queue.waiting_ahead(entry.position)).unwrap_or(u32::MAX);
        Ok(ahead.saturating_mul(self.average_service_minutes()))
    }
}
