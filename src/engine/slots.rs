use std::time::Instant;

use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::{Engine, EngineError, now_ms};

fn validate_window(start: Ms, end: Ms) -> Result<(), EngineError> {
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if end < start {
        return Err(EngineError::InvalidRange("end is before start"));
    }
    if end - start > MAX_GENERATE_WINDOW_MS {
        return Err(EngineError::LimitExceeded("generation window too wide"));
    }
    Ok(())
}

impl Engine {
    /// Create consecutive `duration_minutes` slots covering `[start, end]`. The last slot may
    /// end exactly at `end`; a shorter tail is not created. Start times the provider already
    /// has are skipped, so overlapping calls are idempotent. Returns only the new slots.
    pub async fn generate_slots(
        &self,
        provider_id: Ulid,
        start: Ms,
        end: Ms,
        duration_minutes: u32,
    ) -> Result<Vec<Slot>, EngineError> {
        let started = Instant::now();
        let result = self
            .generate_slots_locked(provider_id, start, end, duration_minutes)
            .await;
        observability::record_op(observability::SLOT_OPS_TOTAL, "generate", started, &result);
        result
    }

    async fn generate_slots_locked(
        &self,
        provider_id: Ulid,
        start: Ms,
        end: Ms,
        duration_minutes: u32,
    ) -> Result<Vec<Slot>, EngineError> {
        if duration_minutes == 0 {
            return Err(EngineError::InvalidRange("slot duration must be positive"));
        }
        if duration_minutes > MAX_SLOT_DURATION_MINUTES {
            return Err(EngineError::LimitExceeded("slot duration too long"));
        }
        validate_window(start, end)?;
        let duration = Ms::from(duration_minutes) * MINUTE_MS;
        if ((end - start) / duration) as usize > MAX_SLOTS_PER_GENERATE {
            return Err(EngineError::LimitExceeded("too many slots in one generation"));
        }

        let _commit = self.commit_gate.read().await;
        let calendar = self.slots.calendar_or_default(provider_id);
        let mut cal = calendar.write().await;

        let mut fresh = Vec::new();
        let mut current = start;
        while current + duration <= end {
            if !cal.contains_start(current) {
                fresh.push((Ulid::new(), Span::new(current, current + duration)));
            }
            current += duration;
        }
        if fresh.is_empty() {
            debug!(%provider_id, "slot generation found nothing new");
            return Ok(Vec::new());
        }

        let event = Event::SlotsGenerated {
            provider_id,
            slots: fresh.clone(),
        };
        self.wal_append(&event).await?;
        let created = self.slots.insert_generated(&mut cal, provider_id, &fresh);

        metrics::counter!(observability::SLOTS_GENERATED_TOTAL).increment(created.len() as u64);
        info!(%provider_id, created = created.len(), "generated slots");
        Ok(created)
    }

    /// Book a slot for `customer_id`. The slot row stays write-locked from the status check
    /// through the commit, so of any number of concurrent callers exactly one succeeds.
    pub async fn book_slot(&self, slot_id: Ulid, customer_id: Ulid) -> Result<Slot, EngineError> {
        let started = Instant::now();
        let result = self.book_slot_locked(slot_id, customer_id).await;
        observability::record_op(observability::SLOT_OPS_TOTAL, "book", started, &result);
        result
    }

    async fn book_slot_locked(&self, slot_id: Ulid, customer_id: Ulid) -> Result<Slot, EngineError> {
        let _commit = self.commit_gate.read().await;
        let shared = self
            .slots
            .get(&slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;
        let mut slot = shared.write().await;

        let own_hold = slot.status == SlotStatus::Locked && slot.customer_id == Some(customer_id);
        if !own_hold && !slot.is_bookable(now_ms()) {
            debug!(%slot_id, %customer_id, status = ?slot.status, "slot unavailable");
            return Err(EngineError::SlotUnavailable(slot_id));
        }

        let event = Event::SlotBooked { id: slot_id, customer_id };
        self.commit_slot(&mut slot, &event).await?;
        info!(%slot_id, %customer_id, provider_id = %slot.provider_id, "slot booked");
        Ok(slot.clone())
    }

    /// Put a time-boxed hold on an available slot. The caller chooses the hold length.
    pub async fn hold_slot(
        &self,
        slot_id: Ulid,
        customer_id: Ulid,
        ttl_ms: Ms,
    ) -> Result<Slot, EngineError> {
        let started = Instant::now();
        let result = self.hold_slot_locked(slot_id, customer_id, ttl_ms).await;
        observability::record_op(observability::SLOT_OPS_TOTAL, "hold", started, &result);
        result
    }

    async fn hold_slot_locked(
        &self,
        slot_id: Ulid,
        customer_id: Ulid,
        ttl_ms: Ms,
    ) -> Result<Slot, EngineError> {
        if ttl_ms <= 0 {
            return Err(EngineError::InvalidRange("hold ttl must be positive"));
        }
        if ttl_ms > MAX_HOLD_TTL_MS {
            return Err(EngineError::LimitExceeded("hold ttl too long"));
        }

        let _commit = self.commit_gate.read().await;
        let shared = self
            .slots
            .get(&slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;
        let mut slot = shared.write().await;

        let now = now_ms();
        let own_hold = slot.status == SlotStatus::Locked && slot.customer_id == Some(customer_id);
        if !own_hold && !slot.is_bookable(now) {
            return Err(EngineError::SlotUnavailable(slot_id));
        }

        let event = Event::SlotHeld {
            id: slot_id,
            customer_id,
            expires_at: now + ttl_ms,
        };
        self.commit_slot(&mut slot, &event).await?;
        debug!(%slot_id, %customer_id, ttl_ms, "slot held");
        Ok(slot.clone())
    }

    /// Turn the customer's own, still-valid hold into a booking.
    pub async fn confirm_hold(&self, slot_id: Ulid, customer_id: Ulid) -> Result<Slot, EngineError> {
        let started = Instant::now();
        let result = self.confirm_hold_locked(slot_id, customer_id).await;
        observability::record_op(observability::SLOT_OPS_TOTAL, "confirm", started, &result);
        result
    }

    async fn confirm_hold_locked(&self, slot_id: Ulid, customer_id: Ulid) -> Result<Slot, EngineError> {
        let _commit = self.commit_gate.read().await;
        let shared = self
            .slots
            .get(&slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;
        let mut slot = shared.write().await;

        if slot.status != SlotStatus::Locked {
            return Err(EngineError::NotHeld(slot_id));
        }
        if slot.customer_id != Some(customer_id) {
            return Err(EngineError::HoldNotOwned(slot_id));
        }
        if slot.hold_expired(now_ms()) {
            return Err(EngineError::HoldExpired {
                slot_id,
                expired_at: slot.hold_expires_at.unwrap_or_default(),
            });
        }

        let event = Event::SlotBooked { id: slot_id, customer_id };
        self.commit_slot(&mut slot, &event).await?;
        info!(%slot_id, %customer_id, "hold confirmed");
        Ok(slot.clone())
    }

    /// Drop a hold, returning the slot to AVAILABLE.
    pub async fn release_hold(&self, slot_id: Ulid) -> Result<Slot, EngineError> {
        self.release_hold_where(slot_id, |_| true).await
    }

    /// Release the hold only if it had run out by `now`. Used by the reaper, which may race
    /// a confirm or a fresh hold on the same slot.
    pub async fn expire_hold(&self, slot_id: Ulid, now: Ms) -> Result<Slot, EngineError> {
        self.release_hold_where(slot_id, |slot| slot.hold_expired(now))
            .await
    }

    async fn release_hold_where(
        &self,
        slot_id: Ulid,
        releasable: impl Fn(&Slot) -> bool,
    ) -> Result<Slot, EngineError> {
        let _commit = self.commit_gate.read().await;
        let shared = self
            .slots
            .get(&slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;
        let mut slot = shared.write().await;

        if slot.status != SlotStatus::Locked || !releasable(&*slot) {
            return Err(EngineError::NotHeld(slot_id));
        }

        let event = Event::HoldReleased { id: slot_id };
        self.commit_slot(&mut slot, &event).await?;
        debug!(%slot_id, "hold released");
        Ok(slot.clone())
    }

    /// Ids of LOCKED slots whose hold expired at or before `now`. Rows currently locked
    /// for writing are skipped and picked up on the next pass.
    pub fn collect_expired_holds(&self, now: Ms) -> Vec<Ulid> {
        self.slots
            .all()
            .into_iter()
            .filter_map(|shared| {
                let slot = shared.try_read().ok()?;
                slot.hold_expired(now).then_some(slot.id)
            })
            .collect()
    }

    pub async fn get_slot(&self, slot_id: Ulid) -> Result<Slot, EngineError> {
        let shared = self
            .slots
            .get(&slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;
        let slot = shared.read().await;
        Ok(slot.clone())
    }

    /// All of the provider's slots starting on the day containing `day`, any status,
    /// ordered by start time.
    pub async fn get_available_slots(&self, provider_id: Ulid, day: Ms) -> Vec<Slot> {
        let Some(calendar) = self.slots.calendar(&provider_id) else {
            return Vec::new();
        };
        let ids: Vec<Ulid> = calendar
            .read()
            .await
            .starting_in(&Span::day_of(day))
            .collect();

        let mut slots = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(shared) = self.slots.get(&id) {
                slots.push(shared.read().await.clone());
            }
        }
        slots
    }
}
