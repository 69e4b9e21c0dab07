use chrono::{NaiveDate, NaiveTime};
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_claimable, validate_candidate, validate_page};
use super::{Engine, EngineError};

impl Engine {
    /// Insert every candidate whose `(date, start, end)` is not already published
    /// for the provider. Validation covers the whole batch before anything is
    /// written and the insert is one WAL event, so a batch lands completely or
    /// not at all.
    pub async fn publish(
        &self,
        provider_id: Ulid,
        candidates: Vec<SlotCandidate>,
    ) -> Result<PublishOutcome, EngineError> {
        if candidates.len() > MAX_PUBLISH_BATCH {
            return Err(EngineError::LimitExceeded("publish batch too large"));
        }
        let now = self.now();
        for candidate in &candidates {
            validate_candidate(candidate, now)?;
        }
        if candidates.is_empty() {
            return Ok(PublishOutcome::default());
        }

        let txn = self.begin(provider_id).await;
        let mut fresh: Vec<Slot> = Vec::new();
        let mut outcome = PublishOutcome::default();
        for c in candidates {
            let duplicate = txn.has_window(c.date, c.start_time, c.end_time)
                || fresh
                    .iter()
                    .any(|s| s.same_window(c.date, c.start_time, c.end_time));
            if duplicate {
                outcome.skipped += 1;
                continue;
            }
            fresh.push(Slot {
                id: Ulid::new(),
                provider_id,
                date: c.date,
                start_time: c.start_time,
                end_time: c.end_time,
                status: c.status,
            });
            outcome.inserted += 1;
        }
        if txn.slots.len() + fresh.len() > MAX_SLOTS_PER_PROVIDER {
            return Err(EngineError::LimitExceeded("too many slots for provider"));
        }

        if !fresh.is_empty() {
            let event = Event::SlotsPublished {
                provider_id,
                slots: fresh,
            };
            self.commit(txn, event).await?;
        }
        metrics::counter!(crate::observability::SLOTS_INSERTED_TOTAL)
            .increment(outcome.inserted as u64);
        metrics::counter!(crate::observability::SLOTS_SKIPPED_TOTAL)
            .increment(outcome.skipped as u64);
        info!(
            "provider {provider_id}: published {} slots, skipped {}",
            outcome.inserted, outcome.skipped
        );
        Ok(outcome)
    }

    /// The first available slot whose window contains `date time`.
    ///
    /// A point-in-time read. Booking repeats the lookup inside its own
    /// transaction, so a result here is never a reservation.
    pub async fn find_available(
        &self,
        provider_id: Ulid,
        date: NaiveDate,
        time: NaiveTime,
    ) -> Option<Slot> {
        let shared = self.store.get_provider(&provider_id)?;
        let ps = shared.read().await;
        ps.covering(date.and_time(time))
            .find(|s| s.is_available())
            .cloned()
    }

    /// Mark a slot booked. Fails with `Conflict` unless it is currently available.
    pub async fn claim_slot(&self, slot_id: Ulid) -> Result<(), EngineError> {
        let txn = self.begin_for_slot(slot_id).await?;
        check_claimable(&txn, slot_id)?;
        let event = Event::SlotClaimed {
            id: slot_id,
            provider_id: txn.provider_id,
        };
        self.commit(txn, event).await?;
        Ok(())
    }

    /// Mark a slot available. Releasing an available slot is a no-op.
    pub async fn release_slot(&self, slot_id: Ulid) -> Result<(), EngineError> {
        let txn = self.begin_for_slot(slot_id).await?;
        let slot = txn
            .slot(slot_id)
            .ok_or(EngineError::NotFound("slot", slot_id))?;
        if slot.is_available() {
            return Ok(());
        }
        let event = Event::SlotReleased {
            id: slot_id,
            provider_id: txn.provider_id,
        };
        self.commit(txn, event).await?;
        Ok(())
    }

    /// Remove a slot owned by `owner`. Booked slots stay: deleting one would
    /// orphan the booking holding it.
    pub async fn remove_slot(&self, slot_id: Ulid, owner: Ulid) -> Result<(), EngineError> {
        let txn = self.begin_for_slot(slot_id).await?;
        if txn.provider_id != owner {
            return Err(EngineError::NotFound("slot", slot_id));
        }
        let slot = txn
            .slot(slot_id)
            .ok_or(EngineError::NotFound("slot", slot_id))?;
        if !slot.is_available() {
            return Err(EngineError::Forbidden(format!(
                "slot {slot_id} is booked and cannot be deleted"
            )));
        }
        let event = Event::SlotDeleted {
            id: slot_id,
            provider_id: owner,
        };
        self.commit(txn, event).await?;
        info!("provider {owner}: deleted slot {slot_id}");
        Ok(())
    }

    /// All of a provider's slots, ordered by date then start time.
    pub async fn list_availability(
        &self,
        provider_id: Ulid,
        page: usize,
        limit: usize,
    ) -> Result<Page<Slot>, EngineError> {
        validate_page(page, limit)?;
        if !self.directory.is_provider(&provider_id) {
            return Err(EngineError::NotFound("provider", provider_id));
        }
        let slots = match self.store.get_provider(&provider_id) {
            Some(shared) => shared.read().await.slots.clone(),
            None => Vec::new(),
        };
        Ok(Page::from_sorted(slots, page, limit))
    }

    /// Providers ordered by name, each with the slots still open for booking.
    pub async fn open_availability(
        &self,
        actor: &Identity,
        page: usize,
        limit: usize,
    ) -> Result<Page<ProviderAvailability>, EngineError> {
        if actor.role == Role::Provider {
            return Err(EngineError::Forbidden(
                "only admins and consumers can browse all availability".into(),
            ));
        }
        validate_page(page, limit)?;

        let mut providers = self.directory.members(Role::Provider);
        providers.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        let page_of_members = Page::from_sorted(providers, page, limit);

        let mut data = Vec::with_capacity(page_of_members.data.len());
        for member in page_of_members.data {
            let slots = match self.store.get_provider(&member.id) {
                Some(shared) => shared
                    .read()
                    .await
                    .slots
                    .iter()
                    .filter(|s| s.is_available())
                    .cloned()
                    .collect(),
                None => Vec::new(),
            };
            data.push(ProviderAvailability {
                provider_id: member.id,
                name: member.name,
                slots,
            });
        }

        Ok(Page {
            data,
            total: page_of_members.total,
            page: page_of_members.page,
            limit: page_of_members.limit,
            total_pages: page_of_members.total_pages,
        })
    }
}
