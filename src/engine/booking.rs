use std::time::Instant;

use chrono::NaiveDateTime;
use tracing::info;
use ulid::Ulid;

use crate::clock::truncate_subsec;
use crate::model::*;
use crate::observability;

use super::conflict::{check_claimable, check_no_conflict, find_claimable, validate_notes, validate_page};
use super::{Engine, EngineError};

impl Engine {
    /// Reserve the provider's slot covering `date_time` for `consumer_id`.
    ///
    /// Finding the slot, checking existing bookings, claiming the slot and
    /// inserting the booking all happen under the provider's write lock and land
    /// as a single `BookingCreated` event.
    pub async fn book(
        &self,
        consumer_id: Ulid,
        provider_id: Ulid,
        date_time: NaiveDateTime,
        notes: Option<String>,
    ) -> Result<Booking, EngineError> {
        let date_time = truncate_subsec(date_time);
        if date_time <= self.now() {
            return Err(EngineError::Validation(format!(
                "booking time {date_time} is not in the future"
            )));
        }
        validate_notes(&notes)?;
        if !self.directory.is_provider(&provider_id) {
            return Err(EngineError::NotFound("provider", provider_id));
        }

        let txn = self.begin(provider_id).await;
        let slot_id = find_claimable(&txn, date_time)?.id;
        check_no_conflict(&txn, slot_id, date_time, None)?;
        check_claimable(&txn, slot_id)?;

        let booking = Booking {
            id: Ulid::new(),
            consumer_id,
            provider_id,
            slot_id,
            date_time,
            notes,
            status: BookingStatus::Pending,
        };
        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        drop(self.commit(txn, event).await?);

        info!(
            "booking {} created: consumer {consumer_id} with provider {provider_id} at {date_time}",
            booking.id
        );
        let consumer_name = self
            .directory
            .lookup(&consumer_id)
            .map(|m| m.name)
            .unwrap_or_else(|| consumer_id.to_string());
        self.notify_member(
            &provider_id,
            "New booking",
            format!(
                "{consumer_name} booked {}.",
                date_time.format("%Y-%m-%d %H:%M")
            ),
        );
        Ok(booking)
    }

    /// Book on behalf of an authenticated consumer.
    pub async fn create_booking(
        &self,
        actor: &Identity,
        provider_id: Ulid,
        date_time: NaiveDateTime,
        notes: Option<String>,
    ) -> Result<Booking, EngineError> {
        let started = Instant::now();
        let result = if actor.role != Role::Consumer {
            Err(EngineError::Forbidden(format!(
                "a {} cannot create bookings",
                actor.role
            )))
        } else {
            self.book(actor.id, provider_id, date_time, notes).await
        };
        observability::record("create_booking", started, &result);
        result
    }

    /// The actor's own bookings, newest first. Consumers see what they booked,
    /// providers what they serve.
    pub async fn list_bookings(
        &self,
        actor: &Identity,
        page: usize,
        limit: usize,
    ) -> Result<Page<Booking>, EngineError> {
        validate_page(page, limit)?;
        let mut bookings = match actor.role {
            Role::Consumer => self.consumer_bookings(actor.id).await,
            Role::Provider => match self.store.get_provider(&actor.id) {
                Some(shared) => shared.read().await.bookings.clone(),
                None => Vec::new(),
            },
            Role::Admin => {
                return Err(EngineError::Forbidden(
                    "admins list bookings through list_all_bookings".into(),
                ));
            }
        };
        sort_newest_first(&mut bookings);
        Ok(Page::from_sorted(bookings, page, limit))
    }

    /// Every booking in the ledger, newest first. Admin only.
    pub async fn list_all_bookings(
        &self,
        actor: &Identity,
        page: usize,
        limit: usize,
    ) -> Result<Page<Booking>, EngineError> {
        if actor.role != Role::Admin {
            return Err(EngineError::Forbidden(
                "only admins can list every booking".into(),
            ));
        }
        validate_page(page, limit)?;
        let mut bookings = self.all_bookings().await;
        sort_newest_first(&mut bookings);
        Ok(Page::from_sorted(bookings, page, limit))
    }

    async fn consumer_bookings(&self, consumer_id: Ulid) -> Vec<Booking> {
        let mut out = Vec::new();
        for booking_id in self.store.bookings_of_consumer(&consumer_id) {
            let Some(provider_id) = self.store.provider_for_booking(&booking_id) else {
                continue;
            };
            let Some(shared) = self.store.get_provider(&provider_id) else {
                continue;
            };
            if let Some(b) = shared.read().await.booking(booking_id) {
                out.push(b.clone());
            }
        }
        out
    }

    /// Snapshot of every provider's bookings.
    pub(crate) async fn all_bookings(&self) -> Vec<Booking> {
        let mut out = Vec::new();
        for provider_id in self.store.provider_ids() {
            if let Some(shared) = self.store.get_provider(&provider_id) {
                out.extend(shared.read().await.bookings.iter().cloned());
            }
        }
        out
    }
}

fn sort_newest_first(bookings: &mut [Booking]) {
    bookings.sort_by(|a, b| b.date_time.cmp(&a.date_time).then(b.id.cmp(&a.id)));
}
