use std::time::Instant;

use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::observability;

use super::conflict::check_no_conflict;
use super::{Engine, EngineError};

/// Which side of a booking the caller must be on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    Any,
    ServingProvider,
    RequestingConsumer,
}

impl Ownership {
    pub fn admits(self, actor: &Identity, booking: &Booking) -> bool {
        match self {
            Ownership::Any => true,
            Ownership::ServingProvider => booking.provider_id == actor.id,
            Ownership::RequestingConsumer => booking.consumer_id == actor.id,
        }
    }
}

/// One row of the status transition table.
#[derive(Debug, Clone, Copy)]
pub struct TransitionRule {
    pub role: Role,
    pub ownership: Ownership,
    pub targets: &'static [BookingStatus],
    /// Refuse when the booking is already cancelled.
    pub forbid_from_cancelled: bool,
    /// Refuse once the booking's time has come.
    pub requires_future: bool,
}

pub static TRANSITION_TABLE: [TransitionRule; 3] = [
    TransitionRule {
        role: Role::Admin,
        ownership: Ownership::Any,
        targets: &BookingStatus::ALL,
        forbid_from_cancelled: false,
        requires_future: false,
    },
    TransitionRule {
        role: Role::Provider,
        ownership: Ownership::ServingProvider,
        targets: &BookingStatus::ALL,
        forbid_from_cancelled: false,
        requires_future: false,
    },
    TransitionRule {
        role: Role::Consumer,
        ownership: Ownership::RequestingConsumer,
        targets: &[BookingStatus::Cancelled],
        forbid_from_cancelled: true,
        requires_future: true,
    },
];

/// The table row governing `role`. Rows are laid out in this order.
pub fn rule_for(role: Role) -> &'static TransitionRule {
    let row = match role {
        Role::Admin => 0,
        Role::Provider => 1,
        Role::Consumer => 2,
    };
    &TRANSITION_TABLE[row]
}

impl Engine {
    /// Change a booking's status on behalf of `actor`.
    ///
    /// Checks run in order: the booking exists, the actor owns it, the target is
    /// allowed for the role, then the rule's preconditions. Cancelling an active
    /// booking frees its slot, and reactivating a cancelled one claims it back;
    /// either way the status and slot change are one WAL event.
    pub async fn update_booking_status(
        &self,
        actor: &Identity,
        booking_id: Ulid,
        target: BookingStatus,
    ) -> Result<Booking, EngineError> {
        let started = Instant::now();
        let result = self.transition(actor, booking_id, target).await;
        observability::record("update_booking_status", started, &result);
        result
    }

    async fn transition(
        &self,
        actor: &Identity,
        booking_id: Ulid,
        target: BookingStatus,
    ) -> Result<Booking, EngineError> {
        let txn = self.begin_for_booking(booking_id).await?;
        let booking = txn
            .booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound("booking", booking_id))?;

        let rule = rule_for(actor.role);
        if !rule.ownership.admits(actor, &booking) {
            return Err(EngineError::Forbidden(format!(
                "{} {} does not own booking {booking_id}",
                actor.role, actor.id
            )));
        }
        if !rule.targets.contains(&target) {
            return Err(EngineError::Forbidden(format!(
                "a {} cannot set a booking to {target}",
                actor.role
            )));
        }
        if rule.forbid_from_cancelled && booking.status == BookingStatus::Cancelled {
            return Err(EngineError::InvalidTransition(format!(
                "booking {booking_id} is already cancelled"
            )));
        }
        if rule.requires_future && booking.date_time <= self.now() {
            return Err(EngineError::InvalidTransition(format!(
                "booking {booking_id} at {} is no longer in the future",
                booking.date_time
            )));
        }

        let mut release_slot = None;
        let mut claim_slot = None;
        if booking.status.is_active() && !target.is_active() {
            if txn.slot(booking.slot_id).is_some_and(|s| !s.is_available()) {
                release_slot = Some(booking.slot_id);
            }
        } else if !booking.status.is_active() && target.is_active() {
            check_no_conflict(&txn, booking.slot_id, booking.date_time, Some(booking_id))?;
            let slot = txn
                .slot(booking.slot_id)
                .ok_or(EngineError::Unavailable {
                    provider_id: booking.provider_id,
                    at: booking.date_time,
                })?;
            if slot.is_available() {
                claim_slot = Some(booking.slot_id);
            } else {
                return Err(EngineError::Conflict(format!(
                    "slot {} was claimed while booking {booking_id} was cancelled",
                    booking.slot_id
                )));
            }
        }

        let event = Event::BookingStatusChanged {
            id: booking_id,
            provider_id: booking.provider_id,
            status: target,
            release_slot,
            claim_slot,
        };
        let txn = self.commit(txn, event).await?;
        let updated = txn
            .booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound("booking", booking_id))?;
        drop(txn);

        info!(
            "booking {booking_id}: {} -> {target} by {} {}",
            booking.status, actor.role, actor.id
        );
        self.notify_member(
            &updated.consumer_id,
            "Booking status updated",
            format!(
                "Your booking on {} is now {}.",
                updated.date_time.format("%Y-%m-%d %H:%M"),
                updated.status
            ),
        );
        Ok(updated)
    }
}
