use chrono::{NaiveDateTime, Timelike};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Reject a candidate slot that is inverted, already started, or outside business hours.
pub(crate) fn validate_candidate(c: &SlotCandidate, now: NaiveDateTime) -> Result<(), EngineError> {
    if c.start_time >= c.end_time {
        return Err(EngineError::Validation(format!(
            "slot {} {}-{} has an empty or inverted window",
            c.date, c.start_time, c.end_time
        )));
    }
    // A slot starting exactly now can never be booked (bookings must be in the future).
    if c.starts_at() <= now {
        return Err(EngineError::Validation(format!(
            "slot {} {} is in the past",
            c.date, c.start_time
        )));
    }
    let open = c.start_time.num_seconds_from_midnight();
    let close = c.end_time.num_seconds_from_midnight();
    if open < BUSINESS_OPEN_SECS || close > BUSINESS_CLOSE_SECS {
        return Err(EngineError::Validation(format!(
            "slot {}-{} is outside business hours",
            c.start_time, c.end_time
        )));
    }
    Ok(())
}

pub(crate) fn validate_page(page: usize, limit: usize) -> Result<(), EngineError> {
    if page == 0 {
        return Err(EngineError::Validation("page starts at 1".into()));
    }
    if limit == 0 || limit > MAX_PAGE_LIMIT {
        return Err(EngineError::Validation(format!(
            "limit must be between 1 and {MAX_PAGE_LIMIT}"
        )));
    }
    Ok(())
}

pub(crate) fn validate_notes(notes: &Option<String>) -> Result<(), EngineError> {
    if let Some(n) = notes
        && n.len() > MAX_NOTES_LEN {
            return Err(EngineError::LimitExceeded("notes too long"));
        }
    Ok(())
}

/// Pick the slot a booking at `at` would claim.
///
/// No covering slot at all is `Unavailable`; covering slots that are all booked
/// mean someone else holds the time, which is a `Conflict`.
pub(crate) fn find_claimable(ps: &ProviderState, at: NaiveDateTime) -> Result<&Slot, EngineError> {
    let mut taken = false;
    for slot in ps.covering(at) {
        if slot.is_available() {
            return Ok(slot);
        }
        taken = true;
    }
    if taken {
        Err(EngineError::Conflict(format!(
            "the slot covering {at} is already booked"
        )))
    } else {
        Err(EngineError::Unavailable {
            provider_id: ps.provider_id,
            at,
        })
    }
}

/// No other live booking may sit on the same instant or hold the same slot.
pub(crate) fn check_no_conflict(
    ps: &ProviderState,
    slot_id: Ulid,
    at: NaiveDateTime,
    except: Option<Ulid>,
) -> Result<(), EngineError> {
    let is_other = |b: &&Booking| Some(b.id) != except;
    if let Some(existing) = ps.active_booking_at(at).filter(is_other) {
        return Err(EngineError::Conflict(format!(
            "booking {} already occupies {at}",
            existing.id
        )));
    }
    if let Some(holder) = ps.active_holder(slot_id).filter(is_other) {
        return Err(EngineError::Conflict(format!(
            "slot {slot_id} is held by booking {}",
            holder.id
        )));
    }
    Ok(())
}

/// The claim guard: only an available slot may become booked.
pub(crate) fn check_claimable(ps: &ProviderState, slot_id: Ulid) -> Result<(), EngineError> {
    let slot = ps
        .slot(slot_id)
        .ok_or(EngineError::NotFound("slot", slot_id))?;
    if !slot.is_available() {
        return Err(EngineError::Conflict(format!("slot {slot_id} is not available")));
    }
    Ok(())
}
