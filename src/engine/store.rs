use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

pub type SharedProviderState = Arc<RwLock<ProviderState>>;

/// Per-provider state plus the reverse indexes needed to find it.
pub struct LedgerStore {
    providers: DashMap<Ulid, SharedProviderState>,
    slot_to_provider: DashMap<Ulid, Ulid>,
    booking_to_provider: DashMap<Ulid, Ulid>,
    /// Consumer → booking ids, in creation order.
    consumer_bookings: DashMap<Ulid, Vec<Ulid>>,
}

impl Default for LedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LedgerStore {
    pub fn new() -> Self {
        Self {
            providers: DashMap::new(),
            slot_to_provider: DashMap::new(),
            booking_to_provider: DashMap::new(),
            consumer_bookings: DashMap::new(),
        }
    }

    // ── Providers ────────────────────────────────────────────

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    pub fn get_provider(&self, id: &Ulid) -> Option<SharedProviderState> {
        self.providers.get(id).map(|e| e.value().clone())
    }

    /// Get the provider's state, creating an empty one on first use.
    pub fn provider_or_create(&self, id: Ulid) -> SharedProviderState {
        self.providers
            .entry(id)
            .or_insert_with(|| Arc::new(RwLock::new(ProviderState::new(id))))
            .value()
            .clone()
    }

    pub fn insert_provider(&self, state: ProviderState) {
        self.providers
            .insert(state.provider_id, Arc::new(RwLock::new(state)));
    }

    pub fn provider_ids(&self) -> Vec<Ulid> {
        self.providers.iter().map(|e| *e.key()).collect()
    }

    // ── Entity indexes ───────────────────────────────────────

    pub fn provider_for_slot(&self, slot_id: &Ulid) -> Option<Ulid> {
        self.slot_to_provider.get(slot_id).map(|e| *e.value())
    }

    pub fn provider_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_provider.get(booking_id).map(|e| *e.value())
    }

    pub fn bookings_of_consumer(&self, consumer_id: &Ulid) -> Vec<Ulid> {
        self.consumer_bookings
            .get(consumer_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    fn index_booking(&self, booking: &Booking) {
        self.booking_to_provider
            .insert(booking.id, booking.provider_id);
        self.consumer_bookings
            .entry(booking.consumer_id)
            .or_default()
            .push(booking.id);
    }

    // ── Event application ────────────────────────────────────

    /// Apply a committed event. The caller holds the provider's write lock (or
    /// owns the state outright during replay).
    pub fn apply_event(&self, ps: &mut ProviderState, event: &Event) {
        match event {
            Event::SlotsPublished { provider_id, slots } => {
                for slot in slots {
                    self.slot_to_provider.insert(slot.id, *provider_id);
                    ps.insert_slot(slot.clone());
                }
            }
            Event::SlotClaimed { id, .. } => set_slot_status(ps, *id, SlotStatus::Booked),
            Event::SlotReleased { id, .. } => set_slot_status(ps, *id, SlotStatus::Available),
            Event::SlotDeleted { id, .. } => {
                ps.remove_slot(*id);
                self.slot_to_provider.remove(id);
            }
            Event::BookingCreated { booking } => {
                set_slot_status(ps, booking.slot_id, SlotStatus::Booked);
                self.index_booking(booking);
                ps.insert_booking(booking.clone());
            }
            Event::BookingStatusChanged {
                id,
                status,
                release_slot,
                claim_slot,
                ..
            } => {
                if let Some(booking) = ps.booking_mut(*id) {
                    booking.status = *status;
                }
                if let Some(slot_id) = release_slot {
                    set_slot_status(ps, *slot_id, SlotStatus::Available);
                }
                if let Some(slot_id) = claim_slot {
                    set_slot_status(ps, *slot_id, SlotStatus::Booked);
                }
            }
            Event::BookingRestored { booking } => {
                self.index_booking(booking);
                ps.insert_booking(booking.clone());
            }
        }
    }
}

fn set_slot_status(ps: &mut ProviderState, slot_id: Ulid, status: SlotStatus) {
    if let Some(slot) = ps.slot_mut(slot_id) {
        slot.status = status;
    }
}
