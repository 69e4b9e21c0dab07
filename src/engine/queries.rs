use std::collections::HashSet;

use chrono::{Duration, NaiveDateTime};

use crate::limits::REMINDER_WINDOW_HOURS;
use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    /// Confirmed bookings starting within the reminder window after `now`,
    /// earliest first.
    pub async fn due_reminders(&self, now: NaiveDateTime) -> Vec<Booking> {
        let until = now + Duration::hours(REMINDER_WINDOW_HOURS);
        let mut due = Vec::new();
        for provider_id in self.store.provider_ids() {
            let Some(shared) = self.store.get_provider(&provider_id) else {
                continue;
            };
            let ps = shared.read().await;
            let start = ps.bookings.partition_point(|b| b.date_time < now);
            due.extend(
                ps.bookings[start..]
                    .iter()
                    .take_while(|b| b.date_time <= until)
                    .filter(|b| b.status == BookingStatus::Confirmed)
                    .cloned(),
            );
        }
        due.sort_by(|a, b| a.date_time.cmp(&b.date_time).then(a.id.cmp(&b.id)));
        due
    }

    /// Completed bookings and distinct consumers per provider over
    /// `from ..= until`. Providers with no completed booking are omitted.
    pub async fn provider_stats(
        &self,
        from: NaiveDateTime,
        until: NaiveDateTime,
    ) -> Result<Vec<ProviderStats>, EngineError> {
        if from > until {
            return Err(EngineError::Validation(format!(
                "stats range {from}..{until} is inverted"
            )));
        }
        let mut provider_ids = self.store.provider_ids();
        provider_ids.sort();

        let mut stats = Vec::new();
        for provider_id in provider_ids {
            let Some(shared) = self.store.get_provider(&provider_id) else {
                continue;
            };
            let ps = shared.read().await;
            let start = ps.bookings.partition_point(|b| b.date_time < from);
            let mut completed = 0;
            let mut consumers = HashSet::new();
            for b in ps.bookings[start..]
                .iter()
                .take_while(|b| b.date_time <= until)
                .filter(|b| b.status == BookingStatus::Completed)
            {
                completed += 1;
                consumers.insert(b.consumer_id);
            }
            if completed > 0 {
                stats.push(ProviderStats {
                    provider_id,
                    completed_bookings: completed,
                    distinct_consumers: consumers.len(),
                });
            }
        }
        Ok(stats)
    }
}
