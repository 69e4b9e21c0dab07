use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, NaiveDateTime, Timelike};
use futures::{StreamExt, stream};
use tracing::{debug, error, info, warn};

use crate::engine::Engine;
use crate::model::{ProviderStats, Role};
use crate::notify::{Notification, Notifier};

/// Concurrent deliveries per job run.
const SEND_CONCURRENCY: usize = 8;

/// How often the compactor checks the log size.
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Monthly reports go out on the 1st, from this hour on.
const MONTHLY_REPORT_HOUR: u32 = 1;

/// Deliver every notification, a few at a time. Returns how many succeeded.
async fn deliver_all(notifier: &Arc<dyn Notifier>, notifications: Vec<Notification>) -> usize {
    let results: Vec<bool> = stream::iter(notifications)
        .map(|n| async move {
            match notifier.notify(&n).await {
                Ok(()) => {
                    metrics::counter!(crate::observability::NOTIFICATIONS_TOTAL, "status" => "sent")
                        .increment(1);
                    true
                }
                Err(e) => {
                    metrics::counter!(crate::observability::NOTIFICATIONS_TOTAL, "status" => "failed")
                        .increment(1);
                    warn!("'{}' to {:?} failed: {e}", n.subject, n.recipients);
                    false
                }
            }
        })
        .buffer_unordered(SEND_CONCURRENCY)
        .collect()
        .await;
    results.into_iter().filter(|ok| *ok).count()
}

/// Remind consumers of confirmed bookings in the next 24 hours.
/// Returns the number of reminders delivered.
pub async fn send_reminders(
    engine: &Engine,
    notifier: &Arc<dyn Notifier>,
    now: NaiveDateTime,
) -> usize {
    let directory = engine.directory();
    let mut notifications = Vec::new();
    for booking in engine.due_reminders(now).await {
        let Some(consumer) = directory.lookup(&booking.consumer_id) else {
            debug!("booking {}: consumer has no contact, no reminder", booking.id);
            continue;
        };
        let provider = directory
            .lookup(&booking.provider_id)
            .map(|m| m.name)
            .unwrap_or_else(|| booking.provider_id.to_string());
        notifications.push(Notification::new(
            "Booking reminder",
            vec![consumer.email],
            format!(
                "Dear {}, this is a reminder of your booking with {provider} on {}.",
                consumer.name,
                booking.date_time.format("%Y-%m-%d %H:%M")
            ),
        ));
    }
    let due = notifications.len();
    let sent = deliver_all(notifier, notifications).await;
    info!("reminders: {sent}/{due} delivered");
    sent
}

/// Send every provider its figures from the 1st of the month up to `now`.
/// Returns the number of reports delivered.
pub async fn send_monthly_reports(
    engine: &Engine,
    notifier: &Arc<dyn Notifier>,
    now: NaiveDateTime,
) -> usize {
    let Some(month_start) = now.date().with_day(1).and_then(|d| d.and_hms_opt(0, 0, 0)) else {
        return 0;
    };
    let stats: HashMap<_, ProviderStats> = match engine.provider_stats(month_start, now).await {
        Ok(stats) => stats.into_iter().map(|s| (s.provider_id, s)).collect(),
        Err(e) => {
            error!("monthly report: {e}");
            return 0;
        }
    };

    let mut providers = engine.directory().members(Role::Provider);
    providers.sort_by(|a, b| a.name.cmp(&b.name));
    let notifications: Vec<Notification> = providers
        .into_iter()
        .map(|p| {
            let (completed, consumers) = stats
                .get(&p.id)
                .map_or((0, 0), |s| (s.completed_bookings, s.distinct_consumers));
            let earned = completed as u64 * u64::from(p.consultation_fee.unwrap_or(0));
            Notification::new(
                format!("Monthly report for {}", p.name),
                vec![p.email],
                format!(
                    "Since {}: {completed} completed bookings, {consumers} distinct consumers, {earned} earned.",
                    month_start.date()
                ),
            )
        })
        .collect();
    let due = notifications.len();
    let sent = deliver_all(notifier, notifications).await;
    info!("monthly reports: {sent}/{due} delivered");
    sent
}

/// Send reminders every `every`, starting immediately.
pub async fn run_reminder_job(engine: Arc<Engine>, notifier: Arc<dyn Notifier>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        send_reminders(&engine, &notifier, engine.now()).await;
    }
}

/// Check hourly; send reports once per month, on the 1st.
pub async fn run_monthly_report_job(engine: Arc<Engine>, notifier: Arc<dyn Notifier>) {
    let mut interval = tokio::time::interval(Duration::from_secs(3600));
    let mut last_sent: Option<(i32, u32)> = None;
    loop {
        interval.tick().await;
        let now = engine.now();
        let month = (now.year(), now.month());
        if now.day() == 1 && now.hour() >= MONTHLY_REPORT_HOUR && last_sent != Some(month) {
            send_monthly_reports(&engine, &notifier, now).await;
            last_sent = Some(month);
        }
    }
}

/// Compact the log whenever it has grown past `threshold` appends.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted log after {appends} appends"),
            Err(e) => error!("log compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::identity::{Member, MemberRegistry};
    use crate::model::*;
    use crate::notify::MemoryNotifier;
    use chrono::{NaiveDate, NaiveTime};
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_jobs");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("{name}-{}.wal", Ulid::new()));
        let _ = std::fs::remove_file(&path);
        path
    }

    fn at(date: (i32, u32, u32), h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(date.0, date.1, date.2)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    struct Fixture {
        engine: Arc<Engine>,
        clock: Arc<FixedClock>,
        provider: Member,
        consumer: Member,
    }

    fn member(role: Role, name: &str) -> Member {
        Member {
            id: Ulid::new(),
            role,
            name: name.into(),
            email: format!("{}@example.com", name.to_lowercase()),
            consultation_fee: None,
        }
    }

    fn fixture(name: &str, now: NaiveDateTime) -> Fixture {
        let registry = Arc::new(MemberRegistry::new());
        let provider = Member {
            consultation_fee: Some(1000),
            ..member(Role::Provider, "Rahman")
        };
        let consumer = member(Role::Consumer, "Lee");
        registry.register(provider.clone(), None);
        registry.register(consumer.clone(), None);
        let clock = Arc::new(FixedClock::new(now));
        let engine = Engine::new(
            test_wal_path(name),
            registry,
            Arc::new(MemoryNotifier::new()),
            clock.clone(),
        )
        .unwrap();
        Fixture {
            engine: Arc::new(engine),
            clock,
            provider,
            consumer,
        }
    }

    async fn booked(f: &Fixture, date: (i32, u32, u32), hour: u32, status: BookingStatus) -> Booking {
        let day = NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap();
        f.engine
            .publish(
                f.provider.id,
                vec![SlotCandidate::new(
                    day,
                    NaiveTime::from_hms_opt(hour, 0, 0).unwrap(),
                    NaiveTime::from_hms_opt(hour + 1, 0, 0).unwrap(),
                )],
            )
            .await
            .unwrap();
        let b = f
            .engine
            .book(f.consumer.id, f.provider.id, at(date, hour, 0), None)
            .await
            .unwrap();
        if status != BookingStatus::Pending {
            f.engine
                .update_booking_status(&Identity::admin(Ulid::new()), b.id, status)
                .await
                .unwrap()
        } else {
            b
        }
    }

    #[tokio::test]
    async fn reminders_cover_confirmed_bookings_in_next_day() {
        let f = fixture("reminders", at((2025, 7, 13), 8, 0));
        booked(&f, (2025, 7, 13), 10, BookingStatus::Confirmed).await;
        booked(&f, (2025, 7, 13), 11, BookingStatus::Pending).await;
        booked(&f, (2025, 7, 15), 10, BookingStatus::Confirmed).await;

        let outbox: Arc<dyn Notifier> = Arc::new(MemoryNotifier::new());
        let sent = send_reminders(&f.engine, &outbox, f.engine.now()).await;
        assert_eq!(sent, 1);
    }

    #[tokio::test]
    async fn reminder_text_names_provider_and_time() {
        let f = fixture("reminder_text", at((2025, 7, 13), 8, 0));
        booked(&f, (2025, 7, 14), 9, BookingStatus::Confirmed).await;

        let memory = Arc::new(MemoryNotifier::new());
        let outbox: Arc<dyn Notifier> = memory.clone();
        assert_eq!(send_reminders(&f.engine, &outbox, f.engine.now()).await, 1);

        let sent = memory.sent();
        assert_eq!(sent[0].recipients, vec![f.consumer.email.clone()]);
        assert!(sent[0].body.contains("Rahman"));
        assert!(sent[0].body.contains("2025-07-14 09:00"));
    }

    #[tokio::test]
    async fn failed_reminders_are_not_counted() {
        let f = fixture("reminder_fail", at((2025, 7, 13), 8, 0));
        booked(&f, (2025, 7, 13), 10, BookingStatus::Confirmed).await;

        let memory = Arc::new(MemoryNotifier::new());
        memory.set_failing(true);
        let outbox: Arc<dyn Notifier> = memory;
        assert_eq!(send_reminders(&f.engine, &outbox, f.engine.now()).await, 0);
    }

    #[tokio::test]
    async fn monthly_report_counts_completed_this_month() {
        let f = fixture("monthly", at((2025, 7, 13), 8, 0));
        booked(&f, (2025, 7, 14), 10, BookingStatus::Completed).await;
        booked(&f, (2025, 7, 14), 11, BookingStatus::Completed).await;
        booked(&f, (2025, 7, 15), 10, BookingStatus::Cancelled).await;
        f.clock.set(at((2025, 7, 31), 23, 0));

        let memory = Arc::new(MemoryNotifier::new());
        let outbox: Arc<dyn Notifier> = memory.clone();
        assert_eq!(send_monthly_reports(&f.engine, &outbox, f.engine.now()).await, 1);

        let report = &memory.sent()[0];
        assert_eq!(report.subject, "Monthly report for Rahman");
        assert!(report.body.contains("2 completed bookings, 1 distinct consumers, 2000 earned"));
        assert!(report.body.contains("2025-07-01"));
    }

    #[tokio::test]
    async fn monthly_report_goes_to_idle_providers_too() {
        let f = fixture("monthly_idle", at((2025, 8, 1), 2, 0));
        let memory = Arc::new(MemoryNotifier::new());
        let outbox: Arc<dyn Notifier> = memory.clone();
        assert_eq!(send_monthly_reports(&f.engine, &outbox, f.engine.now()).await, 1);
        assert!(memory.sent()[0].body.contains("0 completed bookings"));
        assert!(memory.sent()[0].body.contains("0 earned"));
    }

    #[tokio::test]
    async fn compactor_rewrites_log_past_threshold() {
        let f = fixture("compactor", at((2025, 7, 13), 8, 0));
        for hour in 9..13 {
            booked(&f, (2025, 7, 14), hour, BookingStatus::Pending).await;
        }
        assert!(f.engine.wal_appends_since_compact().await >= 4);

        let handle = tokio::spawn(run_compactor(f.engine.clone(), 1));
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while f.engine.wal_appends_since_compact().await != 0 {
            assert!(tokio::time::Instant::now() < deadline, "compactor never ran");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        handle.abort();
    }
}
