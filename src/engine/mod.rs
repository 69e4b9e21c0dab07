mod booking;
mod conflict;
mod error;
mod ledger;
mod queries;
mod schedule;
mod store;
mod transition;

pub use error::{EngineError, ErrorKind};
pub use store::{LedgerStore, SharedProviderState};
pub use transition::{Ownership, TransitionRule, TRANSITION_TABLE, rule_for};

use std::collections::HashMap;
use std::io;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDateTime;
use tokio::sync::{mpsc, oneshot, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, info};
use ulid::Ulid;

use crate::clock::Clock;
use crate::identity::Directory;
use crate::model::*;
use crate::notify::{self, Notification, Notifier};
use crate::wal::Wal;

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

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the shared result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            // Non-append commands run after the current batch is durable.
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
    debug!("WAL writer stopped");
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so half-written bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
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

/// Write event to WAL via the background group-commit writer.
async fn wal_append(wal_tx: &mpsc::Sender<WalCommand>, event: &Event) -> Result<(), EngineError> {
    let (tx, rx) = oneshot::channel();
    wal_tx
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

/// Exclusive access to one provider's slots and bookings for the length of one
/// logical transaction. Also holds the commit gate so compaction never
/// snapshots a half-applied operation.
pub(crate) struct ProviderTxn {
    _gate: OwnedRwLockReadGuard<()>,
    state: OwnedRwLockWriteGuard<ProviderState>,
}

impl Deref for ProviderTxn {
    type Target = ProviderState;

    fn deref(&self) -> &ProviderState {
        &self.state
    }
}

impl DerefMut for ProviderTxn {
    fn deref_mut(&mut self) -> &mut ProviderState {
        &mut self.state
    }
}

/// The slot ledger and booking engine.
pub struct Engine {
    store: Arc<LedgerStore>,
    wal_tx: mpsc::Sender<WalCommand>,
    commit_gate: Arc<RwLock<()>>,
    directory: Arc<dyn Directory>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its writer task.
    /// Must be called inside a tokio runtime.
    pub fn new(
        wal_path: PathBuf,
        directory: Arc<dyn Directory>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let store = Arc::new(LedgerStore::new());

        // Replay into owned state; nothing is shared yet, so no locks are needed.
        let mut states: HashMap<Ulid, ProviderState> = HashMap::new();
        for event in &events {
            let provider_id = event.provider_id();
            let ps = states
                .entry(provider_id)
                .or_insert_with(|| ProviderState::new(provider_id));
            store.apply_event(ps, event);
        }
        let provider_count = states.len();
        for (_, ps) in states {
            store.insert_provider(ps);
        }
        info!(
            "replayed {} events for {provider_count} providers from {}",
            events.len(),
            wal_path.display()
        );
        metrics::gauge!(crate::observability::PROVIDERS_ACTIVE).set(provider_count as f64);

        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        Ok(Self {
            store,
            wal_tx,
            commit_gate: Arc::new(RwLock::new(())),
            directory,
            notifier,
            clock,
        })
    }

    pub fn now(&self) -> NaiveDateTime {
        self.clock.now()
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    pub fn provider_count(&self) -> usize {
        self.store.provider_count()
    }

    /// Open a transaction on a provider, creating its empty state on first use.
    pub(crate) async fn begin(&self, provider_id: Ulid) -> ProviderTxn {
        let gate = self.commit_gate.clone().read_owned().await;
        let created = self.store.get_provider(&provider_id).is_none();
        let shared = self.store.provider_or_create(provider_id);
        if created {
            metrics::gauge!(crate::observability::PROVIDERS_ACTIVE)
                .set(self.store.provider_count() as f64);
        }
        ProviderTxn {
            _gate: gate,
            state: shared.write_owned().await,
        }
    }

    /// Open a transaction on the provider that owns `booking_id`.
    async fn begin_for_booking(&self, booking_id: Ulid) -> Result<ProviderTxn, EngineError> {
        let provider_id = self
            .store
            .provider_for_booking(&booking_id)
            .ok_or(EngineError::NotFound("booking", booking_id))?;
        Ok(self.begin(provider_id).await)
    }

    /// Open a transaction on the provider that owns `slot_id`.
    async fn begin_for_slot(&self, slot_id: Ulid) -> Result<ProviderTxn, EngineError> {
        let provider_id = self
            .store
            .provider_for_slot(&slot_id)
            .ok_or(EngineError::NotFound("slot", slot_id))?;
        Ok(self.begin(provider_id).await)
    }

    /// Make `event` durable, then apply it. State only changes once the WAL has it.
    ///
    /// Append and apply run on their own task, which owns the transaction. A
    /// caller that stops waiting cannot leave an event logged but unapplied;
    /// the task still applies it and only then releases the provider lock.
    pub(crate) async fn commit(&self, txn: ProviderTxn, event: Event) -> Result<ProviderTxn, EngineError> {
        let wal_tx = self.wal_tx.clone();
        let store = self.store.clone();
        let task = tokio::spawn(async move {
            let mut txn = txn;
            wal_append(&wal_tx, &event).await?;
            store.apply_event(&mut txn.state, &event);
            Ok::<_, EngineError>(txn)
        });
        task.await
            .map_err(|e| EngineError::WalError(format!("commit task failed: {e}")))?
    }

    /// Queue a notification to a member. Runs detached; never fails the caller.
    fn notify_member(&self, member_id: &Ulid, subject: &str, body: String) {
        match self.directory.lookup(member_id) {
            Some(member) => {
                notify::dispatch(
                    self.notifier.clone(),
                    Notification::new(subject, vec![member.email], body),
                );
            }
            None => debug!("no contact for member {member_id}, skipping '{subject}'"),
        }
    }

    /// Rewrite the WAL with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // Exclusive gate: no operation is between its WAL append and its apply.
        let _gate = self.commit_gate.write().await;

        let mut provider_ids = self.store.provider_ids();
        provider_ids.sort();
        let mut events = Vec::new();
        for provider_id in provider_ids {
            let Some(shared) = self.store.get_provider(&provider_id) else {
                continue;
            };
            let ps = shared.read().await;
            if !ps.slots.is_empty() {
                events.push(Event::SlotsPublished {
                    provider_id,
                    slots: ps.slots.clone(),
                });
            }
            for booking in &ps.bookings {
                events.push(Event::BookingRestored {
                    booking: booking.clone(),
                });
            }
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;

        metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
        info!("compacted WAL to {count} events");
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
