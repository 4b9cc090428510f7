//! WAL-backed persisted state for spots, windows, bookings, requests and
//! user priority scores. This is the ground truth the availability index is
//! derived from.

mod tables;
mod txn;

pub use tables::Tables;
pub use txn::Transaction;

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::wal::{Record, Wal};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("database unavailable")]
    Unavailable,
    #[error("WAL error: {0}")]
    Wal(String),
}

/// Hard filters applied when fetching spots.
#[derive(Debug, Clone, Default)]
pub struct SpotFilter {
    pub kind: Option<SpotKind>,
    /// Only spots with some charger.
    pub requires_charger: bool,
    /// Only spots with this charger type (implies `requires_charger`).
    pub charger_type: Option<ChargerType>,
    /// Skip spots owned by this user.
    pub exclude_owner: Option<Ulid>,
}

impl SpotFilter {
    pub fn matches(&self, spot: &Spot) -> bool {
        if self.kind.is_some_and(|k| k != spot.kind) {
            return false;
        }
        if (self.requires_charger || self.charger_type.is_some()) && spot.charger.is_none() {
            return false;
        }
        if let Some(t) = self.charger_type
            && spot.charger != Some(t)
        {
            return false;
        }
        if self.exclude_owner.is_some() && spot.owner_id == self.exclude_owner {
            return false;
        }
        true
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        record: Record,
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
/// 3. Drain all immediately available Appends.
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { record, response } => {
                let mut batch = vec![(record, response)];

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { record, response }) => {
                            batch.push((record, response));
                        }
                        Ok(other) => {
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

type Pending = (Record, oneshot::Sender<io::Result<()>>);

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<Pending>) {
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

fn flush_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (record, _) in batch {
        if let Err(e) = wal.append_buffered(record) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush so partially buffered bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
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
        WalCommand::Append { record, response } => {
            flush_and_respond(wal, &mut vec![(record, response)]);
        }
    }
}

pub struct Database {
    tables: Mutex<Tables>,
    wal_tx: mpsc::Sender<WalCommand>,
    closed: AtomicBool,
    #[cfg(test)]
    fail_next_commit: AtomicBool,
}

impl Database {
    /// Replay the WAL at `wal_path` and start the group-commit writer.
    /// Must be called inside a tokio runtime.
    pub fn open(wal_path: PathBuf) -> io::Result<Self> {
        let records = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut tables = Tables::default();
        for record in &records {
            for event in record {
                tables.apply_event(event);
            }
        }
        info!(
            path = %wal_path.display(),
            records = records.len(),
            spots = tables.spots.len(),
            bookings = tables.bookings.len(),
            "database opened"
        );

        Ok(Self {
            tables: Mutex::new(tables),
            wal_tx,
            closed: AtomicBool::new(false),
            #[cfg(test)]
            fail_next_commit: AtomicBool::new(false),
        })
    }

    /// Mark the database unavailable. Every later call fails with `Unavailable`.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }
        Ok(())
    }

    /// Make the next commit fail as if the WAL write had failed.
    #[cfg(test)]
    pub(crate) fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Start a transaction. Holds the table lock until commit or drop.
    pub async fn begin(&self) -> Result<Transaction<'_>, StoreError> {
        self.ensure_open()?;
        let guard = self.tables.lock().await;
        Ok(Transaction::new(self, guard))
    }

    /// Durably append one commit record via the background writer.
    pub(super) async fn wal_append(&self, record: Record) -> Result<(), StoreError> {
        self.ensure_open()?;
        #[cfg(test)]
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Wal("injected commit failure".into()));
        }
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                record,
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    /// Run a read-only closure against the current state.
    pub async fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> Result<T, StoreError> {
        self.ensure_open()?;
        let guard = self.tables.lock().await;
        Ok(f(&guard))
    }

    /// Commit a fixed list of events as one record.
    pub async fn write(&self, events: Vec<Event>) -> Result<(), StoreError> {
        let mut txn = self.begin().await?;
        for e in events {
            txn.stage(e);
        }
        txn.commit().await
    }

    // ── Reads ────────────────────────────────────────────────

    pub async fn get_spot(&self, id: &Ulid) -> Result<Option<Spot>, StoreError> {
        self.read(|t| t.spot(id).cloned()).await
    }

    pub async fn spots_matching(&self, filter: &SpotFilter) -> Result<Vec<Spot>, StoreError> {
        self.read(|t| t.spots_matching(filter).cloned().collect()).await
    }

    /// Every window that is available and not yet over at `now`.
    pub async fn available_windows(&self, now: Ms) -> Result<Vec<AvailabilityWindow>, StoreError> {
        self.read(|t| {
            t.spots
                .values()
                .flat_map(|s| s.available_windows())
                .filter(|w| w.span.end > now && w.span.start < w.span.end)
                .cloned()
                .collect()
        })
        .await
    }

    pub async fn get_booking(&self, id: &Ulid) -> Result<Option<Booking>, StoreError> {
        self.read(|t| t.booking(id).cloned()).await
    }

    pub async fn bookings_for_spot(&self, spot_id: &Ulid) -> Result<Vec<Booking>, StoreError> {
        self.read(|t| t.bookings_for_spot(spot_id).cloned().collect()).await
    }

    pub async fn get_request(&self, id: &Ulid) -> Result<Option<ParkingRequest>, StoreError> {
        self.read(|t| t.request(id).cloned()).await
    }

    /// Requests in `status` whose start falls inside `range`.
    pub async fn requests_starting_in(
        &self,
        status: RequestStatus,
        range: Span,
    ) -> Result<Vec<ParkingRequest>, StoreError> {
        self.read(|t| {
            let mut out: Vec<ParkingRequest> = t
                .requests
                .values()
                .filter(|r| r.status == status && range.contains_instant(r.span.start))
                .cloned()
                .collect();
            out.sort_by_key(|r| r.id);
            out
        })
        .await
    }

    pub async fn priority_score(&self, user_id: &Ulid) -> Result<i64, StoreError> {
        self.read(|t| t.priority_score(user_id)).await
    }

    // ── Simple writes ────────────────────────────────────────

    pub async fn create_spot(&self, spot: Spot) -> Result<(), StoreError> {
        self.write(vec![Event::SpotCreated { spot }]).await
    }

    pub async fn upsert_user(&self, id: Ulid, priority_score: i64) -> Result<(), StoreError> {
        self.write(vec![Event::UserUpserted { id, priority_score }]).await
    }

    pub async fn create_request(&self, request: ParkingRequest) -> Result<(), StoreError> {
        self.write(vec![Event::RequestCreated { request }]).await
    }

    /// Plain status update, one record.
    pub async fn set_request_status(
        &self,
        id: Ulid,
        status: RequestStatus,
        assigned_spot_id: Option<Ulid>,
    ) -> Result<(), StoreError> {
        self.write(vec![Event::RequestUpdated {
            id,
            status,
            assigned_spot_id,
        }])
        .await
    }

    // ── Maintenance ──────────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate the current state.
    pub async fn compact(&self) -> Result<(), StoreError> {
        self.ensure_open()?;
        let guard = self.tables.lock().await;
        let events = guard.snapshot_events();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()));
        drop(guard);
        result
    }

    pub async fn appends_since_compact(&self) -> u64 {
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
