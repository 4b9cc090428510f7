//! Background jobs: the daily batch, the completion sweeper and the WAL
//! compactor. Each runs forever; spawn them and drop the handles on shutdown.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::{debug, error, info, warn};

use crate::batch::BatchAssigner;
use crate::db::Database;
use crate::engine::AllocationEngine;
use crate::observability;
use crate::time;

/// Next instant strictly after `now` at which the local clock in `tz` reads
/// `run_at`, and the calendar day that run should assign (the following one).
///
/// A `run_at` skipped by a DST jump fires an hour later that day.
pub fn next_batch_run(
    now: DateTime<Utc>,
    tz: Tz,
    run_at: NaiveTime,
) -> Option<(DateTime<Utc>, NaiveDate)> {
    let today = now.with_timezone(&tz).date_naive();
    for offset in 0..=2 {
        let date = today.checked_add_days(chrono::Days::new(offset))?;
        let local = date.and_time(run_at);
        let resolved = tz
            .from_local_datetime(&local)
            .earliest()
            .or_else(|| tz.from_local_datetime(&(local + chrono::Duration::hours(1))).earliest())?;
        let at = resolved.with_timezone(&Utc);
        if at > now {
            return Some((at, date.succ_opt()?));
        }
    }
    None
}

/// Run the batch once a day at `run_at` local time for the next local day.
pub async fn run_daily_batch(assigner: Arc<BatchAssigner>, run_at: NaiveTime) {
    let tz = assigner.settings().timezone;
    loop {
        let Some((at, target)) = next_batch_run(Utc::now(), tz, run_at) else {
            error!(%run_at, %tz, "cannot compute next batch run; batch scheduler stopped");
            return;
        };
        let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        info!(
            next_run = %at,
            target_day = %target,
            "next batch in {} hours {} minutes",
            wait.as_secs() / 3600,
            (wait.as_secs() % 3600) / 60
        );
        tokio::time::sleep(wait).await;

        match assigner.run(target).await {
            Ok(report) => debug!(confirmed = report.confirmed.len(), "scheduled batch finished"),
            Err(e) => error!(target_day = %target, error = %e, "scheduled batch failed"),
        }
    }
}

/// Periodically mark elapsed bookings as Completed and drop notice
/// channels nobody listens to any more.
pub async fn run_completion_sweeper(engine: Arc<AllocationEngine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        match engine.complete_elapsed(time::now_ms()).await {
            Ok(0) => {}
            Ok(n) => info!("completed {n} elapsed bookings"),
            Err(e) => warn!("completion sweep failed: {e}"),
        }
        let pruned = engine.notify.prune();
        if pruned > 0 {
            debug!(pruned, "idle notice channels dropped");
        }
    }
}

/// Compact the WAL whenever appends since the last compaction exceed `threshold`.
pub async fn run_compactor(db: Arc<Database>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let appends = db.appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match db.compact().await {
            Ok(()) => {
                metrics::counter!(observability::WAL_COMPACTIONS_TOTAL, "status" => "ok").increment(1);
                info!(appends, "WAL compacted");
            }
            Err(e) => {
                metrics::counter!(observability::WAL_COMPACTIONS_TOTAL, "status" => "error").increment(1);
                error!(error = %e, "WAL compaction failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use ulid::Ulid;

    use super::*;
    use crate::index::IntervalStore;
    use crate::model::*;
    use crate::notify::NotifyHub;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("parkalloc_test_scheduler");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[test]
    fn next_run_later_today() {
        let tz: Tz = "Europe/Madrid".parse().unwrap();
        // 10:00 local (CEST) on June 15.
        let (at, day) = next_batch_run(utc("2025-06-15T08:00:00Z"), tz, hm(22, 0)).unwrap();
        assert_eq!(at, utc("2025-06-15T20:00:00Z"));
        assert_eq!(day, NaiveDate::from_ymd_opt(2025, 6, 16).unwrap());
    }

    #[test]
    fn next_run_rolls_to_tomorrow() {
        let tz: Tz = "Europe/Madrid".parse().unwrap();
        let (at, day) = next_batch_run(utc("2025-06-15T21:00:00Z"), tz, hm(22, 0)).unwrap();
        assert_eq!(at, utc("2025-06-16T20:00:00Z"));
        assert_eq!(day, NaiveDate::from_ymd_opt(2025, 6, 17).unwrap());
    }

    #[test]
    fn exactly_at_run_time_waits_a_day() {
        let (at, _) = next_batch_run(utc("2025-06-15T22:00:00Z"), chrono_tz::UTC, hm(22, 0)).unwrap();
        assert_eq!(at, utc("2025-06-16T22:00:00Z"));
    }

    #[test]
    fn skipped_local_time_fires_an_hour_later() {
        let tz: Tz = "Europe/Madrid".parse().unwrap();
        // 02:30 does not exist on 2025-03-30; 03:30 CEST is 01:30Z.
        let (at, day) = next_batch_run(utc("2025-03-29T23:30:00Z"), tz, hm(2, 30)).unwrap();
        assert_eq!(at, utc("2025-03-30T01:30:00Z"));
        assert_eq!(day, NaiveDate::from_ymd_opt(2025, 3, 31).unwrap());
    }

    #[tokio::test]
    async fn sweeper_completes_elapsed_bookings() {
        let db = Arc::new(Database::open(test_wal_path("sweeper.wal")).unwrap());
        let spot = Spot::new(SpotKind::Private, 0.0, 0.0, 1.0);
        let spot_id = spot.id;
        db.create_spot(spot).await.unwrap();
        // Far in the past relative to the wall clock.
        let span = Span::new(1_000_000_000_000, 1_000_003_600_000);
        db.write(vec![Event::WindowAdded {
            window: AvailabilityWindow::new(spot_id, span, WindowCategory::Standard),
        }])
        .await
        .unwrap();
        let index = Arc::new(IntervalStore::new());
        index.load(&db, 0).await.unwrap();
        let engine = Arc::new(AllocationEngine::new(db.clone(), index, Arc::new(NotifyHub::new())));
        let booking = engine
            .allocate(crate::engine::AllocationRequest {
                spot_id,
                start: span.start,
                end: span.end,
                user_id: Some(Ulid::new()),
                details: Default::default(),
            })
            .await
            .unwrap()
            .unwrap();

        drop(engine.notify.subscribe(Ulid::new()));
        let listening = engine.notify.subscribe(Ulid::new());
        assert_eq!(engine.notify.channel_count(), 2);

        let handle = tokio::spawn(run_completion_sweeper(engine.clone(), Duration::from_millis(10)));
        let mut status = BookingStatus::Active;
        for _ in 0..100 {
            status = db.get_booking(&booking.id).await.unwrap().unwrap().status;
            if status == BookingStatus::Completed && engine.notify.channel_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();
        assert_eq!(status, BookingStatus::Completed);
        assert_eq!(engine.notify.channel_count(), 1);
        drop(listening);
    }

    #[tokio::test]
    async fn compactor_runs_past_threshold() {
        let db = Arc::new(Database::open(test_wal_path("compactor.wal")).unwrap());
        for _ in 0..5 {
            db.upsert_user(Ulid::new(), 0).await.unwrap();
        }
        assert!(db.appends_since_compact().await >= 5);

        let handle = tokio::spawn(run_compactor(db.clone(), 5, Duration::from_millis(10)));
        let mut appends = u64::MAX;
        for _ in 0..100 {
            appends = db.appends_since_compact().await;
            if appends == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();
        assert_eq!(appends, 0);
    }
}
