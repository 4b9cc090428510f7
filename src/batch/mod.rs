//! Daily batch assignment of building spots to pending requests.
//!
//! Each request gets at most one spot and each spot at most one request,
//! minimizing total `base − priority` cost. Every confirmed pair commits in
//! its own transaction; anything left over goes to the waiting queue.

mod hungarian;

pub use hungarian::{AssignmentSolver, Hungarian};

use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use chrono_tz::Tz;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::db::SpotFilter;
use crate::engine::{AllocationEngine, BookingDetails, EngineError};
use crate::limits::*;
use crate::model::*;
use crate::notify::Notice;
use crate::observability;
use crate::time;

#[derive(Debug, Clone)]
pub struct BatchSettings {
    /// Operating timezone; the target day is a local calendar day here.
    pub timezone: Tz,
    /// Cost of an assignment is `cost_base − priority_score`.
    pub cost_base: i64,
    /// Applied to a requester's priority score when their request is confirmed.
    pub priority_delta: i64,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::UTC,
            cost_base: 1_000,
            priority_delta: -5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub request_id: Ulid,
    pub spot_id: Ulid,
    pub booking_id: Ulid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub day: NaiveDate,
    pub requests: usize,
    pub spots: usize,
    pub confirmed: Vec<Assignment>,
    pub waitlisted: Vec<Ulid>,
    /// Solver pairs that could not be committed (raced or failed).
    pub failed_pairs: usize,
}

impl BatchReport {
    fn empty(day: NaiveDate) -> Self {
        Self {
            day,
            requests: 0,
            spots: 0,
            confirmed: Vec::new(),
            waitlisted: Vec::new(),
            failed_pairs: 0,
        }
    }
}

/// Cost matrix plus the cells that represent real assignments.
struct CostMatrix {
    costs: Vec<Vec<i64>>,
    eligible: Vec<Vec<bool>>,
}

/// Build costs with ineligible cells priced strictly above any matching that
/// uses fewer of them. Real costs are shifted to start at zero.
fn build_cost_matrix(
    requests: &[ParkingRequest],
    priorities: &[i64],
    spots: &[Spot],
    cost_base: i64,
) -> Result<CostMatrix, EngineError> {
    let real: Vec<i64> = priorities
        .iter()
        .map(|p| cost_base.checked_sub(*p))
        .collect::<Option<_>>()
        .ok_or(EngineError::LimitExceeded("priority score out of range"))?;
    let min = real.iter().copied().min().unwrap_or(0);
    let max = real.iter().copied().max().unwrap_or(0);
    let range = max
        .checked_sub(min)
        .ok_or(EngineError::LimitExceeded("priority scores too far apart"))?;

    let k = requests.len().min(spots.len()) as i64;
    let dims = (requests.len() + spots.len()) as i64;
    let sentinel = range
        .checked_add(1)
        .and_then(|r| r.checked_mul(k + 1))
        .filter(|s| s.checked_mul(dims).is_some_and(|total| total < i64::MAX / 8))
        .ok_or(EngineError::LimitExceeded("priority scores too far apart"))?;

    let mut costs = Vec::with_capacity(requests.len());
    let mut eligible = Vec::with_capacity(requests.len());
    for (req, cost) in requests.iter().zip(&real) {
        let row_eligible: Vec<bool> = spots
            .iter()
            .map(|s| s.containing_window(&req.span).is_some())
            .collect();
        costs.push(
            row_eligible
                .iter()
                .map(|&ok| if ok { cost - min } else { sentinel })
                .collect(),
        );
        eligible.push(row_eligible);
    }
    Ok(CostMatrix { costs, eligible })
}

pub struct BatchAssigner {
    engine: Arc<AllocationEngine>,
    settings: BatchSettings,
    solver: Box<dyn AssignmentSolver>,
}

impl BatchAssigner {
    pub fn new(engine: Arc<AllocationEngine>, settings: BatchSettings) -> Self {
        Self::with_solver(engine, settings, Box::new(Hungarian))
    }

    pub fn with_solver(
        engine: Arc<AllocationEngine>,
        settings: BatchSettings,
        solver: Box<dyn AssignmentSolver>,
    ) -> Self {
        Self {
            engine,
            settings,
            solver,
        }
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.settings
    }

    /// Store a new request for a later batch.
    pub async fn submit(
        &self,
        user_id: Ulid,
        building_id: Ulid,
        span: Span,
    ) -> Result<ParkingRequest, EngineError> {
        time::validate_span(&span)?;
        let request = ParkingRequest::new(user_id, building_id, span);
        self.engine.db.create_request(request.clone()).await?;
        debug!(request_id = %request.id, user_id = %user_id, "request submitted for batch");
        Ok(request)
    }

    /// Assign building spots for every pending request starting on `day`.
    pub async fn run(&self, day: NaiveDate) -> Result<BatchReport, EngineError> {
        let started = Instant::now();
        let result = self.run_inner(day).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::BATCH_RUNS_TOTAL, "status" => status).increment(1);
        metrics::histogram!(observability::BATCH_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn run_inner(&self, day: NaiveDate) -> Result<BatchReport, EngineError> {
        let db = &self.engine.db;
        let bounds = time::day_bounds(day, self.settings.timezone)?;
        let requests = db.requests_starting_in(RequestStatus::PendingBatch, bounds).await?;
        let mut report = BatchReport::empty(day);
        if requests.is_empty() {
            info!(%day, "batch: no pending requests");
            return Ok(report);
        }
        if requests.len() > MAX_BATCH_REQUESTS {
            return Err(EngineError::LimitExceeded("too many pending requests for one batch"));
        }

        let priorities: Vec<i64> = db
            .read(|t| requests.iter().map(|r| t.priority_score(&r.user_id)).collect())
            .await?;
        for (req, p) in requests.iter().zip(&priorities) {
            if !(0..=PRIORITY_SCORE_EXPECTED_MAX).contains(p) {
                warn!(
                    request_id = %req.id,
                    user_id = %req.user_id,
                    priority_score = p,
                    "priority score outside the expected range"
                );
            }
        }

        let mut spots = db
            .spots_matching(&SpotFilter {
                kind: Some(SpotKind::Building),
                ..Default::default()
            })
            .await?;
        if spots.len() > MAX_BATCH_SPOTS {
            return Err(EngineError::LimitExceeded("too many building spots for one batch"));
        }
        spots.sort_by_key(|s| s.id);
        report.requests = requests.len();
        report.spots = spots.len();

        let mut confirmed = vec![false; requests.len()];
        if spots.is_empty() {
            info!(%day, requests = requests.len(), "batch: no building spots, waitlisting everything");
        } else {
            let matrix = build_cost_matrix(&requests, &priorities, &spots, self.settings.cost_base)?;
            let assignment = self.solver.solve(&matrix.costs);

            for (i, col) in assignment.into_iter().enumerate() {
                let Some(j) = col else { continue };
                if !matrix.eligible[i][j] {
                    continue;
                }
                match self.commit_pair(&requests[i], spots[j].id).await {
                    Ok(Some(booking_id)) => {
                        confirmed[i] = true;
                        report.confirmed.push(Assignment {
                            request_id: requests[i].id,
                            spot_id: spots[j].id,
                            booking_id,
                        });
                    }
                    Ok(None) => report.failed_pairs += 1,
                    Err(e) => {
                        report.failed_pairs += 1;
                        warn!(
                            request_id = %requests[i].id,
                            spot_id = %spots[j].id,
                            error = %e,
                            "batch pair failed to commit"
                        );
                    }
                }
            }
        }

        for (req, _) in requests.iter().zip(&confirmed).filter(|(_, ok)| !**ok) {
            match self.waitlist(req).await {
                Ok(true) => report.waitlisted.push(req.id),
                Ok(false) => {}
                Err(e) => error!(request_id = %req.id, error = %e, "failed to move request to waiting queue"),
            }
        }

        metrics::counter!(observability::BATCH_REQUESTS_TOTAL, "outcome" => "confirmed")
            .increment(report.confirmed.len() as u64);
        metrics::counter!(observability::BATCH_REQUESTS_TOTAL, "outcome" => "waitlisted")
            .increment(report.waitlisted.len() as u64);
        metrics::counter!(observability::BATCH_REQUESTS_TOTAL, "outcome" => "failed")
            .increment(report.failed_pairs as u64);
        info!(
            %day,
            requests = report.requests,
            spots = report.spots,
            confirmed = report.confirmed.len(),
            waitlisted = report.waitlisted.len(),
            failed_pairs = report.failed_pairs,
            "batch complete"
        );
        Ok(report)
    }

    /// Book `spot_id` for `request` in one transaction that also confirms the
    /// request and adjusts the requester's priority. `None` if the request or
    /// the window changed since the matrix was built.
    async fn commit_pair(
        &self,
        request: &ParkingRequest,
        spot_id: Ulid,
    ) -> Result<Option<Ulid>, EngineError> {
        let _spot_guard = self.engine.lock_spot(spot_id).await;
        let mut txn = self.engine.db.begin().await?;

        if txn.request(&request.id).map(|r| r.status) != Some(RequestStatus::PendingBatch) {
            debug!(request_id = %request.id, "request left pending state before commit");
            return Ok(None);
        }
        let Some(spot) = txn.spot(&spot_id).cloned() else {
            return Ok(None);
        };
        let Some(window) = spot.containing_window(&request.span).cloned() else {
            debug!(request_id = %request.id, spot_id = %spot_id, "window consumed since matrix build");
            return Ok(None);
        };

        let details = BookingDetails {
            base_rate: None,
            kind: BookingKind::Batch,
        };
        let Some(staged) = AllocationEngine::stage_booking(
            &mut txn,
            &spot,
            &window,
            request.span,
            request.user_id,
            &details,
        ) else {
            return Ok(None);
        };
        txn.update_request(request.id, RequestStatus::Confirmed, Some(spot_id));
        if self.settings.priority_delta != 0 {
            txn.adjust_priority(request.user_id, self.settings.priority_delta);
        }
        txn.commit().await?;

        self.engine.finish_booking(&staged, Some(request.id));
        Ok(Some(staged.booking.id))
    }

    /// PendingBatch → WaitingQueue. `false` if the request already moved on.
    async fn waitlist(&self, request: &ParkingRequest) -> Result<bool, EngineError> {
        let mut txn = self.engine.db.begin().await?;
        if txn.request(&request.id).map(|r| r.status) != Some(RequestStatus::PendingBatch) {
            return Ok(false);
        }
        txn.update_request(request.id, RequestStatus::WaitingQueue, None);
        txn.commit().await?;
        self.engine.notify.send(
            request.user_id,
            Notice::RequestWaitlisted {
                request_id: request.id,
                span: request.span,
            },
        );
        Ok(true)
    }

    /// Put a waitlisted request back in line for the next batch.
    pub async fn requeue(&self, request_id: Ulid) -> Result<(), EngineError> {
        self.transition(request_id, None, &[RequestStatus::WaitingQueue], RequestStatus::PendingBatch)
            .await
    }

    /// Withdraw a request that has not been confirmed.
    pub async fn cancel_request(&self, request_id: Ulid, user_id: Ulid) -> Result<(), EngineError> {
        self.transition(
            request_id,
            Some(user_id),
            &[RequestStatus::PendingBatch, RequestStatus::WaitingQueue],
            RequestStatus::Cancelled,
        )
        .await
    }

    async fn transition(
        &self,
        request_id: Ulid,
        owner: Option<Ulid>,
        from: &[RequestStatus],
        to: RequestStatus,
    ) -> Result<(), EngineError> {
        let mut txn = self.engine.db.begin().await?;
        let request = txn
            .request(&request_id)
            .ok_or(EngineError::NotFound(request_id))?;
        if let Some(user) = owner
            && request.user_id != user
        {
            return Err(EngineError::NotOwner {
                user,
                entity: request_id,
            });
        }
        if !from.contains(&request.status) {
            return Err(EngineError::InvalidTransition(request_id));
        }
        txn.update_request(request_id, to, None);
        txn.commit().await?;
        debug!(request_id = %request_id, ?to, "request status changed");
        Ok(())
    }
}
