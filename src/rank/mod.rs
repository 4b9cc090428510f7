//! Private-spot search: hard filters, then covariance-aware (Mahalanobis)
//! ranking of the survivors against the requester's distance/price weights.

mod matrix;

pub use matrix::{invert, quadratic_form, regularized_covariance, zscore_columns};

use std::sync::Arc;

use chrono::NaiveDateTime;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::db::{Database, SpotFilter};
use crate::engine::{EngineError, ValidationError};
use crate::geo::{haversine_km, LatLon};
use crate::limits::MAX_SEARCH_RESULTS;
use crate::model::*;
use crate::observability;
use crate::time;

const FEATURES: usize = 2;

/// Importance the requester gives to each feature, each in `[1, 5]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Weights {
    pub distance: u8,
    pub price: u8,
}

impl Weights {
    pub fn new(distance: u8, price: u8) -> Result<Self, ValidationError> {
        for w in [distance, price] {
            if !(1..=5).contains(&w) {
                return Err(ValidationError::WeightOutOfRange(w));
            }
        }
        Ok(Self { distance, price })
    }

    fn as_vec(&self) -> [f64; FEATURES] {
        [f64::from(self.distance), f64::from(self.price)]
    }
}

impl Default for Weights {
    fn default() -> Self {
        Self { distance: 3, price: 3 }
    }
}

#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub point: LatLon,
    pub max_price: f64,
    /// Wall-clock times in `timezone`.
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub timezone: String,
    pub requester: Ulid,
    pub requires_charger: bool,
    pub charger_type: Option<ChargerType>,
    pub weights: Weights,
    pub max_results: usize,
}

/// One scored search hit. Lives for a single search.
#[derive(Debug, Clone, PartialEq)]
pub struct RankingCandidate {
    pub spot: Spot,
    pub distance_km: f64,
    pub price_ratio: f64,
    pub normalized: [f64; FEATURES],
    pub score: f64,
}

impl RankingCandidate {
    pub fn new(spot: Spot, distance_km: f64, price_ratio: f64) -> Self {
        Self {
            spot,
            distance_km,
            price_ratio,
            normalized: [0.0; FEATURES],
            score: 0.0,
        }
    }
}

/// Covariance regularization used when none is configured.
pub const DEFAULT_EPSILON: f64 = 1e-6;

/// Score and order candidates; lower score is better.
///
/// Deviations from the per-feature ideal are scaled by `weights` before the
/// quadratic form, so preference intensity acts on normalized units. The
/// score order is then adjusted so no candidate appears ahead of one that is
/// strictly closer and no more expensive.
pub fn rank(
    mut candidates: Vec<RankingCandidate>,
    weights: Weights,
    epsilon: f64,
    max_results: usize,
) -> Vec<RankingCandidate> {
    if candidates.is_empty() {
        return candidates;
    }

    let raw: Vec<Vec<f64>> = candidates
        .iter()
        .map(|c| vec![c.distance_km, c.price_ratio])
        .collect();
    let normalized = zscore_columns(&raw);
    let cov = regularized_covariance(&normalized, FEATURES, epsilon);
    let inv_cov = invert(&cov).unwrap_or_else(|| {
        warn!(?cov, "covariance not invertible, falling back to euclidean scoring");
        (0..FEATURES)
            .map(|i| (0..FEATURES).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
            .collect()
    });
    let ideal = matrix::column_min(&normalized, FEATURES);
    let w = weights.as_vec();

    for (c, row) in candidates.iter_mut().zip(&normalized) {
        let diff: Vec<f64> = (0..FEATURES).map(|k| (row[k] - ideal[k]) * w[k]).collect();
        c.normalized = [row[0], row[1]];
        c.score = quadratic_form(&diff, &inv_cov).max(0.0).sqrt();
    }

    candidates.sort_by(|a, b| a.score.total_cmp(&b.score).then(a.spot.id.cmp(&b.spot.id)));
    respect_dominance(candidates, max_results)
}

/// `a` is strictly closer than `b` and costs no more.
fn dominates(a: &RankingCandidate, b: &RankingCandidate) -> bool {
    a.distance_km < b.distance_km && a.price_ratio <= b.price_ratio
}

/// Stable reorder of a score-sorted list: repeatedly take the best-scored
/// candidate that no remaining candidate dominates. Dominance is acyclic
/// (distance strictly decreases), so some candidate is always free.
fn respect_dominance(sorted: Vec<RankingCandidate>, max_results: usize) -> Vec<RankingCandidate> {
    let n = sorted.len();
    let mut dominators: Vec<usize> = (0..n)
        .map(|j| (0..n).filter(|&i| dominates(&sorted[i], &sorted[j])).count())
        .collect();
    let mut taken = vec![false; n];
    let mut order = Vec::with_capacity(n.min(max_results));

    while order.len() < n.min(max_results) {
        let Some(next) = (0..n).find(|&i| !taken[i] && dominators[i] == 0) else {
            break;
        };
        taken[next] = true;
        order.push(next);
        for j in 0..n {
            if !taken[j] && dominates(&sorted[next], &sorted[j]) {
                dominators[j] -= 1;
            }
        }
    }

    let mut slots: Vec<Option<RankingCandidate>> = sorted.into_iter().map(Some).collect();
    order.into_iter().filter_map(|i| slots[i].take()).collect()
}

pub struct Ranker {
    db: Arc<Database>,
    epsilon: f64,
}

impl Ranker {
    pub fn new(db: Arc<Database>, epsilon: f64) -> Self {
        Self { db, epsilon }
    }

    /// Ranked private spots able to host the whole requested window.
    /// An empty result is a normal outcome, not an error.
    pub async fn search(&self, query: &SearchQuery) -> Result<Vec<RankingCandidate>, EngineError> {
        if !query.point.is_valid() {
            return Err(ValidationError::InvalidCoordinates.into());
        }
        if !(query.max_price.is_finite() && query.max_price > 0.0) {
            return Err(ValidationError::NonPositivePrice.into());
        }
        let tz = time::parse_tz(&query.timezone)?;
        let span = time::local_range_to_utc(query.start, query.end, tz)?;
        let max_results = query.max_results.min(MAX_SEARCH_RESULTS);

        let filter = SpotFilter {
            kind: Some(SpotKind::Private),
            requires_charger: query.requires_charger,
            charger_type: query.charger_type,
            exclude_owner: Some(query.requester),
        };
        let spots = self.db.spots_matching(&filter).await?;
        if spots.is_empty() {
            debug!(requester = %query.requester, "no private spots match hard filters");
            return Ok(Vec::new());
        }

        let candidates: Vec<RankingCandidate> = spots
            .into_iter()
            .filter(|s| s.hourly_price <= query.max_price && s.containing_window(&span).is_some())
            .map(|s| {
                let distance_km = haversine_km(query.point, LatLon::new(s.lat, s.lon));
                let price_ratio = s.hourly_price / query.max_price;
                RankingCandidate::new(s, distance_km, price_ratio)
            })
            .collect();
        if candidates.is_empty() {
            debug!(requester = %query.requester, "no private spot available for window and price");
            return Ok(Vec::new());
        }

        metrics::histogram!(observability::SEARCH_CANDIDATES).record(candidates.len() as f64);
        Ok(rank(candidates, query.weights, self.epsilon, max_results))
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    fn cand(distance_km: f64, price: f64, max_price: f64) -> RankingCandidate {
        RankingCandidate::new(
            Spot::new(SpotKind::Private, 0.0, 0.0, price),
            distance_km,
            price / max_price,
        )
    }

    fn order(ranked: &[RankingCandidate], ids: &[Ulid]) -> Vec<usize> {
        ranked
            .iter()
            .map(|c| ids.iter().position(|id| *id == c.spot.id).unwrap())
            .collect()
    }

    #[test]
    fn weights_validated() {
        assert!(Weights::new(1, 5).is_ok());
        assert_eq!(Weights::new(0, 3), Err(ValidationError::WeightOutOfRange(0)));
        assert_eq!(Weights::new(3, 6), Err(ValidationError::WeightOutOfRange(6)));
    }

    #[test]
    fn distance_heavy_user_prefers_close_spot() {
        let near = cand(1.0, 10.0, 20.0);
        let far = cand(5.0, 5.0, 20.0);
        let ids = [near.spot.id, far.spot.id];
        let ranked = rank(vec![far, near], Weights::new(5, 1).unwrap(), 1e-6, 10);
        assert_eq!(order(&ranked, &ids), vec![0, 1]);
        assert!(ranked[0].score < ranked[1].score);
    }

    #[test]
    fn price_heavy_user_prefers_cheap_spot() {
        let near = cand(1.0, 10.0, 20.0);
        let far = cand(5.0, 5.0, 20.0);
        let ids = [near.spot.id, far.spot.id];
        let ranked = rank(vec![near, far], Weights::new(1, 5).unwrap(), 1e-6, 10);
        assert_eq!(order(&ranked, &ids), vec![1, 0]);
    }

    #[test]
    fn single_candidate_scores_zero() {
        let ranked = rank(vec![cand(3.0, 4.0, 8.0)], Weights::default(), 1e-6, 10);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].score, 0.0);
        assert_eq!(ranked[0].normalized, [0.0, 0.0]);
    }

    #[test]
    fn identical_candidates_are_finite() {
        let a = cand(2.0, 4.0, 8.0);
        let b = cand(2.0, 4.0, 8.0);
        let ranked = rank(vec![a, b], Weights::default(), 1e-6, 10);
        assert!(ranked.iter().all(|c| c.score.is_finite()));
    }

    #[test]
    fn truncates_to_max_results() {
        let cands: Vec<_> = (0..10).map(|i| cand(f64::from(i), 5.0, 10.0)).collect();
        assert_eq!(rank(cands, Weights::default(), 1e-6, 3).len(), 3);
    }

    #[test]
    fn ranking_is_deterministic() {
        let cands = vec![cand(1.0, 8.0, 10.0), cand(2.0, 9.0, 10.0), cand(4.0, 2.0, 10.0)];
        let first = rank(cands.clone(), Weights::new(2, 4).unwrap(), 1e-6, 10);
        for _ in 0..5 {
            assert_eq!(rank(cands.clone(), Weights::new(2, 4).unwrap(), 1e-6, 10), first);
        }
    }

    /// Pools where price tracks distance (p ≈ 2d ± 1), the shape that skews
    /// the inverse covariance most.
    fn correlated_pool(rng: &mut StdRng) -> Vec<RankingCandidate> {
        let n = rng.gen_range(2..=8);
        (0..n)
            .map(|_| {
                let d: f64 = rng.gen_range(0.2..10.0);
                let price = (2.0 * d + rng.gen_range(-1.0..1.0)).max(0.5);
                cand(d, price, 25.0)
            })
            .collect()
    }

    fn pos(order: &[usize], i: usize) -> usize {
        order.iter().position(|&x| x == i).unwrap()
    }

    fn farther_and_not_cheaper(b: &RankingCandidate, a: &RankingCandidate) -> bool {
        b.distance_km > a.distance_km && b.price_ratio >= a.price_ratio
    }

    #[test]
    fn dominated_candidates_never_ahead_in_correlated_pools() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..500 {
            let pool = correlated_pool(&mut rng);
            for dw in 1..=5 {
                for pw in 1..=5 {
                    let ranked = rank(pool.clone(), Weights::new(dw, pw).unwrap(), DEFAULT_EPSILON, 10);
                    assert_eq!(ranked.len(), pool.len());
                    for (i, ahead) in ranked.iter().enumerate() {
                        for behind in &ranked[i + 1..] {
                            assert!(
                                !farther_and_not_cheaper(ahead, behind),
                                "weights ({dw},{pw}): ({}, {}) ahead of ({}, {})",
                                ahead.distance_km,
                                ahead.price_ratio,
                                behind.distance_km,
                                behind.price_ratio
                            );
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn raising_distance_weight_never_demotes_closer_spot() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let pool = correlated_pool(&mut rng);
            let ids: Vec<Ulid> = pool.iter().map(|c| c.spot.id).collect();
            for pw in 1..=5 {
                let mut previous: Option<Vec<usize>> = None;
                for dw in 1..=5 {
                    let ranked = rank(pool.clone(), Weights::new(dw, pw).unwrap(), DEFAULT_EPSILON, 10);
                    let o = order(&ranked, &ids);
                    if let Some(prev) = &previous {
                        for a in 0..pool.len() {
                            for b in 0..pool.len() {
                                if farther_and_not_cheaper(&pool[b], &pool[a]) && pos(prev, a) < pos(prev, b) {
                                    assert!(pos(&o, a) < pos(&o, b), "pw={pw} dw={dw}: {prev:?} -> {o:?}");
                                }
                            }
                        }
                    }
                    previous = Some(o);
                }
            }
        }
    }

    #[test]
    fn truncation_keeps_the_full_ranking_prefix() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..100 {
            let pool = correlated_pool(&mut rng);
            let full = rank(pool.clone(), Weights::new(4, 2).unwrap(), DEFAULT_EPSILON, 10);
            let top = rank(pool, Weights::new(4, 2).unwrap(), DEFAULT_EPSILON, 2);
            assert_eq!(top[..], full[..top.len()]);
        }
    }
}
