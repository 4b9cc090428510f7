//! Minimum-cost rectangular assignment (Kuhn–Munkres with potentials).

/// Solves a rectangular assignment problem.
///
/// Implementations return, for every row, the column it is matched to.
/// Exactly `min(rows, cols)` rows are matched.
pub trait AssignmentSolver: Send + Sync {
    fn solve(&self, costs: &[Vec<i64>]) -> Vec<Option<usize>>;
}

/// O(n²·m) Hungarian algorithm over `i64` costs.
///
/// Costs must stay well inside `i64` range: potentials accumulate sums of
/// up to `rows + cols` entries.
#[derive(Debug, Default, Clone, Copy)]
pub struct Hungarian;

impl AssignmentSolver for Hungarian {
    fn solve(&self, costs: &[Vec<i64>]) -> Vec<Option<usize>> {
        let rows = costs.len();
        let cols = costs.first().map_or(0, Vec::len);
        if rows == 0 || cols == 0 {
            return vec![None; rows];
        }
        if rows <= cols {
            return solve_wide(costs, rows, cols);
        }

        // More rows than columns: solve the transpose, then invert.
        let transposed: Vec<Vec<i64>> = (0..cols)
            .map(|j| (0..rows).map(|i| costs[i][j]).collect())
            .collect();
        let by_col = solve_wide(&transposed, cols, rows);
        let mut by_row = vec![None; rows];
        for (j, row) in by_col.into_iter().enumerate() {
            if let Some(i) = row {
                by_row[i] = Some(j);
            }
        }
        by_row
    }
}

/// Requires `n <= m`. Every row is matched.
fn solve_wide(a: &[Vec<i64>], n: usize, m: usize) -> Vec<Option<usize>> {
    const INF: i64 = i64::MAX / 4;

    // 1-indexed; index 0 is the virtual root column/row.
    let mut u = vec![0i64; n + 1];
    let mut v = vec![0i64; m + 1];
    let mut p = vec![0usize; m + 1]; // column → matched row
    let mut way = vec![0usize; m + 1];

    for i in 1..=n {
        p[0] = i;
        let mut j0 = 0usize;
        let mut minv = vec![INF; m + 1];
        let mut used = vec![false; m + 1];
        loop {
            used[j0] = true;
            let i0 = p[j0];
            let mut delta = INF;
            let mut j1 = 0usize;
            for j in 1..=m {
                if used[j] {
                    continue;
                }
                let cur = a[i0 - 1][j - 1] - u[i0] - v[j];
                if cur < minv[j] {
                    minv[j] = cur;
                    way[j] = j0;
                }
                if minv[j] < delta {
                    delta = minv[j];
                    j1 = j;
                }
            }
            for j in 0..=m {
                if used[j] {
                    u[p[j]] += delta;
                    v[j] -= delta;
                } else {
                    minv[j] -= delta;
                }
            }
            j0 = j1;
            if p[j0] == 0 {
                break;
            }
        }
        // Augment along the alternating path.
        loop {
            let j1 = way[j0];
            p[j0] = p[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut assignment = vec![None; n];
    for j in 1..=m {
        if p[j] != 0 {
            assignment[p[j] - 1] = Some(j - 1);
        }
    }
    assignment
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn total(costs: &[Vec<i64>], assignment: &[Option<usize>]) -> i64 {
        assignment
            .iter()
            .enumerate()
            .filter_map(|(i, j)| j.map(|j| costs[i][j]))
            .sum()
    }

    /// Exhaustive minimum over all injective row→column maps of size min(n, m).
    fn brute_force(costs: &[Vec<i64>]) -> i64 {
        fn go(costs: &[Vec<i64>], row: usize, used: &mut Vec<bool>, left: usize) -> i64 {
            let rows = costs.len();
            if left == 0 {
                return 0;
            }
            if rows - row < left {
                return i64::MAX;
            }
            // Leave this row unmatched.
            let mut best = go(costs, row + 1, used, left);
            for j in 0..used.len() {
                if !used[j] {
                    used[j] = true;
                    let rest = go(costs, row + 1, used, left - 1);
                    if rest != i64::MAX {
                        best = best.min(costs[row][j] + rest);
                    }
                    used[j] = false;
                }
            }
            best
        }
        let cols = costs[0].len();
        let k = costs.len().min(cols);
        go(costs, 0, &mut vec![false; cols], k)
    }

    fn assert_valid(assignment: &[Option<usize>], rows: usize, cols: usize) {
        assert_eq!(assignment.len(), rows);
        let matched: Vec<usize> = assignment.iter().flatten().copied().collect();
        assert_eq!(matched.len(), rows.min(cols));
        let mut dedup = matched.clone();
        dedup.sort_unstable();
        dedup.dedup();
        assert_eq!(dedup.len(), matched.len(), "column used twice");
        assert!(matched.iter().all(|&j| j < cols));
    }

    #[test]
    fn classic_square() {
        let costs = vec![vec![4, 1, 3], vec![2, 0, 5], vec![3, 2, 2]];
        let a = Hungarian.solve(&costs);
        assert_valid(&a, 3, 3);
        assert_eq!(total(&costs, &a), 5);
    }

    #[test]
    fn wide_matrix_leaves_columns_unused() {
        let costs = vec![vec![9, 2, 7, 8], vec![6, 4, 3, 7]];
        let a = Hungarian.solve(&costs);
        assert_valid(&a, 2, 4);
        assert_eq!(a, vec![Some(1), Some(2)]);
    }

    #[test]
    fn tall_matrix_leaves_rows_unmatched() {
        let costs = vec![vec![5], vec![1], vec![3]];
        let a = Hungarian.solve(&costs);
        assert_eq!(a, vec![None, Some(0), None]);
    }

    #[test]
    fn empty_inputs() {
        assert!(Hungarian.solve(&[]).is_empty());
        assert_eq!(Hungarian.solve(&[vec![], vec![]]), vec![None, None]);
    }

    #[test]
    fn negative_costs() {
        let costs = vec![vec![-5, 0], vec![0, -7]];
        let a = Hungarian.solve(&costs);
        assert_eq!(a, vec![Some(0), Some(1)]);
    }

    #[test]
    fn matches_brute_force_on_random_matrices() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..200 {
            let rows = rng.gen_range(1..=6);
            let cols = rng.gen_range(1..=6);
            let costs: Vec<Vec<i64>> = (0..rows)
                .map(|_| (0..cols).map(|_| rng.gen_range(-50..100)).collect())
                .collect();
            let a = Hungarian.solve(&costs);
            assert_valid(&a, rows, cols);
            assert_eq!(total(&costs, &a), brute_force(&costs), "costs {costs:?}");
        }
    }
}
