//! Small dense-matrix helpers for covariance-aware scoring.

pub type Matrix = Vec<Vec<f64>>;

/// Column-wise z-scores of `rows` (each row one observation).
/// A column with zero variance is centred but not scaled.
pub fn zscore_columns(rows: &[Vec<f64>]) -> Matrix {
    let Some(width) = rows.first().map(Vec::len) else {
        return Vec::new();
    };
    let n = rows.len() as f64;
    let mut out: Matrix = rows.to_vec();
    for col in 0..width {
        let mean = rows.iter().map(|r| r[col]).sum::<f64>() / n;
        let var = rows.iter().map(|r| (r[col] - mean).powi(2)).sum::<f64>() / n;
        let std = if var > 0.0 { var.sqrt() } else { 1.0 };
        for (o, r) in out.iter_mut().zip(rows) {
            o[col] = (r[col] - mean) / std;
        }
    }
    out
}

/// Sample covariance (n − 1 denominator) with `epsilon` added on the
/// diagonal. Fewer than two rows yields `epsilon · I`.
pub fn regularized_covariance(rows: &[Vec<f64>], width: usize, epsilon: f64) -> Matrix {
    let mut cov = vec![vec![0.0; width]; width];
    if rows.len() >= 2 {
        let n = rows.len() as f64;
        let means: Vec<f64> = (0..width)
            .map(|c| rows.iter().map(|r| r[c]).sum::<f64>() / n)
            .collect();
        for i in 0..width {
            for j in i..width {
                let s = rows
                    .iter()
                    .map(|r| (r[i] - means[i]) * (r[j] - means[j]))
                    .sum::<f64>()
                    / (n - 1.0);
                cov[i][j] = s;
                cov[j][i] = s;
            }
        }
    }
    for (i, row) in cov.iter_mut().enumerate() {
        row[i] += epsilon;
    }
    cov
}

/// Gauss-Jordan inversion with partial pivoting. `None` if singular.
pub fn invert(m: &[Vec<f64>]) -> Option<Matrix> {
    let n = m.len();
    let mut a: Matrix = m.to_vec();
    let mut inv: Matrix = (0..n)
        .map(|i| (0..n).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
        .collect();

    for col in 0..n {
        // Row with the largest magnitude in this column becomes the pivot.
        let pivot_row = (col..n).max_by(|&x, &y| a[x][col].abs().total_cmp(&a[y][col].abs()))?;
        if a[pivot_row][col].abs() < 1e-12 {
            return None;
        }
        a.swap(col, pivot_row);
        inv.swap(col, pivot_row);

        let pivot = a[col][col];
        for j in 0..n {
            a[col][j] /= pivot;
            inv[col][j] /= pivot;
        }

        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = a[row][col];
            if factor == 0.0 {
                continue;
            }
            for j in 0..n {
                let (da, dinv) = (factor * a[col][j], factor * inv[col][j]);
                a[row][j] -= da;
                inv[row][j] -= dinv;
            }
        }
    }
    Some(inv)
}

/// `vᵀ · m · v`
pub fn quadratic_form(v: &[f64], m: &[Vec<f64>]) -> f64 {
    let mut acc = 0.0;
    for (i, vi) in v.iter().enumerate() {
        for (j, vj) in v.iter().enumerate() {
            acc += vi * m[i][j] * vj;
        }
    }
    acc
}

/// Per-column minimum.
pub fn column_min(rows: &[Vec<f64>], width: usize) -> Vec<f64> {
    (0..width)
        .map(|c| rows.iter().map(|r| r[c]).fold(f64::INFINITY, f64::min))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn zscore_has_zero_mean_unit_variance() {
        let rows = vec![vec![1.0, 10.0], vec![2.0, 20.0], vec![3.0, 60.0]];
        let z = zscore_columns(&rows);
        for c in 0..2 {
            let mean: f64 = z.iter().map(|r| r[c]).sum::<f64>() / 3.0;
            let var: f64 = z.iter().map(|r| r[c].powi(2)).sum::<f64>() / 3.0;
            assert!(approx(mean, 0.0));
            assert!(approx(var, 1.0));
        }
    }

    #[test]
    fn zscore_constant_column_does_not_divide_by_zero() {
        let rows = vec![vec![5.0, 1.0], vec![5.0, 3.0]];
        let z = zscore_columns(&rows);
        assert_eq!(z[0][0], 0.0);
        assert_eq!(z[1][0], 0.0);
        assert!(z.iter().all(|r| r.iter().all(|v| v.is_finite())));
    }

    #[test]
    fn single_row_covariance_is_epsilon_identity() {
        let cov = regularized_covariance(&[vec![0.0, 0.0]], 2, 1e-6);
        assert_eq!(cov, vec![vec![1e-6, 0.0], vec![0.0, 1e-6]]);
        let inv = invert(&cov).unwrap();
        assert!(approx(inv[0][0], 1e6));
        assert!(approx(inv[0][1], 0.0));
    }

    #[test]
    fn perfectly_correlated_columns_still_invert_with_epsilon() {
        let rows = vec![vec![-1.0, -1.0], vec![1.0, 1.0]];
        assert!(invert(&regularized_covariance(&rows, 2, 0.0)).is_none());
        assert!(invert(&regularized_covariance(&rows, 2, 1e-6)).is_some());
    }

    #[test]
    fn invert_needs_pivoting() {
        // Zero on the leading diagonal forces a row swap.
        let m = vec![vec![0.0, 2.0], vec![3.0, 1.0]];
        let inv = invert(&m).unwrap();
        // m · inv = I
        for i in 0..2 {
            for j in 0..2 {
                let v: f64 = (0..2).map(|k| m[i][k] * inv[k][j]).sum();
                assert!(approx(v, if i == j { 1.0 } else { 0.0 }));
            }
        }
    }

    #[test]
    fn invert_three_by_three() {
        let m = vec![
            vec![4.0, 7.0, 2.0],
            vec![3.0, 6.0, 1.0],
            vec![2.0, 5.0, 3.0],
        ];
        let inv = invert(&m).unwrap();
        for i in 0..3 {
            for j in 0..3 {
                let v: f64 = (0..3).map(|k| m[i][k] * inv[k][j]).sum();
                assert!(approx(v, if i == j { 1.0 } else { 0.0 }), "({i},{j}) = {v}");
            }
        }
    }

    #[test]
    fn quadratic_form_identity_is_squared_norm() {
        let id = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        assert!(approx(quadratic_form(&[3.0, 4.0], &id), 25.0));
    }

    #[test]
    fn column_min_picks_each_minimum() {
        let rows = vec![vec![1.0, 9.0], vec![4.0, -2.0]];
        assert_eq!(column_min(&rows, 2), vec![1.0, -2.0]);
    }
}
