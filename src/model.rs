//! Ordinary least squares on the standardized design matrix.
//!
//! The weights are solved with an SVD rather than the normal equations, so
//! collinear feature columns (e.g. mean and mean |x| of a positive image)
//! give the minimum-norm solution instead of an ill-conditioned inverse.
use log::{info, warn};
use nalgebra::DMatrix;
use ndarray::Array2;

use crate::error::PipelineError;

const SVD_MAX_ITER: usize = 10_000;

fn to_dmatrix(a: &Array2<f64>) -> DMatrix<f64> {
    let (rows, cols) = a.dim();
    DMatrix::from_fn(rows, cols, |i, j| a[(i, j)])
}

/// Weight matrix of shape (features + 1, targets).
#[derive(Debug, Clone)]
pub struct LinearModel {
    weights: Array2<f64>,
}

impl LinearModel {
    /// Minimise ||x W - y||² over W. No masking or regularization happens here.
    pub fn fit(x: &Array2<f64>, y: &Array2<f64>) -> Result<Self, PipelineError> {
        let (rows, cols) = x.dim();
        if y.nrows() != rows {
            return Err(PipelineError::Shape {
                context: "regression targets",
                expected: rows,
                found: y.nrows(),
            });
        }
        let singular = |rank: usize, reason: &str| PipelineError::SingularSystem {
            rows,
            cols,
            rank,
            reason: reason.to_owned(),
        };
        if rows == 0 || cols == 0 {
            return Err(singular(0, "empty design matrix"));
        }
        if x.iter().chain(y.iter()).any(|v| !v.is_finite()) {
            return Err(singular(0, "non-finite entries"));
        }

        let svd = to_dmatrix(x)
            .try_svd(true, true, f64::EPSILON, SVD_MAX_ITER)
            .ok_or_else(|| singular(0, "SVD did not converge"))?;
        let max_sv = svd.singular_values.max();
        let tol = f64::EPSILON * max_sv * rows.max(cols) as f64;
        let rank = svd.rank(tol);
        if rank == 0 {
            return Err(singular(rank, "all singular values are zero"));
        }
        if rank < cols {
            warn!("Rank deficient design ({rank} of {cols}), using minimum-norm solution");
        }

        let w = svd
            .solve(&to_dmatrix(y), tol)
            .map_err(|e| singular(rank, e))?;
        if w.iter().any(|v| !v.is_finite()) {
            return Err(singular(rank, "solution has non-finite weights"));
        }
        info!("Fitted {}x{} weights on {} rows", w.nrows(), w.ncols(), rows);

        Ok(LinearModel {
            weights: Array2::from_shape_fn((w.nrows(), w.ncols()), |(i, j)| w[(i, j)]),
        })
    }

    pub fn weights(&self) -> &Array2<f64> {
        &self.weights
    }

    pub fn predict(&self, x: &Array2<f64>) -> Result<Array2<f64>, PipelineError> {
        if x.ncols() != self.weights.nrows() {
            return Err(PipelineError::Shape {
                context: "prediction features",
                expected: self.weights.nrows(),
                found: x.ncols(),
            });
        }
        Ok(x.dot(&self.weights))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use linfa::prelude::*;
    use linfa_linear::LinearRegression;
    use ndarray::{array, s, Array1, Axis};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn recovers_exact_linear_weights() {
        let mut rng = StdRng::seed_from_u64(7);
        let x = Array2::from_shape_fn((40, 4), |(_, j)| {
            if j == 3 { 1.0 } else { rng.random_range(-2.0..2.0) }
        });
        let w_true = array![[1.5, -0.5], [0.0, 2.0], [-3.0, 0.25], [4.0, -1.0]];
        let y = x.dot(&w_true);

        let model = LinearModel::fit(&x, &y).unwrap();
        for (w, t) in model.weights().iter().zip(w_true.iter()) {
            assert_abs_diff_eq!(*w, *t, epsilon = 1e-9);
        }
        let y_hat = model.predict(&x).unwrap();
        for (p, t) in y_hat.iter().zip(y.iter()) {
            assert_abs_diff_eq!(*p, *t, epsilon = 1e-9);
        }
    }

    #[test]
    fn agrees_with_linfa_on_single_target() {
        let mut rng = StdRng::seed_from_u64(11);
        let features = Array2::from_shape_fn((30, 3), |_| rng.random_range(0.0..5.0));
        let noise: Array1<f64> = (0..30).map(|_| rng.random_range(-0.1..0.1)).collect();
        let y = features.column(0).mapv(|v| 2.0 * v) - &features.column(2) + 7.0 + &noise;

        let reference = LinearRegression::new()
            .fit(&Dataset::new(features.clone(), y.clone()))
            .unwrap();

        let mut design = Array2::ones((30, 4));
        design.slice_mut(s![.., ..3]).assign(&features);
        let model = LinearModel::fit(&design, &y.insert_axis(Axis(1))).unwrap();
        let w = model.weights().column(0).to_owned();

        for (ours, theirs) in w.iter().take(3).zip(reference.params().iter()) {
            assert_abs_diff_eq!(*ours, *theirs, epsilon = 1e-6);
        }
        assert_abs_diff_eq!(w[3], reference.intercept(), epsilon = 1e-6);
    }

    #[test]
    fn zero_design_matrix_is_singular() {
        let x = Array2::<f64>::zeros((5, 3));
        let y = Array2::<f64>::ones((5, 1));
        let err = LinearModel::fit(&x, &y).unwrap_err();
        assert!(matches!(err, PipelineError::SingularSystem { rank: 0, .. }));
    }

    #[test]
    fn mismatched_rows_are_rejected() {
        let x = Array2::<f64>::ones((4, 2));
        let y = Array2::<f64>::ones((3, 1));
        assert!(matches!(
            LinearModel::fit(&x, &y),
            Err(PipelineError::Shape { .. })
        ));
    }
}
