//! Gaussian-process regression with a fixed RBF kernel.
//!
//! This is the non-parametric reconstruction variant. Unlike the spline it
//! tolerates a single observation (the fit degenerates to a constant) and it
//! reverts toward the sample mean far from any observation instead of
//! extrapolating a polynomial piece.

use crate::types::{GapfillError, GapfillResult};
use nalgebra::{Cholesky, DMatrix, DVector, Dyn};

/// Kernel hyperparameters for [`KrigingModel`].
///
/// The values are fixed per fit; there is no marginal-likelihood optimization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KrigingParams {
    /// RBF correlation length in days
    pub length_scale: f64,
    /// Prior variance of the signal around its mean
    pub signal_variance: f64,
    /// Diagonal regularization added to the Gram matrix
    pub nugget: f64,
}

impl Default for KrigingParams {
    fn default() -> Self {
        Self {
            length_scale: 30.0,
            signal_variance: 1.0,
            nugget: 1e-6,
        }
    }
}

/// One fitted pixel-band series, ready for prediction on any day grid.
#[derive(Debug, Clone)]
pub struct KrigingModel {
    params: KrigingParams,
    xs: Vec<f64>,
    mean: f64,
    /// Precomputed `(K + nugget I)^-1 (y - mean)`
    weights: DVector<f64>,
}

impl KrigingModel {
    /// Fit the regressor to samples at `xs`. At least one sample is required;
    /// with exactly one the prediction is constant at that value.
    pub fn fit(xs: &[f64], ys: &[f64], params: KrigingParams) -> GapfillResult<Self> {
        let n = xs.len();
        if ys.len() != n {
            return Err(GapfillError::ShapeMismatch {
                what: "kriging samples".to_string(),
                expected: format!("{} ordinates", n),
                actual: format!("{} ordinates", ys.len()),
            });
        }
        if n == 0 {
            return Err(GapfillError::DegenerateSeries {
                valid: 0,
                required: 1,
            });
        }

        let mean = ys.iter().sum::<f64>() / n as f64;
        let centered = DVector::from_iterator(n, ys.iter().map(|&y| y - mean));

        let mut gram = DMatrix::zeros(n, n);
        for i in 0..n {
            for j in i..n {
                let k = rbf(xs[i] - xs[j], &params);
                gram[(i, j)] = k;
                gram[(j, i)] = k;
            }
        }

        let factor = factor_with_escalation(&gram, params.nugget)?;
        let weights = factor.solve(&centered);

        Ok(Self {
            params,
            xs: xs.to_vec(),
            mean,
            weights,
        })
    }

    /// Posterior mean at `x`.
    pub fn predict(&self, x: f64) -> f64 {
        let covariance: f64 = self
            .xs
            .iter()
            .zip(self.weights.iter())
            .map(|(&xi, &w)| rbf(x - xi, &self.params) * w)
            .sum();
        self.mean + covariance
    }

    /// Posterior mean at every point of `grid` in order.
    pub fn predict_many(&self, grid: &[f64]) -> Vec<f64> {
        grid.iter().map(|&x| self.predict(x)).collect()
    }
}

fn rbf(distance: f64, params: &KrigingParams) -> f64 {
    let scaled = distance / params.length_scale;
    params.signal_variance * (-0.5 * scaled * scaled).exp()
}

/// Cholesky-factor the regularized Gram matrix. Dense day grids push RBF Gram
/// matrices numerically indefinite, so the nugget escalates before giving up.
fn factor_with_escalation(
    gram: &DMatrix<f64>,
    nugget: f64,
) -> GapfillResult<Cholesky<f64, Dyn>> {
    let n = gram.nrows();
    for boost in [1.0, 1e2, 1e4] {
        let regularized = gram + DMatrix::identity(n, n) * (nugget * boost);
        if let Some(factor) = regularized.cholesky() {
            return Ok(factor);
        }
    }
    Err(GapfillError::Processing(format!(
        "kriging covariance matrix ({0}x{0}) is not positive definite",
        n
    )))
}
