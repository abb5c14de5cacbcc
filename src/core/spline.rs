//! Natural cubic spline interpolation for temporal pixel series.
//!
//! The interpolant passes exactly through every sample (no smoothing) and the
//! boundary cubic pieces are extended for evaluation outside the sampled range.

use crate::types::{GapfillError, GapfillResult};
use num_traits::Float;

/// Exact natural cubic interpolant through a strictly increasing sample grid.
///
/// With two samples the natural end conditions collapse the fit to the straight
/// line through them, so sparse series still evaluate sensibly everywhere.
#[derive(Debug, Clone)]
pub struct CubicSpline<T: Float> {
    xs: Vec<T>,
    ys: Vec<T>,
    /// Second derivative at each knot; zero at both ends (natural conditions)
    second: Vec<T>,
}

impl<T: Float> CubicSpline<T> {
    /// Fit the interpolant. `xs` must be strictly increasing and hold at least
    /// two samples.
    pub fn fit(xs: &[T], ys: &[T]) -> GapfillResult<Self> {
        let n = xs.len();
        if ys.len() != n {
            return Err(GapfillError::ShapeMismatch {
                what: "spline samples".to_string(),
                expected: format!("{} ordinates", n),
                actual: format!("{} ordinates", ys.len()),
            });
        }
        if n < 2 {
            return Err(GapfillError::DegenerateSeries {
                valid: n,
                required: 2,
            });
        }
        if xs.windows(2).any(|pair| pair[1] <= pair[0]) {
            return Err(GapfillError::Processing(
                "spline abscissae must be strictly increasing".to_string(),
            ));
        }

        let second = solve_natural_system(xs, ys);
        Ok(Self {
            xs: xs.to_vec(),
            ys: ys.to_vec(),
            second,
        })
    }

    /// Evaluate at `x`. Outside the sampled range the nearest boundary cubic
    /// piece is extended.
    pub fn evaluate(&self, x: T) -> T {
        let seg = self.segment_of(x);
        let (x0, x1) = (self.xs[seg], self.xs[seg + 1]);
        let (y0, y1) = (self.ys[seg], self.ys[seg + 1]);
        let (m0, m1) = (self.second[seg], self.second[seg + 1]);
        let h = x1 - x0;
        let two = T::one() + T::one();
        let six = two * (two + T::one());

        let a = x1 - x;
        let b = x - x0;
        m0 * a * a * a / (six * h)
            + m1 * b * b * b / (six * h)
            + (y0 / h - m0 * h / six) * a
            + (y1 / h - m1 * h / six) * b
    }

    /// Evaluate at every point of `grid` in order.
    pub fn evaluate_many(&self, grid: &[T]) -> Vec<T> {
        grid.iter().map(|&x| self.evaluate(x)).collect()
    }

    /// Index of the cubic piece covering `x`, clamped to the boundary pieces.
    fn segment_of(&self, x: T) -> usize {
        let below = self.xs.partition_point(|&knot| knot <= x);
        below.saturating_sub(1).min(self.xs.len() - 2)
    }
}

/// Solve the natural tridiagonal system for the knot second derivatives.
fn solve_natural_system<T: Float>(xs: &[T], ys: &[T]) -> Vec<T> {
    let n = xs.len();
    let mut second = vec![T::zero(); n];
    if n == 2 {
        return second;
    }

    let two = T::one() + T::one();
    let six = two * (two + T::one());

    // Thomas algorithm over the n-2 interior knots
    let mut diag = vec![T::zero(); n];
    let mut rhs = vec![T::zero(); n];
    for i in 1..n - 1 {
        let h_lo = xs[i] - xs[i - 1];
        let h_hi = xs[i + 1] - xs[i];
        let slope_lo = (ys[i] - ys[i - 1]) / h_lo;
        let slope_hi = (ys[i + 1] - ys[i]) / h_hi;
        let mut b = two * (h_lo + h_hi);
        let mut d = six * (slope_hi - slope_lo);
        if i > 1 {
            // Sub-diagonal of this row equals the super-diagonal of the
            // previous one, both being the shared interval width.
            let factor = h_lo / diag[i - 1];
            b = b - factor * h_lo;
            d = d - factor * rhs[i - 1];
        }
        diag[i] = b;
        rhs[i] = d;
    }
    for i in (1..n - 1).rev() {
        let h_hi = xs[i + 1] - xs[i];
        second[i] = (rhs[i] - h_hi * second[i + 1]) / diag[i];
    }
    second
}
