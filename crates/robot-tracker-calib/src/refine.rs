//! Nonlinear least-squares refinement on top of the `levenberg-marquardt` crate.
//!
//! Residuals are supplied as a closure over the full parameter vector; only the
//! parameters marked free are packed into the solver, and the Jacobian is taken
//! by forward differences.

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::{storage::Owned, DMatrix, DVector, Dyn};

use crate::{CalibrationError, CancelToken};

#[derive(Clone, Copy, Debug)]
pub(crate) struct LmOptions {
    /// Evaluation budget, in multiples of `free parameters + 1`.
    pub patience: usize,
    pub ftol: f64,
    pub xtol: f64,
    pub gtol: f64,
}

impl Default for LmOptions {
    fn default() -> Self {
        Self {
            patience: 100,
            ftol: 1e-12,
            xtol: 1e-12,
            gtol: 1e-12,
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct LmReport {
    pub evaluations: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
}

struct FreeParams<'a, F> {
    residuals: &'a F,
    full: DVector<f64>,
    free: Vec<usize>,
    params: DVector<f64>,
    cancel: &'a CancelToken,
}

impl<F: Fn(&DVector<f64>) -> DVector<f64>> FreeParams<'_, F> {
    fn expand(&self, packed: &DVector<f64>) -> DVector<f64> {
        let mut x = self.full.clone();
        for (k, &i) in self.free.iter().enumerate() {
            x[i] = packed[k];
        }
        x
    }
}

impl<F: Fn(&DVector<f64>) -> DVector<f64>> LeastSquaresProblem<f64, Dyn, Dyn>
    for FreeParams<'_, F>
{
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &DVector<f64>) {
        self.params.clone_from(x);
    }

    fn params(&self) -> DVector<f64> {
        self.params.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        if self.cancel.is_cancelled() {
            return None;
        }
        Some((self.residuals)(&self.expand(&self.params)))
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        if self.cancel.is_cancelled() {
            return None;
        }
        let mut x = self.expand(&self.params);
        let r0 = (self.residuals)(&x);
        let mut j = DMatrix::zeros(r0.len(), self.free.len());
        for (c, &i) in self.free.iter().enumerate() {
            let value = x[i];
            let step = 1e-7 * value.abs().max(1.0);
            x[i] = value + step;
            let r = (self.residuals)(&x);
            x[i] = value;
            j.set_column(c, &((r - &r0) / step));
        }
        Some(j)
    }
}

/// Minimise `0.5 |r(x)|²` over the parameters marked in `free`.
///
/// Fixed parameters keep their value from `x0`. The result never costs more
/// than `x0`.
pub(crate) fn levenberg_marquardt(
    residuals: impl Fn(&DVector<f64>) -> DVector<f64>,
    x0: DVector<f64>,
    free: &[bool],
    opts: LmOptions,
    cancel: &CancelToken,
) -> Result<(DVector<f64>, LmReport), CalibrationError> {
    debug_assert_eq!(free.len(), x0.len());
    cancel.check()?;

    let initial_cost = 0.5 * residuals(&x0).norm_squared();
    let free: Vec<usize> = free
        .iter()
        .enumerate()
        .filter_map(|(i, f)| f.then_some(i))
        .collect();
    if free.is_empty() {
        let report = LmReport {
            evaluations: 0,
            initial_cost,
            final_cost: initial_cost,
        };
        return Ok((x0, report));
    }

    let params = DVector::from_iterator(free.len(), free.iter().map(|&i| x0[i]));
    let problem = FreeParams {
        residuals: &residuals,
        full: x0,
        free,
        params,
        cancel,
    };
    let lm = LevenbergMarquardt::new()
        .with_ftol(opts.ftol)
        .with_xtol(opts.xtol)
        .with_gtol(opts.gtol)
        .with_patience(opts.patience.max(1));
    let (problem, report) = lm.minimize(problem);
    cancel.check()?;

    let x = problem.expand(&problem.params);
    let final_cost = 0.5 * residuals(&x).norm_squared();
    if !final_cost.is_finite() || final_cost > initial_cost {
        log::debug!(
            "refinement did not improve ({:?}), keeping the initial estimate",
            report.termination
        );
        let report = LmReport {
            evaluations: report.number_of_evaluations,
            initial_cost,
            final_cost: initial_cost,
        };
        return Ok((problem.full, report));
    }
    Ok((
        x,
        LmReport {
            evaluations: report.number_of_evaluations,
            initial_cost,
            final_cost,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn fits_an_exponential_and_honours_fixed_parameters() {
        let ts: Vec<f64> = (0..20).map(|i| i as f64 * 0.1).collect();
        let ys: Vec<f64> = ts.iter().map(|t| 2.0 * (-1.3 * t).exp() + 0.5).collect();
        let residuals = |x: &DVector<f64>| {
            DVector::from_iterator(
                ts.len(),
                ts.iter()
                    .zip(&ys)
                    .map(|(t, y)| x[0] * (x[1] * t).exp() + x[2] - y),
            )
        };
        let x0 = DVector::from_vec(vec![1.0, -0.5, 0.5]);
        let (x, report) = levenberg_marquardt(
            residuals,
            x0,
            &[true, true, false],
            LmOptions::default(),
            &CancelToken::new(),
        )
        .expect("solve");
        assert_relative_eq!(x[0], 2.0, epsilon = 1e-5);
        assert_relative_eq!(x[1], -1.3, epsilon = 1e-5);
        assert_eq!(x[2], 0.5);
        assert!(report.final_cost < report.initial_cost);
        assert!(report.evaluations > 0);
    }

    #[test]
    fn cancelled_token_stops_before_the_first_iteration() {
        let token = CancelToken::new();
        token.cancel();
        let res = levenberg_marquardt(
            |x: &DVector<f64>| x.clone(),
            DVector::from_element(2, 1.0),
            &[true, true],
            LmOptions::default(),
            &token,
        );
        assert!(matches!(res, Err(CalibrationError::Cancelled)));
    }

    #[test]
    fn cancelling_mid_solve_aborts_the_minimisation() {
        let token = CancelToken::new();
        let calls = std::cell::Cell::new(0usize);
        let res = levenberg_marquardt(
            |x: &DVector<f64>| {
                calls.set(calls.get() + 1);
                if calls.get() == 3 {
                    token.cancel();
                }
                DVector::from_vec(vec![x[0] - 3.0, 10.0 * (x[1] - x[0] * x[0])])
            },
            DVector::from_vec(vec![-1.2, 1.0]),
            &[true, true],
            LmOptions::default(),
            &token,
        );
        assert!(matches!(res, Err(CalibrationError::Cancelled)));
    }
}
