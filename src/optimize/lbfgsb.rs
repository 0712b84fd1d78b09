//! A box-constrained BFGS solver with the calling contract of L-BFGS-B.
//!
//! The quasi-Newton core keeps a dense inverse-Hessian approximation, as in
//! "Numerical Optimization" by Nocedal & Wright, and a line search that enforces
//! the Strong Wolfe conditions. Bounds are handled by projection:
//!
//! - the starting point is projected into the box,
//! - components sitting on a bound with the gradient pushing outward are frozen,
//! - every line search is capped at the first bound the step would cross.
//!
//! Termination is reported, not raised. [`LbfgsbSolution::warnflag`] and
//! [`LbfgsbSolution::task`] say why the solver stopped; the only `Err` a run
//! returns is one produced by the objective callback itself.

use ndarray::{Array1, Array2, Axis};

/// Why the solver stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Warnflag {
    /// A convergence criterion was met.
    Converged = 0,
    /// The iteration or evaluation limit was reached.
    LimitReached = 1,
    /// The line search failed or the problem is ill-posed.
    Abnormal = 2,
}

impl Warnflag {
    pub fn code(self) -> u8 {
        self as u8
    }
}

pub const TASK_PGTOL: &str = "CONVERGENCE: NORM_OF_PROJECTED_GRADIENT_<=_PGTOL";
pub const TASK_FACTR: &str = "CONVERGENCE: REL_REDUCTION_OF_F_<=_FACTR*EPSMCH";
pub const TASK_MAX_ITERATIONS: &str = "STOP: TOTAL NO. of ITERATIONS REACHED LIMIT";
pub const TASK_MAX_EVALUATIONS: &str = "STOP: TOTAL NO. of f AND g EVALUATIONS EXCEEDS LIMIT";
pub const TASK_LINE_SEARCH: &str = "ABNORMAL_TERMINATION_IN_LNSRCH";
pub const TASK_NON_FINITE: &str = "ABNORMAL: NON-FINITE FUNCTION OR GRADIENT";
pub const TASK_INFEASIBLE: &str = "ERROR: NO FEASIBLE SOLUTION";
pub const TASK_BOUNDS_LENGTH: &str = "ERROR: BOUNDS DO NOT MATCH THE NUMBER OF VARIABLES";

/// A summary of a finished optimization run.
#[derive(Debug, Clone)]
pub struct LbfgsbSolution {
    /// The last accepted point.
    pub final_point: Array1<f64>,
    /// The objective at `final_point`.
    pub final_value: f64,
    /// The gradient at `final_point`.
    pub final_gradient: Array1<f64>,
    /// The number of completed iterations.
    pub iterations: usize,
    /// The number of objective evaluations, each returning value and gradient.
    pub func_evals: usize,
    pub warnflag: Warnflag,
    /// A human-readable termination reason, one of the `TASK_*` constants.
    pub task: String,
}

/// A configurable bounded BFGS solver.
pub struct Lbfgsb<ObjFn> {
    x0: Array1<f64>,
    obj_fn: ObjFn,
    bounds: Option<Vec<(f64, f64)>>,
    factr: f64,
    pgtol: f64,
    max_iterations: usize,
    max_evaluations: usize,
    c1: f64,
    c2: f64,
}

impl<ObjFn> Lbfgsb<ObjFn> {
    /// Creates a new solver.
    ///
    /// # Arguments
    /// * `x0` - The initial guess for the minimum.
    /// * `obj_fn` - The objective function which returns `Ok((value, gradient))`.
    pub fn new(x0: Array1<f64>, obj_fn: ObjFn) -> Self {
        Self {
            x0,
            obj_fn,
            bounds: None,
            factr: 1e7,
            pgtol: 1e-5,
            max_iterations: 15000,
            max_evaluations: 15000,
            c1: 1e-4,
            c2: 0.9,
        }
    }

    /// One `(lower, upper)` pair per component. Infinite values leave a side open.
    pub fn with_bounds(mut self, bounds: Vec<(f64, f64)>) -> Self {
        self.bounds = Some(bounds);
        self
    }

    /// Stop once the relative reduction of `f` falls below `factr * f64::EPSILON`
    /// (default: 1e7).
    pub fn with_factr(mut self, factr: f64) -> Self {
        self.factr = factr;
        self
    }

    /// Stop once the largest projected gradient component is at most `pgtol`
    /// (default: 1e-5).
    pub fn with_pgtol(mut self, pgtol: f64) -> Self {
        self.pgtol = pgtol;
        self
    }

    /// Sets the maximum number of iterations (default: 15000).
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Sets the maximum number of objective evaluations (default: 15000).
    pub fn with_max_evaluations(mut self, max_evaluations: usize) -> Self {
        self.max_evaluations = max_evaluations;
        self
    }
}

impl<ObjFn> Lbfgsb<ObjFn> {
    /// Executes the solver.
    ///
    /// # Errors
    /// Only errors returned by the objective callback, which abort the run at once.
    pub fn run<E>(&self) -> Result<LbfgsbSolution, E>
    where
        ObjFn: Fn(&Array1<f64>) -> Result<(f64, Array1<f64>), E>,
    {
        let n = self.x0.len();
        let bounds = match &self.bounds {
            Some(bounds) => bounds.clone(),
            None => vec![(f64::NEG_INFINITY, f64::INFINITY); n],
        };
        let abort = |task: &str| LbfgsbSolution {
            final_point: self.x0.clone(),
            final_value: f64::NAN,
            final_gradient: Array1::from_elem(n, f64::NAN),
            iterations: 0,
            func_evals: 0,
            warnflag: Warnflag::Abnormal,
            task: task.to_string(),
        };
        if bounds.len() != n {
            return Ok(abort(TASK_BOUNDS_LENGTH));
        }
        if bounds.iter().any(|&(lower, upper)| !(lower <= upper)) {
            return Ok(abort(TASK_INFEASIBLE));
        }

        let mut x_k = project(&self.x0, &bounds);
        let (mut f_k, mut g_k) = (self.obj_fn)(&x_k)?;
        let mut func_evals = 1;
        let mut iterations = 0;

        let finish = |x: Array1<f64>,
                      f: f64,
                      g: Array1<f64>,
                      iterations: usize,
                      func_evals: usize,
                      warnflag: Warnflag,
                      task: &str| {
            log::debug!("L-BFGS-B stopped after {iterations} iterations: {task}");
            LbfgsbSolution {
                final_point: x,
                final_value: f,
                final_gradient: g,
                iterations,
                func_evals,
                warnflag,
                task: task.to_string(),
            }
        };

        if !f_k.is_finite() || g_k.iter().any(|g| !g.is_finite()) {
            return Ok(finish(x_k, f_k, g_k, 0, func_evals, Warnflag::Abnormal, TASK_NON_FINITE));
        }

        // `None` until the first successful update, which also fixes the initial scaling.
        let mut h_inv: Option<Array2<f64>> = None;

        loop {
            if projected_gradient_norm(&x_k, &g_k, &bounds) <= self.pgtol {
                return Ok(finish(x_k, f_k, g_k, iterations, func_evals, Warnflag::Converged, TASK_PGTOL));
            }
            if iterations >= self.max_iterations {
                return Ok(finish(x_k, f_k, g_k, iterations, func_evals, Warnflag::LimitReached, TASK_MAX_ITERATIONS));
            }
            if func_evals >= self.max_evaluations {
                return Ok(finish(x_k, f_k, g_k, iterations, func_evals, Warnflag::LimitReached, TASK_MAX_EVALUATIONS));
            }

            let free = free_mask(&x_k, &g_k, &bounds);
            let g_free: Array1<f64> = masked(&g_k, &free);

            let mut d_k = match &h_inv {
                Some(h) => masked(&(-h.dot(&g_free)), &free),
                None => -g_free.clone(),
            };
            block_outward(&mut d_k, &x_k, &bounds);
            if d_k.dot(&g_k) >= 0.0 {
                // The quasi-Newton direction went stale against the bounds.
                h_inv = None;
                d_k = -g_free.clone();
            }

            let alpha_max = max_step(&x_k, &d_k, &bounds);
            let alpha_init = if h_inv.is_none() && iterations == 0 {
                (1.0 / d_k.dot(&d_k).sqrt()).min(alpha_max)
            } else {
                alpha_max.min(1.0)
            };

            let search = LineSearch {
                x_k: &x_k,
                d_k: &d_k,
                f_k,
                dphi_0: g_k.dot(&d_k),
                alpha_max,
                c1: self.c1,
                c2: self.c2,
                bounds: &bounds,
            };
            let step = search.run(&self.obj_fn, alpha_init)?;
            func_evals += step.evals;

            let Some(Accepted { point: x_next, f: f_next, g: g_next }) = step.accepted else {
                if h_inv.is_some() {
                    log::trace!("Line search failed at iteration {iterations}; restarting from steepest descent.");
                    h_inv = None;
                    continue;
                }
                return Ok(finish(x_k, f_k, g_k, iterations, func_evals, Warnflag::Abnormal, TASK_LINE_SEARCH));
            };
            iterations += 1;

            if g_next.iter().any(|g| !g.is_finite()) {
                return Ok(finish(x_next, f_next, g_next, iterations, func_evals, Warnflag::Abnormal, TASK_NON_FINITE));
            }

            let s_k = &x_next - &x_k;
            let y_k = &g_next - &g_k;
            let reduction = (f_k - f_next) / f_k.abs().max(f_next.abs()).max(1.0);

            log::trace!("iteration {iterations}: f = {f_next:e}, reduction = {reduction:e}");

            x_k = x_next;
            f_k = f_next;
            g_k = g_next;

            if reduction <= self.factr * f64::EPSILON {
                return Ok(finish(x_k, f_k, g_k, iterations, func_evals, Warnflag::Converged, TASK_FACTR));
            }

            let sy = s_k.dot(&y_k);
            let yy = y_k.dot(&y_k);
            // Skip the update when the curvature pair carries no usable information.
            if !(sy > f64::EPSILON * yy) || yy <= 0.0 {
                continue;
            }

            // H_{k+1} = (I - ρ*s*yᵀ) * H_k * (I - ρ*y*sᵀ) + ρ*s*sᵀ
            let h = h_inv.take().unwrap_or_else(|| Array2::<f64>::eye(n) * (sy / yy));
            let rho = 1.0 / sy;
            let s_col = s_k.view().insert_axis(Axis(1));
            let y_col = y_k.view().insert_axis(Axis(1));
            let i_minus_rhosy = &Array2::<f64>::eye(n) - rho * s_col.dot(&y_col.t());
            h_inv = Some(i_minus_rhosy.dot(&h).dot(&i_minus_rhosy.t()) + rho * s_col.dot(&s_col.t()));
        }
    }
}

fn project(x: &Array1<f64>, bounds: &[(f64, f64)]) -> Array1<f64> {
    x.iter()
        .zip(bounds)
        .map(|(&xi, &(lower, upper))| xi.max(lower).min(upper))
        .collect()
}

/// ∞-norm of the gradient clipped to the feasible box.
fn projected_gradient_norm(x: &Array1<f64>, g: &Array1<f64>, bounds: &[(f64, f64)]) -> f64 {
    x.iter()
        .zip(g)
        .zip(bounds)
        .map(|((&xi, &gi), &(lower, upper))| {
            let pg = if gi < 0.0 {
                gi.max(xi - upper)
            } else {
                gi.min(xi - lower)
            };
            pg.abs()
        })
        .fold(0.0, f64::max)
}

/// Components not pinned to a bound by a gradient pointing out of the box.
fn free_mask(x: &Array1<f64>, g: &Array1<f64>, bounds: &[(f64, f64)]) -> Vec<bool> {
    x.iter()
        .zip(g)
        .zip(bounds)
        .map(|((&xi, &gi), &(lower, upper))| !((xi <= lower && gi > 0.0) || (xi >= upper && gi < 0.0)))
        .collect()
}

fn masked(v: &Array1<f64>, free: &[bool]) -> Array1<f64> {
    v.iter()
        .zip(free)
        .map(|(&vi, &is_free)| if is_free { vi } else { 0.0 })
        .collect()
}

/// Zeroes direction components that would leave the box from a bound.
fn block_outward(d: &mut Array1<f64>, x: &Array1<f64>, bounds: &[(f64, f64)]) {
    for ((di, &xi), &(lower, upper)) in d.iter_mut().zip(x).zip(bounds) {
        if (xi <= lower && *di < 0.0) || (xi >= upper && *di > 0.0) {
            *di = 0.0;
        }
    }
}

/// The largest step along `d` that stays inside the box.
fn max_step(x: &Array1<f64>, d: &Array1<f64>, bounds: &[(f64, f64)]) -> f64 {
    x.iter()
        .zip(d)
        .zip(bounds)
        .map(|((&xi, &di), &(lower, upper))| {
            if di > 0.0 {
                (upper - xi) / di
            } else if di < 0.0 {
                (lower - xi) / di
            } else {
                f64::INFINITY
            }
        })
        .fold(f64::INFINITY, f64::min)
}

struct Accepted {
    point: Array1<f64>,
    f: f64,
    g: Array1<f64>,
}

struct StepOutcome {
    accepted: Option<Accepted>,
    evals: usize,
}

/// A trial point along the search ray, with its directional derivative.
struct Trial {
    alpha: f64,
    f: f64,
    dphi: f64,
}

/// A Strong Wolfe line search along `d_k`, restricted to `[0, alpha_max]`.
///
/// Follows Algorithms 3.5 and 3.6 in Nocedal & Wright. When the step reaches
/// `alpha_max` while still decreasing, the boundary point is accepted.
struct LineSearch<'a> {
    x_k: &'a Array1<f64>,
    d_k: &'a Array1<f64>,
    f_k: f64,
    dphi_0: f64,
    alpha_max: f64,
    c1: f64,
    c2: f64,
    bounds: &'a [(f64, f64)],
}

impl LineSearch<'_> {
    const MAX_ATTEMPTS: usize = 20;
    const MAX_ZOOM_ATTEMPTS: usize = 10;

    fn point_at(&self, alpha: f64) -> Array1<f64> {
        project(&(self.x_k + alpha * self.d_k), self.bounds)
    }

    fn sufficient_decrease(&self, alpha: f64, f: f64) -> bool {
        f <= self.f_k + self.c1 * alpha * self.dphi_0
    }

    fn curvature(&self, dphi: f64) -> bool {
        dphi.abs() <= self.c2 * self.dphi_0.abs()
    }

    fn run<ObjFn, E>(&self, obj_fn: &ObjFn, alpha_init: f64) -> Result<StepOutcome, E>
    where
        ObjFn: Fn(&Array1<f64>) -> Result<(f64, Array1<f64>), E>,
    {
        let mut evals = 0;
        if !(self.dphi_0 < 0.0) || !(self.alpha_max > 0.0) || !(alpha_init > 0.0) {
            return Ok(StepOutcome { accepted: None, evals });
        }

        let mut prev = Trial { alpha: 0.0, f: self.f_k, dphi: self.dphi_0 };
        let mut alpha_i = alpha_init;

        for attempt in 0..Self::MAX_ATTEMPTS {
            let x_i = self.point_at(alpha_i);
            let (f_i, g_i) = obj_fn(&x_i)?;
            evals += 1;
            let dphi_i = g_i.dot(self.d_k);
            let trial = Trial { alpha: alpha_i, f: f_i, dphi: dphi_i };

            if !self.sufficient_decrease(alpha_i, f_i) || (attempt > 0 && f_i >= prev.f) {
                return self.zoom(obj_fn, prev, trial, evals);
            }
            if self.curvature(dphi_i) {
                return Ok(StepOutcome { accepted: Some(Accepted { point: x_i, f: f_i, g: g_i }), evals });
            }
            if dphi_i >= 0.0 {
                return self.zoom(obj_fn, trial, prev, evals);
            }
            if alpha_i >= self.alpha_max {
                return Ok(StepOutcome { accepted: Some(Accepted { point: x_i, f: f_i, g: g_i }), evals });
            }

            prev = trial;
            alpha_i = (2.0 * alpha_i).min(self.alpha_max);
        }
        Ok(StepOutcome { accepted: None, evals })
    }

    /// Shrinks the bracket between `lo` (the better end) and `hi`.
    fn zoom<ObjFn, E>(
        &self,
        obj_fn: &ObjFn,
        mut lo: Trial,
        mut hi: Trial,
        mut evals: usize,
    ) -> Result<StepOutcome, E>
    where
        ObjFn: Fn(&Array1<f64>) -> Result<(f64, Array1<f64>), E>,
    {
        for _ in 0..Self::MAX_ZOOM_ATTEMPTS {
            // Minimizer of the cubic through both ends, or bisection when it is unusable.
            let d1 = lo.dphi + hi.dphi - 3.0 * (lo.f - hi.f) / (lo.alpha - hi.alpha);
            let d2_sq = d1.powi(2) - lo.dphi * hi.dphi;
            let cubic = if d2_sq >= 0.0 {
                let d2 = d2_sq.sqrt() * (hi.alpha - lo.alpha).signum();
                hi.alpha - (hi.alpha - lo.alpha) * (hi.dphi + d2 - d1) / (hi.dphi - lo.dphi + 2.0 * d2)
            } else {
                f64::NAN
            };
            let (left, right) = (lo.alpha.min(hi.alpha), lo.alpha.max(hi.alpha));
            let margin = 0.1 * (right - left);
            let alpha_j = if cubic.is_finite() && cubic > left + margin && cubic < right - margin {
                cubic
            } else {
                (lo.alpha + hi.alpha) / 2.0
            };

            let x_j = self.point_at(alpha_j);
            let (f_j, g_j) = obj_fn(&x_j)?;
            evals += 1;
            let dphi_j = g_j.dot(self.d_k);

            if !self.sufficient_decrease(alpha_j, f_j) || f_j >= lo.f {
                hi = Trial { alpha: alpha_j, f: f_j, dphi: dphi_j };
            } else {
                if self.curvature(dphi_j) {
                    return Ok(StepOutcome { accepted: Some(Accepted { point: x_j, f: f_j, g: g_j }), evals });
                }
                let next_lo = Trial { alpha: alpha_j, f: f_j, dphi: dphi_j };
                if dphi_j * (hi.alpha - lo.alpha) >= 0.0 {
                    hi = std::mem::replace(&mut lo, next_lo);
                } else {
                    lo = next_lo;
                }
            }
        }

        // Settle for sufficient decrease if the bracket never produced curvature.
        if lo.alpha > 0.0 {
            let x_lo = self.point_at(lo.alpha);
            let (f_lo, g_lo) = obj_fn(&x_lo)?;
            evals += 1;
            if self.sufficient_decrease(lo.alpha, f_lo) {
                return Ok(StepOutcome { accepted: Some(Accepted { point: x_lo, f: f_lo, g: g_lo }), evals });
            }
        }
        Ok(StepOutcome { accepted: None, evals })
    }
}
