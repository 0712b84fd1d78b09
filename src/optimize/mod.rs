//! Driving the solvers over the free variables of an objective.
//!
//! [`minimize`] and [`maximize`] run the bounded quasi-Newton solver in
//! [`lbfgsb`] with restarts after transient failures. [`minimize_scalar`] and
//! [`maximize_scalar`] run the bracketing search in [`brent`] and require
//! exactly one free scalar. On success the optimum is written back into the
//! objective's variables.

pub mod brent;
pub mod lbfgsb;

mod adapter;
mod retry;

use log::Level;
use ndarray::Array1;

use crate::error::{OptimixError, Result};
use crate::objective::Objective;
use adapter::SolverAdapter;
use brent::BrentOptions;
use lbfgsb::{Lbfgsb, LbfgsbSolution};
use retry::{Attempt, RetryPolicy};

pub use retry::Blend;

/// Default relative-reduction factor, in units of machine epsilon.
pub const FACTR: f64 = 1e5;
/// Default projected-gradient tolerance.
pub const PGTOL: f64 = 1e-7;
/// Default number of solver runs before giving up.
pub const MAX_ATTEMPTS: usize = 5;
/// `sqrt(f64::EPSILON)`, the default finite-difference step.
pub const EPSILON_STEP: f64 = 1.490_116_119_384_765_6e-8;

/// Settings for [`minimize`] and [`maximize`].
#[derive(Debug, Clone, PartialEq)]
pub struct Options {
    pub factr: f64,
    pub pgtol: f64,
    pub max_iterations: usize,
    pub max_evaluations: usize,
    /// Solver runs before giving up with [`OptimixError::RetryExhausted`].
    pub max_attempts: usize,
    pub blend: Blend,
    /// Report progress at `info` level instead of `debug`.
    pub verbose: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            factr: FACTR,
            pgtol: PGTOL,
            max_iterations: 15000,
            max_evaluations: 15000,
            max_attempts: MAX_ATTEMPTS,
            blend: Blend::default(),
            verbose: false,
        }
    }
}

impl Options {
    pub fn with_factr(mut self, factr: f64) -> Self {
        self.factr = factr;
        self
    }

    pub fn with_pgtol(mut self, pgtol: f64) -> Self {
        self.pgtol = pgtol;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_max_evaluations(mut self, max_evaluations: usize) -> Self {
        self.max_evaluations = max_evaluations;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_blend(mut self, blend: Blend) -> Self {
        self.blend = blend;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    fn level(&self) -> Level {
        if self.verbose { Level::Info } else { Level::Debug }
    }
}

/// Settings for [`minimize_scalar`] and [`maximize_scalar`].
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarOptions {
    pub rtol: f64,
    pub atol: f64,
    pub max_iterations: usize,
    pub verbose: bool,
}

impl Default for ScalarOptions {
    fn default() -> Self {
        let brent = BrentOptions::default();
        Self {
            rtol: brent.rtol,
            atol: brent.atol,
            max_iterations: brent.max_iterations,
            verbose: false,
        }
    }
}

impl ScalarOptions {
    pub fn with_rtol(mut self, rtol: f64) -> Self {
        self.rtol = rtol;
        self
    }

    pub fn with_atol(mut self, atol: f64) -> Self {
        self.atol = atol;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

impl From<&ScalarOptions> for BrentOptions {
    fn from(options: &ScalarOptions) -> Self {
        BrentOptions {
            rtol: options.rtol,
            atol: options.atol,
            max_iterations: options.max_iterations,
        }
    }
}

/// How a successful [`minimize`] or [`maximize`] call ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Status {
    /// Every variable is fixed; nothing was evaluated.
    NoFreeVariables,
    /// The starting point already satisfied `pgtol`; the solver was not run.
    GradientNearZero,
    /// The solver converged. `task` is its termination message.
    Converged { task: String },
}

/// A summary of a successful [`minimize`] or [`maximize`] call.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub status: Status,
    /// The objective's value at the solution, without any sign adjustment.
    /// `None` when the solver was not run.
    pub value: Option<f64>,
    /// Objective evaluations over all attempts.
    pub evaluations: usize,
    /// Solver runs, including the successful one.
    pub attempts: usize,
    /// Iterations of the successful run.
    pub iterations: usize,
}

impl Outcome {
    fn skipped(status: Status) -> Self {
        Self {
            status,
            value: None,
            evaluations: 0,
            attempts: 0,
            iterations: 0,
        }
    }
}

/// A summary of a successful [`minimize_scalar`] or [`maximize_scalar`] call.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarOutcome {
    /// The optimum, also written into the free variable.
    pub x: f64,
    /// The objective's value at `x`, without any sign adjustment.
    pub value: f64,
    /// Objective evaluations made by the search.
    pub evaluations: usize,
}

/// Minimizes `objective` over its free variables.
///
/// # Errors
/// - [`OptimixError::SolverDivergence`] when the iteration or evaluation limit is hit.
/// - [`OptimixError::FirstIterationFailure`] when a transient failure happens
///   before two points were evaluated.
/// - [`OptimixError::RetryExhausted`] after `max_attempts` transient failures.
/// - Any non-transient error raised by the objective.
pub fn minimize<O: Objective + ?Sized>(objective: &O, options: &Options) -> Result<Outcome> {
    optimize(objective, 1.0, options)
}

/// Maximizes `objective` over its free variables. See [`minimize`].
pub fn maximize<O: Objective + ?Sized>(objective: &O, options: &Options) -> Result<Outcome> {
    optimize(objective, -1.0, options)
}

fn optimize<O: Objective + ?Sized>(objective: &O, sign: f64, options: &Options) -> Result<Outcome> {
    let adapter = SolverAdapter::new(objective, sign)?;
    if adapter.is_empty() {
        log::log!(options.level(), "No free variables to optimize.");
        return Ok(Outcome::skipped(Status::NoFreeVariables));
    }

    let gradient = adapter.signed_gradient()?;
    if gradient.iter().all(|g| g.abs() <= options.pgtol) {
        log::log!(
            options.level(),
            "Gradient near zero before the first iteration. Returning the current value."
        );
        return Ok(Outcome::skipped(Status::GradientNearZero));
    }

    let policy = RetryPolicy::new(options.max_attempts, options.blend);
    let (solution, attempts) = policy.run(&adapter, |_| {
        Attempt::from(
            Lbfgsb::new(adapter.current_point(), |x: &Array1<f64>| adapter.evaluate(x))
                .with_bounds(adapter.bounds())
                .with_factr(options.factr)
                .with_pgtol(options.pgtol)
                .with_max_iterations(options.max_iterations)
                .with_max_evaluations(options.max_evaluations)
                .run(),
        )
    })?;

    let LbfgsbSolution {
        final_point,
        final_value,
        iterations,
        task,
        ..
    } = solution;
    adapter.set_point(&final_point)?;
    log::log!(
        options.level(),
        "{task} after {iterations} iterations, {} evaluations and {attempts} attempt(s).",
        adapter.evaluations()
    );
    Ok(Outcome {
        status: Status::Converged { task },
        value: Some(sign * final_value),
        evaluations: adapter.evaluations(),
        attempts,
        iterations,
    })
}

/// Minimizes an objective with exactly one free scalar using Brent's method.
///
/// The search starts from the variable's current value and respects its bounds.
///
/// # Errors
/// - [`OptimixError::InvalidProblemShape`] unless exactly one free variable of
///   size one exists.
/// - [`OptimixError::SolverDivergence`] if the search does not converge.
/// - Any error raised by the objective.
pub fn minimize_scalar<O: Objective + ?Sized>(
    objective: &O,
    options: &ScalarOptions,
) -> Result<ScalarOutcome> {
    optimize_scalar(objective, 1.0, options)
}

/// Maximizes an objective with exactly one free scalar. See [`minimize_scalar`].
pub fn maximize_scalar<O: Objective + ?Sized>(
    objective: &O,
    options: &ScalarOptions,
) -> Result<ScalarOutcome> {
    optimize_scalar(objective, -1.0, options)
}

fn optimize_scalar<O: Objective + ?Sized>(
    objective: &O,
    sign: f64,
    options: &ScalarOptions,
) -> Result<ScalarOutcome> {
    let adapter = SolverAdapter::new(objective, sign)?;
    let free = adapter.free();
    let var = match free.iter().next() {
        Some((_, var)) if free.len() == 1 && var.size() == 1 => var,
        _ => return Err(OptimixError::InvalidProblemShape { free: free.len() }),
    };
    let bounds = var
        .bounds()
        .first()
        .copied()
        .unwrap_or((f64::NEG_INFINITY, f64::INFINITY));

    let solution = brent::minimize(
        |x| adapter.evaluate_scalar(x),
        var.as_scalar(),
        bounds,
        &BrentOptions::from(options),
    )?;
    if !solution.converged {
        return Err(OptimixError::SolverDivergence {
            task: format!(
                "Brent: no convergence after {} evaluations",
                solution.evaluations
            ),
        });
    }

    var.set_scalar(solution.x);
    let level = if options.verbose { Level::Info } else { Level::Debug };
    log::log!(
        level,
        "Brent search converged to {} after {} evaluations.",
        solution.x,
        solution.evaluations
    );
    Ok(ScalarOutcome {
        x: solution.x,
        value: sign * solution.fx,
        evaluations: solution.evaluations,
    })
}

/// Optimization methods for every [`Objective`].
///
/// ```
/// use ndarray::arr0;
/// use optimix::{Gradient, Objective, Optimize, Options, Result, Variable, VariableSet};
///
/// struct Parabola(VariableSet);
///
/// impl Objective for Parabola {
///     fn variables(&self) -> &VariableSet {
///         &self.0
///     }
///
///     fn value(&self) -> Result<f64> {
///         let x = self.0.get("x")?.as_scalar();
///         Ok((x - 3.0).powi(2))
///     }
///
///     fn gradient(&self) -> Result<Gradient> {
///         let x = self.0.get("x")?.as_scalar();
///         Ok(Gradient::from([("x".to_string(), arr0(2.0 * (x - 3.0)).into_dyn())]))
///     }
/// }
///
/// let f = Parabola(VariableSet::new().with("x", Variable::scalar(0.0)));
/// f.minimize(&Options::default()).unwrap();
/// assert!((f.get("x").unwrap().sum() - 3.0).abs() < 1e-6);
/// ```
pub trait Optimize: Objective {
    fn minimize(&self, options: &Options) -> Result<Outcome> {
        minimize(self, options)
    }

    fn maximize(&self, options: &Options) -> Result<Outcome> {
        maximize(self, options)
    }

    fn minimize_scalar(&self, options: &ScalarOptions) -> Result<ScalarOutcome> {
        minimize_scalar(self, options)
    }

    fn maximize_scalar(&self, options: &ScalarOptions) -> Result<ScalarOutcome> {
        maximize_scalar(self, options)
    }
}

impl<O: Objective + ?Sized> Optimize for O {}
