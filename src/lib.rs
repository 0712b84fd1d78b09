//! Function optimization over named, hierarchical variables.
//!
//! Objectives are written against a [`VariableSet`]: scalar, vector and matrix
//! [`Variable`]s keyed by name, each of which can be fixed or free and carry
//! per-element bounds. The optimizers see only a flat vector of the free
//! elements, laid out in lexicographic name order. Every evaluation writes the
//! solver's point back into the variables, so an objective reads its parameters
//! by name and never deals with offsets.
//!
//! It features:
//! - Bounded BFGS ([`minimize`], [`maximize`]) with a Strong Wolfe line search and
//!   restarts from a perturbed point after transient failures.
//! - Brent's method ([`minimize_scalar`], [`maximize_scalar`]) for a single free scalar.
//! - Data-bound objectives through [`Function::feed`], and composites of several
//!   objectives through [`Reduce`], whose variables are merged under prefixed names.
//! - Finite-difference gradient checking with [`check_grad`].
//!
//! # Example
//! Fit the `scale` of `(scale - 5)² · x / 2` for an observed `x`.
//!
//! ```
//! use ndarray::arr0;
//! use optimix::{Function, Gradient, Optimize, Options, Result, Status, Variable, VariableSet};
//!
//! struct Quadratic {
//!     variables: VariableSet,
//! }
//!
//! impl Function for Quadratic {
//!     type Data = f64;
//!
//!     fn variables(&self) -> &VariableSet {
//!         &self.variables
//!     }
//!
//!     fn value(&self, x: &f64) -> Result<f64> {
//!         let s = self.variables.get("scale")?.as_scalar();
//!         Ok((s - 5.0).powi(2) * x / 2.0)
//!     }
//!
//!     fn gradient(&self, x: &f64) -> Result<Gradient> {
//!         let s = self.variables.get("scale")?.as_scalar();
//!         Ok(Gradient::from([("scale".to_string(), arr0((s - 5.0) * x).into_dyn())]))
//!     }
//! }
//!
//! let f = Quadratic {
//!     variables: VariableSet::new().with("scale", Variable::scalar(1.0)),
//! };
//! let outcome = f.feed(&2.3).minimize(&Options::default()).expect("optimization failed");
//!
//! assert!(matches!(outcome.status, Status::Converged { .. }));
//! let scale = f.variables().get("scale").unwrap().as_scalar();
//! assert!((scale - 5.0).abs() < 1e-6);
//! ```

mod check_grad;
mod error;
mod objective;
pub mod optimize;
mod variable;
mod variables;

pub use check_grad::{Difference, approx_fprime, check_grad};
pub use error::{OptimixError, Result};
pub use objective::{
    Feed, Function, Gradient, Negative, Objective, Reduce, Reducer, Sum, prefix_gradients,
};
pub use optimize::{
    Blend, EPSILON_STEP, FACTR, MAX_ATTEMPTS, Optimize, Options, Outcome, PGTOL, ScalarOptions,
    ScalarOutcome, Status, maximize, maximize_scalar, minimize, minimize_scalar,
};
pub use variable::{Bounds, Listener, Variable};
pub use variables::{ValueMap, VariableSet, free_names, merge_variables};
