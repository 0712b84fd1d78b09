//! Finite-difference gradients for validating analytic ones.

use std::collections::BTreeSet;

use ndarray::ArrayD;

use crate::error::{OptimixError, Result};
use crate::objective::{Gradient, Objective};
use crate::variable::{Variable, squeeze};

/// Finite-difference scheme used by [`approx_fprime`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Difference {
    /// `(f(x + h) - f(x)) / h`
    #[default]
    Forward,
    /// `(f(x + h) - f(x - h)) / 2h`
    Central,
}

/// Approximates the gradient of `objective` one scalar component at a time.
///
/// Every variable is probed, fixed ones included. Each probed component is put
/// back before the next one is touched, also when the objective fails.
pub fn approx_fprime<O: Objective + ?Sized>(
    objective: &O,
    step: f64,
    difference: Difference,
) -> Result<Gradient> {
    let f0 = match difference {
        Difference::Forward => objective.value()?,
        Difference::Central => f64::NAN,
    };
    let mut gradient = Gradient::new();
    for (name, var) in objective.variables().iter() {
        let original = var.flat_values();
        let mut derivatives = Vec::with_capacity(original.len());
        for i in 0..original.len() {
            let derivative = match difference {
                Difference::Forward => (probe(objective, var, &original, i, step)? - f0) / step,
                Difference::Central => {
                    let ahead = probe(objective, var, &original, i, step)?;
                    let behind = probe(objective, var, &original, i, -step)?;
                    (ahead - behind) / (2.0 * step)
                }
            };
            derivatives.push(derivative);
        }
        let shape = var.shape();
        let found = vec![derivatives.len()];
        let derivative = ArrayD::from_shape_vec(shape.clone(), derivatives).map_err(|_| {
            OptimixError::ShapeMismatch {
                name: name.to_string(),
                expected: shape,
                found,
            }
        })?;
        gradient.insert(name.to_string(), derivative);
    }
    Ok(gradient)
}

fn probe<O: Objective + ?Sized>(
    objective: &O,
    var: &Variable,
    original: &[f64],
    i: usize,
    step: f64,
) -> Result<f64> {
    let mut shifted = original.to_vec();
    shifted[i] += step;
    var.assign_flat(&shifted)?;
    let value = objective.value();
    var.assign_flat(original)?;
    value
}

/// Sum over all variable names of `‖numeric − analytic‖₂`.
///
/// The numeric gradient is a forward difference with the given `step`. A large
/// result means the analytic gradient is wrong; it is not reported as an error.
///
/// # Errors
/// [`OptimixError::NameNotFound`] if a name appears in only one of the two
/// gradients, and [`OptimixError::ShapeMismatch`] if the two entries for a name
/// do not have the same shape up to unit axes.
pub fn check_grad<O: Objective + ?Sized>(objective: &O, step: f64) -> Result<f64> {
    let numeric = approx_fprime(objective, step, Difference::Forward)?;
    let analytic = objective.gradient()?;

    let names: BTreeSet<&String> = numeric.keys().chain(analytic.keys()).collect();
    let mut total = 0.0;
    for name in names {
        let missing = || OptimixError::NameNotFound { name: name.clone() };
        let num = numeric.get(name).ok_or_else(missing)?;
        let ana = analytic.get(name).ok_or_else(missing)?;
        if squeeze(num.shape()) != squeeze(ana.shape()) {
            return Err(OptimixError::ShapeMismatch {
                name: name.clone(),
                expected: num.shape().to_vec(),
                found: ana.shape().to_vec(),
            });
        }
        let sq: f64 = num.iter().zip(ana.iter()).map(|(n, a)| (n - a).powi(2)).sum();
        total += sq.sqrt();
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimize::EPSILON_STEP;
    use crate::variables::VariableSet;
    use ndarray::{arr0, array};
    use spectral::prelude::*;

    /// a² + sum(v)·a + 3·m₀₁, with an optionally broken derivative for `a`.
    struct Mixed {
        variables: VariableSet,
        broken: bool,
    }

    impl Mixed {
        fn new(broken: bool) -> Self {
            let variables = VariableSet::new()
                .with("a", Variable::scalar(1.5))
                .with("v", Variable::vector(array![1.0, -2.0]))
                .with("m", Variable::matrix(array![[0.0, 1.0], [2.0, 3.0]]));
            Self { variables, broken }
        }
    }

    impl Objective for Mixed {
        fn variables(&self) -> &VariableSet {
            &self.variables
        }

        fn value(&self) -> Result<f64> {
            let a = self.variables.get("a")?.as_scalar();
            let v: f64 = self.variables.get("v")?.flat_values().iter().sum();
            let m = self.variables.get("m")?.flat_values();
            Ok(a * a + v * a + 3.0 * m[1])
        }

        fn gradient(&self) -> Result<Gradient> {
            let a = self.variables.get("a")?.as_scalar();
            let v: f64 = self.variables.get("v")?.flat_values().iter().sum();
            let da = if self.broken { 10.0 } else { 2.0 * a + v };
            let mut grad = Gradient::new();
            grad.insert("a".into(), arr0(da).into_dyn());
            grad.insert("v".into(), array![a, a].into_dyn());
            grad.insert("m".into(), array![[0.0, 3.0], [0.0, 0.0]].into_dyn());
            Ok(grad)
        }
    }

    #[test]
    fn numeric_gradient_matches_shapes_and_values() {
        let f = Mixed::new(false);
        let grad = approx_fprime(&f, 1e-6, Difference::Central).unwrap();
        assert_that(&grad["a"].ndim()).is_equal_to(0);
        assert_that(&grad["m"].shape().to_vec()).is_equal_to(vec![2, 2]);
        assert_that(&grad["a"].sum()).is_close_to(2.0, 1e-6);
        assert_that(&grad["v"][[1]]).is_close_to(1.5, 1e-6);
        assert_that(&grad["m"][[0, 1]]).is_close_to(3.0, 1e-6);
        assert_that(&grad["m"][[1, 1]]).is_close_to(0.0, 1e-6);
    }

    #[test]
    fn probing_restores_values_and_covers_fixed_variables() {
        let f = Mixed::new(false);
        f.fix("v").unwrap();
        let grad = approx_fprime(&f, EPSILON_STEP, Difference::Forward).unwrap();
        assert!(grad.contains_key("v"));
        assert_that(&f.variables().flatten().to_vec())
            .is_equal_to(vec![1.5, 0.0, 1.0, 2.0, 3.0, 1.0, -2.0]);
    }

    #[test]
    fn correct_gradient_checks_out() {
        let f = Mixed::new(false);
        assert_that(&check_grad(&f, EPSILON_STEP).unwrap()).is_less_than(1e-5);
    }

    #[test]
    fn wrong_gradient_is_a_large_value_not_an_error() {
        let f = Mixed::new(true);
        assert_that(&check_grad(&f, EPSILON_STEP).unwrap()).is_greater_than(1.0);
    }

    struct MissingName(Mixed);

    impl Objective for MissingName {
        fn variables(&self) -> &VariableSet {
            self.0.variables()
        }

        fn value(&self) -> Result<f64> {
            self.0.value()
        }

        fn gradient(&self) -> Result<Gradient> {
            let mut grad = self.0.gradient()?;
            grad.remove("m");
            grad.insert("v".into(), array![1.0, 2.0, 3.0].into_dyn());
            Ok(grad)
        }
    }

    #[test]
    fn structural_disagreement_is_an_error() {
        let f = MissingName(Mixed::new(false));
        assert!(matches!(
            check_grad(&f, EPSILON_STEP),
            Err(OptimixError::NameNotFound { ref name }) if name == "m"
        ));
    }
}
