//! Presents an [`Objective`] over named variables as a function of one flat vector.
//!
//! The adapter is built for a single optimization call. It captures the free
//! variables and the sign at construction, so `maximize` never leaves a flipped
//! sign behind, even when the call fails.

use std::cell::{Cell, RefCell};

use ndarray::Array1;

use super::retry::History;
use crate::error::Result;
use crate::objective::Objective;
use crate::variables::{VariableSet, free_names};

pub(crate) struct SolverAdapter<'a, O: ?Sized> {
    objective: &'a O,
    free: VariableSet,
    sign: f64,
    points: RefCell<Vec<Array1<f64>>>,
    evaluations: Cell<usize>,
}

impl<'a, O: Objective + ?Sized> SolverAdapter<'a, O> {
    /// `sign` is `1.0` to minimize and `-1.0` to maximize.
    pub(crate) fn new(objective: &'a O, sign: f64) -> Result<Self> {
        let variables = objective.variables();
        let free = free_names(variables)
            .into_iter()
            .map(|name| variables.get(&name).cloned().map(|var| (name, var)))
            .collect::<Result<VariableSet>>()?;
        Ok(Self {
            objective,
            free,
            sign,
            points: RefCell::new(Vec::new()),
            evaluations: Cell::new(0),
        })
    }

    pub(crate) fn free(&self) -> &VariableSet {
        &self.free
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    pub(crate) fn bounds(&self) -> Vec<(f64, f64)> {
        self.free.bounds()
    }

    pub(crate) fn current_point(&self) -> Array1<f64> {
        self.free.flatten()
    }

    pub(crate) fn set_point(&self, x: &Array1<f64>) -> Result<()> {
        self.free.unflatten(&x.to_vec())
    }

    /// The gradient restricted to the free variables, flattened and sign-adjusted.
    pub(crate) fn signed_gradient(&self) -> Result<Array1<f64>> {
        let gradient = self.objective.gradient()?;
        Ok(self.sign * self.free.flatten_values(&gradient)?)
    }

    /// The bounded quasi-Newton callback.
    pub(crate) fn evaluate(&self, x: &Array1<f64>) -> Result<(f64, Array1<f64>)> {
        self.points.borrow_mut().push(x.clone());
        self.evaluations.set(self.evaluations.get() + 1);
        self.set_point(x)?;
        let value = self.sign * self.objective.value()?;
        let gradient = self.signed_gradient()?;
        log::trace!("evaluation {}: f = {value:e}", self.evaluations.get());
        Ok((value, gradient))
    }

    /// The scalar-search callback. Assumes exactly one free element.
    pub(crate) fn evaluate_scalar(&self, x: f64) -> Result<f64> {
        self.evaluations.set(self.evaluations.get() + 1);
        self.free.unflatten(&[x])?;
        let value = self.sign * self.objective.value()?;
        log::trace!("evaluation {}: f({x:e}) = {value:e}", self.evaluations.get());
        Ok(value)
    }

    pub(crate) fn evaluations(&self) -> usize {
        self.evaluations.get()
    }
}

impl<O: Objective + ?Sized> History for SolverAdapter<'_, O> {
    fn last_two(&self) -> Option<(Array1<f64>, Array1<f64>)> {
        match self.points.borrow().as_slice() {
            [.., previous, last] => Some((previous.clone(), last.clone())),
            _ => None,
        }
    }

    fn restart_from(&self, x: &Array1<f64>) -> Result<()> {
        self.set_point(x)
    }
}
