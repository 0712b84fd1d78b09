//! Mutable numeric variables shared by reference between variable sets.
//!
//! A [`Variable`] is a handle: cloning it aliases the same storage, so a value
//! written through one [`VariableSet`](crate::VariableSet) is seen by every other
//! set holding it. Use [`Variable::deep_copy`] for an independent variable.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use ndarray::{Array1, Array2, ArrayBase, ArrayD, Data, Dimension, IxDyn, arr0};

use crate::error::{OptimixError, Result};

/// Callback invoked with the new value after every mutation.
pub type Listener = Box<dyn Fn(&ArrayD<f64>)>;

/// Box constraints for a variable.
#[derive(Debug, Clone, PartialEq)]
pub enum Bounds {
    /// The same `(lower, upper)` pair for every element.
    Uniform(f64, f64),
    /// One `(lower, upper)` pair per element, in row-major order.
    PerElement(Vec<(f64, f64)>),
}

impl From<(f64, f64)> for Bounds {
    fn from((lower, upper): (f64, f64)) -> Self {
        Bounds::Uniform(lower, upper)
    }
}

impl From<Vec<(f64, f64)>> for Bounds {
    fn from(pairs: Vec<(f64, f64)>) -> Self {
        Bounds::PerElement(pairs)
    }
}

struct Inner {
    raw: ArrayD<f64>,
    fixed: bool,
    bounds: Vec<(f64, f64)>,
    listeners: Vec<Listener>,
}

/// A named-by-its-owner numeric container of rank 0, 1 or 2.
#[derive(Clone)]
pub struct Variable {
    inner: Rc<RefCell<Inner>>,
}

impl Variable {
    /// A rank-0 variable.
    pub fn scalar(value: f64) -> Self {
        Self::from_raw(arr0(value).into_dyn())
    }

    /// A rank-1 variable.
    pub fn vector(value: impl Into<Array1<f64>>) -> Self {
        Self::from_raw(value.into().into_dyn())
    }

    /// A rank-2 variable.
    pub fn matrix(value: Array2<f64>) -> Self {
        Self::from_raw(value.into_dyn())
    }

    /// Builds a variable from an array of any rank, rejecting ranks above two.
    pub fn from_array(value: ArrayD<f64>) -> Result<Self> {
        if value.ndim() > 2 {
            return Err(OptimixError::InvalidRank { ndim: value.ndim() });
        }
        Ok(Self::from_raw(value))
    }

    fn from_raw(raw: ArrayD<f64>) -> Self {
        let bounds = vec![(f64::NEG_INFINITY, f64::INFINITY); raw.len()];
        Self {
            inner: Rc::new(RefCell::new(Inner {
                raw,
                fixed: false,
                bounds,
                listeners: Vec::new(),
            })),
        }
    }

    /// A new variable with the same value, fixed flag and bounds but no listeners.
    pub fn deep_copy(&self) -> Self {
        let inner = self.inner.borrow();
        Self {
            inner: Rc::new(RefCell::new(Inner {
                raw: inner.raw.clone(),
                fixed: inner.fixed,
                bounds: inner.bounds.clone(),
                listeners: Vec::new(),
            })),
        }
    }

    /// Whether both handles point at the same variable.
    pub fn ptr_eq(&self, other: &Variable) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// A copy of the current value.
    pub fn value(&self) -> ArrayD<f64> {
        self.inner.borrow().raw.clone()
    }

    /// The first element; the whole value for rank-0 variables.
    pub fn as_scalar(&self) -> f64 {
        self.inner.borrow().raw.iter().next().copied().unwrap_or(f64::NAN)
    }

    /// The elements in row-major order.
    pub fn flat_values(&self) -> Vec<f64> {
        self.inner.borrow().raw.iter().copied().collect()
    }

    /// The rank: 0, 1 or 2.
    pub fn ndim(&self) -> usize {
        self.inner.borrow().raw.ndim()
    }

    /// The number of elements.
    pub fn size(&self) -> usize {
        self.inner.borrow().raw.len()
    }

    /// The shape; empty for scalars.
    pub fn shape(&self) -> Vec<usize> {
        self.inner.borrow().raw.shape().to_vec()
    }

    /// Assigns a new value.
    ///
    /// A single-element value is broadcast into every element. Otherwise the
    /// shapes must agree once unit axes are squeezed out.
    ///
    /// # Errors
    /// [`OptimixError::ShapeMismatch`] when neither rule applies. The variable is
    /// left untouched in that case.
    pub fn set_value<S, D>(&self, value: &ArrayBase<S, D>) -> Result<()>
    where
        S: Data<Elem = f64>,
        D: Dimension,
    {
        self.check_assignable(value.shape())?;
        {
            let mut inner = self.inner.borrow_mut();
            if value.len() == 1 {
                let v = value.iter().next().copied().unwrap_or(f64::NAN);
                inner.raw.fill(v);
            } else {
                for (dst, src) in inner.raw.iter_mut().zip(value.iter()) {
                    *dst = *src;
                }
            }
        }
        self.notify();
        Ok(())
    }

    /// Assigns a single number to every element.
    pub fn set_scalar(&self, value: f64) {
        self.inner.borrow_mut().raw.fill(value);
        self.notify();
    }

    /// Writes `values` in row-major order, keeping the variable's shape.
    ///
    /// # Errors
    /// [`OptimixError::ShapeMismatch`] if `values.len()` differs from [`size`](Self::size).
    pub fn assign_flat(&self, values: &[f64]) -> Result<()> {
        let size = self.size();
        if values.len() != size {
            return Err(OptimixError::ShapeMismatch {
                name: String::new(),
                expected: vec![size],
                found: vec![values.len()],
            });
        }
        {
            let mut inner = self.inner.borrow_mut();
            for (dst, src) in inner.raw.iter_mut().zip(values) {
                *dst = *src;
            }
        }
        self.notify();
        Ok(())
    }

    /// Validates an assignment of the given shape without performing it.
    pub(crate) fn check_assignable(&self, shape: &[usize]) -> Result<()> {
        let own = self.shape();
        let len: usize = shape.iter().product();
        if len == 1 || squeeze(shape) == squeeze(&own) {
            return Ok(());
        }
        Err(OptimixError::ShapeMismatch {
            name: String::new(),
            expected: own,
            found: shape.to_vec(),
        })
    }

    /// Whether the optimizers leave this variable alone.
    pub fn is_fixed(&self) -> bool {
        self.inner.borrow().fixed
    }

    /// Excludes the variable from optimization.
    pub fn fix(&self) {
        self.inner.borrow_mut().fixed = true;
    }

    /// Makes the variable free again.
    pub fn unfix(&self) {
        self.inner.borrow_mut().fixed = false;
    }

    /// One `(lower, upper)` pair per element.
    pub fn bounds(&self) -> Vec<(f64, f64)> {
        self.inner.borrow().bounds.clone()
    }

    /// # Errors
    /// [`OptimixError::InvalidBounds`] for a pair with `lower > upper`, and
    /// [`OptimixError::ShapeMismatch`] for a per-element list of the wrong length.
    pub fn set_bounds(&self, bounds: impl Into<Bounds>) -> Result<()> {
        let size = self.size();
        let pairs = match bounds.into() {
            Bounds::Uniform(lower, upper) => vec![(lower, upper); size],
            Bounds::PerElement(pairs) => {
                if pairs.len() != size {
                    return Err(OptimixError::ShapeMismatch {
                        name: String::new(),
                        expected: vec![size],
                        found: vec![pairs.len()],
                    });
                }
                pairs
            }
        };
        if let Some(&(lower, upper)) = pairs.iter().find(|(lower, upper)| !(lower <= upper)) {
            return Err(OptimixError::InvalidBounds { lower, upper });
        }
        self.inner.borrow_mut().bounds = pairs;
        Ok(())
    }

    /// Registers a callback fired after every successful mutation of the value.
    pub fn listen(&self, listener: impl Fn(&ArrayD<f64>) + 'static) {
        self.inner.borrow_mut().listeners.push(Box::new(listener));
    }

    // Listeners run without a borrow held so they are free to read the variable.
    fn notify(&self) {
        let listeners = std::mem::take(&mut self.inner.borrow_mut().listeners);
        if listeners.is_empty() {
            return;
        }
        let value = self.value();
        for listener in &listeners {
            listener(&value);
        }
        let mut inner = self.inner.borrow_mut();
        let added = std::mem::replace(&mut inner.listeners, listeners);
        inner.listeners.extend(added);
    }

    fn kind(&self) -> &'static str {
        match self.ndim() {
            0 => "Scalar",
            1 => "Vector",
            _ => "Matrix",
        }
    }
}

pub(crate) fn squeeze(shape: &[usize]) -> Vec<usize> {
    shape.iter().copied().filter(|&d| d != 1).collect()
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        if inner.raw.ndim() == 0 {
            let v = inner.raw.iter().next().copied().unwrap_or(f64::NAN);
            write!(f, "{}({:?})", self.kind(), v)
        } else {
            write!(f, "{}({})", self.kind(), inner.raw)
        }
    }
}

impl fmt::Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Variable")
            .field("raw", &inner.raw)
            .field("fixed", &inner.fixed)
            .field("bounds", &inner.bounds)
            .finish()
    }
}

/// Builds a variable from a shape and its row-major values.
impl TryFrom<(Vec<usize>, Vec<f64>)> for Variable {
    type Error = OptimixError;

    fn try_from((shape, values): (Vec<usize>, Vec<f64>)) -> Result<Self> {
        let found = values.len();
        let raw = ArrayD::from_shape_vec(IxDyn(&shape), values).map_err(|_| {
            OptimixError::ShapeMismatch {
                name: String::new(),
                expected: shape.clone(),
                found: vec![found],
            }
        })?;
        Variable::from_array(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, arr0};
    use spectral::prelude::*;
    use std::cell::Cell;

    #[test]
    fn handles_alias_the_same_storage() {
        let a = Variable::scalar(1.0);
        let b = a.clone();
        a.set_scalar(2.0);
        assert!(a.ptr_eq(&b));
        assert_that(&b.as_scalar()).is_equal_to(2.0);

        let c = a.deep_copy();
        c.set_scalar(7.0);
        assert!(!a.ptr_eq(&c));
        assert_that(&a.as_scalar()).is_equal_to(2.0);
    }

    #[test]
    fn size_and_rank_follow_the_payload() {
        let m = Variable::matrix(array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        assert_that(&m.size()).is_equal_to(6);
        assert_that(&m.ndim()).is_equal_to(2);
        assert_that(&m.shape()).is_equal_to(vec![2, 3]);
        assert_that(&Variable::scalar(3.0).size()).is_equal_to(1);
        assert_that(&Variable::scalar(3.0).ndim()).is_equal_to(0);
    }

    #[test]
    fn rank_three_is_rejected() {
        let raw = ArrayD::<f64>::zeros(IxDyn(&[2, 2, 2]));
        assert!(matches!(
            Variable::from_array(raw),
            Err(OptimixError::InvalidRank { ndim: 3 })
        ));
    }

    #[test]
    fn single_elements_broadcast() {
        let v = Variable::vector(array![1.0, 2.0, 3.0]);
        v.set_value(&arr0(0.5)).unwrap();
        assert_that(&v.flat_values()).is_equal_to(vec![0.5, 0.5, 0.5]);
        v.set_value(&array![9.0]).unwrap();
        assert_that(&v.flat_values()).is_equal_to(vec![9.0, 9.0, 9.0]);
    }

    #[test]
    fn shapes_must_agree_after_squeezing() {
        let v = Variable::vector(array![1.0, 2.0, 3.0]);
        v.set_value(&array![[4.0, 5.0, 6.0]]).unwrap();
        assert_that(&v.flat_values()).is_equal_to(vec![4.0, 5.0, 6.0]);

        let err = v.set_value(&array![1.0, 2.0]).unwrap_err();
        assert!(matches!(err, OptimixError::ShapeMismatch { .. }));
        assert_that(&v.flat_values()).is_equal_to(vec![4.0, 5.0, 6.0]);

        let m = Variable::matrix(array![[1.0, 2.0], [3.0, 4.0]]);
        assert!(m.set_value(&array![1.0, 2.0, 3.0, 4.0]).is_err());
    }

    #[test]
    fn assign_flat_restores_the_shape() {
        let m = Variable::matrix(array![[1.0, 2.0], [3.0, 4.0]]);
        m.assign_flat(&[5.0, 6.0, 7.0, 8.0]).unwrap();
        assert_that(&m.value()).is_equal_to(array![[5.0, 6.0], [7.0, 8.0]].into_dyn());
        assert!(m.assign_flat(&[1.0]).is_err());
    }

    #[test]
    fn bounds_broadcast_and_validate() {
        let v = Variable::vector(array![0.0, 0.0]);
        assert_that(&v.bounds()).is_equal_to(vec![(f64::NEG_INFINITY, f64::INFINITY); 2]);
        v.set_bounds((0.0, 1.0)).unwrap();
        assert_that(&v.bounds()).is_equal_to(vec![(0.0, 1.0), (0.0, 1.0)]);
        v.set_bounds(vec![(0.0, 1.0), (-2.0, 2.0)]).unwrap();
        assert_that(&v.bounds()).is_equal_to(vec![(0.0, 1.0), (-2.0, 2.0)]);
        assert!(matches!(
            v.set_bounds((1.0, 0.0)),
            Err(OptimixError::InvalidBounds { .. })
        ));
        assert!(v.set_bounds(vec![(0.0, 1.0)]).is_err());
    }

    #[test]
    fn listeners_fire_on_every_mutation() {
        let v = Variable::scalar(1.0);
        let calls = Rc::new(Cell::new(0));
        let seen = Rc::new(Cell::new(0.0));
        {
            let calls = calls.clone();
            let seen = seen.clone();
            v.listen(move |value| {
                calls.set(calls.get() + 1);
                seen.set(value.iter().next().copied().unwrap_or(f64::NAN));
            });
        }
        v.set_scalar(2.0);
        v.set_value(&arr0(3.0)).unwrap();
        v.assign_flat(&[4.0]).unwrap();
        assert_that(&calls.get()).is_equal_to(3);
        assert_that(&seen.get()).is_equal_to(4.0);

        // A rejected assignment is not a mutation.
        let _ = v.set_value(&array![1.0, 2.0]);
        assert_that(&calls.get()).is_equal_to(3);
    }

    #[test]
    fn listeners_may_read_the_variable() {
        let v = Variable::scalar(1.0);
        let echo = Rc::new(Cell::new(0.0));
        {
            let handle = v.clone();
            let echo = echo.clone();
            v.listen(move |_| echo.set(handle.as_scalar() * 10.0));
        }
        v.set_scalar(2.5);
        assert_that(&echo.get()).is_equal_to(25.0);
    }

    #[test]
    fn display_names_the_kind() {
        assert_that(&Variable::scalar(1.0).to_string()).is_equal_to("Scalar(1.0)".to_string());
        assert!(Variable::vector(array![1.0, 2.0]).to_string().starts_with("Vector("));
    }

    #[test]
    fn try_from_shape_and_values() {
        let v = Variable::try_from((vec![2, 2], vec![1.0, 2.0, 3.0, 4.0])).unwrap();
        assert_that(&v.ndim()).is_equal_to(2);
        assert!(Variable::try_from((vec![3], vec![1.0])).is_err());
    }
}
