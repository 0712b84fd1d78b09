//! Objectives: things with a value and a gradient over named variables.
//!
//! The optimizers only need the zero-argument [`Objective`] capability. Everything
//! else in this module builds objectives out of other pieces: a data-bound
//! [`Function`] becomes an objective through [`Function::feed`], a list of
//! children becomes one through [`Reduce`], and [`Negative`] flips the sign.

use std::collections::BTreeMap;

use ndarray::ArrayD;

use crate::error::Result;
use crate::variables::{ValueMap, VariableSet, merge_variables};

/// Partial derivatives keyed by variable name.
pub type Gradient = ValueMap;

/// A scalar objective over a set of named variables.
///
/// `value` and `gradient` read the current values of [`variables`](Self::variables),
/// which the optimizers overwrite between calls.
pub trait Objective {
    fn variables(&self) -> &VariableSet;

    fn value(&self) -> Result<f64>;

    /// One entry per variable, shaped like the variable (rank-0 entries for scalars).
    fn gradient(&self) -> Result<Gradient>;

    /// The current value of the variable `name`.
    fn get(&self, name: &str) -> Result<ArrayD<f64>> {
        Ok(self.variables().get(name)?.value())
    }

    fn fix(&self, name: &str) -> Result<()> {
        self.variables().get(name)?.fix();
        Ok(())
    }

    fn unfix(&self, name: &str) -> Result<()> {
        self.variables().get(name)?.unfix();
        Ok(())
    }

    fn is_fixed(&self, name: &str) -> Result<bool> {
        Ok(self.variables().get(name)?.is_fixed())
    }
}

impl<O: Objective + ?Sized> Objective for &O {
    fn variables(&self) -> &VariableSet {
        (**self).variables()
    }

    fn value(&self) -> Result<f64> {
        (**self).value()
    }

    fn gradient(&self) -> Result<Gradient> {
        (**self).gradient()
    }
}

impl<O: Objective + ?Sized> Objective for Box<O> {
    fn variables(&self) -> &VariableSet {
        (**self).variables()
    }

    fn value(&self) -> Result<f64> {
        (**self).value()
    }

    fn gradient(&self) -> Result<Gradient> {
        (**self).gradient()
    }
}

/// A parameterized function that needs external data to be evaluated.
pub trait Function {
    /// Whatever the function is evaluated on, e.g. an observation or a design matrix.
    type Data: ?Sized;

    fn variables(&self) -> &VariableSet;

    fn value(&self, data: &Self::Data) -> Result<f64>;

    fn gradient(&self, data: &Self::Data) -> Result<Gradient>;

    /// Binds `data`, producing an [`Objective`].
    fn feed<'a>(&'a self, data: &'a Self::Data) -> Feed<'a, Self>
    where
        Self: Sized,
    {
        Feed {
            function: self,
            data,
        }
    }
}

/// A [`Function`] bound to its data.
pub struct Feed<'a, F: Function> {
    function: &'a F,
    data: &'a F::Data,
}

impl<'a, F: Function> Feed<'a, F> {
    pub fn function(&self) -> &'a F {
        self.function
    }

    pub fn data(&self) -> &'a F::Data {
        self.data
    }
}

impl<F: Function> Objective for Feed<'_, F> {
    fn variables(&self) -> &VariableSet {
        self.function.variables()
    }

    fn value(&self) -> Result<f64> {
        self.function.value(self.data)
    }

    fn gradient(&self) -> Result<Gradient> {
        self.function.gradient(self.data)
    }
}

/// Combines the values and gradients of a [`Reduce`]'s children.
///
/// Both maps are keyed by child key (`"<prefix>[i]"` or the explicit key given to
/// [`Reduce::push_named`]). The returned gradient must be keyed by merged
/// variable name, i.e. `"<child key>.<variable>"`; see [`prefix_gradients`].
pub trait Reducer {
    fn value_reduce(&self, values: &BTreeMap<String, f64>) -> Result<f64>;

    fn gradient_reduce(
        &self,
        values: &BTreeMap<String, f64>,
        gradients: &BTreeMap<String, Gradient>,
    ) -> Result<Gradient>;
}

/// Adds the children's values.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sum;

impl Reducer for Sum {
    fn value_reduce(&self, values: &BTreeMap<String, f64>) -> Result<f64> {
        Ok(values.values().sum())
    }

    fn gradient_reduce(
        &self,
        _values: &BTreeMap<String, f64>,
        gradients: &BTreeMap<String, Gradient>,
    ) -> Result<Gradient> {
        Ok(prefix_gradients(gradients))
    }
}

/// Renames every child gradient entry to `<child key>.<name>`, the naming
/// used by [`merge_variables`]. An empty key keeps the bare name.
pub fn prefix_gradients(gradients: &BTreeMap<String, Gradient>) -> Gradient {
    let mut merged = Gradient::new();
    for (key, gradient) in gradients {
        for (name, derivative) in gradient {
            let full = if key.is_empty() {
                name.clone()
            } else {
                format!("{key}.{name}")
            };
            merged.insert(full, derivative.clone());
        }
    }
    merged
}

/// An objective built from child objectives and a [`Reducer`].
///
/// Its variables are the children's variables merged under each child's key,
/// sharing the same handles.
pub struct Reduce<'a, R> {
    reducer: R,
    prefix: String,
    children: Vec<(String, Box<dyn Objective + 'a>)>,
    variables: VariableSet,
}

impl<'a, R: Reducer> Reduce<'a, R> {
    /// Child `i` added with [`push`](Self::push) is keyed `"<prefix>[i]"`.
    pub fn new(reducer: R, prefix: impl Into<String>) -> Self {
        Self {
            reducer,
            prefix: prefix.into(),
            children: Vec::new(),
            variables: VariableSet::new(),
        }
    }

    /// Adds a child keyed by its position.
    pub fn push(self, child: impl Objective + 'a) -> Self {
        let key = format!("{}[{}]", self.prefix, self.children.len());
        self.push_named(key, child)
    }

    /// Adds a child under an explicit key.
    pub fn push_named(mut self, key: impl Into<String>, child: impl Objective + 'a) -> Self {
        self.children.push((key.into(), Box::new(child)));
        self.variables = merge_variables(
            self.children
                .iter()
                .map(|(key, child)| (key.as_str(), child.variables())),
        );
        self
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.children.iter().map(|(key, _)| key.as_str())
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    fn child_values(&self) -> Result<BTreeMap<String, f64>> {
        self.children
            .iter()
            .map(|(key, child)| child.value().map(|value| (key.clone(), value)))
            .collect()
    }
}

impl<R: Reducer> Objective for Reduce<'_, R> {
    fn variables(&self) -> &VariableSet {
        &self.variables
    }

    fn value(&self) -> Result<f64> {
        self.reducer.value_reduce(&self.child_values()?)
    }

    fn gradient(&self) -> Result<Gradient> {
        let values = self.child_values()?;
        let gradients = self
            .children
            .iter()
            .map(|(key, child)| child.gradient().map(|gradient| (key.clone(), gradient)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        self.reducer.gradient_reduce(&values, &gradients)
    }
}

/// `-f`, over the same variables as `f`.
#[derive(Debug, Clone)]
pub struct Negative<O>(pub O);

impl<O: Objective> Objective for Negative<O> {
    fn variables(&self) -> &VariableSet {
        self.0.variables()
    }

    fn value(&self) -> Result<f64> {
        Ok(-self.0.value()?)
    }

    fn gradient(&self) -> Result<Gradient> {
        let mut gradient = self.0.gradient()?;
        for derivative in gradient.values_mut() {
            derivative.mapv_inplace(|d| -d);
        }
        Ok(gradient)
    }
}
