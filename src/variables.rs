//! Name-keyed variable sets and their flat-vector view.
//!
//! Names are kept in a [`BTreeMap`], so every walk over a set visits them in
//! lexicographic order. That order is what ties an offset in a flat vector to a
//! variable: [`VariableSet::flatten`], [`VariableSet::unflatten`],
//! [`VariableSet::flatten_values`] and [`VariableSet::bounds`] all follow it.

use std::collections::BTreeMap;
use std::fmt;

use ndarray::{Array1, ArrayD};

use crate::error::{OptimixError, Result};
use crate::variable::Variable;

/// A name to array map, used for gradients and bulk assignments.
pub type ValueMap = BTreeMap<String, ArrayD<f64>>;

/// A set of named variables.
#[derive(Clone, Default)]
pub struct VariableSet {
    vars: BTreeMap<String, Variable>,
}

impl VariableSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a variable, returning the one previously stored under `name`.
    pub fn insert(&mut self, name: impl Into<String>, variable: Variable) -> Option<Variable> {
        self.vars.insert(name.into(), variable)
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with(mut self, name: impl Into<String>, variable: Variable) -> Self {
        self.insert(name, variable);
        self
    }

    /// # Errors
    /// [`OptimixError::NameNotFound`] if no variable is called `name`.
    pub fn get(&self, name: &str) -> Result<&Variable> {
        self.vars.get(name).ok_or_else(|| OptimixError::NameNotFound {
            name: name.to_string(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Sorted variable names.
    pub fn names(&self) -> Vec<String> {
        self.vars.keys().cloned().collect()
    }

    /// Variables in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Variable)> {
        self.vars.iter().map(|(name, var)| (name.as_str(), var))
    }

    /// Assigns every entry of `values` to the variable of the same name.
    ///
    /// All entries are validated before any variable is written, so on error
    /// the set is unchanged.
    ///
    /// # Errors
    /// [`OptimixError::NameNotFound`] for an unknown name and
    /// [`OptimixError::ShapeMismatch`] for a value that cannot be assigned
    /// (see [`Variable::set_value`]).
    pub fn set(&self, values: &ValueMap) -> Result<()> {
        for (name, value) in values {
            self.get(name)?
                .check_assignable(value.shape())
                .map_err(|e| e.with_name(name))?;
        }
        for (name, value) in values {
            self.get(name)?
                .set_value(value)
                .map_err(|e| e.with_name(name))?;
        }
        Ok(())
    }

    /// The variables whose fixed flag equals `fixed`. Handles are shared.
    pub fn select(&self, fixed: bool) -> VariableSet {
        let vars = self
            .vars
            .iter()
            .filter(|(_, var)| var.is_fixed() == fixed)
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        VariableSet { vars }
    }

    /// Total number of elements.
    pub fn size(&self) -> usize {
        self.vars.values().map(Variable::size).sum()
    }

    /// Concatenates the current values in name order.
    pub fn flatten(&self) -> Array1<f64> {
        let mut flat = Vec::with_capacity(self.size());
        for var in self.vars.values() {
            flat.extend(var.flat_values());
        }
        Array1::from_vec(flat)
    }

    /// Slices `x` by name order and size and writes each slice back.
    ///
    /// # Errors
    /// [`OptimixError::LengthMismatch`] if `x.len()` differs from [`size`](Self::size).
    pub fn unflatten(&self, x: &[f64]) -> Result<()> {
        let expected = self.size();
        if x.len() != expected {
            return Err(OptimixError::LengthMismatch {
                expected,
                found: x.len(),
            });
        }
        let mut offset = 0;
        for (name, var) in &self.vars {
            let size = var.size();
            var.assign_flat(&x[offset..offset + size])
                .map_err(|e| e.with_name(name))?;
            offset += size;
        }
        Ok(())
    }

    /// Concatenates the entries of `values` in this set's name order.
    ///
    /// Entries for names outside the set are ignored.
    ///
    /// # Errors
    /// [`OptimixError::NameNotFound`] if `values` lacks one of the set's names and
    /// [`OptimixError::ShapeMismatch`] if an entry's size differs from its variable's.
    pub fn flatten_values(&self, values: &ValueMap) -> Result<Array1<f64>> {
        let mut flat = Vec::with_capacity(self.size());
        for (name, var) in &self.vars {
            let value = values.get(name).ok_or_else(|| OptimixError::NameNotFound {
                name: name.clone(),
            })?;
            if value.len() != var.size() {
                return Err(OptimixError::ShapeMismatch {
                    name: name.clone(),
                    expected: var.shape(),
                    found: value.shape().to_vec(),
                });
            }
            flat.extend(value.iter().copied());
        }
        Ok(Array1::from_vec(flat))
    }

    /// Per-element bounds in name order, aligned with [`flatten`](Self::flatten).
    pub fn bounds(&self) -> Vec<(f64, f64)> {
        self.vars.values().flat_map(Variable::bounds).collect()
    }
}

/// The sorted names of the free variables.
///
/// Every flatten/unflatten done on behalf of a solver is ordered by this list.
pub fn free_names(variables: &VariableSet) -> Vec<String> {
    variables.select(false).names()
}

/// Merges several sets into one, naming each entry `<prefix>.<name>`.
///
/// An empty prefix keeps the bare name. Two entries that end up with the same
/// merged name are not both kept: the later one replaces the earlier one and a
/// warning is logged.
pub fn merge_variables<'a, I, P>(sets: I) -> VariableSet
where
    I: IntoIterator<Item = (P, &'a VariableSet)>,
    P: AsRef<str>,
{
    let mut merged = VariableSet::new();
    for (prefix, set) in sets {
        let prefix = prefix.as_ref();
        for (name, var) in set.iter() {
            let full = if prefix.is_empty() {
                name.to_string()
            } else {
                format!("{prefix}.{name}")
            };
            if merged.insert(full.clone(), var.clone()).is_some() {
                log::warn!("Variable `{full}` defined twice while merging; keeping the later one.");
            }
        }
    }
    merged
}

impl FromIterator<(String, Variable)> for VariableSet {
    fn from_iter<T: IntoIterator<Item = (String, Variable)>>(iter: T) -> Self {
        VariableSet {
            vars: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for VariableSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Variables(")?;
        for (i, (name, var)) in self.vars.iter().enumerate() {
            if i > 0 {
                write!(f, ",\n{:10}", "")?;
            }
            write!(f, "{name}={var}")?;
        }
        write!(f, ")")
    }
}

impl fmt::Debug for VariableSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.vars.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr0, array};
    use spectral::prelude::*;

    fn sample() -> VariableSet {
        VariableSet::new()
            .with("b", Variable::vector(array![1.0, 2.0]))
            .with("a", Variable::scalar(0.5))
            .with("c", Variable::matrix(array![[3.0, 4.0], [5.0, 6.0]]))
    }

    #[test]
    fn names_are_sorted_regardless_of_insertion_order() {
        let forward = sample();
        let backward = VariableSet::new()
            .with("c", Variable::scalar(0.0))
            .with("a", Variable::scalar(0.0))
            .with("b", Variable::scalar(0.0));
        assert_that(&forward.names()).is_equal_to(vec!["a".to_string(), "b".into(), "c".into()]);
        assert_that(&backward.names()).is_equal_to(forward.names());
    }

    #[test]
    fn missing_names_are_reported() {
        let set = sample();
        assert!(matches!(
            set.get("zeta"),
            Err(OptimixError::NameNotFound { ref name }) if name == "zeta"
        ));
    }

    #[test]
    fn flatten_walks_names_in_order() {
        let set = sample();
        assert_that(&set.size()).is_equal_to(7);
        assert_that(&set.flatten().to_vec())
            .is_equal_to(vec![0.5, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn unflatten_then_flatten_is_identity() {
        let set = sample();
        let x = [9.0, 8.0, 7.0, 6.0, 5.0, 4.0, 3.0];
        set.unflatten(&x).unwrap();
        assert_that(&set.flatten().to_vec()).is_equal_to(x.to_vec());
        assert_that(&set.get("a").unwrap().ndim()).is_equal_to(0);
        assert_that(&set.get("c").unwrap().value())
            .is_equal_to(array![[6.0, 5.0], [4.0, 3.0]].into_dyn());
    }

    #[test]
    fn flatten_then_unflatten_restores_values() {
        let set = sample();
        let before: Vec<_> = set.iter().map(|(_, v)| v.value()).collect();
        let flat = set.flatten();
        set.unflatten(flat.as_slice().unwrap()).unwrap();
        let after: Vec<_> = set.iter().map(|(_, v)| v.value()).collect();
        assert_that(&after).is_equal_to(before);
    }

    #[test]
    fn unflatten_rejects_wrong_length() {
        let set = sample();
        assert!(matches!(
            set.unflatten(&[1.0, 2.0]),
            Err(OptimixError::LengthMismatch { expected: 7, found: 2 })
        ));
        assert_that(&set.get("a").unwrap().as_scalar()).is_equal_to(0.5);
    }

    #[test]
    fn fixed_variables_stay_out_of_the_free_view() {
        let set = sample();
        set.get("b").unwrap().fix();
        let free = set.select(false);
        assert_that(&free_names(&set)).is_equal_to(vec!["a".to_string(), "c".into()]);
        assert_that(&free.size()).is_equal_to(5);

        free.unflatten(&[0.0, 1.0, 1.0, 1.0, 1.0]).unwrap();
        assert_that(&set.get("b").unwrap().flat_values()).is_equal_to(vec![1.0, 2.0]);

        set.get("b").unwrap().unfix();
        assert_that(&set.select(false).size()).is_equal_to(7);
        assert_that(&set.select(true).len()).is_equal_to(0);
    }

    #[test]
    fn set_validates_everything_first() {
        let set = sample();
        let mut values = ValueMap::new();
        values.insert("a".into(), arr0(3.0).into_dyn());
        values.insert("b".into(), array![1.0, 2.0, 3.0].into_dyn());
        assert!(matches!(
            set.set(&values),
            Err(OptimixError::ShapeMismatch { ref name, .. }) if name == "b"
        ));
        assert_that(&set.get("a").unwrap().as_scalar()).is_equal_to(0.5);

        values.insert("b".into(), arr0(7.0).into_dyn());
        set.set(&values).unwrap();
        assert_that(&set.get("a").unwrap().as_scalar()).is_equal_to(3.0);
        assert_that(&set.get("b").unwrap().flat_values()).is_equal_to(vec![7.0, 7.0]);
    }

    #[test]
    fn flatten_values_follows_the_set_order() {
        let set = sample().select(false);
        let mut grad = ValueMap::new();
        grad.insert("c".into(), array![[1.0, 1.0], [1.0, 1.0]].into_dyn());
        grad.insert("a".into(), arr0(-1.0).into_dyn());
        grad.insert("b".into(), array![2.0, 3.0].into_dyn());
        grad.insert("unrelated".into(), arr0(100.0).into_dyn());
        assert_that(&set.flatten_values(&grad).unwrap().to_vec())
            .is_equal_to(vec![-1.0, 2.0, 3.0, 1.0, 1.0, 1.0, 1.0]);

        grad.remove("b");
        assert!(matches!(
            set.flatten_values(&grad),
            Err(OptimixError::NameNotFound { .. })
        ));
    }

    #[test]
    fn bounds_line_up_with_the_flat_vector() {
        let set = sample();
        set.get("a").unwrap().set_bounds((0.0, 1.0)).unwrap();
        set.get("b")
            .unwrap()
            .set_bounds(vec![(-1.0, 1.0), (-2.0, 2.0)])
            .unwrap();
        let bounds = set.bounds();
        assert_that(&bounds.len()).is_equal_to(7);
        assert_that(&bounds[0]).is_equal_to((0.0, 1.0));
        assert_that(&bounds[2]).is_equal_to((-2.0, 2.0));
        assert_that(&bounds[3]).is_equal_to((f64::NEG_INFINITY, f64::INFINITY));
    }

    #[test]
    fn merge_prefixes_and_shares_handles() {
        let a = VariableSet::new().with("a0", Variable::scalar(1.0));
        let b = VariableSet::new()
            .with("b0", Variable::scalar(1.0))
            .with("b1", Variable::scalar(1.0));
        let own = VariableSet::new().with("z", Variable::scalar(1.0));
        let merged = merge_variables([("a", &a), ("b", &b), ("", &own)]);

        assert_that(&merged.len()).is_equal_to(a.len() + b.len() + own.len());
        assert_that(&merged.names()).is_equal_to(vec![
            "a.a0".to_string(),
            "b.b0".into(),
            "b.b1".into(),
            "z".into(),
        ]);

        a.get("a0").unwrap().set_scalar(2.0);
        assert_that(&merged.get("a.a0").unwrap().as_scalar()).is_equal_to(2.0);
        assert!(merged.get("a.a0").unwrap().ptr_eq(a.get("a0").unwrap()));
    }

    #[test]
    fn merge_collisions_keep_the_later_entry() {
        let first = VariableSet::new().with("x", Variable::scalar(1.0));
        let second = VariableSet::new().with("x", Variable::scalar(2.0));
        let merged = merge_variables([("p", &first), ("p", &second)]);
        assert_that(&merged.len()).is_equal_to(1);
        assert_that(&merged.get("p.x").unwrap().as_scalar()).is_equal_to(2.0);
    }

    #[test]
    fn display_lists_one_variable_per_line() {
        let set = VariableSet::new()
            .with("a", Variable::scalar(1.0))
            .with("b", Variable::scalar(1.5));
        let expected = format!("Variables(a=Scalar(1.0),\n{}b=Scalar(1.5))", " ".repeat(10));
        assert_that(&set.to_string()).is_equal_to(expected);
    }
}
