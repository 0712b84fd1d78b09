//! Bounded restarts after transient solver failures.

use ndarray::Array1;

use super::lbfgsb::{LbfgsbSolution, Warnflag};
use crate::error::{OptimixError, Result};

/// How the restart point is built from the last two evaluated points.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Blend {
    /// `(previous + last) / 2`
    #[default]
    Average,
    /// `previous / 5 + last / 5`, which also pulls the point towards the origin.
    Shrink,
}

impl Blend {
    pub fn apply(self, previous: &Array1<f64>, last: &Array1<f64>) -> Array1<f64> {
        match self {
            Blend::Average => (previous + last) / 2.0,
            Blend::Shrink => previous / 5.0 + last / 5.0,
        }
    }
}

/// The result of one solver attempt.
#[derive(Debug)]
pub(crate) enum Attempt<T> {
    Success(T),
    /// Worth retrying from a perturbed point.
    TransientFailure(OptimixError),
    Fatal(OptimixError),
}

impl From<Result<LbfgsbSolution>> for Attempt<LbfgsbSolution> {
    fn from(result: Result<LbfgsbSolution>) -> Self {
        match result {
            Ok(solution) => match solution.warnflag {
                Warnflag::Converged => Attempt::Success(solution),
                Warnflag::LimitReached => Attempt::Fatal(OptimixError::SolverDivergence {
                    task: solution.task,
                }),
                Warnflag::Abnormal => Attempt::TransientFailure(OptimixError::SolverInternal {
                    task: solution.task,
                }),
            },
            Err(e) if e.is_transient() => Attempt::TransientFailure(e),
            Err(e) => Attempt::Fatal(e),
        }
    }
}

/// The points a solver has visited, and a way to move the problem to a new one.
pub(crate) trait History {
    fn last_two(&self) -> Option<(Array1<f64>, Array1<f64>)>;

    fn restart_from(&self, x: &Array1<f64>) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    max_attempts: usize,
    blend: Blend,
}

impl RetryPolicy {
    pub(crate) fn new(max_attempts: usize, blend: Blend) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            blend,
        }
    }

    /// Runs `attempt` until it succeeds, fails fatally, or the attempts run out.
    ///
    /// Returns the successful value together with the number of attempts made.
    pub(crate) fn run<T>(
        &self,
        history: &impl History,
        mut attempt: impl FnMut(usize) -> Attempt<T>,
    ) -> Result<(T, usize)> {
        let mut k = 1;
        loop {
            let cause = match attempt(k) {
                Attempt::Success(value) => return Ok((value, k)),
                Attempt::Fatal(e) => return Err(e),
                Attempt::TransientFailure(e) => e,
            };
            let Some((previous, last)) = history.last_two() else {
                return Err(OptimixError::FirstIterationFailure {
                    source: Box::new(cause),
                });
            };
            if k >= self.max_attempts {
                return Err(OptimixError::RetryExhausted {
                    attempts: k,
                    source: Box::new(cause),
                });
            }
            log::warn!("Attempt {k} failed ({cause}); restarting from a blend of the last two points.");
            history.restart_from(&self.blend.apply(&previous, &last))?;
            k += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use spectral::prelude::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct Recorder {
        points: RefCell<Vec<Array1<f64>>>,
        restarts: RefCell<Vec<Array1<f64>>>,
    }

    impl History for Recorder {
        fn last_two(&self) -> Option<(Array1<f64>, Array1<f64>)> {
            let points = self.points.borrow();
            match points.as_slice() {
                [.., previous, last] => Some((previous.clone(), last.clone())),
                _ => None,
            }
        }

        fn restart_from(&self, x: &Array1<f64>) -> Result<()> {
            self.restarts.borrow_mut().push(x.clone());
            Ok(())
        }
    }

    fn transient() -> OptimixError {
        OptimixError::BadSolution("degenerate".into())
    }

    #[test]
    fn blends() {
        let (a, b) = (array![1.0, 4.0], array![3.0, 6.0]);
        assert_that(&Blend::Average.apply(&a, &b).to_vec()).is_equal_to(vec![2.0, 5.0]);
        let shrunk = Blend::Shrink.apply(&a, &b);
        assert_that(&shrunk[0]).is_close_to(0.8, 1e-12);
        assert_that(&shrunk[1]).is_close_to(2.0, 1e-12);
        assert_that(&Blend::default()).is_equal_to(Blend::Average);
    }

    #[test]
    fn success_on_first_attempt() {
        let history = Recorder::default();
        let (value, attempts) = RetryPolicy::new(5, Blend::Average)
            .run(&history, |_| Attempt::Success(7))
            .unwrap();
        assert_that(&(value, attempts)).is_equal_to((7, 1));
    }

    #[test]
    fn transient_failure_restarts_from_the_blend() {
        let history = Recorder::default();
        let result = RetryPolicy::new(5, Blend::Average).run(&history, |k| {
            if k == 1 {
                history.points.borrow_mut().extend([array![0.0], array![1.0], array![3.0]]);
                Attempt::TransientFailure(transient())
            } else {
                Attempt::Success(k)
            }
        });
        assert_that(&result.unwrap()).is_equal_to((2, 2));
        assert_that(&history.restarts.borrow().clone()).is_equal_to(vec![array![2.0]]);
    }

    #[test]
    fn failure_before_two_points_is_a_first_iteration_failure() {
        let history = Recorder::default();
        history.points.borrow_mut().push(array![1.0]);
        let result: Result<((), usize)> =
            RetryPolicy::new(5, Blend::Average).run(&history, |_| Attempt::TransientFailure(transient()));
        assert!(matches!(result, Err(OptimixError::FirstIterationFailure { .. })));
        assert!(history.restarts.borrow().is_empty());
    }

    #[test]
    fn attempts_are_bounded() {
        let history = Recorder::default();
        history.points.borrow_mut().extend([array![1.0], array![2.0]]);
        let mut calls = 0;
        let result: Result<((), usize)> = RetryPolicy::new(3, Blend::Shrink).run(&history, |_| {
            calls += 1;
            Attempt::TransientFailure(transient())
        });
        assert!(matches!(result, Err(OptimixError::RetryExhausted { attempts: 3, .. })));
        assert_that(&calls).is_equal_to(3);
        assert_that(&history.restarts.borrow().len()).is_equal_to(2);
    }

    #[test]
    fn fatal_errors_are_not_retried() {
        let history = Recorder::default();
        history.points.borrow_mut().extend([array![1.0], array![2.0]]);
        let result: Result<((), usize)> = RetryPolicy::new(5, Blend::Average).run(&history, |_| {
            Attempt::Fatal(OptimixError::NameNotFound { name: "x".into() })
        });
        assert!(matches!(result, Err(OptimixError::NameNotFound { .. })));
        assert!(history.restarts.borrow().is_empty());
    }

    #[test]
    fn solver_reports_are_classified() {
        let solution = |warnflag| LbfgsbSolution {
            final_point: array![0.0],
            final_value: 0.0,
            final_gradient: array![0.0],
            iterations: 1,
            func_evals: 1,
            warnflag,
            task: "task".into(),
        };
        assert!(matches!(Attempt::from(Ok(solution(Warnflag::Converged))), Attempt::Success(_)));
        assert!(matches!(
            Attempt::from(Ok(solution(Warnflag::LimitReached))),
            Attempt::Fatal(OptimixError::SolverDivergence { .. })
        ));
        assert!(matches!(
            Attempt::from(Ok(solution(Warnflag::Abnormal))),
            Attempt::TransientFailure(OptimixError::SolverInternal { .. })
        ));
        assert!(matches!(
            Attempt::<LbfgsbSolution>::from(Err(transient())),
            Attempt::TransientFailure(_)
        ));
    }
}
