//! Bounded scalar minimization: downhill bracketing, then Brent's method.
//!
//! The bracket phase walks downhill from the start point with a unit trial step,
//! doubling the stride each time and clamping to the interval, until the
//! function turns up again or the walk runs into a bound. Brent's method then
//! combines golden-section steps with parabolic interpolation inside the
//! bracket.

/// Golden-section fraction, `(3 - √5) / 2`.
const CGOLD: f64 = 0.381_966_011_250_105_1;
const GROWTH: f64 = 2.0;
const MAX_BRACKET_STEPS: usize = 64;

/// Tolerances for [`minimize`]. The search stops once the bracket around the
/// best point is narrower than about `2 * (rtol * |x| + atol)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BrentOptions {
    pub rtol: f64,
    pub atol: f64,
    pub max_iterations: usize,
}

impl Default for BrentOptions {
    fn default() -> Self {
        Self {
            rtol: 1.4902e-8,
            atol: 1.4902e-8,
            max_iterations: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BrentSolution {
    /// The best point found.
    pub x: f64,
    /// The function value at `x`.
    pub fx: f64,
    pub evaluations: usize,
    /// `false` when the bracket could not be closed or Brent's method ran out of
    /// iterations.
    pub converged: bool,
}

/// A function value with NaN mapped to +∞, so comparisons stay meaningful.
struct Counted<F> {
    f: F,
    evaluations: usize,
}

impl<F> Counted<F> {
    fn eval<E>(&mut self, x: f64) -> Result<f64, E>
    where
        F: FnMut(f64) -> Result<f64, E>,
    {
        self.evaluations += 1;
        let fx = (self.f)(x)?;
        log::trace!("brent evaluation {}: f({x:e}) = {fx:e}", self.evaluations);
        Ok(if fx.is_nan() { f64::INFINITY } else { fx })
    }
}

enum Bracket {
    /// `fb` is below both `fa` and `fc`, with `b` between `a` and `c`.
    Interior { a: f64, b: f64, fb: f64, c: f64 },
    /// The walk stopped on a bound at `b`, still going downhill from `a`.
    Boundary { a: f64, b: f64, fb: f64 },
    /// Still going downhill after [`MAX_BRACKET_STEPS`] expansions.
    Unbounded { b: f64, fb: f64 },
}

/// Minimizes `f` over `[lower, upper]`, starting from `start`.
///
/// A non-finite `start` is replaced by 0. Either way the start is clamped into
/// the interval. Infinite bounds are allowed.
///
/// # Errors
/// Only errors returned by `f`, which abort the search at once.
pub fn minimize<F, E>(
    f: F,
    start: f64,
    (lower, upper): (f64, f64),
    options: &BrentOptions,
) -> Result<BrentSolution, E>
where
    F: FnMut(f64) -> Result<f64, E>,
{
    let mut f = Counted { f, evaluations: 0 };
    if !(lower <= upper) {
        return Ok(BrentSolution {
            x: start,
            fx: f64::NAN,
            evaluations: 0,
            converged: false,
        });
    }
    let clamp = |x: f64| x.max(lower).min(upper);
    let x0 = clamp(if start.is_finite() { start } else { 0.0 });

    let solution = match bracket(&mut f, x0, clamp)? {
        Bracket::Interior { a, b, fb, c } => brent(&mut f, (a.min(c), a.max(c)), b, fb, options)?,
        Bracket::Boundary { a, b, fb } => {
            if a == b {
                (b, fb, true)
            } else {
                let mid = 0.5 * (a + b);
                let fmid = f.eval(mid)?;
                let (x, fx, converged) = brent(&mut f, (a.min(b), a.max(b)), mid, fmid, options)?;
                if fb <= fx { (b, fb, converged) } else { (x, fx, converged) }
            }
        }
        Bracket::Unbounded { b, fb } => (b, fb, false),
    };
    let (x, fx, converged) = solution;
    log::debug!(
        "Brent search finished at x = {x:e} after {} evaluations (converged: {converged}).",
        f.evaluations
    );
    Ok(BrentSolution {
        x,
        fx,
        evaluations: f.evaluations,
        converged,
    })
}

fn bracket<F, E>(f: &mut Counted<F>, x0: f64, clamp: impl Fn(f64) -> f64) -> Result<Bracket, E>
where
    F: FnMut(f64) -> Result<f64, E>,
{
    let f0 = f.eval(x0)?;
    let mut x1 = clamp(x0 + 1.0);
    if x1 == x0 {
        x1 = clamp(x0 - 1.0);
    }
    if x1 == x0 {
        return Ok(Bracket::Boundary { a: x0, b: x0, fb: f0 });
    }
    let f1 = f.eval(x1)?;

    // Make a -> b the downhill direction.
    let (mut a, mut b, mut fb) = if f1 > f0 { (x1, x0, f0) } else { (x0, x1, f1) };
    for _ in 0..MAX_BRACKET_STEPS {
        let c = clamp(b + GROWTH * (b - a));
        if c == b {
            return Ok(Bracket::Boundary { a, b, fb });
        }
        let fc = f.eval(c)?;
        if fc >= fb {
            return Ok(Bracket::Interior { a, b, fb, c });
        }
        (a, b, fb) = (b, c, fc);
    }
    Ok(Bracket::Unbounded { b, fb })
}

/// Brent's method on `[lo, hi]` from a known point `x` inside it.
fn brent<F, E>(
    f: &mut Counted<F>,
    (mut lo, mut hi): (f64, f64),
    x: f64,
    fx: f64,
    options: &BrentOptions,
) -> Result<(f64, f64, bool), E>
where
    F: FnMut(f64) -> Result<f64, E>,
{
    let (mut x, mut w, mut v) = (x, x, x);
    let (mut fx, mut fw, mut fv) = (fx, fx, fx);
    // `d` is the last step, `e` the one before it.
    let (mut d, mut e) = (0.0_f64, 0.0_f64);

    for _ in 0..options.max_iterations {
        let xm = 0.5 * (lo + hi);
        let tol1 = options.rtol * x.abs() + options.atol;
        let tol2 = 2.0 * tol1;
        if (x - xm).abs() <= tol2 - 0.5 * (hi - lo) {
            return Ok((x, fx, true));
        }

        let mut golden = true;
        if e.abs() > tol1 {
            // Parabola through x, w and v.
            let r = (x - w) * (fx - fv);
            let mut q = (x - v) * (fx - fw);
            let mut p = (x - v) * q - (x - w) * r;
            q = 2.0 * (q - r);
            if q > 0.0 {
                p = -p;
            }
            q = q.abs();
            let e_prev = e;
            e = d;
            if p.abs() < (0.5 * q * e_prev).abs() && p > q * (lo - x) && p < q * (hi - x) {
                d = p / q;
                let u = x + d;
                if u - lo < tol2 || hi - u < tol2 {
                    d = tol1.copysign(xm - x);
                }
                golden = false;
            }
        }
        if golden {
            e = if x >= xm { lo - x } else { hi - x };
            d = CGOLD * e;
        }

        let u = if d.abs() >= tol1 { x + d } else { x + tol1.copysign(d) };
        let fu = f.eval(u)?;

        if fu <= fx {
            if u >= x {
                lo = x;
            } else {
                hi = x;
            }
            (v, fv) = (w, fw);
            (w, fw) = (x, fx);
            (x, fx) = (u, fu);
        } else {
            if u < x {
                lo = u;
            } else {
                hi = u;
            }
            if fu <= fw || w == x {
                (v, fv) = (w, fw);
                (w, fw) = (u, fu);
            } else if fu <= fv || v == x || v == w {
                (v, fv) = (u, fu);
            }
        }
    }
    Ok((x, fx, false))
}
