use anyhow::bail;
use argmin::core::CostFunction;
use log::debug;

use crate::optimisers::OptimisationError;
use crate::Result;

const MAX_ITERATIONS: usize = 100;
const CGOLD: f64 = 0.3819660;
const ZEPS: f64 = 1e-7;

/// Minimum found by Brent's method together with the score there and an estimate of the
/// curvature from the last parabola.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BrentResult {
    pub x: f64,
    pub fx: f64,
    pub f2x: f64,
}

/// Bounded scalar minimisation of `objective` over `[xmin, xmax]` starting at `xguess`.
///
/// A narrow bracket around the guess is tried first; when either end already scores better
/// than the guess the whole domain is used instead. If the search ends at a worse score than
/// the guess, the guess is returned.
pub fn minimize_brent<C>(
    xmin: f64,
    xguess: f64,
    xmax: f64,
    xtol: f64,
    objective: &C,
) -> Result<BrentResult>
where
    C: CostFunction<Param = f64, Output = f64>,
{
    check_interval(xmin, xmax)?;
    let guess = xguess.clamp(xmin, xmax);
    let eps = guess * xtol * 50.0;
    let mut ax = guess - eps;
    let ax_out = ax < xmin;
    if ax_out {
        ax = xmin;
    }
    let bx = guess;
    let mut cx = guess + eps;
    let cx_out = cx > xmax;
    if cx_out {
        cx = xmax;
    }

    let mut fa = objective.cost(&ax)?;
    let fb = objective.cost(&bx)?;
    let mut fc = objective.cost(&cx)?;

    if fa < fb || fc < fb {
        debug!("Guess {} is not bracketed, searching [{}, {}].", guess, xmin, xmax);
        if !ax_out {
            fa = objective.cost(&xmin)?;
        }
        if !cx_out {
            fc = objective.cost(&xmax)?;
        }
        ax = xmin;
        cx = xmax;
    }

    let result = brent_search(Bracket { ax, bx, cx, fa, fb, fc }, xtol, objective)?;
    if result.fx > fb {
        return Ok(BrentResult {
            x: bx,
            fx: objective.cost(&bx)?,
            f2x: result.f2x,
        });
    }
    Ok(result)
}

/// Rejects search intervals that are empty or not finite.
pub(crate) fn check_interval(xmin: f64, xmax: f64) -> Result<()> {
    if !xmin.is_finite() || !xmax.is_finite() || xmin > xmax {
        bail!(OptimisationError::InvalidParameter(format!(
            "Search interval [{}, {}] is empty",
            xmin, xmax
        )));
    }
    Ok(())
}

struct Bracket {
    ax: f64,
    bx: f64,
    cx: f64,
    fa: f64,
    fb: f64,
    fc: f64,
}

fn brent_search<C>(bracket: Bracket, tol: f64, objective: &C) -> Result<BrentResult>
where
    C: CostFunction<Param = f64, Output = f64>,
{
    let Bracket {
        ax,
        bx,
        cx,
        fa,
        fb,
        fc,
    } = bracket;
    let mut a = ax.min(cx);
    let mut b = ax.max(cx);
    let mut x = bx;
    let mut fx = fb;
    let (mut w, mut fw, mut v, mut fv) = if fa < fc {
        (ax, fa, cx, fc)
    } else {
        (cx, fc, ax, fa)
    };
    let mut d: f64 = 0.0;
    let mut e: f64 = 0.0;

    for _ in 0..MAX_ITERATIONS {
        let xm = 0.5 * (a + b);
        let tol1 = tol * x.abs() + ZEPS;
        let tol2 = 2.0 * tol1;
        if (x - xm).abs() <= tol2 - 0.5 * (b - a) {
            return Ok(BrentResult {
                x,
                fx,
                f2x: curvature(x, fx, w, fw, v, fv),
            });
        }

        if e.abs() > tol1 {
            let r = (x - w) * (fx - fv);
            let mut q = (x - v) * (fx - fw);
            let mut p = (x - v) * q - (x - w) * r;
            q = 2.0 * (q - r);
            if q > 0.0 {
                p = -p;
            }
            q = q.abs();
            let etemp = e;
            e = d;
            if p.abs() >= (0.5 * q * etemp).abs() || p <= q * (a - x) || p >= q * (b - x) {
                e = if x >= xm { a - x } else { b - x };
                d = CGOLD * e;
            } else {
                d = p / q;
                let u = x + d;
                if u - a < tol2 || b - u < tol2 {
                    d = tol1.copysign(xm - x);
                }
            }
        } else {
            e = if x >= xm { a - x } else { b - x };
            d = CGOLD * e;
        }

        let u = if d.abs() >= tol1 {
            x + d
        } else {
            x + tol1.copysign(d)
        };
        let fu = objective.cost(&u)?;
        if fu <= fx {
            if u >= x {
                a = x;
            } else {
                b = x;
            }
            (v, w, x) = (w, x, u);
            (fv, fw, fx) = (fw, fx, fu);
        } else {
            if u < x {
                a = u;
            } else {
                b = u;
            }
            if fu <= fw || w == x {
                (v, fv) = (w, fw);
                (w, fw) = (u, fu);
            } else if fu <= fv || v == x || v == w {
                (v, fv) = (u, fu);
            }
        }
    }

    debug!("Brent's method reached {} iterations at x = {}.", MAX_ITERATIONS, x);
    Ok(BrentResult {
        x,
        fx,
        f2x: curvature(x, fx, w, fw, v, fv),
    })
}

/// Second derivative of the parabola through the last three points.
fn curvature(x: f64, fx: f64, w: f64, fw: f64, v: f64, fv: f64) -> f64 {
    let xw = x - w;
    let wv = w - v;
    let vx = v - x;
    2.0 * (fv * xw + fx * wv + fw * vx) / (v * v * xw + x * x * wv + w * w * vx)
}
