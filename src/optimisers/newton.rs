use anyhow::bail;
use log::debug;

use crate::optimisers::brent::check_interval;
use crate::optimisers::{DerivativeOracle, OptimisationError};
use crate::Result;

/// Safeguarded Newton-Raphson search for a root of the oracle's value inside `[x1, x2]`.
///
/// The oracle returns the function value and its derivative at a point. The search keeps a
/// bracket derived from the sign of the value at the guess and falls back to bisection when the
/// derivative is not positive or the Newton step would leave the bracket.
///
/// Hitting the iteration cap returns the previous point, the best one found so far. A cap of
/// zero never enters the loop and fails with [`OptimisationError::NewtonLimit`].
pub fn minimize_newton<O: DerivativeOracle + ?Sized>(
    x1: f64,
    xguess: f64,
    x2: f64,
    tolerance: f64,
    max_iters: usize,
    oracle: &O,
) -> Result<f64> {
    check_interval(x1, x2)?;
    let mut rts = xguess.clamp(x1, x2);
    let (mut f, mut df) = evaluate(oracle, rts)?;
    debug!(
        "Newton-Raphson start: x = {}, f = {}, df = {}, next x = {}",
        rts,
        f,
        df,
        rts - f / df
    );

    if df >= 0.0 && f.abs() < tolerance {
        return Ok(rts);
    }
    let (mut xl, mut xh) = if f < 0.0 { (rts, x2) } else { (x1, rts) };

    for i in 1..=max_iters {
        let rts_old = rts;
        let dx;
        if df <= 0.0 || ((rts - xh) * df - f) * ((rts - xl) * df - f) >= 0.0 {
            dx = 0.5 * (xh - xl);
            rts = xl + dx;
            if xl == rts {
                return Ok(rts);
            }
        } else {
            dx = f / df;
            let previous = rts;
            rts -= dx;
            if previous == rts {
                return Ok(rts);
            }
        }
        if dx.abs() < tolerance || i == max_iters {
            return Ok(rts_old);
        }

        if rts < x1 {
            rts = x1;
        }
        (f, df) = evaluate(oracle, rts)?;
        if df > 0.0 && f.abs() < tolerance {
            return Ok(rts);
        }
        if f < 0.0 {
            xl = rts;
        } else {
            xh = rts;
        }
    }

    bail!(OptimisationError::NewtonLimit)
}

fn evaluate<O: DerivativeOracle + ?Sized>(oracle: &O, x: f64) -> Result<(f64, f64)> {
    let (f, df) = oracle.derivatives(x)?;
    if !f.is_finite() || !df.is_finite() {
        bail!(OptimisationError::NewtonDerivative(format!(
            "non-finite derivatives f = {}, df = {} at x = {}",
            f, df, x
        )));
    }
    Ok((f, df))
}
