//! Discrete gamma model of rate heterogeneity (Yang 1994), category rates by the mean method.

use anyhow::bail;

use crate::optimisers::OptimisationError;
use crate::Result;

/// Smallest shape parameter for which the quantile approximations stay accurate.
pub const MIN_ALPHA: f64 = 0.02;

/// Mean rates of `categories` equiprobable categories of a gamma distribution with shape and
/// rate `alpha`. The rates average to one.
pub fn discrete_gamma_rates(alpha: f64, categories: usize) -> Result<Vec<f64>> {
    if categories == 0 {
        bail!(OptimisationError::InvalidParameter(String::from(
            "At least one rate category is required"
        )));
    }
    if !alpha.is_finite() || alpha < MIN_ALPHA {
        bail!(OptimisationError::InvalidParameter(format!(
            "Gamma shape must be at least {}, got {}",
            MIN_ALPHA, alpha
        )));
    }
    if categories == 1 {
        return Ok(vec![1.0]);
    }

    let k = categories as f64;
    let beta = alpha;
    let ln_gamma_alpha1 = ln_gamma(alpha + 1.0);

    let mut cumulative = Vec::with_capacity(categories - 1);
    for i in 1..categories {
        let point = point_chi2(i as f64 / k, 2.0 * alpha)? / (2.0 * beta);
        cumulative.push(incomplete_gamma(point * beta, alpha + 1.0, ln_gamma_alpha1)?);
    }

    let mut rates = Vec::with_capacity(categories);
    rates.push(cumulative[0] * k);
    for i in 1..categories - 1 {
        rates.push((cumulative[i] - cumulative[i - 1]) * k);
    }
    rates.push((1.0 - cumulative[categories - 2]) * k);
    Ok(rates)
}

/// Logarithm of the gamma function by Stirling's series, shifted to arguments of at least 7.
pub fn ln_gamma(alpha: f64) -> f64 {
    let mut x = alpha;
    let mut f = 0.0;
    if x < 7.0 {
        f = 1.0;
        let mut z = x;
        while z < 7.0 {
            f *= z;
            z += 1.0;
        }
        x = z;
        f = -f.ln();
    }
    let z = 1.0 / (x * x);
    f + (x - 0.5) * x.ln() - x
        + 0.918938533204673
        + (((-0.000595238095238 * z + 0.000793650793650) * z - 0.002777777777778) * z
            + 0.083333333333333)
            / x
}

/// Regularised lower incomplete gamma function P(alpha, x), algorithm AS 32.
pub fn incomplete_gamma(x: f64, alpha: f64, ln_gamma_alpha: f64) -> Result<f64> {
    const ACCURATE: f64 = 1e-10;
    const OVERFLOW: f64 = 1e60;

    if x == 0.0 {
        return Ok(0.0);
    }
    if x < 0.0 || alpha <= 0.0 {
        bail!(OptimisationError::InvalidParameter(format!(
            "Incomplete gamma undefined for x = {}, alpha = {}",
            x, alpha
        )));
    }

    let factor = (alpha * x.ln() - x - ln_gamma_alpha).exp();

    if x <= 1.0 || x < alpha {
        // series expansion
        let mut gin = 1.0;
        let mut term = 1.0;
        let mut rn = alpha;
        loop {
            rn += 1.0;
            term *= x / rn;
            gin += term;
            if term <= ACCURATE {
                break;
            }
        }
        return Ok(gin * factor / alpha);
    }

    // continued fraction
    let mut a = 1.0 - alpha;
    let mut b = a + x + 1.0;
    let mut term = 0.0;
    let mut pn = [1.0, x, x + 1.0, x * b, 0.0, 0.0];
    let mut gin = pn[2] / pn[3];
    loop {
        a += 1.0;
        b += 2.0;
        term += 1.0;
        let an = a * term;
        for i in 0..2 {
            pn[i + 4] = b * pn[i + 2] - an * pn[i];
        }
        if pn[5] != 0.0 {
            let rn = pn[4] / pn[5];
            let dif = (gin - rn).abs();
            if dif <= ACCURATE && dif <= ACCURATE * rn {
                return Ok(1.0 - factor * gin);
            }
            gin = rn;
        }
        for i in 0..4 {
            pn[i] = pn[i + 2];
        }
        if pn[4].abs() >= OVERFLOW {
            for v in pn.iter_mut().take(4) {
                *v /= OVERFLOW;
            }
        }
    }
}

/// Quantile of the standard normal distribution, algorithm AS 111.
pub fn point_normal(prob: f64) -> f64 {
    let (a0, a1, a2, a3, a4) = (
        -0.322232431088,
        -1.0,
        -0.342242088547,
        -0.0204231210245,
        -0.453642210148e-4,
    );
    let (b0, b1, b2, b3, b4) = (
        0.0993484626060,
        0.588581570495,
        0.531103462366,
        0.103537752850,
        0.0038560700634,
    );
    let p1 = if prob < 0.5 { prob } else { 1.0 - prob };
    if p1 < 1e-20 {
        return -9999.0;
    }
    let y = (1.0 / (p1 * p1)).ln().sqrt();
    let z = y + ((((y * a4 + a3) * y + a2) * y + a1) * y + a0)
        / ((((y * b4 + b3) * y + b2) * y + b1) * y + b0);
    if prob < 0.5 {
        -z
    } else {
        z
    }
}

/// Quantile of the chi-square distribution with `v` degrees of freedom, algorithm AS 91.
pub fn point_chi2(prob: f64, v: f64) -> Result<f64> {
    const E: f64 = 0.5e-6;
    const AA: f64 = 0.6931471805;

    if !(0.000002..=0.999998).contains(&prob) || v <= 0.0 {
        bail!(OptimisationError::InvalidParameter(format!(
            "Chi-square quantile undefined for p = {}, v = {}",
            prob, v
        )));
    }

    let g = ln_gamma(v / 2.0);
    let xx = v / 2.0;
    let c = xx - 1.0;

    let mut ch;
    if v < -1.24 * prob.ln() {
        ch = (prob * xx * (g + xx * AA).exp()).powf(1.0 / xx);
        if ch - E < 0.0 {
            return Ok(ch);
        }
    } else if v <= 0.32 {
        ch = 0.4;
        let a = (1.0 - prob).ln();
        loop {
            let q = ch;
            let p1 = 1.0 + ch * (4.67 + ch);
            let p2 = ch * (6.73 + ch * (6.66 + ch));
            let t = -0.5 + (4.67 + 2.0 * ch) / p1 - (6.73 + ch * (13.32 + 3.0 * ch)) / p2;
            ch -= (1.0 - (a + g + 0.5 * ch + c * AA).exp() * p2 / p1) / t;
            if (q / ch - 1.0).abs() - 0.01 <= 0.0 {
                break;
            }
        }
    } else {
        let x = point_normal(prob);
        let p1 = 0.222222 / v;
        ch = v * (x * p1.sqrt() + 1.0 - p1).powi(3);
        if ch > 2.2 * v + 6.0 {
            ch = -2.0 * ((1.0 - prob).ln() - c * (0.5 * ch).ln() + g);
        }
    }

    loop {
        let q = ch;
        let p1 = 0.5 * ch;
        let t = incomplete_gamma(p1, xx, g)?;
        let p2 = prob - t;
        let t = p2 * (xx * AA + g + p1 - c * ch.ln()).exp();
        let b = t / ch;
        let a = 0.5 * t - b * c;

        let s1 = (210.0 + a * (140.0 + a * (105.0 + a * (84.0 + a * (70.0 + 60.0 * a))))) / 420.0;
        let s2 = (420.0 + a * (735.0 + a * (966.0 + a * (1141.0 + 1278.0 * a)))) / 2520.0;
        let s3 = (210.0 + a * (462.0 + a * (707.0 + 932.0 * a))) / 2520.0;
        let s4 = (252.0 + a * (672.0 + 1182.0 * a) + c * (294.0 + a * (889.0 + 1740.0 * a)))
            / 5040.0;
        let s5 = (84.0 + 264.0 * a + c * (175.0 + 606.0 * a)) / 2520.0;
        let s6 = (120.0 + c * (346.0 + 127.0 * c)) / 5040.0;
        ch += t
            * (1.0 + 0.5 * t * s1
                - b * c * (s1 - b * (s2 - b * (s3 - b * (s4 - b * (s5 - b * s6))))));
        if (q / ch - 1.0).abs() <= E {
            return Ok(ch);
        }
    }
}

