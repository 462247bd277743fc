use std::collections::VecDeque;

use anyhow::bail;
use argmin::core::CostFunction;
use log::debug;

use crate::optimisers::OptimisationError;
use crate::parameters::{Bound, ERR};
use crate::Result;

/// Number of correction pairs kept for the inverse Hessian approximation.
const MAX_CORRECTIONS: usize = 5;
const MAX_ITERATIONS: usize = 500;
const MAX_LINE_SEARCH_STEPS: usize = 20;
const ARMIJO: f64 = 1e-4;
const EPSMCH: f64 = f64::EPSILON;

/// Request from the solver to its driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    /// Evaluate the objective and its gradient at the current point.
    Fg,
    /// An iteration finished, the current point is the new iterate.
    NewX,
    Converged,
    Abnormal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Start,
    Initial,
    LineSearch,
    Iterate,
    Done,
}

#[derive(Debug, Clone)]
struct Correction {
    s: Vec<f64>,
    y: Vec<f64>,
    rho: f64,
}

/// Limited-memory quasi-Newton minimiser under box constraints, driven by reverse
/// communication: every call to [`LbfgsbSolver::step`] hands in the objective and gradient at
/// the point the previous call asked for and returns what the solver needs next.
///
/// Search directions come from the two-loop recursion restricted to the variables that are
/// not held at a bound, steps are found by backtracking along the projected path.
#[derive(Debug, Clone)]
pub struct LbfgsbSolver {
    lower: Vec<f64>,
    upper: Vec<f64>,
    factr: f64,
    pgtol: f64,
    stage: Stage,
    history: VecDeque<Correction>,
    x_k: Vec<f64>,
    f_k: f64,
    g_k: Vec<f64>,
    direction: Vec<f64>,
    step: f64,
    line_steps: usize,
    iterations: usize,
}

impl LbfgsbSolver {
    pub fn new(bounds: &[Bound], factr: f64, pgtol: f64) -> Result<Self> {
        if let Some(bound) = bounds.iter().find(|b| {
            let (lower, upper) = (b.lower_limit(), b.upper_limit());
            lower.is_nan() || upper.is_nan() || lower > upper
        }) {
            bail!(OptimisationError::InvalidParameter(format!(
                "Bound {:?} is an empty interval",
                bound
            )));
        }
        let n = bounds.len();
        Ok(Self {
            lower: bounds.iter().map(|b| b.lower_limit()).collect(),
            upper: bounds.iter().map(|b| b.upper_limit()).collect(),
            factr,
            pgtol,
            stage: Stage::Start,
            history: VecDeque::with_capacity(MAX_CORRECTIONS),
            x_k: buffer(n)?,
            f_k: f64::INFINITY,
            g_k: buffer(n)?,
            direction: buffer(n)?,
            step: 1.0,
            line_steps: 0,
            iterations: 0,
        })
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Advances the solver. `f` and `g` must hold the objective and gradient at `x` whenever
    /// the previous call returned [`Task::Fg`]; they are ignored otherwise.
    pub fn step(&mut self, x: &mut [f64], f: f64, g: &[f64]) -> Task {
        match self.stage {
            Stage::Start => {
                self.project(x);
                self.stage = Stage::Initial;
                Task::Fg
            }
            Stage::Initial => {
                if !f.is_finite() {
                    debug!("L-BFGS-B: objective is not finite at the starting point.");
                    return self.finish(Task::Abnormal);
                }
                self.accept(x, f, g);
                if self.projected_gradient_norm() <= self.pgtol {
                    return self.finish(Task::Converged);
                }
                self.start_line_search(x)
            }
            Stage::Iterate => self.start_line_search(x),
            Stage::LineSearch => self.line_search(x, f, g),
            Stage::Done => Task::Converged,
        }
    }

    fn finish(&mut self, task: Task) -> Task {
        self.stage = Stage::Done;
        task
    }

    fn project(&self, x: &mut [f64]) {
        for ((xi, lo), hi) in x.iter_mut().zip(&self.lower).zip(&self.upper) {
            *xi = xi.max(*lo).min(*hi);
        }
    }

    fn accept(&mut self, x: &[f64], f: f64, g: &[f64]) {
        self.x_k.copy_from_slice(x);
        self.f_k = f;
        for (gk, &gi) in self.g_k.iter_mut().zip(g) {
            *gk = if gi.is_finite() { gi } else { 0.0 };
        }
    }

    /// Sup-norm of `P(x - g) - x`.
    fn projected_gradient_norm(&self) -> f64 {
        (0..self.x_k.len())
            .map(|i| {
                let target = (self.x_k[i] - self.g_k[i]).max(self.lower[i]).min(self.upper[i]);
                (target - self.x_k[i]).abs()
            })
            .fold(0.0, f64::max)
    }

    /// Variables held at a bound by a gradient pointing outwards.
    fn is_fixed(&self, i: usize) -> bool {
        (self.x_k[i] <= self.lower[i] && self.g_k[i] > 0.0)
            || (self.x_k[i] >= self.upper[i] && self.g_k[i] < 0.0)
    }

    fn compute_direction(&mut self) {
        let n = self.x_k.len();
        let free: Vec<bool> = (0..n).map(|i| !self.is_fixed(i)).collect();
        let mut q: Vec<f64> = (0..n)
            .map(|i| if free[i] { self.g_k[i] } else { 0.0 })
            .collect();

        let mut alphas = Vec::with_capacity(self.history.len());
        for c in self.history.iter().rev() {
            let alpha = c.rho * dot(&c.s, &q);
            axpy(-alpha, &c.y, &mut q);
            alphas.push(alpha);
        }
        if let Some(last) = self.history.back() {
            let yy = dot(&last.y, &last.y);
            if yy > 0.0 {
                let gamma = 1.0 / (last.rho * yy);
                q.iter_mut().for_each(|qi| *qi *= gamma);
            }
        }
        for (c, alpha) in self.history.iter().zip(alphas.iter().rev()) {
            let beta = c.rho * dot(&c.y, &q);
            axpy(alpha - beta, &c.s, &mut q);
        }

        for i in 0..n {
            self.direction[i] = if free[i] { -q[i] } else { 0.0 };
        }
        if dot(&self.direction, &self.g_k) >= 0.0 {
            debug!("L-BFGS-B: no descent direction, resetting the history.");
            self.history.clear();
            for i in 0..n {
                self.direction[i] = if free[i] { -self.g_k[i] } else { 0.0 };
            }
        }
    }

    fn start_line_search(&mut self, x: &mut [f64]) -> Task {
        if self.iterations >= MAX_ITERATIONS {
            debug!("L-BFGS-B: reached {} iterations.", MAX_ITERATIONS);
            x.copy_from_slice(&self.x_k);
            return self.finish(Task::Converged);
        }
        self.compute_direction();
        let norm = dot(&self.direction, &self.direction).sqrt();
        if norm == 0.0 {
            x.copy_from_slice(&self.x_k);
            return self.finish(Task::Converged);
        }
        self.step = if self.history.is_empty() {
            (1.0 / norm).min(1.0)
        } else {
            1.0
        };
        self.line_steps = 0;
        self.stage = Stage::LineSearch;
        self.trial_point(x);
        Task::Fg
    }

    fn trial_point(&self, x: &mut [f64]) {
        for (i, xi) in x.iter_mut().enumerate() {
            *xi = self.x_k[i] + self.step * self.direction[i];
        }
        self.project(x);
    }

    fn line_search(&mut self, x: &mut [f64], f: f64, g: &[f64]) -> Task {
        let decrease: f64 = (0..x.len())
            .map(|i| self.g_k[i] * (x[i] - self.x_k[i]))
            .sum::<f64>()
            .min(0.0);
        if f.is_finite() && f <= self.f_k + ARMIJO * decrease {
            return self.new_iterate(x, f, g);
        }

        self.line_steps += 1;
        if self.line_steps < MAX_LINE_SEARCH_STEPS {
            self.step *= 0.5;
            self.trial_point(x);
            return Task::Fg;
        }

        x.copy_from_slice(&self.x_k);
        if self.history.is_empty() {
            debug!("L-BFGS-B: line search failed along the steepest descent.");
            return self.finish(Task::Abnormal);
        }
        debug!("L-BFGS-B: line search failed, restarting from the steepest descent.");
        self.history.clear();
        self.start_line_search(x)
    }

    fn new_iterate(&mut self, x: &[f64], f: f64, g: &[f64]) -> Task {
        let f_old = self.f_k;
        let s: Vec<f64> = x.iter().zip(&self.x_k).map(|(a, b)| a - b).collect();
        let y: Vec<f64> = g
            .iter()
            .zip(&self.g_k)
            .map(|(a, b)| if a.is_finite() { a - b } else { 0.0 })
            .collect();
        let sy = dot(&s, &y);
        if sy > EPSMCH * dot(&y, &y) {
            if self.history.len() == MAX_CORRECTIONS {
                self.history.pop_front();
            }
            self.history.push_back(Correction { s, y, rho: 1.0 / sy });
        }

        self.accept(x, f, g);
        self.iterations += 1;
        debug!(
            "L-BFGS-B iteration {}: f = {}, step = {}",
            self.iterations, f, self.step
        );

        let reduction = (f_old - f) / f_old.abs().max(f.abs()).max(1.0);
        if reduction <= self.factr * EPSMCH || self.projected_gradient_norm() <= self.pgtol {
            return self.finish(Task::Converged);
        }
        self.stage = Stage::Iterate;
        Task::NewX
    }
}

/// Minimises `objective` over the box `bounds` starting from `x`, with forward-difference
/// gradients. `x` holds the minimiser on return, the returned value is the objective there.
///
/// Stops early once the objective turns NaN or negative infinity. A NaN at the final point
/// fails with [`OptimisationError::LbfgsbUnknown`].
pub fn minimize_lbfgsb<C>(
    x: &mut [f64],
    bounds: &[Bound],
    factr: f64,
    pgtol: f64,
    objective: &C,
) -> Result<f64>
where
    C: CostFunction<Param = Vec<f64>, Output = f64>,
{
    if bounds.len() != x.len() {
        bail!(OptimisationError::InvalidParameter(format!(
            "Got {} bounds for {} variables",
            bounds.len(),
            x.len()
        )));
    }
    let n = x.len();
    let mut point = buffer(n)?;
    point.copy_from_slice(x);
    if n == 0 {
        return objective.cost(&point);
    }

    let mut solver = LbfgsbSolver::new(bounds, factr, pgtol)?;
    let mut gradient = buffer(n)?;
    let mut score = 0.0;
    loop {
        match solver.step(&mut point, score, &gradient) {
            Task::Fg => {
                score = objective.cost(&point)?;
                if score.is_nan() || score == f64::NEG_INFINITY {
                    break;
                }
                for i in 0..n {
                    let current = point[i];
                    let mut h = ERR * current.abs();
                    if h < 1e-12 {
                        h = ERR;
                    }
                    point[i] = current + h;
                    let h = point[i] - current;
                    gradient[i] = (objective.cost(&point)? - score) / h;
                    point[i] = current;
                }
            }
            Task::NewX => continue,
            Task::Converged | Task::Abnormal => break,
        }
    }
    debug!("L-BFGS-B finished after {} iteration(s).", solver.iterations());

    let score = objective.cost(&point)?;
    x.copy_from_slice(&point);
    if score.is_nan() {
        bail!(OptimisationError::LbfgsbUnknown);
    }
    Ok(score)
}

fn buffer(n: usize) -> Result<Vec<f64>> {
    let mut values = Vec::new();
    if values.try_reserve_exact(n).is_err() {
        bail!(OptimisationError::Allocation(format!(
            "Cannot allocate L-BFGS-B buffers for {} variables",
            n
        )));
    }
    values.resize(n, 0.0);
    Ok(values)
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn axpy(alpha: f64, x: &[f64], y: &mut [f64]) {
    for (yi, xi) in y.iter_mut().zip(x) {
        *yi += alpha * xi;
    }
}
