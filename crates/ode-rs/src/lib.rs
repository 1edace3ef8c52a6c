//! # Axon ODE
//!
//! Adaptive embedded Runge-Kutta integration for small fixed-size systems,
//! reporting the solution on a caller-supplied output grid.
//!
//! ## Capabilities
//!
//! 1. **Embedded pairs**: Dormand-Prince 5(4) and Bogacki-Shampine 3(2),
//!    both First-Same-As-Last
//! 2. **Error control**: mixed absolute/relative RMS norm, step accepted
//!    only when the local error estimate is within tolerance
//! 3. **Dense output**: each output time is interpolated from the step
//!    that brackets it, internal steps never snap to the grid
//! 4. **Failure reporting**: a step size driven below the floor stops the
//!    run with the last accepted time and state
//!
//! Everything in the stepping loop is stack allocated (`SVector<f64, N>`);
//! the only heap traffic is the output buffer.
//!
//! ## References
//!
//! - Dormand, J. R., & Prince, P. J. (1980). "A family of embedded
//!   Runge-Kutta formulae". J. Comput. Appl. Math., 6(1), 19-26.
//! - Bogacki, P., & Shampine, L. F. (1989). "A 3(2) pair of Runge-Kutta
//!   formulas". Appl. Math. Lett., 2(4), 321-325.
//! - Hairer, Norsett & Wanner, "Solving Ordinary Differential Equations I",
//!   section II.4 (starting step size) and II.6 (dense output).

use axon_core::{
    ensure_finite, ensure_positive, AxonError, OdeSystem, Result, StateVector, Time,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

// ============================================================================
// METHODS
// ============================================================================

/// Embedded Runge-Kutta pair used for stepping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    /// Dormand-Prince 5(4), 7 stages (6 effective with FSAL)
    #[default]
    DormandPrince54,
    /// Bogacki-Shampine 3(2), 4 stages (3 effective with FSAL)
    BogackiShampine32,
}

impl Method {
    /// Order of the propagated solution
    pub fn order(&self) -> usize {
        match self {
            Method::DormandPrince54 => 5,
            Method::BogackiShampine32 => 3,
        }
    }

    /// Number of stages per step, counting the FSAL stage
    pub fn stages(&self) -> usize {
        self.tableau().stages
    }

    fn tableau(&self) -> &'static Tableau {
        match self {
            Method::DormandPrince54 => &DOPRI5,
            Method::BogackiShampine32 => &BS32,
        }
    }
}

const MAX_STAGES: usize = 7;

/// How a step is interpolated between its endpoints
enum DenseOutput {
    /// Cubic Hermite through both endpoints and their slopes
    Hermite,
    /// Quartic continuous extension: weight_j(theta) = sum_p P[j][p] * theta^(p+1)
    Polynomial(&'static [[f64; 4]; MAX_STAGES]),
}

/// Butcher tableau of an explicit FSAL pair. The last stage is evaluated at
/// `(t + h, y_new)` and its slope becomes the first slope of the next step.
struct Tableau {
    stages: usize,
    c: [f64; MAX_STAGES],
    a: [[f64; MAX_STAGES]; MAX_STAGES],
    /// Propagating weights
    b: [f64; MAX_STAGES],
    /// Error weights: propagating minus embedded
    e: [f64; MAX_STAGES],
    /// Order of the embedded (lower order) solution
    error_order: usize,
    dense: DenseOutput,
}

#[rustfmt::skip]
static DOPRI5: Tableau = Tableau {
    stages: 7,
    c: [0.0, 1.0 / 5.0, 3.0 / 10.0, 4.0 / 5.0, 8.0 / 9.0, 1.0, 1.0],
    a: [
        [0.0; 7],
        [1.0 / 5.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        [3.0 / 40.0, 9.0 / 40.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        [44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0, 0.0, 0.0, 0.0, 0.0],
        [19372.0 / 6561.0, -25360.0 / 2187.0, 64448.0 / 6561.0, -212.0 / 729.0, 0.0, 0.0, 0.0],
        [9017.0 / 3168.0, -355.0 / 33.0, 46732.0 / 5247.0, 49.0 / 176.0, -5103.0 / 18656.0, 0.0, 0.0],
        [35.0 / 384.0, 0.0, 500.0 / 1113.0, 125.0 / 192.0, -2187.0 / 6784.0, 11.0 / 84.0, 0.0],
    ],
    b: [35.0 / 384.0, 0.0, 500.0 / 1113.0, 125.0 / 192.0, -2187.0 / 6784.0, 11.0 / 84.0, 0.0],
    e: [
        71.0 / 57600.0,
        0.0,
        -71.0 / 16695.0,
        71.0 / 1920.0,
        -17253.0 / 339200.0,
        22.0 / 525.0,
        -1.0 / 40.0,
    ],
    error_order: 4,
    dense: DenseOutput::Polynomial(&DOPRI5_DENSE),
};

#[rustfmt::skip]
const DOPRI5_DENSE: [[f64; 4]; MAX_STAGES] = [
    [1.0, -8048581381.0 / 2820520608.0, 8663915743.0 / 2820520608.0, -12715105075.0 / 11282082432.0],
    [0.0, 0.0, 0.0, 0.0],
    [0.0, 131558114200.0 / 32700410799.0, -68118460800.0 / 10900136933.0, 87487479700.0 / 32700410799.0],
    [0.0, -1754552775.0 / 470086768.0, 14199869525.0 / 1410260304.0, -10690763975.0 / 1880347072.0],
    [0.0, 127303824393.0 / 49829197408.0, -318862633887.0 / 49829197408.0, 701980252875.0 / 199316789632.0],
    [0.0, -282668133.0 / 205662961.0, 2019193451.0 / 616988883.0, -1453857185.0 / 822651844.0],
    [0.0, 40617522.0 / 29380423.0, -110615467.0 / 29380423.0, 69997945.0 / 29380423.0],
];

#[rustfmt::skip]
static BS32: Tableau = Tableau {
    stages: 4,
    c: [0.0, 1.0 / 2.0, 3.0 / 4.0, 1.0, 0.0, 0.0, 0.0],
    a: [
        [0.0; 7],
        [1.0 / 2.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        [0.0, 3.0 / 4.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        [2.0 / 9.0, 1.0 / 3.0, 4.0 / 9.0, 0.0, 0.0, 0.0, 0.0],
        [0.0; 7],
        [0.0; 7],
        [0.0; 7],
    ],
    b: [2.0 / 9.0, 1.0 / 3.0, 4.0 / 9.0, 0.0, 0.0, 0.0, 0.0],
    e: [-5.0 / 72.0, 1.0 / 12.0, 1.0 / 9.0, -1.0 / 8.0, 0.0, 0.0, 0.0],
    error_order: 2,
    dense: DenseOutput::Hermite,
};

// ============================================================================
// OPTIONS
// ============================================================================

/// Safety factor applied to the optimal step estimate
const SAFETY: f64 = 0.9;

/// Smallest factor a single rejection may shrink the step by
const MIN_SHRINK: f64 = 0.2;

/// Step-control configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegratorOptions {
    /// Embedded pair
    pub method: Method,
    /// Relative error tolerance
    pub rtol: f64,
    /// Absolute error tolerance
    pub atol: f64,
    /// First trial step; estimated from the initial slope when absent
    pub first_step: Option<f64>,
    /// Step floor: a rejection below this size is a convergence failure
    pub min_step: f64,
    /// Step ceiling; unbounded when absent
    pub max_step: Option<f64>,
    /// Largest factor the step may grow by after an accepted step
    pub max_growth: f64,
    /// Budget of step attempts (accepted plus rejected)
    pub max_steps: usize,
}

impl Default for IntegratorOptions {
    fn default() -> Self {
        Self {
            method: Method::DormandPrince54,
            rtol: 1e-8,
            atol: 1e-8,
            first_step: None,
            min_step: 1e-12,
            max_step: None,
            max_growth: 5.0,
            max_steps: 100_000,
        }
    }
}

impl IntegratorOptions {
    /// Reject tolerances and step bounds that cannot drive a run
    pub fn validate(&self) -> Result<()> {
        ensure_positive("rtol", self.rtol)?;
        ensure_positive("atol", self.atol)?;
        ensure_positive("min_step", self.min_step)?;
        if let Some(h) = self.first_step {
            ensure_positive("first_step", h)?;
        }
        if let Some(h) = self.max_step {
            ensure_positive("max_step", h)?;
            if h < self.min_step {
                return Err(AxonError::InvalidConfiguration(format!(
                    "max_step ({h}) is below min_step ({})",
                    self.min_step
                )));
            }
        }
        if !self.max_growth.is_finite() || self.max_growth <= 1.0 {
            return Err(AxonError::InvalidConfiguration(format!(
                "max_growth must be finite and > 1, got {}",
                self.max_growth
            )));
        }
        if self.max_steps == 0 {
            return Err(AxonError::InvalidConfiguration(
                "max_steps must be > 0".into(),
            ));
        }
        Ok(())
    }

    fn step_ceiling(&self) -> f64 {
        self.max_step.unwrap_or(f64::INFINITY)
    }
}

// ============================================================================
// OUTPUT
// ============================================================================

/// Counters describing one run of the integrator
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct IntegrationStats {
    /// Accepted steps
    pub accepted: usize,
    /// Rejected step attempts
    pub rejected: usize,
    /// Right-hand side evaluations
    pub evaluations: usize,
    /// Smallest accepted step (ms)
    pub min_step: f64,
    /// Largest accepted step (ms)
    pub max_step: f64,
}

impl IntegrationStats {
    fn record_accepted(&mut self, h: f64) {
        if self.accepted == 0 {
            self.min_step = h;
            self.max_step = h;
        } else {
            self.min_step = self.min_step.min(h);
            self.max_step = self.max_step.max(h);
        }
        self.accepted += 1;
    }
}

/// States sampled on the output grid
#[derive(Debug, Clone)]
pub struct Solution<const N: usize> {
    /// Output times, strictly increasing
    pub times: Vec<Time>,
    /// State at each output time
    pub states: Vec<StateVector<N>>,
    /// Step statistics
    pub stats: IntegrationStats,
}

impl<const N: usize> Solution<N> {
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }
}

/// Number of samples in `[0, t_end)` at spacing `dt`.
///
/// A ratio within rounding noise of an integer counts as that integer, so
/// `50.0 / 0.01` gives 5000 rather than 5001.
pub fn sample_count(t_end: Time, dt: Time) -> Result<usize> {
    ensure_positive("t_end", t_end)?;
    ensure_positive("dt", dt)?;
    let ratio = t_end / dt;
    let nearest = ratio.round();
    let count = if (ratio - nearest).abs() <= 1e-9 * nearest.max(1.0) {
        nearest
    } else {
        ratio.ceil()
    };
    if count > u32::MAX as f64 {
        return Err(AxonError::InvalidConfiguration(format!(
            "t_end / dt = {ratio} samples is too many"
        )));
    }
    Ok((count as usize).max(1))
}

/// Uniform output times `k * dt` for `k` in `0..sample_count(t_end, dt)`
pub fn uniform_grid(t_end: Time, dt: Time) -> Result<Vec<Time>> {
    let n = sample_count(t_end, dt)?;
    Ok((0..n).map(|k| k as f64 * dt).collect())
}

// ============================================================================
// INTEGRATOR
// ============================================================================

/// Adaptive-step integrator with dense output
#[derive(Debug, Clone)]
pub struct Integrator {
    options: IntegratorOptions,
}

impl Integrator {
    /// Create an integrator, validating the options
    pub fn new(options: IntegratorOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self { options })
    }

    pub fn options(&self) -> &IntegratorOptions {
        &self.options
    }

    /// Integrate `system` from `times[0]` (where the state is `y0`) and
    /// return the state at every entry of `times`.
    ///
    /// The first returned state is `y0` itself; the rest are interpolated
    /// from the accepted step that brackets each output time.
    pub fn integrate<S, const N: usize>(
        &self,
        system: &S,
        y0: StateVector<N>,
        times: &[Time],
    ) -> Result<Solution<N>>
    where
        S: OdeSystem<N> + ?Sized,
    {
        self.integrate_with_breakpoints(system, y0, times, &[])
    }

    /// Like [`Integrator::integrate`], for a right-hand side that jumps at
    /// the given `breakpoints`.
    ///
    /// Steps end exactly on each breakpoint inside the output range and the
    /// next step restarts from the slope just after it, so no step straddles
    /// a discontinuity however short the interval between two of them.
    /// Breakpoints may be unsorted; those outside `(times[0], t_final)` are
    /// ignored.
    pub fn integrate_with_breakpoints<S, const N: usize>(
        &self,
        system: &S,
        y0: StateVector<N>,
        times: &[Time],
        breakpoints: &[Time],
    ) -> Result<Solution<N>>
    where
        S: OdeSystem<N> + ?Sized,
    {
        validate_times(times)?;
        for &b in breakpoints {
            ensure_finite("breakpoint", b)?;
        }
        if let Some(bad) = y0.iter().find(|v| !v.is_finite()) {
            return Err(AxonError::InvalidConfiguration(format!(
                "initial state must be finite, got {bad}"
            )));
        }

        let opts = &self.options;
        let tab = opts.method.tableau();
        let last = tab.stages - 1;
        let exponent = -1.0 / (tab.error_order as f64 + 1.0);
        let ceiling = opts.step_ceiling();

        let t_final = times[times.len() - 1];
        let mut stops: Vec<Time> = breakpoints
            .iter()
            .copied()
            .filter(|&b| b > times[0] && b < t_final)
            .collect();
        stops.sort_by(f64::total_cmp);
        stops.dedup();
        stops.push(t_final);
        let mut stop = 0;

        let mut stats = IntegrationStats::default();
        let mut out_times = Vec::with_capacity(times.len());
        let mut out_states = Vec::with_capacity(times.len());
        out_times.push(times[0]);
        out_states.push(y0);
        let mut next = 1;

        let mut t = times[0];
        let mut y = y0;
        let mut k = [StateVector::<N>::zeros(); MAX_STAGES];
        k[0] = system.derivatives(t, &y);
        stats.evaluations += 1;

        let mut h = match opts.first_step {
            Some(h) => h,
            None => self.initial_step(system, t, &y, &k[0], &mut stats),
        }
        .min(ceiling);
        let mut previous_rejected = false;

        while next < times.len() {
            if stats.accepted + stats.rejected >= opts.max_steps {
                warn!(time = t, steps = opts.max_steps, "step budget exhausted");
                return Err(AxonError::StepBudgetExhausted {
                    time: t,
                    steps: opts.max_steps,
                });
            }

            let target = stops[stop];
            let remaining = target - t;
            let lands_on_stop = h >= remaining || remaining - h < opts.min_step;
            if lands_on_stop {
                h = remaining;
            }

            for s in 1..last {
                let mut incr = StateVector::<N>::zeros();
                for j in 0..s {
                    if tab.a[s][j] != 0.0 {
                        incr += k[j] * tab.a[s][j];
                    }
                }
                k[s] = system.derivatives(t + tab.c[s] * h, &(y + incr * h));
            }
            let mut incr = StateVector::<N>::zeros();
            for j in 0..last {
                if tab.b[j] != 0.0 {
                    incr += k[j] * tab.b[j];
                }
            }
            let y_new = y + incr * h;
            let t_new = if lands_on_stop { target } else { t + h };
            k[last] = system.derivatives(t_new, &y_new);
            stats.evaluations += last;

            let err = self.error_norm(tab, &k, h, &y, &y_new);

            if err <= 1.0 {
                stats.record_accepted(h);
                while next < times.len() && times[next] <= t_new {
                    let theta = (times[next] - t) / h;
                    let state = if times[next] == t_new || theta >= 1.0 {
                        y_new
                    } else {
                        interpolate(tab, &k, h, &y, &y_new, theta)
                    };
                    out_times.push(times[next]);
                    out_states.push(state);
                    next += 1;
                }

                let mut factor = if err == 0.0 {
                    opts.max_growth
                } else {
                    (SAFETY * err.powf(exponent)).clamp(MIN_SHRINK, opts.max_growth)
                };
                if previous_rejected {
                    factor = factor.min(1.0);
                }
                previous_rejected = false;

                t = t_new;
                y = y_new;
                h = (h * factor).min(ceiling);
                if lands_on_stop && stop + 1 < stops.len() {
                    // Right-hand limit of the slope at the breakpoint
                    stop += 1;
                    k[0] = system.derivatives(just_after(t), &y);
                    stats.evaluations += 1;
                } else {
                    k[0] = k[last];
                }
            } else {
                stats.rejected += 1;
                previous_rejected = true;
                let factor = (SAFETY * err.powf(exponent)).clamp(MIN_SHRINK, 1.0);
                trace!(t, h, err, "step rejected");
                h *= factor;
                if h < opts.min_step || t + h == t {
                    warn!(time = t, step = h, "step size fell below floor");
                    return Err(AxonError::NonConvergence {
                        time: t,
                        step: h,
                        state: y.iter().copied().collect(),
                    });
                }
            }
        }

        debug!(
            method = ?opts.method,
            accepted = stats.accepted,
            rejected = stats.rejected,
            evaluations = stats.evaluations,
            samples = out_times.len(),
            "integration complete"
        );

        Ok(Solution {
            times: out_times,
            states: out_states,
            stats,
        })
    }

    /// Mixed-tolerance RMS norm of the embedded error estimate. A
    /// non-finite trial state counts as an infinite error.
    fn error_norm<const N: usize>(
        &self,
        tab: &Tableau,
        k: &[StateVector<N>; MAX_STAGES],
        h: f64,
        y: &StateVector<N>,
        y_new: &StateVector<N>,
    ) -> f64 {
        let mut sum = 0.0;
        for i in 0..N {
            let mut e = 0.0;
            for j in 0..tab.stages {
                e += tab.e[j] * k[j][i];
            }
            let scale = self.options.atol + self.options.rtol * y[i].abs().max(y_new[i].abs());
            let r = h * e / scale;
            sum += r * r;
        }
        let norm = (sum / N.max(1) as f64).sqrt();
        if norm.is_finite() {
            norm
        } else {
            f64::INFINITY
        }
    }

    /// Starting step from the size of the state, its slope, and a probe of
    /// the second derivative.
    fn initial_step<S, const N: usize>(
        &self,
        system: &S,
        t0: Time,
        y0: &StateVector<N>,
        f0: &StateVector<N>,
        stats: &mut IntegrationStats,
    ) -> f64
    where
        S: OdeSystem<N> + ?Sized,
    {
        let opts = &self.options;
        let scale = y0.map(|v| opts.atol + opts.rtol * v.abs());
        let rms = |v: &StateVector<N>| {
            (v.component_div(&scale).norm_squared() / N.max(1) as f64).sqrt()
        };

        let d0 = rms(y0);
        let d1 = rms(f0);
        let h0 = if d0 < 1e-5 || d1 < 1e-5 || !d1.is_finite() {
            1e-6
        } else {
            0.01 * d0 / d1
        }
        .min(opts.step_ceiling());

        let y1 = y0 + f0 * h0;
        let f1 = system.derivatives(t0 + h0, &y1);
        stats.evaluations += 1;
        let d2 = rms(&(f1 - f0)) / h0;

        let order = opts.method.order() as f64;
        let dmax = d1.max(d2);
        let h1 = if !dmax.is_finite() {
            h0
        } else if dmax <= 1e-15 {
            (h0 * 1e-3).max(1e-6)
        } else {
            (0.01 / dmax).powf(1.0 / order)
        };

        (100.0 * h0).min(h1).max(opts.min_step)
    }
}

/// A time strictly after `t`, at most a couple of ulps away
fn just_after(t: Time) -> Time {
    t + t.abs().max(1.0) * f64::EPSILON
}

fn validate_times(times: &[Time]) -> Result<()> {
    if times.is_empty() {
        return Err(AxonError::InvalidConfiguration(
            "output grid must contain at least one time".into(),
        ));
    }
    for (i, &t) in times.iter().enumerate() {
        ensure_finite("output time", t)?;
        if i > 0 && t <= times[i - 1] {
            return Err(AxonError::InvalidConfiguration(format!(
                "output times must be strictly increasing ({} then {t})",
                times[i - 1]
            )));
        }
    }
    Ok(())
}

/// State at `t + theta * h` inside an accepted step
fn interpolate<const N: usize>(
    tab: &Tableau,
    k: &[StateVector<N>; MAX_STAGES],
    h: f64,
    y: &StateVector<N>,
    y_new: &StateVector<N>,
    theta: f64,
) -> StateVector<N> {
    match tab.dense {
        DenseOutput::Hermite => {
            let t2 = theta * theta;
            let t3 = t2 * theta;
            let h00 = 2.0 * t3 - 3.0 * t2 + 1.0;
            let h10 = t3 - 2.0 * t2 + theta;
            let h01 = -2.0 * t3 + 3.0 * t2;
            let h11 = t3 - t2;
            y * h00 + k[0] * (h10 * h) + y_new * h01 + k[tab.stages - 1] * (h11 * h)
        }
        DenseOutput::Polynomial(p) => {
            let mut incr = StateVector::<N>::zeros();
            for (j, row) in p.iter().enumerate().take(tab.stages) {
                let w = theta * (row[0] + theta * (row[1] + theta * (row[2] + theta * row[3])));
                if w != 0.0 {
                    incr += k[j] * w;
                }
            }
            y + incr * h
        }
    }
}

/// Integrate on the uniform grid `k * dt` covering `[0, t_end)`
pub fn integrate_uniform<S, const N: usize>(
    system: &S,
    y0: StateVector<N>,
    t_end: Time,
    dt: Time,
    options: IntegratorOptions,
) -> Result<Solution<N>>
where
    S: OdeSystem<N> + ?Sized,
{
    let grid = uniform_grid(t_end, dt)?;
    Integrator::new(options)?.integrate(system, y0, &grid)
}
