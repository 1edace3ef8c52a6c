//! # Axon-HH: Hodgkin-Huxley Membrane Simulation
//!
//! Single-compartment simulation of the squid giant axon membrane
//! (Hodgkin & Huxley, 1952) driven by an injected current protocol.
//!
//! The model couples membrane voltage `V` to three voltage-gated
//! probabilities:
//!
//! ```text
//! C_m dV/dt = I_inj(t) - g_Na m^3 h (V - E_Na) - g_K n^4 (V - E_K) - g_L (V - E_L)
//!     dx/dt = alpha_x(V) (1 - x) - beta_x(V) x        for x in {m, h, n}
//! ```
//!
//! This crate provides:
//! - Rate functions with their removable singularities resolved
//! - Stimulus protocols (step, pulse train, ramp)
//! - The coupled derivative as an [`OdeSystem`]
//! - A driver that integrates onto a uniform output grid
//! - Spike detection and parallel parameter sweeps

use axon_core::{
    ensure_finite, ensure_positive, AxonError, Capacitance, Conductance, Current, OdeSystem,
    Result, StateVector, Time, TimeSeries, Voltage,
};
use axon_ode::{sample_count, uniform_grid, IntegrationStats, Integrator, IntegratorOptions};
use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

pub use axon_ode::Method;

// ============================================================================
// RATE FUNCTIONS
// ============================================================================

/// Half-width (in units of `(V + b) / c`) of the window around a linoid's
/// removable singularity where the series expansion replaces the quotient.
const LINOID_SERIES_WINDOW: f64 = 1e-4;

/// Voltage-dependent transition rate (1/ms)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RateFunction {
    /// Linoid: `a*(V+b) / (1 - exp(-(V+b)/c))`, limit `a*c` at `V = -b`
    Linoid { a: f64, b: f64, c: f64 },
    /// Exponential: `a*exp(-(V+b)/c)`
    Exponential { a: f64, b: f64, c: f64 },
    /// Sigmoid: `a / (1 + exp(-(V+b)/c))`
    Sigmoid { a: f64, b: f64, c: f64 },
}

impl RateFunction {
    /// Evaluate rate at given voltage
    pub fn eval(&self, v: Voltage) -> f64 {
        match *self {
            Self::Linoid { a, b, c } => {
                let x = v + b;
                let u = x / c;
                if u.abs() < LINOID_SERIES_WINDOW {
                    // x / (1 - e^-u) = c * (1 + u/2 + u^2/12 - u^4/720 + ...)
                    a * c * (1.0 + u * (0.5 + u / 12.0))
                } else {
                    a * x / -(-u).exp_m1()
                }
            }
            Self::Exponential { a, b, c } => a * (-(v + b) / c).exp(),
            Self::Sigmoid { a, b, c } => a / (1.0 + (-(v + b) / c).exp()),
        }
    }
}

/// Na+ activation opening rate
pub const ALPHA_M: RateFunction = RateFunction::Linoid {
    a: 0.1,
    b: 40.0,
    c: 10.0,
};
/// Na+ activation closing rate
pub const BETA_M: RateFunction = RateFunction::Exponential {
    a: 4.0,
    b: 65.0,
    c: 18.0,
};
/// Na+ inactivation recovery rate
pub const ALPHA_H: RateFunction = RateFunction::Exponential {
    a: 0.07,
    b: 65.0,
    c: 20.0,
};
/// Na+ inactivation onset rate
pub const BETA_H: RateFunction = RateFunction::Sigmoid {
    a: 1.0,
    b: 35.0,
    c: 10.0,
};
/// K+ activation opening rate
pub const ALPHA_N: RateFunction = RateFunction::Linoid {
    a: 0.01,
    b: 55.0,
    c: 10.0,
};
/// K+ activation closing rate
pub const BETA_N: RateFunction = RateFunction::Exponential {
    a: 0.125,
    b: 65.0,
    c: 80.0,
};

/// `0.1*(V+40) / (1 - exp(-(V+40)/10))`, equal to 1.0 at V = -40
pub fn alpha_m(v: Voltage) -> f64 {
    ALPHA_M.eval(v)
}

/// `4*exp(-(V+65)/18)`
pub fn beta_m(v: Voltage) -> f64 {
    BETA_M.eval(v)
}

/// `0.07*exp(-(V+65)/20)`
pub fn alpha_h(v: Voltage) -> f64 {
    ALPHA_H.eval(v)
}

/// `1 / (1 + exp(-(V+35)/10))`
pub fn beta_h(v: Voltage) -> f64 {
    BETA_H.eval(v)
}

/// `0.01*(V+55) / (1 - exp(-(V+55)/10))`, equal to 0.1 at V = -55
pub fn alpha_n(v: Voltage) -> f64 {
    ALPHA_N.eval(v)
}

/// `0.125*exp(-(V+65)/80)`
pub fn beta_n(v: Voltage) -> f64 {
    BETA_N.eval(v)
}

/// Gate variable (m, h or n) with its opening and closing kinetics
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Gate {
    /// Power (exponent in the conductance)
    pub power: i32,
    /// Opening rate
    pub alpha: RateFunction,
    /// Closing rate
    pub beta: RateFunction,
}

impl Gate {
    /// dx/dt = alpha(V) (1 - x) - beta(V) x
    pub fn rate_of_change(&self, x: f64, v: Voltage) -> f64 {
        self.alpha.eval(v) * (1.0 - x) - self.beta.eval(v) * x
    }

    /// Value the gate relaxes to when V is held fixed
    pub fn steady_state(&self, v: Voltage) -> f64 {
        let a = self.alpha.eval(v);
        a / (a + self.beta.eval(v))
    }

    /// Relaxation time constant (ms) at fixed V
    pub fn time_constant(&self, v: Voltage) -> f64 {
        1.0 / (self.alpha.eval(v) + self.beta.eval(v))
    }
}

/// Na+ activation (m^3)
pub const M_GATE: Gate = Gate {
    power: 3,
    alpha: ALPHA_M,
    beta: BETA_M,
};
/// Na+ inactivation (h)
pub const H_GATE: Gate = Gate {
    power: 1,
    alpha: ALPHA_H,
    beta: BETA_H,
};
/// K+ activation (n^4)
pub const N_GATE: Gate = Gate {
    power: 4,
    alpha: ALPHA_N,
    beta: BETA_N,
};

// ============================================================================
// STIMULUS PROTOCOLS
// ============================================================================

/// 1 for `x > 0`, else 0
fn heaviside(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else {
        0.0
    }
}

fn default_amplitude() -> Current {
    10.0
}

fn default_onset() -> Time {
    10.0
}

fn default_offset() -> Time {
    40.0
}

/// Injected current as a function of time (uA/cm^2).
///
/// Every protocol is evaluable at arbitrary times, not only on the output
/// grid. Intervals are half-open: a pulse starting at `onset` and ending at
/// `offset` is on for `onset < t <= offset`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StimulusProtocol {
    /// No injected current
    None,
    /// Single rectangular step
    Step {
        #[serde(default = "default_amplitude")]
        amplitude: Current,
        #[serde(default = "default_onset")]
        onset: Time,
        #[serde(default = "default_offset")]
        offset: Time,
    },
    /// `count` rectangular pulses of `width`, one every `period` from `onset`
    PulseTrain {
        amplitude: Current,
        onset: Time,
        width: Time,
        period: Time,
        count: usize,
    },
    /// Linear ramp from `start` to `end` across `(onset, offset]`
    Ramp {
        onset: Time,
        offset: Time,
        start: Current,
        end: Current,
    },
}

impl Default for StimulusProtocol {
    fn default() -> Self {
        Self::Step {
            amplitude: default_amplitude(),
            onset: default_onset(),
            offset: default_offset(),
        }
    }
}

impl StimulusProtocol {
    /// Injected current at time `t`
    pub fn current(&self, t: Time) -> Current {
        match *self {
            Self::None => 0.0,
            Self::Step {
                amplitude,
                onset,
                offset,
            } => amplitude * heaviside(t - onset) - amplitude * heaviside(t - offset),
            Self::PulseTrain {
                amplitude,
                onset,
                width,
                period,
                count,
            } => {
                let rel = t - onset;
                if rel <= 0.0 || count == 0 {
                    return 0.0;
                }
                // Only the pulses around floor(rel / period) can contain t
                let k = (rel / period).floor();
                if k.is_nan() || k > count as f64 {
                    return 0.0;
                }
                let k = k as usize;
                for i in k.saturating_sub(1)..=k.saturating_add(1).min(count - 1) {
                    let start = onset + i as f64 * period;
                    let on = heaviside(t - start) - heaviside(t - (start + width));
                    if on != 0.0 {
                        return amplitude * on;
                    }
                }
                0.0
            }
            Self::Ramp {
                onset,
                offset,
                start,
                end,
            } => {
                let window = heaviside(t - onset) - heaviside(t - offset);
                if window == 0.0 {
                    return 0.0;
                }
                start + (end - start) * (t - onset) / (offset - onset)
            }
        }
    }

    /// Reject protocols whose intervals are reversed or non-finite
    pub fn validate(&self) -> Result<()> {
        match *self {
            Self::None => Ok(()),
            Self::Step {
                amplitude,
                onset,
                offset,
            } => {
                ensure_finite("stimulus amplitude", amplitude)?;
                ensure_finite("stimulus onset", onset)?;
                ensure_finite("stimulus offset", offset)?;
                if onset > offset {
                    return Err(AxonError::InvalidConfiguration(format!(
                        "stimulus onset ({onset}) is after offset ({offset})"
                    )));
                }
                Ok(())
            }
            Self::PulseTrain {
                amplitude,
                onset,
                width,
                period,
                count,
            } => {
                ensure_finite("pulse amplitude", amplitude)?;
                ensure_finite("pulse onset", onset)?;
                ensure_positive("pulse width", width)?;
                ensure_positive("pulse period", period)?;
                if width > period {
                    return Err(AxonError::InvalidConfiguration(format!(
                        "pulse width ({width}) exceeds period ({period})"
                    )));
                }
                if count == 0 {
                    return Err(AxonError::InvalidConfiguration(
                        "pulse train needs at least one pulse".into(),
                    ));
                }
                Ok(())
            }
            Self::Ramp {
                onset,
                offset,
                start,
                end,
            } => {
                ensure_finite("ramp onset", onset)?;
                ensure_finite("ramp offset", offset)?;
                ensure_finite("ramp start", start)?;
                ensure_finite("ramp end", end)?;
                if onset > offset {
                    return Err(AxonError::InvalidConfiguration(format!(
                        "ramp onset ({onset}) is after offset ({offset})"
                    )));
                }
                Ok(())
            }
        }
    }

    /// Times before `t_end` where the current switches on or off, in order.
    ///
    /// The integrator ends a step on each of these, so a pulse is resolved
    /// however short it is.
    pub fn breakpoints(&self, t_end: Time) -> Vec<Time> {
        let mut edges = match *self {
            Self::None => Vec::new(),
            Self::Step { onset, offset, .. } | Self::Ramp { onset, offset, .. } => {
                vec![onset, offset]
            }
            Self::PulseTrain {
                onset,
                width,
                period,
                count,
                ..
            } => {
                let mut edges = Vec::new();
                for i in 0..count {
                    let start = onset + i as f64 * period;
                    if start >= t_end {
                        break;
                    }
                    edges.push(start);
                    edges.push(start + width);
                }
                edges
            }
        };
        edges.retain(|&t| t < t_end);
        edges.sort_by(f64::total_cmp);
        edges.dedup();
        edges
    }

    /// Same timing with a different peak current.
    ///
    /// For a ramp the amplitude becomes the end value; no current becomes
    /// the default step at that amplitude.
    pub fn with_amplitude(&self, amplitude: Current) -> Self {
        match self.clone() {
            Self::None => Self::Step {
                amplitude,
                onset: default_onset(),
                offset: default_offset(),
            },
            Self::Step { onset, offset, .. } => Self::Step {
                amplitude,
                onset,
                offset,
            },
            Self::PulseTrain {
                onset,
                width,
                period,
                count,
                ..
            } => Self::PulseTrain {
                amplitude,
                onset,
                width,
                period,
                count,
            },
            Self::Ramp {
                onset,
                offset,
                start,
                ..
            } => Self::Ramp {
                onset,
                offset,
                start,
                end: amplitude,
            },
        }
    }
}

// ============================================================================
// MEMBRANE
// ============================================================================

/// Membrane capacitance, maximal conductances and reversal potentials
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MembraneConstants {
    /// Membrane capacitance (uF/cm^2)
    pub c_m: Capacitance,
    /// Maximal Na+ conductance (mS/cm^2)
    pub g_na: Conductance,
    /// Maximal K+ conductance (mS/cm^2)
    pub g_k: Conductance,
    /// Leak conductance (mS/cm^2)
    pub g_l: Conductance,
    /// Na+ reversal potential (mV)
    pub e_na: Voltage,
    /// K+ reversal potential (mV)
    pub e_k: Voltage,
    /// Leak reversal potential (mV)
    pub e_l: Voltage,
}

impl Default for MembraneConstants {
    fn default() -> Self {
        Self {
            c_m: 1.0,
            g_na: 120.0,
            g_k: 36.0,
            g_l: 0.3,
            e_na: 50.0,
            e_k: -77.0,
            e_l: -54.387,
        }
    }
}

impl MembraneConstants {
    pub fn validate(&self) -> Result<()> {
        ensure_positive("c_m", self.c_m)?;
        for (name, g) in [("g_na", self.g_na), ("g_k", self.g_k), ("g_l", self.g_l)] {
            ensure_finite(name, g)?;
            if g < 0.0 {
                return Err(AxonError::InvalidConfiguration(format!(
                    "{name} must be >= 0, got {g}"
                )));
            }
        }
        ensure_finite("e_na", self.e_na)?;
        ensure_finite("e_k", self.e_k)?;
        ensure_finite("e_l", self.e_l)?;
        Ok(())
    }

    /// Ionic currents flowing at `state`
    pub fn currents(&self, state: &MembraneState) -> IonicCurrents {
        let MembraneState { v, m, h, n } = *state;
        let m_act = m.powi(M_GATE.power);
        let h_act = h.powi(H_GATE.power);
        IonicCurrents {
            sodium: self.g_na * m_act * h_act * (v - self.e_na),
            potassium: self.g_k * n.powi(N_GATE.power) * (v - self.e_k),
            leak: self.g_l * (v - self.e_l),
        }
    }
}

/// Outward ionic current densities (uA/cm^2)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IonicCurrents {
    pub sodium: Current,
    pub potassium: Current,
    pub leak: Current,
}

impl IonicCurrents {
    pub fn total(&self) -> Current {
        self.sodium + self.potassium + self.leak
    }
}

/// Membrane voltage and gate probabilities
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MembraneState {
    /// Membrane potential (mV)
    pub v: Voltage,
    /// Na+ activation
    pub m: f64,
    /// Na+ inactivation
    pub h: f64,
    /// K+ activation
    pub n: f64,
}

impl Default for MembraneState {
    /// Rest at -65 mV with the gates at their equilibrium (to 4 places)
    fn default() -> Self {
        Self {
            v: -65.0,
            m: 0.0529,
            h: 0.5961,
            n: 0.3177,
        }
    }
}

impl MembraneState {
    /// Gates at their steady state for a membrane held at `v`
    pub fn resting(v: Voltage) -> Self {
        Self {
            v,
            m: M_GATE.steady_state(v),
            h: H_GATE.steady_state(v),
            n: N_GATE.steady_state(v),
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure_finite("initial v", self.v)?;
        ensure_finite("initial m", self.m)?;
        ensure_finite("initial h", self.h)?;
        ensure_finite("initial n", self.n)?;
        Ok(())
    }

    /// Largest distance of any gate outside [0, 1]
    pub fn gate_excursion(&self) -> f64 {
        [self.m, self.h, self.n]
            .into_iter()
            .map(|x| (-x).max(x - 1.0).max(0.0))
            .fold(0.0, f64::max)
    }
}

impl From<StateVector<4>> for MembraneState {
    fn from(y: StateVector<4>) -> Self {
        Self {
            v: y[0],
            m: y[1],
            h: y[2],
            n: y[3],
        }
    }
}

impl From<MembraneState> for StateVector<4> {
    fn from(s: MembraneState) -> Self {
        StateVector::<4>::new(s.v, s.m, s.h, s.n)
    }
}

// ============================================================================
// MODEL
// ============================================================================

/// Hodgkin-Huxley right-hand side: constants plus stimulus
#[derive(Debug, Clone, PartialEq)]
pub struct HodgkinHuxley {
    pub constants: MembraneConstants,
    pub stimulus: StimulusProtocol,
}

impl HodgkinHuxley {
    pub fn new(constants: MembraneConstants, stimulus: StimulusProtocol) -> Self {
        Self {
            constants,
            stimulus,
        }
    }
}

impl OdeSystem<4> for HodgkinHuxley {
    fn derivatives(&self, t: Time, y: &StateVector<4>) -> StateVector<4> {
        let state = MembraneState::from(*y);
        let ionic = self.constants.currents(&state);
        let dv = (self.stimulus.current(t) - ionic.total()) / self.constants.c_m;

        StateVector::<4>::new(
            dv,
            M_GATE.rate_of_change(state.m, state.v),
            H_GATE.rate_of_change(state.h, state.v),
            N_GATE.rate_of_change(state.n, state.v),
        )
    }
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Simulated interval `[0, t_end)` sampled every `dt`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeDomain {
    /// Horizon (ms)
    pub t_end: Time,
    /// Output spacing (ms)
    pub dt: Time,
}

impl Default for TimeDomain {
    fn default() -> Self {
        Self {
            t_end: 50.0,
            dt: 0.01,
        }
    }
}

impl TimeDomain {
    /// Number of output samples, `t_end / dt`
    pub fn samples(&self) -> Result<usize> {
        sample_count(self.t_end, self.dt)
    }
}

/// Everything one run needs
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub constants: MembraneConstants,
    pub initial: MembraneState,
    pub time: TimeDomain,
    pub stimulus: StimulusProtocol,
    pub solver: IntegratorOptions,
}

impl SimulationConfig {
    /// Parse a JSON document; absent sections keep their defaults
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| AxonError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| AxonError::ParseError(e.to_string()))
    }

    /// Write the configuration as pretty-printed JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Check the whole configuration before any integration begins
    pub fn validate(&self) -> Result<()> {
        self.constants.validate()?;
        self.initial.validate()?;
        self.time.samples()?;
        self.stimulus.validate()?;
        self.solver.validate()
    }

    /// Copy with a different stimulus
    pub fn with_stimulus(&self, stimulus: StimulusProtocol) -> Self {
        Self {
            stimulus,
            ..self.clone()
        }
    }
}

// ============================================================================
// TRAJECTORY
// ============================================================================

/// One output row: `(t, V, m, h, n)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub t: Time,
    pub v: Voltage,
    pub m: f64,
    pub h: f64,
    pub n: f64,
}

/// States on the uniform output grid of one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trajectory {
    pub times: Vec<Time>,
    pub states: Vec<MembraneState>,
    pub stats: IntegrationStats,
}

impl Trajectory {
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Rows in time order
    pub fn samples(&self) -> impl Iterator<Item = Sample> + '_ {
        self.times.iter().zip(&self.states).map(|(&t, s)| Sample {
            t,
            v: s.v,
            m: s.m,
            h: s.h,
            n: s.n,
        })
    }

    /// Membrane potential as a time series
    pub fn voltage(&self) -> TimeSeries {
        let mut ts = TimeSeries::with_capacity("V", self.len()).with_units("mV");
        for (t, s) in self.times.iter().zip(&self.states) {
            ts.push(*t, s.v);
        }
        ts
    }

    /// Matrix with one row per sample and columns `t, V, m, h, n`
    pub fn to_array(&self) -> Array2<f64> {
        let mut out = Array2::zeros((self.len(), 5));
        for (mut row, sample) in out.rows_mut().into_iter().zip(self.samples()) {
            row[0] = sample.t;
            row[1] = sample.v;
            row[2] = sample.m;
            row[3] = sample.h;
            row[4] = sample.n;
        }
        out
    }

    /// Spikes crossing `threshold` upward
    pub fn spikes(&self, threshold: Voltage) -> Vec<Spike> {
        detect_spikes(&self.voltage(), threshold)
    }
}

// ============================================================================
// SIMULATION DRIVER
// ============================================================================

/// A validated configuration ready to run
#[derive(Debug, Clone)]
pub struct Simulation {
    config: SimulationConfig,
    model: HodgkinHuxley,
    integrator: Integrator,
}

impl Simulation {
    pub fn new(config: SimulationConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            model: HodgkinHuxley::new(config.constants, config.stimulus.clone()),
            integrator: Integrator::new(config.solver.clone())?,
            config,
        })
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn model(&self) -> &HodgkinHuxley {
        &self.model
    }

    /// Integrate from the initial state and sample every `dt`.
    ///
    /// Each call starts from the configured initial state; nothing carries
    /// over between runs.
    pub fn run(&self) -> Result<Trajectory> {
        let time = self.config.time;
        let grid = uniform_grid(time.t_end, time.dt)?;
        let breakpoints = self.config.stimulus.breakpoints(time.t_end);
        info!(
            t_end = time.t_end,
            dt = time.dt,
            samples = grid.len(),
            breakpoints = breakpoints.len(),
            method = ?self.integrator.options().method,
            "starting Hodgkin-Huxley run"
        );

        let y0 = StateVector::<4>::from(self.config.initial);
        let solution = self
            .integrator
            .integrate_with_breakpoints(&self.model, y0, &grid, &breakpoints)?;

        let trajectory = Trajectory {
            times: solution.times,
            states: solution.states.into_iter().map(MembraneState::from).collect(),
            stats: solution.stats,
        };
        debug!(
            samples = trajectory.len(),
            accepted = trajectory.stats.accepted,
            rejected = trajectory.stats.rejected,
            "run complete"
        );
        Ok(trajectory)
    }
}

/// Validate `config` and run it once
pub fn simulate(config: &SimulationConfig) -> Result<Trajectory> {
    Simulation::new(config.clone())?.run()
}

// ============================================================================
// SPIKE ANALYSIS
// ============================================================================

/// Default spike detection threshold (mV)
pub const SPIKE_THRESHOLD: Voltage = 0.0;

/// Detected action potential
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Spike {
    /// Upward threshold crossing, linearly interpolated between samples (ms)
    pub time: Time,
    /// Highest voltage before falling back below threshold (mV)
    pub peak: Voltage,
    /// Time of the peak sample (ms)
    pub peak_time: Time,
}

/// Find upward crossings of `threshold` in a voltage trace
pub fn detect_spikes(voltage: &TimeSeries, threshold: Voltage) -> Vec<Spike> {
    let mut spikes = Vec::new();
    let mut current: Option<Spike> = None;

    for i in 1..voltage.len() {
        let (t0, v0) = (voltage.time[i - 1], voltage.values[i - 1]);
        let (t1, v1) = (voltage.time[i], voltage.values[i]);

        if v0 < threshold && v1 >= threshold {
            let frac = (threshold - v0) / (v1 - v0);
            current = Some(Spike {
                time: t0 + frac * (t1 - t0),
                peak: v1,
                peak_time: t1,
            });
        } else if let Some(spike) = current.as_mut() {
            if v1 >= threshold {
                if v1 > spike.peak {
                    spike.peak = v1;
                    spike.peak_time = t1;
                }
            } else {
                spikes.extend(current.take());
            }
        }
    }
    spikes.extend(current);
    spikes
}

/// Mean firing rate (Hz) of the spikes inside `(start, end]` ms
pub fn firing_rate(spikes: &[Spike], start: Time, end: Time) -> f64 {
    if end <= start {
        return 0.0;
    }
    let count = spikes
        .iter()
        .filter(|s| s.time > start && s.time <= end)
        .count();
    count as f64 / ((end - start) / 1000.0)
}

// ============================================================================
// PARAMETER SWEEPS
// ============================================================================

/// Run independent configurations in parallel; results keep input order
pub fn run_batch(configs: &[SimulationConfig]) -> Vec<Result<Trajectory>> {
    configs
        .par_iter()
        .enumerate()
        .map(|(i, config)| {
            debug!(member = i, "batch run");
            simulate(config)
        })
        .collect()
}

/// Summary of one amplitude in a sweep
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepPoint {
    /// Stimulus amplitude (uA/cm^2)
    pub amplitude: Current,
    /// Number of spikes above [`SPIKE_THRESHOLD`]
    pub spikes: usize,
    /// Highest voltage reached (mV)
    pub peak: Voltage,
    /// Mean rate over the whole run (Hz)
    pub rate: f64,
}

/// Run `base` once per amplitude, in parallel, and summarise each run
pub fn amplitude_sweep(
    base: &SimulationConfig,
    amplitudes: &[Current],
) -> Result<Vec<SweepPoint>> {
    base.validate()?;
    amplitudes
        .par_iter()
        .map(|&amplitude| {
            let config = base.with_stimulus(base.stimulus.with_amplitude(amplitude));
            let trajectory = simulate(&config)?;
            let voltage = trajectory.voltage();
            let spikes = detect_spikes(&voltage, SPIKE_THRESHOLD);
            let peak = voltage.max().map_or(f64::NAN, |(_, v)| v);
            debug!(amplitude, spikes = spikes.len(), "sweep point");
            Ok(SweepPoint {
                amplitude,
                spikes: spikes.len(),
                peak,
                rate: firing_rate(&spikes, 0.0, base.time.t_end),
            })
        })
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    fn step(amplitude: f64, onset: f64, offset: f64) -> StimulusProtocol {
        StimulusProtocol::Step {
            amplitude,
            onset,
            offset,
        }
    }

    fn quiet() -> SimulationConfig {
        SimulationConfig {
            stimulus: step(0.0, 10.0, 40.0),
            ..Default::default()
        }
    }

    fn three_pulses() -> StimulusProtocol {
        StimulusProtocol::PulseTrain {
            amplitude: 20.0,
            onset: 5.0,
            width: 1.0,
            period: 15.0,
            count: 3,
        }
    }

    fn short_run() -> SimulationConfig {
        SimulationConfig {
            time: TimeDomain {
                t_end: 5.0,
                dt: 0.1,
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_removable_singularities() {
        assert_abs_diff_eq!(alpha_m(-40.0), 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(alpha_n(-55.0), 0.1, epsilon = 1e-6);
        assert!(alpha_m(-40.0).is_finite());
        assert!(alpha_n(-55.0).is_finite());
    }

    #[test]
    fn test_continuity_around_singularities() {
        for dv in [1e-12, 1e-9, 1e-6, 9.99e-4, 1.001e-3, 1e-2] {
            let (above, below) = (alpha_m(-40.0 + dv), alpha_m(-40.0 - dv));
            assert_abs_diff_eq!(above, below, epsilon = 2e-3);
            assert_abs_diff_eq!(above, 1.0, epsilon = 1e-2);
            assert_abs_diff_eq!(alpha_n(-55.0 + dv), 0.1, epsilon = 1e-3);
        }
        // Both branches agree at the edge of the series window (u = 1e-4 -> dv = 1e-3)
        let inside = alpha_m(-40.0 + 0.999_999e-3);
        let outside = alpha_m(-40.0 + 1.000_001e-3);
        assert_relative_eq!(inside, outside, max_relative = 1e-8);
    }

    #[test]
    fn test_known_rate_values() {
        let alpha_m_rest = 2.5 / (2.5f64.exp() - 1.0);
        let alpha_n_rest = 0.1 / (1f64.exp() - 1.0);
        assert_relative_eq!(alpha_m(-65.0), alpha_m_rest, max_relative = 1e-12);
        assert_relative_eq!(beta_m(-65.0), 4.0);
        assert_relative_eq!(alpha_h(-65.0), 0.07);
        assert_relative_eq!(beta_h(-35.0), 0.5);
        assert_relative_eq!(alpha_n(-65.0), alpha_n_rest, max_relative = 1e-12);
        assert_relative_eq!(beta_n(-65.0), 0.125);
    }

    #[test]
    fn test_extreme_voltages_are_finite() {
        for v in [-200.0, -150.0, 150.0, 200.0] {
            let rates = [
                alpha_m(v),
                beta_m(v),
                alpha_h(v),
                beta_h(v),
                alpha_n(v),
                beta_n(v),
            ];
            for rate in rates {
                assert!(rate.is_finite() && rate >= 0.0, "rate {rate} at {v} mV");
            }
        }
    }

    #[test]
    fn test_steady_state_matches_default_initial_state() {
        let rest = MembraneState::resting(-65.0);
        let default = MembraneState::default();
        assert_abs_diff_eq!(rest.m, default.m, epsilon = 1e-3);
        assert_abs_diff_eq!(rest.h, default.h, epsilon = 1e-3);
        assert_abs_diff_eq!(rest.n, default.n, epsilon = 1e-3);
        assert!(M_GATE.time_constant(-65.0) < H_GATE.time_constant(-65.0));
    }

    #[test]
    fn test_gate_relaxes_toward_steady_state() {
        let v = -20.0;
        let x_inf = N_GATE.steady_state(v);
        assert!(N_GATE.rate_of_change(x_inf - 0.1, v) > 0.0);
        assert!(N_GATE.rate_of_change(x_inf + 0.1, v) < 0.0);
        assert_abs_diff_eq!(N_GATE.rate_of_change(x_inf, v), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_step_boundaries() {
        let s = StimulusProtocol::default();
        assert_eq!(s.current(0.0), 0.0);
        assert_eq!(s.current(10.0), 0.0);
        assert_eq!(s.current(10.0 + 1e-9), 10.0);
        assert_eq!(s.current(25.0), 10.0);
        assert_eq!(s.current(40.0), 10.0);
        assert_eq!(s.current(40.0 + 1e-9), 0.0);
        assert_eq!(s.current(50.0), 0.0);
        assert_eq!(s.current(-5.0), 0.0);
    }

    #[test]
    fn test_pulse_train() {
        let s = three_pulses();
        assert_eq!(s.current(5.0), 0.0);
        assert_eq!(s.current(5.5), 20.0);
        assert_eq!(s.current(6.0), 20.0);
        assert_eq!(s.current(6.5), 0.0);
        assert_eq!(s.current(20.5), 20.0);
        assert_eq!(s.current(35.5), 20.0);
        assert_eq!(s.current(50.5), 0.0);
    }

    #[test]
    fn test_touching_pulses() {
        let s = StimulusProtocol::PulseTrain {
            amplitude: 1.0,
            onset: 0.0,
            width: 2.0,
            period: 2.0,
            count: 3,
        };
        for t in [0.5, 2.0, 3.0, 4.0, 6.0] {
            assert_eq!(s.current(t), 1.0, "t = {t}");
        }
        assert_eq!(s.current(6.5), 0.0);
    }

    #[test]
    fn test_pulse_train_far_past_last_pulse() {
        let s = StimulusProtocol::PulseTrain {
            amplitude: 5.0,
            onset: 0.0,
            width: 1e-10,
            period: 1e-10,
            count: 3,
        };
        for t in [1e12, 1e300, f64::MAX, f64::INFINITY] {
            assert_eq!(s.current(t), 0.0, "t = {t}");
        }
        assert_eq!(s.current(2e-10), 5.0);
        assert_eq!(s.current(f64::NAN), 0.0);
    }

    #[test]
    fn test_ramp() {
        let s = StimulusProtocol::Ramp {
            onset: 10.0,
            offset: 20.0,
            start: 0.0,
            end: 10.0,
        };
        assert_eq!(s.current(10.0), 0.0);
        assert_relative_eq!(s.current(15.0), 5.0);
        assert_relative_eq!(s.current(20.0), 10.0);
        assert_eq!(s.current(20.5), 0.0);
    }

    #[test]
    fn test_breakpoints() {
        assert_eq!(StimulusProtocol::default().breakpoints(50.0), vec![10.0, 40.0]);
        assert_eq!(StimulusProtocol::default().breakpoints(20.0), vec![10.0]);
        assert!(StimulusProtocol::None.breakpoints(50.0).is_empty());
        assert_eq!(three_pulses().breakpoints(30.0), vec![5.0, 6.0, 20.0, 21.0]);

        let touching = StimulusProtocol::PulseTrain {
            amplitude: 1.0,
            onset: 0.0,
            width: 2.0,
            period: 2.0,
            count: 2,
        };
        assert_eq!(touching.breakpoints(10.0), vec![0.0, 2.0, 4.0]);
    }

    #[test]
    fn test_with_amplitude() {
        assert_eq!(StimulusProtocol::None.with_amplitude(3.0), step(3.0, 10.0, 40.0));
        let ramp = StimulusProtocol::Ramp {
            onset: 1.0,
            offset: 2.0,
            start: 0.5,
            end: 1.0,
        };
        let expected = StimulusProtocol::Ramp {
            onset: 1.0,
            offset: 2.0,
            start: 0.5,
            end: 7.0,
        };
        assert_eq!(ramp.with_amplitude(7.0), expected);
    }

    #[test]
    fn test_resting_currents_balance() {
        let constants = MembraneConstants::default();
        let ionic = constants.currents(&MembraneState::default());
        assert!(ionic.sodium < 0.0);
        assert!(ionic.potassium > 0.0);
        assert!(ionic.leak < 0.0);
        assert_abs_diff_eq!(ionic.total(), 0.0, epsilon = 1e-2);
    }

    #[test]
    fn test_derivative_is_pure() {
        let model = HodgkinHuxley::new(MembraneConstants::default(), StimulusProtocol::default());
        let y = StateVector::<4>::new(-40.0, 0.2, 0.4, 0.5);
        let a = model.derivatives(20.0, &y);
        let b = model.derivatives(20.0, &y);
        assert_eq!(a, b);
        assert!(a.iter().all(|d| d.is_finite()));
        // Stimulus contributes 10/C_m to dV/dt during the pulse
        let off = model.derivatives(45.0, &y);
        assert_relative_eq!(a[0] - off[0], 10.0, max_relative = 1e-12);
        assert_eq!(a[1], off[1]);
    }

    #[test]
    fn test_state_vector_round_trip() {
        let s = MembraneState {
            v: -10.0,
            m: 0.1,
            h: 0.2,
            n: 0.3,
        };
        let y: StateVector<4> = s.into();
        assert_eq!(MembraneState::from(y), s);
    }

    #[test]
    fn test_invalid_configuration() {
        let reversed = SimulationConfig {
            stimulus: step(10.0, 40.0, 10.0),
            ..Default::default()
        };
        let no_time = SimulationConfig {
            time: TimeDomain {
                t_end: 0.0,
                dt: 0.01,
            },
            ..Default::default()
        };
        let bad_dt = SimulationConfig {
            time: TimeDomain {
                t_end: 50.0,
                dt: -0.01,
            },
            ..Default::default()
        };
        let mut bad_tol = SimulationConfig::default();
        bad_tol.solver.rtol = 0.0;
        let mut bad_cm = SimulationConfig::default();
        bad_cm.constants.c_m = 0.0;

        for config in [reversed, no_time, bad_dt, bad_tol, bad_cm] {
            assert!(matches!(
                Simulation::new(config),
                Err(AxonError::InvalidConfiguration(_))
            ));
        }
    }

    #[test]
    fn test_zero_width_step_is_valid() {
        let config = SimulationConfig {
            stimulus: step(10.0, 20.0, 20.0),
            ..short_run()
        };
        assert!(simulate(&config).is_ok());
    }

    #[test]
    fn test_config_from_partial_json() {
        let config = SimulationConfig::from_json(
            r#"{ "stimulus": { "type": "step", "amplitude": 5.0 },
                 "time": { "dt": 0.05 },
                 "solver": { "method": "bogacki_shampine32", "rtol": 1e-7 } }"#,
        )
        .unwrap();
        assert_eq!(config.stimulus, step(5.0, 10.0, 40.0));
        assert_eq!(config.time.t_end, 50.0);
        assert_eq!(config.time.samples().unwrap(), 1000);
        assert_eq!(config.solver.method, Method::BogackiShampine32);
        assert_eq!(config.solver.rtol, 1e-7);
        assert_eq!(config.solver.atol, IntegratorOptions::default().atol);
        assert_eq!(config.constants, MembraneConstants::default());
    }

    #[test]
    fn test_config_json_round_trip() {
        let config = SimulationConfig::default();
        let text = config.to_json().unwrap();
        assert_eq!(SimulationConfig::from_json(&text).unwrap(), config);
    }

    #[test]
    fn test_config_parse_errors() {
        assert!(matches!(
            SimulationConfig::from_json("{ not json"),
            Err(AxonError::ParseError(_))
        ));
        assert!(matches!(
            SimulationConfig::from_json(r#"{ "time": { "t_end": -1.0 } }"#),
            Err(AxonError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_config_file_round_trip() {
        let name = format!("axon-config-{}.json", std::process::id());
        let path = std::env::temp_dir().join(name);
        let config = SimulationConfig {
            stimulus: three_pulses(),
            ..Default::default()
        };
        config.save(&path).unwrap();
        let loaded = SimulationConfig::from_file(&path);
        let _ = std::fs::remove_file(&path);
        assert_eq!(loaded.unwrap(), config);
    }

    #[test]
    fn test_missing_config_file() {
        let path = std::env::temp_dir().join("axon-no-such-dir/config.json");
        assert!(matches!(
            SimulationConfig::from_file(&path),
            Err(AxonError::IoError(_))
        ));
    }

    #[test]
    fn test_driver_keeps_solver_options() {
        let config = SimulationConfig::default();
        let sim = Simulation::new(config.clone()).unwrap();
        assert_eq!(sim.integrator.options(), &config.solver);
        assert_eq!(sim.integrator.options().max_step, None);
    }

    #[test]
    fn test_resting_state_is_stable() {
        let trajectory = simulate(&quiet()).unwrap();
        assert_eq!(trajectory.len(), 5000);
        for s in &trajectory.states {
            assert!((s.v + 65.0).abs() < 0.5, "V drifted to {}", s.v);
        }
        assert!(trajectory.spikes(SPIKE_THRESHOLD).is_empty());
    }

    #[test]
    fn test_default_stimulus_fires() {
        let trajectory = simulate(&SimulationConfig::default()).unwrap();
        let fired = trajectory
            .samples()
            .any(|s| s.t > 10.0 && s.t <= 40.0 && s.v > 0.0);
        assert!(fired);
        for s in trajectory.samples() {
            assert!(s.v > -90.0 && s.v < 60.0, "V = {} at t = {}", s.v, s.t);
        }
    }

    #[test]
    fn test_very_short_step_runs_to_completion() {
        let config = SimulationConfig {
            stimulus: step(10.0, 10.0, 10.0001),
            ..Default::default()
        };
        let trajectory = simulate(&config).unwrap();
        assert_eq!(trajectory.len(), 5000);
        assert!(trajectory.stats.accepted < 10_000);
        assert!(trajectory.stats.min_step <= 1e-4 + 1e-12);
        for s in &trajectory.states {
            assert!((s.v + 65.0).abs() < 0.5, "V = {}", s.v);
        }
    }

    #[test]
    fn test_brief_strong_pulse_is_not_skipped() {
        // 0.05 ms at 2000 uA/cm^2 deposits about 100 mV of charge
        let config = SimulationConfig {
            stimulus: step(2000.0, 10.0, 10.05),
            ..Default::default()
        };
        let spikes = simulate(&config).unwrap().spikes(SPIKE_THRESHOLD);
        assert_eq!(spikes.len(), 1);
        assert!(spikes[0].time > 10.0 && spikes[0].time < 12.0);
    }

    #[test]
    fn test_output_grid() {
        let config = SimulationConfig::default();
        let trajectory = simulate(&config).unwrap();
        assert_eq!(trajectory.len(), 5000);
        assert_eq!(trajectory.states[0], config.initial);
        assert_eq!(trajectory.times[0], 0.0);
        for pair in trajectory.times.windows(2) {
            assert!(pair[1] > pair[0]);
            assert_abs_diff_eq!(pair[1] - pair[0], 0.01, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_gates_stay_in_unit_interval() {
        for method in [Method::DormandPrince54, Method::BogackiShampine32] {
            let mut config = SimulationConfig::default();
            config.solver.method = method;
            let trajectory = simulate(&config).unwrap();
            for s in &trajectory.states {
                assert!(s.gate_excursion() <= 1e-3, "{method:?}: {s:?}");
            }
        }
    }

    #[test]
    fn test_runs_are_deterministic() {
        let sim = Simulation::new(SimulationConfig::default()).unwrap();
        let a = sim.run().unwrap();
        let b = sim.run().unwrap();
        assert_eq!(a.times, b.times);
        assert_eq!(a.states, b.states);
        assert_eq!(a.stats, b.stats);
    }

    #[test]
    fn test_spike_detection_on_default_run() {
        let trajectory = simulate(&SimulationConfig::default()).unwrap();
        let spikes = trajectory.spikes(SPIKE_THRESHOLD);
        assert_eq!(spikes.len(), 2);
        for spike in &spikes {
            assert!(spike.time > 10.0 && spike.time <= 40.0);
            assert!(spike.peak > 20.0 && spike.peak < 60.0);
            assert!(spike.peak_time >= spike.time);
        }
    }

    #[test]
    fn test_tight_tolerance_agrees_with_default() {
        let default = simulate(&SimulationConfig::default()).unwrap();
        let mut config = SimulationConfig::default();
        config.solver.rtol = 1e-11;
        config.solver.atol = 1e-11;
        let reference = simulate(&config).unwrap();
        for (a, b) in default.states.iter().zip(&reference.states) {
            assert_abs_diff_eq!(a.v, b.v, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_methods_agree_on_spike_count() {
        let dopri = simulate(&SimulationConfig::default()).unwrap();
        let mut config = SimulationConfig::default();
        config.solver.method = Method::BogackiShampine32;
        let bs = simulate(&config).unwrap();
        let a = dopri.spikes(SPIKE_THRESHOLD);
        let b = bs.spikes(SPIKE_THRESHOLD);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_abs_diff_eq!(x.time, y.time, epsilon = 0.01);
        }
    }

    #[test]
    fn test_pulse_train_spikes_once_per_pulse() {
        let config = SimulationConfig {
            stimulus: three_pulses(),
            ..Default::default()
        };
        let spikes = simulate(&config).unwrap().spikes(SPIKE_THRESHOLD);
        assert_eq!(spikes.len(), 3);
        for (spike, onset) in spikes.iter().zip([5.0, 20.0, 35.0]) {
            assert!(spike.time > onset && spike.time < onset + 5.0);
        }
    }

    #[test]
    fn test_detect_spikes_on_synthetic_trace() {
        let mut ts = TimeSeries::new("V");
        let trace = [-65.0, -10.0, 10.0, 30.0, 5.0, -70.0, 20.0];
        for (i, v) in trace.into_iter().enumerate() {
            ts.push(i as f64, v);
        }
        let spikes = detect_spikes(&ts, 0.0);
        assert_eq!(spikes.len(), 2);
        assert_relative_eq!(spikes[0].time, 1.5);
        assert_eq!(spikes[0].peak, 30.0);
        assert_eq!(spikes[0].peak_time, 3.0);
        assert_eq!(spikes[1].peak, 20.0);
        assert_relative_eq!(firing_rate(&spikes, 0.0, 10.0), 200.0);
    }

    #[test]
    fn test_trajectory_views() {
        let trajectory = simulate(&short_run()).unwrap();
        let array = trajectory.to_array();
        assert_eq!(array.shape(), &[50, 5]);
        let voltage = trajectory.voltage();
        assert_eq!(voltage.len(), 50);
        assert_eq!(voltage.units.as_deref(), Some("mV"));
        for (i, sample) in trajectory.samples().enumerate() {
            assert_eq!(array[[i, 0]], sample.t);
            assert_eq!(array[[i, 1]], sample.v);
            assert_eq!(array[[i, 4]], sample.n);
        }
    }

    #[test]
    fn test_run_batch_keeps_order() {
        let invalid = SimulationConfig {
            time: TimeDomain {
                t_end: -1.0,
                dt: 0.01,
            },
            ..Default::default()
        };
        let configs = vec![quiet(), SimulationConfig::default(), invalid];
        let results = run_batch(&configs);
        assert_eq!(results.len(), 3);
        let quiet_run = results[0].as_ref().unwrap();
        let default_run = results[1].as_ref().unwrap();
        assert!(quiet_run.spikes(SPIKE_THRESHOLD).is_empty());
        assert_eq!(default_run.spikes(SPIKE_THRESHOLD).len(), 2);
        assert!(results[2].is_err());
    }

    #[test]
    fn test_amplitude_sweep() {
        let base = SimulationConfig::default();
        let points = amplitude_sweep(&base, &[0.0, 5.0, 20.0]).unwrap();
        assert_eq!(points.len(), 3);
        assert_eq!(points[0].amplitude, 0.0);
        assert_eq!(points[0].spikes, 0);
        assert_eq!(points[0].rate, 0.0);
        assert!(points[1].spikes >= 1);
        assert!(points[2].spikes >= points[1].spikes);
        assert!(points[2].peak > 0.0);
    }
}
