//! # Axon Core
//!
//! Shared types and utilities for single-compartment membrane simulation.
//!
//! ## Contents
//!
//! | Item | Purpose |
//! |------|---------|
//! | [`AxonError`] | Errors surfaced by configuration, integration and I/O |
//! | [`OdeSystem`] | Right-hand side `dy/dt = f(t, y)` of a fixed-size ODE system |
//! | [`StateVector`] | Stack-allocated state of an `N`-dimensional system |
//! | [`TimeSeries`] | A single recorded variable over time |
//!
//! ## Units
//!
//! Time is in ms, voltage in mV, current densities in uA/cm^2,
//! conductances in mS/cm^2 and capacitance in uF/cm^2.

use nalgebra::SVector;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Common errors
#[derive(Debug, Error)]
pub enum AxonError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("No convergence at t = {time} ms (step {step:e} below floor), state = {state:?}")]
    NonConvergence {
        /// Time of the last accepted step
        time: f64,
        /// Rejected step size that fell below the minimum
        step: f64,
        /// State at `time`
        state: Vec<f64>,
    },

    #[error("Step budget of {steps} attempts exhausted at t = {time} ms")]
    StepBudgetExhausted { time: f64, steps: usize },

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AxonError>;

/// Time point (ms)
pub type Time = f64;

/// Voltage (mV)
pub type Voltage = f64;

/// Current density (uA/cm^2)
pub type Current = f64;

/// Conductance (mS/cm^2)
pub type Conductance = f64;

/// Capacitance (uF/cm^2)
pub type Capacitance = f64;

/// State vector for an `N`-dimensional ODE system
pub type StateVector<const N: usize> = SVector<f64, N>;

/// Reject non-finite or non-positive values with a named message.
pub fn ensure_positive(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(AxonError::InvalidConfiguration(format!(
            "{name} must be finite and > 0, got {value}"
        )));
    }
    Ok(())
}

/// Reject non-finite values with a named message.
pub fn ensure_finite(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() {
        return Err(AxonError::InvalidConfiguration(format!(
            "{name} must be finite, got {value}"
        )));
    }
    Ok(())
}

/// Time series data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSeries {
    /// Time points
    pub time: Vec<Time>,
    /// Values at each time point
    pub values: Vec<f64>,
    /// Variable name
    pub name: String,
    /// Units
    pub units: Option<String>,
}

impl TimeSeries {
    pub fn new(name: &str) -> Self {
        Self {
            time: Vec::new(),
            values: Vec::new(),
            name: name.to_string(),
            units: None,
        }
    }

    pub fn with_capacity(name: &str, capacity: usize) -> Self {
        Self {
            time: Vec::with_capacity(capacity),
            values: Vec::with_capacity(capacity),
            name: name.to_string(),
            units: None,
        }
    }

    pub fn with_units(mut self, units: &str) -> Self {
        self.units = Some(units.to_string());
        self
    }

    pub fn push(&mut self, t: Time, v: f64) {
        self.time.push(t);
        self.values.push(v);
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// `(time, value)` pairs in recording order
    pub fn iter(&self) -> impl Iterator<Item = (Time, f64)> + '_ {
        self.time.iter().copied().zip(self.values.iter().copied())
    }

    /// Largest recorded value and its time
    pub fn max(&self) -> Option<(Time, f64)> {
        self.iter()
            .fold(None, |best: Option<(Time, f64)>, (t, v)| match best {
                Some((_, bv)) if bv >= v => best,
                _ => Some((t, v)),
            })
    }

    /// Smallest recorded value and its time
    pub fn min(&self) -> Option<(Time, f64)> {
        self.iter()
            .fold(None, |best: Option<(Time, f64)>, (t, v)| match best {
                Some((_, bv)) if bv <= v => best,
                _ => Some((t, v)),
            })
    }
}

/// ODE system trait (for simulators)
///
/// Implementations are evaluated in the integrator's inner loop, several
/// times per step, and must be pure: identical `(t, y)` give identical
/// results and nothing is allocated.
pub trait OdeSystem<const N: usize> {
    /// System dimension
    fn dimension(&self) -> usize {
        N
    }

    /// Compute derivatives: dy/dt = f(t, y)
    fn derivatives(&self, t: Time, y: &StateVector<N>) -> StateVector<N>;
}

impl<F, const N: usize> OdeSystem<N> for F
where
    F: Fn(Time, &StateVector<N>) -> StateVector<N>,
{
    fn derivatives(&self, t: Time, y: &StateVector<N>) -> StateVector<N> {
        self(t, y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_time_series() {
        let mut ts = TimeSeries::new("voltage").with_units("mV");
        ts.push(0.0, -65.0);
        ts.push(0.1, -64.0);
        ts.push(0.2, -66.0);
        assert_eq!(ts.len(), 3);
        assert_eq!(ts.units.as_deref(), Some("mV"));
        assert_eq!(ts.max(), Some((0.1, -64.0)));
        assert_eq!(ts.min(), Some((0.2, -66.0)));
    }

    #[test]
    fn test_empty_time_series() {
        let ts = TimeSeries::with_capacity("m", 16);
        assert!(ts.is_empty());
        assert!(ts.max().is_none());
    }

    #[test]
    fn test_closure_is_ode_system() {
        let decay = |_t: Time, y: &StateVector<2>| -y;
        let y = StateVector::<2>::new(1.0, -2.0);
        let dy = decay.derivatives(0.0, &y);
        assert_eq!(decay.dimension(), 2);
        assert_relative_eq!(dy[0], -1.0);
        assert_relative_eq!(dy[1], 2.0);
    }

    #[test]
    fn test_validation_helpers() {
        assert!(ensure_positive("dt", 0.01).is_ok());
        assert!(ensure_positive("dt", 0.0).is_err());
        assert!(ensure_positive("dt", f64::NAN).is_err());
        assert!(ensure_finite("onset", -3.0).is_ok());
        assert!(matches!(
            ensure_finite("onset", f64::INFINITY),
            Err(AxonError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_non_convergence_message() {
        let err = AxonError::NonConvergence {
            time: 12.5,
            step: 1e-14,
            state: vec![-40.0, 0.5, 0.5, 0.5],
        };
        let msg = err.to_string();
        assert!(msg.contains("12.5"));
        assert!(msg.contains("-40"));
    }
}
