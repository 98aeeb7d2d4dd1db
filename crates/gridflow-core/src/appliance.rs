// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of GridFlow.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Smart appliances: controllable loads with a comfort cost over their state.
//!
//! The physical models are deliberately coarse first-order ones; planning only
//! needs the cost and state-transition interfaces.

use gridflow_types::config::{ApplianceConfig, ApplianceKind, CostFnSpec};

/// Ambient temperature assumed by the thermal models, in celsius.
const AMBIENT_TEMP: f64 = 20.0;

/// A controllable load. `state` is the live simulated physical state:
/// temperature for thermal appliances, brightness fraction for lights.
#[derive(Debug, Clone)]
pub struct Appliance {
    pub name: String,
    pub kind: ApplianceKind,
    pub nominal_power: f64,
    /// Discrete states included in the planning grid.
    pub gridpoints: Vec<f64>,
    /// Discrete control inputs, as fractions of nominal power.
    pub actionpoints: Vec<f64>,
    pub cost: CostFnSpec,
    pub state: f64,
    /// Heating (or cooling) effect per watt of input, state units per second.
    gain: f64,
    /// Relaxation toward ambient, per second.
    loss: f64,
}

impl Appliance {
    pub fn from_config(config: &ApplianceConfig) -> Self {
        let (gain, loss, initial) = match config.kind {
            ApplianceKind::Heater => (0.002, 0.01, AMBIENT_TEMP),
            ApplianceKind::Refrigerator => (0.004, 0.02, 5.0),
            ApplianceKind::Light => (0.0, 0.0, 0.0),
        };
        Self {
            name: config.name.clone(),
            kind: config.kind,
            nominal_power: config.nominal_power,
            gridpoints: config.gridpoints.clone(),
            actionpoints: config.actionpoints.clone(),
            cost: config.costfn.clone(),
            state: initial,
            gain,
            loss,
        }
    }

    /// Comfort cost of occupying `state` for one period.
    pub fn state_cost(&self, state: f64) -> f64 {
        self.cost.evaluate(state)
    }

    /// Predicted state after running at fraction `u` of nominal power
    /// for `dt_secs`.
    pub fn apply_input(&self, state: f64, u: f64, dt_secs: f64) -> f64 {
        match self.kind {
            ApplianceKind::Heater => {
                state + (u * self.nominal_power * self.gain - self.loss * (state - AMBIENT_TEMP)) * dt_secs
            }
            ApplianceKind::Refrigerator => {
                state - (u * self.nominal_power * self.gain - self.loss * (AMBIENT_TEMP - state)) * dt_secs
            }
            ApplianceKind::Light => u,
        }
    }

    /// Energy cost of running at fraction `u` for `dt_secs` at `rate`.
    pub fn input_cost(&self, u: f64, rate: f64, dt_secs: f64) -> f64 {
        u * self.nominal_power * dt_secs / 3600.0 * rate
    }

    /// Advance the live physical state given the power actually supplied.
    pub fn simulation_step(&mut self, supplied_power: f64, dt_secs: f64) {
        let u = if self.nominal_power > 0.0 {
            supplied_power / self.nominal_power
        } else {
            0.0
        };
        self.state = self.apply_input(self.state, u, dt_secs);
    }
}
