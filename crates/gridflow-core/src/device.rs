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

//! The device union addressed by the planner: resources and appliances
//! share the grid/action/cost/transition interface.

use gridflow_types::forecast::WeatherVariable;

use crate::appliance::Appliance;
use crate::resource::Resource;

#[derive(Debug, Clone)]
pub enum Device {
    Resource(Resource),
    Appliance(Appliance),
}

impl Device {
    pub fn name(&self) -> &str {
        match self {
            Self::Resource(res) => &res.name,
            Self::Appliance(app) => &app.name,
        }
    }

    pub fn as_resource(&self) -> Option<&Resource> {
        match self {
            Self::Resource(res) => Some(res),
            Self::Appliance(_) => None,
        }
    }

    pub fn as_resource_mut(&mut self) -> Option<&mut Resource> {
        match self {
            Self::Resource(res) => Some(res),
            Self::Appliance(_) => None,
        }
    }

    pub fn is_source(&self) -> bool {
        match self {
            Self::Resource(res) => res.is_source(),
            Self::Appliance(_) => false,
        }
    }

    pub fn is_sink(&self) -> bool {
        match self {
            Self::Resource(res) => res.is_sink(),
            Self::Appliance(_) => true,
        }
    }

    pub fn is_intermittent(&self) -> bool {
        match self {
            Self::Resource(res) => res.is_intermittent(),
            Self::Appliance(_) => false,
        }
    }

    /// Signed watts for a control value: per-unit setpoint for resources,
    /// fraction of nominal power for appliances.
    pub fn power_from_input(&self, u: f64) -> f64 {
        match self {
            Self::Resource(res) => res.power_from_pu(u),
            Self::Appliance(app) => u * app.nominal_power,
        }
    }

    pub fn max_discharge_power(&self) -> f64 {
        match self {
            Self::Resource(res) => res.max_discharge_power,
            Self::Appliance(_) => 0.0,
        }
    }

    pub fn environmental_variable(&self) -> Option<WeatherVariable> {
        match self {
            Self::Resource(res) => res.environmental_variable(),
            Self::Appliance(_) => None,
        }
    }

    pub fn gridpoints(&self) -> Vec<f64> {
        match self {
            Self::Resource(res) => res.gridpoints(),
            Self::Appliance(app) => app.gridpoints.clone(),
        }
    }

    pub fn actionpoints(&self) -> Vec<f64> {
        match self {
            Self::Resource(res) => res.actionpoints(),
            Self::Appliance(app) => app.actionpoints.clone(),
        }
    }

    pub fn state_cost(&self, state: f64) -> f64 {
        match self {
            Self::Resource(res) => res.state_cost(state),
            Self::Appliance(app) => app.state_cost(state),
        }
    }

    pub fn apply_input(&self, state: f64, u: f64, dt_secs: f64) -> f64 {
        match self {
            Self::Resource(res) => res.apply_input(state, u, dt_secs),
            Self::Appliance(app) => app.apply_input(state, u, dt_secs),
        }
    }

    pub fn input_cost(&self, u: f64, rate: f64, dt_secs: f64) -> f64 {
        match self {
            Self::Resource(res) => res.input_cost(u, rate, dt_secs),
            Self::Appliance(app) => app.input_cost(u, rate, dt_secs),
        }
    }

    pub fn state_behavior_check(&self, state: f64, u: f64) -> bool {
        match self {
            Self::Resource(res) => res.state_behavior_check(state, u),
            Self::Appliance(_) => true,
        }
    }

    /// The live state to pin into the planning grid, if the device has one.
    pub fn current_state(&self) -> Option<f64> {
        match self {
            Self::Resource(res) => res.current_state(),
            Self::Appliance(app) => Some(app.state),
        }
    }
}

/// Find a device by name.
pub fn lookup<'a>(devices: &'a [Device], name: &str) -> Option<&'a Device> {
    devices.iter().find(|dev| dev.name() == name)
}
