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

//! Distributed resources: sources and storage attached to converter channels.

use gridflow_types::config::{ResourceConfig, ResourceKindConfig, lininterp};
use gridflow_types::forecast::WeatherVariable;

/// Battery SOC as a function of open-circuit voltage.
pub const SOC_TABLE: [(f64, f64); 5] = [
    (0.0, 11.8),
    (0.25, 12.0),
    (0.5, 12.2),
    (0.75, 12.4),
    (1.0, 12.7),
];

const BATTERY_CYCLE_LIFE: f64 = 1000.0;
const SOLAR_AMORTIZATION_PERIOD: f64 = 1000.0;

/// Capability variant of a resource.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceKind {
    SolarPanel {
        /// Open-circuit voltage.
        voc: f64,
        /// Maximum-power-point voltage.
        vmpp: f64,
        amortization_period: f64,
    },
    LeadAcidBattery {
        /// Capacity in watt hours.
        capacity: f64,
        max_charge_power: f64,
        cycle_life: f64,
    },
}

/// A converter channel. The channel only computes tag names and tracks the
/// commanded state; the owning agent pushes `TagCommand`s to the PLC.
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub number: u32,
    pub connected: bool,
    pub setpoint: f64,
    pub droop: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TagCommandValue {
    Bool(bool),
    Float(f64),
}

/// A pending write against the PLC tag namespace.
#[derive(Debug, Clone, PartialEq)]
pub struct TagCommand {
    pub tag: String,
    pub value: TagCommandValue,
}

impl Channel {
    pub fn new(number: u32) -> Self {
        Self {
            number,
            connected: false,
            setpoint: 0.0,
            droop: 0.0,
        }
    }

    pub fn reg_voltage_tag(&self) -> String {
        format!("SOURCE_{}_REG_VOLTAGE", self.number)
    }

    pub fn reg_current_tag(&self) -> String {
        format!("SOURCE_{}_REG_CURRENT", self.number)
    }

    pub fn unreg_voltage_tag(&self) -> String {
        format!("SOURCE_{}_UNREG_VOLTAGE", self.number)
    }

    pub fn unreg_current_tag(&self) -> String {
        format!("SOURCE_{}_UNREG_CURRENT", self.number)
    }

    /// Connect the channel with a power setpoint and droop slope. The
    /// regulated-side current reference doubles as the setpoint tag.
    pub fn connect_with_set(&mut self, setpoint: f64, droop: f64) -> Vec<TagCommand> {
        self.connected = true;
        self.setpoint = setpoint;
        self.droop = droop;
        vec![TagCommand {
            tag: self.reg_current_tag(),
            value: TagCommandValue::Float(setpoint),
        }]
    }

    pub fn change_setpoint(&mut self, setpoint: f64) -> Vec<TagCommand> {
        self.setpoint = setpoint;
        vec![TagCommand {
            tag: self.reg_current_tag(),
            value: TagCommandValue::Float(setpoint),
        }]
    }

    /// Commit the channel as reserve headroom under droop control.
    pub fn change_reserve(&mut self, headroom: f64, droop: f64) -> Vec<TagCommand> {
        self.connected = true;
        self.setpoint = headroom;
        self.droop = droop;
        vec![TagCommand {
            tag: self.reg_current_tag(),
            value: TagCommandValue::Float(0.0),
        }]
    }

    pub fn disconnect(&mut self) -> Vec<TagCommand> {
        self.connected = false;
        self.setpoint = 0.0;
        vec![TagCommand {
            tag: self.reg_current_tag(),
            value: TagCommandValue::Float(0.0),
        }]
    }
}

/// A source or storage element owned by an agent.
#[derive(Debug, Clone)]
pub struct Resource {
    pub name: String,
    pub location: String,
    pub cap_cost: f64,
    pub max_discharge_power: f64,
    pub kind: ResourceKind,
    pub discharge_channel: Channel,
    pub charge_channel: Option<Channel>,
    /// State of charge in [0, 1]; meaningful for storage only.
    pub soc: f64,
    /// Power committed to frequency regulation once enrolled.
    pub freg_power: f64,
}

impl Resource {
    pub fn from_config(config: &ResourceConfig) -> Self {
        let kind = match config.kind {
            ResourceKindConfig::Solar => ResourceKind::SolarPanel {
                voc: config.voc.unwrap_or(13.5),
                vmpp: config.vmpp.unwrap_or(12.5),
                amortization_period: SOLAR_AMORTIZATION_PERIOD,
            },
            ResourceKindConfig::LeadAcidBattery => ResourceKind::LeadAcidBattery {
                capacity: config.capacity.unwrap_or(100.0),
                max_charge_power: config.max_charge_power.unwrap_or(config.max_discharge_power),
                cycle_life: BATTERY_CYCLE_LIFE,
            },
        };
        Self {
            name: config.name.clone(),
            location: config.location.clone(),
            cap_cost: config.cap_cost,
            max_discharge_power: config.max_discharge_power,
            kind,
            discharge_channel: Channel::new(config.discharge_channel),
            charge_channel: config.charge_channel.map(Channel::new),
            soc: 0.5,
            freg_power: 0.0,
        }
    }

    pub fn is_source(&self) -> bool {
        true
    }

    pub fn is_sink(&self) -> bool {
        matches!(self.kind, ResourceKind::LeadAcidBattery { .. })
    }

    pub fn is_storage(&self) -> bool {
        matches!(self.kind, ResourceKind::LeadAcidBattery { .. })
    }

    pub fn is_intermittent(&self) -> bool {
        matches!(self.kind, ResourceKind::SolarPanel { .. })
    }

    /// Signed per-unit setpoint to watts; positive discharges, negative sinks.
    pub fn power_from_pu(&self, pu: f64) -> f64 {
        pu * self.max_discharge_power
    }

    /// The forecast variable that limits an intermittent source.
    pub fn environmental_variable(&self) -> Option<WeatherVariable> {
        match self.kind {
            ResourceKind::SolarPanel { .. } => Some(WeatherVariable::SolarIrradiance),
            ResourceKind::LeadAcidBattery { .. } => None,
        }
    }

    /// Available power given the forecast value of the environmental
    /// variable (irradiance as a percentage of nominal).
    pub fn power_available(&self, irradiance_pct: f64) -> f64 {
        self.max_discharge_power * irradiance_pct / 100.0
    }

    /// Infer SOC from an open-circuit voltage reading.
    pub fn soc_from_ocv(voltage: f64) -> f64 {
        let inverted: Vec<(f64, f64)> = SOC_TABLE.iter().map(|&(soc, v)| (v, soc)).collect();
        lininterp(&inverted, voltage)
    }

    /// Whether the input is consistent with the state: an empty battery
    /// cannot discharge and a full one cannot charge.
    pub fn state_behavior_check(&self, state: f64, pu: f64) -> bool {
        match self.kind {
            ResourceKind::LeadAcidBattery { .. } => {
                !(pu > 0.0 && state <= 0.0) && !(pu < 0.0 && state >= 1.0)
            }
            ResourceKind::SolarPanel { .. } => pu >= 0.0,
        }
    }

    /// Predicted state after holding `pu` for `dt_secs`.
    pub fn apply_input(&self, state: f64, pu: f64, dt_secs: f64) -> f64 {
        match self.kind {
            ResourceKind::LeadAcidBattery { capacity, .. } => {
                let energy_wh = self.power_from_pu(pu) * dt_secs / 3600.0;
                (state - energy_wh / capacity).clamp(0.0, 1.0)
            }
            ResourceKind::SolarPanel { .. } => state,
        }
    }

    /// Discrete states included in the planning grid.
    pub fn gridpoints(&self) -> Vec<f64> {
        match self.kind {
            ResourceKind::LeadAcidBattery { .. } => vec![0.0, 0.25, 0.5, 0.75, 1.0],
            ResourceKind::SolarPanel { .. } => Vec::new(),
        }
    }

    /// Discrete per-unit control inputs.
    pub fn actionpoints(&self) -> Vec<f64> {
        match self.kind {
            ResourceKind::LeadAcidBattery { .. } => vec![-1.0, -0.5, 0.0, 0.5, 1.0],
            ResourceKind::SolarPanel { .. } => vec![0.0, 0.5, 1.0],
        }
    }

    pub fn state_cost(&self, _state: f64) -> f64 {
        0.0
    }

    /// Cost of holding `pu` for `dt_secs` with energy priced at `rate`.
    /// Discharge displaces grid purchases (negative cost); storage cycling
    /// carries a wear term amortizing the capital cost over cycle life.
    pub fn input_cost(&self, pu: f64, rate: f64, dt_secs: f64) -> f64 {
        let energy_wh = self.power_from_pu(pu) * dt_secs / 3600.0;
        match self.kind {
            ResourceKind::LeadAcidBattery {
                capacity,
                cycle_life,
                ..
            } => {
                let wear = energy_wh.abs() * self.cap_cost / (cycle_life * capacity);
                -energy_wh * rate + wear
            }
            ResourceKind::SolarPanel {
                amortization_period,
                ..
            } => {
                let production_rate = ratecalc(self.cap_cost, 0.05, amortization_period, 0.2);
                energy_wh * (production_rate - rate)
            }
        }
    }

    /// The current snapshot state, for devices that carry one.
    pub fn current_state(&self) -> Option<f64> {
        match self.kind {
            ResourceKind::LeadAcidBattery { .. } => Some(self.soc),
            ResourceKind::SolarPanel { .. } => None,
        }
    }
}

/// Amortized capital recovery rate: annuity over `periods` at `interest`,
/// marked up by `margin`.
pub fn ratecalc(cap_cost: f64, interest: f64, periods: f64, margin: f64) -> f64 {
    let annuity = if interest.abs() < f64::EPSILON {
        cap_cost / periods
    } else {
        let factor = (1.0 + interest).powf(periods);
        cap_cost * interest * factor / (factor - 1.0)
    };
    annuity * (1.0 + margin)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridflow_types::config::{ResourceConfig, ResourceKindConfig};

    fn create_test_battery() -> Resource {
        Resource::from_config(&ResourceConfig {
            kind: ResourceKindConfig::LeadAcidBattery,
            name: "bat1".to_owned(),
            location: "DC.BRANCH1.BUS1".to_owned(),
            cap_cost: 500.0,
            max_discharge_power: 20.0,
            max_charge_power: Some(10.0),
            capacity: Some(100.0),
            discharge_channel: 1,
            charge_channel: Some(2),
            voc: None,
            vmpp: None,
        })
    }

    #[test]
    fn test_soc_from_ocv_follows_table() {
        assert!((Resource::soc_from_ocv(11.8) - 0.0).abs() < 1e-9);
        assert!((Resource::soc_from_ocv(12.2) - 0.5).abs() < 1e-9);
        assert!((Resource::soc_from_ocv(12.7) - 1.0).abs() < 1e-9);
        // midpoint of the 12.0..12.2 segment
        assert!((Resource::soc_from_ocv(12.1) - 0.375).abs() < 1e-9);
        // clamped outside the table
        assert!((Resource::soc_from_ocv(11.0) - 0.0).abs() < 1e-9);
        assert!((Resource::soc_from_ocv(13.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_battery_behavior_check() {
        let battery = create_test_battery();
        assert!(!battery.state_behavior_check(0.0, 0.5));
        assert!(!battery.state_behavior_check(1.0, -0.5));
        assert!(battery.state_behavior_check(0.5, 1.0));
        assert!(battery.state_behavior_check(0.5, -1.0));
    }

    #[test]
    fn test_battery_state_transition() {
        let battery = create_test_battery();
        // discharging at full power for an hour drains 20 Wh of 100 Wh
        let next = battery.apply_input(0.5, 1.0, 3600.0);
        assert!((next - 0.3).abs() < 1e-9);
        // charging raises SOC
        let next = battery.apply_input(0.5, -1.0, 3600.0);
        assert!((next - 0.7).abs() < 1e-9);
        // clamped at empty
        let next = battery.apply_input(0.05, 1.0, 3600.0);
        assert!((next - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_channel_tag_names() {
        let channel = Channel::new(3);
        assert_eq!(channel.reg_voltage_tag(), "SOURCE_3_REG_VOLTAGE");
        assert_eq!(channel.unreg_current_tag(), "SOURCE_3_UNREG_CURRENT");
    }

    #[test]
    fn test_channel_connect_disconnect() {
        let mut channel = Channel::new(1);
        let writes = channel.connect_with_set(15.0, 0.0);
        assert!(channel.connected);
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].tag, "SOURCE_1_REG_CURRENT");

        channel.disconnect();
        assert!(!channel.connected);
        assert!((channel.setpoint - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_discharge_is_credited_against_rate() {
        let battery = create_test_battery();
        // discharging when energy is expensive should be profitable overall
        let cost = battery.input_cost(1.0, 5.0, 3600.0);
        assert!(cost < 0.0);
        // charging pays the going rate
        let cost = battery.input_cost(-1.0, 5.0, 3600.0);
        assert!(cost > 0.0);
    }
}
