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

//! Per-agent configuration records, deserialized from flat TOML files.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// Configuration for a home agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HomeConfig {
    pub agentid: String,
    pub name: String,
    /// Dotted grid location, e.g. `DC.BRANCH1.BUS1.LOAD1`.
    pub location: String,
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    #[serde(default)]
    pub appliances: Vec<ApplianceConfig>,
    /// Reference load in watts used for the baseline demand bid.
    pub refload: f64,
    /// Number of periods in the planning window.
    pub windowlength: usize,
    #[serde(default)]
    pub freg_participant: bool,
    #[serde(default)]
    pub dr_participant: bool,
    #[serde(default)]
    pub settings: Settings,
}

/// Configuration for the utility agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UtilityConfig {
    pub agentid: String,
    pub name: String,
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    #[serde(default)]
    pub settings: Settings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKindConfig {
    Solar,
    LeadAcidBattery,
}

/// A distributed resource as declared in configuration and in customer
/// enrollment messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    #[serde(rename = "type")]
    pub kind: ResourceKindConfig,
    pub name: String,
    pub location: String,
    pub cap_cost: f64,
    pub max_discharge_power: f64,
    #[serde(default)]
    pub max_charge_power: Option<f64>,
    /// Storage capacity in watt hours.
    #[serde(default)]
    pub capacity: Option<f64>,
    pub discharge_channel: u32,
    #[serde(default)]
    pub charge_channel: Option<u32>,
    /// Open-circuit voltage (solar panels).
    #[serde(default)]
    pub voc: Option<f64>,
    /// Maximum-power-point voltage (solar panels).
    #[serde(default)]
    pub vmpp: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplianceKind {
    Heater,
    Refrigerator,
    Light,
}

/// A smart appliance as declared in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplianceConfig {
    #[serde(rename = "type")]
    pub kind: ApplianceKind,
    pub name: String,
    pub nominal_power: f64,
    /// Discrete states included in the planning grid.
    pub gridpoints: Vec<f64>,
    /// Discrete control inputs, as fractions of nominal power.
    pub actionpoints: Vec<f64>,
    pub costfn: CostFnSpec,
}

/// Closed-form comfort cost over an appliance state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "fn", rename_all = "lowercase")]
pub enum CostFnSpec {
    /// `coeff * (x - setpoint)^2 + offset`
    Quad { coeff: f64, setpoint: f64, offset: f64 },
    /// Quadratic clamped at `cap`.
    Quadcap {
        coeff: f64,
        setpoint: f64,
        offset: f64,
        cap: f64,
    },
    /// Quadratic that only penalizes shortfall below the setpoint.
    Quadmono { coeff: f64, setpoint: f64, offset: f64 },
    /// One-sided quadratic clamped at `cap`.
    Quadmonocap {
        coeff: f64,
        setpoint: f64,
        offset: f64,
        cap: f64,
    },
    Const { value: f64 },
    /// Step function over sorted breakpoints `(threshold, value)`; the value
    /// of the last breakpoint at or below `x` applies.
    Piecewise { breakpoints: Vec<(f64, f64)> },
    /// Linear interpolation over sorted `(x, y)` points, clamped at the ends.
    Interpolate { points: Vec<(f64, f64)> },
}

impl CostFnSpec {
    pub fn evaluate(&self, x: f64) -> f64 {
        match self {
            Self::Quad {
                coeff,
                setpoint,
                offset,
            } => coeff * (x - setpoint).powi(2) + offset,
            Self::Quadcap {
                coeff,
                setpoint,
                offset,
                cap,
            } => (coeff * (x - setpoint).powi(2) + offset).min(*cap),
            Self::Quadmono {
                coeff,
                setpoint,
                offset,
            } => {
                if x < *setpoint {
                    coeff * (x - setpoint).powi(2) + offset
                } else {
                    *offset
                }
            }
            Self::Quadmonocap {
                coeff,
                setpoint,
                offset,
                cap,
            } => {
                if x < *setpoint {
                    (coeff * (x - setpoint).powi(2) + offset).min(*cap)
                } else {
                    *offset
                }
            }
            Self::Const { value } => *value,
            Self::Piecewise { breakpoints } => breakpoints
                .iter()
                .take_while(|(threshold, _)| *threshold <= x)
                .last()
                .or_else(|| breakpoints.first())
                .map_or(0.0, |(_, value)| *value),
            Self::Interpolate { points } => lininterp(points, x),
        }
    }
}

/// Linear interpolation over sorted `(x, y)` pairs, clamped at both ends.
pub fn lininterp(table: &[(f64, f64)], x: f64) -> f64 {
    let Some(first) = table.first() else {
        return 0.0;
    };
    if x <= first.0 {
        return first.1;
    }
    for pair in table.windows(2) {
        let (x0, y0) = pair[0];
        let (x1, y1) = pair[1];
        if x <= x1 {
            if (x1 - x0).abs() < f64::EPSILON {
                return y1;
            }
            return y0 + (y1 - y0) * (x - x0) / (x1 - x0);
        }
    }
    table.last().map_or(0.0, |(_, y)| *y)
}

/// Tunable intervals and thresholds, all overridable from agent TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Planning period length in seconds.
    pub st_plan_interval: f64,
    pub announce_period_interval: f64,
    pub accounting_interval: f64,
    pub fault_detection_interval: f64,
    pub secondary_voltage_interval: f64,
    pub simstep_interval: f64,
    pub dr_solicitation_interval: f64,
    pub customer_solicitation_interval: f64,
    /// Delay between bid solicitation and market clearing, in seconds.
    pub bid_window: f64,
    /// Rate assumed for periods with no announcement yet.
    pub assumed_rate: f64,
    pub voltage_low_emergency_threshold: f64,
    pub voltage_band_lower: f64,
    pub voltage_band_upper: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            st_plan_interval: 30.0,
            announce_period_interval: 10.0,
            accounting_interval: 10.0,
            fault_detection_interval: 2.0,
            secondary_voltage_interval: 5.0,
            simstep_interval: 1.0,
            dr_solicitation_interval: 60.0,
            customer_solicitation_interval: 30.0,
            bid_window: 5.0,
            assumed_rate: 1.0,
            voltage_low_emergency_threshold: 10.8,
            voltage_band_lower: 11.5,
            voltage_band_upper: 12.5,
        }
    }
}

/// A parsed dotted grid location such as `DC.BRANCH1.BUS1.LOAD1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub grid: String,
    pub branch: String,
    pub bus: String,
    pub load: Option<String>,
}

impl Location {
    pub fn parse(raw: &str) -> Result<Self> {
        let parts: Vec<&str> = raw.split('.').collect();
        if parts.len() < 3 {
            bail!("location {raw:?} needs at least grid.branch.bus");
        }
        if parts[0] != "DC" {
            bail!("only DC grid locations are supported, got {raw:?}");
        }
        Ok(Self {
            grid: parts[0].to_owned(),
            branch: parts[1].to_owned(),
            bus: parts[2].to_owned(),
            load: parts.get(3).map(|s| (*s).to_owned()),
        })
    }

    fn trailing_digit(part: &str) -> Result<char> {
        part.chars()
            .last()
            .filter(char::is_ascii_digit)
            .context("location segment has no trailing number")
    }

    pub fn branch_number(&self) -> Result<char> {
        Self::trailing_digit(&self.branch)
    }

    pub fn bus_number(&self) -> Result<char> {
        Self::trailing_digit(&self.bus)
    }

    pub fn load_number(&self) -> Result<char> {
        let load = self.load.as_deref().context("location has no load segment")?;
        Self::trailing_digit(load)
    }

    /// The `grid.branch.bus` prefix identifying the owning topology node.
    pub fn node_path(&self) -> String {
        format!("{}.{}.{}", self.grid, self.branch, self.bus)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_parse() {
        let loc = Location::parse("DC.BRANCH1.BUS2.LOAD1").unwrap();
        assert_eq!(loc.branch_number().unwrap(), '1');
        assert_eq!(loc.bus_number().unwrap(), '2');
        assert_eq!(loc.load_number().unwrap(), '1');
        assert_eq!(loc.node_path(), "DC.BRANCH1.BUS2");

        assert!(Location::parse("AC.BRANCH1.BUS1").is_err());
        assert!(Location::parse("DC.BRANCH1").is_err());
    }

    #[test]
    fn test_lininterp_clamps_and_interpolates() {
        let table = [(0.0, 11.8), (0.25, 12.0), (0.5, 12.2), (0.75, 12.4), (1.0, 12.7)];
        assert!((lininterp(&table, -0.5) - 11.8).abs() < 1e-9);
        assert!((lininterp(&table, 2.0) - 12.7).abs() < 1e-9);
        assert!((lininterp(&table, 0.125) - 11.9).abs() < 1e-9);
    }

    #[test]
    fn test_home_config_from_toml() {
        let raw = r#"
            agentid = "home1"
            name = "HOME1"
            location = "DC.BRANCH1.BUS1.LOAD1"
            refload = 40.0
            windowlength = 4
            dr_participant = true

            [[appliances]]
            type = "light"
            name = "lamp"
            nominal_power = 20.0
            gridpoints = [0.0, 1.0]
            actionpoints = [0.0, 1.0]
            costfn = { fn = "const", value = -1.0 }
        "#;
        let config: HomeConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.windowlength, 4);
        assert_eq!(config.appliances.len(), 1);
        assert!(config.dr_participant);
        assert!(!config.freg_participant);
        assert!((config.settings.bid_window - 5.0).abs() < f64::EPSILON);
    }
}
