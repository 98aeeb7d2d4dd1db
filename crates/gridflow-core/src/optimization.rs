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

//! The discretized optimization grid: state points, candidate inputs, and
//! inverse-distance-weighted interpolation between grid points.

use std::collections::BTreeMap;

use gridflow_types::dr::DrEvent;

/// Power to which the distance is raised in IDW interpolation.
const IDW_EXPONENT: i32 = 4;

/// Per-device values keyed by device name. A `BTreeMap` keeps iteration
/// deterministic so path costs are reproducible.
pub type StateComponents = BTreeMap<String, f64>;

/// A candidate control vector for one period.
#[derive(Debug, Clone, PartialEq)]
pub struct InputSignal {
    /// Control value per device.
    pub components: BTreeMap<String, f64>,
    pub grid_connected: bool,
    pub dr_event: Option<DrEvent>,
    /// Cost of the transition this input causes.
    pub transcost: f64,
    /// Total cost-to-go when this input is applied.
    pub pathcost: f64,
}

impl InputSignal {
    pub fn new(
        components: BTreeMap<String, f64>,
        grid_connected: bool,
        dr_event: Option<DrEvent>,
    ) -> Self {
        Self {
            components,
            grid_connected,
            dr_event,
            transcost: 0.0,
            pathcost: 0.0,
        }
    }
}

/// One point of the state grid with its comfort cost and, once the DP pass
/// has run, the optimal input out of it.
#[derive(Debug, Clone)]
pub struct StateGridPoint {
    pub components: StateComponents,
    pub statecost: f64,
    pub optimal_input: Option<InputSignal>,
}

/// The discretized state space for one period.
#[derive(Debug, Clone, Default)]
pub struct StateGrid {
    pub points: Vec<StateGridPoint>,
}

impl StateGrid {
    /// Build a grid over the given states, evaluating the state cost once
    /// per point.
    pub fn build(states: Vec<StateComponents>, cost: impl Fn(&StateComponents) -> f64) -> Self {
        let points = states
            .into_iter()
            .map(|components| {
                let statecost = cost(&components);
                StateGridPoint {
                    components,
                    statecost,
                    optimal_input: None,
                }
            })
            .collect();
        Self { points }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// The grid point exactly matching `components`, if any.
    pub fn match_point(&self, components: &StateComponents) -> Option<&StateGridPoint> {
        self.points.iter().find(|point| components_equal(&point.components, components))
    }

    /// Interpolate the optimal path cost at an arbitrary state using inverse
    /// distance weighting. An exact grid hit short-circuits to the stored
    /// value; a grid point without an optimal input marks the end of the
    /// window, where only state cost counts, so the interpolation is 0.
    pub fn interpolate_path(&self, x: &StateComponents) -> f64 {
        let mut numerator = 0.0;
        let mut denominator = 0.0;

        for point in &self.points {
            let Some(optimal) = &point.optimal_input else {
                return 0.0;
            };

            if components_equal(&point.components, x) {
                return optimal.pathcost;
            }

            let weight = distance(x, &point.components).powi(-IDW_EXPONENT);
            denominator += weight;
            numerator += weight * optimal.pathcost;
        }

        if denominator == 0.0 {
            return 0.0;
        }
        numerator / denominator
    }

    /// Interpolate the comfort cost at an arbitrary state.
    pub fn interpolate_state(&self, x: &StateComponents) -> f64 {
        let mut numerator = 0.0;
        let mut denominator = 0.0;

        for point in &self.points {
            if components_equal(&point.components, x) {
                return point.statecost;
            }

            let weight = distance(x, &point.components).powi(-IDW_EXPONENT);
            denominator += weight;
            numerator += weight * point.statecost;
        }

        if denominator == 0.0 {
            return 0.0;
        }
        numerator / denominator
    }
}

fn components_equal(a: &StateComponents, b: &StateComponents) -> bool {
    a.len() == b.len()
        && a.iter().all(|(key, value)| {
            b.get(key).is_some_and(|other| (value - other).abs() < 1e-9)
        })
}

/// Euclidean distance over the shared device-state vector.
fn distance(a: &StateComponents, b: &StateComponents) -> f64 {
    a.iter()
        .map(|(key, value)| {
            let other = b.get(key).copied().unwrap_or(0.0);
            (value - other).powi(2)
        })
        .sum::<f64>()
        .sqrt()
}

/// Cartesian product of per-device value lists, yielding every combination
/// as a components map. Devices with no values are left out of every
/// combination.
pub fn combinations(per_device: &BTreeMap<String, Vec<f64>>) -> Vec<StateComponents> {
    let mut result: Vec<StateComponents> = vec![StateComponents::new()];
    for (name, values) in per_device {
        if values.is_empty() {
            continue;
        }
        let mut expanded = Vec::with_capacity(result.len() * values.len());
        for base in &result {
            for value in values {
                let mut combo = base.clone();
                combo.insert(name.clone(), *value);
                expanded.push(combo);
            }
        }
        result = expanded;
    }
    result
}
