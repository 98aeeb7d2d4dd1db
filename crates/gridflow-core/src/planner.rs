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

//! The home planner: backward induction over the planning window's state
//! grids, and derivation of an offer price by bracketing the price at which
//! the optimal path cost crosses zero.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::device::{Device, lookup};
use crate::optimization::{InputSignal, StateComponents, StateGrid, combinations};
use crate::period::{Period, PlanningWindow};

/// Offer-price search bounds.
const COST_THRESHOLD: f64 = 0.5;
const PRICE_STEP: f64 = 1.0;
const MAX_BRACKET_STEPS: u32 = 4;
const MAX_BISECT_STEPS: u32 = 4;
const MIN_BRACKET_WIDTH: f64 = 0.01;

/// Result of an offer-price derivation. `converged` is false when the
/// search ran out of iterations and the returned price is the midpoint of
/// the last bracket.
#[derive(Debug, Clone)]
pub struct OfferOutcome {
    pub price: f64,
    pub recommendation: Option<InputSignal>,
    pub converged: bool,
}

/// Everything the DP needs about the home: its devices, the period length,
/// and the demand-response envelope.
#[derive(Debug)]
pub struct PlannerContext<'a> {
    pub owner: &'a str,
    pub devices: &'a [Device],
    /// Period length in seconds.
    pub interval_secs: f64,
    /// Net draw permitted under a curtailment event, in watts.
    pub dr_cap: f64,
    /// Net draw required under a load-up event, in watts.
    pub dr_floor: f64,
}

impl PlannerContext<'_> {
    /// Total comfort cost of a state across all devices. Cost functions are
    /// independent per device; coupling would live here.
    pub fn state_cost(&self, comps: &StateComponents) -> f64 {
        comps
            .iter()
            .filter_map(|(name, &state)| lookup(self.devices, name).map(|dev| dev.state_cost(state)))
            .sum()
    }

    /// The live state of every device that carries one.
    pub fn snapshot(&self) -> StateComponents {
        self.devices
            .iter()
            .filter_map(|dev| dev.current_state().map(|state| (dev.name().to_owned(), state)))
            .collect()
    }

    /// Rebuild the period's state grid from device grid points, pinning the
    /// snapshot state in so the first-period grid contains the actual
    /// starting point.
    pub fn make_dp_grid(&self, period: &mut Period, snapshot: &StateComponents) {
        let mut per_device: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for dev in self.devices {
            let mut points = dev.gridpoints();
            if let Some(&current) = snapshot.get(dev.name()) {
                if !points.iter().any(|p| (p - current).abs() < 1e-9) {
                    points.push(current);
                }
            }
            if !points.is_empty() {
                per_device.insert(dev.name().to_owned(), points);
            }
        }
        let states = combinations(&per_device);
        period.plan.stategrid = StateGrid::build(states, |comps| self.state_cost(comps));
        debug!(
            "{} made state grid for period {} with {} points",
            self.owner,
            period.number,
            period.plan.stategrid.points.len()
        );
    }

    /// Every control combination worth considering for the period: one copy
    /// per pending DR event plus the no-participation baseline.
    pub fn candidate_inputs(&self, period: &Period) -> Vec<InputSignal> {
        let mut per_device: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for dev in self.devices {
            let points = dev.actionpoints();
            if !points.is_empty() {
                per_device.insert(dev.name().to_owned(), points);
            }
        }
        let combos = combinations(&per_device);

        let mut inputs = Vec::new();
        if let Some(event) = period.pending_dr_events.first() {
            for combo in &combos {
                inputs.push(InputSignal::new(combo.clone(), true, Some(event.clone())));
            }
        }
        for combo in combos {
            inputs.push(InputSignal::new(combo, true, None));
        }
        inputs
    }

    /// Whether an input is allowed out of `state` during `period`.
    pub fn admissible(&self, input: &InputSignal, state: &StateComponents, period: &Period) -> bool {
        let mut total_source = 0.0;
        let mut total_sink = 0.0;

        for (name, &u) in &input.components {
            let Some(dev) = lookup(self.devices, name) else {
                return false;
            };
            if dev.is_source() {
                let dev_state = state.get(name).copied().unwrap_or(0.0);
                if !dev.state_behavior_check(dev_state, u) {
                    return false;
                }
                // the sign of the setpoint decides source vs sink duty
                total_source += dev.power_from_input(u);
                if dev.is_intermittent() && dev.power_from_input(u) > self.available_power(dev, period)
                {
                    return false;
                }
            } else if dev.is_sink() {
                total_sink += dev.power_from_input(u);
            }
        }

        let net = total_source - total_sink;
        if !input.grid_connected && net.abs() > 1e-9 {
            // islanded: all load must be served locally
            return false;
        }

        if let Some(event) = &input.dr_event {
            let draw = total_sink - total_source;
            if event.caps_draw() && input.grid_connected && draw > self.dr_cap {
                return false;
            }
            if event.enforces_floor() {
                if !input.grid_connected {
                    return false;
                }
                if draw < self.dr_floor {
                    return false;
                }
            }
        }

        true
    }

    /// Available power of an intermittent source under the period forecast.
    /// With no forecast the source contributes nothing this pass.
    fn available_power(&self, dev: &Device, period: &Period) -> f64 {
        let Some(resource) = dev.as_resource() else {
            return 0.0;
        };
        let Some(variable) = resource.environmental_variable() else {
            return resource.max_discharge_power;
        };
        match period.forecast.as_ref().and_then(|f| f.get(variable)) {
            Some(value) => resource.power_available(value),
            None => 0.0,
        }
    }

    /// Device-wise state transition under an input.
    pub fn apply_input(&self, state: &StateComponents, input: &InputSignal) -> StateComponents {
        let mut next = StateComponents::new();
        for (name, &dev_state) in state {
            let u = input.components.get(name).copied().unwrap_or(0.0);
            let transitioned = lookup(self.devices, name)
                .map_or(dev_state, |dev| dev.apply_input(dev_state, u, self.interval_secs));
            next.insert(name.clone(), transitioned);
        }
        next
    }

    /// Run backward induction over the whole window. The terminal period's
    /// states keep `optimal_input = None`; every earlier state gets the
    /// input minimizing interpolated future cost + next-state comfort cost
    /// + transition cost at the next period's expected rate.
    pub fn optimize_window(&self, window: &mut PlanningWindow, snapshot: &StateComponents) {
        for idx in (0..window.periods.len()).rev() {
            let (head, tail) = window.periods.split_at_mut(idx + 1);
            let period = &mut head[idx];
            self.make_dp_grid(period, snapshot);

            let Some(next) = tail.first() else {
                // end of window: only the state cost counts
                continue;
            };

            let candidates = self.candidate_inputs(period);
            let rate_next = next.expected_energy_cost;

            for point_idx in 0..period.plan.stategrid.points.len() {
                let state_comps = period.plan.stategrid.points[point_idx].components.clone();
                let mut best: Option<InputSignal> = None;

                for candidate in &candidates {
                    if !self.admissible(candidate, &state_comps, period) {
                        continue;
                    }
                    let mut input = candidate.clone();
                    let next_state = self.apply_input(&state_comps, &input);
                    let future = next.plan.stategrid.interpolate_path(&next_state);
                    let arrival_cost = self.state_cost(&next_state);
                    input.transcost = input
                        .components
                        .iter()
                        .filter_map(|(name, &u)| {
                            lookup(self.devices, name)
                                .map(|dev| dev.input_cost(u, rate_next, self.interval_secs))
                        })
                        .sum();
                    input.pathcost = future + arrival_cost + input.transcost;

                    if best.as_ref().is_none_or(|b| input.pathcost < b.pathcost) {
                        best = Some(input);
                    }
                }

                period.plan.stategrid.points[point_idx].optimal_input = best;
            }

            period.plan.admissible_controls = candidates;
        }
    }

    /// The optimal input out of the current (snapshot) state in the
    /// window's first period.
    pub fn recommended(
        &self,
        window: &PlanningWindow,
        snapshot: &StateComponents,
    ) -> Option<InputSignal> {
        let first = window.first()?;
        let point = first.plan.stategrid.match_point(snapshot)?;
        point.optimal_input.clone()
    }

    /// Evaluate the plan under a uniform assumed price applied to every
    /// period of a throwaway copy of the window, and return the recommended
    /// action for the current state.
    pub fn optimal_for_price(&self, window: &PlanningWindow, price: f64) -> Option<InputSignal> {
        let first = window.first()?;
        let mut temp = PlanningWindow::new(window.len(), first.number, first.start, window.increment);
        for period in &mut temp.periods {
            period.expected_energy_cost = price;
            if let Some(original) = window.period(period.number) {
                period.forecast = original.forecast.clone();
                period.pending_dr_events = original.pending_dr_events.clone();
            } else if let Some(last) = window.last() {
                // periods beyond the known window inherit the latest forecast
                period.forecast = last.forecast.clone();
            }
        }

        // periods with no forecast of their own plan on the latest one seen
        let mut carried = None;
        for period in &mut temp.periods {
            match &period.forecast {
                Some(forecast) => carried = Some(forecast.clone()),
                None => period.forecast = carried.clone(),
            }
        }

        let snapshot = self.snapshot();
        self.optimize_window(&mut temp, &snapshot);
        self.recommended(&temp, &snapshot)
    }

    /// Re-plan the live window with its announced rates and return the
    /// recommended action for the current state.
    pub fn plan_window(&self, window: &mut PlanningWindow) -> Option<InputSignal> {
        let snapshot = self.snapshot();
        self.optimize_window(window, &snapshot);
        self.recommended(window, &snapshot)
    }

    /// Derive the offer price: the assumed uniform energy price at which the
    /// recommended action's cost-to-go crosses zero. Brackets by unit price
    /// steps, then bisects.
    pub fn determine_offer(&self, window: &PlanningWindow) -> OfferOutcome {
        let mut bound = 0.0;
        let mut rec = self.optimal_for_price(window, bound);
        let mut cost = rec.as_ref().map_or(0.0, |r| r.pathcost);
        debug!("{} initial offer-search cost: {cost}", self.owner);

        if cost == 0.0 {
            return OfferOutcome {
                price: bound,
                recommendation: rec,
                converged: true,
            };
        }

        // bracket the zero crossing: positive cost walks the price down,
        // negative cost walks it up
        let walking_up = cost < 0.0;
        let mut steps = 0;
        while cost != 0.0 && (cost < 0.0) == walking_up {
            if steps >= MAX_BRACKET_STEPS {
                warn!(
                    "{} could not bracket a zero crossing (last price {bound}, cost {cost})",
                    self.owner
                );
                return OfferOutcome {
                    price: bound / 2.0,
                    recommendation: rec,
                    converged: false,
                };
            }
            bound += if walking_up { PRICE_STEP } else { -PRICE_STEP };
            rec = self.optimal_for_price(window, bound);
            cost = rec.as_ref().map_or(0.0, |r| r.pathcost);
            debug!("{} bracketing: price {bound}, cost {cost}", self.owner);
            steps += 1;
        }

        let (mut lower, mut upper) = if bound < 0.0 { (bound, 0.0) } else { (0.0, bound) };

        let mut iterations = 0;
        let mut mid = (upper + lower) * 0.5;
        while cost.abs() > COST_THRESHOLD {
            mid = (upper + lower) * 0.5;
            rec = self.optimal_for_price(window, mid);
            cost = rec.as_ref().map_or(0.0, |r| r.pathcost);
            debug!("{} bisecting: price {mid}, cost {cost}", self.owner);

            if cost > 0.0 {
                upper = mid;
            } else if cost < 0.0 {
                lower = mid;
            }
            iterations += 1;

            if (upper - lower).abs() < MIN_BRACKET_WIDTH {
                warn!(
                    "{} narrowed the price bracket to {lower}..{upper} without settling (cost {cost})",
                    self.owner
                );
                return OfferOutcome {
                    price: (upper + lower) * 0.5,
                    recommendation: rec,
                    converged: false,
                };
            }
            if iterations >= MAX_BISECT_STEPS {
                warn!(
                    "{} hit the bisection budget at bracket {lower}..{upper} (cost {cost})",
                    self.owner
                );
                return OfferOutcome {
                    price: (upper + lower) * 0.5,
                    recommendation: rec,
                    converged: false,
                };
            }
        }

        let price = if iterations == 0 { mid } else { (upper + lower) * 0.5 };
        debug!("{} determined offer price {price}", self.owner);
        OfferOutcome {
            price,
            recommendation: rec,
            converged: true,
        }
    }
}
