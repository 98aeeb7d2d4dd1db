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

//! Ground-fault remediation: isolate nodes lowest-priority-first until the
//! zone's current balance clears, restore the innocent ones, and reclose a
//! bounded number of times before declaring the fault persistent.
//!
//! The state machine is pure: each step consumes the zone imbalance observed
//! now and returns the actions to actuate plus the delay until the next
//! step. The owning agent performs the relay writes and the scheduling.

use std::time::Duration;

use tracing::{info, warn};

/// Imbalance above this many amps indicates a ground fault.
pub const FAULT_CURRENT_THRESHOLD: f64 = 0.1;

const RECLOSE_MAX: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultState {
    Suspected,
    Unlocated,
    Located,
    Reclose,
    Persistent,
    Cleared,
    Multiple,
}

/// Relay-level work the agent must carry out after a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultAction {
    Isolate(usize),
    Restore(Vec<usize>),
    /// Detach the fault from its zone bookkeeping; it is finished.
    Unlink,
}

/// The outcome of one handler step.
#[derive(Debug, Clone)]
pub struct FaultStep {
    pub actions: Vec<FaultAction>,
    /// When to run the next step, if the fault is still being worked.
    pub redispatch: Option<Duration>,
}

impl FaultStep {
    fn terminal(actions: Vec<FaultAction>) -> Self {
        Self {
            actions,
            redispatch: None,
        }
    }

    fn again(actions: Vec<FaultAction>, delay_ms: u64) -> Self {
        Self {
            actions,
            redispatch: Some(Duration::from_millis(delay_ms)),
        }
    }
}

/// A ground fault being worked in one zone. A single handler owns each
/// active fault; steps are rescheduled via the returned delays.
#[derive(Debug, Clone)]
pub struct GroundFault {
    pub uid: u64,
    pub state: FaultState,
    pub isolated: Vec<usize>,
    pub faulted: Vec<usize>,
    pub reclose: bool,
    pub reclose_counter: u32,
    pub reclose_max: u32,
    pub zone: usize,
}

impl GroundFault {
    pub fn new(uid: u64, zone: usize) -> Self {
        Self {
            uid,
            state: FaultState::Suspected,
            isolated: Vec::new(),
            faulted: Vec::new(),
            reclose: true,
            reclose_counter: 0,
            reclose_max: RECLOSE_MAX,
            zone,
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self.state, FaultState::Cleared | FaultState::Persistent)
    }

    /// Advance the state machine with a fresh imbalance reading.
    /// `priorities` is the zone's node order, least important first,
    /// rebuilt by the caller before each step.
    pub fn step(&mut self, imbalance: f64, priorities: &[usize], zone_nodes: &[usize]) -> FaultStep {
        let faulted_current = imbalance.abs() > FAULT_CURRENT_THRESHOLD;

        match self.state {
            FaultState::Suspected => {
                if faulted_current {
                    match self.next_unisolated(priorities) {
                        Some(node) => {
                            info!(
                                "fault {}: unaccounted current {:.3} A, isolating node {}",
                                self.uid, imbalance, node
                            );
                            self.isolated.push(node);
                            self.state = FaultState::Unlocated;
                            FaultStep::again(vec![FaultAction::Isolate(node)], 60)
                        }
                        None => self.exhausted(),
                    }
                } else {
                    info!("fault {}: suspected fault resolved", self.uid);
                    self.clear()
                }
            }
            FaultState::Unlocated => {
                if faulted_current {
                    match self.next_unisolated(priorities) {
                        Some(node) => {
                            info!(
                                "fault {}: still unlocated at {:.3} A, isolating node {}",
                                self.uid, imbalance, node
                            );
                            self.isolated.push(node);
                            FaultStep::again(vec![FaultAction::Isolate(node)], 60)
                        }
                        None => self.exhausted(),
                    }
                } else {
                    // the most recently isolated node contained the fault
                    let culprit = self.isolated.last().copied();
                    if let Some(node) = culprit {
                        info!("fault {}: located at node {}, restoring the rest", self.uid, node);
                        self.faulted.push(node);
                    }
                    // every zone node that is not faulted comes back
                    let innocent: Vec<usize> = zone_nodes
                        .iter()
                        .copied()
                        .filter(|node| !self.faulted.contains(node))
                        .collect();
                    self.isolated.retain(|node| self.faulted.contains(node));
                    self.state = FaultState::Located;
                    FaultStep::again(vec![FaultAction::Restore(innocent)], 100)
                }
            }
            FaultState::Located => {
                if faulted_current {
                    warn!("fault {}: multiple faults suspected in zone", self.uid);
                    self.state = FaultState::Unlocated;
                    FaultStep::again(Vec::new(), 0)
                } else {
                    if self.reclose {
                        self.state = FaultState::Reclose;
                        info!(
                            "fault {}: will reclose (attempt {} of {})",
                            self.uid,
                            self.reclose_counter + 1,
                            self.reclose_max
                        );
                    } else {
                        self.state = FaultState::Persistent;
                        warn!("fault {}: reclose budget spent, fault is persistent", self.uid);
                    }
                    FaultStep::again(Vec::new(), 600)
                }
            }
            FaultState::Reclose => {
                self.reclose_counter += 1;
                if self.reclose_counter >= self.reclose_max {
                    self.reclose = false;
                }
                let restored = std::mem::take(&mut self.faulted);
                self.isolated.clear();
                self.state = FaultState::Suspected;
                FaultStep::again(vec![FaultAction::Restore(restored)], 100)
            }
            FaultState::Persistent => {
                // cleared only by external intervention
                FaultStep::terminal(Vec::new())
            }
            FaultState::Multiple => {
                // legacy path: give up on location and drop the whole zone
                let everyone = zone_nodes.to_vec();
                self.isolated = everyone.clone();
                FaultStep::terminal(everyone.into_iter().map(FaultAction::Isolate).collect())
            }
            FaultState::Cleared => self.clear(),
        }
    }

    fn next_unisolated(&self, priorities: &[usize]) -> Option<usize> {
        priorities
            .iter()
            .copied()
            .find(|node| !self.isolated.contains(node))
    }

    /// Every node is already isolated and the imbalance persists; the zone
    /// cannot be subdivided further.
    fn exhausted(&mut self) -> FaultStep {
        warn!("fault {}: all zone nodes isolated, fault persists", self.uid);
        self.state = FaultState::Persistent;
        FaultStep::terminal(Vec::new())
    }

    fn clear(&mut self) -> FaultStep {
        self.state = FaultState::Cleared;
        let restored = std::mem::take(&mut self.isolated);
        FaultStep::terminal(vec![FaultAction::Restore(restored), FaultAction::Unlink])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ZONE: [usize; 3] = [0, 1, 2];

    /// Walk one fault through a full locate cycle: A is innocent, B faulted.
    #[test]
    fn test_locate_restores_innocent_nodes() {
        let mut fault = GroundFault::new(1, 0);
        let priorities = vec![0, 1, 2];

        // isolate A; imbalance persists
        let step = fault.step(0.5, &priorities, &ZONE);
        assert_eq!(step.actions, vec![FaultAction::Isolate(0)]);
        assert_eq!(fault.state, FaultState::Unlocated);

        // isolate B; imbalance clears
        let step = fault.step(0.5, &priorities, &ZONE);
        assert_eq!(step.actions, vec![FaultAction::Isolate(1)]);

        let step = fault.step(0.0, &priorities, &ZONE);
        assert_eq!(step.actions, vec![FaultAction::Restore(vec![0, 2])]);
        assert_eq!(fault.state, FaultState::Located);
        assert_eq!(fault.faulted, vec![1]);
    }

    #[test]
    fn test_reclose_budget_leads_to_persistent() {
        let mut fault = GroundFault::new(2, 0);
        let priorities = vec![1, 0, 2];

        for attempt in 0..2 {
            // locate node 1 (lowest priority, actually faulted)
            fault.step(0.5, &priorities, &ZONE);
            fault.step(0.0, &priorities, &ZONE);
            assert_eq!(fault.state, FaultState::Located);

            // balance still clean while isolated: reclose
            fault.step(0.0, &priorities, &ZONE);
            assert_eq!(fault.state, FaultState::Reclose);
            let step = fault.step(0.0, &priorities, &ZONE);
            assert_eq!(step.actions, vec![FaultAction::Restore(vec![1])]);
            assert_eq!(fault.state, FaultState::Suspected);
            assert_eq!(fault.reclose_counter, attempt + 1);
        }

        assert!(!fault.reclose);
        // fault returns: locate again, then persist instead of reclosing
        fault.step(0.5, &priorities, &ZONE);
        fault.step(0.0, &priorities, &ZONE);
        fault.step(0.0, &priorities, &ZONE);
        assert_eq!(fault.state, FaultState::Persistent);
        let step = fault.step(0.0, &priorities, &ZONE);
        assert!(step.redispatch.is_none());
    }

    #[test]
    fn test_false_alarm_clears_immediately() {
        let mut fault = GroundFault::new(3, 0);
        let step = fault.step(0.05, &[0, 1, 2], &ZONE);
        assert_eq!(fault.state, FaultState::Cleared);
        assert!(step.actions.contains(&FaultAction::Unlink));
        assert!(step.redispatch.is_none());
    }

    #[test]
    fn test_isolation_grows_monotonically() {
        let mut fault = GroundFault::new(4, 0);
        let priorities = vec![0, 1, 2];

        let mut last_len = 0;
        for _ in 0..3 {
            fault.step(0.5, &priorities, &ZONE);
            assert!(fault.isolated.len() > last_len);
            last_len = fault.isolated.len();
        }
        // nothing left to isolate: the fault is declared persistent
        fault.step(0.5, &priorities, &ZONE);
        assert_eq!(fault.state, FaultState::Persistent);
    }

    #[test]
    fn test_second_fault_reenters_location() {
        let mut fault = GroundFault::new(5, 0);
        let priorities = vec![0, 1, 2];

        fault.step(0.5, &priorities, &ZONE);
        fault.step(0.0, &priorities, &ZONE);
        assert_eq!(fault.state, FaultState::Located);

        // imbalance returns while located: another fault is out there
        let step = fault.step(0.4, &priorities, &ZONE);
        assert_eq!(fault.state, FaultState::Unlocated);
        assert_eq!(step.redispatch, Some(Duration::from_millis(0)));
    }
}
