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

//! Topology, fault-cycle, and schedule-revision scenarios against the
//! default infrastructure model.

use chrono::Duration;
use gridflow_agents::utility::default_grid;
use gridflow_core::faults::FAULT_CURRENT_THRESHOLD;
use gridflow_core::{FaultAction, FaultState, GroundFault, PlanningWindow};

/// Opening the interconnects partitions the grid into two groups and the
/// customer list partitions with the nodes.
#[test]
fn test_interconnect_split_partitions_customers() {
    let mut grid = default_grid();
    let bus1 = grid.node_by_path("DC.BRANCH1.BUS1").unwrap();
    let bus2 = grid.node_by_path("DC.BRANCH2.BUS1").unwrap();
    grid.nodes[bus1].customers.push("HOME1".to_owned());
    grid.nodes[bus2].customers.push("HOME2".to_owned());

    let unified = grid.rebuild_groups();
    assert_eq!(unified.len(), 1);
    assert_eq!(unified[0].customers.len(), 2);

    // sever branch 2 from the main bus and both interconnects
    grid.set_relay("INTERCONNECT_1_User", false);
    grid.set_relay("INTERCONNECT_2_User", false);
    grid.set_relay("BRANCH_2_BUS_1_PROXIMAL_User", false);

    let split = grid.rebuild_groups();
    assert_eq!(split.len(), 2);

    let home1_group = split
        .iter()
        .find(|g| g.customers.contains(&"HOME1".to_owned()))
        .unwrap();
    let home2_group = split
        .iter()
        .find(|g| g.customers.contains(&"HOME2".to_owned()))
        .unwrap();
    assert_ne!(home1_group.name, home2_group.name);
    // no group object survives the refresh with stale membership
    assert_eq!(home1_group.customers.len(), 1);
    assert_eq!(home2_group.customers.len(), 1);

    // the matrix behind the decomposition stays symmetric
    let matrix = grid.conn_matrix();
    for i in 0..matrix.len() {
        for j in 0..matrix.len() {
            assert_eq!(matrix[i][j], matrix[j][i]);
        }
    }
}

/// A full ground-fault campaign over a three-node zone with the fault on
/// the second node in priority order: locate, reclose twice, then declare
/// the fault persistent.
#[test]
fn test_ground_fault_cycle_ends_persistent() {
    let zone = [0usize, 1, 2];
    // priority order: A (lowest value), then B (the faulted node), then C
    let priorities = vec![0usize, 1, 2];
    // 0.5 A of unaccounted current whenever node B is energized
    let imbalance = |fault: &GroundFault| {
        if fault.isolated.contains(&1) || fault.faulted.contains(&1) {
            0.0
        } else {
            0.5
        }
    };
    assert!(0.5 > FAULT_CURRENT_THRESHOLD);

    let mut fault = GroundFault::new(1, 0);
    let mut reclose_rounds = 0;

    loop {
        let step = fault.step(imbalance(&fault), &priorities, &zone);
        if fault.state == FaultState::Persistent {
            break;
        }
        if step
            .actions
            .iter()
            .any(|a| matches!(a, FaultAction::Restore(nodes) if nodes.contains(&1)))
            && fault.state == FaultState::Suspected
        {
            reclose_rounds += 1;
        }
        assert!(reclose_rounds <= 2, "reclose budget must be bounded");
        if step.redispatch.is_none() && fault.state != FaultState::Persistent {
            panic!("fault chain stalled in {:?}", fault.state);
        }
    }

    assert_eq!(reclose_rounds, 2);
    assert_eq!(fault.state, FaultState::Persistent);
    // the faulted node stays isolated; the innocent ones were restored
    assert!(fault.faulted.contains(&1));
}

/// The isolation sequence follows the priority order: the least important
/// node is sacrificed first even though it is innocent.
#[test]
fn test_isolation_order_follows_priority() {
    let zone = [0usize, 1, 2];
    let priorities = vec![2usize, 0, 1];

    let mut fault = GroundFault::new(2, 0);
    let first = fault.step(0.4, &priorities, &zone);
    assert_eq!(first.actions, vec![FaultAction::Isolate(2)]);
    let second = fault.step(0.4, &priorities, &zone);
    assert_eq!(second.actions, vec![FaultAction::Isolate(0)]);
}

/// Revising one period's schedule slides every later period while keeping
/// the configured duration, and leaves earlier periods alone.
#[test]
fn test_period_revision_cascades_forward() {
    let start = "2026-03-01T12:00:00Z".parse().unwrap();
    let interval = Duration::seconds(30);
    let mut window = PlanningWindow::new(6, 1, start, interval);

    let revised_start = window.period(3).unwrap().start + Duration::seconds(5);
    let revised_end = revised_start + interval;
    window.reschedule_subsequent(3, revised_start);

    for number in [1u64, 2] {
        let period = window.period(number).unwrap();
        assert_eq!(period.start, start + interval * (number as i32 - 1));
    }
    for number in [3u64, 4, 5, 6] {
        let period = window.period(number).unwrap();
        assert_eq!(
            period.start,
            revised_start + interval * (number as i32 - 3),
            "period {number} did not slide"
        );
        assert_eq!(period.duration(), interval);
    }
    assert_eq!(window.period(3).unwrap().end, revised_end);

    // the shifted tail stays contiguous
    for pair in window.periods[2..].windows(2) {
        assert_eq!(pair[0].end, pair[1].start);
    }
}

/// Shifting the window keeps its length and appends a contiguous tail.
#[test]
fn test_window_shift_preserves_invariants() {
    let start = "2026-03-01T12:00:00Z".parse().unwrap();
    let mut window = PlanningWindow::new(4, 10, start, Duration::seconds(30));

    for _ in 0..5 {
        let tail_end = window.last().unwrap().end;
        let dropped = window.shift().unwrap();
        assert_eq!(window.len(), 4);
        assert_eq!(window.first().unwrap().number, dropped.number + 1);
        assert_eq!(window.last().unwrap().start, tail_end);
        for pair in window.periods.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }
}
