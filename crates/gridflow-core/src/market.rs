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

//! Two-sided market clearing for one group and one period.
//!
//! Supply is sorted cheapest-first, demand dearest-first, and the books are
//! merged with two pointers. A bid consumed in part carries its remainder
//! (`qrem`) into the next iteration; when the rates cross, the bid that is
//! still partially open is accepted for its matched portion and everything
//! after it is rejected. Reserves form a separate book cleared afterwards
//! against the worst-case group load.

use gridflow_types::bid::Bid;
use tracing::debug;

/// Which side carries an unmatched remainder into the next iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Carry {
    None,
    Supply,
    Demand,
}

/// Clear the power books against each other. Bids are mutated in place:
/// accepted, rejected, or accepted with a reduced amount and `modified`
/// set. Returns the group clearing rate: the rate of the last demand bid
/// matched before the books crossed, or `None` when nothing matched.
///
/// Equal rates on one side clear in insertion order.
pub fn clear_power_market(supply: &mut [Bid], demand: &mut [Bid]) -> Option<f64> {
    supply.sort_by(|a, b| a.rate.total_cmp(&b.rate));
    demand.sort_by(|a, b| b.rate.total_cmp(&a.rate));

    let mut rate = None;
    let mut qrem = 0.0;
    let mut carry = Carry::None;
    let mut si = 0;
    let mut di = 0;

    while si < supply.len() && di < demand.len() {
        if demand[di].rate > supply[si].rate {
            rate = Some(demand[di].rate);
            // open amounts on each side for this iteration
            let open_supply = if carry == Carry::Supply { qrem } else { supply[si].amount };
            let open_demand = if carry == Carry::Demand { qrem } else { demand[di].amount };

            debug!(
                "matching supply #{} ({} W open) against demand #{} ({} W open)",
                supply[si].uid, open_supply, demand[di].uid, open_demand
            );

            if open_supply > open_demand {
                qrem = open_supply - open_demand;
                carry = Carry::Supply;
                demand[di].accept();
                di += 1;
            } else if open_supply < open_demand {
                qrem = open_demand - open_supply;
                carry = Carry::Demand;
                supply[si].accept();
                si += 1;
            } else {
                qrem = 0.0;
                carry = Carry::None;
                supply[si].accept();
                demand[di].accept();
                si += 1;
                di += 1;
            }
        } else {
            debug!(
                "books crossed: demand rate {} <= supply rate {}",
                demand[di].rate, supply[si].rate
            );
            match carry {
                Carry::Supply => {
                    // the open supply bid keeps its matched portion
                    let matched = supply[si].amount - qrem;
                    supply[si].accept_modified(matched);
                    demand[di].reject();
                }
                Carry::Demand => {
                    let matched = demand[di].amount - qrem;
                    demand[di].accept_modified(matched);
                    supply[si].reject();
                }
                Carry::None => {
                    supply[si].reject();
                    demand[di].reject();
                }
            }
            carry = Carry::None;
            qrem = 0.0;
            si += 1;
            di += 1;
        }
    }

    // one book ran out; settle the partially open bid and reject the rest
    while si < supply.len() {
        if carry == Carry::Supply {
            let matched = supply[si].amount - qrem;
            supply[si].accept_modified(matched);
            carry = Carry::None;
        } else {
            supply[si].reject();
        }
        si += 1;
    }
    while di < demand.len() {
        if carry == Carry::Demand {
            let matched = demand[di].amount - qrem;
            demand[di].accept_modified(matched);
            carry = Carry::None;
        } else {
            demand[di].reject();
        }
        di += 1;
    }

    rate
}

/// Allocate reserves cheapest-first until `required` watts are covered.
/// The bid that would overshoot is trimmed to meet the requirement exactly;
/// later bids are rejected.
pub fn allocate_reserve(reserve: &mut [Bid], required: f64) {
    reserve.sort_by(|a, b| a.rate.total_cmp(&b.rate));

    let mut total = 0.0;
    for bid in reserve.iter_mut() {
        if total >= required {
            bid.reject();
            continue;
        }
        if total + bid.amount > required {
            bid.accept_modified(required - total);
            total = required;
        } else {
            total += bid.amount;
            bid.accept();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridflow_types::bid::{BidService, BidSide, BidStatus};

    fn supply(uid: u64, amount: f64, rate: f64) -> Bid {
        Bid::new(uid, BidSide::Supply, BidService::Power, amount, rate, "seller", 1)
    }

    fn demand(uid: u64, amount: f64, rate: f64) -> Bid {
        Bid::new(uid, BidSide::Demand, BidService::Power, amount, rate, "buyer", 1)
    }

    fn reserve(uid: u64, amount: f64, rate: f64) -> Bid {
        Bid::new(uid, BidSide::Supply, BidService::Reserve, amount, rate, "seller", 1)
    }

    fn accepted_total(bids: &[Bid]) -> f64 {
        bids.iter().filter(|b| b.is_accepted()).map(|b| b.amount).sum()
    }

    #[test]
    fn test_partial_fill_at_crossing() {
        let mut supply_book = vec![supply(1, 50.0, 3.0), supply(2, 30.0, 4.0)];
        let mut demand_book = vec![demand(10, 60.0, 5.0), demand(11, 30.0, 2.0)];

        let rate = clear_power_market(&mut supply_book, &mut demand_book);

        assert_eq!(rate, Some(5.0));
        // 50 W @ 3 fully accepted, 10 W of the 30 W @ 4 bid
        assert!(supply_book[0].is_accepted() && !supply_book[0].modified);
        assert!(supply_book[1].is_accepted() && supply_book[1].modified);
        assert!((supply_book[1].amount - 10.0).abs() < 1e-9);
        // demand 60 @ 5 accepted in full; 30 @ 2 rejected
        assert!(demand_book[0].is_accepted() && !demand_book[0].modified);
        assert_eq!(demand_book[1].status, BidStatus::Rejected);
        // conservation of the matched portion
        assert!((accepted_total(&supply_book) - accepted_total(&demand_book)).abs() < 1e-9);
    }

    #[test]
    fn test_exact_match_accepts_both_sides() {
        let mut supply_book = vec![supply(1, 40.0, 2.0)];
        let mut demand_book = vec![demand(10, 40.0, 5.0)];

        let rate = clear_power_market(&mut supply_book, &mut demand_book);

        assert_eq!(rate, Some(5.0));
        assert!(supply_book[0].is_accepted() && !supply_book[0].modified);
        assert!(demand_book[0].is_accepted());
    }

    #[test]
    fn test_demand_exceeding_supply_is_trimmed() {
        let mut supply_book = vec![supply(1, 40.0, 2.0)];
        let mut demand_book = vec![demand(10, 100.0, 5.0)];

        clear_power_market(&mut supply_book, &mut demand_book);

        assert!(demand_book[0].is_accepted() && demand_book[0].modified);
        assert!((demand_book[0].amount - 40.0).abs() < 1e-9);
        assert!((accepted_total(&supply_book) - accepted_total(&demand_book)).abs() < 1e-9);
    }

    #[test]
    fn test_no_crossed_acceptances() {
        let mut supply_book = vec![supply(1, 20.0, 1.0), supply(2, 20.0, 4.0), supply(3, 20.0, 6.0)];
        let mut demand_book = vec![demand(10, 25.0, 5.0), demand(11, 25.0, 3.0), demand(12, 25.0, 0.5)];

        clear_power_market(&mut supply_book, &mut demand_book);

        let max_supply = supply_book
            .iter()
            .filter(|b| b.is_accepted())
            .map(|b| b.rate)
            .fold(f64::NEG_INFINITY, f64::max);
        let min_demand = demand_book
            .iter()
            .filter(|b| b.is_accepted())
            .map(|b| b.rate)
            .fold(f64::INFINITY, f64::min);
        assert!(max_supply <= min_demand);
    }

    #[test]
    fn test_equal_rates_clear_in_insertion_order() {
        let mut supply_book = vec![supply(1, 30.0, 2.0), supply(2, 30.0, 2.0)];
        let mut demand_book = vec![demand(10, 30.0, 5.0)];

        clear_power_market(&mut supply_book, &mut demand_book);

        assert!(supply_book.iter().find(|b| b.uid == 1).unwrap().is_accepted());
        assert_eq!(
            supply_book.iter().find(|b| b.uid == 2).unwrap().status,
            BidStatus::Rejected
        );
    }

    #[test]
    fn test_empty_books_clear_to_no_rate() {
        let mut supply_book: Vec<Bid> = Vec::new();
        let mut demand_book = vec![demand(10, 30.0, 5.0)];
        assert_eq!(clear_power_market(&mut supply_book, &mut demand_book), None);
        assert_eq!(demand_book[0].status, BidStatus::Rejected);
    }

    #[test]
    fn test_reserve_trim_meets_requirement_exactly() {
        let mut book = vec![reserve(1, 25.0, 1.0), reserve(2, 25.0, 2.0), reserve(3, 25.0, 3.0)];

        allocate_reserve(&mut book, 60.0);

        assert!(book[0].is_accepted() && !book[0].modified);
        assert!(book[1].is_accepted() && !book[1].modified);
        assert!(book[2].is_accepted() && book[2].modified);
        assert!((book[2].amount - 10.0).abs() < 1e-9);
        assert!((accepted_total(&book) - 60.0).abs() < 1e-9);
        // exactly one bid trimmed
        assert_eq!(book.iter().filter(|b| b.modified).count(), 1);
    }

    #[test]
    fn test_reserve_surplus_is_rejected() {
        let mut book = vec![reserve(1, 50.0, 1.0), reserve(2, 25.0, 2.0)];

        allocate_reserve(&mut book, 40.0);

        assert!(book[0].is_accepted());
        // second bid trimmed rather than rejected, requirement met exactly
        assert!(book[1].is_accepted() && book[1].modified);
        assert!((accepted_total(&book) - 40.0).abs() < 1e-9);

        let mut book = vec![reserve(1, 50.0, 1.0), reserve(2, 25.0, 2.0)];
        allocate_reserve(&mut book, 50.0);
        assert!(book[0].is_accepted());
        assert_eq!(book[1].status, BidStatus::Rejected);
    }
}
