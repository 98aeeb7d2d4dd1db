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

//! End-to-end clearing scenarios: a single home served by one source, a
//! partial fill at the rate crossing, and reserve trimming against the
//! worst-case group load.

use gridflow_core::{allocate_reserve, clear_power_market};
use gridflow_types::bid::{Bid, BidService, BidSide, BidStatus};

fn supply(uid: u64, from: &str, amount: f64, rate: f64) -> Bid {
    Bid::new(uid, BidSide::Supply, BidService::Power, amount, rate, from, 1)
}

fn demand(uid: u64, from: &str, amount: f64, rate: f64) -> Bid {
    Bid::new(uid, BidSide::Demand, BidService::Power, amount, rate, from, 1)
}

fn reserve(uid: u64, from: &str, amount: f64, rate: f64) -> Bid {
    Bid::new(uid, BidSide::Supply, BidService::Reserve, amount, rate, from, 1)
}

fn accepted_total(bids: &[Bid]) -> f64 {
    bids.iter().filter(|b| b.is_accepted()).map(|b| b.amount).sum()
}

/// One home drawing its reference load against a single utility source:
/// the demand clears in full and only the matched slice of the source's
/// offer is committed.
#[test]
fn test_single_home_against_one_source() {
    let mut supply_book = vec![supply(1, "ENERCON", 100.0, 5.0)];
    let mut demand_book = vec![demand(10, "HOME1", 40.0, 6.0)];

    let rate = clear_power_market(&mut supply_book, &mut demand_book).unwrap();

    assert!(demand_book[0].is_accepted());
    assert!(!demand_book[0].modified);
    assert!(supply_book[0].is_accepted());
    assert!(supply_book[0].modified);
    assert!((supply_book[0].amount - 40.0).abs() < 1e-9);
    assert!((rate - 6.0).abs() < 1e-9);
    assert!((accepted_total(&supply_book) - accepted_total(&demand_book)).abs() < 1e-9);
}

/// Two offers on each side with the books crossing mid-bid: the open
/// supply bid keeps only its matched portion and the out-of-money tail of
/// both books is rejected.
#[test]
fn test_partial_fill_when_books_cross() {
    let mut supply_book = vec![
        supply(1, "HOME2", 50.0, 3.0),
        supply(2, "ENERCON", 30.0, 4.0),
    ];
    let mut demand_book = vec![
        demand(10, "HOME1", 60.0, 5.0),
        demand(11, "HOME3", 30.0, 2.0),
    ];

    let rate = clear_power_market(&mut supply_book, &mut demand_book).unwrap();

    // accepted: 50 W @ 3 plus 10 W carved out of the 30 W @ 4 offer
    assert!(supply_book[0].is_accepted() && !supply_book[0].modified);
    assert!(supply_book[1].is_accepted() && supply_book[1].modified);
    assert!((supply_book[1].amount - 10.0).abs() < 1e-9);

    // accepted demand: the 60 W bid in full; the 30 W @ 2 bid is out of money
    assert!(demand_book[0].is_accepted() && !demand_book[0].modified);
    assert_eq!(demand_book[1].status, BidStatus::Rejected);

    assert!((rate - 5.0).abs() < 1e-9);

    // conservation: both sides of the matched book agree
    assert!((accepted_total(&supply_book) - 60.0).abs() < 1e-9);
    assert!((accepted_total(&demand_book) - 60.0).abs() < 1e-9);

    // monotonicity: no accepted supply is dearer than any accepted demand
    let max_supply_rate = supply_book
        .iter()
        .filter(|b| b.is_accepted())
        .map(|b| b.rate)
        .fold(f64::NEG_INFINITY, f64::max);
    let min_demand_rate = demand_book
        .iter()
        .filter(|b| b.is_accepted())
        .map(|b| b.rate)
        .fold(f64::INFINITY, f64::min);
    assert!(max_supply_rate <= min_demand_rate);
}

/// Reserve allocation walks the book cheapest-first and trims exactly one
/// bid so that accepted demand plus reserves covers the worst-case load.
#[test]
fn test_reserve_allocation_trims_final_bid() {
    let max_load = 120.0;
    let accepted_demand = 60.0;
    let mut reserve_book = vec![
        reserve(1, "HOME1", 25.0, 1.0),
        reserve(2, "HOME2", 25.0, 2.0),
        reserve(3, "HOME3", 25.0, 3.0),
    ];

    allocate_reserve(&mut reserve_book, max_load - accepted_demand);

    assert!(reserve_book.iter().all(Bid::is_accepted));
    assert!(!reserve_book[0].modified);
    assert!(!reserve_book[1].modified);
    assert!(reserve_book[2].modified);
    assert!((reserve_book[2].amount - 10.0).abs() < 1e-9);

    // coverage: demand + reserves meet the worst case, one bid trimmed
    assert!(accepted_demand + accepted_total(&reserve_book) >= max_load);
    assert_eq!(reserve_book.iter().filter(|b| b.modified).count(), 1);
}

/// The reserve pass never reorders equal-rate bids out of arrival order.
#[test]
fn test_reserve_fifo_on_equal_rates() {
    let mut reserve_book = vec![
        reserve(7, "HOME1", 30.0, 1.0),
        reserve(8, "HOME2", 30.0, 1.0),
    ];
    allocate_reserve(&mut reserve_book, 30.0);

    assert!(reserve_book.iter().find(|b| b.uid == 7).unwrap().is_accepted());
    assert_eq!(
        reserve_book.iter().find(|b| b.uid == 8).unwrap().status,
        BidStatus::Rejected
    );
}

/// Conservation holds across a messier book with several partial carries.
#[test]
fn test_matched_books_balance() {
    let mut supply_book = vec![
        supply(1, "A", 15.0, 1.0),
        supply(2, "B", 35.0, 2.0),
        supply(3, "C", 25.0, 3.5),
        supply(4, "D", 40.0, 7.0),
    ];
    let mut demand_book = vec![
        demand(10, "E", 28.0, 6.0),
        demand(11, "F", 22.0, 5.0),
        demand(12, "G", 31.0, 4.0),
        demand(13, "H", 10.0, 0.5),
    ];

    clear_power_market(&mut supply_book, &mut demand_book);

    let supply_total = accepted_total(&supply_book);
    let demand_total = accepted_total(&demand_book);
    assert!(
        (supply_total - demand_total).abs() < 1e-9,
        "matched supply {supply_total} != matched demand {demand_total}"
    );
    // at most one modified bid per side
    assert!(supply_book.iter().filter(|b| b.modified).count() <= 1);
    assert!(demand_book.iter().filter(|b| b.modified).count() <= 1);
}
