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

//! Market bids and their lifecycle.
//!
//! A bid is identified by `(counterparty, uid)`: the uid is allocated by the
//! originating agent from its own monotonic counter, so two agents can never
//! collide. When a bid travels over the bus the receiving side builds its own
//! copy; only the identity is shared.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BidSide {
    Supply,
    Demand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BidService {
    Power,
    Reserve,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BidStatus {
    Pending,
    Accepted,
    Rejected,
}

/// One side of a proposed trade for a single planning period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bid {
    pub uid: u64,
    pub side: BidSide,
    pub service: BidService,
    /// Power in watts.
    pub amount: f64,
    /// Credits per watt hour.
    pub rate: f64,
    /// The agent on the other side of the trade.
    pub counterparty: String,
    pub period: u64,
    /// Backing resource for supply bids.
    pub resource: Option<String>,
    pub status: BidStatus,
    /// Set when the clearing changed the amount or service.
    pub modified: bool,
}

impl Bid {
    pub fn new(
        uid: u64,
        side: BidSide,
        service: BidService,
        amount: f64,
        rate: f64,
        counterparty: impl Into<String>,
        period: u64,
    ) -> Self {
        Self {
            uid,
            side,
            service,
            amount,
            rate,
            counterparty: counterparty.into(),
            period,
            resource: None,
            status: BidStatus::Pending,
            modified: false,
        }
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn is_pending(&self) -> bool {
        self.status == BidStatus::Pending
    }

    pub fn is_accepted(&self) -> bool {
        self.status == BidStatus::Accepted
    }

    pub fn accept(&mut self) {
        self.status = BidStatus::Accepted;
    }

    /// Accept with the amount cut down by the clearing.
    pub fn accept_modified(&mut self, amount: f64) {
        self.amount = amount;
        self.modified = true;
        self.status = BidStatus::Accepted;
    }

    pub fn reject(&mut self) {
        self.status = BidStatus::Rejected;
    }
}

/// Per-agent monotonic uid source for bids, solicitations, and events.
#[derive(Debug, Default)]
pub struct UidAllocator {
    next: u64,
}

impl UidAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self) -> u64 {
        let uid = self.next;
        self.next += 1;
        uid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bid_lifecycle() {
        let mut bid = Bid::new(3, BidSide::Supply, BidService::Power, 50.0, 3.0, "HOME1", 2);
        assert!(bid.is_pending());

        bid.accept_modified(30.0);
        assert!(bid.is_accepted());
        assert!(bid.modified);
        assert!((bid.amount - 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_uid_allocator_monotonic() {
        let mut uids = UidAllocator::new();
        let first = uids.next();
        let second = uids.next();
        assert!(second > first);
    }
}
