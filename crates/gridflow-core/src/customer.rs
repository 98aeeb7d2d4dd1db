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

//! The utility's view of an enrolled customer.

use anyhow::Result;
use gridflow_types::config::{Location, ResourceConfig};
use gridflow_types::messages::CustomerClass;

/// Credit ledger for one customer.
#[derive(Debug, Clone, Default)]
pub struct CustomerAccount {
    pub balance: f64,
}

impl CustomerAccount {
    pub fn adjust(&mut self, amount: f64) {
        self.balance += amount;
    }
}

/// One enrolled customer, with the grid attachment derived from its
/// location and the flags the market and DR programs operate on.
#[derive(Debug, Clone)]
pub struct CustomerProfile {
    pub name: String,
    pub location: String,
    pub class: CustomerClass,
    pub resources: Vec<ResourceConfig>,
    /// Importance weight used for fault-isolation priority.
    pub priority: f64,
    /// Multiplier applied to the group rate when billing.
    pub rate_adjustment: f64,
    /// Worst-case draw in watts, counted into the group's reserve target.
    pub max_draw: f64,
    /// Whether the last clearing allows this customer to connect its load.
    pub permission: bool,
    pub dr_enrollee: bool,
    pub account: CustomerAccount,
    /// `grid.branch.bus` path of the owning topology node.
    pub node_path: String,
    pub relay_tag: String,
    pub current_tag: String,
}

impl CustomerProfile {
    pub fn new(
        name: impl Into<String>,
        location: &str,
        resources: Vec<ResourceConfig>,
        class: CustomerClass,
    ) -> Result<Self> {
        let parsed = Location::parse(location)?;
        let branch = parsed.branch_number()?;
        let bus = parsed.bus_number()?;
        let load = parsed.load_number()?;
        let (priority, max_draw) = match class {
            CustomerClass::Residential => (2.0, 100.0),
            CustomerClass::Commercial => (5.0, 500.0),
        };
        Ok(Self {
            name: name.into(),
            location: location.to_owned(),
            class,
            resources,
            priority,
            rate_adjustment: 1.0,
            max_draw,
            permission: false,
            dr_enrollee: false,
            account: CustomerAccount::default(),
            node_path: parsed.node_path(),
            relay_tag: format!("BRANCH_{branch}_BUS_{bus}_LOAD_{load}_User"),
            current_tag: format!("BRANCH_{branch}_BUS_{bus}_LOAD_{load}_Current"),
        })
    }
}

/// Find a customer by name.
pub fn lookup<'a>(customers: &'a [CustomerProfile], name: &str) -> Option<&'a CustomerProfile> {
    customers.iter().find(|cust| cust.name == name)
}

pub fn lookup_mut<'a>(
    customers: &'a mut [CustomerProfile],
    name: &str,
) -> Option<&'a mut CustomerProfile> {
    customers.iter_mut().find(|cust| cust.name == name)
}
