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

pub mod appliance;
pub mod customer;
pub mod device;
pub mod error;
pub mod faults;
pub mod market;
pub mod optimization;
pub mod period;
pub mod plan;
pub mod planner;
pub mod resource;
pub mod topology;

pub use appliance::Appliance;
pub use customer::{CustomerAccount, CustomerProfile};
pub use device::Device;
pub use error::{CoreError, Result};
pub use faults::{FAULT_CURRENT_THRESHOLD, FaultAction, FaultState, FaultStep, GroundFault};
pub use market::{allocate_reserve, clear_power_market};
pub use optimization::{InputSignal, StateComponents, StateGrid, StateGridPoint};
pub use period::{Period, PlanningWindow};
pub use plan::{BidManager, DeviceDisposition, Disposition, DispositionMode, Plan};
pub use planner::{OfferOutcome, PlannerContext};
pub use resource::{Channel, Resource, ResourceKind, TagCommand, TagCommandValue, ratecalc};
pub use topology::{Edge, GridModel, Group, Node, Relay, Zone};
