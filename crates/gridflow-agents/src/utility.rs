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

//! The utility agent: grid owner and market maker. It enrolls customers,
//! clears the two-sided auction every period, actuates its own resources,
//! and supervises the grid for ground faults and brownouts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use gridflow_adapters::{CachedTagClient, TagValue};
use gridflow_core::customer::{self, CustomerProfile};
use gridflow_core::resource::{ResourceKind, TagCommand, TagCommandValue, ratecalc};
use gridflow_core::{
    FAULT_CURRENT_THRESHOLD, FaultAction, GridModel, GroundFault, Group, Period, Resource, Zone,
    allocate_reserve, clear_power_market,
};
use gridflow_types::bid::{Bid, BidService, BidSide, UidAllocator};
use gridflow_types::config::{Location, Settings, UtilityConfig};
use gridflow_types::forecast::{Forecast, WeatherVariable};
use gridflow_types::messages::{
    Announcement, BidAcceptance, BidRejection, BidResponse, BidSolicitation, Body,
    CustomerEnrollment, DrEnrollment, Envelope, MessageTarget, Topic,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bus::Bus;
use crate::timers::{self, TimerHandle};

/// Droop slope commanded for reserve commitments.
const RESERVE_DROOP: f64 = -0.2;
/// Nominal DC bus voltage assumed when a measurement is missing.
const NOMINAL_VOLTAGE: f64 = 12.0;
/// Fixed power block a utility battery offers each period.
const BATTERY_BID_BLOCK_W: f64 = 10.0;

/// Which bids the utility is currently willing to book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BidPolicy {
    AcceptAll,
    ReserveOnly,
    AcceptNone,
}

impl BidPolicy {
    fn admits(self, side: BidSide, service: BidService) -> bool {
        match self {
            Self::AcceptAll => true,
            Self::ReserveOnly => side == BidSide::Supply && service == BidService::Reserve,
            Self::AcceptNone => false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum UtilityEvent {
    Bus(Topic, Arc<str>),
    AdvancePeriod,
    AnnouncePeriod,
    ClearMarket,
    AccountUpdate,
    FaultDetector,
    CorrectVoltage,
    DrEnrollment,
    DiscoverCustomers,
    FaultStep(u64),
}

pub struct UtilityAgent {
    name: String,
    settings: Settings,
    bus: Bus,
    plc: Arc<CachedTagClient>,
    resources: Vec<Resource>,
    grid: GridModel,
    groups: Vec<Group>,
    customers: Vec<CustomerProfile>,
    supply_bids: Vec<Bid>,
    demand_bids: Vec<Bid>,
    reserve_bids: Vec<Bid>,
    bid_policy: BidPolicy,
    current_period: Period,
    next_period: Period,
    uids: UidAllocator,
    faults: Vec<GroundFault>,
    advance_timer: Option<TimerHandle>,
    clear_timer: Option<TimerHandle>,
    perceived_insol: f64,
    avg_energy_cost: f64,
    events_tx: mpsc::UnboundedSender<UtilityEvent>,
}

impl UtilityAgent {
    pub fn new(
        config: UtilityConfig,
        bus: Bus,
        plc: Arc<CachedTagClient>,
    ) -> (Self, mpsc::UnboundedReceiver<UtilityEvent>) {
        let settings = config.settings.clone();
        let increment = Duration::milliseconds((settings.st_plan_interval * 1000.0) as i64);
        let now = chrono::Utc::now();
        let current_period = Period::new(0, now, now + increment);
        let next_period = Period::new(1, current_period.end, current_period.end + increment);

        let mut grid = default_grid();
        let resources: Vec<Resource> = config.resources.iter().map(Resource::from_config).collect();
        for res in &resources {
            if let Some(node) = grid.node_by_path(&res.location) {
                grid.nodes[node].resources.push(res.name.clone());
            }
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                name: config.name,
                settings,
                bus,
                plc,
                resources,
                grid,
                groups: Vec::new(),
                customers: Vec::new(),
                supply_bids: Vec::new(),
                demand_bids: Vec::new(),
                reserve_bids: Vec::new(),
                bid_policy: BidPolicy::AcceptNone,
                current_period,
                next_period,
                uids: UidAllocator::new(),
                faults: Vec::new(),
                advance_timer: None,
                clear_timer: None,
                perceived_insol: 75.0,
                avg_energy_cost: 1.0,
                events_tx,
            },
            events_rx,
        )
    }

    pub fn events(&self) -> mpsc::UnboundedSender<UtilityEvent> {
        self.events_tx.clone()
    }

    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<UtilityEvent>) {
        info!("utility agent {} starting", self.name);

        for topic in [
            Topic::EnergyMarket,
            Topic::CustomerService,
            Topic::DemandResponse,
            Topic::WeatherService,
        ] {
            let mut sub = self.bus.subscribe(topic);
            let tx = self.events_tx.clone();
            tokio::spawn(async move {
                while let Some(raw) = sub.recv().await {
                    if tx.send(UtilityEvent::Bus(topic, raw)).is_err() {
                        break;
                    }
                }
            });
        }

        let periodics = [
            (self.settings.announce_period_interval, UtilityEvent::AnnouncePeriod),
            (self.settings.accounting_interval, UtilityEvent::AccountUpdate),
            (self.settings.fault_detection_interval, UtilityEvent::FaultDetector),
            (self.settings.secondary_voltage_interval, UtilityEvent::CorrectVoltage),
            (self.settings.dr_solicitation_interval, UtilityEvent::DrEnrollment),
            (
                self.settings.customer_solicitation_interval,
                UtilityEvent::DiscoverCustomers,
            ),
        ];
        for (interval_secs, event) in periodics {
            timers::every(
                self.events_tx.clone(),
                StdDuration::from_millis((interval_secs * 1000.0) as u64),
                event,
            );
        }

        // find customers straight away, then follow the period schedule
        let _ = self.events_tx.send(UtilityEvent::DiscoverCustomers);
        self.advance_timer = Some(timers::schedule_at(
            self.events_tx.clone(),
            self.next_period.start,
            UtilityEvent::AdvancePeriod,
        ));

        while let Some(event) = events.recv().await {
            match event {
                UtilityEvent::Bus(topic, raw) => self.handle_bus(topic, &raw).await,
                UtilityEvent::AdvancePeriod => self.advance_period().await,
                UtilityEvent::AnnouncePeriod => self.announce_period(),
                UtilityEvent::ClearMarket => self.clear_market(),
                UtilityEvent::AccountUpdate => self.account_update().await,
                UtilityEvent::FaultDetector => self.fault_detector().await,
                UtilityEvent::CorrectVoltage => self.correct_voltage().await,
                UtilityEvent::DrEnrollment => self.dr_enrollment(),
                UtilityEvent::DiscoverCustomers => self.discover_customers(),
                UtilityEvent::FaultStep(uid) => self.fault_step(uid).await,
            }
        }
    }

    async fn handle_bus(&mut self, topic: Topic, raw: &str) {
        let envelope: Envelope = match serde_json::from_str(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!("{} discarding malformed {topic:?} message: {err}", self.name);
                return;
            }
        };
        if !envelope.message_target.includes(&self.name) {
            return;
        }
        let sender = envelope.message_sender.clone();

        match envelope.body {
            Body::BidResponse(response) => self.on_bid_response(&sender, &response),
            Body::CustomerEnrollment(enrollment) => self.on_enrollment(&sender, enrollment),
            Body::RequestConnection => self.on_connection_request(&sender).await,
            Body::DrEnrollment(enrollment) => self.on_dr_enrollment_reply(&sender, &enrollment),
            Body::DrEvent(event) => {
                debug!(
                    "{} noted DR event {} response from {sender}: opt_in={:?}",
                    self.name, event.event_id, event.opt_in
                );
            }
            Body::Nowcast(nowcast) => {
                let forecast = Forecast::from_readings(&nowcast.readings);
                if let Some(insol) = forecast.get(WeatherVariable::SolarIrradiance) {
                    self.perceived_insol = insol;
                }
            }
            Body::BidSolicitation(_)
            | Body::BidAcceptance(_)
            | Body::BidRejection(_)
            | Body::Announcement(_)
            | Body::RateAnnouncement(_)
            | Body::Forecast(_)
            | Body::FregEnrollment(_)
            | Body::FregSignal(_) => {}
        }
    }

    fn on_bid_response(&mut self, sender: &str, response: &BidResponse) {
        let service = response.service.unwrap_or(BidService::Power);
        if !self.bid_policy.admits(response.side, service) {
            // bids landing after the clearing commit are silently ignored
            debug!("{} ignoring late bid #{} from {sender}", self.name, response.uid);
            return;
        }
        let mut bid = Bid::new(
            response.uid,
            response.side,
            service,
            response.amount,
            response.rate,
            sender,
            response.period,
        );
        if let Some(resource) = &response.resource {
            bid = bid.with_resource(resource.clone());
        }
        info!(
            "{} received {:?}/{:?} bid #{} from {sender}: {} W @ {}",
            self.name, response.side, service, response.uid, response.amount, response.rate
        );
        match (response.side, service) {
            (BidSide::Supply, BidService::Power) => self.supply_bids.push(bid),
            (BidSide::Supply, BidService::Reserve) => self.reserve_bids.push(bid),
            (BidSide::Demand, _) => self.demand_bids.push(bid),
        }
    }

    fn on_enrollment(&mut self, sender: &str, enrollment: CustomerEnrollment) {
        let CustomerEnrollment::NewCustomerResponse { info } = enrollment else {
            return;
        };
        let profile = match CustomerProfile::new(
            info.name().to_owned(),
            info.location(),
            info.resources().to_vec(),
            info.class(),
        ) {
            Ok(profile) => profile,
            Err(err) => {
                warn!("{} rejecting malformed enrollment from {sender}: {err}", self.name);
                return;
            }
        };

        if customer::lookup(&self.customers, &profile.name).is_some() {
            debug!("{} re-enrolling existing customer {}", self.name, profile.name);
            self.customers.retain(|cust| cust.name != profile.name);
        }

        match self.grid.node_by_path(&profile.node_path) {
            Some(node) => {
                self.grid.nodes[node].customers.push(profile.name.clone());
                self.grid.nodes[node].customer_priority += profile.priority;
                self.grid.nodes[node]
                    .load_current_tags
                    .push(profile.current_tag.clone());
                for resource in &profile.resources {
                    if let Ok(loc) = Location::parse(&resource.location) {
                        if let Some(res_node) = self.grid.node_by_path(&loc.node_path()) {
                            self.grid.nodes[res_node].resources.push(resource.name.clone());
                        }
                    }
                }
            }
            None => {
                warn!(
                    "{} enrolled customer {} at unknown node {}",
                    self.name, profile.name, profile.node_path
                );
            }
        }

        info!("{} enrolled customer {} at {}", self.name, profile.name, profile.location);
        let name = profile.name.clone();
        self.customers.push(profile);
        self.publish(
            Topic::CustomerService,
            &name,
            Body::CustomerEnrollment(CustomerEnrollment::NewCustomerConfirm),
        );
    }

    /// The utility has the final say on whether a load connects.
    async fn on_connection_request(&mut self, sender: &str) {
        let Some(cust) = customer::lookup(&self.customers, sender) else {
            debug!("{} ignoring connection request from stranger {sender}", self.name);
            return;
        };
        if cust.permission {
            info!("{} granting {sender} connection", self.name);
            let write = [(cust.relay_tag.clone(), TagValue::Bool(true))];
            if let Err(err) = self.plc.write(&write).await {
                warn!("{} could not close {sender}'s relay: {err}", self.name);
            }
        } else {
            info!("{} denying {sender} connection", self.name);
        }
    }

    fn on_dr_enrollment_reply(&mut self, sender: &str, enrollment: &DrEnrollment) {
        let DrEnrollment::EnrollmentReply { opt_in } = enrollment else {
            return;
        };
        if !opt_in {
            return;
        }
        if let Some(cust) = customer::lookup_mut(&mut self.customers, sender) {
            cust.dr_enrollee = true;
            self.publish(
                Topic::DemandResponse,
                sender,
                Body::DrEnrollment(DrEnrollment::EnrollmentConfirm),
            );
            info!("{} enrolled {sender} in the DR program", self.name);
        }
    }

    /// Period boundary: enact the cleared plan and open the next auction.
    async fn advance_period(&mut self) {
        self.bid_policy = BidPolicy::AcceptNone;
        let increment = Duration::milliseconds((self.settings.st_plan_interval * 1000.0) as i64);
        self.current_period = std::mem::take(&mut self.next_period);
        self.next_period = Period::new(
            self.current_period.number + 1,
            self.current_period.end,
            self.current_period.end + increment,
        );
        info!("{} moving into period {}", self.name, self.current_period.number);

        self.enact_plan().await;
        self.solicit_bids().await;

        if let Some(timer) = self.advance_timer.take() {
            timer.cancel();
        }
        self.advance_timer = Some(timers::schedule_at(
            self.events_tx.clone(),
            self.next_period.start,
            UtilityEvent::AdvancePeriod,
        ));
        self.announce_period();
    }

    /// Push the accepted commitments onto our own converter channels; any
    /// resource the plan no longer references is disconnected.
    async fn enact_plan(&mut self) {
        let own_bids = self.current_period.plan.own_bids.clone();
        let mut involved: Vec<String> = Vec::new();
        let mut writes: Vec<TagCommand> = Vec::new();

        for bid in &own_bids {
            let Some(resource_name) = &bid.resource else { continue };
            let Some(res) = self.resources.iter_mut().find(|r| &r.name == resource_name) else {
                continue;
            };
            involved.push(res.name.clone());
            let channel = &mut res.discharge_channel;
            writes.extend(match (channel.connected, bid.service) {
                (true, BidService::Power) => channel.change_setpoint(bid.amount),
                (true, BidService::Reserve) => channel.change_reserve(bid.amount, RESERVE_DROOP),
                (false, BidService::Power) => channel.connect_with_set(bid.amount, 0.0),
                (false, BidService::Reserve) => channel.connect_with_set(bid.amount, RESERVE_DROOP),
            });
            debug!(
                "{} dispatching {} as {:?} at {} W",
                self.name, res.name, bid.service, bid.amount
            );
        }

        for res in &mut self.resources {
            if !involved.contains(&res.name) && res.discharge_channel.connected {
                debug!("{} disconnecting idle resource {}", self.name, res.name);
                writes.extend(res.discharge_channel.disconnect());
            }
        }
        self.apply_tag_commands(&writes).await;
    }

    /// Refresh the topology and ask every group member for bids; clearing
    /// follows once the solicitation window has elapsed.
    async fn solicit_bids(&mut self) {
        self.refresh_topology().await;

        self.supply_bids.clear();
        self.demand_bids.clear();
        self.reserve_bids.clear();
        self.bid_policy = BidPolicy::AcceptAll;

        let period = self.next_period.number;
        let mut solicitations: Vec<(String, BidSide, Option<BidService>)> = Vec::new();
        for group in &self.groups {
            for name in &group.customers {
                solicitations.push((name.clone(), BidSide::Demand, None));
                let has_resources = customer::lookup(&self.customers, name)
                    .map(|cust| !cust.resources.is_empty())
                    .unwrap_or(false);
                if has_resources {
                    solicitations.push((name.clone(), BidSide::Supply, Some(BidService::Power)));
                    solicitations.push((name.clone(), BidSide::Supply, Some(BidService::Reserve)));
                }
            }
        }
        for (target, side, service) in solicitations {
            let solicitation_id = self.uids.next();
            self.publish(
                Topic::EnergyMarket,
                &target,
                Body::BidSolicitation(BidSolicitation {
                    side,
                    service,
                    period,
                    solicitation_id,
                }),
            );
        }

        if let Some(timer) = self.clear_timer.take() {
            timer.cancel();
        }
        self.clear_timer = Some(timers::schedule_after(
            self.events_tx.clone(),
            StdDuration::from_millis((self.settings.bid_window * 1000.0) as u64),
            UtilityEvent::ClearMarket,
        ));
    }

    /// Read the relay states and rebuild the group decomposition. The
    /// relay tags carry inverted sense: a `true` tag means the relay is
    /// held open.
    async fn refresh_topology(&mut self) {
        let tags = self.grid.relay_tags();
        let threshold = StdDuration::from_millis((self.settings.st_plan_interval * 250.0) as u64);
        match self.plc.read_preferred(&tags, threshold).await {
            Ok(values) => {
                for (tag, value) in values {
                    if let Some(open) = value.as_bool() {
                        self.grid.set_relay(&tag, !open);
                    }
                }
            }
            Err(err) => warn!("{} topology refresh failed, using last states: {err}", self.name),
        }
        self.groups = self.grid.rebuild_groups();
        debug!("{} sees {} group(s)", self.name, self.groups.len());
    }

    /// Tender bids for our own resources, then clear each group's books.
    fn clear_market(&mut self) {
        let period = self.next_period.number;
        for res in &self.resources {
            let bid = match &res.kind {
                ResourceKind::SolarPanel {
                    amortization_period, ..
                } => {
                    let amount = res.max_discharge_power * self.perceived_insol / 100.0;
                    let rate = ratecalc(res.cap_cost, 0.05, *amortization_period, 0.2);
                    Bid::new(
                        self.uids.next(),
                        BidSide::Supply,
                        BidService::Power,
                        amount,
                        rate,
                        self.name.clone(),
                        period,
                    )
                    .with_resource(res.name.clone())
                }
                ResourceKind::LeadAcidBattery { cycle_life, .. } => {
                    let amount = BATTERY_BID_BLOCK_W;
                    let rate = ratecalc(res.cap_cost, 0.05, *cycle_life, 0.05)
                        .max(res.cap_cost / cycle_life)
                        + self.avg_energy_cost * amount;
                    Bid::new(
                        self.uids.next(),
                        BidSide::Supply,
                        BidService::Power,
                        amount,
                        rate,
                        self.name.clone(),
                        period,
                    )
                    .with_resource(res.name.clone())
                }
            };
            debug!("{} adding own bid #{} to the book", self.name, bid.uid);
            self.supply_bids.push(bid);
        }

        let groups = std::mem::take(&mut self.groups);
        let mut cleared_groups = Vec::with_capacity(groups.len());
        for mut group in groups {
            self.clear_group(&mut group);
            cleared_groups.push(group);
        }
        self.groups = cleared_groups;
        self.bid_policy = BidPolicy::ReserveOnly;
    }

    /// One group's clearing: power merge, reserve allocation, dispatch.
    fn clear_group(&mut self, group: &mut Group) {
        let member_names: Vec<String> = group.customers.clone();
        let in_group = |bid: &Bid, grid: &GridModel, resources: &[Resource]| -> bool {
            if member_names.contains(&bid.counterparty) {
                return true;
            }
            if bid.counterparty == self.name {
                // our own bids belong with the group holding the resource
                if let Some(resource) = &bid.resource {
                    if let Some(res) = resources.iter().find(|r| &r.name == resource) {
                        if let Some(node) = grid.node_by_path(&res.location) {
                            return group.nodes.contains(&node);
                        }
                    }
                }
                return group.name == "group1";
            }
            false
        };

        let mut supply: Vec<Bid> = self
            .supply_bids
            .iter()
            .filter(|b| in_group(b, &self.grid, &self.resources))
            .cloned()
            .collect();
        let mut demand: Vec<Bid> = self
            .demand_bids
            .iter()
            .filter(|b| in_group(b, &self.grid, &self.resources))
            .cloned()
            .collect();
        let mut reserve: Vec<Bid> = self
            .reserve_bids
            .iter()
            .filter(|b| in_group(b, &self.grid, &self.resources))
            .cloned()
            .collect();

        let max_load: f64 = member_names
            .iter()
            .filter_map(|name| customer::lookup(&self.customers, name))
            .map(|cust| cust.max_draw)
            .sum();
        info!(
            "{} clearing {} ({} supply / {} demand / {} reserve bids, worst-case load {} W)",
            self.name,
            group.name,
            supply.len(),
            demand.len(),
            reserve.len(),
            max_load
        );

        let rate = clear_power_market(&mut supply, &mut demand);
        group.rate = rate;
        let clearing_rate = rate.unwrap_or(self.settings.assumed_rate);

        let accepted_demand: f64 = demand.iter().filter(|b| b.is_accepted()).map(|b| b.amount).sum();
        allocate_reserve(&mut reserve, max_load - accepted_demand);

        for bid in supply.iter().chain(reserve.iter()) {
            if bid.counterparty == self.name {
                if bid.is_accepted() {
                    self.next_period.plan.add_bid(bid.clone());
                }
                continue;
            }
            if bid.is_accepted() {
                self.send_bid_acceptance(bid, clearing_rate);
                self.next_period.plan.add_bid(bid.clone());
            } else {
                self.send_bid_rejection(bid);
            }
        }

        for bid in &demand {
            if bid.is_accepted() {
                self.send_bid_acceptance(bid, clearing_rate);
                self.next_period.plan.add_consumption(bid.clone());
            } else {
                self.send_bid_rejection(bid);
            }
            if let Some(cust) = customer::lookup_mut(&mut self.customers, &bid.counterparty) {
                cust.permission = bid.is_accepted();
            }
        }

        if rate.is_some() {
            for name in &member_names {
                self.publish(
                    Topic::EnergyMarket,
                    name,
                    Body::RateAnnouncement(gridflow_types::messages::RateAnnouncement {
                        period: self.next_period.number,
                        rate: clearing_rate,
                    }),
                );
            }
        }
    }

    fn send_bid_acceptance(&self, bid: &Bid, rate: f64) {
        debug!(
            "{} accepting bid #{} from {} ({} W @ {rate})",
            self.name, bid.uid, bid.counterparty, bid.amount
        );
        let service = match bid.side {
            BidSide::Supply => Some(bid.service),
            BidSide::Demand => None,
        };
        self.publish(
            Topic::EnergyMarket,
            &bid.counterparty,
            Body::BidAcceptance(BidAcceptance {
                side: bid.side,
                service,
                amount: bid.amount,
                rate,
                period: bid.period,
                uid: bid.uid,
            }),
        );
    }

    fn send_bid_rejection(&self, bid: &Bid) {
        debug!("{} rejecting bid #{} from {}", self.name, bid.uid, bid.counterparty);
        self.publish(
            Topic::EnergyMarket,
            &bid.counterparty,
            Body::BidRejection(BidRejection {
                side: bid.side,
                uid: bid.uid,
                period: bid.period,
            }),
        );
    }

    fn announce_period(&self) {
        let envelope = Envelope::broadcast(
            self.name.clone(),
            Body::Announcement(Announcement::PeriodAnnouncement {
                period_number: self.next_period.number,
                start_time: self.next_period.start,
                end_time: self.next_period.end,
            }),
        );
        if let Err(err) = self.bus.publish(Topic::EnergyMarket, &envelope) {
            warn!("{} failed to announce period: {err}", self.name);
        }
    }

    /// Poll consumption and settle account balances at the group rate.
    async fn account_update(&mut self) {
        let interval_hours = self.settings.accounting_interval / 3600.0;
        let mut adjustments: Vec<(String, f64)> = Vec::new();
        for group in &self.groups {
            let Some(rate) = group.rate else { continue };
            for name in &group.customers {
                let Some(cust) = customer::lookup(&self.customers, name) else {
                    continue;
                };
                let tags = vec![cust.current_tag.clone()];
                let Ok(values) = self
                    .plc
                    .read_preferred(&tags, StdDuration::from_secs(2))
                    .await
                else {
                    continue;
                };
                let current = values
                    .get(&cust.current_tag)
                    .and_then(TagValue::as_f64)
                    .unwrap_or(0.0);
                let energy_wh = current * NOMINAL_VOLTAGE * interval_hours;
                adjustments.push((name.clone(), -energy_wh * rate * cust.rate_adjustment));
            }
        }
        for (name, delta) in adjustments {
            if let Some(cust) = customer::lookup_mut(&mut self.customers, &name) {
                cust.account.adjust(delta);
                debug!(
                    "{} adjusted {}'s balance by {delta:.4} to {:.4}",
                    self.name, name, cust.account.balance
                );
            }
        }
    }

    /// Scan for brownouts and zone current imbalances; an imbalance spawns
    /// a fault handler chain for the zone.
    async fn fault_detector(&mut self) {
        let readings = self.read_grid_measurements().await;

        for node in &mut self.grid.nodes {
            let Some(tag) = &node.voltage_tag else { continue };
            let Some(voltage) = readings.get(tag).copied() else {
                continue;
            };
            node.voltage_low = voltage < self.settings.voltage_low_emergency_threshold;
            if node.voltage_low {
                warn!("{} emergency low voltage {voltage} V at {}", self.name, node.name);
            }
        }

        let zones: Vec<(usize, Zone)> = self.grid.zones.iter().cloned().enumerate().collect();
        for (zone_idx, zone) in zones {
            let imbalance = self
                .grid
                .zone_imbalance(&zone, |tag| readings.get(tag).copied());
            if imbalance.abs() <= FAULT_CURRENT_THRESHOLD {
                continue;
            }
            if self.faults.iter().any(|f| f.zone == zone_idx && f.is_active()) {
                continue;
            }
            let uid = self.uids.next();
            warn!(
                "{} probable ground fault in {} (unaccounted {imbalance:.3} A), opening handler {uid}",
                self.name, zone.name
            );
            self.faults.push(GroundFault::new(uid, zone_idx));
            let _ = self.events_tx.send(UtilityEvent::FaultStep(uid));
        }
    }

    /// One step of a fault handler chain.
    async fn fault_step(&mut self, uid: u64) {
        let Some(fault_idx) = self.faults.iter().position(|f| f.uid == uid) else {
            return;
        };
        let zone_idx = self.faults[fault_idx].zone;
        let Some(zone) = self.grid.zones.get(zone_idx).cloned() else {
            return;
        };

        let readings = self.read_grid_measurements().await;
        let imbalance = self
            .grid
            .zone_imbalance(&zone, |tag| readings.get(tag).copied());
        let priorities = self.grid.node_priority_list(&zone);

        let step = self.faults[fault_idx].step(imbalance, &priorities, &zone.nodes);

        let mut writes: Vec<(String, bool)> = Vec::new();
        let mut unlink = false;
        for action in &step.actions {
            match action {
                FaultAction::Isolate(node) => {
                    info!("{} isolating node {}", self.name, self.grid.nodes[*node].name);
                    writes.extend(self.grid.isolation_writes(*node, true));
                    self.grid.nodes[*node].isolated = true;
                }
                FaultAction::Restore(nodes) => {
                    for node in nodes {
                        debug!("{} restoring node {}", self.name, self.grid.nodes[*node].name);
                        writes.extend(self.grid.isolation_writes(*node, false));
                        self.grid.nodes[*node].isolated = false;
                    }
                }
                FaultAction::Unlink => unlink = true,
            }
        }

        if !writes.is_empty() {
            // opening a relay writes true; keep the local model in step
            for (tag, open) in &writes {
                self.grid.set_relay(tag, !open);
            }
            let tag_writes: Vec<(String, TagValue)> = writes
                .into_iter()
                .map(|(tag, open)| (tag, TagValue::Bool(open)))
                .collect();
            if let Err(err) = self.plc.write(&tag_writes).await {
                warn!("{} fault isolation writes failed: {err}", self.name);
            }
        }

        if unlink {
            self.faults.retain(|f| f.uid != uid);
        } else if let Some(delay) = step.redispatch {
            timers::schedule_after(self.events_tx.clone(), delay, UtilityEvent::FaultStep(uid));
        }
    }

    /// Secondary voltage supervision: flag groups drifting out of the
    /// droop-compensation band.
    async fn correct_voltage(&mut self) {
        let readings = self.read_grid_measurements().await;
        for group in &self.groups {
            let mut min_voltage = f64::INFINITY;
            let mut max_voltage = f64::NEG_INFINITY;
            for &node in &group.nodes {
                let Some(tag) = &self.grid.nodes[node].voltage_tag else {
                    continue;
                };
                if let Some(voltage) = readings.get(tag).copied() {
                    min_voltage = min_voltage.min(voltage);
                    max_voltage = max_voltage.max(voltage);
                }
            }
            if min_voltage < self.settings.voltage_band_lower {
                warn!(
                    "{} {} sagging below band: {min_voltage} V",
                    self.name, group.name
                );
            }
            if max_voltage > self.settings.voltage_band_upper {
                warn!("{} {} above band: {max_voltage} V", self.name, group.name);
            }
        }
    }

    /// Issue a demand-response directive to one customer or to everyone.
    pub fn send_dr_event(
        &mut self,
        target: MessageTarget,
        kind: gridflow_types::dr::DrEventKind,
        duration_secs: f64,
    ) {
        let event_id = self.uids.next();
        let envelope = Envelope::new(
            self.name.clone(),
            target,
            Body::DrEvent(gridflow_types::messages::DrEventMessage {
                event_id,
                event_type: Some(kind),
                event_duration: Some(duration_secs),
                opt_in: None,
            }),
        );
        if let Err(err) = self.bus.publish(Topic::DemandResponse, &envelope) {
            warn!("{} failed to issue DR event {event_id}: {err}", self.name);
        }
    }

    fn dr_enrollment(&mut self) {
        let pending: Vec<String> = self
            .customers
            .iter()
            .filter(|cust| !cust.dr_enrollee)
            .map(|cust| cust.name.clone())
            .collect();
        for name in pending {
            self.publish(
                Topic::DemandResponse,
                &name,
                Body::DrEnrollment(DrEnrollment::EnrollmentQuery),
            );
        }
    }

    fn discover_customers(&mut self) {
        let envelope = Envelope::broadcast(
            self.name.clone(),
            Body::CustomerEnrollment(CustomerEnrollment::NewCustomerQuery { rereg: false }),
        );
        if let Err(err) = self.bus.publish(Topic::CustomerService, &envelope) {
            warn!("{} customer discovery failed: {err}", self.name);
        }
    }

    /// Batch-read every measurement the supervisors need this tick.
    async fn read_grid_measurements(&self) -> HashMap<String, f64> {
        let mut tags: Vec<String> = Vec::new();
        for edge in &self.grid.edges {
            if let Some(tag) = &edge.current_tag {
                tags.push(tag.clone());
            }
        }
        for node in &self.grid.nodes {
            tags.extend(node.load_current_tags.iter().cloned());
            if let Some(tag) = &node.voltage_tag {
                tags.push(tag.clone());
            }
        }
        match self
            .plc
            .read_preferred(&tags, StdDuration::from_millis(50))
            .await
        {
            Ok(values) => values
                .into_iter()
                .filter_map(|(tag, value)| value.as_f64().map(|v| (tag, v)))
                .collect(),
            Err(err) => {
                warn!("{} measurement sweep failed: {err}", self.name);
                HashMap::new()
            }
        }
    }

    async fn apply_tag_commands(&self, commands: &[TagCommand]) {
        if commands.is_empty() {
            return;
        }
        let writes: Vec<(String, TagValue)> = commands
            .iter()
            .map(|cmd| {
                let value = match cmd.value {
                    TagCommandValue::Bool(b) => TagValue::Bool(b),
                    TagCommandValue::Float(f) => TagValue::Float(f),
                };
                (cmd.tag.clone(), value)
            })
            .collect();
        if let Err(err) = self.plc.write(&writes).await {
            warn!("{} tag write failed: {err}", self.name);
        }
    }

    fn publish(&self, topic: Topic, target: &str, body: Body) {
        let envelope = Envelope::new(
            self.name.clone(),
            MessageTarget::Agent(target.to_owned()),
            body,
        );
        if let Err(err) = self.bus.publish(topic, &envelope) {
            warn!("{} failed to publish to {topic:?}: {err}", self.name);
        }
    }
}

/// The a-priori infrastructure model: a main bus feeding two branches of
/// two buses each, tied together by two interconnects.
pub fn default_grid() -> GridModel {
    let mut grid = GridModel::default();

    let main = grid.add_node("DC.MAIN.MAIN");
    let b1_bus1 = grid.add_node("DC.BRANCH1.BUS1");
    let b1_bus2 = grid.add_node("DC.BRANCH1.BUS2");
    let b2_bus1 = grid.add_node("DC.BRANCH2.BUS1");
    let b2_bus2 = grid.add_node("DC.BRANCH2.BUS2");
    let b1_int1 = grid.add_node("DC.BRANCH1.INT1");
    let b1_int2 = grid.add_node("DC.BRANCH1.INT2");
    let b2_int1 = grid.add_node("DC.BRANCH2.INT1");
    let b2_int2 = grid.add_node("DC.BRANCH2.INT2");

    grid.nodes[b1_bus1].voltage_tag = Some("BRANCH_1_BUS_1_Voltage".to_owned());
    grid.nodes[b1_bus2].voltage_tag = Some("BRANCH_1_BUS_2_Voltage".to_owned());
    grid.nodes[b2_bus1].voltage_tag = Some("BRANCH_2_BUS_1_Voltage".to_owned());
    grid.nodes[b2_bus2].voltage_tag = Some("BRANCH_2_BUS_2_Voltage".to_owned());

    let b1_bus1_prox = grid.add_relay("BRANCH_1_BUS_1_PROXIMAL_User");
    let b1_bus2_prox = grid.add_relay("BRANCH_1_BUS_2_PROXIMAL_User");
    let b2_bus1_prox = grid.add_relay("BRANCH_2_BUS_1_PROXIMAL_User");
    let b2_bus2_prox = grid.add_relay("BRANCH_2_BUS_2_PROXIMAL_User");
    let b1_bus1_dist = grid.add_relay("BRANCH_1_BUS_1_DISTAL_User");
    let b1_bus2_dist = grid.add_relay("BRANCH_1_BUS_2_DISTAL_User");
    let b2_bus1_dist = grid.add_relay("BRANCH_2_BUS_1_DISTAL_User");
    let b2_bus2_dist = grid.add_relay("BRANCH_2_BUS_2_DISTAL_User");
    let interconnect1 = grid.add_relay("INTERCONNECT_1_User");
    let interconnect2 = grid.add_relay("INTERCONNECT_2_User");

    grid.add_edge(main, b1_bus1, Some("BRANCH_1_BUS_1_Current"), vec![b1_bus1_prox]);
    grid.add_edge(main, b2_bus1, Some("BRANCH_2_BUS_1_Current"), vec![b2_bus1_prox]);
    grid.add_edge(b1_bus1, b1_int1, None, vec![b1_bus1_dist]);
    grid.add_edge(b1_int1, b1_bus2, Some("BRANCH_1_BUS_2_Current"), vec![b1_bus2_prox]);
    grid.add_edge(b1_int1, b2_int1, Some("INTERCONNECT_1_Current"), vec![interconnect1]);
    grid.add_edge(b1_bus2, b1_int2, None, vec![b1_bus2_dist]);
    grid.add_edge(b1_int2, b2_int2, Some("INTERCONNECT_2_Current"), vec![interconnect2]);
    grid.add_edge(b2_bus1, b2_int1, None, vec![b2_bus1_dist]);
    grid.add_edge(b2_int1, b2_bus2, Some("BRANCH_2_BUS_2_Current"), vec![b2_bus2_prox]);
    grid.add_edge(b2_bus2, b2_int2, None, vec![b2_bus2_dist]);

    grid.add_zone("DC.MAIN.MAINZONE", vec![main]);
    grid.add_zone("DC.BRANCH1.ZONE1", vec![b1_bus1, b1_int1]);
    grid.add_zone("DC.BRANCH1.ZONE2", vec![b1_bus2, b1_int2]);
    grid.add_zone("DC.BRANCH2.ZONE1", vec![b2_bus1, b2_int1]);
    grid.add_zone("DC.BRANCH2.ZONE2", vec![b2_bus2, b2_int2]);

    grid
}
