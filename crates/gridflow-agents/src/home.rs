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

//! The home agent: plans its devices over the rolling window, bids into
//! the market, and actuates its load relay and resource channels at period
//! boundaries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::Duration;
use gridflow_adapters::{CachedTagClient, TagValue};
use gridflow_core::plan::{DeviceDisposition, DispositionMode};
use gridflow_core::planner::PlannerContext;
use gridflow_core::resource::{TagCommand, TagCommandValue};
use gridflow_core::{Appliance, Device, Period, PlanningWindow, Resource};
use gridflow_types::bid::{Bid, BidService, BidSide, UidAllocator};
use gridflow_types::config::{HomeConfig, Location, ResourceConfig, Settings};
use gridflow_types::dr::{DrEvent, DrEventKind};
use gridflow_types::forecast::{Forecast, WeatherVariable};
use gridflow_types::messages::{
    Announcement, Body, CustomerClass, CustomerEnrollment, CustomerInfo, DrEnrollment,
    DrEventMessage, Envelope, FregEnrollment, MessageTarget, Topic,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bus::Bus;
use crate::timers::{self, TimerHandle};

/// Fraction of a battery's discharge rating pledged to frequency regulation.
const FREG_POWER_SHARE: f64 = 0.2;
/// Batteries above this SOC stop absorbing regulation-down energy.
const FREG_CHARGE_SOC_LIMIT: f64 = 0.95;
/// Droop slope used for reserve commitments.
const RESERVE_DROOP: f64 = 0.2;
/// A storage device deeper than this SOC may offer idle capacity as reserve.
const RESERVE_SOC_FLOOR: f64 = 0.25;
/// Power block offered as reserve by an idle storage device.
const RESERVE_BLOCK_W: f64 = 4.0;
/// Well-known name of the weather service agent.
const WEATHER_SERVICE: &str = "Goddard";

#[derive(Debug, Clone)]
pub enum HomeEvent {
    Bus(Topic, Arc<str>),
    AdvancePeriod,
    SimStep,
}

pub struct HomeAgent {
    name: String,
    location: String,
    refload: f64,
    freg_part: bool,
    dr_part: bool,
    settings: Settings,
    resource_configs: Vec<ResourceConfig>,
    bus: Bus,
    plc: Arc<CachedTagClient>,
    devices: Vec<Device>,
    utility_name: Option<String>,
    registered: bool,
    dr_enrolled: bool,
    freg_enrolled: bool,
    current_spot: Option<f64>,
    perceived_insol: f64,
    window: PlanningWindow,
    current_period: Period,
    uids: UidAllocator,
    advance_timer: Option<TimerHandle>,
    /// Regulation offsets currently applied on top of market setpoints.
    freg_offsets: HashMap<String, f64>,
    events_tx: mpsc::UnboundedSender<HomeEvent>,
    relay_tag: String,
    current_tag: String,
    voltage_tag: String,
}

impl HomeAgent {
    pub fn new(
        config: HomeConfig,
        bus: Bus,
        plc: Arc<CachedTagClient>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<HomeEvent>)> {
        let location = Location::parse(&config.location)?;
        let branch = location.branch_number()?;
        let bus_no = location.bus_number()?;
        let load = location.load_number()?;

        let mut devices = Vec::new();
        for resource in &config.resources {
            devices.push(Device::Resource(Resource::from_config(resource)));
        }
        for appliance in &config.appliances {
            devices.push(Device::Appliance(Appliance::from_config(appliance)));
        }

        let settings = config.settings.clone();
        let increment = secs_to_duration(settings.st_plan_interval);
        let now = chrono::Utc::now();
        let current_period = Period::new(0, now, now + increment);
        let window = PlanningWindow::new(config.windowlength, 1, current_period.end, increment);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok((
            Self {
                name: config.name,
                location: config.location,
                refload: config.refload,
                freg_part: config.freg_participant,
                dr_part: config.dr_participant,
                settings,
                resource_configs: config.resources,
                bus,
                plc,
                devices,
                utility_name: None,
                registered: false,
                dr_enrolled: false,
                freg_enrolled: false,
                current_spot: None,
                perceived_insol: 10.0,
                window,
                current_period,
                uids: UidAllocator::new(),
                advance_timer: None,
                freg_offsets: HashMap::new(),
                events_tx,
                relay_tag: format!("BRANCH_{branch}_BUS_{bus_no}_LOAD_{load}_User"),
                current_tag: format!("BRANCH_{branch}_BUS_{bus_no}_LOAD_{load}_Current"),
                voltage_tag: format!("BRANCH_{branch}_BUS_{bus_no}_Voltage"),
            },
            events_rx,
        ))
    }

    pub fn events(&self) -> mpsc::UnboundedSender<HomeEvent> {
        self.events_tx.clone()
    }

    /// Run the agent to completion: one event at a time, no shared state.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<HomeEvent>) {
        info!("home agent {} starting at {}", self.name, self.relay_tag);

        for topic in [
            Topic::EnergyMarket,
            Topic::DemandResponse,
            Topic::CustomerService,
            Topic::WeatherService,
            Topic::Freg,
        ] {
            let mut sub = self.bus.subscribe(topic);
            let tx = self.events_tx.clone();
            tokio::spawn(async move {
                while let Some(raw) = sub.recv().await {
                    if tx.send(HomeEvent::Bus(topic, raw)).is_err() {
                        break;
                    }
                }
            });
        }

        let _simstep = timers::every(
            self.events_tx.clone(),
            secs_to_std(self.settings.simstep_interval),
            HomeEvent::SimStep,
        );
        self.arm_advance_timer();

        while let Some(event) = events.recv().await {
            match event {
                HomeEvent::Bus(topic, raw) => self.handle_bus(topic, &raw).await,
                HomeEvent::AdvancePeriod => self.advance_period().await,
                HomeEvent::SimStep => self.sim_step().await,
            }
        }
    }

    /// Exactly one armed advance timer at any time.
    fn arm_advance_timer(&mut self) {
        if let Some(timer) = self.advance_timer.take() {
            timer.cancel();
        }
        self.advance_timer = Some(timers::schedule_at(
            self.events_tx.clone(),
            self.current_period.end,
            HomeEvent::AdvancePeriod,
        ));
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
            Body::BidSolicitation(solicitation) => self.on_bid_solicitation(&sender, &solicitation),
            Body::BidAcceptance(acceptance) => self.on_bid_acceptance(&acceptance),
            Body::BidRejection(rejection) => self.on_bid_rejection(&rejection),
            Body::Announcement(announcement) => self.on_announcement(&announcement),
            Body::RateAnnouncement(rate) => self.on_rate_announcement(rate.period, rate.rate),
            Body::CustomerEnrollment(enrollment) => self.on_enrollment(&sender, &enrollment),
            Body::DrEnrollment(enrollment) => self.on_dr_enrollment(&enrollment),
            Body::DrEvent(event) => self.on_dr_event(&sender, &event).await,
            Body::Nowcast(nowcast) => {
                let forecast = Forecast::from_readings(&nowcast.readings);
                if let Some(insol) = forecast.get(WeatherVariable::SolarIrradiance) {
                    self.perceived_insol = insol;
                }
                self.current_period.forecast = Some(forecast);
            }
            Body::Forecast(forecast) => {
                if forecast.request.is_none() {
                    if let Some(period) = self.window.period_mut(forecast.forecast_period) {
                        period.forecast = Some(Forecast::from_readings(&forecast.readings));
                    }
                }
            }
            Body::FregEnrollment(enrollment) => self.on_freg_enrollment(&sender, &enrollment),
            Body::FregSignal(signal) => self.on_freg_signal(signal.freg_signal).await,
            Body::RequestConnection | Body::BidResponse(_) => {
                debug!("{} ignoring {topic:?} message not meant for homes", self.name);
            }
        }
    }

    fn on_enrollment(&mut self, sender: &str, enrollment: &CustomerEnrollment) {
        match enrollment {
            CustomerEnrollment::NewCustomerQuery { rereg } => {
                self.utility_name = Some(sender.to_owned());
                if self.registered && !rereg {
                    debug!("{} ignoring enrollment query, already enrolled", self.name);
                    return;
                }
                let info = CustomerInfo(
                    self.name.clone(),
                    self.location.clone(),
                    self.resource_configs.clone(),
                    CustomerClass::Residential,
                );
                let body = Body::CustomerEnrollment(CustomerEnrollment::NewCustomerResponse { info });
                self.publish(Topic::CustomerService, sender, body);
                info!("{} responding to enrollment query from {sender}", self.name);
            }
            CustomerEnrollment::NewCustomerConfirm => {
                self.registered = true;
                info!("{} enrolled with utility {sender}", self.name);
            }
            CustomerEnrollment::NewCustomerResponse { .. } => {}
        }
    }

    fn on_bid_solicitation(
        &mut self,
        sender: &str,
        solicitation: &gridflow_types::messages::BidSolicitation,
    ) {
        let Some(period) = self.window.period_mut(solicitation.period) else {
            debug!(
                "{} ignoring solicitation for unknown period {}",
                self.name, solicitation.period
            );
            return;
        };
        match solicitation.side {
            BidSide::Demand => period.demand_bids.record_solicitation(solicitation.solicitation_id),
            BidSide::Supply => period.supply_bids.record_solicitation(solicitation.solicitation_id),
        }

        // intermittent sources can tender immediately; everything else
        // waits for the planner at the period boundary
        if solicitation.side == BidSide::Supply
            && solicitation.service != Some(BidService::Reserve)
        {
            let period_number = solicitation.period;
            let mut tenders = Vec::new();
            for dev in &self.devices {
                let Some(res) = dev.as_resource() else { continue };
                if !res.is_intermittent() {
                    continue;
                }
                let amount = res.max_discharge_power * self.perceived_insol / 100.0;
                // solar marginal cost is zero
                tenders.push((res.name.clone(), amount, 0.0));
            }
            for (resource, amount, rate) in tenders {
                self.tender_bid(
                    sender.to_owned(),
                    period_number,
                    BidSide::Supply,
                    BidService::Power,
                    amount,
                    rate,
                    Some(resource),
                );
            }
        }
    }

    /// Register a bid in the right book and send it to the counterparty.
    fn tender_bid(
        &mut self,
        counterparty: String,
        period_number: u64,
        side: BidSide,
        service: BidService,
        amount: f64,
        rate: f64,
        resource: Option<String>,
    ) {
        let uid = self.uids.next();
        let mut bid = Bid::new(uid, side, service, amount, rate, counterparty.clone(), period_number);
        if let Some(resource) = &resource {
            bid = bid.with_resource(resource.clone());
        }
        let Some(period) = self.window.period_mut(period_number) else {
            return;
        };
        match side {
            BidSide::Supply => period.supply_bids.init_bid(bid),
            BidSide::Demand => period.demand_bids.init_bid(bid),
        }

        let body = Body::BidResponse(gridflow_types::messages::BidResponse {
            side,
            service: Some(service),
            amount,
            rate,
            period: period_number,
            uid,
            resource,
        });
        self.publish(Topic::EnergyMarket, &counterparty, body);
        debug!(
            "{} tendered {side:?}/{service:?} bid #{uid}: {amount} W @ {rate}",
            self.name
        );
    }

    fn on_bid_acceptance(&mut self, acceptance: &gridflow_types::messages::BidAcceptance) {
        let Some(period) = self.window.period_mut(acceptance.period) else {
            debug!(
                "{} ignoring acceptance for unknown period {}",
                self.name, acceptance.period
            );
            return;
        };
        let manager = match acceptance.side {
            BidSide::Supply => &mut period.supply_bids,
            BidSide::Demand => &mut period.demand_bids,
        };
        let accepted = match manager.bid_accepted(
            acceptance.uid,
            acceptance.amount,
            acceptance.rate,
            acceptance.service,
        ) {
            Ok(bid) => bid.clone(),
            Err(err) => {
                // treat as implicitly rejected
                warn!("{} dropping acceptance for unknown bid: {err}", self.name);
                return;
            }
        };

        period.plan.accepted_bids.push(accepted.clone());
        match accepted.side {
            BidSide::Supply => {
                if let Some(resource) = &accepted.resource {
                    let disposition = match accepted.service {
                        BidService::Power => DeviceDisposition::power(resource, accepted.amount),
                        BidService::Reserve => {
                            DeviceDisposition::reserve(resource, accepted.amount, RESERVE_DROOP)
                        }
                    };
                    period.disposition.components.insert(resource.clone(), disposition);
                }
            }
            BidSide::Demand => {
                if let Some(resource) = &accepted.resource {
                    period.disposition.components.insert(
                        resource.clone(),
                        DeviceDisposition::power(resource, -accepted.amount),
                    );
                } else {
                    // the utility has granted our load for this period
                    period.disposition.close_relay = true;
                }
            }
        }
        debug!("{} acknowledged acceptance of bid #{}", self.name, accepted.uid);
    }

    fn on_bid_rejection(&mut self, rejection: &gridflow_types::messages::BidRejection) {
        let Some(period) = self.window.period_mut(rejection.period) else {
            return;
        };
        let manager = match rejection.side {
            BidSide::Supply => &mut period.supply_bids,
            BidSide::Demand => &mut period.demand_bids,
        };
        let rejected = match manager.bid_rejected(rejection.uid) {
            Ok(bid) => bid.clone(),
            Err(err) => {
                warn!("{} dropping rejection for unknown bid: {err}", self.name);
                return;
            }
        };

        // withdraw whatever the bid had committed
        if let Some(resource) = &rejected.resource {
            period.disposition.components.remove(resource);
        } else if rejected.side == BidSide::Demand {
            period.disposition.close_relay = false;
        }
        debug!("{} acknowledged rejection of bid #{}", self.name, rejected.uid);
    }

    fn on_announcement(&mut self, announcement: &Announcement) {
        match announcement {
            Announcement::PeriodAnnouncement {
                period_number,
                start_time,
                end_time,
            } => {
                let head_number = self.window.first().map(|p| p.number);
                let (start_changed, end_changed) = match self.window.period_mut(*period_number) {
                    Some(period) => {
                        let start_changed = period.start != *start_time;
                        let end_changed = period.end != *end_time;
                        period.start = *start_time;
                        period.end = *end_time;
                        (start_changed, end_changed)
                    }
                    // not in our window; nothing to synchronize
                    None => return,
                };
                if start_changed {
                    debug!(
                        "{} revised start of period {period_number} to {start_time}",
                        self.name
                    );
                    if head_number == Some(*period_number) {
                        // our period boundary moved: re-arm the advance timer
                        self.current_period.end = *start_time;
                        self.arm_advance_timer();
                    }
                }
                if end_changed {
                    self.window.reschedule_subsequent(*period_number + 1, *end_time);
                    debug!(
                        "{} cascaded schedule from period {} at {end_time}",
                        self.name,
                        *period_number + 1
                    );
                }
            }
            Announcement::PeriodDurationAnnouncement { duration } => {
                self.window.increment = secs_to_duration(*duration);
            }
        }
    }

    fn on_rate_announcement(&mut self, period_number: u64, rate: f64) {
        if period_number == self.current_period.number {
            self.current_period.expected_energy_cost = rate;
            self.current_spot = Some(rate);
            self.price_forecast();
            return;
        }
        let head_number = self.window.first().map(|p| p.number);
        let Some(period) = self.window.period_mut(period_number) else {
            return;
        };
        let fresh = !period.rate_announced || (period.expected_energy_cost - rate).abs() > 1e-9;
        period.expected_energy_cost = rate;
        period.rate_announced = true;

        if head_number == Some(period_number) && fresh {
            // the upcoming rate changed under us; redo the plan
            debug!("{} replanning window for rate {rate}", self.name);
            let ctx = PlannerContext {
                owner: &self.name,
                devices: &self.devices,
                interval_secs: self.settings.st_plan_interval,
                dr_cap: 0.0,
                dr_floor: self.refload,
            };
            let recommendation = ctx.plan_window(&mut self.window);
            if let Some(head) = self.window.periods.first_mut() {
                head.plan.optimal_control = recommendation;
            }
        }
    }

    fn on_dr_enrollment(&mut self, enrollment: &DrEnrollment) {
        match enrollment {
            DrEnrollment::EnrollmentQuery => {
                if self.dr_part && !self.dr_enrolled {
                    let utility = self.utility_name.clone().unwrap_or_default();
                    self.publish(
                        Topic::DemandResponse,
                        &utility,
                        Body::DrEnrollment(DrEnrollment::EnrollmentReply { opt_in: true }),
                    );
                    info!("{} opted in to the DR program", self.name);
                }
            }
            DrEnrollment::EnrollmentConfirm => self.dr_enrolled = true,
            DrEnrollment::EnrollmentReply { .. } => {}
        }
    }

    async fn on_dr_event(&mut self, sender: &str, event: &DrEventMessage) {
        let Some(kind) = event.event_type else {
            return;
        };
        if self.dr_enrolled {
            match kind {
                DrEventKind::Normal | DrEventKind::LoadUp => self.change_consumption(1).await,
                DrEventKind::GridEmergency | DrEventKind::Shed | DrEventKind::CriticalPeak => {
                    self.change_consumption(0).await;
                }
            }
            // the planner honors the event for the upcoming period too
            if let Some(head) = self.window.periods.first_mut() {
                head.pending_dr_events.push(DrEvent {
                    event_id: event.event_id,
                    kind,
                    duration: event.event_duration.unwrap_or(0.0),
                });
            }
        }
        let response = Body::DrEvent(DrEventMessage {
            event_id: event.event_id,
            event_type: None,
            event_duration: None,
            opt_in: Some(self.dr_enrolled),
        });
        self.publish(Topic::DemandResponse, sender, response);
    }

    fn on_freg_enrollment(&mut self, sender: &str, enrollment: &FregEnrollment) {
        match enrollment {
            FregEnrollment::Solicitation => {
                if !self.freg_part {
                    return;
                }
                let mut pledged = 0.0;
                for dev in &mut self.devices {
                    if let Some(res) = dev.as_resource_mut() {
                        if res.is_storage() {
                            res.freg_power = FREG_POWER_SHARE * res.max_discharge_power;
                            pledged += res.freg_power;
                        }
                    }
                }
                if pledged > 0.0 {
                    self.publish(
                        Topic::Freg,
                        sender,
                        Body::FregEnrollment(FregEnrollment::Acceptance { freg_power: pledged }),
                    );
                }
            }
            FregEnrollment::EnrollmentAck => self.freg_enrolled = true,
            FregEnrollment::Acceptance { .. } => {}
        }
    }

    /// Track a normalized regulation signal: positive discharges pledged
    /// battery power, zero cancels the offset, negative absorbs energy by
    /// charging while SOC allows.
    async fn on_freg_signal(&mut self, signal: f64) {
        if !self.freg_enrolled || !(-1.0..=1.0).contains(&signal) {
            return;
        }
        let mut writes: Vec<TagCommand> = Vec::new();
        for dev in &mut self.devices {
            let Some(res) = dev.as_resource_mut() else { continue };
            if !res.is_storage() || res.freg_power <= 0.0 {
                continue;
            }
            let name = res.name.clone();
            if signal > 0.0 {
                if let Some(charge) = &mut res.charge_channel {
                    if charge.connected {
                        writes.extend(charge.disconnect());
                    }
                }
                let old_offset = self.freg_offsets.get(&name).copied().unwrap_or(0.0);
                let base = res.discharge_channel.setpoint - old_offset;
                let headroom = (res.max_discharge_power - base).max(0.0);
                let offset = (res.freg_power * signal).min(headroom);
                self.freg_offsets.insert(name, offset);
                if res.discharge_channel.connected {
                    writes.extend(res.discharge_channel.change_setpoint(base + offset));
                } else {
                    writes.extend(res.discharge_channel.connect_with_set(offset, 0.0));
                }
            } else if signal == 0.0 {
                if let Some(charge) = &mut res.charge_channel {
                    if charge.connected {
                        writes.extend(charge.disconnect());
                    }
                }
                let old_offset = self.freg_offsets.remove(&name).unwrap_or(0.0);
                if res.discharge_channel.connected {
                    let base = res.discharge_channel.setpoint - old_offset;
                    writes.extend(res.discharge_channel.change_setpoint(base));
                }
            } else if res.soc < FREG_CHARGE_SOC_LIMIT {
                let charge_power = signal.abs() * res.freg_power;
                if let Some(charge) = &mut res.charge_channel {
                    writes.extend(charge.connect_with_set(charge_power, 0.0));
                    debug!("{} charging {name} at {charge_power} W for regulation", self.name);
                }
            } else {
                debug!("{} SOC too high to absorb regulation energy", self.name);
            }
        }
        self.apply_tag_commands(&writes).await;
    }

    /// Period boundary: enact the plan we committed to, then plan and bid
    /// for the new upcoming period.
    async fn advance_period(&mut self) {
        let Some(dropped) = self.window.shift() else {
            return;
        };
        self.current_period = dropped;
        info!(
            "{} moving into period {} ({} - {})",
            self.name, self.current_period.number, self.current_period.start, self.current_period.end
        );

        self.enact_plan().await;
        self.price_forecast();
        self.refresh_soc().await;
        self.request_missing_forecasts();

        let ctx = PlannerContext {
            owner: &self.name,
            devices: &self.devices,
            interval_secs: self.settings.st_plan_interval,
            dr_cap: 0.0,
            dr_floor: self.refload,
        };
        let outcome = ctx.determine_offer(&self.window);
        if !outcome.converged {
            warn!(
                "{} offer search did not converge; offering {} anyway",
                self.name, outcome.price
            );
        }
        let next_number = if let Some(next) = self.window.periods.first_mut() {
            next.offer_price = Some(outcome.price);
            next.plan.optimal_control = outcome.recommendation;
            Some(next.number)
        } else {
            None
        };
        if let Some(number) = next_number {
            self.bid_solicitation_response(number);
        }

        self.arm_advance_timer();
    }

    /// Actuate the disposition agreed for the period now starting.
    async fn enact_plan(&mut self) {
        if self.current_period.disposition.close_relay {
            self.connect_load();
        } else {
            self.disconnect_load().await;
        }

        let components: HashMap<String, DeviceDisposition> =
            self.current_period.disposition.components.clone();
        let mut writes: Vec<TagCommand> = Vec::new();
        for dev in &mut self.devices {
            let Some(res) = dev.as_resource_mut() else { continue };
            match components.get(&res.name) {
                Some(disposition) if disposition.mode == DispositionMode::Power => {
                    if disposition.value >= 0.0 {
                        writes.extend(if res.discharge_channel.connected {
                            res.discharge_channel.change_setpoint(disposition.value)
                        } else {
                            res.discharge_channel.connect_with_set(disposition.value, 0.0)
                        });
                    } else if let Some(charge) = &mut res.charge_channel {
                        // negative commitment: charge the storage device
                        writes.extend(charge.connect_with_set(-disposition.value, 0.0));
                    }
                }
                Some(disposition) => {
                    writes.extend(
                        res.discharge_channel
                            .change_reserve(disposition.value, -disposition.param),
                    );
                }
                None => {
                    if res.discharge_channel.connected {
                        writes.extend(res.discharge_channel.disconnect());
                    }
                    if let Some(charge) = &mut res.charge_channel {
                        if charge.connected {
                            writes.extend(charge.disconnect());
                        }
                    }
                }
            }
        }
        self.freg_offsets.clear();
        self.apply_tag_commands(&writes).await;
    }

    /// Answer the standing solicitations for a period with bids derived
    /// from the plan.
    fn bid_solicitation_response(&mut self, period_number: u64) {
        let Some(utility) = self.utility_name.clone() else {
            debug!("{} has no utility to bid to yet", self.name);
            return;
        };
        let Some(period) = self.window.period(period_number) else {
            return;
        };
        let offer_price = period.offer_price.unwrap_or(self.settings.assumed_rate);
        let control = period.plan.optimal_control.clone();

        // resource-backed bids follow the planned duty of each device
        let mut tenders: Vec<(BidSide, BidService, f64, f64, Option<String>)> = Vec::new();
        if let Some(control) = &control {
            for dev in &self.devices {
                let Some(res) = dev.as_resource() else { continue };
                let Some(&pu) = control.components.get(&res.name) else {
                    continue;
                };
                let amount = res.power_from_pu(pu).abs();
                if pu > 0.0 {
                    tenders.push((
                        BidSide::Supply,
                        BidService::Power,
                        amount,
                        offer_price,
                        Some(res.name.clone()),
                    ));
                } else if pu < 0.0 {
                    tenders.push((
                        BidSide::Demand,
                        BidService::Power,
                        amount,
                        offer_price,
                        Some(res.name.clone()),
                    ));
                } else if res.is_sink() && res.soc > RESERVE_SOC_FLOOR {
                    // idle storage with charge to spare backs reserve
                    tenders.push((
                        BidSide::Supply,
                        BidService::Reserve,
                        RESERVE_BLOCK_W,
                        0.5 * offer_price,
                        Some(res.name.clone()),
                    ));
                }
            }
        }

        // the baseline household load is one binary demand bid; appliances
        // not represented by a device ride along with it
        let any_demand = control
            .as_ref()
            .map(|control| {
                control.components.iter().any(|(name, &u)| {
                    self.devices
                        .iter()
                        .find(|dev| dev.name() == *name)
                        .is_some_and(|dev| !dev.is_source() && u > 0.0)
                })
            })
            .unwrap_or(self.refload > 0.0);
        if any_demand {
            tenders.push((BidSide::Demand, BidService::Power, self.refload, offer_price, None));
        }

        for (side, service, amount, rate, resource) in tenders {
            self.tender_bid(utility.clone(), period_number, side, service, amount, rate, resource);
        }
    }

    /// Ask the weather service to fill forecast gaps before the planner
    /// runs; this pass proceeds on carried-forward values meanwhile.
    fn request_missing_forecasts(&mut self) {
        let needs_forecast = self
            .devices
            .iter()
            .any(|dev| dev.environmental_variable().is_some());
        if !needs_forecast {
            return;
        }
        let missing: Vec<u64> = self
            .window
            .periods
            .iter()
            .filter(|period| period.forecast.is_none())
            .map(|period| period.number)
            .collect();
        for number in missing {
            self.publish(
                Topic::WeatherService,
                WEATHER_SERVICE,
                Body::Forecast(gridflow_types::messages::ForecastMessage {
                    readings: Vec::new(),
                    forecast_period: number,
                    request: Some(vec![
                        WeatherVariable::SolarIrradiance,
                        WeatherVariable::WindSpeed,
                        WeatherVariable::Temperature,
                    ]),
                }),
            );
        }
    }

    /// Expected prices for the window: announced spot if any, else the
    /// first accepted rate, else the configured assumption.
    fn price_forecast(&mut self) {
        let fallback = self
            .current_period
            .plan
            .accepted_bids
            .first()
            .map(|bid| bid.rate);
        for period in &mut self.window.periods {
            if period.rate_announced {
                continue;
            }
            period.expected_energy_cost = self
                .current_spot
                .or(fallback)
                .unwrap_or(self.settings.assumed_rate);
        }
    }

    async fn change_consumption(&mut self, level: u8) {
        if level == 0 {
            self.disconnect_load().await;
        } else {
            self.connect_load();
        }
    }

    /// Connecting needs the utility's permission; it owns the relay.
    fn connect_load(&mut self) {
        let Some(utility) = self.utility_name.clone() else {
            return;
        };
        debug!("{} requesting connection from {utility}", self.name);
        self.publish(Topic::CustomerService, &utility, Body::RequestConnection);
    }

    /// Disconnecting is always allowed and immediate.
    async fn disconnect_load(&mut self) {
        let write = [(self.relay_tag.clone(), TagValue::Bool(false))];
        if let Err(err) = self.plc.write(&write).await {
            warn!("{} could not open load relay: {err}", self.name);
        }
    }

    /// Step the appliance simulation, sharing measured power pro rata when
    /// it cannot cover the unconstrained total.
    async fn sim_step(&mut self) {
        let tags = vec![self.current_tag.clone(), self.voltage_tag.clone()];
        let threshold = secs_to_std(self.settings.simstep_interval);
        let available = match self.plc.read_preferred(&tags, threshold).await {
            Ok(values) => {
                let current = values.get(&self.current_tag).and_then(TagValue::as_f64);
                let voltage = values.get(&self.voltage_tag).and_then(TagValue::as_f64);
                match (current, voltage) {
                    (Some(i), Some(v)) => i * v,
                    _ => self.refload,
                }
            }
            Err(_) => self.refload,
        };

        let unconstrained: f64 = self
            .devices
            .iter()
            .filter_map(|dev| match dev {
                Device::Appliance(app) => Some(app.nominal_power),
                Device::Resource(_) => None,
            })
            .sum();
        let fraction = if unconstrained > available && unconstrained > 0.0 {
            available / unconstrained
        } else {
            1.0
        };

        let dt = self.settings.simstep_interval;
        for dev in &mut self.devices {
            if let Device::Appliance(app) = dev {
                app.simulation_step(fraction * app.nominal_power, dt);
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
            // skip this tick; the next enactment retries
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

    /// Battery SOC book-keeping from the PLC, used before reserve bids.
    async fn refresh_soc(&mut self) {
        let mut reads = Vec::new();
        for dev in &self.devices {
            if let Some(res) = dev.as_resource() {
                if res.is_storage() {
                    reads.push(res.discharge_channel.reg_voltage_tag());
                }
            }
        }
        if reads.is_empty() {
            return;
        }
        let Ok(values) = self.plc.read_preferred(&reads, StdDuration::from_secs(5)).await else {
            return;
        };
        for dev in &mut self.devices {
            if let Some(res) = dev.as_resource_mut() {
                if !res.is_storage() {
                    continue;
                }
                let tag = res.discharge_channel.reg_voltage_tag();
                if let Some(voltage) = values.get(&tag).and_then(TagValue::as_f64) {
                    res.soc = Resource::soc_from_ocv(voltage);
                    debug!("{} {} SOC now {:.2}", self.name, res.name, res.soc);
                }
            }
        }
    }
}

fn secs_to_duration(secs: f64) -> Duration {
    Duration::milliseconds((secs * 1000.0) as i64)
}

fn secs_to_std(secs: f64) -> StdDuration {
    StdDuration::from_millis((secs * 1000.0) as u64)
}
