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

//! A full market round over the live bus: the utility discovers the home,
//! solicits bids, clears, and announces a rate, while the agents stay in
//! their own tasks the whole time.

use std::sync::Arc;
use std::time::Duration;

use gridflow_adapters::{CachedTagClient, SimulatedPlc, TagValue};
use gridflow_agents::{Bus, HomeAgent, UtilityAgent};
use gridflow_types::bid::BidSide;
use gridflow_types::config::{
    ApplianceConfig, ApplianceKind, CostFnSpec, HomeConfig, ResourceConfig, ResourceKindConfig,
    Settings, UtilityConfig,
};
use gridflow_types::messages::{Body, CustomerEnrollment, Envelope, Topic};
use tokio::time::timeout;

fn fast_settings() -> Settings {
    Settings {
        st_plan_interval: 2.0,
        announce_period_interval: 0.5,
        accounting_interval: 10.0,
        fault_detection_interval: 10.0,
        secondary_voltage_interval: 10.0,
        simstep_interval: 0.5,
        dr_solicitation_interval: 10.0,
        customer_solicitation_interval: 0.5,
        bid_window: 0.5,
        ..Settings::default()
    }
}

fn utility_config() -> UtilityConfig {
    UtilityConfig {
        agentid: "utility".to_owned(),
        name: "ENERCON".to_owned(),
        resources: vec![ResourceConfig {
            kind: ResourceKindConfig::Solar,
            name: "util_solar".to_owned(),
            location: "DC.MAIN.MAIN".to_owned(),
            // tiny capital cost keeps the amortized rate near zero so the
            // home's modest offer clears against it
            cap_cost: 1.0,
            max_discharge_power: 100.0,
            max_charge_power: None,
            capacity: None,
            discharge_channel: 1,
            charge_channel: None,
            voc: Some(13.5),
            vmpp: Some(12.5),
        }],
        settings: fast_settings(),
    }
}

fn home_config() -> HomeConfig {
    HomeConfig {
        agentid: "home1".to_owned(),
        name: "HOME1".to_owned(),
        location: "DC.BRANCH1.BUS1.LOAD1".to_owned(),
        resources: Vec::new(),
        appliances: vec![ApplianceConfig {
            kind: ApplianceKind::Light,
            name: "lamp".to_owned(),
            nominal_power: 20.0,
            gridpoints: vec![0.0, 1.0],
            actionpoints: vec![0.0, 1.0],
            costfn: CostFnSpec::Interpolate {
                points: vec![(0.0, 0.0), (1.0, -1.0)],
            },
        }],
        refload: 40.0,
        windowlength: 4,
        freg_participant: false,
        dr_participant: false,
        settings: fast_settings(),
    }
}

fn seeded_plc() -> Arc<SimulatedPlc> {
    let plc = Arc::new(SimulatedPlc::new());
    for tag in [
        "BRANCH_1_BUS_1_PROXIMAL_User",
        "BRANCH_1_BUS_2_PROXIMAL_User",
        "BRANCH_2_BUS_1_PROXIMAL_User",
        "BRANCH_2_BUS_2_PROXIMAL_User",
        "BRANCH_1_BUS_1_DISTAL_User",
        "BRANCH_1_BUS_2_DISTAL_User",
        "BRANCH_2_BUS_1_DISTAL_User",
        "BRANCH_2_BUS_2_DISTAL_User",
        "INTERCONNECT_1_User",
        "INTERCONNECT_2_User",
        "BRANCH_1_BUS_1_LOAD_1_User",
    ] {
        plc.set(tag, TagValue::Bool(false));
    }
    for tag in [
        "BRANCH_1_BUS_1_Current",
        "BRANCH_2_BUS_1_Current",
        "BRANCH_1_BUS_2_Current",
        "INTERCONNECT_1_Current",
        "INTERCONNECT_2_Current",
        "BRANCH_2_BUS_2_Current",
        "BRANCH_1_BUS_1_LOAD_1_Current",
        "SOURCE_1_REG_CURRENT",
    ] {
        plc.set(tag, TagValue::Float(0.0));
    }
    for tag in [
        "BRANCH_1_BUS_1_Voltage",
        "BRANCH_1_BUS_2_Voltage",
        "BRANCH_2_BUS_1_Voltage",
        "BRANCH_2_BUS_2_Voltage",
        "SOURCE_1_REG_VOLTAGE",
    ] {
        plc.set(tag, TagValue::Float(12.1));
    }
    plc
}

#[derive(Debug, Default)]
struct Observed {
    enrollment_confirmed: bool,
    home_bid: bool,
    demand_accepted: bool,
    rate_announced: Option<f64>,
}

#[tokio::test(flavor = "multi_thread")]
async fn test_full_market_round_over_bus() {
    let bus = Bus::new();
    let plc = seeded_plc();

    // probe subscriptions before the agents start so nothing is missed
    let mut market_probe = bus.subscribe(Topic::EnergyMarket);
    let mut customer_probe = bus.subscribe(Topic::CustomerService);

    let (utility, utility_events) = UtilityAgent::new(
        utility_config(),
        bus.clone(),
        Arc::new(CachedTagClient::new(plc.clone(), Duration::from_millis(100))),
    );
    tokio::spawn(utility.run(utility_events));

    let (home, home_events) = HomeAgent::new(
        home_config(),
        bus.clone(),
        Arc::new(CachedTagClient::new(plc.clone(), Duration::from_millis(100))),
    )
    .unwrap();
    tokio::spawn(home.run(home_events));

    let mut observed = Observed::default();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(12);

    while tokio::time::Instant::now() < deadline {
        let next_message = tokio::select! {
            msg = market_probe.recv() => msg,
            msg = customer_probe.recv() => msg,
            () = tokio::time::sleep(Duration::from_millis(200)) => continue,
        };
        let Some(raw) = next_message else { break };
        let Ok(envelope) = serde_json::from_str::<Envelope>(&raw) else {
            panic!("malformed message on the bus: {raw}");
        };

        match &envelope.body {
            Body::CustomerEnrollment(CustomerEnrollment::NewCustomerConfirm) => {
                observed.enrollment_confirmed = true;
            }
            Body::BidResponse(bid) if envelope.message_sender == "HOME1" => {
                assert_eq!(bid.side, BidSide::Demand);
                assert!((bid.amount - 40.0).abs() < 1e-9);
                observed.home_bid = true;
            }
            Body::BidAcceptance(acceptance) if acceptance.side == BidSide::Demand => {
                assert!((acceptance.amount - 40.0).abs() < 1e-9);
                observed.demand_accepted = true;
            }
            Body::RateAnnouncement(rate) => {
                observed.rate_announced = Some(rate.rate);
            }
            _ => {}
        }

        if observed.enrollment_confirmed
            && observed.home_bid
            && observed.demand_accepted
            && observed.rate_announced.is_some()
        {
            break;
        }
    }

    assert!(observed.enrollment_confirmed, "home never enrolled");
    assert!(observed.home_bid, "home never tendered its demand bid");
    assert!(observed.demand_accepted, "demand bid was not accepted");
    let rate = observed.rate_announced.expect("no rate announcement seen");
    // the group clears at the home's offered rate
    assert!(rate > 0.0 && rate < 10.0, "implausible clearing rate {rate}");

    // after clearing, the utility permits the home's connection request
    let granted = timeout(Duration::from_secs(6), async {
        loop {
            if plc.get("BRANCH_1_BUS_1_LOAD_1_User") == Some(TagValue::Bool(true)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    assert!(granted.is_ok(), "load relay never closed after acceptance");
}
