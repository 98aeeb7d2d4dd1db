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

//! Bus message shapes.
//!
//! Every payload that crosses the bus is one of the explicit records below;
//! a message that does not decode into one of them is a protocol error and
//! is discarded by the receiver. Timestamps travel as ISO-8601 strings with
//! microsecond precision.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bid::{BidService, BidSide};
use crate::config::ResourceConfig;
use crate::dr::DrEventKind;
use crate::forecast::WeatherVariable;

/// Topics carried by the pub/sub transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    #[serde(rename = "customerservice")]
    CustomerService,
    #[serde(rename = "energymarket")]
    EnergyMarket,
    #[serde(rename = "demandresponse")]
    DemandResponse,
    #[serde(rename = "weatherservice")]
    WeatherService,
    #[serde(rename = "FREG")]
    Freg,
}

/// Addressing for a bus message: either every listener or one named agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageTarget {
    Broadcast,
    Agent(String),
}

impl MessageTarget {
    /// Whether an agent with the given name should process the message.
    pub fn includes(&self, name: &str) -> bool {
        match self {
            Self::Broadcast => true,
            Self::Agent(target) => target == name,
        }
    }
}

impl From<String> for MessageTarget {
    fn from(raw: String) -> Self {
        if raw == "broadcast" {
            Self::Broadcast
        } else {
            Self::Agent(raw)
        }
    }
}

impl From<MessageTarget> for String {
    fn from(target: MessageTarget) -> Self {
        match target {
            MessageTarget::Broadcast => "broadcast".to_owned(),
            MessageTarget::Agent(name) => name,
        }
    }
}

/// Common header shared by every bus message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub message_sender: String,
    pub message_target: MessageTarget,
    #[serde(flatten)]
    pub body: Body,
}

impl Envelope {
    pub fn new(sender: impl Into<String>, target: MessageTarget, body: Body) -> Self {
        Self {
            message_sender: sender.into(),
            message_target: target,
            body,
        }
    }

    pub fn broadcast(sender: impl Into<String>, body: Body) -> Self {
        Self::new(sender, MessageTarget::Broadcast, body)
    }

    pub fn to_agent(sender: impl Into<String>, target: impl Into<String>, body: Body) -> Self {
        Self::new(sender, MessageTarget::Agent(target.into()), body)
    }
}

/// Every message subject understood by the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "message_subject", rename_all = "snake_case")]
pub enum Body {
    CustomerEnrollment(CustomerEnrollment),
    RequestConnection,
    BidSolicitation(BidSolicitation),
    BidResponse(BidResponse),
    BidAcceptance(BidAcceptance),
    BidRejection(BidRejection),
    Announcement(Announcement),
    RateAnnouncement(RateAnnouncement),
    #[serde(rename = "DR_enrollment")]
    DrEnrollment(DrEnrollment),
    #[serde(rename = "DR_event")]
    DrEvent(DrEventMessage),
    Nowcast(Nowcast),
    Forecast(ForecastMessage),
    #[serde(rename = "FREG_enrollment")]
    FregEnrollment(FregEnrollment),
    #[serde(rename = "FREG_signal")]
    FregSignal(FregSignal),
}

/// Customer enrollment handshake: query → response → confirm.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum CustomerEnrollment {
    NewCustomerQuery {
        #[serde(default)]
        rereg: bool,
    },
    NewCustomerResponse { info: CustomerInfo },
    NewCustomerConfirm,
}

/// Enrollment payload: name, location, resources, customer class, in wire order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerInfo(pub String, pub String, pub Vec<ResourceConfig>, pub CustomerClass);

impl CustomerInfo {
    pub fn name(&self) -> &str {
        &self.0
    }

    pub fn location(&self) -> &str {
        &self.1
    }

    pub fn resources(&self) -> &[ResourceConfig] {
        &self.2
    }

    pub fn class(&self) -> CustomerClass {
        self.3
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CustomerClass {
    Residential,
    Commercial,
}

/// Utility asks a customer for bids on one side of the book.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BidSolicitation {
    pub side: BidSide,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<BidService>,
    pub period: u64,
    pub solicitation_id: u64,
}

/// A tendered bid. `resource` names the backing device for supply bids.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BidResponse {
    pub side: BidSide,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<BidService>,
    pub amount: f64,
    pub rate: f64,
    pub period: u64,
    pub uid: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
}

/// Acceptance of a bid, possibly with amount or service revised by the
/// utility; the accepted terms are authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BidAcceptance {
    pub side: BidSide,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<BidService>,
    pub amount: f64,
    pub rate: f64,
    pub period: u64,
    pub uid: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BidRejection {
    pub side: BidSide,
    pub uid: u64,
    pub period: u64,
}

/// Period synchronization announcements from the utility.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum Announcement {
    PeriodAnnouncement {
        period_number: u64,
        #[serde(with = "iso_micros")]
        start_time: DateTime<Utc>,
        #[serde(with = "iso_micros")]
        end_time: DateTime<Utc>,
    },
    PeriodDurationAnnouncement {
        /// New period length in seconds.
        duration: f64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateAnnouncement {
    pub period: u64,
    pub rate: f64,
}

/// Demand-response enrollment handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum DrEnrollment {
    EnrollmentQuery,
    EnrollmentReply { opt_in: bool },
    EnrollmentConfirm,
}

/// A DR directive, or a participant's response to one (`opt_in` set).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DrEventMessage {
    pub event_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<DrEventKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opt_in: Option<bool>,
}

/// Current weather readings, as (variable, value) pairs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Nowcast {
    pub readings: Vec<(WeatherVariable, f64)>,
}

/// Forecast for a planning period. With empty `readings` and `request`
/// populated this is a request for the listed variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForecastMessage {
    #[serde(default)]
    pub readings: Vec<(WeatherVariable, f64)>,
    pub forecast_period: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<Vec<WeatherVariable>>,
}

/// Frequency-regulation program handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum FregEnrollment {
    Solicitation,
    Acceptance {
        #[serde(rename = "FREG_power")]
        freg_power: f64,
    },
    #[serde(rename = "enrollment_ACK")]
    EnrollmentAck,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FregSignal {
    /// Normalized regulation setpoint in [-1, 1].
    #[serde(rename = "FREG_signal")]
    pub freg_signal: f64,
}

/// ISO-8601 timestamps with microsecond precision, the on-wire time format.
pub mod iso_micros {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

    pub fn serialize<S>(time: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&time.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        let naive = NaiveDateTime::parse_from_str(&raw, FORMAT).map_err(serde::de::Error::custom)?;
        Ok(naive.and_utc())
    }
}
