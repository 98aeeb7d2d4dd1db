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

//! In-process pub/sub transport. Topics are many-to-many; every subscriber
//! of a topic sees every message on it and filters on `message_target`
//! itself. Messages from one publisher arrive in publish order.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use gridflow_types::messages::{Envelope, Topic};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

type Subscribers = HashMap<Topic, Vec<mpsc::UnboundedSender<Arc<str>>>>;

/// The shared message bus. Cloning hands out another handle to the same
/// broker.
#[derive(Debug, Clone, Default)]
pub struct Bus {
    topics: Arc<Mutex<Subscribers>>,
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a topic. The returned receiver yields raw JSON
    /// payloads; decoding failures are the subscriber's protocol errors to
    /// log and discard.
    pub fn subscribe(&self, topic: Topic) -> mpsc::UnboundedReceiver<Arc<str>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics.lock().entry(topic).or_default().push(tx);
        rx
    }

    /// Publish an envelope to a topic, dropping subscribers that have gone
    /// away.
    pub fn publish(&self, topic: Topic, envelope: &Envelope) -> Result<()> {
        let payload: Arc<str> = serde_json::to_string(envelope)?.into();
        trace!("publish {:?}: {}", topic, payload);
        let mut topics = self.topics.lock();
        if let Some(subscribers) = topics.get_mut(&topic) {
            subscribers.retain(|tx| tx.send(payload.clone()).is_ok());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridflow_types::messages::{Body, RateAnnouncement};

    #[tokio::test]
    async fn test_broadcast_reaches_every_subscriber() {
        let bus = Bus::new();
        let mut first = bus.subscribe(Topic::EnergyMarket);
        let mut second = bus.subscribe(Topic::EnergyMarket);
        let mut other_topic = bus.subscribe(Topic::Freg);

        let envelope = Envelope::broadcast(
            "ENERCON",
            Body::RateAnnouncement(RateAnnouncement { period: 1, rate: 2.0 }),
        );
        bus.publish(Topic::EnergyMarket, &envelope).unwrap();

        assert!(first.recv().await.is_some());
        assert!(second.recv().await.is_some());
        assert!(other_topic.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_messages_arrive_in_publish_order() {
        let bus = Bus::new();
        let mut rx = bus.subscribe(Topic::EnergyMarket);

        for period in 0..10 {
            let envelope = Envelope::broadcast(
                "ENERCON",
                Body::RateAnnouncement(RateAnnouncement { period, rate: 1.0 }),
            );
            bus.publish(Topic::EnergyMarket, &envelope).unwrap();
        }

        for expected in 0..10 {
            let raw = rx.recv().await.unwrap();
            let envelope: Envelope = serde_json::from_str(&raw).unwrap();
            match envelope.body {
                Body::RateAnnouncement(rate) => assert_eq!(rate.period, expected),
                _ => panic!("unexpected subject"),
            }
        }
    }

    #[tokio::test]
    async fn test_dropped_subscribers_are_pruned() {
        let bus = Bus::new();
        let rx = bus.subscribe(Topic::EnergyMarket);
        drop(rx);

        let envelope = Envelope::broadcast(
            "ENERCON",
            Body::RateAnnouncement(RateAnnouncement { period: 1, rate: 2.0 }),
        );
        // publishing to a dead subscriber must not error
        bus.publish(Topic::EnergyMarket, &envelope).unwrap();
        bus.publish(Topic::EnergyMarket, &envelope).unwrap();
    }
}
