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

//! Agent timers: scheduled callbacks delivered as events into the agent's
//! queue, so every timer fires on the actor itself. Handles cancel
//! idempotently; a cancelled timer that has already fired is a no-op.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

/// Cancellation handle for a scheduled or periodic timer.
#[derive(Debug, Clone, Default)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the timer. Safe to call any number of times.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Deliver `event` once at the wall-clock instant `at`. A time in the past
/// fires immediately.
pub fn schedule_at<E: Send + 'static>(
    tx: mpsc::UnboundedSender<E>,
    at: DateTime<Utc>,
    event: E,
) -> TimerHandle {
    let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    schedule_after(tx, delay, event)
}

/// Deliver `event` once after `delay`.
pub fn schedule_after<E: Send + 'static>(
    tx: mpsc::UnboundedSender<E>,
    delay: Duration,
    event: E,
) -> TimerHandle {
    let handle = TimerHandle::new();
    let flag = handle.cancelled.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if !flag.load(Ordering::SeqCst) {
            let _ = tx.send(event);
        }
    });
    handle
}

/// Deliver a copy of `event` every `interval` until cancelled or the
/// receiver goes away.
pub fn every<E: Clone + Send + 'static>(
    tx: mpsc::UnboundedSender<E>,
    interval: Duration,
    event: E,
) -> TimerHandle {
    let handle = TimerHandle::new();
    let flag = handle.cancelled.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick of a tokio interval is immediate; skip it
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if flag.load(Ordering::SeqCst) {
                break;
            }
            if tx.send(event.clone()).is_err() {
                break;
            }
        }
    });
    handle
}
