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

//! Error types for the core crate

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("no period numbered {0} in the planning window")]
    UnknownPeriod(u64),

    #[error("no pending bid with uid {uid}")]
    UnknownBid { uid: u64 },

    #[error("unknown device {0}")]
    UnknownDevice(String),

    #[error("state grid for period {0} is empty")]
    EmptyStateGrid(u64),

    #[error("current state does not match any grid point")]
    NoStartingState,

    #[error("unknown topology node {0}")]
    UnknownNode(String),

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
