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

//! Deployment configuration: the utility and every simulated home in one
//! TOML file.

use std::path::Path;

use anyhow::{Context, Result};
use gridflow_types::config::{HomeConfig, UtilityConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    pub utility: UtilityConfig,
    #[serde(default)]
    pub homes: Vec<HomeConfig>,
}

impl SystemConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Self =
            toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_system_config() {
        let raw = r#"
            [utility]
            agentid = "utility"
            name = "ENERCON"

            [[utility.resources]]
            type = "solar"
            name = "util_solar"
            location = "DC.MAIN.MAIN"
            cap_cost = 1000.0
            max_discharge_power = 100.0
            discharge_channel = 1

            [[homes]]
            agentid = "home1"
            name = "HOME1"
            location = "DC.BRANCH1.BUS1.LOAD1"
            refload = 40.0
            windowlength = 4
        "#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(raw.as_bytes()).unwrap();

        let config = SystemConfig::load(file.path()).unwrap();
        assert_eq!(config.utility.name, "ENERCON");
        assert_eq!(config.utility.resources.len(), 1);
        assert_eq!(config.homes.len(), 1);
        assert_eq!(config.homes[0].windowlength, 4);
    }
}
