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

//! The PLC tag client: batched reads and writes against the shared tag
//! namespace, with a per-agent freshness cache so control loops do not
//! hammer the tag server.
//!
//! Relay tags carry inverted logic (writing `true` opens the relay); that
//! convention lives with the callers, the client moves raw values.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TagValue {
    Bool(bool),
    Float(f64),
}

impl TagValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(value) => Some(*value),
            Self::Bool(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            Self::Float(_) => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum PlcError {
    #[error("tag I/O timed out after {0:?}")]
    Timeout(Duration),

    #[error("transient tag I/O failure: {0}")]
    Transient(String),
}

pub type Result<T> = std::result::Result<T, PlcError>;

/// Raw access to the tag namespace. Implementations must answer within the
/// caller's deadline; slow backends surface as timeouts, never hangs.
#[async_trait]
pub trait TagIo: Send + Sync {
    /// Read the named tags. Tags the backend does not know are absent from
    /// the result rather than an error.
    async fn read(&self, tags: &[String]) -> Result<HashMap<String, TagValue>>;

    async fn write(&self, writes: &[(String, TagValue)]) -> Result<()>;
}

/// In-memory tag backend driving the simulated grid.
#[derive(Debug, Default)]
pub struct SimulatedPlc {
    tags: RwLock<HashMap<String, TagValue>>,
}

impl SimulatedPlc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or override a tag out of band, e.g. to inject a fault current.
    pub fn set(&self, tag: impl Into<String>, value: TagValue) {
        self.tags.write().insert(tag.into(), value);
    }

    pub fn get(&self, tag: &str) -> Option<TagValue> {
        self.tags.read().get(tag).copied()
    }
}

#[async_trait]
impl TagIo for SimulatedPlc {
    async fn read(&self, tags: &[String]) -> Result<HashMap<String, TagValue>> {
        let store = self.tags.read();
        Ok(tags
            .iter()
            .filter_map(|tag| store.get(tag).map(|value| (tag.clone(), *value)))
            .collect())
    }

    async fn write(&self, writes: &[(String, TagValue)]) -> Result<()> {
        let mut store = self.tags.write();
        for (tag, value) in writes {
            store.insert(tag.clone(), *value);
        }
        Ok(())
    }
}

/// Tag client with a freshness cache. Reads newer than the threshold are
/// served locally; the rest are fetched in one batch. When the backend
/// fails, stale values stand in if the cache has them.
pub struct CachedTagClient {
    io: Arc<dyn TagIo>,
    cache: RwLock<HashMap<String, (TagValue, DateTime<Utc>)>>,
    deadline: Duration,
}

impl std::fmt::Debug for CachedTagClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedTagClient")
            .field("cached_tags", &self.cache.read().len())
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl CachedTagClient {
    pub fn new(io: Arc<dyn TagIo>, deadline: Duration) -> Self {
        Self {
            io,
            cache: RwLock::new(HashMap::new()),
            deadline,
        }
    }

    /// Read tags, serving values fresher than `threshold` from the cache.
    pub async fn read_preferred(
        &self,
        tags: &[String],
        threshold: Duration,
    ) -> Result<HashMap<String, TagValue>> {
        let now = Utc::now();
        let mut out = HashMap::new();
        let mut wanted = Vec::new();

        {
            let cache = self.cache.read();
            for tag in tags {
                match cache.get(tag) {
                    Some((value, read_at))
                        if (now - *read_at).to_std().unwrap_or(Duration::MAX) <= threshold =>
                    {
                        out.insert(tag.clone(), *value);
                    }
                    _ => wanted.push(tag.clone()),
                }
            }
        }

        if wanted.is_empty() {
            return Ok(out);
        }

        match self.fetch_with_fallback(&wanted).await {
            Ok(fetched) => {
                out.extend(fetched);
                Ok(out)
            }
            Err(err) if !out.is_empty() => {
                warn!("tag read failed ({err}); serving cached values only");
                Ok(out)
            }
            Err(err) => Err(err),
        }
    }

    /// Read tags straight from the backend, refreshing the cache. Stale
    /// cached values stand in when the backend fails.
    pub async fn read_fresh(&self, tags: &[String]) -> Result<HashMap<String, TagValue>> {
        self.fetch_with_fallback(tags).await
    }

    /// Fetch a batch and refresh the cache; on failure serve the stale
    /// cached values if any of the tags have one.
    async fn fetch_with_fallback(&self, tags: &[String]) -> Result<HashMap<String, TagValue>> {
        match self.fetch(tags).await {
            Ok(fetched) => {
                let now = Utc::now();
                let mut cache = self.cache.write();
                for (tag, value) in &fetched {
                    cache.insert(tag.clone(), (*value, now));
                }
                Ok(fetched)
            }
            Err(err) => {
                let cache = self.cache.read();
                let stale: HashMap<String, TagValue> = tags
                    .iter()
                    .filter_map(|tag| cache.get(tag).map(|(value, _)| (tag.clone(), *value)))
                    .collect();
                if stale.is_empty() {
                    Err(err)
                } else {
                    warn!("tag read failed ({err}); serving stale values");
                    Ok(stale)
                }
            }
        }
    }

    pub async fn write(&self, writes: &[(String, TagValue)]) -> Result<()> {
        debug!("writing {} tag(s)", writes.len());
        tokio::time::timeout(self.deadline, self.io.write(writes))
            .await
            .map_err(|_| PlcError::Timeout(self.deadline))?
    }

    async fn fetch(&self, tags: &[String]) -> Result<HashMap<String, TagValue>> {
        tokio::time::timeout(self.deadline, self.io.read(tags))
            .await
            .map_err(|_| PlcError::Timeout(self.deadline))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Backend that fails every call, for stale-fallback tests.
    #[derive(Debug, Default)]
    struct DeadPlc;

    #[async_trait]
    impl TagIo for DeadPlc {
        async fn read(&self, _tags: &[String]) -> Result<HashMap<String, TagValue>> {
            Err(PlcError::Transient("backend down".to_owned()))
        }

        async fn write(&self, _writes: &[(String, TagValue)]) -> Result<()> {
            Err(PlcError::Transient("backend down".to_owned()))
        }
    }

    fn tags(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_owned()).collect()
    }

    #[tokio::test]
    async fn test_simulated_plc_round_trip() {
        let plc = SimulatedPlc::new();
        plc.set("BRANCH_1_BUS_1_Voltage", TagValue::Float(12.1));

        let client = CachedTagClient::new(Arc::new(plc), Duration::from_millis(100));
        let values = client.read_fresh(&tags(&["BRANCH_1_BUS_1_Voltage"])).await.unwrap();
        assert_eq!(
            values["BRANCH_1_BUS_1_Voltage"].as_f64(),
            Some(12.1)
        );
    }

    #[tokio::test]
    async fn test_unknown_tags_are_absent_not_errors() {
        let client = CachedTagClient::new(Arc::new(SimulatedPlc::new()), Duration::from_millis(100));
        let values = client.read_fresh(&tags(&["NO_SUCH_TAG"])).await.unwrap();
        assert!(values.is_empty());
    }

    #[tokio::test]
    async fn test_fresh_reads_come_from_cache() {
        let plc = Arc::new(SimulatedPlc::new());
        plc.set("INTERCONNECT_1_User", TagValue::Bool(false));
        let client = CachedTagClient::new(plc.clone(), Duration::from_millis(100));

        // warm the cache, then change the backend underneath it
        client.read_fresh(&tags(&["INTERCONNECT_1_User"])).await.unwrap();
        plc.set("INTERCONNECT_1_User", TagValue::Bool(true));

        let cached = client
            .read_preferred(&tags(&["INTERCONNECT_1_User"]), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cached["INTERCONNECT_1_User"].as_bool(), Some(false));

        let fresh = client.read_fresh(&tags(&["INTERCONNECT_1_User"])).await.unwrap();
        assert_eq!(fresh["INTERCONNECT_1_User"].as_bool(), Some(true));
    }

    #[tokio::test]
    async fn test_stale_values_survive_backend_failure() {
        let live = Arc::new(SimulatedPlc::new());
        live.set("SOURCE_1_REG_VOLTAGE", TagValue::Float(12.4));
        let client = CachedTagClient::new(live, Duration::from_millis(100));
        client.read_fresh(&tags(&["SOURCE_1_REG_VOLTAGE"])).await.unwrap();

        // swap in a dead backend by building a new client around the old cache
        let dead = CachedTagClient {
            io: Arc::new(DeadPlc),
            cache: RwLock::new(client.cache.read().clone()),
            deadline: Duration::from_millis(100),
        };
        let values = dead.read_fresh(&tags(&["SOURCE_1_REG_VOLTAGE"])).await.unwrap();
        assert_eq!(values["SOURCE_1_REG_VOLTAGE"].as_f64(), Some(12.4));

        // with no cache at all the failure propagates
        let bare = CachedTagClient::new(Arc::new(DeadPlc), Duration::from_millis(100));
        assert!(bare.read_fresh(&tags(&["SOURCE_1_REG_VOLTAGE"])).await.is_err());
    }
}
