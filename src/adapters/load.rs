//! Load-profile adapter (spec §4.1 LoadInterface -> §4.4 builder).
#![allow(dead_code)]
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::config::LoadSource;
use crate::domain::LoadHistorySample;
use crate::load_profile::{HistorySource, LoadProfileBuilder, DEFAULT_PROFILE};

/// Queries OpenHAB's `/rest/persistence/items/{item}` or Home Assistant's
/// `/api/history/period/{start}` endpoint for a sensor's historical state
/// series (spec §4.4 step 1; grounded on
/// `original_source/src/interfaces/load_interface.py`'s
/// `__fetch_historical_energy_data_from_{openhab,homeassistant}`).
pub struct HttpHistorySource {
    client: reqwest::Client,
    base_url: String,
    source: LoadSource,
}

impl HttpHistorySource {
    pub fn new(base_url: String, source: LoadSource, access_token: Option<String>, timeout_secs: u64) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(timeout_secs));
        if let (LoadSource::HomeAssistant, Some(token)) = (source, &access_token) {
            let mut headers = HeaderMap::new();
            let value = HeaderValue::from_str(&format!("Bearer {token}")).context("invalid access token header")?;
            headers.insert(AUTHORIZATION, value);
            builder = builder.default_headers(headers);
        }
        Ok(Self {
            client: builder.build().context("failed to build load-history HTTP client")?,
            base_url: base_url.trim_end_matches('/').to_string(),
            source,
        })
    }
}

#[derive(Debug, Deserialize)]
struct OpenhabPersistenceResponse {
    data: Vec<OpenhabPersistencePoint>,
}

#[derive(Debug, Deserialize)]
struct OpenhabPersistencePoint {
    state: String,
    time: i64,
}

#[derive(Debug, Deserialize)]
struct HomeAssistantHistoryPoint {
    state: String,
    last_updated: DateTime<Utc>,
}

#[async_trait]
impl HistorySource for HttpHistorySource {
    async fn fetch_samples(&self, sensor: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<LoadHistorySample>> {
        if sensor.is_empty() {
            return Ok(Vec::new());
        }
        match self.source {
            LoadSource::Openhab => {
                let url = format!("{}/rest/persistence/items/{sensor}", self.base_url);
                let resp = self
                    .client
                    .get(&url)
                    .query(&[("starttime", start.to_rfc3339()), ("endtime", end.to_rfc3339())])
                    .send()
                    .await
                    .context("openhab persistence GET failed")?;
                let body: OpenhabPersistenceResponse =
                    resp.error_for_status().context("openhab persistence HTTP error")?.json().await.context(
                        "openhab persistence body parse failed",
                    )?;
                Ok(body
                    .data
                    .into_iter()
                    .filter_map(|p| {
                        let state: f64 = p.state.parse().ok()?;
                        let timestamp = DateTime::from_timestamp_millis(p.time)?;
                        Some(LoadHistorySample { state, timestamp })
                    })
                    .collect())
            }
            LoadSource::HomeAssistant => {
                let url = format!("{}/api/history/period/{}", self.base_url, start.to_rfc3339());
                let resp = self
                    .client
                    .get(&url)
                    .query(&[("filter_entity_id", sensor), ("end_time", &end.to_rfc3339())])
                    .send()
                    .await
                    .context("home assistant history GET failed")?;
                let series: Vec<Vec<HomeAssistantHistoryPoint>> = resp
                    .error_for_status()
                    .context("home assistant history HTTP error")?
                    .json()
                    .await
                    .context("home assistant history body parse failed")?;
                Ok(series
                    .into_iter()
                    .flatten()
                    .filter_map(|p| Some(LoadHistorySample { state: p.state.parse().ok()?, timestamp: p.last_updated }))
                    .collect())
            }
            LoadSource::Default => Ok(Vec::new()),
        }
    }

    fn debug_url(&self, sensor: &str, around: DateTime<Utc>) -> String {
        match self.source {
            LoadSource::Openhab => format!("{}/rest/persistence/items/{sensor}?starttime={}", self.base_url, around.to_rfc3339()),
            LoadSource::HomeAssistant => format!("{}/history?entity_id={sensor}", self.base_url),
            LoadSource::Default => self.base_url.clone(),
        }
    }
}

#[async_trait]
pub trait LoadProfileSource: Send + Sync {
    async fn profile(&self) -> Vec<f64>;
    async fn refresh(&self) -> Result<()>;
    async fn shutdown(&self);
}

pub struct BuiltLoadProfileSource<H: HistorySource + 'static> {
    builder: LoadProfileBuilder<H>,
    cache: Arc<RwLock<Vec<f64>>>,
}

impl<H: HistorySource + 'static> BuiltLoadProfileSource<H> {
    pub fn new(builder: LoadProfileBuilder<H>) -> Self {
        Self {
            builder,
            cache: Arc::new(RwLock::new(DEFAULT_PROFILE.to_vec())),
        }
    }
}

#[async_trait]
impl<H: HistorySource + 'static> LoadProfileSource for BuiltLoadProfileSource<H> {
    async fn profile(&self) -> Vec<f64> {
        self.cache.read().await.clone()
    }

    async fn refresh(&self) -> Result<()> {
        let profile = self.builder.build().await;
        *self.cache.write().await = profile;
        Ok(())
    }

    async fn shutdown(&self) {}
}

/// Constant-profile test double.
pub struct FixedLoadProfileSource {
    profile: RwLock<Vec<f64>>,
}

impl FixedLoadProfileSource {
    pub fn new(profile: Vec<f64>) -> Self {
        Self { profile: RwLock::new(profile) }
    }
}

#[async_trait]
impl LoadProfileSource for FixedLoadProfileSource {
    async fn profile(&self) -> Vec<f64> {
        self.profile.read().await.clone()
    }

    async fn refresh(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fixed_source_returns_configured_profile() {
        let source = FixedLoadProfileSource::new(vec![300.0; 48]);
        assert_eq!(source.profile().await.len(), 48);
    }
}
