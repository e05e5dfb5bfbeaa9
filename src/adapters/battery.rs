//! Battery SoC adapter (spec §4.1 BatteryInterface).
#![allow(dead_code)]
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use tokio::sync::RwLock;
use tracing::info;

use crate::adapters::retry::retry_with_backoff;
use crate::config::{BatteryConfig, LoadSource};
use crate::scheduler::events::CoordinatorEvents;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatterySnapshot {
    pub soc_percent: f64,
    pub usable_capacity_wh: f64,
    pub max_charge_power_dyn_w: f64,
}

impl BatterySnapshot {
    fn compute(soc_percent: f64, cfg: &BatteryConfig) -> Self {
        let usable_capacity_wh =
            (cfg.capacity_wh * (soc_percent - cfg.min_soc_percent) / 100.0 * cfg.discharge_efficiency).max(0.0);

        let max_charge_power_dyn_w = if soc_percent >= cfg.max_soc_percent {
            0.0
        } else if soc_percent >= cfg.charge_taper_start_soc_percent {
            let span = (cfg.max_soc_percent - cfg.charge_taper_start_soc_percent).max(0.01);
            let fraction = 1.0 - (soc_percent - cfg.charge_taper_start_soc_percent) / span;
            cfg.max_charge_power_w * fraction.clamp(0.0, 1.0)
        } else {
            cfg.max_charge_power_w
        };

        Self {
            soc_percent,
            usable_capacity_wh,
            max_charge_power_dyn_w,
        }
    }
}

#[async_trait]
pub trait BatterySource: Send + Sync {
    async fn snapshot(&self) -> BatterySnapshot;
    async fn refresh(&self) -> Result<()>;
    async fn shutdown(&self);
}

/// Polls an OpenHAB or Home Assistant item for SoC (spec §4.1, §6).
pub struct PersistenceBatterySource {
    client: reqwest::Client,
    base_url: String,
    item: String,
    source: LoadSource,
    cfg: BatteryConfig,
    cache: Arc<RwLock<BatterySnapshot>>,
    max_retries: u32,
    thresholds: Vec<f64>,
    last_bucket: RwLock<Option<usize>>,
    events: Option<Arc<dyn CoordinatorEvents>>,
}

impl PersistenceBatterySource {
    pub fn new(
        cfg: BatteryConfig,
        base_url: String,
        source: LoadSource,
        access_token: Option<String>,
        max_retries: u32,
        events: Option<Arc<dyn CoordinatorEvents>>,
    ) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(10));
        if let Some(token) = access_token {
            let mut headers = HeaderMap::new();
            let value = HeaderValue::from_str(&format!("Bearer {token}")).context("invalid access token header")?;
            headers.insert(AUTHORIZATION, value);
            builder = builder.default_headers(headers);
        }
        let client = builder.build().context("failed to build battery HTTP client")?;
        let item = cfg.soc_item.clone();

        Ok(Self {
            client,
            base_url,
            item,
            source,
            thresholds: vec![cfg.min_soc_percent, cfg.charge_taper_start_soc_percent, cfg.max_soc_percent],
            cache: Arc::new(RwLock::new(BatterySnapshot::compute(50.0, &cfg))),
            cfg,
            max_retries,
            last_bucket: RwLock::new(None),
            events,
        })
    }

    fn item_url(&self) -> String {
        match self.source {
            LoadSource::Openhab => format!("{}/rest/items/{}/state", self.base_url.trim_end_matches('/'), self.item),
            LoadSource::HomeAssistant => format!("{}/api/states/{}", self.base_url.trim_end_matches('/'), self.item),
            LoadSource::Default => self.base_url.clone(),
        }
    }

    async fn fetch_soc(&self) -> Result<f64> {
        let url = self.item_url();
        let resp = self.client.get(&url).send().await.context("battery SoC GET failed")?;
        let status = resp.status();
        let body = resp.text().await.context("battery SoC body read failed")?;
        if !status.is_success() {
            anyhow::bail!("battery SoC HTTP {status}: {body}");
        }
        match self.source {
            LoadSource::Openhab => body.trim().trim_matches('"').parse::<f64>().context("non-numeric OpenHAB SoC state"),
            LoadSource::HomeAssistant => {
                let value: serde_json::Value = serde_json::from_str(&body).context("HA SoC JSON parse failed")?;
                value
                    .get("state")
                    .and_then(|s| s.as_str())
                    .and_then(|s| s.parse::<f64>().ok())
                    .context("HA SoC state missing or non-numeric")
            }
            LoadSource::Default => Ok(50.0),
        }
    }

    fn crossed_threshold(&self, previous: Option<usize>, current: usize) -> bool {
        previous.is_some() && previous != Some(current)
    }

    fn bucket_for(&self, soc: f64) -> usize {
        self.thresholds.iter().filter(|&&t| soc >= t).count()
    }
}

#[async_trait]
impl BatterySource for PersistenceBatterySource {
    async fn snapshot(&self) -> BatterySnapshot {
        *self.cache.read().await
    }

    async fn refresh(&self) -> Result<()> {
        let soc = retry_with_backoff("battery", self.max_retries, Duration::from_secs(5), || self.fetch_soc()).await?;
        let snapshot = BatterySnapshot::compute(soc, &self.cfg);

        let bucket = self.bucket_for(soc);
        let mut last_bucket = self.last_bucket.write().await;
        let crossed = self.crossed_threshold(*last_bucket, bucket);
        if crossed {
            info!(soc, bucket, "battery SoC crossed a configured threshold");
        }
        *last_bucket = Some(bucket);
        drop(last_bucket);

        *self.cache.write().await = snapshot;

        if crossed {
            if let Some(events) = &self.events {
                events.on_soc_threshold(soc).await;
            }
        }
        Ok(())
    }

    async fn shutdown(&self) {}
}

/// Fixed-SoC test double.
pub struct FixedBatterySource {
    snapshot: RwLock<BatterySnapshot>,
}

impl FixedBatterySource {
    pub fn new(soc_percent: f64, cfg: &BatteryConfig) -> Self {
        Self {
            snapshot: RwLock::new(BatterySnapshot::compute(soc_percent, cfg)),
        }
    }

    pub async fn set_soc(&self, soc_percent: f64, cfg: &BatteryConfig) {
        *self.snapshot.write().await = BatterySnapshot::compute(soc_percent, cfg);
    }
}

#[async_trait]
impl BatterySource for FixedBatterySource {
    async fn snapshot(&self) -> BatterySnapshot {
        *self.snapshot.read().await
    }

    async fn refresh(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> BatteryConfig {
        BatteryConfig {
            capacity_wh: 10_000.0,
            charge_efficiency: 0.95,
            discharge_efficiency: 0.95,
            max_charge_power_w: 5000.0,
            max_discharge_power_w: 5000.0,
            min_soc_percent: 10.0,
            max_soc_percent: 95.0,
            charge_taper_start_soc_percent: 90.0,
            soc_item: "Battery_SoC".to_string(),
            wear_cost_eur_per_wh: 0.0001,
            poll_interval_secs: 60,
        }
    }

    #[test]
    fn usable_capacity_scales_with_soc_above_min() {
        let snap = BatterySnapshot::compute(60.0, &cfg());
        let expected = 10_000.0 * (60.0 - 10.0) / 100.0 * 0.95;
        assert!((snap.usable_capacity_wh - expected).abs() < 1e-6);
    }

    #[test]
    fn charge_power_tapers_between_taper_start_and_max_soc() {
        let at_taper_start = BatterySnapshot::compute(90.0, &cfg());
        let mid_taper = BatterySnapshot::compute(92.5, &cfg());
        let at_max = BatterySnapshot::compute(95.0, &cfg());
        assert_eq!(at_taper_start.max_charge_power_dyn_w, 5000.0);
        assert!(mid_taper.max_charge_power_dyn_w < 5000.0 && mid_taper.max_charge_power_dyn_w > 0.0);
        assert_eq!(at_max.max_charge_power_dyn_w, 0.0);
    }

    #[test]
    fn charge_power_is_full_below_taper_start() {
        let snap = BatterySnapshot::compute(50.0, &cfg());
        assert_eq!(snap.max_charge_power_dyn_w, 5000.0);
    }
}
