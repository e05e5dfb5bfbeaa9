//! PV production forecast adapter (spec §4.1 PvInterface, §6 Akkudoktor example).
#![allow(dead_code)]
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::adapters::retry::retry_with_backoff;
use crate::config::{PvConfig, PvPlantConfig};

#[derive(Debug, Clone)]
pub struct PvSnapshot {
    pub power_wh: Vec<f64>,
    pub temperature_c: Vec<f64>,
    pub fetched_at: DateTime<Utc>,
}

impl PvSnapshot {
    fn zeroed() -> Self {
        Self {
            power_wh: vec![0.0; 48],
            temperature_c: vec![15.0; 48],
            fetched_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait PvSource: Send + Sync {
    async fn forecast(&self) -> PvSnapshot;
    async fn refresh(&self) -> Result<()>;
    async fn shutdown(&self);
}

#[derive(Deserialize)]
struct AkkudoktorResponse {
    values: Vec<Vec<AkkudoktorPoint>>,
}

#[derive(Deserialize)]
struct AkkudoktorPoint {
    datetime: DateTime<Utc>,
    power: f64,
    #[serde(default)]
    temperature: Option<f64>,
}

pub struct AkkudoktorPvSource {
    client: reqwest::Client,
    base_url: String,
    plants: Vec<PvPlantConfig>,
    tz: Tz,
    cache: Arc<RwLock<PvSnapshot>>,
    max_retries: u32,
}

impl AkkudoktorPvSource {
    pub fn new(cfg: &PvConfig, tz: Tz, max_retries: u32) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.http_timeout_secs))
            .build()
            .context("failed to build PV HTTP client")?;
        Ok(Self {
            client,
            base_url: cfg.base_url.clone(),
            plants: cfg.plants.clone(),
            tz,
            cache: Arc::new(RwLock::new(PvSnapshot::zeroed())),
            max_retries,
        })
    }

    fn plant_url(&self, plant: &PvPlantConfig) -> String {
        let mut url = format!(
            "{}/forecast?lat={}&lon={}&azimuth={}&tilt={}&power={}&powerInverter={}&inverterEfficiency={}",
            self.base_url.trim_end_matches('/'),
            plant.lat,
            plant.lon,
            plant.azimuth,
            plant.tilt,
            plant.peak_power_w,
            plant.inverter_power_w,
            plant.inverter_efficiency,
        );
        if let Some(horizon) = &plant.horizon {
            url.push_str(&format!("&horizont={horizon}"));
        }
        url
    }

    async fn fetch_plant(&self, plant: &PvPlantConfig, window_start: DateTime<Utc>) -> Result<(Vec<f64>, Vec<f64>)> {
        let url = self.plant_url(plant);
        let resp = self.client.get(&url).send().await.context("akkudoktor GET failed")?;
        let status = resp.status();
        let body = resp.text().await.context("akkudoktor body read failed")?;
        if !status.is_success() {
            anyhow::bail!("akkudoktor HTTP {status}: {body}");
        }
        let parsed: AkkudoktorResponse = serde_json::from_str(&body).context("akkudoktor JSON parse failed")?;

        let window_end = window_start + chrono::Duration::hours(48);
        let mut power = vec![0.0; 48];
        let mut temperature = vec![15.0; 48];

        for series in &parsed.values {
            for point in series {
                if point.datetime < window_start || point.datetime >= window_end {
                    continue;
                }
                let offset = (point.datetime - window_start).num_hours() as usize;
                if offset < 48 {
                    power[offset] += point.power;
                    if let Some(t) = point.temperature {
                        temperature[offset] = t;
                    }
                }
            }
        }

        Ok((power, temperature))
    }
}

#[async_trait]
impl PvSource for AkkudoktorPvSource {
    async fn forecast(&self) -> PvSnapshot {
        self.cache.read().await.clone()
    }

    async fn refresh(&self) -> Result<()> {
        let now_local = Utc::now().with_timezone(&self.tz);
        let midnight_local = now_local.date_naive().and_hms_opt(0, 0, 0).expect("midnight is valid");
        let window_start = self
            .tz
            .from_local_datetime(&midnight_local)
            .single()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let mut summed_power = vec![0.0; 48];
        let mut first_plant_temperature = None;

        for plant in &self.plants {
            let (power, temperature) = retry_with_backoff("pv", self.max_retries, Duration::from_secs(5), || {
                self.fetch_plant(plant, window_start)
            })
            .await?;
            for (acc, v) in summed_power.iter_mut().zip(power.iter()) {
                *acc += v;
            }
            if first_plant_temperature.is_none() {
                first_plant_temperature = Some(temperature);
            }
        }

        *self.cache.write().await = PvSnapshot {
            power_wh: summed_power,
            temperature_c: first_plant_temperature.unwrap_or_else(|| vec![15.0; 48]),
            fetched_at: Utc::now(),
        };
        Ok(())
    }

    async fn shutdown(&self) {}
}

/// Zero-production test double.
pub struct NoopPvSource {
    snapshot: RwLock<PvSnapshot>,
}

impl NoopPvSource {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(PvSnapshot::zeroed()),
        }
    }
}

impl Default for NoopPvSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PvSource for NoopPvSource {
    async fn forecast(&self) -> PvSnapshot {
        self.snapshot.read().await.clone()
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
    async fn noop_source_returns_48_zero_entries() {
        let source = NoopPvSource::new();
        let snap = source.forecast().await;
        assert_eq!(snap.power_wh.len(), 48);
        assert!(snap.power_wh.iter().all(|&v| v == 0.0));
    }
}
