//! Day-ahead price adapter (spec §4.1 PriceInterface, §6 Tibber example).
#![allow(dead_code)]
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::warn;

use crate::adapters::retry::retry_with_backoff;
use crate::config::PriceConfig;

/// A 48-length, hour-indexed snapshot starting at today's local midnight.
#[derive(Debug, Clone)]
pub struct PriceSnapshot {
    pub price_eur_per_wh: Vec<f64>,
    pub feedin_price_eur_per_wh: Vec<f64>,
    pub fetched_at: DateTime<Utc>,
}

impl PriceSnapshot {
    fn flat(value_eur_per_wh: f64, feedin_fraction: f64) -> Self {
        Self {
            price_eur_per_wh: vec![value_eur_per_wh; 48],
            feedin_price_eur_per_wh: vec![value_eur_per_wh * feedin_fraction; 48],
            fetched_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn prices(&self) -> PriceSnapshot;
    async fn refresh(&self) -> Result<()>;
    async fn shutdown(&self);
}

#[derive(Deserialize)]
struct TibberResponse {
    data: TibberData,
}

#[derive(Deserialize)]
struct TibberData {
    viewer: TibberViewer,
}

#[derive(Deserialize)]
struct TibberViewer {
    homes: Vec<TibberHome>,
}

#[derive(Deserialize)]
struct TibberHome {
    #[serde(rename = "currentSubscription")]
    current_subscription: TibberSubscription,
}

#[derive(Deserialize)]
struct TibberSubscription {
    #[serde(rename = "priceInfo")]
    price_info: TibberPriceInfo,
}

#[derive(Deserialize)]
struct TibberPriceInfo {
    today: Vec<TibberPricePoint>,
    tomorrow: Vec<TibberPricePoint>,
}

#[derive(Deserialize)]
struct TibberPricePoint {
    total: f64,
    #[serde(rename = "startsAt")]
    starts_at: DateTime<Utc>,
}

const TIBBER_QUERY: &str = "{viewer{homes{currentSubscription{priceInfo{today{total startsAt} tomorrow{total startsAt}}}}}}";

/// Polls a Tibber-shaped GraphQL endpoint for today+tomorrow hourly prices
/// (spec §6). Falls back to repeating today's curve when tomorrow isn't
/// published yet (typically before ~13:00 CET).
pub struct TibberPriceSource {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
    feedin_fraction: f64,
    cache: Arc<RwLock<PriceSnapshot>>,
    max_retries: u32,
}

impl TibberPriceSource {
    pub fn new(cfg: &PriceConfig, max_retries: u32) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.http_timeout_secs))
            .build()
            .context("failed to build price HTTP client")?;
        Ok(Self {
            client,
            url: cfg.base_url.clone(),
            token: cfg.api_token.clone(),
            feedin_fraction: cfg.feedin_price_fraction,
            cache: Arc::new(RwLock::new(PriceSnapshot::flat(0.0, cfg.feedin_price_fraction))),
            max_retries,
        })
    }

    async fn fetch(&self) -> Result<PriceSnapshot> {
        let mut req = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "query": TIBBER_QUERY }));
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await.context("tibber request failed")?;
        let status = resp.status();
        let body = resp.text().await.context("tibber body read failed")?;
        if !status.is_success() {
            anyhow::bail!("tibber HTTP {status}: {body}");
        }
        let parsed: TibberResponse = serde_json::from_str(&body).context("tibber JSON parse failed")?;
        let home = parsed
            .data
            .viewer
            .homes
            .into_iter()
            .next()
            .context("tibber response has no homes")?;
        let info = home.current_subscription.price_info;

        let today = points_to_eur_per_wh(info.today);
        let mut combined = today.clone();
        if info.tomorrow.is_empty() {
            warn!("tibber tomorrow prices unavailable, repeating today's curve");
            combined.extend(today);
        } else {
            combined.extend(points_to_eur_per_wh(info.tomorrow));
        }
        combined.truncate(48);
        while combined.len() < 48 {
            combined.push(*combined.last().unwrap_or(&0.0));
        }

        let feedin = combined.iter().map(|p| p * self.feedin_fraction).collect();

        Ok(PriceSnapshot {
            price_eur_per_wh: combined,
            feedin_price_eur_per_wh: feedin,
            fetched_at: Utc::now(),
        })
    }
}

fn points_to_eur_per_wh(points: Vec<TibberPricePoint>) -> Vec<f64> {
    points.into_iter().map(|p| p.total / 1000.0).collect()
}

#[async_trait]
impl PriceSource for TibberPriceSource {
    async fn prices(&self) -> PriceSnapshot {
        self.cache.read().await.clone()
    }

    async fn refresh(&self) -> Result<()> {
        let cache = self.cache.clone();
        let snapshot = retry_with_backoff("price", self.max_retries, Duration::from_secs(5), || self.fetch()).await;
        match snapshot {
            Ok(snapshot) => {
                *cache.write().await = snapshot;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn shutdown(&self) {}
}

/// Constant-price test double (spec §4.1 "simulated adapter" pattern).
pub struct FlatPriceSource {
    snapshot: RwLock<PriceSnapshot>,
}

impl FlatPriceSource {
    pub fn new(price_eur_per_wh: f64, feedin_fraction: f64) -> Self {
        Self {
            snapshot: RwLock::new(PriceSnapshot::flat(price_eur_per_wh, feedin_fraction)),
        }
    }
}

#[async_trait]
impl PriceSource for FlatPriceSource {
    async fn prices(&self) -> PriceSnapshot {
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
    async fn flat_source_returns_48_entries() {
        let source = FlatPriceSource::new(0.0003, 0.4);
        let snap = source.prices().await;
        assert_eq!(snap.price_eur_per_wh.len(), 48);
        assert_eq!(snap.feedin_price_eur_per_wh[0], 0.0003 * 0.4);
    }

    #[test]
    fn points_convert_from_kwh_to_wh() {
        let points = vec![TibberPricePoint {
            total: 1.20,
            starts_at: Utc::now(),
        }];
        let out = points_to_eur_per_wh(points);
        assert!((out[0] - 0.0012).abs() < 1e-9);
    }
}
