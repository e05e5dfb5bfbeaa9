//! EVCC (electric-vehicle charge controller) adapter (spec §4.1 EvccInterface).
#![allow(dead_code)]
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::info;

use crate::adapters::retry::retry_with_backoff;
use crate::config::EvccConfig;
use crate::domain::{EvccChargingMode, EvccChargingState, EvccSnapshot};
use crate::scheduler::events::CoordinatorEvents;

#[async_trait]
pub trait EvccSource: Send + Sync {
    async fn snapshot(&self) -> EvccSnapshot;
    async fn refresh(&self) -> Result<()>;
    /// Pushes a battery-mode command to EVCC's external-battery-controller
    /// API (spec §4.1, only meaningful when configured as such).
    async fn set_external_battery_mode(&self, mode: ExternalBatteryMode) -> Result<()>;
    async fn shutdown(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalBatteryMode {
    ForceCharge,
    AvoidDischarge,
    DischargeAllowed,
}

impl ExternalBatteryMode {
    fn as_wire_str(self) -> &'static str {
        match self {
            ExternalBatteryMode::ForceCharge => "force_charge",
            ExternalBatteryMode::AvoidDischarge => "avoid_discharge",
            ExternalBatteryMode::DischargeAllowed => "discharge_allowed",
        }
    }
}

#[derive(Deserialize)]
struct EvccStateResponse {
    result: EvccResult,
}

#[derive(Deserialize)]
struct EvccResult {
    loadpoints: Vec<EvccLoadpoint>,
}

#[derive(Deserialize)]
struct EvccLoadpoint {
    charging: bool,
    mode: String,
    #[serde(default)]
    vehicle_soc: Option<f64>,
}

pub struct HttpEvccSource {
    client: reqwest::Client,
    base_url: String,
    external_battery_controller: bool,
    cache: Arc<RwLock<EvccSnapshot>>,
    max_retries: u32,
    events: Option<Arc<dyn CoordinatorEvents>>,
}

impl HttpEvccSource {
    pub fn new(cfg: &EvccConfig, max_retries: u32, events: Option<Arc<dyn CoordinatorEvents>>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build EVCC HTTP client")?;
        Ok(Self {
            client,
            base_url: cfg.base_url.clone(),
            external_battery_controller: cfg.external_battery_controller,
            cache: Arc::new(RwLock::new(EvccSnapshot::default())),
            max_retries,
            events,
        })
    }

    async fn fetch(&self) -> Result<EvccSnapshot> {
        let url = format!("{}/api/state", self.base_url.trim_end_matches('/'));
        let resp = self.client.get(&url).send().await.context("EVCC state GET failed")?;
        let status = resp.status();
        let body = resp.text().await.context("EVCC body read failed")?;
        if !status.is_success() {
            anyhow::bail!("EVCC HTTP {status}: {body}");
        }
        let parsed: EvccStateResponse = serde_json::from_str(&body).context("EVCC JSON parse failed")?;
        let loadpoint = parsed.result.loadpoints.into_iter().next().context("EVCC response has no loadpoints")?;

        let charging_state = if !loadpoint.charging {
            if loadpoint.vehicle_soc.unwrap_or(0.0) >= 100.0 {
                EvccChargingState::Complete
            } else {
                EvccChargingState::Idle
            }
        } else {
            EvccChargingState::Charging
        };

        let charging_mode = match loadpoint.mode.as_str() {
            "now" => EvccChargingMode::Now,
            "pv" => EvccChargingMode::Pv,
            "minpv" | "min+pv" => EvccChargingMode::MinPlusPv,
            _ => EvccChargingMode::Off,
        };

        Ok(EvccSnapshot { charging_state, charging_mode })
    }
}

#[async_trait]
impl EvccSource for HttpEvccSource {
    async fn snapshot(&self) -> EvccSnapshot {
        *self.cache.read().await
    }

    async fn refresh(&self) -> Result<()> {
        let fresh = retry_with_backoff("evcc", self.max_retries, Duration::from_secs(2), || self.fetch()).await?;
        let mut cache = self.cache.write().await;
        let changed = *cache != fresh;
        if changed {
            info!(?fresh, "EVCC session snapshot changed");
        }
        *cache = fresh;
        drop(cache);
        if changed {
            if let Some(events) = &self.events {
                events.on_evcc_changed(fresh).await;
            }
        }
        Ok(())
    }

    async fn set_external_battery_mode(&self, mode: ExternalBatteryMode) -> Result<()> {
        if !self.external_battery_controller {
            return Ok(());
        }
        let url = format!("{}/api/batterymode", self.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "mode": mode.as_wire_str() }))
            .send()
            .await
            .context("EVCC batterymode POST failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("EVCC batterymode HTTP {}", resp.status());
        }
        Ok(())
    }

    async fn shutdown(&self) {}
}

/// Idle/off test double.
pub struct FixedEvccSource {
    snapshot: RwLock<EvccSnapshot>,
}

impl FixedEvccSource {
    pub fn new(snapshot: EvccSnapshot) -> Self {
        Self {
            snapshot: RwLock::new(snapshot),
        }
    }

    pub async fn set(&self, snapshot: EvccSnapshot) {
        *self.snapshot.write().await = snapshot;
    }
}

#[async_trait]
impl EvccSource for FixedEvccSource {
    async fn snapshot(&self) -> EvccSnapshot {
        *self.snapshot.read().await
    }

    async fn refresh(&self) -> Result<()> {
        Ok(())
    }

    async fn set_external_battery_mode(&self, _mode: ExternalBatteryMode) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fixed_source_round_trips_snapshot() {
        let source = FixedEvccSource::new(EvccSnapshot {
            charging_state: EvccChargingState::Charging,
            charging_mode: EvccChargingMode::Now,
        });
        let snap = source.snapshot().await;
        assert_eq!(snap.charging_state, EvccChargingState::Charging);
        assert_eq!(snap.charging_mode, EvccChargingMode::Now);
    }
}
