#![allow(dead_code)]
use serde::{Deserialize, Serialize};

/// Which EOS wire shape to emit (spec §4.2.8 version negotiation).
///
/// `DeviceAware` adds `device_id` fields on battery/inverter/ev/deferrable
/// blocks and a `battery_id` link on the inverter block, matching solver
/// versions >= the configured cutover date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ApiVersion {
    #[default]
    Legacy,
    DeviceAware,
}

/// The solver input (spec §3 OptimizationRequest).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationRequest {
    pub ems: EmsBlock,
    pub battery: BatteryBlock,
    pub inverter: InverterBlock,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ev: Option<EvBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deferrable_load: Option<DeferrableLoadBlock>,
    pub temperature_forecast: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_solution: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmsBlock {
    pub pv_forecast_wh: Vec<f64>,
    pub price_eur_per_wh: Vec<f64>,
    pub feedin_price_eur_per_wh: Vec<f64>,
    pub load_profile_wh: Vec<f64>,
    pub battery_wear_cost_eur_per_wh: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatteryBlock {
    pub capacity_wh: f64,
    pub charge_eff: f64,
    pub discharge_eff: f64,
    pub max_charge_w: f64,
    pub initial_soc_pct: f64,
    pub min_soc_pct: f64,
    pub max_soc_pct: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InverterBlock {
    pub max_power_wh: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvBlock {
    pub capacity_wh: f64,
    pub charge_eff: f64,
    pub max_charge_w: f64,
    pub initial_soc_pct: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferrableLoadBlock {
    pub energy_wh: f64,
    pub duration_h: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl OptimizationRequest {
    /// Inject `device_id`/`battery_id` fields when negotiating against a
    /// device-aware EOS version (spec §4.2.8).
    pub fn apply_version(&mut self, version: ApiVersion, device_id: &str) {
        if version != ApiVersion::DeviceAware {
            return;
        }
        self.battery.device_id = Some(device_id.to_string());
        self.inverter.device_id = Some(device_id.to_string());
        self.inverter.battery_id = Some(device_id.to_string());
        if let Some(ev) = self.ev.as_mut() {
            ev.device_id = Some(device_id.to_string());
        }
        if let Some(load) = self.deferrable_load.as_mut() {
            load.device_id = Some(device_id.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> OptimizationRequest {
        OptimizationRequest {
            ems: EmsBlock {
                pv_forecast_wh: vec![0.0; 48],
                price_eur_per_wh: vec![0.0001; 48],
                feedin_price_eur_per_wh: vec![0.00004; 48],
                load_profile_wh: vec![300.0; 48],
                battery_wear_cost_eur_per_wh: 0.0001,
            },
            battery: BatteryBlock {
                capacity_wh: 10_000.0,
                charge_eff: 0.95,
                discharge_eff: 0.95,
                max_charge_w: 5000.0,
                initial_soc_pct: 50.0,
                min_soc_pct: 10.0,
                max_soc_pct: 95.0,
                device_id: None,
            },
            inverter: InverterBlock {
                max_power_wh: 8000.0,
                device_id: None,
                battery_id: None,
            },
            ev: Some(EvBlock {
                capacity_wh: 60_000.0,
                charge_eff: 0.9,
                max_charge_w: 11_000.0,
                initial_soc_pct: 40.0,
                device_id: None,
            }),
            deferrable_load: None,
            temperature_forecast: vec![15.0; 48],
            start_solution: None,
        }
    }

    #[test]
    fn legacy_version_never_emits_device_ids() {
        let mut req = sample_request();
        req.apply_version(ApiVersion::Legacy, "batt-1");
        assert!(req.battery.device_id.is_none());
        assert!(req.inverter.device_id.is_none());
    }

    #[test]
    fn device_aware_version_populates_ids_on_present_blocks_only() {
        let mut req = sample_request();
        req.apply_version(ApiVersion::DeviceAware, "batt-1");
        assert_eq!(req.battery.device_id.as_deref(), Some("batt-1"));
        assert_eq!(req.inverter.battery_id.as_deref(), Some("batt-1"));
        assert_eq!(req.ev.unwrap().device_id.as_deref(), Some("batt-1"));
        assert!(req.deferrable_load.is_none());
    }
}
