#![allow(dead_code)]
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One hour's worth of solver output (spec §3 ControlTuple).
///
/// Invariant: `ac_charge_demand_w >= 0 && dc_charge_demand_w >= 0`; entries
/// violating this, or built from unparseable solver fields, carry
/// `error = true` and are ignored by the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControlTuple {
    pub hour: u8,
    pub ac_charge_demand_w: f64,
    pub dc_charge_demand_w: f64,
    pub discharge_allowed: bool,
    pub error: bool,
}

impl ControlTuple {
    pub fn valid(hour: u8, ac_charge_demand_w: f64, dc_charge_demand_w: f64, discharge_allowed: bool) -> Self {
        let error = ac_charge_demand_w < 0.0 || dc_charge_demand_w < 0.0;
        Self {
            hour,
            ac_charge_demand_w: ac_charge_demand_w.max(0.0),
            dc_charge_demand_w: dc_charge_demand_w.max(0.0),
            discharge_allowed,
            error,
        }
    }

    pub fn errored(hour: u8) -> Self {
        Self {
            hour,
            ac_charge_demand_w: 0.0,
            dc_charge_demand_w: 0.0,
            discharge_allowed: false,
            error: true,
        }
    }
}

/// The state machine's output (spec §3 OverallState).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverallState {
    Auto = -2,
    Startup = -1,
    ChargeFromGrid = 0,
    AvoidDischarge = 1,
    DischargeAllowed = 2,
    AvoidDischargeEvccFast = 3,
    DischargeAllowedEvccPv = 4,
    DischargeAllowedEvccMinPv = 5,
}

impl OverallState {
    pub fn as_i8(self) -> i8 {
        self as i8
    }
}

impl fmt::Display for OverallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OverallState::Auto => "Auto",
            OverallState::Startup => "StartUp",
            OverallState::ChargeFromGrid => "Charge from Grid",
            OverallState::AvoidDischarge => "Avoid Discharge",
            OverallState::DischargeAllowed => "Discharge Allowed",
            OverallState::AvoidDischargeEvccFast => "Avoid Discharge EVCC FAST",
            OverallState::DischargeAllowedEvccPv => "Discharge Allowed EVCC PV",
            OverallState::DischargeAllowedEvccMinPv => "Discharge Allowed EVCC MIN+PV",
        };
        write!(f, "{s}")
    }
}

impl FromStr for OverallState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "-2" => Ok(OverallState::Auto),
            "-1" => Ok(OverallState::Startup),
            "0" => Ok(OverallState::ChargeFromGrid),
            "1" => Ok(OverallState::AvoidDischarge),
            "2" => Ok(OverallState::DischargeAllowed),
            "3" => Ok(OverallState::AvoidDischargeEvccFast),
            "4" => Ok(OverallState::DischargeAllowedEvccPv),
            "5" => Ok(OverallState::DischargeAllowedEvccMinPv),
            _ => Err(()),
        }
    }
}

/// A timed user-provided forcing of overall state bypassing the solver
/// (spec §3 Override).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Override {
    pub mode: OverrideMode,
    pub end_time: DateTime<Utc>,
    pub grid_charge_power_w: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverrideMode {
    Auto,
    Off,
    State(OverallStateCode),
}

/// Overrideable subset of `OverallState` (spec §6: `mode ∈ [-2, 2]`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverallStateCode {
    ChargeFromGrid = 0,
    AvoidDischarge = 1,
    DischargeAllowed = 2,
}

impl Override {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.mode == OverrideMode::Off || now >= self.end_time
    }
}

/// Request/response lifecycle for the optimization loop (spec §3 SchedulerState).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub last_request_ts: Option<DateTime<Utc>>,
    pub last_response_ts: Option<DateTime<Utc>>,
    pub next_run_ts: Option<DateTime<Utc>>,
    pub request_state: RequestState,
    pub last_avg_runtime_s: f64,
}

impl Default for SchedulerState {
    fn default() -> Self {
        Self {
            last_request_ts: None,
            last_response_ts: None,
            next_run_ts: None,
            request_state: RequestState::Idle,
            last_avg_runtime_s: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Idle,
    Sent,
    Received,
}

/// EVCC session snapshot (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EvccSnapshot {
    pub charging_state: EvccChargingState,
    pub charging_mode: EvccChargingMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EvccChargingState {
    #[default]
    Idle,
    Charging,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EvccChargingMode {
    #[default]
    Off,
    Now,
    Pv,
    MinPlusPv,
}

/// A single historical load sample (spec §3 LoadHistorySample).
///
/// Invariant: within a bucket, samples are ordered by ascending timestamp;
/// the trapezoidal aggregator treats each sample's value as valid until the
/// next sample's timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoadHistorySample {
    pub state: f64,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_tuple_negative_ac_is_marked_errored() {
        let tuple = ControlTuple::valid(3, -100.0, 200.0, true);
        assert!(tuple.error);
    }

    #[test]
    fn overall_state_round_trips_through_display_and_from_str() {
        for state in [
            OverallState::Auto,
            OverallState::Startup,
            OverallState::ChargeFromGrid,
            OverallState::AvoidDischarge,
            OverallState::DischargeAllowed,
            OverallState::AvoidDischargeEvccFast,
            OverallState::DischargeAllowedEvccPv,
            OverallState::DischargeAllowedEvccMinPv,
        ] {
            let code = state.as_i8().to_string();
            assert_eq!(OverallState::from_str(&code).unwrap(), state);
        }
    }

    #[test]
    fn override_expires_at_end_time() {
        let now = Utc::now();
        let o = Override {
            mode: OverrideMode::State(OverallStateCode::ChargeFromGrid),
            end_time: now,
            grid_charge_power_w: 2500.0,
        };
        assert!(o.is_expired(now));
        assert!(!o.is_expired(now - chrono::Duration::minutes(1)));
    }
}
