//! Base Control state machine (spec §4.3): fuses solver output, override,
//! EVCC session, and battery SoC into a single `OverallState`.
#![allow(dead_code)]
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::domain::{EvccChargingMode, EvccChargingState, EvccSnapshot, OverallState, Override, OverrideMode};

#[derive(Debug, Clone, Copy)]
pub struct BaseControlInput {
    pub ac_charge_demand_w: f64,
    pub dc_charge_demand_w: f64,
    pub discharge_allowed: bool,
    pub battery_soc_percent: f64,
    pub battery_max_soc_percent: f64,
    pub battery_max_charge_power_dyn_w: f64,
    pub evcc: EvccSnapshot,
    pub plan_available: bool,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BaseControlOutput {
    pub overall_state: OverallState,
    pub tgt_ac_w: f64,
    pub tgt_dc_w: f64,
    /// True on the first tick after a state transition, or on the 5-minute
    /// heartbeat boundary for an unchanged state (spec §4.3).
    pub changed_recently: bool,
}

struct Memory {
    previous_state: Option<OverallState>,
    last_write: Option<DateTime<Utc>>,
}

/// Single-mutex-guarded state machine (spec §5: "single mutex, fine-grained
/// getters/setters").
pub struct BaseControl {
    memory: Mutex<Memory>,
    heartbeat_interval_minutes: i64,
}

impl BaseControl {
    pub fn new(heartbeat_minutes: u64) -> Self {
        Self {
            memory: Mutex::new(Memory {
                previous_state: None,
                last_write: None,
            }),
            heartbeat_interval_minutes: heartbeat_minutes as i64,
        }
    }

    pub async fn resolve(&self, input: BaseControlInput, active_override: Option<Override>) -> BaseControlOutput {
        let mut ac_demand = input.ac_charge_demand_w;

        // SoC safety clamp, applied before mode resolution (spec §4.3).
        if input.battery_soc_percent >= input.battery_max_soc_percent && ac_demand > 0.0 {
            warn!(
                soc = input.battery_soc_percent,
                max_soc = input.battery_max_soc_percent,
                "SoC at or above max, clamping AC charge demand to 0"
            );
            ac_demand = 0.0;
        }

        let (overall_state, grid_charge_power_override) = resolve_state(&input, active_override);

        let tgt_ac_w = match grid_charge_power_override {
            Some(power) => power,
            None => ac_demand.min(input.battery_max_charge_power_dyn_w),
        };
        let tgt_dc_w = input.dc_charge_demand_w.min(input.battery_max_charge_power_dyn_w);

        let mut memory = self.memory.lock().await;
        let transitioned = memory.previous_state != Some(overall_state);
        let heartbeat_due = memory
            .last_write
            .map(|last| (input.now - last).num_minutes() >= self.heartbeat_interval_minutes)
            .unwrap_or(true);
        let changed_recently = transitioned || heartbeat_due;

        if changed_recently {
            memory.last_write = Some(input.now);
        }
        memory.previous_state = Some(overall_state);

        BaseControlOutput {
            overall_state,
            tgt_ac_w,
            tgt_dc_w,
            changed_recently,
        }
    }
}

/// Pure resolution function, rules 1-6 evaluated in order (spec §4.3).
/// Returns the resolved state and, for a `CHARGE_FROM_GRID` override, the
/// operator-specified grid charge power to use in place of the solver's.
fn resolve_state(input: &BaseControlInput, active_override: Option<Override>) -> (OverallState, Option<f64>) {
    if let Some(ov) = active_override {
        if ov.mode != OverrideMode::Auto {
            let state = match ov.mode {
                OverrideMode::Off => OverallState::Auto,
                OverrideMode::Auto => unreachable!("handled above"),
                OverrideMode::State(code) => match code {
                    crate::domain::OverallStateCode::ChargeFromGrid => OverallState::ChargeFromGrid,
                    crate::domain::OverallStateCode::AvoidDischarge => OverallState::AvoidDischarge,
                    crate::domain::OverallStateCode::DischargeAllowed => OverallState::DischargeAllowed,
                },
            };
            let grid_power = matches!(state, OverallState::ChargeFromGrid).then_some(ov.grid_charge_power_w);
            return (state, grid_power);
        }
    }

    if !input.plan_available {
        return (OverallState::Startup, None);
    }

    let evcc_charging = input.evcc.charging_state == EvccChargingState::Charging;
    if evcc_charging {
        match input.evcc.charging_mode {
            EvccChargingMode::Now => return (OverallState::AvoidDischargeEvccFast, None),
            EvccChargingMode::Pv => return (OverallState::DischargeAllowedEvccPv, None),
            EvccChargingMode::MinPlusPv => return (OverallState::DischargeAllowedEvccMinPv, None),
            EvccChargingMode::Off => {
                debug!("EVCC charging with mode=off, falling through to solver-tuple mapping");
            }
        }
    }

    let state = if input.ac_charge_demand_w > 0.0 {
        OverallState::ChargeFromGrid
    } else if !input.discharge_allowed {
        OverallState::AvoidDischarge
    } else {
        OverallState::DischargeAllowed
    };
    (state, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn base_input(now: DateTime<Utc>) -> BaseControlInput {
        BaseControlInput {
            ac_charge_demand_w: 0.0,
            dc_charge_demand_w: 3000.0,
            discharge_allowed: true,
            battery_soc_percent: 60.0,
            battery_max_soc_percent: 95.0,
            battery_max_charge_power_dyn_w: 5000.0,
            evcc: EvccSnapshot::default(),
            plan_available: true,
            now,
        }
    }

    #[tokio::test]
    async fn happy_path_discharge_allowed() {
        let bc = BaseControl::new(5);
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let out = bc.resolve(base_input(now), None).await;
        assert_eq!(out.overall_state, OverallState::DischargeAllowed);
        assert!(out.changed_recently);

        let out2 = bc.resolve(base_input(now), None).await;
        assert_eq!(out2.overall_state, OverallState::DischargeAllowed);
        assert!(!out2.changed_recently, "second identical tick should not re-signal a write");
    }

    #[tokio::test]
    async fn soc_clamp_forces_ac_demand_to_zero() {
        let bc = BaseControl::new(5);
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let mut input = base_input(now);
        input.ac_charge_demand_w = 2000.0;
        input.discharge_allowed = false;
        input.battery_soc_percent = 96.0;
        let out = bc.resolve(input, None).await;
        assert_eq!(out.overall_state, OverallState::AvoidDischarge);
        assert_eq!(out.tgt_ac_w, 0.0);
    }

    #[tokio::test]
    async fn override_charge_from_grid_uses_operator_power() {
        let bc = BaseControl::new(5);
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let ov = Override {
            mode: OverrideMode::State(crate::domain::OverallStateCode::ChargeFromGrid),
            end_time: now + chrono::Duration::minutes(90),
            grid_charge_power_w: 2500.0,
        };
        let out = bc.resolve(base_input(now), Some(ov)).await;
        assert_eq!(out.overall_state, OverallState::ChargeFromGrid);
        assert_eq!(out.tgt_ac_w, 2500.0);
    }

    #[tokio::test]
    async fn no_plan_yields_startup() {
        let bc = BaseControl::new(5);
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let mut input = base_input(now);
        input.plan_available = false;
        let out = bc.resolve(input, None).await;
        assert_eq!(out.overall_state, OverallState::Startup);
    }

    #[tokio::test]
    async fn evcc_fast_charge_preempts_solver_plan() {
        let bc = BaseControl::new(5);
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let mut input = base_input(now);
        input.evcc = EvccSnapshot {
            charging_state: EvccChargingState::Charging,
            charging_mode: EvccChargingMode::Now,
        };
        let out = bc.resolve(input, None).await;
        assert_eq!(out.overall_state, OverallState::AvoidDischargeEvccFast);
    }

    #[tokio::test]
    async fn heartbeat_fires_after_five_minutes_without_transition() {
        let bc = BaseControl::new(5);
        let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let out0 = bc.resolve(base_input(t0), None).await;
        assert!(out0.changed_recently);

        let t1 = t0 + chrono::Duration::minutes(2);
        let out1 = bc.resolve(base_input(t1), None).await;
        assert!(!out1.changed_recently);

        let t2 = t0 + chrono::Duration::minutes(5);
        let out2 = bc.resolve(base_input(t2), None).await;
        assert!(out2.changed_recently);
    }

    /// P2: with `soc >= max_soc ∧ ac_demand_in > 0`, the resolved AC demand
    /// is always clamped to zero, across a range of SoC/demand/max-power
    /// combinations.
    #[rstest]
    #[case(95.0, 95.0, 1000.0, 5000.0)]
    #[case(96.0, 95.0, 2500.0, 5000.0)]
    #[case(100.0, 90.0, 500.0, 3000.0)]
    #[case(95.01, 95.0, 1.0, 1000.0)]
    #[tokio::test]
    async fn soc_clamp_holds_across_soc_and_demand_combinations(
        #[case] soc_percent: f64,
        #[case] max_soc_percent: f64,
        #[case] ac_demand_in: f64,
        #[case] max_charge_power_dyn_w: f64,
    ) {
        let bc = BaseControl::new(5);
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let mut input = base_input(now);
        input.battery_soc_percent = soc_percent;
        input.battery_max_soc_percent = max_soc_percent;
        input.ac_charge_demand_w = ac_demand_in;
        input.battery_max_charge_power_dyn_w = max_charge_power_dyn_w;
        input.discharge_allowed = false;
        let out = bc.resolve(input, None).await;
        assert_eq!(out.tgt_ac_w, 0.0);
    }

    /// P5: applying the same resolved state twice in succession signals a
    /// write exactly once — the second, identical tick is suppressed.
    #[rstest]
    #[case(0.0, true)]
    #[case(2000.0, false)]
    #[case(1500.0, true)]
    #[tokio::test]
    async fn applying_same_state_twice_writes_exactly_once(#[case] ac_demand_w: f64, #[case] discharge_allowed: bool) {
        let bc = BaseControl::new(5);
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let mut input = base_input(now);
        input.ac_charge_demand_w = ac_demand_w;
        input.discharge_allowed = discharge_allowed;

        let first = bc.resolve(input, None).await;
        assert!(first.changed_recently, "first tick must signal a write");

        let second = bc.resolve(input, None).await;
        assert!(!second.changed_recently, "second identical tick must not re-signal a write");
        assert_eq!(first.overall_state, second.overall_state);
    }
}
