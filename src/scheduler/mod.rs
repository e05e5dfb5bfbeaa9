//! Scheduler: the three cooperating loops (spec §4.5) plus the
//! constructor-injected `CoordinatorEvents` callback path (spec §9).
//!
//! Grounded on the donor's `controller::spawn_controller_tasks`
//! (independent `tokio::spawn`ed loops over `Arc`-shared state) and
//! `BatteryController::run`'s tick-with-interruptible-sleep pattern,
//! generalized from one loop to three.
#![allow(dead_code)]
pub mod events;

pub use events::{CoordinatorEvents, EventsHandle, OverrideCommand};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::adapters::battery::BatterySource;
use crate::adapters::evcc::EvccSource;
use crate::adapters::inverter::InverterSink;
use crate::adapters::load::LoadProfileSource;
use crate::adapters::price::PriceSource;
use crate::adapters::pv::PvSource;
use crate::base_control::{BaseControl, BaseControlInput};
use crate::config::{BatteryConfig, ControllerConfig};
use crate::domain::{
    BatteryBlock, ControlPlan, EmsBlock, EvccSnapshot, InverterBlock, OptimizationRequest, OverallState,
    OverallStateCode, Override, OverrideMode, SchedulerState,
};
use crate::eos::EosClient;

/// Fans telemetry out over MQTT (spec §4.6); implemented by the MQTT
/// bridge and injected at construction time. `None` when MQTT is disabled.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn publish_current_controls(&self, snapshot: &CurrentControlsSnapshot);
    async fn publish_inverter_data(&self, data: &HashMap<String, f64>);
}

/// `/json/current_controls.json` response shape (spec §6).
#[derive(Debug, Clone, Serialize)]
pub struct CurrentControlsSnapshot {
    pub current_states: CurrentStates,
    pub evcc: EvccSnapshot,
    pub battery: BatteryStatus,
    pub state: SchedulerState,
    pub timestamp: DateTime<Utc>,
    pub api_version: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct CurrentStates {
    pub ac_charge_demand: f64,
    pub dc_charge_demand: f64,
    pub discharge_allowed: bool,
    pub inverter_mode: String,
    pub inverter_mode_num: i8,
    pub override_active: bool,
    pub override_end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct BatteryStatus {
    pub soc: f64,
    pub usable_capacity: f64,
    pub max_charge_power_dyn: f64,
    pub max_grid_charge_rate: f64,
}

struct LastApplied {
    overall_state: Option<OverallState>,
    tgt_ac_w: f64,
    snapshot: Option<CurrentControlsSnapshot>,
}

/// Per-adapter refresh cadence (spec §4.5 "each source polls its own
/// interval"), one field per HTTP-backed source adapter.
#[derive(Debug, Clone, Copy)]
pub struct PollIntervals {
    pub price_secs: u64,
    pub pv_secs: u64,
    pub load_secs: u64,
    pub battery_secs: u64,
    pub evcc_secs: u64,
}

/// Owns the adapters, the EOS client, Base Control, the inverter sink and
/// the lifecycle of the three cooperating loops (spec §3 "the scheduler
/// owns... the lifecycle of adapters").
pub struct Scheduler {
    cfg: ControllerConfig,
    tz: Tz,
    eos: Arc<EosClient>,
    price: Arc<dyn PriceSource>,
    pv: Arc<dyn PvSource>,
    load: Arc<dyn LoadProfileSource>,
    battery: Arc<dyn BatterySource>,
    battery_cfg: BatteryConfig,
    evcc: Arc<dyn EvccSource>,
    inverter: Arc<dyn InverterSink>,
    base_control: Arc<BaseControl>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    poll_intervals: PollIntervals,

    /// Single-writer/multi-reader latest-plan handoff (spec §5
    /// "single-pointer swap"; SPEC_FULL.md resolves this to `watch`).
    /// The timestamp is when the plan was fetched, used to derive which
    /// hour-offset into `entries` is "now".
    plan_tx: watch::Sender<Option<(ControlPlan, DateTime<Utc>)>>,
    plan_rx: watch::Receiver<Option<(ControlPlan, DateTime<Utc>)>>,

    override_state: RwLock<Option<Override>>,
    last_applied: Mutex<LastApplied>,
    stopping: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: ControllerConfig,
        tz: Tz,
        eos: Arc<EosClient>,
        price: Arc<dyn PriceSource>,
        pv: Arc<dyn PvSource>,
        load: Arc<dyn LoadProfileSource>,
        battery: Arc<dyn BatterySource>,
        battery_cfg: BatteryConfig,
        evcc: Arc<dyn EvccSource>,
        inverter: Arc<dyn InverterSink>,
        telemetry: Option<Arc<dyn TelemetrySink>>,
        poll_intervals: PollIntervals,
    ) -> Arc<Self> {
        let (plan_tx, plan_rx) = watch::channel(None);
        let heartbeat_minutes = cfg.heartbeat_minutes;
        Arc::new(Self {
            cfg,
            tz,
            eos,
            price,
            pv,
            load,
            battery,
            battery_cfg,
            evcc,
            inverter,
            base_control: Arc::new(BaseControl::new(heartbeat_minutes)),
            telemetry,
            poll_intervals,
            plan_tx,
            plan_rx,
            override_state: RwLock::new(None),
            last_applied: Mutex::new(LastApplied {
                overall_state: None,
                tgt_ac_w: 0.0,
                snapshot: None,
            }),
            stopping: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Sleeps `dur` in <=1s slices so a shutdown signal stops any loop
    /// within 1s (spec §5 suspension points).
    async fn interruptible_sleep(&self, dur: Duration) {
        let mut remaining = dur;
        let slice = Duration::from_secs(1);
        while remaining > Duration::ZERO {
            if self.stopping.load(Ordering::Relaxed) {
                return;
            }
            let step = remaining.min(slice);
            tokio::time::sleep(step).await;
            remaining = remaining.saturating_sub(step);
        }
    }

    fn stopped(&self) -> bool {
        self.stopping.load(Ordering::Relaxed)
    }

    /// Starts the three loops as independent tasks (spec §4.5). Returns
    /// once all three are spawned; does not block.
    pub fn spawn(self: &Arc<Self>) {
        let opt = Arc::clone(self);
        let control = Arc::clone(self);
        let data = Arc::clone(self);
        let price = Arc::clone(self);
        let pv = Arc::clone(self);
        let load = Arc::clone(self);
        let battery = Arc::clone(self);
        let evcc = Arc::clone(self);

        let handles = vec![
            tokio::spawn(async move { opt.run_optimization_loop().await }),
            tokio::spawn(async move { control.run_control_loop().await }),
            tokio::spawn(async move { data.run_data_loop().await }),
            tokio::spawn(async move { price.run_price_poll_loop().await }),
            tokio::spawn(async move { pv.run_pv_poll_loop().await }),
            tokio::spawn(async move { load.run_load_poll_loop().await }),
            tokio::spawn(async move { battery.run_battery_poll_loop().await }),
            tokio::spawn(async move { evcc.run_evcc_poll_loop().await }),
        ];

        // `tasks` is only ever locked from async contexts already holding
        // no other lock, so `try_lock` always succeeds here.
        if let Ok(mut tasks) = self.tasks.try_lock() {
            tasks.extend(handles);
        }
    }

    /// Sets the stop flag and joins all loops within `shutdown_grace_seconds`
    /// (spec §5, P7).
    pub async fn shutdown(&self) {
        self.stopping.store(true, Ordering::Relaxed);
        self.inverter
            .shutdown()
            .await
            .unwrap_or_else(|e| warn!(error = %e, "inverter shutdown failed"));
        self.evcc.shutdown().await;
        self.price.shutdown().await;
        self.pv.shutdown().await;
        self.load.shutdown().await;
        self.battery.shutdown().await;

        let grace = Duration::from_secs(self.cfg.shutdown_grace_seconds);
        let mut tasks = self.tasks.lock().await;
        let join_all = async {
            for task in tasks.drain(..) {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(grace, join_all).await.is_err() {
            warn!("scheduler loops did not join within the shutdown grace period");
        }
    }

    // --- Optimization Loop (spec §4.5) --------------------------------

    async fn run_optimization_loop(&self) {
        info!("optimization loop started");
        while !self.stopped() {
            let now = Utc::now();
            match self.build_request().await {
                Ok(request) => match self.eos.submit(request, self.tz).await {
                    Ok(plan) => {
                        info!(start_hour = plan.start_hour, "optimization cycle succeeded");
                        let _ = self.plan_tx.send(Some((plan, Utc::now())));
                    }
                    Err(e) => {
                        warn!(error = %e, "solver call failed, retaining previous plan");
                    }
                },
                Err(e) => warn!(error = %e, "failed to build optimization request, skipping this cycle"),
            }

            let avg_runtime = self.eos.scheduler_state().await.last_avg_runtime_s;
            let base_interval = Duration::from_secs(self.cfg.refresh_interval_minutes * 60);
            let next_run = EosClient::calculate_next_run_time(now, avg_runtime, base_interval);
            let sleep_for = (next_run - Utc::now()).to_std().unwrap_or(base_interval);
            self.interruptible_sleep(sleep_for).await;
        }
        info!("optimization loop stopped");
    }

    async fn build_request(&self) -> anyhow::Result<OptimizationRequest> {
        let prices = self.price.prices().await;
        let pv = self.pv.forecast().await;
        let load = self.load.profile().await;
        let battery = self.battery.snapshot().await;

        Ok(OptimizationRequest {
            ems: EmsBlock {
                pv_forecast_wh: pv.power_wh,
                price_eur_per_wh: prices.price_eur_per_wh,
                feedin_price_eur_per_wh: prices.feedin_price_eur_per_wh,
                load_profile_wh: load,
                battery_wear_cost_eur_per_wh: self.battery_cfg.wear_cost_eur_per_wh,
            },
            battery: BatteryBlock {
                capacity_wh: self.battery_cfg.capacity_wh,
                charge_eff: self.battery_cfg.charge_efficiency,
                discharge_eff: self.battery_cfg.discharge_efficiency,
                max_charge_w: self.battery_cfg.max_charge_power_w,
                initial_soc_pct: battery.soc_percent,
                min_soc_pct: self.battery_cfg.min_soc_percent,
                max_soc_pct: self.battery_cfg.max_soc_percent,
                device_id: None,
            },
            inverter: InverterBlock {
                max_power_wh: self.battery_cfg.max_discharge_power_w,
                device_id: None,
                battery_id: None,
            },
            ev: None,
            deferrable_load: None,
            temperature_forecast: pv.temperature_c,
            start_solution: None,
        })
    }

    // --- Control Loop (spec §4.5) -------------------------------------

    async fn run_control_loop(&self) {
        info!("control loop started");
        let tick = Duration::from_secs(self.cfg.control_tick_seconds);
        while !self.stopped() {
            self.tick_control().await;
            self.interruptible_sleep(tick).await;
        }
        info!("control loop stopped");
    }

    /// One control-loop evaluation: select the current hour's plan entry,
    /// fuse it through Base Control, apply it if changed, and publish
    /// telemetry (spec §4.5 Control Loop steps 1-4). Also the synchronous
    /// re-entry point for `CoordinatorEvents` callbacks (spec §4.5
    /// "callbacks reroute into the control loop").
    async fn tick_control(&self) {
        let now = Utc::now();
        let plan_handoff = self.plan_rx.borrow().clone();
        let evcc = self.evcc.snapshot().await;
        let battery = self.battery.snapshot().await;
        let active_override = self.current_override(now).await;

        let entry = plan_handoff.as_ref().and_then(|(plan, fetched_at)| {
            let elapsed_hours = (now - *fetched_at).num_hours().max(0) as usize;
            plan.entry_at_offset(elapsed_hours)
        });

        let input = BaseControlInput {
            ac_charge_demand_w: entry.map(|e| e.ac_charge_demand_w).unwrap_or(0.0),
            dc_charge_demand_w: entry.map(|e| e.dc_charge_demand_w).unwrap_or(0.0),
            discharge_allowed: entry.map(|e| e.discharge_allowed).unwrap_or(false),
            battery_soc_percent: battery.soc_percent,
            battery_max_soc_percent: self.battery_cfg.max_soc_percent,
            battery_max_charge_power_dyn_w: battery.max_charge_power_dyn_w,
            evcc,
            plan_available: entry.is_some(),
            now,
        };

        let output = self
            .base_control
            .resolve(input, active_override.clone())
            .await;

        if output.changed_recently {
            self.apply_state(output.overall_state, output.tgt_ac_w, output.tgt_dc_w).await;
        }

        let snapshot = self.build_snapshot(&output, &evcc, battery, active_override).await;
        if let Some(telemetry) = &self.telemetry {
            telemetry.publish_current_controls(&snapshot).await;
        }
        self.last_applied.lock().await.snapshot = Some(snapshot);
    }

    async fn apply_state(&self, state: OverallState, tgt_ac_w: f64, tgt_dc_w: f64) {
        let result = match state {
            OverallState::ChargeFromGrid => self.inverter.set_mode_force_charge(tgt_ac_w).await,
            OverallState::AvoidDischarge | OverallState::AvoidDischargeEvccFast => {
                self.inverter.set_mode_avoid_discharge().await
            }
            OverallState::DischargeAllowed
            | OverallState::DischargeAllowedEvccPv
            | OverallState::DischargeAllowedEvccMinPv => self.inverter.set_mode_allow_discharge().await,
            OverallState::Auto | OverallState::Startup => Ok(()),
        };
        if let Err(e) = result {
            warn!(error = %e, ?state, "failed to apply overall state to inverter");
            return;
        }
        if let Err(e) = self.inverter.api_set_max_pv_charge_rate(tgt_dc_w).await {
            warn!(error = %e, "failed to set max PV charge rate");
        }
        info!(%state, tgt_ac_w, tgt_dc_w, "applied overall state to inverter");
    }

    async fn current_override(&self, now: DateTime<Utc>) -> Option<Override> {
        let mut guard = self.override_state.write().await;
        if let Some(ov) = guard.as_ref() {
            if ov.is_expired(now) {
                info!("override expired, reverting to solver-derived state");
                *guard = None;
            }
        }
        guard.clone()
    }

    async fn build_snapshot(
        &self,
        output: &crate::base_control::BaseControlOutput,
        evcc: &EvccSnapshot,
        battery: crate::adapters::battery::BatterySnapshot,
        active_override: Option<Override>,
    ) -> CurrentControlsSnapshot {
        let state = self.eos.scheduler_state().await;
        CurrentControlsSnapshot {
            current_states: CurrentStates {
                ac_charge_demand: output.tgt_ac_w,
                dc_charge_demand: output.tgt_dc_w,
                discharge_allowed: matches!(
                    output.overall_state,
                    OverallState::DischargeAllowed
                        | OverallState::DischargeAllowedEvccPv
                        | OverallState::DischargeAllowedEvccMinPv
                ),
                inverter_mode: output.overall_state.to_string(),
                inverter_mode_num: output.overall_state.as_i8(),
                override_active: active_override.is_some(),
                override_end_time: active_override.map(|o| o.end_time),
            },
            evcc: *evcc,
            battery: BatteryStatus {
                soc: battery.soc_percent,
                usable_capacity: battery.usable_capacity_wh,
                max_charge_power_dyn: battery.max_charge_power_dyn_w,
                max_grid_charge_rate: self.battery_cfg.max_charge_power_w,
            },
            state,
            timestamp: Utc::now(),
            api_version: "v1",
        }
    }

    // --- Data Loop (spec §4.5) ----------------------------------------

    async fn run_data_loop(&self) {
        info!("data loop started");
        let tick = Duration::from_secs(self.cfg.data_loop_seconds);
        while !self.stopped() {
            match self.inverter.fetch_inverter_data().await {
                Ok(data) => {
                    if let Some(telemetry) = &self.telemetry {
                        telemetry.publish_inverter_data(&data).await;
                    }
                }
                Err(e) => warn!(error = %e, "failed to poll inverter diagnostics"),
            }
            self.interruptible_sleep(tick).await;
        }
        info!("data loop stopped");
    }

    // --- Adapter poll loops (spec §4.5, one per HTTP-backed source) --

    async fn run_price_poll_loop(&self) {
        info!("price poll loop started");
        let tick = Duration::from_secs(self.poll_intervals.price_secs);
        while !self.stopped() {
            if let Err(e) = self.price.refresh().await {
                warn!(error = %e, "failed to refresh price data");
            }
            self.interruptible_sleep(tick).await;
        }
        info!("price poll loop stopped");
    }

    async fn run_pv_poll_loop(&self) {
        info!("pv poll loop started");
        let tick = Duration::from_secs(self.poll_intervals.pv_secs);
        while !self.stopped() {
            if let Err(e) = self.pv.refresh().await {
                warn!(error = %e, "failed to refresh PV forecast");
            }
            self.interruptible_sleep(tick).await;
        }
        info!("pv poll loop stopped");
    }

    async fn run_load_poll_loop(&self) {
        info!("load poll loop started");
        let tick = Duration::from_secs(self.poll_intervals.load_secs);
        while !self.stopped() {
            if let Err(e) = self.load.refresh().await {
                warn!(error = %e, "failed to refresh load profile");
            }
            self.interruptible_sleep(tick).await;
        }
        info!("load poll loop stopped");
    }

    async fn run_battery_poll_loop(&self) {
        info!("battery poll loop started");
        let tick = Duration::from_secs(self.poll_intervals.battery_secs);
        while !self.stopped() {
            if let Err(e) = self.battery.refresh().await {
                warn!(error = %e, "failed to refresh battery snapshot");
            }
            self.interruptible_sleep(tick).await;
        }
        info!("battery poll loop stopped");
    }

    async fn run_evcc_poll_loop(&self) {
        info!("evcc poll loop started");
        let tick = Duration::from_secs(self.poll_intervals.evcc_secs);
        while !self.stopped() {
            if let Err(e) = self.evcc.refresh().await {
                warn!(error = %e, "failed to refresh EVCC session state");
            }
            self.interruptible_sleep(tick).await;
        }
        info!("evcc poll loop stopped");
    }

    // --- HTTP surface accessors (spec §6) ------------------------------

    pub async fn current_controls(&self) -> Option<CurrentControlsSnapshot> {
        self.last_applied.lock().await.snapshot.clone()
    }

    pub async fn last_request_json(&self) -> Option<serde_json::Value> {
        self.eos.last_request_json().await
    }

    pub async fn last_response_json(&self) -> Option<serde_json::Value> {
        self.eos.last_response_json().await
    }

    /// Validates and installs an override (spec §6 POST validation).
    pub async fn set_override(&self, cmd: OverrideCommand) -> Result<(), OverrideValidationError> {
        validate_override_command(&cmd, self.battery_cfg.max_charge_power_w)?;
        let now = Utc::now();
        let mode = match cmd.mode {
            -2 => OverrideMode::Auto,
            0 => OverrideMode::State(OverallStateCode::ChargeFromGrid),
            1 => OverrideMode::State(OverallStateCode::AvoidDischarge),
            2 => OverrideMode::State(OverallStateCode::DischargeAllowed),
            _ => return Err(OverrideValidationError::ModeOutOfRange(cmd.mode)),
        };
        *self.override_state.write().await = Some(Override {
            mode,
            end_time: now + chrono::Duration::minutes(cmd.duration_minutes),
            grid_charge_power_w: cmd.grid_charge_power_w,
        });
        self.tick_control().await;
        Ok(())
    }
}

#[async_trait]
impl CoordinatorEvents for Scheduler {
    async fn on_soc_threshold(&self, soc_percent: f64) {
        info!(soc_percent, "SoC threshold crossing, recomputing control state");
        self.tick_control().await;
    }

    async fn on_evcc_changed(&self, _snapshot: EvccSnapshot) {
        info!("EVCC session changed, recomputing control state");
        self.tick_control().await;
    }

    async fn on_mqtt_command(&self, cmd: OverrideCommand) {
        if let Err(e) = self.set_override(cmd).await {
            warn!(error = %e, "rejected override command received over MQTT");
        }
    }
}

/// Override POST/MQTT validation (spec §6): `mode ∈ [-2, 2]`, `0 <
/// duration ≤ 12:00`, `0.5 ≤ grid_charge_power ≤ max_grid_charge_rate/1000`.
#[derive(Debug, thiserror::Error)]
pub enum OverrideValidationError {
    #[error("mode {0} outside [-2, 2]")]
    ModeOutOfRange(i8),
    #[error("duration must be > 0 and <= 12:00")]
    DurationOutOfRange,
    #[error("grid_charge_power must be between 0.5 and {max_kw} kW")]
    GridChargePowerOutOfRange { max_kw: f64 },
}

fn validate_override_command(cmd: &OverrideCommand, max_charge_power_w: f64) -> Result<(), OverrideValidationError> {
    if !(-2..=2).contains(&cmd.mode) {
        return Err(OverrideValidationError::ModeOutOfRange(cmd.mode));
    }
    if cmd.duration_minutes <= 0 || cmd.duration_minutes > 12 * 60 {
        return Err(OverrideValidationError::DurationOutOfRange);
    }
    let max_kw = max_charge_power_w / 1000.0;
    let power_kw = cmd.grid_charge_power_w / 1000.0;
    if !(0.5..=max_kw).contains(&power_kw) {
        return Err(OverrideValidationError::GridChargePowerOutOfRange { max_kw });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_command_validation_rejects_out_of_range_mode() {
        let cmd = OverrideCommand {
            mode: 3,
            duration_minutes: 30,
            grid_charge_power_w: 1000.0,
        };
        assert!(validate_override_command(&cmd, 5000.0).is_err());
    }

    #[test]
    fn override_command_validation_rejects_long_duration() {
        let cmd = OverrideCommand {
            mode: 0,
            duration_minutes: 13 * 60,
            grid_charge_power_w: 1000.0,
        };
        assert!(validate_override_command(&cmd, 5000.0).is_err());
    }

    #[test]
    fn override_command_validation_rejects_power_above_max_grid_charge_rate() {
        let cmd = OverrideCommand {
            mode: 0,
            duration_minutes: 30,
            grid_charge_power_w: 6000.0,
        };
        assert!(validate_override_command(&cmd, 5000.0).is_err());
    }

    #[test]
    fn override_command_validation_accepts_valid_command() {
        let cmd = OverrideCommand {
            mode: 0,
            duration_minutes: 90,
            grid_charge_power_w: 2500.0,
        };
        assert!(validate_override_command(&cmd, 5000.0).is_ok());
    }
}
