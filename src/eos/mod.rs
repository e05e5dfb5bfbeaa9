//! EOS solver client (spec §4.2). Builds the optimize URL, posts the
//! request with a bounded timeout, parses the response into a 48-entry
//! `ControlPlan`, and tracks a rolling average runtime used to adapt the
//! optimization loop's own cadence.
#![allow(dead_code)]
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::EosConfig;
use crate::domain::{ApiVersion, ControlPlan, ControlPlanResponse, OptimizationRequest, RequestState, SchedulerState};

#[derive(Debug, Error)]
pub enum EosClientError {
    #[error("EOS request failed: {0}")]
    Request(String),
    #[error("EOS returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("EOS response could not be parsed: {0}")]
    Parse(String),
}

struct Inner {
    runtimes: VecDeque<f64>,
    runtime_window: usize,
    plan: Option<ControlPlan>,
    last_request: Option<OptimizationRequest>,
    last_response: Option<ControlPlanResponse>,
    scheduler_state: SchedulerState,
}

pub struct EosClient {
    base_url: String,
    http: reqwest::Client,
    timeout: Duration,
    device_aware_since: DateTime<Utc>,
    inner: RwLock<Inner>,
}

impl EosClient {
    pub fn new(cfg: &EosConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .context("failed to build EOS HTTP client")?;

        let device_aware_since = chrono::NaiveDate::parse_from_str(&cfg.device_aware_since, "%Y-%m-%d")
            .context("invalid device_aware_since date")?
            .and_hms_opt(0, 0, 0)
            .expect("midnight is always valid")
            .and_utc();

        Ok(Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            http,
            timeout: Duration::from_secs(cfg.timeout_secs),
            device_aware_since,
            inner: RwLock::new(Inner {
                runtimes: VecDeque::with_capacity(cfg.runtime_average_window),
                runtime_window: cfg.runtime_average_window,
                plan: None,
                last_request: None,
                last_response: None,
                scheduler_state: SchedulerState::default(),
            }),
        })
    }

    /// Local-hour-of-day at `now` in `tz` (spec §4.2.1, Open Question #2 —
    /// resolved in favor of local time, matching the original source).
    pub fn start_hour(now: DateTime<Utc>, tz: Tz) -> u8 {
        now.with_timezone(&tz).hour() as u8
    }

    fn optimize_url(&self, start_hour: u8) -> String {
        format!("{}/optimize?start_hour={start_hour}", self.base_url)
    }

    /// POST the request, update the plan and rolling runtime on success,
    /// and leave all prior state untouched on failure (spec §4.2 failure
    /// semantics: "keep previous plan, skip control-plan update").
    pub async fn submit(&self, mut request: OptimizationRequest, tz: Tz) -> Result<ControlPlan, EosClientError> {
        let now = Utc::now();
        let start_hour = Self::start_hour(now, tz);

        {
            let inner = self.inner.read().await;
            if now >= self.device_aware_since {
                request.apply_version(ApiVersion::DeviceAware, "oec-primary");
            }
            if let Some(prior) = inner.last_response.as_ref() {
                request.start_solution = prior.start_solution.clone();
            }
        }

        let started = Instant::now();
        let url = self.optimize_url(start_hour);

        let result = async {
            let resp = self
                .http
                .post(&url)
                .json(&request)
                .send()
                .await
                .map_err(|e| EosClientError::Request(e.to_string()))?;

            let status = resp.status();
            let body = resp
                .text()
                .await
                .map_err(|e| EosClientError::Request(e.to_string()))?;

            if !status.is_success() {
                return Err(EosClientError::Status {
                    status: status.as_u16(),
                    body,
                });
            }

            serde_json::from_str::<ControlPlanResponse>(&body).map_err(|e| EosClientError::Parse(e.to_string()))
        }
        .await;

        let elapsed_s = started.elapsed().as_secs_f64();

        match result {
            Ok(response) => {
                let plan = ControlPlan::from_response(start_hour, &response);

                let mut inner = self.inner.write().await;
                if inner.runtimes.len() >= inner.runtime_window {
                    inner.runtimes.pop_front();
                }
                inner.runtimes.push_back(elapsed_s);
                let avg = inner.runtimes.iter().sum::<f64>() / inner.runtimes.len() as f64;
                inner.scheduler_state.last_avg_runtime_s = avg;
                inner.scheduler_state.last_request_ts = Some(now);
                inner.scheduler_state.last_response_ts = Some(Utc::now());
                inner.scheduler_state.request_state = RequestState::Received;
                inner.plan = Some(plan.clone());
                inner.last_request = Some(request);
                inner.last_response = Some(response);

                Ok(plan)
            }
            Err(e) => {
                let mut inner = self.inner.write().await;
                inner.scheduler_state.last_request_ts = Some(now);
                inner.scheduler_state.request_state = RequestState::Idle;
                Err(e)
            }
        }
    }

    pub async fn plan(&self) -> Option<ControlPlan> {
        self.inner.read().await.plan.clone()
    }

    pub async fn scheduler_state(&self) -> SchedulerState {
        self.inner.read().await.scheduler_state.clone()
    }

    pub async fn last_request_json(&self) -> Option<serde_json::Value> {
        let inner = self.inner.read().await;
        inner.last_request.as_ref().and_then(|r| serde_json::to_value(r).ok())
    }

    pub async fn last_response_json(&self) -> Option<serde_json::Value> {
        let inner = self.inner.read().await;
        inner.last_response.as_ref().and_then(|r| serde_json::to_value(r).ok())
    }

    /// Align the next optimization run with the tariff boundary (spec
    /// §4.2.6).
    ///
    /// Rounds `now` up to the next `base_interval` boundary, subtracts the
    /// observed average runtime so the response tends to land just after
    /// the boundary, then nudges forward by one more interval if that
    /// leaves less than 10s of lead time.
    pub fn calculate_next_run_time(now: DateTime<Utc>, last_avg_runtime_s: f64, base_interval: Duration) -> DateTime<Utc> {
        let interval_s = base_interval.as_secs().max(1) as i64;
        let epoch = now.timestamp();
        let next_boundary = ((epoch / interval_s) + 1) * interval_s;
        let boundary_dt = Utc.timestamp_opt(next_boundary, 0).single().unwrap_or(now);

        let mut next_run = boundary_dt - chrono::Duration::milliseconds((last_avg_runtime_s * 1000.0) as i64);

        if next_run <= now + chrono::Duration::seconds(10) {
            next_run += chrono::Duration::seconds(interval_s);
        }

        next_run
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use crate::domain::PLAN_LEN;
    use proptest::prelude::*;

    #[test]
    fn next_run_time_is_strictly_after_now_and_bounded() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 10, 1, 30).unwrap();
        let interval = Duration::from_secs(180);
        for avg in [0.0, 30.0, 90.0] {
            let next = EosClient::calculate_next_run_time(now, avg, interval);
            assert!(next > now, "avg={avg} next={next} now={now}");
            assert!(next <= now + chrono::Duration::seconds(2 * 180));
        }
    }

    #[test]
    fn next_run_time_advances_again_when_too_close() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 10, 2, 59).unwrap();
        let interval = Duration::from_secs(180);
        // avg runtime close to a full interval pushes the naive boundary
        // almost back onto `now`; the 10s guard should push it out further.
        let next = EosClient::calculate_next_run_time(now, 179.0, interval);
        assert!(next > now + chrono::Duration::seconds(10));
    }

    #[test]
    fn start_hour_uses_local_timezone() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 22, 30, 0).unwrap();
        let tz: Tz = "Europe/Stockholm".parse().unwrap();
        // UTC 22:30 in summer (CEST, UTC+2) is local 00:30 -> hour 0
        assert_eq!(EosClient::start_hour(now, tz), 0);
    }

    fn sample_request() -> OptimizationRequest {
        OptimizationRequest {
            ems: crate::domain::EmsBlock {
                pv_forecast_wh: vec![0.0; 48],
                price_eur_per_wh: vec![0.0; 48],
                feedin_price_eur_per_wh: vec![0.0; 48],
                load_profile_wh: vec![0.0; 48],
                battery_wear_cost_eur_per_wh: 0.0001,
            },
            battery: crate::domain::BatteryBlock {
                capacity_wh: 10_000.0,
                charge_eff: 0.95,
                discharge_eff: 0.95,
                max_charge_w: 5000.0,
                initial_soc_pct: 60.0,
                min_soc_pct: 10.0,
                max_soc_pct: 95.0,
                device_id: None,
            },
            inverter: crate::domain::InverterBlock { max_power_wh: 5000.0, device_id: None, battery_id: None },
            ev: None,
            deferrable_load: None,
            temperature_forecast: vec![20.0; 48],
            start_solution: None,
        }
    }

    /// Contract test: `submit` posts to `{base_url}/optimize`, honors the
    /// `device_aware_since` cutover (no `device_id` before it), and parses
    /// the solver's JSON response into a 48-entry plan.
    #[tokio::test]
    async fn submit_honors_version_cutover_and_parses_response() {
        let server = wiremock::MockServer::start().await;
        let response_body = serde_json::json!({
            "ac_charge": [1000.0; 48],
            "dc_charge": [0.0; 48],
            "discharge_allowed": [true; 48],
        });

        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path("/optimize"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(&response_body))
            .mount(&server)
            .await;

        let cfg = EosConfig {
            base_url: server.uri(),
            timeout_secs: 5,
            runtime_average_window: 5,
            device_aware_since: "2999-01-01".to_string(),
        };
        let client = EosClient::new(&cfg).unwrap();
        let tz: Tz = "UTC".parse().unwrap();

        let plan = client.submit(sample_request(), tz).await.unwrap();
        assert_eq!(plan.entries.len(), PLAN_LEN);
        assert_eq!(plan.entries[0].ac_charge_demand_w, 1000.0);

        let sent = client.last_request_json().await.unwrap();
        assert!(sent["battery"]["device_id"].is_null(), "cutover date is in the future, must stay Legacy");
    }

    #[tokio::test]
    async fn submit_applies_device_aware_fields_after_cutover() {
        let server = wiremock::MockServer::start().await;
        let response_body = serde_json::json!({
            "ac_charge": [0.0; 48],
            "dc_charge": [0.0; 48],
            "discharge_allowed": [false; 48],
        });
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path("/optimize"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(&response_body))
            .mount(&server)
            .await;

        let cfg = EosConfig {
            base_url: server.uri(),
            timeout_secs: 5,
            runtime_average_window: 5,
            device_aware_since: "2000-01-01".to_string(),
        };
        let client = EosClient::new(&cfg).unwrap();
        let tz: Tz = "UTC".parse().unwrap();

        client.submit(sample_request(), tz).await.unwrap();

        let sent = client.last_request_json().await.unwrap();
        assert_eq!(sent["battery"]["device_id"], "oec-primary");
    }

    proptest! {
        /// P6: for any `now` and `avg_runtime <= base_interval/2`, the next
        /// run time is strictly after `now` and within one extra interval.
        #[test]
        fn next_run_time_is_bounded_for_any_input(
            epoch_secs in 1_700_000_000i64..1_800_000_000i64,
            interval_secs in 10u64..3600,
            avg_fraction in 0.0f64..0.5,
        ) {
            let now = Utc.timestamp_opt(epoch_secs, 0).single().unwrap();
            let interval = Duration::from_secs(interval_secs);
            let avg_runtime = interval_secs as f64 * avg_fraction;
            let next = EosClient::calculate_next_run_time(now, avg_runtime, interval);
            prop_assert!(next > now);
            prop_assert!(next <= now + chrono::Duration::seconds(2 * interval_secs as i64));
        }
    }
}
