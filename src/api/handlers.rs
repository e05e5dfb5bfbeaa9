//! HTTP handlers for the spec §6 surface. One `AppState`, shared via
//! `axum::extract::State`, grounded on donor `api/status.rs`/`api/health.rs`'s
//! handler shape (extract state, build `ApiResponse`, map errors through
//! `ApiError`).
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use crate::api::error::ApiError;
use crate::api::response::ApiResponse;
use crate::logbuf::{self, LogQuery, LogRecord};
use crate::scheduler::{CurrentControlsSnapshot, OverrideCommand, Scheduler};

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
}

pub async fn index() -> &'static str {
    "Open Energy Controller is running. See /json/current_controls.json for the JSON surface."
}

pub async fn optimize_request(
    State(state): State<AppState>,
) -> Result<ApiResponse<serde_json::Value>, ApiError> {
    let value = state
        .scheduler
        .last_request_json()
        .await
        .ok_or_else(|| ApiError::NotFound("no optimization request has been sent yet".into()))?;
    Ok(ApiResponse::success(value))
}

pub async fn optimize_response(
    State(state): State<AppState>,
) -> Result<ApiResponse<serde_json::Value>, ApiError> {
    let value = state
        .scheduler
        .last_response_json()
        .await
        .ok_or_else(|| ApiError::NotFound("no optimization response has been received yet".into()))?;
    Ok(ApiResponse::success(value))
}

pub async fn current_controls(
    State(state): State<AppState>,
) -> Result<ApiResponse<CurrentControlsSnapshot>, ApiError> {
    let snapshot = state
        .scheduler
        .current_controls()
        .await
        .ok_or_else(|| ApiError::ServiceUnavailable("control loop has not completed its first tick yet".into()))?;
    Ok(ApiResponse::success(snapshot))
}

/// Wire shape of `POST /controls/mode_override` (spec §6): `duration` is
/// `"HH:MM"` and `grid_charge_power` is in kW.
#[derive(Debug, Deserialize)]
pub struct ModeOverrideBody {
    pub mode: i8,
    pub duration: String,
    pub grid_charge_power: f64,
}

/// Parses an `"HH:MM"` duration into minutes (spec §6).
fn parse_duration_minutes(duration: &str) -> Result<i64, ApiError> {
    let (hours, minutes) = duration
        .split_once(':')
        .ok_or_else(|| ApiError::BadRequest(format!("duration must be \"HH:MM\", got {duration:?}")))?;
    let hours: i64 = hours
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid hours in duration {duration:?}")))?;
    let minutes: i64 = minutes
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid minutes in duration {duration:?}")))?;
    Ok(hours * 60 + minutes)
}

pub async fn mode_override(
    State(state): State<AppState>,
    Json(body): Json<ModeOverrideBody>,
) -> Result<ApiResponse<()>, ApiError> {
    let cmd = OverrideCommand {
        mode: body.mode,
        duration_minutes: parse_duration_minutes(&body.duration)?,
        grid_charge_power_w: body.grid_charge_power * 1000.0,
    };
    state.scheduler.set_override(cmd).await?;
    Ok(ApiResponse::success(()))
}

#[derive(Debug, Deserialize)]
pub struct LogsQueryParams {
    pub level: Option<String>,
    pub limit: Option<usize>,
    pub since: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<LogsQueryParams> for LogQuery {
    fn from(p: LogsQueryParams) -> Self {
        LogQuery {
            level: p.level,
            limit: p.limit,
            since: p.since,
        }
    }
}

pub async fn logs(Query(params): Query<LogsQueryParams>) -> ApiResponse<Vec<LogRecord>> {
    ApiResponse::success(logbuf::snapshot(params.into()))
}

pub async fn log_alerts(Query(params): Query<LogsQueryParams>) -> ApiResponse<Vec<LogRecord>> {
    ApiResponse::success(logbuf::alerts(params.into()))
}

pub async fn logs_clear() -> ApiResponse<()> {
    logbuf::clear();
    ApiResponse::success(())
}

pub async fn log_alerts_clear() -> ApiResponse<()> {
    logbuf::clear_alerts();
    ApiResponse::success(())
}

pub async fn logs_stats() -> ApiResponse<logbuf::BufferStats> {
    ApiResponse::success(logbuf::stats())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_minutes_accepts_hh_mm() {
        assert_eq!(parse_duration_minutes("01:30").unwrap(), 90);
        assert_eq!(parse_duration_minutes("00:05").unwrap(), 5);
        assert_eq!(parse_duration_minutes("12:00").unwrap(), 720);
    }

    #[test]
    fn parse_duration_minutes_rejects_malformed_input() {
        assert!(parse_duration_minutes("90").is_err());
        assert!(parse_duration_minutes("aa:bb").is_err());
        assert!(parse_duration_minutes("").is_err());
    }
}
