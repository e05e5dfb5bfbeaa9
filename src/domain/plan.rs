#![allow(dead_code)]
use serde::{Deserialize, Serialize};

use super::control::ControlTuple;

/// A 48-entry hour-indexed control plan derived from a solver response
/// (spec §3, §4.2.3). Index 0 corresponds to the `start_hour` the request
/// was built with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlPlan {
    pub start_hour: u8,
    pub entries: Vec<ControlTuple>,
}

pub const PLAN_LEN: usize = 48;

impl ControlPlan {
    /// Build a plan from the solver's raw named arrays, marking entries
    /// `error = true` when their fields are missing or negative (spec
    /// §4.2.3, REDESIGN FLAGS: explicit schema, no runtime key checks).
    pub fn from_response(start_hour: u8, response: &ControlPlanResponse) -> Self {
        let len = response
            .ac_charge
            .len()
            .min(response.dc_charge.len())
            .min(response.discharge_allowed.len());

        let entries = (0..PLAN_LEN)
            .map(|i| {
                if i >= len {
                    return ControlTuple::errored(i as u8);
                }
                let ac = response.ac_charge[i];
                let dc = response.dc_charge[i];
                let discharge_allowed = response.discharge_allowed[i];
                match (ac, dc) {
                    (Some(ac), Some(dc)) => ControlTuple::valid(i as u8, ac, dc, discharge_allowed),
                    _ => ControlTuple::errored(i as u8),
                }
            })
            .collect();

        Self { start_hour, entries }
    }

    /// Entry for the given hour-offset from `start_hour`, if present and
    /// not marked `error`.
    pub fn entry_at_offset(&self, offset: usize) -> Option<&ControlTuple> {
        self.entries.get(offset).filter(|e| !e.error)
    }

    /// Tuple for the current and next hour relative to `start_hour` (spec
    /// §4.2.7 `get_last_control_data`).
    pub fn current_and_next(&self) -> (Option<&ControlTuple>, Option<&ControlTuple>) {
        (self.entry_at_offset(0), self.entry_at_offset(1))
    }
}

/// Raw wire shape of an EOS `/optimize` response (spec §6). Field values
/// are `Option<f64>`/`bool` so unparseable entries surface as `None`
/// rather than a parse error for the whole response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlPlanResponse {
    pub ac_charge: Vec<Option<f64>>,
    pub dc_charge: Vec<Option<f64>>,
    pub discharge_allowed: Vec<bool>,
    /// Echoed back on the next request as `start_solution` (spec §4.2.4).
    #[serde(default)]
    pub start_solution: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn full_response() -> ControlPlanResponse {
        ControlPlanResponse {
            ac_charge: (0..48).map(|i| Some(i as f64 * 10.0)).collect(),
            dc_charge: (0..48).map(|_| Some(0.0)).collect(),
            discharge_allowed: (0..48).map(|i| i % 2 == 0).collect(),
            start_solution: None,
        }
    }

    #[test]
    fn plan_has_48_entries_and_non_negative_fields_or_error() {
        let plan = ControlPlan::from_response(5, &full_response());
        assert_eq!(plan.entries.len(), PLAN_LEN);
        for e in &plan.entries {
            assert!(e.error || (e.ac_charge_demand_w >= 0.0 && e.dc_charge_demand_w >= 0.0));
        }
    }

    #[test]
    fn short_response_pads_remaining_entries_as_errored() {
        let mut response = full_response();
        response.ac_charge.truncate(3);
        let plan = ControlPlan::from_response(0, &response);
        assert!(plan.entries[3].error);
        assert!(!plan.entries[2].error);
    }

    #[test]
    fn missing_field_marks_single_entry_errored() {
        let mut response = full_response();
        response.ac_charge[10] = None;
        let plan = ControlPlan::from_response(0, &response);
        assert!(plan.entries[10].error);
        assert!(!plan.entries[9].error);
    }

    #[test]
    fn current_and_next_skip_errored_entries() {
        let mut response = full_response();
        response.ac_charge[0] = None;
        let plan = ControlPlan::from_response(0, &response);
        let (current, next) = plan.current_and_next();
        assert!(current.is_none());
        assert!(next.is_some());
    }

    proptest! {
        /// P1: for any solver response, the derived plan always has exactly
        /// 48 entries, and every non-errored entry has non-negative
        /// ac/dc charge demand.
        #[test]
        fn plan_is_always_48_entries_with_non_negative_or_errored_fields(
            len in 0usize..60,
            ac_present in proptest::collection::vec(proptest::bool::ANY, 0..60),
            ac_values in proptest::collection::vec(0.0f64..50_000.0, 0..60),
            dc_values in proptest::collection::vec(0.0f64..50_000.0, 0..60),
            discharge_allowed in proptest::collection::vec(proptest::bool::ANY, 0..60),
            start_hour in 0u8..24,
        ) {
            let n = len.min(ac_present.len()).min(ac_values.len()).min(dc_values.len()).min(discharge_allowed.len());
            let response = ControlPlanResponse {
                ac_charge: (0..n).map(|i| ac_present[i].then_some(ac_values[i])).collect(),
                dc_charge: (0..n).map(|i| Some(dc_values[i])).collect(),
                discharge_allowed: discharge_allowed[..n].to_vec(),
                start_solution: None,
            };
            let plan = ControlPlan::from_response(start_hour, &response);
            prop_assert_eq!(plan.entries.len(), PLAN_LEN);
            for e in &plan.entries {
                prop_assert!(e.error || (e.ac_charge_demand_w >= 0.0 && e.dc_charge_demand_w >= 0.0));
            }
        }
    }
}
