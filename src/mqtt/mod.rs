//! MQTT telemetry bridge (spec §4.6). Publishes `TelemetrySink` snapshots
//! as individual topics under `base_topic`, emits Home Assistant MQTT
//! discovery messages when configured, and turns inbound commands on the
//! override command topic into `CoordinatorEvents::on_mqtt_command` calls.
//!
//! Grounded on `original_source/src/interfaces/mqtt_interface.py`'s
//! `topics_publish` table, last-will, and publish-on-change diffing. The
//! donor carries no MQTT dependency, so the client crate (`rumqttc`) is
//! adopted from `examples/other_examples/manifests/isnogudus-e3dc-mqtt-rs`.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;
use crate::scheduler::{CoordinatorEvents, CurrentControlsSnapshot, OverrideCommand, TelemetrySink};

/// One entry in the publish table: a topic suffix plus the Home Assistant
/// discovery metadata to advertise for it (`mqtt_interface.py::topics_publish`).
struct TopicSpec {
    suffix: &'static str,
    component: &'static str,
    name: &'static str,
    unit: Option<&'static str>,
    device_class: Option<&'static str>,
    icon: Option<&'static str>,
}

const fn sensor(suffix: &'static str, name: &'static str, unit: Option<&'static str>, device_class: Option<&'static str>) -> TopicSpec {
    TopicSpec { suffix, component: "sensor", name, unit, device_class, icon: None }
}

const fn binary_sensor(suffix: &'static str, name: &'static str) -> TopicSpec {
    TopicSpec { suffix, component: "binary_sensor", name, unit: None, device_class: None, icon: None }
}

/// The fixed set of topics this bridge publishes (spec §4.6), mirroring
/// `mqtt_interface.py`'s `topics_publish` table.
const PUBLISH_TOPICS: &[TopicSpec] = &[
    sensor("control/overall_state", "Overall State", None, None),
    sensor("control/eos_ac_charge_demand", "AC Charge Demand", Some("W"), Some("power")),
    sensor("control/eos_dc_charge_demand", "DC Charge Demand", Some("W"), Some("power")),
    binary_sensor("control/discharge_allowed", "Discharge Allowed"),
    binary_sensor("control/override_active", "Override Active"),
    sensor("control/override_end_time", "Override End Time", None, Some("timestamp")),
    sensor("battery/soc", "Battery State of Charge", Some("%"), Some("battery")),
    sensor("battery/usable_capacity", "Battery Usable Capacity", Some("Wh"), Some("energy")),
    sensor("battery/dyn_max_charge_power", "Battery Max Charge Power", Some("W"), Some("power")),
    sensor("optimization/state", "Scheduler State", None, None),
];

const OVERRIDE_MODE_TOPIC: &str = "control/set/overall_state";
const OVERRIDE_DURATION_TOPIC: &str = "control/set/override_remain_time";
const OVERRIDE_POWER_TOPIC: &str = "control/set/override_charge_power";
const STATUS_TOPIC: &str = "status";

#[derive(Default)]
struct PendingOverride {
    mode: Option<i8>,
    duration_minutes: Option<i64>,
    grid_charge_power_w: Option<f64>,
}

/// Last published value per topic, for publish-on-change diffing
/// (`mqtt_interface.py::__publish_topics_on_change`).
struct Published {
    last: HashMap<String, String>,
    pending_override: PendingOverride,
}

/// Pure publish-on-change detection (spec §4.6 P4): true if `value` differs
/// from the last value published for `suffix`. Takes no broker handle so it
/// can be unit-tested without one.
fn needs_publish(last: &HashMap<String, String>, suffix: &str, value: &str) -> bool {
    last.get(suffix).map(String::as_str) != Some(value)
}

pub struct MqttBridge {
    client: AsyncClient,
    base_topic: String,
    ha_auto_discovery: bool,
    ha_discovery_prefix: String,
    state: Mutex<Published>,
}

impl MqttBridge {
    /// Connects to the broker, publishes the last-will-backed online
    /// status, optionally sends HA discovery messages, and subscribes to
    /// the override command topics. `events` is the `Scheduler` itself,
    /// injected after construction to close the MQTT -> control loop.
    pub async fn connect(cfg: &MqttConfig, events: Arc<dyn CoordinatorEvents>) -> anyhow::Result<Arc<Self>> {
        let client_id = format!("open-energy-controller-{}", uuid::Uuid::new_v4());
        let mut options = MqttOptions::new(client_id, cfg.broker.clone(), cfg.port);
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(username), Some(password)) = (&cfg.username, &cfg.password) {
            options.set_credentials(username.clone(), password.clone());
        }
        if cfg.tls {
            options.set_transport(Transport::Tls(TlsConfiguration::Native));
        }
        let will_topic = format!("{}/{}", cfg.base_topic, STATUS_TOPIC);
        options.set_last_will(LastWill::new(&will_topic, "offline", QoS::AtLeastOnce, true));

        let (client, mut event_loop) = AsyncClient::new(options, 16);

        client
            .subscribe(format!("{}/{}", cfg.base_topic, OVERRIDE_MODE_TOPIC), QoS::AtLeastOnce)
            .await?;
        client
            .subscribe(format!("{}/{}", cfg.base_topic, OVERRIDE_DURATION_TOPIC), QoS::AtLeastOnce)
            .await?;
        client
            .subscribe(format!("{}/{}", cfg.base_topic, OVERRIDE_POWER_TOPIC), QoS::AtLeastOnce)
            .await?;

        let bridge = Arc::new(Self {
            client: client.clone(),
            base_topic: cfg.base_topic.clone(),
            ha_auto_discovery: cfg.ha_auto_discovery,
            ha_discovery_prefix: cfg.ha_auto_discovery_prefix.clone(),
            state: Mutex::new(Published {
                last: HashMap::new(),
                pending_override: PendingOverride::default(),
            }),
        });

        let poll_bridge = Arc::clone(&bridge);
        tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        poll_bridge.handle_incoming(&publish.topic, &publish.payload, &events).await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt event loop error, retrying");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });

        bridge
            .client
            .publish(&will_topic, QoS::AtLeastOnce, true, "online")
            .await?;

        if bridge.ha_auto_discovery {
            if let Err(e) = bridge.publish_discovery().await {
                warn!(error = %e, "failed to publish Home Assistant discovery messages");
            }
        }

        info!(broker = %cfg.broker, base_topic = %cfg.base_topic, "MQTT bridge connected");
        Ok(bridge)
    }

    async fn handle_incoming(&self, topic: &str, payload: &[u8], events: &Arc<dyn CoordinatorEvents>) {
        let suffix = topic.strip_prefix(&format!("{}/", self.base_topic)).unwrap_or(topic);
        let text = String::from_utf8_lossy(payload);
        debug!(topic, payload = %text, "mqtt command received");

        let mut state = self.state.lock().await;
        match suffix {
            OVERRIDE_MODE_TOPIC => match text.parse::<i8>() {
                Ok(mode) => state.pending_override.mode = Some(mode),
                Err(_) => {
                    warn!(payload = %text, "ignoring non-integer overall_state override command");
                    return;
                }
            },
            OVERRIDE_DURATION_TOPIC => match text.parse::<i64>() {
                Ok(minutes) => state.pending_override.duration_minutes = Some(minutes),
                Err(_) => {
                    warn!(payload = %text, "ignoring non-integer override_remain_time command");
                    return;
                }
            },
            OVERRIDE_POWER_TOPIC => match text.parse::<f64>() {
                Ok(power) => state.pending_override.grid_charge_power_w = Some(power),
                Err(_) => {
                    warn!(payload = %text, "ignoring non-numeric override_charge_power command");
                    return;
                }
            },
            _ => return,
        }

        // Dispatch only once all three slots of the composite override
        // command have arrived, mirroring the donor interface's
        // assemble-then-dispatch behavior for `control/overall_state`.
        let (mode, duration_minutes, grid_charge_power_w) = (
            state.pending_override.mode,
            state.pending_override.duration_minutes,
            state.pending_override.grid_charge_power_w,
        );
        if let (Some(mode), Some(duration_minutes), Some(grid_charge_power_w)) =
            (mode, duration_minutes, grid_charge_power_w)
        {
            state.pending_override = PendingOverride::default();
            drop(state);
            events
                .on_mqtt_command(OverrideCommand { mode, duration_minutes, grid_charge_power_w })
                .await;
        }
    }

    async fn publish_if_changed(&self, state: &mut Published, suffix: &str, value: String) {
        if !needs_publish(&state.last, suffix, &value) {
            return;
        }
        let topic = format!("{}/{}", self.base_topic, suffix);
        if let Err(e) = self.client.publish(&topic, QoS::AtLeastOnce, true, value.clone()).await {
            error!(error = %e, topic, "failed to publish mqtt topic");
            return;
        }
        state.last.insert(suffix.to_string(), value);
    }

    async fn publish_discovery(&self) -> anyhow::Result<()> {
        let device = json!({
            "identifiers": ["open-energy-controller"],
            "name": "Open Energy Controller",
            "manufacturer": "Open Energy Controller",
        });

        for spec in PUBLISH_TOPICS {
            let object_id = spec.suffix.replace('/', "_");
            let discovery_topic = format!(
                "{}/{}/open_energy_controller/{}/config",
                self.ha_discovery_prefix, spec.component, object_id
            );
            let mut payload = json!({
                "name": spec.name,
                "unique_id": format!("oec_{}", object_id),
                "state_topic": format!("{}/{}", self.base_topic, spec.suffix),
                "device": device,
            });
            if let Some(unit) = spec.unit {
                payload["unit_of_measurement"] = Value::String(unit.to_string());
            }
            if let Some(device_class) = spec.device_class {
                payload["device_class"] = Value::String(device_class.to_string());
            }
            if let Some(icon) = spec.icon {
                payload["icon"] = Value::String(icon.to_string());
            }
            self.client
                .publish(&discovery_topic, QoS::AtLeastOnce, true, payload.to_string())
                .await?;
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        let status_topic = format!("{}/{}", self.base_topic, STATUS_TOPIC);
        let _ = self.client.publish(&status_topic, QoS::AtLeastOnce, true, "offline").await;
        let _ = self.client.disconnect().await;
    }
}

#[async_trait]
impl TelemetrySink for MqttBridge {
    async fn publish_current_controls(&self, snapshot: &CurrentControlsSnapshot) {
        let mut state = self.state.lock().await;
        self.publish_if_changed(&mut state, "control/overall_state", snapshot.current_states.inverter_mode.clone())
            .await;
        self.publish_if_changed(
            &mut state,
            "control/eos_ac_charge_demand",
            snapshot.current_states.ac_charge_demand.to_string(),
        )
        .await;
        self.publish_if_changed(
            &mut state,
            "control/eos_dc_charge_demand",
            snapshot.current_states.dc_charge_demand.to_string(),
        )
        .await;
        self.publish_if_changed(
            &mut state,
            "control/discharge_allowed",
            if snapshot.current_states.discharge_allowed { "ON" } else { "OFF" }.to_string(),
        )
        .await;
        self.publish_if_changed(
            &mut state,
            "control/override_active",
            if snapshot.current_states.override_active { "ON" } else { "OFF" }.to_string(),
        )
        .await;
        if let Some(end_time) = snapshot.current_states.override_end_time {
            self.publish_if_changed(&mut state, "control/override_end_time", end_time.to_rfc3339()).await;
        }
        self.publish_if_changed(&mut state, "battery/soc", snapshot.battery.soc.to_string()).await;
        self.publish_if_changed(&mut state, "battery/usable_capacity", snapshot.battery.usable_capacity.to_string())
            .await;
        self.publish_if_changed(
            &mut state,
            "battery/dyn_max_charge_power",
            snapshot.battery.max_charge_power_dyn.to_string(),
        )
        .await;
        self.publish_if_changed(&mut state, "optimization/state", format!("{:?}", snapshot.state)).await;
    }

    async fn publish_inverter_data(&self, data: &HashMap<String, f64>) {
        let mut state = self.state.lock().await;
        for (key, value) in data {
            let suffix = format!("inverter/special/{key}");
            self.publish_if_changed(&mut state, &suffix, value.to_string()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn publish_topics_table_has_no_duplicate_suffixes() {
        let mut suffixes: Vec<&str> = PUBLISH_TOPICS.iter().map(|t| t.suffix).collect();
        suffixes.sort();
        suffixes.dedup();
        assert_eq!(suffixes.len(), PUBLISH_TOPICS.len());
    }

    /// P4: publish-on-change, no broker needed.
    #[test]
    fn needs_publish_detects_changes_and_ignores_repeats() {
        let mut last = HashMap::new();
        assert!(needs_publish(&last, "control/overall_state", "Auto"));

        last.insert("control/overall_state".to_string(), "Auto".to_string());
        assert!(!needs_publish(&last, "control/overall_state", "Auto"));
        assert!(needs_publish(&last, "control/overall_state", "Startup"));
    }

    proptest! {
        /// P4: for any value, publishing it once and then re-checking the
        /// identical value never reports a second change.
        #[test]
        fn repeating_the_same_value_never_needs_a_second_publish(value in "[a-zA-Z0-9]{0,20}") {
            let mut last = HashMap::new();
            prop_assert!(needs_publish(&last, "topic", &value));
            last.insert("topic".to_string(), value.clone());
            prop_assert!(!needs_publish(&last, "topic", &value));
        }
    }
}
