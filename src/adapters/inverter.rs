//! Inverter sink adapter (spec §4.1 InverterInterface, §9 polymorphism note).
//!
//! Modbus transport lives here rather than in a standalone module: the
//! Fronius Gen24 variant is its only caller.
#![allow(dead_code)]
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::config::ModbusConfig;

#[async_trait]
pub trait InverterSink: Send + Sync {
    async fn set_mode_force_charge(&self, watts: f64) -> Result<()>;
    async fn set_mode_avoid_discharge(&self) -> Result<()>;
    async fn set_mode_allow_discharge(&self) -> Result<()>;
    async fn api_set_max_pv_charge_rate(&self, watts: f64) -> Result<()>;
    async fn fetch_inverter_data(&self) -> Result<HashMap<String, f64>>;
    /// Restores the inverter's prior configuration before returning (spec §5).
    async fn shutdown(&self) -> Result<()>;
}

#[cfg(feature = "modbus")]
pub mod modbus_transport {
    use anyhow::{Context, Result};
    use std::sync::Arc;
    use tokio::sync::Mutex;
    use tokio_modbus::client::tcp;
    use tokio_modbus::prelude::*;

    pub struct ModbusTransport {
        context: Arc<Mutex<tokio_modbus::client::Context>>,
        unit_id: u8,
    }

    impl ModbusTransport {
        pub async fn connect(host: &str, port: u16, unit_id: u8) -> Result<Self> {
            let addr = format!("{host}:{port}").parse().context("invalid modbus socket address")?;
            let ctx = tcp::connect(addr).await.context("modbus connect failed")?;
            Ok(Self {
                context: Arc::new(Mutex::new(ctx)),
                unit_id,
            })
        }

        pub async fn read_holding_registers(&self, start: u16, count: u16) -> Result<Vec<u16>> {
            let mut ctx = self.context.lock().await;
            ctx.set_slave(Slave(self.unit_id));
            Ok(ctx.read_holding_registers(start, count).await?)
        }

        pub async fn write_multiple_registers(&self, start: u16, values: &[u16]) -> Result<()> {
            let mut ctx = self.context.lock().await;
            ctx.set_slave(Slave(self.unit_id));
            ctx.write_multiple_registers(start, values).await?;
            Ok(())
        }
    }
}

/// Fronius Gen24 register map, shared by the enhanced and legacy variants.
/// Registers are placeholders for the vendor's SunSpec-derived Modbus
/// layout; exact addresses are an out-of-scope vendor quirk (spec §1).
#[cfg(feature = "modbus")]
mod registers {
    pub const STORAGE_CONTROL_MODE: u16 = 40348;
    pub const AC_CHARGE_POWER_LIMIT: u16 = 40350;
    pub const DC_CHARGE_POWER_LIMIT: u16 = 40352;
    pub const DISCHARGE_ENABLE: u16 = 40354;
}

#[cfg(feature = "modbus")]
pub struct FroniusGen24Inverter {
    transport: modbus_transport::ModbusTransport,
    legacy: bool,
    prior_mode: Mutex<Option<u16>>,
}

#[cfg(feature = "modbus")]
impl FroniusGen24Inverter {
    pub async fn connect(cfg: &ModbusConfig, legacy: bool) -> Result<Self> {
        let transport = modbus_transport::ModbusTransport::connect(&cfg.host, cfg.port, cfg.unit_id).await?;
        Ok(Self {
            transport,
            legacy,
            prior_mode: Mutex::new(None),
        })
    }
}

#[cfg(feature = "modbus")]
#[async_trait]
impl InverterSink for FroniusGen24Inverter {
    async fn set_mode_force_charge(&self, watts: f64) -> Result<()> {
        self.remember_prior_mode_once().await?;
        let raw = watts.round().clamp(0.0, u16::MAX as f64) as u16;
        self.transport
            .write_multiple_registers(registers::AC_CHARGE_POWER_LIMIT, &[raw])
            .await
            .context("failed to write AC charge power limit")?;
        self.transport
            .write_multiple_registers(registers::DISCHARGE_ENABLE, &[0])
            .await
            .context("failed to disable discharge while force-charging")
    }

    async fn set_mode_avoid_discharge(&self) -> Result<()> {
        self.remember_prior_mode_once().await?;
        self.transport
            .write_multiple_registers(registers::DISCHARGE_ENABLE, &[0])
            .await
            .context("failed to write discharge-disable")
    }

    async fn set_mode_allow_discharge(&self) -> Result<()> {
        self.remember_prior_mode_once().await?;
        self.transport
            .write_multiple_registers(registers::DISCHARGE_ENABLE, &[1])
            .await
            .context("failed to write discharge-enable")
    }

    async fn api_set_max_pv_charge_rate(&self, watts: f64) -> Result<()> {
        let raw = watts.round().clamp(0.0, u16::MAX as f64) as u16;
        self.transport
            .write_multiple_registers(registers::DC_CHARGE_POWER_LIMIT, &[raw])
            .await
            .context("failed to write DC charge power limit")
    }

    async fn fetch_inverter_data(&self) -> Result<HashMap<String, f64>> {
        let regs = self
            .transport
            .read_holding_registers(registers::STORAGE_CONTROL_MODE, 8)
            .await
            .context("failed to read inverter diagnostic registers")?;
        let mut data = HashMap::new();
        for (i, v) in regs.iter().enumerate() {
            data.insert(format!("reg_{i}"), *v as f64);
        }
        Ok(data)
    }

    async fn shutdown(&self) -> Result<()> {
        let prior = self.prior_mode.lock().await.take();
        if let Some(mode) = prior {
            self.transport
                .write_multiple_registers(registers::STORAGE_CONTROL_MODE, &[mode])
                .await
                .context("failed to restore prior inverter mode on shutdown")?;
        }
        Ok(())
    }
}

#[cfg(feature = "modbus")]
impl FroniusGen24Inverter {
    async fn remember_prior_mode_once(&self) -> Result<()> {
        let mut prior = self.prior_mode.lock().await;
        if prior.is_none() {
            let regs = self
                .transport
                .read_holding_registers(registers::STORAGE_CONTROL_MODE, 1)
                .await
                .context("failed to snapshot inverter mode before writing")?;
            *prior = regs.first().copied();
        }
        Ok(())
    }
}

/// EVCC external-battery-controller mode forwarding (spec §4.1's
/// "directly or via EVCC" dispatch choice).
pub struct EvccExternalBatteryInverter {
    evcc: Arc<dyn crate::adapters::evcc::EvccSource>,
}

impl EvccExternalBatteryInverter {
    pub fn new(evcc: Arc<dyn crate::adapters::evcc::EvccSource>) -> Self {
        Self { evcc }
    }
}

#[async_trait]
impl InverterSink for EvccExternalBatteryInverter {
    async fn set_mode_force_charge(&self, _watts: f64) -> Result<()> {
        self.evcc
            .set_external_battery_mode(crate::adapters::evcc::ExternalBatteryMode::ForceCharge)
            .await
    }

    async fn set_mode_avoid_discharge(&self) -> Result<()> {
        self.evcc
            .set_external_battery_mode(crate::adapters::evcc::ExternalBatteryMode::AvoidDischarge)
            .await
    }

    async fn set_mode_allow_discharge(&self) -> Result<()> {
        self.evcc
            .set_external_battery_mode(crate::adapters::evcc::ExternalBatteryMode::DischargeAllowed)
            .await
    }

    async fn api_set_max_pv_charge_rate(&self, _watts: f64) -> Result<()> {
        Ok(())
    }

    async fn fetch_inverter_data(&self) -> Result<HashMap<String, f64>> {
        Ok(HashMap::new())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Logs the intended mode instead of writing hardware (spec §9
/// `NoopShowOnly` variant; also the default when no inverter is configured).
pub struct NoopInverter {
    last_mode: Mutex<Option<&'static str>>,
}

impl NoopInverter {
    pub fn new() -> Self {
        Self {
            last_mode: Mutex::new(None),
        }
    }
}

impl Default for NoopInverter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InverterSink for NoopInverter {
    async fn set_mode_force_charge(&self, watts: f64) -> Result<()> {
        *self.last_mode.lock().await = Some("force_charge");
        tracing::debug!(watts, "noop inverter: force_charge");
        Ok(())
    }

    async fn set_mode_avoid_discharge(&self) -> Result<()> {
        *self.last_mode.lock().await = Some("avoid_discharge");
        tracing::debug!("noop inverter: avoid_discharge");
        Ok(())
    }

    async fn set_mode_allow_discharge(&self) -> Result<()> {
        *self.last_mode.lock().await = Some("allow_discharge");
        tracing::debug!("noop inverter: allow_discharge");
        Ok(())
    }

    async fn api_set_max_pv_charge_rate(&self, watts: f64) -> Result<()> {
        tracing::debug!(watts, "noop inverter: set_max_pv_charge_rate");
        Ok(())
    }

    async fn fetch_inverter_data(&self) -> Result<HashMap<String, f64>> {
        Ok(HashMap::new())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_inverter_accepts_all_mode_calls() {
        let inverter = NoopInverter::new();
        inverter.set_mode_force_charge(1500.0).await.unwrap();
        inverter.set_mode_avoid_discharge().await.unwrap();
        inverter.set_mode_allow_discharge().await.unwrap();
        inverter.api_set_max_pv_charge_rate(500.0).await.unwrap();
        inverter.shutdown().await.unwrap();
    }
}
