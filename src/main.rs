mod adapters;
mod api;
mod base_control;
mod config;
mod domain;
mod eos;
mod load_profile;
mod logbuf;
mod mqtt;
mod scheduler;
mod telemetry;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono_tz::Tz;
use tracing::{error, info, warn};

use adapters::battery::PersistenceBatterySource;
use adapters::evcc::{EvccSource, FixedEvccSource, HttpEvccSource};
use adapters::inverter::{EvccExternalBatteryInverter, InverterSink, NoopInverter};
use adapters::load::{BuiltLoadProfileSource, HttpHistorySource};
use adapters::pv::AkkudoktorPvSource;
use adapters::price::TibberPriceSource;
use api::AppState;
use config::{AppConfig, InverterConfig, InverterKind};
use domain::EvccSnapshot;
use eos::EosClient;
use load_profile::LoadProfileBuilder;
use scheduler::{EventsHandle, PollIntervals, Scheduler};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = AppConfig::load().context("failed to load configuration")?;
    telemetry::init_tracing(&cfg.telemetry.log_level, cfg.telemetry.log_buffer_capacity, cfg.telemetry.alert_buffer_capacity);

    info!(version = env!("CARGO_PKG_VERSION"), "starting Open Energy Controller");

    if let Err(e) = run(cfg).await {
        error!(error = %e, "fatal startup error");
        std::process::exit(1);
    }
    Ok(())
}

async fn run(cfg: AppConfig) -> Result<()> {
    let tz: Tz = cfg.controller.timezone.parse().map_err(|_| anyhow::anyhow!("invalid timezone {}", cfg.controller.timezone))?;

    // The Scheduler implements `CoordinatorEvents`, but adapters need a
    // events handle at construction time, before the Scheduler exists.
    // `EventsHandle` breaks that cycle (see scheduler/events.rs).
    let events_handle = EventsHandle::new();
    let events: Arc<dyn scheduler::CoordinatorEvents> = events_handle.clone();

    let eos = Arc::new(EosClient::new(&cfg.eos).context("failed to build EOS client")?);

    let price: Arc<dyn adapters::price::PriceSource> =
        Arc::new(TibberPriceSource::new(&cfg.price, cfg.controller.max_retries).context("failed to build price source")?);

    let pv: Arc<dyn adapters::pv::PvSource> =
        Arc::new(AkkudoktorPvSource::new(&cfg.pv, tz, cfg.controller.max_retries).context("failed to build PV source")?);

    let history = HttpHistorySource::new(
        cfg.load_profile.base_url.clone(),
        cfg.load_profile.source,
        cfg.load_profile.access_token.clone(),
        cfg.load_profile.http_timeout_secs,
    )
    .context("failed to build load-history source")?;
    let load_builder = LoadProfileBuilder::new(history, cfg.load_profile.clone(), tz);
    let load: Arc<dyn adapters::load::LoadProfileSource> = Arc::new(BuiltLoadProfileSource::new(load_builder));

    let battery: Arc<dyn adapters::battery::BatterySource> = Arc::new(
        PersistenceBatterySource::new(
            cfg.battery.clone(),
            cfg.load_profile.base_url.clone(),
            cfg.load_profile.source,
            cfg.load_profile.access_token.clone(),
            cfg.controller.max_retries,
            Some(Arc::clone(&events)),
        )
        .context("failed to build battery source")?,
    );

    let evcc: Arc<dyn EvccSource> = if cfg.evcc.enabled {
        Arc::new(
            HttpEvccSource::new(&cfg.evcc, cfg.controller.max_retries, Some(Arc::clone(&events)))
                .context("failed to build EVCC source")?,
        )
    } else {
        Arc::new(FixedEvccSource::new(EvccSnapshot::default()))
    };

    let inverter = build_inverter(&cfg.inverter, Arc::clone(&evcc)).await?;

    let mqtt_bridge = if cfg.mqtt.enabled {
        match mqtt::MqttBridge::connect(&cfg.mqtt, Arc::clone(&events)).await {
            Ok(bridge) => Some(bridge),
            Err(e) => {
                warn!(error = %e, "failed to connect MQTT bridge, continuing without telemetry publishing");
                None
            }
        }
    } else {
        None
    };
    let telemetry_sink: Option<Arc<dyn scheduler::TelemetrySink>> =
        mqtt_bridge.clone().map(|b| b as Arc<dyn scheduler::TelemetrySink>);

    let poll_intervals = PollIntervals {
        price_secs: cfg.price.poll_interval_secs,
        pv_secs: cfg.pv.poll_interval_secs,
        load_secs: cfg.load_profile.poll_interval_secs,
        battery_secs: cfg.battery.poll_interval_secs,
        evcc_secs: cfg.evcc.poll_interval_secs,
    };

    let scheduler = Scheduler::new(
        cfg.controller.clone(),
        tz,
        eos,
        price,
        pv,
        load,
        battery,
        cfg.battery.clone(),
        evcc,
        inverter,
        telemetry_sink,
        poll_intervals,
    );
    events_handle.bind(scheduler.clone() as Arc<dyn scheduler::CoordinatorEvents>);

    scheduler.spawn();

    let app = api::router(AppState { scheduler: Arc::clone(&scheduler) });
    let listener = bind_with_fallback(&cfg.server).await?;
    let addr = listener.local_addr().context("failed to read bound socket address")?;
    info!(%addr, "listening");

    axum::serve(listener, app).with_graceful_shutdown(telemetry::shutdown_signal()).await?;

    info!("graceful shutdown started");
    scheduler.shutdown().await;
    if let Some(bridge) = mqtt_bridge {
        bridge.shutdown().await;
    }
    warn!("shutdown complete");
    Ok(())
}

/// Builds the inverter sink for the configured `InverterKind` (spec §9
/// polymorphism note). `FroniusGen24*` variants require the `modbus`
/// feature and a `modbus` block in config.
async fn build_inverter(cfg: &InverterConfig, evcc: Arc<dyn EvccSource>) -> Result<Arc<dyn InverterSink>> {
    match cfg.kind {
        InverterKind::FroniusGen24 | InverterKind::FroniusGen24Legacy => {
            #[cfg(feature = "modbus")]
            {
                let modbus_cfg = cfg.modbus.as_ref().context("inverter.modbus config required for Fronius Gen24")?;
                let legacy = matches!(cfg.kind, InverterKind::FroniusGen24Legacy);
                let inverter = adapters::inverter::FroniusGen24Inverter::connect(modbus_cfg, legacy)
                    .await
                    .context("failed to connect to Fronius Gen24 inverter")?;
                Ok(Arc::new(inverter))
            }
            #[cfg(not(feature = "modbus"))]
            {
                anyhow::bail!("inverter.kind=FroniusGen24* requires the `modbus` build feature")
            }
        }
        InverterKind::EvccExternalBattery => Ok(Arc::new(EvccExternalBatteryInverter::new(evcc))),
        InverterKind::NoopShowOnly => Ok(Arc::new(NoopInverter::new())),
    }
}

/// Binds the HTTP listener, trying `port_fallback_attempts` adjacent ports
/// on `EADDRINUSE` before giving up (spec §6).
async fn bind_with_fallback(cfg: &config::ServerConfig) -> Result<tokio::net::TcpListener> {
    let mut port = cfg.port;
    let mut last_err = None;
    for attempt in 0..=cfg.port_fallback_attempts {
        let addr = format!("{}:{}", cfg.host, port);
        match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => {
                if attempt > 0 {
                    warn!(port, "bound to fallback port after EADDRINUSE");
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                warn!(port, "address in use, trying next port");
                last_err = Some(e);
                port += 1;
            }
            Err(e) => return Err(e).context("failed to bind HTTP listener"),
        }
    }
    Err(last_err.unwrap()).context("exhausted port_fallback_attempts, all candidate ports in use")
}
