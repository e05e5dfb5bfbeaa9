//! `CoordinatorEvents` — constructor-injected callback interface (spec §9
//! redesign note: "re-architect as constructor injection... the scheduler
//! implements this interface and passes itself in").
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::domain::EvccSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverrideCommand {
    pub mode: i8,
    pub duration_minutes: i64,
    pub grid_charge_power_w: f64,
}

#[async_trait]
pub trait CoordinatorEvents: Send + Sync {
    async fn on_soc_threshold(&self, soc_percent: f64);
    async fn on_evcc_changed(&self, snapshot: EvccSnapshot);
    async fn on_mqtt_command(&self, cmd: OverrideCommand);
}

/// Breaks the construction cycle between the Scheduler (which owns the
/// adapters) and the adapters (which are constructed with a
/// `CoordinatorEvents` handle pointing back at the Scheduler): adapters are
/// built against this handle first, the Scheduler is then constructed from
/// those adapters, and `bind` installs the finished `Arc<Scheduler>` into
/// the handle. Calls arriving before `bind` (there are none in practice,
/// since adapters only invoke these callbacks in response to a `refresh()`
/// that main.rs only triggers after binding) are logged and dropped.
#[derive(Default)]
pub struct EventsHandle(OnceCell<Arc<dyn CoordinatorEvents>>);

impl EventsHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self(OnceCell::new()))
    }

    pub fn bind(&self, events: Arc<dyn CoordinatorEvents>) {
        if self.0.set(events).is_err() {
            debug!("EventsHandle already bound, ignoring duplicate bind");
        }
    }
}

#[async_trait]
impl CoordinatorEvents for EventsHandle {
    async fn on_soc_threshold(&self, soc_percent: f64) {
        match self.0.get() {
            Some(events) => events.on_soc_threshold(soc_percent).await,
            None => debug!(soc_percent, "SoC threshold fired before EventsHandle was bound"),
        }
    }

    async fn on_evcc_changed(&self, snapshot: EvccSnapshot) {
        match self.0.get() {
            Some(events) => events.on_evcc_changed(snapshot).await,
            None => debug!("EVCC change fired before EventsHandle was bound"),
        }
    }

    async fn on_mqtt_command(&self, cmd: OverrideCommand) {
        match self.0.get() {
            Some(events) => events.on_mqtt_command(cmd).await,
            None => debug!("MQTT command fired before EventsHandle was bound"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::mock;

    mock! {
        Events {}
        #[async_trait]
        impl CoordinatorEvents for Events {
            async fn on_soc_threshold(&self, soc_percent: f64);
            async fn on_evcc_changed(&self, snapshot: EvccSnapshot);
            async fn on_mqtt_command(&self, cmd: OverrideCommand);
        }
    }

    #[tokio::test]
    async fn calls_before_bind_are_dropped_without_panicking() {
        let handle = EventsHandle::new();
        handle.on_soc_threshold(50.0).await;
    }

    #[tokio::test]
    async fn calls_after_bind_are_forwarded_exactly_once() {
        let handle = EventsHandle::new();
        let mut mock = MockEvents::new();
        mock.expect_on_soc_threshold().times(1).withf(|&soc| soc == 42.0).returning(|_| ());
        handle.bind(Arc::new(mock));

        handle.on_soc_threshold(42.0).await;
    }

    #[tokio::test]
    async fn bind_is_idempotent_second_bind_is_ignored() {
        let handle = EventsHandle::new();
        let mut first = MockEvents::new();
        first.expect_on_soc_threshold().times(1).returning(|_| ());
        handle.bind(Arc::new(first));

        let second = MockEvents::new();
        handle.bind(Arc::new(second));

        handle.on_soc_threshold(10.0).await;
    }
}
