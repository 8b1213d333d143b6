//! Wake, measure, sync, sleep.

use embassy_time::Duration;
use log::{error, info, warn};

use crate::config::{ConfigError, DeviceConfig};
use crate::constants::MEASUREMENT_DEADLINE_MARGIN_SECS;
use crate::mqtt::{MacAddress, MqttDriver};
use crate::sensors::{EnvironmentalSlot, ParticulateSlot, TelemetryExchange};
use crate::storage::ConfigStore;
use crate::sync::SyncOrchestrator;
use crate::wifi::WifiDriver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeCause {
    /// The configuration button pulled the wake pin low
    ConfigTrigger,
    Timer,
    /// Power-on or any other reset
    Other,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConfigReason {
    Requested,
    NotConfigured(ConfigError),
}

#[derive(Debug, PartialEq, Eq)]
pub enum Mode {
    /// Run the BLE configuration service until reset
    Configuration(ConfigReason),
    Measurement(DeviceConfig),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DutyCycleState {
    ModeSelect,
    Configuring,
    Measuring,
    Syncing,
    Sleeping,
}

/// What the firmware arms before entering deep sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SleepPlan {
    pub duration_us: u64,
}

/// Picks the mode of this boot from the wake cause and the stored config.
pub fn select_mode(wake: WakeCause, store: &impl ConfigStore) -> Mode {
    info!("Wake cause: {:?}", wake);

    if wake == WakeCause::ConfigTrigger {
        info!("Configuration requested, starting BLE service");
        return Mode::Configuration(ConfigReason::Requested);
    }

    match DeviceConfig::load(store) {
        Ok(config) => Mode::Measurement(config),
        Err(e) => {
            warn!("Device is not configured ({:?}), starting BLE service", e);
            Mode::Configuration(ConfigReason::NotConfigured(e))
        }
    }
}

/// Starts the sensor tasks of one cycle. Each task owns one slot and must
/// complete it only on success.
pub trait SensorTasks<'a> {
    fn launch(
        &mut self,
        config: &DeviceConfig,
        environmental: EnvironmentalSlot<'a>,
        particulate: ParticulateSlot<'a>,
    );
}

/// Work both sensor tasks are configured to do, plus a fixed margin.
pub fn measurement_deadline(config: &DeviceConfig) -> Duration {
    let environmental = config.environmental();
    let particulate = config.particulate();

    let environmental_work = environmental.interval * u32::from(environmental.count);
    let particulate_work = particulate.warm_up + particulate.bulk.interval * u32::from(particulate.bulk.count);

    environmental_work.max(particulate_work) + Duration::from_secs(MEASUREMENT_DEADLINE_MARGIN_SECS)
}

pub struct DutyCycleController<'a, W, M> {
    sync: SyncOrchestrator<'a, W, M>,
    mac: MacAddress,
    state: DutyCycleState,
    deadline: Option<Duration>,
}

impl<'a, W, M> DutyCycleController<'a, W, M>
where
    W: WifiDriver,
    M: MqttDriver,
{
    pub fn new(sync: SyncOrchestrator<'a, W, M>, mac: MacAddress) -> Self {
        Self {
            sync,
            mac,
            state: DutyCycleState::ModeSelect,
            deadline: None,
        }
    }

    /// Overrides the computed measurement deadline.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn state(&self) -> DutyCycleState {
        self.state
    }

    pub fn sync(&self) -> &SyncOrchestrator<'a, W, M> {
        &self.sync
    }

    fn transition(&mut self, next: DutyCycleState) {
        info!("Duty cycle: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Measures, syncs and returns how long to sleep. Sync failures only get
    /// logged.
    pub async fn run(
        &mut self,
        config: &DeviceConfig,
        exchange: &'a TelemetryExchange,
        sensors: &mut impl SensorTasks<'a>,
    ) -> SleepPlan {
        self.transition(DutyCycleState::Configuring);
        let deadline = self.deadline.unwrap_or_else(|| measurement_deadline(config));
        let (environmental, particulate) = exchange.slots();

        self.transition(DutyCycleState::Measuring);
        sensors.launch(config, environmental, particulate);
        let sample = exchange.wait_all(deadline).await;

        self.transition(DutyCycleState::Syncing);
        if let Err(e) = self.sync.sync(config, &sample, self.mac).await {
            error!("Sync failed, sleeping anyway: {:?}", e);
        }

        self.transition(DutyCycleState::Sleeping);
        let plan = SleepPlan {
            duration_us: config.sleep_duration_us(),
        };
        info!(
            "Sleeping for {} min ({} us)",
            config.measurement_interval_minutes, plan.duration_us
        );
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::tests::{device_config, provisioned};
    use crate::config::KEY_MEASUREMENT_INTERVAL;
    use crate::mqtt::MqttEvents;
    use crate::sensors::{EnvironmentalReading, ParticulateReading};
    use crate::storage::tests::ram_store;
    use crate::sync::tests::FakeBroker;
    use crate::sync::SyncSettings;
    use crate::wifi::tests::FakeWifi;
    use crate::wifi::WifiEvents;

    const MAC: MacAddress = MacAddress([0x24, 0x0A, 0xC4, 0x01, 0xBE, 0xEF]);

    /// Broker that refuses every session.
    struct Unreachable;

    impl MqttDriver for Unreachable {
        type Error = ();

        async fn start(&mut self, _: &crate::mqtt::BrokerUrl<'_>, _: &str) -> Result<(), ()> {
            Err(())
        }

        async fn publish(&mut self, _: &str, _: &[u8]) -> Result<(), ()> {
            Err(())
        }

        async fn stop(&mut self) {}
    }

    struct ImmediateSensors {
        environmental: bool,
        particulate: bool,
        launched: bool,
    }

    impl<'a> SensorTasks<'a> for ImmediateSensors {
        fn launch(
            &mut self,
            _config: &DeviceConfig,
            environmental: EnvironmentalSlot<'a>,
            particulate: ParticulateSlot<'a>,
        ) {
            self.launched = true;
            if self.environmental {
                environmental.complete(EnvironmentalReading {
                    temperature: 20.0,
                    humidity: 50.0,
                });
            }
            if self.particulate {
                particulate.complete(ParticulateReading { pm2_5: 5, pm10: 9 });
            }
        }
    }

    fn settings() -> SyncSettings {
        SyncSettings {
            wifi_timeout: Duration::from_millis(20),
            mqtt_timeout: Duration::from_millis(20),
            publish_wait: Duration::from_millis(10),
            drain_timeout: Duration::from_millis(20),
            concurrency: 1,
        }
    }

    #[test]
    fn config_trigger_selects_configuration_mode() {
        let store = provisioned();
        assert_eq!(
            select_mode(WakeCause::ConfigTrigger, &store),
            Mode::Configuration(ConfigReason::Requested)
        );
    }

    #[test]
    fn unconfigured_device_falls_back_to_configuration_mode() {
        let store = ram_store();
        assert!(matches!(
            select_mode(WakeCause::Timer, &store),
            Mode::Configuration(ConfigReason::NotConfigured(ConfigError::Invalid(_)))
        ));
    }

    #[test]
    fn timer_wake_with_valid_config_measures() {
        let store = provisioned();
        store.set_u16(KEY_MEASUREMENT_INTERVAL, 15).unwrap();

        match select_mode(WakeCause::Timer, &store) {
            Mode::Measurement(config) => assert_eq!(config.measurement_interval_minutes, 15),
            other => panic!("unexpected mode {:?}", other),
        }
    }

    #[test]
    fn deadline_covers_the_longest_task() {
        let mut config = device_config();
        config.environmental_bulk_size = 10;
        config.environmental_bulk_sleep_seconds = 3;
        config.particulate_warm_up_seconds = 30;
        config.particulate_bulk_size = 5;
        config.particulate_bulk_sleep_seconds = 3;

        assert_eq!(
            measurement_deadline(&config),
            Duration::from_secs(45 + MEASUREMENT_DEADLINE_MARGIN_SECS)
        );
    }

    #[tokio::test]
    async fn full_cycle_ends_in_sleep() {
        let (wifi_events, mqtt_events) = (WifiEvents::new(), MqttEvents::new());
        let exchange = TelemetryExchange::new();
        let sync = SyncOrchestrator::new(
            FakeWifi::new(&wifi_events, true),
            &wifi_events,
            FakeBroker::new(&mqtt_events, true, true),
            &mqtt_events,
        )
        .with_settings(settings());

        let mut controller = DutyCycleController::new(sync, MAC);
        let mut sensors = ImmediateSensors {
            environmental: true,
            particulate: true,
            launched: false,
        };

        let config = device_config();
        let plan = controller.run(&config, &exchange, &mut sensors).await;

        assert!(sensors.launched);
        assert_eq!(plan.duration_us, 10 * 60_000_000);
        assert_eq!(controller.state(), DutyCycleState::Sleeping);
        let published = &controller.sync().mqtt().published;
        assert_eq!(published.len(), 4);
        assert!(published[0].1.ends_with("\"sensor\":1,\"parameter\":1,\"value\":20}"));
        assert!(published[3].1.ends_with("\"sensor\":2,\"parameter\":2,\"value\":9}"));
        assert!(controller.sync().wifi().driver().stopped);
    }

    #[tokio::test]
    async fn aborted_sensor_task_does_not_block_sleep() {
        let (wifi_events, mqtt_events) = (WifiEvents::new(), MqttEvents::new());
        let exchange = TelemetryExchange::new();
        let sync = SyncOrchestrator::new(
            FakeWifi::new(&wifi_events, false),
            &wifi_events,
            Unreachable,
            &mqtt_events,
        )
        .with_settings(settings());

        let mut controller = DutyCycleController::new(sync, MAC).with_deadline(Duration::from_millis(30));
        let mut sensors = ImmediateSensors {
            environmental: true,
            particulate: false,
            launched: false,
        };

        let plan = controller.run(&device_config(), &exchange, &mut sensors).await;
        assert_eq!(plan.duration_us, 10 * 60_000_000);
        assert_eq!(controller.state(), DutyCycleState::Sleeping);
    }
}
