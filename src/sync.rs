//! Delivers one [`TelemetrySample`] to the broker.
//!
//! WiFi first, then the MQTT session, then four QoS 1 publishes bounded by a
//! [`PublishWindow`]. Both links are torn down on every exit path.

use embassy_futures::select::{select, Either};
use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, channel::Receiver};
use embassy_time::{with_timeout, Duration};
use log::{error, info, warn};

use crate::config::DeviceConfig;
use crate::constants::*;
use crate::mqtt::{
    BrokerUrl, BrokerUrlError, MacAddress, MqttDriver, MqttEvent, MqttEvents, MqttState,
    PublishWindow, TelemetryPoint,
};
use crate::sensors::TelemetrySample;
use crate::wifi::{WifiDriver, WifiError, WifiEvents, WifiLink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    pub wifi_timeout: Duration,
    pub mqtt_timeout: Duration,
    /// How long a publish waits for a window slot
    pub publish_wait: Duration,
    pub drain_timeout: Duration,
    pub concurrency: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            wifi_timeout: Duration::from_millis(WIFI_CONNECTION_TIMEOUT_MS),
            mqtt_timeout: Duration::from_millis(MQTT_CONNECTION_TIMEOUT_MS),
            publish_wait: Duration::from_millis(MQTT_MESSAGE_WAIT_TIME_MS),
            drain_timeout: Duration::from_millis(MQTT_DRAIN_TIMEOUT_MS),
            concurrency: MQTT_CONCURRENT_MESSAGES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncError {
    BrokerUrl(BrokerUrlError),
    Wifi(WifiError),
    MqttStart,
    MqttTimeout,
    /// The broker dropped the session before every publish settled
    MqttDisconnected,
    Format,
    Publish { failed: usize },
    Unacknowledged { outstanding: usize },
}

impl From<BrokerUrlError> for SyncError {
    fn from(e: BrokerUrlError) -> Self {
        SyncError::BrokerUrl(e)
    }
}

impl From<WifiError> for SyncError {
    fn from(e: WifiError) -> Self {
        SyncError::Wifi(e)
    }
}

pub struct SyncOrchestrator<'a, W, M> {
    wifi: WifiLink<'a, W>,
    mqtt: M,
    mqtt_events: Receiver<'a, CriticalSectionRawMutex, MqttEvent, EVENT_QUEUE_DEPTH>,
    mqtt_state: MqttState,
    settings: SyncSettings,
}

impl<'a, W, M> SyncOrchestrator<'a, W, M>
where
    W: WifiDriver,
    M: MqttDriver,
{
    pub fn new(wifi: W, wifi_events: &'a WifiEvents, mqtt: M, mqtt_events: &'a MqttEvents) -> Self {
        Self {
            wifi: WifiLink::new(wifi, wifi_events),
            mqtt,
            mqtt_events: mqtt_events.receiver(),
            mqtt_state: MqttState::Disconnected,
            settings: SyncSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: SyncSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn wifi(&self) -> &WifiLink<'a, W> {
        &self.wifi
    }

    pub fn mqtt(&self) -> &M {
        &self.mqtt
    }

    pub fn mqtt_state(&self) -> MqttState {
        self.mqtt_state
    }

    pub async fn sync(
        &mut self,
        config: &DeviceConfig,
        sample: &TelemetrySample,
        mac: MacAddress,
    ) -> Result<(), SyncError> {
        let broker = BrokerUrl::parse(&config.mqtt_broker_url).map_err(|e| {
            error!("Invalid broker URL {:?}: {:?}", config.mqtt_broker_url, e);
            e
        })?;

        self.wifi.connect(&config.wifi, self.settings.wifi_timeout).await?;

        let result = self.session(&broker, sample, mac).await;

        self.mqtt.stop().await;
        self.mqtt_state = MqttState::Disconnected;
        self.wifi.disconnect().await;

        match result {
            Ok(()) => info!("Telemetry synced to {}:{}", broker.host, broker.port),
            Err(e) => error!("Telemetry sync failed: {:?}", e),
        }
        result
    }

    async fn session(
        &mut self,
        broker: &BrokerUrl<'_>,
        sample: &TelemetrySample,
        mac: MacAddress,
    ) -> Result<(), SyncError> {
        let client_id = mac.client_id().map_err(|_| SyncError::Format)?;

        info!("Connecting to MQTT broker {}:{} as {}", broker.host, broker.port, client_id);
        self.mqtt_state = MqttState::Connecting;
        self.mqtt.start(broker, &client_id).await.map_err(|e| {
            error!("Failed to start MQTT client: {:?}", e);
            SyncError::MqttStart
        })?;

        let timeout = self.settings.mqtt_timeout;
        with_timeout(timeout, self.wait_connected()).await.map_err(|_| {
            error!("No MQTT session within {} ms", timeout.as_millis());
            SyncError::MqttTimeout
        })?;

        self.publish(sample, mac).await
    }

    async fn wait_connected(&mut self) {
        while self.mqtt_state != MqttState::Connected {
            let event = self.mqtt_events.receive().await;
            let next = self.mqtt_state.on_event(event);
            info!("MQTT {:?}: {:?} -> {:?}", event, self.mqtt_state, next);
            self.mqtt_state = next;
        }
    }

    async fn publish(&mut self, sample: &TelemetrySample, mac: MacAddress) -> Result<(), SyncError> {
        let topic = mac.topic().map_err(|_| SyncError::Format)?;
        let window = PublishWindow::new(self.settings.concurrency, self.settings.publish_wait);
        let settings = self.settings;

        let window = &window;
        let mqtt = &mut self.mqtt;
        let events = &self.mqtt_events;
        let state = &mut self.mqtt_state;

        let publishing = async move {
            let mut failed = 0;

            for point in TelemetryPoint::from_sample(sample) {
                let payload = match point.to_json(&mac) {
                    Ok(payload) => payload,
                    Err(_) => return Err(SyncError::Format),
                };

                let permitted = window.acquire().await;
                if !permitted {
                    error!(
                        "No publish slot within {} ms, sending without backpressure",
                        settings.publish_wait.as_millis()
                    );
                }

                match mqtt.publish(&topic, payload.as_bytes()).await {
                    Ok(()) => info!("Published to {}: {}", topic, payload),
                    Err(e) => {
                        error!("Failed to publish {}: {:?}", payload, e);
                        window.abandon(permitted);
                        failed += 1;
                    }
                }
            }

            if !window.drain(settings.drain_timeout).await {
                return Err(SyncError::Unacknowledged {
                    outstanding: window.outstanding(),
                });
            }
            if failed > 0 {
                return Err(SyncError::Publish { failed });
            }
            Ok(())
        };

        let acknowledgements = async move {
            loop {
                let event = events.receive().await;
                *state = state.on_event(event);
                match event {
                    MqttEvent::Published | MqttEvent::Deleted => window.settle(),
                    MqttEvent::Disconnected => {
                        warn!("MQTT session lost while publishing");
                        break;
                    }
                    MqttEvent::Connected => {}
                }
            }
        };

        match select(publishing, acknowledgements).await {
            Either::First(result) => result,
            Either::Second(()) => Err(SyncError::MqttDisconnected),
        }
    }
}
