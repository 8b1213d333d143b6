#![allow(async_fn_in_trait)]

//! MQTT wire contract and publish backpressure.

use core::cell::Cell;
use core::fmt::{self, Write as _};

use embassy_sync::{
    blocking_mutex::raw::CriticalSectionRawMutex,
    channel::Channel,
    semaphore::{GreedySemaphore, Semaphore},
    signal::Signal,
};
use embassy_time::{with_timeout, Duration};
use heapless::String;
use log::{debug, warn};

use crate::constants::{EVENT_QUEUE_DEPTH, MQTT_DEFAULT_PORT};
use crate::sensors::TelemetrySample;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqttEvent {
    Connected,
    Disconnected,
    /// The broker acknowledged a QoS 1 message
    Published,
    /// A message expired from the outbox without acknowledgement
    Deleted,
}

pub type MqttEvents = Channel<CriticalSectionRawMutex, MqttEvent, EVENT_QUEUE_DEPTH>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqttState {
    Disconnected,
    Connecting,
    Connected,
}

impl MqttState {
    pub fn on_event(self, event: MqttEvent) -> MqttState {
        match event {
            MqttEvent::Connected => MqttState::Connected,
            MqttEvent::Disconnected => MqttState::Disconnected,
            MqttEvent::Published | MqttEvent::Deleted => self,
        }
    }
}

pub trait MqttDriver {
    type Error: core::fmt::Debug;

    /// Opens the session; [`MqttEvent::Connected`] follows once the broker accepted it.
    async fn start(&mut self, broker: &BrokerUrl<'_>, client_id: &str) -> Result<(), Self::Error>;
    /// Sends one QoS 1, non-retained message.
    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), Self::Error>;
    async fn stop(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerUrlError {
    Empty,
    /// Only plain TCP brokers are supported
    UnsupportedScheme,
    InvalidPort,
}

/// `mqtt://host[:port]`, `tcp://host[:port]` or `host[:port]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerUrl<'a> {
    pub host: &'a str,
    pub port: u16,
}

impl<'a> BrokerUrl<'a> {
    pub fn parse(url: &'a str) -> Result<Self, BrokerUrlError> {
        let rest = match url.split_once("://") {
            Some(("mqtt" | "tcp", rest)) => rest,
            Some(_) => return Err(BrokerUrlError::UnsupportedScheme),
            None => url,
        };

        let authority = rest.split('/').next().unwrap_or_default();
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => (
                host,
                port.parse::<u16>().map_err(|_| BrokerUrlError::InvalidPort)?,
            ),
            None => (authority, MQTT_DEFAULT_PORT),
        };

        if host.is_empty() {
            return Err(BrokerUrlError::Empty);
        }
        if port == 0 {
            return Err(BrokerUrlError::InvalidPort);
        }

        Ok(Self { host, port })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddress(pub [u8; 6]);

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

impl MacAddress {
    pub fn client_id(&self) -> Result<String<18>, fmt::Error> {
        let mut id = String::new();
        write!(id, "vogon-")?;
        for byte in self.0 {
            write!(id, "{:02X}", byte)?;
        }
        Ok(id)
    }

    pub fn topic(&self) -> Result<String<32>, fmt::Error> {
        let mut topic = String::new();
        write!(topic, "vogonair/{}/raw", self)?;
        Ok(topic)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetryPoint {
    pub sensor: u16,
    pub parameter: u8,
    pub value: f32,
}

pub const SENSOR_ENVIRONMENTAL: u16 = 0x01;
pub const SENSOR_PARTICULATE: u16 = 0x02;

impl TelemetryPoint {
    /// The four messages of a cycle, in publish order.
    pub fn from_sample(sample: &TelemetrySample) -> [TelemetryPoint; 4] {
        let point = |sensor, parameter, value| TelemetryPoint {
            sensor,
            parameter,
            value,
        };
        [
            point(SENSOR_ENVIRONMENTAL, 0x01, sample.temperature),
            point(SENSOR_ENVIRONMENTAL, 0x02, sample.humidity),
            point(SENSOR_PARTICULATE, 0x01, f32::from(sample.pm2_5)),
            point(SENSOR_PARTICULATE, 0x02, f32::from(sample.pm10)),
        ]
    }

    pub fn to_json(&self, address: &MacAddress) -> Result<String<128>, fmt::Error> {
        let mut payload = String::new();
        write!(
            payload,
            "{{\"address\":\"{}\",\"sensor\":{},\"parameter\":{},\"value\":",
            address, self.sensor, self.parameter
        )?;
        if self.value.is_finite() {
            write!(payload, "{}", self.value)?;
        } else {
            write!(payload, "null")?;
        }
        write!(payload, "}}")?;
        Ok(payload)
    }
}

/// Bounds the number of unacknowledged publishes.
///
/// A publish that cannot get a permit within `wait` goes out anyway and is
/// recorded as debt; its acknowledgement repays the debt instead of adding a
/// permit.
pub struct PublishWindow {
    permits: GreedySemaphore<CriticalSectionRawMutex>,
    capacity: usize,
    wait: Duration,
    in_flight: Cell<usize>,
    debt: Cell<usize>,
    settled: Signal<CriticalSectionRawMutex, ()>,
}

impl PublishWindow {
    pub fn new(capacity: usize, wait: Duration) -> Self {
        Self {
            permits: GreedySemaphore::new(capacity),
            capacity,
            wait,
            in_flight: Cell::new(0),
            debt: Cell::new(0),
            settled: Signal::new(),
        }
    }

    /// Unacknowledged publishes, with and without a permit.
    pub fn outstanding(&self) -> usize {
        self.in_flight.get() + self.debt.get()
    }

    /// `false` if no permit freed up in time and the publish goes out unbounded.
    pub async fn acquire(&self) -> bool {
        match with_timeout(self.wait, self.permits.acquire(1)).await {
            Ok(Ok(permit)) => {
                permit.disarm();
                self.in_flight.set(self.in_flight.get() + 1);
                true
            }
            _ => {
                self.debt.set(self.debt.get() + 1);
                false
            }
        }
    }

    /// Records an acknowledgement or expiry of any outstanding publish.
    pub fn settle(&self) {
        if self.debt.get() > 0 {
            self.debt.set(self.debt.get() - 1);
        } else if self.in_flight.get() > 0 {
            self.in_flight.set(self.in_flight.get() - 1);
            self.permits.release(1);
        } else {
            warn!("Acknowledgement without an outstanding publish");
            return;
        }
        self.settled.signal(());
    }

    /// Gives back the slot of a publish that never reached the broker.
    pub fn abandon(&self, permitted: bool) {
        if permitted && self.in_flight.get() > 0 {
            self.in_flight.set(self.in_flight.get() - 1);
            self.permits.release(1);
        } else if !permitted && self.debt.get() > 0 {
            self.debt.set(self.debt.get() - 1);
        }
        self.settled.signal(());
    }

    /// Waits until every publish settled and the full capacity is back.
    pub async fn drain(&self, timeout: Duration) -> bool {
        with_timeout(timeout, async {
            while self.outstanding() > 0 {
                self.settled.wait().await;
            }
            // Permits are handed back on drop
            let _all = self.permits.acquire(self.capacity).await;
            debug!("Publish window drained");
        })
        .await
        .is_ok()
    }
}
