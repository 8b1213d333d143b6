#![allow(async_fn_in_trait)]

use embassy_sync::{
    blocking_mutex::raw::CriticalSectionRawMutex,
    semaphore::{GreedySemaphore, Semaphore},
    signal::Signal,
};
use embassy_time::{with_timeout, Duration};
use log::{info, warn};

pub mod dht22;
pub mod poller;
pub mod sds011;

/// Number of sensor tasks reporting into a [`TelemetryExchange`]
pub const SENSOR_TASKS: usize = 2;

/// Everything measured during one wake cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TelemetrySample {
    /// °C
    pub temperature: f32,
    /// % RH
    pub humidity: f32,
    /// µg/m³
    pub pm2_5: u16,
    /// µg/m³
    pub pm10: u16,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvironmentalReading {
    pub temperature: f32,
    pub humidity: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParticulateReading {
    pub pm2_5: u16,
    pub pm10: u16,
}

pub trait HumidityTemperatureSensor {
    type Error: core::fmt::Debug;

    async fn read(&mut self) -> Result<EnvironmentalReading, Self::Error>;
}

/// Collects the results of the sensor tasks of one cycle.
///
/// Each task owns a slot for its own fields only and reports completion on a
/// shared counter, which the controller awaits once per task.
pub struct TelemetryExchange {
    environmental: Signal<CriticalSectionRawMutex, EnvironmentalReading>,
    particulate: Signal<CriticalSectionRawMutex, ParticulateReading>,
    completed: GreedySemaphore<CriticalSectionRawMutex>,
}

impl Default for TelemetryExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryExchange {
    pub const fn new() -> Self {
        Self {
            environmental: Signal::new(),
            particulate: Signal::new(),
            completed: GreedySemaphore::new(0),
        }
    }

    pub fn slots(&self) -> (EnvironmentalSlot<'_>, ParticulateSlot<'_>) {
        (
            EnvironmentalSlot { exchange: self },
            ParticulateSlot { exchange: self },
        )
    }

    /// Waits until both tasks completed or `deadline` elapsed.
    ///
    /// Fields of a task that did not complete stay zero.
    pub async fn wait_all(&self, deadline: Duration) -> TelemetrySample {
        let mut done = 0;
        let waited = with_timeout(deadline, async {
            for _ in 0..SENSOR_TASKS {
                if let Ok(permit) = self.completed.acquire(1).await {
                    permit.disarm();
                }
                done += 1;
            }
        })
        .await;

        if waited.is_err() {
            warn!(
                "Only {}/{} sensor tasks completed before the deadline",
                done, SENSOR_TASKS
            );
        }

        let mut sample = TelemetrySample::default();
        if let Some(reading) = self.environmental.try_take() {
            sample.temperature = reading.temperature;
            sample.humidity = reading.humidity;
        }
        if let Some(reading) = self.particulate.try_take() {
            sample.pm2_5 = reading.pm2_5;
            sample.pm10 = reading.pm10;
        }

        info!("Telemetry sample: {:?}", sample);
        sample
    }
}

/// Write access to the temperature and humidity fields.
pub struct EnvironmentalSlot<'a> {
    exchange: &'a TelemetryExchange,
}

impl EnvironmentalSlot<'_> {
    pub fn complete(self, reading: EnvironmentalReading) {
        self.exchange.environmental.signal(reading);
        self.exchange.completed.release(1);
    }
}

/// Write access to the particulate matter fields.
pub struct ParticulateSlot<'a> {
    exchange: &'a TelemetryExchange,
}

impl ParticulateSlot<'_> {
    pub fn complete(self, reading: ParticulateReading) {
        self.exchange.particulate.signal(reading);
        self.exchange.completed.release(1);
    }
}
