//! Averages a bulk of temperature/humidity samples.

use embassy_time::Timer;
use log::{error, info};

use super::{EnvironmentalReading, EnvironmentalSlot, HumidityTemperatureSensor};
use crate::config::BulkSettings;

#[derive(Debug, PartialEq)]
pub enum PollError<E> {
    /// Sample `index` (1-based) failed; no average is reported
    Sensor { index: u16, error: E },
    NoSamples,
}

/// Takes `settings.count` samples, pausing `settings.interval` after each.
///
/// A single failed read fails the whole bulk.
pub async fn measure<S: HumidityTemperatureSensor>(
    sensor: &mut S,
    settings: BulkSettings,
) -> Result<EnvironmentalReading, PollError<S::Error>> {
    if settings.count == 0 {
        return Err(PollError::NoSamples);
    }

    let (mut temperature, mut humidity) = (0.0f32, 0.0f32);

    for index in 1..=settings.count {
        let reading = sensor.read().await.map_err(|error| {
            error!("DHT22 measurement {}/{} failed: {:?}", index, settings.count, error);
            PollError::Sensor { index, error }
        })?;

        info!(
            "Measured [{}/{}]: {:.1} °C, {:.1} %",
            index, settings.count, reading.temperature, reading.humidity
        );
        temperature += reading.temperature;
        humidity += reading.humidity;

        Timer::after(settings.interval).await;
    }

    let count = f32::from(settings.count);
    Ok(EnvironmentalReading {
        temperature: temperature / count,
        humidity: humidity / count,
    })
}

/// Environmental task body: fills its slot on success only.
pub async fn run<S: HumidityTemperatureSensor>(
    sensor: &mut S,
    settings: BulkSettings,
    slot: EnvironmentalSlot<'_>,
) -> Result<(), PollError<S::Error>> {
    let reading = measure(sensor, settings).await?;
    info!(
        "Final measurements: {:.1} °C, {:.1} %",
        reading.temperature, reading.humidity
    );
    slot.complete(reading);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::TelemetryExchange;

    extern crate std;
    use std::{collections::VecDeque, vec::Vec};

    use embassy_time::Duration;

    struct Scripted {
        readings: VecDeque<Result<f32, ()>>,
    }

    impl Scripted {
        fn new(temperatures: Vec<Result<f32, ()>>) -> Self {
            Self {
                readings: temperatures.into(),
            }
        }
    }

    impl HumidityTemperatureSensor for Scripted {
        type Error = ();

        async fn read(&mut self) -> Result<EnvironmentalReading, ()> {
            let temperature = self.readings.pop_front().ok_or(())??;
            Ok(EnvironmentalReading {
                temperature,
                humidity: temperature * 2.0,
            })
        }
    }

    fn settings(count: u16) -> BulkSettings {
        BulkSettings {
            count,
            interval: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn reports_the_mean() {
        let mut sensor = Scripted::new(std::vec![Ok(20.0), Ok(22.0), Ok(24.0)]);
        let reading = measure(&mut sensor, settings(3)).await.unwrap();

        assert!((reading.temperature - 22.0).abs() < f32::EPSILON);
        assert!((reading.humidity - 44.0).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn one_failed_read_discards_the_cycle() {
        let exchange = TelemetryExchange::new();
        let (env, _pm) = exchange.slots();
        let mut sensor = Scripted::new(std::vec![Ok(20.0), Err(()), Ok(24.0)]);

        assert_eq!(
            run(&mut sensor, settings(3), env).await,
            Err(PollError::Sensor { index: 2, error: () })
        );

        let sample = exchange.wait_all(Duration::from_millis(20)).await;
        assert_eq!(sample.temperature, 0.0);
        assert_eq!(sample.humidity, 0.0);
    }

    #[tokio::test]
    async fn zero_samples_is_an_error() {
        let mut sensor = Scripted::new(Vec::new());
        assert_eq!(measure(&mut sensor, settings(0)).await, Err(PollError::NoSamples));
    }
}
