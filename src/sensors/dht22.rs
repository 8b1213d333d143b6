//! # DHT22 Driver
//!
//! Single-wire driver for the `DHT22` (AM2302) temperature and humidity
//! sensor. The 18 ms start pulse is awaited so other tasks keep running; the
//! 40-bit answer is sampled with blocking microsecond delays because its
//! timing is too tight for the executor.
//!
//! Frame: humidity (16 bit), temperature (15 bit + sign), checksum (8 bit),
//! both values in tenths.

use embedded_hal::delay::DelayNs as SyncDelay;
use embedded_hal::digital::{InputPin, OutputPin, PinState};
use embedded_hal_async::delay::DelayNs as AsyncDelay;

use super::{EnvironmentalReading, HumidityTemperatureSensor};

const START_SIGNAL_LOW_MS: u32 = 18; // host holds the line low
const START_SIGNAL_HIGH_US: u32 = 40; // then releases it before the sensor answers
const BIT_SAMPLE_DELAY_US: u32 = 35; // a 1 stays high for ~70 µs, a 0 for ~26 µs
const POLL_DELAY_US: u32 = 1;
const MAX_ATTEMPTS: usize = 100;

const FRAME_LEN: usize = 5;

#[derive(Debug)]
pub enum Dht22Error<E> {
    Pin(E),
    ChecksumMismatch { expected: u8, actual: u8 },
    /// The line did not change state in time
    Timeout,
}

impl<E> From<E> for Dht22Error<E> {
    fn from(e: E) -> Self {
        Dht22Error::Pin(e)
    }
}

pub struct Dht22<P, D>
where
    P: InputPin + OutputPin,
    D: SyncDelay + AsyncDelay,
{
    pin: P,
    delay: D,
}

impl<P, D> Dht22<P, D>
where
    P: InputPin + OutputPin,
    D: SyncDelay + AsyncDelay,
{
    /// `pin` must be an open-drain line with a pull-up.
    pub fn new(pin: P, delay: D) -> Self {
        Self { pin, delay }
    }

    pub async fn read_frame(&mut self) -> Result<EnvironmentalReading, Dht22Error<P::Error>> {
        self.start().await?;
        self.await_response()?;

        let mut frame = [0u8; FRAME_LEN];
        for byte in frame.iter_mut() {
            *byte = self.read_byte()?;
        }

        decode(&frame)
    }

    async fn start(&mut self) -> Result<(), Dht22Error<P::Error>> {
        self.pin.set_low()?;
        AsyncDelay::delay_ms(&mut self.delay, START_SIGNAL_LOW_MS).await;

        self.pin.set_high()?;
        SyncDelay::delay_us(&mut self.delay, START_SIGNAL_HIGH_US);
        Ok(())
    }

    fn await_response(&mut self) -> Result<(), Dht22Error<P::Error>> {
        // 80 µs low then 80 µs high
        self.wait_for(PinState::Low)?;
        self.wait_for(PinState::High)
    }

    fn wait_for(&mut self, state: PinState) -> Result<(), Dht22Error<P::Error>> {
        for _ in 0..MAX_ATTEMPTS {
            let reached = match state {
                PinState::High => self.pin.is_high()?,
                PinState::Low => self.pin.is_low()?,
            };
            if reached {
                return Ok(());
            }
            SyncDelay::delay_us(&mut self.delay, POLL_DELAY_US);
        }

        Err(Dht22Error::Timeout)
    }

    fn read_byte(&mut self) -> Result<u8, Dht22Error<P::Error>> {
        let mut byte = 0u8;

        for _ in 0..8 {
            self.wait_for(PinState::Low)?;
            self.wait_for(PinState::High)?;
            SyncDelay::delay_us(&mut self.delay, BIT_SAMPLE_DELAY_US);

            byte <<= 1;
            if self.pin.is_high()? {
                byte |= 1;
            }
        }

        Ok(byte)
    }
}

fn decode<E>(frame: &[u8; FRAME_LEN]) -> Result<EnvironmentalReading, Dht22Error<E>> {
    let expected = frame[..4].iter().fold(0u8, |sum, b| sum.wrapping_add(*b));
    if expected != frame[4] {
        return Err(Dht22Error::ChecksumMismatch {
            expected,
            actual: frame[4],
        });
    }

    let humidity = f32::from(u16::from_be_bytes([frame[0], frame[1]])) / 10.0;
    let magnitude = f32::from(u16::from_be_bytes([frame[2] & 0x7F, frame[3]])) / 10.0;
    let temperature = if frame[2] & 0x80 != 0 {
        -magnitude
    } else {
        magnitude
    };

    Ok(EnvironmentalReading {
        temperature,
        humidity,
    })
}

impl<P, D> HumidityTemperatureSensor for Dht22<P, D>
where
    P: InputPin + OutputPin,
    P::Error: core::fmt::Debug,
    D: SyncDelay + AsyncDelay,
{
    type Error = Dht22Error<P::Error>;

    async fn read(&mut self) -> Result<EnvironmentalReading, Self::Error> {
        self.read_frame().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern crate std;
    use std::{vec, vec::Vec};

    use embedded_hal_mock::eh1::delay::NoopDelay;
    use embedded_hal_mock::eh1::digital::{Mock as PinMock, State, Transaction as PinTransaction};

    fn bits(byte: u8) -> Vec<PinTransaction> {
        (0..8)
            .rev()
            .flat_map(|i| {
                let sample = if byte & (1 << i) != 0 {
                    State::High
                } else {
                    State::Low
                };
                [
                    PinTransaction::get(State::Low),
                    PinTransaction::get(State::High),
                    PinTransaction::get(sample),
                ]
            })
            .collect()
    }

    #[tokio::test]
    async fn reads_a_full_frame() {
        // 65.2 %RH, -10.1 °C
        let frame = [0x02, 0x8C, 0x80, 0x65, 0x73];
        let mut expectations = vec![
            PinTransaction::set(State::Low),
            PinTransaction::set(State::High),
            PinTransaction::get(State::Low),
            PinTransaction::get(State::High),
        ];
        for byte in frame {
            expectations.extend(bits(byte));
        }

        let mut dht22 = Dht22::new(PinMock::new(&expectations), NoopDelay::new());
        let reading = dht22.read().await.unwrap();

        assert!((reading.humidity - 65.2).abs() < 0.01);
        assert!((reading.temperature + 10.1).abs() < 0.01);
        dht22.pin.done();
    }

    #[test]
    fn silent_line_times_out() {
        let expectations = vec![PinTransaction::get(State::High); MAX_ATTEMPTS];
        let mut dht22 = Dht22::new(PinMock::new(&expectations), NoopDelay::new());

        assert!(matches!(dht22.wait_for(PinState::Low), Err(Dht22Error::Timeout)));
        dht22.pin.done();
    }

    #[test]
    fn reads_bits_msb_first() {
        let mut dht22 = Dht22::new(PinMock::new(&bits(0xA5)), NoopDelay::new());
        assert_eq!(dht22.read_byte().unwrap(), 0xA5);
        dht22.pin.done();
    }

    #[test]
    fn decodes_positive_values() {
        let reading = decode::<()>(&[0x02, 0x58, 0x00, 0xFA, 0x54]).unwrap();
        assert!((reading.humidity - 60.0).abs() < f32::EPSILON);
        assert!((reading.temperature - 25.0).abs() < f32::EPSILON);
    }

    #[test]
    fn rejects_bad_checksum() {
        assert!(matches!(
            decode::<()>(&[1, 2, 3, 4, 9]),
            Err(Dht22Error::ChecksumMismatch {
                expected: 10,
                actual: 9
            })
        ));
    }
}
