//! Nova Fitness SDS011 particulate sensor over UART (9600 8N1).
//!
//! Every exchange is a 19-byte command answered by a 10-byte frame. The driver
//! keeps the sensor in query mode so measurements are only taken on request.

use embassy_time::{with_timeout, Duration, Timer};
use embedded_io_async::{Read, ReadExactError, Write};
use log::{debug, error, info, warn};

use super::{ParticulateReading, ParticulateSlot};
use crate::config::{BulkSettings, ParticulateSettings};

pub const COMMAND_LEN: usize = 19;
pub const RESPONSE_LEN: usize = 10;

const HEAD: u8 = 0xAA;
const TAIL: u8 = 0xAB;
const COMMAND_ID: u8 = 0xB4;
const DATA_REPLY: u8 = 0xC0;
const COMMAND_REPLY: u8 = 0xC5;
const ALL_DEVICES: [u8; 2] = [0xFF, 0xFF];

const CMD_REPORTING_MODE: u8 = 0x02;
const CMD_QUERY: u8 = 0x04;
const CMD_WORK_STATE: u8 = 0x06;

const READ: u8 = 0x00;
const WRITE: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sds011Error {
    Serial,
    /// Fewer than 10 bytes arrived
    Truncated,
    Timeout,
    /// Bad head, tail or reply type
    Malformed,
    Checksum,
    /// The sensor acknowledged something other than what was requested
    EchoMismatch { expected: u8, actual: u8 },
    NoSamples,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReportingMode {
    Active = 0x00,
    Query = 0x01,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkState {
    Sleep = 0x00,
    Work = 0x01,
}

/// Low byte of the sum of `bytes`.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// A framed command: head, command id, 13-byte payload, device id, checksum, tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command([u8; COMMAND_LEN]);

impl Command {
    pub fn new(payload: [u8; 13]) -> Self {
        let mut frame = [0u8; COMMAND_LEN];
        frame[0] = HEAD;
        frame[1] = COMMAND_ID;
        frame[2..15].copy_from_slice(&payload);
        frame[15..17].copy_from_slice(&ALL_DEVICES);
        frame[17] = checksum(&frame[2..=16]);
        frame[18] = TAIL;
        Self(frame)
    }

    fn with(id: u8, action: u8, value: u8) -> Self {
        let mut payload = [0u8; 13];
        payload[0] = id;
        payload[1] = action;
        payload[2] = value;
        Self::new(payload)
    }

    pub fn read_reporting_mode() -> Self {
        Self::with(CMD_REPORTING_MODE, READ, 0)
    }

    pub fn set_reporting_mode(mode: ReportingMode) -> Self {
        Self::with(CMD_REPORTING_MODE, WRITE, mode as u8)
    }

    pub fn query() -> Self {
        Self::with(CMD_QUERY, 0, 0)
    }

    pub fn set_work_state(state: WorkState) -> Self {
        Self::with(CMD_WORK_STATE, WRITE, state as u8)
    }

    pub fn id(&self) -> u8 {
        self.0[2]
    }

    pub fn as_bytes(&self) -> &[u8; COMMAND_LEN] {
        &self.0
    }
}

#[derive(Clone, Copy)]
enum Reply {
    Data,
    Command(u8),
}

fn validate(frame: &[u8; RESPONSE_LEN]) -> Result<(), Sds011Error> {
    if frame[0] != HEAD || frame[9] != TAIL {
        return Err(Sds011Error::Malformed);
    }
    if checksum(&frame[2..=7]) != frame[8] {
        return Err(Sds011Error::Checksum);
    }
    Ok(())
}

pub struct Sds011<S> {
    serial: S,
    timeout: Duration,
}

impl<S: Read + Write> Sds011<S> {
    pub fn new(serial: S, timeout: Duration) -> Self {
        Self { serial, timeout }
    }

    async fn exchange(&mut self, command: Command) -> Result<[u8; RESPONSE_LEN], Sds011Error> {
        let expected = match command.id() {
            CMD_QUERY => Reply::Data,
            id => Reply::Command(id),
        };

        self.serial
            .write_all(command.as_bytes())
            .await
            .map_err(|_| Sds011Error::Serial)?;
        self.serial.flush().await.map_err(|_| Sds011Error::Serial)?;

        with_timeout(self.timeout, self.read_reply(expected))
            .await
            .map_err(|_| Sds011Error::Timeout)?
    }

    async fn read_reply(&mut self, expected: Reply) -> Result<[u8; RESPONSE_LEN], Sds011Error> {
        loop {
            let mut frame = [0u8; RESPONSE_LEN];
            self.serial.read_exact(&mut frame).await.map_err(|e| match e {
                ReadExactError::UnexpectedEof => Sds011Error::Truncated,
                ReadExactError::Other(_) => Sds011Error::Serial,
            })?;
            validate(&frame)?;

            match (expected, frame[1]) {
                (Reply::Data, DATA_REPLY) => return Ok(frame),
                (Reply::Command(id), COMMAND_REPLY) if frame[2] == id => return Ok(frame),
                // Left over from active reporting mode
                (Reply::Command(_), DATA_REPLY) => debug!("Skipping unsolicited SDS011 data frame"),
                _ => return Err(Sds011Error::Malformed),
            }
        }
    }

    pub async fn read_reporting_mode(&mut self) -> Result<ReportingMode, Sds011Error> {
        let frame = self.exchange(Command::read_reporting_mode()).await?;
        match frame[4] {
            0x00 => Ok(ReportingMode::Active),
            0x01 => Ok(ReportingMode::Query),
            _ => Err(Sds011Error::Malformed),
        }
    }

    pub async fn set_reporting_mode(&mut self, mode: ReportingMode) -> Result<(), Sds011Error> {
        let frame = self.exchange(Command::set_reporting_mode(mode)).await?;
        echo(mode as u8, frame[4])
    }

    pub async fn set_work_state(&mut self, state: WorkState) -> Result<(), Sds011Error> {
        let frame = self.exchange(Command::set_work_state(state)).await?;
        echo(state as u8, frame[4])
    }

    /// One measurement, in whole µg/m³.
    pub async fn query(&mut self) -> Result<ParticulateReading, Sds011Error> {
        let frame = self.exchange(Command::query()).await?;
        Ok(ParticulateReading {
            pm2_5: u16::from_le_bytes([frame[2], frame[3]]) / 10,
            pm10: u16::from_le_bytes([frame[4], frame[5]]) / 10,
        })
    }

    /// Wakes the sensor, averages a bulk of samples and puts it back to sleep.
    ///
    /// Any failed exchange after the wake-up aborts the whole measurement.
    pub async fn measure(&mut self, settings: ParticulateSettings) -> Result<ParticulateReading, Sds011Error> {
        info!("Waking up SDS011");
        if let Err(e) = self.set_work_state(WorkState::Work).await {
            warn!("SDS011 did not acknowledge wake up: {:?}", e);
        }
        Timer::after(settings.warm_up).await;

        let result = self.sample(settings.bulk).await;

        info!("Setting SDS011 to sleep");
        if let Err(e) = self.set_work_state(WorkState::Sleep).await {
            warn!("SDS011 did not acknowledge sleep: {:?}", e);
        }

        result
    }

    async fn sample(&mut self, bulk: BulkSettings) -> Result<ParticulateReading, Sds011Error> {
        let mode = self.read_reporting_mode().await.inspect_err(|e| {
            error!("Unable to read SDS011 reporting mode: {:?}", e);
        })?;

        if mode == ReportingMode::Active {
            warn!("SDS011 is in active reporting mode, switching to query mode");
            self.set_reporting_mode(ReportingMode::Query).await.inspect_err(|e| {
                error!("Unable to set SDS011 query mode: {:?}", e);
            })?;
        }

        if bulk.count == 0 {
            return Err(Sds011Error::NoSamples);
        }

        let (mut pm2_5, mut pm10) = (0u32, 0u32);
        for i in 1..=bulk.count {
            let reading = self.query().await.inspect_err(|e| {
                error!("SDS011 measurement {}/{} failed: {:?}", i, bulk.count, e);
            })?;
            info!(
                "Measured [{}/{}]: PM2.5={}, PM10={}",
                i, bulk.count, reading.pm2_5, reading.pm10
            );

            pm2_5 += u32::from(reading.pm2_5);
            pm10 += u32::from(reading.pm10);
            Timer::after(bulk.interval).await;
        }

        let count = u32::from(bulk.count);
        let reading = ParticulateReading {
            pm2_5: (pm2_5 / count) as u16,
            pm10: (pm10 / count) as u16,
        };
        info!("Final measurements: PM2.5={}, PM10={}", reading.pm2_5, reading.pm10);
        Ok(reading)
    }
}

fn echo(expected: u8, actual: u8) -> Result<(), Sds011Error> {
    if expected != actual {
        return Err(Sds011Error::EchoMismatch { expected, actual });
    }
    Ok(())
}

/// Particulate task body: measures and fills its slot on success only.
pub async fn run<S: Read + Write>(
    sensor: &mut Sds011<S>,
    settings: ParticulateSettings,
    slot: ParticulateSlot<'_>,
) -> Result<(), Sds011Error> {
    let reading = sensor.measure(settings).await?;
    slot.complete(reading);
    Ok(())
}
