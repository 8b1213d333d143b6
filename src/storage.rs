//! Durable key/value store for the device configuration.
//!
//! Values live in a small flash partition split into two banks. Every write
//! produces a complete new snapshot in the inactive bank and only becomes
//! visible once its header and CRC verify, so an interrupted or failed commit
//! leaves the previous snapshot in force.

use core::cell::RefCell;

use crc::{Crc, CRC_32_ISCSI};
use embassy_sync::blocking_mutex::{raw::CriticalSectionRawMutex, Mutex};
use embedded_storage::nor_flash::NorFlash;
use heapless::String;
use log::{debug, error};

/// Longest accepted key, in bytes
pub const MAX_KEY_LEN: usize = 15;
/// Longest string value, in bytes (excluding any terminator)
pub const MAX_STRING_LEN: usize = 255;

const MAGIC: u32 = 0x564F_474E;
const HEADER_LEN: usize = 16;
const PAYLOAD_CAPACITY: usize = 2048;
const VERIFY_CHUNK: usize = 64;

const KIND_U16: u8 = 0;
const KIND_STR: u8 = 1;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    /// The partition geometry is unusable or the store is already in use
    Open,
    Read,
    Erase,
    Write,
    /// The written snapshot did not read back intact
    Commit,
    /// A stored record could not be decoded
    Corrupt,
    /// The snapshot would not fit in a bank
    Full,
    InvalidKey,
    ValueTooLong,
    /// The key holds a value of another type
    TypeMismatch,
}

/// Typed configuration persistence.
///
/// Reads of missing keys yield the supplied default. Every write is durable
/// once it returns `Ok`.
pub trait ConfigStore {
    fn get_u16(&self, key: &str, default: u16) -> Result<u16, StorageError>;
    fn set_u16(&self, key: &str, value: u16) -> Result<(), StorageError>;
    fn get_str(&self, key: &str, default: &str) -> Result<String<MAX_STRING_LEN>, StorageError>;
    fn set_str(&self, key: &str, value: &str) -> Result<(), StorageError>;
}

#[derive(Clone, Copy)]
enum Value<'a> {
    U16(u16),
    Str(&'a str),
}

struct Record<'a> {
    key: &'a str,
    kind: u8,
    value: &'a [u8],
}

struct Records<'a> {
    bytes: &'a [u8],
}

impl<'a> Iterator for Records<'a> {
    type Item = Result<Record<'a>, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.bytes.is_empty() {
            return None;
        }

        let parsed = parse_record(self.bytes);
        match parsed {
            Ok((record, used)) => {
                self.bytes = &self.bytes[used..];
                Some(Ok(record))
            }
            Err(e) => {
                self.bytes = &[];
                Some(Err(e))
            }
        }
    }
}

fn parse_record(bytes: &[u8]) -> Result<(Record<'_>, usize), StorageError> {
    let key_len = *bytes.first().ok_or(StorageError::Corrupt)? as usize;
    let kind_at = 1 + key_len;
    let len_at = kind_at + 1;
    let value_at = len_at + 2;

    if bytes.len() < value_at {
        return Err(StorageError::Corrupt);
    }

    let key = core::str::from_utf8(&bytes[1..kind_at]).map_err(|_| StorageError::Corrupt)?;
    let kind = bytes[kind_at];
    let value_len = u16::from_le_bytes([bytes[len_at], bytes[len_at + 1]]) as usize;
    let end = value_at + value_len;

    if bytes.len() < end {
        return Err(StorageError::Corrupt);
    }

    Ok((
        Record {
            key,
            kind,
            value: &bytes[value_at..end],
        },
        end,
    ))
}

fn encode_record(out: &mut [u8], at: usize, key: &str, value: Value<'_>) -> Result<usize, StorageError> {
    let (kind, u16_bytes, bytes): (u8, [u8; 2], &[u8]) = match value {
        Value::U16(v) => (KIND_U16, v.to_le_bytes(), &[]),
        Value::Str(s) => (KIND_STR, [0; 2], s.as_bytes()),
    };
    let value: &[u8] = if kind == KIND_U16 { &u16_bytes } else { bytes };
    let end = at + 1 + key.len() + 1 + 2 + value.len();

    if end > out.len() {
        return Err(StorageError::Full);
    }

    let mut i = at;
    out[i] = key.len() as u8;
    i += 1;
    out[i..i + key.len()].copy_from_slice(key.as_bytes());
    i += key.len();
    out[i] = kind;
    i += 1;
    out[i..i + 2].copy_from_slice(&(value.len() as u16).to_le_bytes());
    i += 2;
    out[i..end].copy_from_slice(value);

    Ok(end)
}

fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(StorageError::InvalidKey);
    }
    Ok(())
}

fn round_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

#[derive(Clone, Copy)]
struct Header {
    magic: u32,
    sequence: u32,
    len: u32,
    crc: u32,
}

impl Header {
    fn decode(raw: &[u8; HEADER_LEN]) -> Self {
        let word = |i: usize| u32::from_le_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        Self {
            magic: word(0),
            sequence: word(4),
            len: word(8),
            crc: word(12),
        }
    }

    fn encode(&self) -> [u8; HEADER_LEN] {
        let mut raw = [0u8; HEADER_LEN];
        raw[0..4].copy_from_slice(&self.magic.to_le_bytes());
        raw[4..8].copy_from_slice(&self.sequence.to_le_bytes());
        raw[8..12].copy_from_slice(&self.len.to_le_bytes());
        raw[12..16].copy_from_slice(&self.crc.to_le_bytes());
        raw
    }
}

/// The bank currently in force and its decoded payload.
struct Snapshot {
    payload: [u8; PAYLOAD_CAPACITY],
    len: usize,
    bank: Option<u32>,
    sequence: u32,
}

impl Snapshot {
    fn records(&self) -> Records<'_> {
        Records {
            bytes: &self.payload[..self.len],
        }
    }

    fn find(&self, key: &str) -> Result<Option<Record<'_>>, StorageError> {
        for record in self.records() {
            let record = record?;
            if record.key == key {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }
}

/// [`ConfigStore`] over a NOR flash partition made of two erase-aligned banks.
pub struct FlashConfigStore<F> {
    flash: Mutex<CriticalSectionRawMutex, RefCell<F>>,
    offset: u32,
}

impl<F: NorFlash> FlashConfigStore<F> {
    pub fn new(flash: F, offset: u32, size: u32) -> Result<Self, StorageError> {
        let bank_size = Self::bank_size();

        if offset as usize % F::ERASE_SIZE != 0
            || (size as usize) < 2 * bank_size
            || offset as usize + 2 * bank_size > flash.capacity()
            || HEADER_LEN % F::WRITE_SIZE != 0
            || PAYLOAD_CAPACITY % F::WRITE_SIZE != 0
        {
            error!("Config partition at {:#x} ({} bytes) is unusable", offset, size);
            return Err(StorageError::Open);
        }

        Ok(Self {
            flash: Mutex::new(RefCell::new(flash)),
            offset,
        })
    }

    /// Hands the flash device back, e.g. to reopen the partition.
    pub fn release(self) -> F {
        self.flash.into_inner().into_inner()
    }

    fn bank_size() -> usize {
        round_up(HEADER_LEN + PAYLOAD_CAPACITY, F::ERASE_SIZE)
    }

    fn bank_offset(&self, bank: u32) -> u32 {
        self.offset + bank * Self::bank_size() as u32
    }

    fn with_flash<R>(&self, f: impl FnOnce(&mut F) -> Result<R, StorageError>) -> Result<R, StorageError> {
        self.flash.lock(|cell| {
            let mut flash = cell.try_borrow_mut().map_err(|_| StorageError::Open)?;
            f(&mut flash)
        })
    }

    fn read_header(flash: &mut F, offset: u32) -> Result<Option<Header>, StorageError> {
        let mut raw = [0u8; HEADER_LEN];
        flash.read(offset, &mut raw).map_err(|_| StorageError::Read)?;
        let header = Header::decode(&raw);

        if header.magic != MAGIC || header.len as usize > PAYLOAD_CAPACITY {
            return Ok(None);
        }
        Ok(Some(header))
    }

    fn load(&self, flash: &mut F) -> Result<Snapshot, StorageError> {
        let mut snapshot = Snapshot {
            payload: [0xFF; PAYLOAD_CAPACITY],
            len: 0,
            bank: None,
            sequence: 0,
        };

        let mut candidates: [Option<(u32, Header)>; 2] = [None, None];
        for (bank, slot) in candidates.iter_mut().enumerate() {
            let bank = bank as u32;
            *slot = Self::read_header(flash, self.bank_offset(bank))?.map(|h| (bank, h));
        }

        // Newest sequence first, wrapping-aware
        if let [Some((_, a)), Some((_, b))] = candidates {
            if (b.sequence.wrapping_sub(a.sequence) as i32) > 0 {
                candidates.swap(0, 1);
            }
        }

        for (bank, header) in candidates.into_iter().flatten() {
            let len = header.len as usize;
            let read_len = round_up(len, F::READ_SIZE).min(PAYLOAD_CAPACITY);
            flash
                .read(self.bank_offset(bank) + HEADER_LEN as u32, &mut snapshot.payload[..read_len])
                .map_err(|_| StorageError::Read)?;

            if CRC32.checksum(&snapshot.payload[..len]) == header.crc {
                snapshot.len = len;
                snapshot.bank = Some(bank);
                snapshot.sequence = header.sequence;
                return Ok(snapshot);
            }

            error!("Config bank {} failed its CRC check, skipping", bank);
        }

        snapshot.len = 0;
        Ok(snapshot)
    }

    fn get(&self, key: &str, f: impl FnOnce(Option<Record<'_>>) -> Result<(), StorageError>) -> Result<(), StorageError> {
        validate_key(key)?;
        self.with_flash(|flash| {
            let snapshot = self.load(flash)?;
            f(snapshot.find(key)?)
        })
    }

    fn set(&self, key: &str, value: Value<'_>) -> Result<(), StorageError> {
        validate_key(key)?;
        if let Value::Str(s) = value {
            if s.len() > MAX_STRING_LEN {
                return Err(StorageError::ValueTooLong);
            }
        }

        self.with_flash(|flash| {
            let current = self.load(flash)?;

            let mut next = [0xFFu8; PAYLOAD_CAPACITY];
            let mut len = 0;
            for record in current.records() {
                let record = record?;
                if record.key == key {
                    continue;
                }
                let existing = match record.kind {
                    KIND_U16 if record.value.len() == 2 => {
                        Value::U16(u16::from_le_bytes([record.value[0], record.value[1]]))
                    }
                    KIND_STR => Value::Str(
                        core::str::from_utf8(record.value).map_err(|_| StorageError::Corrupt)?,
                    ),
                    _ => return Err(StorageError::Corrupt),
                };
                len = encode_record(&mut next, len, record.key, existing)?;
            }
            len = encode_record(&mut next, len, key, value)?;

            let target = match current.bank {
                Some(0) => 1,
                _ => 0,
            };
            let header = Header {
                magic: MAGIC,
                sequence: current.sequence.wrapping_add(1),
                len: len as u32,
                crc: CRC32.checksum(&next[..len]),
            };

            self.commit(flash, target, &header, &mut next, len)
        })
    }

    fn commit(
        &self,
        flash: &mut F,
        bank: u32,
        header: &Header,
        payload: &mut [u8; PAYLOAD_CAPACITY],
        len: usize,
    ) -> Result<(), StorageError> {
        let offset = self.bank_offset(bank);
        let padded = round_up(len, F::WRITE_SIZE);
        payload[len..padded].fill(0xFF);

        flash
            .erase(offset, offset + Self::bank_size() as u32)
            .map_err(|_| StorageError::Erase)?;

        if padded > 0 {
            flash
                .write(offset + HEADER_LEN as u32, &payload[..padded])
                .map_err(|_| StorageError::Write)?;
        }

        // Header goes last: a bank without it is never picked up
        flash
            .write(offset, &header.encode())
            .map_err(|_| StorageError::Write)?;

        self.verify(flash, offset, header).map_err(|e| {
            error!("Config commit to bank {} failed verification: {:?}", bank, e);
            StorageError::Commit
        })?;

        debug!(
            "Committed config snapshot #{} ({} bytes) to bank {}",
            header.sequence, len, bank
        );
        Ok(())
    }

    fn verify(&self, flash: &mut F, offset: u32, header: &Header) -> Result<(), StorageError> {
        match Self::read_header(flash, offset)? {
            Some(stored) if stored.sequence == header.sequence && stored.crc == header.crc => {}
            _ => return Err(StorageError::Commit),
        }

        let mut digest = CRC32.digest();
        let mut chunk = [0u8; VERIFY_CHUNK];
        let len = header.len as usize;
        let mut done = 0;

        while done < len {
            let take = (len - done).min(VERIFY_CHUNK);
            let read_len = round_up(take, F::READ_SIZE).min(VERIFY_CHUNK);
            flash
                .read(offset + (HEADER_LEN + done) as u32, &mut chunk[..read_len])
                .map_err(|_| StorageError::Read)?;
            digest.update(&chunk[..take]);
            done += take;
        }

        if digest.finalize() != header.crc {
            return Err(StorageError::Commit);
        }
        Ok(())
    }
}

impl<F: NorFlash> ConfigStore for FlashConfigStore<F> {
    fn get_u16(&self, key: &str, default: u16) -> Result<u16, StorageError> {
        let mut value = default;
        self.get(key, |record| {
            if let Some(record) = record {
                if record.kind != KIND_U16 || record.value.len() != 2 {
                    return Err(StorageError::TypeMismatch);
                }
                value = u16::from_le_bytes([record.value[0], record.value[1]]);
            }
            Ok(())
        })?;
        Ok(value)
    }

    fn set_u16(&self, key: &str, value: u16) -> Result<(), StorageError> {
        self.set(key, Value::U16(value))
    }

    fn get_str(&self, key: &str, default: &str) -> Result<String<MAX_STRING_LEN>, StorageError> {
        let mut value = String::new();
        self.get(key, |record| {
            let text = match record {
                Some(record) if record.kind == KIND_STR => {
                    core::str::from_utf8(record.value).map_err(|_| StorageError::Corrupt)?
                }
                Some(_) => return Err(StorageError::TypeMismatch),
                None => default,
            };
            value.push_str(text).map_err(|_| StorageError::ValueTooLong)
        })?;
        Ok(value)
    }

    fn set_str(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.set(key, Value::Str(value))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    extern crate std;
    use std::{cell::Cell, rc::Rc, vec, vec::Vec};

    use embedded_storage::nor_flash::{ErrorType, NorFlashError, NorFlashErrorKind, ReadNorFlash};

    #[derive(Debug)]
    pub struct RamFlashError;

    impl NorFlashError for RamFlashError {
        fn kind(&self) -> NorFlashErrorKind {
            NorFlashErrorKind::Other
        }
    }

    /// NOR flash simulator: erase sets bytes to 0xFF, writes can only clear bits.
    pub struct RamFlash {
        pub data: Vec<u8>,
        pub fail_writes: Rc<Cell<bool>>,
        pub fail_reads: Rc<Cell<bool>>,
    }

    impl RamFlash {
        pub fn new(size: usize) -> Self {
            Self {
                data: vec![0xFF; size],
                fail_writes: Rc::new(Cell::new(false)),
                fail_reads: Rc::new(Cell::new(false)),
            }
        }
    }

    impl ErrorType for RamFlash {
        type Error = RamFlashError;
    }

    impl ReadNorFlash for RamFlash {
        const READ_SIZE: usize = 4;

        fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
            if self.fail_reads.get() {
                return Err(RamFlashError);
            }
            let start = offset as usize;
            bytes.copy_from_slice(&self.data[start..start + bytes.len()]);
            Ok(())
        }

        fn capacity(&self) -> usize {
            self.data.len()
        }
    }

    impl NorFlash for RamFlash {
        const WRITE_SIZE: usize = 4;
        const ERASE_SIZE: usize = 1024;

        fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
            if self.fail_writes.get() {
                return Err(RamFlashError);
            }
            self.data[from as usize..to as usize].fill(0xFF);
            Ok(())
        }

        fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
            if self.fail_writes.get() {
                return Err(RamFlashError);
            }
            let start = offset as usize;
            for (cell, byte) in self.data[start..start + bytes.len()].iter_mut().zip(bytes) {
                *cell &= *byte;
            }
            Ok(())
        }
    }

    pub const TEST_PARTITION_SIZE: u32 = 8192;

    pub fn ram_store() -> FlashConfigStore<RamFlash> {
        FlashConfigStore::new(RamFlash::new(TEST_PARTITION_SIZE as usize), 0, TEST_PARTITION_SIZE)
            .unwrap()
    }

    #[test]
    fn missing_keys_return_defaults() {
        let store = ram_store();
        assert_eq!(store.get_u16("read_interval", 15).unwrap(), 15);
        assert_eq!(store.get_str("wifi_ssid", "fallback").unwrap(), "fallback");
    }

    #[test]
    fn values_round_trip_and_coexist() {
        let store = ram_store();
        store.set_u16("read_interval", 30).unwrap();
        store.set_str("wifi_ssid", "home-net").unwrap();
        store.set_u16("read_interval", 45).unwrap();

        assert_eq!(store.get_u16("read_interval", 0).unwrap(), 45);
        assert_eq!(store.get_str("wifi_ssid", "").unwrap(), "home-net");
    }

    #[test]
    fn values_survive_reopening_the_partition() {
        let store = ram_store();
        store.set_str("mqtt_broker_url", "mqtt://broker.local").unwrap();
        store.set_u16("sds_warm_up", 20).unwrap();

        let flash = store.release();
        let reopened = FlashConfigStore::new(flash, 0, TEST_PARTITION_SIZE).unwrap();
        assert_eq!(
            reopened.get_str("mqtt_broker_url", "").unwrap(),
            "mqtt://broker.local"
        );
        assert_eq!(reopened.get_u16("sds_warm_up", 0).unwrap(), 20);
    }

    #[test]
    fn failed_commit_keeps_previous_value() {
        let store = ram_store();
        store.set_u16("read_interval", 10).unwrap();

        let fail_writes = store.flash.lock(|f| f.borrow().fail_writes.clone());
        fail_writes.set(true);
        assert_eq!(store.set_u16("read_interval", 99), Err(StorageError::Erase));
        fail_writes.set(false);

        assert_eq!(store.get_u16("read_interval", 0).unwrap(), 10);
    }

    #[test]
    fn read_failures_surface_as_errors() {
        let store = ram_store();
        let fail_reads = store.flash.lock(|f| f.borrow().fail_reads.clone());
        fail_reads.set(true);

        assert_eq!(store.get_u16("read_interval", 1), Err(StorageError::Read));
        assert_eq!(store.set_str("wifi_ssid", "x"), Err(StorageError::Read));
    }

    #[test]
    fn corrupted_newest_bank_falls_back_to_older_snapshot() {
        let store = ram_store();
        store.set_u16("read_interval", 5).unwrap(); // bank 0
        store.set_u16("read_interval", 6).unwrap(); // bank 1

        let mut flash = store.release();
        let bank1_payload = FlashConfigStore::<RamFlash>::bank_size() + HEADER_LEN;
        flash.data[bank1_payload + 2] ^= 0x01;

        let reopened = FlashConfigStore::new(flash, 0, TEST_PARTITION_SIZE).unwrap();
        assert_eq!(reopened.get_u16("read_interval", 0).unwrap(), 5);
    }

    #[test]
    fn rejects_bad_keys_and_mismatched_types() {
        let store = ram_store();
        assert_eq!(
            store.set_u16("a_key_that_is_too_long", 1),
            Err(StorageError::InvalidKey)
        );
        assert_eq!(store.set_u16("", 1), Err(StorageError::InvalidKey));

        store.set_str("wifi_ssid", "net").unwrap();
        assert_eq!(store.get_u16("wifi_ssid", 0), Err(StorageError::TypeMismatch));
    }

    #[test]
    fn rejects_partition_that_cannot_hold_two_banks() {
        let result = FlashConfigStore::new(RamFlash::new(8192), 0, 2048);
        assert!(matches!(result, Err(StorageError::Open)));
    }
}
