//! Configuration service attribute table and its read/write contract.

use heapless::Vec;
use log::{debug, error, info, warn};

use crate::ble::BleError;
use crate::config::{ConfigEntry, EntryKind, ENTRY_COUNT, REGISTRY};
use crate::constants::MAX_ATTRIBUTE_VALUE;
use crate::storage::{ConfigStore, StorageError};

/// d0a823a6-fa98-4597-b0c1-d8577be0e158, least significant byte first
pub const SERVICE_UUID: [u8; 16] = [
    0x58, 0xE1, 0xE0, 0x7B, 0x57, 0xD8, 0xC1, 0xB0, 0x97, 0x45, 0x98, 0xFA, 0xA6, 0x23, 0xA8, 0xD0,
];

/// Characteristic properties: read | write
pub const CHARACTERISTIC_PROPERTIES: u8 = 0x02 | 0x08;

/// Service declaration plus a declaration and a value attribute per entry
pub const ATTRIBUTE_COUNT: usize = 1 + 2 * ENTRY_COUNT;

/// ATT outcome of a request, with the ESP-IDF GATT status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AttStatus {
    Ok = 0x00,
    InvalidHandle = 0x01,
    WriteNotPermitted = 0x03,
    InternalError = 0x81,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattResponse {
    pub status: AttStatus,
    pub value: Vec<u8, MAX_ATTRIBUTE_VALUE>,
}

impl GattResponse {
    fn status(status: AttStatus) -> Self {
        Self {
            status,
            value: Vec::new(),
        }
    }
}

/// Value handles assigned by the stack, one per [`REGISTRY`] entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristicMapping {
    service_handle: u16,
    value_handles: [u16; ENTRY_COUNT],
}

impl GattCharacteristicMapping {
    /// Builds the mapping from the handles of the created attribute table,
    /// in declaration order.
    pub fn from_handles(handles: &[u16]) -> Result<Self, BleError> {
        if handles.len() != ATTRIBUTE_COUNT {
            error!(
                "Attribute table has {} handles, expected {}",
                handles.len(),
                ATTRIBUTE_COUNT
            );
            return Err(BleError::AttributeTableMismatch {
                expected: ATTRIBUTE_COUNT,
                actual: handles.len(),
            });
        }

        let mut value_handles = [0u16; ENTRY_COUNT];
        for (i, handle) in value_handles.iter_mut().enumerate() {
            *handle = handles[2 + 2 * i];
        }

        Ok(Self {
            service_handle: handles[0],
            value_handles,
        })
    }

    pub fn service_handle(&self) -> u16 {
        self.service_handle
    }

    pub fn lookup(&self, handle: u16) -> Option<&'static ConfigEntry> {
        self.value_handles
            .iter()
            .position(|h| *h == handle)
            .map(|i| &REGISTRY[i])
    }

    pub fn handle_of(&self, key: &str) -> Option<u16> {
        REGISTRY
            .iter()
            .position(|e| e.key == key)
            .map(|i| self.value_handles[i])
    }

    /// Serves a (possibly offset) read of a characteristic value.
    pub fn read(&self, store: &impl ConfigStore, handle: u16, offset: usize) -> GattResponse {
        let Some(entry) = self.lookup(handle) else {
            warn!("Read of unknown handle {}", handle);
            return GattResponse::status(AttStatus::InvalidHandle);
        };

        let mut value = match load(store, entry) {
            Ok(value) => value,
            Err(e) => {
                error!("Failed to read {} from storage: {:?}", entry.key, e);
                return GattResponse::status(AttStatus::InternalError);
            }
        };

        let start = offset.min(value.len());
        value.rotate_left(start);
        value.truncate(value.len() - start);

        info!(
            "Read {:#06x} ({}) at offset {}: {} bytes",
            entry.uuid,
            entry.key,
            offset,
            value.len()
        );

        GattResponse {
            status: AttStatus::Ok,
            value,
        }
    }

    /// Applies an immediate write. Queued writes are never accepted.
    pub fn write(&self, store: &impl ConfigStore, handle: u16, data: &[u8], prepared: bool) -> AttStatus {
        if prepared {
            warn!("Rejecting prepared write to handle {}", handle);
            return AttStatus::WriteNotPermitted;
        }

        let Some(entry) = self.lookup(handle) else {
            warn!("Write to unknown handle {}", handle);
            return AttStatus::WriteNotPermitted;
        };

        debug!("Write {:#06x} ({}): {:02x?}", entry.uuid, entry.key, data);

        let result = match entry.kind {
            EntryKind::U16 { .. } => {
                let Ok(raw) = <[u8; 2]>::try_from(data) else {
                    warn!("Invalid length {} for u16 value {}", data.len(), entry.key);
                    return AttStatus::WriteNotPermitted;
                };
                store.set_u16(entry.key, u16::from_le_bytes(raw))
            }
            EntryKind::Str { max_len, .. } => {
                if data.len() > max_len {
                    warn!("{} bytes exceed the {} byte limit of {}", data.len(), max_len, entry.key);
                    return AttStatus::WriteNotPermitted;
                }
                let text = match core::str::from_utf8(data) {
                    Ok(text) if !text.contains('\0') => text,
                    _ => {
                        warn!("Value for {} is not a valid string", entry.key);
                        return AttStatus::WriteNotPermitted;
                    }
                };
                store.set_str(entry.key, text)
            }
        };

        match result {
            Ok(()) => {
                info!("Stored {} ({} bytes)", entry.key, data.len());
                AttStatus::Ok
            }
            Err(e) => {
                error!("Failed to store {}: {:?}", entry.key, e);
                AttStatus::InternalError
            }
        }
    }
}

fn load(store: &impl ConfigStore, entry: &ConfigEntry) -> Result<Vec<u8, MAX_ATTRIBUTE_VALUE>, StorageError> {
    let mut value = Vec::new();
    let filled = match entry.kind {
        EntryKind::U16 { default } => {
            let v = store.get_u16(entry.key, default)?;
            value.extend_from_slice(&v.to_le_bytes())
        }
        EntryKind::Str { default, .. } => {
            let s = store.get_str(entry.key, default)?;
            value.extend_from_slice(s.as_bytes())
        }
    };
    filled.map_err(|_| StorageError::ValueTooLong)?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KEY_MEASUREMENT_INTERVAL, KEY_MQTT_BROKER_URL, KEY_WIFI_SSID};
    use crate::storage::tests::ram_store;

    extern crate std;
    use std::vec::Vec as StdVec;

    fn mapping() -> GattCharacteristicMapping {
        let handles: StdVec<u16> = (40..40 + ATTRIBUTE_COUNT as u16).collect();
        GattCharacteristicMapping::from_handles(&handles).unwrap()
    }

    #[test]
    fn handle_count_mismatch_is_fatal() {
        let handles: StdVec<u16> = (1..ATTRIBUTE_COUNT as u16).collect();
        assert_eq!(
            GattCharacteristicMapping::from_handles(&handles),
            Err(BleError::AttributeTableMismatch {
                expected: ATTRIBUTE_COUNT,
                actual: ATTRIBUTE_COUNT - 1
            })
        );
    }

    #[test]
    fn value_handles_skip_declarations() {
        let mapping = mapping();
        assert_eq!(mapping.service_handle(), 40);
        assert_eq!(mapping.handle_of(KEY_MEASUREMENT_INTERVAL), Some(42));
        assert_eq!(mapping.lookup(42).map(|e| e.uuid), Some(0x0101));
        assert!(mapping.lookup(41).is_none());
    }

    #[test]
    fn every_entry_round_trips() {
        let mapping = mapping();
        let store = ram_store();

        for entry in REGISTRY.iter() {
            let handle = mapping.handle_of(entry.key).unwrap();
            let payload: &[u8] = match entry.kind {
                EntryKind::U16 { .. } => &[0x2C, 0x01],
                EntryKind::Str { .. } => b"vogon",
            };

            assert_eq!(mapping.write(&store, handle, payload, false), AttStatus::Ok);
            let response = mapping.read(&store, handle, 0);
            assert_eq!(response.status, AttStatus::Ok);
            assert_eq!(response.value.as_slice(), payload, "{}", entry.key);
        }
    }

    #[test]
    fn wrong_length_u16_write_leaves_value_unchanged() {
        let mapping = mapping();
        let store = ram_store();
        let handle = mapping.handle_of(KEY_MEASUREMENT_INTERVAL).unwrap();

        assert_eq!(mapping.write(&store, handle, &[0x05, 0x00], false), AttStatus::Ok);
        assert_eq!(
            mapping.write(&store, handle, &[0x01, 0x02, 0x03], false),
            AttStatus::WriteNotPermitted
        );
        assert_eq!(mapping.read(&store, handle, 0).value.as_slice(), &[0x05, 0x00]);
    }

    #[test]
    fn offset_reads_return_the_tail() {
        let mapping = mapping();
        let store = ram_store();
        let handle = mapping.handle_of(KEY_WIFI_SSID).unwrap();
        mapping.write(&store, handle, b"hello-world", false);

        assert_eq!(mapping.read(&store, handle, 5).value.as_slice(), b"-world");
        assert_eq!(mapping.read(&store, handle, 11).value.len(), 0);
        let past_end = mapping.read(&store, handle, 20);
        assert_eq!(past_end.status, AttStatus::Ok);
        assert!(past_end.value.is_empty());
    }

    #[test]
    fn long_string_reassembles_from_blob_reads() {
        let mapping = mapping();
        let store = ram_store();
        let handle = mapping.handle_of(KEY_MQTT_BROKER_URL).unwrap();
        let url: StdVec<u8> = core::iter::repeat(b'a').take(255).collect();
        assert_eq!(mapping.write(&store, handle, &url, false), AttStatus::Ok);

        let mut assembled = StdVec::new();
        loop {
            let chunk = mapping.read(&store, handle, assembled.len());
            if chunk.value.is_empty() {
                break;
            }
            assembled.extend_from_slice(&chunk.value[..chunk.value.len().min(22)]);
        }
        assert_eq!(assembled, url);
    }

    #[test]
    fn unwritten_entries_read_their_default() {
        let mapping = mapping();
        let store = ram_store();
        let entry = &REGISTRY[0];
        let EntryKind::U16 { default } = entry.kind else {
            panic!("first entry is numeric");
        };

        let response = mapping.read(&store, mapping.handle_of(entry.key).unwrap(), 0);
        assert_eq!(response.value.as_slice(), &default.to_le_bytes());
    }

    #[test]
    fn rejects_prepared_oversize_and_malformed_strings() {
        let mapping = mapping();
        let store = ram_store();
        let handle = mapping.handle_of(KEY_WIFI_SSID).unwrap();

        assert_eq!(mapping.write(&store, handle, b"net", true), AttStatus::WriteNotPermitted);
        assert_eq!(mapping.write(&store, handle, &[b'x'; 32], false), AttStatus::WriteNotPermitted);
        assert_eq!(mapping.write(&store, handle, &[b'x'; 31], false), AttStatus::Ok);
        assert_eq!(mapping.write(&store, handle, b"a\0b", false), AttStatus::WriteNotPermitted);
        assert_eq!(mapping.write(&store, handle, &[0xFF, 0xFE], false), AttStatus::WriteNotPermitted);
        assert_eq!(mapping.read(&store, handle, 0).value.as_slice(), &[b'x'; 31]);
    }

    #[test]
    fn storage_failures_become_internal_errors() {
        let mapping = mapping();
        let store = ram_store();
        let handle = mapping.handle_of(KEY_MEASUREMENT_INTERVAL).unwrap();
        let flash = store.release();
        let fail_reads = flash.fail_reads.clone();
        let store = crate::storage::FlashConfigStore::new(flash, 0, crate::storage::tests::TEST_PARTITION_SIZE).unwrap();

        fail_reads.set(true);
        let response = mapping.read(&store, handle, 0);
        assert_eq!(response.status, AttStatus::InternalError);
        assert!(response.value.is_empty());
        assert_eq!(mapping.write(&store, handle, &[1, 0], false), AttStatus::InternalError);
    }

    #[test]
    fn unknown_handles_are_refused() {
        let mapping = mapping();
        let store = ram_store();
        assert_eq!(mapping.read(&store, 7, 0).status, AttStatus::InvalidHandle);
        assert_eq!(mapping.write(&store, 7, &[1, 0], false), AttStatus::WriteNotPermitted);
    }
}
