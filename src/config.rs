//! The configurable surface of the node.
//!
//! [`REGISTRY`] lists every persisted entry once; the GATT service and
//! [`DeviceConfig::load`] both read from it.

use embassy_time::Duration;
use heapless::String;
use log::{info, warn};

use crate::constants::MICROS_PER_MINUTE;
use crate::storage::{ConfigStore, StorageError};

/// Factory defaults generated from `cfg.toml` at build time.
pub struct BuildDefaults {
    pub measurement_interval_minutes: u16,
    pub environmental_bulk_size: u16,
    pub environmental_bulk_sleep_seconds: u16,
    pub particulate_warm_up_seconds: u16,
    pub particulate_bulk_size: u16,
    pub particulate_bulk_sleep_seconds: u16,
    pub wifi_auth: u16,
    pub mqtt_broker_url: &'static str,
}

// defaults are generated at compile time
include!(concat!(env!("OUT_DIR"), "/defaults.rs"));

pub const KEY_MEASUREMENT_INTERVAL: &str = "read_interval";
pub const KEY_ENVIRONMENTAL_BULK_SIZE: &str = "dht_bulk_size";
pub const KEY_ENVIRONMENTAL_BULK_SLEEP: &str = "dht_bulk_sleep";
pub const KEY_PARTICULATE_WARM_UP: &str = "sds_warm_up";
pub const KEY_PARTICULATE_BULK_SIZE: &str = "sds_bulk_size";
pub const KEY_PARTICULATE_BULK_SLEEP: &str = "sds_bulk_sleep";
pub const KEY_WIFI_SSID: &str = "wifi_ssid";
pub const KEY_WIFI_PASSWORD: &str = "wifi_password";
pub const KEY_MQTT_BROKER_URL: &str = "mqtt_broker_url";
pub const KEY_WIFI_USERNAME: &str = "wifi_username";
pub const KEY_WIFI_AUTH: &str = "wifi_auth";

/// Number of entries in [`REGISTRY`]
pub const ENTRY_COUNT: usize = 11;

pub const WIFI_SSID_MAX_LEN: usize = 31;
pub const WIFI_USERNAME_MAX_LEN: usize = 63;
pub const WIFI_PASSWORD_MAX_LEN: usize = 63;
pub const MQTT_BROKER_URL_MAX_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    U16 { default: u16 },
    /// `max_len` is in bytes and does not count a terminator
    Str { max_len: usize, default: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigEntry {
    pub key: &'static str,
    /// 16-bit UUID of the matching GATT characteristic
    pub uuid: u16,
    pub kind: EntryKind,
}

const fn u16_entry(key: &'static str, uuid: u16, default: u16) -> ConfigEntry {
    ConfigEntry {
        key,
        uuid,
        kind: EntryKind::U16 { default },
    }
}

const fn str_entry(key: &'static str, uuid: u16, max_len: usize, default: &'static str) -> ConfigEntry {
    ConfigEntry {
        key,
        uuid,
        kind: EntryKind::Str { max_len, default },
    }
}

/// Every persisted setting, in characteristic declaration order.
pub static REGISTRY: [ConfigEntry; ENTRY_COUNT] = [
    u16_entry(KEY_MEASUREMENT_INTERVAL, 0x0101, DEFAULTS.measurement_interval_minutes),
    u16_entry(KEY_ENVIRONMENTAL_BULK_SIZE, 0x0201, DEFAULTS.environmental_bulk_size),
    u16_entry(KEY_ENVIRONMENTAL_BULK_SLEEP, 0x0202, DEFAULTS.environmental_bulk_sleep_seconds),
    u16_entry(KEY_PARTICULATE_WARM_UP, 0x0203, DEFAULTS.particulate_warm_up_seconds),
    u16_entry(KEY_PARTICULATE_BULK_SIZE, 0x0204, DEFAULTS.particulate_bulk_size),
    u16_entry(KEY_PARTICULATE_BULK_SLEEP, 0x0205, DEFAULTS.particulate_bulk_sleep_seconds),
    str_entry(KEY_WIFI_SSID, 0x0701, WIFI_SSID_MAX_LEN, ""),
    str_entry(KEY_WIFI_PASSWORD, 0x0702, WIFI_PASSWORD_MAX_LEN, ""),
    str_entry(KEY_MQTT_BROKER_URL, 0x0703, MQTT_BROKER_URL_MAX_LEN, DEFAULTS.mqtt_broker_url),
    str_entry(KEY_WIFI_USERNAME, 0x0704, WIFI_USERNAME_MAX_LEN, ""),
    u16_entry(KEY_WIFI_AUTH, 0x0705, DEFAULTS.wifi_auth),
];

pub fn entry(key: &str) -> Option<&'static ConfigEntry> {
    REGISTRY.iter().find(|e| e.key == key)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiAuth {
    Open,
    Wpa2Personal,
    Wpa2Enterprise,
}

impl WifiAuth {
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(Self::Open),
            1 => Some(Self::Wpa2Personal),
            2 => Some(Self::Wpa2Enterprise),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    Storage(StorageError),
    /// A required field is missing or out of range
    Invalid(&'static str),
}

impl From<StorageError> for ConfigError {
    fn from(e: StorageError) -> Self {
        ConfigError::Storage(e)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiCredentials {
    pub ssid: String<WIFI_SSID_MAX_LEN>,
    pub username: String<WIFI_USERNAME_MAX_LEN>,
    pub password: String<WIFI_PASSWORD_MAX_LEN>,
    pub auth: WifiAuth,
}

/// Sample count and pause between samples of one sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkSettings {
    pub count: u16,
    pub interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParticulateSettings {
    pub warm_up: Duration,
    pub bulk: BulkSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub measurement_interval_minutes: u16,
    pub environmental_bulk_size: u16,
    pub environmental_bulk_sleep_seconds: u16,
    pub particulate_warm_up_seconds: u16,
    pub particulate_bulk_size: u16,
    pub particulate_bulk_sleep_seconds: u16,
    pub wifi: WifiCredentials,
    pub mqtt_broker_url: String<MQTT_BROKER_URL_MAX_LEN>,
}

fn load_u16(store: &impl ConfigStore, key: &'static str) -> Result<u16, ConfigError> {
    let default = match entry(key).map(|e| e.kind) {
        Some(EntryKind::U16 { default }) => default,
        _ => return Err(ConfigError::Invalid(key)),
    };
    Ok(store.get_u16(key, default)?)
}

fn load_str<const N: usize>(store: &impl ConfigStore, key: &'static str) -> Result<String<N>, ConfigError> {
    let default = match entry(key).map(|e| e.kind) {
        Some(EntryKind::Str { default, .. }) => default,
        _ => return Err(ConfigError::Invalid(key)),
    };
    let value = store.get_str(key, default)?;
    let mut out = String::new();
    out.push_str(&value).map_err(|_| ConfigError::Invalid(key))?;
    Ok(out)
}

impl DeviceConfig {
    /// Materializes and validates the stored configuration.
    ///
    /// Any error means the node is not configured and must be provisioned.
    pub fn load(store: &impl ConfigStore) -> Result<Self, ConfigError> {
        let auth_code = load_u16(store, KEY_WIFI_AUTH)?;
        let auth = WifiAuth::from_code(auth_code).ok_or(ConfigError::Invalid(KEY_WIFI_AUTH))?;

        let config = Self {
            measurement_interval_minutes: load_u16(store, KEY_MEASUREMENT_INTERVAL)?,
            environmental_bulk_size: load_u16(store, KEY_ENVIRONMENTAL_BULK_SIZE)?,
            environmental_bulk_sleep_seconds: load_u16(store, KEY_ENVIRONMENTAL_BULK_SLEEP)?,
            particulate_warm_up_seconds: load_u16(store, KEY_PARTICULATE_WARM_UP)?,
            particulate_bulk_size: load_u16(store, KEY_PARTICULATE_BULK_SIZE)?,
            particulate_bulk_sleep_seconds: load_u16(store, KEY_PARTICULATE_BULK_SLEEP)?,
            wifi: WifiCredentials {
                ssid: load_str(store, KEY_WIFI_SSID)?,
                username: load_str(store, KEY_WIFI_USERNAME)?,
                password: load_str(store, KEY_WIFI_PASSWORD)?,
                auth,
            },
            mqtt_broker_url: load_str(store, KEY_MQTT_BROKER_URL)?,
        };

        config.validate()?;
        info!(
            "Loaded config: every {} min, SSID {:?}, broker {:?}",
            config.measurement_interval_minutes, config.wifi.ssid, config.mqtt_broker_url
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.measurement_interval_minutes > 0, KEY_MEASUREMENT_INTERVAL),
            (self.environmental_bulk_size > 0, KEY_ENVIRONMENTAL_BULK_SIZE),
            (self.environmental_bulk_sleep_seconds > 0, KEY_ENVIRONMENTAL_BULK_SLEEP),
            (self.particulate_bulk_size > 0, KEY_PARTICULATE_BULK_SIZE),
            (self.particulate_bulk_sleep_seconds > 0, KEY_PARTICULATE_BULK_SLEEP),
            (!self.mqtt_broker_url.is_empty(), KEY_MQTT_BROKER_URL),
            (!self.wifi.ssid.is_empty(), KEY_WIFI_SSID),
            (
                self.wifi.auth == WifiAuth::Open || !self.wifi.password.is_empty(),
                KEY_WIFI_PASSWORD,
            ),
            (
                self.wifi.auth != WifiAuth::Wpa2Enterprise || !self.wifi.username.is_empty(),
                KEY_WIFI_USERNAME,
            ),
        ];

        for (ok, key) in checks {
            if !ok {
                warn!("Config field {} is missing or invalid", key);
                return Err(ConfigError::Invalid(key));
            }
        }
        Ok(())
    }

    pub fn environmental(&self) -> BulkSettings {
        BulkSettings {
            count: self.environmental_bulk_size,
            interval: Duration::from_secs(self.environmental_bulk_sleep_seconds.into()),
        }
    }

    pub fn particulate(&self) -> ParticulateSettings {
        ParticulateSettings {
            warm_up: Duration::from_secs(self.particulate_warm_up_seconds.into()),
            bulk: BulkSettings {
                count: self.particulate_bulk_size,
                interval: Duration::from_secs(self.particulate_bulk_sleep_seconds.into()),
            },
        }
    }

    /// Deep sleep length in microseconds.
    pub fn sleep_duration_us(&self) -> u64 {
        u64::from(self.measurement_interval_minutes) * MICROS_PER_MINUTE
    }
}
