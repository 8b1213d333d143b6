//! BLE configuration service.
//!
//! [`BleConfigService`] is fed the events of the host stack one at a time by
//! a single task and answers with the commands the stack has to execute next.
//! ATT reads and writes are answered from the [`ConfigStore`] through the
//! handle mapping built when the attribute table is created.

use heapless::Vec;
use log::{info, warn};

use crate::constants::{ATT_MTU, DEVICE_NAME};
use crate::gatt::{AttStatus, GattCharacteristicMapping, GattResponse, ATTRIBUTE_COUNT, SERVICE_UUID};
use crate::storage::ConfigStore;

/// LE Limited Discoverable | BR/EDR Not Supported
pub const ADVERTISING_FLAGS: u8 = 0x01 | 0x04;
/// Half period of the status LED while advertising
pub const BLINK_SLOW_PERIOD_MS: u64 = 1000;

const AD_TYPE_FLAGS: u8 = 0x01;
const AD_TYPE_COMPLETE_128_UUIDS: u8 = 0x07;
const AD_TYPE_COMPLETE_NAME: u8 = 0x09;
const AD_TYPE_TX_POWER: u8 = 0x0A;
const MAX_AD_LEN: usize = 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BleError {
    /// The stack created a table with an unexpected number of handles
    AttributeTableMismatch { expected: usize, actual: usize },
    /// Advertising payload does not fit in one PDU
    AdvertisingTooLong,
    /// The host stack reported a failure
    Stack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BleState {
    Idle,
    Registering,
    BuildingAttributeTable,
    ServiceStarted,
    Advertising,
    Connected,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BleEvent<'a> {
    Registered,
    AttributeTableCreated(&'a [u16]),
    ServiceStarted,
    ServiceStopped,
    Connected { peer: [u8; 6] },
    Disconnected,
    MtuChanged(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BleCommand {
    SetLocalMtu(u16),
    SetDeviceName(&'static str),
    ConfigureAdvertising(AdvertisingPlan),
    CreateAttributeTable { count: usize },
    StartService { handle: u16 },
    StartAdvertising,
    StopAdvertising,
}

pub type Commands = Vec<BleCommand, 4>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusIndicator {
    Off,
    BlinkSlow,
    On,
}

/// Advertising data carries only the flags; name, TX power and the service
/// UUID go into the scan response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvertisingPlan {
    pub flags: u8,
    pub name: &'static str,
    pub service_uuid: [u8; 16],
}

impl Default for AdvertisingPlan {
    fn default() -> Self {
        Self {
            flags: ADVERTISING_FLAGS,
            name: DEVICE_NAME,
            service_uuid: SERVICE_UUID,
        }
    }
}

impl AdvertisingPlan {
    pub fn advertising_data(&self) -> Vec<u8, MAX_AD_LEN> {
        let mut out = Vec::new();
        // 3 bytes always fit
        let _ = out.extend_from_slice(&[2, AD_TYPE_FLAGS, self.flags]);
        out
    }

    pub fn scan_response(&self, tx_power: i8) -> Result<Vec<u8, MAX_AD_LEN>, BleError> {
        let mut out: Vec<u8, MAX_AD_LEN> = Vec::new();
        let name = self.name.as_bytes();

        let mut put = |bytes: &[u8]| out.extend_from_slice(bytes).map_err(|_| BleError::AdvertisingTooLong);
        put(&[name.len() as u8 + 1, AD_TYPE_COMPLETE_NAME])?;
        put(name)?;
        put(&[2, AD_TYPE_TX_POWER, tx_power as u8])?;
        put(&[17, AD_TYPE_COMPLETE_128_UUIDS])?;
        put(&self.service_uuid)?;

        Ok(out)
    }
}

fn commands<const N: usize>(items: [BleCommand; N]) -> Commands {
    items.into_iter().collect()
}

pub struct BleConfigService<S> {
    store: S,
    state: BleState,
    mapping: Option<GattCharacteristicMapping>,
}

impl<S: ConfigStore> BleConfigService<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            state: BleState::Idle,
            mapping: None,
        }
    }

    pub fn state(&self) -> BleState {
        self.state
    }

    pub fn mapping(&self) -> Option<&GattCharacteristicMapping> {
        self.mapping.as_ref()
    }

    pub fn indicator(&self) -> StatusIndicator {
        match self.state {
            BleState::ServiceStarted | BleState::Advertising => StatusIndicator::BlinkSlow,
            BleState::Connected => StatusIndicator::On,
            _ => StatusIndicator::Off,
        }
    }

    /// Registers the application with the stack.
    pub fn start(&mut self) -> Commands {
        if self.state != BleState::Idle {
            warn!("BLE service already started ({:?})", self.state);
            return Commands::new();
        }

        info!("Registering BLE configuration service");
        self.state = BleState::Registering;
        commands([BleCommand::SetLocalMtu(ATT_MTU)])
    }

    pub fn handle(&mut self, event: BleEvent<'_>) -> Result<Commands, BleError> {
        let next = match (self.state, event) {
            (BleState::Failed, _) => return Ok(Commands::new()),

            (BleState::Registering, BleEvent::Registered) => {
                info!("BLE app registered, building attribute table");
                self.state = BleState::BuildingAttributeTable;
                commands([
                    BleCommand::SetDeviceName(DEVICE_NAME),
                    BleCommand::ConfigureAdvertising(AdvertisingPlan::default()),
                    BleCommand::CreateAttributeTable {
                        count: ATTRIBUTE_COUNT,
                    },
                ])
            }

            (BleState::BuildingAttributeTable, BleEvent::AttributeTableCreated(handles)) => {
                let mapping = GattCharacteristicMapping::from_handles(handles).inspect_err(|_| {
                    self.state = BleState::Failed;
                })?;
                let service = mapping.service_handle();
                self.mapping = Some(mapping);
                commands([BleCommand::StartService { handle: service }])
            }

            (BleState::BuildingAttributeTable | BleState::Stopped, BleEvent::ServiceStarted) => {
                info!("Configuration service started, advertising");
                self.state = BleState::Advertising;
                commands([BleCommand::StartAdvertising])
            }

            (BleState::Advertising, BleEvent::Connected { peer }) => {
                info!("Client {:02x?} connected", peer);
                self.state = BleState::Connected;
                commands([BleCommand::StopAdvertising])
            }

            (BleState::Connected, BleEvent::Disconnected) => {
                info!("Client disconnected, restarting advertising");
                self.state = BleState::Advertising;
                commands([BleCommand::StartAdvertising])
            }

            (_, BleEvent::ServiceStopped) => {
                info!("Configuration service stopped");
                self.state = BleState::Stopped;
                Commands::new()
            }

            (_, BleEvent::MtuChanged(mtu)) => {
                info!("MTU set to {}", mtu);
                Commands::new()
            }

            (state, event) => {
                warn!("Ignoring BLE event {:?} in state {:?}", event, state);
                Commands::new()
            }
        };

        Ok(next)
    }

    pub fn on_read(&self, handle: u16, offset: usize) -> GattResponse {
        match &self.mapping {
            Some(mapping) => mapping.read(&self.store, handle, offset),
            None => GattResponse {
                status: AttStatus::InvalidHandle,
                value: Vec::new(),
            },
        }
    }

    pub fn on_write(&self, handle: u16, data: &[u8], prepared: bool) -> AttStatus {
        match &self.mapping {
            Some(mapping) => mapping.write(&self.store, handle, data, prepared),
            None => AttStatus::InvalidHandle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KEY_WIFI_SSID;
    use crate::storage::tests::{ram_store, RamFlash};
    use crate::storage::FlashConfigStore;

    extern crate std;
    use std::vec::Vec as StdVec;

    fn handles() -> StdVec<u16> {
        (1..=ATTRIBUTE_COUNT as u16).collect()
    }

    fn advertising() -> BleConfigService<FlashConfigStore<RamFlash>> {
        let mut service = BleConfigService::new(ram_store());
        service.start();
        service.handle(BleEvent::Registered).unwrap();
        service.handle(BleEvent::AttributeTableCreated(&handles())).unwrap();
        service.handle(BleEvent::ServiceStarted).unwrap();
        service
    }

    #[test]
    fn startup_sequence_reaches_advertising() {
        let mut service = BleConfigService::new(ram_store());
        assert_eq!(service.indicator(), StatusIndicator::Off);
        assert_eq!(service.start().as_slice(), &[BleCommand::SetLocalMtu(512)]);

        let cmds = service.handle(BleEvent::Registered).unwrap();
        assert_eq!(
            cmds.last(),
            Some(&BleCommand::CreateAttributeTable {
                count: ATTRIBUTE_COUNT
            })
        );

        let cmds = service.handle(BleEvent::AttributeTableCreated(&handles())).unwrap();
        assert_eq!(cmds.as_slice(), &[BleCommand::StartService { handle: 1 }]);

        let cmds = service.handle(BleEvent::ServiceStarted).unwrap();
        assert_eq!(cmds.as_slice(), &[BleCommand::StartAdvertising]);
        assert_eq!(service.state(), BleState::Advertising);
        assert_eq!(service.indicator(), StatusIndicator::BlinkSlow);
    }

    #[test]
    fn handle_count_mismatch_never_starts_the_service() {
        let mut service = BleConfigService::new(ram_store());
        service.start();
        service.handle(BleEvent::Registered).unwrap();

        let short = &handles()[..ATTRIBUTE_COUNT - 2];
        assert!(matches!(
            service.handle(BleEvent::AttributeTableCreated(short)),
            Err(BleError::AttributeTableMismatch { .. })
        ));
        assert_eq!(service.state(), BleState::Failed);
        assert!(service.handle(BleEvent::ServiceStarted).unwrap().is_empty());
        assert_eq!(service.state(), BleState::Failed);
    }

    #[test]
    fn connection_toggles_advertising() {
        let mut service = advertising();

        let cmds = service.handle(BleEvent::Connected { peer: [1; 6] }).unwrap();
        assert_eq!(cmds.as_slice(), &[BleCommand::StopAdvertising]);
        assert_eq!(service.indicator(), StatusIndicator::On);

        // single client only
        assert!(service.handle(BleEvent::Connected { peer: [2; 6] }).unwrap().is_empty());

        let cmds = service.handle(BleEvent::Disconnected).unwrap();
        assert_eq!(cmds.as_slice(), &[BleCommand::StartAdvertising]);
        assert_eq!(service.state(), BleState::Advertising);

        service.handle(BleEvent::ServiceStopped).unwrap();
        assert_eq!(service.indicator(), StatusIndicator::Off);
    }

    #[test]
    fn requests_are_served_through_the_mapping() {
        let service = advertising();
        let handle = service.mapping().unwrap().handle_of(KEY_WIFI_SSID).unwrap();

        assert_eq!(service.on_write(handle, b"vogon-net", false), AttStatus::Ok);
        assert_eq!(service.on_read(handle, 6).value.as_slice(), b"net");
    }

    #[test]
    fn requests_before_table_creation_are_refused() {
        let service = BleConfigService::new(ram_store());
        assert_eq!(service.on_read(3, 0).status, AttStatus::InvalidHandle);
        assert_eq!(service.on_write(3, &[1, 0], false), AttStatus::InvalidHandle);
    }

    #[test]
    fn scan_response_carries_name_power_and_uuid() {
        let plan = AdvertisingPlan::default();
        assert_eq!(plan.advertising_data().as_slice(), &[2, 0x01, 0x05]);

        let scan = plan.scan_response(9).unwrap();
        assert_eq!(&scan[..7], &[6, 0x09, b'V', b'o', b'g', b'o', b'n']);
        assert_eq!(&scan[7..10], &[2, 0x0A, 9]);
        assert_eq!(&scan[10..12], &[17, 0x07]);
        assert_eq!(&scan[12..], &SERVICE_UUID);
    }
}
