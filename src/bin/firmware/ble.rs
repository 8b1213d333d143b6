//! trouble-host adapter for [`BleConfigService`].
//!
//! The GATT table is declared statically below in registry order; the
//! service state machine decides what the host does and answers every ATT
//! read and write from the configuration store.

use embassy_futures::select::{select, Either};
use esp_hal::peripherals::BT;
use esp_storage::FlashStorage;
use esp_wifi::{ble::controller::BleConnector, EspWifiController};
use heapless::Vec;
use log::{debug, error, info, warn};
use static_cell::StaticCell;
use trouble_host::prelude::*;

use vogonair::ble::{AdvertisingPlan, BleCommand, BleConfigService, BleError, BleEvent, Commands};
use vogonair::config::ENTRY_COUNT;
use vogonair::constants::DEVICE_NAME;
use vogonair::gatt::{AttStatus, ATTRIBUTE_COUNT};
use vogonair::mqtt::MacAddress;
use vogonair::storage::FlashConfigStore;

use crate::led;

/// Max number of connections
const CONNECTIONS_MAX: usize = 1;
/// Max number of L2CAP channels (signal + ATT)
const L2CAP_CHANNELS_MAX: usize = 2;
/// Max number of command slots for the controller
const COMMAND_SLOTS: usize = 20;
/// Advertised transmit power, ESP32 default
const TX_POWER_DBM: i8 = 9;

type Controller = ExternalController<BleConnector<'static>, COMMAND_SLOTS>;
type Store = FlashConfigStore<FlashStorage>;

static HOST_RESOURCES: StaticCell<HostResources<DefaultPacketPool, CONNECTIONS_MAX, L2CAP_CHANNELS_MAX>> =
    StaticCell::new();

#[gatt_server]
struct Server {
    config: ConfigService,
}

#[gatt_service(uuid = "d0a823a6-fa98-4597-b0c1-d8577be0e158")]
struct ConfigService {
    #[characteristic(uuid = "0101", read, write)]
    read_interval: u16,
    #[characteristic(uuid = "0201", read, write)]
    dht_bulk_size: u16,
    #[characteristic(uuid = "0202", read, write)]
    dht_bulk_sleep: u16,
    #[characteristic(uuid = "0203", read, write)]
    sds_warm_up: u16,
    #[characteristic(uuid = "0204", read, write)]
    sds_bulk_size: u16,
    #[characteristic(uuid = "0205", read, write)]
    sds_bulk_sleep: u16,
    #[characteristic(uuid = "0701", read, write)]
    wifi_ssid: Vec<u8, 31>,
    #[characteristic(uuid = "0702", read, write)]
    wifi_password: Vec<u8, 63>,
    #[characteristic(uuid = "0703", read, write)]
    mqtt_broker_url: Vec<u8, 255>,
    #[characteristic(uuid = "0704", read, write)]
    wifi_username: Vec<u8, 63>,
    #[characteristic(uuid = "0705", read, write)]
    wifi_auth: u16,
}

/// Service declaration, then declaration and value handle of each
/// characteristic. trouble-host allocates every declaration right before its
/// value, so the table always has the registry's length; the count check in
/// [`BleConfigService`] only fails if the two ever diverge.
fn attribute_handles(service: &ConfigService) -> [u16; ATTRIBUTE_COUNT] {
    let values: [u16; ENTRY_COUNT] = [
        service.read_interval.handle,
        service.dht_bulk_size.handle,
        service.dht_bulk_sleep.handle,
        service.sds_warm_up.handle,
        service.sds_bulk_size.handle,
        service.sds_bulk_sleep.handle,
        service.wifi_ssid.handle,
        service.wifi_password.handle,
        service.mqtt_broker_url.handle,
        service.wifi_username.handle,
        service.wifi_auth.handle,
    ];

    let mut handles = [service.handle; ATTRIBUTE_COUNT];
    for (i, value) in values.into_iter().enumerate() {
        handles[1 + 2 * i] = value - 1;
        handles[2 + 2 * i] = value;
    }
    handles
}

/// What the state machine asked the host to do next.
#[derive(Default)]
struct Pending {
    plan: Option<AdvertisingPlan>,
    create_table: bool,
    start_service: Option<u16>,
    advertise: bool,
}

impl Pending {
    fn apply(&mut self, commands: Commands) {
        for command in commands {
            match command {
                BleCommand::SetLocalMtu(mtu) => debug!("Local MTU {}", mtu),
                BleCommand::SetDeviceName(name) => info!("Device name {}", name),
                BleCommand::ConfigureAdvertising(plan) => self.plan = Some(plan),
                BleCommand::CreateAttributeTable { count } => {
                    debug!("Attribute table with {} handles", count);
                    self.create_table = true;
                }
                BleCommand::StartService { handle } => self.start_service = Some(handle),
                BleCommand::StartAdvertising => self.advertise = true,
                BleCommand::StopAdvertising => self.advertise = false,
            }
        }
    }
}

fn address(mac: MacAddress) -> Address {
    let mut addr = mac.0;
    addr.reverse();
    Address::random(addr)
}

fn att_error(status: AttStatus) -> AttErrorCode {
    match status {
        AttStatus::InvalidHandle => AttErrorCode::INVALID_HANDLE,
        AttStatus::WriteNotPermitted => AttErrorCode::WRITE_NOT_PERMITTED,
        _ => AttErrorCode::UNLIKELY_ERROR,
    }
}

/// Runs the configuration service until the stack fails.
pub async fn run(radio: &'static EspWifiController<'static>, bt: BT<'static>, store: Store, mac: MacAddress) {
    let connector = BleConnector::new(radio, bt);
    let controller: Controller = ExternalController::new(connector);

    let resources = HOST_RESOURCES.init(HostResources::new());
    let stack = trouble_host::new(controller, resources).set_random_address(address(mac));
    let Host {
        mut peripheral,
        mut runner,
        ..
    } = stack.build();

    let server = match Server::new_with_config(GapConfig::Peripheral(PeripheralConfig {
        name: DEVICE_NAME,
        appearance: &appearance::UNKNOWN,
    })) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to build GATT server: {}", e);
            return;
        }
    };

    let mut service = BleConfigService::new(store);

    let app = serve_forever(&mut service, &mut peripheral, &server);
    match select(runner.run(), app).await {
        Either::First(Err(e)) => error!("BLE host stopped: {:?}", e),
        Either::First(Ok(())) => warn!("BLE host stopped"),
        Either::Second(Err(e)) => error!("BLE configuration service failed: {:?}", e),
        Either::Second(Ok(())) => {}
    }

    if let Err(e) = service.handle(BleEvent::ServiceStopped) {
        warn!("Failed to stop configuration service: {:?}", e);
    }
    led::show(service.indicator());
}

async fn serve_forever(
    service: &mut BleConfigService<Store>,
    peripheral: &mut Peripheral<'_, Controller, DefaultPacketPool>,
    server: &Server<'_>,
) -> Result<(), BleError> {
    let mut pending = Pending::default();
    pending.apply(service.start());
    pending.apply(service.handle(BleEvent::Registered)?);

    if pending.create_table {
        let handles = attribute_handles(&server.config);
        pending.apply(service.handle(BleEvent::AttributeTableCreated(&handles))?);
    }
    if let Some(handle) = pending.start_service.take() {
        info!("Service handle {}", handle);
        pending.apply(service.handle(BleEvent::ServiceStarted)?);
    }

    let plan = pending.plan.unwrap_or_default();
    let adv_data = plan.advertising_data();
    let scan_data = plan.scan_response(TX_POWER_DBM)?;

    while pending.advertise {
        led::show(service.indicator());

        let conn = advertise(peripheral, server, &adv_data, &scan_data).await?;
        let mut peer = [0u8; 6];
        peer.copy_from_slice(conn.raw().peer_address().raw());

        pending.apply(service.handle(BleEvent::Connected { peer })?);
        led::show(service.indicator());

        handle_requests(&conn, server, service).await;

        pending.apply(service.handle(BleEvent::Disconnected)?);
    }

    Ok(())
}

async fn advertise<'values, 'server>(
    peripheral: &mut Peripheral<'values, Controller, DefaultPacketPool>,
    server: &'server Server<'values>,
    adv_data: &[u8],
    scan_data: &[u8],
) -> Result<GattConnection<'values, 'server, DefaultPacketPool>, BleError> {
    let advertiser = peripheral
        .advertise(
            &Default::default(),
            Advertisement::ConnectableScannableUndirected { adv_data, scan_data },
        )
        .await
        .map_err(|e| {
            error!("Failed to advertise: {:?}", e);
            BleError::Stack
        })?;
    info!("Advertising as {}", DEVICE_NAME);

    let conn = advertiser
        .accept()
        .await
        .and_then(|conn| conn.with_attribute_server(server))
        .map_err(|e| {
            error!("Failed to accept connection: {:?}", e);
            BleError::Stack
        })?;
    Ok(conn)
}

fn is_queued_write<P: PacketPool>(event: &GattEvent<'_, '_, P>) -> bool {
    matches!(
        event.payload().incoming(),
        AttClient::Request(AttReq::PrepareWrite { .. } | AttReq::ExecuteWrite { .. })
    )
}

async fn handle_requests<P: PacketPool>(
    conn: &GattConnection<'_, '_, P>,
    server: &Server<'_>,
    service: &BleConfigService<Store>,
) {
    let reason = loop {
        match conn.next().await {
            GattConnectionEvent::Disconnected { reason } => break reason,
            GattConnectionEvent::Gatt { event } => {
                let status = match &event {
                    GattEvent::Read(read) => {
                        // The whole value is staged in the attribute table and
                        // trouble-host answers Read Blob offsets from it, so the
                        // request always starts at offset 0 here
                        let response = service.on_read(read.handle(), 0);
                        if response.status == AttStatus::Ok {
                            if let Err(e) = server.table().set_raw(read.handle(), &response.value) {
                                warn!("Failed to stage value of handle {}: {:?}", read.handle(), e);
                            }
                        }
                        response.status
                    }
                    GattEvent::Write(write) => {
                        debug!("Write to handle {}: {:02x?}", write.handle(), write.data());
                        service.on_write(write.handle(), write.data(), false)
                    }
                    _ if is_queued_write(&event) => service.on_write(0, &[], true),
                    _ => AttStatus::Ok,
                };

                let reply = match status {
                    AttStatus::Ok => event.accept(),
                    status => event.reject(att_error(status)),
                };
                match reply {
                    Ok(reply) => reply.send().await,
                    Err(e) => warn!("Failed to answer ATT request: {:?}", e),
                }
            }
            _ => {}
        }
    };
    info!("Client disconnected: {:?}", reason);
}
