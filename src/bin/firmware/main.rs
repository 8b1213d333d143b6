#![no_std]
#![no_main]

use embassy_executor::Spawner;
use embassy_time::{Duration, Timer};

use esp_alloc as _;
use esp_backtrace as _;
use esp_hal::{
    efuse::Efuse,
    gpio::{RtcPin, RtcPinWithResistors},
    peripherals::GPIO0,
    rng::Rng,
    rtc_cntl::{
        reset_reason,
        sleep::{
            Ext0WakeupSource, RtcSleepConfig, TimerWakeupSource, WakeSource, WakeTriggers,
            WakeupLevel,
        },
        wakeup_cause, Rtc, SleepSource,
    },
    system::Cpu,
    timer::timg::TimerGroup,
};
use esp_println::logger::init_logger;
use esp_storage::FlashStorage;
use esp_wifi::EspWifiController;
use log::{error, info};
use static_cell::StaticCell;

use vogonair::constants::*;
use vogonair::duty_cycle::{select_mode, DutyCycleController, Mode, WakeCause};
use vogonair::mqtt::{MacAddress, MqttEvents};
use vogonair::sensors::TelemetryExchange;
use vogonair::storage::FlashConfigStore;
use vogonair::sync::SyncOrchestrator;
use vogonair::wifi::WifiEvents;

mod ble;
mod led;
mod mqtt;
mod sensors;
mod wifi;

use led::StatusLed;
use mqtt::RustMqtt;
use sensors::Sensors;
use wifi::EspWifi;

esp_bootloader_esp_idf::esp_app_desc!();

static RADIO: StaticCell<EspWifiController<'static>> = StaticCell::new();
static EXCHANGE: TelemetryExchange = TelemetryExchange::new();
static WIFI_EVENTS: WifiEvents = WifiEvents::new();
static MQTT_EVENTS: MqttEvents = MqttEvents::new();
static CLIENT_ID: StaticCell<heapless::String<18>> = StaticCell::new();

/// Holds the trigger pad through deep sleep. Listed after the ext0 source so
/// the hold lands once the pad is configured.
struct PadHold(GPIO0<'static>);

impl WakeSource for PadHold {
    fn apply(&self, _rtc: &Rtc<'_>, _triggers: &mut WakeTriggers, _sleep_config: &mut RtcSleepConfig) {
        self.0.rtcio_pad_hold(true);
    }
}

fn wake_cause() -> WakeCause {
    match wakeup_cause() {
        SleepSource::Ext0 => WakeCause::ConfigTrigger,
        SleepSource::Timer => WakeCause::Timer,
        _ => WakeCause::Other,
    }
}

#[esp_hal_embassy::main]
async fn main(spawner: Spawner) {
    init_logger(log::LevelFilter::Info);

    let peripherals = esp_hal::init(esp_hal::Config::default());

    esp_alloc::heap_allocator!(size: HEAP_SIZE);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    let timg1 = TimerGroup::new(peripherals.TIMG1);

    esp_hal_embassy::init(timg0.timer0);

    info!("Vogon Air v{}", VERSION);
    info!("Reset reason: {:?}", reset_reason(Cpu::ProCpu));

    let mut rtc = Rtc::new(peripherals.LPWR);
    let wake = wake_cause();

    let store = match FlashConfigStore::new(
        FlashStorage::new(),
        CONFIG_PARTITION_OFFSET,
        CONFIG_PARTITION_SIZE,
    ) {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to open configuration partition: {:?}", e);
            halt().await
        }
    };

    let mac = MacAddress(Efuse::read_base_mac_address());
    info!("Device address {}", mac);

    let rng = Rng::new(peripherals.RNG);
    let radio = match esp_wifi::init(timg1.timer0, rng) {
        Ok(radio) => RADIO.init(radio),
        Err(e) => {
            error!("Failed to initialise radio: {:?}", e);
            halt().await
        }
    };

    let trigger = peripherals.GPIO0;

    let config = match select_mode(wake, &store) {
        Mode::Configuration(reason) => {
            trigger.rtcio_pad_hold(false);
            info!("Configuration mode: {:?}", reason);

            let led = StatusLed::new(peripherals.GPIO2);
            spawner.must_spawn(led::run(led));

            // Only a reset leaves configuration mode
            ble::run(radio, peripherals.BT, store, mac).await;
            halt().await
        }
        Mode::Measurement(config) => config,
    };

    let client_id = match mac.client_id() {
        Ok(id) => CLIENT_ID.init(id).as_str(),
        Err(_) => halt().await,
    };

    let wifi = match EspWifi::new(radio, peripherals.WIFI, rng, &WIFI_EVENTS, spawner) {
        Ok(wifi) => wifi,
        Err(e) => {
            error!("Failed to initialise WiFi: {:?}", e);
            halt().await
        }
    };
    let mqtt = RustMqtt::new(wifi.stack(), client_id, &MQTT_EVENTS);

    let sync = SyncOrchestrator::new(wifi, &WIFI_EVENTS, mqtt, &MQTT_EVENTS);
    let mut controller = DutyCycleController::new(sync, mac);

    let mut sensors = Sensors::new(
        spawner,
        peripherals.GPIO23,
        peripherals.UART2,
        peripherals.GPIO17,
        peripherals.GPIO16,
        peripherals.CPU_CTRL,
    );

    let plan = controller.run(&config, &EXCHANGE, &mut sensors).await;

    let timer = TimerWakeupSource::new(core::time::Duration::from_micros(plan.duration_us));

    // Active low, idle pulled down
    trigger.rtcio_pullup(false);
    trigger.rtcio_pulldown(true);
    let ext0 = Ext0WakeupSource::new(trigger, WakeupLevel::Low);
    // SAFETY: only the pad hold bit is written, after ext0 has applied its config
    let hold = PadHold(unsafe { GPIO0::steal() });

    info!("Entering deep sleep");
    rtc.sleep_deep(&[&timer, &ext0, &hold]);
}

/// Parks the main task after an unrecoverable boot error; the watchdog or a
/// manual reset restarts the device.
async fn halt() -> ! {
    loop {
        Timer::after(Duration::from_secs(3600)).await;
    }
}
