use embassy_executor::Spawner;
use embassy_time::{Delay, Duration};

use esp_hal::{
    gpio::{DriveMode, Flex, OutputConfig, Pull},
    peripherals::{CPU_CTRL, GPIO16, GPIO17, GPIO23, UART2},
    system::{CpuControl, Stack},
    uart::{Config as UartConfig, DataBits, Parity, StopBits, Uart},
    Async,
};
use esp_hal_embassy::Executor;
use log::{error, info};
use static_cell::StaticCell;

use vogonair::config::{BulkSettings, DeviceConfig, ParticulateSettings};
use vogonair::constants::{SDS011_BAUD_RATE, SDS011_RESPONSE_TIMEOUT_MS};
use vogonair::duty_cycle::SensorTasks;
use vogonair::sensors::{dht22::Dht22, poller, sds011, EnvironmentalSlot, ParticulateSlot};

static APP_CORE_STACK: StaticCell<Stack<8192>> = StaticCell::new();
static APP_CORE_EXECUTOR: StaticCell<Executor> = StaticCell::new();

struct Peripherals {
    dht22: GPIO23<'static>,
    uart: UART2<'static>,
    tx: GPIO17<'static>,
    rx: GPIO16<'static>,
    cpu_control: CPU_CTRL<'static>,
}

/// DHT22 poller on the main executor, SDS011 driver on the app core.
pub struct Sensors {
    spawner: Spawner,
    peripherals: Option<Peripherals>,
}

impl Sensors {
    pub fn new(
        spawner: Spawner,
        dht22: GPIO23<'static>,
        uart: UART2<'static>,
        tx: GPIO17<'static>,
        rx: GPIO16<'static>,
        cpu_control: CPU_CTRL<'static>,
    ) -> Self {
        Self {
            spawner,
            peripherals: Some(Peripherals {
                dht22,
                uart,
                tx,
                rx,
                cpu_control,
            }),
        }
    }
}

impl SensorTasks<'static> for Sensors {
    fn launch(
        &mut self,
        config: &DeviceConfig,
        environmental: EnvironmentalSlot<'static>,
        particulate: ParticulateSlot<'static>,
    ) {
        let Some(p) = self.peripherals.take() else {
            error!("Sensor tasks already launched");
            return;
        };

        let mut pin = Flex::new(p.dht22);
        pin.apply_output_config(
            &OutputConfig::default()
                .with_drive_mode(DriveMode::OpenDrain)
                .with_pull(Pull::Up),
        );
        pin.set_input_enable(true);
        pin.set_output_enable(true);
        self.spawner
            .must_spawn(environmental_task(pin, config.environmental(), environmental));

        let uart_config = UartConfig::default()
            .with_baudrate(SDS011_BAUD_RATE)
            .with_data_bits(DataBits::_8)
            .with_parity(Parity::None)
            .with_stop_bits(StopBits::_1);
        let uart = match Uart::new(p.uart, uart_config) {
            Ok(uart) => uart.with_tx(p.tx).with_rx(p.rx).into_async(),
            Err(e) => {
                error!("Failed to configure SDS011 UART: {:?}", e);
                return;
            }
        };

        let settings = config.particulate();
        let mut cpu_control = CpuControl::new(p.cpu_control);
        let stack = APP_CORE_STACK.init(Stack::new());
        let started = cpu_control.start_app_core(stack, move || {
            let executor = APP_CORE_EXECUTOR.init(Executor::new());
            executor.run(|spawner| {
                spawner.must_spawn(particulate_task(uart, settings, particulate));
            });
        });

        match started {
            // The app core stays up until deep sleep
            Ok(guard) => core::mem::forget(guard),
            Err(e) => error!("Failed to start app core: {:?}", e),
        }
    }
}

#[embassy_executor::task]
async fn environmental_task(pin: Flex<'static>, settings: BulkSettings, slot: EnvironmentalSlot<'static>) {
    info!("DHT22: {} samples, {} s apart", settings.count, settings.interval.as_secs());
    let mut sensor = Dht22::new(pin, Delay);
    if let Err(e) = poller::run(&mut sensor, settings, slot).await {
        error!("DHT22 cycle aborted: {:?}", e);
    }
}

#[embassy_executor::task]
async fn particulate_task(
    uart: Uart<'static, Async>,
    settings: ParticulateSettings,
    slot: ParticulateSlot<'static>,
) {
    info!(
        "SDS011: warm-up {} s, {} samples",
        settings.warm_up.as_secs(),
        settings.bulk.count
    );
    let mut sensor = sds011::Sds011::new(uart, Duration::from_millis(SDS011_RESPONSE_TIMEOUT_MS));
    if let Err(e) = sds011::run(&mut sensor, settings, slot).await {
        error!("SDS011 cycle aborted: {:?}", e);
    }
}
