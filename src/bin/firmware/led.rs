use embassy_futures::select::{select, Either};
use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, signal::Signal};
use embassy_time::{Duration, Timer};
use esp_hal::{
    gpio::{Level, Output, OutputConfig},
    peripherals::GPIO2,
};

use vogonair::ble::{StatusIndicator, BLINK_SLOW_PERIOD_MS};

static INDICATOR: Signal<CriticalSectionRawMutex, StatusIndicator> = Signal::new();

pub struct StatusLed {
    output: Output<'static>,
}

impl StatusLed {
    pub fn new(pin: GPIO2<'static>) -> Self {
        Self {
            output: Output::new(pin, Level::Low, OutputConfig::default()),
        }
    }
}

pub fn show(indicator: StatusIndicator) {
    INDICATOR.signal(indicator);
}

#[embassy_executor::task]
pub async fn run(mut led: StatusLed) {
    let mut current = StatusIndicator::Off;

    loop {
        match current {
            StatusIndicator::Off => led.output.set_low(),
            StatusIndicator::On => led.output.set_high(),
            StatusIndicator::BlinkSlow => {
                led.output.toggle();
                let tick = Timer::after(Duration::from_millis(BLINK_SLOW_PERIOD_MS));
                if let Either::Second(next) = select(tick, INDICATOR.wait()).await {
                    current = next;
                }
                continue;
            }
        }
        current = INDICATOR.wait().await;
    }
}
