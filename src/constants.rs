/// Current firmware version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name used for the BLE GAP device name and the DHCP hostname
pub const DEVICE_NAME: &str = "Vogon";

/// Size of the heap in DRAM (internal memory)
pub const HEAP_SIZE: usize = 72 * 1024;

/// Size of the TCP socket receive buffer
pub const RX_BUFFER_SIZE: usize = 4096;
/// Size of the TCP socket transmit buffer
pub const TX_BUFFER_SIZE: usize = 4096;

/// Size of the MQTT client receive buffer for application data
pub const MQTT_RX_BUFFER_SIZE: usize = 1024;
/// Size of the MQTT client transmit buffer for application data
pub const MQTT_TX_BUFFER_SIZE: usize = 1024;

/// Maximum number of unacknowledged QoS 1 publishes
pub const MQTT_CONCURRENT_MESSAGES: usize = 4;
/// How long a publish waits for a free slot before going out anyway
pub const MQTT_MESSAGE_WAIT_TIME_MS: u64 = 15_000;
/// Network timeout handed to the MQTT client
pub const MQTT_MESSAGE_TIMEOUT_MS: u64 = 10_000;
/// Maximum time to wait for the broker CONNACK
pub const MQTT_CONNECTION_TIMEOUT_MS: u64 = 60_000;
/// Maximum time to wait for every in-flight publish to settle
pub const MQTT_DRAIN_TIMEOUT_MS: u64 = 30_000;
/// Default broker port when the URL does not carry one
pub const MQTT_DEFAULT_PORT: u16 = 1883;

/// Maximum time to wait for an IP address after starting the station
pub const WIFI_CONNECTION_TIMEOUT_MS: u64 = 10_000;

/// Depth of the WiFi and MQTT event queues
pub const EVENT_QUEUE_DEPTH: usize = 8;

/// Overall deadline for both sensor tasks, on top of the configured work
pub const MEASUREMENT_DEADLINE_MARGIN_SECS: u64 = 30;

/// Response timeout for a single SDS011 exchange
pub const SDS011_RESPONSE_TIMEOUT_MS: u64 = 250;
/// SDS011 UART baud rate (8N1)
pub const SDS011_BAUD_RATE: u32 = 9600;

/// Negotiated ATT MTU
pub const ATT_MTU: u16 = 512;
/// Largest attribute value carried in a single read response
pub const MAX_ATTRIBUTE_VALUE: usize = ATT_MTU as usize - 1;

/// GPIO pulled to start BLE configuration mode from deep sleep (BOOT button)
pub const CONFIG_TRIGGER_GPIO: u8 = 0;
/// GPIO driving the status LED
pub const STATUS_LED_GPIO: u8 = 2;
/// GPIO of the DHT22 data line
pub const DHT22_GPIO: u8 = 23;
/// UART TX towards the SDS011 RX pin
pub const SDS011_TX_GPIO: u8 = 17;
/// UART RX from the SDS011 TX pin
pub const SDS011_RX_GPIO: u8 = 16;

/// Flash offset of the configuration partition (see partitions.csv)
pub const CONFIG_PARTITION_OFFSET: u32 = 0x9000;
/// Size of the configuration partition, two 4 KiB sectors
pub const CONFIG_PARTITION_SIZE: u32 = 0x2000;

/// Microseconds in one minute, used for the deep sleep duration
pub const MICROS_PER_MINUTE: u64 = 60_000_000;
