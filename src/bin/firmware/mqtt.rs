use embassy_net::{dns::DnsQueryType, tcp::TcpSocket, Stack};
use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, channel::Sender};
use embassy_time::Duration;
use rust_mqtt::{
    client::{
        client::MqttClient,
        client_config::{ClientConfig, MqttVersion},
    },
    packet::v5::{publish_packet::QualityOfService, reason_codes::ReasonCode},
    utils::rng_generator::CountingRng,
};
use static_cell::StaticCell;

use vogonair::constants::*;
use vogonair::mqtt::{BrokerUrl, MqttDriver, MqttEvent, MqttEvents};

const MQTT_MAX_PROPERTIES: usize = 5;

static RX_BUF: StaticCell<[u8; RX_BUFFER_SIZE]> = StaticCell::new();
static TX_BUF: StaticCell<[u8; TX_BUFFER_SIZE]> = StaticCell::new();
static MQTT_RX_BUF: StaticCell<[u8; MQTT_RX_BUFFER_SIZE]> = StaticCell::new();
static MQTT_TX_BUF: StaticCell<[u8; MQTT_TX_BUFFER_SIZE]> = StaticCell::new();

#[derive(Debug)]
pub enum Error {
    DnsLookupFailed,
    SocketConnectionError,
    Broker(ReasonCode),
    NotConnected,
}

struct Buffers {
    rx: &'static mut [u8; RX_BUFFER_SIZE],
    tx: &'static mut [u8; TX_BUFFER_SIZE],
    mqtt_rx: &'static mut [u8; MQTT_RX_BUFFER_SIZE],
    mqtt_tx: &'static mut [u8; MQTT_TX_BUFFER_SIZE],
}

type Client = MqttClient<'static, TcpSocket<'static>, MQTT_MAX_PROPERTIES, CountingRng>;

/// rust-mqtt session over plain TCP. One session per boot: the buffers are
/// handed to the first client and never come back.
pub struct RustMqtt {
    stack: Stack<'static>,
    client_id: &'static str,
    buffers: Option<Buffers>,
    client: Option<Client>,
    events: Sender<'static, CriticalSectionRawMutex, MqttEvent, EVENT_QUEUE_DEPTH>,
}

impl RustMqtt {
    pub fn new(stack: Stack<'static>, client_id: &'static str, events: &'static MqttEvents) -> Self {
        Self {
            stack,
            client_id,
            buffers: Some(Buffers {
                rx: RX_BUF.init([0; RX_BUFFER_SIZE]),
                tx: TX_BUF.init([0; TX_BUFFER_SIZE]),
                mqtt_rx: MQTT_RX_BUF.init([0; MQTT_RX_BUFFER_SIZE]),
                mqtt_tx: MQTT_TX_BUF.init([0; MQTT_TX_BUFFER_SIZE]),
            }),
            client: None,
            events: events.sender(),
        }
    }

    async fn open(&mut self, broker: &BrokerUrl<'_>) -> Result<Client, Error> {
        let buffers = self.buffers.take().ok_or(Error::NotConnected)?;

        let addr = self
            .stack
            .dns_query(broker.host, DnsQueryType::A)
            .await
            .map_err(|_| Error::DnsLookupFailed)?
            .first()
            .copied()
            .ok_or(Error::DnsLookupFailed)?;

        let mut socket = TcpSocket::new(self.stack, buffers.rx, buffers.tx);
        socket.set_timeout(Some(Duration::from_millis(MQTT_MESSAGE_TIMEOUT_MS)));
        socket
            .connect((addr, broker.port))
            .await
            .map_err(|_| Error::SocketConnectionError)?;
        log::info!("TCP connected to {}:{}", broker.host, broker.port);

        let mut config = ClientConfig::new(MqttVersion::MQTTv5, CountingRng(20000));
        config.add_max_subscribe_qos(QualityOfService::QoS1);
        config.add_client_id(self.client_id);
        config.max_packet_size = MQTT_TX_BUFFER_SIZE as u32;

        let mut client = MqttClient::<_, MQTT_MAX_PROPERTIES, _>::new(
            socket,
            buffers.mqtt_tx,
            MQTT_TX_BUFFER_SIZE,
            buffers.mqtt_rx,
            MQTT_RX_BUFFER_SIZE,
            config,
        );

        client.connect_to_broker().await.map_err(Error::Broker)?;
        Ok(client)
    }
}

impl MqttDriver for RustMqtt {
    type Error = Error;

    // The client id is fixed when the driver is built
    async fn start(&mut self, broker: &BrokerUrl<'_>, _client_id: &str) -> Result<(), Error> {
        match self.open(broker).await {
            Ok(client) => {
                self.client = Some(client);
                self.events.send(MqttEvent::Connected).await;
                Ok(())
            }
            Err(e) => {
                log::error!("MQTT connect_to_broker failed: {:?}", e);
                self.events.send(MqttEvent::Disconnected).await;
                Err(e)
            }
        }
    }

    /// Returns once the broker sent PUBACK.
    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), Error> {
        let client = self.client.as_mut().ok_or(Error::NotConnected)?;
        client
            .send_message(topic, payload, QualityOfService::QoS1, false)
            .await
            .map_err(Error::Broker)?;

        self.events.send(MqttEvent::Published).await;
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(mut client) = self.client.take() {
            if let Err(e) = client.disconnect().await {
                log::warn!("MQTT disconnect failed: {:?}", e);
            }
        }
    }
}
