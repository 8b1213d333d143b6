use embassy_executor::Spawner;
use embassy_futures::select::{select, Either};
use embassy_net::{Runner, Stack, StackResources};
use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, channel::Sender};

use esp_hal::{peripherals::WIFI, rng::Rng};
use esp_wifi::{
    wifi::{
        AuthMethod, ClientConfiguration, Configuration, EapClientConfiguration, WifiController,
        WifiDevice, WifiEvent as RadioEvent,
    },
    EspWifiController,
};

use core::str::FromStr;
use heapless::String;
use log::{info, warn};
use static_cell::StaticCell;

use vogonair::config::{WifiAuth, WifiCredentials};
use vogonair::constants::{DEVICE_NAME, EVENT_QUEUE_DEPTH};
use vogonair::wifi::{WifiDriver, WifiEvent, WifiEvents};

static RESOURCES: StaticCell<StackResources<5>> = StaticCell::new();

#[derive(Debug)]
pub enum Error {
    Init,
    HostnameTooLong,
    Credentials,
    Radio(esp_wifi::wifi::WifiError),
}

/// esp-wifi station feeding the [`WifiEvents`] queue.
pub struct EspWifi {
    controller: WifiController<'static>,
    stack: Stack<'static>,
    events: Sender<'static, CriticalSectionRawMutex, WifiEvent, EVENT_QUEUE_DEPTH>,
}

impl EspWifi {
    pub fn new(
        radio: &'static EspWifiController<'static>,
        wifi: WIFI<'static>,
        mut rng: Rng,
        events: &'static WifiEvents,
        spawner: Spawner,
    ) -> Result<Self, Error> {
        let (controller, interfaces) = esp_wifi::wifi::new(radio, wifi).map_err(|_| Error::Init)?;

        let mut dhcp_config = embassy_net::DhcpConfig::default();
        dhcp_config.hostname =
            Some(String::<32>::from_str(DEVICE_NAME).map_err(|_| Error::HostnameTooLong)?);

        let seed = (rng.random() as u64) << 32 | rng.random() as u64;
        let config = embassy_net::Config::dhcpv4(dhcp_config);

        let resources = RESOURCES.init(StackResources::new());
        let (stack, runner) = embassy_net::new(interfaces.sta, config, resources, seed);

        spawner.must_spawn(net_task(runner));

        Ok(Self {
            controller,
            stack,
            events: events.sender(),
        })
    }

    pub fn stack(&self) -> Stack<'static> {
        self.stack
    }
}

fn configuration(credentials: &WifiCredentials) -> Result<Configuration, Error> {
    let ssid = credentials.ssid.as_str().try_into().map_err(|_| Error::Credentials)?;
    let password = credentials.password.as_str().try_into().map_err(|_| Error::Credentials)?;

    Ok(match credentials.auth {
        WifiAuth::Open => Configuration::Client(ClientConfiguration {
            ssid,
            auth_method: AuthMethod::None,
            ..Default::default()
        }),
        WifiAuth::Wpa2Personal => Configuration::Client(ClientConfiguration {
            ssid,
            password,
            auth_method: AuthMethod::WPA2Personal,
            ..Default::default()
        }),
        WifiAuth::Wpa2Enterprise => {
            let username: String<128> = credentials
                .username
                .as_str()
                .try_into()
                .map_err(|_| Error::Credentials)?;
            Configuration::EapClient(EapClientConfiguration {
                ssid,
                auth_method: AuthMethod::WPA2Enterprise,
                identity: Some(username.clone()),
                username: Some(username),
                password: Some(password),
                ..Default::default()
            })
        }
    })
}

impl WifiDriver for EspWifi {
    type Error = Error;

    async fn start(&mut self, credentials: &WifiCredentials) -> Result<(), Error> {
        self.controller
            .set_configuration(&configuration(credentials)?)
            .map_err(Error::Radio)?;
        self.controller.start_async().await.map_err(Error::Radio)?;
        info!("WiFi station started");

        self.events.send(WifiEvent::StationStarted).await;
        Ok(())
    }

    async fn connect(&mut self) -> Result<(), Error> {
        if let Err(e) = self.controller.connect_async().await {
            self.events.send(WifiEvent::Disconnected).await;
            return Err(Error::Radio(e));
        }

        let dropped = self.controller.wait_for_event(RadioEvent::StaDisconnected);
        match select(self.stack.wait_config_up(), dropped).await {
            Either::First(()) => {
                if let Some(config) = self.stack.config_v4() {
                    info!("Got IP: {}", config.address);
                }
                self.events.send(WifiEvent::GotIp).await;
            }
            Either::Second(()) => {
                warn!("Station disconnected before DHCP completed");
                self.events.send(WifiEvent::Disconnected).await;
            }
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), Error> {
        self.controller.stop_async().await.map_err(Error::Radio)
    }
}

#[embassy_executor::task]
async fn net_task(mut runner: Runner<'static, WifiDevice<'static>>) {
    runner.run().await
}
