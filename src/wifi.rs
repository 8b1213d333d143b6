#![allow(async_fn_in_trait)]

//! Station connection state machine.
//!
//! The radio driver pushes [`WifiEvent`]s into a [`WifiEvents`] channel from
//! its own task; [`WifiLink`] is the single consumer and decides what to do
//! next.

use embassy_sync::{
    blocking_mutex::raw::CriticalSectionRawMutex,
    channel::{Channel, Receiver},
};
use embassy_time::{with_timeout, Duration};
use log::{error, info, warn};

use crate::config::WifiCredentials;
use crate::constants::EVENT_QUEUE_DEPTH;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiEvent {
    StationStarted,
    GotIp,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiError {
    Driver,
    Timeout,
}

pub type WifiEvents = Channel<CriticalSectionRawMutex, WifiEvent, EVENT_QUEUE_DEPTH>;

pub trait WifiDriver {
    type Error: core::fmt::Debug;

    /// Configures the station and starts the radio.
    async fn start(&mut self, credentials: &WifiCredentials) -> Result<(), Self::Error>;
    /// Associates with the configured access point.
    async fn connect(&mut self) -> Result<(), Self::Error>;
    async fn stop(&mut self) -> Result<(), Self::Error>;
}

impl WifiState {
    /// Next state, and whether an association attempt has to be made.
    pub fn on_event(self, event: WifiEvent) -> (WifiState, bool) {
        match event {
            WifiEvent::StationStarted => (WifiState::Connecting, true),
            WifiEvent::GotIp => (WifiState::Connected, false),
            WifiEvent::Disconnected => (WifiState::Disconnected, false),
        }
    }
}

pub struct WifiLink<'a, D> {
    driver: D,
    events: Receiver<'a, CriticalSectionRawMutex, WifiEvent, EVENT_QUEUE_DEPTH>,
    state: WifiState,
}

impl<'a, D: WifiDriver> WifiLink<'a, D> {
    pub fn new(driver: D, events: &'a WifiEvents) -> Self {
        Self {
            driver,
            events: events.receiver(),
            state: WifiState::Disconnected,
        }
    }

    pub fn state(&self) -> WifiState {
        self.state
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Starts the station and waits up to `timeout` for an IP address.
    pub async fn connect(&mut self, credentials: &WifiCredentials, timeout: Duration) -> Result<(), WifiError> {
        info!("Connecting to WiFi {:?}", credentials.ssid);
        self.driver.start(credentials).await.map_err(|e| {
            error!("Failed to start WiFi: {:?}", e);
            WifiError::Driver
        })?;

        if with_timeout(timeout, self.wait_connected()).await.is_err() {
            error!("Failed to connect to WiFi {:?} within {} ms", credentials.ssid, timeout.as_millis());
            self.disconnect().await;
            return Err(WifiError::Timeout);
        }

        info!("Connected to WiFi {:?}", credentials.ssid);
        Ok(())
    }

    async fn wait_connected(&mut self) {
        while self.state != WifiState::Connected {
            let event = self.events.receive().await;
            let (next, associate) = self.state.on_event(event);
            info!("WiFi {:?}: {:?} -> {:?}", event, self.state, next);
            self.state = next;

            if associate {
                if let Err(e) = self.driver.connect().await {
                    warn!("WiFi association failed: {:?}", e);
                }
            }
        }
    }

    pub async fn disconnect(&mut self) {
        if let Err(e) = self.driver.stop().await {
            warn!("Failed to stop WiFi: {:?}", e);
        }
        self.state = WifiState::Disconnected;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use embassy_sync::channel::Sender;

    pub struct FakeWifi<'a> {
        pub events: Sender<'a, CriticalSectionRawMutex, WifiEvent, EVENT_QUEUE_DEPTH>,
        pub reachable: bool,
        /// Associates, then loses the station before an address is assigned
        pub drops_before_address: bool,
        pub started: bool,
        pub stopped: bool,
    }

    impl<'a> FakeWifi<'a> {
        pub fn new(events: &'a WifiEvents, reachable: bool) -> Self {
            Self {
                events: events.sender(),
                reachable,
                drops_before_address: false,
                started: false,
                stopped: false,
            }
        }
    }

    impl WifiDriver for FakeWifi<'_> {
        type Error = ();

        async fn start(&mut self, _credentials: &WifiCredentials) -> Result<(), ()> {
            self.started = true;
            self.events.send(WifiEvent::StationStarted).await;
            Ok(())
        }

        async fn connect(&mut self) -> Result<(), ()> {
            if self.drops_before_address {
                self.events.send(WifiEvent::Disconnected).await;
                Ok(())
            } else if self.reachable {
                self.events.send(WifiEvent::GotIp).await;
                Ok(())
            } else {
                self.events.send(WifiEvent::Disconnected).await;
                Err(())
            }
        }

        async fn stop(&mut self) -> Result<(), ()> {
            self.stopped = true;
            Ok(())
        }
    }

    pub fn credentials() -> WifiCredentials {
        WifiCredentials {
            ssid: heapless::String::try_from("vogon-net").unwrap(),
            username: heapless::String::new(),
            password: heapless::String::try_from("hunter22").unwrap(),
            auth: crate::config::WifiAuth::Wpa2Personal,
        }
    }

    #[test]
    fn transitions() {
        assert_eq!(
            WifiState::Disconnected.on_event(WifiEvent::StationStarted),
            (WifiState::Connecting, true)
        );
        assert_eq!(
            WifiState::Connecting.on_event(WifiEvent::GotIp),
            (WifiState::Connected, false)
        );
        assert_eq!(
            WifiState::Connected.on_event(WifiEvent::Disconnected),
            (WifiState::Disconnected, false)
        );
    }

    #[tokio::test]
    async fn connects_once_an_address_is_assigned() {
        let events = WifiEvents::new();
        let mut link = WifiLink::new(FakeWifi::new(&events, true), &events);

        link.connect(&credentials(), Duration::from_secs(1)).await.unwrap();
        assert_eq!(link.state(), WifiState::Connected);

        link.disconnect().await;
        assert!(link.driver().stopped);
    }

    #[tokio::test]
    async fn unreachable_network_times_out() {
        let events = WifiEvents::new();
        let mut link = WifiLink::new(FakeWifi::new(&events, false), &events);

        assert_eq!(
            link.connect(&credentials(), Duration::from_millis(50)).await,
            Err(WifiError::Timeout)
        );
        assert_eq!(link.state(), WifiState::Disconnected);
        assert!(link.driver().started);
        assert!(link.driver().stopped);
    }

    #[tokio::test]
    async fn station_lost_before_address_times_out_and_stops() {
        let events = WifiEvents::new();
        let mut wifi = FakeWifi::new(&events, true);
        wifi.drops_before_address = true;
        let mut link = WifiLink::new(wifi, &events);

        assert_eq!(
            link.connect(&credentials(), Duration::from_millis(50)).await,
            Err(WifiError::Timeout)
        );
        assert_eq!(link.state(), WifiState::Disconnected);
        assert!(link.driver().stopped);
    }
}
