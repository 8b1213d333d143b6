#![cfg_attr(not(test), no_std)]

//! Core of the Vogon air telemetry node.
//!
//! Everything here is hardware independent: the firmware binary binds these
//! state machines and drivers to the ESP32 radio, flash and peripherals.

pub mod ble;
pub mod config;
pub mod constants;
pub mod duty_cycle;
pub mod gatt;
pub mod mqtt;
pub mod sensors;
pub mod storage;
pub mod sync;
pub mod wifi;
