//! Application-layer package framework
//!
//! Packages listen on a dedicated FPort. The runtime hands them every frame
//! received on that port and gives them the capabilities they need to talk
//! back to the stack.

use std::fmt;

use crate::lorawan::{DeviceClass, UNIX_GPS_EPOCH_OFFSET};

/// Uplink confirmation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Unconfirmed,
    Confirmed,
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MsgType::Unconfirmed => write!(f, "unconfirmed"),
            MsgType::Confirmed => write!(f, "confirmed"),
        }
    }
}

/// Application payload to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppData {
    pub port: u8,
    pub buffer: Vec<u8>,
}

/// Received application frame
#[derive(Debug, Clone, Default)]
pub struct McpsIndication {
    pub port: u8,
    pub buffer: Vec<u8>,
    /// Downlink counter of the frame
    pub downlink_counter: u32,
    /// Received on a multicast address
    pub multicast: bool,
}

/// Queues an application uplink
pub trait UplinkSender: Send {
    fn send(&mut self, data: AppData, msg_type: MsgType) -> anyhow::Result<()>;
}

/// Asks the network for the current time (DeviceTimeReq MAC command)
pub trait DeviceTimeRequest: Send {
    fn request_device_time(&mut self);
}

/// Switches the device class. Called from timer callbacks.
pub trait ClassRequest: Send + Sync {
    fn request_class(&self, class: DeviceClass);
}

/// System time in seconds. Multicast session times, once shifted by
/// [`UNIX_GPS_EPOCH_OFFSET`], are compared against it.
pub trait SystemClock: Send {
    fn seconds(&self) -> u32;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct UtcClock;

impl SystemClock for UtcClock {
    fn seconds(&self) -> u32 {
        chrono::Utc::now().timestamp().max(0) as u32
    }
}

impl UtcClock {
    /// Seconds since the GPS epoch
    pub fn gps_seconds(&self) -> u32 {
        self.seconds().wrapping_sub(UNIX_GPS_EPOCH_OFFSET)
    }
}

/// Application-layer package bound to one FPort
pub trait LmhPackage: Send {
    fn port(&self) -> u8;

    /// `buffer_size` bounds the answer assembled for one received frame;
    /// zero leaves the package uninitialized
    fn init(&mut self, buffer_size: usize);

    fn is_initialized(&self) -> bool;

    fn is_running(&self) -> bool;

    /// Background work, called from the main loop
    fn process(&mut self) {}

    fn on_mcps_indication(&mut self, indication: &McpsIndication);
}
