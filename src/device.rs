//! End-device runtime
//!
//! Wires the secure element, the timer service and the application packages
//! together. Everything here is synchronous; the UDP link in [`crate::udp`]
//! drives it from the tokio runtime.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::locked;
use crate::lorawan::frame::FrameBuilder;
use crate::lorawan::{DeviceClass, Version};
use crate::multicast::{McastCapabilities, RemoteMcastSetup, RxLimits, SecureElementChannels};
use crate::package::{
    AppData, ClassRequest, DeviceTimeRequest, LmhPackage, McpsIndication, MsgType, UplinkSender,
    UtcClock,
};
use crate::secure_element::{ChangeNotify, CryptoBackend, SecureElement, SecureElementError};
use crate::timer::{run_until, SoftRtc, TimerServer};

/// DeviceTimeReq MAC command identifier
pub const DEVICE_TIME_REQ: u8 = 0x0D;

/// Application payload waiting to be framed and sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uplink {
    pub data: AppData,
    pub msg_type: MsgType,
}

/// Returns a change flag and the secure element callback that raises it
pub fn change_flag() -> (Arc<AtomicBool>, ChangeNotify) {
    let dirty = Arc::new(AtomicBool::new(false));
    let raise = dirty.clone();
    (dirty, Box::new(move || raise.store(true, Ordering::Release)))
}

/// Loads a persisted secure element blob; `false` when there is none yet
pub fn load_nvm<B: CryptoBackend>(se: &mut SecureElement<B>, path: &Path) -> anyhow::Result<bool> {
    let blob = match std::fs::read(path) {
        Ok(blob) => blob,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e).with_context(|| format!("Failed to read NVM file {:?}", path)),
    };
    se.restore_nvm_context(&blob)
        .with_context(|| format!("Invalid NVM file {:?}", path))?;
    info!("Secure element context restored from {:?}", path);
    Ok(true)
}

/// Feeds package uplinks into the link's queue
#[derive(Clone)]
struct QueuedUplink {
    tx: mpsc::UnboundedSender<Uplink>,
}

impl UplinkSender for QueuedUplink {
    fn send(&mut self, data: AppData, msg_type: MsgType) -> anyhow::Result<()> {
        self.tx
            .send(Uplink { data, msg_type })
            .map_err(|_| anyhow::anyhow!("uplink queue closed"))
    }
}

impl DeviceTimeRequest for QueuedUplink {
    fn request_device_time(&mut self) {
        let data = AppData {
            port: 0,
            buffer: vec![DEVICE_TIME_REQ],
        };
        if let Err(e) = self.send(data, MsgType::Unconfirmed) {
            warn!("DeviceTimeReq not queued: {}", e);
        }
    }
}

/// Current device class, switched from timer callbacks
#[derive(Debug, Default)]
pub struct ClassSwitch {
    class: Mutex<DeviceClass>,
}

impl ClassSwitch {
    pub fn current(&self) -> DeviceClass {
        *locked(&self.class)
    }
}

impl ClassRequest for ClassSwitch {
    fn request_class(&self, class: DeviceClass) {
        let mut current = locked(&self.class);
        if *current != class {
            info!("Switching to class {}", class);
            *current = class;
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceSettings {
    pub version: Version,
    pub dev_addr: u32,
    /// Answer buffer handed to the packages
    pub buffer_size: usize,
    /// Where the secure element context is persisted
    pub nvm_file: Option<PathBuf>,
    pub rx_limits: RxLimits,
}

pub struct Device<B: CryptoBackend> {
    se: Arc<Mutex<SecureElement<B>>>,
    rtc: SoftRtc,
    timers: Arc<Mutex<TimerServer>>,
    packages: Vec<Box<dyn LmhPackage>>,
    class: Arc<ClassSwitch>,
    dirty: Arc<AtomicBool>,
    nvm_file: Option<PathBuf>,
    dev_addr: u32,
    fcnt_up: u32,
    fcnt_down: u32,
}

impl<B: CryptoBackend + 'static> Device<B> {
    /// Builds the runtime around an initialized secure element. `dirty` is
    /// the flag raised by the element's change callback. Returns the queue
    /// the packages push their uplinks into.
    pub fn new(
        se: SecureElement<B>,
        dirty: Arc<AtomicBool>,
        settings: DeviceSettings,
    ) -> (Self, mpsc::UnboundedReceiver<Uplink>) {
        let se = Arc::new(Mutex::new(se));
        let rtc = SoftRtc::new();
        let timers = Arc::new(Mutex::new(TimerServer::new(Box::new(rtc.clone()))));
        let class = Arc::new(ClassSwitch::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = QueuedUplink { tx };

        let caps = McastCapabilities {
            channels: Box::new(SecureElementChannels::new(
                se.clone(),
                settings.version,
                settings.rx_limits.clone(),
            )),
            uplink: Box::new(queue.clone()),
            device_time: Some(Box::new(queue)),
            class: class.clone(),
            clock: Box::new(UtcClock),
        };
        let mut mcast = RemoteMcastSetup::new(caps, timers.clone());
        mcast.init(settings.buffer_size);
        info!(
            "Remote multicast setup on port {} ({})",
            mcast.port(),
            if mcast.is_running() { "running" } else { "idle" }
        );

        let device = Self {
            se,
            rtc,
            timers,
            packages: vec![Box::new(mcast)],
            class,
            dirty,
            nvm_file: settings.nvm_file,
            dev_addr: settings.dev_addr,
            fcnt_up: 0,
            fcnt_down: 0,
        };
        (device, rx)
    }

    pub fn secure_element(&self) -> &Arc<Mutex<SecureElement<B>>> {
        &self.se
    }

    pub fn class(&self) -> DeviceClass {
        self.class.current()
    }

    pub fn rtc(&self) -> &SoftRtc {
        &self.rtc
    }

    /// Milliseconds until the next timer expiry
    pub fn time_to_alarm(&self) -> Option<u32> {
        self.rtc.time_to_alarm()
    }

    /// Moves the device clock to `now_ms`, firing every timer reached
    pub fn advance_to(&mut self, now_ms: u32) {
        run_until(&mut locked(&self.timers), &self.rtc, now_ms);
    }

    /// Routes an application downlink to the package listening on its port
    pub fn on_downlink(&mut self, f_port: u8, payload: Vec<u8>) {
        let indication = McpsIndication {
            port: f_port,
            buffer: payload,
            downlink_counter: self.fcnt_down,
            multicast: false,
        };
        self.fcnt_down = self.fcnt_down.wrapping_add(1);

        let mut handled = false;
        for package in self
            .packages
            .iter_mut()
            .filter(|p| p.is_initialized() && p.port() == f_port)
        {
            package.on_mcps_indication(&indication);
            handled = true;
        }
        if !handled {
            debug!("No package on port {}, {} bytes dropped", f_port, indication.buffer.len());
        }
    }

    /// Main loop step: background package work, then persistence
    pub fn process(&mut self) {
        for package in self.packages.iter_mut().filter(|p| p.is_running()) {
            package.process();
        }
        if let Err(e) = self.persist_if_dirty() {
            warn!("{:#}", e);
        }
    }

    /// Frames a queued uplink with the session keys
    pub fn build_uplink(&mut self, uplink: &Uplink) -> Result<Vec<u8>, SecureElementError> {
        let builder = FrameBuilder::new_uplink(
            uplink.msg_type == MsgType::Confirmed,
            self.dev_addr,
            self.fcnt_up,
            uplink.data.port,
            uplink.data.buffer.clone(),
        );
        let frame = builder.build(&mut locked(&self.se))?;
        debug!(
            "Uplink FCnt={} FPort={} ({}, {} bytes)",
            self.fcnt_up,
            uplink.data.port,
            uplink.msg_type,
            frame.len()
        );
        self.fcnt_up = self.fcnt_up.wrapping_add(1);
        Ok(frame)
    }

    /// Writes the secure element context when it changed since the last write
    pub fn persist_if_dirty(&self) -> anyhow::Result<()> {
        let Some(path) = &self.nvm_file else {
            return Ok(());
        };
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let blob = locked(&self.se).nvm_context();
        std::fs::write(path, &blob)
            .with_context(|| format!("Failed to persist NVM context to {:?}", path))?;
        debug!("Persisted {} byte NVM context to {:?}", blob.len(), path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lorawan::frame::{crypt_frm_payload, decode_data_frame, Direction};
    use crate::lorawan::GroupId;
    use crate::multicast::{derive_multicast_root_keys, Request, REMOTE_MCAST_SETUP_PORT};
    use crate::secure_element::{KeyIdentifier, SoftBackend};
    use bytes::BytesMut;

    const V104: Version = Version::new(1, 0, 4);
    const DEV_ADDR: u32 = 0x26011F00;

    fn device(nvm_file: Option<PathBuf>) -> (Device<SoftBackend>, mpsc::UnboundedReceiver<Uplink>) {
        let (dirty, notify) = change_flag();
        let mut se = SecureElement::init(SoftBackend::new(), Some(notify)).unwrap();
        se.set_key(KeyIdentifier::GenAppKey, &[0x0B; 16]).unwrap();
        se.set_key(KeyIdentifier::AppSKey, &[0x0A; 16]).unwrap();
        se.set_key(KeyIdentifier::FNwkSIntKey, &[0x0C; 16]).unwrap();
        derive_multicast_root_keys(&mut se, V104).unwrap();
        let settings = DeviceSettings {
            version: V104,
            dev_addr: DEV_ADDR,
            buffer_size: 242,
            nvm_file,
            rx_limits: RxLimits::default(),
        };
        Device::new(se, dirty, settings)
    }

    fn encode(requests: &[Request]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for request in requests {
            request.encode(&mut buf);
        }
        buf.to_vec()
    }

    #[test]
    fn test_version_answer_is_queued_and_framed() {
        let (mut device, mut rx) = device(None);
        device.on_downlink(REMOTE_MCAST_SETUP_PORT, vec![0x00]);

        let uplink = rx.try_recv().unwrap();
        assert_eq!(uplink.data.port, REMOTE_MCAST_SETUP_PORT);
        assert_eq!(uplink.data.buffer, vec![0x00, 0x02, 0x01]);
        assert_eq!(uplink.msg_type, MsgType::Confirmed);

        let phy = device.build_uplink(&uplink).unwrap();
        let frame = decode_data_frame(&phy).unwrap();
        assert_eq!(frame.dev_addr, DEV_ADDR);
        assert_eq!(frame.fcnt, 0);
        assert_eq!(frame.f_port, Some(REMOTE_MCAST_SETUP_PORT));

        let mut payload = frame.frm_payload.clone();
        let mut se = locked(device.secure_element());
        crypt_frm_payload(
            &mut se,
            KeyIdentifier::AppSKey,
            Direction::Uplink,
            DEV_ADDR,
            0,
            &mut payload,
        )
        .unwrap();
        assert_eq!(payload, vec![0x00, 0x02, 0x01]);
    }

    #[test]
    fn test_frame_counter_increments() {
        let (mut device, _rx) = device(None);
        let uplink = Uplink {
            data: AppData {
                port: 2,
                buffer: vec![1, 2, 3],
            },
            msg_type: MsgType::Unconfirmed,
        };
        device.build_uplink(&uplink).unwrap();
        let second = device.build_uplink(&uplink).unwrap();
        assert_eq!(decode_data_frame(&second).unwrap().fcnt, 1);
    }

    #[test]
    fn test_other_port_is_ignored() {
        let (mut device, mut rx) = device(None);
        device.on_downlink(10, vec![0x00]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_group_setup_requests_device_time() {
        let (mut device, mut rx) = device(None);
        let setup = Request::GroupSetup {
            group: GroupId::from_masked(1),
            address: 0x11223344,
            mc_key_encrypted: [0x42; 16],
            fcount_min: 0,
            fcount_max: 100,
        };
        device.on_downlink(REMOTE_MCAST_SETUP_PORT, encode(&[setup]));

        let time_req = rx.try_recv().unwrap();
        assert_eq!(time_req.data.port, 0);
        assert_eq!(time_req.data.buffer, vec![DEVICE_TIME_REQ]);
        let answer = rx.try_recv().unwrap();
        assert_eq!(answer.data.buffer, vec![0x02, 0x01]);
    }

    #[test]
    fn test_class_c_session_switches_class() {
        let (mut device, mut rx) = device(None);
        let group = GroupId::from_masked(0);
        let setup = Request::GroupSetup {
            group,
            address: 0x01020304,
            mc_key_encrypted: [0x01; 16],
            fcount_min: 0,
            fcount_max: 1000,
        };
        let session = Request::ClassCSession {
            group,
            session_time: UtcClock.gps_seconds() + 10,
            timeout: 2,
            frequency: 869_525_000,
            datarate: 0,
        };
        device.on_downlink(REMOTE_MCAST_SETUP_PORT, encode(&[setup, session]));
        while rx.try_recv().is_ok() {}

        assert_eq!(device.class(), DeviceClass::A);
        assert!(device.time_to_alarm().is_some());
        // Starts after 9 or 10 s depending on the wall clock, lasts 4 s
        device.advance_to(10_500);
        assert_eq!(device.class(), DeviceClass::C);
        device.advance_to(14_500);
        assert_eq!(device.class(), DeviceClass::A);
    }

    #[test]
    fn test_persist_and_reload() {
        let path = std::env::temp_dir().join(format!("lora-se-test-{}.nvm", std::process::id()));
        let (device, _rx) = device(Some(path.clone()));
        device.persist_if_dirty().unwrap();

        let expected = locked(device.secure_element()).nvm_context();
        assert_eq!(std::fs::read(&path).unwrap(), expected.to_vec());

        // Nothing changed since, so nothing is rewritten
        std::fs::remove_file(&path).unwrap();
        device.persist_if_dirty().unwrap();
        assert!(!path.exists());

        std::fs::write(&path, &expected).unwrap();
        let mut fresh = SecureElement::init(SoftBackend::new(), None).unwrap();
        assert!(load_nvm(&mut fresh, &path).unwrap());
        assert_eq!(
            fresh.keys().lookup(KeyIdentifier::McKeKey).unwrap(),
            locked(device.secure_element()).keys().lookup(KeyIdentifier::McKeKey).unwrap()
        );
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_missing_nvm_file_is_not_an_error() {
        let mut se = SecureElement::init(SoftBackend::new(), None).unwrap();
        let path = std::env::temp_dir().join("lora-se-does-not-exist.nvm");
        assert!(!load_nvm(&mut se, &path).unwrap());
    }
}
