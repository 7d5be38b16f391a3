//! Remote Multicast Setup package (FPort 200)
//!
//! Lets the network server define multicast groups and schedule a class C
//! session for them. A session is driven by two timers: the start timer
//! switches the device to class C and arms the stop timer, which switches it
//! back to class A after 2^timeout seconds. The timer pair is shared by all
//! groups, so only the most recently scheduled session runs.

pub mod channels;
pub mod command;

pub use channels::{
    derive_multicast_root_keys, McChannelError, McChannelParams, MulticastChannels, RxLimits,
    RxParamsRejected, SecureElementChannels,
};
pub use command::{Answer, CommandError, Request};

use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tracing::{debug, info, warn};

use crate::locked;
use crate::lorawan::{DeviceClass, GroupId, McRxParams, LORAMAC_MAX_MC_CTX, UNIX_GPS_EPOCH_OFFSET};
use crate::package::{
    AppData, ClassRequest, DeviceTimeRequest, LmhPackage, McpsIndication, MsgType, SystemClock,
    UplinkSender,
};
use crate::timer::{TimerId, TimerServer};

pub const REMOTE_MCAST_SETUP_PORT: u8 = 200;
pub const REMOTE_MCAST_SETUP_ID: u8 = 2;
pub const REMOTE_MCAST_SETUP_VERSION: u8 = 1;

/// Status bit set when the session start time has already passed
pub const STATUS_START_MISSED: u8 = 0x10;

/// Group definition received in a McGroupSetupReq
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct McGroupData {
    pub group: GroupId,
    pub address: u32,
    pub mc_key_encrypted: [u8; 16],
    pub fcount_min: u32,
    pub fcount_max: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Stopped,
    Started,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct McSession {
    pub group_data: McGroupData,
    pub state: SessionState,
    /// Session start in system seconds
    pub session_time: u32,
    /// The session lasts 2^timeout seconds
    pub timeout: u8,
    pub rx_params: McRxParams,
}

/// Per-group state plus the group currently wired to the timer pair
#[derive(Debug, Default)]
pub struct SessionTable {
    pub sessions: [McSession; LORAMAC_MAX_MC_CTX],
    pub scheduled: Option<GroupId>,
}

/// What the package needs from the rest of the stack
pub struct McastCapabilities {
    pub channels: Box<dyn MulticastChannels>,
    pub uplink: Box<dyn UplinkSender>,
    /// Requested after each successful group setup when present
    pub device_time: Option<Box<dyn DeviceTimeRequest>>,
    pub class: Arc<dyn ClassRequest>,
    pub clock: Box<dyn SystemClock>,
}

#[derive(Debug, Clone, Copy)]
struct SessionTimers {
    start: TimerId,
    stop: TimerId,
}

pub struct RemoteMcastSetup {
    caps: McastCapabilities,
    timers: Arc<Mutex<TimerServer>>,
    table: Arc<Mutex<SessionTable>>,
    session_timers: Option<SessionTimers>,
    buffer_size: usize,
    initialized: bool,
    running: bool,
}

impl RemoteMcastSetup {
    pub fn new(caps: McastCapabilities, timers: Arc<Mutex<TimerServer>>) -> Self {
        Self {
            caps,
            timers,
            table: Arc::new(Mutex::new(SessionTable::default())),
            session_timers: None,
            buffer_size: 0,
            initialized: false,
            running: false,
        }
    }

    pub fn session(&self, group: GroupId) -> McSession {
        locked(&self.table).sessions[group.index()]
    }

    /// Start timer id, once initialized
    pub fn start_timer(&self) -> Option<TimerId> {
        self.session_timers.map(|t| t.start)
    }

    /// Stop timer id, once initialized
    pub fn stop_timer(&self) -> Option<TimerId> {
        self.session_timers.map(|t| t.stop)
    }

    fn arm_timers(&mut self) {
        let mut timers = locked(&self.timers);

        let table = self.table.clone();
        let class = self.caps.class.clone();
        let on_stop = Box::new(move |_: &mut TimerServer| {
            class.request_class(DeviceClass::A);
            let mut table = locked(&table);
            if let Some(group) = table.scheduled {
                table.sessions[group.index()].state = SessionState::Stopped;
                info!("Multicast session of group {} ended", group);
            }
        });
        let stop = match self.session_timers {
            Some(ids) => {
                timers.init(ids.stop, on_stop);
                ids.stop
            }
            None => timers.create(on_stop),
        };

        let table = self.table.clone();
        let class = self.caps.class.clone();
        let on_start = Box::new(move |t: &mut TimerServer| {
            class.request_class(DeviceClass::C);
            let timeout = {
                let mut table = locked(&table);
                let Some(group) = table.scheduled else {
                    return;
                };
                let session = &mut table.sessions[group.index()];
                session.state = SessionState::Started;
                info!("Multicast session of group {} started", group);
                session.timeout
            };
            t.set_value(stop, (1u32 << timeout).saturating_mul(1000));
            t.start(stop);
        });
        let start = match self.session_timers {
            Some(ids) => {
                timers.init(ids.start, on_start);
                ids.start
            }
            None => timers.create(on_start),
        };

        self.session_timers = Some(SessionTimers { start, stop });
    }

    /// Handles one request; `None` when the request has no answer
    fn handle(&mut self, request: Request) -> Option<Answer> {
        match request {
            Request::PackageVersion => Some(Answer::PackageVersion {
                package_id: REMOTE_MCAST_SETUP_ID,
                version: REMOTE_MCAST_SETUP_VERSION,
            }),
            Request::GroupSetup {
                group,
                address,
                mc_key_encrypted,
                fcount_min,
                fcount_max,
            } => {
                let group_data = McGroupData {
                    group,
                    address,
                    mc_key_encrypted,
                    fcount_min,
                    fcount_max,
                };
                locked(&self.table).sessions[group.index()].group_data = group_data;

                let channel = McChannelParams {
                    class: DeviceClass::C,
                    is_enabled: true,
                    group,
                    address,
                    mc_key_encrypted,
                    fcount_min,
                    fcount_max,
                    rx_params: McRxParams::default(),
                };
                let id_error = match self.caps.channels.setup(&channel) {
                    Ok(()) => false,
                    Err(e) => {
                        warn!("Multicast group {} setup failed: {}", group, e);
                        true
                    }
                };
                if !id_error {
                    if let Some(device_time) = self.caps.device_time.as_mut() {
                        device_time.request_device_time();
                    }
                }
                Some(Answer::GroupSetup { id_error, group })
            }
            Request::GroupDelete { group } => {
                locked(&self.table).sessions[group.index()].group_data = McGroupData::default();
                let mut status = group.value();
                if let Err(e) = self.caps.channels.delete(group) {
                    debug!("Multicast group {} delete: {}", group, e);
                    status |= 0x04;
                }
                Some(Answer::GroupDelete { status })
            }
            Request::ClassCSession {
                group,
                session_time,
                timeout,
                frequency,
                datarate,
            } => {
                let rx_params = McRxParams {
                    frequency,
                    datarate,
                };
                let session_time = session_time.wrapping_add(UNIX_GPS_EPOCH_OFFSET);
                {
                    let mut table = locked(&self.table);
                    let session = &mut table.sessions[group.index()];
                    session.session_time = session_time;
                    session.timeout = timeout;
                    session.rx_params = rx_params;
                }

                let mut status = match self.caps.channels.setup_rx_params(group, rx_params) {
                    Ok(status) => status,
                    Err(rejected) => {
                        warn!("Multicast group {}: {}", group, rejected);
                        return Some(Answer::ClassCSession {
                            status: rejected.status,
                            time_to_start: None,
                        });
                    }
                };

                let now = self.caps.clock.seconds();
                // Signed distance on the wrapping 32-bit clock
                let time_to_start = session_time.wrapping_sub(now) as i32;
                if time_to_start > 0 {
                    if let Some(ids) = self.session_timers {
                        locked(&self.table).scheduled = Some(group);
                        let mut timers = locked(&self.timers);
                        timers.set_value(ids.start, (time_to_start as u32).saturating_mul(1000));
                        timers.start(ids.start);
                    }
                    info!("Time to session start: {} ms", i64::from(time_to_start) * 1000);
                    return Some(Answer::ClassCSession {
                        status,
                        time_to_start: Some(time_to_start as u32),
                    });
                }

                debug!("Multicast group {} session start already passed", group);
                status |= STATUS_START_MISSED;
                Some(Answer::ClassCSession {
                    status,
                    time_to_start: None,
                })
            }
            Request::GroupStatus | Request::ClassBSession => {
                debug!("{} not supported, ignored", request);
                None
            }
            Request::Unknown(opcode) => {
                debug!("Skipping unknown opcode 0x{:02X}", opcode);
                None
            }
        }
    }

    fn log_group(&self, group: GroupId) {
        let session = self.session(group);
        let data = session.group_data;
        debug!(
            "Group {}: addr={:08X} key={} fcnt={}..={} time={} timeout={} rx={} Hz DR{}",
            data.group,
            data.address,
            hex::encode_upper(data.mc_key_encrypted),
            data.fcount_min,
            data.fcount_max,
            session.session_time,
            session.timeout,
            session.rx_params.frequency,
            session.rx_params.datarate,
        );
    }
}

impl LmhPackage for RemoteMcastSetup {
    fn port(&self) -> u8 {
        REMOTE_MCAST_SETUP_PORT
    }

    fn init(&mut self, buffer_size: usize) {
        if buffer_size == 0 {
            self.initialized = false;
            self.running = false;
            return;
        }
        self.buffer_size = buffer_size;
        self.arm_timers();
        self.initialized = true;
        self.running = true;
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn is_running(&self) -> bool {
        self.initialized && self.running
    }

    fn on_mcps_indication(&mut self, indication: &McpsIndication) {
        if !self.initialized || indication.port != REMOTE_MCAST_SETUP_PORT {
            return;
        }

        let mut input = &indication.buffer[..];
        let mut response = BytesMut::with_capacity(self.buffer_size);
        let mut last_group = None;

        while !input.is_empty() {
            let request = match Request::parse(&mut input) {
                Ok(request) => request,
                Err(e) => {
                    warn!("Dropping rest of multicast setup frame: {}", e);
                    break;
                }
            };
            debug!("Multicast setup request: {}", request);
            if let Request::GroupSetup { group, .. }
            | Request::GroupDelete { group }
            | Request::ClassCSession { group, .. } = request
            {
                last_group = Some(group);
            }

            if let Some(answer) = self.handle(request) {
                if response.len() + answer.encoded_len() > self.buffer_size {
                    warn!("Answer buffer full ({} bytes), dropping {}", self.buffer_size, answer);
                    break;
                }
                answer.encode(&mut response);
            }
        }

        if response.is_empty() {
            return;
        }

        let data = AppData {
            port: REMOTE_MCAST_SETUP_PORT,
            buffer: response.to_vec(),
        };
        if let Err(e) = self.caps.uplink.send(data, MsgType::Confirmed) {
            warn!("Failed to queue multicast setup answer: {}", e);
        }

        if let Some(group) = last_group {
            self.log_group(group);
        }
    }
}
