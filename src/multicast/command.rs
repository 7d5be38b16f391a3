//! Remote Multicast Setup wire format
//!
//! Every command starts with a one-byte opcode followed by a fixed-size
//! payload. Multi-byte integers are little-endian. Answers reuse the opcode
//! of the request they answer.

use std::fmt;

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::lorawan::GroupId;

pub const PACKAGE_VERSION_REQ: u8 = 0x00;
pub const GROUP_STATUS_REQ: u8 = 0x01;
pub const GROUP_SETUP_REQ: u8 = 0x02;
pub const GROUP_DELETE_REQ: u8 = 0x03;
pub const CLASS_C_SESSION_REQ: u8 = 0x04;
pub const CLASS_B_SESSION_REQ: u8 = 0x05;

const GROUP_SETUP_LEN: usize = 1 + 4 + 16 + 4 + 4;
const GROUP_DELETE_LEN: usize = 1;
const CLASS_C_SESSION_LEN: usize = 1 + 4 + 1 + 3 + 1;

/// Server request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    PackageVersion,
    GroupStatus,
    GroupSetup {
        group: GroupId,
        address: u32,
        mc_key_encrypted: [u8; 16],
        fcount_min: u32,
        fcount_max: u32,
    },
    GroupDelete {
        group: GroupId,
    },
    ClassCSession {
        group: GroupId,
        /// Session start, seconds since the GPS epoch
        session_time: u32,
        /// Session lasts 2^timeout seconds
        timeout: u8,
        /// Hz
        frequency: u32,
        datarate: u8,
    },
    ClassBSession,
    Unknown(u8),
}

impl Request {
    pub fn opcode(&self) -> u8 {
        match self {
            Request::PackageVersion => PACKAGE_VERSION_REQ,
            Request::GroupStatus => GROUP_STATUS_REQ,
            Request::GroupSetup { .. } => GROUP_SETUP_REQ,
            Request::GroupDelete { .. } => GROUP_DELETE_REQ,
            Request::ClassCSession { .. } => CLASS_C_SESSION_REQ,
            Request::ClassBSession => CLASS_B_SESSION_REQ,
            Request::Unknown(opcode) => *opcode,
        }
    }

    /// Reads one command. Unknown opcodes, and the commands without a
    /// decoder, consume their opcode byte only.
    pub fn parse(buf: &mut impl Buf) -> Result<Self, CommandError> {
        if !buf.has_remaining() {
            return Err(CommandError::Empty);
        }
        let opcode = buf.get_u8();
        let need = |len: usize, buf: &dyn Buf| {
            if buf.remaining() < len {
                Err(CommandError::Truncated {
                    opcode,
                    expected: len,
                    available: buf.remaining(),
                })
            } else {
                Ok(())
            }
        };

        let request = match opcode {
            PACKAGE_VERSION_REQ => Request::PackageVersion,
            GROUP_STATUS_REQ => Request::GroupStatus,
            GROUP_SETUP_REQ => {
                need(GROUP_SETUP_LEN, &*buf)?;
                let group = GroupId::from_masked(buf.get_u8());
                let address = buf.get_u32_le();
                let mut mc_key_encrypted = [0u8; 16];
                buf.copy_to_slice(&mut mc_key_encrypted);
                Request::GroupSetup {
                    group,
                    address,
                    mc_key_encrypted,
                    fcount_min: buf.get_u32_le(),
                    fcount_max: buf.get_u32_le(),
                }
            }
            GROUP_DELETE_REQ => {
                need(GROUP_DELETE_LEN, &*buf)?;
                Request::GroupDelete {
                    group: GroupId::from_masked(buf.get_u8()),
                }
            }
            CLASS_C_SESSION_REQ => {
                need(CLASS_C_SESSION_LEN, &*buf)?;
                let group = GroupId::from_masked(buf.get_u8());
                let session_time = buf.get_u32_le();
                let timeout = buf.get_u8() & 0x0F;
                let frequency = buf.get_uint_le(3) as u32 * 100;
                let datarate = buf.get_u8();
                Request::ClassCSession {
                    group,
                    session_time,
                    timeout,
                    frequency,
                    datarate,
                }
            }
            CLASS_B_SESSION_REQ => Request::ClassBSession,
            other => Request::Unknown(other),
        };
        Ok(request)
    }

    /// Encodes the request the way a network server sends it
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.opcode());
        match self {
            Request::GroupSetup {
                group,
                address,
                mc_key_encrypted,
                fcount_min,
                fcount_max,
            } => {
                buf.put_u8(group.value());
                buf.put_u32_le(*address);
                buf.put_slice(mc_key_encrypted);
                buf.put_u32_le(*fcount_min);
                buf.put_u32_le(*fcount_max);
            }
            Request::GroupDelete { group } => buf.put_u8(group.value()),
            Request::ClassCSession {
                group,
                session_time,
                timeout,
                frequency,
                datarate,
            } => {
                buf.put_u8(group.value());
                buf.put_u32_le(*session_time);
                buf.put_u8(*timeout & 0x0F);
                buf.put_uint_le(u64::from(*frequency / 100), 3);
                buf.put_u8(*datarate);
            }
            _ => {}
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::PackageVersion => write!(f, "PackageVersionReq"),
            Request::GroupStatus => write!(f, "McGroupStatusReq"),
            Request::GroupSetup { group, address, .. } => {
                write!(f, "McGroupSetupReq group={} addr={:08X}", group, address)
            }
            Request::GroupDelete { group } => write!(f, "McGroupDeleteReq group={}", group),
            Request::ClassCSession {
                group,
                session_time,
                timeout,
                frequency,
                datarate,
            } => write!(
                f,
                "McClassCSessionReq group={} time={} timeout=2^{}s freq={} DR{}",
                group, session_time, timeout, frequency, datarate
            ),
            Request::ClassBSession => write!(f, "McClassBSessionReq"),
            Request::Unknown(opcode) => write!(f, "unknown opcode 0x{:02X}", opcode),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("no command left")]
    Empty,

    #[error("command 0x{opcode:02X} needs {expected} payload bytes, {available} left")]
    Truncated {
        opcode: u8,
        expected: usize,
        available: usize,
    },

    #[error("unknown answer opcode 0x{0:02X}")]
    UnknownAnswer(u8),
}

/// Device answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    PackageVersion { package_id: u8, version: u8 },
    GroupSetup { id_error: bool, group: GroupId },
    GroupDelete { status: u8 },
    ClassCSession { status: u8, time_to_start: Option<u32> },
}

impl Answer {
    pub fn opcode(&self) -> u8 {
        match self {
            Answer::PackageVersion { .. } => PACKAGE_VERSION_REQ,
            Answer::GroupSetup { .. } => GROUP_SETUP_REQ,
            Answer::GroupDelete { .. } => GROUP_DELETE_REQ,
            Answer::ClassCSession { .. } => CLASS_C_SESSION_REQ,
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            Answer::PackageVersion { .. } => 3,
            Answer::GroupSetup { .. } | Answer::GroupDelete { .. } => 2,
            Answer::ClassCSession { time_to_start, .. } => {
                2 + time_to_start.map_or(0, |_| 3)
            }
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.opcode());
        match self {
            Answer::PackageVersion {
                package_id,
                version,
            } => {
                buf.put_u8(*package_id);
                buf.put_u8(*version);
            }
            Answer::GroupSetup { id_error, group } => {
                buf.put_u8((u8::from(*id_error) << 2) | group.value());
            }
            Answer::GroupDelete { status } => buf.put_u8(*status),
            Answer::ClassCSession {
                status,
                time_to_start,
            } => {
                buf.put_u8(*status);
                if let Some(secs) = time_to_start {
                    buf.put_uint_le(u64::from(*secs & 0x00FF_FFFF), 3);
                }
            }
        }
    }

    /// Reads one answer, as the network server side does
    pub fn parse(buf: &mut impl Buf) -> Result<Self, CommandError> {
        if !buf.has_remaining() {
            return Err(CommandError::Empty);
        }
        let opcode = buf.get_u8();
        let truncated = |expected: usize, available: usize| CommandError::Truncated {
            opcode,
            expected,
            available,
        };
        match opcode {
            PACKAGE_VERSION_REQ => {
                if buf.remaining() < 2 {
                    return Err(truncated(2, buf.remaining()));
                }
                Ok(Answer::PackageVersion {
                    package_id: buf.get_u8(),
                    version: buf.get_u8(),
                })
            }
            GROUP_SETUP_REQ => {
                if buf.remaining() < 1 {
                    return Err(truncated(1, 0));
                }
                let b = buf.get_u8();
                Ok(Answer::GroupSetup {
                    id_error: b & 0x04 != 0,
                    group: GroupId::from_masked(b),
                })
            }
            GROUP_DELETE_REQ => {
                if buf.remaining() < 1 {
                    return Err(truncated(1, 0));
                }
                Ok(Answer::GroupDelete {
                    status: buf.get_u8(),
                })
            }
            CLASS_C_SESSION_REQ => {
                if buf.remaining() < 1 {
                    return Err(truncated(1, 0));
                }
                let status = buf.get_u8();
                // Only a status with no error bits carries the time to start
                let time_to_start = if status & 0x1C == 0 && buf.remaining() >= 3 {
                    Some(buf.get_uint_le(3) as u32)
                } else {
                    None
                };
                Ok(Answer::ClassCSession {
                    status,
                    time_to_start,
                })
            }
            other => Err(CommandError::UnknownAnswer(other)),
        }
    }
}

impl fmt::Display for Answer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Answer::PackageVersion {
                package_id,
                version,
            } => write!(f, "PackageVersionAns id={} version={}", package_id, version),
            Answer::GroupSetup { id_error, group } => {
                write!(f, "McGroupSetupAns group={} id_error={}", group, id_error)
            }
            Answer::GroupDelete { status } => {
                write!(f, "McGroupDeleteAns status=0x{:02X}", status)
            }
            Answer::ClassCSession {
                status,
                time_to_start: Some(secs),
            } => write!(f, "McClassCSessionAns status=0x{:02X} start in {}s", status, secs),
            Answer::ClassCSession {
                status,
                time_to_start: None,
            } => write!(f, "McClassCSessionAns status=0x{:02X}", status),
        }
    }
}
