pub mod frame;

use std::fmt;
use std::str::FromStr;

/// Seconds between the Unix epoch and the GPS epoch (1980-01-06)
pub const UNIX_GPS_EPOCH_OFFSET: u32 = 315_964_800;

/// Number of multicast contexts a device supports
pub const LORAMAC_MAX_MC_CTX: usize = 4;

/// LoRaWAN MAC Header (MHDR) - Message Type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MType {
    JoinRequest,
    JoinAccept,
    UnconfirmedDataUp,
    UnconfirmedDataDown,
    ConfirmedDataUp,
    ConfirmedDataDown,
    RejoinRequest,
    Proprietary,
}

impl MType {
    /// MHDR byte for this message type (LoRaWAN R1 major version)
    pub fn mhdr(self) -> u8 {
        let bits = match self {
            MType::JoinRequest => 0b000,
            MType::JoinAccept => 0b001,
            MType::UnconfirmedDataUp => 0b010,
            MType::UnconfirmedDataDown => 0b011,
            MType::ConfirmedDataUp => 0b100,
            MType::ConfirmedDataDown => 0b101,
            MType::RejoinRequest => 0b110,
            MType::Proprietary => 0b111,
        };
        bits << 5
    }

    pub fn is_uplink(self) -> bool {
        matches!(self, MType::UnconfirmedDataUp | MType::ConfirmedDataUp)
    }
}

impl From<u8> for MType {
    fn from(value: u8) -> Self {
        match (value >> 5) & 0x07 {
            0b000 => MType::JoinRequest,
            0b001 => MType::JoinAccept,
            0b010 => MType::UnconfirmedDataUp,
            0b011 => MType::UnconfirmedDataDown,
            0b100 => MType::ConfirmedDataUp,
            0b101 => MType::ConfirmedDataDown,
            0b110 => MType::RejoinRequest,
            _ => MType::Proprietary,
        }
    }
}

impl fmt::Display for MType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MType::JoinRequest => write!(f, "JoinRequest"),
            MType::JoinAccept => write!(f, "JoinAccept"),
            MType::UnconfirmedDataUp => write!(f, "UnconfirmedDataUp"),
            MType::UnconfirmedDataDown => write!(f, "UnconfirmedDataDown"),
            MType::ConfirmedDataUp => write!(f, "ConfirmedDataUp"),
            MType::ConfirmedDataDown => write!(f, "ConfirmedDataDown"),
            MType::RejoinRequest => write!(f, "RejoinRequest"),
            MType::Proprietary => write!(f, "Proprietary"),
        }
    }
}

/// LoRaWAN device class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceClass {
    /// Uplink followed by two short receive windows
    #[default]
    A,
    /// Scheduled ping slots synchronized on beacons
    B,
    /// Continuously listening except while transmitting
    C,
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceClass::A => write!(f, "A"),
            DeviceClass::B => write!(f, "B"),
            DeviceClass::C => write!(f, "C"),
        }
    }
}

/// LoRaWAN specification version the device implements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
    pub revision: u8,
}

impl Version {
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
            revision: 0,
        }
    }
}

impl FromStr for Version {
    type Err = anyhow::Error;

    /// Parses `"1.0.4"`, `"1.1"` or `"1.0.3.0"`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = [0u8; 4];
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() < 2 || parts.len() > 4 {
            return Err(anyhow::anyhow!("Invalid LoRaWAN version: {:?}", s));
        }
        for (field, part) in fields.iter_mut().zip(&parts) {
            *field = part
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid LoRaWAN version {:?}: {}", s, e))?;
        }
        Ok(Version {
            major: fields[0],
            minor: fields[1],
            patch: fields[2],
            revision: fields[3],
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Multicast group identifier, always in 0..=3
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GroupId(u8);

impl GroupId {
    /// Keeps the two low bits of an on-air id byte
    pub fn from_masked(value: u8) -> Self {
        GroupId(value & 0x03)
    }

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn all() -> impl Iterator<Item = GroupId> {
        (0..LORAMAC_MAX_MC_CTX as u8).map(GroupId)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Class C receive parameters of a multicast session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct McRxParams {
    /// Frequency in Hz
    pub frequency: u32,
    pub datarate: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mtype_from_mhdr() {
        assert_eq!(MType::from(0x40), MType::UnconfirmedDataUp);
        assert_eq!(MType::from(0x80), MType::ConfirmedDataUp);
        assert_eq!(MType::from(0x60), MType::UnconfirmedDataDown);
        for mtype in [MType::ConfirmedDataDown, MType::JoinAccept, MType::Proprietary] {
            assert_eq!(MType::from(mtype.mhdr()), mtype);
        }
    }

    #[test]
    fn test_parse_version() {
        let v: Version = "1.0.4".parse().unwrap();
        assert_eq!(v, Version::new(1, 0, 4));
        let v: Version = "1.1".parse().unwrap();
        assert_eq!((v.major, v.minor, v.patch), (1, 1, 0));
        assert!("1".parse::<Version>().is_err());
        assert!("1.x.0".parse::<Version>().is_err());
    }

    #[test]
    fn test_group_id_is_masked() {
        assert_eq!(GroupId::from_masked(0xFE).value(), 2);
        assert_eq!(GroupId::from_masked(0x07).index(), 3);
        assert_eq!(GroupId::all().count(), LORAMAC_MAX_MC_CTX);
    }
}
