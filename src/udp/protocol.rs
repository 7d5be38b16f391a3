//! Datagram format of the device link
//!
//! Downlink (simulator to device): `FPort | FRMPayload`, payload in clear.
//! Uplink (device to simulator): a complete LoRaWAN PHY payload.

use bytes::{Buf, BufMut, BytesMut};

/// Largest datagram either side sends
pub const MAX_DATAGRAM_SIZE: usize = 512;

/// Application downlink addressed to one FPort
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Downlink {
    pub f_port: u8,
    pub payload: Vec<u8>,
}

impl Downlink {
    pub fn new(f_port: u8, payload: Vec<u8>) -> Self {
        Self { f_port, payload }
    }

    /// Parse a raw UDP datagram into a downlink
    pub fn parse(data: &[u8]) -> anyhow::Result<Self> {
        let mut buf = data;
        if !buf.has_remaining() {
            return Err(anyhow::anyhow!("Empty downlink datagram"));
        }
        let f_port = buf.get_u8();
        if f_port == 0 {
            return Err(anyhow::anyhow!("FPort 0 carries MAC commands, not application data"));
        }
        if f_port >= 224 {
            return Err(anyhow::anyhow!("Reserved FPort {}", f_port));
        }
        Ok(Downlink {
            f_port,
            payload: buf.to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(1 + self.payload.len());
        buf.put_u8(self.f_port);
        buf.put_slice(&self.payload);
        buf.to_vec()
    }
}
