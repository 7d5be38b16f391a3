//! LoRaWAN data frames
//!
//! Frame structure:
//!   MHDR(1) | DevAddr(4,LE) | FCtrl(1) | FCnt(2,LE) | [FPort(1) | FRMPayload(N)] | MIC(4,LE)
//!
//! FRMPayload encryption and the MIC both go through the secure element, so
//! no key material is handled here.

use std::fmt;

use super::MType;
use crate::secure_element::{
    CryptoBackend, KeyIdentifier, Result, SecureElement, SecureElementError,
};

/// Transfer direction as encoded in the B0 and A_i blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Uplink = 0,
    Downlink = 1,
}

/// B0 authentication block prepended to the frame before the CMAC
pub fn b0_block(dir: Direction, dev_addr: u32, fcnt: u32, msg_len: u8) -> [u8; 16] {
    let mut b0 = [0u8; 16];
    b0[0] = 0x49;
    b0[5] = dir as u8;
    b0[6..10].copy_from_slice(&dev_addr.to_le_bytes());
    b0[10..14].copy_from_slice(&fcnt.to_le_bytes());
    b0[15] = msg_len;
    b0
}

fn a_block(dir: Direction, dev_addr: u32, fcnt: u32, index: u8) -> [u8; 16] {
    let mut a = [0u8; 16];
    a[0] = 0x01;
    a[5] = dir as u8;
    a[6..10].copy_from_slice(&dev_addr.to_le_bytes());
    a[10..14].copy_from_slice(&fcnt.to_le_bytes());
    a[15] = index;
    a
}

/// Encrypts (or decrypts) a FRMPayload in place by XOR with the key stream
/// AES(key, A_i)
pub fn crypt_frm_payload<B: CryptoBackend>(
    se: &mut SecureElement<B>,
    key: KeyIdentifier,
    dir: Direction,
    dev_addr: u32,
    fcnt: u32,
    payload: &mut [u8],
) -> Result<()> {
    for (i, chunk) in payload.chunks_mut(16).enumerate() {
        let a = a_block(dir, dev_addr, fcnt, i as u8 + 1);
        let stream = se.aes_encrypt(&a, key)?;
        for (byte, s) in chunk.iter_mut().zip(stream) {
            *byte ^= s;
        }
    }
    Ok(())
}

/// Uplink data frame under construction
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    pub mtype: MType,
    pub dev_addr: u32,
    /// Full 32-bit counter; the low 16 bits go on air
    pub fcnt: u32,
    pub f_port: u8,
    /// Application payload in clear
    pub payload: Vec<u8>,
}

impl FrameBuilder {
    pub fn new_uplink(confirmed: bool, dev_addr: u32, fcnt: u32, f_port: u8, payload: Vec<u8>) -> Self {
        Self {
            mtype: if confirmed {
                MType::ConfirmedDataUp
            } else {
                MType::UnconfirmedDataUp
            },
            dev_addr,
            fcnt,
            f_port,
            payload,
        }
    }

    /// Builds the PHY payload: FRMPayload encrypted with AppSKey, MIC
    /// computed with FNwkSIntKey over B0 | msg
    pub fn build<B: CryptoBackend>(&self, se: &mut SecureElement<B>) -> Result<Vec<u8>> {
        let mut frame = Vec::with_capacity(13 + self.payload.len());

        frame.push(self.mtype.mhdr());
        frame.extend_from_slice(&self.dev_addr.to_le_bytes());
        // FCtrl: ADR=0, ACK=0, FOptsLen=0
        frame.push(0x00);
        frame.extend_from_slice(&(self.fcnt as u16).to_le_bytes());

        if !self.payload.is_empty() {
            frame.push(self.f_port);
            let mut encrypted = self.payload.clone();
            let key = if self.f_port == 0 {
                KeyIdentifier::NwkSEncKey
            } else {
                KeyIdentifier::AppSKey
            };
            crypt_frm_payload(
                se,
                key,
                Direction::Uplink,
                self.dev_addr,
                self.fcnt,
                &mut encrypted,
            )?;
            frame.extend_from_slice(&encrypted);
        }

        let msg_len = u8::try_from(frame.len()).map_err(|_| SecureElementError::BufferSize)?;
        let b0 = b0_block(Direction::Uplink, self.dev_addr, self.fcnt, msg_len);
        let mic = se.compute_aes_cmac(Some(&b0), &frame, KeyIdentifier::FNwkSIntKey)?;
        frame.extend_from_slice(&mic.to_le_bytes());

        Ok(frame)
    }
}

/// Frame Control byte (FCtrl) for uplink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FCtrl {
    pub adr: bool,
    pub adr_ack_req: bool,
    pub ack: bool,
    pub class_b: bool,
    pub f_opts_len: u8,
}

/// Decoded LoRaWAN data frame
#[derive(Debug, Clone)]
pub struct DataFrame {
    pub mtype: MType,
    pub dev_addr: u32,
    pub fctrl: FCtrl,
    pub fcnt: u16,
    pub f_opts: Vec<u8>,
    pub f_port: Option<u8>,
    /// Still encrypted
    pub frm_payload: Vec<u8>,
    pub mic: u32,
}

impl DataFrame {
    /// Bytes the MIC covers
    pub fn mic_input_len(&self) -> usize {
        8 + self.f_opts.len() + self.f_port.map_or(0, |_| 1 + self.frm_payload.len())
    }
}

impl fmt::Display for DataFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} DevAddr={:08X} FCnt={} FPort={} Payload={} bytes MIC={:08X} ADR={}",
            self.mtype,
            self.dev_addr,
            self.fcnt,
            self.f_port.map(|p| p.to_string()).unwrap_or("-".to_string()),
            self.frm_payload.len(),
            self.mic,
            self.fctrl.adr,
        )
    }
}

/// Decode a data frame PHY payload
pub fn decode_data_frame(data: &[u8]) -> anyhow::Result<DataFrame> {
    if data.is_empty() {
        return Err(anyhow::anyhow!("Empty PHY payload"));
    }
    let mtype = MType::from(data[0]);
    if !matches!(
        mtype,
        MType::UnconfirmedDataUp
            | MType::UnconfirmedDataDown
            | MType::ConfirmedDataUp
            | MType::ConfirmedDataDown
    ) {
        return Err(anyhow::anyhow!("{} is not a data frame", mtype));
    }

    // Minimum: MHDR(1) + DevAddr(4) + FCtrl(1) + FCnt(2) + MIC(4) = 12 bytes
    if data.len() < 12 {
        return Err(anyhow::anyhow!(
            "Data frame too short: {} bytes (minimum 12)",
            data.len()
        ));
    }

    let dev_addr = u32::from_le_bytes(data[1..5].try_into()?);

    let fctrl_byte = data[5];
    let fctrl = FCtrl {
        adr: (fctrl_byte & 0x80) != 0,
        adr_ack_req: (fctrl_byte & 0x40) != 0,
        ack: (fctrl_byte & 0x20) != 0,
        class_b: (fctrl_byte & 0x10) != 0,
        f_opts_len: fctrl_byte & 0x0F,
    };

    let fcnt = u16::from_le_bytes(data[6..8].try_into()?);

    let f_opts_end = 8 + fctrl.f_opts_len as usize;
    if f_opts_end > data.len() - 4 {
        return Err(anyhow::anyhow!(
            "FOpts length {} exceeds available data",
            fctrl.f_opts_len
        ));
    }
    let f_opts = data[8..f_opts_end].to_vec();

    let mic_start = data.len() - 4;
    let (f_port, frm_payload) = if f_opts_end < mic_start {
        (Some(data[f_opts_end]), data[f_opts_end + 1..mic_start].to_vec())
    } else {
        (None, vec![])
    };

    let mic = u32::from_le_bytes(data[mic_start..].try_into()?);

    Ok(DataFrame {
        mtype,
        dev_addr,
        fctrl,
        fcnt,
        f_opts,
        f_port,
        frm_payload,
        mic,
    })
}
