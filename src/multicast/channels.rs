//! Multicast channel configuration toward the MAC layer

use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, info};

use crate::locked;
use crate::lorawan::{DeviceClass, GroupId, McRxParams, Version, LORAMAC_MAX_MC_CTX};
use crate::secure_element::{CryptoBackend, KeyIdentifier, SecureElement, SecureElementError};

/// Status bits of a rejected class C session
pub const STATUS_DR_ERROR: u8 = 0x04;
pub const STATUS_FREQ_ERROR: u8 = 0x08;
pub const STATUS_GROUP_UNDEFINED: u8 = 0x10;

/// Multicast channel descriptor handed to [`MulticastChannels::setup`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McChannelParams {
    /// Not used by the setup itself
    pub class: DeviceClass,
    pub is_enabled: bool,
    pub group: GroupId,
    pub address: u32,
    /// McKey encrypted under McKEKey, as received
    pub mc_key_encrypted: [u8; 16],
    pub fcount_min: u32,
    pub fcount_max: u32,
    /// Not used by the setup itself
    pub rx_params: McRxParams,
}

#[derive(Debug, Error)]
pub enum McChannelError {
    #[error("multicast group {0} is not defined")]
    Undefined(GroupId),

    #[error("multicast key setup failed: {0}")]
    Keys(#[from] SecureElementError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("multicast rx parameters rejected (status 0x{status:02X})")]
pub struct RxParamsRejected {
    pub status: u8,
}

/// Multicast channel capability of the MAC layer
pub trait MulticastChannels: Send {
    fn setup(&mut self, channel: &McChannelParams) -> Result<(), McChannelError>;

    fn delete(&mut self, group: GroupId) -> Result<(), McChannelError>;

    /// Sets the class C receive parameters of a defined group. Answers the
    /// session status byte: the group id, plus error bits on rejection.
    fn setup_rx_params(&mut self, group: GroupId, rx: McRxParams) -> Result<u8, RxParamsRejected>;
}

/// Receive parameters the region accepts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxLimits {
    pub frequency: RangeInclusive<u32>,
    pub max_datarate: u8,
}

impl Default for RxLimits {
    /// EU868
    fn default() -> Self {
        Self {
            frequency: 863_000_000..=870_000_000,
            max_datarate: 7,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct McChannel {
    pub enabled: bool,
    pub address: u32,
    pub fcount_min: u32,
    pub fcount_max: u32,
    pub rx: McRxParams,
}

/// Multicast channel table whose session keys live in the secure element
pub struct SecureElementChannels<B: CryptoBackend> {
    se: Arc<Mutex<SecureElement<B>>>,
    version: Version,
    limits: RxLimits,
    channels: [McChannel; LORAMAC_MAX_MC_CTX],
}

impl<B: CryptoBackend> SecureElementChannels<B> {
    pub fn new(se: Arc<Mutex<SecureElement<B>>>, version: Version, limits: RxLimits) -> Self {
        Self {
            se,
            version,
            limits,
            channels: [McChannel::default(); LORAMAC_MAX_MC_CTX],
        }
    }

    pub fn channel(&self, group: GroupId) -> &McChannel {
        &self.channels[group.index()]
    }
}

impl<B: CryptoBackend> MulticastChannels for SecureElementChannels<B> {
    fn setup(&mut self, channel: &McChannelParams) -> Result<(), McChannelError> {
        let group = channel.group;
        {
            let mut se = locked(&self.se);
            se.set_key(KeyIdentifier::mc_key(group), &channel.mc_key_encrypted)?;
            derive_mc_session_keys(&mut se, self.version, group, channel.address)?;
        }
        self.channels[group.index()] = McChannel {
            enabled: channel.is_enabled,
            address: channel.address,
            fcount_min: channel.fcount_min,
            fcount_max: channel.fcount_max,
            rx: McRxParams::default(),
        };
        info!(
            "Multicast group {} set up: addr={:08X} fcnt={}..={}",
            group, channel.address, channel.fcount_min, channel.fcount_max
        );
        Ok(())
    }

    fn delete(&mut self, group: GroupId) -> Result<(), McChannelError> {
        let slot = &mut self.channels[group.index()];
        if !slot.enabled {
            return Err(McChannelError::Undefined(group));
        }
        *slot = McChannel::default();
        info!("Multicast group {} deleted", group);
        Ok(())
    }

    fn setup_rx_params(&mut self, group: GroupId, rx: McRxParams) -> Result<u8, RxParamsRejected> {
        let slot = &mut self.channels[group.index()];
        if !slot.enabled {
            return Err(RxParamsRejected {
                status: STATUS_GROUP_UNDEFINED | group.value(),
            });
        }
        let mut status = group.value();
        if rx.datarate > self.limits.max_datarate {
            status |= STATUS_DR_ERROR;
        }
        if !self.limits.frequency.contains(&rx.frequency) {
            status |= STATUS_FREQ_ERROR;
        }
        if status & (STATUS_DR_ERROR | STATUS_FREQ_ERROR) != 0 {
            return Err(RxParamsRejected { status });
        }
        slot.rx = rx;
        debug!(
            "Multicast group {} rx: {} Hz DR{}",
            group, rx.frequency, rx.datarate
        );
        Ok(status)
    }
}

/// McAppSKey = AES(McKey, 0x01 | McAddr | pad), McNwkSKey = AES(McKey, 0x02 | McAddr | pad)
fn derive_mc_session_keys<B: CryptoBackend>(
    se: &mut SecureElement<B>,
    version: Version,
    group: GroupId,
    address: u32,
) -> Result<(), SecureElementError> {
    let mc_key = KeyIdentifier::mc_key(group);
    let mut input = [0u8; 16];
    input[1..5].copy_from_slice(&address.to_le_bytes());

    input[0] = 0x01;
    se.derive_and_store_key(version, &input, mc_key, KeyIdentifier::mc_app_s_key(group))?;
    input[0] = 0x02;
    se.derive_and_store_key(version, &input, mc_key, KeyIdentifier::mc_nwk_s_key(group))
}

/// Derives McRootKey and McKEKey from the root keys. LoRaWAN 1.0.x uses
/// GenAppKey; 1.1 uses AppKey with a 0x20 prefix.
pub fn derive_multicast_root_keys<B: CryptoBackend>(
    se: &mut SecureElement<B>,
    version: Version,
) -> Result<(), SecureElementError> {
    let mut input = [0u8; 16];
    let root = if version.minor >= 1 {
        input[0] = 0x20;
        KeyIdentifier::AppKey
    } else {
        KeyIdentifier::GenAppKey
    };
    se.derive_and_store_key(version, &input, root, KeyIdentifier::McRootKey)?;
    se.derive_and_store_key(
        version,
        &[0u8; 16],
        KeyIdentifier::McRootKey,
        KeyIdentifier::McKeKey,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secure_element::soft::aes_ecb_encrypt;
    use crate::secure_element::SoftBackend;

    const GEN_APP_KEY: [u8; 16] = [0x0B; 16];
    const V104: Version = Version::new(1, 0, 4);

    fn ecb(key: &[u8; 16], block: &[u8; 16]) -> [u8; 16] {
        let mut out = [0u8; 16];
        aes_ecb_encrypt(key, block, &mut out);
        out
    }

    fn channels() -> (SecureElementChannels<SoftBackend>, Arc<Mutex<SecureElement<SoftBackend>>>) {
        let mut se = SecureElement::init(SoftBackend::new(), None).unwrap();
        se.set_key(KeyIdentifier::GenAppKey, &GEN_APP_KEY).unwrap();
        derive_multicast_root_keys(&mut se, V104).unwrap();
        let se = Arc::new(Mutex::new(se));
        (SecureElementChannels::new(se.clone(), V104, RxLimits::default()), se)
    }

    fn params(group: u8, address: u32, key: [u8; 16]) -> McChannelParams {
        McChannelParams {
            class: DeviceClass::C,
            is_enabled: true,
            group: GroupId::from_masked(group),
            address,
            mc_key_encrypted: key,
            fcount_min: 0,
            fcount_max: u32::MAX,
            rx_params: McRxParams::default(),
        }
    }

    #[test]
    fn test_root_key_chain_1_0() {
        let (_, se) = channels();
        let se = se.lock().unwrap();
        let mc_root = ecb(&GEN_APP_KEY, &[0u8; 16]);
        assert_eq!(se.keys().lookup(KeyIdentifier::McRootKey).unwrap().0, mc_root);
        assert_eq!(
            se.keys().lookup(KeyIdentifier::McKeKey).unwrap().0,
            ecb(&mc_root, &[0u8; 16])
        );
    }

    #[test]
    fn test_root_key_chain_1_1_uses_app_key() {
        let mut se = SecureElement::init(SoftBackend::new(), None).unwrap();
        let app_key = [0x0A; 16];
        se.set_key(KeyIdentifier::AppKey, &app_key).unwrap();
        derive_multicast_root_keys(&mut se, Version::new(1, 1, 0)).unwrap();
        let mut block = [0u8; 16];
        block[0] = 0x20;
        assert_eq!(
            se.keys().lookup(KeyIdentifier::McRootKey).unwrap().0,
            ecb(&app_key, &block)
        );
    }

    #[test]
    fn test_setup_derives_session_keys() {
        let (mut channels, se) = channels();
        let encrypted = [0x5C; 16];
        channels.setup(&params(2, 0x01020304, encrypted)).unwrap();

        let se = se.lock().unwrap();
        let kek = se.keys().lookup(KeyIdentifier::McKeKey).unwrap().0;
        let mc_key = ecb(&kek, &encrypted);
        assert_eq!(se.keys().lookup(KeyIdentifier::McKey2).unwrap().0, mc_key);

        let mut block = [0u8; 16];
        block[0] = 0x01;
        block[1..5].copy_from_slice(&[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(
            se.keys().lookup(KeyIdentifier::McAppSKey2).unwrap().0,
            ecb(&mc_key, &block)
        );
        block[0] = 0x02;
        assert_eq!(
            se.keys().lookup(KeyIdentifier::McNwkSKey2).unwrap().0,
            ecb(&mc_key, &block)
        );
        assert!(channels.channel(GroupId::from_masked(2)).enabled);
    }

    #[test]
    fn test_delete_undefined_group_fails() {
        let (mut channels, _) = channels();
        let g1 = GroupId::from_masked(1);
        assert!(matches!(channels.delete(g1), Err(McChannelError::Undefined(_))));
        channels.setup(&params(1, 0xAABBCCDD, [0; 16])).unwrap();
        channels.delete(g1).unwrap();
        assert_eq!(*channels.channel(g1), McChannel::default());
    }

    #[test]
    fn test_rx_params_status_bits() {
        let (mut channels, _) = channels();
        let g3 = GroupId::from_masked(3);
        let good = McRxParams {
            frequency: 869_525_000,
            datarate: 0,
        };
        assert_eq!(
            channels.setup_rx_params(g3, good),
            Err(RxParamsRejected { status: 0x13 })
        );

        channels.setup(&params(3, 1, [0; 16])).unwrap();
        let bad = McRxParams {
            frequency: 915_000_000,
            datarate: 12,
        };
        assert_eq!(
            channels.setup_rx_params(g3, bad),
            Err(RxParamsRejected { status: 0x0F })
        );
        assert_eq!(channels.setup_rx_params(g3, good), Ok(0x03));
        assert_eq!(channels.channel(g3).rx, good);
    }
}
