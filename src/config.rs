use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::lorawan::Version;
use crate::secure_element::BackendKind;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub device: DeviceConfig,
    pub keys: KeysConfig,
    pub secure_element: SecureElementConfig,
    pub link: LinkConfig,
    #[serde(default)]
    pub package: PackageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct DeviceConfig {
    pub dev_eui: String,
    pub join_eui: String,
    /// e.g. "1.0.4"
    pub lorawan_version: String,
    /// ABP device address, hex
    pub dev_addr: String,
}

/// Root and ABP session keys, 16 bytes of hex each
#[derive(Debug, Deserialize)]
pub struct KeysConfig {
    pub app_key: String,
    pub gen_app_key: String,
    pub nwk_key: String,
    pub app_s_key: String,
    pub nwk_s_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendChoice {
    Software,
    Hardware,
}

impl From<BackendChoice> for BackendKind {
    fn from(choice: BackendChoice) -> Self {
        match choice {
            BackendChoice::Software => BackendKind::Software,
            BackendChoice::Hardware => BackendKind::Hardware,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SecureElementConfig {
    pub backend: BackendChoice,
    pub nvm_path: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct LinkConfig {
    /// Local address the device listens on for downlinks
    pub bind: String,
    /// Where uplinks go
    pub peer: String,
}

/// Largest FRMPayload an uplink carries
pub const MAX_APP_PAYLOAD: usize = 242;

#[derive(Debug, Deserialize)]
pub struct PackageConfig {
    /// Answer buffer, at most [`MAX_APP_PAYLOAD`] bytes
    pub buffer_size: usize,
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self {
            buffer_size: MAX_APP_PAYLOAD,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config file")?;
        // Fail at load time rather than halfway through start-up
        config.device.version()?;
        config.device.eui_pair()?;
        config.device.address()?;
        config.keys.decode()?;
        if config.package.buffer_size > MAX_APP_PAYLOAD {
            anyhow::bail!(
                "package.buffer_size {} exceeds the {} byte uplink payload",
                config.package.buffer_size,
                MAX_APP_PAYLOAD
            );
        }
        Ok(config)
    }
}

impl DeviceConfig {
    pub fn version(&self) -> anyhow::Result<Version> {
        self.lorawan_version.parse()
    }

    /// (DevEUI, JoinEUI)
    pub fn eui_pair(&self) -> anyhow::Result<([u8; 8], [u8; 8])> {
        Ok((
            parse_hex("device.dev_eui", &self.dev_eui)?,
            parse_hex("device.join_eui", &self.join_eui)?,
        ))
    }

    pub fn address(&self) -> anyhow::Result<u32> {
        u32::from_str_radix(self.dev_addr.trim_start_matches("0x"), 16)
            .with_context(|| format!("Invalid device.dev_addr {:?}", self.dev_addr))
    }
}

/// Decoded key material
#[derive(Clone, Copy)]
pub struct Keys {
    pub app_key: [u8; 16],
    pub gen_app_key: [u8; 16],
    pub nwk_key: [u8; 16],
    pub app_s_key: [u8; 16],
    pub nwk_s_key: [u8; 16],
}

impl KeysConfig {
    pub fn decode(&self) -> anyhow::Result<Keys> {
        Ok(Keys {
            app_key: parse_hex("keys.app_key", &self.app_key)?,
            gen_app_key: parse_hex("keys.gen_app_key", &self.gen_app_key)?,
            nwk_key: parse_hex("keys.nwk_key", &self.nwk_key)?,
            app_s_key: parse_hex("keys.app_s_key", &self.app_s_key)?,
            nwk_s_key: parse_hex("keys.nwk_s_key", &self.nwk_s_key)?,
        })
    }
}

impl SecureElementConfig {
    /// Blob layouts differ per backend, so each one gets its own file
    pub fn nvm_file(&self) -> PathBuf {
        let kind = BackendKind::from(self.backend).to_string();
        let mut name = self.nvm_path.as_os_str().to_owned();
        name.push(".");
        name.push(kind);
        PathBuf::from(name)
    }
}

/// Decodes a fixed-size hex field, accepting `:` or `-` separators
pub fn parse_hex<const N: usize>(field: &str, value: &str) -> anyhow::Result<[u8; N]> {
    let cleaned: String = value.chars().filter(|c| *c != ':' && *c != '-').collect();
    let bytes = hex::decode(&cleaned).with_context(|| format!("Invalid hex in {}", field))?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        anyhow::anyhow!("{} must be {} bytes, got {}", field, N, b.len())
    })
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: DeviceConfig {
                dev_eui: "0000000000000001".to_string(),
                join_eui: "0000000000000000".to_string(),
                lorawan_version: "1.0.4".to_string(),
                dev_addr: "26011F00".to_string(),
            },
            keys: KeysConfig {
                app_key: "2B7E151628AED2A6ABF7158809CF4F3C".to_string(),
                gen_app_key: "2B7E151628AED2A6ABF7158809CF4F3C".to_string(),
                nwk_key: "2B7E151628AED2A6ABF7158809CF4F3C".to_string(),
                app_s_key: "2B7E151628AED2A6ABF7158809CF4F3C".to_string(),
                nwk_s_key: "2B7E151628AED2A6ABF7158809CF4F3C".to_string(),
            },
            secure_element: SecureElementConfig {
                backend: BackendChoice::Software,
                nvm_path: PathBuf::from("lora-se.nvm"),
            },
            link: LinkConfig {
                bind: "127.0.0.1:1700".to_string(),
                peer: "127.0.0.1:1701".to_string(),
            },
            package: PackageConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}
