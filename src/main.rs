use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::UdpSocket;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lora_se::config::{BackendChoice, Config};
use lora_se::device::{self, Device, DeviceSettings};
use lora_se::multicast::{derive_multicast_root_keys, RxLimits};
use lora_se::pkcs11::EmulatedToken;
use lora_se::secure_element::{
    BackendKind, CryptoBackend, HsmBackend, KeyIdentifier, SecureElement, SoftBackend,
};
use lora_se::udp;

#[derive(Parser)]
#[command(name = "lora-se")]
#[command(about = "LoRaWAN end device with a secure element and remote multicast setup")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Warning: Failed to load config from {:?}: {:#}", cli.config, e);
        eprintln!("Using default configuration");
        Config::default()
    });

    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!("lora-se v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "LoRaWAN {} device, {} secure element",
        config.device.lorawan_version,
        BackendKind::from(config.secure_element.backend)
    );

    // The backend is fixed for the lifetime of the process
    match config.secure_element.backend {
        BackendChoice::Software => run(SoftBackend::new(), &config).await,
        BackendChoice::Hardware => run(HsmBackend::new(EmulatedToken::new()), &config).await,
    }
}

async fn run<B: CryptoBackend + 'static>(backend: B, config: &Config) -> anyhow::Result<()> {
    let version = config.device.version()?;
    let (dev_eui, join_eui) = config.device.eui_pair()?;
    let keys = config.keys.decode()?;

    let (dirty, notify) = device::change_flag();
    let mut se = SecureElement::init(backend, Some(notify))
        .context("Secure element failed to start, halting")?;

    let nvm_file = config.secure_element.nvm_file();
    match device::load_nvm(&mut se, &nvm_file) {
        Ok(true) => {}
        Ok(false) => info!("No NVM context at {:?}, starting fresh", nvm_file),
        Err(e) => warn!("{:#}, starting fresh", e),
    }

    se.set_dev_eui(dev_eui);
    se.set_join_eui(join_eui);

    // Root keys and the ABP session come from the configuration
    let provisioned = [
        (KeyIdentifier::AppKey, keys.app_key),
        (KeyIdentifier::GenAppKey, keys.gen_app_key),
        (KeyIdentifier::NwkKey, keys.nwk_key),
        (KeyIdentifier::AppSKey, keys.app_s_key),
        (KeyIdentifier::FNwkSIntKey, keys.nwk_s_key),
        (KeyIdentifier::SNwkSIntKey, keys.nwk_s_key),
        (KeyIdentifier::NwkSEncKey, keys.nwk_s_key),
    ];
    for (id, key) in &provisioned {
        se.provision_key(*id, key)
            .with_context(|| format!("Failed to provision {}", id))?;
    }
    derive_multicast_root_keys(&mut se, version)
        .context("Failed to derive multicast root keys")?;

    let settings = DeviceSettings {
        version,
        dev_addr: config.device.address()?,
        buffer_size: config.package.buffer_size,
        nvm_file: Some(nvm_file),
        rx_limits: RxLimits::default(),
    };
    let (device, uplinks) = Device::new(se, dirty, settings);

    let socket = UdpSocket::bind(&config.link.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.link.bind))?;
    let peer: SocketAddr = config
        .link
        .peer
        .parse()
        .with_context(|| format!("Invalid link.peer {:?}", config.link.peer))?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };
    let device = udp::run_device(socket, peer, device, uplinks, shutdown).await?;
    info!("Stopped in class {}", device.class());
    Ok(())
}
