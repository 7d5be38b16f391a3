//! Downlink Simulator
//!
//! Plays the network server side of a Remote Multicast Setup session against
//! a running `lora-se` device: package version, group setup, class C session
//! and group delete. Uplinks are decrypted with the device's AppSKey and the
//! answers printed.
//!
//! Usage: cargo run --bin downlink-sim -- [--device 127.0.0.1:1700]

use std::net::SocketAddr;

use anyhow::Context;
use bytes::BytesMut;
use clap::Parser;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Duration};

use lora_se::config::parse_hex;
use lora_se::lorawan::frame::{crypt_frm_payload, decode_data_frame, Direction};
use lora_se::lorawan::GroupId;
use lora_se::multicast::{Answer, CommandError, Request, REMOTE_MCAST_SETUP_PORT};
use lora_se::package::UtcClock;
use lora_se::secure_element::{KeyIdentifier, SecureElement, SoftBackend};
use lora_se::udp::protocol::{Downlink, MAX_DATAGRAM_SIZE};

#[derive(Parser)]
#[command(name = "downlink-sim")]
#[command(about = "Scripted Remote Multicast Setup session against a lora-se device")]
struct Cli {
    /// Device link address
    #[arg(long, default_value = "127.0.0.1:1700")]
    device: SocketAddr,

    /// Local address; must match the device's link.peer
    #[arg(long, default_value = "127.0.0.1:1701")]
    bind: SocketAddr,

    /// AppSKey of the device, hex
    #[arg(long, default_value = "2B7E151628AED2A6ABF7158809CF4F3C")]
    app_s_key: String,

    /// Multicast group to set up
    #[arg(long, default_value_t = 0)]
    group: u8,

    /// Multicast address of the group, hex
    #[arg(long, default_value = "01FFEE00")]
    mc_addr: String,

    /// McKey encrypted under McKEKey, hex
    #[arg(long, default_value = "0102030405060708090A0B0C0D0E0F10")]
    mc_key: String,

    /// Seconds from now until the class C session starts
    #[arg(long, default_value_t = 5)]
    start_in: u32,

    /// Session lasts 2^timeout seconds
    #[arg(long, default_value_t = 2)]
    timeout: u8,

    /// Class C frequency in Hz
    #[arg(long, default_value_t = 869_525_000)]
    frequency: u32,

    #[arg(long, default_value_t = 0)]
    datarate: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let group = GroupId::from_masked(cli.group);
    let address = u32::from_str_radix(&cli.mc_addr, 16).context("Invalid --mc-addr")?;
    let mc_key_encrypted: [u8; 16] = parse_hex("--mc-key", &cli.mc_key)?;
    let app_s_key: [u8; 16] = parse_hex("--app-s-key", &cli.app_s_key)?;

    println!("LoRa SE Downlink Simulator");
    println!("  Device: {}", cli.device);
    println!("  Group: {} addr={:08X}", group, address);
    println!();

    let socket = UdpSocket::bind(cli.bind)
        .await
        .with_context(|| format!("Failed to bind {}", cli.bind))?;

    // Only used to decrypt uplinks
    let mut se = SecureElement::init(SoftBackend::new(), None)?;
    se.set_key(KeyIdentifier::AppSKey, &app_s_key)?;

    let session_time = UtcClock.gps_seconds().wrapping_add(cli.start_in);
    let scenarios = vec![
        ("Package version", vec![Request::PackageVersion]),
        (
            "Group setup",
            vec![Request::GroupSetup {
                group,
                address,
                mc_key_encrypted,
                fcount_min: 0,
                fcount_max: u32::MAX,
            }],
        ),
        (
            "Class C session",
            vec![Request::ClassCSession {
                group,
                session_time,
                timeout: cli.timeout,
                frequency: cli.frequency,
                datarate: cli.datarate,
            }],
        ),
    ];

    for (desc, requests) in &scenarios {
        exchange(&socket, cli.device, &mut se, desc, requests).await?;
    }

    let session_secs = cli.start_in + (1u32 << (cli.timeout & 0x0F));
    println!("Waiting {} s for the session to run", session_secs);
    tokio::time::sleep(Duration::from_secs(u64::from(session_secs))).await;

    exchange(
        &socket,
        cli.device,
        &mut se,
        "Group delete",
        &[Request::GroupDelete { group }],
    )
    .await?;

    println!("Simulation complete!");
    Ok(())
}

async fn exchange(
    socket: &UdpSocket,
    device: SocketAddr,
    se: &mut SecureElement<SoftBackend>,
    desc: &str,
    requests: &[Request],
) -> anyhow::Result<()> {
    let mut payload = BytesMut::new();
    for request in requests {
        request.encode(&mut payload);
    }
    println!("Sending: {}", desc);
    for request in requests {
        println!("   {}", request);
    }
    let datagram = Downlink::new(REMOTE_MCAST_SETUP_PORT, payload.to_vec()).encode();
    socket.send_to(&datagram, device).await?;

    // A group setup also triggers a DeviceTimeReq, so drain until quiet
    let mut buf = [0u8; MAX_DATAGRAM_SIZE];
    loop {
        match timeout(Duration::from_secs(2), socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) => print_uplink(se, &buf[..len], from),
            Ok(Err(e)) => println!("   Recv error: {}", e),
            Err(_) => break,
        }
    }
    println!();
    Ok(())
}

fn print_uplink(se: &mut SecureElement<SoftBackend>, data: &[u8], from: SocketAddr) {
    let frame = match decode_data_frame(data) {
        Ok(frame) => frame,
        Err(e) => {
            println!("   Undecodable uplink from {}: {}", from, e);
            return;
        }
    };
    println!("   Uplink: {}", frame);

    match frame.f_port {
        Some(REMOTE_MCAST_SETUP_PORT) => {}
        Some(0) => {
            println!("   MAC commands (encrypted with NwkSEncKey)");
            return;
        }
        other => {
            println!("   Not a multicast setup answer (FPort {:?})", other);
            return;
        }
    }

    let mut payload = frame.frm_payload.clone();
    if let Err(e) = crypt_frm_payload(
        se,
        KeyIdentifier::AppSKey,
        Direction::Uplink,
        frame.dev_addr,
        u32::from(frame.fcnt),
        &mut payload,
    ) {
        println!("   Failed to decrypt: {}", e);
        return;
    }

    let mut answers = &payload[..];
    loop {
        match Answer::parse(&mut answers) {
            Ok(answer) => println!("   {}", answer),
            Err(CommandError::Empty) => break,
            Err(e) => {
                println!("   Malformed answer: {} ({})", e, hex::encode(answers));
                break;
            }
        }
    }
}
