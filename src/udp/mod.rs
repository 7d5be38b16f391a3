pub mod protocol;

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::device::{Device, Uplink};
use crate::secure_element::CryptoBackend;
use protocol::{Downlink, MAX_DATAGRAM_SIZE};

/// Longest the loop sleeps when no timer is armed
const IDLE_POLL: Duration = Duration::from_secs(1);

/// Run the device against a downlink simulator
///
/// Downlink datagrams from `peer` are handed to the packages; queued uplinks
/// are framed and sent back to `peer`. The timer service follows the tokio
/// clock. Returns once `shutdown` completes.
pub async fn run_device<B: CryptoBackend + 'static>(
    socket: UdpSocket,
    peer: SocketAddr,
    mut device: Device<B>,
    mut uplinks: mpsc::UnboundedReceiver<Uplink>,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<Device<B>> {
    info!("Device link on {}, peer {}", socket.local_addr()?, peer);

    let started = Instant::now();
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    tokio::pin!(shutdown);

    loop {
        let wait = device
            .time_to_alarm()
            .map(|ms| Duration::from_millis(u64::from(ms)))
            .unwrap_or(IDLE_POLL)
            .min(IDLE_POLL);

        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (len, src) = received?;
                if src != peer {
                    debug!("Ignoring {} bytes from {}", len, src);
                } else {
                    handle_datagram(&mut device, &buf[..len]);
                }
            }
            Some(uplink) = uplinks.recv() => {
                send_uplink(&socket, peer, &mut device, &uplink).await;
            }
            _ = tokio::time::sleep(wait) => {}
            _ = &mut shutdown => {
                info!("Shutting down device link");
                break;
            }
        }

        device.advance_to(elapsed_ms(started));
        device.process();
    }

    // Answers already queued still go out
    while let Ok(uplink) = uplinks.try_recv() {
        send_uplink(&socket, peer, &mut device, &uplink).await;
    }
    device.persist_if_dirty()?;
    Ok(device)
}

fn handle_datagram<B: CryptoBackend + 'static>(device: &mut Device<B>, data: &[u8]) {
    match Downlink::parse(data) {
        Ok(downlink) => {
            info!(
                "Downlink FPort={} ({} bytes): {}",
                downlink.f_port,
                downlink.payload.len(),
                hex::encode(&downlink.payload)
            );
            device.on_downlink(downlink.f_port, downlink.payload);
        }
        Err(e) => warn!("Failed to parse downlink datagram: {}", e),
    }
}

async fn send_uplink<B: CryptoBackend + 'static>(
    socket: &UdpSocket,
    peer: SocketAddr,
    device: &mut Device<B>,
    uplink: &Uplink,
) {
    let frame = match device.build_uplink(uplink) {
        Ok(frame) => frame,
        Err(e) => {
            error!("Failed to build uplink on port {}: {}", uplink.data.port, e);
            return;
        }
    };
    if let Err(e) = socket.send_to(&frame, peer).await {
        error!("Failed to send uplink to {}: {}", peer, e);
    }
}

fn elapsed_ms(since: Instant) -> u32 {
    since.elapsed().as_millis() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{change_flag, DeviceSettings};
    use crate::lorawan::frame::decode_data_frame;
    use crate::lorawan::Version;
    use crate::multicast::{RxLimits, REMOTE_MCAST_SETUP_PORT};
    use crate::secure_element::{KeyIdentifier, SecureElement, SoftBackend};
    use tokio::sync::oneshot;

    fn device() -> (Device<SoftBackend>, mpsc::UnboundedReceiver<Uplink>) {
        let (dirty, notify) = change_flag();
        let mut se = SecureElement::init(SoftBackend::new(), Some(notify)).unwrap();
        se.set_key(KeyIdentifier::AppSKey, &[0x01; 16]).unwrap();
        se.set_key(KeyIdentifier::FNwkSIntKey, &[0x02; 16]).unwrap();
        let settings = DeviceSettings {
            version: Version::new(1, 0, 4),
            dev_addr: 0x26000001,
            buffer_size: 242,
            nvm_file: None,
            rx_limits: RxLimits::default(),
        };
        Device::new(se, dirty, settings)
    }

    #[tokio::test]
    async fn test_version_request_answered_over_udp() {
        let sim = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let link = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let link_addr = link.local_addr().unwrap();
        let (device, uplinks) = device();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(run_device(
            link,
            sim.local_addr().unwrap(),
            device,
            uplinks,
            async {
                let _ = stop_rx.await;
            },
        ));

        let request = Downlink::new(REMOTE_MCAST_SETUP_PORT, vec![0x00]).encode();
        sim.send_to(&request, link_addr).await.unwrap();

        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), sim.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let frame = decode_data_frame(&buf[..len]).unwrap();
        assert_eq!(frame.f_port, Some(REMOTE_MCAST_SETUP_PORT));
        assert_eq!(frame.dev_addr, 0x26000001);
        assert_eq!(frame.frm_payload.len(), 3);

        stop_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_foreign_sender_ignored() {
        let sim = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let link = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let link_addr = link.local_addr().unwrap();
        let (device, uplinks) = device();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(run_device(
            link,
            sim.local_addr().unwrap(),
            device,
            uplinks,
            async {
                let _ = stop_rx.await;
            },
        ));

        let request = Downlink::new(REMOTE_MCAST_SETUP_PORT, vec![0x00]).encode();
        stranger.send_to(&request, link_addr).await.unwrap();

        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let answer =
            tokio::time::timeout(Duration::from_millis(300), sim.recv_from(&mut buf)).await;
        assert!(answer.is_err());

        stop_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }
}
