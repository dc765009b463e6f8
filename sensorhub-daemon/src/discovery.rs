//! LAN discovery: the coordinator multicasts a beacon with its transport port and public key,
//! and answers a node's probe beacon directly.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use sensorhub_core::protocol::COORDINATOR_ID;
use sensorhub_core::{decode_frame, encode_frame, Keypair, Message, Payload, PROTOCOL_VERSION};
use tokio::net::UdpSocket;
use tracing::{debug, info};

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 60);
const BEACON_INTERVAL: Duration = Duration::from_secs(4);

pub async fn run_discovery(
    keypair: Arc<Keypair>,
    discovery_port: u16,
    transport_port: u16,
) -> std::io::Result<()> {
    let socket = Arc::new(make_multicast_socket(discovery_port).await?);
    let frame = beacon_frame(&keypair, transport_port, crate::now_ms())?;
    info!(discovery_port, transport_port, "discovery beacon started");

    let send_socket = socket.clone();
    let send_frame = frame.clone();
    let beacon_task = tokio::spawn(async move { beacon_loop(send_socket, send_frame, discovery_port).await });
    let recv_task = tokio::spawn(async move { recv_loop(socket, frame).await });

    tokio::select! {
        res = beacon_task => res.map_err(std::io::Error::other)?,
        res = recv_task => res.map_err(std::io::Error::other)?,
    }
}

async fn make_multicast_socket(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

pub(crate) fn beacon_frame(
    keypair: &Keypair,
    transport_port: u16,
    now: i64,
) -> std::io::Result<Vec<u8>> {
    let beacon = Message::from_coordinator(
        now,
        Payload::Beacon {
            protocol_version: PROTOCOL_VERSION,
            public_key: keypair.public_key().to_hex(),
            listen_port: transport_port,
        },
    );
    encode_frame(&beacon).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

async fn beacon_loop(
    socket: Arc<UdpSocket>,
    frame: Vec<u8>,
    discovery_port: u16,
) -> std::io::Result<()> {
    let dest = SocketAddr::from((MULTICAST_GROUP, discovery_port));
    loop {
        if let Err(e) = socket.send_to(&frame, dest).await {
            debug!(error = %e, "beacon send failed");
        }
        tokio::time::sleep(BEACON_INTERVAL).await;
    }
}

async fn recv_loop(socket: Arc<UdpSocket>, frame: Vec<u8>) -> std::io::Result<()> {
    let mut buf = vec![0u8; 65536];
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        if is_probe(&buf[..n]) {
            debug!(%from, "answering discovery probe");
            let _ = socket.send_to(&frame, from).await;
        }
    }
}

/// A beacon of our protocol version sent by something other than a coordinator.
fn is_probe(datagram: &[u8]) -> bool {
    match decode_frame(datagram) {
        Ok((msg, _)) => {
            msg.device_id != COORDINATOR_ID
                && matches!(msg.body, Payload::Beacon { protocol_version, .. } if protocol_version == PROTOCOL_VERSION)
        }
        Err(_) => false,
    }
}
