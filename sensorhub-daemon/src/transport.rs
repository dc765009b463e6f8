//! Node transport: TCP listener, plaintext X25519 handshake, then length-prefixed
//! ChaCha20-Poly1305 frames. One reader loop and one writer task per connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sensorhub_core::identity::{decrypt_wire, encrypt_wire, HANDSHAKE_HEADER_SIZE};
use sensorhub_core::protocol::COORDINATOR_ID;
use sensorhub_core::wire::{LEN_SIZE, MAX_FRAME_LEN};
use sensorhub_core::{Coordinator, CoordinatorEvent, Handshake, Keypair, OutboundAction};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex, Notify};
use tracing::{debug, info, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
/// ChaCha20-Poly1305 tag appended to every frame.
const TAG_LEN: usize = 16;

pub type SharedCoordinator = Arc<Mutex<Coordinator>>;

struct Channel {
    conn: u64,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    close: Arc<Notify>,
}

/// Routes coordinator actions to connection writers and event subscribers.
#[derive(Clone)]
pub struct Hub {
    core: SharedCoordinator,
    channels: Arc<Mutex<HashMap<String, Channel>>>,
    events: broadcast::Sender<CoordinatorEvent>,
    next_conn: Arc<AtomicU64>,
}

impl Hub {
    pub fn new(core: SharedCoordinator, events: broadcast::Sender<CoordinatorEvent>) -> Self {
        Self {
            core,
            channels: Arc::new(Mutex::new(HashMap::new())),
            events,
            next_conn: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn core(&self) -> &SharedCoordinator {
        &self.core
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    /// Execute actions. Never called with the coordinator lock held.
    pub async fn dispatch(&self, actions: Vec<OutboundAction>) {
        if actions.is_empty() {
            return;
        }
        let channels = self.channels.lock().await;
        for action in actions {
            match action {
                OutboundAction::SendMessage(device_id, body) => match channels.get(&device_id) {
                    Some(ch) => {
                        if ch.tx.send(body).is_err() {
                            debug!(device_id = %device_id, "writer gone, message dropped");
                        }
                    }
                    None => debug!(device_id = %device_id, "no channel, message dropped"),
                },
                OutboundAction::Disconnect(device_id) => {
                    if let Some(ch) = channels.get(&device_id) {
                        info!(device_id = %device_id, "closing channel");
                        ch.close.notify_one();
                    }
                }
                OutboundAction::Event(event) => {
                    // No subscribers is fine.
                    let _ = self.events.send(event);
                }
            }
        }
    }

    /// Register a writer for `device_id`, closing any older channel for the same device.
    async fn attach(
        &self,
        device_id: &str,
    ) -> (u64, mpsc::UnboundedReceiver<Vec<u8>>, Arc<Notify>) {
        let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let close = Arc::new(Notify::new());
        let old = self.channels.lock().await.insert(
            device_id.to_string(),
            Channel {
                conn,
                tx,
                close: close.clone(),
            },
        );
        if let Some(old) = old {
            info!(device_id, "replacing existing channel");
            old.close.notify_one();
        }
        (conn, rx, close)
    }

    /// Remove the writer if it still belongs to `conn`. Returns false when a newer
    /// connection for the same device has taken over.
    async fn detach(&self, device_id: &str, conn: u64) -> bool {
        let mut channels = self.channels.lock().await;
        match channels.get(device_id) {
            Some(ch) if ch.conn == conn => {
                channels.remove(device_id);
                true
            }
            _ => false,
        }
    }

    pub async fn connected(&self) -> usize {
        self.channels.lock().await.len()
    }
}

/// Accept node connections forever.
pub async fn run_transport(hub: Hub, keypair: Arc<Keypair>, port: u16) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "transport listening");
    loop {
        let (stream, addr) = listener.accept().await?;
        let hub = hub.clone();
        let keypair = keypair.clone();
        tokio::spawn(async move {
            if let Err(e) = run_connection(hub, keypair, stream, addr).await {
                debug!(%addr, error = %e, "connection ended");
            }
        });
    }
}

/// Read the node's handshake, reply with ours. Returns the node's identity.
pub(crate) async fn handshake_accept<S>(
    stream: &mut S,
    keypair: &Keypair,
) -> std::io::Result<Handshake>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; HANDSHAKE_HEADER_SIZE];
    stream.read_exact(&mut header).await?;
    let header = Handshake::decode_header(&header).map_err(invalid_data)?;
    let mut id = vec![0u8; header.id_len];
    stream.read_exact(&mut id).await?;
    let peer = Handshake::from_parts(header, &id).map_err(invalid_data)?;
    if peer.device_id == COORDINATOR_ID {
        return Err(invalid_data("reserved device id"));
    }
    let ours = Handshake::new(keypair.public_key().clone(), COORDINATOR_ID)
        .encode()
        .map_err(invalid_data)?;
    stream.write_all(&ours).await?;
    Ok(peer)
}

async fn run_connection(
    hub: Hub,
    keypair: Arc<Keypair>,
    mut stream: TcpStream,
    addr: SocketAddr,
) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let peer = tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake_accept(&mut stream, &keypair))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "handshake timed out"))??;
    let device_id = peer.device_id;
    let keys = keypair.session_keys(&peer.public_key);
    let send_key = keys.send;
    info!(device_id = %device_id, %addr, "channel established");

    let (conn, mut rx, close) = hub.attach(&device_id).await;
    let actions = hub
        .core
        .lock()
        .await
        .on_connection_opened(&device_id, crate::now_ms());
    hub.dispatch(actions).await;

    let (mut reader, mut writer) = stream.into_split();
    let writer_id = device_id.clone();
    let writer_task = tokio::spawn(async move {
        let mut nonce = 0u64;
        while let Some(body) = rx.recv().await {
            let sealed = match encrypt_wire(&send_key, nonce, &body) {
                Ok(c) => c,
                Err(e) => {
                    warn!(device_id = %writer_id, error = %e, "encrypt failed");
                    break;
                }
            };
            nonce += 1;
            if let Err(e) = write_frame(&mut writer, &sealed).await {
                debug!(device_id = %writer_id, error = %e, "write failed");
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut recv_nonce = 0u64;
    loop {
        let sealed = tokio::select! {
            _ = close.notified() => break,
            res = read_frame(&mut reader) => match res {
                Ok(Some(f)) => f,
                Ok(None) => break,
                Err(e) => {
                    debug!(device_id = %device_id, error = %e, "read failed");
                    break;
                }
            },
        };
        let body = match decrypt_wire(&keys.recv, recv_nonce, &sealed) {
            Ok(b) => b,
            Err(_) => {
                // Counter desync or tampering: the stream cannot be trusted from here on.
                warn!(device_id = %device_id, "frame failed authentication, closing channel");
                break;
            }
        };
        recv_nonce += 1;
        let actions = hub
            .core
            .lock()
            .await
            .on_frame(&device_id, &body, crate::now_ms());
        hub.dispatch(actions).await;
    }

    if hub.detach(&device_id, conn).await {
        let actions = hub
            .core
            .lock()
            .await
            .on_connection_closed(&device_id, crate::now_ms());
        hub.dispatch(actions).await;
    }
    // The sender is gone (detached or superseded), so the writer drains its queue and ends.
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer_task).await.is_err() {
        debug!(device_id = %device_id, "writer did not drain in time");
    }
    info!(device_id = %device_id, %addr, "channel closed");
    Ok(())
}

/// One length-prefixed frame, or `None` on a clean end of stream.
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>> {
    let mut prefix = [0u8; LEN_SIZE];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(prefix) as usize;
    if len < TAG_LEN || len > MAX_FRAME_LEN as usize + TAG_LEN {
        return Err(invalid_data("bad frame length"));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, sealed: &[u8]) -> std::io::Result<()> {
    let len = u32::try_from(sealed.len()).map_err(|_| invalid_data("frame too large"))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(sealed).await?;
    writer.flush().await
}

fn invalid_data<E>(e: E) -> std::io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    std::io::Error::new(std::io::ErrorKind::InvalidData, e)
}
