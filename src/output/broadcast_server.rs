//! TCP broadcast output
//!
//! Every item the server is subscribed to is written to every connected
//! client. Clients can also talk back on the same socket: `exit` closes the
//! connection, `list_clients` returns the connection list, and anything else
//! is echoed. Each client has its own bounded write queue; a client that
//! cannot keep up loses items instead of slowing the others down.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

use crate::adapter::{Adapter, AdapterContext};
use crate::data_hub::{ANY, Subscription};
use crate::item::{Item, Message};
use crate::queue_config::BROADCAST_CLIENT_QUEUE_SIZE;

/// Longest control line accepted from a client
const MAX_COMMAND_LEN: usize = 4096;

/// How long queued bytes may take to reach clients after shutdown
const CLIENT_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    pub host: String,
    pub port: u16,
    /// Content types to forward; `ANY` forwards everything
    pub content_types: Vec<String>,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 2000,
            content_types: vec![ANY.to_string()],
        }
    }
}

struct Client {
    peer: SocketAddr,
    tx: flume::Sender<Bytes>,
}

/// Connected clients, shared by the accept loop, the connection handlers and
/// the item writer
type ClientSet = Arc<DashMap<u64, Client>>;

enum Command {
    Exit,
    ListClients,
    Echo,
}

fn parse_command(line: &[u8]) -> Command {
    let text = String::from_utf8_lossy(line);
    match text.trim().to_ascii_lowercase().as_str() {
        "exit" => Command::Exit,
        "list_clients" => Command::ListClients,
        _ => Command::Echo,
    }
}

fn render_client_list(clients: &DashMap<u64, Client>) -> Bytes {
    let mut entries: Vec<(u64, SocketAddr)> = clients.iter().map(|c| (*c.key(), c.peer)).collect();
    entries.sort_unstable_by_key(|(id, _)| *id);
    let listing: Vec<String> = entries
        .iter()
        .map(|(id, peer)| format!("#{id} {peer}"))
        .collect();
    Bytes::from(format!("{}\r\n", listing.join(", ")))
}

/// Bytes written to clients for one item; text lines get a CRLF if they
/// arrived without one, binary payloads go out untouched
fn wire_bytes(item: &Item) -> Bytes {
    let payload = item.payload();
    if item.content_type().is_line_oriented() && !payload.ends_with(b"\n") {
        let mut buf = BytesMut::with_capacity(payload.len() + 2);
        buf.extend_from_slice(payload);
        buf.extend_from_slice(b"\r\n");
        buf.freeze()
    } else {
        payload.clone()
    }
}

pub struct BroadcastServer {
    name: String,
    config: BroadcastConfig,
    listener: Option<TcpListener>,
}

impl BroadcastServer {
    pub fn new(name: impl Into<String>, config: BroadcastConfig) -> Self {
        Self {
            name: name.into(),
            config,
            listener: None,
        }
    }

    /// Serve on an already bound listener (tests bind port 0)
    pub fn with_listener(name: impl Into<String>, config: BroadcastConfig, listener: TcpListener) -> Self {
        Self {
            name: name.into(),
            config,
            listener: Some(listener),
        }
    }
}

async fn accept_loop(listener: TcpListener, clients: ClientSet, stop: CancellationToken) {
    let next_id = AtomicU64::new(1);
    let mut connections = JoinSet::new();
    loop {
        let (stream, peer) = tokio::select! {
            _ = stop.cancelled() => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => continue,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    metrics::counter!("broadcast.errors.accept_total").increment(1);
                    continue;
                }
            },
        };

        let id = next_id.fetch_add(1, Ordering::Relaxed);
        info!("Accepted connection #{} from {}", id, peer);
        metrics::counter!("broadcast.connections.accepted_total").increment(1);

        let (tx, rx) = flume::bounded(BROADCAST_CLIENT_QUEUE_SIZE);
        clients.insert(id, Client { peer, tx: tx.clone() });
        metrics::gauge!("broadcast.clients.connected").set(clients.len() as f64);

        let clients = clients.clone();
        let stop = stop.clone();
        connections.spawn(
            async move {
                if let Err(e) = handle_connection(stream, id, tx, rx, &clients, stop).await {
                    debug!(error = %e, "Connection error");
                }
                clients.remove(&id);
                metrics::gauge!("broadcast.clients.connected").set(clients.len() as f64);
                info!("Connection #{} closed", id);
            }
            .instrument(info_span!("client", id)),
        );
    }

    drain_connections(connections).await;
}

/// Give open connections a bounded time to flush their queues
async fn drain_connections(mut connections: JoinSet<()>) {
    let open = connections.len();
    if open == 0 {
        return;
    }
    let drained = timeout(CLIENT_FLUSH_TIMEOUT, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            open = connections.len(),
            "Client connections did not flush in {:?}, closing", CLIENT_FLUSH_TIMEOUT
        );
        connections.abort_all();
    } else {
        debug!(open, "Client connections flushed");
    }
}

/// Read control lines from one client while its writer drains the queue
async fn handle_connection(
    stream: TcpStream,
    id: u64,
    tx: flume::Sender<Bytes>,
    rx: flume::Receiver<Bytes>,
    clients: &ClientSet,
    stop: CancellationToken,
) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let writer = tokio::spawn(write_loop(write_half, rx));
    let mut reader = BufReader::new(read_half);
    let mut line = Vec::with_capacity(128);

    loop {
        line.clear();
        let mut limited = (&mut reader).take(MAX_COMMAND_LEN as u64);
        let n = tokio::select! {
            _ = stop.cancelled() => break,
            n = limited.read_until(b'\n', &mut line) => n?,
        };
        if n == 0 {
            break;
        }

        match parse_command(&line) {
            Command::Exit => {
                debug!("Client requested exit");
                break;
            }
            Command::ListClients => {
                let _ = tx.send_async(render_client_list(clients)).await;
            }
            Command::Echo => {
                trace!(len = n, "echo");
                let _ = tx.send_async(Bytes::copy_from_slice(&line)).await;
            }
        }
    }

    // Removing the client drops the last broadcast sender; the writer flushes
    // what is queued and closes the socket
    clients.remove(&id);
    drop(tx);
    finish_writer(writer).await;
    Ok(())
}

async fn write_loop(mut writer: OwnedWriteHalf, rx: flume::Receiver<Bytes>) -> std::io::Result<()> {
    while let Ok(bytes) = rx.recv_async().await {
        writer.write_all(&bytes).await?;
    }
    writer.shutdown().await
}

async fn finish_writer(writer: JoinHandle<std::io::Result<()>>) {
    match writer.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "Client write failed"),
        Err(e) => warn!(error = %e, "Client writer task failed"),
    }
}

/// Hand one item to every client queue without waiting
fn broadcast(clients: &DashMap<u64, Client>, bytes: &Bytes) {
    let mut gone = Vec::new();
    for client in clients.iter() {
        match client.tx.try_send(bytes.clone()) {
            Ok(()) => metrics::counter!("broadcast.items.sent_total").increment(1),
            Err(flume::TrySendError::Full(_)) => {
                metrics::counter!("broadcast.items.dropped_total").increment(1);
                trace!(client = *client.key(), "client queue full, item dropped");
            }
            Err(flume::TrySendError::Disconnected(_)) => gone.push(*client.key()),
        }
    }
    for id in gone {
        clients.remove(&id);
    }
}

#[async_trait]
impl Adapter for BroadcastServer {
    fn name(&self) -> &str {
        &self.name
    }

    fn subscribed_types(&self) -> Option<Subscription> {
        Some(Subscription::to(self.config.content_types.iter().map(String::as_str)))
    }

    async fn run(self: Box<Self>, mut ctx: AdapterContext) -> Result<()> {
        let inbox = ctx.take_inbox()?;
        let listener = match self.listener {
            Some(listener) => listener,
            None => {
                let address = format!("{}:{}", self.config.host, self.config.port);
                TcpListener::bind(&address)
                    .await
                    .with_context(|| format!("Failed to bind broadcast server on {address}"))?
            }
        };
        info!(
            local = ?listener.local_addr().ok(),
            subscription = ?self.config.content_types,
            "Broadcast server listening"
        );

        let clients: ClientSet = Arc::new(DashMap::new());
        let stop = CancellationToken::new();
        let acceptor = tokio::spawn(accept_loop(listener, clients.clone(), stop.clone()));

        loop {
            match inbox.recv().await {
                Some(Message::Data(item)) => broadcast(&clients, &wire_bytes(&item)),
                Some(Message::Shutdown) => {
                    debug!("Received shutdown sentinel");
                    break;
                }
                None => break,
            }
        }

        stop.cancel();
        if let Err(e) = acceptor.await {
            warn!(error = %e, "Accept loop task failed");
        }
        clients.clear();
        metrics::gauge!("broadcast.clients.connected").set(0.0);
        info!("Broadcast server stopped");
        Ok(())
    }
}
