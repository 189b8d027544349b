//! WebSocket transport adapter.
//!
//! Architecture:
//! ```text
//! ws://host/ws/grid/{user}/{view}
//!        │
//!        ▼
//!  handshake ── path → ViewId ── ViewService::connect ──┐
//!                                                       │ snapshot task
//!  ┌──────────────── connection task ─────────────────┐ │
//!  │ select!                                          │ │
//!  │   inbound text  → control message → reply        │ │
//!  │   outbound rx   ← ChannelHandle ◄──────────────────┘
//!  │                 ◄── DeltaFanout broadcasts       │
//!  └──────────────────────────────────────────────────┘
//! ```
//!
//! The connection task is the only writer to its socket. Everything the
//! core sends arrives through the handle's bounded channel, so per-handle
//! order is the channel order.

use futures_util::{Sink, SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::{self, Message};
use viewserver_core::ViewId;

use crate::handle::ChannelHandle;
use crate::protocol::{ClientMessage, OutboundMessage};
use crate::service::ViewService;
use crate::subscription::SubscriberHandle;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Path prefix in front of `/{user}/{view}`
    pub path_prefix: String,
    /// Outbound payloads buffered per connection before it is dropped
    pub outbound_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            path_prefix: "/ws/grid".to_string(),
            outbound_buffer: 4096,
        }
    }
}

/// Connection counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
}

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    active: AtomicU64,
    rejected: AtomicU64,
}

/// Split `{prefix}/{user}/{view}` into its two segments.
pub fn parse_view_path(prefix: &str, path: &str) -> Option<(String, String)> {
    let rest = path.strip_prefix(prefix.trim_end_matches('/'))?;
    let mut segments = rest.strip_prefix('/')?.split('/');
    let user = segments.next().filter(|s| !s.is_empty())?;
    let view = segments.next().filter(|s| !s.is_empty())?;
    if segments.next().is_some() {
        return None;
    }
    Some((user.to_string(), view.to_string()))
}

/// The WebSocket server.
pub struct ViewServer {
    config: ServerConfig,
    service: Arc<ViewService>,
    counters: Arc<Counters>,
}

impl ViewServer {
    pub fn new(config: ServerConfig, service: Arc<ViewService>) -> Self {
        Self {
            config,
            service,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn service(&self) -> &Arc<ViewService> {
        &self.service
    }

    /// Bind and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!(
            "View server listening on ws://{}{}/{{user}}/{{view}}",
            self.config.bind_addr,
            self.config.path_prefix
        );
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let service = self.service.clone();
            let config = self.config.clone();
            let counters = self.counters.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, service, config, counters).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.counters.total.load(Ordering::Relaxed),
            active_connections: self.counters.active.load(Ordering::Relaxed),
            rejected_connections: self.counters.rejected.load(Ordering::Relaxed),
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        service: Arc<ViewService>,
        config: ServerConfig,
        counters: Arc<Counters>,
    ) -> Result<(), BoxError> {
        let mut path = String::new();
        let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            path = req.uri().path().to_string();
            Ok(resp)
        };
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        counters.total.fetch_add(1, Ordering::Relaxed);

        let Some((user, view)) = parse_view_path(&config.path_prefix, &path) else {
            log::warn!("Rejecting connection from {addr}: invalid path {path}");
            counters.rejected.fetch_add(1, Ordering::Relaxed);
            reply(&mut ws_sender, OutboundMessage::notice_error("Invalid path")).await?;
            ws_sender.send(Message::Close(None)).await?;
            return Ok(());
        };
        let view_id = ViewId::compose(&user, &view);

        let (handle, mut rx) = ChannelHandle::new(config.outbound_buffer);
        if let Err(e) = service.connect(handle.clone(), &view_id) {
            log::warn!("Rejecting connection from {addr} for view {view_id}: {e}");
            counters.rejected.fetch_add(1, Ordering::Relaxed);
            reply(&mut ws_sender, OutboundMessage::notice_error(e.to_string())).await?;
            ws_sender.send(Message::Close(None)).await?;
            return Ok(());
        }
        counters.active.fetch_add(1, Ordering::Relaxed);
        log::info!("Handle {} connected from {addr} to view {view_id}", handle.id());

        let result = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                if !handle_control(&service, &handle, text.as_str(), &mut ws_sender).await? {
                                    ws_sender.send(Message::Close(None)).await?;
                                    break;
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }
                        }
                    }

                    outbound = rx.recv() => {
                        match outbound {
                            Some(payload) => {
                                ws_sender.send(Message::Text(payload.to_string().into())).await?;
                            }
                            None => break,
                        }
                    }
                }
            }
            Ok::<(), BoxError>(())
        }
        .await;

        handle.close();
        service.disconnect(&handle.id());
        counters.active.fetch_sub(1, Ordering::Relaxed);
        log::info!("Handle {} disconnected from {addr}", handle.id());
        result
    }
}

/// Serialize `msg` and write it straight to the socket.
async fn reply<S>(sink: &mut S, msg: OutboundMessage<'_>) -> Result<(), BoxError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let payload = msg.encode()?;
    sink.send(Message::Text(payload.to_string().into())).await?;
    Ok(())
}

/// Answer one control message. Returns `false` when the connection should close.
async fn handle_control<S>(
    service: &ViewService,
    handle: &Arc<ChannelHandle>,
    text: &str,
    sink: &mut S,
) -> Result<bool, BoxError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let msg = match ClientMessage::decode(text) {
        Ok(msg) => msg,
        Err(e) => {
            log::debug!("Unparseable control message from handle {}: {e}", handle.id());
            reply(sink, OutboundMessage::notice_error("Invalid message format")).await?;
            return Ok(true);
        }
    };

    match msg.msg_type.as_str() {
        "PING" => reply(sink, OutboundMessage::notice_pong(msg.grid_id)).await?,
        "SUBSCRIBE" => {
            let Some(grid_id) = msg.grid_id.filter(|g| !g.is_empty()) else {
                reply(sink, OutboundMessage::notice_error("SUBSCRIBE requires gridId")).await?;
                return Ok(true);
            };
            let target = ViewId::from(grid_id.as_str());
            match service.resubscribe(handle.clone(), &target) {
                // The service owns the snapshot task and cancels it on the next switch.
                Ok(_) => {
                    reply(sink, OutboundMessage::notice_subscribed(Some(grid_id))).await?;
                }
                Err(e) => {
                    log::warn!("Handle {} could not subscribe to {target}: {e}", handle.id());
                    reply(sink, OutboundMessage::notice_error(e.to_string())).await?;
                }
            }
        }
        "UNSUBSCRIBE" => {
            service.disconnect(&handle.id());
            return Ok(false);
        }
        "CELL_UPDATE_REQUEST" => {
            log::debug!("Cell update request from handle {}; writes go through the event stream", handle.id());
            reply(sink, OutboundMessage::notice_update_ack(msg.grid_id)).await?;
        }
        other => {
            log::warn!("Unknown control message type from handle {}: {other}", handle.id());
            reply(sink, OutboundMessage::notice_error(format!("Unknown message type: {other}"))).await?;
        }
    }
    Ok(true)
}
