//! Per-peer lifecycle: one WebSocket, at most one Mumble session, a pacer
//! for uplink voice and a writer task that keeps backpressure measurable.
//! All suspension points live inside this task, so a torn-down session can
//! never be touched by a stale callback.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::gateway::metrics::PeerMetrics;
use crate::gateway::pacer::{PacerItem, UplinkPacer};
use crate::gateway::peer::{
    decode_uplink, encode_downlink, ClientMessage, ServerMessage, UplinkFrame,
};
use crate::gateway::GatewayContext;
use crate::mumble::config::AuthRequest;
use crate::mumble::events::{DisconnectReason, SessionEvent};
use crate::mumble::session::{Session, SessionCommand};
use crate::mumble::voice::MAX_OPUS_PAYLOAD;
use crate::transport::errors::ConnectError;

/// Above this many queued outbound bytes, voice frames are dropped rather
/// than queued. Control messages are never dropped.
const DOWNLINK_BUFFER_LIMIT: usize = 2 * 1024 * 1024;

const METRICS_INTERVAL: Duration = Duration::from_secs(2);

const REASON_CLIENT: &str = "client_disconnect";
const REASON_MUMBLE: &str = "mumble_disconnect";

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

fn message_len(message: &Message) -> usize {
    match message {
        Message::Text(text) => text.len(),
        Message::Binary(data) => data.len(),
        _ => 0,
    }
}

/// Outbound WebSocket writer with a byte gauge standing in for the socket's
/// send buffer. The gauge rises on enqueue and falls once a frame has
/// actually been written.
struct OutboundQueue {
    tx: mpsc::Sender<Message>,
    buffered: Arc<AtomicUsize>,
    writer: JoinHandle<()>,
}

impl OutboundQueue {
    /// Generic over the sink so tests can watch the outbound stream through
    /// a plain channel instead of a live WebSocket.
    fn new<S>(mut sink: S) -> Self
    where
        S: Sink<Message> + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Message>(1024);
        let buffered = Arc::new(AtomicUsize::new(0));
        let gauge = Arc::clone(&buffered);
        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let len = message_len(&message);
                let result = sink.send(message).await;
                gauge.fetch_sub(len, Ordering::Relaxed);
                if result.is_err() {
                    break;
                }
            }
        });
        Self {
            tx,
            buffered,
            writer,
        }
    }

    fn buffered_bytes(&self) -> usize {
        self.buffered.load(Ordering::Relaxed)
    }

    /// Queues one control message. Waits for space if the channel is full;
    /// control traffic is never dropped.
    async fn send_control(&self, message: &ServerMessage) {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(error) => {
                // Should be unreachable for our plain data types; fall back
                // to a minimal error envelope rather than sending nothing.
                warn!("failed to serialize outgoing message: {error}");
                r#"{"type":"error","code":"internal_error","message":"serialization failed"}"#
                    .to_string()
            }
        };
        self.buffered.fetch_add(text.len(), Ordering::Relaxed);
        if self.tx.send(Message::Text(text)).await.is_err() {
            // Writer gone; the main loop will observe the closed socket.
        }
    }

    /// Queues one voice frame, dropping it when the peer cannot keep up.
    fn try_send_voice(&self, payload: Vec<u8>) -> bool {
        if self.buffered_bytes() > DOWNLINK_BUFFER_LIMIT {
            return false;
        }
        let len = payload.len();
        self.buffered.fetch_add(len, Ordering::Relaxed);
        if self.tx.try_send(Message::Binary(payload)).is_err() {
            self.buffered.fetch_sub(len, Ordering::Relaxed);
            return false;
        }
        true
    }

    fn shutdown(&self) {
        self.writer.abort();
    }
}

struct PeerSession {
    session: Session,
    commands: mpsc::Sender<SessionCommand>,
    server_id: String,
}

struct Peer {
    ctx: Arc<GatewayContext>,
    outbound: OutboundQueue,
    metrics: PeerMetrics,
    pacer: UplinkPacer,
    session: Option<PeerSession>,
}

async fn recv_session(session: &mut Option<PeerSession>) -> Option<SessionEvent> {
    match session {
        Some(peer) => peer.session.next_event().await,
        None => std::future::pending().await,
    }
}

/// Drives one peer connection to completion.
pub async fn handle_peer(socket: WebSocket, ctx: Arc<GatewayContext>) {
    let (sink, mut stream) = socket.split();
    let mut peer = Peer {
        outbound: OutboundQueue::new(sink),
        metrics: PeerMetrics::new(Instant::now()),
        pacer: UplinkPacer::new(ctx.config.pacer),
        session: None,
        ctx,
    };

    peer.outbound
        .send_control(&ServerMessage::ServerList {
            servers: peer.ctx.whitelist.summaries(),
        })
        .await;

    let mut pacer_tick = tokio::time::interval(peer.ctx.config.pacer.interval);
    pacer_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut metrics_tick = tokio::time::interval(METRICS_INTERVAL);
    metrics_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => peer.on_text(&text).await,
                    Some(Ok(Message::Binary(data))) => peer.on_binary(&data).await,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        debug!("peer socket error: {error}");
                        break;
                    }
                }
            }
            event = recv_session(&mut peer.session) => {
                peer.on_session_event(event).await;
            }
            _ = pacer_tick.tick() => {
                peer.on_pacer_tick();
            }
            _ = metrics_tick.tick() => {
                if peer.session.is_some() {
                    peer.emit_metrics().await;
                }
            }
        }
    }

    // Peer is gone: release the Mumble side and stop the writer.
    peer.session = None;
    peer.outbound.shutdown();
}

impl Peer {
    fn congested(&self) -> bool {
        self.session
            .as_ref()
            .map_or(false, |peer| peer.commands.capacity() == 0)
    }

    fn forward_uplink(&mut self, item: PacerItem) {
        let Some(session) = &self.session else { return };
        let command = match item {
            PacerItem::Opus { target, payload } => SessionCommand::SendOpus {
                target,
                payload,
            },
            PacerItem::End { target } => SessionCommand::SendOpusEnd { target },
        };
        if session.commands.try_send(command).is_err() {
            self.pacer.note_external_drop();
        }
    }

    fn on_pacer_tick(&mut self) {
        if self.session.is_none() || !self.pacer.is_active() {
            return;
        }
        let congested = self.congested();
        if let Some(item) = self.pacer.tick(congested, Instant::now()) {
            self.forward_uplink(item);
        }
    }

    async fn emit_metrics(&mut self) {
        let report = self
            .metrics
            .report(self.pacer.dropped_total(), Instant::now());
        self.outbound
            .send_control(&ServerMessage::Metrics(report))
            .await;
    }

    async fn on_text(&mut self, text: &str) {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(error) => {
                self.outbound
                    .send_control(&ServerMessage::error(
                        "bad_request",
                        format!("unparseable message: {error}"),
                    ))
                    .await;
                return;
            }
        };

        match message {
            ClientMessage::Connect {
                server_id,
                username,
                password,
                tokens,
            } => {
                self.on_connect(server_id, username, password, tokens).await;
            }
            ClientMessage::Disconnect => {
                if self.drop_session() {
                    self.outbound
                        .send_control(&ServerMessage::Disconnected {
                            reason: REASON_CLIENT.to_string(),
                        })
                        .await;
                }
            }
            ClientMessage::JoinChannel { channel_id } => {
                match &self.session {
                    Some(session) => {
                        let _ = session
                            .commands
                            .send(SessionCommand::JoinChannel { channel_id })
                            .await;
                    }
                    None => self.not_connected().await,
                }
            }
            ClientMessage::TextSend {
                message,
                channel_id,
                user_id,
            } => {
                match &self.session {
                    Some(session) => {
                        let _ = session
                            .commands
                            .send(SessionCommand::SendText {
                                message,
                                channel_id,
                                user_id,
                            })
                            .await;
                    }
                    None => self.not_connected().await,
                }
            }
            ClientMessage::Ping { client_time_ms } => {
                self.outbound
                    .send_control(&ServerMessage::Pong {
                        client_time_ms,
                        server_time_ms: now_ms(),
                    })
                    .await;
            }
        }
    }

    async fn not_connected(&mut self) {
        self.outbound
            .send_control(&ServerMessage::error(
                "not_connected",
                "no active mumble session",
            ))
            .await;
    }

    async fn on_connect(
        &mut self,
        server_id: String,
        username: String,
        password: Option<String>,
        tokens: Vec<String>,
    ) {
        // A fresh connect always replaces whatever session existed.
        self.drop_session();

        let Some(server) = self.ctx.whitelist.resolve(&server_id).cloned() else {
            self.outbound
                .send_control(&ServerMessage::error(
                    "unknown_server",
                    format!("unknown server id {server_id:?}"),
                ))
                .await;
            return;
        };

        let auth = AuthRequest {
            username,
            password,
            tokens,
        };
        match Session::connect(&server.endpoint, auth).await {
            Ok(session) => {
                info!("peer connected to {}", server.id);
                let info = session.info().clone();
                self.outbound
                    .send_control(&ServerMessage::Connected {
                        server_id: server.id.clone(),
                        self_user_id: info.self_user_id,
                        root_channel_id: info.root_channel_id,
                        welcome_message: info.welcome_message,
                        server_version: info.server_version,
                        max_bandwidth: info.max_bandwidth,
                    })
                    .await;
                self.outbound
                    .send_control(&ServerMessage::StateSnapshot {
                        channels: session.channels().to_vec(),
                        users: session.users().to_vec(),
                    })
                    .await;
                self.session = Some(PeerSession {
                    commands: session.commands(),
                    session,
                    server_id: server.id,
                });
            }
            Err(ConnectError::Rejected { reason }) => {
                self.outbound
                    .send_control(&ServerMessage::error("mumble_reject", reason))
                    .await;
            }
            Err(error) => {
                self.outbound
                    .send_control(&ServerMessage::error("connect_failed", error.to_string()))
                    .await;
            }
        }
    }

    async fn on_binary(&mut self, data: &[u8]) {
        match decode_uplink(data) {
            Ok(UplinkFrame::Opus { target, opus }) => {
                if opus.len() > MAX_OPUS_PAYLOAD {
                    debug!("dropping oversized uplink frame of {} bytes", opus.len());
                    return;
                }
                self.metrics.record_uplink_frame(opus.len());
                if self.session.is_none() {
                    return;
                }
                let congested = self.congested();
                if let Some(item) = self.pacer.push_opus(target, opus, congested, Instant::now())
                {
                    self.forward_uplink(item);
                }
            }
            Ok(UplinkFrame::End) => {
                if self.session.is_none() {
                    return;
                }
                if let Some(item) = self.pacer.push_end(0, Instant::now()) {
                    self.forward_uplink(item);
                }
            }
            Err(error) => {
                debug!("dropping undecodable voice envelope: {error}");
            }
        }
    }

    async fn on_session_event(&mut self, event: Option<SessionEvent>) {
        let Some(event) = event else {
            // Event stream ended without a Closed marker; treat it the same.
            self.close_from_mumble(None).await;
            return;
        };
        match event {
            SessionEvent::Voice(frame) => {
                let bytes = frame.opus.len();
                let payload = encode_downlink(&frame);
                if self.outbound.try_send_voice(payload) {
                    self.metrics.record_downlink_frame(bytes);
                } else {
                    self.metrics.record_downlink_drop();
                }
            }
            SessionEvent::ChannelUpsert(channel) => {
                self.outbound
                    .send_control(&ServerMessage::ChannelUpsert { channel })
                    .await;
            }
            SessionEvent::ChannelRemoved(channel_id) => {
                self.outbound
                    .send_control(&ServerMessage::ChannelRemove { channel_id })
                    .await;
            }
            SessionEvent::UserUpsert(user) => {
                self.outbound
                    .send_control(&ServerMessage::UserUpsert { user })
                    .await;
            }
            SessionEvent::UserRemoved(user_id) => {
                self.outbound
                    .send_control(&ServerMessage::UserRemove { user_id })
                    .await;
            }
            SessionEvent::Text(text) => {
                self.outbound
                    .send_control(&ServerMessage::TextRecv {
                        sender_id: text.sender_id,
                        message: text.message,
                        target_users: text.target_users,
                        target_channels: text.target_channels,
                        target_trees: text.target_trees,
                        timestamp_ms: now_ms(),
                    })
                    .await;
            }
            SessionEvent::Denied(denied) => {
                self.outbound
                    .send_control(&ServerMessage::error(
                        "mumble_denied",
                        denied
                            .reason
                            .unwrap_or_else(|| "permission denied".to_string()),
                    ))
                    .await;
            }
            SessionEvent::ServerRtt { ms } => {
                self.metrics.set_server_rtt(ms);
                // RTT updates refresh the peer's view right away.
                self.emit_metrics().await;
            }
            SessionEvent::UdpRtt { ms, stats } => {
                self.metrics.set_udp_rtt(ms, stats);
            }
            SessionEvent::UdpReady => {
                self.metrics.set_udp_ready(true);
            }
            SessionEvent::Closed(reason) => {
                self.close_from_mumble(Some(reason)).await;
            }
        }
    }

    /// Drops the current session, if any. Idempotent.
    fn drop_session(&mut self) -> bool {
        match self.session.take() {
            Some(session) => {
                info!("released session to {}", session.server_id);
                self.pacer.reset();
                self.metrics.session_closed();
                true
            }
            None => false,
        }
    }

    async fn close_from_mumble(&mut self, reason: Option<DisconnectReason>) {
        if !self.drop_session() {
            return;
        }
        match reason {
            Some(DisconnectReason::Rejected { reason }) => {
                self.outbound
                    .send_control(&ServerMessage::error("mumble_reject", reason))
                    .await;
            }
            Some(DisconnectReason::ConnectionLost(message)) => {
                self.outbound
                    .send_control(&ServerMessage::error("mumble_error", message))
                    .await;
            }
            Some(DisconnectReason::Closed) | None => {}
        }
        self.outbound
            .send_control(&ServerMessage::Disconnected {
                reason: REASON_MUMBLE.to_string(),
            })
            .await;
    }
}
