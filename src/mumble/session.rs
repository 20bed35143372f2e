//! Session orchestrator: joins the TLS control client and the UDP voice
//! client into one event stream, assigns outbound voice sequences, folds the
//! dual-transport downlink into a deduplicated Opus stream and probes the
//! TCP tunnel when UDP never comes up.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::mumble::config::{AuthRequest, MumbleEndpoint};
use crate::mumble::control::{spawn_control, tls_connect, ControlCommand, ControlHandle};
use crate::mumble::events::{ControlEvent, DisconnectReason, SessionEvent, UdpEvent};
use crate::mumble::udp::{UdpVoiceClient, UDP_FALLBACK_TIMEOUT};
use crate::mumble::voice::{self, VoicePacket, MAX_OPUS_PAYLOAD};
use crate::transport::errors::{ConnectError, TransportError};
use crate::transport::types::{Channel, ServerInfo, User, VoiceFrame};

/// How long `connect` waits for `ServerSync` before giving up. A timeout is
/// a recoverable failure; the peer may retry.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

const DEDUP_WINDOW: Duration = Duration::from_millis(1000);
const DEDUP_EVICT_AGE: Duration = Duration::from_millis(1500);
const DEDUP_SOFT_CAP: usize = 2048;
const DEDUP_HARD_CAP: usize = 4096;

/// Commands a peer supervisor feeds into its session.
#[derive(Clone, Debug)]
pub enum SessionCommand {
    SendOpus { target: u8, payload: Bytes },
    SendOpusEnd { target: u8 },
    JoinChannel { channel_id: u32 },
    SendText {
        message: String,
        channel_id: Option<u32>,
        user_id: Option<u32>,
    },
}

/// A connected Mumble session. Dropping it tears everything down; events
/// stop with a final `Closed` when the server side ends the session first.
pub struct Session {
    commands: mpsc::Sender<SessionCommand>,
    events: mpsc::Receiver<SessionEvent>,
    info: ServerInfo,
    channels: Vec<Channel>,
    users: Vec<User>,
}

impl Session {
    /// Resolves, connects and completes the handshake against one endpoint.
    pub async fn connect(
        endpoint: &MumbleEndpoint,
        auth: AuthRequest,
    ) -> Result<Self, ConnectError> {
        auth.validate().map_err(ConnectError::Transport)?;
        let stream = tls_connect(endpoint).await?;

        let (udp_events_tx, udp_events_rx) = mpsc::channel(256);
        let udp = match UdpVoiceClient::connect(&endpoint.host, endpoint.port, udp_events_tx).await
        {
            Ok(udp) => Some(udp),
            Err(error) => {
                // Voice falls back to the TCP tunnel for the whole session.
                warn!("udp voice unavailable, tunnelling: {error}");
                None
            }
        };

        Self::connect_with_stream(stream, auth, udp, udp_events_rx).await
    }

    /// Connect over an established control stream. Split out so tests can
    /// drive the whole orchestrator through an in-memory duplex.
    pub async fn connect_with_stream<S>(
        stream: S,
        auth: AuthRequest,
        udp: Option<UdpVoiceClient>,
        udp_events: mpsc::Receiver<UdpEvent>,
    ) -> Result<Self, ConnectError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (control_events_tx, control_events) = mpsc::channel(256);
        let control = spawn_control(stream, auth, control_events_tx);

        let (events_tx, events_rx) = mpsc::channel(256);
        let (commands_tx, commands_rx) = mpsc::channel(64);

        let mut orchestrator = Orchestrator {
            control_events,
            control_commands: control.commands(),
            control,
            udp,
            udp_events: Some(udp_events),
            events: events_tx,
            next_sequence: 0,
            dedup: HashMap::new(),
            fallback_at: None,
            fallback_probe_sent: false,
        };

        let synced = match tokio::time::timeout(HANDSHAKE_TIMEOUT, orchestrator.await_sync()).await
        {
            Ok(Ok(synced)) => synced,
            Ok(Err(error)) => {
                orchestrator.teardown();
                return Err(error);
            }
            Err(_) => {
                orchestrator.teardown();
                return Err(ConnectError::Timeout);
            }
        };

        tokio::spawn(orchestrator.run(commands_rx));

        Ok(Self {
            commands: commands_tx,
            events: events_rx,
            info: synced.info,
            channels: synced.channels,
            users: synced.users,
        })
    }

    pub fn commands(&self) -> mpsc::Sender<SessionCommand> {
        self.commands.clone()
    }

    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    pub fn info(&self) -> &ServerInfo {
        &self.info
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn users(&self) -> &[User] {
        &self.users
    }
}

struct SyncedState {
    info: ServerInfo,
    channels: Vec<Channel>,
    users: Vec<User>,
}

struct Orchestrator {
    control_events: mpsc::Receiver<ControlEvent>,
    control_commands: mpsc::Sender<ControlCommand>,
    control: ControlHandle,
    udp: Option<UdpVoiceClient>,
    udp_events: Option<mpsc::Receiver<UdpEvent>>,
    events: mpsc::Sender<SessionEvent>,
    next_sequence: u64,
    dedup: HashMap<(u32, u8, u64), Instant>,
    fallback_at: Option<Instant>,
    fallback_probe_sent: bool,
}

enum Flow {
    Continue,
    Stop,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

async fn recv_udp(rx: &mut Option<mpsc::Receiver<UdpEvent>>) -> Option<UdpEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl Orchestrator {
    /// Handshake barrier: consumes control events until `ServerSync`.
    /// Pre-sync registry traffic is folded into the snapshot the sync event
    /// carries, so it is not replayed individually.
    async fn await_sync(&mut self) -> Result<SyncedState, ConnectError> {
        loop {
            let event = match self.control_events.recv().await {
                Some(event) => event,
                None => {
                    return Err(ConnectError::Transport(TransportError::ConnectionClosed));
                }
            };
            match event {
                ControlEvent::Synced {
                    info,
                    channels,
                    users,
                } => {
                    return Ok(SyncedState {
                        info,
                        channels,
                        users,
                    });
                }
                ControlEvent::CryptSetup {
                    key,
                    client_nonce,
                    server_nonce,
                } => {
                    self.apply_crypt_setup(key, client_nonce, server_nonce).await;
                }
                ControlEvent::Disconnected(DisconnectReason::Rejected { reason }) => {
                    return Err(ConnectError::Rejected { reason });
                }
                ControlEvent::Disconnected(DisconnectReason::ConnectionLost(message)) => {
                    return Err(ConnectError::Transport(TransportError::Io(message)));
                }
                ControlEvent::Disconnected(DisconnectReason::Closed) => {
                    return Err(ConnectError::Transport(TransportError::ConnectionClosed));
                }
                _ => {}
            }
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) {
        loop {
            let fallback_deadline = self
                .fallback_at
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                event = self.control_events.recv() => {
                    match event {
                        Some(event) => {
                            if matches!(self.on_control(event).await, Flow::Stop) {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                event = recv_udp(&mut self.udp_events) => {
                    match event {
                        Some(event) => {
                            if matches!(self.on_udp(event).await, Flow::Stop) {
                                break;
                            }
                        }
                        None => self.udp_events = None,
                    }
                }
                command = commands.recv() => {
                    match command {
                        Some(command) => self.on_command(command).await,
                        // Owner dropped the session: tear down quietly.
                        None => break,
                    }
                }
                _ = tokio::time::sleep_until(fallback_deadline), if self.fallback_at.is_some() => {
                    self.fire_fallback().await;
                }
            }
        }
        self.teardown();
    }

    fn teardown(&mut self) {
        self.control.abort();
        if let Some(udp) = &self.udp {
            udp.shutdown();
        }
    }

    async fn emit(&mut self, event: SessionEvent) -> Flow {
        if self.events.send(event).await.is_err() {
            Flow::Stop
        } else {
            Flow::Continue
        }
    }

    async fn on_control(&mut self, event: ControlEvent) -> Flow {
        match event {
            ControlEvent::Synced { .. } => Flow::Continue,
            ControlEvent::ChannelUpsert(channel) => {
                self.emit(SessionEvent::ChannelUpsert(channel)).await
            }
            ControlEvent::ChannelRemoved(id) => self.emit(SessionEvent::ChannelRemoved(id)).await,
            ControlEvent::UserUpsert(user) => self.emit(SessionEvent::UserUpsert(user)).await,
            ControlEvent::UserRemoved(id) => self.emit(SessionEvent::UserRemoved(id)).await,
            ControlEvent::Text(text) => self.emit(SessionEvent::Text(text)).await,
            ControlEvent::Denied(denied) => self.emit(SessionEvent::Denied(denied)).await,
            ControlEvent::Rtt { ms } => self.emit(SessionEvent::ServerRtt { ms }).await,
            ControlEvent::CryptSetup {
                key,
                client_nonce,
                server_nonce,
            } => {
                self.apply_crypt_setup(key, client_nonce, server_nonce).await;
                Flow::Continue
            }
            ControlEvent::TunnelVoice(datagram) => match voice::decode_clientbound(&datagram) {
                Ok(VoicePacket::Opus {
                    session: Some(user_id),
                    target,
                    sequence,
                    is_last,
                    payload,
                }) => {
                    let frame = VoiceFrame {
                        user_id,
                        target,
                        sequence,
                        is_last,
                        opus: payload,
                    };
                    self.deliver_voice(frame).await
                }
                Ok(_) => Flow::Continue,
                Err(error) => {
                    debug!("dropping undecodable tunnelled datagram: {error}");
                    Flow::Continue
                }
            },
            ControlEvent::Disconnected(reason) => {
                let _ = self.events.send(SessionEvent::Closed(reason)).await;
                Flow::Stop
            }
        }
    }

    async fn on_udp(&mut self, event: UdpEvent) -> Flow {
        match event {
            UdpEvent::Ready => {
                self.fallback_at = None;
                self.emit(SessionEvent::UdpReady).await
            }
            UdpEvent::Voice(frame) => self.deliver_voice(frame).await,
            UdpEvent::Rtt { ms, stats } => self.emit(SessionEvent::UdpRtt { ms, stats }).await,
        }
    }

    async fn on_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::SendOpus { target, payload } => {
                if payload.len() > MAX_OPUS_PAYLOAD {
                    warn!("dropping oversized uplink frame of {} bytes", payload.len());
                    return;
                }
                self.send_voice(target, &payload, false);
            }
            SessionCommand::SendOpusEnd { target } => {
                self.send_voice(target, &[], true);
            }
            SessionCommand::JoinChannel { channel_id } => {
                let _ = self
                    .control_commands
                    .send(ControlCommand::JoinChannel { channel_id })
                    .await;
            }
            SessionCommand::SendText {
                message,
                channel_id,
                user_id,
            } => {
                let _ = self
                    .control_commands
                    .send(ControlCommand::SendText {
                        message,
                        channel_id,
                        user_id,
                    })
                    .await;
            }
        }
    }

    /// Builds the next outbound packet and sends it UDP-first. The sequence
    /// advances exactly once per frame whichever transport carries it.
    fn send_voice(&mut self, target: u8, payload: &[u8], is_last: bool) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let packet = voice::encode_client_opus(target, sequence, payload, is_last);

        let sent_udp = self
            .udp
            .as_ref()
            .map_or(false, |udp| udp.try_send_voice(&packet));
        if !sent_udp {
            // Same payload bytes over the tunnel. If even the control queue
            // is saturated the frame is dropped here; realtime beats backlog.
            let _ = self
                .control_commands
                .try_send(ControlCommand::SendTunnel { datagram: packet });
        }
    }

    async fn apply_crypt_setup(
        &mut self,
        key: Option<Vec<u8>>,
        client_nonce: Option<Vec<u8>>,
        server_nonce: Option<Vec<u8>>,
    ) {
        match (key, client_nonce, server_nonce) {
            (Some(key), Some(client_nonce), Some(server_nonce)) => {
                let (Ok(key), Ok(client_nonce), Ok(server_nonce)) = (
                    <[u8; 16]>::try_from(key),
                    <[u8; 16]>::try_from(client_nonce),
                    <[u8; 16]>::try_from(server_nonce),
                ) else {
                    warn!("dropping crypt setup with bad field lengths");
                    return;
                };
                if let Some(udp) = &self.udp {
                    udp.set_key(key, client_nonce, server_nonce);
                }
                // Give UDP a grace period before falling back to the tunnel.
                self.fallback_at = Some(Instant::now() + UDP_FALLBACK_TIMEOUT);
                self.fallback_probe_sent = false;
            }
            (None, _, Some(server_nonce)) => {
                let Ok(server_nonce) = <[u8; 16]>::try_from(server_nonce) else {
                    warn!("dropping crypt resync with bad nonce length");
                    return;
                };
                if let Some(udp) = &self.udp {
                    udp.set_decrypt_iv(server_nonce);
                }
            }
            _ => {
                // The server wants our nonce back.
                if let Some(iv) = self.udp.as_ref().and_then(|udp| udp.encrypt_iv()) {
                    let _ = self
                        .control_commands
                        .send(ControlCommand::SendCryptSetup {
                            client_nonce: iv.to_vec(),
                        })
                        .await;
                }
            }
        }
    }

    async fn fire_fallback(&mut self) {
        self.fallback_at = None;
        let ready = self.udp.as_ref().map_or(false, |udp| udp.is_ready());
        if ready || self.fallback_probe_sent {
            return;
        }
        self.fallback_probe_sent = true;
        // One tunnelled legacy ping tells the server to keep voice on TCP.
        let _ = self
            .control_commands
            .send(ControlCommand::SendTunnel {
                datagram: voice::encode_ping(now_ms()),
            })
            .await;
    }

    /// Dual-transport de-duplication by `(user, target, sequence)` within a
    /// one second window. Eviction is old-first, then a hard clear.
    async fn deliver_voice(&mut self, frame: VoiceFrame) -> Flow {
        let key = (frame.user_id, frame.target, frame.sequence);
        let now = Instant::now();
        if let Some(seen) = self.dedup.get(&key) {
            if now.duration_since(*seen) < DEDUP_WINDOW {
                return Flow::Continue;
            }
        }
        self.dedup.insert(key, now);

        if self.dedup.len() > DEDUP_SOFT_CAP {
            self.dedup
                .retain(|_, seen| now.duration_since(*seen) < DEDUP_EVICT_AGE);
            if self.dedup.len() > DEDUP_HARD_CAP {
                self.dedup.clear();
            }
        }

        self.emit(SessionEvent::Voice(frame)).await
    }
}
