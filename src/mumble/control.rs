//! Mumble TLS control-plane client: `[u16 type | u32 length]` framing over
//! TLS, a curated message set, the channel/user registry, and the 10 s
//! keepalive. The client deliberately advertises protocol 1.4.0 so the
//! server keeps speaking legacy voice packets.

use std::collections::HashMap;
use std::pin::Pin;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use log::debug;
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_openssl::SslStream;
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::mumble::config::{AuthRequest, MumbleEndpoint};
use crate::mumble::events::{ControlEvent, DeniedEvent, DisconnectReason, TextEvent};
use crate::mumble::proto::{self, *};
use crate::mumble::state::{ChannelUpdate, Registry, UserUpdate};
use crate::transport::errors::TransportError;

/// Version advertised to the server: 1.4.0 as `(major<<16)|(minor<<8)|patch`.
pub const CLIENT_VERSION_V1: u32 = (1 << 16) | (4 << 8);

const PING_INTERVAL: Duration = Duration::from_secs(10);

/// Control messages never legitimately exceed this; anything larger is a
/// corrupt stream.
const MAX_FRAME_LEN: usize = 0x7f_ffff;

/// Framing codec for the control channel. Accumulates bytes and drains whole
/// `[u16 type | u32 length | payload]` messages.
#[derive(Debug, Default)]
pub struct ControlCodec;

impl ControlCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for ControlCodec {
    type Item = (u16, Bytes);
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 6 {
            return Ok(None);
        }
        let mut header = &src[..6];
        let message_type = header.get_u16();
        let length = header.get_u32() as usize;
        if length > MAX_FRAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("control frame of {length} bytes"),
            ));
        }
        if src.len() < 6 + length {
            src.reserve(6 + length - src.len());
            return Ok(None);
        }
        src.advance(6);
        let payload = src.split_to(length).freeze();
        Ok(Some((message_type, payload)))
    }
}

impl Encoder<(u16, Bytes)> for ControlCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: (u16, Bytes), dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (message_type, payload) = item;
        dst.reserve(6 + payload.len());
        dst.put_u16(message_type);
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}

/// Opens the TLS control connection to one endpoint.
pub async fn tls_connect(endpoint: &MumbleEndpoint) -> Result<SslStream<TcpStream>, TransportError> {
    let mut builder = SslConnector::builder(SslMethod::tls())
        .map_err(|err| TransportError::Io(format!("tls connector init failed: {err}")))?;
    if !endpoint.verify_tls {
        builder.set_verify(SslVerifyMode::NONE);
    }
    let connector = builder.build();
    let ssl = connector
        .configure()
        .map_err(|err| TransportError::Io(format!("tls configure failed: {err}")))?
        .into_ssl(&endpoint.host)
        .map_err(|err| TransportError::Io(format!("tls configure failed: {err}")))?;

    let tcp = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
    let mut stream = SslStream::new(ssl, tcp)
        .map_err(|err| TransportError::Io(format!("tls stream init failed: {err}")))?;
    Pin::new(&mut stream)
        .connect()
        .await
        .map_err(|err| TransportError::Io(format!("tls handshake failed: {err}")))?;
    Ok(stream)
}

/// Commands the session orchestrator feeds into the control client.
#[derive(Clone, Debug)]
pub enum ControlCommand {
    JoinChannel {
        channel_id: u32,
    },
    SendText {
        message: String,
        channel_id: Option<u32>,
        user_id: Option<u32>,
    },
    /// Reply to a server crypt-resync request with our encrypt IV.
    SendCryptSetup {
        client_nonce: Vec<u8>,
    },
    /// Ship a raw voice datagram over the TCP tunnel.
    SendTunnel {
        datagram: Bytes,
    },
}

/// Running control client. Dropping the handle does not stop the task; the
/// owner aborts it on teardown so in-flight writes cannot outlive a session.
pub struct ControlHandle {
    commands: mpsc::Sender<ControlCommand>,
    task: JoinHandle<()>,
}

impl ControlHandle {
    pub fn commands(&self) -> mpsc::Sender<ControlCommand> {
        self.commands.clone()
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Spawns the control client over an established stream. Generic so tests
/// can drive it over an in-memory duplex.
pub fn spawn_control<S>(
    stream: S,
    auth: AuthRequest,
    events: mpsc::Sender<ControlEvent>,
) -> ControlHandle
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (commands_tx, commands_rx) = mpsc::channel(64);
    let task = tokio::spawn(
        ControlTask {
            framed: Framed::new(stream, ControlCodec::new()),
            registry: Registry::new(),
            auth,
            self_session: None,
            pending_pings: HashMap::new(),
            events,
        }
        .run(commands_rx),
    );
    ControlHandle {
        commands: commands_tx,
        task,
    }
}

enum Flow {
    Continue,
    Stop,
}

struct ControlTask<S> {
    framed: Framed<S, ControlCodec>,
    registry: Registry,
    auth: AuthRequest,
    self_session: Option<u32>,
    pending_pings: HashMap<u64, Instant>,
    events: mpsc::Sender<ControlEvent>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

impl<S> ControlTask<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn run(mut self, mut commands: mpsc::Receiver<ControlCommand>) {
        if let Err(error) = self.send_handshake().await {
            let _ = self
                .events
                .send(ControlEvent::Disconnected(DisconnectReason::ConnectionLost(
                    error.to_string(),
                )))
                .await;
            return;
        }

        let mut keepalive = tokio::time::interval_at(
            tokio::time::Instant::now() + PING_INTERVAL,
            PING_INTERVAL,
        );
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                frame = self.framed.next() => {
                    let flow = match frame {
                        Some(Ok((message_type, payload))) => {
                            self.handle_frame(message_type, payload).await
                        }
                        Some(Err(error)) => {
                            let _ = self
                                .events
                                .send(ControlEvent::Disconnected(
                                    DisconnectReason::ConnectionLost(error.to_string()),
                                ))
                                .await;
                            break;
                        }
                        None => {
                            let _ = self
                                .events
                                .send(ControlEvent::Disconnected(DisconnectReason::Closed))
                                .await;
                            break;
                        }
                    };
                    match flow {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Stop) | Err(_) => break,
                    }
                }
                command = commands.recv() => {
                    match command {
                        Some(command) => {
                            if self.handle_command(command).await.is_err() {
                                break;
                            }
                        }
                        // Owner gone: tear down quietly.
                        None => break,
                    }
                }
                _ = keepalive.tick() => {
                    if self.send_ping().await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    async fn send_handshake(&mut self) -> Result<(), TransportError> {
        let version = proto::Version {
            version_v1: Some(CLIENT_VERSION_V1),
            release: Some(format!("mumble-web-gateway {}", env!("CARGO_PKG_VERSION"))),
            os: Some(std::env::consts::OS.to_string()),
            os_version: None,
        };
        self.send_frame(MSG_VERSION, version.encode()).await?;

        let authenticate = Authenticate {
            username: Some(self.auth.username.clone()),
            password: self.auth.password.clone(),
            tokens: self.auth.tokens.clone(),
            opus: true,
            client_type: 0,
        };
        self.send_frame(MSG_AUTHENTICATE, authenticate.encode())
            .await
    }

    async fn send_frame(&mut self, message_type: u16, payload: Bytes) -> Result<(), TransportError> {
        self.framed
            .send((message_type, payload))
            .await
            .map_err(|err| TransportError::Io(err.to_string()))
    }

    async fn send_ping(&mut self) -> Result<(), TransportError> {
        let timestamp = now_ms();
        self.pending_pings.insert(timestamp, Instant::now());
        // Bound the map in case the server stops echoing.
        if self.pending_pings.len() > 16 {
            let oldest = self
                .pending_pings
                .iter()
                .min_by_key(|(_, sent)| **sent)
                .map(|(stamp, _)| *stamp);
            if let Some(stamp) = oldest {
                self.pending_pings.remove(&stamp);
            }
        }
        let ping = Ping {
            timestamp: Some(timestamp),
        };
        self.send_frame(MSG_PING, ping.encode()).await
    }

    async fn emit(&mut self, event: ControlEvent) -> Result<(), ()> {
        self.events.send(event).await.map_err(|_| ())
    }

    async fn handle_command(&mut self, command: ControlCommand) -> Result<(), ()> {
        let result = match command {
            ControlCommand::JoinChannel { channel_id } => {
                // Before ServerSync the session field is omitted; the server
                // applies it by connection identity.
                let payload = UserState::encode_join(self.self_session, channel_id);
                self.send_frame(MSG_USER_STATE, payload).await
            }
            ControlCommand::SendText {
                message,
                channel_id,
                user_id,
            } => {
                let mut text = TextMessage {
                    message: Some(message),
                    ..Default::default()
                };
                if let Some(user_id) = user_id {
                    text.sessions.push(user_id);
                } else {
                    let channel = channel_id.unwrap_or_else(|| self.own_channel());
                    text.channel_ids.push(channel);
                }
                self.send_frame(MSG_TEXT_MESSAGE, text.encode()).await
            }
            ControlCommand::SendCryptSetup { client_nonce } => {
                let setup = CryptSetup {
                    key: None,
                    client_nonce: Some(client_nonce),
                    server_nonce: None,
                };
                self.send_frame(MSG_CRYPT_SETUP, setup.encode()).await
            }
            ControlCommand::SendTunnel { datagram } => {
                self.send_frame(MSG_UDP_TUNNEL, datagram).await
            }
        };
        match result {
            Ok(()) => Ok(()),
            Err(error) => {
                let _ = self
                    .events
                    .send(ControlEvent::Disconnected(DisconnectReason::ConnectionLost(
                        error.to_string(),
                    )))
                    .await;
                Err(())
            }
        }
    }

    fn own_channel(&self) -> u32 {
        self.self_session
            .and_then(|session| self.registry.user(session))
            .map(|user| user.channel_id)
            .unwrap_or(0)
    }

    async fn handle_frame(&mut self, message_type: u16, payload: Bytes) -> Result<Flow, ()> {
        match message_type {
            MSG_VERSION => {
                if let Ok(version) = Version::decode(&payload) {
                    let text = version.release.or_else(|| {
                        version.version_v1.map(|v| {
                            format!("{}.{}.{}", v >> 16, (v >> 8) & 0xff, v & 0xff)
                        })
                    });
                    self.registry.info_mut().server_version = text;
                }
            }
            MSG_UDP_TUNNEL => {
                self.emit(ControlEvent::TunnelVoice(payload)).await?;
            }
            MSG_PING => {
                if let Ok(ping) = Ping::decode(&payload) {
                    if let Some(timestamp) = ping.timestamp {
                        if let Some(sent) = self.pending_pings.remove(&timestamp) {
                            let ms = sent.elapsed().as_millis() as u64;
                            self.emit(ControlEvent::Rtt { ms }).await?;
                        }
                    }
                }
            }
            MSG_REJECT => {
                let reason = match Reject::decode(&payload) {
                    Ok(reject) => reject
                        .reason
                        .filter(|reason| !reason.is_empty())
                        .unwrap_or_else(|| {
                            reject_type_name(reject.reject_type.unwrap_or(0)).to_string()
                        }),
                    Err(_) => "rejected".to_string(),
                };
                self.emit(ControlEvent::Disconnected(DisconnectReason::Rejected {
                    reason,
                }))
                .await?;
                return Ok(Flow::Stop);
            }
            MSG_SERVER_SYNC => {
                if let Ok(sync) = ServerSync::decode(&payload) {
                    let info = self.registry.info_mut();
                    if let Some(session) = sync.session {
                        info.self_user_id = session;
                        self.self_session = Some(session);
                    }
                    info.max_bandwidth = sync.max_bandwidth;
                    info.welcome_message = sync.welcome_text;
                    info.root_channel_id = 0;
                    let event = ControlEvent::Synced {
                        info: self.registry.info().clone(),
                        channels: self.registry.channels_snapshot(),
                        users: self.registry.users_snapshot(),
                    };
                    self.emit(event).await?;
                }
            }
            MSG_CHANNEL_REMOVE => {
                if let Ok(remove) = ChannelRemove::decode(&payload) {
                    if let Some(id) = remove.channel_id {
                        if self.registry.apply_channel_remove(id) {
                            self.emit(ControlEvent::ChannelRemoved(id)).await?;
                        }
                    }
                }
            }
            MSG_CHANNEL_STATE => {
                if let Ok(state) = ChannelState::decode(&payload) {
                    if let Some(id) = state.channel_id {
                        let update = ChannelUpdate {
                            id,
                            name: state.name,
                            parent_id: state.parent,
                            position: state.position,
                            description: state.description,
                            links: state.has_links.then_some(state.links),
                            links_add: state.links_add,
                            links_remove: state.links_remove,
                        };
                        let merged = self.registry.apply_channel_update(update);
                        self.emit(ControlEvent::ChannelUpsert(merged)).await?;
                    }
                }
            }
            MSG_USER_REMOVE => {
                if let Ok(remove) = UserRemove::decode(&payload) {
                    if let Some(id) = remove.session {
                        if self.registry.apply_user_remove(id) {
                            self.emit(ControlEvent::UserRemoved(id)).await?;
                        }
                    }
                }
            }
            MSG_USER_STATE => {
                if let Ok(state) = UserState::decode(&payload) {
                    if let Some(id) = state.session {
                        let update = UserUpdate {
                            id,
                            name: state.name,
                            channel_id: state.channel_id,
                            mute: state.mute,
                            deaf: state.deaf,
                            suppress: state.suppress,
                            self_mute: state.self_mute,
                            self_deaf: state.self_deaf,
                        };
                        let merged = self.registry.apply_user_update(update);
                        self.emit(ControlEvent::UserUpsert(merged)).await?;
                    }
                }
            }
            MSG_TEXT_MESSAGE => {
                if let Ok(text) = TextMessage::decode(&payload) {
                    let event = TextEvent {
                        sender_id: text.actor,
                        message: text.message.unwrap_or_default(),
                        target_users: text.sessions,
                        target_channels: text.channel_ids,
                        target_trees: text.tree_ids,
                    };
                    self.emit(ControlEvent::Text(event)).await?;
                }
            }
            MSG_PERMISSION_DENIED => {
                if let Ok(denied) = PermissionDenied::decode(&payload) {
                    let event = DeniedEvent {
                        reason: denied.reason.or(denied.name),
                        deny_type: denied.deny_type,
                        channel_id: denied.channel_id,
                    };
                    self.emit(ControlEvent::Denied(event)).await?;
                }
            }
            MSG_CRYPT_SETUP => {
                if let Ok(setup) = CryptSetup::decode(&payload) {
                    self.emit(ControlEvent::CryptSetup {
                        key: setup.key,
                        client_nonce: setup.client_nonce,
                        server_nonce: setup.server_nonce,
                    })
                    .await?;
                }
            }
            MSG_CODEC_VERSION => {
                if let Ok(codec) = CodecVersion::decode(&payload) {
                    self.registry.info_mut().opus = codec.opus.unwrap_or(false);
                }
            }
            other => {
                debug!("ignoring control message type {other}");
            }
        }
        Ok(Flow::Continue)
    }
}

fn reject_type_name(reject_type: u32) -> &'static str {
    match reject_type {
        1 => "wrong protocol version",
        2 => "invalid username",
        3 => "wrong user password",
        4 => "wrong server password",
        5 => "username already in use",
        6 => "server is full",
        7 => "certificate required",
        8 => "authenticator failure",
        _ => "rejected",
    }
}
