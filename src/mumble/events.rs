use bytes::Bytes;

use crate::mumble::crypt::CryptStats;
use crate::transport::types::{Channel, ServerInfo, User, VoiceFrame};

/// A text message delivered from the server, with the routing the sender
/// used.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextEvent {
    pub sender_id: Option<u32>,
    pub message: String,
    pub target_users: Vec<u32>,
    pub target_channels: Vec<u32>,
    pub target_trees: Vec<u32>,
}

/// A `PermissionDenied` from the server. Informational; the session keeps
/// running.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeniedEvent {
    pub reason: Option<String>,
    pub deny_type: Option<u32>,
    pub channel_id: Option<u32>,
}

/// Why a session ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The server refused the session with a `Reject` message.
    Rejected { reason: String },
    /// The TLS stream failed or closed unexpectedly.
    ConnectionLost(String),
    /// Clean end of stream.
    Closed,
}

/// Events emitted by the TLS control client.
#[derive(Clone, Debug)]
pub enum ControlEvent {
    /// `ServerSync` arrived; the session is live. Carries the registry
    /// snapshot taken at that instant.
    Synced {
        info: ServerInfo,
        channels: Vec<Channel>,
        users: Vec<User>,
    },
    ChannelUpsert(Channel),
    ChannelRemoved(u32),
    UserUpsert(User),
    UserRemoved(u32),
    Text(TextEvent),
    Denied(DeniedEvent),
    /// Any `CryptSetup` flavor: full triple, server-nonce resync, or an
    /// empty request for our nonce.
    CryptSetup {
        key: Option<Vec<u8>>,
        client_nonce: Option<Vec<u8>>,
        server_nonce: Option<Vec<u8>>,
    },
    /// Raw voice datagram tunnelled over the control channel.
    TunnelVoice(Bytes),
    /// Control-plane keepalive round trip completed.
    Rtt { ms: u64 },
    Disconnected(DisconnectReason),
}

/// Events emitted by the UDP voice client.
#[derive(Clone, Debug)]
pub enum UdpEvent {
    Voice(VoiceFrame),
    /// First successful decrypt: the UDP path is usable.
    Ready,
    Rtt { ms: u64, stats: CryptStats },
}

/// Events the session orchestrator surfaces to its owner.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    /// One deduplicated Opus frame, whichever transport carried it.
    Voice(VoiceFrame),
    ChannelUpsert(Channel),
    ChannelRemoved(u32),
    UserUpsert(User),
    UserRemoved(u32),
    Text(TextEvent),
    Denied(DeniedEvent),
    ServerRtt { ms: u64 },
    UdpRtt { ms: u64, stats: CryptStats },
    UdpReady,
    Closed(DisconnectReason),
}
