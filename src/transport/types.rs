use std::collections::BTreeSet;

use bytes::Bytes;
use serde::Serialize;

/// A Mumble channel as tracked by the registry and mirrored to peers.
/// Channel 0 is the root and always exists; its `parent_id` is `None`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: u32,
    pub name: String,
    pub parent_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub links: BTreeSet<u32>,
}

/// A connected Mumble user. The server omits `channel_id` for users still in
/// root, so the registry defaults it to 0 on first sight and preserves the
/// previous value on later partial updates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: u32,
    pub name: String,
    pub channel_id: u32,
    pub mute: bool,
    pub deaf: bool,
    pub suppress: bool,
    pub self_mute: bool,
    pub self_deaf: bool,
}

/// Session-scoped facts learned during the handshake, populated from
/// `Version`, `ServerSync` and `CodecVersion`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServerInfo {
    pub welcome_message: Option<String>,
    pub max_bandwidth: Option<u32>,
    pub server_version: Option<String>,
    pub opus: bool,
    pub self_user_id: u32,
    pub root_channel_id: u32,
}

/// One decoded Opus frame travelling server -> gateway, regardless of which
/// transport carried it. The payload is an owned copy; it never aliases a
/// socket buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VoiceFrame {
    pub user_id: u32,
    pub target: u8,
    pub sequence: u64,
    pub is_last: bool,
    pub opus: Bytes,
}
