//! The browser-facing wire format: a JSON control envelope on text frames
//! and a compact little-endian voice envelope on binary frames, multiplexed
//! over one WebSocket.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::transport::errors::CodecError;
use crate::transport::types::{Channel, User, VoiceFrame};

/// Uplink end-of-talk, no payload.
pub const VOICE_KIND_UPLINK_END: u8 = 0x03;
/// Downlink Opus, 11-byte header.
pub const VOICE_KIND_DOWNLINK_OPUS: u8 = 0x11;
/// Uplink Opus, 4-byte header.
pub const VOICE_KIND_UPLINK_OPUS: u8 = 0x12;

const DOWNLINK_HEADER_LEN: usize = 11;
const UPLINK_HEADER_LEN: usize = 4;

/// Control messages a peer may send.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Connect {
        server_id: String,
        username: String,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        tokens: Vec<String>,
    },
    Disconnect,
    #[serde(rename_all = "camelCase")]
    JoinChannel { channel_id: u32 },
    #[serde(rename_all = "camelCase")]
    TextSend {
        message: String,
        #[serde(default)]
        channel_id: Option<u32>,
        #[serde(default)]
        user_id: Option<u32>,
    },
    #[serde(rename_all = "camelCase")]
    Ping { client_time_ms: u64 },
}

/// One whitelisted server as shown to peers. Host and port stay inside the
/// process.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct ServerSummary {
    pub id: String,
    pub name: String,
}

/// Per-interval metrics pushed to the peer every two seconds and on each
/// server RTT update.
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsReport {
    pub voice_uplink_frames: u64,
    pub voice_uplink_fps: f64,
    pub voice_uplink_kbps: f64,
    pub voice_uplink_pacer_dropped_frames_total: u64,
    pub voice_downlink_frames: u64,
    pub voice_downlink_fps: f64,
    pub voice_downlink_kbps: f64,
    pub voice_downlink_dropped_frames: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_rtt_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub udp_rtt_ms: Option<u64>,
    pub udp_ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crypt_good: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crypt_late: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crypt_lost: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crypt_resyncs: Option<u32>,
}

/// Control messages the gateway sends to a peer. Everything here is plain
/// data so serialization cannot trip over exotic values.
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    ServerList {
        servers: Vec<ServerSummary>,
    },
    #[serde(rename_all = "camelCase")]
    Connected {
        server_id: String,
        self_user_id: u32,
        root_channel_id: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        welcome_message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        server_version: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        max_bandwidth: Option<u32>,
    },
    StateSnapshot {
        channels: Vec<Channel>,
        users: Vec<User>,
    },
    ChannelUpsert {
        channel: Channel,
    },
    #[serde(rename_all = "camelCase")]
    ChannelRemove {
        channel_id: u32,
    },
    UserUpsert {
        user: User,
    },
    #[serde(rename_all = "camelCase")]
    UserRemove {
        user_id: u32,
    },
    #[serde(rename_all = "camelCase")]
    TextRecv {
        #[serde(skip_serializing_if = "Option::is_none")]
        sender_id: Option<u32>,
        message: String,
        target_users: Vec<u32>,
        target_channels: Vec<u32>,
        target_trees: Vec<u32>,
        timestamp_ms: u64,
    },
    Metrics(MetricsReport),
    #[serde(rename_all = "camelCase")]
    Pong {
        client_time_ms: u64,
        server_time_ms: u64,
    },
    Disconnected {
        reason: String,
    },
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },
}

impl ServerMessage {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

/// A decoded uplink voice frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UplinkFrame {
    Opus { target: u8, opus: Bytes },
    End,
}

/// Decodes one binary frame from the peer. The Opus payload is copied out of
/// the socket buffer; downstream queues hold it across awaits.
pub fn decode_uplink(data: &[u8]) -> Result<UplinkFrame, CodecError> {
    let kind = *data.first().ok_or(CodecError::Truncated)?;
    match kind {
        VOICE_KIND_UPLINK_END => Ok(UplinkFrame::End),
        VOICE_KIND_UPLINK_OPUS => {
            if data.len() < UPLINK_HEADER_LEN {
                return Err(CodecError::Truncated);
            }
            Ok(UplinkFrame::Opus {
                target: data[1] & 0x1f,
                opus: Bytes::copy_from_slice(&data[UPLINK_HEADER_LEN..]),
            })
        }
        _ => Err(CodecError::Malformed("voice envelope kind")),
    }
}

/// Encodes one downlink Opus frame. The sequence truncates to u32; the peer
/// only uses it for jitter tracking. Only the low flag bit is assigned, the
/// rest stay reserved.
pub fn encode_downlink(frame: &VoiceFrame) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(DOWNLINK_HEADER_LEN + frame.opus.len());
    buf.put_u8(VOICE_KIND_DOWNLINK_OPUS);
    buf.put_u32_le(frame.user_id);
    buf.put_u8(frame.target & 0x1f);
    buf.put_u8(u8::from(frame.is_last));
    buf.put_u32_le((frame.sequence & 0xffff_ffff) as u32);
    buf.put_slice(&frame.opus);
    buf.to_vec()
}

#[cfg(test)]
mod tests {
    use super::{
        decode_uplink, encode_downlink, ClientMessage, ServerMessage, ServerSummary, UplinkFrame,
    };
    use crate::transport::errors::CodecError;
    use crate::transport::types::VoiceFrame;
    use bytes::Bytes;

    /// A connect message deserializes with optional fields defaulted.
    #[test]
    fn connect_message_deserializes() {
        // Arrange
        let json = r#"{"type":"connect","serverId":"local","username":"alice"}"#;
        // Act
        let message: ClientMessage = serde_json::from_str(json).expect("parse failed");
        // Assert
        assert_eq!(
            message,
            ClientMessage::Connect {
                server_id: "local".to_string(),
                username: "alice".to_string(),
                password: None,
                tokens: Vec::new(),
            }
        );
    }

    /// The remaining peer message kinds parse from their camelCase tags.
    #[test]
    fn peer_message_tags_parse() {
        // Arrange / Act / Assert
        assert_eq!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"disconnect"}"#).expect("parse"),
            ClientMessage::Disconnect
        );
        assert_eq!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"joinChannel","channelId":3}"#)
                .expect("parse"),
            ClientMessage::JoinChannel { channel_id: 3 }
        );
        assert_eq!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"ping","clientTimeMs":123}"#)
                .expect("parse"),
            ClientMessage::Ping { client_time_ms: 123 }
        );
    }

    /// Unknown message types fail to parse instead of being misrouted.
    #[test]
    fn unknown_type_is_an_error() {
        // Arrange
        let json = r#"{"type":"selfDestruct"}"#;
        // Act
        let result = serde_json::from_str::<ClientMessage>(json);
        // Assert
        assert!(result.is_err());
    }

    /// Outgoing messages carry the camelCase type tag and fields.
    #[test]
    fn server_message_serializes_camel_case() {
        // Arrange
        let message = ServerMessage::Connected {
            server_id: "local".to_string(),
            self_user_id: 7,
            root_channel_id: 0,
            welcome_message: None,
            server_version: Some("1.4.287".to_string()),
            max_bandwidth: Some(72_000),
        };
        // Act
        let json = serde_json::to_value(&message).expect("serialize failed");
        // Assert
        assert_eq!(json["type"], "connected");
        assert_eq!(json["selfUserId"], 7);
        assert_eq!(json["rootChannelId"], 0);
        assert_eq!(json["serverVersion"], "1.4.287");
        assert!(json.get("welcomeMessage").is_none());
    }

    /// serverList only ever exposes id and name.
    #[test]
    fn server_list_hides_endpoints() {
        // Arrange
        let message = ServerMessage::ServerList {
            servers: vec![ServerSummary {
                id: "local".to_string(),
                name: "Local".to_string(),
            }],
        };
        // Act
        let json = serde_json::to_string(&message).expect("serialize failed");
        // Assert
        assert_eq!(
            json,
            r#"{"type":"serverList","servers":[{"id":"local","name":"Local"}]}"#
        );
    }

    /// The downlink envelope is byte-exact: kind, LE user id, target, flags,
    /// LE sequence, payload.
    #[test]
    fn downlink_envelope_layout() {
        // Arrange
        let frame = VoiceFrame {
            user_id: 7,
            target: 0,
            sequence: 42,
            is_last: false,
            opus: Bytes::from(vec![0xab; 32]),
        };
        // Act
        let encoded = encode_downlink(&frame);
        // Assert
        let mut expected = vec![
            0x11, 0x07, 0x00, 0x00, 0x00, 0x00, 0x00, 0x2a, 0x00, 0x00, 0x00,
        ];
        expected.extend([0xab; 32]);
        assert_eq!(encoded, expected);
    }

    /// The last-frame flag occupies the low bit only.
    #[test]
    fn downlink_flags_use_low_bit() {
        // Arrange
        let frame = VoiceFrame {
            user_id: 1,
            target: 0x1f,
            sequence: u64::from(u32::MAX) + 5,
            is_last: true,
            opus: Bytes::new(),
        };
        // Act
        let encoded = encode_downlink(&frame);
        // Assert
        assert_eq!(encoded[5], 0x1f);
        assert_eq!(encoded[6], 0x01);
        // The sequence truncated to u32.
        assert_eq!(&encoded[7..11], &[0x04, 0x00, 0x00, 0x00]);
    }

    /// Uplink frames decode and copy their payload.
    #[test]
    fn uplink_opus_decodes_with_copy() {
        // Arrange
        let mut data = vec![0x12, 0x05, 0x00, 0x00];
        data.extend([0xcd; 16]);
        // Act
        let frame = decode_uplink(&data).expect("decode failed");
        // Assert
        match frame {
            UplinkFrame::Opus { target, opus } => {
                assert_eq!(target, 5);
                assert_eq!(&opus[..], &[0xcd; 16]);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    /// End-of-talk is a single byte.
    #[test]
    fn uplink_end_decodes() {
        // Arrange
        // Act / Assert
        assert_eq!(decode_uplink(&[0x03]).expect("decode"), UplinkFrame::End);
        assert_eq!(decode_uplink(&[]), Err(CodecError::Truncated));
        assert_eq!(
            decode_uplink(&[0x12, 0x00]),
            Err(CodecError::Truncated)
        );
        assert!(decode_uplink(&[0x99]).is_err());
    }

    /// Unknown target bits are masked off on decode.
    #[test]
    fn uplink_target_is_masked() {
        // Arrange
        let data = [0x12, 0xff, 0x00, 0x00];
        // Act
        let frame = decode_uplink(&data).expect("decode failed");
        // Assert
        assert_eq!(
            frame,
            UplinkFrame::Opus {
                target: 0x1f,
                opus: Bytes::new(),
            }
        );
    }
}
