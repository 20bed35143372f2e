pub mod config;
pub mod control;
pub mod crypt;
pub mod events;
pub mod proto;
pub mod session;
pub mod state;
pub mod udp;
pub mod varint;
pub mod voice;

pub use config::{AuthRequest, MumbleEndpoint, DEFAULT_PORT};
pub use control::{tls_connect, ControlCommand, ControlHandle};
pub use crypt::{CryptState, CryptStats};
pub use events::{
    ControlEvent, DeniedEvent, DisconnectReason, SessionEvent, TextEvent, UdpEvent,
};
pub use session::{Session, SessionCommand, HANDSHAKE_TIMEOUT};
pub use state::Registry;
pub use udp::{UdpState, UdpVoiceClient};
