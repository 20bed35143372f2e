//! Encrypted UDP voice client. Owns the session's `CryptState`, probes the
//! path with encrypted pings every 5 s and reports readiness after the first
//! successful decrypt. The TCP-fallback timer itself lives in the session
//! orchestrator; this module only supplies the state it watches.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::debug;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::mumble::crypt::CryptState;
use crate::mumble::events::UdpEvent;
use crate::mumble::voice::{self, VoicePacket};
use crate::transport::errors::TransportError;
use crate::transport::types::VoiceFrame;

const UDP_PING_INTERVAL: Duration = Duration::from_secs(5);
const MAX_PENDING_PINGS: usize = 10;
const RECV_BUFFER_LEN: usize = 1024;

/// How long the orchestrator waits after the crypt triple before probing the
/// TCP tunnel instead.
pub const UDP_FALLBACK_TIMEOUT: Duration = Duration::from_millis(2500);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum UdpState {
    NoKey = 0,
    KeyedNotReady = 1,
    UdpReady = 2,
}

impl UdpState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            2 => UdpState::UdpReady,
            1 => UdpState::KeyedNotReady,
            _ => UdpState::NoKey,
        }
    }
}

/// Connected UDP voice path for one session.
pub struct UdpVoiceClient {
    socket: Arc<UdpSocket>,
    crypt: Arc<Mutex<CryptState>>,
    state: Arc<AtomicU8>,
    recv_task: JoinHandle<()>,
    ping_task: JoinHandle<()>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, TransportError> {
    let mut fallback = None;
    let addrs = tokio::net::lookup_host((host, port)).await?;
    for addr in addrs {
        if addr.is_ipv4() {
            return Ok(addr);
        }
        fallback.get_or_insert(addr);
    }
    fallback.ok_or_else(|| {
        TransportError::InvalidConfig(format!("no address found for {host}:{port}"))
    })
}

impl UdpVoiceClient {
    /// Binds a socket in the server's address family and starts the receive
    /// and ping loops. Events flow until the client is shut down.
    pub async fn connect(
        host: &str,
        port: u16,
        events: mpsc::Sender<UdpEvent>,
    ) -> Result<Self, TransportError> {
        let remote = resolve(host, port).await?;
        let bind_addr: SocketAddr = if remote.is_ipv4() {
            "0.0.0.0:0".parse().expect("ipv4 bind addr")
        } else {
            "[::]:0".parse().expect("ipv6 bind addr")
        };
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        socket.connect(remote).await?;

        let crypt = Arc::new(Mutex::new(CryptState::new()));
        let state = Arc::new(AtomicU8::new(UdpState::NoKey as u8));
        let pending: Arc<Mutex<VecDeque<(u64, Instant)>>> = Arc::new(Mutex::new(VecDeque::new()));

        let recv_task = tokio::spawn(recv_loop(
            Arc::clone(&socket),
            Arc::clone(&crypt),
            Arc::clone(&state),
            Arc::clone(&pending),
            events,
        ));
        let ping_task = tokio::spawn(ping_loop(
            Arc::clone(&socket),
            Arc::clone(&crypt),
            Arc::clone(&state),
            pending,
        ));

        Ok(Self {
            socket,
            crypt,
            state,
            recv_task,
            ping_task,
        })
    }

    pub fn state(&self) -> UdpState {
        UdpState::from_raw(self.state.load(Ordering::SeqCst))
    }

    pub fn is_ready(&self) -> bool {
        self.state() == UdpState::UdpReady
    }

    /// Installs the crypt triple from a full `CryptSetup`.
    pub fn set_key(&self, key: [u8; 16], client_nonce: [u8; 16], server_nonce: [u8; 16]) {
        self.crypt
            .lock()
            .expect("crypt lock")
            .set_key(key, client_nonce, server_nonce);
        self.state
            .store(UdpState::KeyedNotReady as u8, Ordering::SeqCst);
    }

    /// Server-initiated resync: new decrypt IV, readiness drops until the
    /// next successful decrypt.
    pub fn set_decrypt_iv(&self, iv: [u8; 16]) {
        self.crypt.lock().expect("crypt lock").set_decrypt_iv(iv);
        let _ = self.state.compare_exchange(
            UdpState::UdpReady as u8,
            UdpState::KeyedNotReady as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Our current encrypt IV, for answering a server resync request.
    pub fn encrypt_iv(&self) -> Option<[u8; 16]> {
        let crypt = self.crypt.lock().expect("crypt lock");
        crypt.is_valid().then(|| crypt.encrypt_iv())
    }

    /// Encrypts and sends one voice datagram. `false` means the caller must
    /// fall back to the TCP tunnel for this packet.
    pub fn try_send_voice(&self, packet: &[u8]) -> bool {
        if self.state() != UdpState::UdpReady {
            return false;
        }
        let encrypted = self.crypt.lock().expect("crypt lock").encrypt(packet);
        match encrypted {
            Some(data) => self.socket.try_send(&data).is_ok(),
            None => false,
        }
    }

    /// Stops both loops. Idempotent; safe to call during teardown races.
    pub fn shutdown(&self) {
        self.recv_task.abort();
        self.ping_task.abort();
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    crypt: Arc<Mutex<CryptState>>,
    state: Arc<AtomicU8>,
    pending: Arc<Mutex<VecDeque<(u64, Instant)>>>,
    events: mpsc::Sender<UdpEvent>,
) {
    let mut buf = vec![0u8; RECV_BUFFER_LEN];
    loop {
        let len = match socket.recv(&mut buf).await {
            Ok(len) => len,
            Err(error) => {
                // Connected UDP sockets surface ICMP failures here; the path
                // simply stays not-ready until packets flow.
                debug!("udp recv error: {error}");
                continue;
            }
        };

        let plain = {
            let mut crypt = crypt.lock().expect("crypt lock");
            crypt.decrypt(&buf[..len])
        };
        let Some(plain) = plain else { continue };

        if state.swap(UdpState::UdpReady as u8, Ordering::SeqCst) != UdpState::UdpReady as u8
            && events.send(UdpEvent::Ready).await.is_err()
        {
            return;
        }

        match voice::decode_clientbound(&plain) {
            Ok(VoicePacket::Ping { timestamp }) => {
                let sent = {
                    let mut pending = pending.lock().expect("ping lock");
                    let found = pending
                        .iter()
                        .position(|(stamp, _)| *stamp == timestamp)
                        .map(|index| pending[index].1);
                    if found.is_some() {
                        pending.retain(|(stamp, _)| *stamp != timestamp);
                    }
                    found
                };
                if let Some(sent) = sent {
                    let stats = crypt.lock().expect("crypt lock").stats();
                    let ms = sent.elapsed().as_millis() as u64;
                    if events.send(UdpEvent::Rtt { ms, stats }).await.is_err() {
                        return;
                    }
                }
            }
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
                if events.send(UdpEvent::Voice(frame)).await.is_err() {
                    return;
                }
            }
            Ok(VoicePacket::Opus { session: None, .. }) => {
                debug!("dropping clientbound opus without session");
            }
            Err(error) => {
                debug!("dropping undecodable voice datagram: {error}");
            }
        }
    }
}

async fn ping_loop(
    socket: Arc<UdpSocket>,
    crypt: Arc<Mutex<CryptState>>,
    state: Arc<AtomicU8>,
    pending: Arc<Mutex<VecDeque<(u64, Instant)>>>,
) {
    let mut tick = tokio::time::interval(UDP_PING_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        if UdpState::from_raw(state.load(Ordering::SeqCst)) == UdpState::NoKey {
            continue;
        }

        let timestamp = now_ms();
        {
            let mut pending = pending.lock().expect("ping lock");
            pending.push_back((timestamp, Instant::now()));
            while pending.len() > MAX_PENDING_PINGS {
                pending.pop_front();
            }
        }

        let packet = voice::encode_ping(timestamp);
        let encrypted = {
            let mut crypt = crypt.lock().expect("crypt lock");
            crypt.encrypt(&packet)
        };
        if let Some(data) = encrypted {
            // Send failures are non-events; the next tick retries.
            let _ = socket.try_send(&data);
        }
    }
}
