use crate::transport::errors::TransportError;

pub const DEFAULT_PORT: u16 = 64738;

/// Where and how to reach one Mumble server. Produced by whitelist
/// resolution; peers never supply host or port directly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MumbleEndpoint {
    pub host: String,
    pub port: u16,
    /// Verify the server certificate. `false` is permitted for self-signed
    /// test servers only.
    pub verify_tls: bool,
}

impl MumbleEndpoint {
    pub fn new(host: String, port: u16) -> Self {
        Self {
            host,
            port,
            verify_tls: true,
        }
    }
}

/// Credentials a peer supplies for one session. Tokens and password are
/// passed through to the server unchanged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthRequest {
    pub username: String,
    pub password: Option<String>,
    pub tokens: Vec<String>,
}

impl AuthRequest {
    /// Rejects requests that could never authenticate before any socket is
    /// opened.
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.username.trim().is_empty() {
            return Err(TransportError::InvalidConfig(
                "username is required".to_string(),
            ));
        }
        Ok(())
    }
}
