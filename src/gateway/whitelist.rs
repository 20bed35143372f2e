//! The server whitelist. Peers select a `serverId`; host, port and TLS
//! posture only ever come from this file. There is no way for a peer to
//! inject an arbitrary endpoint.

use std::path::Path;

use serde::Deserialize;

use crate::gateway::peer::ServerSummary;
use crate::mumble::config::MumbleEndpoint;
use crate::transport::errors::TransportError;

#[derive(Debug, Deserialize)]
struct ServersFile {
    servers: Vec<ServerEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerEntry {
    id: String,
    name: String,
    host: String,
    port: u16,
    #[serde(default)]
    tls: Option<TlsEntry>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TlsEntry {
    #[serde(default)]
    reject_unauthorized: Option<bool>,
}

/// One resolvable whitelist entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WhitelistedServer {
    pub id: String,
    pub name: String,
    pub endpoint: MumbleEndpoint,
}

/// Process-wide, read-only after startup.
#[derive(Clone, Debug, Default)]
pub struct Whitelist {
    entries: Vec<WhitelistedServer>,
}

impl Whitelist {
    pub fn from_json(text: &str) -> Result<Self, TransportError> {
        let file: ServersFile = serde_json::from_str(text)
            .map_err(|err| TransportError::InvalidConfig(format!("servers file: {err}")))?;

        let mut entries: Vec<WhitelistedServer> = Vec::with_capacity(file.servers.len());
        for server in file.servers {
            if server.id.is_empty() {
                return Err(TransportError::InvalidConfig(
                    "servers file: empty server id".to_string(),
                ));
            }
            if entries.iter().any(|entry| entry.id == server.id) {
                return Err(TransportError::InvalidConfig(format!(
                    "servers file: duplicate server id {:?}",
                    server.id
                )));
            }
            let verify_tls = server
                .tls
                .and_then(|tls| tls.reject_unauthorized)
                .unwrap_or(true);
            entries.push(WhitelistedServer {
                id: server.id,
                name: server.name,
                endpoint: MumbleEndpoint {
                    host: server.host,
                    port: server.port,
                    verify_tls,
                },
            });
        }
        Ok(Self { entries })
    }

    pub fn load(path: &Path) -> Result<Self, TransportError> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            TransportError::InvalidConfig(format!("servers file {}: {err}", path.display()))
        })?;
        Self::from_json(&text)
    }

    pub fn resolve(&self, id: &str) -> Option<&WhitelistedServer> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    pub fn summaries(&self) -> Vec<ServerSummary> {
        self.entries
            .iter()
            .map(|entry| ServerSummary {
                id: entry.id.clone(),
                name: entry.name.clone(),
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
