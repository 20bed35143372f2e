pub mod http;
pub mod metrics;
pub mod pacer;
pub mod peer;
pub mod supervisor;
pub mod whitelist;

use std::path::PathBuf;

use self::pacer::PacerConfig;
use self::whitelist::Whitelist;

pub const DEFAULT_PORT: u16 = 64737;

/// Process-level settings, resolved from the environment once at startup.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub port: u16,
    pub web_root: PathBuf,
    pub coop_coep: bool,
    pub pacer: PacerConfig,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let port = std::env::var("PORT")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);
        let web_root = std::env::var("WEB_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_web_root());
        Self {
            port,
            web_root,
            coop_coep: env_flag("COOP_COEP"),
            pacer: PacerConfig::from_env(),
        }
    }
}

fn env_flag(name: &str) -> bool {
    matches!(std::env::var(name).as_deref(), Ok("1"))
}

fn default_web_root() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|bin| bin.join("../../web/out")))
        .unwrap_or_else(|| PathBuf::from("web/out"))
}

/// Read-only after startup and shared by every peer task.
#[derive(Debug)]
pub struct GatewayContext {
    pub whitelist: Whitelist,
    pub config: GatewayConfig,
}

/// Path of the server whitelist file.
pub fn servers_config_path() -> PathBuf {
    std::env::var("SERVERS_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./config/servers.json"))
}
