pub mod gateway;
pub mod mumble;
pub mod transport;

/// Log level for the gateway process. `GATEWAY_DEBUG=1` turns on debug
/// logging for the voice path; everything else stays at info.
pub fn log_level() -> log::LevelFilter {
    if matches!(std::env::var("GATEWAY_DEBUG").as_deref(), Ok("1")) {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    }
}
