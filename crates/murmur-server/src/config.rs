use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8081;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub port: u16,
    /// Outbound frames buffered per session before `send` waits.
    pub max_send_queue: usize,
    /// Inbound requests queued behind the one being relayed.
    pub inbound_queue: usize,
    pub heartbeat_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_send_queue: 256,
            inbound_queue: 8,
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}
