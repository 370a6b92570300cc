//! Bridge configuration
//!
//! Supports configuration via:
//! 1. Builder methods (highest priority)
//! 2. Environment variables (BLOCKLY_BRIDGE_ADDR, BLOCKLY_BRIDGE_PORT)
//! 3. Default values (127.0.0.1:8765)

use std::env;
use std::time::Duration;

const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8765;
const DEFAULT_POLL_INTERVAL_MS: u64 = 5;
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 2_000;

/// Default upper bound for a single reassembled inbound message (1 MiB)
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// Configuration for the bridge transport
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Address the listen socket binds to (e.g., "127.0.0.1")
    pub bind_address: String,
    /// TCP port. 0 binds an ephemeral port.
    pub port: u16,
    /// How long the serve loop sleeps between polls when idle
    pub poll_interval: Duration,
    /// Upper bound on how long `stop` waits for the serve thread
    pub shutdown_timeout: Duration,
    /// Largest inbound message (after reassembly) the server accepts
    pub max_message_bytes: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let bind_address =
            env::var("BLOCKLY_BRIDGE_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDRESS.to_string());
        let port = match env::var("BLOCKLY_BRIDGE_PORT") {
            Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
                tracing::warn!(value = %raw, "ignoring invalid BLOCKLY_BRIDGE_PORT");
                DEFAULT_PORT
            }),
            Err(_) => DEFAULT_PORT,
        };
        Self {
            bind_address,
            port,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            shutdown_timeout: Duration::from_millis(DEFAULT_SHUTDOWN_TIMEOUT_MS),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

impl BridgeConfig {
    /// Create a new BridgeConfig with values from environment or defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bind address
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.bind_address = address.into();
        self
    }

    /// Set the TCP port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_max_message_bytes(mut self, max: usize) -> Self {
        self.max_message_bytes = max;
        self
    }

    /// "address:port" form used for binding and logging
    pub fn socket_addr_string(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}
