// MIT License - Copyright (c) 2021 TJForc
// Bridge configuration and builder

use std::path::PathBuf;

use tokio::time::Duration;

/// How the bridge learns about panel-side changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// The gateway pushes `msgCOS.ALL`, `msg.MONITOR` and `msg.error`;
    /// the polling tick only sends heartbeats and reconciles.
    Push,
    /// No push stream; the polling tick pages `get.liveEvents` itself.
    Poll,
}

/// Bounds for control-session state polling.
///
/// Each poll waits `initial_backoff_ms * 2^attempt`, capped at
/// `max_backoff_ms`. The loop gives up after `max_attempts` polls or once
/// `deadline_ms` has elapsed, whichever comes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub deadline_ms: u64,
    /// Upper bound on pages fetched by any `next`-style paging loop
    pub max_pages: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 60,
            initial_backoff_ms: 100,
            max_backoff_ms: 2000,
            deadline_ms: 60_000,
            max_pages: 64,
        }
    }
}

impl PollPolicy {
    /// Delay before poll number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(20)).unwrap_or(u64::MAX);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

/// External gateway process settings.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Executable to launch (the gateway is a .NET assembly run under mono)
    pub executable: String,
    /// Arguments placed before `-p <port> -d <driver>`
    pub args: Vec<String>,
    /// Driver file passed with `-d`
    pub driver: String,
    /// Working directory for the process; `None` inherits ours
    pub working_dir: Option<PathBuf>,
    /// Stdout line that signals the gateway is accepting connections.
    /// `None` treats the process as ready as soon as it is spawned.
    pub ready_marker: Option<String>,
    pub ready_timeout_ms: u64,
    /// Kill leftover instances with the same command line before starting
    pub kill_stale: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            executable: "mono".to_string(),
            args: vec!["--debug".to_string(), "ATSAdvancedGateway.exe".to_string()],
            driver: "ats.advanced.drv".to_string(),
            working_dir: None,
            ready_marker: None,
            ready_timeout_ms: 30_000,
            kill_stale: true,
        }
    }
}

/// Configuration for one panel bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Panel IP address or host name, as seen by the gateway
    pub panel_host: String,
    /// Panel TCP port (default: 32000)
    pub panel_port: u16,
    /// Panel encryption password (default: 0000)
    pub panel_password: String,
    /// User PIN used for `device.getConnect`
    pub user_pin: String,
    /// Panel heartbeat in milliseconds
    pub heartbeat_ms: u32,
    pub retries: u32,
    /// Panel-side timeout in milliseconds
    pub timeout_ms: u32,
    /// Host the gateway listens on
    pub gateway_host: String,
    /// Port the gateway listens on (`-p`)
    pub gateway_port: u16,
    pub gateway: GatewayConfig,
    /// Per-request timeout on our side of the transport
    pub request_timeout_ms: u64,
    /// Bring-up tick interval
    pub connection_interval_ms: u64,
    /// Polling tick interval
    pub polling_interval_ms: u64,
    /// Pause between `start.MONITOR` and `open.LOG`
    pub logs_settle_delay_ms: u64,
    pub mode: TransportMode,
    pub session_policy: PollPolicy,
    /// Broadcast channel capacity for panel events
    pub event_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            panel_host: "192.168.0.100".to_string(),
            panel_port: 32000,
            panel_password: "0000".to_string(),
            user_pin: String::new(),
            heartbeat_ms: 1000,
            retries: 1,
            timeout_ms: 2000,
            gateway_host: "127.0.0.1".to_string(),
            gateway_port: 8080,
            gateway: GatewayConfig::default(),
            request_timeout_ms: 10_000,
            connection_interval_ms: 5000,
            polling_interval_ms: 300_000,
            logs_settle_delay_ms: 2000,
            mode: TransportMode::Push,
            session_policy: PollPolicy::default(),
            event_capacity: 256,
        }
    }
}

impl BridgeConfig {
    /// Create a new config builder starting from defaults.
    pub fn builder() -> BridgeConfigBuilder {
        BridgeConfigBuilder::default()
    }

    pub fn gateway_address(&self) -> String {
        format!("{}:{}", self.gateway_host, self.gateway_port)
    }
}

/// Builder for BridgeConfig.
#[derive(Debug, Clone, Default)]
pub struct BridgeConfigBuilder {
    config: BridgeConfig,
}

impl BridgeConfigBuilder {
    pub fn panel_host(mut self, host: impl Into<String>) -> Self {
        self.config.panel_host = host.into();
        self
    }

    pub fn panel_port(mut self, port: u16) -> Self {
        self.config.panel_port = port;
        self
    }

    pub fn panel_password(mut self, password: impl Into<String>) -> Self {
        self.config.panel_password = password.into();
        self
    }

    pub fn user_pin(mut self, pin: impl Into<String>) -> Self {
        self.config.user_pin = pin.into();
        self
    }

    pub fn heartbeat_ms(mut self, ms: u32) -> Self {
        self.config.heartbeat_ms = ms;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.config.retries = retries;
        self
    }

    pub fn timeout_ms(mut self, ms: u32) -> Self {
        self.config.timeout_ms = ms;
        self
    }

    pub fn gateway_host(mut self, host: impl Into<String>) -> Self {
        self.config.gateway_host = host.into();
        self
    }

    pub fn gateway_port(mut self, port: u16) -> Self {
        self.config.gateway_port = port;
        self
    }

    pub fn gateway(mut self, gateway: GatewayConfig) -> Self {
        self.config.gateway = gateway;
        self
    }

    pub fn request_timeout_ms(mut self, ms: u64) -> Self {
        self.config.request_timeout_ms = ms;
        self
    }

    pub fn connection_interval_ms(mut self, ms: u64) -> Self {
        self.config.connection_interval_ms = ms;
        self
    }

    pub fn polling_interval_ms(mut self, ms: u64) -> Self {
        self.config.polling_interval_ms = ms;
        self
    }

    pub fn logs_settle_delay_ms(mut self, ms: u64) -> Self {
        self.config.logs_settle_delay_ms = ms;
        self
    }

    pub fn mode(mut self, mode: TransportMode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn session_policy(mut self, policy: PollPolicy) -> Self {
        self.config.session_policy = policy;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    pub fn build(self) -> BridgeConfig {
        self.config
    }
}
