use crate::protocol::MAX_DURATION_SECS;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

/// Default port shared by client and server.
pub const DEFAULT_PORT: u16 = 8088;

/// Default transfer duration when neither `-t` nor `-n` is given.
pub const DEFAULT_DURATION: Duration = Duration::from_secs(25);

/// Default cap on concurrently served sessions.
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

/// Role of this instance in a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Drains and times incoming streams
    Server,
    /// Floods one or more connections with payload
    Client,
}

/// Unit used when rendering transferred volume.
///
/// Units are decimal (1 KB = 1000 bytes). The unit never affects the
/// computed rate, which is always reported in Mbps.
///
/// # Examples
///
/// ```
/// use simpleperf::DisplayUnit;
///
/// let unit: DisplayUnit = "KB".parse().unwrap();
/// assert_eq!(unit, DisplayUnit::Kilobytes);
/// assert_eq!(unit.bytes(), 1_000);
/// assert_eq!(unit.to_string(), "KB");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisplayUnit {
    #[serde(rename = "B")]
    Bytes,
    #[serde(rename = "KB")]
    Kilobytes,
    #[serde(rename = "MB")]
    Megabytes,
}

impl DisplayUnit {
    /// Number of bytes in one unit.
    pub fn bytes(self) -> u64 {
        match self {
            DisplayUnit::Bytes => 1,
            DisplayUnit::Kilobytes => 1_000,
            DisplayUnit::Megabytes => 1_000_000,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            DisplayUnit::Bytes => "B",
            DisplayUnit::Kilobytes => "KB",
            DisplayUnit::Megabytes => "MB",
        }
    }
}

impl fmt::Display for DisplayUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for DisplayUnit {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "B" => Ok(DisplayUnit::Bytes),
            "KB" => Ok(DisplayUnit::Kilobytes),
            "MB" => Ok(DisplayUnit::Megabytes),
            other => Err(Error::Config(format!(
                "unknown display unit '{}', expected one of B, KB, MB",
                other
            ))),
        }
    }
}

/// What ends the bulk transfer of a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCondition {
    /// Send until the duration has elapsed
    Time(Duration),
    /// Send until at least this many payload bytes are out
    Bytes(u64),
}

/// Parses a byte target such as `10MB`, `500KB` or `4096B`.
///
/// The numeric part must be a non-negative integer directly followed by
/// one of the units `B`, `KB` or `MB`. A bare number is read as bytes.
///
/// # Examples
///
/// ```
/// use simpleperf::config::parse_byte_target;
///
/// assert_eq!(parse_byte_target("10MB").unwrap(), 10_000_000);
/// assert_eq!(parse_byte_target("500KB").unwrap(), 500_000);
/// assert_eq!(parse_byte_target("4096").unwrap(), 4096);
/// assert!(parse_byte_target("ten MB").is_err());
/// ```
pub fn parse_byte_target(input: &str) -> Result<u64> {
    let input = input.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (digits, unit) = input.split_at(split);

    if digits.is_empty() {
        return Err(Error::Config(format!(
            "byte target '{}' must start with a number",
            input
        )));
    }

    let value: u64 = digits
        .parse()
        .map_err(|e| Error::Config(format!("invalid byte target '{}': {}", input, e)))?;

    let unit = if unit.is_empty() {
        DisplayUnit::Bytes
    } else {
        unit.parse::<DisplayUnit>()?
    };

    value
        .checked_mul(unit.bytes())
        .ok_or_else(|| Error::Config(format!("byte target '{}' is too large", input)))
}

/// Configuration for one simpleperf run.
///
/// The same structure drives both roles. It is cloned into every session
/// task and never mutated once a session has started.
///
/// # Examples
///
/// ## Client sending for 10 seconds with 2 second intervals
///
/// ```
/// use simpleperf::TransferConfig;
/// use std::net::Ipv4Addr;
/// use std::time::Duration;
///
/// let config = TransferConfig::client(Ipv4Addr::LOCALHOST, 8088)
///     .with_duration(Duration::from_secs(10))
///     .with_interval(Duration::from_secs(2));
/// assert!(config.validate().is_ok());
/// ```
///
/// ## Client in byte-count mode
///
/// ```
/// use simpleperf::{StopCondition, TransferConfig};
/// use std::net::Ipv4Addr;
///
/// let config = TransferConfig::client(Ipv4Addr::LOCALHOST, 8088)
///     .with_byte_target(10_000_000);
/// assert_eq!(config.stop_condition(), StopCondition::Bytes(10_000_000));
/// ```
///
/// ## Server
///
/// ```
/// use simpleperf::TransferConfig;
/// use std::net::Ipv4Addr;
///
/// let config = TransferConfig::server(Ipv4Addr::UNSPECIFIED, 8088)
///     .with_max_connections(16);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Client or server
    pub role: Role,

    /// Address the server binds to, or the server address the client dials
    pub bind_addr: Ipv4Addr,

    /// Port number
    pub port: u16,

    /// Transfer duration (declared to the server in whole seconds)
    pub duration: Duration,

    /// Byte-count mode target; overrides `duration` for stopping
    pub byte_target: Option<u64>,

    /// Length of a reporting interval, if interval rows are wanted
    pub interval: Option<Duration>,

    /// Number of parallel client connections
    pub parallel: usize,

    /// Unit for the formatted volume column
    pub display_unit: DisplayUnit,

    /// Upper bound on concurrently served sessions (server only)
    pub max_connections: usize,

    /// Stop the server after this many sessions (server only)
    pub session_limit: Option<usize>,

    /// Emit results as JSON instead of a table
    pub json: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            role: Role::Client,
            bind_addr: Ipv4Addr::LOCALHOST,
            port: DEFAULT_PORT,
            duration: DEFAULT_DURATION,
            byte_target: None,
            interval: None,
            parallel: 1,
            display_unit: DisplayUnit::Megabytes,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            session_limit: None,
            json: false,
        }
    }
}

impl TransferConfig {
    /// Creates a server configuration listening on `bind_addr:port`.
    pub fn server(bind_addr: Ipv4Addr, port: u16) -> Self {
        Self {
            role: Role::Server,
            bind_addr,
            port,
            ..Default::default()
        }
    }

    /// Creates a client configuration targeting `server_addr:port`.
    pub fn client(server_addr: Ipv4Addr, port: u16) -> Self {
        Self {
            role: Role::Client,
            bind_addr: server_addr,
            port,
            ..Default::default()
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Switches the client to byte-count mode.
    pub fn with_byte_target(mut self, bytes: u64) -> Self {
        self.byte_target = Some(bytes);
        self
    }

    /// Enables interval rows of the given length.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn with_parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_display_unit(mut self, unit: DisplayUnit) -> Self {
        self.display_unit = unit;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Makes the server exit after `limit` sessions have finished.
    pub fn with_session_limit(mut self, limit: usize) -> Self {
        self.session_limit = Some(limit);
        self
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    /// Socket address built from `bind_addr` and `port`.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::from((self.bind_addr, self.port))
    }

    /// Returns the condition that ends a client's bulk transfer.
    pub fn stop_condition(&self) -> StopCondition {
        match self.byte_target {
            Some(bytes) => StopCondition::Bytes(bytes),
            None => StopCondition::Time(self.duration),
        }
    }

    /// Checks the ranges the CLI is expected to enforce.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` when the port is outside 1024-65535, the
    /// duration is shorter than one second or does not fit the handshake
    /// field, the interval or byte target is
    /// zero, or fewer than one parallel connection is requested.
    pub fn validate(&self) -> Result<()> {
        if self.port < 1024 {
            return Err(Error::Config(format!(
                "port number must be in range 1024-65535, got {}",
                self.port
            )));
        }

        if self.duration.as_secs() == 0 {
            return Err(Error::Config(
                "total duration in seconds must be greater than 0".to_string(),
            ));
        }

        // the handshake carries whole seconds, rounded up
        if self.duration.as_secs_f64().ceil() > MAX_DURATION_SECS as f64 {
            return Err(Error::Config(format!(
                "total duration must be at most {} seconds",
                MAX_DURATION_SECS
            )));
        }

        if let Some(interval) = self.interval {
            if interval.is_zero() {
                return Err(Error::Config("interval must be greater than 0".to_string()));
            }
        }

        if self.byte_target == Some(0) {
            return Err(Error::Config("byte target must be greater than 0".to_string()));
        }

        if self.parallel == 0 {
            return Err(Error::Config(
                "at least one parallel connection is required".to_string(),
            ));
        }

        if self.max_connections == 0 {
            return Err(Error::Config(
                "max connections must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
