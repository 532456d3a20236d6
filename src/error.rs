//! Structured errors for the gateway's components. Each enum is hand-written
//! (no derive macro) following the same `Display` + `std::error::Error`
//! pattern used throughout the transfer layer this crate grew out of:
//! plain enums, a manual `Display` impl, call sites that don't need to
//! match propagate through `anyhow::Result` instead.

/// A configured peripheral or automation is missing a field the core
/// requires to operate, or the record itself is malformed.
#[derive(Debug, Clone)]
pub enum ConfigError {
    MissingVirtualIndex(String),
    MalformedConnectionParams(String, String),
    MalformedChannelMap(String, String),
    UnknownPeripheral(i64),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use ConfigError::*;
        match self {
            MissingVirtualIndex(name) => {
                write!(f, "peripheral '{name}' has no channel key containing \"index\"")
            }
            MalformedConnectionParams(name, msg) => {
                write!(f, "peripheral '{name}' has malformed connection_params: {msg}")
            }
            MalformedChannelMap(name, msg) => {
                write!(f, "peripheral '{name}' has malformed channel_to_virtual_index: {msg}")
            }
            UnknownPeripheral(id) => write!(f, "no peripheral with id {id}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Broker or remote-transport connectivity failures.
#[derive(Debug, Clone)]
pub enum TransportError {
    Connect(String),
    Handshake(String),
    Auth(String),
    BrokerConnect(String),
    BrokerChannel(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use TransportError::*;
        match self {
            Connect(addr) => write!(f, "failed to connect to {addr}"),
            Handshake(addr) => write!(f, "handshake failed with {addr}"),
            Auth(addr) => write!(f, "authentication failed for {addr}"),
            BrokerConnect(msg) => write!(f, "broker connection failed: {msg}"),
            BrokerChannel(msg) => write!(f, "broker channel error: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// A broker delivery body could not be interpreted as a command envelope.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    InvalidJson(String),
    UnknownAction(String),
    MissingField(&'static str),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use ProtocolError::*;
        match self {
            InvalidJson(msg) => write!(f, "invalid command envelope: {msg}"),
            UnknownAction(action) => write!(f, "unknown action: {action}"),
            MissingField(field) => write!(f, "command envelope missing field: {field}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Per-file failure inside a bulk upload/download. Collected rather than
/// aborting the whole operation; surfaced in the reply's `errors` list.
#[derive(Debug, Clone)]
pub struct RemoteOpError {
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for RemoteOpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

impl std::error::Error for RemoteOpError {}

impl RemoteOpError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        RemoteOpError { path: path.into(), message: message.into() }
    }
}

/// The remote server refused an operation (e.g. FTP 550, SFTP permission
/// denied).
#[derive(Debug, Clone)]
pub struct PermError {
    pub path: String,
    pub reason: String,
}

impl std::fmt::Display for PermError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "permission denied for {}: {}", self.path, self.reason)
    }
}

impl std::error::Error for PermError {}

/// Umbrella error for the gateway binary's top-level error paths
/// (`main`, the supervisor's fatal startup failures). Individual
/// components return the narrower types above; this exists only so
/// `main` can propagate any of them with `?` through one `Result` type.
#[derive(Debug)]
pub enum GatewayError {
    Config(ConfigError),
    Transport(TransportError),
    Protocol(ProtocolError),
    Other(anyhow::Error),
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::Config(e) => write!(f, "{e}"),
            GatewayError::Transport(e) => write!(f, "{e}"),
            GatewayError::Protocol(e) => write!(f, "{e}"),
            GatewayError::Other(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for GatewayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GatewayError::Config(e) => Some(e),
            GatewayError::Transport(e) => Some(e),
            GatewayError::Protocol(e) => Some(e),
            GatewayError::Other(e) => e.source(),
        }
    }
}

impl From<ConfigError> for GatewayError {
    fn from(e: ConfigError) -> Self {
        GatewayError::Config(e)
    }
}
impl From<TransportError> for GatewayError {
    fn from(e: TransportError) -> Self {
        GatewayError::Transport(e)
    }
}
impl From<ProtocolError> for GatewayError {
    fn from(e: ProtocolError) -> Self {
        GatewayError::Protocol(e)
    }
}
impl From<anyhow::Error> for GatewayError {
    fn from(e: anyhow::Error) -> Self {
        GatewayError::Other(e)
    }
}
