mod binary_v6;
mod binary_v7;
mod encoding;
mod m2;
mod rest_v7;
mod webfig;

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Typed outcome classification for everything that can go wrong below the
/// module boundary. Drivers translate raw I/O and HTTP errors into these
/// kinds exactly once; the engines only ever branch on the kind.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    /// Invalid module configuration; raised before any I/O happens.
    #[error("configuration error: {0}")]
    Config(String),

    /// Establishing the transport failed (TCP connect, TLS, HTTP refused).
    #[error("connection error ({target}): {detail}")]
    Connection { target: String, detail: String },

    /// The transport died mid-attempt; the password was not verified.
    #[error("transient connection fault: {0}")]
    Transient(String),

    /// The attempt ran past the module's current timeout.
    #[error("i/o timeout")]
    Timeout,

    /// The peer answered with something neither success nor reject.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The surrounding task was cancelled.
    #[error("operation cancelled")]
    Cancelled,
}

impl ProtocolError {
    /// Transient faults oblige the caller to re-queue the password and
    /// count a consecutive error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProtocolError::Transient(_) | ProtocolError::Timeout | ProtocolError::Connection { .. }
        )
    }

    /// Only timeouts enlarge the adaptive timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProtocolError::Timeout)
    }
}

/// Classify a raw I/O error. Kind first, error text second; the textual
/// fallback catches platform strings like "i/o timeout" that surface
/// without a matching kind.
pub(crate) fn classify_io_error(target: &str, err: &std::io::Error) -> ProtocolError {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => ProtocolError::Timeout,
        ErrorKind::BrokenPipe
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::UnexpectedEof => ProtocolError::Transient(err.to_string()),
        ErrorKind::ConnectionRefused => ProtocolError::Connection {
            target: target.to_string(),
            detail: err.to_string(),
        },
        _ => classify_error_text(&err.to_string())
            .unwrap_or_else(|| ProtocolError::Protocol(err.to_string())),
    }
}

/// Substring classification for errors that only exist as text (HTTP client
/// failures, wrapped OS errors).
pub(crate) fn classify_error_text(text: &str) -> Option<ProtocolError> {
    if text.contains("i/o timeout") || text.contains("timed out") {
        return Some(ProtocolError::Timeout);
    }
    if text.contains("broken pipe")
        || text.contains("connection reset")
        || text.contains("EOF")
        || text.contains("unexpected end of file")
        || text.contains("connection refused")
    {
        return Some(ProtocolError::Transient(text.to_string()));
    }
    None
}

/// Options recognized by every module. Unknown options cannot exist by
/// construction; each driver picks the fields it understands.
#[derive(Debug, Clone, Default)]
pub struct ModuleOptions {
    /// Target port; the driver default applies when absent.
    pub port: Option<u16>,

    /// Initial request/connect timeout.
    pub timeout: Option<Duration>,

    /// HTTPS transport (REST driver only; others ignore it).
    pub https: bool,
}

/// State every driver carries: the immutable target identity plus the
/// connected flag. Composed into each concrete driver.
#[derive(Debug, Default)]
pub(crate) struct ModuleCommon {
    target: String,
    username: String,
    connected: bool,
}

impl ModuleCommon {
    pub(crate) fn initialize(&mut self, target: &str, username: &str) {
        self.target = target.to_string();
        self.username = username.to_string();
    }

    pub(crate) fn target(&self) -> &str {
        &self.target
    }

    pub(crate) fn username(&self) -> &str {
        &self.username
    }

    pub(crate) fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected
    }
}

/// Uniform authentication probe implemented by every protocol driver.
///
/// Lifecycle: `initialize` once (no I/O), then any number of
/// (`connect`, N x `authenticate`, `close`) cycles. Implementations are not
/// required to tolerate concurrent `authenticate` calls; the owning engine
/// serializes access through a mutex.
#[async_trait]
pub trait RouterModule: Send {
    /// Idempotent setup with target information. Must not perform I/O.
    fn initialize(
        &mut self,
        target: &str,
        username: &str,
        options: &ModuleOptions,
    ) -> Result<(), ProtocolError>;

    /// Establish the transport. No-op when already connected.
    async fn connect(&mut self) -> Result<(), ProtocolError>;

    /// Try one password. `Ok(true)` on verified credentials, `Ok(false)` on
    /// a protocol-confirmed reject, `Err` for everything else (the error
    /// kind tells the caller whether to re-queue the password).
    async fn authenticate(&mut self, password: &str) -> Result<bool, ProtocolError>;

    /// Release the transport and reset per-connection counters. Idempotent.
    async fn close(&mut self) -> Result<(), ProtocolError>;

    /// Update the round-trip timeout; used by the adaptive timeout logic.
    fn set_timeout(&mut self, timeout: Duration);

    fn protocol_name(&self) -> &'static str;

    fn target(&self) -> &str;

    fn username(&self) -> &str;

    fn is_connected(&self) -> bool;
}

/// Creates module instances for the multi-target engine, one per target.
pub trait ModuleFactory: Send + Sync {
    fn create_module(&self) -> Box<dyn RouterModule>;
    fn protocol_name(&self) -> &'static str;
}

impl ModuleFactory for ModuleKind {
    fn create_module(&self) -> Box<dyn RouterModule> {
        self.create()
    }

    fn protocol_name(&self) -> &'static str {
        ModuleKind::protocol_name(self)
    }
}

/// The registry of available protocol drivers. Constructed explicitly by
/// the CLI layer and passed down; creating a module never touches global
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    /// RouterOS v6 binary API (length-prefixed sentences over TCP).
    BinaryV6,
    /// RouterOS v7 WebFig API (encrypted session over HTTP).
    BinaryV7,
    /// RouterOS v7 REST API (HTTP Basic against the JSON endpoint).
    RestV7,
}

impl ModuleKind {
    pub fn create(&self) -> Box<dyn RouterModule> {
        match self {
            ModuleKind::BinaryV6 => Box::new(binary_v6::BinaryV6Module::new()),
            ModuleKind::BinaryV7 => Box::new(binary_v7::BinaryV7Module::new()),
            ModuleKind::RestV7 => Box::new(rest_v7::RestV7Module::new()),
        }
    }

    pub fn protocol_name(&self) -> &'static str {
        match self {
            ModuleKind::BinaryV6 => "binary-v6",
            ModuleKind::BinaryV7 => "binary-v7",
            ModuleKind::RestV7 => "rest-v7",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            ModuleKind::BinaryV6 => 8728,
            ModuleKind::BinaryV7 => 8729,
            ModuleKind::RestV7 => 80,
        }
    }

    /// Resolve the protocol name stored in a resume file.
    pub fn from_protocol_name(name: &str) -> Option<Self> {
        match name {
            "binary-v6" => Some(ModuleKind::BinaryV6),
            "binary-v7" => Some(ModuleKind::BinaryV7),
            "rest-v7" => Some(ModuleKind::RestV7),
            _ => None,
        }
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.protocol_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_classification() {
        use std::io::{Error, ErrorKind};

        let err = Error::new(ErrorKind::TimedOut, "deadline exceeded");
        assert!(classify_io_error("192.0.2.1", &err).is_timeout());

        let err = Error::new(ErrorKind::BrokenPipe, "broken pipe");
        assert!(classify_io_error("192.0.2.1", &err).is_transient());

        let err = Error::new(ErrorKind::ConnectionRefused, "connection refused");
        assert!(classify_io_error("192.0.2.1", &err).is_transient());

        let err = Error::new(ErrorKind::InvalidData, "garbled frame");
        let classified = classify_io_error("192.0.2.1", &err);
        assert!(!classified.is_transient());
        assert!(matches!(classified, ProtocolError::Protocol(_)));
    }

    #[test]
    fn text_classification_matches_known_fragments() {
        assert!(classify_error_text("read tcp: i/o timeout")
            .map(|e| e.is_timeout())
            .unwrap_or(false));
        assert!(classify_error_text("write: broken pipe")
            .map(|e| e.is_transient())
            .unwrap_or(false));
        assert!(classify_error_text("invalid user name or password").is_none());
    }

    #[test]
    fn registry_round_trips_protocol_names() {
        for kind in [ModuleKind::BinaryV6, ModuleKind::BinaryV7, ModuleKind::RestV7] {
            assert_eq!(ModuleKind::from_protocol_name(kind.protocol_name()), Some(kind));
        }
        assert_eq!(ModuleKind::from_protocol_name("telnet"), None);
    }

    #[test]
    fn default_ports() {
        assert_eq!(ModuleKind::BinaryV6.default_port(), 8728);
        assert_eq!(ModuleKind::BinaryV7.default_port(), 8729);
        assert_eq!(ModuleKind::RestV7.default_port(), 80);
    }
}
