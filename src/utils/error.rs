//! Crate-wide error type.

use std::fmt;

/// The kind of failure behind a [`ConcordError`], following the four
/// error categories from the protocol's error-handling design: transient
/// network hiccups, protocol-level violations that are simply dropped,
/// and fatal conditions that end the process. (Timeouts are not a
/// variant here: they never surface as errors, only as timer expiry
/// driving state transitions.)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Send failure, malformed datagram, decode failure. Logged and
    /// dropped; no state change follows.
    Transient,
    /// Message from self, impossible round, duplicate announcement.
    /// Dropped; the peer continues unaffected.
    Protocol,
    /// Cannot bind/join the multicast socket, or the receive loop died.
    /// The process exits nonzero after logging.
    Fatal,
}

/// A single crate-wide error type, carrying a kind and a human-readable
/// message, with `From` conversions from the handful of external error
/// types this crate touches.
#[derive(Debug)]
pub struct ConcordError {
    kind: ErrorKind,
    msg: String,
}

impl ConcordError {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        ConcordError {
            kind,
            msg: msg.into(),
        }
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, msg)
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, msg)
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == ErrorKind::Fatal
    }
}

impl fmt::Display for ConcordError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.msg)
    }
}

impl std::error::Error for ConcordError {}

impl From<std::io::Error> for ConcordError {
    fn from(e: std::io::Error) -> Self {
        ConcordError::fatal(format!("io error: {}", e))
    }
}

impl From<serde_json::Error> for ConcordError {
    fn from(e: serde_json::Error) -> Self {
        ConcordError::transient(format!("malformed message: {}", e))
    }
}

impl From<toml::de::Error> for ConcordError {
    fn from(e: toml::de::Error) -> Self {
        ConcordError::fatal(format!("malformed config: {}", e))
    }
}

/// Constructs a [`ConcordError`], logs it at a level matching its kind,
/// and evaluates to it -- lets call sites both log and propagate in one
/// expression instead of two statements.
#[macro_export]
macro_rules! logged_err {
    ($kind:ident, $($arg:tt)*) => {{
        let e = $crate::ConcordError::new($crate::ErrorKind::$kind, format!($($arg)*));
        match e.kind() {
            $crate::ErrorKind::Fatal => log::error!("{}", e),
            $crate::ErrorKind::Protocol => log::debug!("{}", e),
            $crate::ErrorKind::Transient => log::debug!("{}", e),
        }
        Err(e)
    }};
}
