//! Downstream error normalisation and trip classification.
//!
//! # Responsibilities
//! - Turn whatever the downstream client produced into one tagged shape
//!   (`DownstreamError`), once, at the boundary
//! - Decide whether a failure should count against the circuit
//!
//! # Decision Table (first match wins)
//! ```text
//! 1. transport code (refused, reset, timeout, unreachable, dns, breaker-open) → trip
//! 2. status >= 500                                                           → trip
//! 3. status == 429                                                           → trip
//! 4. critical service: 401 → no trip, 503 → trip
//! 5. other 4xx                                                               → no trip
//! 6. anything else                                                           → trip
//! ```
//!
//! Classification is silent; callers log if they care.

use std::collections::HashSet;
use std::error::Error as StdError;
use std::fmt;
use std::io;

/// Network-level failure codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportCode {
    ConnectionRefused,
    ConnectionReset,
    TimedOut,
    HostUnreachable,
    DnsFailure,
    /// Marker raised by an upstream breaker that already rejected the call.
    BreakerOpen,
}

impl fmt::Display for TransportCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportCode::ConnectionRefused => "connection_refused",
            TransportCode::ConnectionReset => "connection_reset",
            TransportCode::TimedOut => "timed_out",
            TransportCode::HostUnreachable => "host_unreachable",
            TransportCode::DnsFailure => "dns_failure",
            TransportCode::BreakerOpen => "breaker_open",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport(TransportCode),
    HttpStatus(u16),
    Unknown,
}

/// Normalised downstream failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownstreamError {
    pub kind: ErrorKind,
    pub message: String,
}

impl DownstreamError {
    pub fn transport(code: TransportCode, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transport(code),
            message: message.into(),
        }
    }

    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::HttpStatus(status),
            message: message.into(),
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Unknown,
            message: message.into(),
        }
    }

    pub fn timeout(after_ms: u64) -> Self {
        Self::transport(
            TransportCode::TimedOut,
            format!("downstream call exceeded {}ms", after_ms),
        )
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == ErrorKind::Transport(TransportCode::TimedOut)
    }
}

impl fmt::Display for DownstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ErrorKind::Transport(code) => write!(f, "{}: {}", code, self.message),
            ErrorKind::HttpStatus(status) => write!(f, "status {}: {}", status, self.message),
            ErrorKind::Unknown => write!(f, "{}", self.message),
        }
    }
}

impl StdError for DownstreamError {}

impl From<io::Error> for DownstreamError {
    fn from(err: io::Error) -> Self {
        normalize_io_error(&err)
    }
}

impl From<reqwest::Error> for DownstreamError {
    fn from(err: reqwest::Error) -> Self {
        normalize_reqwest_error(&err)
    }
}

/// Map an I/O error onto the tagged shape.
pub fn normalize_io_error(err: &io::Error) -> DownstreamError {
    let code = match err.kind() {
        io::ErrorKind::ConnectionRefused => Some(TransportCode::ConnectionRefused),
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => Some(TransportCode::ConnectionReset),
        io::ErrorKind::TimedOut => Some(TransportCode::TimedOut),
        io::ErrorKind::AddrNotAvailable | io::ErrorKind::NotConnected => {
            Some(TransportCode::HostUnreachable)
        }
        _ => dns_failure_in(&err.to_string()),
    };

    match code {
        Some(code) => DownstreamError::transport(code, err.to_string()),
        None => DownstreamError::unknown(err.to_string()),
    }
}

/// Map a reqwest error onto the tagged shape.
pub fn normalize_reqwest_error(err: &reqwest::Error) -> DownstreamError {
    if err.is_timeout() {
        return DownstreamError::transport(TransportCode::TimedOut, err.to_string());
    }
    if let Some(status) = err.status() {
        return DownstreamError::status(status.as_u16(), err.to_string());
    }

    // Walk the source chain for the underlying socket error.
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            let normalized = normalize_io_error(io_err);
            if normalized.kind != ErrorKind::Unknown {
                return DownstreamError {
                    message: err.to_string(),
                    ..normalized
                };
            }
        }
        if let Some(code) = dns_failure_in(&cause.to_string()) {
            return DownstreamError::transport(code, err.to_string());
        }
        source = cause.source();
    }

    if err.is_connect() {
        return DownstreamError::transport(TransportCode::ConnectionRefused, err.to_string());
    }
    DownstreamError::unknown(err.to_string())
}

fn dns_failure_in(message: &str) -> Option<TransportCode> {
    let lower = message.to_ascii_lowercase();
    if lower.contains("dns error")
        || lower.contains("failed to lookup address")
        || lower.contains("name or service not known")
    {
        Some(TransportCode::DnsFailure)
    } else {
        None
    }
}

/// Outcome of classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub trip_circuit: bool,
}

impl Classification {
    const TRIP: Self = Self { trip_circuit: true };
    const IGNORE: Self = Self { trip_circuit: false };
}

/// Decides whether a failure justifies tripping a circuit.
#[derive(Debug, Clone, Default)]
pub struct ErrorClassifier {
    critical_services: HashSet<String>,
}

impl ErrorClassifier {
    pub fn new<I, S>(critical_services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            critical_services: critical_services.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_critical(&self, service: &str) -> bool {
        self.critical_services.contains(service)
    }

    pub fn classify(&self, error: &DownstreamError, service: &str) -> Classification {
        let status = match error.kind {
            ErrorKind::Transport(_) => return Classification::TRIP,
            ErrorKind::HttpStatus(status) => status,
            ErrorKind::Unknown => return Classification::TRIP,
        };

        if status >= 500 || status == 429 {
            return Classification::TRIP;
        }

        if self.is_critical(service) {
            match status {
                401 => return Classification::IGNORE,
                503 => return Classification::TRIP,
                _ => {}
            }
        }

        if (400..500).contains(&status) {
            return Classification::IGNORE;
        }

        // 1xx-3xx surfaced as an error is not something we understand.
        Classification::TRIP
    }
}
