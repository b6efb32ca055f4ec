//! Asynchronous events from the daemon, and the provider's own event bus
//! payloads.
//!
//! The daemon-side types cover exactly the notifications this crate
//! consumes: circuit and stream status, client-status (bootstrap) lines,
//! and log lines. [`TorProviderEvent`] is what collaborators receive after
//! the provider has folded those into state.

use std::fmt;
use std::str::FromStr;

use crate::error::{Result, TorError};
use crate::protocol::parse_key_value_pairs;
use crate::types::{BootstrapStatus, CircuitId, Fingerprint, NodeData, StatusSeverity};

/// Event types subscribed to with SETEVENTS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Circuit status changed.
    Circ,
    /// Stream status changed.
    Stream,
    /// Client status (bootstrap progress and problems).
    StatusClient,
    /// Notice-level log line.
    Notice,
    /// Warning-level log line.
    Warn,
    /// Error-level log line.
    Err,
}

impl EventType {
    /// The event name as it appears on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Circ => "CIRC",
            EventType::Stream => "STREAM",
            EventType::StatusClient => "STATUS_CLIENT",
            EventType::Notice => "NOTICE",
            EventType::Warn => "WARN",
            EventType::Err => "ERR",
        }
    }
}

impl FromStr for EventType {
    type Err = TorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CIRC" => Ok(EventType::Circ),
            "STREAM" => Ok(EventType::Stream),
            "STATUS_CLIENT" => Ok(EventType::StatusClient),
            "NOTICE" => Ok(EventType::Notice),
            "WARN" => Ok(EventType::Warn),
            "ERR" => Ok(EventType::Err),
            other => Err(TorError::Parse(format!("unknown event type: {}", other))),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Circuit lifecycle states reported by CIRC events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStatus {
    /// Circuit id assigned.
    Launched,
    /// All hops finished; the circuit can carry streams.
    Built,
    /// One more hop completed.
    Extended,
    /// Circuit closed before it was built.
    Failed,
    /// Circuit closed after it was built.
    Closed,
    /// A state this crate does not act on.
    Unknown,
}

impl FromStr for CircuitStatus {
    type Err = TorError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "LAUNCHED" => CircuitStatus::Launched,
            "BUILT" => CircuitStatus::Built,
            "EXTENDED" => CircuitStatus::Extended,
            "FAILED" => CircuitStatus::Failed,
            "CLOSED" => CircuitStatus::Closed,
            _ => CircuitStatus::Unknown,
        })
    }
}

/// One parsed CIRC event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitEvent {
    /// The circuit identifier.
    pub id: CircuitId,
    /// What happened to the circuit.
    pub status: CircuitStatus,
    /// Relay fingerprints of the path, in hop order.
    pub path: Vec<Fingerprint>,
    /// Close/failure reason, when reported.
    pub reason: Option<String>,
    /// SOCKS username bound to the circuit, when isolation is in use.
    pub socks_username: Option<String>,
    /// SOCKS password bound to the circuit.
    pub socks_password: Option<String>,
}

/// Parse the text of a CIRC event (type prefix already stripped).
pub fn parse_circuit_event(text: &str) -> Result<CircuitEvent> {
    let mut parts = text.splitn(3, ' ');
    let id: CircuitId = parts
        .next()
        .ok_or_else(|| TorError::Parse("empty CIRC event".to_string()))?
        .parse()?;
    let status: CircuitStatus = parts
        .next()
        .ok_or_else(|| TorError::Parse(format!("CIRC event without status: '{}'", text)))?
        .parse()?;

    let rest = parts.next().unwrap_or("");
    let (path_str, kv_str) = match rest.split_once(' ') {
        Some((first, kv)) if first.starts_with('$') => (first, kv),
        None if rest.starts_with('$') => (rest, ""),
        _ => ("", rest),
    };

    let path = path_str
        .split(',')
        .filter(|p| !p.is_empty())
        .filter_map(|p| Fingerprint::from_str(p).ok())
        .collect();

    let kv = parse_key_value_pairs(kv_str);
    Ok(CircuitEvent {
        id,
        status,
        path,
        reason: kv.get("REASON").cloned(),
        socks_username: kv.get("SOCKS_USERNAME").cloned(),
        socks_password: kv.get("SOCKS_PASSWORD").cloned(),
    })
}

/// Stream lifecycle states reported by STREAM events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    /// New connection request.
    New,
    /// Stream established.
    Succeeded,
    /// Stream failed.
    Failed,
    /// Stream closed.
    Closed,
    /// Detached from its circuit, retriable.
    Detached,
    /// A state this crate does not act on.
    Unknown,
}

impl FromStr for StreamStatus {
    type Err = TorError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "NEW" => StreamStatus::New,
            "SUCCEEDED" => StreamStatus::Succeeded,
            "FAILED" => StreamStatus::Failed,
            "CLOSED" => StreamStatus::Closed,
            "DETACHED" => StreamStatus::Detached,
            _ => StreamStatus::Unknown,
        })
    }
}

/// One parsed STREAM event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    /// The stream identifier.
    pub id: String,
    /// What happened to the stream.
    pub status: StreamStatus,
    /// The circuit carrying the stream; `None` while unattached (`0`).
    pub circuit: Option<CircuitId>,
    /// Target `address:port`.
    pub target: String,
    /// SOCKS username the client presented, when any.
    pub socks_username: Option<String>,
    /// SOCKS password the client presented.
    pub socks_password: Option<String>,
}

/// Parse the text of a STREAM event (type prefix already stripped).
pub fn parse_stream_event(text: &str) -> Result<StreamEvent> {
    let mut parts = text.splitn(5, ' ');
    let id = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| TorError::Parse("empty STREAM event".to_string()))?
        .to_string();
    let status: StreamStatus = parts
        .next()
        .ok_or_else(|| TorError::Parse(format!("STREAM event without status: '{}'", text)))?
        .parse()?;
    let circuit_field = parts
        .next()
        .ok_or_else(|| TorError::Parse(format!("STREAM event without circuit: '{}'", text)))?;
    let circuit = if circuit_field == "0" {
        None
    } else {
        Some(circuit_field.parse()?)
    };
    let target = parts.next().unwrap_or("").to_string();

    let kv = parse_key_value_pairs(parts.next().unwrap_or(""));
    Ok(StreamEvent {
        id,
        status,
        circuit,
        target,
        socks_username: kv.get("SOCKS_USERNAME").cloned(),
        socks_password: kv.get("SOCKS_PASSWORD").cloned(),
    })
}

/// A parsed asynchronous notification, as handed to the provider's event
/// loop by the socket-level subscriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// A CIRC event.
    Circuit(CircuitEvent),
    /// A STREAM event.
    Stream(StreamEvent),
    /// A STATUS_CLIENT line, unparsed (bootstrap lines are a subset).
    StatusClient(String),
    /// A daemon log line.
    Log {
        /// Log severity.
        severity: StatusSeverity,
        /// The log message.
        message: String,
    },
}

/// Events broadcast by the provider to collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TorProviderEvent {
    /// A bootstrap phase report, forwarded unconditionally.
    BootstrapStatus(BootstrapStatus),
    /// A de-duplicated, non-ignorable bootstrap problem.
    BootstrapError {
        /// Phase tag the problem occurred in.
        tag: String,
        /// Machine-readable reason.
        reason: Option<String>,
        /// Human-readable warning text.
        warning: Option<String>,
    },
    /// The first hop of the newest multi-hop circuit changed.
    BridgeChanged(Option<NodeData>),
    /// A stream carrying SOCKS credentials succeeded; binds an isolation
    /// nonce to a concrete relay path.
    StreamSucceeded {
        /// SOCKS username.
        username: String,
        /// SOCKS password.
        password: String,
        /// Relay path of the stream's circuit, possibly empty when the
        /// circuit is unknown.
        circuit: Vec<Fingerprint>,
    },
    /// The supervised daemon exited unexpectedly.
    ProcessExited {
        /// Exit code, when the platform reports one.
        exit_code: Option<i32>,
    },
    /// The supervised daemon was relaunched.
    ProcessRestarted,
    /// The provider is connected and subscribed.
    Ready,
    /// A warning- or error-level daemon log line.
    LogLine {
        /// Log severity.
        severity: StatusSeverity,
        /// The log message.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    const FP_A: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
    const FP_B: &str = "BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB";

    #[test]
    fn test_event_type_roundtrip() {
        for ty in [
            EventType::Circ,
            EventType::Stream,
            EventType::StatusClient,
            EventType::Notice,
            EventType::Warn,
            EventType::Err,
        ] {
            assert_eq!(ty.as_str().parse::<EventType>().unwrap(), ty);
        }
        assert!("BW".parse::<EventType>().is_err());
    }

    #[test]
    fn test_circuit_event_built() {
        let ev = parse_circuit_event(&format!(
            "12 BUILT ${}~Guard,${}~Middle PURPOSE=GENERAL TIME_CREATED=2026-01-01T00:00:00",
            FP_A, FP_B
        ))
        .unwrap();
        assert_eq!(ev.id.as_str(), "12");
        assert_eq!(ev.status, CircuitStatus::Built);
        assert_eq!(ev.path.len(), 2);
        assert_eq!(ev.path[0].as_str(), FP_A);
        assert_eq!(ev.path[1].as_str(), FP_B);
    }

    #[test]
    fn test_circuit_event_minimal() {
        let ev = parse_circuit_event("1 LAUNCHED").unwrap();
        assert_eq!(ev.status, CircuitStatus::Launched);
        assert!(ev.path.is_empty());
    }

    #[test]
    fn test_circuit_event_closed_with_reason() {
        let ev = parse_circuit_event("5 CLOSED REASON=FINISHED").unwrap();
        assert_eq!(ev.status, CircuitStatus::Closed);
        assert_eq!(ev.reason.as_deref(), Some("FINISHED"));
        assert!(ev.path.is_empty());
    }

    #[test]
    fn test_circuit_event_socks_credentials() {
        let ev = parse_circuit_event(&format!(
            "7 BUILT ${} SOCKS_USERNAME=\"alice\" SOCKS_PASSWORD=\"s3cret\"",
            FP_A
        ))
        .unwrap();
        assert_eq!(ev.socks_username.as_deref(), Some("alice"));
        assert_eq!(ev.socks_password.as_deref(), Some("s3cret"));
        assert_eq!(ev.path.len(), 1);
    }

    #[test]
    fn test_circuit_event_rejects_garbage() {
        assert!(parse_circuit_event("").is_err());
        assert!(parse_circuit_event("not-alnum-id! BUILT").is_err());
    }

    #[test]
    fn test_stream_event_succeeded() {
        let ev = parse_stream_event(
            "42 SUCCEEDED 12 www.example.com:443 SOCKS_USERNAME=\"iso\" SOCKS_PASSWORD=\"nonce\"",
        )
        .unwrap();
        assert_eq!(ev.id, "42");
        assert_eq!(ev.status, StreamStatus::Succeeded);
        assert_eq!(ev.circuit.as_ref().map(|c| c.as_str()), Some("12"));
        assert_eq!(ev.target, "www.example.com:443");
        assert_eq!(ev.socks_username.as_deref(), Some("iso"));
        assert_eq!(ev.socks_password.as_deref(), Some("nonce"));
    }

    #[test]
    fn test_stream_event_unattached() {
        let ev = parse_stream_event("9 NEW 0 example.net:80").unwrap();
        assert_eq!(ev.status, StreamStatus::New);
        assert!(ev.circuit.is_none());
    }
}
