//! Core types used throughout the Tor provider library.
//!
//! Fundamental representations of Tor entities: circuit identifiers, relay
//! fingerprints, bridge descriptors, node data, bootstrap progress, and
//! configuration values.

use std::fmt;
use std::str::FromStr;

use crate::error::TorError;

/// A circuit identifier as assigned by the daemon.
///
/// The protocol defines these as 1 to 16 alphanumeric characters; they are
/// treated as opaque strings, never as numbers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CircuitId(String);

impl CircuitId {
    /// Get the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CircuitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CircuitId {
    type Err = TorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > 16 || !s.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(TorError::Parse(format!("invalid circuit id: '{}'", s)));
        }
        Ok(CircuitId(s.to_string()))
    }
}

/// A relay fingerprint (40 hex characters, optionally prefixed with $).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Get the fingerprint as a string (without $ prefix).
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Get the fingerprint with $ prefix.
    pub fn with_prefix(&self) -> String {
        format!("${}", self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = TorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim_start_matches('$');
        // A path entry may carry a ~nickname or =nickname suffix.
        let s = s.split(['~', '=']).next().unwrap_or(s);
        if s.len() != 40 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(TorError::Parse(format!(
                "invalid fingerprint '{}': must be 40 hex characters",
                s
            )));
        }
        Ok(Fingerprint(s.to_uppercase()))
    }
}

/// A configured bridge descriptor, as it appears in a `Bridge` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeLine {
    /// Pluggable-transport name, `"vanilla"` when the line names none.
    pub transport: String,
    /// The bridge's `address:port`.
    pub addr: String,
    /// Relay fingerprint, when the line carries one.
    pub fingerprint: Option<Fingerprint>,
    /// Trailing transport-specific arguments, verbatim.
    pub args: Option<String>,
}

impl fmt::Display for BridgeLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.transport != "vanilla" {
            write!(f, "{} ", self.transport)?;
        }
        write!(f, "{}", self.addr)?;
        if let Some(ref fp) = self.fingerprint {
            write!(f, " {}", fp)?;
        }
        if let Some(ref args) = self.args {
            write!(f, " {}", args)?;
        }
        Ok(())
    }
}

/// Live information about one relay, derived on demand.
///
/// Combines configured bridge descriptors with relay-address lookups. Only
/// the current-bridge singleton is retained; everything else is recomputed
/// per call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeData {
    /// The relay's fingerprint.
    pub fingerprint: Fingerprint,
    /// Up to two addresses (IPv4 and/or IPv6) the relay is reachable at.
    pub ip_addrs: Vec<String>,
    /// Pluggable-transport name when the relay is a configured bridge.
    pub bridge_type: Option<String>,
    /// Two-letter region code of the first address, when known.
    pub region_code: Option<String>,
}

impl NodeData {
    /// Whether this node is one of the configured bridges.
    pub fn is_bridge(&self) -> bool {
        self.bridge_type.is_some()
    }
}

/// Severity of a client-status notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusSeverity {
    /// Routine progress.
    Notice,
    /// A problem the daemon recommends acting on.
    Warn,
    /// A fatal problem.
    Err,
}

impl StatusSeverity {
    /// The severity keyword as it appears on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusSeverity::Notice => "NOTICE",
            StatusSeverity::Warn => "WARN",
            StatusSeverity::Err => "ERR",
        }
    }
}

impl FromStr for StatusSeverity {
    type Err = TorError;

    fn from_str(s: &str) -> Result<Self, TorError> {
        match s {
            "NOTICE" => Ok(StatusSeverity::Notice),
            "WARN" => Ok(StatusSeverity::Warn),
            "ERR" => Ok(StatusSeverity::Err),
            other => Err(TorError::Parse(format!("unknown severity: {}", other))),
        }
    }
}

impl fmt::Display for StatusSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One bootstrap phase report. Replaced wholesale on each status update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapStatus {
    /// Severity of the report.
    pub severity: StatusSeverity,
    /// Progress percentage, 0 to 100.
    pub progress: u8,
    /// Short tag identifying the phase.
    pub tag: String,
    /// Human-readable summary of the phase.
    pub summary: Option<String>,
    /// Warning message, when there is a problem.
    pub warning: Option<String>,
    /// Machine-readable reason for the problem.
    pub reason: Option<String>,
    /// How many times this problem occurred.
    pub count: Option<u32>,
    /// The address involved in the problem, when any.
    pub host_addr: Option<String>,
    /// The daemon's recommendation (`ignore` or `warn`).
    pub recommendation: Option<String>,
}

impl BootstrapStatus {
    /// Bootstrap is done once progress reaches 100.
    pub fn is_done(&self) -> bool {
        self.progress >= 100
    }

    /// Whether the daemon marked this report as ignorable.
    pub fn is_ignorable(&self) -> bool {
        self.recommendation.as_deref() == Some("ignore")
    }
}

/// A configuration value for `SETCONF`.
///
/// The variants are the only value shapes the daemon's option grammar
/// accepts, so unsupported types cannot reach the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfValue {
    /// A single string value.
    Str(String),
    /// A boolean, encoded as `1`/`0`.
    Bool(bool),
    /// A sequence, encoded as repeated `key=value` pairs
    /// (or the bare key when empty).
    List(Vec<String>),
}

impl From<&str> for ConfValue {
    fn from(s: &str) -> Self {
        ConfValue::Str(s.to_string())
    }
}

impl From<String> for ConfValue {
    fn from(s: String) -> Self {
        ConfValue::Str(s)
    }
}

impl From<bool> for ConfValue {
    fn from(b: bool) -> Self {
        ConfValue::Bool(b)
    }
}

impl From<Vec<String>> for ConfValue {
    fn from(v: Vec<String>) -> Self {
        ConfValue::List(v)
    }
}

/// A client-auth key installed for an authenticated onion service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnionAuthKey {
    /// The onion-service address the key unlocks.
    pub address: String,
    /// Key type, currently always `x25519`.
    pub key_type: String,
    /// The base64 key material.
    pub key_blob: String,
    /// Flags attached to the key (e.g. `Permanent`).
    pub flags: Vec<String>,
}

/// A signal that can be sent via the SIGNAL command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Switch to clean circuits.
    NewNym,
    /// Reload configuration.
    Reload,
    /// Controlled shutdown.
    Shutdown,
}

impl Signal {
    /// Get the signal name as it appears on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::NewNym => "NEWNYM",
            Signal::Reload => "RELOAD",
            Signal::Shutdown => "SHUTDOWN",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
