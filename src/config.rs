//! Configuration for the provider and the control connection.
//!
//! [`TorProviderConfig`] describes everything needed to launch and/or reach
//! a daemon: file locations, ports, credentials, retry policy. Connection
//! parameters are resolved at `init` time, with environment variables
//! taking precedence over configured values.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::auth::AuthCredential;
use crate::error::{Result, TorError};

/// Default TCP control port of a system daemon.
pub const DEFAULT_CONTROL_PORT: u16 = 9051;
/// Control port injected when this provider launches the daemon itself.
pub const OWNED_CONTROL_PORT: u16 = 9151;
/// SOCKS port injected when this provider launches the daemon itself.
pub const OWNED_SOCKS_PORT: u16 = 9150;

/// Environment variables that override stored connection preferences.
pub mod env {
    /// Control host override.
    pub const CONTROL_HOST: &str = "TOR_CONTROL_HOST";
    /// Control TCP port override.
    pub const CONTROL_PORT: &str = "TOR_CONTROL_PORT";
    /// Control Unix-socket path override.
    pub const CONTROL_IPC_PATH: &str = "TOR_CONTROL_IPC_PATH";
    /// Control password override.
    pub const CONTROL_PASSWD: &str = "TOR_CONTROL_PASSWD";
    /// Cookie-file override.
    pub const CONTROL_COOKIE_AUTH_FILE: &str = "TOR_CONTROL_COOKIE_AUTH_FILE";
}

/// The address of a daemon listener: TCP or Unix-domain socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlAddress {
    /// TCP host and port.
    Tcp {
        /// Host name or address.
        host: String,
        /// TCP port.
        port: u16,
    },
    /// Unix-domain socket path.
    Unix(PathBuf),
}

impl ControlAddress {
    /// Create a TCP address.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        ControlAddress::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Create a Unix-socket address.
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        ControlAddress::Unix(path.into())
    }

    /// Whether this is a Unix-socket address.
    pub fn is_unix(&self) -> bool {
        matches!(self, ControlAddress::Unix(_))
    }

    /// The TCP port, when this is a TCP address.
    pub fn port(&self) -> Option<u16> {
        match self {
            ControlAddress::Tcp { port, .. } => Some(*port),
            ControlAddress::Unix(_) => None,
        }
    }

    /// Parse an address string: `unix:/path/to/socket` or `host:port`.
    pub fn parse(s: &str) -> Result<Self> {
        if let Some(path) = s.strip_prefix("unix:") {
            return Ok(ControlAddress::Unix(PathBuf::from(path)));
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| TorError::Parse(format!("invalid address '{}'", s)))?;
        let port = port
            .parse()
            .map_err(|_| TorError::Parse(format!("invalid port in '{}'", s)))?;
        Ok(ControlAddress::Tcp {
            host: host.to_string(),
            port,
        })
    }

    /// The value this address takes in a daemon port option
    /// (`ControlPort`/`SocksPort`): `host:port`, or `unix:"/path"`.
    pub fn option_value(&self) -> String {
        match self {
            ControlAddress::Tcp { host, port } => format!("{}:{}", host, port),
            ControlAddress::Unix(path) => format!("unix:\"{}\"", path.display()),
        }
    }
}

impl fmt::Display for ControlAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlAddress::Tcp { host, port } => write!(f, "{}:{}", host, port),
            ControlAddress::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Configuration for a [`TorProvider`](crate::provider::TorProvider).
#[derive(Debug, Clone)]
pub struct TorProviderConfig {
    /// Path to the daemon executable. `Some` means this provider owns
    /// (launches and supervises) the daemon.
    pub executable: Option<PathBuf>,
    /// Main configuration file handed to the daemon.
    pub torrc: Option<PathBuf>,
    /// Defaults file handed to the daemon before the main one.
    pub defaults_torrc: Option<PathBuf>,
    /// Daemon data directory.
    pub data_dir: Option<PathBuf>,
    /// Directory holding onion-service client-auth keys.
    pub onion_auth_dir: Option<PathBuf>,
    /// GeoIP database for IPv4.
    pub geoip_file: Option<PathBuf>,
    /// GeoIP database for IPv6.
    pub geoip6_file: Option<PathBuf>,
    /// Where to reach (or expose) the control listener.
    pub control_address: Option<ControlAddress>,
    /// Where the daemon should expose its SOCKS listener.
    pub socks_address: Option<ControlAddress>,
    /// Control password. Generated per launch when owning and unset.
    pub control_password: Option<String>,
    /// Cookie file to authenticate with instead of a password.
    pub cookie_file: Option<PathBuf>,
    /// Launch with networking disabled (`DisableNetwork 1`), so bootstrap
    /// waits for [`begin_bootstrap`](crate::provider::TorProvider::begin_bootstrap).
    pub start_disabled: bool,
    /// Issue TAKEOWNERSHIP after authenticating, tying the daemon's
    /// lifetime to this control connection.
    pub take_ownership: bool,
    /// Overall cap on the connection-acquisition retry loop.
    pub connect_timeout: Duration,
    /// First delay of the retry loop; doubles per attempt.
    pub initial_retry_delay: Duration,
    /// Ceiling for the doubling retry delay.
    pub max_retry_delay: Duration,
}

impl Default for TorProviderConfig {
    fn default() -> Self {
        Self {
            executable: None,
            torrc: None,
            defaults_torrc: None,
            data_dir: None,
            onion_auth_dir: None,
            geoip_file: None,
            geoip6_file: None,
            control_address: None,
            socks_address: None,
            control_password: None,
            cookie_file: None,
            start_disabled: false,
            take_ownership: true,
            connect_timeout: Duration::from_secs(5 * 60),
            initial_retry_delay: Duration::from_millis(25),
            max_retry_delay: Duration::from_millis(500),
        }
    }
}

impl TorProviderConfig {
    /// Create a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Launch and supervise the daemon at `path`.
    pub fn executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable = Some(path.into());
        self
    }

    /// Set the main configuration file.
    pub fn torrc(mut self, path: impl Into<PathBuf>) -> Self {
        self.torrc = Some(path.into());
        self
    }

    /// Set the defaults configuration file.
    pub fn defaults_torrc(mut self, path: impl Into<PathBuf>) -> Self {
        self.defaults_torrc = Some(path.into());
        self
    }

    /// Set the daemon data directory.
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(path.into());
        self
    }

    /// Set the onion-service client-auth key directory.
    pub fn onion_auth_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.onion_auth_dir = Some(path.into());
        self
    }

    /// Set the GeoIP databases.
    pub fn geoip_files(
        mut self,
        v4: impl Into<PathBuf>,
        v6: impl Into<PathBuf>,
    ) -> Self {
        self.geoip_file = Some(v4.into());
        self.geoip6_file = Some(v6.into());
        self
    }

    /// Set the control listener address.
    pub fn control_address(mut self, address: ControlAddress) -> Self {
        self.control_address = Some(address);
        self
    }

    /// Set the SOCKS listener address.
    pub fn socks_address(mut self, address: ControlAddress) -> Self {
        self.socks_address = Some(address);
        self
    }

    /// Set the control password.
    pub fn control_password(mut self, password: impl Into<String>) -> Self {
        self.control_password = Some(password.into());
        self
    }

    /// Authenticate with the given cookie file.
    pub fn cookie_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.cookie_file = Some(path.into());
        self
    }

    /// Launch with networking disabled.
    pub fn start_disabled(mut self, disabled: bool) -> Self {
        self.start_disabled = disabled;
        self
    }

    /// Control whether TAKEOWNERSHIP is issued after connecting.
    pub fn take_ownership(mut self, take: bool) -> Self {
        self.take_ownership = take;
        self
    }

    /// Set the overall connection-acquisition timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Whether this provider launches and supervises the daemon itself.
    pub fn owns_daemon(&self) -> bool {
        self.executable.is_some()
    }

    /// The control address this configuration implies when none is set
    /// explicitly: a Unix socket in the data directory when launching on a
    /// platform that has them, the conventional TCP port otherwise.
    pub fn default_control_address(&self) -> ControlAddress {
        if self.owns_daemon() {
            #[cfg(unix)]
            if let Some(ref data_dir) = self.data_dir {
                return ControlAddress::Unix(data_dir.join("control.socket"));
            }
            ControlAddress::tcp("127.0.0.1", OWNED_CONTROL_PORT)
        } else {
            ControlAddress::tcp("127.0.0.1", DEFAULT_CONTROL_PORT)
        }
    }
}

/// Fully resolved control-connection parameters.
#[derive(Debug, Clone)]
pub struct ControlConnection {
    /// Where to connect.
    pub address: ControlAddress,
    /// How to authenticate.
    pub credential: AuthCredential,
}

/// Resolve connection parameters from the environment and configuration.
///
/// Environment variables win over configured values; a Unix-socket path
/// wins over host/port when both are present.
pub fn resolve_control_connection(config: &TorProviderConfig) -> Result<ControlConnection> {
    resolve_with(config, |name| std::env::var(name).ok())
}

fn resolve_with<F>(config: &TorProviderConfig, getenv: F) -> Result<ControlConnection>
where
    F: Fn(&str) -> Option<String>,
{
    let address = if let Some(path) = getenv(env::CONTROL_IPC_PATH).filter(|p| !p.is_empty()) {
        ControlAddress::Unix(PathBuf::from(path))
    } else {
        let host = getenv(env::CONTROL_HOST).filter(|h| !h.is_empty());
        let port = getenv(env::CONTROL_PORT)
            .filter(|p| !p.is_empty())
            .map(|p| {
                p.parse::<u16>()
                    .map_err(|_| TorError::Parse(format!("invalid {}: '{}'", env::CONTROL_PORT, p)))
            })
            .transpose()?;
        match (host, port) {
            (None, None) => config
                .control_address
                .clone()
                .unwrap_or_else(|| config.default_control_address()),
            (host, port) => ControlAddress::Tcp {
                host: host.unwrap_or_else(|| "127.0.0.1".to_string()),
                port: port.unwrap_or(DEFAULT_CONTROL_PORT),
            },
        }
    };

    let credential = if let Some(password) = getenv(env::CONTROL_PASSWD).filter(|p| !p.is_empty())
    {
        AuthCredential::Password(password)
    } else if let Some(cookie) =
        getenv(env::CONTROL_COOKIE_AUTH_FILE).filter(|p| !p.is_empty())
    {
        AuthCredential::CookieFile(PathBuf::from(cookie))
    } else if let Some(ref password) = config.control_password {
        AuthCredential::Password(password.clone())
    } else if let Some(ref cookie) = config.cookie_file {
        AuthCredential::CookieFile(cookie.clone())
    } else {
        AuthCredential::None
    };

    Ok(ControlConnection {
        address,
        credential,
    })
}

/// Check that a configured file exists before launch; missing files are
/// fatal and surfaced immediately, with no retry.
pub(crate) fn require_file(what: &str, path: &Path) -> Result<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(TorError::Process(format!(
            "{} not found: {}",
            what,
            path.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_address_parsing() {
        let tcp = ControlAddress::parse("127.0.0.1:9051").unwrap();
        assert_eq!(tcp, ControlAddress::tcp("127.0.0.1", 9051));

        let unix = ControlAddress::parse("unix:/var/run/tor/control").unwrap();
        assert_eq!(unix, ControlAddress::unix("/var/run/tor/control"));

        assert!(ControlAddress::parse("no-port").is_err());
        assert!(ControlAddress::parse("host:notanumber").is_err());
    }

    #[test]
    fn test_option_value_formats() {
        assert_eq!(
            ControlAddress::tcp("127.0.0.1", 9151).option_value(),
            "127.0.0.1:9151"
        );
        assert_eq!(
            ControlAddress::unix("/run/tor/control").option_value(),
            "unix:\"/run/tor/control\""
        );
    }

    #[test]
    fn test_env_ipc_path_wins() {
        let env = env_map(&[
            (env::CONTROL_IPC_PATH, "/run/tor/control"),
            (env::CONTROL_HOST, "10.0.0.1"),
            (env::CONTROL_PORT, "9999"),
        ]);
        let config = TorProviderConfig::new()
            .control_address(ControlAddress::tcp("127.0.0.1", 9051));
        let resolved = resolve_with(&config, |k| env.get(k).cloned()).unwrap();
        assert_eq!(resolved.address, ControlAddress::unix("/run/tor/control"));
    }

    #[test]
    fn test_env_host_port_override_config() {
        let env = env_map(&[(env::CONTROL_PORT, "9999")]);
        let config = TorProviderConfig::new()
            .control_address(ControlAddress::tcp("127.0.0.1", 9051));
        let resolved = resolve_with(&config, |k| env.get(k).cloned()).unwrap();
        assert_eq!(resolved.address, ControlAddress::tcp("127.0.0.1", 9999));
    }

    #[test]
    fn test_config_address_when_no_env() {
        let config = TorProviderConfig::new()
            .control_address(ControlAddress::tcp("192.0.2.5", 9051));
        let resolved = resolve_with(&config, |_| None).unwrap();
        assert_eq!(resolved.address, ControlAddress::tcp("192.0.2.5", 9051));
    }

    #[test]
    fn test_env_password_wins_over_cookie() {
        let env = env_map(&[
            (env::CONTROL_PASSWD, "sekrit"),
            (env::CONTROL_COOKIE_AUTH_FILE, "/run/tor/cookie"),
        ]);
        let config = TorProviderConfig::new();
        let resolved = resolve_with(&config, |k| env.get(k).cloned()).unwrap();
        assert!(matches!(
            resolved.credential,
            AuthCredential::Password(ref p) if p == "sekrit"
        ));
    }

    #[test]
    fn test_config_credential_fallback() {
        let config = TorProviderConfig::new().control_password("fromconfig");
        let resolved = resolve_with(&config, |_| None).unwrap();
        assert!(matches!(
            resolved.credential,
            AuthCredential::Password(ref p) if p == "fromconfig"
        ));

        let config = TorProviderConfig::new().cookie_file("/var/lib/tor/cookie");
        let resolved = resolve_with(&config, |_| None).unwrap();
        assert!(matches!(resolved.credential, AuthCredential::CookieFile(_)));
    }

    #[test]
    fn test_default_address_unowned() {
        let config = TorProviderConfig::new();
        assert_eq!(
            config.default_control_address(),
            ControlAddress::tcp("127.0.0.1", DEFAULT_CONTROL_PORT)
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_default_address_owned_prefers_unix() {
        let config = TorProviderConfig::new()
            .executable("/usr/bin/tor")
            .data_dir("/var/lib/tor");
        assert_eq!(
            config.default_control_address(),
            ControlAddress::unix("/var/lib/tor/control.socket")
        );
    }

    #[test]
    fn test_owns_daemon() {
        assert!(!TorProviderConfig::new().owns_daemon());
        assert!(TorProviderConfig::new().executable("/usr/bin/tor").owns_daemon());
    }
}
