//! Typed operations on a control connection.
//!
//! [`TorController`] layers the command grammar and reply grammar of each
//! operation over [`ControlSocket::send_command`]. Every non-success reply
//! surfaces as [`TorError::Command`] with the daemon's own status code and
//! message text, so callers can tell "feature unsupported" apart from
//! "transient failure" without re-parsing.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::auth::{
    compute_client_hash, format_cookie_hex, generate_client_nonce, parse_authchallenge_response,
    read_cookie_file, verify_server_hash, AuthCredential,
};
use crate::config::ControlAddress;
use crate::error::{Result, TorError};
use crate::events::EventType;
use crate::protocol::{escape_string, format_command, parse_key_value_pairs, quote_string, Reply};
use crate::socket::ControlSocket;
use crate::transport::Transport;
use crate::types::{BridgeLine, ConfValue, OnionAuthKey, Signal};

/// A typed client for one control connection.
///
/// Cheap to clone; all clones share the same socket and command queue.
#[derive(Clone)]
pub struct TorController {
    socket: Arc<ControlSocket>,
}

impl TorController {
    /// Connect to a control listener. The connection is not authenticated
    /// yet; callers must [`authenticate`](Self::authenticate) before
    /// issuing anything else.
    pub async fn open(address: &ControlAddress) -> Result<Self> {
        let transport = Transport::connect(address).await?;
        Ok(Self::from_socket(ControlSocket::open(transport)))
    }

    /// Wrap an already-open socket.
    pub fn from_socket(socket: ControlSocket) -> Self {
        TorController {
            socket: Arc::new(socket),
        }
    }

    /// The underlying socket, for event subscriptions.
    pub fn socket(&self) -> &ControlSocket {
        &self.socket
    }

    /// Send a raw command line and await its reply.
    pub async fn send_command(&self, text: impl Into<String>) -> Result<Reply> {
        self.socket.send_command(text).await
    }

    /// Close the connection, rejecting anything still queued.
    pub async fn close(&self) {
        self.socket.close().await;
    }

    /// Whether the connection is still open.
    pub async fn is_open(&self) -> bool {
        self.socket.is_open().await
    }

    /// Authenticate the connection.
    ///
    /// Failure is fatal for the connection: the daemon closes the socket on
    /// a rejected AUTHENTICATE, so this closes our side too.
    pub async fn authenticate(&self, credential: &AuthCredential) -> Result<()> {
        let result = self.authenticate_inner(credential).await;
        if let Err(ref e) = result {
            debug!(error = %e, "authentication failed, closing connection");
            self.socket.close().await;
        }
        result
    }

    async fn authenticate_inner(&self, credential: &AuthCredential) -> Result<()> {
        match credential {
            AuthCredential::None => {
                self.send_command("AUTHENTICATE").await.map_err(auth_error)?;
            }
            AuthCredential::Password(password) => {
                let cmd = format_command("AUTHENTICATE", &[&quote_string(password)]);
                self.send_command(cmd).await.map_err(auth_error)?;
            }
            AuthCredential::CookieFile(path) => {
                let cookie = read_cookie_file(path)?;
                let cmd = format_command("AUTHENTICATE", &[&format_cookie_hex(&cookie)]);
                self.send_command(cmd).await.map_err(auth_error)?;
            }
            AuthCredential::SafeCookie { cookie_path } => {
                let cookie = read_cookie_file(cookie_path)?;
                let client_nonce = generate_client_nonce();

                let cmd = format_command(
                    "AUTHCHALLENGE",
                    &["SAFECOOKIE", &hex::encode_upper(client_nonce)],
                );
                let reply = self.send_command(cmd).await.map_err(auth_error)?;
                let (server_hash, server_nonce) =
                    parse_authchallenge_response(reply.first_line())?;

                if !verify_server_hash(&cookie, &client_nonce, &server_nonce, &server_hash) {
                    return Err(TorError::AuthenticationFailed(
                        "server hash verification failed".to_string(),
                    ));
                }

                let client_hash = compute_client_hash(&cookie, &client_nonce, &server_nonce);
                let cmd =
                    format_command("AUTHENTICATE", &[&hex::encode_upper(client_hash)]);
                self.send_command(cmd).await.map_err(auth_error)?;
            }
        }
        debug!("authentication successful");
        Ok(())
    }

    /// Fetch one GETINFO value, handling both the single-line `key=value`
    /// form and the multi-line `key=` + data form.
    pub async fn get_info(&self, key: &str) -> Result<String> {
        let cmd = format_command("GETINFO", &[key]);
        let reply = self.send_command(cmd).await?;

        let prefix = format!("{}=", key);
        let Some(first) = reply.lines.first().and_then(|l| l.strip_prefix(&prefix)) else {
            return Err(TorError::Parse(format!(
                "GETINFO {}: key not found in reply",
                key
            )));
        };

        if reply.lines.len() <= 2 {
            // Single-line form: value on the first line, then "OK".
            return Ok(first.to_string());
        }
        // Multi-line form: data lines between "key=" and the final "OK".
        Ok(reply.lines[1..reply.lines.len() - 1].join("\n"))
    }

    /// Fetch the daemon's version string.
    pub async fn get_version(&self) -> Result<String> {
        self.get_info("version").await
    }

    /// Fetch one configuration option's values.
    ///
    /// A `250 key` reply without `=` means the option is at its default:
    /// that is an empty vec, not an error. List options produce one entry
    /// per reply line.
    pub async fn get_conf(&self, key: &str) -> Result<Vec<String>> {
        let cmd = format_command("GETCONF", &[key]);
        let reply = self.send_command(cmd).await?;

        let prefix = format!("{}=", key);
        let mut values = Vec::new();
        for line in &reply.lines {
            if let Some(value) = line.strip_prefix(&prefix) {
                values.push(value.to_string());
            }
            // A bare `key` line reports the default value: contribute nothing.
        }
        Ok(values)
    }

    /// Apply configuration values in one SETCONF command.
    ///
    /// Booleans are encoded as `1`/`0`, sequences as repeated `key=value`
    /// pairs (or the bare key when the sequence is empty), and strings are
    /// escaped.
    pub async fn set_conf(&self, settings: &[(&str, ConfValue)]) -> Result<()> {
        if settings.is_empty() {
            return Ok(());
        }
        let args = serialize_conf(settings);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let cmd = format_command("SETCONF", &arg_refs);
        self.send_command(cmd).await?;
        Ok(())
    }

    /// Like [`set_conf`](Self::set_conf), but skips values the cache says
    /// are already applied, and records what was written.
    ///
    /// The cache is never authoritative: the daemon is. It exists purely to
    /// avoid redundant writes.
    pub async fn set_conf_cached(
        &self,
        cache: &mut SettingsCache,
        settings: &[(&str, ConfValue)],
    ) -> Result<()> {
        let changed: Vec<(&str, ConfValue)> = settings
            .iter()
            .filter(|(key, value)| cache.get(key) != Some(value))
            .map(|(key, value)| (*key, value.clone()))
            .collect();
        if changed.is_empty() {
            return Ok(());
        }
        self.set_conf(&changed).await?;
        for (key, value) in changed {
            cache.record(key, value);
        }
        Ok(())
    }

    /// Persist the daemon's configuration to disk.
    pub async fn save_conf(&self) -> Result<()> {
        self.send_command("SAVECONF").await?;
        Ok(())
    }

    /// Send a signal.
    pub async fn signal(&self, signal: Signal) -> Result<()> {
        let cmd = format_command("SIGNAL", &[signal.as_str()]);
        self.send_command(cmd).await?;
        Ok(())
    }

    /// Switch to clean circuits.
    pub async fn newnym(&self) -> Result<()> {
        self.signal(Signal::NewNym).await
    }

    /// Replace the set of subscribed event types.
    ///
    /// SETEVENTS has replace semantics, not add: pass the complete desired
    /// set on every call.
    pub async fn set_events(&self, types: &[EventType]) -> Result<()> {
        let names: Vec<&str> = types.iter().map(EventType::as_str).collect();
        let cmd = format_command("SETEVENTS", &names);
        self.send_command(cmd).await?;
        debug!(events = ?names, "subscribed to events");
        Ok(())
    }

    /// Register a handler for one event type.
    ///
    /// The handler receives the notification's lines with the event-type
    /// prefix stripped from the first. Registration lasts for the lifetime
    /// of the connection; delivery additionally requires the type to be in
    /// the set passed to [`set_events`](Self::set_events).
    pub fn watch_event<H>(&self, event_type: EventType, handler: H)
    where
        H: Fn(Vec<String>) + Send + Sync + 'static,
    {
        let name = event_type.as_str();
        let prefix = format!("{} ", name);
        let matcher = prefix.clone();
        self.socket.subscribe(
            Box::new(move |reply| {
                let first = reply.first_line();
                first.starts_with(&matcher) || first == name
            }),
            Box::new(move |reply| {
                let mut lines = reply.lines;
                if let Some(first) = lines.first_mut() {
                    *first = first
                        .strip_prefix(&prefix)
                        .unwrap_or("")
                        .to_string();
                }
                handler(lines);
            }),
        );
    }

    /// Tie the daemon's lifetime to this control connection.
    ///
    /// Issues TAKEOWNERSHIP, then clears `__OwningControllerProcess` so the
    /// PID handed over at launch stops mattering: from here on, closing
    /// this connection is what makes the daemon exit.
    pub async fn take_ownership(&self) -> Result<()> {
        self.send_command("TAKEOWNERSHIP").await?;
        self.send_command("RESETCONF __OwningControllerProcess")
            .await?;
        debug!("took ownership of the daemon");
        Ok(())
    }

    /// Fetch the configured bridge descriptors.
    pub async fn get_bridges(&self) -> Result<Vec<BridgeLine>> {
        self.get_conf("Bridge")
            .await?
            .iter()
            .map(|line| crate::protocol::parse_bridge_line(line))
            .collect()
    }

    /// Fetch the configured pluggable-transport launch descriptors.
    pub async fn get_pluggable_transports(&self) -> Result<Vec<String>> {
        self.get_conf("ClientTransportPlugin").await
    }

    /// Install a client-auth key for an authenticated onion service.
    pub async fn onion_auth_add(
        &self,
        address: &str,
        key_blob: &str,
        permanent: bool,
    ) -> Result<()> {
        let key_arg = format!("x25519:{}", key_blob);
        let mut args = vec![address, key_arg.as_str()];
        if permanent {
            args.push("Flags=Permanent");
        }
        let cmd = format_command("ONION_CLIENT_AUTH_ADD", &args);
        self.send_command(cmd).await?;
        Ok(())
    }

    /// Remove a client-auth key.
    pub async fn onion_auth_remove(&self, address: &str) -> Result<()> {
        let cmd = format_command("ONION_CLIENT_AUTH_REMOVE", &[address]);
        self.send_command(cmd).await?;
        Ok(())
    }

    /// List installed client-auth keys, optionally for one address.
    pub async fn onion_auth_view(&self, address: Option<&str>) -> Result<Vec<OnionAuthKey>> {
        let cmd = match address {
            Some(addr) => format_command("ONION_CLIENT_AUTH_VIEW", &[addr]),
            None => format_command("ONION_CLIENT_AUTH_VIEW", &[]),
        };
        let reply = self.send_command(cmd).await?;

        let mut keys = Vec::new();
        for line in &reply.lines {
            let Some(rest) = line.strip_prefix("CLIENT ") else {
                continue;
            };
            let mut parts = rest.splitn(3, ' ');
            let (Some(addr), Some(key)) = (parts.next(), parts.next()) else {
                return Err(TorError::Parse(format!(
                    "malformed ONION_CLIENT_AUTH_VIEW line: '{}'",
                    line
                )));
            };
            let (key_type, key_blob) = key.split_once(':').ok_or_else(|| {
                TorError::Parse(format!("malformed client-auth key: '{}'", key))
            })?;
            let kv = parse_key_value_pairs(parts.next().unwrap_or(""));
            let flags = kv
                .get("Flags")
                .map(|f| f.split(',').map(str::to_string).collect())
                .unwrap_or_default();
            keys.push(OnionAuthKey {
                address: addr.to_string(),
                key_type: key_type.to_string(),
                key_blob: key_blob.to_string(),
                flags,
            });
        }
        Ok(keys)
    }
}

fn auth_error(err: TorError) -> TorError {
    match err {
        TorError::Command { status, message } => TorError::AuthenticationFailed(format!(
            "daemon rejected credentials (status {}): {}",
            status, message
        )),
        other => other,
    }
}

/// Serialize SETCONF arguments from typed values.
fn serialize_conf(settings: &[(&str, ConfValue)]) -> Vec<String> {
    let mut args = Vec::new();
    for (key, value) in settings {
        match value {
            ConfValue::Bool(b) => args.push(format!("{}={}", key, if *b { "1" } else { "0" })),
            ConfValue::Str(s) => args.push(format!("{}={}", key, escape_string(s))),
            ConfValue::List(values) if values.is_empty() => args.push((*key).to_string()),
            ConfValue::List(values) => {
                for v in values {
                    args.push(format!("{}={}", key, escape_string(v)));
                }
            }
        }
    }
    args
}

/// Last-written configuration values, used purely to avoid redundant
/// writes. The daemon stays authoritative.
#[derive(Debug, Default)]
pub struct SettingsCache {
    values: HashMap<String, ConfValue>,
}

impl SettingsCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// The last value recorded for `key`, if any.
    pub fn get(&self, key: &str) -> Option<&ConfValue> {
        self.values.get(key)
    }

    /// Record a written value.
    pub fn record(&mut self, key: &str, value: ConfValue) {
        self.values.insert(key.to_string(), value);
    }

    /// Forget everything, e.g. after a daemon restart.
    pub fn clear(&mut self) {
        self.values.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_conf_bool() {
        let args = serialize_conf(&[("DisableNetwork", ConfValue::Bool(true))]);
        assert_eq!(args, vec!["DisableNetwork=1"]);
        let args = serialize_conf(&[("DisableNetwork", ConfValue::Bool(false))]);
        assert_eq!(args, vec!["DisableNetwork=0"]);
    }

    #[test]
    fn test_serialize_conf_string_escaped() {
        let args = serialize_conf(&[("HTTPSProxy", ConfValue::Str("host with space".into()))]);
        assert_eq!(args, vec!["HTTPSProxy=\"host with space\""]);
    }

    #[test]
    fn test_serialize_conf_list() {
        let args = serialize_conf(&[(
            "Bridge",
            ConfValue::List(vec!["192.0.2.1:443".to_string(), "192.0.2.2:443".to_string()]),
        )]);
        assert_eq!(args, vec!["Bridge=192.0.2.1:443", "Bridge=192.0.2.2:443"]);
    }

    #[test]
    fn test_serialize_conf_empty_list_is_bare_key() {
        let args = serialize_conf(&[("Bridge", ConfValue::List(vec![]))]);
        assert_eq!(args, vec!["Bridge"]);
    }

    #[test]
    fn test_settings_cache_skips_unchanged() {
        let mut cache = SettingsCache::new();
        assert_eq!(cache.get("UseBridges"), None);
        cache.record("UseBridges", ConfValue::Bool(true));
        assert_eq!(cache.get("UseBridges"), Some(&ConfValue::Bool(true)));
        cache.clear();
        assert_eq!(cache.get("UseBridges"), None);
    }

    #[test]
    fn test_auth_error_mapping() {
        let mapped = auth_error(TorError::Command {
            status: 515,
            message: "Authentication failed".to_string(),
        });
        assert!(matches!(mapped, TorError::AuthenticationFailed(_)));

        let passthrough = auth_error(TorError::ConnectionClosed);
        assert!(matches!(passthrough, TorError::ConnectionClosed));
    }
}
