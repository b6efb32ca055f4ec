//! Test utilities: a scripted mock control server.
//!
//! [`MockControlServer`] speaks just enough of the wire protocol to
//! exercise the socket, controller, and provider layers over a real TCP
//! connection, with no daemon anywhere: commands are answered from a
//! [`Script`], and asynchronous events can be injected at any point.
//!
//! Enable with the `test-utils` feature:
//!
//! ```toml
//! [dev-dependencies]
//! tor-provider = { version = "0.1", features = ["test-utils"] }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};

use crate::config::ControlAddress;

/// Join reply lines with CRLF, terminated.
pub fn reply(lines: &[&str]) -> String {
    let mut out = lines.join("\r\n");
    out.push_str("\r\n");
    out
}

/// Format an asynchronous event notification.
pub fn event(text: &str) -> String {
    format!("650 {}\r\n", text)
}

/// Command-to-reply rules, first matching prefix wins, with a default for
/// everything common (AUTHENTICATE, SETEVENTS, SETCONF, ...).
#[derive(Debug, Clone, Default)]
pub struct Script {
    rules: Vec<(String, String)>,
}

impl Script {
    /// An empty script: every command gets the default response.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands starting with `prefix` with `response` (CRLF
    /// appended if missing).
    pub fn on(mut self, prefix: &str, response: &str) -> Self {
        let mut response = response.to_string();
        if !response.ends_with("\r\n") {
            response.push_str("\r\n");
        }
        self.rules.push((prefix.to_string(), response));
        self
    }

    /// The response for one command line.
    pub fn respond(&self, command: &str) -> String {
        for (prefix, response) in &self.rules {
            if command.starts_with(prefix.as_str()) {
                return response.clone();
            }
        }
        default_response(command)
    }
}

/// Plausible default replies for the commands the crate issues.
pub fn default_response(command: &str) -> String {
    let keyword = command.split_whitespace().next().unwrap_or("");
    match keyword {
        "AUTHENTICATE" | "SETEVENTS" | "SETCONF" | "RESETCONF" | "SAVECONF" | "SIGNAL"
        | "TAKEOWNERSHIP" | "QUIT" | "ONION_CLIENT_AUTH_ADD" | "ONION_CLIENT_AUTH_REMOVE" => {
            reply(&["250 OK"])
        }
        "GETINFO" => {
            let key = command.split_whitespace().nth(1).unwrap_or("");
            match key {
                "version" => reply(&["250-version=0.4.8.12", "250 OK"]),
                "status/bootstrap-phase" => reply(&[
                    "250-status/bootstrap-phase=NOTICE BOOTSTRAP PROGRESS=0 TAG=starting \
                     SUMMARY=\"Starting\"",
                    "250 OK",
                ]),
                _ => format!("552 Unrecognized key \"{}\"\r\n", key),
            }
        }
        "GETCONF" => {
            let key = command.split_whitespace().nth(1).unwrap_or("");
            format!("250 {}\r\n", key)
        }
        _ => format!("510 Unrecognized command \"{}\"\r\n", keyword),
    }
}

/// A mock control listener on a loopback TCP port.
///
/// Connections are served one at a time, so a reconnecting client keeps
/// talking to the same script and injection queue.
pub struct MockControlServer {
    addr: SocketAddr,
    inject_tx: mpsc::UnboundedSender<String>,
    commands: Arc<std::sync::Mutex<Vec<String>>>,
}

impl MockControlServer {
    /// Bind a listener and start serving `script`.
    pub async fn start(script: Script) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock control server");
        let addr = listener.local_addr().expect("mock server address");

        let (inject_tx, inject_rx) = mpsc::unbounded_channel();
        let inject_rx = Arc::new(Mutex::new(inject_rx));
        let commands = Arc::new(std::sync::Mutex::new(Vec::new()));

        let served_commands = Arc::clone(&commands);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                serve_connection(
                    stream,
                    script.clone(),
                    Arc::clone(&inject_rx),
                    Arc::clone(&served_commands),
                )
                .await;
            }
        });

        MockControlServer {
            addr,
            inject_tx,
            commands,
        }
    }

    /// The listener's address, as a [`ControlAddress`].
    pub fn control_address(&self) -> ControlAddress {
        ControlAddress::tcp("127.0.0.1", self.addr.port())
    }

    /// Push an asynchronous event notification to the connected client.
    pub fn inject_event(&self, text: &str) {
        let _ = self.inject_tx.send(event(text));
    }

    /// Push raw bytes to the connected client.
    pub fn inject_raw(&self, text: &str) {
        let _ = self.inject_tx.send(text.to_string());
    }

    /// Every command line received so far, in order.
    pub fn commands(&self) -> Vec<String> {
        match self.commands.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    script: Script,
    inject_rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    commands: Arc<std::sync::Mutex<Vec<String>>>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut inject_rx = inject_rx.lock().await;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                if let Ok(mut guard) = commands.lock() {
                    guard.push(line.clone());
                }
                let response = script.respond(&line);
                if write_half.write_all(response.as_bytes()).await.is_err() {
                    break;
                }
            }
            injected = inject_rx.recv() => {
                let Some(text) = injected else { break };
                if write_half.write_all(text.as_bytes()).await.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_formatting() {
        assert_eq!(reply(&["250 OK"]), "250 OK\r\n");
        assert_eq!(
            reply(&["250-version=1", "250 OK"]),
            "250-version=1\r\n250 OK\r\n"
        );
    }

    #[test]
    fn test_event_formatting() {
        assert_eq!(event("CIRC 1 BUILT"), "650 CIRC 1 BUILT\r\n");
    }

    #[test]
    fn test_script_prefix_match_wins_over_default() {
        let script = Script::new().on("GETCONF Bridge", "250 Bridge=192.0.2.1:443");
        assert_eq!(
            script.respond("GETCONF Bridge"),
            "250 Bridge=192.0.2.1:443\r\n"
        );
        assert_eq!(script.respond("AUTHENTICATE \"pw\""), "250 OK\r\n");
    }

    #[test]
    fn test_default_responses() {
        assert_eq!(default_response("SETEVENTS CIRC STREAM"), "250 OK\r\n");
        assert!(default_response("GETINFO version").contains("0.4.8.12"));
        assert!(default_response("BOGUS").starts_with("510"));
        assert_eq!(default_response("GETCONF Bridge"), "250 Bridge\r\n");
    }

    #[tokio::test]
    async fn test_server_answers_and_records() {
        use tokio::io::AsyncReadExt;

        let server = MockControlServer::start(Script::new()).await;
        let ControlAddress::Tcp { host, port } = server.control_address() else {
            panic!("expected tcp address");
        };
        let mut client = TcpStream::connect((host.as_str(), port)).await.unwrap();

        client.write_all(b"AUTHENTICATE \"pw\"\r\n").await.unwrap();
        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"250 OK\r\n");

        server.inject_event("CIRC 1 BUILT");
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"650 CIRC 1 BUILT\r\n");

        assert_eq!(server.commands(), vec!["AUTHENTICATE \"pw\"".to_string()]);
    }
}
