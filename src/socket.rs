//! The control socket: message pump, command queue, and event dispatch.
//!
//! One background pump task per connection turns the transport's byte
//! stream into whole replies. Asynchronous notifications (status 650) go to
//! the subscription registry; every other reply settles the oldest
//! outstanding command. Concurrency across callers is achieved by queuing,
//! not by parallel writes: exactly one command is on the wire at a time.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{Result, TorError};
use crate::protocol::{MessageBuilder, Reply, ASYNC_EVENT_STATUS};
use crate::transport::Transport;

/// Callback invoked for matching asynchronous notifications. Runs on the
/// pump task, so it must not block; long work belongs on a channel.
pub type EventHandler = Box<dyn Fn(Reply) + Send + Sync>;

/// Predicate deciding whether a subscription receives a notification.
pub type EventPredicate = Box<dyn Fn(&Reply) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketState {
    Open,
    Closing,
    Closed,
}

struct PendingCommand {
    text: String,
    reply_tx: oneshot::Sender<Result<Reply>>,
}

struct CommandQueue {
    state: SocketState,
    pending: VecDeque<PendingCommand>,
}

struct Shared {
    transport: Transport,
    queue: Mutex<CommandQueue>,
    subscriptions: std::sync::Mutex<Vec<(EventPredicate, EventHandler)>>,
    shutdown: CancellationToken,
}

/// A connection to the daemon's control port.
///
/// State machine per connection: `Open → Closing → Closed`, one-way,
/// triggered by explicit [`close`](Self::close) or by any I/O or framing
/// error on the pump.
pub struct ControlSocket {
    shared: Arc<Shared>,
}

impl ControlSocket {
    /// Take ownership of a connected transport and start the pump.
    pub fn open(transport: Transport) -> Self {
        let shared = Arc::new(Shared {
            transport,
            queue: Mutex::new(CommandQueue {
                state: SocketState::Open,
                pending: VecDeque::new(),
            }),
            subscriptions: std::sync::Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(pump(Arc::clone(&shared)));
        ControlSocket { shared }
    }

    /// Submit one command and await its reply.
    ///
    /// Commands are serviced strictly in submission order; when the queue
    /// was empty the command is written immediately, otherwise it waits for
    /// the replies of everything ahead of it. `text` is CRLF-terminated if
    /// it is not already.
    pub async fn send_command(&self, text: impl Into<String>) -> Result<Reply> {
        let mut text = text.into();
        if !text.ends_with("\r\n") {
            text.push_str("\r\n");
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut queue = self.shared.queue.lock().await;
            if queue.state != SocketState::Open {
                return Err(TorError::ConnectionClosed);
            }
            let was_idle = queue.pending.is_empty();
            trace!(command = %text.trim_end(), queued = !was_idle, "submitting command");
            queue.pending.push_back(PendingCommand {
                text: text.clone(),
                reply_tx,
            });
            if was_idle {
                if let Err(e) = self.shared.transport.write(text.as_bytes()).await {
                    queue.pending.pop_back();
                    drop(queue);
                    // A transport error is fatal to the whole connection.
                    self.shared.shutdown.cancel();
                    return Err(e);
                }
            }
        }

        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(TorError::ConnectionClosed),
        }
    }

    /// Register an event subscription for the lifetime of this connection.
    ///
    /// Subscriptions are tested against every notification in registration
    /// order, non-exclusively: several may fire for one message.
    pub fn subscribe(&self, predicate: EventPredicate, handler: EventHandler) {
        lock_registry(&self.shared.subscriptions).push((predicate, handler));
    }

    /// Whether the connection is still open.
    pub async fn is_open(&self) -> bool {
        self.shared.queue.lock().await.state == SocketState::Open
    }

    /// Close the connection.
    ///
    /// Idempotent. Guarantees that every outstanding command has been
    /// rejected with [`TorError::ConnectionClosed`] by the time this
    /// returns, so a subsequent reconnect can never match a stale command
    /// against a reply from a different connection.
    pub async fn close(&self) {
        {
            let mut queue = self.shared.queue.lock().await;
            if queue.state == SocketState::Open {
                queue.state = SocketState::Closing;
            }
        }
        self.shared.shutdown.cancel();
        self.shared.transport.close().await;
        drain(&self.shared).await;
    }
}

impl Drop for ControlSocket {
    fn drop(&mut self) {
        // Stops the pump; it performs the final drain.
        self.shared.shutdown.cancel();
    }
}

fn lock_registry(
    registry: &std::sync::Mutex<Vec<(EventPredicate, EventHandler)>>,
) -> std::sync::MutexGuard<'_, Vec<(EventPredicate, EventHandler)>> {
    match registry.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Reject every outstanding command and mark the connection closed.
/// Guarded so it runs exactly once per connection.
async fn drain(shared: &Shared) {
    let mut queue = shared.queue.lock().await;
    if queue.state == SocketState::Closed {
        return;
    }
    queue.state = SocketState::Closed;
    if !queue.pending.is_empty() {
        debug!(
            outstanding = queue.pending.len(),
            "rejecting outstanding commands on close"
        );
    }
    for command in queue.pending.drain(..) {
        let _ = command.reply_tx.send(Err(TorError::ConnectionClosed));
    }
}

async fn pump(shared: Arc<Shared>) {
    let mut lines = LineBuffer::default();
    let reason = loop {
        let reply = tokio::select! {
            _ = shared.shutdown.cancelled() => break TorError::ConnectionClosed,
            message = read_message(&shared.transport, &mut lines) => match message {
                Ok(reply) => reply,
                Err(e) => break e,
            },
        };

        if reply.status == ASYNC_EVENT_STATUS {
            dispatch_event(&shared, reply);
            continue;
        }

        if let Err(e) = settle_head(&shared, reply).await {
            break e;
        }
    };

    match reason {
        TorError::ConnectionClosed => debug!("pump stopped: connection closed"),
        other => warn!(error = %other, "pump stopped"),
    }
    drain(&shared).await;
}

/// Assemble the next whole message from the transport.
async fn read_message(transport: &Transport, lines: &mut LineBuffer) -> Result<Reply> {
    let mut builder = MessageBuilder::new();
    loop {
        while let Some(line) = lines.next_line()? {
            trace!(line = %line, "received line");
            if builder.push_line(&line) {
                return builder.finish();
            }
        }
        let bytes = transport.read().await?;
        lines.extend(&bytes);
    }
}

/// Hand a notification to every matching subscription, in registration
/// order. Multiple subscriptions may fire for one message.
fn dispatch_event(shared: &Shared, reply: Reply) {
    let registry = lock_registry(&shared.subscriptions);
    let mut delivered = false;
    for (predicate, handler) in registry.iter() {
        if predicate(&reply) {
            handler(reply.clone());
            delivered = true;
        }
    }
    if !delivered {
        trace!(event = reply.first_line(), "event with no subscriber");
    }
}

/// Settle the oldest outstanding command with `reply`, then put the next
/// queued command on the wire.
async fn settle_head(shared: &Shared, reply: Reply) -> Result<()> {
    let mut queue = shared.queue.lock().await;
    let Some(head) = queue.pending.pop_front() else {
        return Err(TorError::Protocol(format!(
            "reply {} with no outstanding command: {}",
            reply.status,
            reply.first_line()
        )));
    };

    if reply.is_success() {
        let _ = head.reply_tx.send(Ok(reply));
    } else if reply.is_error() {
        let _ = head.reply_tx.send(Err(TorError::Command {
            status: reply.status,
            message: reply.text(),
        }));
    } else {
        // Neither success, error, nor notification: the framing state can
        // no longer be trusted.
        let status = reply.status;
        let _ = head.reply_tx.send(Err(TorError::Protocol(format!(
            "unexpected reply status {}",
            status
        ))));
        return Err(TorError::Protocol(format!(
            "unexpected reply status {}",
            status
        )));
    }

    if let Some(next) = queue.pending.front() {
        shared.transport.write(next.text.as_bytes()).await?;
    }
    Ok(())
}

/// Splits the raw byte stream into CRLF-terminated lines.
#[derive(Default)]
struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete line, CRLF stripped. `None` until one is
    /// buffered in full.
    fn next_line(&mut self) -> Result<Option<String>> {
        let Some(newline) = self.buf.iter().position(|&b| b == b'\n') else {
            return Ok(None);
        };
        let mut line: Vec<u8> = self.buf.drain(..=newline).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        String::from_utf8(line)
            .map(Some)
            .map_err(|e| TorError::Protocol(format!("invalid UTF-8 on control stream: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn socket_pair() -> (ControlSocket, tokio::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (transport, peer) = tokio::join!(
            Transport::connect_tcp("127.0.0.1", addr.port()),
            async { listener.accept().await.unwrap().0 },
        );
        (ControlSocket::open(transport.unwrap()), peer)
    }

    async fn read_command(peer: &mut tokio::net::TcpStream) -> String {
        let mut buf = [0u8; 512];
        let n = peer.read(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf[..n]).to_string()
    }

    #[tokio::test]
    async fn test_command_gets_reply() {
        let (socket, mut peer) = socket_pair().await;

        let server = tokio::spawn(async move {
            let cmd = read_command(&mut peer).await;
            assert_eq!(cmd, "GETINFO version\r\n");
            peer.write_all(b"250-version=0.4.8.12\r\n250 OK\r\n")
                .await
                .unwrap();
            peer
        });

        let reply = socket.send_command("GETINFO version").await.unwrap();
        assert_eq!(reply.status, 250);
        assert_eq!(reply.lines, vec!["version=0.4.8.12", "OK"]);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_reply_is_typed() {
        let (socket, mut peer) = socket_pair().await;

        tokio::spawn(async move {
            let _ = read_command(&mut peer).await;
            peer.write_all(b"552 Unrecognized option\r\n").await.unwrap();
            peer
        });

        match socket.send_command("GETCONF Bogus").await {
            Err(TorError::Command { status, message }) => {
                assert_eq!(status, 552);
                assert!(message.contains("Unrecognized option"));
            }
            other => panic!("expected Command error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_rejects_outstanding_commands() {
        let (socket, peer) = socket_pair().await;
        let socket = Arc::new(socket);

        // Three commands the server will never answer.
        let mut handles = Vec::new();
        for i in 0..3 {
            let socket = Arc::clone(&socket);
            handles.push(tokio::spawn(async move {
                socket.send_command(format!("GETINFO slot/{}", i)).await
            }));
        }
        tokio::task::yield_now().await;

        socket.close().await;
        for handle in handles {
            match handle.await.unwrap() {
                Err(TorError::ConnectionClosed) => {}
                other => panic!("expected ConnectionClosed, got {:?}", other),
            }
        }
        assert!(!socket.is_open().await);
        // Submitting after close fails immediately.
        assert!(matches!(
            socket.send_command("GETINFO version").await,
            Err(TorError::ConnectionClosed)
        ));
        drop(peer);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (socket, _peer) = socket_pair().await;
        socket.close().await;
        socket.close().await;
        assert!(!socket.is_open().await);
    }

    #[tokio::test]
    async fn test_peer_eof_rejects_outstanding() {
        let (socket, mut peer) = socket_pair().await;
        let socket = Arc::new(socket);

        let cmd = {
            let socket = Arc::clone(&socket);
            tokio::spawn(async move { socket.send_command("GETINFO version").await })
        };
        let _ = read_command(&mut peer).await;
        drop(peer);

        let pending = cmd.await.unwrap();
        assert!(matches!(pending, Err(TorError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_events_do_not_consume_commands() {
        let (socket, mut peer) = socket_pair().await;

        let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel();
        socket.subscribe(
            Box::new(|reply| reply.first_line().starts_with("CIRC ")),
            Box::new(move |reply| {
                let _ = event_tx.send(reply);
            }),
        );

        tokio::spawn(async move {
            let _ = read_command(&mut peer).await;
            // An async event interleaved before the command's reply.
            peer.write_all(b"650 CIRC 1 BUILT\r\n250 OK\r\n").await.unwrap();
            peer
        });

        let reply = socket.send_command("SIGNAL NEWNYM").await.unwrap();
        assert_eq!(reply.status, 250);

        let event = event_rx.recv().await.unwrap();
        assert_eq!(event.status, 650);
        assert_eq!(event.first_line(), "CIRC 1 BUILT");
    }

    #[tokio::test]
    async fn test_multiple_subscriptions_fire_for_one_event() {
        let (socket, mut peer) = socket_pair().await;

        let (tx1, mut rx1) = tokio::sync::mpsc::unbounded_channel();
        let (tx2, mut rx2) = tokio::sync::mpsc::unbounded_channel();
        socket.subscribe(
            Box::new(|r| r.first_line().starts_with("CIRC ")),
            Box::new(move |r| {
                let _ = tx1.send(r.first_line().to_string());
            }),
        );
        socket.subscribe(
            Box::new(|r| r.status == 650),
            Box::new(move |r| {
                let _ = tx2.send(r.first_line().to_string());
            }),
        );

        peer.write_all(b"650 CIRC 2 CLOSED\r\n").await.unwrap();
        assert_eq!(rx1.recv().await.unwrap(), "CIRC 2 CLOSED");
        assert_eq!(rx2.recv().await.unwrap(), "CIRC 2 CLOSED");
    }

    #[tokio::test]
    async fn test_framing_error_closes_connection() {
        let (socket, mut peer) = socket_pair().await;

        tokio::spawn(async move {
            let _ = read_command(&mut peer).await;
            peer.write_all(b"garbage without a status code\r\n")
                .await
                .unwrap();
            peer
        });

        let result = socket.send_command("GETINFO version").await;
        assert!(matches!(result, Err(TorError::ConnectionClosed)));
        assert!(!socket.is_open().await);
    }

    #[test]
    fn test_line_buffer_splits_crlf() {
        let mut lines = LineBuffer::default();
        lines.extend(b"250 OK\r\n650 CIRC");
        assert_eq!(lines.next_line().unwrap().as_deref(), Some("250 OK"));
        assert_eq!(lines.next_line().unwrap(), None);
        lines.extend(b" 1 BUILT\r\n");
        assert_eq!(
            lines.next_line().unwrap().as_deref(),
            Some("650 CIRC 1 BUILT")
        );
    }
}
