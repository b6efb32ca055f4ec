//! The provider: daemon lifecycle plus connection state machine.
//!
//! [`TorProvider`] owns the process supervisor and the control connection,
//! folds asynchronous notifications into state (bootstrap progress, the
//! circuit map, the current bridge), and broadcasts typed
//! [`TorProviderEvent`]s to collaborators over an explicit event bus.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::auth::{generate_password, hash_password, AuthCredential};
use crate::config::{resolve_control_connection, ControlConnection, TorProviderConfig};
use crate::controller::{SettingsCache, TorController};
use crate::error::{Result, TorError};
use crate::events::{
    parse_circuit_event, parse_stream_event, CircuitStatus, ControlEvent, EventType,
    StreamStatus, TorProviderEvent,
};
use crate::process::TorProcess;
use crate::protocol::parse_bootstrap_status;
use crate::types::{
    BootstrapStatus, BridgeLine, CircuitId, ConfValue, Fingerprint, NodeData, StatusSeverity,
};

const EVENT_BUS_CAPACITY: usize = 128;

#[derive(Default)]
struct ProviderState {
    circuits: HashMap<CircuitId, Vec<Fingerprint>>,
    current_bridge: Option<NodeData>,
    bootstrap: Option<BootstrapStatus>,
    bootstrapped: bool,
    last_warning: Option<(String, Option<String>)>,
    connect_failed: bool,
}

struct ProviderInner {
    config: TorProviderConfig,
    state: std::sync::Mutex<ProviderState>,
    settings: tokio::sync::Mutex<SettingsCache>,
    controller: tokio::sync::Mutex<Option<TorController>>,
    resolved: tokio::sync::Mutex<Option<ControlConnection>>,
    process: std::sync::Mutex<Option<TorProcess>>,
    events_tx: broadcast::Sender<TorProviderEvent>,
    shutdown: CancellationToken,
}

/// One explicit service instance: construct once at startup, drive with
/// [`init`](Self::init), tear down with [`shutdown`](Self::shutdown).
#[derive(Clone)]
pub struct TorProvider {
    inner: Arc<ProviderInner>,
}

impl TorProvider {
    /// Create a provider. Nothing is launched or connected until
    /// [`init`](Self::init).
    pub fn new(config: TorProviderConfig) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        TorProvider {
            inner: Arc::new(ProviderInner {
                config,
                state: std::sync::Mutex::new(ProviderState::default()),
                settings: tokio::sync::Mutex::new(SettingsCache::new()),
                controller: tokio::sync::Mutex::new(None),
                resolved: tokio::sync::Mutex::new(None),
                process: std::sync::Mutex::new(None),
                events_tx,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Subscribe to provider events. Subscribe before [`init`](Self::init)
    /// to observe the initial `Ready`.
    pub fn subscribe(&self) -> broadcast::Receiver<TorProviderEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Resolve connection parameters, launch the daemon when owning it,
    /// and establish the control connection.
    pub async fn init(&self) -> Result<()> {
        if self.inner.controller.lock().await.is_some() {
            return Ok(());
        }

        let mut conn = resolve_control_connection(&self.inner.config)?;
        if self.inner.config.owns_daemon() {
            let hashed = match conn.credential {
                AuthCredential::None => {
                    let password = generate_password();
                    let hashed = hash_password(&password);
                    conn.credential = AuthCredential::Password(password);
                    Some(hashed)
                }
                AuthCredential::Password(ref password) => Some(hash_password(password)),
                _ => None,
            };

            let events_tx = self.inner.events_tx.clone();
            let process = TorProcess::new(
                &self.inner.config,
                conn.address.clone(),
                hashed,
                Box::new(move |exit_code| {
                    let _ = events_tx.send(TorProviderEvent::ProcessExited { exit_code });
                }),
            )?;
            process.start().await?;
            *lock_sync(&self.inner.process) = Some(process);
        }

        *self.inner.resolved.lock().await = Some(conn.clone());
        self.establish(&conn).await
    }

    /// Tear down the old connection (draining and rejecting its queue
    /// first), then run the connection loop again.
    pub async fn reconnect(&self) -> Result<()> {
        if let Some(old) = self.inner.controller.lock().await.take() {
            old.close().await;
        }
        {
            // Circuits built under the old connection are dropped here;
            // see the design notes for why this is deliberate.
            let mut state = lock_sync(&self.inner.state);
            state.circuits.clear();
            state.current_bridge = None;
        }

        let conn = self
            .inner
            .resolved
            .lock()
            .await
            .clone()
            .ok_or_else(|| TorError::ConnectionFailed("provider not initialized".to_string()))?;
        self.establish(&conn).await
    }

    /// Relaunch the daemon after an unexpected exit and reconnect.
    pub async fn restart_daemon(&self) -> Result<()> {
        let process = lock_sync(&self.inner.process)
            .clone()
            .ok_or_else(|| TorError::Process("provider does not own the daemon".to_string()))?;

        if let Some(old) = self.inner.controller.lock().await.take() {
            old.close().await;
        }
        {
            // A restart resets bootstrap progress: it is monotonic only
            // within one daemon lifetime.
            let mut state = lock_sync(&self.inner.state);
            state.circuits.clear();
            state.current_bridge = None;
            state.bootstrap = None;
            state.bootstrapped = false;
            state.last_warning = None;
        }
        self.inner.settings.lock().await.clear();

        process.start().await?;
        self.broadcast(TorProviderEvent::ProcessRestarted);

        let conn = self
            .inner
            .resolved
            .lock()
            .await
            .clone()
            .ok_or_else(|| TorError::ConnectionFailed("provider not initialized".to_string()))?;
        self.establish(&conn).await
    }

    /// Close the connection and release the daemon.
    ///
    /// The daemon is never killed: when we took ownership, closing the
    /// control connection is what makes it exit.
    pub async fn shutdown(&self) {
        if let Some(process) = lock_sync(&self.inner.process).clone() {
            process.forget();
        }
        if let Some(controller) = self.inner.controller.lock().await.take() {
            controller.close().await;
        }
        self.inner.shutdown.cancel();
    }

    /// A clone of the live controller, for typed operations.
    pub async fn controller(&self) -> Result<TorController> {
        self.inner
            .controller
            .lock()
            .await
            .clone()
            .ok_or(TorError::ConnectionClosed)
    }

    /// Enable networking so bootstrap can proceed.
    pub async fn begin_bootstrap(&self) -> Result<()> {
        self.set_conf_cached(&[("DisableNetwork", ConfValue::Bool(false))])
            .await
    }

    /// Disable networking, cancelling an in-flight bootstrap.
    pub async fn cancel_bootstrap(&self) -> Result<()> {
        self.set_conf_cached(&[("DisableNetwork", ConfValue::Bool(true))])
            .await
    }

    /// Begin bootstrap and wait for completion, up to `limit`.
    ///
    /// On timeout the bootstrap is cancelled (networking disabled) before
    /// the timeout error is reported, never after.
    pub async fn bootstrap_with_timeout(&self, limit: Duration) -> Result<()> {
        if self.is_bootstrapped() {
            return Ok(());
        }
        let mut events = self.subscribe();
        self.begin_bootstrap().await?;

        let wait = async {
            loop {
                match events.recv().await {
                    Ok(TorProviderEvent::BootstrapStatus(status)) if status.is_done() => {
                        return Ok(());
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if self.is_bootstrapped() {
                            return Ok(());
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(TorError::ConnectionClosed);
                    }
                }
            }
        };

        match timeout(limit, wait).await {
            Ok(result) => result,
            Err(_) => {
                if let Err(e) = self.cancel_bootstrap().await {
                    warn!(error = %e, "failed to disable networking after bootstrap timeout");
                }
                Err(TorError::Timeout)
            }
        }
    }

    /// Request clean circuits.
    pub async fn newnym(&self) -> Result<()> {
        self.controller().await?.newnym().await
    }

    /// The most recent bootstrap report.
    pub fn bootstrap_status(&self) -> Option<BootstrapStatus> {
        lock_sync(&self.inner.state).bootstrap.clone()
    }

    /// Whether bootstrap has reached 100 in this daemon lifetime.
    pub fn is_bootstrapped(&self) -> bool {
        lock_sync(&self.inner.state).bootstrapped
    }

    /// The bridge in use as first hop, when one is.
    pub fn current_bridge(&self) -> Option<NodeData> {
        lock_sync(&self.inner.state).current_bridge.clone()
    }

    /// The relay path of a known circuit.
    pub fn circuit_path(&self, id: &CircuitId) -> Option<Vec<Fingerprint>> {
        lock_sync(&self.inner.state).circuits.get(id).cloned()
    }

    /// Resolve live node data for a relay: addresses from the consensus
    /// entry, bridge type from the configured bridge lines, region code
    /// from the GeoIP database.
    pub async fn get_node_info(&self, fingerprint: &Fingerprint) -> Result<NodeData> {
        let controller = self.controller().await?;
        resolve_node(&controller, fingerprint).await
    }

    /// Apply configuration, skipping values already written.
    pub async fn set_conf_cached(&self, settings: &[(&str, ConfValue)]) -> Result<()> {
        let controller = self.controller().await?;
        let mut cache = self.inner.settings.lock().await;
        controller.set_conf_cached(&mut cache, settings).await
    }

    async fn establish(&self, conn: &ControlConnection) -> Result<()> {
        let policy = RetryPolicy {
            initial: self.inner.config.initial_retry_delay,
            max: self.inner.config.max_retry_delay,
            overall: self.inner.config.connect_timeout,
        };
        let connected = retry_with_backoff(&policy, |attempt| {
            let conn = conn.clone();
            async move {
                trace!(attempt, address = %conn.address, "control connection attempt");
                let controller = TorController::open(&conn.address).await?;
                controller.authenticate(&conn.credential).await?;
                Ok(controller)
            }
        })
        .await;

        let controller = match connected {
            Ok(controller) => controller,
            Err(e) => {
                // Terminal could-not-connect state, surfaced once.
                let mut state = lock_sync(&self.inner.state);
                if !state.connect_failed {
                    state.connect_failed = true;
                    warn!(address = %conn.address, error = %e, "could not reach the control port");
                }
                return Err(e);
            }
        };
        lock_sync(&self.inner.state).connect_failed = false;

        self.wire_connection(&controller).await?;
        *self.inner.controller.lock().await = Some(controller);
        self.broadcast(TorProviderEvent::Ready);
        Ok(())
    }

    /// Post-authentication setup of one fresh connection: ownership,
    /// subscriptions, event loop, initial bootstrap poll.
    async fn wire_connection(&self, controller: &TorController) -> Result<()> {
        let owns = self.inner.config.owns_daemon();
        if owns && self.inner.config.take_ownership {
            controller.take_ownership().await?;
        }

        if let Ok(version) = controller.get_version().await {
            info!(version = %version, "connected to daemon");
        }

        let (tx, rx) = mpsc::unbounded_channel();

        let circ_tx = tx.clone();
        controller.watch_event(EventType::Circ, move |lines| {
            let Some(first) = lines.first() else { return };
            match parse_circuit_event(first) {
                Ok(ev) => {
                    let _ = circ_tx.send(ControlEvent::Circuit(ev));
                }
                Err(e) => warn!(error = %e, line = %first, "unparseable CIRC event"),
            }
        });

        let stream_tx = tx.clone();
        controller.watch_event(EventType::Stream, move |lines| {
            let Some(first) = lines.first() else { return };
            match parse_stream_event(first) {
                Ok(ev) => {
                    let _ = stream_tx.send(ControlEvent::Stream(ev));
                }
                Err(e) => warn!(error = %e, line = %first, "unparseable STREAM event"),
            }
        });

        // Status and log events only matter for a daemon we own; one we
        // merely monitor has its logs available elsewhere.
        let mut events = vec![EventType::Circ, EventType::Stream];
        if owns {
            let status_tx = tx.clone();
            controller.watch_event(EventType::StatusClient, move |lines| {
                if let Some(first) = lines.first() {
                    let _ = status_tx.send(ControlEvent::StatusClient(first.clone()));
                }
            });
            for (ty, severity) in [
                (EventType::Notice, StatusSeverity::Notice),
                (EventType::Warn, StatusSeverity::Warn),
                (EventType::Err, StatusSeverity::Err),
            ] {
                let log_tx = tx.clone();
                controller.watch_event(ty, move |lines| {
                    let _ = log_tx.send(ControlEvent::Log {
                        severity,
                        message: lines.join("\n"),
                    });
                });
            }
            events.extend([
                EventType::StatusClient,
                EventType::Notice,
                EventType::Warn,
                EventType::Err,
            ]);
        }
        drop(tx);
        controller.set_events(&events).await?;

        tokio::spawn(run_event_loop(
            Arc::clone(&self.inner),
            controller.clone(),
            rx,
        ));

        // Seed bootstrap state from a poll; polled reports never produce
        // bootstrap-error broadcasts.
        if let Ok(phase) = controller.get_info("status/bootstrap-phase").await {
            handle_status_line(&self.inner, &phase, false);
        }
        Ok(())
    }

    fn broadcast(&self, event: TorProviderEvent) {
        let _ = self.inner.events_tx.send(event);
    }
}

fn lock_sync<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn broadcast_event(inner: &ProviderInner, event: TorProviderEvent) {
    let _ = inner.events_tx.send(event);
}

async fn run_event_loop(
    inner: Arc<ProviderInner>,
    controller: TorController,
    mut rx: mpsc::UnboundedReceiver<ControlEvent>,
) {
    loop {
        let event = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            ev = rx.recv() => match ev {
                Some(ev) => ev,
                None => break,
            },
        };
        match event {
            ControlEvent::Circuit(ev) => handle_circuit(&inner, &controller, ev).await,
            ControlEvent::Stream(ev) => handle_stream(&inner, ev),
            ControlEvent::StatusClient(line) => handle_status_line(&inner, &line, true),
            ControlEvent::Log { severity, message } => handle_log(&inner, severity, message),
        }
    }
    debug!("provider event loop ended");
}

async fn handle_circuit(
    inner: &ProviderInner,
    controller: &TorController,
    ev: crate::events::CircuitEvent,
) {
    match ev.status {
        CircuitStatus::Built => {
            let first_hop = ev.path.first().cloned();
            let needs_check = {
                let mut state = lock_sync(&inner.state);
                state.circuits.insert(ev.id.clone(), ev.path.clone());
                // Single-hop circuits are recorded but never drive bridge
                // detection.
                ev.path.len() > 1
                    && state.current_bridge.as_ref().map(|b| &b.fingerprint)
                        != first_hop.as_ref()
            };
            if needs_check {
                if let Some(first_hop) = first_hop {
                    update_bridge(inner, controller, first_hop).await;
                }
            }
        }
        CircuitStatus::Closed => {
            lock_sync(&inner.state).circuits.remove(&ev.id);
        }
        _ => {}
    }
}

async fn update_bridge(inner: &ProviderInner, controller: &TorController, first_hop: Fingerprint) {
    let node = match resolve_node(controller, &first_hop).await {
        Ok(node) => node,
        Err(e) => {
            warn!(fingerprint = %first_hop, error = %e, "node lookup failed");
            NodeData {
                fingerprint: first_hop,
                ip_addrs: Vec::new(),
                bridge_type: None,
                region_code: None,
            }
        }
    };

    let new_bridge = if node.is_bridge() { Some(node) } else { None };
    let changed = {
        let mut state = lock_sync(&inner.state);
        if state.current_bridge != new_bridge {
            state.current_bridge = new_bridge.clone();
            true
        } else {
            false
        }
    };
    if changed {
        debug!(bridge = ?new_bridge.as_ref().map(|b| b.fingerprint.as_str()), "current bridge changed");
        broadcast_event(inner, TorProviderEvent::BridgeChanged(new_bridge));
    }
}

fn handle_stream(inner: &ProviderInner, ev: crate::events::StreamEvent) {
    if ev.status != StreamStatus::Succeeded {
        return;
    }
    let (Some(username), Some(password)) = (ev.socks_username, ev.socks_password) else {
        return;
    };
    let circuit = ev
        .circuit
        .and_then(|id| lock_sync(&inner.state).circuits.get(&id).cloned())
        .unwrap_or_default();
    broadcast_event(
        inner,
        TorProviderEvent::StreamSucceeded {
            username,
            password,
            circuit,
        },
    );
}

/// Fold one client-status line into bootstrap state. `from_async` is true
/// for notifications; polled reports never produce error broadcasts.
fn handle_status_line(inner: &ProviderInner, line: &str, from_async: bool) {
    let Some(status) = parse_bootstrap_status(line) else {
        trace!(line = %line, "client status without bootstrap marker");
        return;
    };

    broadcast_event(inner, TorProviderEvent::BootstrapStatus(status.clone()));

    let error = {
        let mut state = lock_sync(&inner.state);
        state.bootstrap = Some(status.clone());
        if status.is_done() && !state.bootstrapped {
            state.bootstrapped = true;
            info!("bootstrap complete");
        }

        let is_problem = from_async
            && matches!(status.severity, StatusSeverity::Warn | StatusSeverity::Err)
            && !status.is_ignorable();
        if is_problem {
            let key = (status.tag.clone(), status.reason.clone());
            if state.last_warning.as_ref() != Some(&key) {
                state.last_warning = Some(key);
                true
            } else {
                false
            }
        } else {
            false
        }
    };

    if error {
        broadcast_event(
            inner,
            TorProviderEvent::BootstrapError {
                tag: status.tag,
                reason: status.reason,
                warning: status.warning,
            },
        );
    }
}

fn handle_log(inner: &ProviderInner, severity: StatusSeverity, message: String) {
    match severity {
        StatusSeverity::Notice => {
            debug!(target: "tor_provider::daemon", "{}", message);
        }
        StatusSeverity::Warn | StatusSeverity::Err => {
            broadcast_event(inner, TorProviderEvent::LogLine { severity, message });
        }
    }
}

/// Resolve one relay's [`NodeData`].
async fn resolve_node(controller: &TorController, fingerprint: &Fingerprint) -> Result<NodeData> {
    let bridges = controller.get_bridges().await?;

    // Bridges are usually absent from the consensus; an unknown-entity
    // reply just means no addresses.
    let ip_addrs = match controller
        .get_info(&format!("ns/id/{}", fingerprint))
        .await
    {
        Ok(entry) => parse_ns_addresses(&entry),
        Err(TorError::Command { .. }) => Vec::new(),
        Err(e) => return Err(e),
    };

    let bridge_type = bridge_type_for(&bridges, fingerprint, &ip_addrs);

    let region_code = match ip_addrs.first() {
        Some(ip) => controller
            .get_info(&format!("ip-to-country/{}", ip))
            .await
            .ok()
            .filter(|c| c.len() == 2 && c != "??"),
        None => None,
    };

    Ok(NodeData {
        fingerprint: fingerprint.clone(),
        ip_addrs,
        bridge_type,
        region_code,
    })
}

/// Pull up to two addresses out of a consensus router-status entry.
fn parse_ns_addresses(entry: &str) -> Vec<String> {
    let mut addrs = Vec::new();
    for line in entry.lines() {
        if let Some(rest) = line.strip_prefix("r ") {
            for token in rest.split_whitespace() {
                if token.parse::<std::net::Ipv4Addr>().is_ok() {
                    addrs.push(token.to_string());
                    break;
                }
            }
        } else if let Some(rest) = line.strip_prefix("a ") {
            let addr = rest.split_whitespace().next().unwrap_or("");
            let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);
            let host = host.trim_matches(|c| c == '[' || c == ']');
            if !host.is_empty() {
                addrs.push(host.to_string());
            }
        }
        if addrs.len() >= 2 {
            break;
        }
    }
    addrs.truncate(2);
    addrs
}

/// Match a relay against the configured bridge lines, by fingerprint
/// first, then by address.
fn bridge_type_for(
    bridges: &[BridgeLine],
    fingerprint: &Fingerprint,
    addrs: &[String],
) -> Option<String> {
    for bridge in bridges {
        if bridge.fingerprint.as_ref() == Some(fingerprint) {
            return Some(bridge.transport.clone());
        }
        let host = bridge
            .addr
            .rsplit_once(':')
            .map(|(h, _)| h)
            .unwrap_or(&bridge.addr);
        let host = host.trim_matches(|c| c == '[' || c == ']');
        if addrs.iter().any(|a| a == host) {
            return Some(bridge.transport.clone());
        }
    }
    None
}

/// Exponential-backoff schedule for connection acquisition.
pub(crate) struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub overall: Duration,
}

/// Run `attempt_fn` until it succeeds, sleeping between attempts with a
/// doubling, capped delay, up to an overall deadline.
pub(crate) async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    mut attempt_fn: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let deadline = Instant::now() + policy.overall;
    let mut delay = policy.initial;
    let mut attempt = 0u32;
    loop {
        match attempt_fn(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if Instant::now() + delay >= deadline {
                    debug!(attempts = attempt, "connection retries exhausted");
                    return Err(TorError::Timeout);
                }
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying");
                sleep(delay).await;
                delay = (delay * 2).min(policy.max);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn provider() -> TorProvider {
        TorProvider::new(TorProviderConfig::new())
    }

    fn warn_line(tag: &str, reason: &str) -> String {
        format!(
            "WARN BOOTSTRAP PROGRESS=85 TAG={} WARNING=\"Connection refused\" REASON={} \
             RECOMMENDATION=warn",
            tag, reason
        )
    }

    #[tokio::test]
    async fn test_bootstrap_status_is_broadcast_and_recorded() {
        let provider = provider();
        let mut events = provider.subscribe();

        handle_status_line(
            &provider.inner,
            "NOTICE BOOTSTRAP PROGRESS=100 TAG=done SUMMARY=\"Done\"",
            true,
        );

        match events.try_recv().unwrap() {
            TorProviderEvent::BootstrapStatus(status) => {
                assert_eq!(status.progress, 100);
                assert_eq!(status.tag, "done");
            }
            other => panic!("expected BootstrapStatus, got {:?}", other),
        }
        assert!(provider.is_bootstrapped());
        assert_eq!(provider.bootstrap_status().unwrap().progress, 100);
    }

    #[tokio::test]
    async fn test_duplicate_warning_broadcast_once() {
        let provider = provider();
        let mut events = provider.subscribe();

        handle_status_line(&provider.inner, &warn_line("ap_conn", "NOROUTE"), true);
        handle_status_line(&provider.inner, &warn_line("ap_conn", "NOROUTE"), true);

        let mut errors = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, TorProviderEvent::BootstrapError { .. }) {
                errors += 1;
            }
        }
        assert_eq!(errors, 1, "identical WARN repeated must broadcast once");
    }

    #[tokio::test]
    async fn test_differing_warning_broadcasts_again() {
        let provider = provider();
        let mut events = provider.subscribe();

        handle_status_line(&provider.inner, &warn_line("ap_conn", "NOROUTE"), true);
        handle_status_line(&provider.inner, &warn_line("ap_conn", "TIMEOUT"), true);

        let mut errors = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, TorProviderEvent::BootstrapError { .. }) {
                errors += 1;
            }
        }
        assert_eq!(errors, 2, "a differing REASON must broadcast again");
    }

    #[tokio::test]
    async fn test_polled_status_never_produces_error_broadcast() {
        let provider = provider();
        let mut events = provider.subscribe();

        handle_status_line(&provider.inner, &warn_line("ap_conn", "NOROUTE"), false);

        while let Ok(event) = events.try_recv() {
            assert!(
                !matches!(event, TorProviderEvent::BootstrapError { .. }),
                "polled WARN must not broadcast an error"
            );
        }
    }

    #[tokio::test]
    async fn test_ignorable_warning_not_broadcast() {
        let provider = provider();
        let mut events = provider.subscribe();

        handle_status_line(
            &provider.inner,
            "WARN BOOTSTRAP PROGRESS=85 TAG=ap_conn REASON=NOROUTE RECOMMENDATION=ignore",
            true,
        );

        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, TorProviderEvent::BootstrapError { .. }));
        }
    }

    #[tokio::test]
    async fn test_stream_credentials_correlate_circuit() {
        let provider = provider();
        let mut events = provider.subscribe();

        let id: CircuitId = "12".parse().unwrap();
        let path = vec![
            "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"
                .parse::<Fingerprint>()
                .unwrap(),
            "BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB"
                .parse::<Fingerprint>()
                .unwrap(),
        ];
        lock_sync(&provider.inner.state)
            .circuits
            .insert(id, path.clone());

        handle_stream(
            &provider.inner,
            crate::events::parse_stream_event(
                "7 SUCCEEDED 12 example.com:443 SOCKS_USERNAME=\"iso\" SOCKS_PASSWORD=\"n1\"",
            )
            .unwrap(),
        );

        match events.try_recv().unwrap() {
            TorProviderEvent::StreamSucceeded {
                username,
                password,
                circuit,
            } => {
                assert_eq!(username, "iso");
                assert_eq!(password, "n1");
                assert_eq!(circuit, path);
            }
            other => panic!("expected StreamSucceeded, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_without_credentials_is_silent() {
        let provider = provider();
        let mut events = provider.subscribe();

        handle_stream(
            &provider.inner,
            crate::events::parse_stream_event("7 SUCCEEDED 12 example.com:443").unwrap(),
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_log_warn_broadcast_notice_not() {
        let provider = provider();
        let mut events = provider.subscribe();

        handle_log(
            &provider.inner,
            StatusSeverity::Notice,
            "routine notice".to_string(),
        );
        assert!(events.try_recv().is_err());

        handle_log(
            &provider.inner,
            StatusSeverity::Warn,
            "something odd".to_string(),
        );
        match events.try_recv().unwrap() {
            TorProviderEvent::LogLine { severity, message } => {
                assert_eq!(severity, StatusSeverity::Warn);
                assert_eq!(message, "something odd");
            }
            other => panic!("expected LogLine, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_ns_addresses() {
        let entry = "r Guard AAAA1234 2026-01-01 12:00:00 192.0.2.10 9001 0\n\
                     a [2001:db8::10]:9001\n\
                     s Fast Guard Running\n";
        assert_eq!(parse_ns_addresses(entry), vec!["192.0.2.10", "2001:db8::10"]);
    }

    #[test]
    fn test_parse_ns_addresses_caps_at_two() {
        let entry = "r X a b c 192.0.2.1 9001 0\na [::1]:1\na [::2]:2\n";
        assert_eq!(parse_ns_addresses(entry).len(), 2);
    }

    #[test]
    fn test_bridge_type_matches_fingerprint_then_addr() {
        let fp: Fingerprint = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".parse().unwrap();
        let other: Fingerprint = "BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB".parse().unwrap();
        let bridges = vec![crate::protocol::parse_bridge_line(&format!(
            "obfs4 192.0.2.1:443 {} cert=xyz",
            fp
        ))
        .unwrap()];

        assert_eq!(
            bridge_type_for(&bridges, &fp, &[]),
            Some("obfs4".to_string())
        );
        assert_eq!(
            bridge_type_for(&bridges, &other, &["192.0.2.1".to_string()]),
            Some("obfs4".to_string())
        );
        assert_eq!(bridge_type_for(&bridges, &other, &[]), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_on_fourth_attempt() {
        let policy = RetryPolicy {
            initial: Duration::from_millis(25),
            max: Duration::from_millis(500),
            overall: Duration::from_secs(300),
        };
        let attempts = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let counter = Arc::clone(&attempts);
        let succeeded_on = retry_with_backoff(&policy, move |attempt| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(TorError::ConnectionFailed("refused".to_string()))
                } else {
                    Ok(attempt + 1)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(succeeded_on, 4, "success on the fourth attempt");
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        // Delays follow the doubling schedule: 25 + 50 + 100 ms.
        assert_eq!(start.elapsed(), Duration::from_millis(175));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_delay_caps_at_max() {
        let policy = RetryPolicy {
            initial: Duration::from_millis(25),
            max: Duration::from_millis(100),
            overall: Duration::from_secs(300),
        };
        let start = Instant::now();
        let _ = retry_with_backoff(&policy, |attempt| async move {
            if attempt < 5 {
                Err::<(), _>(TorError::ConnectionFailed("refused".to_string()))
            } else {
                Ok(())
            }
        })
        .await
        .unwrap();
        // 25 + 50 + 100 + 100 + 100: doubling stops at the cap.
        assert_eq!(start.elapsed(), Duration::from_millis(375));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_times_out() {
        let policy = RetryPolicy {
            initial: Duration::from_millis(25),
            max: Duration::from_millis(500),
            overall: Duration::from_millis(60),
        };
        let result: Result<()> = retry_with_backoff(&policy, |_| async {
            Err(TorError::ConnectionFailed("refused".to_string()))
        })
        .await;
        assert!(matches!(result, Err(TorError::Timeout)));
    }

    /// A controller whose peer is already gone: commands fail fast, which
    /// exercises the node-lookup fallback path.
    async fn dead_controller() -> TorController {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (transport, peer) = tokio::join!(
            crate::transport::Transport::connect_tcp("127.0.0.1", addr.port()),
            async { listener.accept().await.unwrap().0 },
        );
        drop(peer);
        TorController::from_socket(crate::socket::ControlSocket::open(transport.unwrap()))
    }

    #[tokio::test]
    async fn test_circuit_built_then_closed_empties_map() {
        let provider = provider();
        let controller = dead_controller().await;
        let id: CircuitId = "12".parse().unwrap();

        let built = crate::events::parse_circuit_event(
            "12 BUILT $AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA,\
             $BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB",
        )
        .unwrap();
        handle_circuit(&provider.inner, &controller, built).await;
        assert_eq!(
            provider.circuit_path(&id).map(|p| p.len()),
            Some(2),
            "BUILT must record the full path"
        );

        let closed = crate::events::parse_circuit_event("12 CLOSED REASON=FINISHED").unwrap();
        handle_circuit(&provider.inner, &controller, closed).await;
        assert!(provider.circuit_path(&id).is_none());
    }

    #[tokio::test]
    async fn test_single_hop_circuit_recorded_but_no_bridge_lookup() {
        let provider = provider();
        let controller = dead_controller().await;
        let mut events = provider.subscribe();

        let built = crate::events::parse_circuit_event(
            "3 BUILT $AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA",
        )
        .unwrap();
        handle_circuit(&provider.inner, &controller, built).await;

        let id: CircuitId = "3".parse().unwrap();
        assert_eq!(provider.circuit_path(&id).map(|p| p.len()), Some(1));
        assert!(provider.current_bridge().is_none());
        assert!(events.try_recv().is_err(), "no bridge broadcast for 1 hop");
    }
}
