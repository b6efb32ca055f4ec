//! Launching and supervising the daemon process.
//!
//! [`TorProcess`] owns the subprocess exclusively. Lifecycle control is
//! one-directional: the supervisor never kills the daemon, since closing
//! the owning control connection is what makes it exit. The one thing
//! flowing back is the unexpected-exit notification, delivered through the
//! `on_exit` callback from an independent watcher task.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::{require_file, ControlAddress, TorProviderConfig};
use crate::error::{Result, TorError};

/// Lifecycle states of the supervised daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorProcessStatus {
    /// Never launched.
    NotStarted,
    /// Launch in progress.
    Starting,
    /// The subprocess is alive.
    Running,
    /// The subprocess exited.
    Exited,
}

/// Callback invoked on unexpected exit, with the exit code when the
/// platform reports one. Runs on the watcher task.
pub type ExitCallback = Box<dyn Fn(Option<i32>) + Send + Sync>;

struct Inner {
    executable: PathBuf,
    torrc: Option<PathBuf>,
    defaults_torrc: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    onion_auth_dir: Option<PathBuf>,
    geoip_file: Option<PathBuf>,
    geoip6_file: Option<PathBuf>,
    control_address: ControlAddress,
    socks_address: Option<ControlAddress>,
    hashed_password: Option<String>,
    disable_network: bool,
    status: std::sync::Mutex<TorProcessStatus>,
    forgotten: AtomicBool,
    repaired: AtomicBool,
    on_exit: ExitCallback,
}

/// Supervisor for one daemon subprocess.
#[derive(Clone)]
pub struct TorProcess {
    inner: Arc<Inner>,
}

impl TorProcess {
    /// Build a supervisor from provider configuration plus the resolved
    /// listener addresses and hashed control password.
    pub fn new(
        config: &TorProviderConfig,
        control_address: ControlAddress,
        hashed_password: Option<String>,
        on_exit: ExitCallback,
    ) -> Result<Self> {
        let executable = config
            .executable
            .clone()
            .ok_or_else(|| TorError::Process("no daemon executable configured".to_string()))?;
        Ok(TorProcess {
            inner: Arc::new(Inner {
                executable,
                torrc: config.torrc.clone(),
                defaults_torrc: config.defaults_torrc.clone(),
                data_dir: config.data_dir.clone(),
                onion_auth_dir: config.onion_auth_dir.clone(),
                geoip_file: config.geoip_file.clone(),
                geoip6_file: config.geoip6_file.clone(),
                control_address,
                socks_address: config.socks_address.clone(),
                hashed_password,
                disable_network: config.start_disabled,
                status: std::sync::Mutex::new(TorProcessStatus::NotStarted),
                forgotten: AtomicBool::new(false),
                repaired: AtomicBool::new(false),
                on_exit,
            }),
        })
    }

    /// Current lifecycle state.
    pub fn status(&self) -> TorProcessStatus {
        *lock_status(&self.inner.status)
    }

    /// Mark the next exit as expected, suppressing the `on_exit` callback.
    pub fn forget(&self) {
        self.inner.forgotten.store(true, Ordering::SeqCst);
    }

    /// Launch the daemon. A no-op while Starting or Running.
    ///
    /// Missing executable or configuration files are fatal and surfaced
    /// immediately, with no retry.
    pub async fn start(&self) -> Result<()> {
        {
            let mut status = lock_status(&self.inner.status);
            if matches!(
                *status,
                TorProcessStatus::Starting | TorProcessStatus::Running
            ) {
                return Ok(());
            }
            *status = TorProcessStatus::Starting;
        }

        if let Err(e) = self.launch().await {
            *lock_status(&self.inner.status) = TorProcessStatus::Exited;
            return Err(e);
        }
        Ok(())
    }

    async fn launch(&self) -> Result<()> {
        let inner = &self.inner;
        require_file("daemon executable", &inner.executable)?;
        if let Some(ref defaults) = inner.defaults_torrc {
            require_file("defaults configuration file", defaults)?;
        }
        if let Some(ref torrc) = inner.torrc {
            require_file("configuration file", torrc)?;
            // One-time repair before the first launch of this supervisor.
            if !inner.repaired.swap(true, Ordering::SeqCst) {
                self.repair_torrc(torrc)?;
            }
        }

        let args = self.build_args();
        info!(executable = %inner.executable.display(), "launching daemon");
        debug!(?args, "daemon arguments");

        let mut command = Command::new(&inner.executable);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(ref dir) = inner.data_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| TorError::Process(format!("failed to launch daemon: {}", e)))?;

        // Drain both output streams continuously so the daemon can never
        // block on a full pipe.
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(drain_output(stdout, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_output(stderr, "stderr"));
        }

        *lock_status(&inner.status) = TorProcessStatus::Running;
        self.inner.forgotten.store(false, Ordering::SeqCst);

        let watcher = Arc::clone(inner);
        tokio::spawn(async move {
            let exit = child.wait().await;
            let exit_code = match exit {
                Ok(status) => status.code(),
                Err(ref e) => {
                    warn!(error = %e, "failed to wait for daemon");
                    None
                }
            };
            *lock_status(&watcher.status) = TorProcessStatus::Exited;
            if watcher.forgotten.load(Ordering::SeqCst) {
                debug!(?exit_code, "daemon exited (expected)");
            } else {
                warn!(?exit_code, "daemon exited unexpectedly");
                (watcher.on_exit)(exit_code);
            }
        });

        Ok(())
    }

    /// Build the launch arguments, deterministically.
    pub fn build_args(&self) -> Vec<String> {
        let inner = &self.inner;
        let mut args: Vec<String> = Vec::new();
        let mut push_opt = |key: &str, value: String| {
            args.push(key.to_string());
            args.push(value);
        };

        if let Some(ref defaults) = inner.defaults_torrc {
            push_opt("--defaults-torrc", defaults.display().to_string());
        }
        if let Some(ref torrc) = inner.torrc {
            push_opt("-f", torrc.display().to_string());
        }
        if let Some(ref dir) = inner.data_dir {
            push_opt("DataDirectory", dir.display().to_string());
        }
        if let Some(ref dir) = inner.onion_auth_dir {
            push_opt("ClientOnionAuthDir", dir.display().to_string());
        }
        if let Some(ref path) = inner.geoip_file {
            push_opt("GeoIPFile", path.display().to_string());
        }
        if let Some(ref path) = inner.geoip6_file {
            push_opt("GeoIPv6File", path.display().to_string());
        }
        if let Some(ref hashed) = inner.hashed_password {
            push_opt("HashedControlPassword", hashed.clone());
        }
        // The +__ prefix augments rather than replaces user configuration,
        // and the daemon never writes __-prefixed options back on SAVECONF.
        push_opt("+__ControlPort", inner.control_address.option_value());
        if let Some(ref socks) = inner.socks_address {
            push_opt("+__SocksPort", socks.option_value());
        }
        push_opt("__OwningControllerProcess", std::process::id().to_string());
        if inner.disable_network {
            push_opt("DisableNetwork", "1".to_string());
        }
        args
    }

    fn repair_torrc(&self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TorError::Process(format!("failed to read {}: {}", path.display(), e))
        })?;
        if let Some(repaired) = repair_torrc_content(
            &content,
            &self.inner.control_address,
            self.inner.socks_address.as_ref(),
        ) {
            info!(file = %path.display(), "removing conflicting port options");
            std::fs::write(path, repaired).map_err(|e| {
                TorError::Process(format!("failed to rewrite {}: {}", path.display(), e))
            })?;
        }
        Ok(())
    }
}

fn lock_status(
    status: &std::sync::Mutex<TorProcessStatus>,
) -> std::sync::MutexGuard<'_, TorProcessStatus> {
    match status.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn drain_output<R>(stream: R, which: &'static str)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "tor_provider::daemon", source = which, "{}", line);
    }
}

/// Split configuration-file content into logical lines.
///
/// A trailing backslash continues the line; a comment line inside a
/// continuation does not terminate it (the daemon's own continuation
/// semantics).
pub(crate) fn logical_lines(content: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut continuing = false;

    for raw in content.lines() {
        if continuing && raw.trim_start().starts_with('#') {
            continue;
        }
        let trimmed_end = raw.trim_end();
        if let Some(stripped) = trimmed_end.strip_suffix('\\') {
            current.push_str(stripped);
            continuing = true;
        } else {
            current.push_str(raw);
            lines.push(std::mem::take(&mut current));
            continuing = false;
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

/// Remove port options that would conflict with the listeners this
/// supervisor injects on the command line.
///
/// Returns the rewritten content only when at least one line was removed;
/// an untouched file is never rewritten.
pub(crate) fn repair_torrc_content(
    content: &str,
    control: &ControlAddress,
    socks: Option<&ControlAddress>,
) -> Option<String> {
    let lines = logical_lines(content);
    let mut kept = Vec::with_capacity(lines.len());
    let mut removed = 0usize;

    for line in lines {
        let mut tokens = line.split_whitespace();
        let key = tokens.next().unwrap_or("").to_ascii_lowercase();
        let value = tokens.collect::<Vec<_>>().join(" ");

        let conflicts = match key.as_str() {
            "controlport" => value_conflicts(&value, control),
            // ControlSocket is the unix flavor of the control listener.
            "controlsocket" => control.is_unix(),
            "socksport" => socks.map(|s| value_conflicts(&value, s)).unwrap_or(false),
            _ => false,
        };

        if conflicts {
            debug!(line = %line, "dropping conflicting torrc line");
            removed += 1;
        } else {
            kept.push(line);
        }
    }

    if removed == 0 {
        return None;
    }
    let mut out = kept.join("\n");
    if content.ends_with('\n') && !out.is_empty() {
        out.push('\n');
    }
    Some(out)
}

/// Whether a configured port-option value collides with the injected
/// listener: same socket type for Unix sockets, same TCP port for TCP.
fn value_conflicts(value: &str, injected: &ControlAddress) -> bool {
    let first = value.split_whitespace().next().unwrap_or("");
    match injected {
        ControlAddress::Unix(_) => first.starts_with("unix:"),
        ControlAddress::Tcp { port, .. } => {
            if first.starts_with("unix:") {
                return false;
            }
            let port_part = first.rsplit(':').next().unwrap_or(first);
            port_part.parse::<u16>() == Ok(*port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TorProviderConfig;

    fn supervisor(config: &TorProviderConfig, control: ControlAddress) -> TorProcess {
        TorProcess::new(config, control, None, Box::new(|_| {})).unwrap()
    }

    #[test]
    fn test_build_args_order() {
        let config = TorProviderConfig::new()
            .executable("/usr/bin/tor")
            .defaults_torrc("/etc/tor/defaults")
            .torrc("/etc/tor/torrc")
            .data_dir("/var/lib/tor")
            .onion_auth_dir("/var/lib/tor/onion_auth")
            .geoip_files("/usr/share/tor/geoip", "/usr/share/tor/geoip6")
            .socks_address(ControlAddress::tcp("127.0.0.1", 9150))
            .start_disabled(true);
        let process = TorProcess::new(
            &config,
            ControlAddress::tcp("127.0.0.1", 9151),
            Some("16:ABCD".to_string()),
            Box::new(|_| {}),
        )
        .unwrap();

        let args = process.build_args();
        let expected_prefix = vec![
            "--defaults-torrc".to_string(),
            "/etc/tor/defaults".to_string(),
            "-f".to_string(),
            "/etc/tor/torrc".to_string(),
            "DataDirectory".to_string(),
            "/var/lib/tor".to_string(),
            "ClientOnionAuthDir".to_string(),
            "/var/lib/tor/onion_auth".to_string(),
            "GeoIPFile".to_string(),
            "/usr/share/tor/geoip".to_string(),
            "GeoIPv6File".to_string(),
            "/usr/share/tor/geoip6".to_string(),
            "HashedControlPassword".to_string(),
            "16:ABCD".to_string(),
            "+__ControlPort".to_string(),
            "127.0.0.1:9151".to_string(),
            "+__SocksPort".to_string(),
            "127.0.0.1:9150".to_string(),
            "__OwningControllerProcess".to_string(),
        ];
        assert_eq!(&args[..expected_prefix.len()], &expected_prefix[..]);
        assert_eq!(args[expected_prefix.len()], std::process::id().to_string());
        assert_eq!(
            &args[expected_prefix.len() + 1..],
            &["DisableNetwork".to_string(), "1".to_string()]
        );
    }

    #[test]
    fn test_logical_lines_joins_continuations() {
        let content = "Bridge obfs4 \\\n  192.0.2.1:443\nSocksPort 9050\n";
        assert_eq!(
            logical_lines(content),
            vec!["Bridge obfs4   192.0.2.1:443", "SocksPort 9050"]
        );
    }

    #[test]
    fn test_logical_lines_comment_inside_continuation() {
        let content = "Bridge obfs4 \\\n# a comment that does not end the line\n  192.0.2.1:443\n";
        assert_eq!(logical_lines(content), vec!["Bridge obfs4   192.0.2.1:443"]);
    }

    #[test]
    fn test_logical_lines_trailing_continuation() {
        assert_eq!(logical_lines("Key value \\"), vec!["Key value "]);
    }

    #[test]
    fn test_repair_removes_same_tcp_port() {
        let content = "SocksPort 9050\nControlPort 9151\nLog notice stdout\n";
        let control = ControlAddress::tcp("127.0.0.1", 9151);
        let repaired = repair_torrc_content(content, &control, None).unwrap();
        assert_eq!(repaired, "SocksPort 9050\nLog notice stdout\n");
    }

    #[test]
    fn test_repair_keeps_different_tcp_port() {
        let content = "ControlPort 9051\n";
        let control = ControlAddress::tcp("127.0.0.1", 9151);
        assert!(repair_torrc_content(content, &control, None).is_none());
    }

    #[test]
    fn test_repair_removes_unix_flavor() {
        let content = "ControlPort unix:/run/tor/control\nControlSocket /run/tor/control\n\
                       ControlPort 9051\n";
        let control = ControlAddress::unix("/var/lib/tor/control.socket");
        let repaired = repair_torrc_content(content, &control, None).unwrap();
        assert_eq!(repaired, "ControlPort 9051\n");
    }

    #[test]
    fn test_repair_socks_conflict() {
        let content = "SocksPort 127.0.0.1:9150\n";
        let control = ControlAddress::tcp("127.0.0.1", 9151);
        let socks = ControlAddress::tcp("127.0.0.1", 9150);
        let repaired = repair_torrc_content(content, &control, Some(&socks)).unwrap();
        assert_eq!(repaired, "");
    }

    #[test]
    fn test_repair_untouched_returns_none() {
        let content = "Log notice stdout\nUseBridges 1\n";
        let control = ControlAddress::tcp("127.0.0.1", 9151);
        assert!(repair_torrc_content(content, &control, None).is_none());
    }

    #[test]
    fn test_new_requires_executable() {
        let config = TorProviderConfig::new();
        let result = TorProcess::new(
            &config,
            ControlAddress::tcp("127.0.0.1", 9151),
            None,
            Box::new(|_| {}),
        );
        assert!(matches!(result, Err(TorError::Process(_))));
    }

    #[tokio::test]
    async fn test_start_missing_executable_is_fatal() {
        let config = TorProviderConfig::new().executable("/nonexistent/daemon/binary");
        let process = supervisor(&config, ControlAddress::tcp("127.0.0.1", 9151));
        let result = process.start().await;
        assert!(matches!(result, Err(TorError::Process(_))));
        assert_eq!(process.status(), TorProcessStatus::Exited);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unexpected_exit_fires_callback() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-daemon");
        std::fs::write(&script, "#!/bin/sh\nexit 3\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let config = TorProviderConfig::new().executable(&script);
        let process = TorProcess::new(
            &config,
            ControlAddress::tcp("127.0.0.1", 9151),
            None,
            Box::new(move |code| {
                let _ = tx.send(code);
            }),
        )
        .unwrap();

        process.start().await.unwrap();
        let code = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("exit callback not invoked")
            .unwrap();
        assert_eq!(code, Some(3));
        assert_eq!(process.status(), TorProcessStatus::Exited);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_forget_suppresses_callback() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-daemon");
        std::fs::write(&script, "#!/bin/sh\nsleep 0.2\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Option<i32>>();
        let config = TorProviderConfig::new().executable(&script);
        let process = TorProcess::new(
            &config,
            ControlAddress::tcp("127.0.0.1", 9151),
            None,
            Box::new(move |code| {
                let _ = tx.send(code);
            }),
        )
        .unwrap();

        process.start().await.unwrap();
        assert_eq!(process.status(), TorProcessStatus::Running);
        process.forget();

        tokio::time::sleep(std::time::Duration::from_millis(600)).await;
        assert_eq!(process.status(), TorProcessStatus::Exited);
        assert!(rx.try_recv().is_err(), "callback fired despite forget()");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_is_noop_while_running() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-daemon");
        std::fs::write(&script, "#!/bin/sh\nsleep 0.3\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = TorProviderConfig::new().executable(&script);
        let process = supervisor(&config, ControlAddress::tcp("127.0.0.1", 9151));
        process.forget();
        process.start().await.unwrap();
        // Second start while running must not launch a second daemon.
        process.start().await.unwrap();
        assert_eq!(process.status(), TorProcessStatus::Running);
    }
}
