//! Proxy daemon lifecycle: discovery, foreground serving, daemonization,
//! and stop
//!
//! A daemon owns its state directory's pid/port/TLS-marker files for its
//! lifetime and rebuilds its in-memory route cache whenever the shared
//! route file changes. Registrant processes find a running daemon by
//! reading the port file and probing the port for the `X-Portless`
//! identity header, which distinguishes our proxy from any coincidental
//! server.

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::Request;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use notify::{RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::certs::{self, CertManager, SniResolver};
use crate::config::Settings;
use crate::error::X_PORTLESS;
use crate::listener::ProxyListener;
use crate::proxy::{ProxyEngine, SharedRoutes};
use crate::routes::{pid_alive, RouteStore};
use crate::state::{restore_invoker_ownership, StateDir};

/// Debounce window after a route-file change notification.
const WATCH_DEBOUNCE: Duration = Duration::from_millis(100);
/// Poll interval when filesystem notifications are unavailable.
const WATCH_POLL_INTERVAL: Duration = Duration::from_secs(3);
/// Readiness probe schedule for freshly started daemons.
const READY_ATTEMPTS: u32 = 50;
const READY_DELAY: Duration = Duration::from_millis(100);
/// In-flight connections get this long after the shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// How a daemon should terminate TLS, resolved from CLI flags.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    pub enabled: bool,
    /// User-supplied PEM pair; when unset the managed cert tree is used.
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

/// A running daemon found on this machine.
#[derive(Debug, Clone)]
pub struct ProxyLocation {
    pub port: u16,
    pub tls: bool,
    pub state: StateDir,
}

/// Find a running daemon. An explicit state-dir override is trusted as-is;
/// otherwise the per-user root is probed before the system root, and a
/// candidate only counts if something on its recorded port answers with
/// the portless identity header.
pub async fn discover(settings: &Settings) -> Option<ProxyLocation> {
    if let Some(ref dir) = settings.state_dir {
        let state = StateDir::locate(settings.proxy_port, Some(dir));
        let port = read_port_file(&state)?;
        return Some(ProxyLocation {
            port,
            tls: state.tls_marker_path().exists(),
            state,
        });
    }

    let user = StateDir::locate(crate::config::DEFAULT_PROXY_PORT, None);
    let system = StateDir::locate(80, None);
    for state in [user, system] {
        let Some(port) = read_port_file(&state) else {
            continue;
        };
        if probe_ready(port).await {
            return Some(ProxyLocation {
                port,
                tls: state.tls_marker_path().exists(),
                state,
            });
        }
        debug!(port, state = %state.root().display(), "stale port file, nothing portless on the port");
    }
    None
}

fn read_port_file(state: &StateDir) -> Option<u16> {
    let raw = fs::read_to_string(state.port_path()).ok()?;
    raw.trim().parse().ok()
}

/// HEAD the proxy port and check for `X-Portless: 1`.
pub async fn probe_ready(port: u16) -> bool {
    let client: Client<HttpConnector, Empty<Bytes>> =
        Client::builder(TokioExecutor::new()).build(HttpConnector::new());
    let req = Request::head(format!("http://127.0.0.1:{port}/"))
        .body(Empty::new())
        .expect("valid probe request");

    match tokio::time::timeout(Duration::from_secs(1), client.request(req)).await {
        Ok(Ok(response)) => response.headers().get(X_PORTLESS).is_some(),
        _ => false,
    }
}

/// Poll the proxy port until it answers as portless or attempts run out.
pub async fn wait_ready(port: u16) -> bool {
    for _ in 0..READY_ATTEMPTS {
        if probe_ready(port).await {
            return true;
        }
        sleep(READY_DELAY).await;
    }
    false
}

/// Run the proxy in the foreground: bind, own the state files, watch the
/// route table, serve until SIGINT/SIGTERM.
pub async fn run_foreground(settings: &Settings, tls: TlsOptions) -> anyhow::Result<()> {
    let state = StateDir::locate(settings.proxy_port, settings.state_dir.as_deref());
    state.ensure()?;
    let store = RouteStore::new(state.clone());

    let tls_config = if tls.enabled {
        Some(match (&tls.cert, &tls.key) {
            (Some(cert), Some(key)) => certs::server_tls_config_from_files(cert, key)?,
            _ => {
                let manager = Arc::new(CertManager::new(&state));
                manager.ensure_materialized()?;
                let resolver = Arc::new(SniResolver::new(Arc::clone(&manager))?);
                certs::server_tls_config(resolver)
            }
        })
    } else {
        None
    };

    let routes: SharedRoutes = Arc::new(parking_lot::RwLock::new(store.load_and_gc()));
    let engine = ProxyEngine::new(Arc::clone(&routes), settings.proxy_port, tls.enabled);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let addr: SocketAddr = ([127, 0, 0, 1], settings.proxy_port).into();
    let listener = ProxyListener::bind(addr, engine, tls_config, shutdown_rx.clone()).await?;
    let bound_port = listener.local_addr()?.port();

    clear_stale_artifacts(&state);
    write_state_file(&state, &state.pid_path(), &std::process::id().to_string())?;
    write_state_file(&state, &state.port_path(), &bound_port.to_string())?;
    if tls.enabled {
        write_state_file(&state, &state.tls_marker_path(), "")?;
    }

    let watcher_handle = tokio::spawn(watch_routes(
        store.clone(),
        Arc::clone(&routes),
        shutdown_rx.clone(),
    ));
    let listener_handle = tokio::spawn(listener.run());

    info!(
        port = bound_port,
        tls = tls.enabled,
        state = %state.root().display(),
        "portless proxy started"
    );

    wait_for_signal().await;
    info!("shutdown signal received");

    let _ = shutdown_tx.send(true);
    remove_state_files(&state, tls.enabled);

    let _ = tokio::time::timeout(SHUTDOWN_GRACE, async {
        let _ = watcher_handle.await;
        let _ = listener_handle.await;
    })
    .await;

    info!("shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Keep the shared route cache in sync with the route file. Prefers
/// filesystem notifications on the state directory (the table is replaced
/// by rename, so the file itself is a moving target) with a short
/// debounce; drops to a polling timer when the watcher cannot start.
async fn watch_routes(store: RouteStore, routes: SharedRoutes, mut shutdown_rx: watch::Receiver<bool>) {
    let reload = |reason: &str| {
        let fresh = store.load_and_gc();
        debug!(count = fresh.len(), reason, "route table reloaded");
        *routes.write() = fresh;
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<()>();
    let watch_dir = store.state_dir().root().to_path_buf();
    let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if res.is_ok() {
            let _ = tx.send(());
        }
    })
    .and_then(|mut w| {
        w.watch(&watch_dir, RecursiveMode::NonRecursive)?;
        Ok(w)
    });

    match watcher {
        Ok(watcher) => {
            debug!(path = %store.state_dir().root().display(), "route watcher started");
            loop {
                tokio::select! {
                    event = rx.recv() => {
                        if event.is_none() {
                            break;
                        }
                        sleep(WATCH_DEBOUNCE).await;
                        while rx.try_recv().is_ok() {}
                        reload("fs event");
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            drop(watcher);
        }
        Err(e) => {
            warn!(error = %e, "fs notifications unavailable, polling route table");
            loop {
                tokio::select! {
                    _ = sleep(WATCH_POLL_INTERVAL) => reload("poll"),
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        }
    }
}

fn write_state_file(state: &StateDir, path: &std::path::Path, contents: &str) -> anyhow::Result<()> {
    fs::write(path, contents).with_context(|| format!("failed to write {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(state.file_mode()))?;
    }
    restore_invoker_ownership(path)?;
    Ok(())
}

/// A previous daemon that died without cleanup leaves pid/port files
/// behind; binding succeeded, so whatever they name is gone.
fn clear_stale_artifacts(state: &StateDir) {
    for path in [state.pid_path(), state.port_path(), state.tls_marker_path()] {
        if path.exists() {
            debug!(path = %path.display(), "removing stale daemon artifact");
            let _ = fs::remove_file(path);
        }
    }
}

fn remove_state_files(state: &StateDir, tls: bool) {
    let _ = fs::remove_file(state.pid_path());
    let _ = fs::remove_file(state.port_path());
    if tls {
        let _ = fs::remove_file(state.tls_marker_path());
    }
}

/// Start the daemon detached: re-exec this binary in foreground mode with
/// stdio redirected to the log file, then wait for the port to answer as
/// portless.
pub async fn start_detached(settings: &Settings, tls: &TlsOptions) -> anyhow::Result<()> {
    let state = StateDir::locate(settings.proxy_port, settings.state_dir.as_deref());
    state.ensure()?;

    let exe = std::env::current_exe().context("failed to resolve current executable")?;
    let log = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(state.log_path())
        .with_context(|| format!("failed to open log file {}", state.log_path().display()))?;

    let mut cmd = std::process::Command::new(exe);
    cmd.arg("proxy")
        .arg("start")
        .arg("--foreground")
        .arg("-p")
        .arg(settings.proxy_port.to_string());
    if tls.enabled {
        cmd.arg("--https");
        if let (Some(cert), Some(key)) = (&tls.cert, &tls.key) {
            cmd.arg("--cert").arg(cert).arg("--key").arg(key);
        }
    }
    if let Some(ref dir) = settings.state_dir {
        cmd.env("STATE_DIR_OVERRIDE", dir);
    }
    cmd.stdin(Stdio::null())
        .stdout(log.try_clone().context("failed to clone log handle")?)
        .stderr(log);

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Detach from the controlling terminal so the daemon survives it.
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
    }

    let child = cmd.spawn().context("failed to spawn proxy daemon")?;
    debug!(pid = child.id(), port = settings.proxy_port, "daemon spawned, waiting for readiness");

    if !wait_ready(settings.proxy_port).await {
        bail!(
            "proxy did not become ready on port {}; check the log at {}",
            settings.proxy_port,
            state.log_path().display()
        );
    }

    info!(port = settings.proxy_port, "proxy daemon ready");
    Ok(())
}

/// Stop a running daemon, cleaning up stale artifacts when the recorded
/// pid turns out to be dead.
pub async fn stop(settings: &Settings) -> anyhow::Result<()> {
    let state = match discover(settings).await {
        Some(location) => location.state,
        None => StateDir::locate(settings.proxy_port, settings.state_dir.as_deref()),
    };

    let pid = fs::read_to_string(state.pid_path())
        .ok()
        .and_then(|raw| raw.trim().parse::<i32>().ok());

    match pid {
        Some(pid) => {
            let port = read_port_file(&state).unwrap_or(settings.proxy_port);
            if pid_alive(pid) && probe_ready(port).await {
                #[cfg(unix)]
                unsafe {
                    libc::kill(pid, libc::SIGTERM);
                }
                info!(pid, port, "sent SIGTERM to proxy daemon");
            } else {
                warn!(pid, "pid file is stale, removing daemon artifacts");
                remove_state_files(&state, true);
            }
            Ok(())
        }
        None => {
            let port = settings.proxy_port;
            if !port_in_use(port).await {
                info!(port, "no proxy daemon running");
                return Ok(());
            }
            // Something owns the port but we have no pid file; fall back to
            // asking the OS who the listener is.
            match find_listener_pid(port) {
                Some(pid) => {
                    #[cfg(unix)]
                    unsafe {
                        libc::kill(pid, libc::SIGTERM);
                    }
                    info!(pid, port, "terminated unmanaged listener");
                    Ok(())
                }
                None => bail!(
                    "port {port} is in use but its owner could not be determined; \
                     try `sudo lsof -ti tcp:{port}`"
                ),
            }
        }
    }
}

async fn port_in_use(port: u16) -> bool {
    tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .is_ok()
}

fn find_listener_pid(port: u16) -> Option<i32> {
    let output = std::process::Command::new("lsof")
        .args(["-ti", &format!("tcp:{port}")])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()?
        .trim()
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_probe_rejects_non_portless_server() {
        // A plain TCP listener that answers without the identity header.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                use tokio::io::AsyncWriteExt;
                let _ = stream
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                    .await;
            }
        });

        assert!(!probe_ready(port).await);
    }

    #[tokio::test]
    async fn test_probe_fails_on_closed_port() {
        // Bind then drop to get a port that is almost certainly closed.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(!probe_ready(port).await);
    }

    #[tokio::test]
    async fn test_discover_with_override_reads_port_file() {
        let tmp = tempfile::tempdir().unwrap();
        let state = StateDir::locate(1355, Some(tmp.path()));
        state.ensure().unwrap();
        fs::write(state.port_path(), "4242").unwrap();
        fs::write(state.tls_marker_path(), "").unwrap();

        let settings = Settings {
            state_dir: Some(tmp.path().to_path_buf()),
            ..Settings::default()
        };
        let location = discover(&settings).await.unwrap();
        assert_eq!(location.port, 4242);
        assert!(location.tls);
    }

    #[tokio::test]
    async fn test_discover_override_without_port_file() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = Settings {
            state_dir: Some(tmp.path().to_path_buf()),
            ..Settings::default()
        };
        assert!(discover(&settings).await.is_none());
    }
}
