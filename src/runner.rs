//! App runner: register a hostname, spawn the dev command, clean up
//!
//! `portless myapp npm run dev` allocates a free backend port, registers
//! `myapp.localhost -> 127.0.0.1:<port>` in the shared route table, and
//! runs the command with `PORT` exported, under a shell so version-manager
//! shims and scripts resolve. The route lives exactly as long as the child
//! process.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{bail, Context};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::{Settings, BACKEND_PORT_RANGE};
use crate::daemon::{self, TlsOptions};
use crate::hostname::{display_url, normalize};
use crate::routes::RouteStore;

/// Run a named app. Returns the exit code the CLI should terminate with.
pub async fn run_app(
    settings: &Settings,
    name: &str,
    command: &[String],
    force: bool,
) -> anyhow::Result<i32> {
    if command.is_empty() {
        bail!("no command given; usage: portless <name> <cmd> [args...]");
    }

    if settings.bypass {
        return exec_directly(command);
    }

    let host = normalize(name)?;

    let location = ensure_daemon(settings).await?;
    let store = RouteStore::new(location.state.clone());

    let backend_port = allocate_backend_port()
        .context("no free backend port in the configured range")?;

    let pid = std::process::id() as i32;
    store.add(&host, backend_port, pid, force)?;

    println!("{}", display_url(&host, location.port, location.tls));

    let terminal = TerminalState::capture();
    let result = spawn_and_wait(command, backend_port).await;

    // Best-effort deregistration: a lock timeout here must not eat the
    // child's exit status.
    if let Err(e) = store.remove(&host) {
        warn!(%host, error = %e, "failed to deregister route during cleanup");
    }
    terminal.restore();

    result
}

/// Make sure a daemon is reachable, starting one if needed. Privileged
/// ports require sudo and therefore an interactive confirmation.
async fn ensure_daemon(settings: &Settings) -> anyhow::Result<daemon::ProxyLocation> {
    if let Some(location) = daemon::discover(settings).await {
        return Ok(location);
    }

    let tls = TlsOptions {
        enabled: settings.https,
        ..TlsOptions::default()
    };

    if settings.proxy_port >= crate::state::UNPRIVILEGED_PORT_MIN {
        debug!(port = settings.proxy_port, "no daemon running, starting one");
        daemon::start_detached(settings, &tls).await?;
    } else {
        start_privileged_daemon(settings, &tls).await?;
    }

    match daemon::discover(settings).await {
        Some(location) => Ok(location),
        None => bail!("proxy started but could not be discovered"),
    }
}

async fn start_privileged_daemon(settings: &Settings, tls: &TlsOptions) -> anyhow::Result<()> {
    let port = settings.proxy_port;
    if !stdin_is_tty() {
        bail!(
            "the proxy needs to listen on privileged port {port}, which requires sudo; \
             run `sudo portless proxy start -p {port}` first"
        );
    }

    eprint!("portless needs sudo to bind port {port}. Start the proxy with sudo? [y/N] ");
    let mut answer = String::new();
    std::io::stdin()
        .read_line(&mut answer)
        .context("failed to read confirmation")?;
    if !matches!(answer.trim(), "y" | "Y" | "yes") {
        bail!("proxy start declined");
    }

    let exe = std::env::current_exe().context("failed to resolve current executable")?;
    let mut cmd = std::process::Command::new("sudo");
    cmd.arg(exe)
        .arg("proxy")
        .arg("start")
        .arg("-p")
        .arg(port.to_string());
    if tls.enabled {
        cmd.arg("--https");
    }
    let status = cmd.status().context("failed to run sudo")?;
    if !status.success() {
        bail!("sudo proxy start failed with {status}");
    }

    if !daemon::wait_ready(port).await {
        bail!("proxy did not become ready on port {port}");
    }
    Ok(())
}

fn stdin_is_tty() -> bool {
    #[cfg(unix)]
    {
        unsafe { libc::isatty(libc::STDIN_FILENO) == 1 }
    }
    #[cfg(not(unix))]
    {
        false
    }
}

/// Pick a free port from the backend range: a bounded number of random
/// probes, then a sequential scan. The child binds the port later, so a
/// race with another process is possible; randomness keeps the window
/// narrow.
pub fn allocate_backend_port() -> Option<u16> {
    let mut rng = rand::thread_rng();
    for _ in 0..50 {
        let candidate = rng.gen_range(BACKEND_PORT_RANGE);
        if port_is_free(candidate) {
            return Some(candidate);
        }
    }
    BACKEND_PORT_RANGE.into_iter().find(|port| port_is_free(*port))
}

fn port_is_free(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Spawn the command under a login shell with `PORT` exported and
/// `node_modules/.bin` directories on `PATH`, forward SIGINT/SIGTERM, and
/// wait for it to exit.
async fn spawn_and_wait(command: &[String], backend_port: u16) -> anyhow::Result<i32> {
    let shell_line = command
        .iter()
        .map(|arg| shell_escape(arg))
        .collect::<Vec<_>>()
        .join(" ");

    let mut cmd = tokio::process::Command::new("/bin/sh");
    cmd.arg("-c")
        .arg(&shell_line)
        .env("PORT", backend_port.to_string())
        .env("PATH", path_with_node_bins())
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn: {shell_line}"))?;
    let child_pid = child.id().map(|pid| pid as i32);
    info!(command = %shell_line, port = backend_port, pid = ?child_pid, "app started");

    #[cfg(unix)]
    let status = {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt()).context("SIGINT handler")?;
        let mut sigterm = signal(SignalKind::terminate()).context("SIGTERM handler")?;
        loop {
            tokio::select! {
                status = child.wait() => break status?,
                _ = sigint.recv() => forward_signal(child_pid, libc::SIGINT),
                _ = sigterm.recv() => forward_signal(child_pid, libc::SIGTERM),
            }
        }
    };
    #[cfg(not(unix))]
    let status = child.wait().await?;

    Ok(exit_code(status))
}

#[cfg(unix)]
fn forward_signal(pid: Option<i32>, signum: i32) {
    if let Some(pid) = pid {
        debug!(pid, signum, "forwarding signal to child");
        unsafe {
            libc::kill(pid, signum);
        }
    }
}

/// Map a child exit status to the CLI's exit code: the child's own code,
/// or `128 + signum` for a signal death.
fn exit_code(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signum) = status.signal() {
            return 128 + signum;
        }
    }
    1
}

/// `PATH` with every `node_modules/.bin` from the current directory up to
/// the filesystem root prepended, nearest-first, so locally installed CLIs
/// win over global ones.
fn path_with_node_bins() -> String {
    let base = std::env::var("PATH").unwrap_or_default();
    let Ok(cwd) = std::env::current_dir() else {
        return base;
    };

    let mut parts: Vec<String> = node_bin_dirs(&cwd)
        .into_iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    if base.is_empty() {
        return parts.join(":");
    }
    parts.push(base);
    parts.join(":")
}

fn node_bin_dirs(start: &std::path::Path) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    let mut current = Some(start);
    while let Some(dir) = current {
        let bin = dir.join("node_modules/.bin");
        if bin.is_dir() {
            dirs.push(bin);
        }
        current = dir.parent();
    }
    dirs
}

/// Quote an argument for `/bin/sh -c`. Plain words pass through; anything
/// else is single-quoted with embedded quotes escaped.
fn shell_escape(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

/// `BYPASS` mode: replace this process with the command, untouched.
fn exec_directly(command: &[String]) -> anyhow::Result<i32> {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        let err = std::process::Command::new(&command[0])
            .args(&command[1..])
            .exec();
        bail!("failed to exec {}: {err}", command[0]);
    }
    #[cfg(not(unix))]
    {
        let status = std::process::Command::new(&command[0])
            .args(&command[1..])
            .status()
            .with_context(|| format!("failed to run {}", command[0]))?;
        Ok(status.code().unwrap_or(1))
    }
}

/// Saved terminal attributes, restored on exit so a child that died in raw
/// mode does not leave the shell unusable.
struct TerminalState {
    #[cfg(unix)]
    saved: Option<libc::termios>,
}

impl TerminalState {
    fn capture() -> Self {
        #[cfg(unix)]
        {
            if !stdin_is_tty() {
                return Self { saved: None };
            }
            let mut attrs = std::mem::MaybeUninit::<libc::termios>::uninit();
            let saved = unsafe {
                if libc::tcgetattr(libc::STDIN_FILENO, attrs.as_mut_ptr()) == 0 {
                    Some(attrs.assume_init())
                } else {
                    None
                }
            };
            Self { saved }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }

    fn restore(&self) {
        #[cfg(unix)]
        if let Some(ref attrs) = self.saved {
            unsafe {
                libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, attrs);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_escape() {
        assert_eq!(shell_escape("npm"), "npm");
        assert_eq!(shell_escape("run-script"), "run-script");
        assert_eq!(shell_escape("a b"), "'a b'");
        assert_eq!(shell_escape("it's"), r#"'it'\''s'"#);
        assert_eq!(shell_escape(""), "''");
        assert_eq!(shell_escape("$HOME"), "'$HOME'");
    }

    #[test]
    fn test_allocate_backend_port_in_range() {
        let port = allocate_backend_port().unwrap();
        assert!(BACKEND_PORT_RANGE.contains(&port));
    }

    #[test]
    fn test_node_bin_dirs_nearest_first() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a/b");
        std::fs::create_dir_all(nested.join("node_modules/.bin")).unwrap();
        std::fs::create_dir_all(tmp.path().join("node_modules/.bin")).unwrap();

        let dirs = node_bin_dirs(&nested);
        assert!(dirs.len() >= 2);
        assert_eq!(dirs[0], nested.join("node_modules/.bin"));
        assert!(dirs[1].ends_with("node_modules/.bin"));
        assert!(dirs[0].starts_with(&nested));
    }

    #[test]
    fn test_exit_code_signal_death() {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            let status = std::process::ExitStatus::from_raw(libc::SIGTERM);
            assert_eq!(exit_code(status), 128 + libc::SIGTERM);
        }
    }

    #[test]
    fn test_exit_code_normal() {
        let status = std::process::Command::new("/bin/sh")
            .args(["-c", "exit 3"])
            .status()
            .unwrap();
        assert_eq!(exit_code(status), 3);
    }
}
