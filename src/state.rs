//! State directory resolution
//!
//! All coordination between the daemon and registrant processes happens
//! through files in one state directory. Its location depends on whether
//! the proxy port is privileged: a root-started daemon on port 80 must
//! share the route table with non-root registrants, so privileged ports
//! use a world-writable system directory while unprivileged ports stay
//! under the invoking user's home.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;

/// First port that can be bound without elevated privileges.
pub const UNPRIVILEGED_PORT_MIN: u16 = 1024;

const SYSTEM_ROOT: &str = "/tmp/portless";
const USER_DIR_NAME: &str = ".portless";

/// Resolved state directory for one proxy instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateDir {
    root: PathBuf,
    /// True when the directory is the shared system root (world-writable
    /// files so non-root registrants can rewrite the route table).
    system: bool,
}

impl StateDir {
    /// Resolve the state directory for a proxy port. An explicit override
    /// wins unconditionally; otherwise ports below 1024 use the shared
    /// system root and everything else the per-user root.
    pub fn locate(port: u16, override_dir: Option<&Path>) -> Self {
        if let Some(dir) = override_dir {
            return Self {
                root: dir.to_path_buf(),
                system: false,
            };
        }
        if port < UNPRIVILEGED_PORT_MIN {
            Self {
                root: PathBuf::from(SYSTEM_ROOT),
                system: true,
            }
        } else {
            let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
            Self {
                root: PathBuf::from(home).join(USER_DIR_NAME),
                system: false,
            }
        }
    }

    /// Create the directory tree if needed, applying the sharing mode:
    /// `1777` (sticky, world-writable) for the system root, `0755` for the
    /// per-user root.
    pub fn ensure(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("failed to create state dir: {}", self.root.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = if self.system { 0o1777 } else { 0o755 };
            fs::set_permissions(&self.root, fs::Permissions::from_mode(mode)).with_context(
                || format!("failed to set state dir mode: {}", self.root.display()),
            )?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether state files must be writable by other users.
    pub fn is_shared(&self) -> bool {
        self.system
    }

    /// File mode for data files inside this directory.
    pub fn file_mode(&self) -> u32 {
        if self.system {
            0o666
        } else {
            0o644
        }
    }

    pub fn routes_path(&self) -> PathBuf {
        self.root.join("routes.json")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join("routes.lock")
    }

    pub fn port_path(&self) -> PathBuf {
        self.root.join("proxy.port")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.root.join("proxy.pid")
    }

    pub fn tls_marker_path(&self) -> PathBuf {
        self.root.join("proxy.tls")
    }

    pub fn log_path(&self) -> PathBuf {
        self.root.join("proxy.log")
    }

    pub fn certs_dir(&self) -> PathBuf {
        self.root.join("certs")
    }
}

/// When running under sudo, hand file ownership back to the invoking user
/// so later unprivileged processes can read and rewrite it. No-op when not
/// elevated.
pub fn restore_invoker_ownership(path: &Path) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let (Ok(uid), Ok(gid)) = (env::var("SUDO_UID"), env::var("SUDO_GID")) else {
            return Ok(());
        };
        let (Ok(uid), Ok(gid)) = (uid.parse::<u32>(), gid.parse::<u32>()) else {
            return Ok(());
        };
        std::os::unix::fs::chown(path, Some(uid), Some(gid))
            .with_context(|| format!("failed to chown {} to invoking user", path.display()))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_privileged_port_uses_system_root() {
        let dir = StateDir::locate(80, None);
        assert_eq!(dir.root(), Path::new("/tmp/portless"));
        assert!(dir.is_shared());
        assert_eq!(dir.file_mode(), 0o666);
    }

    #[test]
    fn test_unprivileged_port_uses_home() {
        let dir = StateDir::locate(1355, None);
        assert!(dir.root().ends_with(".portless"));
        assert!(!dir.is_shared());
        assert_eq!(dir.file_mode(), 0o644);
    }

    #[test]
    fn test_override_wins() {
        let dir = StateDir::locate(80, Some(Path::new("/custom/state")));
        assert_eq!(dir.root(), Path::new("/custom/state"));
        assert!(!dir.is_shared());
    }

    #[test]
    fn test_paths() {
        let dir = StateDir::locate(1355, Some(Path::new("/s")));
        assert_eq!(dir.routes_path(), Path::new("/s/routes.json"));
        assert_eq!(dir.lock_path(), Path::new("/s/routes.lock"));
        assert_eq!(dir.port_path(), Path::new("/s/proxy.port"));
        assert_eq!(dir.pid_path(), Path::new("/s/proxy.pid"));
        assert_eq!(dir.tls_marker_path(), Path::new("/s/proxy.tls"));
        assert_eq!(dir.certs_dir(), Path::new("/s/certs"));
    }
}
