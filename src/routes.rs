//! Shared on-disk route table
//!
//! The table maps `hostname -> {port, pid}` and is the only state shared
//! between the daemon and registrant processes. Mutations run under an
//! inter-process lock implemented as an atomically created directory next
//! to the table; reads are lock-free and may observe a slightly stale view.
//! Entries whose owning pid has died are filtered on every load and
//! physically dropped on the next locked write.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::hostname;
use crate::state::{restore_invoker_ownership, StateDir};

/// Attempts to grab the lock before giving up.
const LOCK_RETRIES: u32 = 20;
/// Backoff between lock attempts.
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(50);
/// A lock directory older than this is considered abandoned and broken.
const LOCK_STALE_AFTER: Duration = Duration::from_secs(10);

/// One registered hostname -> backend binding, owned by `pid`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub hostname: String,
    pub port: u16,
    pub pid: i32,
}

/// Route-store failures callers are expected to match on.
#[derive(Debug)]
pub enum StoreError {
    /// A live registration for the hostname already exists under another pid.
    Conflict {
        hostname: String,
        port: u16,
        pid: i32,
    },
    /// The inter-process lock could not be acquired within the retry limit.
    LockTimeout { lock_path: PathBuf },
    Io(std::io::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Conflict {
                hostname,
                port,
                pid,
            } => write!(
                f,
                "{hostname} is already registered to 127.0.0.1:{port} by pid {pid} (use --force to take it over)"
            ),
            StoreError::LockTimeout { lock_path } => write!(
                f,
                "could not acquire route lock at {} (another portless process may be stuck)",
                lock_path.display()
            ),
            StoreError::Io(e) => write!(f, "route table I/O error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e)
    }
}

/// Handle to the route table inside one state directory.
#[derive(Debug, Clone)]
pub struct RouteStore {
    dir: StateDir,
}

impl RouteStore {
    pub fn new(dir: StateDir) -> Self {
        Self { dir }
    }

    pub fn state_dir(&self) -> &StateDir {
        &self.dir
    }

    /// Read the table as stored. A missing file is an empty table; a file
    /// that is not a JSON array is reported and treated as empty; entries
    /// that fail schema validation are dropped.
    pub fn load(&self) -> Vec<Route> {
        let path = self.dir.routes_path();
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read route table");
                return Vec::new();
            }
        };

        let value: serde_json::Value = match serde_json::from_slice(&raw) {
            Ok(v) => v,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "route table is not valid JSON, treating as empty");
                return Vec::new();
            }
        };

        let serde_json::Value::Array(items) = value else {
            warn!(path = %path.display(), "route table is not a JSON array, treating as empty");
            return Vec::new();
        };

        items
            .into_iter()
            .filter_map(|item| match serde_json::from_value::<Route>(item) {
                Ok(route) if hostname::validate(&route.hostname).is_ok() => Some(route),
                Ok(route) => {
                    warn!(hostname = %route.hostname, "dropping route with malformed hostname");
                    None
                }
                Err(e) => {
                    warn!(error = %e, "dropping route entry that fails schema validation");
                    None
                }
            })
            .collect()
    }

    /// Load and filter out entries whose owning pid is gone. The cleanup is
    /// not written back here; dead entries disappear from disk on the next
    /// locked mutation.
    pub fn load_and_gc(&self) -> Vec<Route> {
        self.load()
            .into_iter()
            .filter(|route| {
                let alive = pid_alive(route.pid);
                if !alive {
                    debug!(hostname = %route.hostname, pid = route.pid, "dropping route for dead pid");
                }
                alive
            })
            .collect()
    }

    /// Register `hostname -> port` owned by `pid`. Fails with
    /// [`StoreError::Conflict`] if a different live pid already holds the
    /// hostname and `force` is false.
    pub fn add(&self, host: &str, port: u16, pid: i32, force: bool) -> Result<(), StoreError> {
        let _lock = self.acquire_lock()?;
        let mut routes = self.load_and_gc();

        if let Some(existing) = routes.iter().find(|r| r.hostname == host) {
            if existing.pid != pid && !force {
                return Err(StoreError::Conflict {
                    hostname: existing.hostname.clone(),
                    port: existing.port,
                    pid: existing.pid,
                });
            }
        }

        routes.retain(|r| r.hostname != host);
        routes.push(Route {
            hostname: host.to_string(),
            port,
            pid,
        });
        self.persist(&routes)?;
        debug!(hostname = %host, port, pid, "route registered");
        Ok(())
    }

    /// Remove any entry for `hostname`. Removing an absent hostname is not
    /// an error.
    pub fn remove(&self, host: &str) -> Result<(), StoreError> {
        let _lock = self.acquire_lock()?;
        let mut routes = self.load_and_gc();
        routes.retain(|r| r.hostname != host);
        self.persist(&routes)?;
        debug!(hostname = %host, "route removed");
        Ok(())
    }

    /// Write the table atomically: temp file in the same directory, fix up
    /// mode and ownership, then rename over the live file.
    fn persist(&self, routes: &[Route]) -> Result<(), StoreError> {
        let path = self.dir.routes_path();
        let tmp = self
            .dir
            .root()
            .join(format!(".routes.json.{}", std::process::id()));

        let raw = serde_json::to_vec_pretty(routes)
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))?;

        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&raw)?;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(self.dir.file_mode()))?;
        }
        if let Err(e) = restore_invoker_ownership(&tmp) {
            debug!(error = %e, "could not restore route file ownership");
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Acquire the inter-process mutex by atomically creating the lock
    /// directory, retrying with backoff and force-breaking locks whose
    /// mtime says their holder died mid-write.
    fn acquire_lock(&self) -> Result<LockGuard, StoreError> {
        let lock_path = self.dir.lock_path();

        for attempt in 0..LOCK_RETRIES {
            match fs::create_dir(&lock_path) {
                Ok(()) => {
                    let _ = restore_invoker_ownership(&lock_path);
                    return Ok(LockGuard {
                        path: lock_path,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if lock_is_stale(&lock_path) {
                        warn!(path = %lock_path.display(), "breaking stale route lock");
                        let _ = fs::remove_dir(&lock_path);
                        continue;
                    }
                    debug!(attempt, path = %lock_path.display(), "route lock busy, retrying");
                    std::thread::sleep(LOCK_RETRY_DELAY);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    // State dir vanished under us; recreate and retry.
                    self.dir
                        .ensure()
                        .map_err(|e| StoreError::Io(std::io::Error::other(e)))?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(StoreError::LockTimeout { lock_path })
    }
}

fn lock_is_stale(path: &std::path::Path) -> bool {
    let Ok(meta) = fs::metadata(path) else {
        return false;
    };
    let Ok(mtime) = meta.modified() else {
        return false;
    };
    mtime
        .elapsed()
        .map(|age| age > LOCK_STALE_AFTER)
        .unwrap_or(false)
}

/// Held route lock; releases the directory on every exit path via Drop.
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to release route lock");
        }
    }
}

/// Whether a pid refers to a live process on this host. Signal 0 probes
/// existence without delivering anything; EPERM still means alive.
pub fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    #[cfg(unix)]
    {
        let rc = unsafe { libc::kill(pid, 0) };
        if rc == 0 {
            return true;
        }
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateDir;

    fn scratch_store() -> (tempfile::TempDir, RouteStore) {
        let tmp = tempfile::tempdir().unwrap();
        let dir = StateDir::locate(1355, Some(tmp.path()));
        dir.ensure().unwrap();
        (tmp, RouteStore::new(dir))
    }

    fn own_pid() -> i32 {
        std::process::id() as i32
    }

    #[test]
    fn test_missing_file_is_empty_table() {
        let (_tmp, store) = scratch_store();
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_add_then_load_round_trip() {
        let (_tmp, store) = scratch_store();
        store.add("app.localhost", 4001, own_pid(), false).unwrap();

        let routes = store.load();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].hostname, "app.localhost");
        assert_eq!(routes[0].port, 4001);
    }

    #[test]
    fn test_add_same_pid_replaces_port() {
        let (_tmp, store) = scratch_store();
        store.add("app.localhost", 4001, own_pid(), false).unwrap();
        store.add("app.localhost", 4002, own_pid(), false).unwrap();

        let routes = store.load();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].port, 4002);
    }

    #[test]
    fn test_conflict_names_incumbent_pid() {
        let (_tmp, store) = scratch_store();
        store.add("app.localhost", 4001, own_pid(), false).unwrap();

        // pid 1 is init and always alive, so this is a live conflict.
        let err = store.add("app.localhost", 4002, 1, false).unwrap_err();
        match err {
            StoreError::Conflict { pid, port, .. } => {
                assert_eq!(pid, own_pid());
                assert_eq!(port, 4001);
            }
            other => panic!("expected conflict, got {other:?}"),
        }

        // Loser did not clobber the table.
        let routes = store.load();
        assert_eq!(routes[0].port, 4001);
    }

    #[test]
    fn test_force_overrides_conflict() {
        let (_tmp, store) = scratch_store();
        store.add("app.localhost", 4001, 1, false).unwrap();
        store.add("app.localhost", 4002, own_pid(), true).unwrap();

        let routes = store.load();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].port, 4002);
        assert_eq!(routes[0].pid, own_pid());
    }

    #[test]
    fn test_remove() {
        let (_tmp, store) = scratch_store();
        store.add("app.localhost", 4001, own_pid(), false).unwrap();
        store.remove("app.localhost").unwrap();
        assert!(store.load().is_empty());

        // Removing again is fine.
        store.remove("app.localhost").unwrap();
    }

    #[test]
    fn test_gc_filters_dead_pids() {
        let (_tmp, store) = scratch_store();
        store.add("live.localhost", 4001, own_pid(), false).unwrap();

        // A dead registration written behind the store's back.
        let mut routes = store.load();
        routes.push(Route {
            hostname: "dead.localhost".to_string(),
            port: 4002,
            pid: i32::MAX - 1,
        });
        std::fs::write(
            store.state_dir().routes_path(),
            serde_json::to_vec(&routes).unwrap(),
        )
        .unwrap();

        let live = store.load_and_gc();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].hostname, "live.localhost");

        // The next locked write persists the cleanup.
        store.add("other.localhost", 4003, own_pid(), false).unwrap();
        let on_disk = store.load();
        assert!(on_disk.iter().all(|r| r.hostname != "dead.localhost"));
    }

    #[test]
    fn test_corrupt_file_treated_as_empty() {
        let (_tmp, store) = scratch_store();
        std::fs::write(store.state_dir().routes_path(), b"{not json").unwrap();
        assert!(store.load().is_empty());

        std::fs::write(store.state_dir().routes_path(), b"{\"a\": 1}").unwrap();
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_invalid_entries_dropped_valid_kept() {
        let (_tmp, store) = scratch_store();
        std::fs::write(
            store.state_dir().routes_path(),
            br#"[
                {"hostname": "good.localhost", "port": 4001, "pid": 1, "extra": "ignored"},
                {"hostname": "bad hostname", "port": 4002, "pid": 1},
                {"port": 4003, "pid": 1},
                "not-an-object"
            ]"#,
        )
        .unwrap();

        let routes = store.load();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].hostname, "good.localhost");
    }

    #[test]
    fn test_stale_lock_is_broken() {
        let (_tmp, store) = scratch_store();
        let lock = store.state_dir().lock_path();
        std::fs::create_dir(&lock).unwrap();

        // Age the lock past the stale threshold.
        let old = std::time::SystemTime::now() - Duration::from_secs(30);
        let times = fs::FileTimes::new().set_modified(old);
        let dir_file = fs::File::open(&lock).unwrap();
        dir_file.set_times(times).unwrap();
        drop(dir_file);

        store.add("app.localhost", 4001, own_pid(), false).unwrap();
        assert_eq!(store.load().len(), 1);
        // Lock released after the write.
        assert!(!lock.exists());
    }

    #[test]
    fn test_held_lock_times_out() {
        let (_tmp, store) = scratch_store();
        let lock = store.state_dir().lock_path();
        std::fs::create_dir(&lock).unwrap();

        let err = store.add("app.localhost", 4001, own_pid(), false).unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout { .. }));
        std::fs::remove_dir(&lock).unwrap();
    }

    #[test]
    fn test_pid_alive() {
        assert!(pid_alive(own_pid()));
        assert!(!pid_alive(0));
        assert!(!pid_alive(-1));
        assert!(!pid_alive(i32::MAX - 1));
    }
}
