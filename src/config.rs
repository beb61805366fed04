//! Runtime settings
//!
//! Portless has no config file; behavior is driven by CLI flags layered
//! over a handful of environment variables. CLI flags always win.

use std::env;
use std::path::PathBuf;

/// Default proxy listen port.
pub const DEFAULT_PROXY_PORT: u16 = 1355;

/// Default range ephemeral backend ports are allocated from.
pub const BACKEND_PORT_RANGE: std::ops::RangeInclusive<u16> = 4000..=4999;

/// Settings resolved from the environment, before CLI flags are applied.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Proxy listen port (`PROXY_PORT_OVERRIDE`, invalid values ignored).
    pub proxy_port: u16,
    /// Forced HTTPS mode (`HTTPS_ENABLE`).
    pub https: bool,
    /// Explicit state directory (`STATE_DIR_OVERRIDE`, absolute paths only).
    pub state_dir: Option<PathBuf>,
    /// Skip portless entirely and exec the command directly (`BYPASS`).
    pub bypass: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            proxy_port: DEFAULT_PROXY_PORT,
            https: false,
            state_dir: None,
            bypass: false,
        }
    }
}

impl Settings {
    /// Read settings from the process environment. Malformed values are
    /// ignored rather than fatal: an env override should never break a tool
    /// that would work without it.
    pub fn from_env() -> Self {
        let mut s = Self::default();

        if let Ok(raw) = env::var("PROXY_PORT_OVERRIDE") {
            if let Ok(port) = raw.trim().parse::<u16>() {
                if port > 0 {
                    s.proxy_port = port;
                }
            }
        }

        if let Ok(raw) = env::var("HTTPS_ENABLE") {
            s.https = matches!(raw.trim(), "1" | "true");
        }

        if let Ok(raw) = env::var("STATE_DIR_OVERRIDE") {
            let path = PathBuf::from(raw.trim());
            if path.is_absolute() {
                s.state_dir = Some(path);
            }
        }

        if let Ok(raw) = env::var("BYPASS") {
            s.bypass = matches!(raw.trim(), "0" | "skip");
        }

        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests mutate process state; keep them in one test so they
    // cannot race each other under the parallel test runner.
    #[test]
    fn test_from_env_layers() {
        env::remove_var("PROXY_PORT_OVERRIDE");
        env::remove_var("HTTPS_ENABLE");
        env::remove_var("STATE_DIR_OVERRIDE");
        env::remove_var("BYPASS");

        let s = Settings::from_env();
        assert_eq!(s.proxy_port, DEFAULT_PROXY_PORT);
        assert!(!s.https);
        assert!(s.state_dir.is_none());
        assert!(!s.bypass);

        env::set_var("PROXY_PORT_OVERRIDE", "8080");
        env::set_var("HTTPS_ENABLE", "true");
        env::set_var("STATE_DIR_OVERRIDE", "/var/run/portless");
        env::set_var("BYPASS", "skip");
        let s = Settings::from_env();
        assert_eq!(s.proxy_port, 8080);
        assert!(s.https);
        assert_eq!(
            s.state_dir.as_deref(),
            Some(std::path::Path::new("/var/run/portless"))
        );
        assert!(s.bypass);

        // Invalid values fall back silently.
        env::set_var("PROXY_PORT_OVERRIDE", "not-a-port");
        env::set_var("HTTPS_ENABLE", "yes");
        env::set_var("STATE_DIR_OVERRIDE", "relative/path");
        env::set_var("BYPASS", "1");
        let s = Settings::from_env();
        assert_eq!(s.proxy_port, DEFAULT_PROXY_PORT);
        assert!(!s.https);
        assert!(s.state_dir.is_none());
        assert!(!s.bypass);

        env::remove_var("PROXY_PORT_OVERRIDE");
        env::remove_var("HTTPS_ENABLE");
        env::remove_var("STATE_DIR_OVERRIDE");
        env::remove_var("BYPASS");
    }
}
