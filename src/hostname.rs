//! Hostname validation and URL formatting
//!
//! Every app registers under a `<name>.localhost` hostname. Names given on
//! the command line are normalized (lowercased, suffixed) before they reach
//! the route table, so the proxy can match hosts case-sensitively.

use std::fmt;

/// Reserved suffix all proxied hostnames live under.
pub const LOCALHOST_SUFFIX: &str = "localhost";

/// Error describing why a hostname was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidHostname {
    pub input: String,
    pub reason: &'static str,
}

impl fmt::Display for InvalidHostname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid hostname {:?}: {}", self.input, self.reason)
    }
}

impl std::error::Error for InvalidHostname {}

/// Normalize a user-supplied name into a fully qualified `<name>.localhost`
/// hostname. Lowercases, appends the suffix when missing, and validates the
/// label grammar. Normalization is idempotent: feeding the output back in
/// returns it unchanged.
pub fn normalize(name: &str) -> Result<String, InvalidHostname> {
    let lowered = name.trim().to_ascii_lowercase();
    if lowered.is_empty() {
        return Err(InvalidHostname {
            input: name.to_string(),
            reason: "name is empty",
        });
    }

    let full = if lowered == LOCALHOST_SUFFIX
        || lowered.ends_with(&format!(".{LOCALHOST_SUFFIX}"))
    {
        lowered
    } else {
        format!("{lowered}.{LOCALHOST_SUFFIX}")
    };

    validate(&full)?;
    Ok(full)
}

/// Validate a fully qualified hostname: `label("."label)* ".localhost"`,
/// each label non-empty lowercase `[a-z0-9-]` with no leading or trailing
/// hyphen.
pub fn validate(hostname: &str) -> Result<(), InvalidHostname> {
    let err = |reason| InvalidHostname {
        input: hostname.to_string(),
        reason,
    };

    let Some(prefix) = hostname.strip_suffix(&format!(".{LOCALHOST_SUFFIX}")) else {
        return Err(err("must end with .localhost"));
    };
    if prefix.is_empty() {
        return Err(err("name before .localhost is empty"));
    }

    for label in prefix.split('.') {
        if label.is_empty() {
            return Err(err("empty label"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(err("label starts or ends with a hyphen"));
        }
        if !label
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        {
            return Err(err("label contains characters outside [a-z0-9-]"));
        }
    }

    Ok(())
}

/// Strip an optional `:port` suffix from a Host/:authority value.
pub fn strip_port(host: &str) -> &str {
    host.split(':').next().unwrap_or(host)
}

/// Format a browsable URL for a hostname, omitting the port when it is the
/// protocol default.
pub fn display_url(hostname: &str, port: u16, tls: bool) -> String {
    let scheme = if tls { "https" } else { "http" };
    let default = if tls { 443 } else { 80 };
    if port == default {
        format!("{scheme}://{hostname}/")
    } else {
        format!("{scheme}://{hostname}:{port}/")
    }
}

/// Escape a string for embedding in HTML text or attribute values.
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_appends_suffix() {
        assert_eq!(normalize("myapp").unwrap(), "myapp.localhost");
        assert_eq!(normalize("MyApp").unwrap(), "myapp.localhost");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let once = normalize("MyApp").unwrap();
        assert_eq!(normalize(&once).unwrap(), once);
        assert_eq!(normalize("myapp.localhost").unwrap(), "myapp.localhost");
    }

    #[test]
    fn test_normalize_nested_labels() {
        assert_eq!(
            normalize("chat.myapp").unwrap(),
            "chat.myapp.localhost"
        );
    }

    #[test]
    fn test_validate_rejects_bad_labels() {
        assert!(normalize("").is_err());
        assert!(normalize("-app").is_err());
        assert!(normalize("app-").is_err());
        assert!(normalize("a..b").is_err());
        assert!(normalize("my_app").is_err());
        assert!(normalize("my app").is_err());
        assert!(validate("app.localhost").is_ok());
        assert!(validate(".localhost").is_err());
        assert!(validate("app.example.com").is_err());
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("myapp.localhost:1355"), "myapp.localhost");
        assert_eq!(strip_port("myapp.localhost"), "myapp.localhost");
    }

    #[test]
    fn test_display_url_omits_default_ports() {
        assert_eq!(display_url("a.localhost", 80, false), "http://a.localhost/");
        assert_eq!(display_url("a.localhost", 443, true), "https://a.localhost/");
        assert_eq!(
            display_url("a.localhost", 1355, false),
            "http://a.localhost:1355/"
        );
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html("<script>x</script>"),
            "&lt;script&gt;x&lt;/script&gt;"
        );
        assert_eq!(escape_html(r#"a"b'c&d"#), "a&quot;b&#39;c&amp;d");
    }
}
