//! Local certificate authority and per-hostname leaf certs
//!
//! HTTPS mode is backed by an on-demand CA kept in the state directory.
//! The default server certificate covers `localhost` and `*.localhost`,
//! which is enough for single-label apps. Because `.localhost` is a
//! reserved TLD, a single wildcard cannot cover deeper names like
//! `chat.myapp.localhost`, so those get individual leaf certs minted on
//! first handshake and cached in memory and on disk.

use std::fs;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use anyhow::{bail, Context};
use dashmap::DashMap;
use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use sha1::{Digest, Sha1};
use tracing::{debug, error, info, warn};

use crate::state::{restore_invoker_ownership, StateDir};

const CA_VALIDITY_DAYS: i64 = 3650;
const LEAF_VALIDITY_DAYS: i64 = 365;
/// Certificates closer than this to expiry are treated as invalid.
const RENEWAL_WINDOW_DAYS: i64 = 7;

const CA_COMMON_NAME: &str = "Portless Development CA";

/// SHA-1 signature algorithm OIDs; material signed with these is rejected
/// on load and regenerated.
const SHA1_SIGNATURE_OIDS: &[&str] = &[
    "1.2.840.113549.1.1.5", // sha1WithRSAEncryption
    "1.2.840.10045.4.1",    // ecdsa-with-SHA1
];

/// Manages the CA, the default server cert, and per-hostname leaves on
/// disk under `<state>/certs/`.
pub struct CertManager {
    certs_dir: PathBuf,
    host_certs_dir: PathBuf,
}

impl CertManager {
    pub fn new(state: &StateDir) -> Self {
        let certs_dir = state.certs_dir();
        let host_certs_dir = certs_dir.join("host-certs");
        Self {
            certs_dir,
            host_certs_dir,
        }
    }

    pub fn ca_cert_path(&self) -> PathBuf {
        self.certs_dir.join("ca.pem")
    }

    fn ca_key_path(&self) -> PathBuf {
        self.certs_dir.join("ca-key.pem")
    }

    fn server_cert_path(&self) -> PathBuf {
        self.certs_dir.join("server.pem")
    }

    fn server_key_path(&self) -> PathBuf {
        self.certs_dir.join("server-key.pem")
    }

    fn host_cert_paths(&self, sni: &str) -> (PathBuf, PathBuf) {
        let stem = sanitize_hostname(sni);
        (
            self.host_certs_dir.join(format!("{stem}.pem")),
            self.host_certs_dir.join(format!("{stem}-key.pem")),
        )
    }

    /// Make sure the CA and the default server certificate exist and are
    /// usable, regenerating whatever is missing, expiring, or SHA-1
    /// signed. Regenerating the CA invalidates everything signed by it.
    pub fn ensure_materialized(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.host_certs_dir).with_context(|| {
            format!("failed to create certs dir: {}", self.host_certs_dir.display())
        })?;

        let ca_regenerated = if self.ca_is_usable() {
            false
        } else {
            info!("generating local certificate authority");
            self.generate_ca()?;
            // Leaves signed by the old CA no longer validate.
            let _ = fs::remove_dir_all(&self.host_certs_dir);
            fs::create_dir_all(&self.host_certs_dir)?;
            true
        };

        if ca_regenerated || !cert_file_usable(&self.server_cert_path(), &self.server_key_path()) {
            info!("generating default server certificate for localhost and *.localhost");
            let (cert_pem, key_pem) = self.mint_signed(
                "localhost",
                vec!["localhost".to_string(), "*.localhost".to_string()],
            )?;
            self.write_pair(&self.server_cert_path(), &cert_pem, &self.server_key_path(), &key_pem)?;
        }

        Ok(())
    }

    fn ca_is_usable(&self) -> bool {
        cert_file_usable(&self.ca_cert_path(), &self.ca_key_path())
    }

    fn generate_ca(&self) -> anyhow::Result<()> {
        let ca_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;
        let params = ca_params()?;
        let cert = params.self_signed(&ca_key)?;
        self.write_pair(
            &self.ca_cert_path(),
            &cert.pem(),
            &self.ca_key_path(),
            &ca_key.serialize_pem(),
        )?;
        Ok(())
    }

    /// Mint a CA-signed leaf for `cn` with the given SANs. Returns
    /// `(cert_pem, key_pem)`.
    fn mint_signed(&self, cn: &str, sans: Vec<String>) -> anyhow::Result<(String, String)> {
        let ca_key_pem = fs::read_to_string(self.ca_key_path()).context("failed to read CA key")?;
        let ca_key = KeyPair::from_pem(&ca_key_pem)?;
        let ca = ca_params()?;
        let issuer = Issuer::from_params(&ca, &ca_key);

        let leaf_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params.distinguished_name.push(DnType::CommonName, cn);
        params.is_ca = IsCa::ExplicitNoCa;
        params
            .extended_key_usages
            .push(ExtendedKeyUsagePurpose::ServerAuth);
        let mut alt_names = Vec::with_capacity(sans.len());
        for san in &sans {
            alt_names.push(SanType::DnsName(san.clone().try_into()?));
        }
        params.subject_alt_names = alt_names;

        let now = time::OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + time::Duration::days(LEAF_VALIDITY_DAYS);

        let cert = params.signed_by(&leaf_key, &issuer)?;
        Ok((cert.pem(), leaf_key.serialize_pem()))
    }

    fn write_pair(
        &self,
        cert_path: &Path,
        cert_pem: &str,
        key_path: &Path,
        key_pem: &str,
    ) -> anyhow::Result<()> {
        fs::write(cert_path, cert_pem)
            .with_context(|| format!("failed to write {}", cert_path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(cert_path, fs::Permissions::from_mode(0o644))?;
        }
        write_private_key(key_path, key_pem)?;
        restore_invoker_ownership(cert_path)?;
        restore_invoker_ownership(key_path)?;
        Ok(())
    }

    /// Load the default server certificate as a rustls signing pair.
    fn default_certified_key(&self) -> anyhow::Result<Arc<CertifiedKey>> {
        let cert_pem = fs::read(self.server_cert_path())?;
        let key_pem = fs::read(self.server_key_path())?;
        Ok(Arc::new(certified_key_from_pem(&cert_pem, &key_pem)?))
    }

    /// Load a cached per-hostname leaf, or mint one. SAN policy: the exact
    /// SNI plus a wildcard at its sibling depth, so for
    /// `chat.myapp.localhost` the cert also covers `*.myapp.localhost`.
    fn leaf_for(&self, sni: &str) -> anyhow::Result<Arc<CertifiedKey>> {
        let (cert_path, key_path) = self.host_cert_paths(sni);

        if cert_file_usable(&cert_path, &key_path) {
            let cert_pem = fs::read(&cert_path)?;
            let key_pem = fs::read(&key_path)?;
            debug!(sni, "loaded cached host certificate");
            return Ok(Arc::new(certified_key_from_pem(&cert_pem, &key_pem)?));
        }

        let parent = sni
            .split_once('.')
            .map(|(_, rest)| rest)
            .filter(|rest| !rest.is_empty())
            .ok_or_else(|| anyhow::anyhow!("SNI {sni:?} has no parent domain"))?;

        info!(sni, "minting host certificate");
        let (cert_pem, key_pem) =
            self.mint_signed(sni, vec![sni.to_string(), format!("*.{parent}")])?;
        self.write_pair(&cert_path, &cert_pem, &key_path, &key_pem)?;
        Ok(Arc::new(certified_key_from_pem(
            cert_pem.as_bytes(),
            key_pem.as_bytes(),
        )?))
    }
}

/// Build CA certificate parameters. Deterministic (fixed DN) so the issuer
/// can be reconstructed from the stored key when signing leaves.
fn ca_params() -> anyhow::Result<CertificateParams> {
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params
        .distinguished_name
        .push(DnType::CommonName, CA_COMMON_NAME);
    params.key_usages.push(KeyUsagePurpose::KeyCertSign);
    params.key_usages.push(KeyUsagePurpose::CrlSign);

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(CA_VALIDITY_DAYS);
    Ok(params)
}

/// SNI-dispatching certificate resolver. `localhost` and single-label
/// `name.localhost` hosts are covered by the default cert's wildcard;
/// anything deeper resolves through the in-memory cache, then disk, then a
/// fresh mint. A per-SNI mutex map deduplicates concurrent handshakes for
/// the same hostname so only one of them mints.
pub struct SniResolver {
    manager: Arc<CertManager>,
    default_cert: Arc<CertifiedKey>,
    cache: DashMap<String, Arc<CertifiedKey>>,
    minting: DashMap<String, Arc<Mutex<()>>>,
}

impl SniResolver {
    pub fn new(manager: Arc<CertManager>) -> anyhow::Result<Self> {
        let default_cert = manager.default_certified_key()?;
        Ok(Self {
            manager,
            default_cert,
            cache: DashMap::new(),
            minting: DashMap::new(),
        })
    }

    fn resolve_sni(&self, sni: &str) -> Option<Arc<CertifiedKey>> {
        if default_cert_covers(sni) {
            return Some(Arc::clone(&self.default_cert));
        }

        if let Some(hit) = self.cache.get(sni) {
            return Some(Arc::clone(&hit));
        }

        // One mint per SNI at a time; losers of the race wait here and then
        // pick the winner's result out of the cache.
        let gate = self
            .minting
            .entry(sni.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _held = gate.lock();

        if let Some(hit) = self.cache.get(sni) {
            return Some(Arc::clone(&hit));
        }

        let result = match self.manager.leaf_for(sni) {
            Ok(key) => {
                self.cache.insert(sni.to_string(), Arc::clone(&key));
                Some(key)
            }
            Err(e) => {
                error!(sni, error = %e, "host certificate generation failed");
                None
            }
        };
        self.minting.remove(sni);
        result
    }
}

impl std::fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniResolver")
            .field("cached", &self.cache.len())
            .finish()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        match client_hello.server_name() {
            Some(sni) => self.resolve_sni(sni),
            // No SNI (curl by IP, health checks): default cert.
            None => Some(Arc::clone(&self.default_cert)),
        }
    }
}

/// Build the rustls server config used by the TLS listener: SNI-resolved
/// certificates, HTTP/2 preferred with HTTP/1.1 fallback.
pub fn server_tls_config(resolver: Arc<SniResolver>) -> Arc<rustls::ServerConfig> {
    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Arc::new(config)
}

/// Build a rustls server config from a user-supplied PEM pair instead of
/// the managed tree.
pub fn server_tls_config_from_files(
    cert_path: &Path,
    key_path: &Path,
) -> anyhow::Result<Arc<rustls::ServerConfig>> {
    let certs = load_cert_chain(cert_path)?;
    let key = load_private_key_file(key_path)?;
    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("TLS configuration error")?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// `localhost` itself and two-label `name.localhost` hosts are covered by
/// the default cert's `*.localhost` SAN.
pub fn default_cert_covers(sni: &str) -> bool {
    if sni == "localhost" {
        return true;
    }
    sni.ends_with(".localhost") && sni.matches('.').count() == 1
}

/// File stem for a hostname's cached cert: dots become underscores and
/// anything outside `[a-z0-9_-]` is dropped.
pub fn sanitize_hostname(host: &str) -> String {
    host.chars()
        .map(|c| if c == '.' { '_' } else { c })
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '-')
        .collect()
}

fn write_private_key(path: &Path, pem: &str) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .with_context(|| format!("failed to create key file: {}", path.display()))?;
        f.write_all(pem.as_bytes())
            .with_context(|| format!("failed to write key file: {}", path.display()))?;
        // mode() only applies to newly created files.
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        Ok(())
    }
    #[cfg(not(unix))]
    {
        fs::write(path, pem).with_context(|| format!("failed to write {}", path.display()))
    }
}

/// A cert/key pair on disk is usable if both files exist, the cert parses,
/// its signature is not SHA-1, and it is not inside the renewal window.
fn cert_file_usable(cert_path: &Path, key_path: &Path) -> bool {
    if !key_path.exists() {
        return false;
    }
    let Ok(pem) = fs::read(cert_path) else {
        return false;
    };
    let Some(der) = first_cert_der(&pem) else {
        warn!(path = %cert_path.display(), "stored certificate does not parse, regenerating");
        return false;
    };
    cert_der_usable(&der, cert_path)
}

fn cert_der_usable(der: &CertificateDer<'_>, origin: &Path) -> bool {
    use x509_parser::prelude::*;

    let (_, parsed) = match X509Certificate::from_der(der.as_ref()) {
        Ok(result) => result,
        Err(e) => {
            warn!(path = %origin.display(), error = %e, "failed to parse X.509 certificate");
            return false;
        }
    };

    let sig_oid = parsed.signature_algorithm.algorithm.to_id_string();
    if SHA1_SIGNATURE_OIDS.contains(&sig_oid.as_str()) {
        warn!(path = %origin.display(), "certificate uses a SHA-1 signature, regenerating");
        return false;
    }

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let remaining = parsed.validity().not_after.timestamp() - now;
    if remaining < RENEWAL_WINDOW_DAYS * 24 * 60 * 60 {
        info!(path = %origin.display(), "certificate expires soon, regenerating");
        return false;
    }

    true
}

fn first_cert_der(pem: &[u8]) -> Option<CertificateDer<'static>> {
    let mut reader = BufReader::new(pem);
    let result = rustls_pemfile::certs(&mut reader).next()?.ok();
    result
}

fn load_cert_chain(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = fs::File::open(path)
        .with_context(|| format!("failed to open certificate file {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to parse certificates from {}", path.display()))?;
    if certs.is_empty() {
        bail!("no certificates found in {}", path.display());
    }
    Ok(certs)
}

fn load_private_key_file(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = fs::File::open(path)
        .with_context(|| format!("failed to open key file {}", path.display()))?;
    let mut reader = BufReader::new(file);
    loop {
        match rustls_pemfile::read_one(&mut reader)
            .with_context(|| format!("failed to parse key from {}", path.display()))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }
    bail!("no private key found in {}", path.display())
}

fn certified_key_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> anyhow::Result<CertifiedKey> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_pem))
        .collect::<Result<Vec<_>, _>>()
        .context("failed to parse certificate PEM")?;
    if certs.is_empty() {
        bail!("certificate PEM contains no certificates");
    }

    let key = {
        let mut reader = BufReader::new(key_pem);
        let mut found = None;
        while let Some(item) = rustls_pemfile::read_one(&mut reader)? {
            match item {
                rustls_pemfile::Item::Pkcs1Key(key) => found = Some(PrivateKeyDer::from(key)),
                rustls_pemfile::Item::Pkcs8Key(key) => found = Some(PrivateKeyDer::from(key)),
                rustls_pemfile::Item::Sec1Key(key) => found = Some(PrivateKeyDer::from(key)),
                _ => continue,
            }
            if found.is_some() {
                break;
            }
        }
        found.context("key PEM contains no private key")?
    };

    let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key)
        .context("unsupported private key type")?;
    Ok(CertifiedKey::new(certs, signing_key))
}

/// SHA-1 fingerprint of the CA certificate, colon-free uppercase hex (the
/// format `security find-certificate -Z` prints).
pub fn ca_sha1_fingerprint(ca_cert_path: &Path) -> anyhow::Result<String> {
    let pem = fs::read(ca_cert_path)
        .with_context(|| format!("failed to read {}", ca_cert_path.display()))?;
    let der = first_cert_der(&pem).context("CA certificate does not parse")?;
    let mut hasher = Sha1::new();
    hasher.update(der.as_ref());
    let digest = hasher.finalize();
    Ok(digest.iter().map(|b| format!("{b:02X}")).collect())
}

const LINUX_TRUST_PATH: &str = "/usr/local/share/ca-certificates/portless-ca.crt";

/// Install the CA into the platform trust store: the login keychain on
/// macOS (no sudo needed), the system ca-certificates tree on Linux (via
/// sudo).
pub fn install_trust(ca_cert_path: &Path) -> anyhow::Result<()> {
    if cfg!(target_os = "macos") {
        let home = std::env::var("HOME").context("HOME is not set")?;
        let keychain = format!("{home}/Library/Keychains/login.keychain-db");
        let status = Command::new("security")
            .args(["add-trusted-cert", "-r", "trustRoot", "-k", &keychain])
            .arg(ca_cert_path)
            .status()
            .context("failed to run `security`")?;
        if !status.success() {
            bail!("`security add-trusted-cert` exited with {status}");
        }
    } else {
        let status = Command::new("sudo")
            .arg("cp")
            .arg(ca_cert_path)
            .arg(LINUX_TRUST_PATH)
            .status()
            .context("failed to run `sudo cp`")?;
        if !status.success() {
            bail!("could not copy the CA into {LINUX_TRUST_PATH}");
        }
        let status = Command::new("sudo")
            .arg("update-ca-certificates")
            .status()
            .context("failed to run `sudo update-ca-certificates`")?;
        if !status.success() {
            bail!("`update-ca-certificates` exited with {status}");
        }
    }
    info!("CA installed into the platform trust store");
    Ok(())
}

/// Check whether the CA is present in the platform trust store.
pub fn verify_trust(ca_cert_path: &Path) -> anyhow::Result<bool> {
    if cfg!(target_os = "macos") {
        let fingerprint = ca_sha1_fingerprint(ca_cert_path)?;
        let output = Command::new("security")
            .args(["find-certificate", "-a", "-Z"])
            .output()
            .context("failed to run `security find-certificate`")?;
        let listing = String::from_utf8_lossy(&output.stdout);
        Ok(listing.contains(&fingerprint))
    } else {
        match fs::read(LINUX_TRUST_PATH) {
            Ok(installed) => {
                let local = fs::read(ca_cert_path)?;
                Ok(installed == local)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateDir;
    use x509_parser::prelude::*;

    fn scratch_manager() -> (tempfile::TempDir, CertManager) {
        let tmp = tempfile::tempdir().unwrap();
        let dir = StateDir::locate(1355, Some(tmp.path()));
        dir.ensure().unwrap();
        (tmp, CertManager::new(&dir))
    }

    fn parse_cert(path: &Path) -> (CertificateDer<'static>, Vec<String>) {
        let pem = fs::read(path).unwrap();
        let der = first_cert_der(&pem).unwrap();
        let (_, parsed) = X509Certificate::from_der(der.as_ref()).unwrap();
        let sans = parsed
            .subject_alternative_name()
            .unwrap()
            .map(|ext| {
                ext.value
                    .general_names
                    .iter()
                    .filter_map(|name| match name {
                        GeneralName::DNSName(dns) => Some(dns.to_string()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        (der, sans)
    }

    #[test]
    fn test_ensure_materialized_creates_tree() {
        let (_tmp, manager) = scratch_manager();
        manager.ensure_materialized().unwrap();

        assert!(manager.ca_cert_path().exists());
        assert!(manager.ca_key_path().exists());
        let (_, sans) = parse_cert(&manager.server_cert_path());
        assert!(sans.contains(&"localhost".to_string()));
        assert!(sans.contains(&"*.localhost".to_string()));
    }

    #[test]
    fn test_ensure_materialized_is_idempotent() {
        let (_tmp, manager) = scratch_manager();
        manager.ensure_materialized().unwrap();
        let ca_before = fs::read(manager.ca_cert_path()).unwrap();
        let server_before = fs::read(manager.server_cert_path()).unwrap();

        manager.ensure_materialized().unwrap();
        assert_eq!(fs::read(manager.ca_cert_path()).unwrap(), ca_before);
        assert_eq!(fs::read(manager.server_cert_path()).unwrap(), server_before);
    }

    #[test]
    fn test_ca_properties() {
        let (_tmp, manager) = scratch_manager();
        manager.ensure_materialized().unwrap();

        let (der, _) = parse_cert(&manager.ca_cert_path());
        let (_, parsed) = X509Certificate::from_der(der.as_ref()).unwrap();
        assert!(parsed.is_ca());
        // ECDSA with SHA-256, never SHA-1.
        let oid = parsed.signature_algorithm.algorithm.to_id_string();
        assert_eq!(oid, "1.2.840.10045.4.3.2");
    }

    #[test]
    fn test_leaf_sans_cover_sibling_wildcard() {
        let (_tmp, manager) = scratch_manager();
        manager.ensure_materialized().unwrap();

        let key = manager.leaf_for("chat.myapp.localhost").unwrap();
        assert!(!key.cert.is_empty());

        let (cert_path, key_path) = manager.host_cert_paths("chat.myapp.localhost");
        assert!(cert_path.ends_with("chat_myapp_localhost.pem"));
        assert!(key_path.exists());

        let (der, sans) = parse_cert(&cert_path);
        assert!(sans.contains(&"chat.myapp.localhost".to_string()));
        assert!(sans.contains(&"*.myapp.localhost".to_string()));

        // Issued by our CA, valid comfortably past the renewal window.
        let (_, parsed) = X509Certificate::from_der(der.as_ref()).unwrap();
        assert!(parsed.issuer().to_string().contains(CA_COMMON_NAME));
        assert!(cert_der_usable(&der, &cert_path));
    }

    #[test]
    fn test_leaf_reused_from_disk() {
        let (_tmp, manager) = scratch_manager();
        manager.ensure_materialized().unwrap();

        manager.leaf_for("a.b.localhost").unwrap();
        let (cert_path, _) = manager.host_cert_paths("a.b.localhost");
        let first = fs::read(&cert_path).unwrap();

        manager.leaf_for("a.b.localhost").unwrap();
        assert_eq!(fs::read(&cert_path).unwrap(), first);
    }

    #[test]
    fn test_default_cert_covers() {
        assert!(default_cert_covers("localhost"));
        assert!(default_cert_covers("myapp.localhost"));
        assert!(!default_cert_covers("chat.myapp.localhost"));
        assert!(!default_cert_covers("example.com"));
    }

    #[test]
    fn test_sanitize_hostname() {
        assert_eq!(
            sanitize_hostname("chat.myapp.localhost"),
            "chat_myapp_localhost"
        );
        assert_eq!(sanitize_hostname("a!b.localhost"), "ab_localhost");
    }

    #[test]
    fn test_resolver_caches_minted_leaves() {
        let (_tmp, manager) = scratch_manager();
        manager.ensure_materialized().unwrap();
        let resolver = SniResolver::new(Arc::new(manager)).unwrap();

        let first = resolver.resolve_sni("api.myapp.localhost").unwrap();
        let second = resolver.resolve_sni("api.myapp.localhost").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        // Shallow names short-circuit to the default cert.
        let default = resolver.resolve_sni("myapp.localhost").unwrap();
        assert!(Arc::ptr_eq(&default, &resolver.default_cert));
    }

    #[test]
    fn test_fingerprint_is_stable_hex() {
        let (_tmp, manager) = scratch_manager();
        manager.ensure_materialized().unwrap();
        let fp = ca_sha1_fingerprint(&manager.ca_cert_path()).unwrap();
        assert_eq!(fp.len(), 40);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(fp, ca_sha1_fingerprint(&manager.ca_cert_path()).unwrap());
    }
}
