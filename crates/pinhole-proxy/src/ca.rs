//! Certificate Authority management for TLS interception.
//!
//! Generates (once) and loads the root CA, then issues per-host leaf
//! certificates on demand. Leaves are cached by lower-cased hostname and
//! replaced after they expire.

use std::collections::HashMap;
use std::fs;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use time::{Duration, OffsetDateTime};

pub use crate::error::CaManagerError;

/// CA certificate and key file names.
const CA_CERT_FILENAME: &str = "pinhole-ca.crt";
const CA_KEY_FILENAME: &str = "pinhole-ca.key";

const CA_COMMON_NAME: &str = "Pinhole Root CA";
const CA_ORGANIZATION: &str = "Pinhole";
const CA_VALIDITY_DAYS: i64 = 3650;
const LEAF_VALIDITY_DAYS: i64 = 365;
/// Leaves expire at least this long before the root does.
const LEAF_EXPIRY_MARGIN_DAYS: i64 = 1;

/// A leaf certificate issued for one host.
#[derive(Debug, Clone)]
pub struct HostCertificate {
    /// Lower-cased hostname (or IP literal) the certificate is for.
    pub hostname: String,
    /// DER-encoded leaf certificate.
    pub certificate_der: CertificateDer<'static>,
    /// PKCS#8 DER-encoded private key.
    pub private_key_der: Vec<u8>,
    /// End of validity.
    pub not_after: DateTime<Utc>,
}

impl HostCertificate {
    /// Returns true once the certificate is no longer valid.
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.not_after
    }
}

/// Loaded root authority.
struct RootAuthority {
    issuer: Issuer<'static, KeyPair>,
    cert_pem: String,
    cert_der: CertificateDer<'static>,
    not_after: OffsetDateTime,
}

type LeafSlot = Arc<OnceCell<Arc<HostCertificate>>>;

/// Manages the root CA and the per-host leaf cache.
pub struct CaManager {
    /// Path to the CA directory.
    ca_dir: PathBuf,
    root: OnceCell<Arc<RootAuthority>>,
    leaves: Mutex<HashMap<String, LeafSlot>>,
    issued: AtomicUsize,
}

impl std::fmt::Debug for CaManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaManager")
            .field("ca_dir", &self.ca_dir)
            .field("loaded", &self.root.get().is_some())
            .field("cached_hosts", &self.leaves.lock().len())
            .field("issued", &self.issued_count())
            .finish()
    }
}

impl CaManager {
    /// Creates a new CA manager with the given directory.
    pub fn new(ca_dir: impl AsRef<Path>) -> Self {
        Self {
            ca_dir: ca_dir.as_ref().to_path_buf(),
            root: OnceCell::new(),
            leaves: Mutex::new(HashMap::new()),
            issued: AtomicUsize::new(0),
        }
    }

    /// Creates a CA manager using the default Pinhole data directory.
    pub fn with_default_dir() -> Result<Self, CaManagerError> {
        Ok(Self::new(default_ca_dir()?))
    }

    /// Returns the path to the CA certificate file.
    pub fn cert_path(&self) -> PathBuf {
        self.ca_dir.join(CA_CERT_FILENAME)
    }

    /// Returns the path to the CA private key file.
    pub fn key_path(&self) -> PathBuf {
        self.ca_dir.join(CA_KEY_FILENAME)
    }

    /// Checks if the CA certificate exists on disk.
    pub fn ca_exists(&self) -> bool {
        self.cert_path().exists() && self.key_path().exists()
    }

    /// Ensures the root CA exists and is loaded, generating it if necessary.
    ///
    /// The loaded root is memoised; later calls return immediately.
    pub fn ensure_ca(&self) -> Result<(), CaManagerError> {
        self.root()?;
        Ok(())
    }

    fn root(&self) -> Result<&Arc<RootAuthority>, CaManagerError> {
        self.root.get_or_try_init(|| {
            if !self.ca_exists() {
                self.generate_ca()?;
            }
            self.load_authority().map(Arc::new)
        })
    }

    /// Generates a new root CA certificate and key.
    pub fn generate_ca(&self) -> Result<(), CaManagerError> {
        fs::create_dir_all(&self.ca_dir)?;

        let key_pair = KeyPair::generate()?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, CA_COMMON_NAME);
        dn.push(DnType::OrganizationName, CA_ORGANIZATION);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(1);
        params.not_after = now + Duration::days(CA_VALIDITY_DAYS);

        let cert = params.self_signed(&key_pair)?;

        fs::write(self.cert_path(), cert.pem()).map_err(|e| CaManagerError::Write(e.to_string()))?;
        fs::write(self.key_path(), key_pair.serialize_pem())
            .map_err(|e| CaManagerError::Write(e.to_string()))?;

        tracing::info!("Generated new CA certificate at {:?}", self.cert_path());
        Ok(())
    }

    fn load_authority(&self) -> Result<RootAuthority, CaManagerError> {
        let cert_pem = fs::read_to_string(self.cert_path())?;
        let key_pem = fs::read_to_string(self.key_path())?;

        let key_pair = KeyPair::from_pem(&key_pem).map_err(|e| CaManagerError::Parse(e.to_string()))?;
        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
            .map_err(|e| CaManagerError::Parse(e.to_string()))?;

        let cert_der = rustls_pemfile::certs(&mut BufReader::new(cert_pem.as_bytes()))
            .next()
            .ok_or_else(|| CaManagerError::Parse("no certificate in CA file".into()))??;
        let not_after = certificate_not_after(&cert_der)?;

        tracing::debug!("Loaded CA certificate from {:?}", self.cert_path());

        Ok(RootAuthority {
            issuer,
            cert_pem,
            cert_der,
            not_after,
        })
    }

    /// Returns the root certificate in PEM form.
    pub fn root_certificate_pem(&self) -> Result<String, CaManagerError> {
        Ok(self.root()?.cert_pem.clone())
    }

    /// Returns the root certificate as DER bytes (for installation).
    pub fn root_certificate_der(&self) -> Result<CertificateDer<'static>, CaManagerError> {
        Ok(self.root()?.cert_der.clone())
    }

    /// Returns the leaf certificate for `hostname`, issuing it on first use.
    ///
    /// Concurrent first requests for one host wait for a single issuance.
    pub fn certificate_for(&self, hostname: &str) -> Result<Arc<HostCertificate>, CaManagerError> {
        let host = normalize_host(hostname);
        if host.is_empty() {
            return Err(CaManagerError::Issuance {
                host,
                reason: "empty hostname".into(),
            });
        }

        let slot = {
            let mut leaves = self.leaves.lock();
            let slot = leaves.entry(host.clone()).or_default();
            if slot.get().is_some_and(|cert| cert.is_expired()) {
                tracing::debug!(host = %host, "Leaf certificate expired, replacing");
                *slot = LeafSlot::default();
            }
            slot.clone()
        };

        slot.get_or_try_init(|| self.issue(&host).map(Arc::new))
            .cloned()
    }

    fn issue(&self, host: &str) -> Result<HostCertificate, CaManagerError> {
        let issuance = |reason: String| CaManagerError::Issuance {
            host: host.to_string(),
            reason,
        };
        let root = self.root()?;

        let san = match host.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(host.to_string().try_into().map_err(
                |e: rcgen::Error| issuance(e.to_string()),
            )?),
        };

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        params.subject_alt_names = vec![san];
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.use_authority_key_identifier_extension = true;

        let now = OffsetDateTime::now_utc();
        let latest = root.not_after - Duration::days(LEAF_EXPIRY_MARGIN_DAYS);
        if latest <= now {
            return Err(issuance(format!("root CA expires at {}", root.not_after)));
        }
        params.not_before = now - Duration::days(1);
        params.not_after = (now + Duration::days(LEAF_VALIDITY_DAYS)).min(latest);

        let key_pair = KeyPair::generate().map_err(|e| issuance(e.to_string()))?;
        let cert = params
            .signed_by(&key_pair, &root.issuer)
            .map_err(|e| issuance(e.to_string()))?;

        let not_after = DateTime::<Utc>::from_timestamp(params.not_after.unix_timestamp(), 0)
            .ok_or_else(|| issuance("validity out of range".into()))?;

        self.issued.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(host = %host, "Issued leaf certificate");

        Ok(HostCertificate {
            hostname: host.to_string(),
            certificate_der: cert.der().clone(),
            private_key_der: key_pair.serialize_der(),
            not_after,
        })
    }

    /// Builds a rustls server configuration presenting `[leaf, root]`.
    pub fn server_config(&self, cert: &HostCertificate) -> Result<Arc<ServerConfig>, CaManagerError> {
        let issuance = |reason: String| CaManagerError::Issuance {
            host: cert.hostname.clone(),
            reason,
        };
        let root = self.root()?;
        let chain = vec![cert.certificate_der.clone(), root.cert_der.clone()];
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.private_key_der.clone()));

        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let mut config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| issuance(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| issuance(e.to_string()))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Arc::new(config))
    }

    /// Hostnames with a cached leaf certificate, sorted.
    pub fn cached_hosts(&self) -> Vec<String> {
        let leaves = self.leaves.lock();
        let mut hosts: Vec<String> = leaves
            .iter()
            .filter(|(_, slot)| slot.get().is_some())
            .map(|(host, _)| host.clone())
            .collect();
        hosts.sort();
        hosts
    }

    /// Number of leaf certificates issued by this manager.
    pub fn issued_count(&self) -> usize {
        self.issued.load(Ordering::Relaxed)
    }

    /// Drops every cached leaf certificate.
    pub fn clear_cache(&self) {
        self.leaves.lock().clear();
    }
}

/// Default CA directory under the platform data dir.
pub fn default_ca_dir() -> Result<PathBuf, CaManagerError> {
    let project_dirs = directories::ProjectDirs::from("com", "pinhole", "Pinhole")
        .ok_or_else(|| CaManagerError::Generation("Failed to get project dirs".into()))?;
    Ok(project_dirs.data_dir().join("ca"))
}

/// Reads the end of validity from a DER certificate.
fn certificate_not_after(der: &[u8]) -> Result<OffsetDateTime, CaManagerError> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| CaManagerError::Parse(e.to_string()))?;
    Ok(cert.validity().not_after.to_datetime())
}

fn normalize_host(hostname: &str) -> String {
    hostname
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase()
}
