//! Certificate Authority for HTTPS interception.
//!
//! The root CA is generated once and persisted as PEM. Leaf certificates are
//! issued per hostname on first use, signed by that root, and cached as
//! ready-to-use rustls server configurations.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hudsucker::certificate_authority::CertificateAuthority as IssueServerConfig;
use hudsucker::rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose,
};
use hyper::http::uri::Authority;
use parking_lot::Mutex;
use rustls::crypto::aws_lc_rs::default_provider;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use tokio::sync::OnceCell;

pub use crate::error::CaManagerError;

/// CA certificate and key file names.
const CA_CERT_FILENAME: &str = "argus-ca.crt";
const CA_KEY_FILENAME: &str = "argus-ca.key";

/// Subject common name of the generated root.
pub const ROOT_COMMON_NAME: &str = "A.R.G.U.S. Root CA";

/// Default number of hostnames whose leaves are kept.
pub const DEFAULT_LEAF_CACHE_SIZE: usize = 1000;

/// Manages the root CA files on disk.
#[derive(Debug, Clone)]
pub struct CaManager {
    ca_dir: PathBuf,
}

impl CaManager {
    /// Creates a new CA manager with the given directory.
    pub fn new(ca_dir: impl AsRef<Path>) -> Self {
        Self {
            ca_dir: ca_dir.as_ref().to_path_buf(),
        }
    }

    /// Creates a CA manager using the default Argus data directory.
    pub fn with_default_dir() -> Result<Self, CaManagerError> {
        let project_dirs = directories::ProjectDirs::from("com", "argus", "argus")
            .ok_or_else(|| CaManagerError::Generation("Failed to get project dirs".into()))?;

        Ok(Self::new(project_dirs.data_dir().join("ca")))
    }

    /// Returns the path to the CA certificate file.
    pub fn cert_path(&self) -> PathBuf {
        self.ca_dir.join(CA_CERT_FILENAME)
    }

    /// Returns the path to the CA private key file.
    pub fn key_path(&self) -> PathBuf {
        self.ca_dir.join(CA_KEY_FILENAME)
    }

    /// Checks if both CA files exist.
    pub fn ca_exists(&self) -> bool {
        self.cert_path().exists() && self.key_path().exists()
    }

    /// Loads the CA, generating and persisting it first if either file is
    /// missing.
    pub fn ensure_ca(&self) -> Result<CertificateAuthority, CaManagerError> {
        if !self.ca_exists() {
            self.generate_ca()?;
        }
        self.load_authority()
    }

    /// Generates a new self-signed root CA certificate and key.
    pub fn generate_ca(&self) -> Result<(), CaManagerError> {
        fs::create_dir_all(&self.ca_dir)?;

        let key_pair =
            KeyPair::generate().map_err(|e| CaManagerError::Generation(e.to_string()))?;

        let mut params = CertificateParams::default();
        let mut name = DistinguishedName::new();
        name.push(DnType::CommonName, ROOT_COMMON_NAME);
        name.push(DnType::OrganizationName, "A.R.G.U.S.");
        params.distinguished_name = name;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CaManagerError::Generation(e.to_string()))?;

        fs::write(self.cert_path(), cert.pem()).map_err(|e| CaManagerError::Write(e.to_string()))?;
        fs::write(self.key_path(), key_pair.serialize_pem())
            .map_err(|e| CaManagerError::Write(e.to_string()))?;

        tracing::info!("Generated new CA certificate at {:?}", self.cert_path());

        Ok(())
    }

    /// Loads the persisted CA.
    pub fn load_authority(&self) -> Result<CertificateAuthority, CaManagerError> {
        let cert_pem = fs::read_to_string(self.cert_path())?;
        let key_pem = fs::read_to_string(self.key_path())?;

        CertificateAuthority::from_pem(&cert_pem, &key_pem, DEFAULT_LEAF_CACHE_SIZE)
    }
}

/// Root CA plus the per-host leaf cache.
///
/// Cloning is cheap; clones share the root and the cache.
#[derive(Clone)]
pub struct CertificateAuthority {
    inner: Arc<Inner>,
}

struct Inner {
    issuer: Issuer<'static, KeyPair>,
    root_pem: String,
    root_der: Vec<u8>,
    provider: Arc<CryptoProvider>,
    leaves: Mutex<LeafCache>,
    /// Served when no leaf can be issued; its handshake always fails.
    refuse: Arc<ServerConfig>,
}

type LeafCell = Arc<OnceCell<Arc<ServerConfig>>>;

/// Insertion-ordered, bounded map of hostname to leaf.
struct LeafCache {
    capacity: usize,
    cells: HashMap<String, LeafCell>,
    order: VecDeque<String>,
}

impl LeafCache {
    fn cell(&mut self, host: &str) -> LeafCell {
        if let Some(cell) = self.cells.get(host) {
            return cell.clone();
        }

        while self.cells.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.cells.remove(&oldest);
                }
                None => break,
            }
        }

        let cell = Arc::new(OnceCell::new());
        self.cells.insert(host.to_string(), cell.clone());
        self.order.push_back(host.to_string());
        cell
    }
}

impl CertificateAuthority {
    /// Builds an authority from the root certificate and key PEM.
    pub fn from_pem(
        cert_pem: &str,
        key_pem: &str,
        cache_size: usize,
    ) -> Result<Self, CaManagerError> {
        let root_der = pem::parse(cert_pem)
            .map_err(|e| CaManagerError::Parse(e.to_string()))?
            .contents()
            .to_vec();

        let key_pair =
            KeyPair::from_pem(key_pem).map_err(|e| CaManagerError::Parse(e.to_string()))?;
        let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair)
            .map_err(|e| CaManagerError::Parse(e.to_string()))?;

        let provider = Arc::new(default_provider());
        let refuse = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| CaManagerError::Parse(e.to_string()))?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(NoCertificate));

        Ok(Self {
            inner: Arc::new(Inner {
                issuer,
                root_pem: cert_pem.to_string(),
                root_der,
                provider,
                leaves: Mutex::new(LeafCache {
                    capacity: cache_size.max(1),
                    cells: HashMap::new(),
                    order: VecDeque::new(),
                }),
                refuse: Arc::new(refuse),
            }),
        })
    }

    /// The persisted root certificate, PEM encoded.
    pub fn root_certificate_pem(&self) -> &str {
        &self.inner.root_pem
    }

    /// The persisted root certificate, DER encoded.
    pub fn root_certificate_der(&self) -> &[u8] {
        &self.inner.root_der
    }

    /// Number of hostnames with a cached leaf slot.
    pub fn cached_leaves(&self) -> usize {
        self.inner.leaves.lock().cells.len()
    }

    /// Returns the server configuration for `host`, issuing its leaf on first
    /// use. Concurrent first requests for a host share one issuance.
    pub async fn issue_leaf(&self, host: &str) -> Result<Arc<ServerConfig>, CaManagerError> {
        let host = leaf_host(host);
        let cell = self.inner.leaves.lock().cell(&host);

        cell.get_or_try_init(|| async { self.sign_leaf(&host) })
            .await
            .cloned()
    }

    fn sign_leaf(&self, host: &str) -> Result<Arc<ServerConfig>, CaManagerError> {
        let issuance = |reason: String| CaManagerError::Issuance {
            host: host.to_string(),
            reason,
        };

        // Clients can only ever verify a leaf for a DNS name or IP address.
        ServerName::try_from(host).map_err(|e| issuance(e.to_string()))?;

        let key_pair = KeyPair::generate().map_err(|e| issuance(e.to_string()))?;

        let mut params =
            CertificateParams::new(vec![host.to_string()]).map_err(|e| issuance(e.to_string()))?;
        params.distinguished_name.push(DnType::CommonName, host);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let cert = params
            .signed_by(&key_pair, &self.inner.issuer)
            .map_err(|e| issuance(e.to_string()))?;

        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        let certs: Vec<CertificateDer<'static>> = vec![cert.der().clone()];

        let mut config = ServerConfig::builder_with_provider(self.inner.provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| issuance(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| issuance(e.to_string()))?;
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        tracing::debug!("Issued leaf certificate for {}", host);
        Ok(Arc::new(config))
    }
}

impl IssueServerConfig for CertificateAuthority {
    async fn gen_server_config(&self, authority: &Authority) -> Arc<ServerConfig> {
        match self.issue_leaf(authority.host()).await {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Refusing TLS handshake: {}", e);
                self.inner.refuse.clone()
            }
        }
    }
}

/// Resolver with no certificate: the handshake aborts.
#[derive(Debug)]
struct NoCertificate;

impl ResolvesServerCert for NoCertificate {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        None
    }
}

/// Cache key and SAN for a host: lowercase, no port, no IPv6 brackets.
fn leaf_host(host: &str) -> String {
    argus_core::rules::strip_port(host.trim())
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::{ClientConfig, ClientConnection, Connection, RootCertStore, ServerConnection};
    use tempfile::TempDir;

    fn authority(dir: &TempDir) -> CertificateAuthority {
        CaManager::new(dir.path().join("ca")).ensure_ca().unwrap()
    }

    fn pump(from: &mut Connection, to: &mut Connection) -> Result<(), rustls::Error> {
        let mut buf = Vec::new();
        while from.wants_write() {
            from.write_tls(&mut buf).unwrap();
        }
        let mut rd = &buf[..];
        while !rd.is_empty() {
            to.read_tls(&mut rd).unwrap();
            to.process_new_packets()?;
        }
        Ok(())
    }

    /// Runs a full in-memory handshake trusting only `root_der`.
    fn handshake(root_der: &[u8], server: Arc<ServerConfig>, name: &'static str) -> Result<(), rustls::Error> {
        let mut roots = RootCertStore::empty();
        roots.add(CertificateDer::from(root_der.to_vec())).unwrap();

        let client_config = ClientConfig::builder_with_provider(Arc::new(default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let mut client = Connection::from(
            ClientConnection::new(Arc::new(client_config), ServerName::try_from(name).unwrap())
                .unwrap(),
        );
        let mut server = Connection::from(ServerConnection::new(server).unwrap());

        for _ in 0..10 {
            if !client.is_handshaking() && !server.is_handshaking() {
                return Ok(());
            }
            pump(&mut client, &mut server)?;
            pump(&mut server, &mut client)?;
        }
        Err(rustls::Error::General("handshake did not complete".into()))
    }

    #[test]
    fn ca_manager_paths() {
        let manager = CaManager::new("/tmp/test-ca");
        assert_eq!(manager.cert_path(), PathBuf::from("/tmp/test-ca/argus-ca.crt"));
        assert_eq!(manager.key_path(), PathBuf::from("/tmp/test-ca/argus-ca.key"));
    }

    #[test]
    fn ensure_ca_generates_once() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path().join("ca"));
        assert!(!manager.ca_exists());

        let first = manager.ensure_ca().unwrap();
        assert!(manager.ca_exists());

        let second = manager.ensure_ca().unwrap();
        assert_eq!(first.root_certificate_der(), second.root_certificate_der());
    }

    #[test]
    fn root_pem_is_the_persisted_file() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path().join("ca"));
        let ca = manager.ensure_ca().unwrap();

        let on_disk = fs::read_to_string(manager.cert_path()).unwrap();
        assert_eq!(ca.root_certificate_pem(), on_disk);
        assert!(on_disk.starts_with("-----BEGIN CERTIFICATE-----"));
        assert_eq!(
            pem::parse(on_disk).unwrap().contents(),
            ca.root_certificate_der()
        );
    }

    #[test]
    fn load_fails_on_garbage() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path());
        fs::write(manager.cert_path(), "not a cert").unwrap();
        fs::write(manager.key_path(), "not a key").unwrap();

        assert!(matches!(
            manager.load_authority(),
            Err(CaManagerError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn leaf_verifies_against_downloaded_root() {
        let temp_dir = TempDir::new().unwrap();
        let ca = authority(&temp_dir);

        let leaf = ca.issue_leaf("localhost").await.unwrap();
        assert_eq!(leaf.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);

        handshake(ca.root_certificate_der(), leaf, "localhost").unwrap();
    }

    #[tokio::test]
    async fn leaf_rejected_by_other_root() {
        let ours = TempDir::new().unwrap();
        let theirs = TempDir::new().unwrap();
        let ca = authority(&ours);
        let other = authority(&theirs);

        let leaf = ca.issue_leaf("localhost").await.unwrap();
        assert!(handshake(other.root_certificate_der(), leaf, "localhost").is_err());
    }

    #[tokio::test]
    async fn leaf_cached_per_host() {
        let temp_dir = TempDir::new().unwrap();
        let ca = authority(&temp_dir);

        let a = ca.issue_leaf("example.com").await.unwrap();
        let b = ca.issue_leaf("EXAMPLE.com:443").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(ca.cached_leaves(), 1);
    }

    #[tokio::test]
    async fn concurrent_first_use_issues_once() {
        let temp_dir = TempDir::new().unwrap();
        let ca = authority(&temp_dir);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let ca = ca.clone();
                tokio::spawn(async move { ca.issue_leaf("burst.test").await.unwrap() })
            })
            .collect();

        let mut configs = Vec::new();
        for task in tasks {
            configs.push(task.await.unwrap());
        }
        assert!(configs.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[tokio::test]
    async fn cache_evicts_oldest() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path().join("ca"));
        manager.generate_ca().unwrap();
        let ca = CertificateAuthority::from_pem(
            &fs::read_to_string(manager.cert_path()).unwrap(),
            &fs::read_to_string(manager.key_path()).unwrap(),
            2,
        )
        .unwrap();

        let first = ca.issue_leaf("one.test").await.unwrap();
        ca.issue_leaf("two.test").await.unwrap();
        ca.issue_leaf("three.test").await.unwrap();
        assert_eq!(ca.cached_leaves(), 2);

        let again = ca.issue_leaf("one.test").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &again));
    }

    #[tokio::test]
    async fn ip_hosts_get_leaves() {
        let temp_dir = TempDir::new().unwrap();
        let ca = authority(&temp_dir);

        let leaf = ca.issue_leaf("127.0.0.1").await.unwrap();
        handshake(ca.root_certificate_der(), leaf, "127.0.0.1").unwrap();
    }

    #[tokio::test]
    async fn invalid_host_fails_issuance() {
        let temp_dir = TempDir::new().unwrap();
        let ca = authority(&temp_dir);

        let err = ca.issue_leaf("exämple.com").await.unwrap_err();
        assert!(matches!(err, CaManagerError::Issuance { .. }));

        let err = ca.issue_leaf("bad!host.test").await.unwrap_err();
        assert!(matches!(err, CaManagerError::Issuance { ref host, .. } if host == "bad!host.test"));
    }

    #[test]
    fn leaf_host_normalization() {
        assert_eq!(leaf_host("Example.COM:8443"), "example.com");
        assert_eq!(leaf_host("[::1]:443"), "::1");
        assert_eq!(leaf_host("host.test."), "host.test");
    }
}
