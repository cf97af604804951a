//! On-disk layout of the shared certificate bundle and TLS loading for workers.
//!
//! The supervisor writes the bundle once per run; TLS workers are separate
//! processes and pick it up read-only from the same directory.

use std::{
    fs,
    io::Write,
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::anyhow;
use rustls::pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer};
use tracing::info;

use super::issuer::CertificateBundle;
use crate::errors::TlsError;

/// Paths of every file in a certificate store directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertStore {
    pub dir: PathBuf,
    pub domain_file: PathBuf,
    pub tls_cert_file: PathBuf,
    pub tls_key_file: PathBuf,
    pub root_ca_file: PathBuf,
    pub root_ca_key_file: PathBuf,
}

impl CertStore {
    /// Describe the store rooted at `dir` without touching the filesystem
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            domain_file: dir.join("domain.pem"),
            tls_cert_file: dir.join("tls.crt"),
            tls_key_file: dir.join("tls.key"),
            root_ca_file: dir.join("rootCA.pem"),
            root_ca_key_file: dir.join("rootCA.key"),
            dir,
        }
    }

    /// Replace whatever is at `dir` with the files of `bundle`
    pub fn write(dir: impl Into<PathBuf>, bundle: &CertificateBundle) -> Result<Self, TlsError> {
        let store = Self::at(dir);

        if store.dir.exists() {
            fs::remove_dir_all(&store.dir)
                .map_err(|e| TlsError::WriteError { path: store.dir.clone(), source: e })?;
        }
        fs::create_dir_all(&store.dir)
            .map_err(|e| TlsError::WriteError { path: store.dir.clone(), source: e })?;

        write_file(&store.domain_file, &bundle.leaf_cert_pem, 0o644)?;
        write_file(&store.tls_cert_file, &bundle.leaf_cert_pem, 0o644)?;
        write_file(&store.tls_key_file, &bundle.leaf_key_pem, 0o600)?;
        write_file(&store.root_ca_file, &bundle.root_ca_cert_pem, 0o644)?;
        write_file(&store.root_ca_key_file, &bundle.root_ca_key_pem, 0o600)?;

        info!(path = %store.dir.display(), "Wrote certificate store");
        Ok(store)
    }

    /// Build a rustls server config from the leaf certificate and key
    pub fn load_server_config(&self) -> Result<Arc<rustls::ServerConfig>, TlsError> {
        let cert_bytes = fs::read(&self.domain_file).map_err(|e| TlsError::CertificateReadError {
            path: self.domain_file.clone(),
            source: e,
        })?;
        let key_bytes = fs::read(&self.tls_key_file).map_err(|e| TlsError::PrivateKeyReadError {
            path: self.tls_key_file.clone(),
            source: e,
        })?;

        server_config_from_pem(&cert_bytes, &self.domain_file, &key_bytes, &self.tls_key_file)
    }
}

fn write_file(path: &Path, contents: &str, mode: u32) -> Result<(), TlsError> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)
        .map_err(|e| TlsError::WriteError { path: path.to_path_buf(), source: e })?;
    file.write_all(contents.as_bytes())
        .map_err(|e| TlsError::WriteError { path: path.to_path_buf(), source: e })
}

/// Parse PEM material into a TLS server configuration using the ring provider.
///
/// `cert_path` and `key_path` only label errors.
pub fn server_config_from_pem(
    cert_pem: &[u8],
    cert_path: &Path,
    key_pem: &[u8],
    key_path: &Path,
) -> Result<Arc<rustls::ServerConfig>, TlsError> {
    let chain: Vec<CertificateDer<'static>> = CertificateDer::pem_slice_iter(cert_pem)
        .map(|result| {
            result.map_err(|err| TlsError::InvalidCertificatePem {
                path: cert_path.to_path_buf(),
                source: anyhow!(err),
            })
        })
        .collect::<Result<_, _>>()?;

    if chain.is_empty() {
        return Err(TlsError::EmptyCertificateChain { path: cert_path.to_path_buf() });
    }

    let private_key = PrivateKeyDer::from_pem_slice(key_pem).map_err(|err| {
        TlsError::InvalidPrivateKey { path: key_path.to_path_buf(), source: Some(anyhow!(err)) }
    })?;

    let provider = rustls::crypto::ring::default_provider();
    let config = rustls::ServerConfig::builder_with_provider(provider.into())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(chain, private_key)?;

    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certs::issue;
    use time::{Duration, OffsetDateTime};

    fn bundle() -> CertificateBundle {
        let now = OffsetDateTime::now_utc();
        issue(now, now + Duration::days(1), ["localhost"]).expect("issue")
    }

    #[test]
    fn write_lays_out_every_file() {
        let tmp = tempfile::tempdir().unwrap();
        let bundle = bundle();
        let store = CertStore::write(tmp.path().join("certs"), &bundle).unwrap();

        assert_eq!(fs::read_to_string(&store.domain_file).unwrap(), bundle.leaf_cert_pem);
        assert_eq!(fs::read_to_string(&store.tls_cert_file).unwrap(), bundle.leaf_cert_pem);
        assert_eq!(fs::read_to_string(&store.tls_key_file).unwrap(), bundle.leaf_key_pem);
        assert_eq!(fs::read_to_string(&store.root_ca_file).unwrap(), bundle.root_ca_cert_pem);
        assert_eq!(fs::read_to_string(&store.root_ca_key_file).unwrap(), bundle.root_ca_key_pem);

        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(&store.tls_key_file).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn write_replaces_stale_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("certs");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("stale.pem"), "old").unwrap();

        CertStore::write(&dir, &bundle()).unwrap();
        assert!(!dir.join("stale.pem").exists());
    }

    #[test]
    fn server_config_loads_from_store() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CertStore::write(tmp.path().join("certs"), &bundle()).unwrap();
        assert!(store.load_server_config().is_ok());
    }

    #[test]
    fn missing_store_reports_certificate_path() {
        let store = CertStore::at("/nonexistent/hydra/certs");
        let err = store.load_server_config().unwrap_err();
        assert!(matches!(err, TlsError::CertificateReadError { .. }));
        assert!(err.to_string().contains("domain.pem"));
    }

    #[test]
    fn empty_certificate_pem_is_rejected() {
        let b = bundle();
        let err = server_config_from_pem(
            b"",
            Path::new("domain.pem"),
            b.leaf_key_pem.as_bytes(),
            Path::new("tls.key"),
        )
        .unwrap_err();
        assert!(matches!(err, TlsError::EmptyCertificateChain { .. }));
    }
}
