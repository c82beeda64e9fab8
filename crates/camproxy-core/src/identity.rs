//! Device identity: the client key pair and self-signed certificate the NVR
//! pins the camera to.
//!
//! The artifact is a single PEM file holding the private key followed by the
//! certificate. It is generated on first run and never rewritten. A file
//! holding only one half is reported as corrupt and left alone for the
//! operator to delete.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Datelike;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use rustls_pemfile::Item;
use secrecy::SecretString;
use tracing::{debug, info};

use crate::error::CoreError;
use crate::model::MacAddress;

/// Certificate validity, in years.
const VALIDITY_YEARS: i32 = 100;

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// PKCS#9 emailAddress attribute.
const OID_EMAIL_ADDRESS: &[u64] = &[1, 2, 840, 113_549, 1, 9, 1];

/// Loaded key + certificate, exactly as persisted.
#[derive(Clone)]
pub struct IdentityMaterial {
    path: PathBuf,
    pem: Arc<[u8]>,
}

impl std::fmt::Debug for IdentityMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityMaterial")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl IdentityMaterial {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pem(&self) -> &[u8] {
        &self.pem
    }

    /// rustls client config presenting this identity.
    pub fn tls_config(&self) -> Result<Arc<rustls::ClientConfig>, CoreError> {
        camproxy_api::transport::mtls_client_config(&self.pem).map_err(|e| {
            CoreError::IdentityCorrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            }
        })
    }
}

/// Everything the NVR knows the camera by.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub material: IdentityMaterial,
    pub adoption_token: SecretString,
    pub mac: MacAddress,
    pub model: String,
    pub name: String,
}

/// Owns the identity artifact on disk.
#[derive(Debug, Clone)]
pub struct IdentityManager {
    path: PathBuf,
}

impl IdentityManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the artifact, generating it first if it does not exist.
    ///
    /// Idempotent: once the file exists its bytes are never touched again.
    /// Concurrent callers racing on the same path converge on whichever
    /// artifact was linked into place first.
    pub fn ensure_identity(&self) -> Result<IdentityMaterial, CoreError> {
        match fs::read(&self.path) {
            Ok(bytes) => return self.validate(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(CoreError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        }

        info!(path = %self.path.display(), "generating device identity");
        let pem = generate_pem()?;
        self.install(&pem)?;

        // Re-read: another instance may have won the race.
        let bytes = fs::read(&self.path).map_err(|source| CoreError::Io {
            path: self.path.clone(),
            source,
        })?;
        self.validate(bytes)
    }

    /// Write `pem` to a private temp file, then hard-link it into place.
    /// The link fails if the target exists, so a complete artifact is never
    /// replaced and a partially-written one is never visible.
    fn install(&self, pem: &[u8]) -> Result<(), CoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }

        let tmp = self.temp_path();
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let written = options
            .open(&tmp)
            .and_then(|mut file| {
                file.write_all(pem)?;
                file.sync_all()
            })
            .map_err(io_err(&tmp));

        let linked = written.and_then(|()| match fs::hard_link(&tmp, &self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                debug!(path = %self.path.display(), "identity created concurrently, keeping existing");
                Ok(())
            }
            Err(source) => Err(CoreError::Io {
                path: self.path.clone(),
                source,
            }),
        });

        let _ = fs::remove_file(&tmp);
        linked
    }

    fn temp_path(&self) -> PathBuf {
        let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let mut name = self
            .path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        name.push(format!(".tmp-{}-{seq}", std::process::id()));
        self.path.with_file_name(name)
    }

    fn validate(&self, bytes: Vec<u8>) -> Result<IdentityMaterial, CoreError> {
        let corrupt = |reason: &str| CoreError::IdentityCorrupt {
            path: self.path.clone(),
            reason: reason.into(),
        };

        let (mut keys, mut certs) = (0usize, 0usize);
        for item in rustls_pemfile::read_all(&mut bytes.as_slice()) {
            match item.map_err(|e| corrupt(&format!("unreadable PEM: {e}")))? {
                Item::X509Certificate(_) => certs += 1,
                Item::Pkcs1Key(_) | Item::Pkcs8Key(_) | Item::Sec1Key(_) => keys += 1,
                _ => {}
            }
        }

        match (keys, certs) {
            (0, 0) => Err(corrupt("no key or certificate found")),
            (0, _) => Err(corrupt("certificate present but private key missing")),
            (_, 0) => Err(corrupt("private key present but certificate missing")),
            _ => {
                debug!(path = %self.path.display(), "device identity loaded");
                Ok(IdentityMaterial {
                    path: self.path.clone(),
                    pem: bytes.into(),
                })
            }
        }
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> CoreError + use<> {
    let path = path.to_path_buf();
    move |source| CoreError::Io { path, source }
}

/// Fresh P-256 key and a long-lived self-signed certificate, as
/// `key PEM || cert PEM`.
fn generate_pem() -> Result<Vec<u8>, CoreError> {
    let internal = |e: rcgen::Error| CoreError::Internal(format!("certificate generation: {e}"));

    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).map_err(internal)?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CountryName, "TW");
    dn.push(DnType::LocalityName, "Taipei");
    dn.push(DnType::OrganizationName, "Ubiquiti Networks Inc.");
    dn.push(DnType::OrganizationalUnitName, "devint");
    dn.push(DnType::CommonName, "camera.ubnt.dev");
    dn.push(
        DnType::CustomDnType(OID_EMAIL_ADDRESS.to_vec()),
        "support@ubnt.com",
    );

    let year = chrono::Utc::now().year();
    let mut params = CertificateParams::default();
    params.distinguished_name = dn;
    params.not_before = rcgen::date_time_ymd(year - 1, 1, 1);
    params.not_after = rcgen::date_time_ymd(year + VALIDITY_YEARS, 1, 1);

    let cert = params.self_signed(&key_pair).map_err(internal)?;

    let mut pem = key_pair.serialize_pem().into_bytes();
    pem.extend_from_slice(cert.pem().as_bytes());
    Ok(pem)
}
