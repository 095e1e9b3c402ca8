//! Per-host leaf certificate cache.
//!
//! Leaves are stored under `<dir>/<stem>_cert.pem` and `<dir>/<stem>_key.pem`
//! so they survive restarts. In memory, each host maps to one shared
//! [`KeyPair`]. Loading or generating a leaf runs in its own task that owns
//! the cache lock until the leaf is inserted. Concurrent lookups wait for it,
//! and a caller that gives up mid-generation does not release the lock early.

use super::error::InterceptError;
use crate::cert::{get_or_generate_key_pair, CertError, KeyPair};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Organization written into generated leaf certificates.
pub const LEAF_ORGANIZATION: &str = "Waypost";

/// Cache of leaf key pairs signed by one CA.
pub struct HostCertCache {
    ca: Arc<KeyPair>,
    dir: PathBuf,
    entries: Arc<Mutex<HashMap<String, Arc<KeyPair>>>>,
    loads: Arc<AtomicUsize>,
}

impl HostCertCache {
    /// Create an empty cache storing leaves in `dir`, signed by `ca`.
    pub fn new(ca: Arc<KeyPair>, dir: impl Into<PathBuf>) -> Self {
        Self {
            ca,
            dir: dir.into(),
            entries: Arc::new(Mutex::new(HashMap::new())),
            loads: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Leaf key pair for `common_name`, loading or generating it on a miss.
    ///
    /// Host names are compared case-insensitively.
    ///
    /// # Errors
    ///
    /// Returns [`InterceptError::HostKeyPair`] if the leaf cannot be loaded
    /// or generated. Nothing is cached in that case.
    pub async fn get(&self, common_name: &str) -> Result<Arc<KeyPair>, InterceptError> {
        let host = common_name.to_ascii_lowercase();
        let mut entries = self.entries.clone().lock_owned().await;

        if let Some(key_pair) = entries.get(&host) {
            return Ok(key_pair.clone());
        }

        let stem = file_stem(&host);
        let cert_path = self.dir.join(format!("{}_cert.pem", stem));
        let key_path = self.dir.join(format!("{}_key.pem", stem));
        let ca = self.ca.clone();
        let loads = self.loads.clone();
        let name = host.clone();

        let loading = tokio::spawn(async move {
            debug!("Loading certificate for {} from {:?}", name, cert_path);
            let common_name = name.clone();
            let key_pair = tokio::task::spawn_blocking(move || {
                get_or_generate_key_pair(
                    &cert_path,
                    &key_path,
                    &common_name,
                    LEAF_ORGANIZATION,
                    false,
                    Some(&ca),
                )
            })
            .await
            .map_err(|e| CertError::KeyGeneration(e.to_string()))
            .and_then(|result| result)
            .map_err(|source| InterceptError::HostKeyPair {
                host: name.clone(),
                source,
            })?;

            loads.fetch_add(1, Ordering::SeqCst);
            let key_pair = Arc::new(key_pair);
            entries.insert(name, key_pair.clone());
            Ok::<_, InterceptError>(key_pair)
        });

        loading.await.map_err(|e| InterceptError::HostKeyPair {
            host,
            source: CertError::KeyGeneration(e.to_string()),
        })?
    }

    /// Number of cached hosts.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether the cache is empty.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Number of times a leaf has been loaded from disk or generated.
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for HostCertCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostCertCache")
            .field("dir", &self.dir)
            .field("loads", &self.loads())
            .finish_non_exhaustive()
    }
}

/// File name prefix for a host, safe to join onto the cache directory.
///
/// Lowercase letters, digits, `.` and `-` are kept. Every other byte becomes
/// `_` followed by two hex digits, so distinct hosts never share a stem.
fn file_stem(host: &str) -> String {
    let mut stem = String::with_capacity(host.len());
    for byte in host.bytes() {
        match byte {
            b'a'..=b'z' | b'0'..=b'9' | b'.' | b'-' => stem.push(byte as char),
            _ => stem.push_str(&format!("_{:02x}", byte)),
        }
    }
    stem
}
