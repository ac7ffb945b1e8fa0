//! Firmware manifest, its cache and the sources images are fetched from.
//!
//! ```json
//! {
//!   "version": "2.2.0",
//!   "assets": { "ROLE_SENDER_NODE": "https://.../sender.bin", ... },
//!   "sha256": { "ROLE_SENDER_NODE": "9f86d08...", ... }
//! }
//! ```
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::time::timeout;

use crate::errors::{QuakeError, QuakeResult};

/// Manifest cache validity window.
pub const MANIFEST_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    #[serde(default)]
    pub assets: BTreeMap<String, String>,
    #[serde(default)]
    pub sha256: BTreeMap<String, String>,
}

impl Manifest {
    pub fn asset_for(&self, role_key: &str) -> Option<&str> {
        self.assets
            .get(role_key)
            .map(String::as_str)
            .filter(|u| !u.is_empty())
    }

    pub fn digest_for(&self, role_key: &str) -> Option<&str> {
        self.sha256
            .get(role_key)
            .map(String::as_str)
            .filter(|d| !d.is_empty())
    }
}

/// Singleton manifest cache owned by the distributor.
#[derive(Debug)]
pub struct ManifestCache {
    manifest: Option<Manifest>,
    fetched_at: Option<Instant>,
    ttl: Duration,
}

impl Default for ManifestCache {
    fn default() -> Self {
        Self::new(MANIFEST_TTL)
    }
}

impl ManifestCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            manifest: None,
            fetched_at: None,
            ttl,
        }
    }

    pub fn is_valid(&self, now: Instant) -> bool {
        match (self.manifest.as_ref(), self.fetched_at) {
            (Some(_), Some(at)) => now.saturating_duration_since(at) < self.ttl,
            _ => false,
        }
    }

    /// Cached manifest if still inside the validity window.
    pub fn get(&self, now: Instant) -> Option<&Manifest> {
        if self.is_valid(now) {
            self.manifest.as_ref()
        } else {
            None
        }
    }

    /// Last fetched manifest regardless of age (management display).
    pub fn last(&self) -> Option<&Manifest> {
        self.manifest.as_ref()
    }

    pub fn age(&self, now: Instant) -> Option<Duration> {
        self.fetched_at.map(|at| now.saturating_duration_since(at))
    }

    pub fn store(&mut self, manifest: Manifest, now: Instant) {
        self.manifest = Some(manifest);
        self.fetched_at = Some(now);
    }

    pub fn invalidate(&mut self) {
        self.fetched_at = None;
    }
}

/// Hex SHA-256 of an image.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Verify `image` against a reference digest. The reference must be exactly
/// 64 hex characters; comparison is case-insensitive. Returns the computed
/// digest on success.
pub fn verify_digest(image: &[u8], expected: &str) -> QuakeResult<String> {
    let computed = sha256_hex(image);
    let expected = expected.trim();
    let well_formed = expected.len() == 64 && expected.chars().all(|c| c.is_ascii_hexdigit());
    if !well_formed || !expected.eq_ignore_ascii_case(&computed) {
        return Err(QuakeError::DigestMismatch {
            expected: expected.to_string(),
            computed,
        });
    }
    Ok(computed)
}

/// Where manifests and firmware images come from.
pub trait FirmwareSource: Send {
    fn fetch_manifest(&self) -> impl Future<Output = QuakeResult<Manifest>> + Send;
    fn fetch_firmware(&self, url: &str) -> impl Future<Output = QuakeResult<Vec<u8>>> + Send;
}

/// HTTP source. Both calls are bounded by a timeout so the gateway loop never
/// stalls longer than that.
pub struct HttpFirmwareSource {
    client: reqwest::Client,
    manifest_url: String,
    manifest_timeout: Duration,
    firmware_timeout: Duration,
}

impl HttpFirmwareSource {
    pub fn new(manifest_url: impl Into<String>, manifest_timeout: Duration, firmware_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            manifest_url: manifest_url.into(),
            manifest_timeout,
            firmware_timeout,
        }
    }
}

impl FirmwareSource for HttpFirmwareSource {
    async fn fetch_manifest(&self) -> QuakeResult<Manifest> {
        debug!("Fetching manifest from: {}", self.manifest_url);
        let request = self.client.get(&self.manifest_url).send();
        let response = timeout(self.manifest_timeout, request)
            .await
            .map_err(|_| {
                QuakeError::Manifest(format!(
                    "request timeout after {}s",
                    self.manifest_timeout.as_secs()
                ))
            })??;
        if !response.status().is_success() {
            return Err(QuakeError::Manifest(format!(
                "server returned status {}",
                response.status()
            )));
        }
        let body = timeout(self.manifest_timeout, response.text())
            .await
            .map_err(|_| QuakeError::Manifest("body read timeout".into()))??;
        let manifest: Manifest = serde_json::from_str(&body)
            .map_err(|e| QuakeError::Manifest(format!("failed to parse manifest: {e}")))?;
        if manifest.version.trim().is_empty() {
            return Err(QuakeError::Manifest("manifest has no version".into()));
        }
        info!(
            "Manifest fetched: version {} ({} assets)",
            manifest.version,
            manifest.assets.len()
        );
        Ok(manifest)
    }

    async fn fetch_firmware(&self, url: &str) -> QuakeResult<Vec<u8>> {
        debug!("Downloading firmware from: {}", url);
        let download = async {
            let response = self.client.get(url).send().await?;
            if !response.status().is_success() {
                return Err(QuakeError::Download(format!(
                    "server returned status {}",
                    response.status()
                )));
            }
            Ok::<Vec<u8>, QuakeError>(response.bytes().await?.to_vec())
        };
        let image = timeout(self.firmware_timeout, download).await.map_err(|_| {
            QuakeError::Download(format!(
                "timeout after {}s",
                self.firmware_timeout.as_secs()
            ))
        })??;
        if image.is_empty() {
            return Err(QuakeError::Download("empty image".into()));
        }
        info!("Firmware downloaded: {} bytes", image.len());
        Ok(image)
    }
}

/// Fixed manifest and in-memory images, keyed by asset URL. Used by the
/// `simulate` command and tests; counts manifest fetches.
#[derive(Clone, Default)]
pub struct StaticFirmwareSource {
    manifest: Manifest,
    images: HashMap<String, Vec<u8>>,
    manifest_fetches: Arc<AtomicUsize>,
}

impl StaticFirmwareSource {
    pub fn new(manifest: Manifest) -> Self {
        Self {
            manifest,
            ..Default::default()
        }
    }

    /// Single-role source; the manifest digest is computed from `image`.
    pub fn single(version: &str, role_key: &str, image: Vec<u8>) -> Self {
        let url = format!("mem://{role_key}/{version}");
        let mut manifest = Manifest {
            version: version.to_string(),
            ..Default::default()
        };
        manifest.assets.insert(role_key.to_string(), url.clone());
        manifest
            .sha256
            .insert(role_key.to_string(), sha256_hex(&image));
        let mut src = Self::new(manifest);
        src.images.insert(url, image);
        src
    }

    pub fn with_image(mut self, url: impl Into<String>, image: Vec<u8>) -> Self {
        self.images.insert(url.into(), image);
        self
    }

    pub fn manifest_mut(&mut self) -> &mut Manifest {
        &mut self.manifest
    }

    pub fn manifest_fetches(&self) -> usize {
        self.manifest_fetches.load(Ordering::Relaxed)
    }
}

impl FirmwareSource for StaticFirmwareSource {
    async fn fetch_manifest(&self) -> QuakeResult<Manifest> {
        self.manifest_fetches.fetch_add(1, Ordering::Relaxed);
        Ok(self.manifest.clone())
    }

    async fn fetch_firmware(&self, url: &str) -> QuakeResult<Vec<u8>> {
        self.images
            .get(url)
            .cloned()
            .filter(|img| !img.is_empty())
            .ok_or_else(|| QuakeError::Download(format!("no image at {url}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_case_insensitive_and_strict_length() {
        let img = b"firmware";
        let hex = sha256_hex(img);
        assert_eq!(hex.len(), 64);
        assert!(verify_digest(img, &hex.to_uppercase()).is_ok());
        assert!(matches!(
            verify_digest(img, &hex[..63]),
            Err(QuakeError::DigestMismatch { .. })
        ));
        let mut other = hex.clone();
        other.replace_range(0..1, if hex.starts_with('0') { "1" } else { "0" });
        assert!(verify_digest(img, &other).is_err());
    }

    #[test]
    fn cache_expires_and_invalidates() {
        let mut cache = ManifestCache::new(Duration::from_secs(300));
        let t0 = Instant::now();
        assert!(cache.get(t0).is_none());
        cache.store(
            Manifest {
                version: "1.0.0".into(),
                ..Default::default()
            },
            t0,
        );
        assert!(cache.get(t0 + Duration::from_secs(299)).is_some());
        assert!(cache.get(t0 + Duration::from_secs(300)).is_none());
        cache.store(cache.last().cloned().unwrap(), t0);
        cache.invalidate();
        assert!(cache.get(t0).is_none());
        assert_eq!(cache.last().map(|m| m.version.as_str()), Some("1.0.0"));
    }

    #[test]
    fn manifest_parses_with_missing_maps() {
        let m: Manifest = serde_json::from_str(r#"{"version":"2.2.0"}"#).unwrap();
        assert!(m.asset_for("ROLE_SENDER_NODE").is_none());
        assert!(m.digest_for("ROLE_SENDER_NODE").is_none());
    }

    #[tokio::test]
    async fn static_source_serves_images() {
        let src = StaticFirmwareSource::single("2.2.0", "ROLE_SENDER_NODE", vec![1, 2, 3]);
        let m = src.fetch_manifest().await.unwrap();
        let url = m.asset_for("ROLE_SENDER_NODE").unwrap().to_string();
        assert_eq!(src.fetch_firmware(&url).await.unwrap(), vec![1, 2, 3]);
        assert!(src.fetch_firmware("mem://nope").await.is_err());
        assert_eq!(src.manifest_fetches(), 1);
    }
}
