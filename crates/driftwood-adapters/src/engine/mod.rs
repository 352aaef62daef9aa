//! The client-side TLS engine and how its artifact is obtained.
//!
//! The artifact is a PEM bundle of trusted roots. It is fetched directly
//! (never through the tunnel), cached on disk, and evicted whenever the
//! version recorded in settings differs from [`ENGINE_VERSION`].

mod cache;

pub use cache::{ArtifactCache, EntryMeta};

use crate::settings::SharedSettings;
use anyhow::{Context, Result};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Bumped whenever the expected artifact changes.
pub const ENGINE_VERSION: &str = "2025.02.25";
pub const DEFAULT_ARTIFACT_URL: &str = "https://curl.se/ca/cacert.pem";
pub const ENGINE_CACHE_NAME: &str = "epoxy";

const ARTIFACT_TIMEOUT_SECS: u64 = 30;

/// Where engine artifacts come from when the cache misses.
pub trait ArtifactSource: Send + Sync {
    fn fetch<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>>> + Send + 'a>>;
}

/// Fetches artifacts over plain HTTPS.
pub struct HttpArtifactSource {
    client: reqwest::Client,
}

impl HttpArtifactSource {
    pub fn new(user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(ARTIFACT_TIMEOUT_SECS))
            .user_agent(user_agent)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;
        Ok(Self { client })
    }
}

impl ArtifactSource for HttpArtifactSource {
    fn fetch<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>>> + Send + 'a>> {
        Box::pin(async move {
            let response = self
                .client
                .get(key)
                .send()
                .await
                .with_context(|| format!("Failed to download {key}"))?
                .error_for_status()?;
            Ok(response.bytes().await?.to_vec())
        })
    }
}

/// A ready TLS client configuration built from a root bundle.
#[derive(Clone)]
pub struct TlsEngine {
    config: Arc<rustls::ClientConfig>,
    roots: usize,
}

impl std::fmt::Debug for TlsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsEngine")
            .field("roots", &self.roots)
            .finish_non_exhaustive()
    }
}

impl TlsEngine {
    /// Instantiate from PEM bytes. Sections that are not usable trust
    /// anchors are skipped, but at least one root must survive.
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let certs = rustls_pemfile::certs(&mut &pem[..])
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Malformed PEM in engine artifact")?;
        if certs.is_empty() {
            anyhow::bail!("Engine artifact contains no certificates");
        }

        let mut store = rustls::RootCertStore::empty();
        let (added, ignored) = store.add_parsable_certificates(certs);
        debug!(added, ignored, "loaded TLS roots");
        if added == 0 {
            anyhow::bail!("Engine artifact contains no usable certificates ({ignored} rejected)");
        }

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .context("TLS provider rejected default protocol versions")?
            .with_root_certificates(store)
            .with_no_client_auth();

        Ok(Self {
            config: Arc::new(config),
            roots: added,
        })
    }

    pub fn client_config(&self) -> Arc<rustls::ClientConfig> {
        self.config.clone()
    }

    pub fn connector(&self) -> tokio_rustls::TlsConnector {
        tokio_rustls::TlsConnector::from(self.config.clone())
    }

    pub fn root_count(&self) -> usize {
        self.roots
    }
}

/// Produces a [`TlsEngine`], going to the network only on a cache miss.
pub struct EngineLoader {
    cache: ArtifactCache,
    source: Arc<dyn ArtifactSource>,
    settings: SharedSettings,
    artifact_key: String,
}

impl EngineLoader {
    pub fn new(
        cache: ArtifactCache,
        source: Arc<dyn ArtifactSource>,
        settings: SharedSettings,
    ) -> Self {
        Self {
            cache,
            source,
            settings,
            artifact_key: DEFAULT_ARTIFACT_URL.to_string(),
        }
    }

    /// Loader over the user cache directory and the real network.
    pub fn standard(settings: SharedSettings, user_agent: &str) -> Result<Self> {
        Ok(Self::new(
            ArtifactCache::open(ENGINE_CACHE_NAME)?,
            Arc::new(HttpArtifactSource::new(user_agent)?),
            settings,
        ))
    }

    pub fn with_artifact_key(mut self, key: impl Into<String>) -> Self {
        self.artifact_key = key.into();
        self
    }

    pub async fn load(&self) -> Result<TlsEngine> {
        let key = self.artifact_key.as_str();
        let stored_version = self.settings.engine_version();
        let outdated = stored_version != ENGINE_VERSION;

        if outdated && self.with_cache(key, |cache, key| cache.delete(key)).await? {
            info!(
                evicted = %stored_version,
                current = ENGINE_VERSION,
                "evicted outdated engine artifact"
            );
        }

        let bytes = match self.with_cache(key, |cache, key| cache.lookup(key)).await? {
            Some(bytes) => bytes,
            None => {
                debug!(key, "engine artifact not cached, downloading");
                let bytes = self
                    .source
                    .fetch(key)
                    .await
                    .context("Failed to fetch engine artifact")?;
                let payload = bytes.clone();
                self.with_cache(key, move |cache, key| cache.put(key, &payload))
                    .await?;
                bytes
            }
        };

        let engine = match TlsEngine::from_pem(&bytes) {
            Ok(engine) => engine,
            Err(err) => {
                let _ = self.with_cache(key, |cache, key| cache.delete(key)).await;
                return Err(err);
            }
        };

        if outdated {
            self.settings
                .update(|s| s.engine_version = ENGINE_VERSION.to_string())?;
        }
        Ok(engine)
    }

    /// Run a cache operation on the blocking pool; the cache lock may sleep.
    async fn with_cache<T, F>(&self, key: &str, op: F) -> Result<T>
    where
        F: FnOnce(&ArtifactCache, &str) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let cache = self.cache.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || op(&cache, &key))
            .await
            .context("Engine cache task failed")?
    }
}
