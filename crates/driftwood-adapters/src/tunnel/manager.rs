use super::client::{Connector, Transport, TunnelClientConfig, WispConnector, USER_AGENT};
use super::message::{Request, Response};
use crate::engine::{EngineLoader, TlsEngine};
use crate::error::{ErrorKind, TunnelError};
use crate::settings::SharedSettings;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tracing::{info, warn};

pub(crate) const MAX_RETRIES: u32 = 4;
pub(crate) const INITIAL_BACKOFF_MS: u64 = 200;

/// How often a throttled request is reissued and how long to wait between
/// attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            base_delay: Duration::from_millis(INITIAL_BACKOFF_MS),
        }
    }
}

impl RetryPolicy {
    /// Retry without sleeping.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (zero-based): `base * 2^retry`.
    pub fn delay(&self, retry: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(retry.min(16)))
    }
}

/// The fetch entry point.
///
/// Lazily loads the TLS engine once, keeps a client bound to the configured
/// Wisp server (rebuilding it when the setting changes) and reissues
/// throttled requests over a fresh connection.
pub struct TunnelManager {
    settings: SharedSettings,
    loader: EngineLoader,
    connector: Arc<dyn Connector>,
    retry: RetryPolicy,
    engine: OnceCell<Arc<TlsEngine>>,
    client: Mutex<Option<Arc<dyn Transport>>>,
}

impl TunnelManager {
    pub fn new(settings: SharedSettings, loader: EngineLoader) -> Self {
        Self {
            settings,
            loader,
            connector: Arc::new(WispConnector),
            retry: RetryPolicy::default(),
            engine: OnceCell::new(),
            client: Mutex::new(None),
        }
    }

    /// Manager over the user cache directory and the real network.
    pub fn standard(settings: SharedSettings) -> anyhow::Result<Self> {
        let loader = EngineLoader::standard(settings.clone(), USER_AGENT)?;
        Ok(Self::new(settings, loader))
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn settings(&self) -> &SharedSettings {
        &self.settings
    }

    /// Load the engine on first use. Concurrent callers wait for the same
    /// load; a failed load is attempted again by the next caller.
    pub async fn engine(&self) -> Result<Arc<TlsEngine>, TunnelError> {
        self.engine
            .get_or_try_init(|| async {
                self.loader
                    .load()
                    .await
                    .map(Arc::new)
                    .map_err(TunnelError::engine)
            })
            .await
            .cloned()
    }

    /// Client for the currently configured Wisp server.
    pub async fn client(&self) -> Result<Arc<dyn Transport>, TunnelError> {
        let engine = self.engine().await?;
        let wisp_url = self.settings.wisp_server();

        let mut current = self.client.lock().await;
        if let Some(client) = current.as_ref() {
            if client.url() == wisp_url {
                return Ok(client.clone());
            }
            info!(from = client.url(), to = %wisp_url, "wisp server changed, rebuilding client");
        }
        let client = self
            .connector
            .connect(TunnelClientConfig::new(wisp_url), engine)?;
        *current = Some(client.clone());
        Ok(client)
    }

    pub async fn fetch(&self, request: Request) -> Result<Response, TunnelError> {
        let mut retries = 0;
        loop {
            let client = self.client().await?;
            match client.fetch(&request).await {
                Err(err) if err.kind() == ErrorKind::Throttled => {
                    if retries >= self.retry.max_retries {
                        return Err(TunnelError::RetriesExhausted {
                            attempts: retries + 1,
                        });
                    }
                    let delay = self.retry.delay(retries);
                    retries += 1;
                    warn!(
                        attempt = retries,
                        url = %request.url,
                        "throttled by wisp server, retrying on a new connection"
                    );
                    client.replace_stream_provider();
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{CountingSource, TEST_ROOT};
    use crate::engine::{ArtifactCache, ENGINE_CACHE_NAME};
    use crate::settings::Settings;
    use crate::tunnel::BoxFuture;
    use bytes::Bytes;
    use http::{HeaderMap, StatusCode};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedTransport {
        url: String,
        script: std::sync::Mutex<VecDeque<Result<Response, TunnelError>>>,
        calls: AtomicUsize,
        rotations: AtomicUsize,
    }

    impl Transport for ScriptedTransport {
        fn url(&self) -> &str {
            &self.url
        }

        fn fetch<'a>(
            &'a self,
            request: &'a Request,
        ) -> BoxFuture<'a, Result<Response, TunnelError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ok_response(request)));
            Box::pin(async move { next })
        }

        fn replace_stream_provider(&self) {
            self.rotations.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct ScriptedConnector {
        script: std::sync::Mutex<Vec<Result<Response, TunnelError>>>,
        built: std::sync::Mutex<Vec<Arc<ScriptedTransport>>>,
    }

    impl ScriptedConnector {
        fn with_script(script: Vec<Result<Response, TunnelError>>) -> Arc<Self> {
            Arc::new(Self {
                script: std::sync::Mutex::new(script),
                built: Default::default(),
            })
        }

        fn last(&self) -> Arc<ScriptedTransport> {
            self.built.lock().unwrap().last().cloned().unwrap()
        }

        fn built_count(&self) -> usize {
            self.built.lock().unwrap().len()
        }
    }

    impl Connector for ScriptedConnector {
        fn connect(
            &self,
            config: TunnelClientConfig,
            _engine: Arc<TlsEngine>,
        ) -> Result<Arc<dyn Transport>, TunnelError> {
            let script = std::mem::take(&mut *self.script.lock().unwrap());
            let transport = Arc::new(ScriptedTransport {
                url: config.wisp_url,
                script: std::sync::Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
                rotations: AtomicUsize::new(0),
            });
            self.built.lock().unwrap().push(transport.clone());
            Ok(transport)
        }
    }

    fn ok_response(request: &Request) -> Response {
        Response::new(
            StatusCode::OK,
            request.url.clone(),
            HeaderMap::new(),
            Bytes::from_static(b"ok"),
        )
    }

    fn manager(
        root: &std::path::Path,
        connector: Arc<ScriptedConnector>,
    ) -> (TunnelManager, SharedSettings) {
        let settings = SharedSettings::in_memory(Settings::default());
        let loader = EngineLoader::new(
            ArtifactCache::open_in(root, ENGINE_CACHE_NAME),
            Arc::new(CountingSource::new(TEST_ROOT)),
            settings.clone(),
        );
        let manager = TunnelManager::new(settings.clone(), loader)
            .with_connector(connector)
            .with_retry_policy(RetryPolicy::immediate(MAX_RETRIES));
        (manager, settings)
    }

    #[tokio::test]
    async fn test_throttle_then_success_rotates_once() {
        let root = tempfile::tempdir().unwrap();
        let connector = ScriptedConnector::with_script(vec![Err(TunnelError::Throttled)]);
        let (manager, _) = manager(root.path(), connector.clone());

        let response = manager
            .fetch(Request::get("https://example.test/").unwrap())
            .await
            .unwrap();

        assert_eq!(response.text(), "ok");
        let transport = connector.last();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
        assert_eq!(transport.rotations.load(Ordering::SeqCst), 1);
        assert_eq!(connector.built_count(), 1);
    }

    #[tokio::test]
    async fn test_persistent_throttle_exhausts_retries() {
        let root = tempfile::tempdir().unwrap();
        let connector = ScriptedConnector::with_script(
            (0..10).map(|_| Err(TunnelError::Throttled)).collect(),
        );
        let (manager, _) = manager(root.path(), connector.clone());
        let manager = manager.with_retry_policy(RetryPolicy::immediate(2));

        let err = manager
            .fetch(Request::get("https://example.test/").unwrap())
            .await
            .unwrap_err();

        assert!(matches!(err, TunnelError::RetriesExhausted { attempts: 3 }));
        assert_eq!(connector.last().rotations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let root = tempfile::tempdir().unwrap();
        let connector = ScriptedConnector::with_script(vec![Err(TunnelError::Closed(
            crate::wisp::CloseReason::Unreachable,
        ))]);
        let (manager, _) = manager(root.path(), connector.clone());

        let err = manager
            .fetch(Request::get("https://example.test/").unwrap())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(connector.last().calls.load(Ordering::SeqCst), 1);
        assert_eq!(connector.last().rotations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_client_is_rebuilt_when_server_changes() {
        let root = tempfile::tempdir().unwrap();
        let connector = ScriptedConnector::with_script(Vec::new());
        let (manager, settings) = manager(root.path(), connector.clone());

        manager.client().await.unwrap();
        manager.client().await.unwrap();
        assert_eq!(connector.built_count(), 1);

        settings
            .update(|s| s.wisp_server = "wss://other.test/".to_string())
            .unwrap();
        let client = manager.client().await.unwrap();
        assert_eq!(client.url(), "wss://other.test/");
        assert_eq!(connector.built_count(), 2);
    }

    #[tokio::test]
    async fn test_engine_loads_once() {
        let root = tempfile::tempdir().unwrap();
        let settings = SharedSettings::in_memory(Settings::default());
        let source = Arc::new(CountingSource::new(TEST_ROOT));
        let loader = EngineLoader::new(
            ArtifactCache::open_in(root.path(), ENGINE_CACHE_NAME),
            source.clone(),
            settings.clone(),
        );
        let manager = Arc::new(TunnelManager::new(settings, loader));

        let (a, b) = tokio::join!(manager.engine(), manager.engine());
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(200));
        assert_eq!(policy.delay(1), Duration::from_millis(400));
        assert_eq!(policy.delay(3), Duration::from_millis(1600));
        assert_eq!(RetryPolicy::immediate(4).delay(3), Duration::ZERO);
    }
}
