//! Suggestion source: connects to a code-assistant feed and pushes each
//! suggestion to registered observers.
//!
//! The feed itself is a [`SuggestionFeed`] capability. [`HttpSuggestionFeed`]
//! polls a JSON endpoint; [`MemoryFeed`] is an in-process queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CopilotConfig;
use crate::error::{Result, SpeakerError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionContext {
    pub file_name: String,
    pub line_number: u32,
    pub column_number: u32,
}

/// A unit of text proposed by the code assistant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Suggestion {
    pub text: String,
    /// In `[0, 1]`.
    pub confidence: f32,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub context: Option<SuggestionContext>,
}

/// External suggestion-producing capability.
#[async_trait]
pub trait SuggestionFeed: Send + Sync {
    /// Connection handshake.
    async fn connect(&self, config: &CopilotConfig) -> std::result::Result<(), String>;

    /// Suggestions available right now.
    async fn fetch(&self) -> std::result::Result<Vec<Suggestion>, String>;
}

#[async_trait]
pub trait SuggestionObserver: Send + Sync {
    async fn on_suggestion(&self, suggestion: &Suggestion) -> anyhow::Result<()>;
}

/// Handle returned by [`SuggestionSource::on_suggestion`], used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type ObserverList = Vec<(ObserverId, Arc<dyn SuggestionObserver>)>;

#[derive(Default)]
struct ObserverRegistry {
    next_id: u64,
    observers: ObserverList,
}

impl ObserverRegistry {
    fn add(&mut self, observer: Arc<dyn SuggestionObserver>) -> ObserverId {
        let id = ObserverId(self.next_id);
        self.next_id += 1;
        self.observers.push((id, observer));
        id
    }

    fn remove(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(existing, _)| *existing != id);
        self.observers.len() != before
    }
}

/// Deliver one suggestion to every observer in registration order.
async fn notify_all(observers: &ObserverList, suggestion: &Suggestion) {
    for (id, observer) in observers {
        if let Err(e) = observer.on_suggestion(suggestion).await {
            warn!("Suggestion observer {id:?} failed: {e:#}");
        }
    }
}

struct Listener {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct SuggestionSource {
    feed: Arc<dyn SuggestionFeed>,
    config: Mutex<CopilotConfig>,
    connected: AtomicBool,
    observers: Arc<Mutex<ObserverRegistry>>,
    listener: Mutex<Option<Listener>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl SuggestionSource {
    pub fn new(feed: Arc<dyn SuggestionFeed>) -> Self {
        Self {
            feed,
            config: Mutex::new(CopilotConfig::default()),
            connected: AtomicBool::new(false),
            observers: Arc::new(Mutex::new(ObserverRegistry::default())),
            listener: Mutex::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn is_listening(&self) -> bool {
        lock(&self.listener)
            .as_ref()
            .is_some_and(|listener| !listener.handle.is_finished())
    }

    /// Store `config` and run the feed handshake when enabled.
    ///
    /// A disabled config always leaves the source disconnected.
    pub async fn initialize(&self, config: &CopilotConfig) -> Result<()> {
        *lock(&self.config) = config.clone();

        if !config.enabled {
            self.connected.store(false, Ordering::Relaxed);
            self.stop_listening();
            info!("Suggestion source disabled");
            return Ok(());
        }

        match self.feed.connect(config).await {
            Ok(()) => {
                self.connected.store(true, Ordering::Relaxed);
                info!("Suggestion source connected");
                Ok(())
            }
            Err(e) => {
                self.connected.store(false, Ordering::Relaxed);
                self.stop_listening();
                warn!("Suggestion source connection failed: {e}");
                Err(SpeakerError::Connection(e))
            }
        }
    }

    /// Start the delivery loop. Already listening is a no-op.
    pub fn start_listening(&self) -> Result<()> {
        if !self.is_connected() {
            return Err(SpeakerError::NotInitialized);
        }

        let mut listener = lock(&self.listener);
        if listener
            .as_ref()
            .is_some_and(|existing| !existing.handle.is_finished())
        {
            debug!("Suggestion source already listening");
            return Ok(());
        }

        let config = lock(&self.config).clone();
        let token = CancellationToken::new();
        let handle = tokio::spawn(listen_loop(
            self.feed.clone(),
            self.observers.clone(),
            token.clone(),
            Duration::from_millis(config.poll_interval_ms.max(1)),
            config.dedupe,
        ));
        *listener = Some(Listener {
            token,
            handle,
        });
        info!(
            "Listening for suggestions (every {}ms, dedupe={})",
            config.poll_interval_ms, config.dedupe
        );
        Ok(())
    }

    /// Stop producing suggestions. An observer already running finishes.
    pub fn stop_listening(&self) {
        if let Some(listener) = lock(&self.listener).take() {
            listener.token.cancel();
            info!("Stopped listening for suggestions");
        }
    }

    /// Point-in-time pull from the feed. Empty while disconnected.
    pub async fn get_suggestions(&self) -> Vec<Suggestion> {
        if !self.is_connected() {
            return Vec::new();
        }
        match self.feed.fetch().await {
            Ok(suggestions) => suggestions,
            Err(e) => {
                warn!("Failed to fetch suggestions: {e}");
                Vec::new()
            }
        }
    }

    pub fn on_suggestion(&self, observer: Arc<dyn SuggestionObserver>) -> ObserverId {
        lock(&self.observers).add(observer)
    }

    /// Unregister an observer. Unknown ids are ignored.
    pub fn remove_suggestion_listener(&self, id: ObserverId) {
        if !lock(&self.observers).remove(id) {
            debug!("Observer {id:?} was not registered");
        }
    }
}

impl Drop for SuggestionSource {
    fn drop(&mut self) {
        self.stop_listening();
    }
}

async fn listen_loop(
    feed: Arc<dyn SuggestionFeed>,
    observers: Arc<Mutex<ObserverRegistry>>,
    token: CancellationToken,
    interval: Duration,
    dedupe: bool,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_text: Option<String> = None;

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let batch = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            batch = feed.fetch() => batch,
        };
        let batch = match batch {
            Ok(batch) => batch,
            Err(e) => {
                warn!("Suggestion feed fetch failed: {e}");
                continue;
            }
        };

        for suggestion in batch {
            if token.is_cancelled() {
                return;
            }
            if dedupe && last_text.as_deref() == Some(suggestion.text.as_str()) {
                debug!("Skipping duplicate suggestion");
                continue;
            }
            last_text = Some(suggestion.text.clone());

            let snapshot = lock(&observers).observers.clone();
            notify_all(&snapshot, &suggestion).await;
        }
    }
    debug!("Suggestion loop exited");
}

/// Feed backed by an HTTP service.
///
/// Handshake: `GET {api_url}/health`. Fetch: `GET {api_url}/suggestions`,
/// returning a JSON array of suggestions.
pub struct HttpSuggestionFeed {
    client: Client,
    endpoint: Mutex<Option<Endpoint>>,
}

#[derive(Clone)]
struct Endpoint {
    base: String,
    api_key: Option<String>,
}

impl Default for HttpSuggestionFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpSuggestionFeed {
    pub fn new() -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            endpoint: Mutex::new(None),
        }
    }

    async fn get(
        &self,
        endpoint: &Endpoint,
        path: &str,
    ) -> std::result::Result<reqwest::Response, String> {
        let url = format!("{}{path}", endpoint.base);
        let mut request = self.client.get(&url);
        if let Some(key) = &endpoint.api_key {
            request = request.bearer_auth(key);
        }

        let resp = request.send().await.map_err(|e| {
            if e.is_connect() {
                format!("Cannot connect to {url}")
            } else if e.is_timeout() {
                format!("Request to {url} timed out")
            } else {
                format!("Request to {url} failed: {e}")
            }
        })?;

        if !resp.status().is_success() {
            return Err(format!("{url} returned status {}", resp.status()));
        }
        Ok(resp)
    }
}

#[async_trait]
impl SuggestionFeed for HttpSuggestionFeed {
    async fn connect(&self, config: &CopilotConfig) -> std::result::Result<(), String> {
        let base = config
            .api_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or("No api_url configured")?;
        let endpoint = Endpoint {
            base: base.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        };

        self.get(&endpoint, "/health").await?;
        debug!("Suggestion feed handshake ok: {}", endpoint.base);
        *lock(&self.endpoint) = Some(endpoint);
        Ok(())
    }

    async fn fetch(&self) -> std::result::Result<Vec<Suggestion>, String> {
        let endpoint = lock(&self.endpoint).clone().ok_or("Feed not connected")?;
        let mut suggestions = self
            .get(&endpoint, "/suggestions")
            .await?
            .json::<Vec<Suggestion>>()
            .await
            .map_err(|e| format!("Failed to parse suggestions: {e}"))?;

        let received = suggestions.len();
        suggestions.retain(|s| (0.0..=1.0).contains(&s.confidence));
        if suggestions.len() < received {
            warn!(
                "Dropped {} suggestion(s) with confidence outside [0, 1]",
                received - suggestions.len()
            );
        }
        Ok(suggestions)
    }
}

/// In-process feed: [`MemoryFeed::push`] queues suggestions, `fetch` drains them.
#[derive(Default)]
pub struct MemoryFeed {
    pending: Mutex<VecDeque<Suggestion>>,
    refusal: Mutex<Option<String>>,
    connects: AtomicUsize,
}

impl MemoryFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, suggestion: Suggestion) {
        lock(&self.pending).push_back(suggestion);
    }

    pub fn pending(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Make future handshakes fail with `reason`, or succeed again with `None`.
    pub fn refuse_connections(&self, reason: Option<&str>) {
        *lock(&self.refusal) = reason.map(str::to_string);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SuggestionFeed for MemoryFeed {
    async fn connect(&self, _config: &CopilotConfig) -> std::result::Result<(), String> {
        self.connects.fetch_add(1, Ordering::Relaxed);
        match lock(&self.refusal).clone() {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }

    async fn fetch(&self) -> std::result::Result<Vec<Suggestion>, String> {
        Ok(lock(&self.pending).drain(..).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{suggestion, wait_for_log, RecordingObserver};

    fn enabled() -> CopilotConfig {
        CopilotConfig {
            enabled: true,
            poll_interval_ms: 10,
            ..CopilotConfig::default()
        }
    }

    fn source() -> (Arc<MemoryFeed>, SuggestionSource) {
        let feed = Arc::new(MemoryFeed::new());
        let source = SuggestionSource::new(feed.clone());
        (feed, source)
    }

    #[tokio::test]
    async fn test_disabled_config_stays_disconnected() {
        let (feed, source) = source();
        source
            .initialize(&CopilotConfig::default())
            .await
            .expect("disabled init succeeds");

        assert!(!source.is_connected());
        assert_eq!(feed.connect_count(), 0);
        assert!(matches!(
            source.start_listening(),
            Err(SpeakerError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_failed_handshake_reports_connection_error() {
        let (feed, source) = source();
        feed.refuse_connections(Some("feed offline"));

        let err = source.initialize(&enabled()).await.unwrap_err();
        assert!(matches!(err, SpeakerError::Connection(ref msg) if msg == "feed offline"));
        assert!(!source.is_connected());

        feed.refuse_connections(None);
        source.initialize(&enabled()).await.expect("reconnect");
        assert!(source.is_connected());
        assert_eq!(feed.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_get_suggestions_empty_while_disconnected() {
        let (feed, source) = source();
        feed.push(suggestion("queued"));

        assert!(source.get_suggestions().await.is_empty());
        assert_eq!(feed.pending(), 1);

        source.initialize(&enabled()).await.expect("connect");
        assert_eq!(source.get_suggestions().await, vec![suggestion("queued")]);
    }

    #[tokio::test]
    async fn test_delivery_in_registration_order_despite_failures() {
        let (feed, source) = source();
        let log = Arc::new(Mutex::new(Vec::new()));
        source.on_suggestion(RecordingObserver::failing("first", log.clone()));
        source.on_suggestion(RecordingObserver::new("second", log.clone()));

        feed.push(suggestion("a"));
        feed.push(suggestion("b"));
        source.initialize(&enabled()).await.expect("connect");
        source.start_listening().expect("listen");
        assert!(source.is_listening());

        wait_for_log(&log, 4).await;
        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:a", "second:a", "first:b", "second:b"]
        );
        source.stop_listening();
    }

    #[tokio::test]
    async fn test_removing_unknown_observer_is_noop() {
        let (feed, source) = source();
        let log = Arc::new(Mutex::new(Vec::new()));

        let removed = source.on_suggestion(RecordingObserver::new("gone", log.clone()));
        source.on_suggestion(RecordingObserver::new("kept", log.clone()));
        source.remove_suggestion_listener(removed);
        source.remove_suggestion_listener(removed);
        source.remove_suggestion_listener(ObserverId(99));

        feed.push(suggestion("hello"));
        source.initialize(&enabled()).await.expect("connect");
        source.start_listening().expect("listen");

        wait_for_log(&log, 1).await;
        source.stop_listening();
        assert_eq!(*log.lock().unwrap(), vec!["kept:hello"]);
    }

    #[tokio::test]
    async fn test_stop_listening_is_idempotent_and_restartable() {
        let (feed, source) = source();
        let log = Arc::new(Mutex::new(Vec::new()));
        source.on_suggestion(RecordingObserver::new("obs", log.clone()));
        source.initialize(&enabled()).await.expect("connect");

        source.start_listening().expect("listen");
        source.stop_listening();
        source.stop_listening();
        assert!(!source.is_listening());

        feed.push(suggestion("while stopped"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(feed.pending(), 1);

        source.start_listening().expect("listen again");
        wait_for_log(&log, 1).await;
        assert_eq!(*log.lock().unwrap(), vec!["obs:while stopped"]);
        source.stop_listening();
    }

    #[tokio::test]
    async fn test_dedupe_skips_repeated_text() {
        let (feed, source) = source();
        let log = Arc::new(Mutex::new(Vec::new()));
        source.on_suggestion(RecordingObserver::new("obs", log.clone()));

        for text in ["same", "same", "other", "same"] {
            feed.push(suggestion(text));
        }
        source
            .initialize(&CopilotConfig {
                dedupe: true,
                ..enabled()
            })
            .await
            .expect("connect");
        source.start_listening().expect("listen");

        wait_for_log(&log, 3).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        source.stop_listening();
        assert_eq!(*log.lock().unwrap(), vec!["obs:same", "obs:other", "obs:same"]);
    }

    #[tokio::test]
    async fn test_disabling_stops_listening() {
        let (_feed, source) = source();
        source.initialize(&enabled()).await.expect("connect");
        source.start_listening().expect("listen");
        assert!(source.is_listening());

        source
            .initialize(&CopilotConfig::default())
            .await
            .expect("disable");
        assert!(!source.is_connected());
        assert!(!source.is_listening());
    }

    mod http {
        use super::*;
        use axum::http::{HeaderMap, StatusCode};
        use axum::routing::get;
        use axum::{Json, Router};

        async fn serve(router: Router) -> String {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
                .await
                .expect("bind");
            let addr = listener.local_addr().expect("addr");
            tokio::spawn(async move {
                axum::serve(listener, router).await.expect("serve");
            });
            format!("http://{addr}")
        }

        fn feed_router() -> Router {
            Router::new()
                .route(
                    "/health",
                    get(|headers: HeaderMap| async move {
                        match headers.get("authorization").and_then(|v| v.to_str().ok()) {
                            Some("Bearer secret") => StatusCode::OK,
                            _ => StatusCode::UNAUTHORIZED,
                        }
                    }),
                )
                .route(
                    "/suggestions",
                    get(|| async {
                        Json(serde_json::json!([
                            {
                                "text": "Add a `match` arm",
                                "confidence": 0.8,
                                "language": "rust",
                                "context": {
                                    "fileName": "main.rs",
                                    "lineNumber": 3,
                                    "columnNumber": 7
                                }
                            },
                            { "text": "Delete everything", "confidence": 7.5 },
                            { "text": "Rename x", "confidence": 0.4 }
                        ]))
                    }),
                )
        }

        #[tokio::test]
        async fn test_http_feed_handshake_and_fetch() {
            let base = serve(feed_router()).await;
            let feed = HttpSuggestionFeed::new();
            let config = CopilotConfig {
                api_url: Some(format!("{base}/")),
                api_key: Some("secret".into()),
                ..enabled()
            };

            feed.connect(&config).await.expect("handshake");
            let suggestions = feed.fetch().await.expect("fetch");

            assert_eq!(suggestions.len(), 2);
            assert_eq!(suggestions[0].text, "Add a `match` arm");
            assert_eq!(
                suggestions[0].context,
                Some(SuggestionContext {
                    file_name: "main.rs".into(),
                    line_number: 3,
                    column_number: 7,
                })
            );
            assert_eq!(suggestions[1].text, "Rename x");
            assert_eq!(suggestions[1].language, None);
        }

        #[tokio::test]
        async fn test_http_feed_rejected_handshake() {
            let base = serve(feed_router()).await;
            let feed = HttpSuggestionFeed::new();
            let config = CopilotConfig {
                api_url: Some(base),
                api_key: Some("wrong".into()),
                ..enabled()
            };

            let err = feed.connect(&config).await.unwrap_err();
            assert!(err.contains("401"), "{err}");
            assert!(feed.fetch().await.is_err());
        }

        #[tokio::test]
        async fn test_http_feed_requires_url() {
            let feed = HttpSuggestionFeed::new();
            assert!(feed.connect(&enabled()).await.is_err());
        }
    }
}
