//! Service orchestration with state machine.
//!
//! IDLE → RUNNING → IDLE
//!
//! Every piece of text, manual or suggested, goes through the normalizer
//! before it reaches the speech adapter.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::{
    AppConfig, ConfigStore, CopilotConfig, CopilotConfigUpdate, VoiceConfig, VoiceConfigUpdate,
};
use crate::error::{Result, SpeakerError};
use crate::normalizer::{is_speakable, normalize};
use crate::source::{ObserverId, Suggestion, SuggestionFeed, SuggestionObserver, SuggestionSource};
use crate::speech::{SpeakResult, SpeechAdapter, SpeechBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Idle,
    Running,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Running => write!(f, "RUNNING"),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Observer that speaks suggestions while the service is running.
struct SuggestionSpeaker {
    state: Arc<Mutex<ServiceState>>,
    speech: Arc<SpeechAdapter>,
}

#[async_trait]
impl SuggestionObserver for SuggestionSpeaker {
    async fn on_suggestion(&self, suggestion: &Suggestion) -> anyhow::Result<()> {
        let text = normalize(&suggestion.text);
        if !is_speakable(&text) {
            debug!("Skipping unspeakable suggestion ({} chars)", suggestion.text.len());
            return Ok(());
        }

        // Reserve under the state lock so a concurrent stop supersedes it.
        let reservation = {
            let state = lock(&self.state);
            if *state != ServiceState::Running {
                debug!("Ignoring suggestion while idle");
                return Ok(());
            }
            self.speech.reserve()
        };

        // A failed suggestion must not end the delivery loop.
        if let Err(e) = self.speech.speak_reserved(reservation, &text).await {
            warn!("Failed to speak suggestion: {e}");
        }
        Ok(())
    }
}

pub struct SpeakerService {
    store: ConfigStore,
    speech: Arc<SpeechAdapter>,
    source: SuggestionSource,
    state: Arc<Mutex<ServiceState>>,
    observer: Mutex<Option<ObserverId>>,
}

impl SpeakerService {
    pub fn new(
        store: ConfigStore,
        backend: Arc<dyn SpeechBackend>,
        feed: Arc<dyn SuggestionFeed>,
    ) -> Self {
        let speech = Arc::new(SpeechAdapter::new(backend, store.config().voice));
        Self {
            store,
            speech,
            source: SuggestionSource::new(feed),
            state: Arc::new(Mutex::new(ServiceState::Idle)),
            observer: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ServiceState {
        *lock(&self.state)
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServiceState::Running
    }

    pub fn is_speaking(&self) -> bool {
        self.speech.is_speaking()
    }

    pub fn is_copilot_connected(&self) -> bool {
        self.source.is_connected()
    }

    pub fn is_listening(&self) -> bool {
        self.source.is_listening()
    }

    pub fn config(&self) -> AppConfig {
        self.store.config()
    }

    /// Connect the suggestion source if it is enabled.
    pub async fn initialize(&self) -> Result<()> {
        let config = self.store.config();
        if config.copilot.enabled {
            self.source
                .initialize(&config.copilot)
                .await
                .map_err(|e| SpeakerError::Initialization(Box::new(e)))?;
        }
        info!("Service initialized (copilot enabled: {})", config.copilot.enabled);
        Ok(())
    }

    pub fn start(&self) -> Result<()> {
        {
            let mut state = lock(&self.state);
            if *state == ServiceState::Running {
                debug!("Service already running");
                return Ok(());
            }
            *state = ServiceState::Running;
        }
        info!("State: IDLE → RUNNING");

        let config = self.store.config();
        if config.copilot.enabled && config.real_time_enabled {
            self.listen()?;
        }
        Ok(())
    }

    pub async fn stop(&self) {
        {
            let mut state = lock(&self.state);
            if *state == ServiceState::Idle {
                debug!("Service already idle");
                return;
            }
            *state = ServiceState::Idle;
        }
        info!("State: RUNNING → IDLE");

        self.speech.stop().await;
        self.source.stop_listening();
    }

    /// Normalize and speak `text`, waiting for playback to finish.
    pub async fn speak_text(&self, text: &str) -> Result<SpeakResult> {
        let text = normalize(text);
        if !is_speakable(&text) {
            return Err(SpeakerError::UnspeakableText);
        }
        self.speech.speak(&text).await
    }

    /// Cancel whatever is being spoken.
    pub async fn cancel_speech(&self) {
        self.speech.stop().await;
    }

    pub async fn update_voice_config(&self, update: VoiceConfigUpdate) -> Result<VoiceConfig> {
        let voice = self.store.update_voice(update)?;
        self.speech.set_voice_config(&voice);
        Ok(voice)
    }

    /// Apply a suggestion-source update and re-run the source handshake.
    pub async fn update_copilot_config(
        &self,
        update: CopilotConfigUpdate,
    ) -> Result<CopilotConfig> {
        let copilot = self.store.update_copilot(update);
        self.source.initialize(&copilot).await?;

        // Restart the loop so new poll settings take effect.
        if copilot.enabled && self.is_running() && self.store.config().real_time_enabled {
            self.source.stop_listening();
            self.listen()?;
        }
        Ok(copilot)
    }

    pub fn set_real_time_enabled(&self, enabled: bool) -> Result<()> {
        self.store.set_real_time_enabled(enabled);
        if enabled {
            if self.is_running() && self.store.config().copilot.enabled {
                self.listen()?;
            }
        } else {
            self.source.stop_listening();
        }
        info!("Real-time speech {}", if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    pub async fn list_voices(&self) -> Vec<String> {
        self.speech.list_voices().await
    }

    pub async fn current_suggestions(&self) -> Vec<Suggestion> {
        self.source.get_suggestions().await
    }

    fn listen(&self) -> Result<()> {
        let mut observer = lock(&self.observer);
        if observer.is_none() {
            let speaker = Arc::new(SuggestionSpeaker {
                state: self.state.clone(),
                speech: self.speech.clone(),
            });
            *observer = Some(self.source.on_suggestion(speaker));
        }
        drop(observer);
        self.source.start_listening()
    }
}
