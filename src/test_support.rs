//! Test doubles shared by the unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::source::{Suggestion, SuggestionObserver};
use crate::speech::{SpeechBackend, SynthesisRequest, Utterance};

/// Speech backend that records every call as a short event string.
#[derive(Default)]
pub struct ScriptedBackend {
    events: Mutex<Vec<String>>,
    hold_next: AtomicBool,
    cancelled: Notify,
    synthesis_error: Mutex<Option<String>>,
    cancel_fails: AtomicBool,
    voices: Mutex<Option<Result<Option<Vec<String>>, String>>>,
}

impl ScriptedBackend {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    /// Make the next `synthesize` block until `cancel` is called.
    pub fn hold_next(&self) {
        self.hold_next.store(true, Ordering::SeqCst);
    }

    pub fn fail_synthesis(&self, message: &str) {
        *self.synthesis_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn fail_cancel(&self) {
        self.cancel_fails.store(true, Ordering::SeqCst);
    }

    pub fn set_voices(&self, voices: Result<Option<Vec<String>>, String>) {
        *self.voices.lock().unwrap() = Some(voices);
    }

    pub async fn wait_for_events(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while self.events.lock().unwrap().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("backend events did not arrive in time");
    }
}

#[async_trait]
impl SpeechBackend for ScriptedBackend {
    async fn synthesize(&self, request: SynthesisRequest) -> Result<Utterance, String> {
        let cancelled = self.cancelled.notified();
        self.record(format!(
            "synth:{}:{}:{}",
            request.text,
            request.rate,
            request.voice.as_deref().unwrap_or("-")
        ));

        if self.hold_next.swap(false, Ordering::SeqCst) {
            cancelled.await;
            return Ok(Utterance::Cancelled);
        }
        match self.synthesis_error.lock().unwrap().clone() {
            Some(message) => Err(message),
            None => Ok(Utterance::Completed),
        }
    }

    async fn cancel(&self) -> Result<(), String> {
        self.record("cancel".into());
        self.cancelled.notify_waiters();
        if self.cancel_fails.load(Ordering::SeqCst) {
            Err("cancel rejected".into())
        } else {
            Ok(())
        }
    }

    async fn list_installed_voices(&self) -> Result<Option<Vec<String>>, String> {
        self.voices.lock().unwrap().clone().unwrap_or(Ok(Some(Vec::new())))
    }
}

/// Observer that appends `"<name>:<text>"` to a shared log.
pub struct RecordingObserver {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
    fail: bool,
}

impl RecordingObserver {
    pub fn new(name: &'static str, log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            name,
            log,
            fail: false,
        })
    }

    pub fn failing(name: &'static str, log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            name,
            log,
            fail: true,
        })
    }
}

#[async_trait]
impl SuggestionObserver for RecordingObserver {
    async fn on_suggestion(&self, suggestion: &Suggestion) -> anyhow::Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(format!("{}:{}", self.name, suggestion.text));
        if self.fail {
            anyhow::bail!("{} refused the suggestion", self.name);
        }
        Ok(())
    }
}

pub fn suggestion(text: &str) -> Suggestion {
    Suggestion {
        text: text.to_string(),
        confidence: 0.9,
        language: Some("rust".into()),
        context: None,
    }
}

pub async fn wait_for_log(log: &Mutex<Vec<String>>, count: usize) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while log.lock().unwrap().len() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("observer log did not fill in time");
}
