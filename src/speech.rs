//! Speech output through a pluggable synthesis backend.
//!
//! [`SpeechAdapter`] keeps at most one utterance in flight: a new `speak`
//! cancels whatever is playing or queued, and only the newest request
//! reaches the backend. [`CommandBackend`] drives the system engine
//! (`espeak-ng` on Linux, `say` on macOS) as a child process.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::VoiceConfig;
use crate::error::{Result, SpeakerError};

/// Backend words-per-minute at speed 1.0.
const BASE_RATE: f32 = 200.0;

/// One request handed to the synthesis backend.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisRequest {
    pub text: String,
    pub voice: Option<String>,
    /// Rate in the backend's native unit (words per minute).
    pub rate: u32,
}

/// How an utterance ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Utterance {
    Completed,
    Cancelled,
}

/// External speech-synthesis capability.
///
/// Errors are the backend's own messages; the adapter wraps them.
#[async_trait]
pub trait SpeechBackend: Send + Sync {
    /// Speak `request` and resolve once playback ends or is cancelled.
    async fn synthesize(
        &self,
        request: SynthesisRequest,
    ) -> std::result::Result<Utterance, String>;

    /// Cancel the in-flight utterance, if any.
    async fn cancel(&self) -> std::result::Result<(), String>;

    async fn list_installed_voices(&self) -> std::result::Result<Option<Vec<String>>, String>;
}

/// Result of a speak operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpeakResult {
    pub cancelled: bool,
    pub elapsed_ms: f64,
    pub rate: u32,
}

impl SpeakResult {
    fn superseded() -> Self {
        Self {
            cancelled: true,
            ..Self::default()
        }
    }
}

/// Convert a speed multiplier into the backend rate.
pub fn speech_rate(speed: f32) -> u32 {
    (speed * BASE_RATE).round() as u32
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A place in the speech queue, taken before waiting for the speak lock.
///
/// Only the newest reservation may reach the backend; older ones resolve as
/// cancelled once they get the lock.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Reservation {
    generation: u64,
    preempted: bool,
}

/// Clears the speaking flag even when the speak future is dropped.
struct SpeakingFlag<'a>(&'a AtomicBool);

impl<'a> SpeakingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for SpeakingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SpeechAdapter {
    backend: Arc<dyn SpeechBackend>,
    voice: Mutex<VoiceConfig>,
    speaking: AtomicBool,
    speak_lock: AsyncMutex<()>,
    generation: AtomicU64,
    /// Token of the utterance holding the speak lock, tagged with its generation.
    current: Mutex<Option<(u64, CancellationToken)>>,
}

impl SpeechAdapter {
    pub fn new(backend: Arc<dyn SpeechBackend>, voice: VoiceConfig) -> Self {
        Self {
            backend,
            voice: Mutex::new(voice),
            speaking: AtomicBool::new(false),
            speak_lock: AsyncMutex::new(()),
            generation: AtomicU64::new(0),
            current: Mutex::new(None),
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst)
    }

    pub fn voice_config(&self) -> VoiceConfig {
        lock(&self.voice).clone()
    }

    /// Replace the voice settings. Applies from the next `speak` on.
    pub fn set_voice_config(&self, voice: &VoiceConfig) {
        *lock(&self.voice) = voice.clone();
        debug!("Speech voice config set: {voice:?}");
    }

    /// Supersede every earlier request and cancel the active utterance's token.
    /// Returns whether an utterance was active.
    fn advance(&self) -> (u64, bool) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let active = lock(&self.current).take();
        let preempted = match active {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        };
        (generation, preempted)
    }

    /// Take a place in the queue without waiting. Synchronous so callers can
    /// do it while holding their own state lock.
    pub(crate) fn reserve(&self) -> Reservation {
        let (generation, preempted) = self.advance();
        Reservation {
            generation,
            preempted,
        }
    }

    /// Speak `text`, preempting any utterance already playing or queued.
    pub async fn speak(&self, text: &str) -> Result<SpeakResult> {
        if text.trim().is_empty() {
            return Ok(SpeakResult::default());
        }
        let reservation = self.reserve();
        self.speak_reserved(reservation, text).await
    }

    pub(crate) async fn speak_reserved(
        &self,
        reservation: Reservation,
        text: &str,
    ) -> Result<SpeakResult> {
        if reservation.preempted {
            info!("Preempting in-flight utterance");
            if let Err(e) = self.backend.cancel().await {
                warn!("Failed to cancel in-flight utterance: {e}");
            }
        }

        let _guard = self.speak_lock.lock().await;

        // Publish the token first, then re-check: a newer request either sees
        // the token and cancels it, or its generation bump is visible here.
        let token = CancellationToken::new();
        *lock(&self.current) = Some((reservation.generation, token.clone()));
        if self.generation.load(Ordering::SeqCst) != reservation.generation {
            self.release(reservation.generation);
            debug!("Speak request superseded before dispatch");
            return Ok(SpeakResult::superseded());
        }

        let voice = self.voice_config();
        let request = SynthesisRequest {
            text: text.to_string(),
            voice: voice.voice,
            rate: speech_rate(voice.speed),
        };
        let rate = request.rate;

        debug!("Speaking {} chars at rate {rate}", text.len());
        let _speaking = SpeakingFlag::raise(&self.speaking);
        let t0 = Instant::now();
        let outcome = tokio::select! {
            biased;
            // Dropping the synthesis future tears down the utterance.
            _ = token.cancelled() => Ok(Utterance::Cancelled),
            outcome = self.backend.synthesize(request) => outcome,
        };
        self.release(reservation.generation);
        let elapsed_ms = t0.elapsed().as_secs_f64() * 1000.0;

        match outcome {
            Ok(utterance) => Ok(SpeakResult {
                cancelled: utterance == Utterance::Cancelled,
                elapsed_ms,
                rate,
            }),
            Err(e) => Err(SpeakerError::Synthesis(e)),
        }
    }

    fn release(&self, generation: u64) {
        let mut current = lock(&self.current);
        if current.as_ref().is_some_and(|(active, _)| *active == generation) {
            *current = None;
        }
    }

    /// Installed voice names. Empty when the backend cannot say.
    pub async fn list_voices(&self) -> Vec<String> {
        match self.backend.list_installed_voices().await {
            Ok(Some(voices)) => voices,
            Ok(None) => {
                warn!("Speech backend returned no voice list");
                Vec::new()
            }
            Err(e) => {
                warn!("Failed to list voices: {e}");
                Vec::new()
            }
        }
    }

    /// Cancel the current utterance and every queued request. Never fails.
    pub async fn stop(&self) {
        self.advance();
        if let Err(e) = self.backend.cancel().await {
            warn!("Failed to stop speech: {e}");
        }
    }
}

/// System speech engines reachable as a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemEngine {
    EspeakNg,
    Say,
}

impl SystemEngine {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "espeak-ng" | "espeak" => Some(Self::EspeakNg),
            "say" => Some(Self::Say),
            _ => None,
        }
    }

    pub fn program(self) -> &'static str {
        match self {
            Self::EspeakNg => "espeak-ng",
            Self::Say => "say",
        }
    }

    fn speak_args(self, request: &SynthesisRequest) -> Vec<String> {
        let mut args = match self {
            Self::EspeakNg => vec!["-s".to_string(), request.rate.to_string()],
            Self::Say => vec!["-r".to_string(), request.rate.to_string()],
        };
        if let Some(voice) = &request.voice {
            args.push("-v".into());
            args.push(voice.clone());
        }
        if self == Self::EspeakNg {
            args.push("--".into());
        }
        args.push(request.text.clone());
        args
    }

    fn list_args(self) -> &'static [&'static str] {
        match self {
            Self::EspeakNg => &["--voices"],
            Self::Say => &["-v", "?"],
        }
    }

    fn parse_voices(self, output: &str) -> Vec<String> {
        match self {
            // Pty Language Age/Gender VoiceName File Other Languages
            Self::EspeakNg => output
                .lines()
                .skip(1)
                .filter_map(|line| line.split_whitespace().nth(3))
                .map(str::to_string)
                .collect(),
            // "Alex                en_US    # Most people recognize me by my voice."
            Self::Say => output
                .lines()
                .filter_map(|line| {
                    let before_comment = line.split('#').next()?.trim();
                    let (name, _locale) = before_comment.rsplit_once(char::is_whitespace)?;
                    let name = name.trim();
                    (!name.is_empty()).then(|| name.to_string())
                })
                .collect(),
        }
    }
}

/// Speech backend that shells out to a [`SystemEngine`].
pub struct CommandBackend {
    engine: SystemEngine,
    current: Mutex<Option<(u64, CancellationToken)>>,
    next_id: AtomicU64,
}

impl CommandBackend {
    pub fn new(engine: SystemEngine) -> Self {
        info!("Speech backend: {}", engine.program());
        Self {
            engine,
            current: Mutex::new(None),
            next_id: AtomicU64::new(0),
        }
    }

    fn register(&self) -> (u64, CancellationToken) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        *lock(&self.current) = Some((id, token.clone()));
        (id, token)
    }

    fn release(&self, id: u64) {
        let mut current = lock(&self.current);
        if current.as_ref().is_some_and(|(active, _)| *active == id) {
            *current = None;
        }
    }
}

#[async_trait]
impl SpeechBackend for CommandBackend {
    async fn synthesize(
        &self,
        request: SynthesisRequest,
    ) -> std::result::Result<Utterance, String> {
        let program = self.engine.program();
        let mut child = Command::new(program)
            .args(self.engine.speak_args(&request))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("Failed to spawn {program}: {e}"))?;

        let (id, token) = self.register();
        let outcome = tokio::select! {
            status = child.wait() => match status {
                Ok(status) if status.success() => Ok(Utterance::Completed),
                Ok(status) => Err(format!("{program} exited with {status}")),
                Err(e) => Err(format!("Failed to wait for {program}: {e}")),
            },
            _ = token.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill {program}: {e}");
                }
                Ok(Utterance::Cancelled)
            }
        };
        self.release(id);
        outcome
    }

    async fn cancel(&self) -> std::result::Result<(), String> {
        let active = lock(&self.current).take();
        if let Some((_, token)) = active {
            token.cancel();
            info!("Speech cancelled");
        }
        Ok(())
    }

    async fn list_installed_voices(&self) -> std::result::Result<Option<Vec<String>>, String> {
        let program = self.engine.program();
        let output = Command::new(program)
            .args(self.engine.list_args())
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| format!("Failed to run {program}: {e}"))?;

        if !output.status.success() {
            return Err(format!("{program} exited with {}", output.status));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(Some(self.engine.parse_voices(&stdout)))
    }
}
