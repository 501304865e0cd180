//! Voice I/O adapter
//!
//! Speech recognition is a lazy stream of transcript events driven by an
//! audio chunk stream, with explicit start/stop. Synthesis is a one-shot call
//! returning raw audio. Neither touches conversation state, so both may run
//! alongside an in-flight turn.

use crate::{CompanionError, Result, SpeechSettings};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const SYNTHESIS_OUTPUT_FORMAT: &str = "riff-24khz-16bit-mono-pcm";
const RECOGNITION_CONTENT_TYPE: &str = "audio/wav; codecs=audio/pcm; samplerate=16000";
const SPEECH_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One captured utterance, WAV encoded (16 kHz mono PCM)
#[derive(Debug, Clone)]
pub struct AudioChunk(pub Vec<u8>);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEvent {
    Recognized(String),
    /// Audio was processed but contained no speech
    NoMatch,
    /// Recognition of one chunk failed; the session keeps running
    Error(String),
    /// Terminal event: stopped explicitly or audio ended
    Stopped,
}

/// Recognizes one audio chunk. `Ok(None)` means no speech was found.
#[async_trait::async_trait]
pub trait RecognitionBackend: Send + Sync + 'static {
    async fn recognize(&self, chunk: AudioChunk) -> Result<Option<String>>;
}

/// One-shot text-to-speech.
#[async_trait::async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>>;
}

/// Cloneable handle that ends a recognition session
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<watch::Sender<bool>>);

impl StopHandle {
    /// Safe to call any number of times
    pub fn stop(&self) {
        self.0.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.0.borrow()
    }
}

/// A running recognition: a stream of [`TranscriptEvent`] ending in `Stopped`.
///
/// Audio is only pulled while the session is being polled.
pub struct RecognitionSession {
    events: BoxStream<'static, TranscriptEvent>,
    stop: StopHandle,
}

impl RecognitionSession {
    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Drain the session, collecting every recognized fragment.
    pub async fn collect_transcript(mut self) -> Vec<String> {
        let mut fragments = Vec::new();
        while let Some(event) = self.next().await {
            match event {
                TranscriptEvent::Recognized(text) => fragments.push(text),
                TranscriptEvent::Error(e) => warn!("Recognition error: {}", e),
                TranscriptEvent::NoMatch => {}
                TranscriptEvent::Stopped => break,
            }
        }
        fragments
    }
}

impl Stream for RecognitionSession {
    type Item = TranscriptEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.as_mut().poll_next(cx)
    }
}

struct SessionState {
    audio: BoxStream<'static, AudioChunk>,
    backend: Arc<dyn RecognitionBackend>,
    stop_rx: watch::Receiver<bool>,
}

/// Continuous recognition front-end. Starting again stops the previous session.
pub struct SpeechRecognizer {
    backend: Arc<dyn RecognitionBackend>,
    active: Mutex<Option<StopHandle>>,
}

impl SpeechRecognizer {
    pub fn new(backend: Arc<dyn RecognitionBackend>) -> Self {
        Self {
            backend,
            active: Mutex::new(None),
        }
    }

    pub fn start<S>(&self, audio: S) -> RecognitionSession
    where
        S: Stream<Item = AudioChunk> + Send + 'static,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let stop = StopHandle(Arc::new(stop_tx));
        if let Some(previous) = self.replace_active(Some(stop.clone())) {
            previous.stop();
        }

        let state = SessionState {
            audio: audio.boxed(),
            backend: Arc::clone(&self.backend),
            stop_rx,
        };
        let events = stream::unfold(Some(state), |state| async move {
            let mut state = state?;
            if *state.stop_rx.borrow() {
                return Some((TranscriptEvent::Stopped, None));
            }

            let next = tokio::select! {
                biased;
                _ = state.stop_rx.changed() => None,
                chunk = state.audio.next() => chunk,
            };
            let Some(chunk) = next else {
                return Some((TranscriptEvent::Stopped, None));
            };

            let event = match state.backend.recognize(chunk).await {
                Ok(Some(text)) if !text.trim().is_empty() => TranscriptEvent::Recognized(text),
                Ok(_) => TranscriptEvent::NoMatch,
                Err(e) => TranscriptEvent::Error(e.to_string()),
            };
            debug!("Transcript event: {:?}", event);
            Some((event, Some(state)))
        })
        .boxed();

        info!("Speech recognition started");
        RecognitionSession { events, stop }
    }

    /// Stop the active session, if any.
    pub fn stop(&self) {
        if let Some(active) = self.replace_active(None) {
            active.stop();
            info!("Speech recognition stopped");
        }
    }

    fn replace_active(&self, next: Option<StopHandle>) -> Option<StopHandle> {
        match self.active.lock() {
            Ok(mut guard) => std::mem::replace(&mut *guard, next),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), next),
        }
    }
}

// ─── Azure Speech REST client ───────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RecognitionResponse {
    recognition_status: String,
    #[serde(default)]
    display_text: Option<String>,
}

/// Azure Cognitive Services speech client (REST endpoints).
pub struct AzureSpeechClient {
    client: Client,
    region: String,
    key: String,
    voice: String,
    language: String,
}

impl AzureSpeechClient {
    /// Build a client from settings; the key is read from the environment.
    pub fn from_settings(settings: &SpeechSettings) -> Result<Self> {
        let region = settings.region.clone().ok_or_else(|| {
            CompanionError::Configuration("speech.region is not configured".to_string())
        })?;
        let key = std::env::var(&settings.key_env).map_err(|_| {
            CompanionError::Configuration(format!("{} is not set", settings.key_env))
        })?;
        let client = Client::builder()
            .timeout(SPEECH_REQUEST_TIMEOUT)
            .user_agent(concat!("companion/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CompanionError::Speech(e.to_string()))?;
        Ok(Self {
            client,
            region,
            key,
            voice: settings.voice.clone(),
            language: settings.language.clone(),
        })
    }

    fn ssml(&self, text: &str) -> String {
        format!(
            "<speak version='1.0' xml:lang='{lang}'><voice xml:lang='{lang}' name='{voice}'>{text}</voice></speak>",
            lang = self.language,
            voice = self.voice,
            text = escape_xml(text)
        )
    }
}

#[async_trait::async_trait]
impl SpeechSynthesizer for AzureSpeechClient {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        let url = format!(
            "https://{}.tts.speech.microsoft.com/cognitiveservices/v1",
            self.region
        );
        let response = self
            .client
            .post(&url)
            .header("Ocp-Apim-Subscription-Key", &self.key)
            .header("Content-Type", "application/ssml+xml")
            .header("X-Microsoft-OutputFormat", SYNTHESIS_OUTPUT_FORMAT)
            .body(self.ssml(text))
            .send()
            .await
            .map_err(|e| CompanionError::Speech(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CompanionError::Speech(format!(
                "synthesis failed with {status}: {}",
                body.trim()
            )));
        }
        let audio = response
            .bytes()
            .await
            .map_err(|e| CompanionError::Speech(e.to_string()))?;
        if audio.is_empty() {
            return Err(CompanionError::Speech("synthesis returned no audio".to_string()));
        }
        Ok(audio.to_vec())
    }
}

#[async_trait::async_trait]
impl RecognitionBackend for AzureSpeechClient {
    async fn recognize(&self, chunk: AudioChunk) -> Result<Option<String>> {
        let url = format!(
            "https://{}.stt.speech.microsoft.com/speech/recognition/conversation/cognitiveservices/v1",
            self.region
        );
        let response = self
            .client
            .post(&url)
            .query(&[("language", self.language.as_str())])
            .header("Ocp-Apim-Subscription-Key", &self.key)
            .header("Content-Type", RECOGNITION_CONTENT_TYPE)
            .body(chunk.0)
            .send()
            .await
            .map_err(|e| CompanionError::Speech(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CompanionError::Speech(format!(
                "recognition failed with {status}"
            )));
        }
        let body: RecognitionResponse = response
            .json()
            .await
            .map_err(|e| CompanionError::Speech(e.to_string()))?;
        match body.recognition_status.as_str() {
            "Success" => Ok(body.display_text.filter(|t| !t.trim().is_empty())),
            "NoMatch" | "InitialSilenceTimeout" | "BabbleTimeout" => Ok(None),
            other => Err(CompanionError::Speech(format!("recognition status {other}"))),
        }
    }
}

fn escape_xml(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Treats each chunk's bytes as UTF-8 "speech"
    struct EchoBackend;

    #[async_trait::async_trait]
    impl RecognitionBackend for EchoBackend {
        async fn recognize(&self, chunk: AudioChunk) -> Result<Option<String>> {
            let text = String::from_utf8(chunk.0).unwrap_or_default();
            if text == "boom" {
                return Err(CompanionError::Speech("decoder exploded".into()));
            }
            Ok(Some(text))
        }
    }

    fn chunks(items: &[&str]) -> Vec<AudioChunk> {
        items.iter().map(|s| AudioChunk(s.as_bytes().to_vec())).collect()
    }

    #[tokio::test]
    async fn test_session_emits_events_then_stopped() {
        let recognizer = SpeechRecognizer::new(Arc::new(EchoBackend));
        let session = recognizer.start(stream::iter(chunks(&["hello", "", "boom", "there"])));
        let events: Vec<TranscriptEvent> = session.collect().await;
        assert_eq!(
            events,
            vec![
                TranscriptEvent::Recognized("hello".into()),
                TranscriptEvent::NoMatch,
                TranscriptEvent::Error("Speech error: decoder exploded".into()),
                TranscriptEvent::Recognized("there".into()),
                TranscriptEvent::Stopped,
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_ends_pending_session() {
        let recognizer = SpeechRecognizer::new(Arc::new(EchoBackend));
        // Audio that never ends
        let mut session = recognizer.start(stream::pending::<AudioChunk>());
        let handle = session.stop_handle();
        handle.stop();
        handle.stop();
        assert!(handle.is_stopped());
        assert_eq!(session.next().await, Some(TranscriptEvent::Stopped));
        assert_eq!(session.next().await, None);
    }

    #[tokio::test]
    async fn test_restart_stops_previous_session() {
        let recognizer = SpeechRecognizer::new(Arc::new(EchoBackend));
        let first = recognizer.start(stream::pending::<AudioChunk>());
        let second = recognizer.start(stream::iter(chunks(&["again"])));
        assert!(first.stop_handle().is_stopped());

        let fragments = second.collect_transcript().await;
        assert_eq!(fragments, vec!["again".to_string()]);

        recognizer.stop();
        let third = recognizer.start(stream::iter(chunks(&["one", "two"])));
        assert_eq!(third.collect_transcript().await, vec!["one", "two"]);
    }

    #[test]
    fn test_escape_xml() {
        assert_eq!(
            escape_xml(r#"Tom & "Jerry" <3 'cheese'"#),
            "Tom &amp; &quot;Jerry&quot; &lt;3 &apos;cheese&apos;"
        );
    }
}
