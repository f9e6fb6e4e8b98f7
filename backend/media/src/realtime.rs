//! Streaming speech-to-text over the OpenAI realtime transcription socket.
//!
//! A session owns one supervisor task. The task pumps the socket until it
//! drops, then reconnects with exponential backoff unless the session was
//! closed deliberately. The first connect is bounded by a timeout and is
//! not retried: the caller decides what to do with a dead session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use callforge_scheduler::RetryPolicy;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::MediaError;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const OPENAI_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime?intent=transcription";

/// What a speech session reports back.
#[derive(Debug, Clone, PartialEq)]
pub enum SttEvent {
    /// Running text of the utterance in progress.
    Partial(String),
    /// Completed utterance.
    Final(String),
    /// The caller started talking.
    SpeechStarted,
    /// The session is gone for good (reconnects exhausted).
    Failed(String),
}

/// One live transcription stream.
#[async_trait]
pub trait SpeechSession: Send + Sync {
    async fn connect(&self) -> Result<(), MediaError>;

    /// Feed 8 kHz mu-law audio. Dropped silently while disconnected.
    fn send_audio(&self, mulaw: &[u8]);

    fn is_connected(&self) -> bool;

    /// Close and suppress any further reconnection.
    async fn close(&self);
}

/// A session plus the channel its events arrive on.
pub struct SessionHandle {
    pub session: Arc<dyn SpeechSession>,
    pub events: mpsc::UnboundedReceiver<SttEvent>,
}

pub trait SttProvider: Send + Sync {
    fn create_session(&self) -> SessionHandle;
}

// ---------------------------------------------------------------------------
// OpenAI realtime
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RealtimeSttConfig {
    pub api_key: String,
    pub model: String,
    pub vad_threshold: f32,
    pub silence_duration_ms: u64,
    pub url: String,
    pub connect_timeout: Duration,
    pub reconnect: RetryPolicy,
}

impl RealtimeSttConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: "gpt-4o-transcribe".to_string(),
            vad_threshold: 0.5,
            silence_duration_ms: 800,
            url: OPENAI_REALTIME_URL.to_string(),
            connect_timeout: Duration::from_secs(10),
            reconnect: RetryPolicy::default(),
        }
    }
}

pub struct OpenAiRealtimeStt {
    config: RealtimeSttConfig,
}

impl OpenAiRealtimeStt {
    pub fn new(config: RealtimeSttConfig) -> Self {
        Self { config }
    }
}

impl SttProvider for OpenAiRealtimeStt {
    fn create_session(&self) -> SessionHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = RealtimeSession {
            inner: Arc::new(Inner {
                config: self.config.clone(),
                events: tx,
                writer: Mutex::new(None),
                connected: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        };
        SessionHandle {
            session: Arc::new(session),
            events: rx,
        }
    }
}

struct Inner {
    config: RealtimeSttConfig,
    events: mpsc::UnboundedSender<SttEvent>,
    writer: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl Inner {
    fn writer(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Message>>> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn open(&self) -> Result<Socket, MediaError> {
        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| MediaError::Connect(e.to_string()))?;
        let auth = HeaderValue::from_str(&format!("Bearer {}", self.config.api_key))
            .map_err(|e| MediaError::Connect(e.to_string()))?;
        request.headers_mut().insert("Authorization", auth);
        request
            .headers_mut()
            .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        let connect = tokio_tungstenite::connect_async(request);
        match tokio::time::timeout(self.config.connect_timeout, connect).await {
            Err(_) => Err(MediaError::ConnectTimeout(self.config.connect_timeout)),
            Ok(Err(e)) => Err(MediaError::Connect(e.to_string())),
            Ok(Ok((socket, _))) => Ok(socket),
        }
    }

    fn session_update(&self) -> Message {
        let frame = json!({
            "type": "transcription_session.update",
            "session": {
                "input_audio_format": "g711_ulaw",
                "input_audio_transcription": { "model": self.config.model },
                "turn_detection": {
                    "type": "server_vad",
                    "threshold": self.config.vad_threshold,
                    "prefix_padding_ms": 300,
                    "silence_duration_ms": self.config.silence_duration_ms,
                },
            },
        });
        Message::Text(frame.to_string().into())
    }

    /// Drive one socket until it drops or the session is closed.
    async fn pump(&self, socket: Socket) {
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        if sink.send(self.session_update()).await.is_err() {
            return;
        }
        let closed_meanwhile = {
            let mut writer = self.writer();
            if self.is_closed() {
                true
            } else {
                *writer = Some(tx);
                false
            }
        };
        if closed_meanwhile {
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
        self.connected.store(true, Ordering::SeqCst);

        let mut partial = String::new();
        loop {
            tokio::select! {
                outgoing = rx.recv() => match outgoing {
                    Some(msg) => {
                        if sink.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                },
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => self.handle_server_event(text.as_str(), &mut partial),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("[RealtimeSTT] Socket error: {e}");
                        break;
                    }
                },
            }
        }
        self.connected.store(false, Ordering::SeqCst);
        self.writer().take();
    }

    fn handle_server_event(&self, raw: &str, partial: &mut String) {
        #[derive(Deserialize)]
        struct ServerEvent {
            #[serde(rename = "type")]
            kind: String,
            #[serde(default)]
            delta: Option<String>,
            #[serde(default)]
            transcript: Option<String>,
            #[serde(default)]
            error: Option<serde_json::Value>,
        }

        let Ok(event) = serde_json::from_str::<ServerEvent>(raw) else {
            debug!("[RealtimeSTT] Ignoring unparseable frame");
            return;
        };
        match event.kind.as_str() {
            "conversation.item.input_audio_transcription.delta" => {
                if let Some(delta) = event.delta.filter(|d| !d.is_empty()) {
                    partial.push_str(&delta);
                    let _ = self.events.send(SttEvent::Partial(partial.clone()));
                }
            }
            "conversation.item.input_audio_transcription.completed" => {
                partial.clear();
                if let Some(text) = event.transcript.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()) {
                    let _ = self.events.send(SttEvent::Final(text));
                }
            }
            "input_audio_buffer.speech_started" => {
                partial.clear();
                let _ = self.events.send(SttEvent::SpeechStarted);
            }
            "error" => warn!("[RealtimeSTT] Server error: {:?}", event.error),
            _ => {}
        }
    }

    /// Reconnect with backoff. `None` once attempts are exhausted or the
    /// session is closed.
    async fn reconnect(&self) -> Option<Socket> {
        let policy = &self.config.reconnect;
        let mut attempt = 1;
        while policy.allows(attempt) {
            let delay = policy.delay_for(attempt);
            info!(attempt, delay_ms = delay.as_millis() as u64, "[RealtimeSTT] Reconnecting");
            tokio::time::sleep(delay).await;
            if self.is_closed() {
                return None;
            }
            match self.open().await {
                Ok(socket) => return Some(socket),
                Err(e) => warn!(attempt, "[RealtimeSTT] Reconnect failed: {e}"),
            }
            attempt += 1;
        }
        None
    }

    async fn supervise(self: Arc<Self>, mut socket: Socket) {
        loop {
            self.pump(socket).await;
            if self.is_closed() {
                return;
            }
            match self.reconnect().await {
                Some(next) if !self.is_closed() => socket = next,
                Some(_) => return,
                None => {
                    if !self.is_closed() {
                        let attempts = self.config.reconnect.max_attempts;
                        warn!(attempts, "[RealtimeSTT] Giving up on speech session");
                        let _ = self
                            .events
                            .send(SttEvent::Failed(MediaError::ReconnectExhausted(attempts).to_string()));
                    }
                    return;
                }
            }
        }
    }
}

pub struct RealtimeSession {
    inner: Arc<Inner>,
}

#[async_trait]
impl SpeechSession for RealtimeSession {
    async fn connect(&self) -> Result<(), MediaError> {
        if self.inner.is_closed() {
            return Err(MediaError::SessionClosed);
        }
        let socket = self.inner.open().await?;
        info!(model = %self.inner.config.model, "[RealtimeSTT] Connected");
        tokio::spawn(Arc::clone(&self.inner).supervise(socket));
        Ok(())
    }

    fn send_audio(&self, mulaw: &[u8]) {
        let writer = self.inner.writer();
        if let Some(tx) = writer.as_ref() {
            let frame = json!({
                "type": "input_audio_buffer.append",
                "audio": STANDARD.encode(mulaw),
            });
            let _ = tx.send(Message::Text(frame.to_string().into()));
        }
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        // Flag and writer change under the writer lock so a pump that is
        // just starting cannot miss the close.
        let mut writer = self.inner.writer();
        self.inner.closed.store(true, Ordering::SeqCst);
        // Dropping the writer ends the pump, which sends a close frame.
        writer.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    async fn listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/v1/realtime", listener.local_addr().unwrap());
        (listener, url)
    }

    fn config(url: String) -> RealtimeSttConfig {
        RealtimeSttConfig {
            url,
            connect_timeout: Duration::from_millis(500),
            reconnect: RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 10,
                ..Default::default()
            },
            ..RealtimeSttConfig::new("sk-test")
        }
    }

    async fn next_text(socket: &mut WebSocketStream<TcpStream>) -> serde_json::Value {
        loop {
            match socket.next().await.unwrap().unwrap() {
                Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn configures_session_and_emits_transcripts() {
        let (listener, url) = listener().await;
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            let update = next_text(&mut ws).await;
            assert_eq!(update["type"], "transcription_session.update");
            assert_eq!(update["session"]["input_audio_format"], "g711_ulaw");
            let append = next_text(&mut ws).await;
            assert_eq!(append["type"], "input_audio_buffer.append");
            for frame in [
                json!({"type": "input_audio_buffer.speech_started"}),
                json!({"type": "conversation.item.input_audio_transcription.delta", "delta": "hel"}),
                json!({"type": "conversation.item.input_audio_transcription.delta", "delta": "lo"}),
                json!({"type": "conversation.item.input_audio_transcription.completed", "transcript": " hello "}),
            ] {
                ws.send(Message::Text(frame.to_string().into())).await.unwrap();
            }
            ws
        });

        let SessionHandle { session, mut events } =
            OpenAiRealtimeStt::new(config(url)).create_session();
        session.connect().await.unwrap();
        while !session.is_connected() {
            tokio::task::yield_now().await;
        }
        session.send_audio(&[0xFF; 160]);

        assert_eq!(events.recv().await, Some(SttEvent::SpeechStarted));
        assert_eq!(events.recv().await, Some(SttEvent::Partial("hel".into())));
        assert_eq!(events.recv().await, Some(SttEvent::Partial("hello".into())));
        assert_eq!(events.recv().await, Some(SttEvent::Final("hello".into())));
        session.close().await;
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn reconnects_after_drop() {
        let (listener, url) = listener().await;
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut first = accept_async(tcp).await.unwrap();
            let _ = next_text(&mut first).await;
            first.close(None).await.unwrap();

            let (tcp, _) = listener.accept().await.unwrap();
            let mut second = accept_async(tcp).await.unwrap();
            let _ = next_text(&mut second).await;
            let done = json!({"type": "conversation.item.input_audio_transcription.completed", "transcript": "again"});
            second.send(Message::Text(done.to_string().into())).await.unwrap();
            let _ = second.next().await;
        });

        let SessionHandle { session, mut events } =
            OpenAiRealtimeStt::new(config(url)).create_session();
        session.connect().await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv()).await.unwrap();
        assert_eq!(event, Some(SttEvent::Final("again".into())));
        session.close().await;
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let (listener, url) = listener().await;
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            let _ = next_text(&mut ws).await;
            drop(ws);
            drop(listener);
        });

        let SessionHandle { session, mut events } =
            OpenAiRealtimeStt::new(config(url)).create_session();
        session.connect().await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv()).await.unwrap();
        assert!(matches!(event, Some(SttEvent::Failed(msg)) if msg.contains("3 reconnect attempts")));
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn initial_connect_times_out_without_retry() {
        // Accepts TCP but never answers the websocket handshake.
        let (listener, url) = listener().await;
        let held = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(tcp);
        });

        let SessionHandle { session, .. } = OpenAiRealtimeStt::new(config(url)).create_session();
        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, MediaError::ConnectTimeout(_)));
        held.abort();
    }

    #[tokio::test]
    async fn close_suppresses_reconnect() {
        let (listener, url) = listener().await;
        let accepted = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                if let Ok(mut ws) = accept_async(tcp).await {
                    while let Some(Ok(_)) = ws.next().await {}
                }
            }
        });

        let SessionHandle { session, .. } = OpenAiRealtimeStt::new(config(url)).create_session();
        session.connect().await.unwrap();
        session.close().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert!(session.connect().await.is_err());
    }
}
