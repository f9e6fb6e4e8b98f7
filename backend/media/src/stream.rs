//! Media stream handler: one entry per live carrier media socket.
//!
//! The transport (an axum WebSocket in the gateway) is kept out of here.
//! A [`StreamConnection`] carries an outbound channel the transport drains,
//! and raw inbound text frames are fed to [`MediaStreamHandler::handle_message`].
//! Call-level consequences are reported as [`StreamEvent`]s on an mpsc
//! channel owned by whoever constructed the handler.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use callforge_tts::{MULAW_FRAME_BYTES, chunk_frames};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::MediaError;
use crate::protocol::{InboundFrame, OutboundFrame};
use crate::realtime::{SessionHandle, SpeechSession, SttEvent, SttProvider};
use crate::tts_queue::{PlaybackOutcome, TtsQueue};

/// Pacing between 20 ms mu-law frames.
pub const FRAME_INTERVAL: Duration = Duration::from_millis(20);

/// What the transport should do next.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutput {
    Text(String),
    Close,
}

/// Transport-side state of one media socket.
pub struct StreamConnection {
    outbound: mpsc::UnboundedSender<StreamOutput>,
    stream_sid: Option<String>,
}

impl StreamConnection {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StreamOutput>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { outbound: tx, stream_sid: None }, rx)
    }

    pub fn stream_sid(&self) -> Option<&str> {
        self.stream_sid.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEventKind {
    Connected,
    Transcript(String),
    PartialTranscript(String),
    SpeechStarted,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    /// Engine call id from the stream's custom parameters, when present.
    pub call_id: Option<String>,
    /// Carrier call id (`CallSid`).
    pub provider_call_id: String,
    pub stream_sid: String,
    pub kind: StreamEventKind,
}

struct StreamEntry {
    call_id: Option<String>,
    provider_call_id: String,
    outbound: mpsc::UnboundedSender<StreamOutput>,
    queue: TtsQueue,
    session: Option<Arc<dyn SpeechSession>>,
}

struct Shared {
    stt: Option<Arc<dyn SttProvider>>,
    streams: Mutex<HashMap<String, StreamEntry>>,
    events: mpsc::UnboundedSender<StreamEvent>,
}

#[derive(Clone)]
pub struct MediaStreamHandler {
    shared: Arc<Shared>,
}

impl MediaStreamHandler {
    pub fn new(stt: Option<Arc<dyn SttProvider>>) -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let shared = Shared {
            stt,
            streams: Mutex::new(HashMap::new()),
            events,
        };
        (Self { shared: Arc::new(shared) }, rx)
    }

    fn streams(&self) -> MutexGuard<'_, HashMap<String, StreamEntry>> {
        self.shared.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, stream_sid: &str, call_id: Option<String>, provider_call_id: String, kind: StreamEventKind) {
        let _ = self.shared.events.send(StreamEvent {
            call_id,
            provider_call_id,
            stream_sid: stream_sid.to_string(),
            kind,
        });
    }

    /// Feed one inbound text frame from the carrier.
    pub async fn handle_message(&self, conn: &mut StreamConnection, raw: &str) -> Result<(), MediaError> {
        match serde_json::from_str::<InboundFrame>(raw)? {
            InboundFrame::Connected { protocol } => {
                debug!(?protocol, "[MediaStream] Carrier connected");
            }
            InboundFrame::Start { stream_sid, start } => {
                let call_id = start.custom_parameters.get("callId").cloned();
                conn.stream_sid = Some(stream_sid.clone());
                self.start_stream(conn, stream_sid, start.call_sid, call_id).await;
            }
            InboundFrame::Media { media, .. } => {
                let Some(stream_sid) = conn.stream_sid.as_deref() else {
                    return Ok(());
                };
                let session = self.streams().get(stream_sid).and_then(|e| e.session.clone());
                if let Some(session) = session {
                    match STANDARD.decode(media.payload.as_bytes()) {
                        Ok(audio) => session.send_audio(&audio),
                        Err(e) => debug!("[MediaStream] Bad media payload: {e}"),
                    }
                }
            }
            InboundFrame::Mark { mark, .. } => {
                debug!(mark = %mark.name, "[MediaStream] Playback mark reached");
            }
            InboundFrame::Stop { .. } => {
                self.handle_disconnect(conn).await;
            }
            InboundFrame::Unknown => {}
        }
        Ok(())
    }

    async fn start_stream(
        &self,
        conn: &StreamConnection,
        stream_sid: String,
        provider_call_id: String,
        call_id: Option<String>,
    ) {
        info!(
            stream_sid = %stream_sid,
            provider_call_id = %provider_call_id,
            call_id = ?call_id,
            "[MediaStream] Stream started"
        );

        let session = match self.connect_session(&stream_sid).await {
            Ok(session) => Some(session),
            Err(MediaError::NoSpeechProvider) => None,
            Err(e) => {
                warn!(stream_sid = %stream_sid, "[MediaStream] Speech session unavailable: {e}");
                None
            }
        };

        self.streams().insert(
            stream_sid.clone(),
            StreamEntry {
                call_id: call_id.clone(),
                provider_call_id: provider_call_id.clone(),
                outbound: conn.outbound.clone(),
                queue: TtsQueue::new(),
                session,
            },
        );
        self.emit(&stream_sid, call_id, provider_call_id, StreamEventKind::Connected);
    }

    /// Create and connect a speech session, forwarding its events for `stream_sid`.
    async fn connect_session(&self, stream_sid: &str) -> Result<Arc<dyn SpeechSession>, MediaError> {
        let stt = self.shared.stt.as_ref().ok_or(MediaError::NoSpeechProvider)?;
        let SessionHandle { session, events } = stt.create_session();
        session.connect().await?;
        self.spawn_stt_forwarder(stream_sid.to_string(), session.clone(), events);
        Ok(session)
    }

    /// Make sure the stream has a live speech session, replacing one that
    /// failed or never connected.
    pub async fn ensure_session(&self, stream_sid: &str) -> Result<(), MediaError> {
        let has_session = self.streams().get(stream_sid).map(|e| e.session.is_some());
        match has_session {
            None => return Err(MediaError::NoStream(stream_sid.to_string())),
            Some(true) => return Ok(()),
            Some(false) => {}
        }

        let session = self.connect_session(stream_sid).await?;
        let installed = {
            let mut streams = self.streams();
            match streams.get_mut(stream_sid) {
                Some(entry) if entry.session.is_none() => {
                    entry.session = Some(session.clone());
                    Some(true)
                }
                // Another listen cycle got there first.
                Some(_) => Some(false),
                None => None,
            }
        };
        match installed {
            Some(true) => {
                info!(stream_sid = %stream_sid, "[MediaStream] Speech session restored");
                Ok(())
            }
            Some(false) => {
                session.close().await;
                Ok(())
            }
            None => {
                session.close().await;
                Err(MediaError::NoStream(stream_sid.to_string()))
            }
        }
    }

    pub fn has_session(&self, stream_sid: &str) -> bool {
        self.streams().get(stream_sid).is_some_and(|e| e.session.is_some())
    }

    fn spawn_stt_forwarder(
        &self,
        stream_sid: String,
        session: Arc<dyn SpeechSession>,
        mut events: mpsc::UnboundedReceiver<SttEvent>,
    ) {
        let handler = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let ids = handler
                    .streams()
                    .get(&stream_sid)
                    .map(|e| (e.call_id.clone(), e.provider_call_id.clone()));
                let Some((call_id, provider_call_id)) = ids else {
                    break;
                };
                let kind = match event {
                    SttEvent::Partial(text) => StreamEventKind::PartialTranscript(text),
                    SttEvent::Final(text) => StreamEventKind::Transcript(text),
                    SttEvent::SpeechStarted => {
                        // Barge-in: the caller talks over us.
                        handler.clear_tts_queue(&stream_sid);
                        StreamEventKind::SpeechStarted
                    }
                    SttEvent::Failed(reason) => {
                        warn!(stream_sid = %stream_sid, "[MediaStream] Transcription lost: {reason}");
                        handler.drop_session(&stream_sid, &session);
                        break;
                    }
                };
                handler.emit(&stream_sid, call_id, provider_call_id, kind);
            }
        });
    }

    /// Forget `session` if it is still the stream's current one.
    fn drop_session(&self, stream_sid: &str, session: &Arc<dyn SpeechSession>) {
        let mut streams = self.streams();
        if let Some(entry) = streams.get_mut(stream_sid) {
            if entry.session.as_ref().is_some_and(|s| Arc::ptr_eq(s, session)) {
                entry.session = None;
            }
        }
    }

    /// The socket is gone (or the carrier sent `stop`).
    pub async fn handle_disconnect(&self, conn: &StreamConnection) {
        let Some(stream_sid) = conn.stream_sid.as_deref() else {
            return;
        };
        let Some(entry) = self.streams().remove(stream_sid) else {
            return;
        };
        entry.queue.clear();
        if let Some(session) = &entry.session {
            session.close().await;
        }
        info!(stream_sid = %stream_sid, "[MediaStream] Stream ended");
        self.emit(stream_sid, entry.call_id, entry.provider_call_id, StreamEventKind::Disconnected);
    }

    /// Stream id for a call, matched by engine call id or carrier call id.
    pub fn stream_for_call(&self, call_id: &str) -> Option<String> {
        self.streams()
            .iter()
            .find(|(_, e)| e.call_id.as_deref() == Some(call_id) || e.provider_call_id == call_id)
            .map(|(sid, _)| sid.clone())
    }

    pub fn active_streams(&self) -> usize {
        self.streams().len()
    }

    /// Queue playback on a stream. `job` receives the playback token and
    /// typically synthesizes speech then calls [`Self::play_audio`].
    pub fn queue_tts<F, Fut>(&self, stream_sid: &str, job: F) -> Result<oneshot::Receiver<PlaybackOutcome>, MediaError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let streams = self.streams();
        let entry = streams
            .get(stream_sid)
            .ok_or_else(|| MediaError::NoStream(stream_sid.to_string()))?;
        Ok(entry.queue.enqueue(job))
    }

    pub fn tts_queue_len(&self, stream_sid: &str) -> usize {
        self.streams().get(stream_sid).map_or(0, |e| e.queue.len())
    }

    /// Drop queued playback, stop the current one, and tell the carrier to
    /// discard buffered audio.
    pub fn clear_tts_queue(&self, stream_sid: &str) {
        let streams = self.streams();
        let Some(entry) = streams.get(stream_sid) else {
            return;
        };
        entry.queue.clear();
        let _ = entry
            .outbound
            .send(StreamOutput::Text(OutboundFrame::clear(stream_sid).to_json()));
    }

    /// Send mu-law audio as paced 160-byte frames.
    ///
    /// Cancellation is checked before and after every frame, so a cleared
    /// job emits nothing further once the token trips.
    pub async fn play_audio(
        &self,
        stream_sid: &str,
        audio: Bytes,
        cancel: &CancellationToken,
    ) -> Result<PlaybackOutcome, MediaError> {
        let outbound = self
            .streams()
            .get(stream_sid)
            .map(|e| e.outbound.clone())
            .ok_or_else(|| MediaError::NoStream(stream_sid.to_string()))?;

        for frame in chunk_frames(&audio, MULAW_FRAME_BYTES) {
            if cancel.is_cancelled() {
                return Ok(PlaybackOutcome::Cancelled);
            }
            let msg = OutboundFrame::media(stream_sid, STANDARD.encode(frame)).to_json();
            outbound
                .send(StreamOutput::Text(msg))
                .map_err(|_| MediaError::StreamClosed)?;
            tokio::select! {
                _ = cancel.cancelled() => return Ok(PlaybackOutcome::Cancelled),
                _ = tokio::time::sleep(FRAME_INTERVAL) => {}
            }
            if cancel.is_cancelled() {
                return Ok(PlaybackOutcome::Cancelled);
            }
        }
        let _ = outbound.send(StreamOutput::Text(OutboundFrame::mark(stream_sid, "playback-done").to_json()));
        Ok(PlaybackOutcome::Completed)
    }

    /// Server-side close of a call's stream.
    pub async fn close_stream_for_call(&self, call_id: &str) -> bool {
        let Some(stream_sid) = self.stream_for_call(call_id) else {
            return false;
        };
        let Some(entry) = self.streams().remove(&stream_sid) else {
            return false;
        };
        entry.queue.clear();
        if let Some(session) = &entry.session {
            session.close().await;
        }
        let _ = entry.outbound.send(StreamOutput::Close);
        self.emit(&stream_sid, entry.call_id, entry.provider_call_id, StreamEventKind::Disconnected);
        true
    }
}
