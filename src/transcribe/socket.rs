use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite};
use tracing::{debug, info, warn};

use super::events::{parse_transcript, RecordingStatus, TranscribeEvent, TranscriptUpdate};
use crate::audio::{AudioFrame, CaptureBackend, CaptureConfig, CpalBackend};

/// Connection state of the transcription socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Idle,
    Connecting,
    Open,
    Closed,
}

/// Configuration for the transcription client.
#[derive(Debug, Clone)]
pub struct TranscribeConfig {
    /// WebSocket endpoint of the transcription backend.
    pub ws_url: String,
    /// Force-stop after this long without an inbound message.
    pub idle_timeout: Duration,
    /// Target sample rate for outgoing PCM frames.
    pub sample_rate: u32,
}

impl Default for TranscribeConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://localhost:8000/recording/".to_string(),
            idle_timeout: Duration::from_secs(300),
            sample_rate: 16000,
        }
    }
}

/// Commands from the transcriber to the socket task, which owns the
/// WebSocket for its whole lifetime.
enum SocketCommand {
    /// One PCM16 frame as raw little-endian bytes.
    Frame(Vec<u8>),
    /// The textual end-of-stream sentinel.
    Sentinel,
    /// Stop the idle countdown (recording stopped, socket kept).
    DisarmIdle,
    /// Close the socket and end the task.
    Close,
}

struct SocketHandle {
    cmd_tx: mpsc::UnboundedSender<SocketCommand>,
    /// True only while the WebSocket is usable; the frame pump drops frames
    /// whenever this is false.
    open: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

type SharedCapture = Arc<Mutex<Option<Box<dyn CaptureBackend>>>>;

/// Transcription socket client.
///
/// At most one recording session is active per instance. `start` acquires
/// the microphone and wires encoded frames to the socket; `stop` releases
/// the microphone but keeps the socket so the session can resume; `submit`
/// sends the `"end"` sentinel and awaits the final transcript; `clear`
/// discards everything.
///
/// Failures never propagate past this type: setup errors and mid-stream
/// transport errors surface as [`TranscribeEvent`]s on the event channel.
pub struct Transcriber {
    config: TranscribeConfig,
    events_tx: mpsc::UnboundedSender<TranscribeEvent>,
    socket: Option<SocketHandle>,
    capture: SharedCapture,
    is_recording: Arc<AtomicBool>,
    state: Arc<StdMutex<SocketState>>,
    pump_task: Option<JoinHandle<()>>,
}

impl Transcriber {
    /// Create a transcriber and the event channel its consumer reads from.
    pub fn new(config: TranscribeConfig) -> (Self, mpsc::UnboundedReceiver<TranscribeEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                config,
                events_tx,
                socket: None,
                capture: Arc::new(Mutex::new(None)),
                is_recording: Arc::new(AtomicBool::new(false)),
                state: Arc::new(StdMutex::new(SocketState::Idle)),
                pump_task: None,
            },
            events_rx,
        )
    }

    pub fn socket_state(&self) -> SocketState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_recording(&self) -> bool {
        self.is_recording.load(Ordering::SeqCst)
    }

    /// Start recording with the default microphone backend.
    pub async fn start(&mut self) {
        let backend = CpalBackend::new(CaptureConfig {
            target_sample_rate: self.config.sample_rate,
            ..CaptureConfig::default()
        });
        self.start_with_backend(Box::new(backend)).await;
    }

    /// Start recording with a caller-provided capture backend.
    ///
    /// No-op if a session is already recording. Setup failures (socket or
    /// microphone) emit a single `Error` event and leave the client idle.
    pub async fn start_with_backend(&mut self, mut backend: Box<dyn CaptureBackend>) {
        if self.is_recording.load(Ordering::SeqCst) {
            debug!("start ignored: already recording");
            return;
        }

        let (open, cmd_tx) = match self.ensure_socket().await {
            Ok(pair) => pair,
            Err(e) => {
                self.emit(TranscribeEvent::Error(format!(
                    "could not start transcription: {e:#}"
                )));
                return;
            }
        };

        let frames_rx = match backend.start().await {
            Ok(rx) => rx,
            Err(e) => {
                self.emit(TranscribeEvent::Error(format!(
                    "could not start microphone: {e:#}"
                )));
                return;
            }
        };
        *self.capture.lock().await = Some(backend);

        // Frame pump: forward encoded frames while the socket is open.
        // Frames produced while it is not open are dropped, not queued.
        self.pump_task = Some(tokio::spawn(pump_frames(frames_rx, open, cmd_tx)));

        self.is_recording.store(true, Ordering::SeqCst);
        self.emit(TranscribeEvent::Status(RecordingStatus::Recording));
        info!("recording started");
    }

    /// Stop recording: release the microphone and disarm the idle timer.
    /// The socket stays open so the session can resume. Idempotent.
    pub async fn stop(&mut self) {
        let was_recording = self.is_recording.swap(false, Ordering::SeqCst);
        halt_capture(&self.capture).await;
        if let Some(pump) = self.pump_task.take() {
            pump.abort();
        }
        if let Some(handle) = &self.socket {
            let _ = handle.cmd_tx.send(SocketCommand::DisarmIdle);
        }
        if was_recording {
            self.emit(TranscribeEvent::Status(RecordingStatus::Paused));
            info!("recording stopped");
        }
    }

    /// Stop recording and send the end-of-stream sentinel; the final
    /// transcript arrives later as a `Complete` event.
    pub async fn submit(&mut self) {
        self.stop().await;
        if let Some(handle) = &self.socket {
            if handle.open.load(Ordering::SeqCst) {
                let _ = handle.cmd_tx.send(SocketCommand::Sentinel);
                self.emit(TranscribeEvent::Status(RecordingStatus::Processing));
                info!("end sentinel sent, awaiting final transcript");
            }
        }
    }

    /// Stop recording, close and discard the socket, reset to idle.
    pub async fn clear(&mut self) {
        self.stop().await;
        if let Some(handle) = self.socket.take() {
            let _ = handle.cmd_tx.send(SocketCommand::Close);
            let _ = handle.task.await;
        }
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = SocketState::Idle;
        self.emit(TranscribeEvent::Status(RecordingStatus::Ready));
        info!("session cleared");
    }

    /// Connect the transcription socket unless an open one already exists
    /// (a session resuming after stop reuses its socket). Returns the open
    /// flag and command sender for the frame pump.
    async fn ensure_socket(
        &mut self,
    ) -> Result<(Arc<AtomicBool>, mpsc::UnboundedSender<SocketCommand>)> {
        if let Some(handle) = &self.socket {
            if handle.open.load(Ordering::SeqCst) {
                return Ok((Arc::clone(&handle.open), handle.cmd_tx.clone()));
            }
            // Previous socket died; let its task wind down and reconnect.
            self.socket = None;
        }

        self.set_state(SocketState::Connecting);
        let connect = connect_async(self.config.ws_url.as_str()).await;
        let (ws, _) = match connect {
            Ok(pair) => pair,
            Err(e) => {
                self.set_state(SocketState::Idle);
                return Err(e).context("failed to open transcription socket");
            }
        };
        info!(url = %self.config.ws_url, "transcription socket connected");

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(run_socket(
            ws,
            cmd_rx,
            Arc::clone(&open),
            Arc::clone(&self.state),
            self.events_tx.clone(),
            Arc::clone(&self.capture),
            Arc::clone(&self.is_recording),
            self.config.idle_timeout,
        ));
        self.socket = Some(SocketHandle {
            cmd_tx: cmd_tx.clone(),
            open: Arc::clone(&open),
            task,
        });
        self.set_state(SocketState::Open);
        Ok((open, cmd_tx))
    }

    fn set_state(&self, state: SocketState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn emit(&self, event: TranscribeEvent) {
        let _ = self.events_tx.send(event);
    }
}

/// Forward frames to the socket task while the socket is open; drop them
/// otherwise. Ends when the capture side closes the frame channel.
async fn pump_frames(
    mut frames_rx: mpsc::Receiver<AudioFrame>,
    open: Arc<AtomicBool>,
    cmd_tx: mpsc::UnboundedSender<SocketCommand>,
) {
    while let Some(frame) = frames_rx.recv().await {
        if !open.load(Ordering::SeqCst) {
            debug!("socket not open, dropping frame");
            continue;
        }
        if cmd_tx
            .send(SocketCommand::Frame(frame.to_pcm_bytes()))
            .is_err()
        {
            break;
        }
    }
    debug!("frame pump ended");
}

/// Socket task: owns the WebSocket, multiplexes outbound commands, inbound
/// transcript messages, and the idle countdown.
#[allow(clippy::too_many_arguments)]
async fn run_socket(
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    mut cmd_rx: mpsc::UnboundedReceiver<SocketCommand>,
    open: Arc<AtomicBool>,
    state: Arc<StdMutex<SocketState>>,
    events_tx: mpsc::UnboundedSender<TranscribeEvent>,
    capture: SharedCapture,
    is_recording: Arc<AtomicBool>,
    idle_timeout: Duration,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    // Armed on the first inbound message, rearmed on every one after.
    let mut idle_armed = false;
    let idle = tokio::time::sleep(idle_timeout);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(SocketCommand::Frame(bytes)) => {
                    if ws_tx.send(tungstenite::Message::Binary(bytes.into())).await.is_err() {
                        force_stop(&capture, &is_recording, &events_tx).await;
                        let _ = events_tx.send(TranscribeEvent::Error(
                            "transcription socket send failed".to_string(),
                        ));
                        break;
                    }
                }
                Some(SocketCommand::Sentinel) => {
                    if ws_tx.send(tungstenite::Message::Text("end".into())).await.is_err() {
                        let _ = events_tx.send(TranscribeEvent::Error(
                            "failed to send end sentinel".to_string(),
                        ));
                        break;
                    }
                }
                Some(SocketCommand::DisarmIdle) => {
                    idle_armed = false;
                }
                Some(SocketCommand::Close) | None => {
                    let _ = ws_tx.close().await;
                    break;
                }
            },
            msg = ws_rx.next() => match msg {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    idle_armed = true;
                    idle.as_mut().reset(Instant::now() + idle_timeout);
                    match parse_transcript(&text) {
                        Some(TranscriptUpdate::Complete(t)) => {
                            let _ = events_tx.send(TranscribeEvent::Complete(t));
                            let _ = events_tx.send(TranscribeEvent::Status(RecordingStatus::Complete));
                        }
                        Some(TranscriptUpdate::Partial(t)) => {
                            let _ = events_tx.send(TranscribeEvent::Partial(t));
                        }
                        // Malformed payloads are dropped, stream continues.
                        None => debug!("dropping malformed transcript payload"),
                    }
                }
                Some(Ok(tungstenite::Message::Close(frame))) => {
                    warn!(?frame, "transcription socket closed by server");
                    force_stop(&capture, &is_recording, &events_tx).await;
                    break;
                }
                Some(Ok(_)) => {} // ping/pong etc.
                Some(Err(e)) => {
                    warn!("transcription socket error: {}", e);
                    force_stop(&capture, &is_recording, &events_tx).await;
                    let _ = events_tx.send(TranscribeEvent::Error(format!(
                        "transcription socket error: {e}"
                    )));
                    break;
                }
                None => {
                    force_stop(&capture, &is_recording, &events_tx).await;
                    break;
                }
            },
            _ = &mut idle, if idle_armed => {
                warn!("transcription idle timeout, stopping recording");
                idle_armed = false;
                force_stop(&capture, &is_recording, &events_tx).await;
                let _ = events_tx.send(TranscribeEvent::IdleTimeout);
            }
        }
    }

    open.store(false, Ordering::SeqCst);
    *state.lock().unwrap_or_else(|e| e.into_inner()) = SocketState::Closed;
    debug!("socket task ended");
}

/// Release the capture backend if one is held. Used by the socket task on
/// timeout/error and by `Transcriber::stop`; safe when nothing is recording.
async fn force_stop(
    capture: &SharedCapture,
    is_recording: &Arc<AtomicBool>,
    events_tx: &mpsc::UnboundedSender<TranscribeEvent>,
) {
    let was_recording = is_recording.swap(false, Ordering::SeqCst);
    let backend = capture.lock().await.take();
    if let Some(mut backend) = backend {
        if let Err(e) = backend.stop().await {
            warn!("failed to stop capture backend: {}", e);
        }
    }
    if was_recording {
        let _ = events_tx.send(TranscribeEvent::Status(RecordingStatus::Paused));
    }
}

/// `Transcriber::stop` shares the release path with the socket task.
async fn halt_capture(capture: &SharedCapture) {
    let backend = capture.lock().await.take();
    if let Some(mut backend) = backend {
        if let Err(e) = backend.stop().await {
            warn!("failed to stop capture backend: {}", e);
        }
    }
}
