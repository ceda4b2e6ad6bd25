// Microphone capture backend.
//
// The cpal stream callback runs in a realtime context and must never block,
// so it only downmixes to mono and try-sends the raw block into a bounded
// sync channel. A dedicated processing thread owns the stream and the
// resampling encoder, and forwards finished PCM16 frames into an async
// channel with try_send; a full channel drops the frame rather than
// stalling the audio pipeline.

use anyhow::{anyhow, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::encoder::PcmEncoder;
use super::AudioFrame;

/// Configuration for a capture backend.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Target sample rate after resampling (the transcription backend
    /// expects 16 kHz).
    pub target_sample_rate: u32,
    /// Capacity of the frame channel handed to the consumer.
    pub frame_channel_capacity: usize,
    /// Optional input device name; `None` uses the system default.
    pub device_name: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            target_sample_rate: 16000,
            frame_channel_capacity: 64,
            device_name: None,
        }
    }
}

/// Audio capture seam.
///
/// The production implementation wraps cpal; tests substitute a scripted
/// source feeding the same frame channel.
#[async_trait::async_trait]
pub trait CaptureBackend: Send + Sync {
    /// Start capturing. Returns the receiving end of the frame channel.
    ///
    /// Device and permission failures surface here as errors; they must not
    /// panic past the caller.
    async fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>>;

    /// Stop capturing and release the device. Safe to call when idle.
    async fn stop(&mut self) -> Result<()>;

    fn is_capturing(&self) -> bool;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

/// cpal-based microphone backend.
///
/// `cpal::Stream` is not `Send`, so a std thread owns the stream for its
/// whole lifetime and doubles as the encoder's processing thread.
pub struct CpalBackend {
    config: CaptureConfig,
    capturing: Arc<AtomicBool>,
    shutdown_tx: Option<std::sync::mpsc::Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl CpalBackend {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            capturing: Arc::new(AtomicBool::new(false)),
            shutdown_tx: None,
            thread: None,
        }
    }
}

#[async_trait::async_trait]
impl CaptureBackend for CpalBackend {
    async fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>> {
        if self.capturing.load(Ordering::SeqCst) {
            return Err(anyhow!("capture already running"));
        }

        let (frames_tx, frames_rx) = mpsc::channel(self.config.frame_channel_capacity);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<u32>>();
        let (shutdown_tx, shutdown_rx) = std::sync::mpsc::channel::<()>();

        let config = self.config.clone();
        let capturing = Arc::clone(&self.capturing);

        let thread = std::thread::spawn(move || {
            run_capture(config, capturing, frames_tx, ready_tx, shutdown_rx);
        });

        // Wait for the stream to open (or fail) before reporting success.
        let native_rate = ready_rx
            .await
            .context("capture thread exited before reporting readiness")??;

        info!(native_rate, "microphone capture started");
        self.shutdown_tx = Some(shutdown_tx);
        self.thread = Some(thread);
        Ok(frames_rx)
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            // The thread only holds the device between shutdown and exit for
            // a bounded poll interval; join off the async runtime.
            tokio::task::spawn_blocking(move || {
                if thread.join().is_err() {
                    warn!("capture thread panicked during shutdown");
                }
            })
            .await?;
        }
        self.capturing.store(false, Ordering::SeqCst);
        info!("microphone capture stopped");
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        "cpal-microphone"
    }
}

impl Drop for CpalBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Body of the capture thread: open the device, run the stream, pump raw
/// blocks through the encoder until shutdown.
fn run_capture(
    config: CaptureConfig,
    capturing: Arc<AtomicBool>,
    frames_tx: mpsc::Sender<AudioFrame>,
    ready_tx: oneshot::Sender<Result<u32>>,
    shutdown_rx: std::sync::mpsc::Receiver<()>,
) {
    let host = cpal::default_host();

    let device = match &config.device_name {
        Some(name) => {
            let found = host
                .input_devices()
                .ok()
                .and_then(|mut it| it.find(|d| d.name().map(|n| &n == name).unwrap_or(false)));
            match found {
                Some(d) => d,
                None => {
                    let _ = ready_tx.send(Err(anyhow!("input device '{}' not found", name)));
                    return;
                }
            }
        }
        None => match host.default_input_device() {
            Some(d) => d,
            None => {
                let _ = ready_tx.send(Err(anyhow!("no default input device")));
                return;
            }
        },
    };

    let stream_config = match device.default_input_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            let _ = ready_tx.send(Err(anyhow!("no usable input config: {}", e)));
            return;
        }
    };
    let native_rate = stream_config.sample_rate().0;
    let channels = stream_config.channels() as usize;
    debug!(native_rate, channels, "opening input stream");

    // Realtime callback → processing loop handoff. Bounded; overflow drops.
    let (raw_tx, raw_rx) = std::sync::mpsc::sync_channel::<Vec<f32>>(128);

    let stream = device.build_input_stream(
        &stream_config.into(),
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            let mono: Vec<f32> = if channels > 1 {
                data.chunks(channels)
                    .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                    .collect()
            } else {
                data.to_vec()
            };
            let _ = raw_tx.try_send(mono);
        },
        |err| {
            warn!("input stream error: {}", err);
        },
        None,
    );

    let stream = match stream {
        Ok(s) => s,
        Err(e) => {
            let _ = ready_tx.send(Err(anyhow!("failed to build input stream: {}", e)));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(anyhow!("failed to start input stream: {}", e)));
        return;
    }

    capturing.store(true, Ordering::SeqCst);
    let _ = ready_tx.send(Ok(native_rate));

    let mut encoder = PcmEncoder::new(native_rate, config.target_sample_rate);
    let started = Instant::now();

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }
        match raw_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(block) => {
                if let Some(samples) = encoder.ingest(&block) {
                    let frame = AudioFrame {
                        samples,
                        sample_rate: config.target_sample_rate,
                        timestamp_ms: started.elapsed().as_millis() as u64,
                    };
                    // Drop the frame if the consumer is behind.
                    match frames_tx.try_send(frame) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            debug!("frame channel full, dropping frame");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => break,
                    }
                }
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    capturing.store(false, Ordering::SeqCst);
    drop(stream);
    debug!("capture thread exiting");
}
