//! Transcription socket client
//!
//! Owns the WebSocket to the transcription backend for one recording
//! session at a time: binary PCM16 frames go out, partial/final transcript
//! JSON comes back. Stop keeps the socket for a later resume; submit sends
//! the `"end"` sentinel; clear discards the socket entirely.

mod events;
mod socket;

pub use events::{parse_transcript, RecordingStatus, TranscribeEvent, TranscriptUpdate};
pub use socket::{SocketState, TranscribeConfig, Transcriber};
