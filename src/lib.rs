pub mod audio;
pub mod chat;
pub mod config;
pub mod store;
pub mod transcribe;

pub use audio::{AudioFrame, CaptureBackend, CaptureConfig, CpalBackend, PcmEncoder};
pub use chat::{
    Attachment, ChatBackend, ChatManager, ChatRequest, HttpBackend, Message, SseDecoder,
    StreamEvent, Tab, MAX_TABS,
};
pub use config::Config;
pub use store::{FileTabStore, MemoryTabStore, TabStore};
pub use transcribe::{
    RecordingStatus, SocketState, TranscribeConfig, TranscribeEvent, Transcriber,
};
