//! Chat streaming session management
//!
//! This module drives the conversation tabs of the side panel:
//! - `events`: wire types for the server-sent event stream and messages
//! - `stream`: line-delimited `data: ` event decoder over a streaming body
//! - `api`: the chat backend seam and its reqwest implementation
//! - `manager`: multi-tab session state, send dispatch, event folding

pub mod api;
pub mod events;
pub mod manager;
pub mod stream;

pub use api::{ChatBackend, ChatRequest, EventStream, HttpBackend};
pub use events::{Attachment, Message, StreamEvent};
pub use manager::{ChatManager, Tab, MAX_TABS};
pub use stream::SseDecoder;
