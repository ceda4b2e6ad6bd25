use serde::Deserialize;

/// Lifecycle status of the recording surface, mirrored to the embedding UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingStatus {
    /// No session, ready to record.
    Ready,
    Recording,
    /// Capture released, socket kept for resume.
    Paused,
    /// End sentinel sent, awaiting the final transcript.
    Processing,
    /// Final transcript received.
    Complete,
}

/// Events surfaced by the transcriber to its consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscribeEvent {
    /// Live partial transcript text (replaces the previous partial).
    Partial(String),
    /// Final transcript for the session.
    Complete(String),
    Status(RecordingStatus),
    /// Terminal failure for the attempted session ("could not start") or a
    /// mid-stream transport error that forced a stop.
    Error(String),
    /// No inbound message for the configured idle window; capture was
    /// force-stopped.
    IdleTimeout,
}

/// Decoded inbound transcription message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptUpdate {
    Partial(String),
    Complete(String),
}

#[derive(Debug, Deserialize)]
struct TranscriptPayload {
    #[serde(rename = "type")]
    kind: Option<String>,
    text: Option<String>,
}

/// Parse one inbound socket message.
///
/// `{"type":"complete","text":...}` is the final transcript; any other JSON
/// object carrying `text` is a partial update. Malformed payloads are
/// dropped (`None`) without disturbing the stream.
pub fn parse_transcript(raw: &str) -> Option<TranscriptUpdate> {
    let payload: TranscriptPayload = serde_json::from_str(raw).ok()?;
    let text = payload.text?;
    if payload.kind.as_deref() == Some("complete") {
        Some(TranscriptUpdate::Complete(text))
    } else {
        Some(TranscriptUpdate::Partial(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_payload_is_final() {
        let update = parse_transcript(r#"{"type":"complete","text":"all done"}"#);
        assert_eq!(update, Some(TranscriptUpdate::Complete("all done".into())));
    }

    #[test]
    fn bare_text_is_partial() {
        let update = parse_transcript(r#"{"text":"so far"}"#);
        assert_eq!(update, Some(TranscriptUpdate::Partial("so far".into())));
    }

    #[test]
    fn malformed_payloads_are_dropped() {
        assert_eq!(parse_transcript("not json"), None);
        assert_eq!(parse_transcript(r#"{"type":"complete"}"#), None);
        assert_eq!(parse_transcript("{}"), None);
    }
}
