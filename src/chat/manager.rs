use anyhow::{Context, Result};
use futures::StreamExt;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::api::{ChatBackend, ChatRequest};
use super::events::{Attachment, Message, StreamEvent};
use crate::store::TabStore;

/// Hard cap on concurrent conversation tabs.
pub const MAX_TABS: usize = 6;

/// Tool names whose results mutate external clinical state; seeing one in
/// the stream triggers the host-page reload hook.
const RELOAD_TOOLS: &[&str] = &[
    "create_appointment",
    "update_appointment",
    "delete_appointment",
    "save_note",
];

const SEND_ERROR_TEXT: &str = "An unexpected error occurred, please try again.";

/// One conversation tab: ordered history plus its send gate.
#[derive(Debug, Clone)]
pub struct Tab {
    pub id: String,
    pub messages: Vec<Message>,
    /// True while a send for this tab is in flight; gates new sends.
    pub busy: bool,
    /// History fetched from the backend at least once.
    pub loaded: bool,
}

impl Tab {
    fn new(id: String) -> Self {
        Self {
            id,
            messages: Vec::new(),
            busy: false,
            loaded: false,
        }
    }
}

/// Panel-wide tab state. Kept behind one lock so multi-tab invariants
/// (count bounds, single active pointer) hold under concurrent sends.
#[derive(Debug, Default)]
struct PanelState {
    tabs: Vec<Tab>,
    active: Option<String>,
    suggestions: Vec<String>,
}

impl PanelState {
    fn tab_mut(&mut self, id: &str) -> Option<&mut Tab> {
        self.tabs.iter_mut().find(|t| t.id == id)
    }

    /// Split borrow for the reducer: the target tab and the suggestion set.
    fn tab_and_suggestions(&mut self, id: &str) -> (Option<&mut Tab>, &mut Vec<String>) {
        let PanelState {
            tabs, suggestions, ..
        } = self;
        (tabs.iter_mut().find(|t| t.id == id), suggestions)
    }
}

/// Cursor for the one message currently being streamed into a tab.
#[derive(Debug, Default)]
pub(crate) struct StreamCursor {
    streaming_id: Option<Uuid>,
    accumulated: String,
}

/// Side effect requested by the reducer, executed outside the state lock.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SideEffect {
    ReloadHost,
}

type ReloadHook = Box<dyn Fn() + Send + Sync>;

/// Multi-tab chat session manager.
///
/// Owns up to [`MAX_TABS`] tabs against one backend session, dispatches
/// sends, folds decoded stream events into tab state, and fires the
/// host-reload hook for mutating tool results. Without a backend session
/// id every operation is a silent no-op.
pub struct ChatManager {
    backend: Arc<dyn ChatBackend>,
    store: Arc<dyn TabStore>,
    session_id: Option<String>,
    state: Arc<Mutex<PanelState>>,
    reload_hook: Arc<StdMutex<Option<ReloadHook>>>,
}

impl ChatManager {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        store: Arc<dyn TabStore>,
        session_id: Option<String>,
    ) -> Self {
        Self {
            backend,
            store,
            session_id,
            state: Arc::new(Mutex::new(PanelState::default())),
            reload_hook: Arc::new(StdMutex::new(None)),
        }
    }

    /// Register the host-page reload hook fired on mutating tool results.
    pub fn set_reload_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.reload_hook.lock().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(hook));
    }

    /// Load the remote tab list, creating the first tab if none exist, and
    /// restore the persisted active tab when it is still valid.
    pub async fn init(&self) -> Result<()> {
        let Some(session_id) = self.session_id.clone() else {
            debug!("no backend session, skipping init");
            return Ok(());
        };

        let mut ids = self
            .backend
            .list_chat_sessions(&session_id)
            .await
            .context("failed to list chat tabs")?;
        if ids.is_empty() {
            let id = self
                .backend
                .create_chat_session(&session_id)
                .await
                .context("failed to create initial chat tab")?;
            ids.push(id);
        }

        let saved = self.store.active_tab().await.unwrap_or_default();
        let active = saved
            .filter(|id| ids.contains(id))
            .unwrap_or_else(|| ids[0].clone());

        {
            let mut state = self.state.lock().await;
            state.tabs = ids.into_iter().map(Tab::new).collect();
            state.active = Some(active.clone());
        }
        self.load_history(&active).await;
        info!(active = %active, "chat panel initialized");
        Ok(())
    }

    /// Provision a new tab and make it active. Silent no-op at the tab cap
    /// or without a backend session.
    pub async fn create_tab(&self) -> Result<()> {
        let Some(session_id) = self.session_id.clone() else {
            return Ok(());
        };
        {
            let state = self.state.lock().await;
            if state.tabs.len() >= MAX_TABS {
                debug!("tab limit reached, ignoring create");
                return Ok(());
            }
        }

        let id = self
            .backend
            .create_chat_session(&session_id)
            .await
            .context("failed to provision chat tab")?;

        {
            let mut state = self.state.lock().await;
            if state.tabs.len() >= MAX_TABS {
                // Lost a race to another create; drop the orphaned remote tab.
                drop(state);
                let _ = self.backend.delete_chat_session(&session_id, &id).await;
                return Ok(());
            }
            state.tabs.push(Tab::new(id.clone()));
            state.active = Some(id.clone());
        }
        self.persist_active(&id).await;
        info!(tab = %id, "tab created");
        Ok(())
    }

    /// Delete a tab. Silent no-op when it is the last one remaining; the
    /// active pointer falls back to the first remaining tab.
    pub async fn delete_tab(&self, tab_id: &str) -> Result<()> {
        let Some(session_id) = self.session_id.clone() else {
            return Ok(());
        };

        // Remove locally before the remote call. Concurrent deletes each
        // see the count after earlier removals, so the panel can never
        // drop below one tab.
        let removed = {
            let mut state = self.state.lock().await;
            if state.tabs.len() <= 1 {
                debug!("refusing to delete the last tab");
                return Ok(());
            }
            let Some(pos) = state.tabs.iter().position(|t| t.id == tab_id) else {
                return Ok(());
            };
            (pos, state.tabs.remove(pos))
        };

        if let Err(e) = self
            .backend
            .delete_chat_session(&session_id, tab_id)
            .await
        {
            // Remote delete failed; put the tab back where it was.
            let mut state = self.state.lock().await;
            let (pos, tab) = removed;
            let idx = pos.min(state.tabs.len());
            state.tabs.insert(idx, tab);
            return Err(e).context("failed to delete chat tab");
        }

        let new_active = {
            let mut state = self.state.lock().await;
            if state.active.as_deref() == Some(tab_id) {
                let next = state.tabs[0].id.clone();
                state.active = Some(next.clone());
                Some(next)
            } else {
                None
            }
        };
        if let Some(next) = new_active {
            self.persist_active(&next).await;
            self.load_history_if_needed(&next).await;
        }
        info!(tab = %tab_id, "tab deleted");
        Ok(())
    }

    /// Make a tab active, persist the choice, and lazily fetch its history.
    pub async fn switch_tab(&self, tab_id: &str) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if !state.tabs.iter().any(|t| t.id == tab_id) {
                return Ok(());
            }
            state.active = Some(tab_id.to_string());
        }
        self.persist_active(tab_id).await;
        self.load_history_if_needed(tab_id).await;
        Ok(())
    }

    /// Dispatch a message on a tab and fold the response stream into its
    /// history.
    ///
    /// No-op when there is nothing to send, no backend session, no such
    /// tab, or the tab is already busy (the attempt is ignored, not
    /// queued). The busy flag is always cleared
    /// on the way out, success or failure.
    pub async fn send(
        &self,
        tab_id: &str,
        text: &str,
        attachments: Vec<Attachment>,
        context: Option<String>,
        silent: bool,
    ) -> Result<()> {
        if text.trim().is_empty() && attachments.is_empty() {
            return Ok(());
        }
        let Some(session_id) = self.session_id.clone() else {
            return Ok(());
        };

        {
            let mut state = self.state.lock().await;
            let Some(tab) = state.tab_mut(tab_id) else {
                return Ok(());
            };
            if tab.busy {
                debug!(tab = %tab_id, "tab busy, ignoring send");
                return Ok(());
            }
            tab.busy = true;
            if !silent {
                tab.messages.push(Message::user(display_text(text, &attachments)));
            }
            state.suggestions.clear();
        }

        let request = ChatRequest {
            session_id,
            chat_session_id: tab_id.to_string(),
            message: text.to_string(),
            attachments: if attachments.is_empty() {
                None
            } else {
                Some(attachments)
            },
            context,
        };

        let result = self.run_send(tab_id, request).await;
        if let Err(e) = &result {
            warn!(tab = %tab_id, "chat send failed: {e:#}");
            let mut state = self.state.lock().await;
            if let Some(tab) = state.tab_mut(tab_id) {
                tab.messages.push(Message::status(SEND_ERROR_TEXT));
            }
        }

        // Always clear busy, whatever happened above; a failed send must
        // not leave the tab unable to send again.
        let mut state = self.state.lock().await;
        if let Some(tab) = state.tab_mut(tab_id) {
            tab.busy = false;
        }
        Ok(())
    }

    async fn run_send(&self, tab_id: &str, request: ChatRequest) -> Result<()> {
        let mut events = self.backend.send_chat(request).await?;
        let mut cursor = StreamCursor::default();

        while let Some(event) = events.next().await {
            let event = event?;
            let effect = {
                let mut state = self.state.lock().await;
                let (tab, suggestions) = state.tab_and_suggestions(tab_id);
                match tab {
                    Some(tab) => apply_stream_event(tab, suggestions, &mut cursor, event),
                    // Tab deleted mid-stream; drain the rest quietly.
                    None => None,
                }
            };
            if effect == Some(SideEffect::ReloadHost) {
                self.fire_reload();
            }
        }
        Ok(())
    }

    fn fire_reload(&self) {
        let hook = self.reload_hook.lock().unwrap_or_else(|e| e.into_inner());
        match hook.as_ref() {
            Some(hook) => {
                info!("mutating tool result, reloading host page");
                hook();
            }
            None => debug!("no reload hook registered"),
        }
    }

    async fn persist_active(&self, tab_id: &str) {
        if let Err(e) = self.store.set_active_tab(tab_id).await {
            warn!("failed to persist active tab: {e:#}");
        }
    }

    async fn load_history_if_needed(&self, tab_id: &str) {
        let needed = {
            let state = self.state.lock().await;
            state
                .tabs
                .iter()
                .any(|t| t.id == tab_id && !t.loaded)
        };
        if needed {
            self.load_history(tab_id).await;
        }
    }

    async fn load_history(&self, tab_id: &str) {
        let Some(session_id) = self.session_id.clone() else {
            return;
        };
        match self.backend.fetch_messages(&session_id, tab_id).await {
            Ok(messages) => {
                let mut state = self.state.lock().await;
                if let Some(tab) = state.tab_mut(tab_id) {
                    tab.messages = messages;
                    tab.loaded = true;
                }
            }
            Err(e) => warn!(tab = %tab_id, "failed to fetch tab history: {e:#}"),
        }
    }

    // ------------------------------------------------------------------
    // Read accessors
    // ------------------------------------------------------------------

    pub async fn tab_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .tabs
            .iter()
            .map(|t| t.id.clone())
            .collect()
    }

    pub async fn active_tab(&self) -> Option<String> {
        self.state.lock().await.active.clone()
    }

    pub async fn messages(&self, tab_id: &str) -> Vec<Message> {
        self.state
            .lock()
            .await
            .tab_mut(tab_id)
            .map(|t| t.messages.clone())
            .unwrap_or_default()
    }

    pub async fn is_busy(&self, tab_id: &str) -> bool {
        self.state
            .lock()
            .await
            .tab_mut(tab_id)
            .map(|t| t.busy)
            .unwrap_or(false)
    }

    pub async fn suggestions(&self) -> Vec<String> {
        self.state.lock().await.suggestions.clone()
    }
}

/// Render attachment names inline after the message text.
fn display_text(text: &str, attachments: &[Attachment]) -> String {
    if attachments.is_empty() {
        return text.to_string();
    }
    let names: Vec<&str> = attachments.iter().map(|a| a.name.as_str()).collect();
    format!("{} [{}]", text, names.join(", "))
}

/// Fold one stream event into tab state.
///
/// Pure reducer over the ordered message list, keyed by the minted
/// streaming id; side effects are returned, not executed, so the
/// transition stays testable.
pub(crate) fn apply_stream_event(
    tab: &mut Tab,
    suggestions: &mut Vec<String>,
    cursor: &mut StreamCursor,
    event: StreamEvent,
) -> Option<SideEffect> {
    match event {
        StreamEvent::ToolCall { description, .. } => {
            // A tool invocation supersedes a partial answer: drop the
            // streaming message and its accumulated text entirely.
            if let Some(id) = cursor.streaming_id.take() {
                tab.messages.retain(|m| m.id != Some(id));
                cursor.accumulated.clear();
            }
            tab.messages.push(Message::status(description));
            None
        }
        StreamEvent::TextChunk { text } => {
            if text.is_empty() {
                return None;
            }
            cursor.accumulated.push_str(&text);
            match cursor.streaming_id {
                Some(id) => {
                    if let Some(msg) = tab.messages.iter_mut().find(|m| m.id == Some(id)) {
                        msg.text.clone_from(&cursor.accumulated);
                    }
                }
                None => {
                    let id = Uuid::new_v4();
                    cursor.streaming_id = Some(id);
                    tab.messages
                        .push(Message::streaming(id, cursor.accumulated.clone()));
                }
            }
            None
        }
        StreamEvent::Response {
            text,
            suggested_actions,
        } => {
            if let Some(id) = cursor.streaming_id.take() {
                // Finalize in place; the id stops being addressable.
                if let Some(msg) = tab.messages.iter_mut().find(|m| m.id == Some(id)) {
                    msg.is_streaming = false;
                    msg.id = None;
                }
                cursor.accumulated.clear();
            } else if let Some(text) = text.filter(|t| !t.is_empty()) {
                tab.messages.push(Message::assistant(text));
            }
            if let Some(actions) = suggested_actions {
                if !actions.is_empty() {
                    *suggestions = actions;
                }
            }
            None
        }
        StreamEvent::ToolResult { name } => {
            if RELOAD_TOOLS.contains(&name.as_str()) {
                Some(SideEffect::ReloadHost)
            } else {
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_tab() -> Tab {
        Tab::new("tab-1".to_string())
    }

    #[test]
    fn chunks_then_bare_response_yield_one_final_message() {
        let mut tab = empty_tab();
        let mut suggestions = Vec::new();
        let mut cursor = StreamCursor::default();

        for chunk in ["Hel", "lo"] {
            apply_stream_event(
                &mut tab,
                &mut suggestions,
                &mut cursor,
                StreamEvent::TextChunk { text: chunk.into() },
            );
        }
        apply_stream_event(
            &mut tab,
            &mut suggestions,
            &mut cursor,
            StreamEvent::Response {
                text: None,
                suggested_actions: None,
            },
        );

        assert_eq!(tab.messages.len(), 1);
        let msg = &tab.messages[0];
        assert_eq!(msg.text, "Hello");
        assert!(!msg.is_user);
        assert!(!msg.is_streaming);
        assert!(msg.id.is_none());
    }

    #[test]
    fn tool_call_discards_streaming_message() {
        let mut tab = empty_tab();
        let mut suggestions = Vec::new();
        let mut cursor = StreamCursor::default();

        apply_stream_event(
            &mut tab,
            &mut suggestions,
            &mut cursor,
            StreamEvent::TextChunk {
                text: "partial an".into(),
            },
        );
        apply_stream_event(
            &mut tab,
            &mut suggestions,
            &mut cursor,
            StreamEvent::ToolCall {
                name: Some("save_note".into()),
                description: "Saving note...".into(),
            },
        );

        assert_eq!(tab.messages.len(), 1);
        assert!(tab.messages[0].is_status);
        assert_eq!(tab.messages[0].text, "Saving note...");
        assert!(!tab.messages.iter().any(|m| m.is_streaming));
    }

    #[test]
    fn streaming_message_keeps_its_list_position() {
        let mut tab = empty_tab();
        tab.messages.push(Message::user("question"));
        let mut suggestions = Vec::new();
        let mut cursor = StreamCursor::default();

        apply_stream_event(
            &mut tab,
            &mut suggestions,
            &mut cursor,
            StreamEvent::TextChunk { text: "a".into() },
        );
        tab.messages.push(Message::status("Looking things up..."));
        apply_stream_event(
            &mut tab,
            &mut suggestions,
            &mut cursor,
            StreamEvent::TextChunk { text: "b".into() },
        );

        // The streaming message grew in place at index 1.
        assert_eq!(tab.messages[1].text, "ab");
        assert!(tab.messages[1].is_streaming);
    }

    #[test]
    fn response_text_without_streaming_appends_final_message() {
        let mut tab = empty_tab();
        let mut suggestions = Vec::new();
        let mut cursor = StreamCursor::default();

        apply_stream_event(
            &mut tab,
            &mut suggestions,
            &mut cursor,
            StreamEvent::Response {
                text: Some("done".into()),
                suggested_actions: Some(vec!["Next step".into()]),
            },
        );

        assert_eq!(tab.messages.len(), 1);
        assert_eq!(tab.messages[0].text, "done");
        assert_eq!(suggestions, vec!["Next step".to_string()]);
    }

    #[test]
    fn mutating_tool_results_request_reload() {
        let mut tab = empty_tab();
        let mut suggestions = Vec::new();
        let mut cursor = StreamCursor::default();

        let effect = apply_stream_event(
            &mut tab,
            &mut suggestions,
            &mut cursor,
            StreamEvent::ToolResult {
                name: "create_appointment".into(),
            },
        );
        assert_eq!(effect, Some(SideEffect::ReloadHost));

        let effect = apply_stream_event(
            &mut tab,
            &mut suggestions,
            &mut cursor,
            StreamEvent::ToolResult {
                name: "search_patients".into(),
            },
        );
        assert_eq!(effect, None);
    }

    #[test]
    fn empty_chunks_are_ignored() {
        let mut tab = empty_tab();
        let mut suggestions = Vec::new();
        let mut cursor = StreamCursor::default();

        apply_stream_event(
            &mut tab,
            &mut suggestions,
            &mut cursor,
            StreamEvent::TextChunk { text: "".into() },
        );
        assert!(tab.messages.is_empty());
        assert!(cursor.streaming_id.is_none());
    }
}
