// Integration tests for the multi-tab chat manager
//
// These drive the manager against a scripted in-memory backend so tab
// lifecycle, send dispatch, and stream folding are covered without a
// network.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chartside::chat::EventStream;
use chartside::{
    ChatBackend, ChatManager, ChatRequest, Message, MemoryTabStore, StreamEvent, TabStore,
    MAX_TABS,
};
use futures::StreamExt;

#[derive(Default)]
struct MockBackend {
    existing: Vec<String>,
    next_id: AtomicUsize,
    /// One scripted event list per send, consumed front to back.
    scripts: Mutex<Vec<Vec<StreamEvent>>>,
    sends: Mutex<Vec<ChatRequest>>,
    fail_sends: bool,
    fail_deletes: bool,
    /// Sleep inside delete calls so tests can overlap them.
    delete_delay: Option<std::time::Duration>,
}

impl MockBackend {
    fn with_tabs(ids: &[&str]) -> Self {
        Self {
            existing: ids.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn script(self, events: Vec<StreamEvent>) -> Self {
        self.scripts.lock().unwrap().push(events);
        self
    }

    fn send_count(&self) -> usize {
        self.sends.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatBackend for MockBackend {
    async fn list_chat_sessions(&self, _session_id: &str) -> Result<Vec<String>> {
        Ok(self.existing.clone())
    }

    async fn create_chat_session(&self, _session_id: &str) -> Result<String> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(format!("tab-{}", n))
    }

    async fn delete_chat_session(&self, _session_id: &str, _chat_id: &str) -> Result<()> {
        if let Some(delay) = self.delete_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_deletes {
            bail!("delete rejected");
        }
        Ok(())
    }

    async fn fetch_messages(&self, _session_id: &str, _chat_id: &str) -> Result<Vec<Message>> {
        Ok(Vec::new())
    }

    async fn send_chat(&self, request: ChatRequest) -> Result<EventStream> {
        self.sends.lock().unwrap().push(request);
        if self.fail_sends {
            bail!("backend unavailable");
        }
        let events = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                Vec::new()
            } else {
                scripts.remove(0)
            }
        };
        Ok(futures::stream::iter(events.into_iter().map(Ok)).boxed())
    }
}

fn manager(backend: MockBackend) -> (ChatManager, Arc<MockBackend>) {
    let backend = Arc::new(backend);
    let store = Arc::new(MemoryTabStore::new());
    let mgr = ChatManager::new(backend.clone(), store, Some("enc-1".to_string()));
    (mgr, backend)
}

fn text_chunk(text: &str) -> StreamEvent {
    StreamEvent::TextChunk { text: text.into() }
}

#[tokio::test]
async fn test_init_creates_first_tab_when_none_exist() {
    let (mgr, _) = manager(MockBackend::default());
    mgr.init().await.unwrap();

    assert_eq!(mgr.tab_ids().await, vec!["tab-0".to_string()]);
    assert_eq!(mgr.active_tab().await, Some("tab-0".to_string()));
}

#[tokio::test]
async fn test_init_restores_persisted_active_tab() {
    let backend = Arc::new(MockBackend::with_tabs(&["a", "b", "c"]));
    let store = Arc::new(MemoryTabStore::new());
    store.set_active_tab("b").await.unwrap();

    let mgr = ChatManager::new(backend, store, Some("enc-1".to_string()));
    mgr.init().await.unwrap();
    assert_eq!(mgr.active_tab().await, Some("b".to_string()));
}

#[tokio::test]
async fn test_init_ignores_stale_persisted_tab() {
    let backend = Arc::new(MockBackend::with_tabs(&["a", "b"]));
    let store = Arc::new(MemoryTabStore::new());
    store.set_active_tab("deleted-elsewhere").await.unwrap();

    let mgr = ChatManager::new(backend, store, Some("enc-1".to_string()));
    mgr.init().await.unwrap();
    assert_eq!(mgr.active_tab().await, Some("a".to_string()));
}

#[tokio::test]
async fn test_send_folds_chunks_into_one_final_message() {
    let (mgr, _) = manager(MockBackend::default().script(vec![
        text_chunk("Hel"),
        text_chunk("lo"),
        StreamEvent::Response {
            text: None,
            suggested_actions: None,
        },
    ]));
    mgr.init().await.unwrap();

    mgr.send("tab-0", "hi", Vec::new(), None, false).await.unwrap();

    let messages = mgr.messages("tab-0").await;
    assert_eq!(messages.len(), 2);
    assert!(messages[0].is_user);
    assert_eq!(messages[0].text, "hi");
    assert_eq!(messages[1].text, "Hello");
    assert!(!messages[1].is_streaming);
    assert!(!mgr.is_busy("tab-0").await);
}

#[tokio::test]
async fn test_tool_call_replaces_partial_answer_with_status() {
    let (mgr, _) = manager(MockBackend::default().script(vec![
        text_chunk("Let me ch"),
        StreamEvent::ToolCall {
            name: Some("search_patients".into()),
            description: "Searching patients...".into(),
        },
        StreamEvent::ToolResult {
            name: "search_patients".into(),
        },
        StreamEvent::Response {
            text: Some("No matches.".into()),
            suggested_actions: None,
        },
    ]));
    mgr.init().await.unwrap();

    mgr.send("tab-0", "find smith", Vec::new(), None, false)
        .await
        .unwrap();

    let messages = mgr.messages("tab-0").await;
    assert_eq!(messages.len(), 3);
    assert!(messages[1].is_status);
    assert_eq!(messages[1].text, "Searching patients...");
    assert_eq!(messages[2].text, "No matches.");
    assert!(!messages.iter().any(|m| m.is_streaming));
}

#[tokio::test]
async fn test_reload_hook_fires_for_mutating_tools_only() {
    let (mgr, _) = manager(
        MockBackend::default()
            .script(vec![
                StreamEvent::ToolResult {
                    name: "create_appointment".into(),
                },
                StreamEvent::ToolResult {
                    name: "search_patients".into(),
                },
                StreamEvent::Response {
                    text: Some("Booked.".into()),
                    suggested_actions: None,
                },
            ]),
    );
    mgr.init().await.unwrap();

    let reloads = Arc::new(AtomicUsize::new(0));
    let counter = reloads.clone();
    mgr.set_reload_hook(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    mgr.send("tab-0", "book it", Vec::new(), None, false)
        .await
        .unwrap();
    assert_eq!(reloads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_mutating_tool_without_hook_is_harmless() {
    let (mgr, _) = manager(MockBackend::default().script(vec![StreamEvent::ToolResult {
        name: "save_note".into(),
    }]));
    mgr.init().await.unwrap();

    mgr.send("tab-0", "save", Vec::new(), None, false).await.unwrap();
    assert!(!mgr.is_busy("tab-0").await);
}

#[tokio::test]
async fn test_silent_send_adds_no_user_message() {
    let (mgr, backend) = manager(MockBackend::default().script(vec![StreamEvent::Response {
        text: Some("Summary ready.".into()),
        suggested_actions: None,
    }]));
    mgr.init().await.unwrap();

    mgr.send("tab-0", "summarize encounter", Vec::new(), None, true)
        .await
        .unwrap();

    let messages = mgr.messages("tab-0").await;
    assert_eq!(messages.len(), 1);
    assert!(!messages[0].is_user);
    assert_eq!(backend.send_count(), 1);
}

#[tokio::test]
async fn test_suggested_actions_replace_previous_set() {
    let (mgr, _) = manager(
        MockBackend::default()
            .script(vec![StreamEvent::Response {
                text: Some("a".into()),
                suggested_actions: Some(vec!["First".into()]),
            }])
            .script(vec![StreamEvent::Response {
                text: Some("b".into()),
                suggested_actions: Some(vec!["Second".into(), "Third".into()]),
            }]),
    );
    mgr.init().await.unwrap();

    mgr.send("tab-0", "one", Vec::new(), None, false).await.unwrap();
    assert_eq!(mgr.suggestions().await, vec!["First".to_string()]);

    mgr.send("tab-0", "two", Vec::new(), None, false).await.unwrap();
    assert_eq!(
        mgr.suggestions().await,
        vec!["Second".to_string(), "Third".to_string()]
    );
}

#[tokio::test]
async fn test_tab_cap_makes_create_a_no_op() {
    let (mgr, _) = manager(MockBackend::default());
    mgr.init().await.unwrap();

    for _ in 0..MAX_TABS + 2 {
        mgr.create_tab().await.unwrap();
    }
    assert_eq!(mgr.tab_ids().await.len(), MAX_TABS);
}

#[tokio::test]
async fn test_deleting_active_tab_reassigns_active() {
    let (mgr, _) = manager(MockBackend::with_tabs(&["a", "b"]));
    mgr.init().await.unwrap();
    assert_eq!(mgr.active_tab().await, Some("a".to_string()));

    mgr.delete_tab("a").await.unwrap();
    assert_eq!(mgr.tab_ids().await, vec!["b".to_string()]);
    assert_eq!(mgr.active_tab().await, Some("b".to_string()));
}

#[tokio::test]
async fn test_concurrent_deletes_never_empty_the_panel() {
    // Both deletes overlap inside the slow remote call; only one may win.
    let (mgr, _) = manager(MockBackend {
        existing: vec!["a".to_string(), "b".to_string()],
        delete_delay: Some(std::time::Duration::from_millis(50)),
        ..Default::default()
    });
    mgr.init().await.unwrap();

    let (ra, rb) = tokio::join!(mgr.delete_tab("a"), mgr.delete_tab("b"));
    ra.unwrap();
    rb.unwrap();

    let remaining = mgr.tab_ids().await;
    assert_eq!(remaining.len(), 1, "panel emptied: {:?}", remaining);
    assert_eq!(mgr.active_tab().await, Some(remaining[0].clone()));
}

#[tokio::test]
async fn test_failed_remote_delete_restores_the_tab() {
    let (mgr, _) = manager(MockBackend {
        existing: vec!["a".to_string(), "b".to_string()],
        fail_deletes: true,
        ..Default::default()
    });
    mgr.init().await.unwrap();

    assert!(mgr.delete_tab("a").await.is_err());
    assert_eq!(mgr.tab_ids().await, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(mgr.active_tab().await, Some("a".to_string()));
}

#[tokio::test]
async fn test_last_tab_cannot_be_deleted() {
    let (mgr, _) = manager(MockBackend::with_tabs(&["only"]));
    mgr.init().await.unwrap();

    mgr.delete_tab("only").await.unwrap();
    assert_eq!(mgr.tab_ids().await, vec!["only".to_string()]);
    assert_eq!(mgr.active_tab().await, Some("only".to_string()));
}

#[tokio::test]
async fn test_empty_send_makes_no_backend_call() {
    let (mgr, backend) = manager(MockBackend::default());
    mgr.init().await.unwrap();

    mgr.send("tab-0", "   ", Vec::new(), None, false).await.unwrap();
    assert_eq!(backend.send_count(), 0);
    assert!(mgr.messages("tab-0").await.is_empty());
}

#[tokio::test]
async fn test_without_session_everything_is_a_no_op() {
    let backend = Arc::new(MockBackend::default());
    let store = Arc::new(MemoryTabStore::new());
    let mgr = ChatManager::new(backend.clone(), store, None);

    mgr.init().await.unwrap();
    mgr.create_tab().await.unwrap();
    mgr.send("tab-0", "hello", Vec::new(), None, false).await.unwrap();

    assert!(mgr.tab_ids().await.is_empty());
    assert_eq!(backend.send_count(), 0);
}

#[tokio::test]
async fn test_backend_failure_surfaces_status_and_clears_busy() {
    let (mgr, _) = manager(MockBackend {
        fail_sends: true,
        ..Default::default()
    });
    mgr.init().await.unwrap();

    mgr.send("tab-0", "hi", Vec::new(), None, false).await.unwrap();

    let messages = mgr.messages("tab-0").await;
    assert_eq!(messages.len(), 2);
    assert!(messages[1].is_status);
    assert_eq!(
        messages[1].text,
        "An unexpected error occurred, please try again."
    );
    assert!(!mgr.is_busy("tab-0").await);
}

#[tokio::test]
async fn test_switch_to_unknown_tab_is_ignored() {
    let (mgr, _) = manager(MockBackend::with_tabs(&["a"]));
    mgr.init().await.unwrap();

    mgr.switch_tab("nope").await.unwrap();
    assert_eq!(mgr.active_tab().await, Some("a".to_string()));
}
