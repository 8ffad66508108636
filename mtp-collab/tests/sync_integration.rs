//! Sync engine tests against an in-memory transport.
//!
//! The transport records every frame handed to it and can be told to fail,
//! which lets these tests observe exactly what would go on the wire.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use mtp_collab::framer::Framer;
use mtp_collab::protocol::{Message, MessageType};
use mtp_collab::sync::{EditPhase, LocalEditOutcome, SyncConfig, SyncEngine, SyncError, SyncEvent};
use mtp_collab::transport::{OutboundFrame, Transport, TransportError};
use mtp_collab::Edit;
use tokio::runtime::Handle;
use tokio::time::{sleep, Duration};

#[derive(Default)]
struct RecordingTransport {
    frames: Mutex<Vec<OutboundFrame>>,
    attempts: AtomicUsize,
    fail_next: AtomicUsize,
    fail_all: AtomicBool,
}

impl RecordingTransport {
    fn lines(&self) -> Vec<String> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .map(|f| f.line.clone())
            .collect()
    }

    fn sent(&self) -> Vec<Message> {
        let mut framer = Framer::new();
        self.lines()
            .iter()
            .flat_map(|line| framer.feed_chunk(line))
            .collect()
    }
}

impl Transport for RecordingTransport {
    fn send(&self, frame: OutboundFrame) -> Result<(), TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TransportError::NotConnected);
        }
        self.frames.lock().unwrap().push(frame);
        Ok(())
    }
}

struct Harness {
    engine: Arc<SyncEngine>,
    transport: Arc<RecordingTransport>,
    events: Arc<Mutex<Vec<SyncEvent>>>,
}

impl Harness {
    fn new(config: SyncConfig) -> Self {
        let transport = Arc::new(RecordingTransport::default());
        let engine = SyncEngine::new(config, transport.clone(), Handle::current());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        engine.subscribe(Arc::new(move |event: &SyncEvent| {
            sink.lock().unwrap().push(event.clone());
        }));
        Self {
            engine,
            transport,
            events,
        }
    }

    fn fast() -> Self {
        Self::new(SyncConfig {
            retry_delay_ms: 20,
            refresh_delay_ms: 20,
            ..SyncConfig::default()
        })
    }

    /// Open `file_id` as if the server had answered with `content`.
    fn loaded(self, file_id: &str, content: &str) -> Self {
        self.engine.set_user_id(Some("u1".to_string()));
        self.engine
            .handle_message(&Message::file_content(None, file_id, content));
        self
    }

    fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[tokio::test]
async fn test_insert_wire_form() {
    let h = Harness::fast().loaded("f1", "hi");

    let outcome = h.engine.submit_local_edit("f1", "hi!").unwrap();
    assert_eq!(outcome, LocalEditOutcome::Sent { messages: 1 });

    let lines = h.transport.lines();
    assert_eq!(lines.len(), 1);
    assert!(
        lines[0].starts_with("TEXT_INSERT|u1|f1|position:2,text:!,userId:u1|"),
        "unexpected line {:?}",
        lines[0]
    );
    assert!(lines[0].ends_with('\n'));
    assert_eq!(h.engine.content("f1").as_deref(), Some("hi!"));
}

#[tokio::test]
async fn test_multi_character_insert_goes_out_per_character() {
    let h = Harness::fast().loaded("f1", "ab");

    h.engine.submit_local_edit("f1", "aXYZb").unwrap();

    let sent = h.transport.sent();
    let units: Vec<(i64, &str)> = sent
        .iter()
        .map(|m| (m.data_int("position").unwrap(), m.data_str("text").unwrap()))
        .collect();
    assert_eq!(units, vec![(1, "X"), (2, "Y"), (3, "Z")]);
}

#[tokio::test]
async fn test_delete_is_single_message() {
    let h = Harness::fast().loaded("f1", "hello world");

    h.engine.submit_local_edit("f1", "hello").unwrap();

    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].msg_type, MessageType::TextDelete);
    assert_eq!(sent[0].data_int("position"), Some(5));
    assert_eq!(sent[0].data_int("length"), Some(6));
}

#[tokio::test]
async fn test_same_length_replace_is_not_sent() {
    let h = Harness::fast().loaded("f1", "abc");

    assert_eq!(
        h.engine.submit_local_edit("f1", "abd").unwrap(),
        LocalEditOutcome::Unchanged
    );
    assert!(h.transport.lines().is_empty());
    assert_eq!(h.engine.content("f1").as_deref(), Some("abc"));
}

#[tokio::test]
async fn test_remote_apply_suppresses_local_echo() {
    let h = Harness::fast().loaded("f1", "hi");
    let engine = Arc::downgrade(&h.engine);
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let seen = outcomes.clone();
    h.engine.on_remote_operation(move |op, content| {
        let Some(engine) = engine.upgrade() else { return };
        // The editor writes the new content into its buffer, which fires its
        // change handler. Even a differing snapshot must not go out.
        seen.lock().unwrap().push(engine.submit_local_edit(&op.file_id, content));
        seen.lock().unwrap().push(engine.submit_local_edit(&op.file_id, "typed meanwhile"));
        assert_eq!(engine.phase(&op.file_id), Some(EditPhase::RemoteApplyInFlight));
    });

    let applied = h
        .engine
        .apply_remote(&Message::text_insert(Some("u2"), "f1", 2, "!"));

    assert_eq!(applied.as_deref(), Some("hi!"));
    let outcomes: Vec<LocalEditOutcome> = outcomes
        .lock()
        .unwrap()
        .iter()
        .map(|r| *r.as_ref().unwrap())
        .collect();
    assert_eq!(
        outcomes,
        vec![LocalEditOutcome::Suppressed, LocalEditOutcome::Suppressed]
    );
    assert!(h.transport.lines().is_empty());
    assert_eq!(h.engine.phase("f1"), Some(EditPhase::Idle));
    assert_eq!(h.engine.content("f1").as_deref(), Some("hi!"));
}

/// Editor stand-in: writes every buffer update into `buffer` and, like a
/// change hook, immediately submits the new buffer as a local snapshot.
fn attach_buffer(engine: &Arc<SyncEngine>) -> (Arc<Mutex<String>>, Arc<Mutex<Vec<LocalEditOutcome>>>) {
    let buffer = Arc::new(Mutex::new(String::new()));
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let weak = Arc::downgrade(engine);
    let (buf, seen) = (buffer.clone(), outcomes.clone());
    engine.on_buffer_update(move |file_id, content| {
        *buf.lock().unwrap() = content.to_string();
        if let Some(engine) = weak.upgrade() {
            seen.lock().unwrap().push(engine.submit_local_edit(file_id, content).unwrap());
        }
    });
    (buffer, outcomes)
}

#[tokio::test]
async fn test_buffer_driven_by_updates_never_echoes() {
    let h = Harness::fast();
    let (buffer, outcomes) = attach_buffer(&h.engine);

    h.engine.handle_message(&Message::file_content(None, "f1", "hi"));
    h.engine.handle_message(&Message::text_insert(Some("u2"), "f1", 2, "!"));
    h.engine.handle_message(&Message::text_insert(Some("u2"), "f1", 3, "?"));

    assert!(h.transport.lines().is_empty());
    assert_eq!(*buffer.lock().unwrap(), "hi!?");
    assert_eq!(h.engine.content("f1").as_deref(), Some("hi!?"));
    assert_eq!(
        *outcomes.lock().unwrap(),
        vec![LocalEditOutcome::Suppressed; 3]
    );

    // The user's own typing after the updates still goes out.
    h.engine.submit_local_edit("f1", "hi!?.").unwrap();
    assert_eq!(h.transport.sent().len(), 1);
}

#[tokio::test]
async fn test_buffer_update_restores_rejected_edit() {
    let h = Harness::new(SyncConfig {
        disallowed_chars: vec!['ş'],
        ..SyncConfig::default()
    });
    let (buffer, _) = attach_buffer(&h.engine);
    h.engine.handle_message(&Message::file_content(None, "f1", "ok"));

    assert!(h.engine.submit_local_edit("f1", "okş").is_err());
    assert_eq!(*buffer.lock().unwrap(), "ok");
    assert!(h.transport.lines().is_empty());
}

#[tokio::test]
async fn test_file_opened_listener() {
    let h = Harness::fast();
    let opened = Arc::new(Mutex::new(Vec::new()));
    let sink = opened.clone();
    h.engine.on_file_opened(move |file_id, content| {
        sink.lock().unwrap().push((file_id.to_string(), content.to_string()));
    });

    h.engine.handle_message(&Message::file_content(None, "f1", "body"));
    assert_eq!(*opened.lock().unwrap(), vec![("f1".to_string(), "body".to_string())]);
}

#[tokio::test]
async fn test_out_of_range_delete_discarded() {
    let h = Harness::fast().loaded("f1", "0123456789");

    let applied = h
        .engine
        .apply_remote(&Message::text_delete(Some("u2"), "f1", 15, 3));

    assert!(applied.is_none());
    assert_eq!(h.engine.content("f1").as_deref(), Some("0123456789"));
    assert!(!h
        .events()
        .iter()
        .any(|e| matches!(e, SyncEvent::RemoteEdit { .. })));
}

#[tokio::test]
async fn test_partial_delete_is_not_applied() {
    let h = Harness::fast().loaded("f1", "0123456789");
    assert!(h
        .engine
        .apply_remote(&Message::text_delete(Some("u2"), "f1", 8, 5))
        .is_none());
    assert_eq!(h.engine.content("f1").as_deref(), Some("0123456789"));
}

#[tokio::test]
async fn test_remote_insert_clamped_to_end() {
    let h = Harness::fast().loaded("f1", "abc");
    let applied = h
        .engine
        .apply_remote(&Message::text_insert(Some("u2"), "f1", 40, "Z"));
    assert_eq!(applied.as_deref(), Some("abcZ"));
}

#[tokio::test]
async fn test_remote_edit_for_unopened_file_ignored() {
    let h = Harness::fast().loaded("f1", "abc");
    assert!(h
        .engine
        .apply_remote(&Message::text_insert(Some("u2"), "other", 0, "Z"))
        .is_none());
}

#[tokio::test]
async fn test_diff_then_remote_apply_roundtrip() {
    // What one engine sends, another applies to the same snapshot.
    let sender = Harness::fast().loaded("f1", "line one\nline two");
    let receiver = Harness::fast().loaded("f1", "line one\nline two");

    sender
        .engine
        .submit_local_edit("f1", "line one\nnew line\nline two")
        .unwrap();
    for msg in sender.transport.sent() {
        receiver.engine.handle_message(&msg);
    }
    sender.engine.submit_local_edit("f1", "line one\nline two").unwrap();
    for msg in sender.transport.sent().into_iter().skip(9) {
        receiver.engine.handle_message(&msg);
    }

    assert_eq!(
        receiver.engine.content("f1").as_deref(),
        Some("line one\nline two")
    );
}

#[tokio::test]
async fn test_text_update_forms() {
    let h = Harness::fast().loaded("f1", "abc");

    h.engine
        .handle_message(&Message::text_update(Some("u2"), "f1", "insert", 1, "XY"));
    assert_eq!(h.engine.content("f1").as_deref(), Some("aXYbc"));

    h.engine
        .handle_message(&Message::text_update(Some("u2"), "f1", "delete", 1, "XY"));
    assert_eq!(h.engine.content("f1").as_deref(), Some("abc"));

    let replace = Message::new(MessageType::TextUpdate, Some("u2"), Some("f1"))
        .with_data("content", "fresh");
    h.engine.handle_message(&replace);
    assert_eq!(h.engine.content("f1").as_deref(), Some("fresh"));
    assert!(h.events().contains(&SyncEvent::ContentReplaced {
        file_id: "f1".into(),
        content: "fresh".into()
    }));
}

#[tokio::test]
async fn test_file_update_resyncs() {
    let h = Harness::fast().loaded("f1", "old");
    let update = Message::new(MessageType::FileUpdate, None, Some("f1")).with_data("content", "new text");
    h.engine.handle_message(&update);
    assert_eq!(h.engine.content("f1").as_deref(), Some("new text"));
    assert!(h.transport.lines().is_empty());
}

#[tokio::test]
async fn test_disallowed_characters_rejected_and_reverted() {
    let h = Harness::new(SyncConfig {
        disallowed_chars: vec!['ş', 'ğ'],
        ..SyncConfig::default()
    })
    .loaded("f1", "hi");
    let engine = Arc::downgrade(&h.engine);
    let revert_outcome = Arc::new(Mutex::new(None));
    let seen = revert_outcome.clone();
    h.engine.subscribe(Arc::new(move |event: &SyncEvent| {
        if let SyncEvent::LocalEditRejected {
            file_id, revert_to, ..
        } = event
        {
            if let Some(engine) = engine.upgrade() {
                // Restoring the buffer fires the change handler again.
                *seen.lock().unwrap() = Some(engine.submit_local_edit(file_id, revert_to).unwrap());
            }
        }
    }));

    let result = h.engine.submit_local_edit("f1", "hişx");

    assert!(matches!(result, Err(SyncError::Validation(_))));
    assert!(h.transport.lines().is_empty());
    assert_eq!(*revert_outcome.lock().unwrap(), Some(LocalEditOutcome::Suppressed));
    assert_eq!(h.engine.content("f1").as_deref(), Some("hi"));
    assert_eq!(h.engine.phase("f1"), Some(EditPhase::Idle));
    assert!(h.events().iter().any(|e| matches!(
        e,
        SyncEvent::LocalEditRejected { revert_to, .. } if revert_to == "hi"
    )));

    // Allowed input still flows afterwards.
    h.engine.submit_local_edit("f1", "hix").unwrap();
    assert_eq!(h.transport.lines().len(), 1);
}

#[tokio::test]
async fn test_failed_send_keeps_last_synced() {
    let h = Harness::fast().loaded("f1", "hi");
    h.transport.fail_all.store(true, Ordering::SeqCst);

    assert!(matches!(
        h.engine.submit_local_edit("f1", "hi!"),
        Err(SyncError::Transport(TransportError::NotConnected))
    ));
    assert_eq!(h.engine.content("f1").as_deref(), Some("hi"));
    assert_eq!(h.engine.phase("f1"), Some(EditPhase::Idle));
}

#[tokio::test]
async fn test_file_list_retried_once() {
    let h = Harness::fast();
    h.transport.fail_next.store(1, Ordering::SeqCst);

    assert!(h.engine.request_file_list().is_err());
    sleep(Duration::from_millis(150)).await;

    assert_eq!(h.transport.attempts.load(Ordering::SeqCst), 2);
    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].msg_type, MessageType::FileList);
}

#[tokio::test]
async fn test_file_list_retry_is_not_retried() {
    let h = Harness::fast();
    h.transport.fail_all.store(true, Ordering::SeqCst);

    assert!(h.engine.request_file_list().is_err());
    sleep(Duration::from_millis(200)).await;

    assert_eq!(h.transport.attempts.load(Ordering::SeqCst), 2);
    assert!(h
        .events()
        .iter()
        .any(|e| matches!(e, SyncEvent::Error(msg) if msg.contains("file list"))));
}

#[tokio::test]
async fn test_force_refresh_replaces_pending_retry() {
    let h = Harness::fast();
    h.transport.fail_next.store(1, Ordering::SeqCst);
    assert!(h.engine.request_file_list().is_err());

    h.engine.force_file_list_refresh().unwrap();
    sleep(Duration::from_millis(150)).await;

    assert_eq!(h.transport.attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_open_retry_dropped_on_close() {
    let h = Harness::fast();
    h.transport.fail_next.store(1, Ordering::SeqCst);

    assert!(h.engine.open_file("f1").is_err());
    assert!(h.engine.close_file("f1"));
    sleep(Duration::from_millis(150)).await;

    assert_eq!(h.transport.attempts.load(Ordering::SeqCst), 1);
    assert!(h.transport.lines().is_empty());
}

#[tokio::test]
async fn test_open_retry_succeeds() {
    let h = Harness::fast();
    h.transport.fail_next.store(1, Ordering::SeqCst);

    assert!(h.engine.open_file("f1").is_err());
    sleep(Duration::from_millis(150)).await;

    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].msg_type, MessageType::FileOpen);
    assert_eq!(sent[0].file_id.as_deref(), Some("f1"));
}

#[tokio::test]
async fn test_create_file_optimistic_and_refresh() {
    let h = Harness::fast();
    h.engine.set_user_id(Some("u1".into()));

    h.engine.create_file("notes").unwrap();

    let listed = h.engine.file_list();
    assert_eq!(listed.len(), 1);
    assert!(listed[0].is_provisional());

    sleep(Duration::from_millis(150)).await;
    let sent = h.transport.sent();
    let kinds: Vec<MessageType> = sent.iter().map(|m| m.msg_type).collect();
    assert_eq!(kinds, vec![MessageType::FileCreate, MessageType::FileList]);
    let create = &sent[0];
    assert_eq!(create.data_str("name"), Some("notes"));
    assert_eq!(create.data_str("creator"), Some("u1"));

    // The authoritative list settles the provisional entry.
    h.engine.handle_message(&Message::file_list_response(
        None,
        &[mtp_collab::FileListEntry::new("f9", "notes", 1)],
        false,
    ));
    let listed = h.engine.file_list();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].file_id, "f9");
}

#[tokio::test]
async fn test_legacy_file_list_through_framer() {
    let h = Harness::fast();
    let msgs = Framer::new().feed_chunk("FILE_LIST_RESP|null|null|files:f1:a:0|f2:b:1|5\n");
    for msg in &msgs {
        h.engine.handle_message(msg);
    }

    let names: Vec<String> = h.engine.file_list().into_iter().map(|e| e.file_name).collect();
    assert_eq!(names, vec!["a", "b"]);
}

#[tokio::test]
async fn test_delete_ack_outcomes() {
    let h = Harness::fast().loaded("f1", "x");
    h.engine.handle_message(&Message::file_list_response(
        None,
        &[mtp_collab::FileListEntry::new("f1", "doc", 1)],
        false,
    ));

    h.engine
        .handle_message(&Message::file_delete_ack(None, "f1", false, "locked"));
    assert!(h.engine.is_open("f1"));
    assert!(h.events().contains(&SyncEvent::Error("locked".into())));

    h.engine
        .handle_message(&Message::file_delete_ack(None, "f1", true, "deleted"));
    assert!(!h.engine.is_open("f1"));
    assert!(h.engine.file_list().is_empty());
    assert!(h.events().contains(&SyncEvent::FileDeleted {
        file_id: "f1".into()
    }));
}

#[tokio::test]
async fn test_connection_lost_reported_once() {
    let h = Harness::fast();
    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    h.engine.on_connection_error(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    h.engine.handle_connection_lost("socket closed");
    h.engine.handle_connection_lost("socket closed again");
    h.engine
        .handle_message(&Message::disconnect("server", "shutting down"));
    assert_eq!(count.load(Ordering::SeqCst), 1);

    h.engine.mark_connected();
    h.engine.handle_connection_lost("second connection dropped");
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_file_list_listener() {
    let h = Harness::fast();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    h.engine.on_file_list_updated(move |entries| {
        sink.lock().unwrap().push(entries.len());
    });

    h.engine.handle_message(&Message::file_list_response(
        None,
        &[
            mtp_collab::FileListEntry::new("f1", "a", 0),
            mtp_collab::FileListEntry::new("f2", "b", 0),
        ],
        true,
    ));
    h.engine
        .handle_message(&Message::new(MessageType::FileListResp, None, None));

    assert_eq!(*seen.lock().unwrap(), vec![2, 0]);
}

#[tokio::test]
async fn test_utf16_positions_on_the_wire() {
    let h = Harness::fast().loaded("f1", "😀");
    h.engine.submit_local_edit("f1", "😀a").unwrap();

    let sent = h.transport.sent();
    assert_eq!(sent[0].data_int("position"), Some(2));

    let other = Harness::fast().loaded("f1", "😀");
    assert_eq!(
        other.engine.apply_remote(&sent[0]).as_deref(),
        Some("😀a")
    );
    assert_eq!(
        mtp_collab::edit::EditOp::from_message(&sent[0]).map(|op| op.edit),
        Some(Edit::insert(2, "a"))
    );
}
