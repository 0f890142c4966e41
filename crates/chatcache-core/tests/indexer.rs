//! Reconciliation and backfill tests against an in-memory message source.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chatcache_core::config::{Config, DeltaPolicy, RemoteConfig, SyncConfig};
use chatcache_core::indexer::ListingOrigin;
use chatcache_core::models::{Chat, Conversation, Group, Message};
use chatcache_core::retry::RetryPolicy;
use chatcache_core::scheduler::TaskState;
use chatcache_core::{Database, Error, Indexer, MessageSource, Result};
use chrono::Utc;
use tokio::sync::Semaphore;
use uuid::Uuid;

fn temp_db_path() -> std::path::PathBuf {
    let mut path = std::env::temp_dir();
    let filename = format!("chatcache-indexer-test-{}.db", Uuid::new_v4());
    path.push(filename);
    path
}

fn message(conversation_id: &str, id: &str) -> Message {
    Message {
        id: id.to_string(),
        conversation_id: conversation_id.to_string(),
        created_at: Utc::now(),
        sender_id: "12".to_string(),
        sender_name: "Ada".to_string(),
        text: Some(format!("message {id}")),
        attachments: serde_json::json!([]),
        liked_by: Vec::new(),
        system: false,
    }
}

fn messages(conversation_id: &str, ids: impl IntoIterator<Item = u64>) -> Vec<Message> {
    ids.into_iter()
        .map(|id| message(conversation_id, &id.to_string()))
        .collect()
}

fn group(id: &str, latest: Option<u64>) -> Conversation {
    Conversation::Group(Group {
        id: id.to_string(),
        name: format!("Group {id}"),
        latest_message_id: latest.map(|id| id.to_string()),
    })
}

fn test_config(delta_policy: DeltaPolicy, listing_timeout_secs: u64) -> Config {
    Config {
        database: temp_db_path(),
        sync: SyncConfig {
            listing_timeout_secs,
            delta_policy,
        },
        retry: RetryPolicy {
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            multiplier: 2.0,
            max_attempts: Some(5),
        },
        remote: RemoteConfig::default(),
    }
}

/// Serves fixed histories, newest first, in pages.
struct FakeSource {
    listing: Vec<Conversation>,
    history: HashMap<String, Vec<Message>>,
    page_size: usize,
    listing_fails: bool,
    transient_failures: AtomicU32,
    gate: Option<Arc<Semaphore>>,
    list_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
}

impl FakeSource {
    fn new() -> Self {
        Self {
            listing: Vec::new(),
            history: HashMap::new(),
            page_size: 10,
            listing_fails: false,
            transient_failures: AtomicU32::new(0),
            gate: None,
            list_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
        }
    }

    fn with_conversation(mut self, conversation: Conversation, history: Vec<Message>) -> Self {
        self.history
            .insert(conversation.conversation_id().to_string(), history);
        self.listing.push(conversation);
        self
    }

    fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    async fn page(&self, conversation: &Conversation, before: Option<u64>) -> Result<Vec<Message>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            // Each permit lets exactly one page through.
            let permit = gate
                .acquire()
                .await
                .map_err(|_| Error::Other("gate closed".to_string()))?;
            permit.forget();
        }
        if self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Remote("HTTP 503".to_string()));
        }

        let mut page: Vec<Message> = self
            .history
            .get(conversation.conversation_id())
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|m| match (before, m.id.parse::<u64>()) {
                (Some(before), Ok(id)) => id < before,
                _ => true,
            })
            .collect();
        page.sort_by_key(|m| Reverse(m.id.parse::<u64>().unwrap_or(u64::MAX)));
        page.truncate(self.page_size);
        Ok(page)
    }
}

#[async_trait]
impl MessageSource for FakeSource {
    async fn list_groups(&self) -> Result<Vec<Conversation>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.listing_fails {
            return Err(Error::Unavailable("offline".to_string()));
        }
        Ok(self
            .listing
            .iter()
            .filter(|c| matches!(c, Conversation::Group(_)))
            .cloned()
            .collect())
    }

    async fn list_chats(&self) -> Result<Vec<Conversation>> {
        if self.listing_fails {
            return Err(Error::Unavailable("offline".to_string()));
        }
        Ok(self
            .listing
            .iter()
            .filter(|c| matches!(c, Conversation::Chat(_)))
            .cloned()
            .collect())
    }

    async fn fetch_newest(&self, conversation: &Conversation) -> Result<Vec<Message>> {
        self.page(conversation, None).await
    }

    async fn fetch_before(&self, conversation: &Conversation, before_id: &str) -> Result<Vec<Message>> {
        let before = before_id
            .parse::<u64>()
            .map_err(|e| Error::Parse(e.to_string()))?;
        self.page(conversation, Some(before)).await
    }
}

async fn setup(source: FakeSource, config: &Config) -> (Indexer, Arc<FakeSource>) {
    let db = Database::open(&config.database).await.expect("open db");
    let source = Arc::new(source);
    let dyn_source: Arc<dyn MessageSource> = source.clone();
    (Indexer::new(db, dyn_source, config), source)
}

async fn wait_idle(indexer: &Indexer) {
    tokio::time::timeout(Duration::from_secs(10), indexer.scheduler().wait_idle())
        .await
        .expect("backfills finish");
}

async fn watermark(indexer: &Indexer, conversation_id: &str) -> Option<u64> {
    indexer
        .database()
        .find_index_status(conversation_id)
        .await
        .expect("find status")
        .and_then(|status| status.watermark().expect("numeric watermark"))
}

async fn stored_ids(indexer: &Indexer, conversation_id: &str) -> Vec<u64> {
    let mut ids: Vec<u64> = indexer
        .database()
        .get_messages(conversation_id)
        .await
        .expect("list messages")
        .iter()
        .map(|m| m.numeric_id().expect("numeric id"))
        .collect();
    ids.sort_unstable();
    ids
}

fn finished_state(indexer: &Indexer, tag: &str) -> Vec<TaskState> {
    indexer
        .scheduler()
        .list_finished()
        .into_iter()
        .filter(|task| task.info.tag == tag)
        .map(|task| task.state)
        .collect()
}

// ============================================================================
// Backfill
// ============================================================================

#[tokio::test]
async fn never_indexed_conversation_gets_full_backfill() {
    let conv = group("g1", Some(25));
    let source = FakeSource::new().with_conversation(conv.clone(), messages("g1", 1..=25));
    let config = test_config(DeltaPolicy::Strict, 5);
    let (indexer, _) = setup(source, &config).await;

    indexer.begin_transaction(Some(vec![conv]));
    let report = indexer.end_transaction().await.expect("join").expect("reconcile");
    assert_eq!(report.listing, ListingOrigin::Supplied);
    assert_eq!(report.outdated, 1);
    assert_eq!(report.backfills_scheduled, 1);
    assert_eq!(indexer.outdated(), vec!["g1"]);

    wait_idle(&indexer).await;
    assert_eq!(stored_ids(&indexer, "g1").await, (1..=25).collect::<Vec<_>>());
    assert_eq!(watermark(&indexer, "g1").await, Some(25));
    assert_eq!(finished_state(&indexer, "g1"), vec![TaskState::Completed]);
}

#[tokio::test]
async fn backfill_stops_at_existing_watermark() {
    let conv = group("g1", Some(40));
    let source = FakeSource::new().with_conversation(conv.clone(), messages("g1", 1..=40));
    let config = test_config(DeltaPolicy::Strict, 5);
    let (indexer, source) = setup(source, &config).await;

    indexer
        .database()
        .commit_batch("g1", &messages("g1", 1..=10), Some("10"))
        .await
        .expect("seed");

    indexer.begin_transaction(Some(vec![conv]));
    indexer.end_transaction().await.expect("join").expect("reconcile");
    wait_idle(&indexer).await;

    assert_eq!(stored_ids(&indexer, "g1").await, (1..=40).collect::<Vec<_>>());
    assert_eq!(watermark(&indexer, "g1").await, Some(40));
    // Newest page plus pages before 31, 21 and 11.
    assert_eq!(source.fetch_calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn up_to_date_conversation_is_left_alone() {
    let conv = group("g1", Some(10));
    let source = FakeSource::new().with_conversation(conv.clone(), messages("g1", 1..=10));
    let config = test_config(DeltaPolicy::Strict, 5);
    let (indexer, source) = setup(source, &config).await;
    indexer
        .database()
        .commit_batch("g1", &messages("g1", 1..=10), Some("10"))
        .await
        .expect("seed");
    indexer
        .database()
        .advance_watermark("empty", "5")
        .await
        .expect("seed empty");

    indexer.begin_transaction(Some(vec![conv, group("empty", None)]));
    let report = indexer.end_transaction().await.expect("join").expect("reconcile");

    assert_eq!(report.conversations, 2);
    assert_eq!(report.outdated, 0);
    assert_eq!(report.backfills_scheduled, 0);
    assert!(indexer.outdated().is_empty());
    assert_eq!(source.fetch_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn never_indexed_conversation_without_preview_is_backfilled() {
    let conv = group("fresh", None);
    let source = FakeSource::new().with_conversation(conv.clone(), messages("fresh", 1..=3));
    let config = test_config(DeltaPolicy::Strict, 5);
    let (indexer, _) = setup(source, &config).await;

    indexer.begin_transaction(Some(vec![conv]));
    let report = indexer.end_transaction().await.expect("join").expect("reconcile");
    wait_idle(&indexer).await;

    assert_eq!(report.outdated, 1);
    assert_eq!(report.backfills_scheduled, 1);
    assert_eq!(stored_ids(&indexer, "fresh").await, vec![1, 2, 3]);
    assert_eq!(watermark(&indexer, "fresh").await, Some(3));
}

#[tokio::test]
async fn empty_history_leaves_watermark_unset() {
    let conv = group("g1", Some(5));
    let source = FakeSource::new().with_conversation(conv.clone(), Vec::new());
    let config = test_config(DeltaPolicy::Strict, 5);
    let (indexer, _) = setup(source, &config).await;

    indexer.begin_transaction(Some(vec![conv]));
    indexer.end_transaction().await.expect("join").expect("reconcile");
    wait_idle(&indexer).await;

    assert_eq!(watermark(&indexer, "g1").await, None);
    assert_eq!(finished_state(&indexer, "g1"), vec![TaskState::Completed]);
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let conv = group("g1", Some(3));
    let source = FakeSource::new().with_conversation(conv.clone(), messages("g1", 1..=3));
    source.transient_failures.store(2, Ordering::SeqCst);
    let config = test_config(DeltaPolicy::Strict, 5);
    let (indexer, _) = setup(source, &config).await;

    indexer.begin_transaction(Some(vec![conv]));
    indexer.end_transaction().await.expect("join").expect("reconcile");
    wait_idle(&indexer).await;

    assert_eq!(watermark(&indexer, "g1").await, Some(3));
}

#[tokio::test]
async fn parse_failure_aborts_only_that_job() {
    let bad = group("bad", Some(5));
    let good = group("good", Some(3));
    let mut bad_history = messages("bad", [4, 5]);
    bad_history.push(message("bad", "abc"));
    let source = FakeSource::new()
        .with_conversation(bad.clone(), bad_history)
        .with_conversation(good.clone(), messages("good", 1..=3));
    let config = test_config(DeltaPolicy::Strict, 5);
    let (indexer, _) = setup(source, &config).await;

    indexer.begin_transaction(Some(vec![bad, good]));
    let report = indexer.end_transaction().await.expect("join").expect("reconcile");
    assert_eq!(report.backfills_scheduled, 2);
    wait_idle(&indexer).await;

    assert!(matches!(finished_state(&indexer, "bad").as_slice(), [TaskState::Failed(_)]));
    assert_eq!(watermark(&indexer, "bad").await, None);
    assert_eq!(watermark(&indexer, "good").await, Some(3));
}

#[tokio::test]
async fn chat_history_is_stored_under_composite_id() {
    let conversation_id = Chat::composite_id("77", "12");
    let chat = Conversation::Chat(Chat {
        other_user_id: "77".to_string(),
        other_user_name: "Grace".to_string(),
        conversation_id: conversation_id.clone(),
        latest_message_id: Some("3".to_string()),
    });
    let source = FakeSource::new().with_conversation(chat.clone(), messages(&conversation_id, 1..=3));
    let config = test_config(DeltaPolicy::Strict, 5);
    let (indexer, _) = setup(source, &config).await;

    indexer.begin_transaction(Some(vec![chat]));
    indexer.end_transaction().await.expect("join").expect("reconcile");
    wait_idle(&indexer).await;

    assert_eq!(conversation_id, "12+77");
    assert_eq!(stored_ids(&indexer, "12+77").await, vec![1, 2, 3]);
    assert_eq!(watermark(&indexer, "12+77").await, Some(3));
    assert_eq!(watermark(&indexer, "77").await, None);
}

// ============================================================================
// Delta reconciliation
// ============================================================================

#[tokio::test]
async fn delta_resolves_without_network() {
    let conv = group("g1", Some(103));
    let source = FakeSource::new().with_conversation(conv.clone(), messages("g1", 1..=103));
    let config = test_config(DeltaPolicy::Strict, 5);
    let (indexer, source) = setup(source, &config).await;
    indexer
        .database()
        .commit_batch("g1", &messages("g1", 1..=100), Some("100"))
        .await
        .expect("seed");

    indexer.begin_transaction(Some(vec![conv.clone()]));
    indexer.submit_update(&conv, messages("g1", 98..=101));
    indexer.submit_update(&conv, messages("g1", 102..=103));
    let report = indexer.end_transaction().await.expect("join").expect("reconcile");

    assert_eq!(report.delta_resolved, 1);
    assert_eq!(report.delta_inserted, 3);
    assert_eq!(report.backfills_scheduled, 0);
    assert!(indexer.outdated().is_empty());
    assert_eq!(watermark(&indexer, "g1").await, Some(103));
    assert_eq!(source.fetch_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn gap_in_buffer_falls_back_to_backfill() {
    let conv = group("g1", Some(105));
    let source = FakeSource::new().with_conversation(conv.clone(), messages("g1", 1..=105));
    let config = test_config(DeltaPolicy::Strict, 5);
    let (indexer, _) = setup(source, &config).await;
    indexer
        .database()
        .commit_batch("g1", &messages("g1", 1..=100), Some("100"))
        .await
        .expect("seed");

    indexer.begin_transaction(Some(vec![conv.clone()]));
    indexer.submit_update(&conv, messages("g1", 102..=105));
    let report = indexer.end_transaction().await.expect("join").expect("reconcile");

    assert_eq!(report.delta_resolved, 0);
    assert_eq!(report.delta_inserted, 0);
    assert_eq!(report.backfills_scheduled, 1);

    wait_idle(&indexer).await;
    assert_eq!(stored_ids(&indexer, "g1").await, (1..=105).collect::<Vec<_>>());
    assert_eq!(watermark(&indexer, "g1").await, Some(105));
}

#[tokio::test]
async fn strict_delta_only_commits_consecutive_ids() {
    let conv = group("g1", Some(105));
    let mut remote = messages("g1", 1..=101);
    remote.push(message("g1", "105"));
    let gate = Arc::new(Semaphore::new(0));
    let source = FakeSource::new()
        .with_conversation(conv.clone(), remote)
        .gated(gate.clone());
    let config = test_config(DeltaPolicy::Strict, 5);
    let (indexer, _) = setup(source, &config).await;
    indexer
        .database()
        .commit_batch("g1", &messages("g1", 1..=100), Some("100"))
        .await
        .expect("seed");

    indexer.begin_transaction(Some(vec![conv.clone()]));
    indexer.submit_update(&conv, vec![message("g1", "100"), message("g1", "101"), message("g1", "105")]);
    let report = indexer.end_transaction().await.expect("join").expect("reconcile");

    assert_eq!(report.delta_inserted, 1);
    assert_eq!(report.delta_resolved, 0);
    assert_eq!(report.backfills_scheduled, 1);
    assert_eq!(watermark(&indexer, "g1").await, Some(101));
    assert!(indexer.database().get_message("105").await.expect("get").is_none());
    assert_eq!(indexer.outdated(), vec!["g1"]);

    gate.add_permits(100);
    wait_idle(&indexer).await;
    assert_eq!(watermark(&indexer, "g1").await, Some(105));
}

#[tokio::test]
async fn permissive_delta_jumps_to_highest_id() {
    let conv = group("g1", Some(105));
    let source = FakeSource::new().with_conversation(conv.clone(), Vec::new());
    let config = test_config(DeltaPolicy::Permissive, 5);
    let (indexer, source) = setup(source, &config).await;
    indexer
        .database()
        .commit_batch("g1", &messages("g1", 1..=100), Some("100"))
        .await
        .expect("seed");

    indexer.begin_transaction(Some(vec![conv.clone()]));
    indexer.submit_update(&conv, vec![message("g1", "100"), message("g1", "101"), message("g1", "105")]);
    let report = indexer.end_transaction().await.expect("join").expect("reconcile");

    assert_eq!(report.delta_inserted, 2);
    assert_eq!(report.delta_resolved, 1);
    assert_eq!(report.backfills_scheduled, 0);
    assert_eq!(watermark(&indexer, "g1").await, Some(105));
    assert_eq!(source.fetch_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn never_indexed_conversation_ignores_buffer() {
    let conv = group("g1", Some(3));
    let source = FakeSource::new().with_conversation(conv.clone(), messages("g1", 1..=3));
    let config = test_config(DeltaPolicy::Permissive, 5);
    let (indexer, _) = setup(source, &config).await;

    indexer.begin_transaction(Some(vec![conv.clone()]));
    indexer.submit_update(&conv, messages("g1", 2..=3));
    let report = indexer.end_transaction().await.expect("join").expect("reconcile");

    assert_eq!(report.delta_inserted, 0);
    assert_eq!(report.backfills_scheduled, 1);
    wait_idle(&indexer).await;
    assert_eq!(stored_ids(&indexer, "g1").await, vec![1, 2, 3]);
}

#[tokio::test]
async fn begin_transaction_discards_previous_buffer() {
    let conv = group("g1", Some(101));
    let source = FakeSource::new().with_conversation(conv.clone(), messages("g1", 1..=101));
    let config = test_config(DeltaPolicy::Strict, 5);
    let (indexer, _) = setup(source, &config).await;
    indexer
        .database()
        .commit_batch("g1", &messages("g1", 1..=100), Some("100"))
        .await
        .expect("seed");

    indexer.begin_transaction(Some(vec![conv.clone()]));
    indexer.submit_update(&conv, messages("g1", 100..=101));
    indexer.begin_transaction(Some(vec![conv]));
    let report = indexer.end_transaction().await.expect("join").expect("reconcile");

    assert_eq!(report.delta_resolved, 0);
    assert_eq!(report.backfills_scheduled, 1);
    wait_idle(&indexer).await;
}

#[tokio::test]
async fn updates_for_unlisted_conversations_are_ignored() {
    let conv = group("g1", Some(1));
    let stray = group("stray", Some(2));
    let source = FakeSource::new().with_conversation(conv.clone(), messages("g1", [1]));
    let config = test_config(DeltaPolicy::Strict, 5);
    let (indexer, _) = setup(source, &config).await;
    indexer
        .database()
        .commit_batch("g1", &messages("g1", [1]), Some("1"))
        .await
        .expect("seed");

    indexer.begin_transaction(Some(vec![conv]));
    indexer.submit_update(&stray, messages("stray", 1..=2));
    let report = indexer.end_transaction().await.expect("join").expect("reconcile");

    assert_eq!(report.outdated, 0);
    assert!(stored_ids(&indexer, "stray").await.is_empty());
}

// ============================================================================
// Listing gate
// ============================================================================

#[tokio::test]
async fn missing_listing_is_fetched_after_timeout() {
    let conv = group("g1", Some(2));
    let source = FakeSource::new().with_conversation(conv, messages("g1", 1..=2));
    let config = test_config(DeltaPolicy::Strict, 0);
    let (indexer, source) = setup(source, &config).await;

    indexer.begin_transaction(None);
    let report = indexer.end_transaction().await.expect("join").expect("reconcile");

    assert_eq!(report.listing, ListingOrigin::Fetched);
    assert_eq!(report.conversations, 1);
    assert_eq!(report.backfills_scheduled, 1);
    assert_eq!(source.list_calls.load(Ordering::SeqCst), 1);
    wait_idle(&indexer).await;
    assert_eq!(watermark(&indexer, "g1").await, Some(2));
}

#[tokio::test]
async fn late_listing_opens_the_gate() {
    let conv = group("g1", Some(2));
    let source = FakeSource::new().with_conversation(conv.clone(), messages("g1", 1..=2));
    let config = test_config(DeltaPolicy::Strict, 30);
    let (indexer, source) = setup(source, &config).await;

    indexer.begin_transaction(None);
    let handle = indexer.end_transaction();
    tokio::time::sleep(Duration::from_millis(20)).await;
    indexer.supply_listing(vec![conv]);
    let report = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("gate opened before timeout")
        .expect("join")
        .expect("reconcile");

    assert_eq!(report.listing, ListingOrigin::Supplied);
    assert_eq!(source.list_calls.load(Ordering::SeqCst), 0);
    wait_idle(&indexer).await;
}

#[tokio::test]
async fn unavailable_listing_ends_cycle_quietly() {
    let mut source = FakeSource::new().with_conversation(group("g1", Some(2)), messages("g1", 1..=2));
    source.listing_fails = true;
    let config = test_config(DeltaPolicy::Strict, 0);
    let (indexer, _) = setup(source, &config).await;

    indexer.begin_transaction(None);
    let report = indexer.end_transaction().await.expect("join").expect("reconcile");

    assert_eq!(report.listing, ListingOrigin::Unavailable);
    assert_eq!(report.backfills_scheduled, 0);
    assert!(indexer.scheduler().list_running().is_empty());
}

// ============================================================================
// Scheduling
// ============================================================================

#[tokio::test]
async fn running_backfill_is_not_scheduled_twice() {
    let conv = group("g1", Some(3));
    let gate = Arc::new(Semaphore::new(0));
    let source = FakeSource::new()
        .with_conversation(conv.clone(), messages("g1", 1..=3))
        .gated(gate.clone());
    let config = test_config(DeltaPolicy::Strict, 5);
    let (indexer, _) = setup(source, &config).await;

    indexer.begin_transaction(Some(vec![conv.clone()]));
    let first = indexer.end_transaction().await.expect("join").expect("reconcile");
    indexer.begin_transaction(Some(vec![conv]));
    let second = indexer.end_transaction().await.expect("join").expect("reconcile");

    assert_eq!(first.backfills_scheduled, 1);
    assert_eq!(second.backfills_scheduled, 0);
    assert_eq!(second.backfills_skipped, 1);

    gate.add_permits(100);
    wait_idle(&indexer).await;
    assert_eq!(finished_state(&indexer, "g1"), vec![TaskState::Completed]);
}

#[tokio::test]
async fn cancelled_backfill_does_not_advance_watermark() {
    let conv = group("g1", Some(3));
    let gate = Arc::new(Semaphore::new(0));
    let source = FakeSource::new()
        .with_conversation(conv.clone(), messages("g1", 1..=3))
        .gated(gate);
    let config = test_config(DeltaPolicy::Strict, 5);
    let (indexer, _) = setup(source, &config).await;

    indexer.begin_transaction(Some(vec![conv]));
    indexer.end_transaction().await.expect("join").expect("reconcile");
    assert!(indexer.scheduler().is_running("g1"));

    indexer.scheduler().cancel_all();
    wait_idle(&indexer).await;

    assert_eq!(finished_state(&indexer, "g1"), vec![TaskState::Cancelled]);
    assert_eq!(watermark(&indexer, "g1").await, None);
}

#[tokio::test]
async fn backfill_cancelled_between_pages_keeps_fetched_pages_but_not_watermark() {
    let conv = group("g1", Some(40));
    // Newest page and one older page get through; the third fetch blocks.
    let gate = Arc::new(Semaphore::new(2));
    let source = FakeSource::new()
        .with_conversation(conv.clone(), messages("g1", 1..=40))
        .gated(gate);
    let config = test_config(DeltaPolicy::Strict, 5);
    let (indexer, source) = setup(source, &config).await;
    indexer
        .database()
        .commit_batch("g1", &messages("g1", 1..=5), Some("5"))
        .await
        .expect("seed");

    indexer.begin_transaction(Some(vec![conv]));
    indexer.end_transaction().await.expect("join").expect("reconcile");

    tokio::time::timeout(Duration::from_secs(10), async {
        while source.fetch_calls.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("third page requested");
    assert!(indexer.scheduler().is_running("g1"));

    indexer.scheduler().cancel_all();
    wait_idle(&indexer).await;

    assert_eq!(finished_state(&indexer, "g1"), vec![TaskState::Cancelled]);
    assert_eq!(watermark(&indexer, "g1").await, Some(5));
    let expected: Vec<u64> = (1..=5).chain(21..=40).collect();
    assert_eq!(stored_ids(&indexer, "g1").await, expected);
}
