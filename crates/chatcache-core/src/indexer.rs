//! Incremental synchronization of the local cache against the message source.
//!
//! A reconciliation cycle is bracketed by [`Indexer::begin_transaction`] and
//! [`Indexer::end_transaction`]. In between, UI code hands over pages it has
//! already fetched through [`Indexer::submit_update`]. When the cycle ends,
//! outdated conversations are either caught up from those pages (a delta)
//! or handed to the scheduler for a paged backfill.
//!
//! Watermark invariant: every message of a conversation with an id at or
//! below its watermark is in the store. Both paths only advance the
//! watermark after the messages it covers are committed.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, DeltaPolicy, SyncConfig};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::models::{Conversation, Message, parse_message_id};
use crate::retry::{RetryPolicy, retry};
use crate::scheduler::TaskScheduler;
use crate::source::MessageSource;

type Listing = Arc<Vec<Conversation>>;

/// Where a cycle's conversation listing came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingOrigin {
    /// Handed in by the caller.
    Supplied,
    /// Fetched from the source after the wait timed out.
    Fetched,
    /// Neither was possible; the cycle did nothing.
    #[default]
    Unavailable,
}

/// Summary of one reconciliation cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub listing: ListingOrigin,
    pub conversations: usize,
    pub outdated: usize,
    pub delta_resolved: usize,
    pub delta_inserted: usize,
    pub backfills_scheduled: usize,
    pub backfills_skipped: usize,
}

/// Result of a completed backfill job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillOutcome {
    pub pages: usize,
    pub inserted: usize,
    /// Watermark after the job, if it moved.
    pub watermark: Option<String>,
}

/// Messages handed in by `submit_update`, coalesced per conversation.
#[derive(Default)]
struct UpdateBuffer {
    slots: RwLock<HashMap<String, Arc<Mutex<Vec<Message>>>>>,
}

impl UpdateBuffer {
    fn append(&self, conversation_id: &str, messages: Vec<Message>) {
        // Appends happen under the map's read lock so `take` cannot swap
        // the map out from under an in-flight append.
        {
            let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(slot) = slots.get(conversation_id) {
                slot.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .extend(messages);
                return;
            }
        }

        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        slots
            .entry(conversation_id.to_string())
            .or_default()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(messages);
    }

    /// Drain everything buffered so far.
    fn take(&self) -> HashMap<String, Vec<Message>> {
        let slots = std::mem::take(&mut *self.slots.write().unwrap_or_else(PoisonError::into_inner));
        slots
            .into_iter()
            .map(|(id, slot)| {
                let messages = std::mem::take(&mut *slot.lock().unwrap_or_else(PoisonError::into_inner));
                (id, messages)
            })
            .collect()
    }

    fn clear(&self) {
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// An outdated conversation and what is known about it.
#[derive(Debug, Clone)]
struct Candidate {
    conversation: Conversation,
    watermark: Option<u64>,
    latest: u64,
}

/// Messages a delta may commit and the watermark they justify.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DeltaPlan {
    pub messages: Vec<Message>,
    pub watermark: u64,
}

/// Plan a delta from buffered messages, or `None` if the watermark message
/// is not among them (there is a gap the buffer cannot bridge).
pub(crate) fn plan_delta(watermark: u64, buffered: Vec<Message>, policy: DeltaPolicy) -> Option<DeltaPlan> {
    let mut by_id: BTreeMap<u64, Message> = BTreeMap::new();
    for msg in buffered {
        match msg.numeric_id() {
            Ok(id) => {
                by_id.entry(id).or_insert(msg);
            }
            Err(err) => tracing::warn!(conversation = %msg.conversation_id, "Skipping buffered message: {err}"),
        }
    }

    if !by_id.contains_key(&watermark) {
        return None;
    }

    let above = match watermark.checked_add(1) {
        Some(next) => by_id.split_off(&next),
        None => BTreeMap::new(),
    };

    let mut frontier = watermark;
    let mut messages = Vec::new();
    for (id, msg) in above {
        if policy == DeltaPolicy::Strict && Some(id) != frontier.checked_add(1) {
            break;
        }
        frontier = id;
        messages.push(msg);
    }

    Some(DeltaPlan {
        messages,
        watermark: frontier,
    })
}

struct Inner {
    db: Database,
    source: Arc<dyn MessageSource>,
    scheduler: TaskScheduler,
    retry: RetryPolicy,
    sync: SyncConfig,
    buffer: UpdateBuffer,
    listing: watch::Sender<Option<Listing>>,
    outdated: Mutex<HashSet<String>>,
}

/// The synchronization engine.
#[derive(Clone)]
pub struct Indexer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Indexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Indexer")
            .field("scheduler", &self.inner.scheduler)
            .finish_non_exhaustive()
    }
}

impl Indexer {
    pub fn new(db: Database, source: Arc<dyn MessageSource>, config: &Config) -> Self {
        Self::with_scheduler(db, source, config, TaskScheduler::new())
    }

    /// Build an engine that schedules backfills on an existing scheduler.
    pub fn with_scheduler(
        db: Database,
        source: Arc<dyn MessageSource>,
        config: &Config,
        scheduler: TaskScheduler,
    ) -> Self {
        let (listing, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                db,
                source,
                scheduler,
                retry: config.retry.clone(),
                sync: config.sync.clone(),
                buffer: UpdateBuffer::default(),
                listing,
                outdated: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn database(&self) -> &Database {
        &self.inner.db
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.inner.scheduler
    }

    /// Conversations left outdated by the last cycle, after delta reconciliation.
    pub fn outdated(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .outdated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Start a reconciliation cycle.
    ///
    /// With a listing, the cycle's gate opens immediately. Without one, it
    /// stays closed until [`supply_listing`](Self::supply_listing) or until
    /// the cycle times out and fetches the listing itself.
    pub fn begin_transaction(&self, known: Option<Vec<Conversation>>) {
        self.inner.buffer.clear();
        self.inner
            .outdated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.inner.listing.send_replace(known.map(Arc::new));
    }

    /// Hand over a listing obtained after `begin_transaction`.
    pub fn supply_listing(&self, conversations: Vec<Conversation>) {
        self.inner.listing.send_replace(Some(Arc::new(conversations)));
    }

    /// Buffer a page of messages the caller already fetched for `conversation`.
    pub fn submit_update(&self, conversation: &Conversation, messages: Vec<Message>) {
        let conversation_id = conversation.conversation_id();
        let (own, foreign): (Vec<Message>, Vec<Message>) = messages
            .into_iter()
            .partition(|msg| msg.conversation_id == conversation_id);
        if !foreign.is_empty() {
            tracing::debug!(
                conversation = conversation_id,
                dropped = foreign.len(),
                "Dropping messages submitted for the wrong conversation"
            );
        }
        if !own.is_empty() {
            self.inner.buffer.append(conversation_id, own);
        }
    }

    /// End the cycle. Reconciliation runs in the background; the handle may be dropped.
    pub fn end_transaction(&self) -> JoinHandle<Result<ReconcileReport>> {
        let this = self.clone();
        tokio::spawn(async move {
            let result = this.reconcile().await;
            match &result {
                Ok(report) => tracing::info!(
                    listing = ?report.listing,
                    conversations = report.conversations,
                    outdated = report.outdated,
                    delta_resolved = report.delta_resolved,
                    backfills = report.backfills_scheduled,
                    "Reconciliation finished"
                ),
                Err(err) => tracing::warn!("Reconciliation failed: {err}"),
            }
            result
        })
    }

    async fn await_listing(&self) -> Option<(Listing, ListingOrigin)> {
        let mut rx = self.inner.listing.subscribe();
        let timeout = self.inner.sync.listing_timeout();
        let supplied = match tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await {
            Ok(Ok(listing)) => listing.clone(),
            _ => None,
        };
        if let Some(listing) = supplied {
            return Some((listing, ListingOrigin::Supplied));
        }

        tracing::debug!(timeout_secs = timeout.as_secs(), "No listing supplied, fetching one");
        match self.fetch_listing().await {
            Ok(listing) => Some((Arc::new(listing), ListingOrigin::Fetched)),
            Err(err) => {
                tracing::warn!("Conversation listing unavailable: {err}");
                None
            }
        }
    }

    async fn fetch_listing(&self) -> Result<Vec<Conversation>> {
        let mut conversations = self.inner.source.list_groups().await?;
        conversations.extend(self.inner.source.list_chats().await?);
        Ok(conversations)
    }

    async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        let Some((listing, origin)) = self.await_listing().await else {
            self.inner.buffer.clear();
            return Ok(report);
        };
        report.listing = origin;
        report.conversations = listing.len();

        let result = self.reconcile_listing(&listing, &mut report).await;

        // Close the gate unless a newer cycle already replaced the listing.
        self.inner.listing.send_if_modified(|current| {
            if current.as_ref().is_some_and(|l| Arc::ptr_eq(l, &listing)) {
                *current = None;
                true
            } else {
                false
            }
        });

        result.map(|()| report)
    }

    async fn reconcile_listing(&self, listing: &[Conversation], report: &mut ReconcileReport) -> Result<()> {
        let mut outdated = self.find_outdated(listing).await?;
        report.outdated = outdated.len();

        for (conversation_id, buffered) in self.inner.buffer.take() {
            let Some(candidate) = outdated.get(&conversation_id) else {
                continue;
            };
            // Never-indexed conversations always get a full backfill.
            let Some(watermark) = candidate.watermark else {
                continue;
            };
            let Some(plan) = plan_delta(watermark, buffered, self.inner.sync.delta_policy) else {
                tracing::debug!(conversation = %conversation_id, watermark, "Buffered pages do not reach the watermark");
                continue;
            };

            if !plan.messages.is_empty() {
                report.delta_inserted += self
                    .inner
                    .db
                    .commit_batch(&conversation_id, &plan.messages, Some(&plan.watermark.to_string()))
                    .await?;
            }

            if plan.watermark >= candidate.latest {
                tracing::debug!(conversation = %conversation_id, watermark = plan.watermark, "Resolved from buffered pages");
                outdated.remove(&conversation_id);
                report.delta_resolved += 1;
            }
        }

        {
            let mut marks = self
                .inner
                .outdated
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            marks.clear();
            marks.extend(outdated.keys().cloned());
        }

        for (conversation_id, candidate) in outdated {
            // Check-then-schedule is not atomic; two concurrent cycles may
            // both schedule. Upserts are idempotent, so that only costs work.
            if self.inner.scheduler.is_running(&conversation_id) {
                report.backfills_skipped += 1;
                continue;
            }

            let job = BackfillJob {
                db: self.inner.db.clone(),
                source: self.inner.source.clone(),
                retry: self.inner.retry.clone(),
                conversation: candidate.conversation,
            };
            let name = format!("Indexing {}", job.conversation.name());
            self.inner
                .scheduler
                .run_tagged(name, conversation_id, move |cancel| job.run(cancel));
            report.backfills_scheduled += 1;
        }

        Ok(())
    }

    /// One pass over the listing against stored watermarks; no network calls.
    async fn find_outdated(&self, listing: &[Conversation]) -> Result<HashMap<String, Candidate>> {
        let statuses: HashMap<String, String> = self
            .inner
            .db
            .index_statuses()
            .await?
            .into_iter()
            .map(|status| (status.conversation_id, status.last_indexed_id))
            .collect();

        let mut outdated = HashMap::new();
        for conversation in listing {
            let watermark = match statuses.get(conversation.conversation_id()) {
                Some(raw) if !raw.is_empty() => match parse_message_id(raw) {
                    Ok(watermark) => Some(watermark),
                    Err(err) => {
                        tracing::warn!(conversation = conversation.conversation_id(), "Ignoring stored watermark: {err}");
                        None
                    }
                },
                _ => None,
            };

            let latest = match conversation.latest_message_id().map(parse_message_id) {
                Some(Ok(latest)) => Some(latest),
                Some(Err(err)) => {
                    tracing::warn!(conversation = conversation.conversation_id(), "Ignoring latest message id: {err}");
                    None
                }
                None => None,
            };

            // Never-indexed conversations are always outdated, preview or not.
            let is_outdated = match (watermark, latest) {
                (None, _) => true,
                (Some(watermark), Some(latest)) => watermark < latest,
                (Some(_), None) => false,
            };
            if is_outdated {
                outdated.insert(
                    conversation.conversation_id().to_string(),
                    Candidate {
                        conversation: conversation.clone(),
                        watermark,
                        latest: latest.unwrap_or(0),
                    },
                );
            }
        }
        Ok(outdated)
    }
}

/// Pages one conversation's history from newest down to its watermark.
struct BackfillJob {
    db: Database,
    source: Arc<dyn MessageSource>,
    retry: RetryPolicy,
    conversation: Conversation,
}

impl BackfillJob {
    async fn run(self, cancel: CancellationToken) -> Result<BackfillOutcome> {
        let conversation_id = self.conversation.conversation_id().to_string();
        self.db.ensure_index_status(&conversation_id).await?;

        let newest = retry(&cancel, &self.retry, "fetch newest page", || {
            self.source.fetch_newest(&self.conversation)
        })
        .await?;

        let mut outcome = BackfillOutcome {
            pages: 1,
            ..BackfillOutcome::default()
        };
        let Some((newest_id, mut oldest_id)) = id_bounds(&newest)? else {
            tracing::debug!(conversation = %conversation_id, "Conversation has no messages");
            return Ok(outcome);
        };
        outcome.inserted += self.db.upsert_messages(&newest).await?;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let watermark = self
                .db
                .find_index_status(&conversation_id)
                .await?
                .map(|status| status.watermark())
                .transpose()?
                .flatten()
                .unwrap_or(0);
            if watermark >= oldest_id {
                break;
            }

            let before = oldest_id.to_string();
            let page = retry(&cancel, &self.retry, "fetch older page", || {
                self.source.fetch_before(&self.conversation, &before)
            })
            .await?;
            outcome.pages += 1;

            let Some((_, page_oldest)) = id_bounds(&page)? else {
                tracing::debug!(conversation = %conversation_id, "Reached the start of history");
                break;
            };
            if page_oldest >= oldest_id {
                return Err(Error::Parse(format!(
                    "page before {oldest_id} in {conversation_id} did not go back in history"
                )));
            }
            outcome.inserted += self.db.upsert_messages(&page).await?;
            oldest_id = page_oldest;
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let newest_id = newest_id.to_string();
        if self.db.advance_watermark(&conversation_id, &newest_id).await? {
            outcome.watermark = Some(newest_id);
        }
        tracing::info!(
            conversation = %conversation_id,
            pages = outcome.pages,
            inserted = outcome.inserted,
            "Backfill complete"
        );
        Ok(outcome)
    }
}

/// Highest and lowest numeric id in a page, or `None` for an empty page.
fn id_bounds(messages: &[Message]) -> Result<Option<(u64, u64)>> {
    let mut bounds: Option<(u64, u64)> = None;
    for msg in messages {
        let id = msg.numeric_id()?;
        bounds = Some(match bounds {
            Some((high, low)) => (high.max(id), low.min(id)),
            None => (id, id),
        });
    }
    Ok(bounds)
}
