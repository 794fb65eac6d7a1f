pub mod jsonl_source;
pub mod retry;

pub use jsonl_source::{JsonlExportSource, SystemMessageFilter};
pub use retry::{RetryPolicy, RetryingExtractor, RetryingSource};

use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, warn};
use wmis_core::{MessageSource, RawMessage, SourceError};
use wmis_storage::{Checkpoint, CheckpointError, CheckpointStore};

pub const DEFAULT_MAX_PAGE_FETCHES: u32 = 50;

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("source failed for conversation {conversation_id}: {source}")]
    Source {
        conversation_id: String,
        #[source]
        source: SourceError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionOptions {
    pub max_page_fetches: u32,
}

impl Default for CollectionOptions {
    fn default() -> Self {
        Self {
            max_page_fetches: DEFAULT_MAX_PAGE_FETCHES,
        }
    }
}

/// Messages newer than the stored anchor, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectedBatch {
    pub conversation_id: String,
    pub messages: Vec<RawMessage>,
    pub pages_fetched: u32,
    pub anchor_found: bool,
    pub page_limit_reached: bool,
    pub skipped_duplicates: usize,
    pub resumed_from: Option<Checkpoint>,
}

impl CollectedBatch {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// The message the checkpoint moves to once this batch is committed.
    pub fn newest(&self) -> Option<&RawMessage> {
        self.messages.last()
    }
}

pub struct CollectionEngine<'a> {
    checkpoints: &'a CheckpointStore,
    options: CollectionOptions,
}

impl<'a> CollectionEngine<'a> {
    pub fn new(checkpoints: &'a CheckpointStore, options: CollectionOptions) -> Self {
        Self {
            checkpoints,
            options,
        }
    }

    pub fn options(&self) -> &CollectionOptions {
        &self.options
    }

    /// Walks the source newest-first until the stored anchor, the end of
    /// history, or the page budget. Nothing is written here; see
    /// [`CollectionEngine::commit`].
    pub fn collect<S>(
        &self,
        source: &mut S,
        conversation_id: &str,
    ) -> Result<CollectedBatch, CollectError>
    where
        S: MessageSource + ?Sized,
    {
        let checkpoint = self.checkpoints.get(conversation_id);

        if !source.exists() {
            return Err(CollectError::Source {
                conversation_id: conversation_id.to_string(),
                source: SourceError::Unavailable("message source is not running".to_string()),
            });
        }

        let mut batch = CollectedBatch {
            conversation_id: conversation_id.to_string(),
            resumed_from: checkpoint.clone(),
            ..CollectedBatch::default()
        };
        let mut seen: HashSet<(String, String)> = HashSet::new();

        loop {
            if batch.pages_fetched >= self.options.max_page_fetches {
                batch.page_limit_reached = true;
                break;
            }

            let page = source
                .fetch_next_page(conversation_id, batch.pages_fetched)
                .map_err(|source| CollectError::Source {
                    conversation_id: conversation_id.to_string(),
                    source,
                })?;
            batch.pages_fetched += 1;

            for message in page.messages {
                if let Some(anchor) = &checkpoint {
                    if message.matches_anchor(&anchor.last_timestamp, &anchor.last_content) {
                        batch.anchor_found = true;
                        break;
                    }
                }
                if !seen.insert((message.timestamp.clone(), message.content.clone())) {
                    debug!(
                        event = "duplicate_message_skipped",
                        conversation_id = %conversation_id,
                        fingerprint = %message.fingerprint()
                    );
                    batch.skipped_duplicates += 1;
                    continue;
                }
                batch.messages.push(message);
            }

            if batch.anchor_found || !page.has_more {
                break;
            }
        }

        batch.messages.reverse();

        if checkpoint.is_some() && !batch.anchor_found {
            warn!(
                event = "anchor_not_found",
                conversation_id = %conversation_id,
                pages_fetched = batch.pages_fetched,
                page_limit_reached = batch.page_limit_reached,
                collected = batch.messages.len()
            );
        }
        debug!(
            event = "collection_complete",
            conversation_id = %conversation_id,
            collected = batch.messages.len(),
            pages_fetched = batch.pages_fetched,
            anchor_found = batch.anchor_found,
            skipped_duplicates = batch.skipped_duplicates
        );

        Ok(batch)
    }

    /// Moves the anchor to the newest message of `batch`. Call only after the
    /// records derived from the batch are stored. An empty batch leaves the
    /// checkpoint untouched.
    pub fn commit(&self, batch: &CollectedBatch) -> Result<Option<Checkpoint>, CheckpointError> {
        let Some(newest) = batch.newest() else {
            return Ok(None);
        };
        let checkpoint =
            self.checkpoints
                .update(&batch.conversation_id, &newest.timestamp, &newest.content)?;
        debug!(
            event = "checkpoint_committed",
            conversation_id = %batch.conversation_id,
            last_timestamp = %checkpoint.last_timestamp
        );
        Ok(Some(checkpoint))
    }
}
