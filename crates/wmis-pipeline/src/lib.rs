pub mod command_extractor;

pub use command_extractor::CommandExtractor;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};
use wmis_collector::{CollectedBatch, CollectionEngine, CollectionOptions};
use wmis_core::{
    build_batch, MessageSource, RawMessage, RecordSink, SinkError, StructuredExtractor,
    TransactionRecord,
};
use wmis_storage::{CheckpointError, CheckpointStore};

pub const DEFAULT_BATCH_SIZE: usize = 20;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("storage failed for conversation {conversation_id}: {source}")]
    Storage {
        conversation_id: String,
        #[source]
        source: SinkError,
    },
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Messages handed to the extractor per call.
    pub batch_size: usize,
    pub collection: CollectionOptions,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            collection: CollectionOptions::default(),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConversationReport {
    pub conversation_id: String,
    pub messages_collected: usize,
    pub pages_fetched: u32,
    pub anchor_found: bool,
    pub page_limit_reached: bool,
    pub batches: usize,
    pub extraction_failures: usize,
    pub records_stored: usize,
    pub checkpoint_advanced: bool,
    /// Set when collection failed and the conversation was skipped.
    pub error: Option<String>,
}

impl ConversationReport {
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub conversations_processed: usize,
    pub conversations_failed: usize,
    pub messages_collected: usize,
    pub batches: usize,
    pub extraction_failures: usize,
    pub records_stored: usize,
    pub conversations: Vec<ConversationReport>,
}

impl RunReport {
    fn absorb(&mut self, conversation: ConversationReport) {
        if conversation.failed() {
            self.conversations_failed += 1;
        } else {
            self.conversations_processed += 1;
        }
        self.messages_collected += conversation.messages_collected;
        self.batches += conversation.batches;
        self.extraction_failures += conversation.extraction_failures;
        self.records_stored += conversation.records_stored;
        self.conversations.push(conversation);
    }
}

/// Splits collected messages into extractor calls of at most `batch_size`,
/// preserving order.
pub fn plan_batches(messages: &[RawMessage], batch_size: usize) -> Vec<&[RawMessage]> {
    messages.chunks(batch_size.max(1)).collect()
}

/// Runs conversations one after another: collect, extract per batch, build
/// records, store, then commit the checkpoint.
pub struct Pipeline<'a, S, X, K> {
    engine: CollectionEngine<'a>,
    source: S,
    extractor: X,
    sink: K,
    batch_size: usize,
}

impl<'a, S, X, K> Pipeline<'a, S, X, K>
where
    S: MessageSource,
    X: StructuredExtractor,
    K: RecordSink,
{
    pub fn new(
        checkpoints: &'a CheckpointStore,
        source: S,
        extractor: X,
        sink: K,
        options: PipelineOptions,
    ) -> Self {
        Self {
            engine: CollectionEngine::new(checkpoints, options.collection),
            source,
            extractor,
            sink,
            batch_size: options.batch_size.max(1),
        }
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// A source failure only skips its conversation. Storage and checkpoint
    /// failures abort the run, since continuing would either lose records or
    /// re-collect them forever.
    pub fn run<I, C>(&mut self, conversations: I) -> Result<RunReport, PipelineError>
    where
        I: IntoIterator<Item = C>,
        C: AsRef<str>,
    {
        let mut report = RunReport::default();
        for conversation_id in conversations {
            let conversation = self.process_conversation(conversation_id.as_ref())?;
            report.absorb(conversation);
        }

        info!(
            event = "run_complete",
            processed = report.conversations_processed,
            failed = report.conversations_failed,
            messages = report.messages_collected,
            records = report.records_stored,
            extraction_failures = report.extraction_failures
        );
        Ok(report)
    }

    pub fn process_conversation(
        &mut self,
        conversation_id: &str,
    ) -> Result<ConversationReport, PipelineError> {
        let mut report = ConversationReport {
            conversation_id: conversation_id.to_string(),
            ..ConversationReport::default()
        };

        let batch = match self.engine.collect(&mut self.source, conversation_id) {
            Ok(batch) => batch,
            Err(err) => {
                warn!(
                    event = "collection_failed",
                    conversation_id = %conversation_id,
                    error = %err
                );
                report.error = Some(err.to_string());
                return Ok(report);
            }
        };

        report.messages_collected = batch.len();
        report.pages_fetched = batch.pages_fetched;
        report.anchor_found = batch.anchor_found;
        report.page_limit_reached = batch.page_limit_reached;
        if batch.is_empty() {
            info!(event = "conversation_up_to_date", conversation_id = %conversation_id);
            return Ok(report);
        }

        let records = self.extract_records(&batch, &mut report);
        if !records.is_empty() {
            report.records_stored =
                self.sink
                    .store(&records)
                    .map_err(|source| PipelineError::Storage {
                        conversation_id: conversation_id.to_string(),
                        source,
                    })?;
        }

        report.checkpoint_advanced = self.engine.commit(&batch)?.is_some();

        info!(
            event = "conversation_processed",
            conversation_id = %conversation_id,
            messages = report.messages_collected,
            batches = report.batches,
            records = report.records_stored,
            extraction_failures = report.extraction_failures
        );
        Ok(report)
    }

    fn extract_records(
        &self,
        batch: &CollectedBatch,
        report: &mut ConversationReport,
    ) -> Vec<TransactionRecord> {
        let mut records = Vec::new();
        for (batch_index, messages) in plan_batches(&batch.messages, self.batch_size)
            .into_iter()
            .enumerate()
        {
            report.batches += 1;
            match self.extractor.extract(messages) {
                Ok(candidates) => {
                    records.extend(build_batch(&candidates, messages, Utc::now()));
                }
                Err(err) => {
                    report.extraction_failures += 1;
                    warn!(
                        event = "extraction_failed",
                        conversation_id = %batch.conversation_id,
                        batch_index = batch_index,
                        messages = messages.len(),
                        error = %err
                    );
                }
            }
        }
        records
    }
}
