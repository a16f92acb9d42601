//! Subscription connection worker.
//!
//! One task per client connection. Each iteration fetches a batch, records it
//! with the group coordinator, ships it, and waits for the client ack before
//! the next batch starts. Batches that end up empty after the coordinator's
//! skip set still get recorded and acknowledged so resend bookkeeping reaches
//! the coordinator. A recorded batch that is not acknowledged, because the
//! send, the ack wait or the ack itself failed or was cancelled, is released
//! so its documents are delivered again.

use super::processor::{SubscriptionBatchItem, SubscriptionProcessor};
use crate::error::{Error, Result};
use crate::metrics::ReshardingMetrics;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A batch shipped to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionBatch {
    pub batch_id: u64,
    pub items: Vec<SubscriptionBatchItem>,
    /// Merge of the vectors sent so far on the connection.
    pub last_change_vector: String,
}

/// Client side of the connection.
#[async_trait::async_trait]
pub trait SubscriptionSink: Send + Sync + std::fmt::Debug {
    async fn send_batch(&self, batch: SubscriptionBatch) -> Result<()>;
}

/// Acknowledgment sent by the client after processing a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientAck {
    pub batch_id: u64,
    pub change_vector: String,
}

/// Outcome of one worker iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStep {
    /// Nothing to send or record.
    Idle,
    /// Only bookkeeping was recorded and acknowledged.
    Housekeeping { batch_id: u64 },
    /// A batch reached the client and was acknowledged.
    Delivered { batch_id: u64, documents: usize },
    /// Cancelled while waiting for the client.
    Cancelled,
}

/// Drives a [`SubscriptionProcessor`] for one client.
#[derive(Debug)]
pub struct SubscriptionConnection {
    id: Uuid,
    processor: SubscriptionProcessor,
    sink: Arc<dyn SubscriptionSink>,
    acks: mpsc::Receiver<ClientAck>,
    metrics: Arc<ReshardingMetrics>,
}

impl SubscriptionConnection {
    /// Create a connection; the caller keeps the sending half of the ack channel.
    pub fn new(
        processor: SubscriptionProcessor,
        sink: Arc<dyn SubscriptionSink>,
        acks: mpsc::Receiver<ClientAck>,
        metrics: Arc<ReshardingMetrics>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            processor,
            sink,
            acks,
            metrics,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn processor(&self) -> &SubscriptionProcessor {
        &self.processor
    }

    /// Run one iteration: fetch, record, send and wait for the ack.
    pub async fn process_next_batch(&mut self, cancellation: &CancellationToken) -> Result<BatchStep> {
        let items = tokio::select! {
            _ = cancellation.cancelled() => return Ok(BatchStep::Cancelled),
            items = self.processor.get_batch() => items?,
        };
        if items.is_empty() && !self.processor.state().has_bookkeeping() {
            return Ok(BatchStep::Idle);
        }

        let batch_id = self.processor.record_batch().await?;
        let step = self.deliver(batch_id, items, cancellation).await;
        if !matches!(step, Ok(BatchStep::Delivered { .. } | BatchStep::Housekeeping { .. })) {
            if let Err(e) = self.processor.release_batch().await {
                warn!(connection_id = %self.id, batch_id, error = %e, "Failed to release batch");
            }
        }
        step
    }

    async fn deliver(
        &mut self,
        batch_id: u64,
        items: Vec<SubscriptionBatchItem>,
        cancellation: &CancellationToken,
    ) -> Result<BatchStep> {
        let skipped = self.processor.skipped().clone();
        let items: Vec<SubscriptionBatchItem> = items
            .into_iter()
            .filter(|item| !skipped.contains(&item.document.id))
            .collect();

        if items.is_empty() {
            let starting_point = self.processor.state().starting_point().to_string();
            self.processor
                .acknowledge_batch(batch_id, &starting_point)
                .await?;
            debug!(connection_id = %self.id, batch_id, "Acknowledged housekeeping batch");
            return Ok(BatchStep::Housekeeping { batch_id });
        }

        let documents = items.len();
        let batch = SubscriptionBatch {
            batch_id,
            items,
            last_change_vector: self.processor.state().last_change_vector_sent().to_string(),
        };
        self.sink.send_batch(batch).await?;
        self.metrics.subscription_documents_sent.inc_by(documents as u64);

        let ack_timeout = self.processor.config().ack_timeout;
        let ack = tokio::select! {
            _ = cancellation.cancelled() => return Ok(BatchStep::Cancelled),
            ack = tokio::time::timeout(ack_timeout, self.acks.recv()) => match ack {
                Err(_) => return Err(Error::Timeout),
                Ok(None) => return Err(Error::SendFailed("client closed the connection".into())),
                Ok(Some(ack)) => ack,
            },
        };

        if ack.batch_id != batch_id {
            return Err(Error::InvalidArgument(format!(
                "ack for batch {} while batch {} is pending",
                ack.batch_id, batch_id
            )));
        }

        self.processor
            .acknowledge_batch(batch_id, &ack.change_vector)
            .await?;
        Ok(BatchStep::Delivered {
            batch_id,
            documents,
        })
    }

    /// Run until cancelled or until an iteration fails.
    pub async fn run(&mut self, cancellation: CancellationToken) -> Result<()> {
        let subscription = self.processor.state().subscription().to_string();
        info!(connection_id = %self.id, subscription = %subscription, "Subscription connection started");

        loop {
            if cancellation.is_cancelled() {
                break;
            }

            match self.process_next_batch(&cancellation).await {
                Ok(BatchStep::Idle) => {
                    let etag = self.processor.state().last_fetched_etag();
                    let idle = self.processor.config().idle_poll_interval;
                    let source = self.processor.source().clone();
                    tokio::select! {
                        _ = cancellation.cancelled() => break,
                        _ = source.wait_for_changes(etag) => {}
                        _ = tokio::time::sleep(idle) => {}
                    }
                }
                Ok(BatchStep::Cancelled) => break,
                Ok(_) => continue,
                Err(e) => {
                    warn!(connection_id = %self.id, subscription = %subscription, error = %e, "Subscription connection failed");
                    return Err(e);
                }
            }
        }

        info!(connection_id = %self.id, subscription = %subscription, "Subscription connection stopped");
        Ok(())
    }
}
