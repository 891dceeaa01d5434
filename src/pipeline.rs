//! Retry envelope around raw per-record delivery, with dead-letter fallback.
//!
//! Attempts are synchronous on the delivering worker: a stalled handler
//! stalls only the partitions owned by that worker, and records from the same
//! partition are never delivered out of order relative to the one being
//! retried.

use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use rdkafka::error::KafkaError;
use tracing::{debug, error, warn};

use crate::config::AcknowledgmentMode;
use crate::consumer::Acknowledgment;
use crate::metrics_const::{
    DLQ_SEND_FAILURES_TOTAL, RECORDS_DEAD_LETTERED_TOTAL, RECORD_RETRY_ATTEMPTS_TOTAL,
};
use crate::retry::{RetryOutcome, RetryPolicy};

/// One record lifted off a partition, detached from the rdkafka borrow.
#[derive(Clone, Debug)]
pub struct ConsumerRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
}

/// The raw "deliver one record" operation supplied by the application.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn handle(
        &self,
        record: &ConsumerRecord,
        ack: Option<&Acknowledgment>,
    ) -> anyhow::Result<()>;
}

/// Destination for records whose retries are exhausted. Implemented by
/// [`DlqSender`](crate::dlq::DlqSender); tests substitute a recording fake.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn send(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        payload: Option<&[u8]>,
    ) -> Result<(), KafkaError>;
}

/// Terminal state of one record's trip through the pipeline. The three
/// states are mutually exclusive.
#[derive(Debug)]
pub enum Disposition {
    Acknowledged,
    DeadLettered,
    Propagated(anyhow::Error),
}

pub(crate) struct DlqRoute {
    pub topic: String,
    pub sink: Arc<dyn DeadLetterSink>,
}

pub struct ConsumptionPipeline {
    handler: Arc<dyn RecordHandler>,
    retry: RetryPolicy,
    ack_mode: AcknowledgmentMode,
    dlq: Option<DlqRoute>,
}

impl ConsumptionPipeline {
    pub(crate) fn new(
        handler: Arc<dyn RecordHandler>,
        retry: RetryPolicy,
        ack_mode: AcknowledgmentMode,
        dlq: Option<DlqRoute>,
    ) -> Self {
        Self {
            handler,
            retry,
            ack_mode,
            dlq,
        }
    }

    pub fn ack_mode(&self) -> AcknowledgmentMode {
        self.ack_mode
    }

    /// Drives one record to a terminal state. The acknowledgment handle is
    /// threaded unchanged through every attempt; only the final successful
    /// attempt acknowledges.
    pub async fn process(
        &self,
        record: &ConsumerRecord,
        ack: Option<&Acknowledgment>,
    ) -> Disposition {
        let outcome = self
            .retry
            .run(|attempt| async move {
                match self.handler.handle(record, ack).await {
                    Ok(()) => Ok(()),
                    Err(cause) => {
                        counter!(
                            RECORD_RETRY_ATTEMPTS_TOTAL,
                            "topic" => record.topic.clone()
                        )
                        .increment(1);
                        debug!(
                            topic = %record.topic,
                            partition = record.partition,
                            offset = record.offset,
                            attempt,
                            error = ?cause,
                            "record delivery attempt failed"
                        );
                        Err(cause)
                    }
                }
            })
            .await;

        match outcome {
            RetryOutcome::Success => {
                if self.ack_mode == AcknowledgmentMode::Manual {
                    if let Some(ack) = ack {
                        if let Err(e) = ack.acknowledge() {
                            warn!(
                                topic = %record.topic,
                                partition = record.partition,
                                offset = record.offset,
                                error = ?e,
                                "failed to acknowledge record"
                            );
                        }
                    }
                }
                Disposition::Acknowledged
            }
            RetryOutcome::Exhausted(cause) => match &self.dlq {
                Some(route) => {
                    self.dead_letter(route, record, &cause).await;
                    Disposition::DeadLettered
                }
                None => Disposition::Propagated(cause),
            },
        }
    }

    /// Forwards the raw key and value bytes, unmodified, to the DLQ topic.
    /// Dispatch failures are logged and never fatal: the record has already
    /// exhausted its retries and must not block the partition.
    async fn dead_letter(&self, route: &DlqRoute, record: &ConsumerRecord, cause: &anyhow::Error) {
        let key_preview = to_display_string(record.key.as_deref(), 50);
        let payload_preview = to_display_string(record.payload.as_deref(), 50);

        match route
            .sink
            .send(
                &route.topic,
                record.key.as_deref(),
                record.payload.as_deref(),
            )
            .await
        {
            Ok(()) => {
                debug!(
                    dlq_topic = %route.topic,
                    partition = record.partition,
                    "sent to DLQ a message with key='{key_preview}' and payload='{payload_preview}'"
                );
            }
            Err(e) => {
                counter!(DLQ_SEND_FAILURES_TOTAL, "topic" => record.topic.clone()).increment(1);
                error!(
                    dlq_topic = %route.topic,
                    partition = record.partition,
                    error = ?e,
                    "error sending to DLQ a message with key='{key_preview}' and payload='{payload_preview}'"
                );
            }
        }

        counter!(RECORDS_DEAD_LETTERED_TOTAL, "topic" => record.topic.clone()).increment(1);
        debug!(
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            error = ?cause,
            "record dead-lettered after exhausting retries"
        );
    }
}

/// Null-safe, lossy preview of raw bytes, truncated with an ellipsis.
fn to_display_string(bytes: Option<&[u8]>, max_characters: usize) -> String {
    let Some(bytes) = bytes else {
        return "null".to_string();
    };
    let text = String::from_utf8_lossy(bytes);
    if text.chars().count() <= max_characters {
        return text.into_owned();
    }
    let truncated: String = text.chars().take(max_characters).collect();
    format!("{truncated}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct FlakyHandler {
        failures_before_success: u32,
        calls: AtomicU32,
    }

    impl FlakyHandler {
        fn failing(failures_before_success: u32) -> Arc<Self> {
            Arc::new(Self {
                failures_before_success,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl RecordHandler for FlakyHandler {
        async fn handle(
            &self,
            _record: &ConsumerRecord,
            _ack: Option<&Acknowledgment>,
        ) -> anyhow::Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                anyhow::bail!("simulated failure {call}")
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(String, Option<Vec<u8>>, Option<Vec<u8>>)>>,
        fail: bool,
    }

    #[async_trait]
    impl DeadLetterSink for RecordingSink {
        async fn send(
            &self,
            topic: &str,
            key: Option<&[u8]>,
            payload: Option<&[u8]>,
        ) -> Result<(), KafkaError> {
            self.sent.lock().unwrap().push((
                topic.to_string(),
                key.map(<[u8]>::to_vec),
                payload.map(<[u8]>::to_vec),
            ));
            if self.fail {
                Err(KafkaError::Canceled)
            } else {
                Ok(())
            }
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            multiplier: 1,
            max_backoff: Duration::from_millis(1),
        }
    }

    fn record() -> ConsumerRecord {
        ConsumerRecord {
            topic: "orders".to_string(),
            partition: 0,
            offset: 42,
            key: Some(b"k1".to_vec()),
            payload: Some(b"v1".to_vec()),
        }
    }

    #[tokio::test]
    async fn transient_failures_end_in_one_successful_delivery() {
        let handler = FlakyHandler::failing(2);
        let pipeline = ConsumptionPipeline::new(
            handler.clone(),
            fast_retry(5),
            AcknowledgmentMode::Auto,
            None,
        );

        let disposition = pipeline.process(&record(), None).await;
        assert!(matches!(disposition, Disposition::Acknowledged));
        // Two failed attempts plus the single successful one.
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter_the_original_bytes() {
        let handler = FlakyHandler::failing(u32::MAX);
        let sink = Arc::new(RecordingSink::default());
        let pipeline = ConsumptionPipeline::new(
            handler.clone(),
            fast_retry(3),
            AcknowledgmentMode::Auto,
            Some(DlqRoute {
                topic: "error.orders.group1".to_string(),
                sink: sink.clone(),
            }),
        );

        let disposition = pipeline.process(&record(), None).await;
        assert!(matches!(disposition, Disposition::DeadLettered));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);

        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let (topic, key, payload) = &sent[0];
        assert_eq!(topic, "error.orders.group1");
        assert_eq!(key.as_deref(), Some(b"k1".as_slice()));
        assert_eq!(payload.as_deref(), Some(b"v1".as_slice()));
    }

    #[tokio::test]
    async fn exhausted_retries_without_dlq_propagate() {
        let handler = FlakyHandler::failing(u32::MAX);
        let pipeline =
            ConsumptionPipeline::new(handler, fast_retry(2), AcknowledgmentMode::Auto, None);

        match pipeline.process(&record(), None).await {
            Disposition::Propagated(cause) => {
                assert!(cause.to_string().contains("simulated failure"))
            }
            other => panic!("expected propagation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dlq_dispatch_failure_is_not_fatal() {
        let handler = FlakyHandler::failing(u32::MAX);
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..Default::default()
        });
        let pipeline = ConsumptionPipeline::new(
            handler,
            fast_retry(2),
            AcknowledgmentMode::Auto,
            Some(DlqRoute {
                topic: "error.orders.group1".to_string(),
                sink: sink.clone(),
            }),
        );

        let disposition = pipeline.process(&record(), None).await;
        assert!(matches!(disposition, Disposition::DeadLettered));
        assert_eq!(sink.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn manual_mode_acknowledges_only_the_final_successful_attempt() {
        let handler = FlakyHandler::failing(2);
        let pipeline = ConsumptionPipeline::new(
            handler.clone(),
            fast_retry(5),
            AcknowledgmentMode::Manual,
            None,
        );

        let log = Acknowledgment::probe_log();
        let ack = Acknowledgment::probe(log.clone(), 42);
        let disposition = pipeline.process(&record(), Some(&ack)).await;
        assert!(matches!(disposition, Disposition::Acknowledged));
        // Three attempts, exactly one acknowledgment.
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(*log.lock().unwrap(), vec![42]);
    }

    #[tokio::test]
    async fn manual_mode_never_acknowledges_exhausted_records() {
        let handler = FlakyHandler::failing(u32::MAX);
        let pipeline =
            ConsumptionPipeline::new(handler, fast_retry(2), AcknowledgmentMode::Manual, None);

        let log = Acknowledgment::probe_log();
        let ack = Acknowledgment::probe(log.clone(), 7);
        let disposition = pipeline.process(&record(), Some(&ack)).await;
        assert!(matches!(disposition, Disposition::Propagated(_)));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn display_string_truncates_and_handles_null() {
        assert_eq!(to_display_string(None, 50), "null");
        assert_eq!(to_display_string(Some(b"short"), 50), "short");
        let long = vec![b'x'; 60];
        let shown = to_display_string(Some(&long), 50);
        assert_eq!(shown.len(), 53);
        assert!(shown.ends_with("..."));
    }
}
