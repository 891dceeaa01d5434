//! Shared producer used only for dead-lettering failed records.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use tracing::{debug, error, warn};

use crate::config::KafkaBinderConfig;
use crate::pipeline::DeadLetterSink;

/// Lazily-constructed producer for DLQ traffic. The underlying producer is
/// built on first use through a single-assignment cell, so concurrent first
/// dead-letter events from multiple workers construct exactly one client.
/// DLQ traffic is not performance-critical: broker-client defaults, no
/// batching or compression tuning.
pub struct DlqSender {
    config: Arc<KafkaBinderConfig>,
    producer: OnceCell<FutureProducer>,
    closed: AtomicBool,
}

impl DlqSender {
    pub fn new(config: Arc<KafkaBinderConfig>) -> Self {
        Self {
            config,
            producer: OnceCell::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn producer(&self) -> Result<&FutureProducer, KafkaError> {
        if self.closed.load(Ordering::SeqCst) {
            // A torn-down sender must not be reused.
            return Err(KafkaError::Canceled);
        }
        self.producer.get_or_try_init(|| {
            debug!("initializing DLQ producer");
            let mut client_config = self.config.client_config();
            client_config.set("message.send.max.retries", "0");
            client_config.create()
        })
    }

    pub async fn send(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        payload: Option<&[u8]>,
    ) -> Result<(), KafkaError> {
        let producer = self.producer()?;
        let record: FutureRecord<'_, [u8], [u8]> = FutureRecord {
            topic,
            partition: None,
            key,
            payload,
            timestamp: None,
            headers: None,
        };
        match producer.send(record, Timeout::Never).await {
            Ok(_) => Ok(()),
            Err((e, _)) => Err(e),
        }
    }

    /// Flushes and closes the underlying producer. Runs at most once; later
    /// calls and later sends are rejected.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(producer) = self.producer.get() {
            if let Err(e) = producer.flush(Duration::from_secs(10)) {
                warn!(error = ?e, "failed to flush DLQ producer during shutdown");
            }
            debug!("DLQ producer closed");
        }
    }
}

#[async_trait]
impl DeadLetterSink for DlqSender {
    async fn send(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        payload: Option<&[u8]>,
    ) -> Result<(), KafkaError> {
        let result = DlqSender::send(self, topic, key, payload).await;
        if let Err(e) = &result {
            error!(dlq_topic = topic, error = ?e, "DLQ send failed");
        }
        result
    }
}
