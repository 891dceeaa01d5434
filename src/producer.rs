//! Producer side of the binder: partition routing and the outbound message
//! handler built by `bind_producer`.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use tracing::{debug, info};

use crate::config::{KafkaBinderConfig, ProducerBindingConfig};
use crate::error::BinderError;

/// An outbound message with a raw byte payload. The partition key, when
/// present, is only consulted by a configured [`PartitionSelector`].
#[derive(Clone, Debug, Default)]
pub struct OutboundMessage {
    pub payload: Vec<u8>,
    pub partition_key: Option<Vec<u8>>,
}

impl OutboundMessage {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            partition_key: None,
        }
    }

    pub fn with_partition_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.partition_key = Some(key.into());
        self
    }
}

/// Partition extraction for "partitioned" bindings; supplied by the
/// messaging-framework collaborator.
pub trait PartitionSelector: Send + Sync {
    fn select(&self, message: &OutboundMessage, partition_count: i32) -> i32;
}

/// Chooses a destination partition per message: delegate to the configured
/// selector, or round-robin over the known partition count.
pub struct ProductionRouter {
    selector: Option<Arc<dyn PartitionSelector>>,
    partition_count: i32,
    round_robin: AtomicI32,
}

impl ProductionRouter {
    pub fn new(selector: Option<Arc<dyn PartitionSelector>>, partition_count: i32) -> Self {
        Self {
            selector,
            partition_count,
            round_robin: AtomicI32::new(0),
        }
    }

    pub fn partition_count(&self) -> i32 {
        self.partition_count
    }

    pub fn route(&self, message: &OutboundMessage) -> i32 {
        match &self.selector {
            Some(selector) => selector.select(message, self.partition_count),
            None => self.next_round_robin() % self.partition_count,
        }
    }

    /// Atomically incremented counter; resets to zero immediately upon
    /// reaching `i32::MAX` so wraparound never yields a negative modulo.
    fn next_round_robin(&self) -> i32 {
        let result = self.round_robin.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if result == i32::MAX {
            self.round_robin.store(0, Ordering::Relaxed);
        }
        result
    }
}

/// Message handler for a bound producer destination, sending raw payloads to
/// the routed partition of the target topic.
pub struct ProducerBinding {
    producer: FutureProducer,
    topic: String,
    router: ProductionRouter,
    running: AtomicBool,
}

impl std::fmt::Debug for ProducerBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerBinding")
            .field("topic", &self.topic)
            .field("running", &self.running)
            .finish_non_exhaustive()
    }
}

impl ProducerBinding {
    pub(crate) fn new(
        binder_config: &KafkaBinderConfig,
        topic: String,
        binding_config: &ProducerBindingConfig,
        partition_count: usize,
    ) -> Result<Self, BinderError> {
        let mut client_config = binder_config.client_config();
        client_config
            // Outbound sends are not retried by the binder; failures surface
            // to the caller.
            .set("message.send.max.retries", "0")
            .set("request.required.acks", binder_config.required_acks.to_string())
            .set("linger.ms", binding_config.batch_timeout_ms.to_string())
            .set("compression.codec", &binding_config.compression_type);
        debug!("rdkafka producer configuration: {:?}", client_config);

        let producer: FutureProducer = client_config.create()?;
        info!(topic = %topic, partition_count, "producer binding created");

        Ok(Self {
            producer,
            topic,
            router: ProductionRouter::new(
                binding_config.partition_selector.clone(),
                partition_count as i32,
            ),
            running: AtomicBool::new(true),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn router(&self) -> &ProductionRouter {
        &self.router
    }

    /// Routes and sends one message on the caller's task. Send buffering and
    /// batching belong to the underlying client.
    pub async fn send(&self, message: OutboundMessage) -> Result<(), BinderError> {
        if !self.is_running() {
            return Err(BinderError::IllegalState(
                "producer binding is stopped".to_string(),
            ));
        }
        let partition = self.router.route(&message);
        let record: FutureRecord<'_, [u8], [u8]> = FutureRecord {
            topic: &self.topic,
            partition: Some(partition),
            key: None,
            payload: Some(&message.payload),
            timestamp: None,
            headers: None,
        };
        match self.producer.send(record, Timeout::Never).await {
            Ok(_) => Ok(()),
            Err((e, _)) => Err(BinderError::Kafka(e)),
        }
    }

    pub fn flush(&self, timeout: Duration) -> Result<(), BinderError> {
        self.producer.flush(timeout)?;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
