use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;
use rdkafka::ClientConfig;

use crate::producer::PartitionSelector;
use crate::retry::RetryPolicy;

/// Binder-wide configuration, loaded from the environment.
#[derive(Envconfig, Clone, Debug)]
pub struct KafkaBinderConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    /// Create missing topics at bind time.
    #[envconfig(default = "true")]
    pub auto_create_topics: bool,

    /// Grow under-partitioned topics at bind time instead of failing.
    #[envconfig(default = "false")]
    pub auto_add_partitions: bool,

    /// Floor on the partition count for created (and, when auto-add is
    /// enabled, resized) topics.
    #[envconfig(default = "1")]
    pub min_partition_count: usize,

    #[envconfig(default = "1")]
    pub replication_factor: usize,

    /// Producer `request.required.acks`.
    #[envconfig(default = "1")]
    pub required_acks: i16,

    #[envconfig(default = "10000")]
    pub metadata_fetch_timeout_ms: u64,

    // Bounded retry for provisioning and verification calls; broker metadata
    // is eventually consistent after a create/expand.
    #[envconfig(default = "10")]
    pub metadata_retry_max_attempts: u32,

    #[envconfig(default = "100")]
    pub metadata_retry_initial_backoff_ms: u64,

    #[envconfig(default = "2")]
    pub metadata_retry_multiplier: u32,

    #[envconfig(default = "1000")]
    pub metadata_retry_max_backoff_ms: u64,
}

impl KafkaBinderConfig {
    /// Base rdkafka client configuration shared by every connection the
    /// binder opens (admin, verification, producers, consumer workers).
    pub fn client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config.set("bootstrap.servers", &self.kafka_hosts);
        if self.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        client_config
    }

    pub fn metadata_fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.metadata_fetch_timeout_ms)
    }

    pub fn metadata_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.metadata_retry_max_attempts,
            initial_backoff: Duration::from_millis(self.metadata_retry_initial_backoff_ms),
            multiplier: self.metadata_retry_multiplier,
            max_backoff: Duration::from_millis(self.metadata_retry_max_backoff_ms),
        }
    }
}

/// How record delivery is acknowledged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcknowledgmentMode {
    /// Offsets are stored and committed by the consumer on its own schedule.
    Auto,
    /// The binding stores an offset only when the pipeline acknowledges the
    /// record through its [`Acknowledgment`](crate::consumer::Acknowledgment)
    /// handle.
    Manual,
}

/// Per-binding consumer configuration. Every recognized option is listed
/// here; the binder reads nothing else for the consumer side.
#[derive(Clone, Debug)]
pub struct ConsumerBindingConfig {
    /// Index of this instance within the scaled group, `0..instance_count`.
    pub instance_index: usize,
    /// Number of scaled instances sharing the topic.
    pub instance_count: usize,
    /// Requested workers for this binding; clamped to the number of assigned
    /// partitions.
    pub concurrency: usize,
    pub ack_mode: AcknowledgmentMode,
    /// Forward records whose retries are exhausted to `error.<topic>.<group>`.
    pub enable_dlq: bool,
    /// Message-handling retry policy, distinct from the metadata policy.
    pub retry: RetryPolicy,
    /// `auto.offset.reset` for the binding's consumers.
    pub offset_reset: String,
    /// `auto.commit.interval.ms` for the binding's consumers.
    pub auto_commit_interval_ms: u32,
}

impl Default for ConsumerBindingConfig {
    fn default() -> Self {
        Self {
            instance_index: 0,
            instance_count: 1,
            concurrency: 1,
            ack_mode: AcknowledgmentMode::Auto,
            enable_dlq: false,
            retry: RetryPolicy::default(),
            offset_reset: "earliest".to_string(),
            auto_commit_interval_ms: 5000,
        }
    }
}

impl ConsumerBindingConfig {
    pub fn with_instance(mut self, index: usize, count: usize) -> Self {
        self.instance_index = index;
        self.instance_count = count;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_ack_mode(mut self, ack_mode: AcknowledgmentMode) -> Self {
        self.ack_mode = ack_mode;
        self
    }

    pub fn with_dlq(mut self) -> Self {
        self.enable_dlq = true;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Per-binding producer configuration.
#[derive(Clone)]
pub struct ProducerBindingConfig {
    /// Minimum partition count the topic must offer; the actual count may be
    /// larger and the larger number is used for routing.
    pub partition_count: usize,
    /// Producer `linger.ms`.
    pub batch_timeout_ms: u32,
    /// Producer `compression.codec`.
    pub compression_type: String,
    /// Selector for partitioned bindings; `None` selects round-robin.
    pub partition_selector: Option<Arc<dyn PartitionSelector>>,
}

impl Default for ProducerBindingConfig {
    fn default() -> Self {
        Self {
            partition_count: 1,
            batch_timeout_ms: 0,
            compression_type: "none".to_string(),
            partition_selector: None,
        }
    }
}

impl ProducerBindingConfig {
    pub fn with_partition_count(mut self, partition_count: usize) -> Self {
        self.partition_count = partition_count;
        self
    }

    pub fn with_partition_selector(mut self, selector: Arc<dyn PartitionSelector>) -> Self {
        self.partition_selector = Some(selector);
        self
    }

    pub fn is_partitioned(&self) -> bool {
        self.partition_selector.is_some()
    }
}

impl fmt::Debug for ProducerBindingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerBindingConfig")
            .field("partition_count", &self.partition_count)
            .field("batch_timeout_ms", &self.batch_timeout_ms)
            .field("compression_type", &self.compression_type)
            .field("partitioned", &self.is_partitioned())
            .finish()
    }
}
