//! Kafka binder: connects a transport-agnostic channel model to Kafka.
//!
//! The binder provisions topics with the partition count a binding needs,
//! deterministically shards a topic's partitions across scaled consumer
//! instances, drives per-partition consumption through a bounded retry
//! envelope with dead-letter-queue fallback, and routes outbound messages to
//! partitions by selector or round-robin.

pub mod assignment;
pub mod binder;
pub mod config;
pub mod consumer;
pub mod dlq;
pub mod error;
pub mod metrics_const;
pub mod pipeline;
pub mod producer;
pub mod provisioner;
pub mod retry;
pub mod topic;

pub use assignment::{assign_partitions, ConsumerBinding, PartitionInfo};
pub use binder::KafkaBinder;
pub use config::{
    AcknowledgmentMode, ConsumerBindingConfig, KafkaBinderConfig, ProducerBindingConfig,
};
pub use consumer::{Acknowledgment, ConsumerEndpoint, DeliveryHeaders};
pub use error::{BinderError, ProvisioningError};
pub use pipeline::{ConsumerRecord, DeadLetterSink, Disposition, RecordHandler};
pub use producer::{OutboundMessage, PartitionSelector, ProducerBinding};
pub use retry::{RetryOutcome, RetryPolicy};
