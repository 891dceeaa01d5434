//! The binder facade: validates destinations, provisions topics, and wires
//! the consumer and producer sides together.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::assignment::{validate_instance, ConsumerBinding, PartitionInfo};
use crate::config::{ConsumerBindingConfig, KafkaBinderConfig, ProducerBindingConfig};
use crate::consumer::{acknowledge_in_order, ConsumerEndpoint, DeliveryHeaders};
use crate::dlq::DlqSender;
use crate::error::BinderError;
use crate::pipeline::{ConsumptionPipeline, DeadLetterSink, DlqRoute, RecordHandler};
use crate::producer::ProducerBinding;
use crate::provisioner::TopicProvisioner;
use crate::topic::{dlq_topic_for, validate_topic_name};

/// Binds message channels to Kafka topics. One binder per cluster; bindings
/// share its configuration, its DLQ producer, and its record of which topic
/// partitions are in use.
pub struct KafkaBinder {
    config: Arc<KafkaBinderConfig>,
    provisioner: TopicProvisioner,
    dlq: Arc<DlqSender>,
    topics_in_use: DashMap<String, Vec<PartitionInfo>>,
}

impl KafkaBinder {
    pub fn new(config: KafkaBinderConfig) -> Self {
        let config = Arc::new(config);
        Self {
            provisioner: TopicProvisioner::new(config.clone()),
            dlq: Arc::new(DlqSender::new(config.clone())),
            config,
            topics_in_use: DashMap::new(),
        }
    }

    pub fn config(&self) -> &KafkaBinderConfig {
        &self.config
    }

    /// Binds `handler` to `topic` as a member of consumer group `group` and
    /// starts the binding. The topic is provisioned with one partition per
    /// worker across the scaled group so each can own at least one.
    pub async fn bind_consumer(
        &self,
        topic: &str,
        group: &str,
        binding_config: ConsumerBindingConfig,
        handler: Arc<dyn RecordHandler>,
    ) -> Result<Arc<ConsumerEndpoint>, BinderError> {
        validate_topic_name(topic)?;
        validate_instance(&binding_config)?;
        let desired = binding_config.instance_count * binding_config.concurrency.max(1);
        let partitions = self.provisioner.ensure_topic_exists(topic, desired).await?;

        let binding = ConsumerBinding::create(topic, group, &binding_config, &partitions)?;
        self.topics_in_use
            .insert(topic.to_string(), binding.assigned.clone());

        let dlq = binding_config.enable_dlq.then(|| {
            let sink: Arc<dyn DeadLetterSink> = self.dlq.clone();
            DlqRoute {
                topic: dlq_topic_for(topic, group),
                sink,
            }
        });
        let pipeline = Arc::new(ConsumptionPipeline::new(
            handler,
            binding_config.retry.clone(),
            binding_config.ack_mode,
            dlq,
        ));

        let endpoint = Arc::new(ConsumerEndpoint::new(
            self.config.clone(),
            binding_config,
            binding,
            pipeline,
        ));
        endpoint.start()?;
        Ok(endpoint)
    }

    /// Binds a producer to `topic` and returns its message handler. The
    /// topic is provisioned with at least the configured partition count;
    /// when it ends up with more partitions, routing spreads over the actual
    /// count.
    pub async fn bind_producer(
        &self,
        topic: &str,
        binding_config: ProducerBindingConfig,
    ) -> Result<Arc<ProducerBinding>, BinderError> {
        validate_topic_name(topic)?;
        let partitions = self
            .provisioner
            .ensure_topic_exists(topic, binding_config.partition_count)
            .await?;

        let actual = partitions.len();
        if actual > binding_config.partition_count {
            info!(
                topic,
                configured = binding_config.partition_count,
                actual,
                "topic has more partitions than the configured partition count; \
                 routing over the actual count"
            );
        }
        self.topics_in_use.insert(topic.to_string(), partitions);

        let binding = ProducerBinding::new(&self.config, topic.to_string(), &binding_config, actual)?;
        Ok(Arc::new(binding))
    }

    /// Topics this binder has bound, with the partitions each binding uses:
    /// the listened subset for consumers, the full set for producers.
    pub fn topics_in_use(&self) -> Vec<(String, Vec<PartitionInfo>)> {
        self.topics_in_use
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Acknowledges a batch of delivered messages in order. Every header set
    /// must carry an acknowledgment handle, so this only applies to bindings
    /// in manual acknowledgment mode.
    pub fn acknowledge_in_order(&self, headers: &[DeliveryHeaders]) -> Result<(), BinderError> {
        acknowledge_in_order(headers)
    }

    /// Tears down binder-owned resources. Consumer and producer bindings are
    /// stopped by their owners; this closes the shared DLQ producer.
    pub fn shutdown(&self) {
        self.dlq.shutdown();
    }
}
