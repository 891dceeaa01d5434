//! Static, coordination-free sharding of a topic's partitions across scaled
//! consumer instances. Instance index and count come from the orchestrator
//! and are assumed stable for the binding's lifetime, so no rebalance
//! protocol is involved.

use crate::config::ConsumerBindingConfig;
use crate::error::BinderError;

/// One partition of a topic, as reported by broker metadata.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PartitionInfo {
    pub topic: String,
    pub partition: i32,
    pub leader: i32,
}

/// Computes the subset of `all` this instance must consume: everything for a
/// single instance, otherwise the partitions whose index is congruent to
/// `instance_index` modulo `instance_count`.
pub fn assign_partitions(
    all: &[PartitionInfo],
    instance_index: usize,
    instance_count: usize,
) -> Vec<PartitionInfo> {
    if instance_count == 1 {
        return all.to_vec();
    }
    all.iter()
        .filter(|p| p.partition as usize % instance_count == instance_index)
        .cloned()
        .collect()
}

/// Immutable description of a consumer binding, created at bind time.
#[derive(Clone, Debug)]
pub struct ConsumerBinding {
    pub topic: String,
    pub group: String,
    pub instance_index: usize,
    pub instance_count: usize,
    /// Worker count, already clamped to the assigned partition count.
    pub concurrency: usize,
    pub assigned: Vec<PartitionInfo>,
}

/// Checks the instance coordinates of a binding before any broker call.
pub fn validate_instance(config: &ConsumerBindingConfig) -> Result<(), BinderError> {
    if config.instance_count == 0 {
        return Err(BinderError::Validation(
            "instance count cannot be zero".to_string(),
        ));
    }
    if config.instance_index >= config.instance_count {
        return Err(BinderError::Validation(format!(
            "instance index {} must be smaller than instance count {}",
            config.instance_index, config.instance_count
        )));
    }
    Ok(())
}

impl ConsumerBinding {
    pub fn create(
        topic: &str,
        group: &str,
        config: &ConsumerBindingConfig,
        all_partitions: &[PartitionInfo],
    ) -> Result<Self, BinderError> {
        validate_instance(config)?;

        let assigned =
            assign_partitions(all_partitions, config.instance_index, config.instance_count);
        if assigned.is_empty() {
            return Err(BinderError::Validation(format!(
                "no partitions of topic {topic} assigned to instance {} of {}",
                config.instance_index, config.instance_count
            )));
        }

        // Never spawn more workers than partitions to consume.
        let concurrency = config.concurrency.max(1).min(assigned.len());

        Ok(Self {
            topic: topic.to_string(),
            group: group.to_string(),
            instance_index: config.instance_index,
            instance_count: config.instance_count,
            concurrency,
            assigned,
        })
    }

    /// Partitions owned by one worker of this binding. Workers own disjoint
    /// slices, so no two workers ever contend on the same partition.
    pub fn worker_partitions(&self, worker_index: usize) -> Vec<PartitionInfo> {
        self.assigned
            .iter()
            .enumerate()
            .filter(|(i, _)| i % self.concurrency == worker_index)
            .map(|(_, p)| p.clone())
            .collect()
    }
}
