//! Bind-time topic provisioning: make sure a topic exists with the required
//! partition count, creating or expanding it as policy allows, then verify
//! the result through the client metadata view under the bounded metadata
//! retry policy (broker metadata is eventually consistent after a
//! create/expand call).

use std::sync::Arc;

use metrics::counter;
use rdkafka::admin::{AdminClient, AdminOptions, NewPartitions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::metadata::Metadata;
use tracing::{debug, info};

use crate::assignment::PartitionInfo;
use crate::config::KafkaBinderConfig;
use crate::error::ProvisioningError;
use crate::metrics_const::TOPICS_PROVISIONED_TOTAL;
use crate::retry::RetryPolicy;

pub struct TopicProvisioner {
    config: Arc<KafkaBinderConfig>,
    retry: RetryPolicy,
}

impl TopicProvisioner {
    pub fn new(config: Arc<KafkaBinderConfig>) -> Self {
        let retry = config.metadata_retry_policy();
        Self { config, retry }
    }

    /// Ensures `name` exists with at least `desired` partitions and returns
    /// the topic's partition set. The admin client is transient: scoped to
    /// this call and dropped on every exit path.
    pub async fn ensure_topic_exists(
        &self,
        name: &str,
        desired: usize,
    ) -> Result<Vec<PartitionInfo>, ProvisioningError> {
        let timeout = self.config.metadata_fetch_timeout();
        let admin: AdminClient<DefaultClientContext> = self
            .config
            .client_config()
            .create()
            .map_err(ProvisioningError::MetadataFetch)?;

        let metadata = admin
            .inner()
            .fetch_metadata(Some(name), timeout)
            .map_err(ProvisioningError::MetadataFetch)?;

        let described = metadata
            .topics()
            .iter()
            .find(|t| t.name() == name)
            .map(|t| (t.partitions().len(), t.error().map(RDKafkaErrorCode::from)));

        let existing = match described {
            Some((existing, None)) => Some(existing),
            Some((_, Some(RDKafkaErrorCode::UnknownTopicOrPartition))) | None => None,
            Some((_, Some(code))) => {
                return Err(ProvisioningError::MetadataFetch(KafkaError::MetadataFetch(
                    code,
                )));
            }
        };

        match plan_provisioning(&self.config, name, existing, desired)? {
            ProvisioningPlan::UseExisting => {}
            ProvisioningPlan::Grow { target } => {
                self.add_partitions(&admin, name, target).await?;
            }
            ProvisioningPlan::Create { partitions } => {
                self.create_topic(&admin, &metadata, name, partitions).await?;
            }
        }

        self.verify_partitions(name, desired).await
    }

    async fn add_partitions(
        &self,
        admin: &AdminClient<DefaultClientContext>,
        name: &str,
        target: usize,
    ) -> Result<(), ProvisioningError> {
        info!(topic = name, target, "growing topic partition count");
        let request = NewPartitions::new(name, target);
        let options =
            AdminOptions::new().operation_timeout(Some(self.config.metadata_fetch_timeout()));
        let results = admin
            .create_partitions(&[request], &options)
            .await
            .map_err(ProvisioningError::MetadataFetch)?;
        collect_admin_results(results)
    }

    async fn create_topic(
        &self,
        admin: &AdminClient<DefaultClientContext>,
        metadata: &Metadata,
        name: &str,
        partitions: usize,
    ) -> Result<(), ProvisioningError> {
        let mut brokers: Vec<i32> = metadata.brokers().iter().map(|b| b.id()).collect();
        brokers.sort_unstable();

        let assignment = assign_replicas(&brokers, partitions, self.config.replication_factor)?;
        info!(
            topic = name,
            partitions,
            replication_factor = self.config.replication_factor,
            "creating topic"
        );

        let timeout = self.config.metadata_fetch_timeout();
        self.retry
            .execute(|attempt| {
                let assignment = &assignment;
                async move {
                    debug!(topic = name, attempt, "issuing create-topics call");
                    let replicas: Vec<&[i32]> = assignment.iter().map(Vec::as_slice).collect();
                    let new_topic =
                        NewTopic::new(name, partitions as i32, TopicReplication::Variable(&replicas));
                    let options = AdminOptions::new().operation_timeout(Some(timeout));
                    let results = admin
                        .create_topics(&[new_topic], &options)
                        .await
                        .map_err(ProvisioningError::MetadataFetch)?;
                    for result in results {
                        match result {
                            Ok(_) => {}
                            // Created by an earlier, timed-out attempt.
                            Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {}
                            Err((_, code)) => {
                                return Err(ProvisioningError::MetadataFetch(KafkaError::AdminOp(
                                    code,
                                )))
                            }
                        }
                    }
                    Ok(())
                }
            })
            .await?;

        counter!(TOPICS_PROVISIONED_TOTAL, "topic" => name.to_string()).increment(1);
        Ok(())
    }

    /// Re-queries partitions through a plain client, not the admin path, and
    /// checks the partition set against the requested count. Retried under
    /// the metadata policy to absorb control-plane propagation lag.
    async fn verify_partitions(
        &self,
        name: &str,
        desired: usize,
    ) -> Result<Vec<PartitionInfo>, ProvisioningError> {
        let timeout = self.config.metadata_fetch_timeout();
        let client: BaseConsumer = self
            .config
            .client_config()
            .create()
            .map_err(ProvisioningError::MetadataFetch)?;

        self.retry
            .execute(|_attempt| {
                let client = &client;
                async move {
                    let metadata = client
                        .fetch_metadata(Some(name), timeout)
                        .map_err(ProvisioningError::MetadataFetch)?;
                    let partitions: Vec<PartitionInfo> = metadata
                        .topics()
                        .iter()
                        .filter(|t| t.name() == name)
                        .flat_map(|t| t.partitions().iter())
                        .map(|p| PartitionInfo {
                            topic: name.to_string(),
                            partition: p.id(),
                            leader: p.leader(),
                        })
                        .collect();
                    if partitions.len() < desired {
                        return Err(ProvisioningError::PartitionCountMismatch {
                            expected: desired,
                            found: partitions.len(),
                        });
                    }
                    Ok(partitions)
                }
            })
            .await
    }
}

fn collect_admin_results(
    results: Vec<Result<String, (String, RDKafkaErrorCode)>>,
) -> Result<(), ProvisioningError> {
    for result in results {
        if let Err((_, code)) = result {
            return Err(ProvisioningError::MetadataFetch(KafkaError::AdminOp(code)));
        }
    }
    Ok(())
}

/// Action to take for a topic, decided purely from policy and the described
/// topic state (`existing` is `None` when the topic is unknown).
#[derive(Debug, PartialEq, Eq)]
enum ProvisioningPlan {
    UseExisting,
    Grow { target: usize },
    Create { partitions: usize },
}

fn plan_provisioning(
    config: &KafkaBinderConfig,
    name: &str,
    existing: Option<usize>,
    desired: usize,
) -> Result<ProvisioningPlan, ProvisioningError> {
    match existing {
        Some(existing) => {
            // min_partition_count only raises the target when the binder is
            // allowed to add partitions.
            let effective = if config.auto_add_partitions {
                config.min_partition_count.max(desired)
            } else {
                desired
            };
            if existing >= effective {
                Ok(ProvisioningPlan::UseExisting)
            } else if config.auto_add_partitions {
                Ok(ProvisioningPlan::Grow { target: effective })
            } else {
                Err(ProvisioningError::PartitionCountMismatch {
                    expected: desired,
                    found: existing,
                })
            }
        }
        None => {
            if !config.auto_create_topics {
                return Err(ProvisioningError::TopicMissing(name.to_string()));
            }
            // min_partition_count always applies to topic creation.
            Ok(ProvisioningPlan::Create {
                partitions: config.min_partition_count.max(desired),
            })
        }
    }
}

/// Round-robin replica assignment over the sorted broker list: replica `r`
/// of partition `p` lands on broker `(p + r) % broker_count`.
pub fn assign_replicas(
    brokers: &[i32],
    partitions: usize,
    replication_factor: usize,
) -> Result<Vec<Vec<i32>>, ProvisioningError> {
    if brokers.is_empty() {
        return Err(ProvisioningError::ReplicaAssignment(
            "no brokers available".to_string(),
        ));
    }
    if replication_factor == 0 || replication_factor > brokers.len() {
        return Err(ProvisioningError::ReplicaAssignment(format!(
            "replication factor {} must be between 1 and the broker count {}",
            replication_factor,
            brokers.len()
        )));
    }
    Ok((0..partitions)
        .map(|partition| {
            (0..replication_factor)
                .map(|replica| brokers[(partition + replica) % brokers.len()])
                .collect()
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::mocking::MockCluster;

    fn test_config(kafka_hosts: String) -> KafkaBinderConfig {
        KafkaBinderConfig {
            kafka_hosts,
            kafka_tls: false,
            auto_create_topics: true,
            auto_add_partitions: false,
            min_partition_count: 1,
            replication_factor: 1,
            required_acks: 1,
            metadata_fetch_timeout_ms: 5000,
            metadata_retry_max_attempts: 2,
            metadata_retry_initial_backoff_ms: 10,
            metadata_retry_multiplier: 2,
            metadata_retry_max_backoff_ms: 50,
        }
    }

    #[test]
    fn creation_always_applies_the_partition_floor() {
        let mut config = test_config("localhost:9092".to_string());
        config.min_partition_count = 5;

        let plan = plan_provisioning(&config, "orders", None, 3).unwrap();
        assert_eq!(plan, ProvisioningPlan::Create { partitions: 5 });

        let plan = plan_provisioning(&config, "orders", None, 8).unwrap();
        assert_eq!(plan, ProvisioningPlan::Create { partitions: 8 });
    }

    #[test]
    fn missing_topic_without_auto_create_is_fatal() {
        let mut config = test_config("localhost:9092".to_string());
        config.auto_create_topics = false;

        let err = plan_provisioning(&config, "orders", None, 3).unwrap_err();
        match err {
            ProvisioningError::TopicMissing(topic) => assert_eq!(topic, "orders"),
            other => panic!("expected missing topic, got {other}"),
        }
    }

    #[test]
    fn resize_floor_only_applies_with_auto_add() {
        let mut config = test_config("localhost:9092".to_string());
        config.min_partition_count = 5;

        // Auto-add disabled: the floor is ignored and a satisfied desired
        // count leaves the topic alone.
        let plan = plan_provisioning(&config, "orders", Some(4), 4).unwrap();
        assert_eq!(plan, ProvisioningPlan::UseExisting);

        // Auto-add enabled: the floor raises the target.
        config.auto_add_partitions = true;
        let plan = plan_provisioning(&config, "orders", Some(4), 4).unwrap();
        assert_eq!(plan, ProvisioningPlan::Grow { target: 5 });
    }

    #[test]
    fn under_partitioned_topic_grows_when_auto_add_is_enabled() {
        let mut config = test_config("localhost:9092".to_string());
        config.auto_add_partitions = true;

        let plan = plan_provisioning(&config, "orders", Some(2), 6).unwrap();
        assert_eq!(plan, ProvisioningPlan::Grow { target: 6 });

        let err = {
            config.auto_add_partitions = false;
            plan_provisioning(&config, "orders", Some(2), 6).unwrap_err()
        };
        assert!(matches!(
            err,
            ProvisioningError::PartitionCountMismatch {
                expected: 6,
                found: 2
            }
        ));
    }

    #[test]
    fn replicas_rotate_over_sorted_brokers() {
        let assignment = assign_replicas(&[1, 2, 3], 4, 2).unwrap();
        assert_eq!(
            assignment,
            vec![vec![1, 2], vec![2, 3], vec![3, 1], vec![1, 2]]
        );
    }

    #[test]
    fn replication_factor_is_bounded_by_broker_count() {
        assert!(assign_replicas(&[1, 2], 4, 3).is_err());
        assert!(assign_replicas(&[1, 2], 4, 0).is_err());
        assert!(assign_replicas(&[], 4, 1).is_err());
    }

    #[tokio::test]
    async fn provisioned_topic_is_returned_without_admin_calls() {
        let cluster = MockCluster::new(1).expect("failed to create mock cluster");
        cluster
            .create_topic("orders", 4, 1)
            .expect("failed to seed topic");
        let provisioner = TopicProvisioner::new(Arc::new(test_config(
            cluster.bootstrap_servers(),
        )));

        let first = provisioner.ensure_topic_exists("orders", 4).await.unwrap();
        assert_eq!(first.len(), 4);

        // A second invocation is a pure read: same partition set, no
        // create/add-partitions call (the mock broker would reject one).
        let second = provisioner.ensure_topic_exists("orders", 4).await.unwrap();
        let mut first_ids: Vec<i32> = first.iter().map(|p| p.partition).collect();
        let mut second_ids: Vec<i32> = second.iter().map(|p| p.partition).collect();
        first_ids.sort_unstable();
        second_ids.sort_unstable();
        assert_eq!(first_ids, second_ids);
        assert_eq!(first_ids, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn under_partitioned_topic_without_auto_add_is_a_mismatch() {
        let cluster = MockCluster::new(1).expect("failed to create mock cluster");
        cluster
            .create_topic("orders", 4, 1)
            .expect("failed to seed topic");
        let provisioner = TopicProvisioner::new(Arc::new(test_config(
            cluster.bootstrap_servers(),
        )));

        let err = provisioner
            .ensure_topic_exists("orders", 6)
            .await
            .unwrap_err();
        match &err {
            ProvisioningError::PartitionCountMismatch { expected, found } => {
                assert_eq!(*expected, 6);
                assert_eq!(*found, 4);
            }
            other => panic!("expected partition count mismatch, got {other}"),
        }
        let text = err.to_string();
        assert!(text.contains("expected partitions was: 6"));
        assert!(text.contains("4 have been found"));
    }
}
