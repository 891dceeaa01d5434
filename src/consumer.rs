//! Consumer side of the binder: a started binding runs a bounded pool of
//! workers, each owning a disjoint slice of the assigned partitions through
//! its own statically-assigned consumer. The consumer group id is used for
//! offset commits only; partition ownership never goes through a group
//! rebalance.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::future::join_all;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::{Message, TopicPartitionList};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::assignment::{ConsumerBinding, PartitionInfo};
use crate::config::{AcknowledgmentMode, ConsumerBindingConfig, KafkaBinderConfig};
use crate::error::BinderError;
use crate::metrics_const::RECORDS_PROPAGATED_TOTAL;
use crate::pipeline::{ConsumerRecord, ConsumptionPipeline, Disposition};

#[derive(Debug, thiserror::Error)]
pub enum AckError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("consumer gone")]
    Gone,
}

#[derive(Clone)]
enum AckTarget {
    Consumer(Weak<StreamConsumer>),
    #[cfg(test)]
    Probe(Arc<Mutex<Vec<i64>>>),
}

/// Handle flowing with a record in manual acknowledgment mode. Acknowledging
/// stores the record's offset so the consumer's commit loop picks it up.
#[derive(Clone)]
pub struct Acknowledgment {
    target: AckTarget,
    topic: String,
    partition: i32,
    offset: i64,
}

impl Acknowledgment {
    fn new(consumer: &Arc<StreamConsumer>, record: &ConsumerRecord) -> Self {
        Self {
            target: AckTarget::Consumer(Arc::downgrade(consumer)),
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
        }
    }

    pub fn acknowledge(&self) -> Result<(), AckError> {
        match &self.target {
            AckTarget::Consumer(weak) => {
                let consumer = weak.upgrade().ok_or(AckError::Gone)?;
                // The stored offset is the next one to consume.
                consumer.store_offset(&self.topic, self.partition, self.offset + 1)?;
                Ok(())
            }
            #[cfg(test)]
            AckTarget::Probe(log) => {
                log.lock().unwrap().push(self.offset);
                Ok(())
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn probe_log() -> Arc<Mutex<Vec<i64>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[cfg(test)]
    pub(crate) fn probe(log: Arc<Mutex<Vec<i64>>>, offset: i64) -> Self {
        Self {
            target: AckTarget::Probe(log),
            topic: "probe".to_string(),
            partition: 0,
            offset,
        }
    }
}

/// Header set of one delivered message, carrying the embedded acknowledgment
/// handle when the binding runs in manual mode.
#[derive(Clone, Default)]
pub struct DeliveryHeaders {
    pub acknowledgment: Option<Acknowledgment>,
}

/// Acknowledges each header set in order. Fails if any handle is absent.
pub fn acknowledge_in_order(headers: &[DeliveryHeaders]) -> Result<(), BinderError> {
    for entry in headers {
        let ack = entry.acknowledgment.as_ref().ok_or_else(|| {
            BinderError::IllegalState(
                "acknowledgment shouldn't be null when acknowledging a kafka message manually"
                    .to_string(),
            )
        })?;
        ack.acknowledge().map_err(|e| match e {
            AckError::Kafka(e) => BinderError::Kafka(e),
            AckError::Gone => BinderError::IllegalState("consumer gone".to_string()),
        })?;
    }
    Ok(())
}

/// A bound consumer destination with start/stop lifecycle.
pub struct ConsumerEndpoint {
    binder_config: Arc<KafkaBinderConfig>,
    binding_config: ConsumerBindingConfig,
    binding: ConsumerBinding,
    pipeline: Arc<ConsumptionPipeline>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    running: AtomicBool,
}

impl ConsumerEndpoint {
    pub(crate) fn new(
        binder_config: Arc<KafkaBinderConfig>,
        binding_config: ConsumerBindingConfig,
        binding: ConsumerBinding,
        pipeline: Arc<ConsumptionPipeline>,
    ) -> Self {
        Self {
            binder_config,
            binding_config,
            binding,
            pipeline,
            workers: Mutex::new(Vec::new()),
            shutdown: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub fn binding(&self) -> &ConsumerBinding {
        &self.binding
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawns one worker per `min(concurrency, assigned partitions)`, each
    /// with its own consumer assigned to its slice.
    pub fn start(&self) -> Result<(), BinderError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (shutdown_tx, _) = watch::channel(false);
        let mut handles = Vec::with_capacity(self.binding.concurrency);
        for worker_index in 0..self.binding.concurrency {
            let partitions = self.binding.worker_partitions(worker_index);
            let consumer = Arc::new(self.build_worker_consumer(&partitions)?);
            debug!(
                topic = %self.binding.topic,
                group = %self.binding.group,
                worker_index,
                partitions = ?partitions.iter().map(|p| p.partition).collect::<Vec<_>>(),
                "starting consumer worker"
            );
            handles.push(tokio::spawn(run_worker(
                consumer,
                self.pipeline.clone(),
                shutdown_tx.subscribe(),
            )));
        }

        info!(
            topic = %self.binding.topic,
            group = %self.binding.group,
            workers = self.binding.concurrency,
            listened_partitions = self.binding.assigned.len(),
            "consumer binding started"
        );
        *self.workers.lock().unwrap() = handles;
        *self.shutdown.lock().unwrap() = Some(shutdown_tx);
        Ok(())
    }

    /// Stops accepting new records and joins the workers. An in-flight retry
    /// sequence runs to success, exhaustion, or handler failure; there is no
    /// mid-retry cancellation.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(shutdown) = self.shutdown.lock().unwrap().take() {
            let _ = shutdown.send(true);
        }
        let handles: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        join_all(handles).await;
        info!(
            topic = %self.binding.topic,
            group = %self.binding.group,
            "consumer binding stopped"
        );
    }

    fn build_worker_consumer(
        &self,
        partitions: &[PartitionInfo],
    ) -> Result<StreamConsumer, BinderError> {
        let mut client_config = self.binder_config.client_config();
        client_config
            .set("group.id", &self.binding.group)
            .set("auto.offset.reset", &self.binding_config.offset_reset)
            .set("enable.auto.commit", "true")
            .set(
                "auto.commit.interval.ms",
                self.binding_config.auto_commit_interval_ms.to_string(),
            );
        if self.binding_config.ack_mode == AcknowledgmentMode::Manual {
            // Offsets are stored only on acknowledgment; the commit loop
            // then commits whatever has been stored.
            client_config.set("enable.auto.offset.store", "false");
        }

        let consumer: StreamConsumer = client_config.create()?;
        let mut assignment = TopicPartitionList::new();
        for partition in partitions {
            assignment.add_partition(&partition.topic, partition.partition);
        }
        consumer.assign(&assignment)?;
        Ok(consumer)
    }
}

async fn run_worker(
    consumer: Arc<StreamConsumer>,
    pipeline: Arc<ConsumptionPipeline>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            result = consumer.recv() => match result {
                Ok(message) => {
                    let record = ConsumerRecord {
                        topic: message.topic().to_string(),
                        partition: message.partition(),
                        offset: message.offset(),
                        key: message.key().map(<[u8]>::to_vec),
                        payload: message.payload().map(<[u8]>::to_vec),
                    };
                    drop(message);

                    let ack = (pipeline.ack_mode() == AcknowledgmentMode::Manual)
                        .then(|| Acknowledgment::new(&consumer, &record));
                    match pipeline.process(&record, ack.as_ref()).await {
                        Disposition::Acknowledged | Disposition::DeadLettered => {}
                        Disposition::Propagated(cause) => {
                            // Fatal for this record only; the partition moves on.
                            metrics::counter!(
                                RECORDS_PROPAGATED_TOTAL,
                                "topic" => record.topic.clone()
                            )
                            .increment(1);
                            error!(
                                topic = %record.topic,
                                partition = record.partition,
                                offset = record.offset,
                                error = ?cause,
                                "record failed after exhausting retries"
                            );
                        }
                    }
                }
                Err(e) => {
                    error!(error = ?e, "consumer receive error");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            },
        }
    }
}
