use rdkafka::error::KafkaError;
use thiserror::Error;

/// Bind-time failures surfaced to the messaging framework.
#[derive(Debug, Error)]
pub enum BinderError {
    #[error("invalid binding configuration: {0}")]
    Validation(String),

    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
}

/// Failures while ensuring a topic exists with the required partition count.
/// All variants are fatal at bind time once the metadata retry policy is
/// exhausted.
#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("topic {0} does not exist")]
    TopicMissing(String),

    #[error("{}", mismatch_text(.expected, .found))]
    PartitionCountMismatch { expected: usize, found: usize },

    #[error("error fetching kafka topic metadata: {0}")]
    MetadataFetch(#[source] KafkaError),

    #[error("cannot assign replicas: {0}")]
    ReplicaAssignment(String),
}

fn mismatch_text(expected: &usize, found: &usize) -> String {
    format!(
        "the number of expected partitions was: {}, but {} {} been found instead. \
         Consider either increasing the partition count of the topic or enabling \
         `auto_add_partitions`",
        expected,
        found,
        if *found == 1 { "has" } else { "have" }
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatch_message_pluralizes_found_count() {
        let err = ProvisioningError::PartitionCountMismatch {
            expected: 6,
            found: 4,
        };
        let text = err.to_string();
        assert!(text.contains("expected partitions was: 6"));
        assert!(text.contains("4 have been found"));

        let err = ProvisioningError::PartitionCountMismatch {
            expected: 2,
            found: 1,
        };
        assert!(err.to_string().contains("1 has been found"));
    }
}
