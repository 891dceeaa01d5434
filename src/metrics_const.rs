pub const RECORD_RETRY_ATTEMPTS_TOTAL: &str = "binder_record_retry_attempts_total";
pub const RECORDS_DEAD_LETTERED_TOTAL: &str = "binder_records_dead_lettered_total";
pub const RECORDS_PROPAGATED_TOTAL: &str = "binder_records_propagated_total";
pub const DLQ_SEND_FAILURES_TOTAL: &str = "binder_dlq_send_failures_total";
pub const TOPICS_PROVISIONED_TOTAL: &str = "binder_topics_provisioned_total";
