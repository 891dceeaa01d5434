use crate::error::BinderError;

/// Checks a topic name before it reaches the broker. Allowed characters are
/// ASCII alphanumerics, '.', '_' and '-'.
pub fn validate_topic_name(name: &str) -> Result<(), BinderError> {
    let legal = !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-');
    if legal {
        Ok(())
    } else {
        Err(BinderError::Validation(format!(
            "topic name '{name}' can only have ASCII alphanumerics, '.', '_' and '-'"
        )))
    }
}

/// Derives the dead-letter topic for a consumer binding. The naming rule is
/// part of the observable contract.
pub fn dlq_topic_for(topic: &str, group: &str) -> String {
    format!("error.{topic}.{group}")
}
