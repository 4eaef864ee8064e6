//! Maps a configuration string to a concrete collaborator implementation.
//!
//! The source system resolves `*.class` configuration keys via reflection;
//! Rust has no runtime class loader, so this is constructor injection one
//! level removed: a small lookup from the configured name to a factory
//! closure, registered once at startup. Unrecognized names are a
//! configuration error, surfaced via [`crate::error::Error::ProtocolMisuse`].

use std::time::Duration;

use crate::deserializer::{Deserializer, IdentityDeserializer};
use crate::error::{Error, Result};
use crate::metrics::{CountingMetricsRecorder, MetricsRecorder, NoopMetricsRecorder, TracingMetricsRecorder};
use crate::persistence::{FilesystemPersistenceAdapter, InMemoryPersistenceAdapter, PersistenceAdapter};
use crate::retry::{ExponentialBackoffRetryPolicy, FixedCountRetryPolicy, NeverRetryPolicy, RetryPolicy};

/// Builds a [`RetryPolicy`] from the `failed_msg_retry_manager.class` value.
///
/// Recognized names: `never`, `fixed_count:<n>`, `exponential_backoff:<n>:<initial_ms>:<max_ms>`.
pub fn retry_policy_for(name: &str) -> Result<Box<dyn RetryPolicy>> {
    let mut parts = name.split(':');
    match parts.next().unwrap_or_default() {
        "never" => Ok(Box::new(NeverRetryPolicy)),
        "fixed_count" => {
            let max_retries = parts
                .next()
                .ok_or_else(|| Error::ProtocolMisuse(format!("fixed_count requires a retry count: {name}")))?
                .parse()
                .map_err(|_| Error::ProtocolMisuse(format!("invalid retry count in {name}")))?;
            Ok(Box::new(FixedCountRetryPolicy::new(max_retries)))
        }
        "exponential_backoff" => {
            let max_retries = parts
                .next()
                .ok_or_else(|| Error::ProtocolMisuse(format!("exponential_backoff requires a retry count: {name}")))?
                .parse()
                .map_err(|_| Error::ProtocolMisuse(format!("invalid retry count in {name}")))?;
            let initial_ms: u64 = parts
                .next()
                .unwrap_or("100")
                .parse()
                .map_err(|_| Error::ProtocolMisuse(format!("invalid initial delay in {name}")))?;
            let max_ms: u64 = parts
                .next()
                .unwrap_or("30000")
                .parse()
                .map_err(|_| Error::ProtocolMisuse(format!("invalid max delay in {name}")))?;
            Ok(Box::new(ExponentialBackoffRetryPolicy::new(
                max_retries,
                Duration::from_millis(initial_ms),
                Duration::from_millis(max_ms),
            )))
        }
        _ => Err(Error::ProtocolMisuse(format!(
            "unrecognized failed_msg_retry_manager.class: {name}"
        ))),
    }
}

/// Builds a [`PersistenceAdapter`] from the `persistence_manager.class` value.
///
/// Recognized names: `in_memory`, `filesystem:<root>`.
pub fn persistence_adapter_for(name: &str) -> Result<Box<dyn PersistenceAdapter>> {
    let mut parts = name.splitn(2, ':');
    match parts.next().unwrap_or_default() {
        "in_memory" => Ok(Box::new(InMemoryPersistenceAdapter::new())),
        "filesystem" => {
            let root = parts.next().ok_or_else(|| {
                Error::ProtocolMisuse(format!("filesystem persistence requires a root path: {name}"))
            })?;
            Ok(Box::new(FilesystemPersistenceAdapter::new(root)))
        }
        _ => Err(Error::ProtocolMisuse(format!(
            "unrecognized persistence_manager.class: {name}"
        ))),
    }
}

/// Builds a [`MetricsRecorder`] from the `metrics_recorder.class` value.
///
/// Recognized names: `tracing`, `counting`, `noop`.
pub fn metrics_recorder_for(name: &str) -> Result<Box<dyn MetricsRecorder>> {
    match name {
        "tracing" => Ok(Box::new(TracingMetricsRecorder)),
        "counting" => Ok(Box::new(CountingMetricsRecorder::new())),
        "noop" => Ok(Box::new(NoopMetricsRecorder)),
        _ => Err(Error::ProtocolMisuse(format!(
            "unrecognized metrics_recorder.class: {name}"
        ))),
    }
}

/// Builds a [`Deserializer`] from the `deserializer.class` value.
///
/// Recognized names: `identity`.
pub fn deserializer_for(name: &str) -> Result<Box<dyn Deserializer>> {
    match name {
        "identity" => Ok(Box::new(IdentityDeserializer)),
        _ => Err(Error::ProtocolMisuse(format!(
            "unrecognized deserializer.class: {name}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policy_resolves_known_names() {
        assert!(retry_policy_for("never").is_ok());
        assert!(retry_policy_for("fixed_count:3").is_ok());
        assert!(retry_policy_for("exponential_backoff:3:100:5000").is_ok());
    }

    #[test]
    fn retry_policy_rejects_unknown_name() {
        assert!(retry_policy_for("made_up").is_err());
    }

    #[test]
    fn persistence_adapter_resolves_known_names() {
        assert!(persistence_adapter_for("in_memory").is_ok());
        assert!(persistence_adapter_for("filesystem:/tmp/sideline-spout").is_ok());
        assert!(persistence_adapter_for("filesystem").is_err());
    }

    #[test]
    fn metrics_recorder_resolves_known_names() {
        assert!(metrics_recorder_for("tracing").is_ok());
        assert!(metrics_recorder_for("counting").is_ok());
        assert!(metrics_recorder_for("noop").is_ok());
        assert!(metrics_recorder_for("bogus").is_err());
    }

    #[test]
    fn deserializer_resolves_known_names() {
        assert!(deserializer_for("identity").is_ok());
        assert!(deserializer_for("bogus").is_err());
    }
}
