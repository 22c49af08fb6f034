use thiserror::Error;

/// Failure taxonomy shared across the pipeline.
///
/// Infrastructure-facing failures (upstream, cache, webhook delivery) are
/// logged and degraded at the point of occurrence and never surface through
/// this enum; only caller-facing conditions do.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Rate-limited or circuit-open. Recorded by the gateway, degraded to
    /// "no data" before it ever reaches a caller.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(&'static str),

    /// Ingestion aborts for this device only.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// A single malformed reading or field; the batch continues.
    #[error("invalid reading: {0}")]
    ValidationFailure(String),

    /// Connection rejected at the fan-out layer boundary.
    #[error("connection capacity exceeded")]
    CapacityExceeded,

    /// Acknowledge/resolve attempted on a closed alert.
    #[error("alert already resolved")]
    AlreadyResolved,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_stable() {
        assert_eq!(
            CoreError::DeviceNotFound("gw-17".into()).to_string(),
            "device not found: gw-17"
        );
        assert_eq!(
            CoreError::CapacityExceeded.to_string(),
            "connection capacity exceeded"
        );
    }
}
