use std::future::Future;
use std::time::Duration;

use sha_domain::ErrorKind;
use tracing::warn;

use crate::error::OrchestratorError;

const MAX_ATTEMPTS: u32 = 3;
const BASE_DELAY: Duration = Duration::from_secs(2);
const MAX_DELAY: Duration = Duration::from_secs(30);

/// Retries `op` up to `MAX_ATTEMPTS` times with exponential backoff, but only
/// for errors classified `UpstreamTransient`. `DeviceCorrelationTimeout` and
/// every other kind are surfaced on the first failure — a diverged
/// kernel/CloudStack view needs reconciliation, not a retry.
pub async fn with_upstream_retry<T, F, Fut>(mut op: F) -> Result<T, OrchestratorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, OrchestratorError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.kind() == ErrorKind::UpstreamTransient && attempt < MAX_ATTEMPTS => {
                let delay = (BASE_DELAY * 2u32.pow(attempt - 1)).min(MAX_DELAY);
                warn!(attempt, ?delay, error = %e, "retrying after transient upstream error");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_upstream_retry(|| async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(OrchestratorError::Volume(sha_volume::VolumeError::UpstreamCloudStackTransient("flaky".into())))
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_device_correlation_timeout() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_upstream_retry(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(OrchestratorError::Volume(sha_volume::VolumeError::DeviceCorrelationTimeout {
                volume_id: "vol-1".into(),
                waited_ms: 60_000,
            }))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
