use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait QuotaRefresh: Send + Sync {
    async fn ensure_refresh_interval(&self, max_interval: Duration);
}

#[derive(Debug, Clone, Default)]
pub struct NoopQuotaRefresh;

#[async_trait]
impl QuotaRefresh for NoopQuotaRefresh {
    async fn ensure_refresh_interval(&self, max_interval: Duration) {
        tracing::debug!(
            max_interval_secs = max_interval.as_secs(),
            "no auto-refresh subsystem attached; skipping refresh hint"
        );
    }
}
