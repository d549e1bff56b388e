//! Per-account, per-period token usage accounting.
//!
//! Usage keys are `(account_id, period_key)` where the period key is the
//! UTC month, so counters roll over naturally at month boundaries.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::error::RecordStoreError;

/// Accumulates billable token totals for an account within a period.
#[async_trait]
pub trait UsageMeter: Send + Sync {
    /// Atomically add `tokens` to the account's counter for the period,
    /// returning the new total. A missing counter starts at zero.
    async fn increment(
        &self,
        account_id: &str,
        period_key: &str,
        tokens: u64,
    ) -> Result<u64, RecordStoreError>;

    /// Current total for the account and period, zero if never incremented.
    async fn get(&self, account_id: &str, period_key: &str) -> Result<u64, RecordStoreError>;
}

/// In-process usage meter backed by a mutex-guarded map.
#[derive(Default)]
pub struct MemoryUsageMeter {
    counters: Mutex<HashMap<(String, String), u64>>,
}

impl MemoryUsageMeter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageMeter for MemoryUsageMeter {
    async fn increment(
        &self,
        account_id: &str,
        period_key: &str,
        tokens: u64,
    ) -> Result<u64, RecordStoreError> {
        let mut counters = self.counters.lock().await;
        let entry = counters
            .entry((account_id.to_string(), period_key.to_string()))
            .or_insert(0);
        *entry = entry.saturating_add(tokens);
        Ok(*entry)
    }

    async fn get(&self, account_id: &str, period_key: &str) -> Result<u64, RecordStoreError> {
        let counters = self.counters.lock().await;
        Ok(counters
            .get(&(account_id.to_string(), period_key.to_string()))
            .copied()
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_increment_starts_at_zero() {
        let meter = MemoryUsageMeter::new();
        assert_eq!(meter.get("acct-1", "2026-08").await.unwrap(), 0);
        assert_eq!(meter.increment("acct-1", "2026-08", 150).await.unwrap(), 150);
        assert_eq!(meter.get("acct-1", "2026-08").await.unwrap(), 150);
    }

    #[tokio::test]
    async fn test_periods_are_independent() {
        let meter = MemoryUsageMeter::new();
        meter.increment("acct-1", "2026-08", 100).await.unwrap();
        meter.increment("acct-1", "2026-09", 25).await.unwrap();
        assert_eq!(meter.get("acct-1", "2026-08").await.unwrap(), 100);
        assert_eq!(meter.get("acct-1", "2026-09").await.unwrap(), 25);
    }

    #[tokio::test]
    async fn test_accounts_are_independent() {
        let meter = MemoryUsageMeter::new();
        meter.increment("acct-1", "2026-08", 100).await.unwrap();
        assert_eq!(meter.get("acct-2", "2026-08").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_increments_do_not_lose_updates() {
        let meter = Arc::new(MemoryUsageMeter::new());

        let mut handles = Vec::new();
        for _ in 0..32 {
            let meter = Arc::clone(&meter);
            handles.push(tokio::spawn(async move {
                meter.increment("acct-1", "2026-08", 10).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(meter.get("acct-1", "2026-08").await.unwrap(), 320);
    }
}
