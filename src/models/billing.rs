//! Billing and usage accounting models.

use serde::{Deserialize, Serialize};

/// Billing-period key partitioning usage counters (calendar month, UTC).
pub fn period_key(at: chrono::DateTime<chrono::Utc>) -> String {
    at.format("%Y-%m").to_string()
}

/// Current billing period key.
pub fn current_period_key() -> String {
    period_key(chrono::Utc::now())
}

/// A subscription as returned by the payment provider, reduced to the fields
/// the gate inspects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    /// Creation time, epoch seconds. Used as the deterministic tie-break when
    /// several subscriptions match the metered price.
    pub created: i64,
    pub items: Vec<SubscriptionItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionItem {
    pub id: String,
    pub price_id: String,
}

/// A checkout session opened for a blocked account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub url: String,
}

/// Gate decision for one metered request.
#[derive(Debug, Clone, PartialEq)]
pub enum Authorization {
    Allowed {
        /// Present when the account holds an active metered subscription;
        /// consumed by the trailing metered-usage report.
        metered_item: Option<String>,
    },
    Blocked {
        checkout_url: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_period_key_format() {
        let at = chrono::Utc.with_ymd_and_hms(2025, 3, 31, 23, 59, 59).unwrap();
        assert_eq!(period_key(at), "2025-03");
    }

    #[test]
    fn test_period_key_rollover() {
        let march = chrono::Utc.with_ymd_and_hms(2025, 3, 31, 23, 59, 59).unwrap();
        let april = chrono::Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap();
        assert_ne!(period_key(march), period_key(april));
    }
}
