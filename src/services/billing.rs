//! Payment provider client and the billing gate.
//!
//! The gate sits in front of every metered chat request. Accounts inside
//! the free tier pass through without touching the provider; past the
//! free tier a request needs an active subscription on the metered price,
//! otherwise it is blocked with a checkout link.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::BillingError;
use crate::models::{
    current_period_key, Authorization, BillingConfig, CheckoutSession, Subscription,
    SubscriptionItem,
};
use crate::services::record_store::RecordStore;
use crate::services::usage::UsageMeter;

/// Payment provider operations the gate depends on.
#[async_trait]
pub trait BillingApi: Send + Sync {
    /// Create a customer tagged with the account id, returning the
    /// provider's customer id.
    async fn create_customer(&self, account_id: &str) -> Result<String, BillingError>;

    /// Active subscriptions for a customer.
    async fn list_subscriptions(
        &self,
        customer_id: &str,
    ) -> Result<Vec<Subscription>, BillingError>;

    /// Open a checkout session subscribing the customer to the metered price.
    async fn create_checkout_session(
        &self,
        customer_id: &str,
    ) -> Result<CheckoutSession, BillingError>;

    /// Report metered usage against a subscription item.
    async fn record_usage(&self, subscription_item: &str, quantity: u64)
        -> Result<(), BillingError>;
}

/// HTTP client for a Stripe-style billing API (form-encoded requests,
/// bearer-token auth).
pub struct HttpBillingClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    metered_price_id: String,
    checkout_success_url: String,
    checkout_cancel_url: String,
}

#[derive(Deserialize)]
struct ListResponse<T> {
    data: Vec<T>,
}

#[derive(Deserialize)]
struct ApiCustomer {
    id: String,
}

#[derive(Deserialize)]
struct ApiSubscription {
    id: String,
    created: i64,
    items: ListResponse<ApiSubscriptionItem>,
}

#[derive(Deserialize)]
struct ApiSubscriptionItem {
    id: String,
    price: ApiPrice,
}

#[derive(Deserialize)]
struct ApiPrice {
    id: String,
}

impl HttpBillingClient {
    pub fn new(config: &BillingConfig) -> Result<Self, BillingError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            metered_price_id: config.metered_price_id.clone(),
            checkout_success_url: config.checkout_success_url.clone(),
            checkout_cancel_url: config.checkout_cancel_url.clone(),
        })
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, BillingError> {
        let status = response.status().as_u16();
        if status >= 400 {
            let body = response.text().await.unwrap_or_default();
            return Err(BillingError::ProviderError { status, body });
        }
        Ok(response)
    }
}

#[async_trait]
impl BillingApi for HttpBillingClient {
    async fn create_customer(&self, account_id: &str) -> Result<String, BillingError> {
        let params = [("metadata[accountId]", account_id)];

        let response = self
            .client
            .post(format!("{}/customers", self.base_url))
            .bearer_auth(&self.api_key)
            .form(&params)
            .send()
            .await?;

        let customer: ApiCustomer = Self::check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| BillingError::InvalidResponse(e.to_string()))?;

        Ok(customer.id)
    }

    async fn list_subscriptions(
        &self,
        customer_id: &str,
    ) -> Result<Vec<Subscription>, BillingError> {
        let response = self
            .client
            .get(format!("{}/subscriptions", self.base_url))
            .bearer_auth(&self.api_key)
            .query(&[("customer", customer_id), ("status", "active")])
            .send()
            .await?;

        let list: ListResponse<ApiSubscription> = Self::check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| BillingError::InvalidResponse(e.to_string()))?;

        Ok(list
            .data
            .into_iter()
            .map(|s| Subscription {
                id: s.id,
                created: s.created,
                items: s
                    .items
                    .data
                    .into_iter()
                    .map(|i| SubscriptionItem {
                        id: i.id,
                        price_id: i.price.id,
                    })
                    .collect(),
            })
            .collect())
    }

    async fn create_checkout_session(
        &self,
        customer_id: &str,
    ) -> Result<CheckoutSession, BillingError> {
        let params = [
            ("customer", customer_id),
            ("mode", "subscription"),
            ("line_items[0][price]", self.metered_price_id.as_str()),
            ("success_url", self.checkout_success_url.as_str()),
            ("cancel_url", self.checkout_cancel_url.as_str()),
        ];

        let response = self
            .client
            .post(format!("{}/checkout/sessions", self.base_url))
            .bearer_auth(&self.api_key)
            .form(&params)
            .send()
            .await?;

        Self::check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| BillingError::InvalidResponse(e.to_string()))
    }

    async fn record_usage(
        &self,
        subscription_item: &str,
        quantity: u64,
    ) -> Result<(), BillingError> {
        let quantity = quantity.to_string();
        let params = [("quantity", quantity.as_str()), ("action", "increment")];

        let response = self
            .client
            .post(format!(
                "{}/subscription_items/{}/usage_records",
                self.base_url, subscription_item
            ))
            .bearer_auth(&self.api_key)
            .form(&params)
            .send()
            .await?;

        Self::check_status(response).await?;
        Ok(())
    }
}

/// Decides whether a metered request may proceed.
pub struct BillingGate {
    api: Arc<dyn BillingApi>,
    record_store: Arc<dyn RecordStore>,
    usage: Arc<dyn UsageMeter>,
    metered_price_id: String,
    free_tier_units: u64,
    // Serializes lazy customer creation per account.
    account_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl BillingGate {
    pub fn new(
        api: Arc<dyn BillingApi>,
        record_store: Arc<dyn RecordStore>,
        usage: Arc<dyn UsageMeter>,
        config: &BillingConfig,
    ) -> Self {
        Self {
            api,
            record_store,
            usage,
            metered_price_id: config.metered_price_id.clone(),
            free_tier_units: config.free_tier_units,
            account_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Decide whether the account may make a metered request right now.
    ///
    /// Inside the free tier the provider is never contacted. Past it, the
    /// account needs an active subscription carrying the metered price;
    /// otherwise a checkout session is opened and the request is blocked.
    pub async fn authorize(&self, account_id: &str) -> Result<Authorization, BillingError> {
        let used = self
            .usage
            .get(account_id, &current_period_key())
            .await
            .map_err(BillingError::RecordStore)?;

        if used < self.free_tier_units {
            debug!(account_id, used, "within free tier");
            return Ok(Authorization::Allowed { metered_item: None });
        }

        let customer_id = self.resolve_customer(account_id).await?;

        let subscriptions = self.api.list_subscriptions(&customer_id).await?;
        if let Some(item) = self.pick_metered_item(&subscriptions) {
            return Ok(Authorization::Allowed {
                metered_item: Some(item),
            });
        }

        info!(account_id, "no active subscription, opening checkout");
        let session = self.api.create_checkout_session(&customer_id).await?;
        Ok(Authorization::Blocked {
            checkout_url: session.url,
        })
    }

    /// Report usage against the account's metered subscription item. No-op
    /// when the request was covered by the free tier.
    pub async fn record_metered_usage(
        &self,
        metered_item: Option<&str>,
        tokens: u64,
    ) -> Result<(), BillingError> {
        let Some(item) = metered_item else {
            return Ok(());
        };
        if tokens == 0 {
            return Ok(());
        }
        self.api.record_usage(item, tokens).await
    }

    /// Customer id for the account, creating one lazily. Creation is
    /// serialized per account and the persisted mapping always wins, so an
    /// account maps to at most one customer even under concurrent requests.
    async fn resolve_customer(&self, account_id: &str) -> Result<String, BillingError> {
        if let Some(existing) = self
            .record_store
            .billing_customer(account_id)
            .await
            .map_err(BillingError::RecordStore)?
        {
            return Ok(existing);
        }

        let lock = {
            let mut locks = self.account_locks.lock().await;
            Arc::clone(
                locks
                    .entry(account_id.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        let _guard = lock.lock().await;

        // Another request may have finished creation while we waited.
        if let Some(existing) = self
            .record_store
            .billing_customer(account_id)
            .await
            .map_err(BillingError::RecordStore)?
        {
            return Ok(existing);
        }

        let created = self.api.create_customer(account_id).await?;
        let persisted = self
            .record_store
            .set_billing_customer_if_absent(account_id, &created)
            .await
            .map_err(BillingError::RecordStore)?;

        if persisted != created {
            warn!(account_id, orphan = %created, "lost customer creation race");
        }

        Ok(persisted)
    }

    /// The metered subscription item to bill against. When several active
    /// subscriptions carry the metered price, the most recently created wins;
    /// equal creation times fall back to lexicographic subscription id.
    fn pick_metered_item(&self, subscriptions: &[Subscription]) -> Option<String> {
        let mut matching: Vec<(&Subscription, &SubscriptionItem)> = subscriptions
            .iter()
            .filter_map(|s| {
                s.items
                    .iter()
                    .find(|i| i.price_id == self.metered_price_id)
                    .map(|i| (s, i))
            })
            .collect();

        matching.sort_by(|(a, _), (b, _)| {
            b.created.cmp(&a.created).then_with(|| a.id.cmp(&b.id))
        });

        matching.first().map(|(_, item)| item.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::record_store::MemoryRecordStore;
    use crate::services::usage::MemoryUsageMeter;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FakeBillingApi {
        customers_created: AtomicU64,
        subscriptions: Vec<Subscription>,
        usage_events: AtomicU64,
    }

    impl FakeBillingApi {
        fn new(subscriptions: Vec<Subscription>) -> Self {
            Self {
                customers_created: AtomicU64::new(0),
                subscriptions,
                usage_events: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl BillingApi for FakeBillingApi {
        async fn create_customer(&self, account_id: &str) -> Result<String, BillingError> {
            let n = self.customers_created.fetch_add(1, Ordering::SeqCst);
            Ok(format!("cus_{}_{}", account_id, n))
        }

        async fn list_subscriptions(
            &self,
            _customer_id: &str,
        ) -> Result<Vec<Subscription>, BillingError> {
            Ok(self.subscriptions.clone())
        }

        async fn create_checkout_session(
            &self,
            customer_id: &str,
        ) -> Result<CheckoutSession, BillingError> {
            Ok(CheckoutSession {
                id: "cs_test".to_string(),
                url: format!("https://checkout.test/{}", customer_id),
            })
        }

        async fn record_usage(
            &self,
            _subscription_item: &str,
            _quantity: u64,
        ) -> Result<(), BillingError> {
            self.usage_events.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config() -> BillingConfig {
        BillingConfig {
            free_tier_units: 100,
            metered_price_id: "price_metered".to_string(),
            ..BillingConfig::default()
        }
    }

    fn sub(id: &str, created: i64, price_id: &str, item_id: &str) -> Subscription {
        Subscription {
            id: id.to_string(),
            created,
            items: vec![SubscriptionItem {
                id: item_id.to_string(),
                price_id: price_id.to_string(),
            }],
        }
    }

    fn gate(api: Arc<FakeBillingApi>, usage: Arc<MemoryUsageMeter>) -> BillingGate {
        BillingGate::new(
            api,
            Arc::new(MemoryRecordStore::new()),
            usage,
            &config(),
        )
    }

    #[tokio::test]
    async fn test_free_tier_allows_without_provider_calls() {
        let api = Arc::new(FakeBillingApi::new(vec![]));
        let usage = Arc::new(MemoryUsageMeter::new());
        usage
            .increment("acct-1", &current_period_key(), 99)
            .await
            .unwrap();

        let gate = gate(Arc::clone(&api), usage);
        let auth = gate.authorize("acct-1").await.unwrap();

        assert_eq!(auth, Authorization::Allowed { metered_item: None });
        assert_eq!(api.customers_created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_at_free_tier_boundary_requires_subscription() {
        let api = Arc::new(FakeBillingApi::new(vec![]));
        let usage = Arc::new(MemoryUsageMeter::new());
        usage
            .increment("acct-1", &current_period_key(), 100)
            .await
            .unwrap();

        let gate = gate(Arc::clone(&api), usage);
        let auth = gate.authorize("acct-1").await.unwrap();

        match auth {
            Authorization::Blocked { checkout_url } => {
                assert!(checkout_url.starts_with("https://checkout.test/"));
            }
            other => panic!("expected Blocked, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_subscribed_account_allowed_past_free_tier() {
        let api = Arc::new(FakeBillingApi::new(vec![sub(
            "sub_1",
            1_700_000_000,
            "price_metered",
            "si_1",
        )]));
        let usage = Arc::new(MemoryUsageMeter::new());
        usage
            .increment("acct-1", &current_period_key(), 5_000)
            .await
            .unwrap();

        let gate = gate(api, usage);
        let auth = gate.authorize("acct-1").await.unwrap();

        assert_eq!(
            auth,
            Authorization::Allowed {
                metered_item: Some("si_1".to_string())
            }
        );
    }

    #[tokio::test]
    async fn test_subscription_tie_break_is_deterministic() {
        let api = Arc::new(FakeBillingApi::new(vec![
            sub("sub_old", 100, "price_metered", "si_old"),
            sub("sub_new_b", 200, "price_metered", "si_new_b"),
            sub("sub_new_a", 200, "price_metered", "si_new_a"),
            sub("sub_other", 300, "price_other", "si_other"),
        ]));
        let usage = Arc::new(MemoryUsageMeter::new());
        usage
            .increment("acct-1", &current_period_key(), 200)
            .await
            .unwrap();

        let gate = gate(api, usage);
        let auth = gate.authorize("acct-1").await.unwrap();

        // Newest creation time wins; ties break on subscription id.
        assert_eq!(
            auth,
            Authorization::Allowed {
                metered_item: Some("si_new_a".to_string())
            }
        );
    }

    #[tokio::test]
    async fn test_concurrent_authorize_creates_one_customer() {
        let api = Arc::new(FakeBillingApi::new(vec![]));
        let usage = Arc::new(MemoryUsageMeter::new());
        usage
            .increment("acct-1", &current_period_key(), 500)
            .await
            .unwrap();

        let gate = Arc::new(gate(Arc::clone(&api), usage));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let gate = Arc::clone(&gate);
            handles.push(tokio::spawn(
                async move { gate.authorize("acct-1").await },
            ));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(api.customers_created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_record_metered_usage_skips_free_tier() {
        let api = Arc::new(FakeBillingApi::new(vec![]));
        let usage = Arc::new(MemoryUsageMeter::new());
        let gate = gate(Arc::clone(&api), usage);

        gate.record_metered_usage(None, 1_000).await.unwrap();
        assert_eq!(api.usage_events.load(Ordering::SeqCst), 0);

        gate.record_metered_usage(Some("si_1"), 1_000).await.unwrap();
        assert_eq!(api.usage_events.load(Ordering::SeqCst), 1);

        gate.record_metered_usage(Some("si_1"), 0).await.unwrap();
        assert_eq!(api.usage_events.load(Ordering::SeqCst), 1);
    }
}
