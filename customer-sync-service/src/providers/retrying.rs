use super::{
    BillingProvider, Invoice, Page, PageParams, PaymentMethod, ProviderCustomer, ProviderError,
    ProviderSubscription,
};
use async_trait::async_trait;
use service_core::retry::{retry_with_backoff, RetryConfig};

/// Wraps any provider with the configured retry policy.
///
/// Every call is a read, so repeating one after a transient failure is safe.
pub struct RetryingProvider<P> {
    inner: P,
    config: RetryConfig,
}

impl<P> RetryingProvider<P> {
    pub fn new(inner: P, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

#[async_trait]
impl<P: BillingProvider> BillingProvider for RetryingProvider<P> {
    async fn list_customers(
        &self,
        params: &PageParams,
    ) -> Result<Page<ProviderCustomer>, ProviderError> {
        retry_with_backoff(&self.config, "list_customers", || {
            self.inner.list_customers(params)
        })
        .await
    }

    async fn get_customer(&self, customer_id: &str) -> Result<ProviderCustomer, ProviderError> {
        retry_with_backoff(&self.config, "get_customer", || {
            self.inner.get_customer(customer_id)
        })
        .await
    }

    async fn list_subscriptions(
        &self,
        customer_id: &str,
    ) -> Result<Vec<ProviderSubscription>, ProviderError> {
        retry_with_backoff(&self.config, "list_subscriptions", || {
            self.inner.list_subscriptions(customer_id)
        })
        .await
    }

    async fn list_payment_methods(
        &self,
        customer_id: &str,
    ) -> Result<Vec<PaymentMethod>, ProviderError> {
        retry_with_backoff(&self.config, "list_payment_methods", || {
            self.inner.list_payment_methods(customer_id)
        })
        .await
    }

    async fn list_invoices(
        &self,
        customer_id: &str,
        params: &PageParams,
    ) -> Result<Page<Invoice>, ProviderError> {
        retry_with_backoff(&self.config, "list_invoices", || {
            self.inner.list_invoices(customer_id, params)
        })
        .await
    }
}
